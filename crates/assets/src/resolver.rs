use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::content_type::content_type_for;
use crate::normalize::normalize_relative;
use url::form_urlencoded;

/// Directories served when no explicit allow-list is configured.
pub const DEFAULT_ALLOWED_DIRS: [&str; 3] = ["renders", "output", "public"];

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("bad asset request: {0}")]
    BadRequest(&'static str),

    #[error("asset directory not allowed")]
    Forbidden,

    #[error("asset not found")]
    NotFound,

    #[error("failed to read asset: {0}")]
    Io(#[from] io::Error),
}

impl AssetError {
    pub fn http_status(&self) -> u16 {
        match self {
            AssetError::BadRequest(_) => 400,
            AssetError::Forbidden => 403,
            AssetError::NotFound => 404,
            AssetError::Io(_) => 500,
        }
    }
}

/// A validated file inside the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAsset {
    pub path: PathBuf,
    pub relative: String,
    pub content_type: &'static str,
}

#[derive(Debug, Clone)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
    pub relative: String,
}

/// Maps `path` query values to files, refusing anything outside the
/// allow-listed top-level directories of the project root.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    root: PathBuf,
    allowed_dirs: Vec<String>,
}

impl AssetResolver {
    pub fn new<P: AsRef<Path>>(root: P) -> io::Result<Self> {
        let root = fs::canonicalize(root.as_ref())?;
        Ok(Self {
            root,
            allowed_dirs: DEFAULT_ALLOWED_DIRS.iter().map(|d| d.to_string()).collect(),
        })
    }

    pub fn with_allowed_dirs<I, S>(mut self, dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_dirs = dirs
            .into_iter()
            .map(Into::into)
            .map(|dir| dir.trim_matches('/').to_string())
            .filter(|dir| !dir.is_empty())
            .collect();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn allowed_dirs(&self) -> &[String] {
        &self.allowed_dirs
    }

    /// Resolves a full client reference (`/api/assets?path=...`).
    pub fn resolve_reference(&self, reference: &str) -> Result<ResolvedAsset, AssetError> {
        let path = reference.split_once('?').and_then(|(_, query)| {
            form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "path")
                .map(|(_, value)| value.into_owned())
        });
        self.resolve(path.as_deref())
    }

    /// Validates an already-decoded `path` query value.
    pub fn resolve(&self, path_param: Option<&str>) -> Result<ResolvedAsset, AssetError> {
        let raw = path_param
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(AssetError::BadRequest("missing path parameter"))?;

        let relative = normalize_relative(raw);
        if relative.is_empty() {
            return Err(AssetError::BadRequest("missing path parameter"));
        }
        if relative.contains('\0') {
            warn!(requested = %relative.escape_default(), "asset path rejected: null byte");
            return Err(AssetError::BadRequest("invalid path"));
        }
        if relative.split('/').any(|segment| segment == "..") {
            warn!(requested = %relative, "asset path rejected: parent traversal");
            return Err(AssetError::BadRequest("invalid path"));
        }

        let first = relative.split('/').next().unwrap_or_default();
        if !self.allowed_dirs.iter().any(|dir| dir == first) {
            warn!(requested = %relative, "asset path rejected: directory not allowed");
            return Err(AssetError::Forbidden);
        }

        let canonical = match fs::canonicalize(self.root.join(&relative)) {
            Ok(path) => path,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Err(AssetError::NotFound),
            Err(err) => return Err(AssetError::Io(err)),
        };

        if !canonical.starts_with(&self.root) {
            warn!(requested = %relative, "asset path rejected: escapes project root");
            return Err(AssetError::BadRequest("invalid path"));
        }
        if !canonical.is_file() {
            return Err(AssetError::NotFound);
        }

        debug!(requested = %relative, "asset resolved");
        Ok(ResolvedAsset {
            content_type: content_type_for(&canonical),
            path: canonical,
            relative,
        })
    }

    /// Resolves and reads the whole file. Canonicalization runs on the
    /// blocking pool.
    pub async fn load(&self, path_param: Option<&str>) -> Result<Asset, AssetError> {
        let resolver = self.clone();
        let path_param = path_param.map(str::to_string);
        let resolved = tokio::task::spawn_blocking(move || resolver.resolve(path_param.as_deref()))
            .await
            .map_err(|err| AssetError::Io(io::Error::new(io::ErrorKind::Other, err)))??;
        let bytes = tokio::fs::read(&resolved.path).await?;
        Ok(Asset {
            bytes,
            content_type: resolved.content_type,
            relative: resolved.relative,
        })
    }
}
