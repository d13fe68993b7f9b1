//! Conversions between filesystem-relative artifact paths and the references
//! handed to browsers and workers.
//!
//! Every function here is total: empty input yields `None`, anything else is
//! converted best-effort without failing.

use chrono::Utc;
use url::form_urlencoded;

/// Route the asset resolver is mounted on.
pub const ASSET_ROUTE: &str = "/api/assets";

/// Top-level directories a raw relative reference may start with.
pub const RAW_REFERENCE_DIRS: [&str; 4] = ["renders", "output", "public", "temp"];

/// The shapes an artifact reference arrives in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArtifactReference {
    /// `http(s)://...`, passed through untouched.
    Absolute(String),
    /// `/api/assets?path=...`
    Client(String),
    /// Relative path under one of [`RAW_REFERENCE_DIRS`].
    Raw(String),
    /// Anything else; forwarded as given.
    Opaque(String),
}

impl ArtifactReference {
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        if is_absolute_url(raw) {
            return Some(Self::Absolute(raw.to_string()));
        }
        if is_client_reference(raw) {
            return Some(Self::Client(raw.to_string()));
        }

        let relative = normalize_relative(raw);
        let first = relative.split('/').next().unwrap_or_default();
        if RAW_REFERENCE_DIRS.contains(&first) {
            Some(Self::Raw(relative))
        } else {
            Some(Self::Opaque(raw.to_string()))
        }
    }

    /// Value to hand a worker as `--reference`: local references become
    /// fully-qualified URLs against `origin`. Staged files are not served by
    /// the asset route, so references under [`STAGING_PREFIX`] stay
    /// project-relative paths the worker opens from its working directory.
    pub fn to_worker_input(&self, origin: &str) -> String {
        match self {
            Self::Absolute(url) | Self::Opaque(url) => url.clone(),
            Self::Client(reference) => match decode_reference(reference) {
                Some(path) if is_staged(&path) => path,
                _ => to_absolute_url(reference, origin).unwrap_or_else(|| reference.clone()),
            },
            Self::Raw(path) if is_staged(path) => path.clone(),
            Self::Raw(path) => to_client_reference(path)
                .and_then(|reference| to_absolute_url(&reference, origin))
                .unwrap_or_else(|| path.clone()),
        }
    }
}

/// First segment of worker input files staged on disk.
pub const STAGING_PREFIX: &str = "temp";

fn is_staged(relative: &str) -> bool {
    relative.split('/').next() == Some(STAGING_PREFIX)
}

pub fn is_absolute_url(value: &str) -> bool {
    let lower = value.get(..8).unwrap_or(value).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn is_client_reference(value: &str) -> bool {
    value
        .strip_prefix(ASSET_ROUTE)
        .is_some_and(|rest| rest.starts_with('?'))
}

/// Backslashes to slashes, drive letter and leading slashes removed.
pub fn normalize_relative(raw: &str) -> String {
    let slashed = raw.replace('\\', "/");
    let bytes = slashed.as_bytes();
    let without_drive = if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
    {
        &slashed[2..]
    } else {
        slashed.as_str()
    };
    without_drive.trim_start_matches('/').to_string()
}

/// Turns a worker-relative path into `/api/assets?path=<encoded>`.
/// Absolute URLs and existing client references come back unchanged.
pub fn to_client_reference(raw_path: &str) -> Option<String> {
    let raw = raw_path.trim();
    if raw.is_empty() {
        return None;
    }
    if is_absolute_url(raw) || is_client_reference(raw) {
        return Some(raw.to_string());
    }

    let relative = normalize_relative(raw);
    let encoded: String = form_urlencoded::byte_serialize(relative.as_bytes()).collect();
    Some(format!("{ASSET_ROUTE}?path={encoded}"))
}

/// Recovers the relative path carried by a client reference.
pub fn decode_reference(reference: &str) -> Option<String> {
    let (_, query) = reference.split_once('?')?;
    let query = query.split('#').next().unwrap_or_default();
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "path")
        .map(|(_, value)| normalize_relative(&value))
        .filter(|path| !path.is_empty())
}

/// Prefixes a relative reference with `origin` (scheme + host), joined by
/// exactly one slash.
pub fn to_absolute_url(reference: &str, origin: &str) -> Option<String> {
    let reference = reference.trim();
    if reference.is_empty() {
        return None;
    }
    if is_absolute_url(reference) {
        return Some(reference.to_string());
    }
    Some(format!(
        "{}/{}",
        origin.trim().trim_end_matches('/'),
        reference.trim_start_matches('/')
    ))
}

/// Appends `t=<millis>` so a regenerated file under a reused name is
/// fetched again. Existing query parameters and fragments are kept.
pub fn with_cache_buster(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let (base, fragment) = match url.split_once('#') {
        Some((base, fragment)) => (base, Some(fragment)),
        None => (url, None),
    };
    let separator = if base.contains('?') { '&' } else { '?' };
    let mut busted = format!("{base}{separator}t={}", Utc::now().timestamp_millis());
    if let Some(fragment) = fragment {
        busted.push('#');
        busted.push_str(fragment);
    }
    Some(busted)
}
