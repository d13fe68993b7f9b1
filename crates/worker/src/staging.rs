use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::Utc;
use lookbook_core::{Design, JobError, JobResult};
use tracing::{debug, warn};

/// Scratch directory for files handed to workers by path.
#[derive(Debug, Clone)]
pub struct Staging {
    dir: PathBuf,
}

impl Staging {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes the design as pretty JSON under a collision-resistant name.
    pub async fn write_design(&self, design: &Design, stem: &str) -> JobResult<PathBuf> {
        let path = self.unique_path(stem, "design.json");
        let json = design.to_pretty_json().map_err(|err| JobError::Staging {
            path: path.clone(),
            source: io::Error::new(io::ErrorKind::InvalidData, err),
        })?;
        self.write(&path, json.as_bytes()).await?;
        Ok(path)
    }

    pub async fn write_text(&self, stem: &str, text: &str) -> JobResult<PathBuf> {
        let path = self.unique_path(stem, "txt");
        self.write(&path, text.as_bytes()).await?;
        Ok(path)
    }

    /// Deletes staged files last modified more than `max_age` ago.
    pub fn prune_older_than(&self, max_age: Duration) -> io::Result<usize> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let expired = meta
                .modified()
                .ok()
                .and_then(|mtime| now.duration_since(mtime).ok())
                .is_some_and(|age| age > max_age);
            if !expired {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => removed += 1,
                Err(err) => warn!(file = ?entry.file_name(), "failed to prune staged file: {err}"),
            }
        }
        Ok(removed)
    }

    fn unique_path(&self, stem: &str, extension: &str) -> PathBuf {
        let nanos = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or_else(|| Utc::now().timestamp_micros() * 1000);
        self.dir
            .join(format!("{}_{nanos}.{extension}", sanitize_stem(stem)))
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> JobResult<()> {
        let staged = match tokio::fs::create_dir_all(&self.dir).await {
            Ok(()) => tokio::fs::write(path, bytes).await,
            Err(err) => Err(err),
        };
        staged.map_err(|source| JobError::Staging {
            path: path.to_path_buf(),
            source,
        })?;
        debug!(path = %path.display(), bytes = bytes.len(), "staged worker input");
        Ok(())
    }
}

/// Keeps staged names inside the staging directory whatever the design id is.
fn sanitize_stem(stem: &str) -> String {
    let cleaned: String = stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .take(64)
        .collect();
    if cleaned.trim_matches('_').is_empty() {
        "design".to_string()
    } else {
        cleaned
    }
}
