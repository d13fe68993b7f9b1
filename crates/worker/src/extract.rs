//! Finds the artifact a worker reports having saved.
//!
//! Workers announce results with free-form log lines, so matching goes down a
//! ladder: the job's own phrasing, a plain `Saved: <path>`, any
//! `Saved ...: <path>`, and finally the conventional output filename if it
//! exists on disk. Text after the extension (`(123456 bytes)`) is ignored.

use std::fs;
use std::path::{Path, PathBuf};

use lookbook_core::{CapturedOutput, JobError, JobKind, JobResult, MediaKind};
use once_cell::sync::Lazy;
use path_clean::PathClean;
use regex::Regex;
use tracing::{debug, info, warn};

const IMAGE_EXT: &str = r"png|jpe?g|webp";
const VIDEO_EXT: &str = r"mp4|webm|mov";

fn anchored(prefix: &str, ext: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"(?im)^[^\S\n]*{prefix}:[^\S\n]*(\S[^\n]*?\.(?:{ext}))\b"
    ))
    .ok()
}

fn loose(ext: &str) -> Option<Regex> {
    Regex::new(&format!(
        r"(?im)Saved[^:\n]*:[^\S\n]*(\S[^\n]*?\.(?:{ext}))\b"
    ))
    .ok()
}

static FLATLAY_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        anchored("Saved flatlay(?: render)?", IMAGE_EXT),
        anchored("Saved", IMAGE_EXT),
        loose(IMAGE_EXT),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static SHOWCASE_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        anchored("Saved showcase image", IMAGE_EXT),
        anchored("Saved", IMAGE_EXT),
        loose(IMAGE_EXT),
    ]
    .into_iter()
    .flatten()
    .collect()
});

static RUNWAY_MARKERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        anchored("Saved video", VIDEO_EXT),
        anchored("Saved", VIDEO_EXT),
        loose(VIDEO_EXT),
    ]
    .into_iter()
    .flatten()
    .collect()
});

fn markers(kind: JobKind) -> &'static [Regex] {
    match kind {
        JobKind::Flatlay => &FLATLAY_MARKERS,
        JobKind::Showcase => &SHOWCASE_MARKERS,
        JobKind::Runway => &RUNWAY_MARKERS,
        JobKind::ApplyChange => &[],
    }
}

/// Output directory workers are pointed at unless configured otherwise.
pub const DEFAULT_OUT_DIR: &str = "output";

/// Conventional locations a worker writes to when it says nothing useful.
pub fn conventional_candidates(kind: JobKind, design_id: &str, out_dir: &str) -> Vec<String> {
    let Some(media) = kind.media() else {
        return Vec::new();
    };
    let out_dir = out_dir.trim().trim_end_matches('/');
    let out_dir = if out_dir.is_empty() { DEFAULT_OUT_DIR } else { out_dir };
    let mut candidates = vec![format!(
        "{out_dir}/{design_id}_{}.{}",
        kind.as_str(),
        media.default_extension()
    )];
    if kind == JobKind::Flatlay {
        candidates.push(format!("renders/{design_id}__flatlay.png"));
    }
    candidates
}

#[derive(Debug, Clone)]
pub struct ArtifactExtractor {
    root: PathBuf,
    out_dir: String,
}

impl ArtifactExtractor {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        let root = fs::canonicalize(&root).unwrap_or(root);
        Self {
            root,
            out_dir: DEFAULT_OUT_DIR.to_string(),
        }
    }

    /// Directory (relative to the root) the conventional fallback looks in.
    pub fn with_out_dir<S: Into<String>>(mut self, out_dir: S) -> Self {
        self.out_dir = out_dir.into();
        self
    }

    /// Relative path of the produced artifact, or `ArtifactNotFound` carrying
    /// the whole captured output.
    pub fn extract(
        &self,
        output: &CapturedOutput,
        kind: JobKind,
        design_id: &str,
    ) -> JobResult<String> {
        let combined = output.combined();
        if let Some(found) = self.find_marker(&combined, kind) {
            debug!(%kind, design_id, artifact = %found, "artifact marker matched");
            return Ok(found);
        }

        if let Some(fallback) = conventional_candidates(kind, design_id, &self.out_dir)
            .into_iter()
            .find(|candidate| self.root.join(candidate).is_file())
        {
            info!(%kind, design_id, artifact = %fallback, "no saved marker, using conventional file");
            return Ok(fallback);
        }

        warn!(
            %kind,
            design_id,
            stdout_len = output.stdout.len(),
            stderr_len = output.stderr.len(),
            "worker output names no artifact"
        );
        Err(JobError::ArtifactNotFound {
            kind,
            output: output.clone(),
        })
    }

    /// First marker match in `text`, made relative to the project root.
    pub fn find_marker(&self, text: &str, kind: JobKind) -> Option<String> {
        markers(kind)
            .iter()
            .find_map(|re| re.captures(text))
            .and_then(|caps| caps.get(1))
            .map(|m| self.relativize(m.as_str()))
            .filter(|path| !path.is_empty())
    }

    fn relativize(&self, found: &str) -> String {
        let cleaned = found
            .trim()
            .trim_matches(|c| c == '"' || c == '\'')
            .replace('\\', "/");
        let path = Path::new(&cleaned).clean();

        if path.is_absolute() {
            if let Some(relative) = self.strip_root(&path) {
                return relative;
            }
            warn!(artifact = %cleaned, "worker reported a path outside the project root");
            return cleaned;
        }

        path.to_string_lossy().replace('\\', "/")
    }

    fn strip_root(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).map(Path::to_path_buf).or_else(|_| {
            fs::canonicalize(path)
                .map_err(|_| ())
                .and_then(|canonical| {
                    canonical
                        .strip_prefix(&self.root)
                        .map(Path::to_path_buf)
                        .map_err(|_| ())
                })
        });
        relative
            .ok()
            .map(|rel| rel.to_string_lossy().replace('\\', "/"))
    }
}
