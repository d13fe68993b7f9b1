use std::env;
use std::path::{Path, PathBuf};

/// Environment variable naming the worker interpreter; it supersedes
/// virtualenv detection.
pub const INTERPRETER_ENV: &str = "PYTHON_PATH";

#[cfg(windows)]
const VENV_CANDIDATES: [&str; 2] = [".venv/Scripts/python.exe", "venv/Scripts/python.exe"];
#[cfg(not(windows))]
const VENV_CANDIDATES: [&str; 2] = [".venv/bin/python", "venv/bin/python"];

#[cfg(windows)]
const DEFAULT_COMMAND: &str = "python";
#[cfg(not(windows))]
const DEFAULT_COMMAND: &str = "python3";

/// How the worker interpreter is chosen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Interpreter {
    /// Fixed by configuration.
    Explicit(PathBuf),
    /// Detected again for every job.
    #[default]
    Detect,
}

impl Interpreter {
    pub fn program(&self, root: &Path) -> PathBuf {
        match self {
            Interpreter::Explicit(path) => path.clone(),
            Interpreter::Detect => select_interpreter(root),
        }
    }
}

/// `PYTHON_PATH`, then the project virtualenv, then the platform default
/// command.
pub fn select_interpreter(root: &Path) -> PathBuf {
    select_interpreter_with(root, |key| env::var(key).ok())
}

pub fn select_interpreter_with<F>(root: &Path, lookup: F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(explicit) = lookup(INTERPRETER_ENV).filter(|value| !value.trim().is_empty()) {
        return PathBuf::from(explicit.trim());
    }

    if let Some(venv) = VENV_CANDIDATES
        .iter()
        .map(|candidate| root.join(candidate))
        .find(|candidate| candidate.is_file())
    {
        return venv;
    }

    PathBuf::from(DEFAULT_COMMAND)
}
