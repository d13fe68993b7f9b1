use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::job::JobKind;
use crate::output::CapturedOutput;

pub type JobResult<T> = Result<T, JobError>;

/// Failures a job can end in. Spawn failures (the job never ran) are kept
/// apart from exit failures (it ran and failed).
#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error("failed to stage {}: {source}", path.display())]
    Staging {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("worker {program} exited with {}", describe_exit(output.exit_code))]
    WorkerExit {
        program: String,
        output: CapturedOutput,
    },

    #[error("worker {program} timed out after {timeout_secs}s")]
    WorkerTimeout {
        program: String,
        timeout_secs: u64,
        output: CapturedOutput,
    },

    #[error("worker finished but no {kind} artifact was found")]
    ArtifactNotFound {
        kind: JobKind,
        output: CapturedOutput,
    },

    #[error("design change failed: {reason}")]
    Mutation {
        reason: String,
        candidates: Vec<String>,
        output: CapturedOutput,
    },

    #[error("path rejected: {0}")]
    PathSecurity(String),
}

impl JobError {
    pub fn code(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "E_VALIDATION",
            JobError::Staging { .. } => "E_STAGING",
            JobError::Spawn { .. } => "E_SPAWN",
            JobError::WorkerExit { .. } => "E_WORKER_EXIT",
            JobError::WorkerTimeout { .. } => "E_WORKER_TIMEOUT",
            JobError::ArtifactNotFound { .. } => "E_ARTIFACT_NOT_FOUND",
            JobError::Mutation { .. } => "E_MUTATION",
            JobError::PathSecurity(_) => "E_PATH_SECURITY",
        }
    }

    /// 400 for caller mistakes, 500 for everything the worker side caused.
    pub fn http_status(&self) -> u16 {
        match self {
            JobError::Validation(_) | JobError::PathSecurity(_) => 400,
            _ => 500,
        }
    }

    /// Captured worker output, when the worker got far enough to produce any.
    pub fn output(&self) -> Option<&CapturedOutput> {
        match self {
            JobError::WorkerExit { output, .. }
            | JobError::WorkerTimeout { output, .. }
            | JobError::ArtifactNotFound { output, .. }
            | JobError::Mutation { output, .. } => Some(output),
            _ => None,
        }
    }

    pub fn candidates(&self) -> Option<&[String]> {
        match self {
            JobError::Mutation { candidates, .. } if !candidates.is_empty() => Some(candidates),
            _ => None,
        }
    }
}

fn describe_exit(code: Option<i32>) -> String {
    code.map(|code| format!("exit code {code}"))
        .unwrap_or_else(|| "no exit code".to_string())
}
