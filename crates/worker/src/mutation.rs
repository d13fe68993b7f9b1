use std::fs;
use std::path::{Path, PathBuf};

use lookbook_core::{CapturedOutput, Design, JobError, JobResult};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use crate::interpreter::Interpreter;
use crate::invoker::{WorkerCommand, WorkerInvoker};
use crate::staging::Staging;

static WROTE_MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?m)^[^\S\n]*Wrote:[^\S\n]*(\S[^\n]*?)[^\S\n]*$").ok());

/// Where the rewritten design came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationSource {
    File(PathBuf),
    Stdout,
}

#[derive(Debug, Clone)]
pub struct MutationOutcome {
    pub design: Design,
    pub source: MutationSource,
}

/// Applies a free-text change to a design through an external worker.
///
/// The worker receives two paths (design JSON, change text) and either prints
/// `Wrote: <path>` for a rewritten design file or prints the design itself.
#[derive(Debug, Clone)]
pub struct DesignMutator {
    root: PathBuf,
    script: PathBuf,
    interpreter: Interpreter,
    invoker: WorkerInvoker,
    staging: Staging,
    search_dirs: Vec<PathBuf>,
}

impl DesignMutator {
    pub fn new(
        root: PathBuf,
        script: PathBuf,
        interpreter: Interpreter,
        invoker: WorkerInvoker,
        staging: Staging,
    ) -> Self {
        let search_dirs = vec![
            root.clone(),
            root.join("scripts"),
            staging.dir().to_path_buf(),
            root.join("output"),
        ];
        Self {
            root,
            script,
            interpreter,
            invoker,
            staging,
            search_dirs,
        }
    }

    /// Overrides the relative base directories tried for `Wrote:` paths.
    pub fn with_search_dirs(mut self, dirs: Vec<PathBuf>) -> Self {
        self.search_dirs = dirs;
        self
    }

    pub async fn apply_change(
        &self,
        design: &Design,
        change_text: &str,
        env: &[(String, String)],
    ) -> JobResult<MutationOutcome> {
        let stem = design.design_id().unwrap_or_else(|| "design".to_string());
        let design_path = self.staging.write_design(design, &stem).await?;
        let change_path = self
            .staging
            .write_text(&format!("{stem}_change"), change_text)
            .await?;

        let mut command = WorkerCommand::new(self.interpreter.program(&self.root))
            .path_arg(&self.script)
            .path_arg(&design_path)
            .path_arg(&change_path);
        for (key, value) in env {
            command = command.env(key.clone(), value.clone());
        }

        let invocation = self.invoker.invoke(&command).await?.require_success()?;

        // Candidate lookup touches the filesystem.
        let mutator = self.clone();
        let output = invocation.output.clone();
        tokio::task::spawn_blocking(move || mutator.read_outcome(&output))
            .await
            .map_err(|err| JobError::Mutation {
                reason: format!("reading the worker result was interrupted: {err}"),
                candidates: Vec::new(),
                output: invocation.output,
            })?
    }

    /// Interprets the output of a successful mutation worker.
    pub fn read_outcome(&self, output: &CapturedOutput) -> JobResult<MutationOutcome> {
        let written = WROTE_MARKER
            .as_ref()
            .and_then(|re| re.captures(&output.stdout))
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim_matches(|c| c == '"' || c == '\'').to_string());

        match written {
            Some(written) => self.load_written(&written, output),
            None => parse_stdout_design(output),
        }
    }

    fn candidates(&self, written: &str) -> Vec<PathBuf> {
        let path = Path::new(written);
        if path.is_absolute() {
            return vec![path.to_path_buf()];
        }
        self.search_dirs.iter().map(|base| base.join(path)).collect()
    }

    fn load_written(&self, written: &str, output: &CapturedOutput) -> JobResult<MutationOutcome> {
        let candidates = self.candidates(written);
        let display: Vec<String> = candidates.iter().map(|c| self.display(c)).collect();

        let Some(found) = candidates.iter().find(|candidate| candidate.is_file()) else {
            return Err(JobError::Mutation {
                reason: format!("worker wrote {written} but no candidate file exists"),
                candidates: display,
                output: output.clone(),
            });
        };

        debug!(path = %self.display(found), "reading rewritten design");
        let parsed = fs::read_to_string(found)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .and_then(Design::from_value);

        match parsed {
            Some(design) => {
                info!(path = %self.display(found), "design rewritten by worker");
                Ok(MutationOutcome {
                    design,
                    source: MutationSource::File(found.clone()),
                })
            }
            None => Err(JobError::Mutation {
                reason: format!("{} is not a JSON design document", self.display(found)),
                candidates: display,
                output: output.clone(),
            }),
        }
    }

    /// Root-relative form for responses and logs.
    fn display(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

fn parse_stdout_design(output: &CapturedOutput) -> JobResult<MutationOutcome> {
    serde_json::from_str(output.stdout.trim())
        .ok()
        .and_then(Design::from_value)
        .map(|design| MutationOutcome {
            design,
            source: MutationSource::Stdout,
        })
        .ok_or_else(|| JobError::Mutation {
            reason: "worker printed neither a Wrote: marker nor a JSON design".to_string(),
            candidates: Vec::new(),
            output: output.clone(),
        })
}
