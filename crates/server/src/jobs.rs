//! Composition of staging, worker runs, extraction and normalization for
//! each job kind. Requests are stateless: the caller always sends the whole
//! design.

use std::path::{Path, PathBuf};

use lookbook_assets::{
    decode_reference, to_client_reference, with_cache_buster, ArtifactReference,
};
use lookbook_core::{ChangeJob, JobError, JobKind, JobResult, RenderJob};
use lookbook_worker::{
    ArtifactExtractor, DesignMutator, MutationOutcome, Staging, WorkerCommand, WorkerInvoker,
};
use tracing::info;

use crate::config::{ServerConfig, WorkerSettings};

/// Length of the clips the runway worker generates.
pub const RUNWAY_DURATION_SECS: u64 = 6;

/// A produced artifact, ready to hand to the browser.
#[derive(Debug, Clone)]
pub struct RenderOutcome {
    pub kind: JobKind,
    /// Project-relative path as reported by the worker.
    pub artifact_path: String,
    /// Client reference with a cache-busting parameter.
    pub url: String,
    pub duration_ms: u64,
}

pub struct JobService {
    root: PathBuf,
    settings: WorkerSettings,
    invoker: WorkerInvoker,
    extractor: ArtifactExtractor,
    staging: Staging,
    mutator: DesignMutator,
}

impl JobService {
    pub fn new(config: &ServerConfig) -> Self {
        let root = config.root.clone();
        let settings = config.worker.clone();
        let invoker = WorkerInvoker::new(root.clone()).with_timeout(settings.timeout);
        let staging = Staging::new(config.staging_dir.clone());
        let mutator = DesignMutator::new(
            root.clone(),
            settings.apply_change_script.clone(),
            settings.interpreter.clone(),
            invoker.clone(),
            staging.clone(),
        )
        .with_search_dirs(vec![
            root.clone(),
            root.join(&settings.scripts_dir),
            config.staging_dir.clone(),
            root.join(&settings.out_dir),
        ]);

        Self {
            extractor: ArtifactExtractor::new(root.clone()).with_out_dir(settings.out_dir.clone()),
            root,
            settings,
            invoker,
            staging,
            mutator,
        }
    }

    /// Runs a flatlay, showcase or runway job. `origin` is the scheme+host
    /// local references are qualified with before reaching the worker.
    pub async fn render(&self, job: &RenderJob, origin: &str) -> JobResult<RenderOutcome> {
        if let Some(reference) = job.reference.as_deref().and_then(ArtifactReference::parse) {
            ensure_local_reference(&reference)?;
        }
        let design_path = self
            .staging
            .write_design(&job.design, &job.design_id)
            .await?;
        let command = self.render_command(job, &design_path, origin)?;

        let invocation = self.invoker.invoke(&command).await?.require_success()?;
        let extractor = self.extractor.clone();
        let output = invocation.output.clone();
        let (kind, design_id) = (job.kind, job.design_id.clone());
        let artifact_path =
            tokio::task::spawn_blocking(move || extractor.extract(&output, kind, &design_id))
                .await
                .map_err(|_| JobError::ArtifactNotFound {
                    kind: job.kind,
                    output: invocation.output.clone(),
                })??;

        let url = to_client_reference(&artifact_path)
            .and_then(|reference| with_cache_buster(&reference))
            .ok_or_else(|| JobError::ArtifactNotFound {
                kind: job.kind,
                output: invocation.output.clone(),
            })?;

        info!(
            kind = %job.kind,
            design_id = %job.design_id,
            artifact = %artifact_path,
            duration_ms = invocation.duration_ms,
            "job completed"
        );

        Ok(RenderOutcome {
            kind: job.kind,
            artifact_path,
            url,
            duration_ms: invocation.duration_ms,
        })
    }

    pub async fn apply_change(&self, job: &ChangeJob, origin: &str) -> JobResult<MutationOutcome> {
        let env = [("REFERENCE_BASE".to_string(), origin.to_string())];
        let outcome = self
            .mutator
            .apply_change(&job.design, &job.text_change, &env)
            .await?;
        info!(
            design_id = ?outcome.design.design_id(),
            source = ?outcome.source,
            "design change applied"
        );
        Ok(outcome)
    }

    /// Argument list for a render worker.
    pub fn render_command(
        &self,
        job: &RenderJob,
        design_path: &Path,
        origin: &str,
    ) -> JobResult<WorkerCommand> {
        let program = self.settings.interpreter.program(&self.root);
        let base = WorkerCommand::new(program).env("REFERENCE_BASE", origin);

        let command = match job.kind {
            JobKind::Flatlay => base
                .path_arg(&self.settings.flatlay_script)
                .arg("--input")
                .path_arg(design_path)
                .arg("--variant")
                .arg("flatlay"),
            JobKind::Showcase | JobKind::Runway => {
                let script = if job.kind == JobKind::Showcase {
                    &self.settings.showcase_script
                } else {
                    &self.settings.runway_script
                };
                let mut command = base
                    .path_arg(script)
                    .arg("--design")
                    .path_arg(design_path)
                    .arg("--out-dir")
                    .arg(self.settings.out_dir.clone());
                if let Some(model) = &job.model_config {
                    command = command.arg("--model-attrs").arg(model.to_json());
                }
                if let Some(reference) = job.reference.as_deref().and_then(ArtifactReference::parse)
                {
                    ensure_local_reference(&reference)?;
                    command = command
                        .arg("--reference")
                        .arg(reference.to_worker_input(origin));
                }
                command
            }
            JobKind::ApplyChange => {
                return Err(JobError::Validation(
                    "apply_change has no render command".to_string(),
                ))
            }
        };
        Ok(command)
    }
}

/// Local references must stay inside the project's asset directories.
fn ensure_local_reference(reference: &ArtifactReference) -> JobResult<()> {
    let local = match reference {
        ArtifactReference::Raw(path) => Some(path.clone()),
        ArtifactReference::Client(reference) => decode_reference(reference),
        ArtifactReference::Absolute(_) | ArtifactReference::Opaque(_) => None,
    };
    match local {
        Some(path) if path.split('/').any(|segment| segment == "..") => Err(
            JobError::PathSecurity("reference must not contain '..' segments".to_string()),
        ),
        _ => Ok(()),
    }
}
