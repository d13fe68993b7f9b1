// # -----------------------------
// # crates/core/src/lib.rs
// # -----------------------------
pub mod design;
pub mod error;
pub mod job;
pub mod output;

pub use design::Design;
pub use error::{JobError, JobResult};
pub use job::{ChangeJob, JobKind, MediaKind, ModelConfig, RenderJob};
pub use output::CapturedOutput;
