// # -----------------------------
// # crates/server/src/lib.rs
// # -----------------------------
pub mod config;
pub mod http;
pub mod jobs;

pub use config::{load_file_config, resolve_config, CliOverrides, ServerConfig};
pub use http::{build_router, run_http_server};
pub use jobs::{JobService, RenderOutcome};
