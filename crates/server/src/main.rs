use std::{env, io, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use lookbook_server::{
    config::{self, CliOverrides, DEFAULT_CONFIG_FILE},
    run_http_server,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lookbook-server", version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Project root holding scripts/, output/, renders/ and temp/
    #[arg(long = "root", value_name = "PATH")]
    root: Option<PathBuf>,

    /// Explicit path to the configuration file (defaults to <root>/lookbook.toml)
    #[arg(long = "config", value_name = "FILE")]
    config_path: Option<PathBuf>,

    /// Host to bind
    #[arg(long = "host", value_name = "HOST")]
    host: Option<String>,

    /// Port to bind
    #[arg(long = "port", value_name = "PORT")]
    port: Option<u16>,

    /// Optional log filter (e.g. info, debug)
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Interpreter used to run worker scripts, bypassing detection
    #[arg(long = "interpreter", value_name = "PATH")]
    interpreter: Option<PathBuf>,

    /// Kill workers still running after this many seconds (0 disables)
    #[arg(long = "worker-timeout-secs", value_name = "SECS")]
    worker_timeout_secs: Option<u64>,

    /// Origin handed to workers instead of the request's Host header
    #[arg(long = "public-base-url", value_name = "URL")]
    public_base_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args);

    let root = match &args.root {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("Failed to read current directory")?,
    };
    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to canonicalize project root {}", root.display()))?;

    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(|| root.join(DEFAULT_CONFIG_FILE));
    let file_config = config::load_file_config(&config_path)?;

    let cli = CliOverrides {
        host: args.host.clone(),
        port: args.port,
        interpreter: args.interpreter.clone(),
        worker_timeout_secs: args.worker_timeout_secs,
        public_base_url: args.public_base_url.clone(),
    };
    let config = config::resolve_config(root, &cli, file_config.as_ref(), |key| {
        env::var(key).ok()
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        loaded = file_config.is_some(),
        "starting lookbook-server"
    );

    run_http_server(config).await
}

fn init_tracing(args: &Args) {
    let filter = args
        .log_level
        .as_deref()
        .and_then(|level| EnvFilter::try_new(level).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr);

    let _ = builder.try_init();
}
