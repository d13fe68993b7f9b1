use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use lookbook_assets::DEFAULT_ALLOWED_DIRS;
use lookbook_worker::Interpreter;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "lookbook.toml";
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

/// Fully merged runtime configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub root: PathBuf,
    pub host: String,
    pub port: u16,
    pub public_base_url: Option<String>,
    pub cors_origins: Vec<String>,
    pub worker: WorkerSettings,
    pub allowed_dirs: Vec<String>,
    pub staging_dir: PathBuf,
    pub staging_max_age: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub interpreter: Interpreter,
    pub timeout: Option<Duration>,
    pub flatlay_script: PathBuf,
    pub showcase_script: PathBuf,
    pub runway_script: PathBuf,
    pub apply_change_script: PathBuf,
    pub scripts_dir: PathBuf,
    pub out_dir: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            interpreter: Interpreter::Detect,
            timeout: None,
            flatlay_script: PathBuf::from("scripts/render_utils.py"),
            showcase_script: PathBuf::from("scripts/agent3_virtual_showcase_demo.py"),
            runway_script: PathBuf::from("scripts/agent3_runway_demo.py"),
            apply_change_script: PathBuf::from("scripts/apply_text_change.py"),
            scripts_dir: PathBuf::from("scripts"),
            out_dir: "output".to_string(),
        }
    }
}

impl ServerConfig {
    /// Defaults for a project rooted at `root`.
    pub fn for_root(root: PathBuf) -> Self {
        Self {
            staging_dir: root.join("temp"),
            root,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            public_base_url: None,
            cors_origins: Vec::new(),
            worker: WorkerSettings::default(),
            allowed_dirs: DEFAULT_ALLOWED_DIRS.iter().map(|d| d.to_string()).collect(),
            staging_max_age: None,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub interpreter: Option<PathBuf>,
    pub worker_timeout_secs: Option<u64>,
    pub public_base_url: Option<String>,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    server: RawServerConfig,
    #[serde(default)]
    worker: RawWorkerConfig,
    #[serde(default)]
    assets: RawAssetsConfig,
    #[serde(default)]
    staging: RawStagingConfig,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct RawServerConfig {
    host: Option<String>,
    port: Option<u16>,
    public_base_url: Option<String>,
    cors_origins: Option<Vec<String>>,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct RawWorkerConfig {
    interpreter: Option<String>,
    timeout_secs: Option<u64>,
    flatlay_script: Option<String>,
    showcase_script: Option<String>,
    runway_script: Option<String>,
    apply_change_script: Option<String>,
    scripts_dir: Option<String>,
    out_dir: Option<String>,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct RawAssetsConfig {
    allowed_dirs: Option<Vec<String>>,
}

#[derive(Deserialize, Default, Debug, Clone)]
#[serde(deny_unknown_fields)]
struct RawStagingConfig {
    dir: Option<String>,
    max_age_secs: Option<u64>,
}

/// Reads a TOML config; a missing file is not an error.
pub fn load_file_config(path: &Path) -> Result<Option<FileConfig>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    let parsed: FileConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse TOML config {}", path.display()))?;
    Ok(Some(parsed))
}

/// Merges CLI > environment > file > defaults.
pub fn resolve_config<F>(
    root: PathBuf,
    cli: &CliOverrides,
    file: Option<&FileConfig>,
    env: F,
) -> Result<ServerConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ServerConfig::for_root(root);
    let file = file.cloned().unwrap_or_default();

    config.host = cli
        .host
        .clone()
        .or(file.server.host)
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let env_port = match env("PORT").filter(|v| !v.trim().is_empty()) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u16>()
                .map_err(|_| anyhow!("PORT must be a port number, got '{raw}'"))?,
        ),
        None => None,
    };
    config.port = cli
        .port
        .or(env_port)
        .or(file.server.port)
        .unwrap_or(DEFAULT_PORT);

    config.public_base_url = cli
        .public_base_url
        .clone()
        .or(file.server.public_base_url)
        .map(|url| url.trim_end_matches('/').to_string())
        .filter(|url| !url.is_empty());
    config.cors_origins = file.server.cors_origins.unwrap_or_default();

    let worker = file.worker;
    let interpreter = cli
        .interpreter
        .clone()
        .or_else(|| worker.interpreter.map(PathBuf::from));
    if let Some(explicit) = interpreter {
        config.worker.interpreter = Interpreter::Explicit(explicit);
    }
    config.worker.timeout = cli
        .worker_timeout_secs
        .or(worker.timeout_secs)
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    let scripts = &mut config.worker;
    for (target, value) in [
        (&mut scripts.flatlay_script, worker.flatlay_script),
        (&mut scripts.showcase_script, worker.showcase_script),
        (&mut scripts.runway_script, worker.runway_script),
        (&mut scripts.apply_change_script, worker.apply_change_script),
        (&mut scripts.scripts_dir, worker.scripts_dir),
    ] {
        if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
            *target = PathBuf::from(value);
        }
    }
    if let Some(out_dir) = worker.out_dir.filter(|v| !v.trim().is_empty()) {
        config.worker.out_dir = out_dir;
    }

    if let Some(dirs) = file.assets.allowed_dirs {
        if dirs.iter().any(|d| d.contains("..") || d.trim_matches('/').is_empty()) {
            return Err(anyhow!("assets.allowed_dirs entries must be plain directory names"));
        }
        config.allowed_dirs = dirs;
    }

    if let Some(dir) = file.staging.dir.filter(|v| !v.trim().is_empty()) {
        config.staging_dir = config.root.join(dir);
    }
    config.staging_max_age = file
        .staging
        .max_age_secs
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs);

    Ok(config)
}
