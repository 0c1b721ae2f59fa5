use anyhow::{Context, Result, anyhow};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vidshelf-env";
pub const DEFAULT_VIDSHELF_PORT: u16 = 8080;
pub const DEFAULT_VIDSHELF_HOST: &str = "127.0.0.1";
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_VIEW_QUEUE_CAPACITY: usize = 1024;
pub const DATABASE_FILE_NAME: &str = "vidshelf.db";

const KEYS: [&str; 6] = [
    "UPLOAD_DIR",
    "DATABASE_PATH",
    "VIDSHELF_HOST",
    "VIDSHELF_PORT",
    "MAX_UPLOAD_BYTES",
    "VIEW_QUEUE_CAPACITY",
];

/// Raw settings as found in the env file and the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvConfig {
    pub upload_dir: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub vidshelf_host: Option<String>,
    pub vidshelf_port: Option<u16>,
    pub max_upload_bytes: Option<u64>,
    pub view_queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub upload_dir: PathBuf,
    pub database_path: PathBuf,
    pub vidshelf_host: String,
    pub vidshelf_port: u16,
    pub max_upload_bytes: u64,
    pub view_queue_capacity: usize,
}

impl EnvConfig {
    fn set(&mut self, key: &str, value: &str, origin: &str) -> Result<()> {
        match key {
            "UPLOAD_DIR" if !value.is_empty() => self.upload_dir = Some(PathBuf::from(value)),
            "DATABASE_PATH" if !value.is_empty() => {
                self.database_path = Some(PathBuf::from(value))
            }
            "VIDSHELF_HOST" if !value.is_empty() => self.vidshelf_host = Some(value.to_string()),
            "VIDSHELF_PORT" => {
                let port: u16 = value
                    .parse()
                    .with_context(|| format!("Parsing VIDSHELF_PORT from {origin}"))?;
                self.vidshelf_port = Some(port);
            }
            "MAX_UPLOAD_BYTES" => {
                let limit: u64 = value
                    .parse()
                    .with_context(|| format!("Parsing MAX_UPLOAD_BYTES from {origin}"))?;
                self.max_upload_bytes = Some(limit);
            }
            "VIEW_QUEUE_CAPACITY" => {
                let capacity: usize = value
                    .parse()
                    .with_context(|| format!("Parsing VIEW_QUEUE_CAPACITY from {origin}"))?;
                self.view_queue_capacity = Some(capacity);
            }
            _ => {}
        }
        Ok(())
    }

    /// Overlays values found through `lookup` (the process environment in
    /// production) on top of the file values.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for key in KEYS {
            if let Some(value) = lookup(key) {
                self.set(key, value.trim(), "the environment")?;
            }
        }
        Ok(())
    }

    pub fn resolve(self) -> Result<RuntimeConfig> {
        let upload_dir = self
            .upload_dir
            .ok_or_else(|| anyhow!("UPLOAD_DIR is not set"))?;
        let database_path = self
            .database_path
            .unwrap_or_else(|| upload_dir.join(DATABASE_FILE_NAME));
        Ok(RuntimeConfig {
            upload_dir,
            database_path,
            vidshelf_host: self
                .vidshelf_host
                .unwrap_or_else(|| DEFAULT_VIDSHELF_HOST.to_string()),
            vidshelf_port: self.vidshelf_port.unwrap_or(DEFAULT_VIDSHELF_PORT),
            max_upload_bytes: self.max_upload_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
            view_queue_capacity: self
                .view_queue_capacity
                .unwrap_or(DEFAULT_VIEW_QUEUE_CAPACITY),
        })
    }
}

pub fn read_env_config(path: &Path) -> Result<Option<EnvConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    let origin = path.display().to_string();
    let mut cfg = EnvConfig::default();
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if let Some((key, value_raw)) = trimmed.split_once('=') {
            let value = value_raw.trim().trim_matches('"');
            cfg.set(key.trim(), value, &origin)?;
        }
    }
    Ok(Some(cfg))
}

/// Env file at `path` (optional) with process environment overrides applied.
pub fn load_env_config_from(path: impl AsRef<Path>) -> Result<EnvConfig> {
    let mut cfg = read_env_config(path.as_ref())?.unwrap_or_default();
    cfg.apply_overrides(|key| std::env::var(key).ok())?;
    Ok(cfg)
}
