//! # cairn-config
//!
//! Configuration for the cairn repository indexer.
//!
//! The store root holds everything: `db/` (the key-value environment),
//! `obj/` (content-addressed manifest artifacts), a JSON `config` file
//! and optionally a `log` file. The root is chosen from, in order: an
//! explicit override (the CLI flag), the `STORE` environment variable,
//! the XDG config directory, and finally the OS data directory.
//!
//! Unknown top-level keys in the config file are ignored; invalid values
//! reject the configuration at startup.

pub mod logging;

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application directory name under the config root.
pub const APP_NAME: &str = "cairn";

/// Name of the JSON configuration file inside the store root.
pub const CONFIG_FILE: &str = "config";

/// Default piece size: 1 MiB.
pub const DEFAULT_PIECE_SIZE: u64 = 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("no usable store directory; set STORE or pass --store")]
    NoStoreDir,
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Log levels accepted in the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Notice,
    Warn,
    Err,
    Crit,
}

impl LogLevel {
    /// The tracing filter directive this level maps onto. `notice` folds
    /// into `info`, `crit` into `error`.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info | LogLevel::Notice => "info",
            LogLevel::Warn => "warn",
            LogLevel::Err | LogLevel::Crit => "error",
        }
    }
}

/// One published mapping from the virtual namespace to the filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedPath {
    /// Slash-separated virtual path; empty publishes at the root.
    #[serde(rename = "virtual")]
    pub virtual_path: String,
    /// Absolute filesystem path backing it.
    pub fs: PathBuf,
}

/// The JSON configuration object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hashing worker threads; `null` picks min(4, cpu count).
    pub hash_threads: Option<u32>,
    /// Piece size in bytes; a power of two, at least 1024.
    pub blake3_piece_size: u64,
    pub log_level: LogLevel,
    pub published_paths: Vec<PublishedPath>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hash_threads: None,
            blake3_piece_size: DEFAULT_PIECE_SIZE,
            log_level: LogLevel::default(),
            published_paths: Vec::new(),
        }
    }
}

impl Config {
    /// Load the configuration from a store root. A missing file yields
    /// the defaults; an unreadable or invalid one is an error.
    pub fn load(store_root: &Path) -> Result<Config> {
        let path = store_root.join(CONFIG_FILE);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Config::default();
                config.validate()?;
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject invalid values; serde already rejected malformed JSON and
    /// unknown enum variants.
    pub fn validate(&self) -> Result<()> {
        if self.hash_threads == Some(0) {
            return Err(ConfigError::Invalid("hash_threads must be at least 1".into()));
        }
        if !self.blake3_piece_size.is_power_of_two() || self.blake3_piece_size < 1024 {
            return Err(ConfigError::Invalid(format!(
                "blake3_piece_size {} is not a power of two ≥ 1024",
                self.blake3_piece_size
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        for p in &self.published_paths {
            if !p.fs.is_absolute() {
                return Err(ConfigError::Invalid(format!(
                    "published fs path {:?} is not absolute",
                    p.fs
                )));
            }
            let normalized: Vec<&str> =
                p.virtual_path.split('/').filter(|c| !c.is_empty()).collect();
            if !seen.insert(normalized) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate published virtual path {:?}",
                    p.virtual_path
                )));
            }
        }
        Ok(())
    }
}

/// Resolve the store root: explicit override, `STORE`, XDG config home,
/// `~/.config/cairn`, then the OS data directory.
pub fn store_root(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = override_path {
        return Ok(absolute(p)?);
    }
    if let Some(p) = std::env::var_os("STORE") {
        return Ok(absolute(Path::new(&p))?);
    }
    if let Some(base) = dirs::config_dir() {
        return Ok(base.join(APP_NAME));
    }
    if let Some(home) = dirs::home_dir() {
        return Ok(home.join(".config").join(APP_NAME));
    }
    if let Some(base) = dirs::data_local_dir() {
        return Ok(base.join(APP_NAME));
    }
    Err(ConfigError::NoStoreDir)
}

/// Resolve a possibly relative path against the working directory,
/// without touching the filesystem.
fn absolute(p: &Path) -> std::io::Result<PathBuf> {
    if p.is_absolute() {
        Ok(p.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(p))
    }
}

/// `db/` under the store root: the key-value environment.
pub fn db_dir(store_root: &Path) -> PathBuf {
    store_root.join("db")
}

/// `obj/` under the store root: content-addressed manifest artifacts.
pub fn obj_dir(store_root: &Path) -> PathBuf {
    store_root.join("obj")
}

/// Optional log file location under the store root.
pub fn log_path(store_root: &Path) -> PathBuf {
    store_root.join("log")
}
