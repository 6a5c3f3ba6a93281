//! TOML configuration with `DFS_`-prefixed environment variable overrides.
//!
//! Every field can be set in a `config.toml` file; any field can also be
//! overridden at process startup by setting the corresponding `DFS_*`
//! environment variable, which takes priority over the file. This mirrors
//! the layering most deployment tooling expects: ship a file with the
//! checked-in repo, override per-environment secrets (`DFS_ENC_KEY`) out of
//! band.

#![warn(missing_docs)]

use std::env;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("./data")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_max_backups() -> u32 {
    5
}

fn default_max_age_days() -> u32 {
    28
}

/// Errors surfaced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum Error {
    /// The config file exists but could not be read.
    #[error("reading config file {path}: {source}")]
    Read {
        /// Path that could not be read.
        path: PathBuf,
        /// Underlying I/O failure.
        #[source]
        source: std::io::Error,
    },
    /// The config file's contents are not valid TOML for this schema.
    #[error("parsing config file {path}: {source}")]
    Parse {
        /// Path whose contents failed to parse.
        path: PathBuf,
        /// Underlying parse failure.
        #[source]
        source: toml::de::Error,
    },
    /// No encryption key was set, either in the file or via `DFS_ENC_KEY`.
    #[error("no encryption key configured (set [node] enc_key or DFS_ENC_KEY)")]
    MissingEncKey,
    /// `enc_key` was set but is not 64 hex characters (32 bytes).
    #[error("enc_key must be 64 hex characters (32 bytes): {0}")]
    InvalidEncKey(#[from] hex::FromHexError),
    /// `enc_key` decoded but is not exactly 32 bytes.
    #[error("enc_key decoded to {0} bytes, expected 32")]
    WrongEncKeyLength(usize),
}

/// Log sink and rotation settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive, e.g. `"info"` or
    /// `"dfs_node=debug,transport=trace"`.
    pub level: String,
    /// Emit newline-delimited JSON instead of human-readable text.
    pub json: bool,
    /// Write logs to this file (rolling daily) in addition to stdout. When
    /// unset, logs go to stdout only.
    pub file: Option<PathBuf>,
    /// Rotate once the active log file reaches this size.
    pub max_size_mb: u64,
    /// Number of rotated files to retain.
    pub max_backups: u32,
    /// Discard rotated files older than this many days.
    pub max_age_days: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: None,
            max_size_mb: default_max_size_mb(),
            max_backups: default_max_backups(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Node identity, networking, and storage settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Address this node listens on.
    pub listen_addr: String,
    /// Peers to dial on startup. Empty for a bootstrap (first) node.
    pub bootstrap_nodes: Vec<String>,
    /// Root directory for this node's object store.
    pub storage_root: PathBuf,
    /// Hex-encoded 32-byte AES-256 key. Every node in a deployment must
    /// share the same key; there is no key exchange protocol.
    pub enc_key: String,
    /// This node's own identifier. Generated and not persisted when unset,
    /// so omit it to get a fresh identity on every restart.
    pub node_id: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            bootstrap_nodes: Vec::new(),
            storage_root: default_storage_root(),
            enc_key: String::new(),
            node_id: None,
        }
    }
}

/// Top-level configuration for the `node` binary.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Node identity, networking, and storage settings.
    pub node: NodeConfig,
    /// Log sink and rotation settings.
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from `path` if it exists (an absent file is not
    /// an error and yields defaults), then apply any `DFS_*` environment
    /// overrides.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| Error::Read { path: path.to_path_buf(), source })?;
            toml::from_str(&content).map_err(|source| Error::Parse { path: path.to_path_buf(), source })?
        } else {
            Config::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("DFS_LISTEN_ADDR") {
            self.node.listen_addr = v;
        }
        if let Ok(v) = env::var("DFS_BOOTSTRAP_NODES") {
            self.node.bootstrap_nodes = v.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect();
        }
        if let Ok(v) = env::var("DFS_STORAGE_ROOT") {
            self.node.storage_root = PathBuf::from(v);
        }
        if let Ok(v) = env::var("DFS_ENC_KEY") {
            self.node.enc_key = v;
        }
        if let Ok(v) = env::var("DFS_NODE_ID") {
            self.node.node_id = Some(v);
        }
        if let Ok(v) = env::var("DFS_LOG_LEVEL") {
            self.log.level = v;
        }
        if let Ok(v) = env::var("DFS_LOG_JSON") {
            self.log.json = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = env::var("DFS_LOG_FILE") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("DFS_LOG_MAX_SIZE_MB") {
            if let Ok(n) = v.parse() {
                self.log.max_size_mb = n;
            }
        }
        if let Ok(v) = env::var("DFS_LOG_MAX_BACKUPS") {
            if let Ok(n) = v.parse() {
                self.log.max_backups = n;
            }
        }
        if let Ok(v) = env::var("DFS_LOG_MAX_AGE_DAYS") {
            if let Ok(n) = v.parse() {
                self.log.max_age_days = n;
            }
        }
    }

    /// Decode `node.enc_key` into the 32-byte key the `crypto` crate expects.
    pub fn enc_key_bytes(&self) -> Result<[u8; 32], Error> {
        if self.node.enc_key.is_empty() {
            return Err(Error::MissingEncKey);
        }
        let decoded = hex::decode(&self.node.enc_key)?;
        let len = decoded.len();
        decoded.try_into().map_err(|_| Error::WrongEncKeyLength(len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sensible() {
        let config = Config::default();
        assert_eq!(config.node.listen_addr, "0.0.0.0:3000");
        assert!(config.node.bootstrap_nodes.is_empty());
        assert_eq!(config.log.level, "info");
        assert!(!config.log.json);
    }

    #[test]
    fn missing_enc_key_is_an_error() {
        let config = Config::default();
        assert!(matches!(config.enc_key_bytes(), Err(Error::MissingEncKey)));
    }

    #[test]
    fn enc_key_must_decode_to_32_bytes() {
        let mut config = Config::default();
        config.node.enc_key = hex::encode([1u8; 16]);
        assert!(matches!(config.enc_key_bytes(), Err(Error::WrongEncKeyLength(16))));
    }

    #[test]
    fn valid_enc_key_round_trips() {
        let mut config = Config::default();
        let key = [7u8; 32];
        config.node.enc_key = hex::encode(key);
        assert_eq!(config.enc_key_bytes().unwrap(), key);
    }

    #[test]
    fn load_parses_toml_file() {
        let dir = std::env::temp_dir().join(format!("dfs-config-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(
            &path,
            r#"
            [node]
            listen_addr = "0.0.0.0:4000"
            bootstrap_nodes = ["127.0.0.1:3000"]
            storage_root = "/tmp/dfs-data"
            enc_key = "00112233445566778899aabbccddeeff00112233445566778899aabbccddee"

            [log]
            level = "debug"
            json = true
            "#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.listen_addr, "0.0.0.0:4000");
        assert_eq!(config.node.bootstrap_nodes, vec!["127.0.0.1:3000".to_string()]);
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Path::new("/nonexistent/path/config.toml")).unwrap();
        assert_eq!(config.node.listen_addr, "0.0.0.0:3000");
    }
}
