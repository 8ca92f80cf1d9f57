use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub datagram: DatagramConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

fn default_busy_timeout_secs() -> u64 {
    30
}

/// Stream listener that accepts snapshot transfers.
#[derive(Debug, Deserialize, Clone)]
pub struct ReceiverConfig {
    #[serde(default = "default_transfer_bind")]
    pub bind: String,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    /// Deadline applied to every individual read on a transfer connection.
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "default_max_snapshot_bytes")]
    pub max_snapshot_bytes: u64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            bind: default_transfer_bind(),
            staging_dir: default_staging_dir(),
            read_timeout_secs: default_read_timeout_secs(),
            max_snapshot_bytes: default_max_snapshot_bytes(),
        }
    }
}

impl ReceiverConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

fn default_transfer_bind() -> String {
    "0.0.0.0:1985".to_string()
}
fn default_staging_dir() -> PathBuf {
    PathBuf::from("./data/staging")
}
fn default_read_timeout_secs() -> u64 {
    60
}
fn default_max_snapshot_bytes() -> u64 {
    1024 * 1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatagramConfig {
    #[serde(default = "default_datagram_enabled")]
    pub enabled: bool,
    #[serde(default = "default_transfer_bind")]
    pub bind: String,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            enabled: default_datagram_enabled(),
            bind: default_transfer_bind(),
        }
    }
}

fn default_datagram_enabled() -> bool {
    true
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_http_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_http_bind(),
        }
    }
}

fn default_http_bind() -> String {
    "127.0.0.1:8080".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct MergeConfig {
    /// Emit a progress event every N records.
    #[serde(default = "default_progress_every")]
    pub progress_every: u64,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            progress_every: default_progress_every(),
        }
    }
}

fn default_progress_every() -> u64 {
    1000
}

impl Config {
    /// All-defaults configuration for commands that can run without a file.
    pub fn minimal() -> Self {
        Self {
            db: DbConfig {
                path: PathBuf::from("./data/gofi.sqlite"),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            receiver: ReceiverConfig::default(),
            datagram: DatagramConfig::default(),
            server: ServerConfig::default(),
            merge: MergeConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;

    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.db.path.as_os_str().is_empty() {
        anyhow::bail!("db.path must not be empty");
    }

    if config.receiver.read_timeout_secs == 0 {
        anyhow::bail!("receiver.read_timeout_secs must be > 0");
    }

    if config.receiver.max_snapshot_bytes == 0 {
        anyhow::bail!("receiver.max_snapshot_bytes must be > 0");
    }

    if config.merge.progress_every == 0 {
        anyhow::bail!("merge.progress_every must be >= 1");
    }

    for (key, addr) in [
        ("receiver.bind", &config.receiver.bind),
        ("datagram.bind", &config.datagram.bind),
        ("server.bind", &config.server.bind),
    ] {
        if addr.parse::<std::net::SocketAddr>().is_err() {
            anyhow::bail!("{} is not a valid socket address: '{}'", key, addr);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_src: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_src)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_file_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/gofi.sqlite\"\n").unwrap();
        assert_eq!(config.receiver.bind, "0.0.0.0:1985");
        assert_eq!(config.receiver.read_timeout_secs, 60);
        assert!(config.datagram.enabled);
        assert_eq!(config.server.bind, "127.0.0.1:8080");
        assert_eq!(config.merge.progress_every, 1000);
        assert_eq!(config.db.busy_timeout_secs, 30);
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[receiver]\nread_timeout_secs = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("read_timeout_secs"));
    }

    #[test]
    fn test_rejects_bad_bind() {
        let err = parse("[db]\npath = \"x.sqlite\"\n[server]\nbind = \"localhost\"\n").unwrap_err();
        assert!(err.to_string().contains("server.bind"));
    }

    #[test]
    fn test_missing_db_section_fails() {
        assert!(parse("[server]\nbind = \"127.0.0.1:1\"\n").is_err());
    }
}
