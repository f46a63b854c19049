//! Server configuration.
//!
//! Read from a TOML file named by the first command-line argument or the
//! `AIRDELIVERY_CONFIG` environment variable. A missing file means
//! defaults. `PORT` overrides the configured port.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use airdelivery_rendezvous::ServerConfig;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "AIRDELIVERY_CONFIG";

/// Environment variable overriding the listen port.
pub const PORT_ENV: &str = "PORT";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds between sweeps of abandoned flights.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Largest accepted signaling message in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_bind_address() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    5500
}

fn default_sweep_interval() -> u64 {
    120
}

fn default_max_message_size() -> usize {
    1024 * 1024
}

fn default_log_filter() -> String {
    "info,airdelivery=debug".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            sweep_interval_secs: default_sweep_interval(),
            max_message_size: default_max_message_size(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    /// Loads the file at `path` (defaults if absent) and applies `PORT`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))?
            }
            _ => Config::default(),
        };
        config.with_port_override(std::env::var(PORT_ENV).ok().as_deref())
    }

    fn with_port_override(mut self, port: Option<&str>) -> anyhow::Result<Self> {
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            self.port = port
                .parse()
                .with_context(|| format!("invalid {PORT_ENV} value {port:?}"))?;
        }
        Ok(self)
    }

    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_address: self.bind_address,
            port: self.port,
            sweep_interval: Duration::from_secs(self.sweep_interval_secs.max(1)),
            max_message_size: self.max_message_size,
        }
    }
}

/// Picks the config file: the CLI argument wins over the environment.
pub fn config_path(arg: Option<String>) -> Option<PathBuf> {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.port, 5500);
        assert_eq!(config.sweep_interval_secs, 120);
        assert_eq!(config.max_message_size, 1024 * 1024);
        assert_eq!(config.log_filter, "info,airdelivery=debug");
    }

    #[test]
    fn config_roundtrip_toml() {
        let config = Config {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 9000,
            sweep_interval_secs: 30,
            max_message_size: 4096,
            log_filter: "debug".into(),
        };
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.bind_address, config.bind_address);
        assert_eq!(parsed.port, 9000);
        assert_eq!(parsed.sweep_interval_secs, 30);
        assert_eq!(parsed.max_message_size, 4096);
        assert_eq!(parsed.log_filter, "debug");
    }

    #[test]
    fn config_partial_toml() {
        let config: Config = toml::from_str("port = 7000").unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.sweep_interval_secs, 120);
        assert_eq!(config.log_filter, "info,airdelivery=debug");
    }

    #[test]
    fn load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("server.toml");
        std::fs::write(&path, "bind_address = \"127.0.0.1\"\nsweep_interval_secs = 5\n").unwrap();

        let server = Config::load(Some(&path)).unwrap().to_server_config();
        assert_eq!(server.bind_address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(server.sweep_interval, Duration::from_secs(5));
    }

    #[test]
    fn missing_file_means_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load(Some(&tmp.path().join("absent.toml"))).unwrap();
        assert_eq!(config.sweep_interval_secs, 120);
        assert_eq!(config.log_filter, "info,airdelivery=debug");
    }

    #[test]
    fn port_override() {
        let config = Config::default().with_port_override(Some("6100")).unwrap();
        assert_eq!(config.port, 6100);
        assert!(Config::default().with_port_override(Some("nope")).is_err());
        assert_eq!(Config::default().with_port_override(Some("")).unwrap().port, 5500);
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bad.toml");
        std::fs::write(&path, "port = \"not a number\"").unwrap();
        assert!(Config::load(Some(&path)).is_err());
    }

    #[test]
    fn cli_argument_wins() {
        assert_eq!(
            config_path(Some("/etc/airdelivery.toml".into())),
            Some(PathBuf::from("/etc/airdelivery.toml"))
        );
    }

    #[test]
    fn zero_sweep_interval_is_clamped() {
        let config = Config {
            sweep_interval_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.to_server_config().sweep_interval, Duration::from_secs(1));
    }
}
