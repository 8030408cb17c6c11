//! CLI flags + YAML configuration for the Server (spec §6).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "tunnel-server", version, about = "mTLS tunnel server: executes HTTP requests and TCP relays for an Agent")]
pub struct Cli {
    #[arg(long, default_value = "server.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    #[serde(default = "default_request_timeout_secs", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default = "default_connect_dial_timeout_secs", with = "duration_secs")]
    pub connect_dial_timeout: Duration,

    #[serde(default = "default_max_response_body")]
    pub max_response_body: usize,

    #[serde(default)]
    pub metrics_enabled: bool,
    #[serde(default = "default_metrics_interval_secs", with = "duration_secs")]
    pub metrics_interval: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}
fn default_listen_port() -> u16 {
    8443
}
fn default_max_sessions() -> usize {
    16
}
fn default_request_timeout_secs() -> Duration {
    Duration::from_secs(30)
}
fn default_connect_dial_timeout_secs() -> Duration {
    Duration::from_secs(10)
}
fn default_max_response_body() -> usize {
    10 * 1024 * 1024
}
fn default_metrics_interval_secs() -> Duration {
    Duration::from_secs(60)
}
fn default_log_level() -> String {
    "info".to_string()
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_secs(u64::deserialize(deserializer)?))
    }
}

pub fn load_config() -> Result<(Cli, Config)> {
    let cli = Cli::parse();
    let yaml = fs::read_to_string(&cli.config)
        .with_context(|| format!("Failed to read {}", cli.config.display()))?;
    let cfg: Config = serde_yaml::from_str(&yaml).context("Failed to parse YAML in server config")?;
    Ok((cli, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let yaml = r#"
cert_file: server.crt
key_file: server.key
ca_file: ca.crt
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.listen_port, 8443);
        assert_eq!(cfg.max_sessions, 16);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_response_body, 10 * 1024 * 1024);
        assert!(!cfg.metrics_enabled);
    }

    #[test]
    fn overrides_defaults_when_present() {
        let yaml = r#"
listen_addr: 127.0.0.1
listen_port: 9443
cert_file: server.crt
key_file: server.key
ca_file: ca.crt
max_sessions: 4
metrics_enabled: true
metrics_interval: 15
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1");
        assert_eq!(cfg.listen_port, 9443);
        assert_eq!(cfg.max_sessions, 4);
        assert!(cfg.metrics_enabled);
        assert_eq!(cfg.metrics_interval, Duration::from_secs(15));
    }
}
