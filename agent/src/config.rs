//! CLI flags + YAML configuration for the Agent (spec §6).

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

#[derive(Parser, Debug)]
#[command(name = "tunnel-agent", version, about = "Local HTTP/HTTPS forward proxy tunneled over mTLS")]
pub struct Cli {
    #[arg(long, default_value = "agent.yaml")]
    pub config: PathBuf,

    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,

    #[serde(default = "default_local_proxy_port")]
    pub local_proxy_port: u16,

    pub cert_file: String,
    pub key_file: String,
    pub ca_file: String,

    #[serde(default = "default_connect_timeout_secs", with = "duration_secs")]
    pub connect_timeout: Duration,
    #[serde(default = "default_request_timeout_secs", with = "duration_secs")]
    pub request_timeout: Duration,
    #[serde(default = "default_reconnect_max_backoff_secs", with = "duration_secs")]
    pub reconnect_max_backoff: Duration,
    #[serde(default = "default_pre_connect_wake_deadline_secs", with = "duration_secs")]
    pub pre_connect_wake_deadline: Duration,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_local_proxy_port() -> u16 {
    8080
}
fn default_connect_timeout_secs() -> Duration {
    Duration::from_secs(10)
}
fn default_request_timeout_secs() -> Duration {
    Duration::from_secs(30)
}
fn default_reconnect_max_backoff_secs() -> Duration {
    Duration::from_secs(60)
}
fn default_pre_connect_wake_deadline_secs() -> Duration {
    Duration::from_secs(90)
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
    let cfg: Config = serde_yaml::from_str(&yaml).context("Failed to parse YAML in agent config")?;
    Ok((cli, cfg))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config_with_defaults() {
        let yaml = r#"
server_host: tunnel.example.org
server_port: 8443
cert_file: agent.crt
key_file: agent.key
ca_file: ca.crt
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.local_proxy_port, 8080);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.reconnect_max_backoff, Duration::from_secs(60));
    }

    #[test]
    fn overrides_defaults_when_present() {
        let yaml = r#"
server_host: tunnel.example.org
server_port: 8443
local_proxy_port: 9090
cert_file: agent.crt
key_file: agent.key
ca_file: ca.crt
request_timeout: 5
"#;
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.local_proxy_port, 9090);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
    }
}
