//! YAML config for `portgate start`: one file describing several tunnels.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tunnel::Proto;

#[derive(Debug, Deserialize)]
pub struct PortgateConfig {
    #[serde(default = "default_relay")]
    pub relay: String,
    pub tunnels: Vec<TunnelEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TunnelEntry {
    pub name: String,
    #[serde(default)]
    pub proto: Proto,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    pub local_port: u16,
    #[serde(default)]
    pub subdomain: Option<String>,
}

fn default_relay() -> String {
    "http://localhost:8080".to_string()
}

fn default_local_host() -> String {
    "127.0.0.1".to_string()
}

impl PortgateConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tunnels.is_empty() {
            bail!("config declares no tunnels");
        }
        for entry in &self.tunnels {
            if entry.name.is_empty() {
                bail!("tunnel with empty name");
            }
            if entry.local_port == 0 {
                bail!("tunnel '{}' has local_port 0", entry.name);
            }
            if entry.subdomain.is_some() && entry.proto == Proto::Tcp {
                bail!("tunnel '{}' is tcp; subdomains only apply to http", entry.name);
            }
        }
        Ok(())
    }
}

/// Looks for a config in the working directory, then the user config dir.
pub fn find_config() -> Option<PathBuf> {
    for name in ["portgate.yml", "portgate.yaml"] {
        let path = PathBuf::from(name);
        if path.exists() {
            return Some(path);
        }
    }
    if let Some(dir) = dirs::config_dir() {
        let path = dir.join("portgate").join("config.yml");
        if path.exists() {
            return Some(path);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let yaml = r#"
relay: https://relay.example.com
tunnels:
  - name: web
    local_port: 3000
    subdomain: myapp
  - name: db
    proto: tcp
    local_host: 10.0.0.5
    local_port: 5432
"#;
        let config: PortgateConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.relay, "https://relay.example.com");
        assert_eq!(config.tunnels.len(), 2);
        assert_eq!(config.tunnels[0].proto, Proto::Http);
        assert_eq!(config.tunnels[0].local_host, "127.0.0.1");
        assert_eq!(config.tunnels[0].subdomain.as_deref(), Some("myapp"));
        assert_eq!(config.tunnels[1].proto, Proto::Tcp);
        assert_eq!(config.tunnels[1].local_host, "10.0.0.5");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_tcp_subdomain() {
        let yaml = r#"
tunnels:
  - name: db
    proto: tcp
    local_port: 5432
    subdomain: nope
"#;
        let config: PortgateConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
        assert_eq!(config.relay, "http://localhost:8080");
    }
}
