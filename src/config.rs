//! TOML configuration: the machine inventory plus server and probe knobs.

use std::fs;
use std::io;
use std::path::Path;

use log::warn;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// A machine that can be woken, as listed in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct Machine {
    pub name: String,
    pub mac: String,
    /// Optional address, used for unicast wake and reachability probes.
    #[serde(default)]
    pub ip: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address the web interface listens on.
    pub listen: String,
    /// When set, every request must carry this password via basic auth.
    pub password: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct PingConfig {
    /// Probe with a raw ICMP socket instead of an unprivileged one.
    pub privileged: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub ping: PingConfig,
    pub machines: Vec<Machine>,
}

impl Config {
    /// Loads the config file; a missing file yields the defaults so the
    /// pure `send --mac` path works without one.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            warn!("config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Ok(toml::from_str(&fs::read_to_string(path)?)?)
    }

    /// Case-insensitive lookup by machine name.
    pub fn machine(&self, name: &str) -> Option<&Machine> {
        self.machines
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use crate::config::*;

    const SAMPLE: &str = r#"
        [server]
        listen = "127.0.0.1:9090"
        password = "hunter2"

        [ping]
        privileged = true

        [[machines]]
        name = "nas"
        mac = "aa:bb:cc:dd:ee:ff"
        ip = "192.168.1.42"

        [[machines]]
        name = "desk"
        mac = "00-11-22-33-44-55"
    "#;

    #[test]
    fn test_parse_full_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9090");
        assert_eq!(config.server.password.as_deref(), Some("hunter2"));
        assert!(config.ping.privileged);
        assert_eq!(config.machines.len(), 2);
        assert_eq!(config.machines[0].ip.as_deref(), Some("192.168.1.42"));
        assert_eq!(config.machines[1].ip, None);
    }

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:8080");
        assert_eq!(config.server.password, None);
        assert!(!config.ping.privileged);
        assert!(config.machines.is_empty());
    }

    #[test]
    fn test_machine_lookup_ignores_case() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.machine("NAS").unwrap().mac, "aa:bb:cc:dd:ee:ff");
        assert!(config.machine("attic").is_none());
    }
}
