//! Recognized configuration keys for the peer-networking core, loaded from
//! a TOML file. All keys are required unless marked optional below;
//! absence of a required key is a fatal `ConfigError` at startup.

use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub peer: PeerConfig,
    pub rendezvous: RendezvousConfig,
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    pub namespace: String,
    pub name: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RendezvousConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub ping_interval: u64,
    pub ack_timeout: u64,
    pub discovery_interval: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_base: u64,
    pub reconnect_backoff_max: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub file: Option<String>,
}

impl Config {
    pub fn from_str(contents: &str) -> Result<Config, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Config::from_str(&contents)
    }

    pub fn peer_id(&self) -> String {
        format!("{}@{}", self.peer.name, self.peer.namespace)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.peer.namespace.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "peer.namespace",
                reason: "must not be empty".to_string(),
            });
        }
        if self.peer.name.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "peer.name",
                reason: "must not be empty".to_string(),
            });
        }
        if self.peer.namespace.contains('@') || self.peer.name.contains('@') {
            return Err(ConfigError::InvalidValue {
                key: "peer.name/peer.namespace",
                reason: "must not contain '@'".to_string(),
            });
        }
        if self.peer.port == 0 {
            return Err(ConfigError::InvalidValue {
                key: "peer.port",
                reason: "must be nonzero".to_string(),
            });
        }
        if self.connection.max_reconnect_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                key: "connection.max_reconnect_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
        [peer]
        namespace = "room1"
        name = "alice"
        port = 7001

        [rendezvous]
        host = "127.0.0.1"
        port = 9000

        [connection]
        ping_interval = 30
        ack_timeout = 5
        discovery_interval = 15
        max_reconnect_attempts = 5
        reconnect_backoff_base = 2
        reconnect_backoff_max = 60
    "#;

    #[test]
    fn loads_valid_config() {
        let config = Config::from_str(VALID).unwrap();
        assert_eq!(config.peer_id(), "alice@room1");
        assert!(config.logging.is_none());
    }

    #[test]
    fn missing_required_key_is_fatal() {
        let broken = r#"
            [peer]
            namespace = "room1"
            name = "alice"
        "#;
        assert!(Config::from_str(broken).is_err());
    }

    #[test]
    fn zero_port_is_rejected() {
        let broken = VALID.replace("port = 7001", "port = 0");
        assert!(matches!(
            Config::from_str(&broken),
            Err(ConfigError::InvalidValue { key: "peer.port", .. })
        ));
    }

    #[test]
    fn optional_logging_section_parses_when_present() {
        let with_logging = format!(
            "{VALID}\n[logging]\nlevel = \"debug\"\n"
        );
        let config = Config::from_str(&with_logging).unwrap();
        assert_eq!(config.logging.unwrap().level.as_deref(), Some("debug"));
    }
}
