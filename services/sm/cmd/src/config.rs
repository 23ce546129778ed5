//! Configuration handling for the stream management service.
//!
//! Settings come from the shared YAML config file, then `SM_*` environment
//! variables, then command line flags (applied in `main`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sm_session::SmConfig;
use sm_wire::DEFAULT_MAX_FRAME_SIZE;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the loopback listener binds to
    pub listen: SocketAddr,
    /// Domain announced in the stream header
    pub domain: String,
    /// Per-connection write queue depth
    pub write_queue: usize,
    /// Largest frame accepted from a peer, in bytes
    pub max_frame_size: usize,
    /// Stream management settings
    pub sm: StreamManagementConfig,
}

/// Stream management section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamManagementConfig {
    /// Unsolicited `<a/>` every N inbound stanzas (0 = only on request)
    pub ack_frequency: u32,
    /// `<r/>` every N unacknowledged outbound stanzas (0 = never)
    pub request_frequency: u32,
    /// Resumption window
    #[serde(with = "humantime_serde_compat")]
    pub resumption_ttl: Duration,
    /// Bound on the unacknowledged buffer
    pub max_unacked_buffer_size: usize,
    /// Whether resumption is offered
    pub resumption_enabled: bool,
    /// Advertise `max` in `<enabled/>`
    pub advertise_max: bool,
    /// Preferred reconnection host
    pub location: Option<String>,
}

impl Default for StreamManagementConfig {
    fn default() -> Self {
        let sm = SmConfig::default();
        Self {
            ack_frequency: sm.ack_frequency,
            request_frequency: sm.request_frequency,
            resumption_ttl: sm.resumption_ttl,
            max_unacked_buffer_size: sm.max_unacked_buffer_size,
            resumption_enabled: sm.resumption_enabled,
            advertise_max: sm.advertise_max,
            location: sm.location,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], 5222)),
            domain: "localhost".to_string(),
            write_queue: 256,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            sm: StreamManagementConfig::default(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    services: Option<ServicesConfig>,
}

#[derive(Debug, Deserialize)]
struct ServicesConfig {
    sm: Option<ServiceConfig>,
}

#[derive(Debug, Deserialize)]
struct ServiceConfig {
    args: Option<Vec<String>>,
    config: Option<HashMap<String, String>>,
}

impl ServerConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let mut config = Self::default();

        match std::fs::read_to_string(&config_path) {
            Ok(content) => {
                let root_config = serde_yaml::from_str::<RootConfig>(&content)
                    .with_context(|| format!("Failed to parse config file {:?}", config_path.as_ref()))?;
                config.apply_root_config(root_config)?;
                info!("Loaded configuration from {:?}", config_path.as_ref());
            }
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", config_path.as_ref());
            }
        }

        config.apply_overrides_from(|key| std::env::var(key).ok())?;

        info!(
            "Final configuration: listen={}, ack_frequency={}, request_frequency={}, resumption_ttl={:?}, max_unacked={}",
            config.listen,
            config.sm.ack_frequency,
            config.sm.request_frequency,
            config.sm.resumption_ttl,
            config.sm.max_unacked_buffer_size
        );

        Ok(config)
    }

    /// Core stream management configuration
    pub fn sm_config(&self) -> SmConfig {
        SmConfig {
            ack_frequency: self.sm.ack_frequency,
            request_frequency: self.sm.request_frequency,
            resumption_ttl: self.sm.resumption_ttl,
            max_unacked_buffer_size: self.sm.max_unacked_buffer_size,
            resumption_enabled: self.sm.resumption_enabled,
            advertise_max: self.sm.advertise_max,
            location: self.sm.location.clone(),
        }
    }

    fn apply_root_config(&mut self, root_config: RootConfig) -> Result<()> {
        if let Some(service) = root_config.services.and_then(|s| s.sm) {
            if let Some(args) = service.args {
                for arg in args {
                    if let Some(listen) = arg.strip_prefix("--listen=") {
                        self.listen = listen
                            .parse()
                            .with_context(|| format!("Invalid listen address {:?}", listen))?;
                    }
                }
            }
            if let Some(config_map) = service.config {
                for (key, value) in config_map {
                    self.apply_key(&key, &value)?;
                }
            }
        }
        Ok(())
    }

    fn apply_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "services.sm.listen" => self.listen = value.parse().context("Invalid services.sm.listen")?,
            "services.sm.domain" => self.domain = value.to_string(),
            "services.sm.write_queue" => {
                self.write_queue = value.parse().context("Invalid services.sm.write_queue")?
            }
            "services.sm.max_frame_size" => {
                self.max_frame_size = value.parse().context("Invalid services.sm.max_frame_size")?
            }
            "services.sm.ack_frequency" => {
                self.sm.ack_frequency = value.parse().context("Invalid services.sm.ack_frequency")?
            }
            "services.sm.request_frequency" => {
                self.sm.request_frequency = value.parse().context("Invalid services.sm.request_frequency")?
            }
            "services.sm.resumption_ttl" => {
                self.sm.resumption_ttl =
                    humantime::parse_duration(value).context("Invalid services.sm.resumption_ttl")?
            }
            "services.sm.max_unacked_buffer_size" => {
                self.sm.max_unacked_buffer_size =
                    value.parse().context("Invalid services.sm.max_unacked_buffer_size")?
            }
            "services.sm.resumption_enabled" => self.sm.resumption_enabled = value.to_lowercase() == "true",
            "services.sm.advertise_max" => self.sm.advertise_max = value.to_lowercase() == "true",
            "services.sm.location" => {
                self.sm.location = if value.is_empty() { None } else { Some(value.to_string()) }
            }
            _ => {
                // Ignore unknown configuration keys
            }
        }
        Ok(())
    }

    /// Apply `SM_*` overrides read through `lookup`
    fn apply_overrides_from<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        const OVERRIDES: &[(&str, &str)] = &[
            ("SM_LISTEN", "services.sm.listen"),
            ("SM_DOMAIN", "services.sm.domain"),
            ("SM_MAX_FRAME_SIZE", "services.sm.max_frame_size"),
            ("SM_ACK_FREQUENCY", "services.sm.ack_frequency"),
            ("SM_REQUEST_FREQUENCY", "services.sm.request_frequency"),
            ("SM_RESUMPTION_TTL", "services.sm.resumption_ttl"),
            ("SM_MAX_UNACKED", "services.sm.max_unacked_buffer_size"),
            ("SM_RESUMPTION_ENABLED", "services.sm.resumption_enabled"),
            ("SM_LOCATION", "services.sm.location"),
        ];

        for (var, key) in OVERRIDES {
            if let Some(value) = lookup(var) {
                self.apply_key(key, &value)?;
                info!("{} overridden by environment: {}", key, value);
            }
        }
        Ok(())
    }
}

/// Serialize durations as humantime strings ("5m", "90s")
mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.listen, "127.0.0.1:5222".parse().unwrap());
        assert_eq!(config.sm.request_frequency, 5);
        assert_eq!(config.sm.resumption_ttl, Duration::from_secs(300));
        assert_eq!(config.max_frame_size, 64 * 1024);
        assert!(config.sm_config().validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
services:
  sm:
    enabled: true
    executable: ./xmpp-sm
    args:
      - --listen=0.0.0.0:15222
    config:
      services.sm.ack_frequency: "3"
      services.sm.resumption_ttl: "90s"
      services.sm.max_unacked_buffer_size: "500"
      services.sm.location: "sm.example.net:5222"
      services.sm.advertise_max: "false"
      services.sm.max_frame_size: "8192"
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let mut config = ServerConfig::default();
        let root: RootConfig = serde_yaml::from_str(yaml_content).unwrap();
        config.apply_root_config(root).unwrap();
        assert_eq!(config.listen, "0.0.0.0:15222".parse().unwrap());

        let config = ServerConfig::load_from_file(temp_file.path()).unwrap();
        let sm = config.sm_config();
        assert_eq!(sm.ack_frequency, 3);
        assert_eq!(sm.resumption_ttl, Duration::from_secs(90));
        assert_eq!(sm.max_unacked_buffer_size, 500);
        assert_eq!(sm.location.as_deref(), Some("sm.example.net:5222"));
        assert!(!sm.advertise_max);
        assert_eq!(config.max_frame_size, 8192);
    }

    #[test]
    fn test_invalid_value_rejected() {
        let yaml_content = r#"
services:
  sm:
    config:
      services.sm.request_frequency: "often"
"#;
        let mut config = ServerConfig::default();
        let root: RootConfig = serde_yaml::from_str(yaml_content).unwrap();
        assert!(config.apply_root_config(root).is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let env: HashMap<&str, &str> = [
            ("SM_REQUEST_FREQUENCY", "0"),
            ("SM_RESUMPTION_TTL", "2m"),
            ("SM_RESUMPTION_ENABLED", "false"),
        ]
        .into_iter()
        .collect();

        let mut config = ServerConfig::default();
        config
            .apply_overrides_from(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.sm.request_frequency, 0);
        assert_eq!(config.sm.resumption_ttl, Duration::from_secs(120));
        assert!(!config.sm.resumption_enabled);
    }

    #[test]
    fn test_yaml_round_trip_uses_humantime() {
        let yaml = serde_yaml::to_string(&ServerConfig::default()).unwrap();
        assert!(yaml.contains("resumption_ttl: 5m"));
    }
}
