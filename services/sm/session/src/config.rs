//! Stream management configuration.

use sm_storage::HALF_WINDOW;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Resumption TTL must be positive
    #[error("resumption_ttl must be greater than zero")]
    ZeroTtl,
    /// Buffer bound must be positive
    #[error("max_unacked_buffer_size must be greater than zero")]
    ZeroBuffer,
    /// Buffer bound must stay inside the half window used for comparisons
    #[error("max_unacked_buffer_size {0} must be below 2^31")]
    BufferTooLarge(usize),
}

/// Configuration shared by every stream management session of a server
#[derive(Clone, Debug)]
pub struct SmConfig {
    /// Send an unsolicited `<a/>` after this many inbound stanzas (0 = only on `<r/>`)
    pub ack_frequency: u32,
    /// Send `<r/>` whenever the unacknowledged count is a multiple of this (0 = never)
    pub request_frequency: u32,
    /// How long a detached session stays resumable
    pub resumption_ttl: Duration,
    /// Bound on stanzas awaiting acknowledgment per session
    pub max_unacked_buffer_size: usize,
    /// Whether resumption may be granted at all
    pub resumption_enabled: bool,
    /// Advertise `max` (resumption TTL in seconds) in `<enabled/>`
    pub advertise_max: bool,
    /// Preferred reconnection host advertised in `<enabled/>` (v3 only)
    pub location: Option<String>,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            ack_frequency: 0,
            request_frequency: 5,
            resumption_ttl: Duration::from_secs(300),
            max_unacked_buffer_size: 10_000,
            resumption_enabled: true,
            advertise_max: true,
            location: None,
        }
    }
}

impl SmConfig {
    /// Check option values for consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resumption_ttl.is_zero() {
            return Err(ConfigError::ZeroTtl);
        }
        if self.max_unacked_buffer_size == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        if self.max_unacked_buffer_size as u64 >= HALF_WINDOW as u64 {
            return Err(ConfigError::BufferTooLarge(self.max_unacked_buffer_size));
        }
        Ok(())
    }

    /// Period of the resumption registry sweep: a tenth of the TTL, kept
    /// between one second and three minutes
    pub fn sweep_interval(&self) -> Duration {
        sweep_interval_for(self.resumption_ttl)
    }
}

/// Sweep period for a given TTL
pub fn sweep_interval_for(ttl: Duration) -> Duration {
    (ttl / 10).clamp(Duration::from_secs(1), Duration::from_secs(180))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.request_frequency, 5);
        assert_eq!(config.max_unacked_buffer_size, 10_000);
    }

    #[test]
    fn test_validate_rejects_bad_bounds() {
        let mut config = SmConfig::default();
        config.resumption_ttl = Duration::ZERO;
        assert_eq!(config.validate(), Err(ConfigError::ZeroTtl));

        let mut config = SmConfig::default();
        config.max_unacked_buffer_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroBuffer));

        let mut config = SmConfig::default();
        config.max_unacked_buffer_size = 1 << 31;
        assert_eq!(
            config.validate(),
            Err(ConfigError::BufferTooLarge(1 << 31))
        );
    }

    #[test]
    fn test_sweep_interval_clamped() {
        assert_eq!(sweep_interval_for(Duration::from_secs(5)), Duration::from_secs(1));
        assert_eq!(sweep_interval_for(Duration::from_secs(300)), Duration::from_secs(30));
        assert_eq!(sweep_interval_for(Duration::from_secs(7200)), Duration::from_secs(180));
    }
}
