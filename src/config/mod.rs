pub mod settings;

use serde::{Deserialize, Serialize};

/// Gateway configuration
///
/// Every field can be supplied through the environment with the
/// `NTRIPHUB_` prefix (see [`GatewayConfig::from_env`]) or overridden
/// from the command line.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Path to the sqlite source registry
    pub registry_path: String,
    /// Number of publish workers draining the bus
    pub workers: usize,
    /// Maximum concurrent dial attempts per reconciliation cycle
    pub dial_concurrency: usize,
    /// Seconds between reconciliation cycles
    pub poll_interval_secs: u64,
    /// Consecutive failed cycles before a source is disabled in the registry
    pub max_dial_failures: u32,
    /// Dial attempts per source within one reconciliation cycle
    pub dial_attempts: u32,
    /// Delay between dial attempts within one cycle, in seconds
    pub dial_retry_delay_secs: u64,
    /// Demultiplex RTCM frames onto message-type sub-topics
    pub demux: bool,
    /// Leading segment of every published topic
    pub topic_prefix: String,
    /// Capacity of each bus shard
    pub bus_capacity: usize,

    // MQTT broker target
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            registry_path: "mountpoints.db".to_string(),
            workers: 2,
            dial_concurrency: 8,
            poll_interval_secs: 10,
            max_dial_failures: 10,
            dial_attempts: 5,
            dial_retry_delay_secs: 2,
            demux: false,
            topic_prefix: "s2d/osr".to_string(),
            bus_capacity: 1024,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
        }
    }
}

impl GatewayConfig {
    /// Validate configuration bounds before any component starts
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be > 0".to_string());
        }
        if self.dial_concurrency == 0 {
            return Err("dial_concurrency must be > 0".to_string());
        }
        if self.poll_interval_secs == 0 {
            return Err("poll_interval_secs must be > 0".to_string());
        }
        if self.bus_capacity == 0 {
            return Err("bus_capacity must be > 0".to_string());
        }
        if self.dial_attempts == 0 {
            return Err("dial_attempts must be > 0".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = GatewayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.workers, 2);
        assert_eq!(config.dial_concurrency, 8);
        assert_eq!(config.max_dial_failures, 10);
        assert_eq!(config.topic_prefix, "s2d/osr");
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let mut config = GatewayConfig::default();
        config.workers = 0;
        assert!(config.validate().is_err());

        let mut config = GatewayConfig::default();
        config.bus_capacity = 0;
        assert!(config.validate().is_err());
    }
}
