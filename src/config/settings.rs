use super::GatewayConfig;
use crate::Result;
use config::{Config, Environment};

impl GatewayConfig {
    /// Build a configuration from `NTRIPHUB_`-prefixed environment
    /// variables, falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("NTRIPHUB"))
            .build()
            .map_err(|e| crate::HubError::Config(e.to_string()))?;

        let config = settings
            .try_deserialize::<GatewayConfig>()
            .map_err(|e| crate::HubError::Config(e.to_string()))?;

        Ok(config)
    }
}
