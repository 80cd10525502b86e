//! Engine configuration.
//!
//! [`EngineConfig`] supplies the defaults every connection, session and link
//! starts from. Values are layered from built-in defaults, an optional
//! `amqp-engine.toml` in the working directory, and `AMQP_ENGINE_*`
//! environment variables.

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::codec::frame::MIN_MAX_FRAME_SIZE;

/// Name of the optional configuration file.
pub const CONFIG_FILE: &str = "amqp-engine.toml";
/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "AMQP_ENGINE_";
/// Default maximum frame size.
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 65_536;

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A provider failed or a value had the wrong type.
    #[error("failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),
    /// A value is outside the range the protocol allows.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Defaults applied to the connection and to newly created endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container id sent in Open.
    pub container_id: String,
    /// Virtual host name sent in Open.
    pub hostname: Option<String>,
    /// Largest frame this engine accepts.
    pub max_frame_size: u32,
    /// Highest channel number this engine accepts.
    pub channel_max: u16,
    /// Local idle timeout in milliseconds; 0 disables it.
    pub idle_timeout: u32,
    /// Session incoming capacity in bytes; 0 leaves the window unbounded.
    pub session_incoming_capacity: u32,
    /// Session outgoing capacity in bytes.
    pub session_outgoing_capacity: u32,
    /// Highest link handle a session accepts.
    pub handle_max: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            container_id: "amqp-engine".to_owned(),
            hostname: None,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            channel_max: u16::MAX,
            idle_timeout: 0,
            session_incoming_capacity: 0,
            session_outgoing_capacity: i32::MAX.unsigned_abs(),
            handle_max: u32::MAX,
        }
    }
}

impl EngineConfig {
    /// Load configuration from defaults, the config file and the environment.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if a provider fails or the result is invalid.
    pub fn load() -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol forbids.
    ///
    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the offending value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container_id.is_empty() {
            return Err(ConfigError::Invalid("container_id must not be empty".to_owned()));
        }
        if self.max_frame_size < MIN_MAX_FRAME_SIZE {
            return Err(ConfigError::Invalid(format!(
                "max_frame_size {} is below the minimum {MIN_MAX_FRAME_SIZE}",
                self.max_frame_size
            )));
        }
        Ok(())
    }

    /// Set the container id.
    #[must_use]
    pub fn with_container_id(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = container_id.into();
        self
    }
}
