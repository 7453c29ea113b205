use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Annotation carrying the TTL in seconds.
pub const DEFAULT_TTL_ANNOTATION: &str = "nummel.in/pod-ttl";

/// Condition type whose transition time starts the TTL clock.
pub const DEFAULT_READY_CONDITION: &str = "Ready";

/// Configuration of the TTL controller.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Annotation key holding the TTL as decimal seconds.
    ///
    /// Env: PODTTL__CONTROLLER__TTL_ANNOTATION
    pub ttl_annotation: String,

    /// Condition type that marks a resource as ready.
    ///
    /// Env: PODTTL__CONTROLLER__READY_CONDITION
    pub ready_condition: String,

    /// Upper bound on reconciles running at the same time.
    ///
    /// Env: PODTTL__CONTROLLER__MAX_CONCURRENT_RECONCILES
    pub max_concurrent_reconciles: usize,

    /// Delay before a failed reconcile is redelivered for the first time.
    ///
    /// Env: PODTTL__CONTROLLER__REQUEUE_BASE_DELAY
    #[serde(with = "humantime_serde")]
    pub requeue_base_delay: Duration,

    /// Cap on the redelivery delay after repeated failures.
    ///
    /// Env: PODTTL__CONTROLLER__REQUEUE_MAX_DELAY
    #[serde(with = "humantime_serde")]
    pub requeue_max_delay: Duration,

    /// How long shutdown waits for in-flight work before giving up.
    ///
    /// Env: PODTTL__CONTROLLER__SHUTDOWN_TIMEOUT
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ttl_annotation: DEFAULT_TTL_ANNOTATION.to_string(),
            ready_condition: DEFAULT_READY_CONDITION.to_string(),
            max_concurrent_reconciles: 4,
            requeue_base_delay: Duration::from_secs(1),
            requeue_max_delay: Duration::from_secs(300),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ControllerConfig {
    /// Redelivery delay after `failures` consecutive failed reconciles.
    pub fn requeue_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.requeue_base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.requeue_max_delay)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ttl_annotation.trim().is_empty() {
            return Err(ConfigError::EmptyField("controller.ttl_annotation"));
        }
        if self.ready_condition.trim().is_empty() {
            return Err(ConfigError::EmptyField("controller.ready_condition"));
        }
        if self.max_concurrent_reconciles == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.requeue_base_delay.is_zero() {
            return Err(ConfigError::ZeroRequeueDelay);
        }
        if self.requeue_max_delay < self.requeue_base_delay {
            return Err(ConfigError::RequeueBounds {
                base: self.requeue_base_delay,
                max: self.requeue_max_delay,
            });
        }
        Ok(())
    }
}

/// Configuration of the resource store used in local mode.
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct StoreConfig {
    /// JSON file with an array of resource snapshots to load at startup.
    ///
    /// Env: PODTTL__STORE__SEED_FILE
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_file: Option<PathBuf>,
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    pub controller: ControllerConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Errors raised while validating a [`Configuration`].
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be empty")]
    EmptyField(&'static str),

    #[error("controller.max_concurrent_reconciles must be at least 1")]
    ZeroConcurrency,

    #[error("controller.requeue_base_delay must be positive")]
    ZeroRequeueDelay,

    #[error("controller.requeue_max_delay ({max:?}) must not be below requeue_base_delay ({base:?})")]
    RequeueBounds { base: Duration, max: Duration },
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    fn env() -> Env {
        Env::prefixed("PODTTL__").split("__")
    }

    /// Load defaults, then `podttl.toml` from the working directory, then env vars.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file("podttl.toml"))
            .merge(Self::env())
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Like [`Configuration::load`], reading the TOML file from `path`.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Self::env())
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.controller.validate()
    }
}
