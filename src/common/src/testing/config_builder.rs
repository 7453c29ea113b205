//! Test configuration builder for creating test setups quickly.

use std::time::Duration;

use crate::config::{Configuration, ControllerConfig};

/// Builder for creating test configurations.
///
/// Starts from the defaults but with short requeue delays, so tests that
/// exercise redelivery do not wait on production backoff values.
#[derive(Debug, Clone)]
pub struct TestConfigBuilder {
    config: Configuration,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TestConfigBuilder {
    pub fn new() -> Self {
        let mut config = Configuration::default();
        config.controller = ControllerConfig {
            requeue_base_delay: Duration::from_millis(10),
            requeue_max_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            ..ControllerConfig::default()
        };
        Self { config }
    }

    pub fn with_ttl_annotation(mut self, annotation: &str) -> Self {
        self.config.controller.ttl_annotation = annotation.to_string();
        self
    }

    pub fn with_ready_condition(mut self, condition: &str) -> Self {
        self.config.controller.ready_condition = condition.to_string();
        self
    }

    pub fn with_concurrency(mut self, max_concurrent_reconciles: usize) -> Self {
        self.config.controller.max_concurrent_reconciles = max_concurrent_reconciles;
        self
    }

    pub fn with_requeue_delays(mut self, base: Duration, max: Duration) -> Self {
        self.config.controller.requeue_base_delay = base;
        self.config.controller.requeue_max_delay = max;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.controller.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> Configuration {
        self.config
    }

    pub fn build_controller(self) -> ControllerConfig {
        self.config.controller
    }
}
