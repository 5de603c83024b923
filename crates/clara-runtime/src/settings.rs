//! Runtime timeout knobs derived from the configuration document.

use std::time::Duration;

use clara_core::Config;

/// Timeouts governing process lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeSettings {
    /// Start → Ready budget.
    pub health_check_timeout: Duration,
    /// Graceful stop budget (drain plus SIGTERM grace).
    pub stop_timeout: Duration,
    /// How long a request waits for an exclusive peer group to drain.
    pub exclusion_timeout: Duration,
}

impl RuntimeSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            health_check_timeout: Duration::from_secs(config.health_check_timeout),
            stop_timeout: Duration::from_secs(config.stop_timeout),
            exclusion_timeout: Duration::from_secs(config.exclusion_timeout),
        }
    }
}
