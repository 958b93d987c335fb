//! Configuration for circuit breakers, retries and fallback chains.
//!
//! Runtime types ([`CircuitConfig`], [`RetryPolicy`]) are validated on
//! construction. The `*Settings` and `*Config` types mirror what an
//! application reads from its configuration store and convert into the
//! runtime types with `TryFrom`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::kind::FailureKinds;
use crate::retry::RetryPolicy;

/// Immutable settings of one circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitConfig {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    request_timeout: Duration,
    tracked_failures: FailureKinds,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_calls: 3,
            request_timeout: Duration::from_secs(30),
            tracked_failures: FailureKinds::transient(),
        }
    }
}

impl CircuitConfig {
    /// Creates a new builder starting from the defaults.
    pub fn builder() -> CircuitConfigBuilder {
        CircuitConfigBuilder::new()
    }

    /// Consecutive tracked failures that open the circuit.
    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    /// How long the circuit stays open after the last failure.
    pub fn recovery_timeout(&self) -> Duration {
        self.recovery_timeout
    }

    /// Probes admitted while half-open, and successes needed to close.
    pub fn half_open_max_calls(&self) -> u32 {
        self.half_open_max_calls
    }

    /// Time budget of a single attempt.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Failure kinds that count toward the circuit state.
    pub fn tracked_failures(&self) -> FailureKinds {
        self.tracked_failures
    }
}

/// Builder for [`CircuitConfig`].
#[derive(Debug, Clone)]
pub struct CircuitConfigBuilder {
    config: CircuitConfig,
}

impl Default for CircuitConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl CircuitConfigBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            config: CircuitConfig::default(),
        }
    }

    /// Sets the number of consecutive failures required to trip the circuit.
    pub fn failure_threshold(mut self, count: u32) -> Self {
        self.config.failure_threshold = count;
        self
    }

    /// Sets how long the circuit stays open before admitting a probe.
    pub fn recovery_timeout(mut self, duration: Duration) -> Self {
        self.config.recovery_timeout = duration;
        self
    }

    /// Sets the number of probes to allow in half-open state.
    pub fn half_open_max_calls(mut self, count: u32) -> Self {
        self.config.half_open_max_calls = count;
        self
    }

    /// Sets the time budget of one attempt.
    pub fn request_timeout(mut self, duration: Duration) -> Self {
        self.config.request_timeout = duration;
        self
    }

    /// Sets the failure kinds that count toward the circuit state.
    pub fn tracked_failures(mut self, kinds: FailureKinds) -> Self {
        self.config.tracked_failures = kinds;
        self
    }

    /// Validates and builds the configuration.
    pub fn build(self) -> Result<CircuitConfig, ConfigError> {
        if self.config.failure_threshold == 0 {
            return Err(ConfigError::Zero("failure_threshold"));
        }
        if self.config.half_open_max_calls == 0 {
            return Err(ConfigError::Zero("half_open_max_calls"));
        }
        Ok(self.config)
    }
}

pub(crate) fn seconds(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidSeconds {
        field,
        value: value.to_string(),
    })
}

/// Breaker settings as read from a configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Seconds the circuit stays open before a probe.
    pub recovery_timeout_seconds: f64,
    /// Probes admitted while half-open.
    pub half_open_max_calls: u32,
    /// Per-attempt time budget in seconds.
    pub request_timeout_seconds: f64,
    /// Failure kinds counted toward the circuit state.
    pub tracked_failures: FailureKinds,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        let config = CircuitConfig::default();
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout_seconds: config.recovery_timeout.as_secs_f64(),
            half_open_max_calls: config.half_open_max_calls,
            request_timeout_seconds: config.request_timeout.as_secs_f64(),
            tracked_failures: config.tracked_failures,
        }
    }
}

impl TryFrom<&BreakerSettings> for CircuitConfig {
    type Error = ConfigError;

    fn try_from(settings: &BreakerSettings) -> Result<Self, Self::Error> {
        CircuitConfig::builder()
            .failure_threshold(settings.failure_threshold)
            .recovery_timeout(seconds(
                "recovery_timeout_seconds",
                settings.recovery_timeout_seconds,
            )?)
            .half_open_max_calls(settings.half_open_max_calls)
            .request_timeout(seconds(
                "request_timeout_seconds",
                settings.request_timeout_seconds,
            )?)
            .tracked_failures(settings.tracked_failures)
            .build()
    }
}

/// Retry settings as read from a configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    pub base_delay_seconds: f64,
    /// Upper bound of any delay, in seconds.
    pub max_delay_seconds: f64,
    /// Growth factor between consecutive delays.
    pub exponential_base: f64,
    /// Failure kinds worth retrying.
    pub retryable_failures: FailureKinds,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_retries: policy.max_retries(),
            base_delay_seconds: policy.backoff().base_delay().as_secs_f64(),
            max_delay_seconds: policy.backoff().max_delay().as_secs_f64(),
            exponential_base: policy.backoff().exponential_base(),
            retryable_failures: policy.retryable_failures(),
        }
    }
}

impl TryFrom<&RetrySettings> for RetryPolicy {
    type Error = ConfigError;

    fn try_from(settings: &RetrySettings) -> Result<Self, Self::Error> {
        RetryPolicy::new(
            settings.max_retries,
            seconds("base_delay_seconds", settings.base_delay_seconds)?,
            seconds("max_delay_seconds", settings.max_delay_seconds)?,
            settings.exponential_base,
        )
        .map(|policy| policy.with_retryable_failures(settings.retryable_failures))
    }
}

/// One backend as read from a configuration store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    /// Unique name; also the breaker name.
    pub name: String,
    /// Provider identifier, e.g. `openai` or `anthropic`.
    pub provider: String,
    /// Model identifier passed through to the client factory.
    #[serde(default)]
    pub model: Option<String>,
    /// Reference to the credentials (never the secret itself).
    #[serde(default)]
    pub credentials_ref: Option<String>,
    /// Endpoint override.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Lower values are tried first.
    #[serde(default)]
    pub priority: i32,
    /// Breaker settings overriding the chain-wide ones.
    #[serde(default)]
    pub breaker: Option<BreakerSettings>,
}

/// A complete fallback chain as read from a configuration store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Breaker settings for dependencies without their own.
    #[serde(default)]
    pub breaker: BreakerSettings,
    /// Retry settings shared by every dependency.
    #[serde(default)]
    pub retry: RetrySettings,
    /// The backends, in any order.
    pub dependencies: Vec<DependencyConfig>,
}
