use std::str::FromStr;
use std::time::Duration;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::dispatcher::BreakerWaitPolicy;
use crate::retry::RetryPolicy;
use crate::throttling::RateGateConfig;
use crate::{ConfigError, ValidationError};

pub const DEFAULT_CONCURRENCY: usize = 4;

/// Everything needed to assemble a dispatcher and run bulk queries.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    pub rate_gate: RateGateConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub breaker_wait: BreakerWaitPolicy,
    /// Sub-queries a bulk run keeps in flight at once.
    pub concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            rate_gate: RateGateConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            breaker_wait: BreakerWaitPolicy::default(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

impl DispatchConfig {
    /// Defaults with any `FERROGATE_*` environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let gate = &mut config.rate_gate;

        if let Some(value) = parse_var::<u32, _>(&lookup, "FERROGATE_PER_SECOND")? {
            gate.short_capacity = value;
        }
        if let Some(value) = parse_var::<u32, _>(&lookup, "FERROGATE_PER_MINUTE")? {
            gate.long_capacity = value;
        }
        if let Some(value) = parse_var::<f64, _>(&lookup, "FERROGATE_SAFETY_FACTOR")? {
            gate.safety_factor = value;
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, "FERROGATE_MIN_SPACING_MS")? {
            gate.min_spacing = Duration::from_millis(value);
        }

        let retry = &mut config.retry;
        if let Some(value) = parse_var::<u32, _>(&lookup, "FERROGATE_MAX_ATTEMPTS")? {
            retry.max_attempts = value;
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, "FERROGATE_BASE_DELAY_MS")? {
            retry.base_delay = Duration::from_millis(value);
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, "FERROGATE_MAX_DELAY_MS")? {
            retry.max_delay = Duration::from_millis(value);
        }

        let breaker = &mut config.circuit_breaker;
        if let Some(value) = parse_var::<u32, _>(&lookup, "FERROGATE_BREAKER_THRESHOLD")? {
            breaker.failure_threshold = value;
        }
        if let Some(value) = parse_var::<u64, _>(&lookup, "FERROGATE_BREAKER_RESET_SECS")? {
            breaker.reset_timeout = Duration::from_secs(value);
        }

        if let Some(value) = parse_var::<usize, _>(&lookup, "FERROGATE_CONCURRENCY")? {
            config.concurrency = value;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.rate_gate.validate()?;
        self.retry.validate()?;
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(ValidationError::NonPositive {
                field: "failure_threshold",
            });
        }
        if self.circuit_breaker.successes_to_close == 0 {
            return Err(ValidationError::NonPositive {
                field: "successes_to_close",
            });
        }
        if self.concurrency == 0 {
            return Err(ValidationError::NonPositive {
                field: "concurrency",
            });
        }
        Ok(())
    }

    pub fn with_rate_gate(mut self, rate_gate: RateGateConfig) -> Self {
        self.rate_gate = rate_gate;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit_breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = circuit_breaker;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_breaker_wait(mut self, breaker_wait: BreakerWaitPolicy) -> Self {
        self.breaker_wait = breaker_wait;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }
}

fn parse_var<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(name) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| ConfigError::Unparsable {
            name,
            value: raw.clone(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect::<HashMap<_, _>>();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn defaults_match_published_limits() {
        let config = DispatchConfig::default();

        assert_eq!(config.rate_gate.short_capacity, 8);
        assert_eq!(config.rate_gate.long_capacity, 480);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.breaker_wait, BreakerWaitPolicy::FailFast);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn environment_overrides_apply_on_top_of_defaults() {
        let config = DispatchConfig::from_lookup(lookup(&[
            ("FERROGATE_PER_SECOND", "4"),
            ("FERROGATE_SAFETY_FACTOR", "0.5"),
            ("FERROGATE_BASE_DELAY_MS", "250"),
            ("FERROGATE_BREAKER_RESET_SECS", "5"),
            ("FERROGATE_CONCURRENCY", " 8 "),
        ]))
        .expect("valid overrides");

        assert_eq!(config.rate_gate.short_capacity, 4);
        assert_eq!(config.rate_gate.long_capacity, 480);
        assert_eq!(config.rate_gate.safety_factor, 0.5);
        assert_eq!(config.retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.circuit_breaker.reset_timeout, Duration::from_secs(5));
        assert_eq!(config.concurrency, 8);
    }

    #[test]
    fn unparsable_value_names_the_variable() {
        let err = DispatchConfig::from_lookup(lookup(&[("FERROGATE_MAX_ATTEMPTS", "many")]))
            .expect_err("must fail");

        assert_eq!(
            err,
            ConfigError::Unparsable {
                name: "FERROGATE_MAX_ATTEMPTS",
                value: String::from("many"),
            }
        );
    }

    #[test]
    fn out_of_range_override_is_rejected() {
        let err = DispatchConfig::from_lookup(lookup(&[("FERROGATE_SAFETY_FACTOR", "1.5")]))
            .expect_err("must fail");
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = DispatchConfig::from_lookup(lookup(&[("FERROGATE_CONCURRENCY", "0")]))
            .expect_err("must fail");
        assert_eq!(
            err,
            ConfigError::Invalid(ValidationError::NonPositive {
                field: "concurrency"
            })
        );
    }
}
