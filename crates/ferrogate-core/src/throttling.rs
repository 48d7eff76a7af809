//! Dual-window admission control.
//!
//! A [`RateGate`] combines a short and a long fixed-window [`TokenBudget`],
//! scales both by a safety factor, enforces a minimum spacing between admitted
//! calls and can be throttled further after the upstream rejects a call that
//! was admitted locally. The gate never sleeps: a denial tells the caller when
//! to come back.

use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ValidationError;

/// Published upstream limits.
pub const NOMINAL_PER_SECOND: u32 = 8;
pub const NOMINAL_PER_MINUTE: u32 = 480;
/// Fraction of the nominal limits actually used.
pub const DEFAULT_SAFETY_FACTOR: f64 = 0.75;
/// At most three calls per 500ms.
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_micros(166_667);

/// Counter for one fixed-size window. Rolls over lazily on access.
#[derive(Debug, Clone)]
pub struct TokenBudget {
    capacity: u32,
    window: Duration,
    consumed: u32,
    window_start: Instant,
}

impl TokenBudget {
    pub fn new(capacity: u32, window: Duration, now: Instant) -> Self {
        Self {
            capacity,
            window,
            consumed: 0,
            window_start: now,
        }
    }

    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    pub const fn window(&self) -> Duration {
        self.window
    }

    pub fn window_end(&self) -> Instant {
        self.window_start + self.window
    }

    /// Consumed count as seen at `now`, without rolling the stored window.
    pub fn consumed_at(&self, now: Instant) -> u32 {
        if now >= self.window_end() {
            0
        } else {
            self.consumed
        }
    }

    /// Advances `window_start` by whole windows once the current one elapsed.
    fn roll(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return;
        }

        let periods = elapsed.as_nanos() / self.window.as_nanos().max(1);
        self.window_start = u32::try_from(periods)
            .ok()
            .and_then(|periods| self.window.checked_mul(periods))
            .map_or(now, |advance| self.window_start + advance);
        self.consumed = 0;
    }

    fn consume(&mut self) {
        self.consumed = self.consumed.saturating_add(1);
    }
}

/// Rate gate limits and adaptive throttling parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct RateGateConfig {
    pub short_capacity: u32,
    pub short_window: Duration,
    pub long_capacity: u32,
    pub long_window: Duration,
    /// Applied to both nominal capacities; `0 < f <= 1`.
    pub safety_factor: f64,
    pub min_spacing: Duration,
    /// Upper bound for the throttle factor after repeated rejections.
    pub throttle_ceiling: f64,
    /// How long the throttle stays at its peak after the last rejection.
    pub throttle_cooldown: Duration,
    /// Linear decay from peak back to 1 once the cooldown elapsed.
    pub throttle_decay: Duration,
}

impl Default for RateGateConfig {
    fn default() -> Self {
        Self {
            short_capacity: NOMINAL_PER_SECOND,
            short_window: Duration::from_secs(1),
            long_capacity: NOMINAL_PER_MINUTE,
            long_window: Duration::from_secs(60),
            safety_factor: DEFAULT_SAFETY_FACTOR,
            min_spacing: DEFAULT_MIN_SPACING,
            throttle_ceiling: 8.0,
            throttle_cooldown: Duration::from_secs(30),
            throttle_decay: Duration::from_secs(60),
        }
    }
}

impl RateGateConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.short_capacity == 0 {
            return Err(ValidationError::NonPositive {
                field: "short_capacity",
            });
        }
        if self.long_capacity == 0 {
            return Err(ValidationError::NonPositive {
                field: "long_capacity",
            });
        }
        if self.short_window.is_zero() {
            return Err(ValidationError::NonPositive {
                field: "short_window",
            });
        }
        if self.long_window.is_zero() {
            return Err(ValidationError::NonPositive {
                field: "long_window",
            });
        }
        if !(self.safety_factor > 0.0 && self.safety_factor <= 1.0) {
            return Err(ValidationError::OutOfRange {
                field: "safety_factor",
                min: 0.0,
                max: 1.0,
            });
        }
        let smallest = self.short_capacity.min(self.long_capacity);
        if f64::from(smallest) * self.safety_factor < 1.0 {
            return Err(ValidationError::NonPositive {
                field: "effective_capacity",
            });
        }
        if !(self.throttle_ceiling >= 1.0 && self.throttle_ceiling.is_finite()) {
            return Err(ValidationError::OutOfRange {
                field: "throttle_ceiling",
                min: 1.0,
                max: f64::MAX,
            });
        }
        Ok(())
    }
}

/// Which constraint caused a denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    ShortWindow,
    LongWindow,
    Spacing,
}

/// Denied admission; retry no earlier than `wait_until`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDenied {
    pub wait_until: Instant,
    pub reason: DenyReason,
}

/// Usage of one budget at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BudgetUsage {
    pub consumed: u32,
    pub effective_capacity: u32,
    pub nominal_capacity: u32,
    pub window_ms: u64,
}

impl BudgetUsage {
    pub fn ratio(&self) -> f64 {
        if self.effective_capacity == 0 {
            return 1.0;
        }
        f64::from(self.consumed) / f64::from(self.effective_capacity)
    }
}

/// Read-only gate diagnostics for monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct GateUtilization {
    pub short: BudgetUsage,
    pub long: BudgetUsage,
    pub throttle_factor: f64,
    pub admitted_total: u64,
    pub denied_total: u64,
    pub rejections_total: u64,
}

#[derive(Debug, Clone, Copy)]
struct Throttle {
    peak: f64,
    last_rejection: Option<Instant>,
}

impl Throttle {
    fn factor_at(&self, now: Instant, config: &RateGateConfig) -> f64 {
        let Some(last) = self.last_rejection else {
            return 1.0;
        };

        let since = now.saturating_duration_since(last);
        if since < config.throttle_cooldown {
            return self.peak;
        }

        let decaying = since - config.throttle_cooldown;
        if config.throttle_decay.is_zero() || decaying >= config.throttle_decay {
            return 1.0;
        }

        let remaining = 1.0 - decaying.as_secs_f64() / config.throttle_decay.as_secs_f64();
        1.0 + (self.peak - 1.0) * remaining
    }

    /// Earliest instant at which the factor drops to `target` or below.
    fn relief_at(&self, target: f64, now: Instant, config: &RateGateConfig) -> Instant {
        let Some(last) = self.last_rejection else {
            return now;
        };
        if self.peak <= target {
            return now;
        }

        let cooled = last + config.throttle_cooldown;
        let fraction = 1.0 - (target - 1.0) / (self.peak - 1.0);
        let relief = cooled + config.throttle_decay.mul_f64(fraction.clamp(0.0, 1.0));
        relief.max(now)
    }
}

#[derive(Debug)]
struct GateState {
    short: TokenBudget,
    long: TokenBudget,
    last_admitted: Option<Instant>,
    throttle: Throttle,
    admitted_total: u64,
    denied_total: u64,
    rejections_total: u64,
}

/// Shared admission gate. All state changes happen under one lock, so two
/// concurrent callers can never both take the last token.
#[derive(Debug)]
pub struct RateGate {
    config: RateGateConfig,
    state: Mutex<GateState>,
}

impl RateGate {
    pub fn new(config: RateGateConfig) -> Result<Self, ValidationError> {
        Self::new_at(config, Instant::now())
    }

    /// Starts both windows at `now`.
    pub fn new_at(config: RateGateConfig, now: Instant) -> Result<Self, ValidationError> {
        config.validate()?;
        let state = GateState {
            short: TokenBudget::new(config.short_capacity, config.short_window, now),
            long: TokenBudget::new(config.long_capacity, config.long_window, now),
            last_admitted: None,
            throttle: Throttle {
                peak: 1.0,
                last_rejection: None,
            },
            admitted_total: 0,
            denied_total: 0,
            rejections_total: 0,
        };
        Ok(Self {
            config,
            state: Mutex::new(state),
        })
    }

    pub fn config(&self) -> &RateGateConfig {
        &self.config
    }

    /// `floor(nominal * safety / throttle)`.
    fn effective_capacity(&self, nominal: u32, throttle: f64) -> u32 {
        let scaled = f64::from(nominal) * self.config.safety_factor / throttle;
        // Guard against 0.75 * 8 landing a hair under 6.
        (scaled + 1e-6).floor() as u32
    }

    /// Tries to take one token from both budgets. `now` must not go backwards
    /// between calls.
    pub fn try_admit(&self, now: Instant) -> Result<(), AdmissionDenied> {
        let mut state = self.state.lock();
        state.short.roll(now);
        state.long.roll(now);
        self.settle_throttle(&mut state, now);

        let throttle = state.throttle.factor_at(now, &self.config);
        let mut denial: Option<AdmissionDenied> = None;
        let mut deny = |wait_until: Instant, reason: DenyReason| {
            if denial.map_or(true, |current| wait_until > current.wait_until) {
                denial = Some(AdmissionDenied { wait_until, reason });
            }
        };

        for (budget, reason) in [
            (&state.short, DenyReason::ShortWindow),
            (&state.long, DenyReason::LongWindow),
        ] {
            let effective = self.effective_capacity(budget.capacity(), throttle);
            if budget.consumed >= effective {
                let mut wait_until = budget.window_end();
                if effective == 0 {
                    let target = f64::from(budget.capacity()) * self.config.safety_factor;
                    wait_until = wait_until.max(state.throttle.relief_at(target, now, &self.config));
                }
                deny(wait_until, reason);
            }
        }

        if let Some(last) = state.last_admitted {
            let spaced = last + self.config.min_spacing;
            if now < spaced {
                deny(spaced, DenyReason::Spacing);
            }
        }

        if let Some(denied) = denial {
            state.denied_total = state.denied_total.saturating_add(1);
            debug!(
                reason = ?denied.reason,
                wait_ms = denied.wait_until.saturating_duration_since(now).as_millis() as u64,
                "rate gate denied admission"
            );
            return Err(denied);
        }

        state.short.consume();
        state.long.consume();
        state.last_admitted = Some(now);
        state.admitted_total = state.admitted_total.saturating_add(1);
        Ok(())
    }

    /// The upstream rejected a call the gate had admitted: double the
    /// throttle factor (capped) and restart the cooldown.
    pub fn record_rejection(&self, now: Instant) {
        let mut state = self.state.lock();
        let current = state.throttle.factor_at(now, &self.config);
        let next = (current * 2.0).min(self.config.throttle_ceiling);
        state.throttle = Throttle {
            peak: next,
            last_rejection: Some(now),
        };
        state.rejections_total = state.rejections_total.saturating_add(1);
        warn!(
            throttle_factor = next,
            rejections_total = state.rejections_total,
            "upstream rejected admitted call; throttling"
        );
    }

    pub fn throttle_factor(&self, now: Instant) -> f64 {
        self.state.lock().throttle.factor_at(now, &self.config)
    }

    pub fn utilization(&self, now: Instant) -> GateUtilization {
        let state = self.state.lock();
        let throttle = state.throttle.factor_at(now, &self.config);
        let usage = |budget: &TokenBudget| BudgetUsage {
            consumed: budget.consumed_at(now),
            effective_capacity: self.effective_capacity(budget.capacity(), throttle),
            nominal_capacity: budget.capacity(),
            window_ms: budget.window().as_millis() as u64,
        };

        GateUtilization {
            short: usage(&state.short),
            long: usage(&state.long),
            throttle_factor: throttle,
            admitted_total: state.admitted_total,
            denied_total: state.denied_total,
            rejections_total: state.rejections_total,
        }
    }

    fn settle_throttle(&self, state: &mut GateState, now: Instant) {
        if state.throttle.last_rejection.is_some()
            && state.throttle.factor_at(now, &self.config) <= 1.0
        {
            state.throttle = Throttle {
                peak: 1.0,
                last_rejection: None,
            };
            info!("adaptive throttle fully recovered");
        }
    }
}
