//! Configuration for a satellite process.

use rand::Rng;
use std::time::Duration;

/// How a foreign key is repaired when its referenced row is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompensationPolicy {
    /// Null the referencing column and keep the row.
    #[default]
    SetNull,
    /// Delete the referencing row, recursing through its own dependants.
    /// Columns written after the parent delete survive and are nulled.
    Cascade,
}

/// Configuration for a satellite process.
#[derive(Debug, Clone)]
pub struct SatelliteConfig {
    /// Logical database name; the registry key.
    pub db_name: String,
    /// Client id override. Generated and persisted on first start if unset.
    pub client_id: Option<String>,
    /// Token presented to the peer.
    pub token: String,
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Whether a `BehindWindow` refusal clears local shape data and resyncs.
    pub clear_on_behind_window: bool,
    /// Maximum transactions read from the oplog per outbound batch.
    pub outbound_batch_size: usize,
    /// Time allowed for each handshake response.
    pub handshake_timeout: Duration,
    /// Time allowed for a subscription to be fulfilled once sent.
    pub shape_delivery_timeout: Duration,
    /// Foreign key compensation policy.
    pub compensation: CompensationPolicy,
}

impl SatelliteConfig {
    /// Creates a configuration for the named database.
    pub fn new(db_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            client_id: None,
            token: String::new(),
            backoff: BackoffConfig::default(),
            clear_on_behind_window: true,
            outbound_batch_size: 50,
            handshake_timeout: Duration::from_secs(10),
            shape_delivery_timeout: Duration::from_secs(60),
            compensation: CompensationPolicy::default(),
        }
    }

    /// Sets a fixed client id.
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Sets the auth token.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Sets the backoff configuration.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Sets whether `BehindWindow` triggers a local reset and resync.
    pub fn with_clear_on_behind_window(mut self, clear: bool) -> Self {
        self.clear_on_behind_window = clear;
        self
    }

    /// Sets the outbound batch size.
    pub fn with_outbound_batch_size(mut self, size: usize) -> Self {
        self.outbound_batch_size = size.max(1);
        self
    }

    /// Sets the handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the shape delivery timeout.
    pub fn with_shape_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.shape_delivery_timeout = timeout;
        self
    }

    /// Sets the foreign key compensation policy.
    pub fn with_compensation(mut self, policy: CompensationPolicy) -> Self {
        self.compensation = policy;
        self
    }
}

/// Exponential reconnection backoff with full jitter.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Maximum connection attempts before giving up.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Draw each delay uniformly from `[0, bound]` instead of using the bound.
    pub jitter: bool,
}

impl BackoffConfig {
    /// Creates a configuration with the given attempt limit.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            multiplier: 2.0,
            jitter: true,
        }
    }

    /// A single attempt with no waiting.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables or disables jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Upper bound of the delay before `attempt` (0-indexed, first is free).
    pub fn delay_bound(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base = self.initial_delay.as_secs_f64() * self.growth().powi(exponent);
        if base.is_nan() {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(base.min(self.max_delay.as_secs_f64())).unwrap_or(self.max_delay)
    }

    // Delays never shrink between attempts.
    fn growth(&self) -> f64 {
        if self.multiplier.is_nan() {
            1.0
        } else {
            self.multiplier.clamp(1.0, f64::MAX)
        }
    }

    /// Delay before `attempt`, with jitter applied when enabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let bound = self.delay_bound(attempt);
        if !self.jitter || bound.is_zero() {
            return bound;
        }
        let secs = rand::thread_rng().gen_range(0.0..=bound.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::new(50)
    }
}
