//! Adaptive processing interval.
//!
//! The interval slides between `min_interval` and `max_interval` with the
//! observed message rate: quiet streams are flushed quickly, bursts are
//! batched. All inputs are explicit timestamps so the behaviour is a pure
//! function of the observation sequence.
//!
//! Messages are observed in arrival batches (everything extracted from one
//! transport chunk shares a timestamp). The rate is measured as messages per
//! elapsed time over windows of at least [`RATE_WINDOW`], so a batch never
//! reads as a run of zero-gap arrivals.

use std::time::{Duration, Instant};

use crate::config::PacingConfig;

/// Weight of a closed window's rate in the smoothed rate.
const RATE_SMOOTHING: f64 = 0.2;

/// Shortest span a rate measurement covers.
pub const RATE_WINDOW: Duration = Duration::from_millis(100);

/// Rolling rate and cost measurement.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct VelocitySample {
    pub messages_per_second: f64,
    pub last_processing_duration: Duration,
}

/// Computes the processing interval from observed traffic.
#[derive(Debug, Clone)]
pub struct AdaptivePacer {
    min_interval: Duration,
    max_interval: Duration,
    decay_factor: f64,
    low_rate: f64,
    high_rate: f64,
    sample: VelocitySample,
    interval: Duration,
    last_message: Option<Instant>,
    window_start: Option<Instant>,
    window_messages: u64,
}

impl AdaptivePacer {
    pub fn new(cfg: &PacingConfig) -> Self {
        let min_interval = cfg.min_interval;
        let max_interval = cfg.max_interval.max(min_interval);
        Self {
            min_interval,
            max_interval,
            decay_factor: cfg.decay_factor.clamp(0.0, 0.99),
            low_rate: cfg.low_rate,
            high_rate: cfg.high_rate.max(cfg.low_rate + f64::EPSILON),
            sample: VelocitySample::default(),
            interval: min_interval,
            last_message: None,
            window_start: None,
            window_messages: 0,
        }
    }

    /// Current processing interval.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sample(&self) -> VelocitySample {
        self.sample
    }

    /// Records a batch of `messages` processed at `at` and recomputes the
    /// interval. `processing` is the cost of the most expensive message in
    /// the batch.
    pub fn observe(&mut self, at: Instant, messages: u64, processing: Duration) -> Duration {
        if messages == 0 {
            return self.interval;
        }

        self.window_start.get_or_insert(at);
        self.window_messages += messages;
        self.roll_window(at);

        self.last_message = Some(at);
        self.sample.last_processing_duration = processing;

        self.blend_toward(self.target())
    }

    /// Periodic update without a message. Closed windows keep feeding the
    /// rate estimate, and once the stream has been quiet for longer than
    /// `max_interval` the interval drifts back toward `min_interval`.
    pub fn tick(&mut self, now: Instant) -> Duration {
        let Some(prev) = self.last_message else {
            return self.blend_toward(self.min_interval);
        };

        self.roll_window(now);
        if now.saturating_duration_since(prev) < self.max_interval {
            return self.interval;
        }

        self.sample.last_processing_duration = Duration::ZERO;
        self.blend_toward(self.target())
    }

    /// Closes the measurement window once it spans [`RATE_WINDOW`].
    fn roll_window(&mut self, now: Instant) {
        let Some(start) = self.window_start else {
            return;
        };
        let elapsed = now.saturating_duration_since(start);
        if elapsed < RATE_WINDOW {
            return;
        }

        let rate = self.window_messages as f64 / elapsed.as_secs_f64();
        self.sample.messages_per_second +=
            RATE_SMOOTHING * (rate - self.sample.messages_per_second);
        self.window_start = Some(now);
        self.window_messages = 0;
    }

    fn target(&self) -> Duration {
        let pressure = ((self.sample.messages_per_second - self.low_rate)
            / (self.high_rate - self.low_rate))
            .clamp(0.0, 1.0);
        let span = self.max_interval - self.min_interval;
        let by_rate = self.min_interval + span.mul_f64(pressure);

        // Never schedule tighter than the work itself can keep up with.
        let by_cost = self
            .sample
            .last_processing_duration
            .saturating_mul(2)
            .min(self.max_interval);

        by_rate.max(by_cost)
    }

    fn blend_toward(&mut self, target: Duration) -> Duration {
        let secs = self.interval.as_secs_f64() * self.decay_factor
            + target.as_secs_f64() * (1.0 - self.decay_factor);
        self.interval = Duration::from_secs_f64(secs).clamp(self.min_interval, self.max_interval);
        self.interval
    }
}
