//! Hysteresis controller for the scheduler's batch size.
//!
//! Each dispatched batch reports its wall-clock duration and how many of
//! its requests failed. The controller keeps the most recent samples in a
//! fixed-size window and, at most once per adaptation interval, shrinks the
//! batch when the window is slow or error-prone and grows it when the
//! window is fast and clean.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Error rate under which a fast window may grow the batch.
const GROWTH_MAX_ERROR_RATE: f64 = 0.05;

/// Samples kept after a size change.
const RETAINED_AFTER_CHANGE: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    pub min_batch_size: usize,
    pub max_batch_size: usize,
    pub window: usize,
    pub slow_threshold_secs: f64,
    pub fast_threshold_secs: f64,
    pub error_rate_threshold: f64,
    pub adaptation_interval_secs: u64,
    pub step: usize,
    /// Samples required before the first adjustment.
    pub min_samples: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_batch_size: 5,
            max_batch_size: 50,
            window: 10,
            slow_threshold_secs: 5.0,
            fast_threshold_secs: 2.0,
            error_rate_threshold: 0.1,
            adaptation_interval_secs: 10,
            step: 2,
            min_samples: 5,
        }
    }
}

/// Outcome of one dispatched batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchSample {
    pub duration: Duration,
    pub requests: usize,
    pub failures: usize,
}

#[derive(Debug)]
pub struct AdaptiveController {
    config: AdaptiveConfig,
    batch_size: usize,
    samples: VecDeque<BatchSample>,
    last_adaptation: Instant,
}

impl AdaptiveController {
    pub fn new(initial_batch_size: usize, config: AdaptiveConfig) -> Self {
        Self::starting_at(initial_batch_size, config, Instant::now())
    }

    /// Controller whose adaptation interval is measured from `now`.
    pub fn starting_at(initial_batch_size: usize, config: AdaptiveConfig, now: Instant) -> Self {
        let min = config.min_batch_size.max(1);
        let max = config.max_batch_size.max(min);
        Self {
            batch_size: initial_batch_size.clamp(min, max),
            samples: VecDeque::with_capacity(config.window),
            last_adaptation: now,
            config,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn record(&mut self, sample: BatchSample) -> Option<usize> {
        self.record_at(sample, Instant::now())
    }

    /// Add a sample observed at `now`. Returns the new batch size if it changed.
    pub fn record_at(&mut self, sample: BatchSample, now: Instant) -> Option<usize> {
        self.samples.push_back(sample);
        while self.samples.len() > self.config.window.max(1) {
            self.samples.pop_front();
        }

        let interval = Duration::from_secs(self.config.adaptation_interval_secs);
        if now.saturating_duration_since(self.last_adaptation) < interval {
            return None;
        }
        if self.samples.len() < self.config.min_samples {
            return None;
        }
        self.last_adaptation = now;
        self.adapt()
    }

    fn adapt(&mut self) -> Option<usize> {
        let avg = self.average_latency()?;
        let error_rate = self.error_rate();
        let min = self.config.min_batch_size.max(1);
        let max = self.config.max_batch_size.max(min);

        let slow = avg.as_secs_f64() > self.config.slow_threshold_secs;
        let failing = error_rate > self.config.error_rate_threshold;
        let fast = avg.as_secs_f64() < self.config.fast_threshold_secs;

        let proposed = if slow || failing {
            self.batch_size.saturating_sub(self.config.step).max(min)
        } else if fast && error_rate < GROWTH_MAX_ERROR_RATE {
            (self.batch_size + self.config.step).min(max)
        } else {
            self.batch_size
        };

        if proposed == self.batch_size {
            return None;
        }

        info!(
            from = self.batch_size,
            to = proposed,
            avg_latency_ms = avg.as_millis() as u64,
            error_rate = error_rate,
            "Adaptive batch size adjusted"
        );

        self.batch_size = proposed;
        while self.samples.len() > RETAINED_AFTER_CHANGE {
            self.samples.pop_front();
        }
        Some(proposed)
    }

    pub fn average_latency(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().map(|s| s.duration).sum();
        Some(total / self.samples.len() as u32)
    }

    /// Failed requests over all requests in the window.
    pub fn error_rate(&self) -> f64 {
        let (requests, failures) = self
            .samples
            .iter()
            .fold((0, 0), |(r, f), s| (r + s.requests, f + s.failures));
        if requests == 0 {
            0.0
        } else {
            failures as f64 / requests as f64
        }
    }

    pub fn window_len(&self) -> usize {
        self.samples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(secs: f64, requests: usize, failures: usize) -> BatchSample {
        BatchSample {
            duration: Duration::from_secs_f64(secs),
            requests,
            failures,
        }
    }

    fn feed(ctrl: &mut AdaptiveController, at: Instant, samples: impl IntoIterator<Item = BatchSample>) {
        for s in samples {
            ctrl.record_at(s, at);
        }
    }

    #[test]
    fn ten_slow_batches_shrink_by_one_step() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(10, AdaptiveConfig::default(), start);

        let later = start + Duration::from_secs(11);
        feed(&mut ctrl, later, (0..10).map(|_| sample(6.0, 10, 0)));

        assert_eq!(ctrl.batch_size(), 8);
    }

    #[test]
    fn shrinking_stops_at_min() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(6, AdaptiveConfig::default(), start);

        for round in 1..=5 {
            let at = start + Duration::from_secs(11 * round);
            feed(&mut ctrl, at, (0..10).map(|_| sample(6.0, 10, 0)));
            assert!(ctrl.batch_size() >= 5);
        }
        assert_eq!(ctrl.batch_size(), 5);
    }

    #[test]
    fn ten_fast_clean_batches_grow_until_max() {
        let start = Instant::now();
        let config = AdaptiveConfig {
            max_batch_size: 13,
            ..Default::default()
        };
        let mut ctrl = AdaptiveController::starting_at(10, config, start);

        feed(&mut ctrl, start + Duration::from_secs(11), (0..10).map(|_| sample(0.5, 10, 0)));
        assert_eq!(ctrl.batch_size(), 12);

        feed(&mut ctrl, start + Duration::from_secs(22), (0..10).map(|_| sample(0.5, 10, 0)));
        assert_eq!(ctrl.batch_size(), 13);

        feed(&mut ctrl, start + Duration::from_secs(33), (0..10).map(|_| sample(0.5, 10, 0)));
        assert_eq!(ctrl.batch_size(), 13);
    }

    #[test]
    fn high_error_rate_shrinks_even_when_fast() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(10, AdaptiveConfig::default(), start);

        feed(&mut ctrl, start + Duration::from_secs(11), (0..10).map(|_| sample(0.5, 10, 3)));
        assert_eq!(ctrl.batch_size(), 8);
    }

    #[test]
    fn no_change_inside_interval() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(10, AdaptiveConfig::default(), start);

        feed(&mut ctrl, start + Duration::from_secs(3), (0..10).map(|_| sample(6.0, 10, 0)));
        assert_eq!(ctrl.batch_size(), 10);
    }

    #[test]
    fn size_change_trims_window() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(10, AdaptiveConfig::default(), start);

        feed(&mut ctrl, start + Duration::from_secs(11), (0..5).map(|_| sample(6.0, 10, 0)));
        assert_eq!(ctrl.batch_size(), 8);
        assert_eq!(ctrl.window_len(), 3);
    }

    #[test]
    fn middle_band_holds_size() {
        let start = Instant::now();
        let mut ctrl = AdaptiveController::starting_at(10, AdaptiveConfig::default(), start);

        feed(&mut ctrl, start + Duration::from_secs(11), (0..10).map(|_| sample(3.0, 10, 0)));
        assert_eq!(ctrl.batch_size(), 10);
    }
}
