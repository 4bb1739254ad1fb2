//! Position filtering for motion-capture samples.
//!
//! Rejects jumps against the last accepted position, smooths accepted samples
//! with a recency-weighted moving average, predicts through rejected samples
//! from a short velocity estimate, and scores every output with a confidence
//! in `[0, 1]`.

use nalgebra::Vector3;
use std::collections::VecDeque;

use crate::config::FilterConfig;
use crate::data::{FilterResult, FusedObservation, RawSample, Source};

/// Lowest adaptive threshold ever used, in metres.
pub const MIN_THRESHOLD_FLOOR: f64 = 0.02;

/// Lower bound of the adaptive threshold for a given base threshold.
pub fn min_threshold(base: f64) -> f64 {
    MIN_THRESHOLD_FLOOR.max(base * 0.5)
}

/// Confidence of an outlier frame before the other factors apply.
const OUTLIER_BASE_CONFIDENCE: f64 = 0.35;

/// Each additional consecutive outlier multiplies confidence by this.
const OUTLIER_STREAK_DECAY: f64 = 0.8;

/// Markers needed for full marker-count confidence.
const FULL_MARKER_COUNT: u32 = 4;

/// Snapshot of the filter's running statistics.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterStatistics {
    pub total_samples: u64,
    pub outlier_samples: u64,
    pub outlier_rate: f64,
    pub current_threshold: f64,
    pub consecutive_outliers: u32,
    pub estimated_velocity: Vector3<f64>,
    pub last_confidence: f64,
    pub last_source: Option<Source>,
}

#[derive(Clone, Copy, Debug)]
struct Accepted {
    time: f64,
    position: Vector3<f64>,
}

pub struct PositionFilter {
    config: FilterConfig,
    min_threshold: f64,
    max_threshold: f64,

    history: VecDeque<Vector3<f64>>,
    velocity_history: VecDeque<Accepted>,
    last_accepted: Option<Accepted>,
    last_filtered: Option<Vector3<f64>>,
    last_prediction: Option<Vector3<f64>>,
    velocity: Vector3<f64>,

    // motion statistics feeding the adaptive threshold
    velocity_magnitude_ema: f64,
    step_distance_ema: f64,
    dt_ema: Option<f64>,
    dynamic_threshold: f64,

    consecutive_outliers: u32,
    total_samples: u64,
    outlier_samples: u64,
    last_confidence: f64,
    last_source: Option<Source>,
}

impl PositionFilter {
    pub fn new(config: FilterConfig) -> Self {
        let base = config.outlier_threshold;
        let min_threshold = min_threshold(base);
        Self {
            min_threshold,
            // never below the floor, so the clamp range cannot invert
            max_threshold: base.max(config.max_outlier_threshold).max(min_threshold),
            history: VecDeque::with_capacity(config.window_size),
            velocity_history: VecDeque::with_capacity(config.velocity_window),
            last_accepted: None,
            last_filtered: None,
            last_prediction: None,
            velocity: Vector3::zeros(),
            velocity_magnitude_ema: 0.0,
            step_distance_ema: 0.0,
            dt_ema: None,
            dynamic_threshold: base,
            consecutive_outliers: 0,
            total_samples: 0,
            outlier_samples: 0,
            last_confidence: 1.0,
            last_source: None,
            config,
        }
    }

    /// Return to the freshly-constructed state. Statistics are kept.
    pub fn reset(&mut self) {
        self.history.clear();
        self.velocity_history.clear();
        self.last_accepted = None;
        self.last_filtered = None;
        self.last_prediction = None;
        self.velocity = Vector3::zeros();
        self.velocity_magnitude_ema = 0.0;
        self.step_distance_ema = 0.0;
        self.dt_ema = None;
        self.dynamic_threshold = self.config.outlier_threshold;
        self.consecutive_outliers = 0;
        self.last_confidence = 1.0;
        self.last_source = None;
    }

    pub fn consecutive_outliers(&self) -> u32 {
        self.consecutive_outliers
    }

    pub fn last_prediction(&self) -> Option<Vector3<f64>> {
        self.last_prediction
    }

    /// Filter one observation. Timestamps must be strictly increasing.
    pub fn process(&mut self, observation: &FusedObservation) -> FilterResult {
        self.total_samples += 1;
        self.last_source = Some(observation.source);

        let raw = observation.position;
        let position = raw.position();
        let now = raw.timestamp;

        let Some(last) = self.last_accepted else {
            // nothing to compare against yet, so the first sample always goes in
            self.admit(now, position);
            self.last_filtered = Some(position);
            let threshold = self.config.outlier_threshold;
            self.dynamic_threshold = threshold;
            let confidence = score_confidence(observation, false, 0);
            return self.finish(observation, position, false, false, confidence, threshold);
        };

        let dt = now - last.time;
        let threshold = self.effective_threshold(dt, observation);
        let distance = (position - last.position).norm();

        if distance > threshold {
            self.consecutive_outliers += 1;
            self.outlier_samples += 1;

            let (filtered, used_prediction) = if self.config.enable_prediction {
                let predicted = last.position + self.velocity * dt.max(0.0);
                self.last_prediction = Some(predicted);
                (predicted, true)
            } else {
                (last.position, false)
            };

            let confidence = score_confidence(observation, true, self.consecutive_outliers);
            return self.finish(observation, filtered, true, used_prediction, confidence, threshold);
        }

        self.consecutive_outliers = 0;
        self.last_prediction = None;
        self.admit(now, position);

        self.velocity = self.estimate_velocity();
        self.velocity_magnitude_ema = 0.7 * self.velocity_magnitude_ema + 0.3 * self.velocity.norm();

        let filtered = self.weighted_average().unwrap_or(position);
        if let Some(previous) = self.last_filtered {
            let step = (filtered - previous).norm();
            self.step_distance_ema = 0.7 * self.step_distance_ema + 0.3 * step;
        }
        self.last_filtered = Some(filtered);

        if dt > 0.0 {
            self.dt_ema = Some(match self.dt_ema {
                Some(ema) => 0.8 * ema + 0.2 * dt,
                None => dt,
            });
        }

        let confidence = score_confidence(observation, false, 0);
        self.finish(observation, filtered, false, false, confidence, threshold)
    }

    pub fn statistics(&self) -> FilterStatistics {
        let outlier_rate = if self.total_samples > 0 {
            self.outlier_samples as f64 / self.total_samples as f64
        } else {
            0.0
        };
        FilterStatistics {
            total_samples: self.total_samples,
            outlier_samples: self.outlier_samples,
            outlier_rate,
            current_threshold: self.dynamic_threshold,
            consecutive_outliers: self.consecutive_outliers,
            estimated_velocity: self.velocity,
            last_confidence: self.last_confidence,
            last_source: self.last_source,
        }
    }

    fn admit(&mut self, time: f64, position: Vector3<f64>) {
        if self.history.len() == self.config.window_size {
            self.history.pop_front();
        }
        self.history.push_back(position);

        if self.velocity_history.len() == self.config.velocity_window {
            self.velocity_history.pop_front();
        }
        self.velocity_history.push_back(Accepted { time, position });
        self.last_accepted = Some(Accepted { time, position });
    }

    fn finish(
        &mut self,
        observation: &FusedObservation,
        filtered: Vector3<f64>,
        is_outlier: bool,
        used_prediction: bool,
        confidence: f64,
        threshold: f64,
    ) -> FilterResult {
        self.last_confidence = confidence;
        let raw = observation.position;
        FilterResult {
            filtered_position: RawSample::new(filtered, raw.timestamp, raw.marker_count),
            raw_position: raw,
            is_outlier,
            used_prediction,
            confidence,
            consecutive_outliers: self.consecutive_outliers,
            threshold,
            tracking_valid: observation.tracking_valid,
            rigid_body_error: observation.rigid_body_error,
            source: observation.source,
            marker_count: observation.marker_count,
        }
    }

    /// Endpoint velocity over the velocity window.
    fn estimate_velocity(&self) -> Vector3<f64> {
        let (Some(first), Some(last)) = (self.velocity_history.front(), self.velocity_history.back())
        else {
            return Vector3::zeros();
        };
        let span = last.time - first.time;
        if self.velocity_history.len() < 2 || span <= 0.0 {
            return self.velocity;
        }
        (last.position - first.position) / span
    }

    /// Exponentially weighted mean of the window, newest sample heaviest.
    fn weighted_average(&self) -> Option<Vector3<f64>> {
        let n = self.history.len();
        if n == 0 {
            return None;
        }
        let mut sum = Vector3::zeros();
        let mut total = 0.0;
        for (i, position) in self.history.iter().enumerate() {
            // weights run from e^-1 (oldest) to e^0 (newest)
            let t = if n > 1 { i as f64 / (n - 1) as f64 } else { 1.0 };
            let weight = (t - 1.0).exp();
            sum += position * weight;
            total += weight;
        }
        Some(sum / total)
    }

    fn effective_threshold(&mut self, dt: f64, observation: &FusedObservation) -> f64 {
        if !self.config.adaptive_threshold {
            self.dynamic_threshold = self.config.outlier_threshold;
            return self.dynamic_threshold;
        }

        let dt = if dt > 0.0 { Some(dt) } else { self.dt_ema };
        let mut adaptive = self.config.outlier_threshold
            + self.step_distance_ema * 2.5
            + dt.map_or(0.0, |dt| self.velocity_magnitude_ema * dt * 1.5);

        adaptive *= 0.9 + 0.2 * marker_ratio(observation.marker_count);
        if !observation.tracking_valid {
            adaptive *= 0.8;
        }
        if let Some(quality) = observation.quality_weight {
            adaptive *= 0.8 + 0.4 * quality.clamp(0.0, 1.2);
        }
        adaptive = adaptive.clamp(self.min_threshold, self.max_threshold);

        self.dynamic_threshold = 0.6 * self.dynamic_threshold + 0.4 * adaptive;
        self.dynamic_threshold
    }
}

fn marker_ratio(marker_count: u32) -> f64 {
    f64::from(marker_count.min(FULL_MARKER_COUNT)) / f64::from(FULL_MARKER_COUNT)
}

/// Product of independent trust factors, each in `[0, 1]` and non-decreasing in
/// the quality of its input. A clean frame (no outlier, valid tracking, four or
/// more markers, full quality, zero error) scores exactly 1.
fn score_confidence(observation: &FusedObservation, is_outlier: bool, consecutive_outliers: u32) -> f64 {
    let ratio = marker_ratio(observation.marker_count);
    let mut confidence = if is_outlier {
        OUTLIER_BASE_CONFIDENCE
            * OUTLIER_STREAK_DECAY.powi(consecutive_outliers.saturating_sub(1) as i32)
            * ratio.max(0.25)
    } else {
        0.7 + 0.3 * ratio
    };

    if !observation.tracking_valid {
        confidence *= if is_outlier { 0.4 } else { 0.7 };
    }
    if let Some(quality) = observation.quality_weight {
        let quality = quality.clamp(0.0, 1.0);
        confidence *= if is_outlier {
            0.5 + 0.5 * quality
        } else {
            quality.max(0.4)
        };
    }
    if let Some(error) = observation.rigid_body_error {
        confidence /= 1.0 + error.max(0.0);
    }

    confidence.clamp(0.0, 1.0)
}
