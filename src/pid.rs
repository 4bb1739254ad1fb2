//! Dual-axis position PID.
//!
//! Each axis has a low-pass filtered derivative, a leaky integrator that only
//! accumulates near the setpoint on trusted data, and an anomaly mode in which
//! accumulation stops and the derivative is frozen and damped.

use serde::{Deserialize, Serialize};

use crate::config::PidConfig;
use crate::data::ControlCommand;

/// dt used on the first call, when there is no previous timestamp.
const NOMINAL_DT: f64 = 0.01;

/// Calls closer together than this return the previous output unchanged.
const MIN_DT: f64 = 0.001;

/// Derivative scale while data is untrusted or an anomaly is active.
const DERIVATIVE_DAMPING: f64 = 0.3;

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl PidGains {
    pub fn negated(self) -> Self {
        Self {
            kp: -self.kp,
            ki: -self.ki,
            kd: -self.kd,
        }
    }
}

/// Contribution of each term to the last output, before clamping.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct PidTerms {
    pub p: f64,
    pub i: f64,
    pub d: f64,
}

#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct AxisTerms {
    pub roll: PidTerms,
    pub pitch: PidTerms,
}

#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct AxisState {
    pub integrator: f64,
    pub previous_error: Option<f64>,
    pub previous_filtered_derivative: f64,
    pub last_time: Option<f64>,
    pub anomaly: bool,
    recovery_remaining: u32,
    last_terms: PidTerms,
    last_output: f64,
}

/// Single-axis controller.
#[derive(Clone, Debug)]
pub struct AxisPid {
    gains: PidGains,
    config: PidConfig,
    state: AxisState,
}

impl AxisPid {
    pub fn new(gains: PidGains, config: PidConfig) -> Self {
        Self {
            gains,
            config,
            state: AxisState::default(),
        }
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        if gains.ki == 0.0 {
            self.state.integrator = 0.0;
        }
        self.gains = gains;
    }

    pub fn state(&self) -> &AxisState {
        &self.state
    }

    pub fn terms(&self) -> PidTerms {
        self.state.last_terms
    }

    pub fn reset(&mut self) {
        self.state = AxisState::default();
    }

    /// Scale the integrator down without touching the rest of the state.
    pub fn soft_reset_integral(&mut self, factor: f64) {
        self.state.integrator *= factor;
        self.state.last_terms.i = self.gains.ki * self.state.integrator;
    }

    pub fn set_anomaly(&mut self, active: bool) {
        let state = &mut self.state;
        if active && !state.anomaly {
            state.anomaly = true;
            state.recovery_remaining = 0;
        } else if !active && state.anomaly {
            state.anomaly = false;
            state.recovery_remaining = self.config.anomaly_recovery_ticks;
        }
    }

    /// Compute the clamped output for `error` at time `now` (seconds).
    pub fn compute(&mut self, error: f64, now: f64, data_valid: bool) -> f64 {
        let dt = match self.state.last_time {
            Some(last) => now - last,
            None => NOMINAL_DT,
        };
        if dt < MIN_DT {
            return self.state.last_output;
        }

        let limit = self.config.output_limit.abs();
        let state = &mut self.state;

        // derivative: frozen while an anomaly is active
        let raw_derivative = match state.previous_error {
            Some(previous) => (error - previous) / dt,
            None => 0.0,
        };
        if !state.anomaly {
            let alpha = self.config.d_filter_alpha;
            state.previous_filtered_derivative =
                alpha * state.previous_filtered_derivative + (1.0 - alpha) * raw_derivative;
        }
        let derivative = if state.anomaly || !data_valid {
            state.previous_filtered_derivative * DERIVATIVE_DAMPING
        } else {
            state.previous_filtered_derivative
        };

        let i_term = if self.config.enable_i_control {
            let suspended = state.anomaly || state.recovery_remaining > 0;
            state.recovery_remaining = state.recovery_remaining.saturating_sub(1);

            let accumulate =
                !suspended && data_valid && error.abs() < self.config.i_update_threshold;
            state.integrator *= self.config.i_decay_rate;
            if accumulate {
                state.integrator += error * dt;
            }

            // tighter bound the further we are from the setpoint
            if self.gains.ki != 0.0 {
                let max_integral = (limit / self.gains.ki).abs() * (-2.0 * error.abs()).exp();
                state.integrator = state.integrator.clamp(-max_integral, max_integral);
            }
            self.gains.ki * state.integrator
        } else {
            0.0
        };

        let terms = PidTerms {
            p: self.gains.kp * error,
            i: i_term,
            d: self.gains.kd * derivative,
        };
        let output = (terms.p + terms.i + terms.d).clamp(-limit, limit);

        state.previous_error = Some(error);
        state.last_time = Some(now);
        state.last_terms = terms;
        state.last_output = output;
        output
    }
}

/// Roll and pitch controllers sharing one configuration.
///
/// Roll acts on the drone-frame x error with the configured gains; pitch acts
/// on the y error with the gains negated. Tilting changes the direction of
/// the resulting acceleration, so swapping either sign makes the loop diverge.
#[derive(Clone, Debug)]
pub struct DualAxisPid {
    roll: AxisPid,
    pitch: AxisPid,
}

impl DualAxisPid {
    pub fn new(config: &PidConfig) -> Self {
        let gains = PidGains {
            kp: config.kp,
            ki: config.ki,
            kd: config.kd,
        };
        Self {
            roll: AxisPid::new(gains, config.clone()),
            pitch: AxisPid::new(gains.negated(), config.clone()),
        }
    }

    pub fn compute(&mut self, error_x: f64, error_y: f64, now: f64, data_valid: bool) -> ControlCommand {
        ControlCommand {
            roll_rad: self.roll.compute(error_x, now, data_valid),
            pitch_rad: self.pitch.compute(error_y, now, data_valid),
        }
    }

    pub fn reset(&mut self) {
        self.roll.reset();
        self.pitch.reset();
    }

    pub fn set_anomaly(&mut self, active: bool) {
        self.roll.set_anomaly(active);
        self.pitch.set_anomaly(active);
    }

    pub fn anomaly(&self) -> bool {
        self.roll.state().anomaly
    }

    pub fn soft_reset_integral(&mut self, factor: f64) {
        self.roll.soft_reset_integral(factor);
        self.pitch.soft_reset_integral(factor);
    }

    /// Set roll gains; pitch takes the negated values.
    pub fn set_gains(&mut self, gains: PidGains) {
        self.roll.set_gains(gains);
        self.pitch.set_gains(gains.negated());
    }

    pub fn terms(&self) -> AxisTerms {
        AxisTerms {
            roll: self.roll.terms(),
            pitch: self.pitch.terms(),
        }
    }

    pub fn roll(&self) -> &AxisPid {
        &self.roll
    }

    pub fn pitch(&self) -> &AxisPid {
        &self.pitch
    }
}
