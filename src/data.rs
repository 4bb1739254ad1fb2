use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::frame;

/// A position observation in drone-frame coordinates, before filtering.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct RawSample {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub timestamp: f64, // seconds on the session clock
    pub marker_count: u32,
}

impl RawSample {
    pub fn new(position: Vector3<f64>, timestamp: f64, marker_count: u32) -> Self {
        Self {
            x: position.x,
            y: position.y,
            z: position.z,
            timestamp,
            marker_count,
        }
    }

    pub fn position(&self) -> Vector3<f64> {
        Vector3::new(self.x, self.y, self.z)
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.x, self.y, self.z]
    }
}

/// Which tracked source produced an observation.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    RigidBody,
    Markers,
    #[default]
    None,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::RigidBody => "rigid_body",
            Source::Markers => "markers",
            Source::None => "none",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pose of the tracked rigid body, already rotated into the drone frame.
///
/// `quality` is derived from the tracking error and validity when the pose is
/// built and cannot be set directly.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidBodyPose {
    pub position: RawSample,
    pub orientation: [f64; 4], // (x, y, z, w) as reported by the capture system
    pub euler_rad: [f64; 3],   // roll, pitch, yaw
    pub euler_deg: [f64; 3],
    pub tracking_valid: bool,
    /// Mean marker residual in metres. `None` means the capture system did not
    /// report one, which counts as zero error.
    pub error: Option<f64>,
    pub marker_count: u32,
    quality: f64,
}

impl RigidBodyPose {
    pub const MIN_QUALITY: f64 = 0.05;

    pub fn new(
        position: RawSample,
        orientation: [f64; 4],
        tracking_valid: bool,
        error: Option<f64>,
        marker_count: u32,
    ) -> Self {
        let euler_rad = frame::quaternion_to_euler(orientation);
        let euler_deg = euler_rad.map(f64::to_degrees);
        Self {
            position,
            orientation,
            euler_rad,
            euler_deg,
            tracking_valid,
            error,
            marker_count,
            quality: Self::derive_quality(tracking_valid, error),
        }
    }

    fn derive_quality(tracking_valid: bool, error: Option<f64>) -> f64 {
        let mut quality = match error {
            Some(e) => 1.0 / (1.0 + e.max(0.0)),
            None => 1.0,
        };
        if !tracking_valid {
            quality *= 0.5;
        }
        quality.clamp(Self::MIN_QUALITY, 1.0)
    }

    pub fn quality(&self) -> f64 {
        self.quality
    }
}

/// The single authoritative observation chosen for one mocap frame.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FusedObservation {
    pub position: RawSample,
    pub source: Source,
    pub tracking_valid: bool,
    /// Rigid-body quality in [0.05, 1]; `None` for marker centroids.
    pub quality_weight: Option<f64>,
    /// Rigid-body residual; `None` when not measured.
    pub rigid_body_error: Option<f64>,
    pub marker_count: u32,
}

/// Output of the position filter for one observation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FilterResult {
    pub filtered_position: RawSample,
    pub raw_position: RawSample,
    pub is_outlier: bool,
    pub used_prediction: bool,
    pub confidence: f64,
    pub consecutive_outliers: u32,
    pub threshold: f64,
    pub tracking_valid: bool,
    pub rigid_body_error: Option<f64>,
    pub source: Source,
    pub marker_count: u32,
}

/// Roll/pitch reference sent to the flight controller, in radians.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct ControlCommand {
    pub roll_rad: f64,
    pub pitch_rad: f64,
}

impl ControlCommand {
    pub fn new(roll_rad: f64, pitch_rad: f64) -> Self {
        Self { roll_rad, pitch_rad }
    }

    pub fn level() -> Self {
        Self::default()
    }

    pub fn scaled(self, factor: f64) -> Self {
        Self {
            roll_rad: self.roll_rad * factor,
            pitch_rad: self.pitch_rad * factor,
        }
    }

    pub fn roll_deg(&self) -> f64 {
        self.roll_rad.to_degrees()
    }

    pub fn pitch_deg(&self) -> f64 {
        self.pitch_rad.to_degrees()
    }
}

/// Hover session lifecycle.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq, Default)]
pub enum HoverState {
    #[default]
    Idle,
    Connecting,
    Armed,
    Landing,
}

/// One labeled marker as delivered by the capture client, in capture axes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct MarkerData {
    pub position: [f64; 3],
}

/// One rigid body as delivered by the capture client, in capture axes.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RigidBodyData {
    pub id: i32,
    pub position: [f64; 3],
    pub orientation: [f64; 4], // (x, y, z, w)
    pub tracking_valid: bool,
    #[serde(default)]
    pub error: Option<f64>,
    #[serde(default)]
    pub markers: Vec<MarkerData>,
}

/// Per-frame payload handed to the core by the capture client.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct MocapFrame {
    pub frame_number: u64,
    #[serde(default)]
    pub rigid_bodies: Option<Vec<RigidBodyData>>,
    #[serde(default)]
    pub labeled_markers: Option<Vec<MarkerData>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sample() -> RawSample {
        RawSample::new(Vector3::new(0.0, 0.0, 1.0), 0.0, 4)
    }

    #[test]
    fn test_quality_is_one_for_clean_pose() {
        let pose = RigidBodyPose::new(sample(), [0.0, 0.0, 0.0, 1.0], true, Some(0.0), 4);
        assert_relative_eq!(pose.quality(), 1.0);

        let unmeasured = RigidBodyPose::new(sample(), [0.0, 0.0, 0.0, 1.0], true, None, 4);
        assert_relative_eq!(unmeasured.quality(), 1.0);
    }

    #[test]
    fn test_quality_penalises_error_and_lost_tracking() {
        let pose = RigidBodyPose::new(sample(), [0.0, 0.0, 0.0, 1.0], false, Some(1.0), 4);
        assert_relative_eq!(pose.quality(), 0.25);

        // negative residuals are treated as zero
        let pose = RigidBodyPose::new(sample(), [0.0, 0.0, 0.0, 1.0], true, Some(-3.0), 4);
        assert_relative_eq!(pose.quality(), 1.0);
    }

    #[test]
    fn test_quality_floor() {
        let pose = RigidBodyPose::new(sample(), [0.0, 0.0, 0.0, 1.0], false, Some(1e6), 4);
        assert_relative_eq!(pose.quality(), RigidBodyPose::MIN_QUALITY);
    }

    #[test]
    fn test_command_scale() {
        let half = ControlCommand::new(0.087, -0.087).scaled(0.5);
        assert_relative_eq!(half.roll_rad, 0.0435);
        assert_relative_eq!(half.pitch_rad, -0.0435);
        assert_eq!(ControlCommand::level(), ControlCommand::new(0.0, 0.0));
    }

    #[test]
    fn test_frame_deserializes_without_optional_lists() {
        let frame: MocapFrame = serde_json::from_str(r#"{"frame_number": 7}"#).unwrap();
        assert_eq!(frame.frame_number, 7);
        assert!(frame.rigid_bodies.is_none());
        assert!(frame.labeled_markers.is_none());
    }
}
