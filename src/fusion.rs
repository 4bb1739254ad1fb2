//! Chooses one authoritative position per mocap frame.
//!
//! Priority: a tracking-valid rigid body, then the labeled-marker centroid,
//! then a rigid body that lost tracking. Everything handed on is already in
//! drone axes.

use nalgebra::Vector3;

use crate::data::{FusedObservation, MarkerData, MocapFrame, RawSample, RigidBodyPose, Source};
use crate::frame::capture_to_drone;

/// Fewer labeled markers than this marks a centroid as untracked.
pub const MIN_TRACKED_MARKERS: u32 = 3;

/// A position source that can be pulled out of a mocap frame.
pub trait TrackedSource {
    fn observation(&self) -> FusedObservation;
}

/// The configured rigid body, converted to drone axes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RigidBodySource {
    pub pose: RigidBodyPose,
    /// Labeled markers in the whole frame, used when the body reports none.
    frame_marker_count: u32,
}

impl RigidBodySource {
    /// Looks up `body_id` among the frame's rigid bodies.
    pub fn from_frame(frame: &MocapFrame, body_id: i32, timestamp: f64) -> Option<Self> {
        let body = frame.rigid_bodies.as_ref()?.iter().find(|b| b.id == body_id)?;
        let marker_count = body.markers.len() as u32;
        let position = RawSample::new(capture_to_drone(body.position), timestamp, marker_count);
        let pose = RigidBodyPose::new(
            position,
            body.orientation,
            body.tracking_valid,
            body.error,
            marker_count,
        );
        Some(Self {
            pose,
            frame_marker_count: labeled_marker_count(frame),
        })
    }

    pub fn tracking_valid(&self) -> bool {
        self.pose.tracking_valid
    }
}

impl TrackedSource for RigidBodySource {
    fn observation(&self) -> FusedObservation {
        let marker_count = if self.pose.marker_count > 0 {
            self.pose.marker_count
        } else {
            self.frame_marker_count
        };
        let mut position = self.pose.position;
        position.marker_count = marker_count;
        FusedObservation {
            position,
            source: Source::RigidBody,
            tracking_valid: self.pose.tracking_valid,
            quality_weight: Some(self.pose.quality()),
            rigid_body_error: self.pose.error,
            marker_count,
        }
    }
}

/// Unweighted centroid of the frame's labeled markers.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MarkerSource {
    pub centroid: RawSample,
}

impl MarkerSource {
    pub fn from_frame(frame: &MocapFrame, timestamp: f64) -> Option<Self> {
        let markers = frame.labeled_markers.as_deref()?;
        let centroid = centroid(markers)?;
        Some(Self {
            centroid: RawSample::new(capture_to_drone(centroid), timestamp, markers.len() as u32),
        })
    }
}

impl TrackedSource for MarkerSource {
    fn observation(&self) -> FusedObservation {
        FusedObservation {
            position: self.centroid,
            source: Source::Markers,
            tracking_valid: self.centroid.marker_count >= MIN_TRACKED_MARKERS,
            quality_weight: None,
            rigid_body_error: None,
            marker_count: self.centroid.marker_count,
        }
    }
}

/// Mean of the marker positions in capture axes; `None` for no markers.
fn centroid(markers: &[MarkerData]) -> Option<[f64; 3]> {
    if markers.is_empty() {
        return None;
    }
    let sum = markers
        .iter()
        .fold(Vector3::<f64>::zeros(), |acc, m| acc + Vector3::from(m.position));
    let mean = sum / markers.len() as f64;
    Some([mean.x, mean.y, mean.z])
}

fn labeled_marker_count(frame: &MocapFrame) -> u32 {
    frame.labeled_markers.as_ref().map_or(0, |m| m.len() as u32)
}

pub fn select(
    rigid_body: Option<&RigidBodySource>,
    markers: Option<&MarkerSource>,
) -> Option<FusedObservation> {
    match (rigid_body, markers) {
        (Some(body), _) if body.tracking_valid() => Some(body.observation()),
        (_, Some(markers)) => Some(markers.observation()),
        (Some(body), None) => Some(body.observation()),
        (None, None) => None,
    }
}

/// Extracts both candidates from `frame` and applies [`select`].
///
/// The rigid body is returned as well, when present, so its pose can be
/// published for telemetry even if the centroid won.
pub fn fuse_frame(
    frame: &MocapFrame,
    body_id: i32,
    timestamp: f64,
) -> (Option<FusedObservation>, Option<RigidBodyPose>) {
    let rigid_body = RigidBodySource::from_frame(frame, body_id, timestamp);
    let markers = MarkerSource::from_frame(frame, timestamp);
    let observation = select(rigid_body.as_ref(), markers.as_ref());
    (observation, rigid_body.map(|b| b.pose))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RigidBodyData;
    use approx::assert_relative_eq;

    fn marker(x: f64, y: f64, z: f64) -> MarkerData {
        MarkerData { position: [x, y, z] }
    }

    fn body(id: i32, position: [f64; 3], tracking_valid: bool, markers: usize) -> RigidBodyData {
        RigidBodyData {
            id,
            position,
            orientation: [0.0, 0.0, 0.0, 1.0],
            tracking_valid,
            error: Some(0.001),
            markers: vec![marker(0.0, 0.0, 0.0); markers],
        }
    }

    fn five_marker_frame() -> MocapFrame {
        MocapFrame {
            frame_number: 1,
            rigid_bodies: None,
            labeled_markers: Some(vec![
                marker(0.1, 1.0, 0.2),
                marker(0.3, 1.0, 0.4),
                marker(0.2, 0.9, 0.3),
                marker(0.2, 1.1, 0.3),
                marker(0.2, 1.0, 0.3),
            ]),
        }
    }

    #[test]
    fn test_marker_centroid_in_drone_axes() {
        let (observation, pose) = fuse_frame(&five_marker_frame(), 1, 0.5);
        let observation = observation.unwrap();
        assert!(pose.is_none());
        assert_eq!(observation.source, Source::Markers);
        assert!(observation.tracking_valid);
        assert_eq!(observation.marker_count, 5);
        assert!(observation.quality_weight.is_none());
        assert_relative_eq!(observation.position.x, 0.3, epsilon = 1e-12);
        assert_relative_eq!(observation.position.y, 0.2, epsilon = 1e-12);
        assert_relative_eq!(observation.position.z, 1.0, epsilon = 1e-12);
        assert_relative_eq!(observation.position.timestamp, 0.5);
    }

    #[test]
    fn test_few_markers_are_untracked() {
        let frame = MocapFrame {
            frame_number: 2,
            rigid_bodies: None,
            labeled_markers: Some(vec![marker(0.0, 1.0, 0.0), marker(0.2, 1.0, 0.0)]),
        };
        let observation = fuse_frame(&frame, 1, 0.0).0.unwrap();
        assert_eq!(observation.source, Source::Markers);
        assert!(!observation.tracking_valid);
    }

    #[test]
    fn test_tracked_rigid_body_wins() {
        let mut frame = five_marker_frame();
        frame.rigid_bodies = Some(vec![body(1, [0.05, 1.2, -0.04], true, 4)]);
        let (observation, pose) = fuse_frame(&frame, 1, 0.0);
        let observation = observation.unwrap();
        assert!(pose.is_some());
        assert_eq!(observation.source, Source::RigidBody);
        assert!(observation.tracking_valid);
        assert_eq!(observation.marker_count, 4);
        assert_relative_eq!(observation.position.x, -0.04);
        assert_relative_eq!(observation.position.y, 0.05);
        assert_relative_eq!(observation.position.z, 1.2);
        assert!(observation.quality_weight.unwrap() > 0.99);
        assert_eq!(observation.rigid_body_error, Some(0.001));
    }

    #[test]
    fn test_rigid_body_without_markers_uses_frame_count() {
        let mut frame = five_marker_frame();
        frame.rigid_bodies = Some(vec![body(1, [0.0, 1.0, 0.0], true, 0)]);
        let observation = fuse_frame(&frame, 1, 0.0).0.unwrap();
        assert_eq!(observation.marker_count, 5);
    }

    #[test]
    fn test_untracked_rigid_body_loses_to_markers() {
        let mut frame = five_marker_frame();
        frame.rigid_bodies = Some(vec![body(1, [0.5, 1.0, 0.5], false, 4)]);
        let observation = fuse_frame(&frame, 1, 0.0).0.unwrap();
        assert_eq!(observation.source, Source::Markers);
    }

    #[test]
    fn test_untracked_rigid_body_is_last_resort() {
        let frame = MocapFrame {
            frame_number: 3,
            rigid_bodies: Some(vec![body(1, [0.5, 1.0, 0.5], false, 4)]),
            labeled_markers: Some(Vec::new()),
        };
        let observation = fuse_frame(&frame, 1, 0.0).0.unwrap();
        assert_eq!(observation.source, Source::RigidBody);
        assert!(!observation.tracking_valid);
        // quality is halved for lost tracking but still carried
        assert!(observation.quality_weight.unwrap() < 0.51);
        assert_eq!(observation.rigid_body_error, Some(0.001));
    }

    #[test]
    fn test_other_body_ids_are_ignored() {
        let frame = MocapFrame {
            frame_number: 4,
            rigid_bodies: Some(vec![body(7, [0.5, 1.0, 0.5], true, 4)]),
            labeled_markers: None,
        };
        assert_eq!(fuse_frame(&frame, 1, 0.0), (None, None));
    }

    #[test]
    fn test_empty_frame_selects_nothing() {
        assert_eq!(fuse_frame(&MocapFrame::default(), 1, 0.0), (None, None));
        assert!(select(None, None).is_none());
    }
}
