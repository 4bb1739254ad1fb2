//! Producer side: turns mocap frames into published filter results.

use log::{info, warn};
use std::sync::{Arc, Mutex, PoisonError};

use crate::config::HoverConfig;
use crate::data::{MocapFrame, Source};
use crate::filter::{FilterStatistics, PositionFilter};
use crate::fusion::fuse_frame;
use crate::shared::{Clock, FrameStats, SharedState};

const FRAME_LOG_INTERVAL: u64 = 10;

/// Handle given to the mocap client. Clones share the filter and the
/// published snapshot, so it can be moved into a receive thread.
#[derive(Clone)]
pub struct FramePipeline {
    filter: Arc<Mutex<PositionFilter>>,
    shared: Arc<SharedState>,
    body_id: i32,
    clock: Clock,
}

impl FramePipeline {
    pub fn new(config: &HoverConfig, clock: Clock) -> Self {
        Self {
            filter: Arc::new(Mutex::new(PositionFilter::new(config.filter.clone()))),
            shared: Arc::new(SharedState::new()),
            body_id: config.fusion.rigid_body_id,
            clock,
        }
    }

    pub fn shared(&self) -> &Arc<SharedState> {
        &self.shared
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    /// Mocap callback entry point, stamped with the session clock.
    pub fn on_frame(&self, frame: &MocapFrame) {
        self.on_frame_at(frame, self.clock.now());
    }

    pub fn on_frame_at(&self, frame: &MocapFrame, timestamp: f64) {
        let (observation, pose) = fuse_frame(frame, self.body_id, timestamp);
        let result = observation.map(|observation| {
            self.filter
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .process(&observation)
        });

        let mut stats = FrameStats::default();
        self.shared.publish(|snapshot| {
            snapshot.frame_number = frame.frame_number;
            snapshot.stats.total_frames += 1;
            // attitude describes this frame only, never a body seen earlier
            snapshot.rigid_body = pose;
            match result {
                Some(result) => {
                    if result.is_outlier {
                        snapshot.stats.outliers_detected += 1;
                    }
                    if result.used_prediction {
                        snapshot.stats.predictions_used += 1;
                    }
                    snapshot.result = Some(result);
                    snapshot.marker_count = result.marker_count;
                    snapshot.source = result.source;
                    snapshot.no_data = false;
                }
                None => {
                    snapshot.stats.frames_without_data += 1;
                    snapshot.source = Source::None;
                    snapshot.marker_count = 0;
                    snapshot.no_data = true;
                }
            }
            stats = snapshot.stats;
        });

        if result.is_none() && stats.frames_without_data % 100 == 1 {
            warn!(
                "frame {}: no rigid body or markers ({} empty frames)",
                frame.frame_number, stats.frames_without_data
            );
        }
        if stats.total_frames % FRAME_LOG_INTERVAL == 0 {
            if let Some(result) = result {
                let p = result.filtered_position;
                info!(
                    "frame {} via {}: pos=({:.3}, {:.3}, {:.3}) conf={:.2} threshold={:.3} outliers={} predictions={}",
                    frame.frame_number,
                    result.source,
                    p.x,
                    p.y,
                    p.z,
                    result.confidence,
                    result.threshold,
                    stats.outliers_detected,
                    stats.predictions_used,
                );
            }
        }
    }

    /// Clears filter history. The last published result stays visible until
    /// the next frame replaces it.
    pub fn reset_filter(&self) {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset();
    }

    pub fn filter_statistics(&self) -> FilterStatistics {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .statistics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{MarkerData, RigidBodyData};
    use approx::assert_relative_eq;

    fn body_frame(n: u64, capture: [f64; 3]) -> MocapFrame {
        MocapFrame {
            frame_number: n,
            rigid_bodies: Some(vec![RigidBodyData {
                id: 1,
                position: capture,
                orientation: [0.0, 0.0, 0.0, 1.0],
                tracking_valid: true,
                error: Some(0.0),
                markers: vec![MarkerData { position: [0.0; 3] }; 4],
            }]),
            labeled_markers: None,
        }
    }

    #[test]
    fn test_publishes_filtered_result() {
        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        pipeline.on_frame_at(&body_frame(1, [0.02, 1.0, -0.01]), 0.01);

        let snapshot = pipeline.shared().snapshot();
        let result = snapshot.result.unwrap();
        assert_eq!(snapshot.frame_number, 1);
        assert_eq!(snapshot.source, Source::RigidBody);
        assert!(snapshot.rigid_body.is_some());
        assert!(!snapshot.no_data);
        assert_relative_eq!(result.filtered_position.x, -0.01);
        assert_relative_eq!(result.filtered_position.y, 0.02);
        assert_relative_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_empty_frame_keeps_last_position() {
        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        pipeline.on_frame_at(&body_frame(1, [0.02, 1.0, -0.01]), 0.01);
        let before = pipeline.shared().snapshot().result;

        pipeline.on_frame_at(
            &MocapFrame {
                frame_number: 2,
                ..Default::default()
            },
            0.02,
        );
        let snapshot = pipeline.shared().snapshot();
        assert!(snapshot.no_data);
        assert_eq!(snapshot.source, Source::None);
        assert_eq!(snapshot.result, before);
        assert!(snapshot.rigid_body.is_none());
        assert_eq!(snapshot.stats.frames_without_data, 1);
        assert_eq!(snapshot.stats.total_frames, 2);
    }

    #[test]
    fn test_lost_body_clears_pose() {
        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        pipeline.on_frame_at(&body_frame(1, [0.02, 1.0, -0.01]), 0.01);
        assert!(pipeline.shared().snapshot().rigid_body.is_some());

        let markers_only = MocapFrame {
            frame_number: 2,
            rigid_bodies: None,
            labeled_markers: Some(vec![MarkerData { position: [0.02, 1.0, -0.01] }; 4]),
        };
        pipeline.on_frame_at(&markers_only, 0.02);

        let snapshot = pipeline.shared().snapshot();
        assert_eq!(snapshot.source, Source::Markers);
        assert!(snapshot.result.is_some());
        assert!(snapshot.rigid_body.is_none());
    }

    #[test]
    fn test_outlier_counted() {
        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        for n in 0..5u64 {
            pipeline.on_frame_at(&body_frame(n, [0.0, 1.0, 0.0]), 0.01 * (n + 1) as f64);
        }
        pipeline.on_frame_at(&body_frame(5, [0.0, 1.0, 0.9]), 0.06);

        let snapshot = pipeline.shared().snapshot();
        let result = snapshot.result.unwrap();
        assert!(result.is_outlier);
        assert_eq!(snapshot.stats.outliers_detected, 1);
        assert_eq!(pipeline.filter_statistics().outlier_samples, 1);
    }
}
