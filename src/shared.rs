//! State shared between the mocap callback and the control thread.
//!
//! The callback publishes a complete [`Snapshot`] per frame and the control
//! loop copies it out; both sides hold the one mutex only for the copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use crate::data::{FilterResult, RigidBodyPose, Source};

/// Counters maintained by the frame pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct FrameStats {
    pub total_frames: u64,
    pub frames_without_data: u64,
    pub outliers_detected: u64,
    pub predictions_used: u64,
}

/// Everything the control loop needs from one mocap frame.
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct Snapshot {
    /// Latest filter output; `None` until the first usable frame.
    pub result: Option<FilterResult>,
    pub frame_number: u64,
    pub marker_count: u32,
    pub source: Source,
    /// Set when the newest frame had no usable source. `result` then still
    /// holds the last known position.
    pub no_data: bool,
    /// Most recent pose of the tracked rigid body, for telemetry.
    pub rigid_body: Option<RigidBodyPose>,
    pub stats: FrameStats,
}

impl Snapshot {
    pub fn has_position(&self) -> bool {
        self.result.is_some()
    }
}

#[derive(Default)]
pub struct SharedState {
    inner: Mutex<Snapshot>,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Snapshot {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot under the lock via `update`.
    pub fn publish(&self, update: impl FnOnce(&mut Snapshot)) {
        let mut snapshot = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        update(&mut snapshot);
    }

    pub fn has_position(&self) -> bool {
        self.snapshot().has_position()
    }
}

/// Cooperative stop signal checked once per control tick.
#[derive(Clone, Default, Debug)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Monotonic seconds since the controller was created, shared by the
/// producer and consumer so filter and PID timestamps agree.
#[derive(Clone, Copy, Debug)]
pub struct Clock {
    epoch: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
