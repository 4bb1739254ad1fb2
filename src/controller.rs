//! Hover session orchestration and the fixed-rate control loop.
//!
//! Session states run `Idle -> Connecting -> Armed -> Landing -> Idle`. While
//! armed, a dedicated thread reads the latest published snapshot every period,
//! runs the PID, shapes the command by confidence and always transmits one
//! angle frame.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{HoverConfig, LoopConfig};
use crate::data::{ControlCommand, HoverState};
use crate::error::HoverError;
use crate::filter::FilterStatistics;
use crate::mocap::MocapClient;
use crate::pid::DualAxisPid;
use crate::pipeline::FramePipeline;
use crate::protocol::LifecycleCommand;
use crate::shared::{CancellationToken, Clock, SharedState, Snapshot};
use crate::telemetry::{TelemetryRecord, TelemetrySink};
use crate::transport::{ActuatorLink, Transport};

/// Hover setpoint in drone-frame horizontal axes.
pub const TARGET: (f64, f64) = (0.0, 0.0);

/// Below this confidence the sample is not trusted for integration.
const DATA_VALID_CONFIDENCE: f64 = 0.1;
/// Enter anomaly mode below this confidence.
const ANOMALY_ENTER_CONFIDENCE: f64 = 0.3;
/// Leave anomaly mode above this confidence once outliers have stopped.
const ANOMALY_EXIT_CONFIDENCE: f64 = 0.5;
/// Enter anomaly mode after more consecutive outliers than this.
const ANOMALY_OUTLIER_STREAK: u32 = 3;

const PACKET_LOG_INTERVAL: u64 = 20;
const NO_DATA_LOG_INTERVAL: u64 = 100;

/// How often `start` polls for the first position.
const ARM_POLL: Duration = Duration::from_millis(10);

pub type SharedLink = Arc<Mutex<ActuatorLink>>;
pub type SharedSink = Arc<Mutex<Box<dyn TelemetrySink>>>;

/// Confidence taper: level below `floor`, scaled below `full`, else unchanged.
pub fn shape_command(command: ControlCommand, confidence: f64, floor: f64, full: f64) -> ControlCommand {
    if !(confidence >= floor) {
        ControlCommand::level()
    } else if confidence < full {
        command.scaled(confidence)
    } else {
        command
    }
}

/// Whether `snapshot` holds a fix good enough to take off on: tracked, not an
/// outlier and at least `floor` confident.
pub fn can_arm_on(snapshot: &Snapshot, floor: f64) -> bool {
    match snapshot.result {
        Some(result) if !snapshot.no_data => {
            result.tracking_valid && !result.is_outlier && result.confidence >= floor
        }
        _ => false,
    }
}

/// Consumer side of the pipeline. Owned by the control thread while armed and
/// handed back to the controller when the thread exits.
pub struct ControlLoop {
    config: LoopConfig,
    pid: DualAxisPid,
    shared: Arc<SharedState>,
    link: SharedLink,
    telemetry: SharedSink,
    clock: Clock,
    cancel: CancellationToken,
    ticks: u64,
    no_data_ticks: u64,
}

impl ControlLoop {
    pub fn new(
        config: &HoverConfig,
        shared: Arc<SharedState>,
        link: SharedLink,
        telemetry: SharedSink,
        clock: Clock,
    ) -> Self {
        Self {
            config: config.control.clone(),
            pid: DualAxisPid::new(&config.pid),
            shared,
            link,
            telemetry,
            clock,
            cancel: CancellationToken::new(),
            ticks: 0,
            no_data_ticks: 0,
        }
    }

    /// Prepare for a new session: fresh PID state, counters and token.
    pub fn arm(&mut self) -> CancellationToken {
        self.pid.reset();
        self.ticks = 0;
        self.no_data_ticks = 0;
        self.cancel = CancellationToken::new();
        self.cancel.clone()
    }

    pub fn pid(&self) -> &DualAxisPid {
        &self.pid
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn no_data_ticks(&self) -> u64 {
        self.no_data_ticks
    }

    /// Ticks at the configured rate until cancelled, then returns itself.
    pub fn run(mut self) -> Self {
        let period = self.config.period();
        info!("control loop running at {:.0} Hz", self.config.rate_hz);
        while !self.cancel.is_cancelled() {
            let started = Instant::now();
            self.tick(self.clock.now());
            // no catch-up: a late tick just skips its sleep
            if let Some(remaining) = period.checked_sub(started.elapsed()) {
                thread::sleep(remaining);
            }
        }
        info!(
            "control loop stopped after {} ticks ({} without data)",
            self.ticks, self.no_data_ticks
        );
        self
    }

    /// One control period at session time `now`. Returns the command that was
    /// handed to the link.
    pub fn tick(&mut self, now: f64) -> ControlCommand {
        let snapshot = self.shared.snapshot();
        self.ticks += 1;

        let mut record = TelemetryRecord {
            time: now,
            tick: self.ticks,
            state: HoverState::Armed,
            frame_number: snapshot.frame_number,
            source: snapshot.source,
            marker_count: snapshot.marker_count,
            no_data: snapshot.no_data,
            attitude_deg: snapshot.rigid_body.map(|pose| pose.euler_deg),
            ..Default::default()
        };

        let command = match snapshot.result {
            None => {
                self.no_data_ticks += 1;
                if self.no_data_ticks % NO_DATA_LOG_INTERVAL == 1 {
                    warn!("no position yet, holding level ({} ticks)", self.no_data_ticks);
                }
                ControlCommand::level()
            }
            Some(_) => self.control(&snapshot, now, &mut record),
        };

        let (sent, packets_sent, send_failures) = self.transmit(&command);
        record.roll_deg = command.roll_deg();
        record.pitch_deg = command.pitch_deg();
        record.packets_sent = packets_sent;
        record.send_failures = send_failures;

        if sent && packets_sent % PACKET_LOG_INTERVAL == 0 {
            info!(
                "packet {}: roll={:+.2} deg pitch={:+.2} deg conf={:.2} anomaly={}",
                packets_sent,
                record.roll_deg,
                record.pitch_deg,
                record.confidence,
                record.anomaly
            );
        }

        self.telemetry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&record);
        command
    }

    fn control(&mut self, snapshot: &Snapshot, now: f64, record: &mut TelemetryRecord) -> ControlCommand {
        let Some(result) = snapshot.result else {
            return ControlCommand::level();
        };
        // a frame without any source leaves the old position in place but
        // nothing about it can be trusted
        let confidence = if snapshot.no_data { 0.0 } else { result.confidence };

        let position = result.filtered_position;
        let error_x = TARGET.0 - position.x;
        let error_y = TARGET.1 - position.y;
        let data_valid =
            confidence > DATA_VALID_CONFIDENCE && !result.is_outlier && result.tracking_valid;

        if result.consecutive_outliers > ANOMALY_OUTLIER_STREAK || confidence < ANOMALY_ENTER_CONFIDENCE {
            self.pid.set_anomaly(true);
        } else if result.consecutive_outliers == 0 && confidence > ANOMALY_EXIT_CONFIDENCE {
            self.pid.set_anomaly(false);
        }

        let raw = self.pid.compute(error_x, error_y, now, data_valid);
        let command = shape_command(
            raw,
            confidence,
            self.config.confidence_floor,
            self.config.full_confidence,
        );

        record.position = Some(position.as_array());
        record.raw_position = Some(result.raw_position.as_array());
        record.confidence = confidence;
        record.is_outlier = result.is_outlier;
        record.used_prediction = result.used_prediction;
        record.consecutive_outliers = result.consecutive_outliers;
        record.threshold = result.threshold;
        record.data_valid = data_valid;
        record.anomaly = self.pid.anomaly();
        record.terms = self.pid.terms();
        command
    }

    /// Writes under the link lock; once the session is cancelled the landing
    /// sequence owns the link and nothing more is sent from here.
    fn transmit(&self, command: &ControlCommand) -> (bool, u64, u64) {
        let mut link = self.link.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = if self.cancel.is_cancelled() {
            false
        } else {
            link.send_angles(command)
        };
        (sent, link.packets_sent(), link.send_failures())
    }
}

struct Session {
    cancel: CancellationToken,
    finished: Receiver<ControlLoop>,
    worker: JoinHandle<()>,
}

/// Owns the mocap client, the actuator link and the control thread.
pub struct HoverController {
    config: HoverConfig,
    state: HoverState,
    pipeline: FramePipeline,
    link: SharedLink,
    telemetry: SharedSink,
    mocap: Box<dyn MocapClient>,
    control: Option<ControlLoop>,
    session: Option<Session>,
}

impl HoverController {
    pub fn new(
        config: HoverConfig,
        mocap: Box<dyn MocapClient>,
        transport: Box<dyn Transport>,
        telemetry: Box<dyn TelemetrySink>,
    ) -> Result<Self, HoverError> {
        config.validate()?;
        let clock = Clock::new();
        let pipeline = FramePipeline::new(&config, clock);
        let link = Arc::new(Mutex::new(ActuatorLink::new(transport)));
        let telemetry: SharedSink = Arc::new(Mutex::new(telemetry));
        let control = ControlLoop::new(
            &config,
            pipeline.shared().clone(),
            link.clone(),
            telemetry.clone(),
            clock,
        );
        Ok(Self {
            config,
            state: HoverState::Idle,
            pipeline,
            link,
            telemetry,
            mocap,
            control: Some(control),
            session: None,
        })
    }

    pub fn state(&self) -> HoverState {
        self.state
    }

    /// Outlier counters and the live gate of the position filter.
    pub fn filter_statistics(&self) -> FilterStatistics {
        self.pipeline.filter_statistics()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.pipeline.shared().snapshot()
    }

    /// Connect, wait for a position, reset the estimators and take off.
    pub fn start(&mut self) -> Result<(), HoverError> {
        if self.state != HoverState::Idle {
            return Err(HoverError::AlreadyActive(self.state));
        }
        self.state = HoverState::Connecting;
        info!("connecting to motion capture");

        if let Err(e) = self.mocap.connect(self.pipeline.clone()) {
            warn!("mocap connection failed: {e}");
            self.state = HoverState::Idle;
            return Err(e);
        }

        let timeout = self.config.control.arm_timeout();
        if !self.wait_for_position(timeout) {
            warn!("no valid position within {timeout:?}, aborting");
            self.abort_to_idle();
            return Err(HoverError::NoPosition(timeout));
        }

        self.pipeline.reset_filter();
        let mut control = match self.control.take() {
            Some(control) => control,
            None => self.fresh_control_loop(),
        };
        let cancel = control.arm();

        if !self.lock_link().send_lifecycle(LifecycleCommand::Start) {
            self.control = Some(control);
            self.abort_to_idle();
            return Err(HoverError::Transport(LifecycleCommand::Start));
        }

        let (done, finished) = bounded(1);
        let spawned = thread::Builder::new()
            .name("hover-control".to_string())
            .spawn(move || {
                let control = control.run();
                let _ = done.send(control);
            });
        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.lock_link().send_lifecycle(LifecycleCommand::Stop);
                self.control = Some(self.fresh_control_loop());
                self.abort_to_idle();
                return Err(HoverError::Io(e));
            }
        };

        self.session = Some(Session {
            cancel,
            finished,
            worker,
        });
        self.state = HoverState::Armed;
        info!("armed, hovering over ({:.2}, {:.2})", TARGET.0, TARGET.1);
        Ok(())
    }

    /// Level the vehicle, send the landing command and tear the session down.
    pub fn stop(&mut self) -> Result<(), HoverError> {
        if self.state != HoverState::Armed {
            return Err(HoverError::NotFlying(self.state));
        }
        self.state = HoverState::Landing;
        info!("landing");

        let Some(session) = self.session.take() else {
            self.abort_to_idle();
            return Ok(());
        };
        session.cancel.cancel();
        {
            let mut link = self.lock_link();
            link.send_angles(&ControlCommand::level());
            link.send_lifecycle(LifecycleCommand::Stop);
        }

        let grace = self.config.control.join_grace();
        match session.finished.recv_timeout(grace) {
            Ok(control) => {
                if session.worker.join().is_err() {
                    warn!("control thread panicked while exiting");
                }
                self.control = Some(control);
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!("control thread did not exit within {grace:?}, detaching it");
                self.control = Some(self.fresh_control_loop());
            }
            Err(RecvTimeoutError::Disconnected) => {
                warn!("control thread exited abnormally");
                let _ = session.worker.join();
                self.control = Some(self.fresh_control_loop());
            }
        }

        self.abort_to_idle();
        info!("landed");
        Ok(())
    }

    /// Waits for a trustworthy position published after this call began.
    fn wait_for_position(&self, timeout: Duration) -> bool {
        let shared = self.pipeline.shared();
        let baseline = shared.snapshot().stats.total_frames;
        let floor = self.config.control.confidence_floor;
        let start = Instant::now();
        loop {
            let snapshot = shared.snapshot();
            if snapshot.stats.total_frames > baseline && can_arm_on(&snapshot, floor) {
                debug!("first position after {:?}", start.elapsed());
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            thread::sleep(ARM_POLL);
        }
    }

    fn abort_to_idle(&mut self) {
        self.mocap.shutdown();
        self.state = HoverState::Idle;
    }

    fn fresh_control_loop(&self) -> ControlLoop {
        ControlLoop::new(
            &self.config,
            self.pipeline.shared().clone(),
            self.link.clone(),
            self.telemetry.clone(),
            self.pipeline.clock(),
        )
    }

    fn lock_link(&self) -> std::sync::MutexGuard<'_, ActuatorLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for HoverController {
    fn drop(&mut self) {
        if self.state == HoverState::Armed {
            warn!("controller dropped while armed, landing");
            let _ = self.stop();
        }
        self.mocap.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{FilterResult, MarkerData, MocapFrame, RawSample, RigidBodyData, Source};
    use crate::protocol::{LinkDecoder, LinkMessage};
    use crate::telemetry::NullSink;
    use crate::transport::MemoryTransport;
    use approx::assert_relative_eq;
    use nalgebra::Vector3;

    struct Rig {
        pipeline: FramePipeline,
        memory: MemoryTransport,
        control: ControlLoop,
    }

    fn rig() -> Rig {
        let config = HoverConfig::default();
        let clock = Clock::new();
        let pipeline = FramePipeline::new(&config, clock);
        let memory = MemoryTransport::new();
        let link = Arc::new(Mutex::new(ActuatorLink::new(Box::new(memory.clone()))));
        let sink: SharedSink = Arc::new(Mutex::new(Box::new(NullSink)));
        let mut control = ControlLoop::new(&config, pipeline.shared().clone(), link, sink, clock);
        control.arm();
        Rig {
            pipeline,
            memory,
            control,
        }
    }

    fn body_frame(n: u64, drone: Vector3<f64>) -> MocapFrame {
        MocapFrame {
            frame_number: n,
            rigid_bodies: Some(vec![RigidBodyData {
                id: 1,
                // drone (x, y, z) comes from capture (y, z, x)
                position: [drone.y, drone.z, drone.x],
                orientation: [0.0, 0.0, 0.0, 1.0],
                tracking_valid: true,
                error: Some(0.0),
                markers: vec![MarkerData { position: [0.0; 3] }; 4],
            }]),
            labeled_markers: None,
        }
    }

    fn published(confidence: f64, x: f64, y: f64) -> FilterResult {
        let position = RawSample::new(Vector3::new(x, y, 1.0), 0.0, 4);
        FilterResult {
            filtered_position: position,
            raw_position: position,
            is_outlier: false,
            used_prediction: false,
            confidence,
            consecutive_outliers: 0,
            threshold: 0.1,
            tracking_valid: true,
            rigid_body_error: Some(0.0),
            source: Source::RigidBody,
            marker_count: 4,
        }
    }

    fn sent_angles(memory: &MemoryTransport) -> Vec<ControlCommand> {
        LinkDecoder::new()
            .push(&memory.bytes())
            .into_iter()
            .filter_map(|m| match m {
                Ok(LinkMessage::Angles(cmd)) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_shape_command() {
        let cmd = ControlCommand::new(0.08, -0.04);
        assert_eq!(shape_command(cmd, 0.05, 0.2, 0.99), ControlCommand::level());
        assert_eq!(shape_command(cmd, f64::NAN, 0.2, 0.99), ControlCommand::level());
        assert_eq!(shape_command(cmd, 1.0, 0.2, 0.99), cmd);
        let tapered = shape_command(cmd, 0.5, 0.2, 0.99);
        assert_relative_eq!(tapered.roll_rad, 0.04);
        assert_relative_eq!(tapered.pitch_rad, -0.02);
    }

    #[test]
    fn test_arming_requires_trusted_fix() {
        let mut snapshot = Snapshot::default();
        assert!(!can_arm_on(&snapshot, 0.2));

        snapshot.result = Some(published(0.9, 0.0, 0.0));
        assert!(can_arm_on(&snapshot, 0.2));

        snapshot.no_data = true;
        assert!(!can_arm_on(&snapshot, 0.2));
        snapshot.no_data = false;

        let mut untracked = published(0.9, 0.0, 0.0);
        untracked.tracking_valid = false;
        snapshot.result = Some(untracked);
        assert!(!can_arm_on(&snapshot, 0.2));

        let mut outlier = published(0.9, 0.0, 0.0);
        outlier.is_outlier = true;
        snapshot.result = Some(outlier);
        assert!(!can_arm_on(&snapshot, 0.2));

        snapshot.result = Some(published(0.15, 0.0, 0.0));
        assert!(!can_arm_on(&snapshot, 0.2));
    }

    #[test]
    fn test_no_position_sends_level() {
        let mut rig = rig();
        for k in 1..=3 {
            assert_eq!(rig.control.tick(k as f64 * 0.01), ControlCommand::level());
        }
        assert_eq!(rig.control.no_data_ticks(), 3);
        assert_eq!(sent_angles(&rig.memory), vec![ControlCommand::level(); 3]);
    }

    #[test]
    fn test_low_confidence_sends_exact_zero() {
        let mut rig = rig();
        rig.pipeline
            .shared()
            .publish(|s| s.result = Some(published(0.05, 0.5, -0.5)));
        let command = rig.control.tick(0.01);
        assert_eq!(command, ControlCommand::level());
        assert_eq!(sent_angles(&rig.memory), vec![ControlCommand::level()]);
        assert!(rig.control.pid().anomaly());
    }

    #[test]
    fn test_empty_frame_after_fix_levels_out() {
        let mut rig = rig();
        rig.pipeline.on_frame_at(&body_frame(1, Vector3::new(0.3, 0.0, 1.0)), 0.01);
        assert_ne!(rig.control.tick(0.01), ControlCommand::level());

        rig.pipeline.on_frame_at(&MocapFrame::default(), 0.02);
        assert_eq!(rig.control.tick(0.02), ControlCommand::level());
        assert_eq!(rig.control.no_data_ticks(), 0);
    }

    #[test]
    fn test_command_signs_oppose_offset() {
        let mut rig = rig();
        rig.pipeline
            .shared()
            .publish(|s| s.result = Some(published(1.0, 0.2, 0.2)));
        let command = rig.control.tick(0.01);
        // roll pushes x back towards zero, pitch uses the inverted gains
        assert!(command.roll_rad < 0.0);
        assert!(command.pitch_rad > 0.0);
        assert!(command.roll_rad.abs() <= 0.087 && command.pitch_rad.abs() <= 0.087);
    }

    #[test]
    fn test_stationary_at_origin_holds_level() {
        let mut rig = rig();
        for n in 1..=50u64 {
            let now = n as f64 * 0.01;
            rig.pipeline.on_frame_at(&body_frame(n, Vector3::new(0.0, 0.0, 1.0)), now);
            let command = rig.control.tick(now);
            assert_relative_eq!(command.roll_rad, 0.0, epsilon = 1e-12);
            assert_relative_eq!(command.pitch_rad, 0.0, epsilon = 1e-12);
        }
        let roll = rig.control.pid().roll().state();
        assert_relative_eq!(roll.integrator, 0.0, epsilon = 1e-12);
        assert!(!rig.control.pid().anomaly());
    }

    #[test]
    fn test_closed_loop_converges() {
        // point mass where roll accelerates +x and pitch accelerates -y
        let mut rig = rig();
        let dt = 0.01;
        let mut position = Vector3::new(0.3, -0.2, 1.0);
        let mut velocity = Vector3::<f64>::zeros();
        let mut command = ControlCommand::level();
        for n in 1..=1500u64 {
            let now = n as f64 * dt;
            velocity.x += 9.81 * command.roll_rad.tan() * dt;
            velocity.y -= 9.81 * command.pitch_rad.tan() * dt;
            position += velocity * dt;
            rig.pipeline.on_frame_at(&body_frame(n, position), now);
            command = rig.control.tick(now);
        }
        assert!(position.x.abs() < 0.02, "x = {}", position.x);
        assert!(position.y.abs() < 0.02, "y = {}", position.y);
        assert!(command.roll_rad.abs() < 0.01);
        assert!(command.pitch_rad.abs() < 0.01);
    }

    #[test]
    fn test_cancelled_loop_stops_sending() {
        let mut rig = rig();
        let token = rig.control.arm();
        token.cancel();
        rig.control.tick(0.01);
        assert!(rig.memory.bytes().is_empty());

        let control = rig.control.run();
        assert_eq!(control.ticks(), 1);
    }

    #[test]
    fn test_run_ticks_until_cancelled() {
        let rig = rig();
        let token = rig.control.cancel.clone();
        let worker = thread::spawn(move || rig.control.run());
        thread::sleep(Duration::from_millis(100));
        token.cancel();
        let control = worker.join().unwrap();
        // roughly ten ticks at 100 Hz, allowing for slow CI
        assert!(control.ticks() >= 3, "ticks = {}", control.ticks());
        assert!(control.ticks() <= 15, "ticks = {}", control.ticks());
        // a tick interrupted by the cancel is counted but not sent
        let sent = sent_angles(&rig.memory).len() as u64;
        assert!(sent + 1 >= control.ticks() && sent <= control.ticks());
    }
}
