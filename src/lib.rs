//! Motion-capture hover controller.
//!
//! Mocap frames are fused into one position per frame, filtered, and published
//! to a fixed-rate control loop that drives roll/pitch angle commands to the
//! flight controller over a framed serial link.

pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod filter;
pub mod frame;
pub mod fusion;
pub mod mocap;
pub mod pid;
pub mod pipeline;
pub mod protocol;
pub mod shared;
pub mod telemetry;
pub mod transport;

pub use config::HoverConfig;
pub use controller::{ControlLoop, HoverController};
pub use data::{ControlCommand, FilterResult, FusedObservation, HoverState, MocapFrame, Source};
pub use error::{ConfigError, HoverError, ProtocolError};
pub use filter::PositionFilter;
pub use mocap::{MocapClient, UdpMocapClient};
pub use pid::DualAxisPid;
pub use pipeline::FramePipeline;
pub use telemetry::{TelemetryRecord, TelemetrySink};
pub use transport::{ActuatorLink, Transport};
