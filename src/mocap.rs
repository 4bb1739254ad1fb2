//! Motion-capture connectivity.
//!
//! The network decoding of the capture system lives outside this crate. What
//! arrives here is one JSON-encoded [`MocapFrame`] per UDP datagram, produced
//! by a bridge next to the capture server.

use log::{debug, info, warn};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::data::MocapFrame;
use crate::error::HoverError;
use crate::pipeline::FramePipeline;

/// How long a receive blocks before the stop flag is rechecked.
const RECV_POLL: Duration = Duration::from_millis(100);

const MAX_DATAGRAM: usize = 65_507;

/// A running mocap client feeding frames to a [`FramePipeline`].
pub trait MocapClient: Send {
    /// Start delivering frames to `pipeline` from a background thread.
    fn connect(&mut self, pipeline: FramePipeline) -> Result<(), HoverError>;
    fn is_connected(&self) -> bool;
    /// Stop delivering frames. Safe to call more than once.
    fn shutdown(&mut self);
}

pub struct UdpMocapClient {
    bind_addr: SocketAddr,
    running: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl UdpMocapClient {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            running: Arc::new(AtomicBool::new(false)),
            worker: None,
        }
    }

    fn receive_loop(socket: UdpSocket, pipeline: FramePipeline, running: Arc<AtomicBool>) {
        let mut buffer = vec![0u8; MAX_DATAGRAM];
        let mut bad_datagrams: u64 = 0;
        while running.load(Ordering::Acquire) {
            let len = match socket.recv(&mut buffer) {
                Ok(len) => len,
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    warn!("mocap receive failed: {e}");
                    continue;
                }
            };
            match serde_json::from_slice::<MocapFrame>(&buffer[..len]) {
                Ok(frame) => pipeline.on_frame(&frame),
                Err(e) => {
                    if bad_datagrams % 100 == 0 {
                        warn!("undecodable mocap datagram ({len} bytes): {e}");
                    }
                    bad_datagrams += 1;
                }
            }
        }
        debug!("mocap receive loop exited");
    }
}

impl MocapClient for UdpMocapClient {
    fn connect(&mut self, pipeline: FramePipeline) -> Result<(), HoverError> {
        if self.is_connected() {
            return Ok(());
        }
        let socket = UdpSocket::bind(self.bind_addr)
            .map_err(|e| HoverError::MocapConnect(format!("bind {}: {e}", self.bind_addr)))?;
        socket
            .set_read_timeout(Some(RECV_POLL))
            .map_err(|e| HoverError::MocapConnect(e.to_string()))?;
        info!("listening for mocap frames on {}", self.bind_addr);

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        self.worker = Some(thread::spawn(move || {
            Self::receive_loop(socket, pipeline, running);
        }));
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.running.load(Ordering::Acquire) && self.worker.is_some()
    }

    fn shutdown(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("mocap receive thread panicked");
            }
            info!("mocap client shut down");
        }
    }
}

impl Drop for UdpMocapClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HoverConfig;
    use crate::data::MarkerData;
    use crate::shared::Clock;
    use std::time::Instant;

    #[test]
    fn test_udp_frames_reach_pipeline() {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        let mut client = UdpMocapClient::new(addr);
        client.connect(pipeline.clone()).unwrap();
        assert!(client.is_connected());

        let frame = MocapFrame {
            frame_number: 42,
            rigid_bodies: None,
            labeled_markers: Some(vec![MarkerData { position: [0.0, 1.0, 0.0] }; 4]),
        };
        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(b"not json", addr).unwrap();
        sender
            .send_to(&serde_json::to_vec(&frame).unwrap(), addr)
            .unwrap();

        let start = Instant::now();
        while !pipeline.shared().has_position() && start.elapsed() < Duration::from_secs(2) {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pipeline.shared().snapshot().frame_number, 42);

        client.shutdown();
        assert!(!client.is_connected());
        client.shutdown();
    }

    #[test]
    fn test_bind_failure_is_connect_error() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut client = UdpMocapClient::new(holder.local_addr().unwrap());
        let pipeline = FramePipeline::new(&HoverConfig::default(), Clock::new());
        assert!(matches!(
            client.connect(pipeline),
            Err(HoverError::MocapConnect(_))
        ));
        assert!(!client.is_connected());
    }
}
