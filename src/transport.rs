//! Actuation link: byte transports and the command writer on top of them.

use log::{info, warn};
use serial2::{CharSize, FlowControl, Parity, SerialPort, Settings, StopBits};
use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::SerialConfig;
use crate::data::ControlCommand;
use crate::protocol::{encode_angle_frame, LifecycleCommand};

/// Print at most one angle-send failure per this many packets.
const ERROR_LOG_INTERVAL: u64 = 100;

/// Anything that can carry bytes to the flight controller.
pub trait Transport: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
}

pub struct SerialTransport {
    port: SerialPort,
}

impl SerialTransport {
    pub fn open(config: &SerialConfig) -> io::Result<Self> {
        let name = config.port_name();
        let mut port = open_port(&name, config.baud_rate)?;
        port.set_write_timeout(Duration::from_millis(config.write_timeout_ms))?;
        info!("opened serial port {} at {} baud", name, config.baud_rate);
        Ok(Self { port })
    }
}

impl Transport for SerialTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)
    }
}

/// Raw 8N1 port with no flow control.
pub fn open_port(port_name: &str, baud_rate: u32) -> io::Result<SerialPort> {
    SerialPort::open(port_name, |mut settings: Settings| {
        settings.set_raw();
        settings.set_baud_rate(baud_rate)?;
        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::One);
        settings.set_parity(Parity::None);
        settings.set_flow_control(FlowControl::None);
        Ok(settings)
    })
}

/// In-memory transport that records every write. Clones share the buffer.
#[derive(Clone, Default)]
pub struct MemoryTransport {
    written: Arc<Mutex<Vec<u8>>>,
    failing: Arc<Mutex<bool>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.written.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Make subsequent writes fail with `BrokenPipe`.
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap_or_else(PoisonError::into_inner) = failing;
    }
}

impl Transport for MemoryTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if *self.failing.lock().unwrap_or_else(PoisonError::into_inner) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "transport marked failing"));
        }
        self.written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
        Ok(())
    }
}

/// Encodes commands onto a transport and reports each write as a bool.
pub struct ActuatorLink {
    transport: Box<dyn Transport>,
    packets_sent: u64,
    send_failures: u64,
}

impl ActuatorLink {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            packets_sent: 0,
            send_failures: 0,
        }
    }

    pub fn send_lifecycle(&mut self, command: LifecycleCommand) -> bool {
        match self.transport.write_all(&command.encode()) {
            Ok(()) => {
                info!("-> {command}");
                true
            }
            Err(e) => {
                warn!("failed to send `{command}`: {e}");
                false
            }
        }
    }

    pub fn send_angles(&mut self, command: &ControlCommand) -> bool {
        match self.transport.write_all(&encode_angle_frame(command)) {
            Ok(()) => {
                self.packets_sent += 1;
                true
            }
            Err(e) => {
                if self.send_failures % ERROR_LOG_INTERVAL == 0 {
                    warn!("angle send failed ({} failures so far): {e}", self.send_failures + 1);
                }
                self.send_failures += 1;
                false
            }
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub fn send_failures(&self) -> u64 {
        self.send_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{LinkDecoder, LinkMessage};

    #[test]
    fn test_link_writes_commands_and_frames() {
        let memory = MemoryTransport::new();
        let mut link = ActuatorLink::new(Box::new(memory.clone()));

        assert!(link.send_lifecycle(LifecycleCommand::Start));
        assert!(link.send_angles(&ControlCommand::new(0.01, -0.01)));
        assert_eq!(link.packets_sent(), 1);

        let messages: Vec<LinkMessage> = LinkDecoder::new()
            .push(&memory.bytes())
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(messages[0], LinkMessage::Lifecycle(LifecycleCommand::Start));
        assert!(matches!(messages[1], LinkMessage::Angles(_)));
    }

    #[test]
    fn test_failures_reported_as_false() {
        let memory = MemoryTransport::new();
        memory.set_failing(true);
        let mut link = ActuatorLink::new(Box::new(memory.clone()));

        assert!(!link.send_lifecycle(LifecycleCommand::Stop));
        assert!(!link.send_angles(&ControlCommand::level()));
        assert!(!link.send_angles(&ControlCommand::level()));
        assert_eq!(link.send_failures(), 2);
        assert_eq!(link.packets_sent(), 0);
        assert!(memory.bytes().is_empty());

        memory.set_failing(false);
        assert!(link.send_angles(&ControlCommand::level()));
    }
}
