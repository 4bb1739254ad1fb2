//! Wire format of the link to the flight controller.
//!
//! Two message kinds share the byte stream:
//! - lifecycle commands, sent as newline-terminated text (`start\n`, `stop\n`)
//! - angle frames: `'A'`, roll (f32 LE), pitch (f32 LE), then one checksum
//!   byte equal to the low 8 bits of the sum of the 8 payload bytes.

use std::fmt;

use crate::data::ControlCommand;
use crate::error::ProtocolError;

pub const ANGLE_HEADER: u8 = b'A';
pub const ANGLE_PAYLOAD_LEN: usize = 8;
pub const ANGLE_FRAME_LEN: usize = 1 + ANGLE_PAYLOAD_LEN + 1;

// longest text line we wait for before dropping the buffer as noise
const MAX_TEXT_LEN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleCommand {
    Start,
    Stop,
}

impl LifecycleCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleCommand::Start => "start",
            LifecycleCommand::Stop => "stop",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim() {
            "start" => Some(LifecycleCommand::Start),
            "stop" => Some(LifecycleCommand::Stop),
            _ => None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.as_str().as_bytes().to_vec();
        bytes.push(b'\n');
        bytes
    }
}

impl fmt::Display for LifecycleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Low 8 bits of the byte sum.
pub fn checksum(payload: &[u8]) -> u8 {
    payload.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

pub fn encode_angle_frame(command: &ControlCommand) -> [u8; ANGLE_FRAME_LEN] {
    let mut frame = [0u8; ANGLE_FRAME_LEN];
    frame[0] = ANGLE_HEADER;
    frame[1..5].copy_from_slice(&(command.roll_rad as f32).to_le_bytes());
    frame[5..9].copy_from_slice(&(command.pitch_rad as f32).to_le_bytes());
    frame[9] = checksum(&frame[1..9]);
    frame
}

pub fn decode_angle_frame(frame: &[u8]) -> Result<ControlCommand, ProtocolError> {
    if frame.len() != ANGLE_FRAME_LEN {
        return Err(ProtocolError::Length {
            expected: ANGLE_FRAME_LEN,
            actual: frame.len(),
        });
    }
    if frame[0] != ANGLE_HEADER {
        return Err(ProtocolError::Header(frame[0]));
    }
    let calculated = checksum(&frame[1..9]);
    if calculated != frame[9] {
        return Err(ProtocolError::Checksum {
            expected: frame[9],
            calculated,
        });
    }
    let roll = f32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
    let pitch = f32::from_le_bytes([frame[5], frame[6], frame[7], frame[8]]);
    Ok(ControlCommand::new(f64::from(roll), f64::from(pitch)))
}

#[derive(Clone, Debug, PartialEq)]
pub enum LinkMessage {
    Lifecycle(LifecycleCommand),
    Angles(ControlCommand),
    /// A text line that is not a known command.
    Text(String),
}

/// Incremental parser for the outbound byte stream, for bench monitoring and
/// tests. Bad frames are reported and skipped one byte at a time so the
/// decoder resynchronises on the next header.
#[derive(Default)]
pub struct LinkDecoder {
    buffer: Vec<u8>,
}

impl LinkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Vec<Result<LinkMessage, ProtocolError>> {
        self.buffer.extend_from_slice(bytes);
        let mut out = Vec::new();
        let mut dropped = 0;

        while let Some(&first) = self.buffer.first() {
            if first == ANGLE_HEADER {
                if self.buffer.len() < ANGLE_FRAME_LEN {
                    break;
                }
                flush_garbage(&mut out, &mut dropped);
                match decode_angle_frame(&self.buffer[..ANGLE_FRAME_LEN]) {
                    Ok(command) => {
                        self.buffer.drain(..ANGLE_FRAME_LEN);
                        out.push(Ok(LinkMessage::Angles(command)));
                    }
                    Err(e) => {
                        self.buffer.remove(0);
                        out.push(Err(e));
                    }
                }
                continue;
            }

            let text_len = self
                .buffer
                .iter()
                .take_while(|b| **b != ANGLE_HEADER && (b.is_ascii_graphic() || **b == b' ' || **b == b'\r'))
                .count();

            if text_len == self.buffer.len() {
                // unterminated text, wait for more unless it is clearly noise
                if text_len > MAX_TEXT_LEN {
                    dropped += text_len;
                    self.buffer.clear();
                }
                break;
            }

            if self.buffer[text_len] != b'\n' {
                // text interrupted by binary data; keep a header so the frame survives
                let skip = if self.buffer[text_len] == ANGLE_HEADER {
                    text_len
                } else {
                    text_len + 1
                };
                self.buffer.drain(..skip);
                dropped += skip;
                continue;
            }

            let line: Vec<u8> = self.buffer.drain(..=text_len).collect();
            let text = String::from_utf8_lossy(&line[..text_len]).trim().to_string();
            if text.is_empty() {
                continue;
            }
            flush_garbage(&mut out, &mut dropped);
            out.push(Ok(match LifecycleCommand::parse(&text) {
                Some(command) => LinkMessage::Lifecycle(command),
                None => LinkMessage::Text(text),
            }));
        }
        flush_garbage(&mut out, &mut dropped);
        out
    }
}

fn flush_garbage(out: &mut Vec<Result<LinkMessage, ProtocolError>>, dropped: &mut usize) {
    if *dropped > 0 {
        out.push(Err(ProtocolError::Garbage(*dropped)));
        *dropped = 0;
    }
}
