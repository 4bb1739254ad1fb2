//! Per-tick telemetry and where it goes.

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::data::{HoverState, Source};
use crate::pid::AxisTerms;

pub const TELEMETRY_SERVER_ADDR: &str = "http://127.0.0.1:8080/telemetry";

/// Records queued for the HTTP publisher before new ones are dropped.
const HTTP_QUEUE_DEPTH: usize = 64;

/// Everything worth plotting from one control tick.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Default)]
pub struct TelemetryRecord {
    pub time: f64,
    pub tick: u64,
    pub state: HoverState,
    pub frame_number: u64,
    pub source: Source,
    pub marker_count: u32,
    /// Filtered drone-frame position, `None` before the first fix.
    pub position: Option<[f64; 3]>,
    pub raw_position: Option<[f64; 3]>,
    pub confidence: f64,
    pub is_outlier: bool,
    pub used_prediction: bool,
    pub consecutive_outliers: u32,
    pub threshold: f64,
    pub data_valid: bool,
    pub anomaly: bool,
    pub no_data: bool,
    pub roll_deg: f64,
    pub pitch_deg: f64,
    pub terms: AxisTerms,
    /// Rigid-body roll, pitch, yaw in degrees when the body is visible.
    pub attitude_deg: Option<[f64; 3]>,
    pub packets_sent: u64,
    pub send_failures: u64,
}

/// Consumer of telemetry records. Called from the control thread, so it must
/// never block for long.
pub trait TelemetrySink: Send {
    fn record(&mut self, record: &TelemetryRecord);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&mut self, _record: &TelemetryRecord) {}
}

/// Forwards records to a crossbeam channel, dropping them when it is full.
pub struct ChannelSink {
    sender: Sender<TelemetryRecord>,
    dropped: u64,
}

impl ChannelSink {
    pub fn new(sender: Sender<TelemetryRecord>) -> Self {
        Self { sender, dropped: 0 }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl TelemetrySink for ChannelSink {
    fn record(&mut self, record: &TelemetryRecord) {
        match self.sender.try_send(record.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => self.dropped += 1,
            Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

/// Posts records to the telemetry server from a tokio task.
pub struct HttpSink {
    queue: mpsc::Sender<TelemetryRecord>,
    dropped: u64,
}

impl HttpSink {
    /// Starts the publishing task on `runtime`.
    pub fn spawn(runtime: &Handle, url: impl Into<String>) -> Self {
        let (queue, mut records) = mpsc::channel::<TelemetryRecord>(HTTP_QUEUE_DEPTH);
        let url = url.into();
        runtime.spawn(async move {
            let client = Client::new();
            let mut failures: u64 = 0;
            while let Some(record) = records.recv().await {
                if let Err(e) = send_record(&client, &url, &record).await {
                    if failures % 100 == 0 {
                        warn!("telemetry post to {url} failed: {e}");
                    }
                    failures += 1;
                }
            }
            debug!("telemetry publisher stopped");
        });
        Self { queue, dropped: 0 }
    }

    /// Records discarded because the publisher fell behind.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl TelemetrySink for HttpSink {
    fn record(&mut self, record: &TelemetryRecord) {
        if self.queue.try_send(record.clone()).is_err() {
            self.dropped += 1;
        }
    }
}

async fn send_record(client: &Client, url: &str, record: &TelemetryRecord) -> Result<(), reqwest::Error> {
    client
        .post(url)
        .json(record)
        .send()
        .await?
        .error_for_status()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_drops_when_full() {
        let (tx, rx) = crossbeam_channel::bounded(2);
        let mut sink = ChannelSink::new(tx);
        for tick in 0..4 {
            sink.record(&TelemetryRecord {
                tick,
                ..Default::default()
            });
        }
        assert_eq!(sink.dropped(), 2);
        assert_eq!(rx.try_recv().unwrap().tick, 0);
        assert_eq!(rx.try_recv().unwrap().tick, 1);
    }

    #[test]
    fn test_record_json_shape() {
        let record = TelemetryRecord {
            state: HoverState::Armed,
            source: Source::Markers,
            position: Some([0.1, -0.2, 1.0]),
            ..Default::default()
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["state"], "Armed");
        assert_eq!(json["source"], "markers");
        assert_eq!(json["position"][1], -0.2);
        assert!(json["attitude_deg"].is_null());

        let back: TelemetryRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn test_http_sink_does_not_block_without_server() {
        let mut sink = HttpSink::spawn(&Handle::current(), "http://127.0.0.1:9/telemetry");
        for tick in 0..(HTTP_QUEUE_DEPTH as u64 + 10) {
            sink.record(&TelemetryRecord {
                tick,
                ..Default::default()
            });
        }
        assert!(sink.dropped() >= 10);
    }
}
