//! Shared bike telemetry state and the stdin ingest loop.
//!
//! Telemetry arrives as one JSON object per line on stdin (`{"power": 210,
//! "cadence": 88.5, ...}`, any subset of fields) and is merged field-by-field
//! into the shared state. `{"command": "stop"}` requests daemon shutdown.
//! Malformed lines are logged and skipped; EOF ends ingestion without
//! stopping the daemon.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::status::Emitter;

/// Shared bike state, updated by the ingest loop, read by the 4 Hz encoder.
#[derive(Debug, Clone, Default)]
pub struct BikeState {
    /// Instantaneous power in watts (sint16 on the wire)
    pub power_watts: i32,
    /// Instantaneous cadence in rpm (0.5 rpm resolution on the wire)
    pub cadence_rpm: f64,
    /// Heart rate in bpm (clamped to 0-255 on the wire)
    pub heart_rate_bpm: u32,
    /// Cumulative distance in meters (uint24 on the wire, wraps at 2^24)
    pub distance_meters: u32,
    /// Total energy in kcal (uint16 on the wire)
    pub calories_kcal: u32,
    /// Seconds since the workout started (uint16 on the wire)
    pub elapsed_secs: u32,
}

impl BikeState {
    /// Merge a partial telemetry update. Absent fields keep their prior value.
    pub fn apply(&mut self, update: &TelemetryUpdate) {
        if let Some(power) = update.power {
            self.power_watts = power;
        }
        if let Some(cadence) = update.cadence {
            self.cadence_rpm = cadence;
        }
        if let Some(heart_rate) = update.heart_rate {
            self.heart_rate_bpm = heart_rate;
        }
        if let Some(distance) = update.distance {
            self.distance_meters = distance;
        }
        if let Some(calories) = update.calories {
            self.calories_kcal = calories;
        }
        if let Some(elapsed) = update.elapsed_time {
            self.elapsed_secs = elapsed;
        }
    }

    /// Encode current state as FTMS Indoor Bike Data (0x2AD2) bytes.
    /// Handles the 0.5 rpm cadence resolution and the heart rate clamp in
    /// one place.
    pub fn encode_ftms_data(&self) -> Vec<u8> {
        let cadence_half_rpm = (self.cadence_rpm * 2.0).round() as u16;
        let heart_rate = self.heart_rate_bpm.min(255) as u8;
        crate::protocol::encode_indoor_bike_data(
            cadence_half_rpm,
            self.distance_meters,
            self.power_watts as i16,
            self.calories_kcal as u16,
            heart_rate,
            self.elapsed_secs as u16,
        )
    }
}

/// One telemetry record from stdin. Every field is optional; unknown keys
/// are ignored, but a value of the wrong type rejects the whole record.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryUpdate {
    pub power: Option<i32>,
    pub cadence: Option<f64>,
    pub heart_rate: Option<u32>,
    pub distance: Option<u32>,
    pub calories: Option<u32>,
    pub elapsed_time: Option<u32>,
}

/// A parsed stdin line: either telemetry or the stop command.
#[derive(Debug)]
pub enum IngestMessage {
    Update(TelemetryUpdate),
    Stop,
}

/// Parse one stdin line. `{"command": "stop"}` wins over any telemetry keys
/// in the same record.
pub fn parse_ingest_line(line: &str) -> Result<IngestMessage, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    if value.get("command").and_then(|v| v.as_str()) == Some("stop") {
        return Ok(IngestMessage::Stop);
    }
    let update = serde_json::from_value(value)?;
    Ok(IngestMessage::Update(update))
}

/// Run the stdin ingest loop. Merges telemetry into shared state and forwards
/// the stop command. Ends on EOF or stop; the daemon itself keeps running
/// after EOF until stopped.
pub async fn run(
    state: Arc<Mutex<BikeState>>,
    stop_tx: mpsc::Sender<()>,
    emitter: Emitter,
) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                match parse_ingest_line(line) {
                    Ok(IngestMessage::Stop) => {
                        info!("Stop command received on stdin");
                        // Shutdown may already be underway; a gone receiver is fine
                        let _ = stop_tx.send(()).await;
                        break;
                    }
                    Ok(IngestMessage::Update(update)) => {
                        let mut s = state.lock().await;
                        s.apply(&update);
                        debug!(
                            "Telemetry: {}W {:.1}rpm hr={} dist={}m cal={} elapsed={}s",
                            s.power_watts,
                            s.cadence_rpm,
                            s.heart_rate_bpm,
                            s.distance_meters,
                            s.calories_kcal,
                            s.elapsed_secs,
                        );
                    }
                    Err(e) => {
                        emitter.log(&format!("Ignoring bad input line: {}", e));
                    }
                }
            }
            Ok(None) => {
                // EOF — the feeder closed our stdin; keep broadcasting
                info!("stdin closed, ingest ended");
                break;
            }
            Err(e) => {
                warn!("stdin read error: {}", e);
                break;
            }
        }
    }
}
