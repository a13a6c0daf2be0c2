//! Broadcaster lifecycle and the 4 Hz notification scheduler.
//!
//! The broadcaster owns the shared bike state, the Control Point engine, and
//! the subscriber bookkeeping. `run` drives the whole lifecycle on a single
//! task: register the GATT service, start advertising, then tick at 4 Hz
//! until a stop arrives. Ticks and the stop check share one select loop, so
//! a stop can never interleave with a half-finished tick: once the loop
//! breaks, no further encode or notify call executes.

use std::collections::HashSet;
use std::error::Error;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};
use uuid::Uuid;

use crate::backend::{Backend, CharacteristicSpec};
use crate::bike::BikeState;
use crate::control::ControlPoint;
use crate::protocol::{
    self, CONTROL_POINT_UUID, FEATURE_UUID, FTMS_SERVICE_UUID, INDOOR_BIKE_DATA_UUID,
    MACHINE_STATUS_UUID, POWER_RANGE_UUID, RESISTANCE_RANGE_UUID,
};
use crate::status::Emitter;

/// Notification period mandated by the FTMS profile for indoor bikes;
/// client apps tune their moving averages to 4 Hz.
const NOTIFY_PERIOD: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Advertising,
    Stopped,
}

/// The FTMS engine hub: shared state, Control Point, subscribers, lifecycle.
pub struct Broadcaster {
    state: Arc<Mutex<BikeState>>,
    control: ControlPoint,
    subscribers: Mutex<HashSet<String>>,
    phase: Mutex<Phase>,
    emitter: Emitter,
    device_name: String,
}

impl Broadcaster {
    pub fn new(state: Arc<Mutex<BikeState>>, emitter: Emitter, device_name: String) -> Self {
        Broadcaster {
            state,
            control: ControlPoint::new(emitter.clone()),
            subscribers: Mutex::new(HashSet::new()),
            phase: Mutex::new(Phase::Idle),
            emitter,
            device_name,
        }
    }

    pub async fn phase(&self) -> Phase {
        *self.phase.lock().await
    }

    /// The FTMS characteristic set, in registration order.
    fn characteristics(&self) -> Vec<CharacteristicSpec> {
        vec![
            CharacteristicSpec::read_only(FEATURE_UUID),
            CharacteristicSpec::notify_only(INDOOR_BIKE_DATA_UUID),
            CharacteristicSpec::read_only(POWER_RANGE_UUID),
            CharacteristicSpec::read_only(RESISTANCE_RANGE_UUID),
            CharacteristicSpec::write_indicate(CONTROL_POINT_UUID),
            // Registered so clients discover it, but no status transition is
            // ever pushed
            CharacteristicSpec::notify_only(MACHINE_STATUS_UUID),
        ]
    }

    /// Serve a characteristic read. Indoor Bike Data reads return the live
    /// snapshot; BLE clients only see it via notifications, but the TCP
    /// backend exposes it for debugging.
    pub async fn read_value(&self, characteristic: Uuid) -> Option<Vec<u8>> {
        if characteristic == FEATURE_UUID {
            Some(protocol::encode_feature().to_vec())
        } else if characteristic == POWER_RANGE_UUID {
            Some(protocol::encode_power_range().to_vec())
        } else if characteristic == RESISTANCE_RANGE_UUID {
            Some(protocol::encode_resistance_range().to_vec())
        } else if characteristic == INDOOR_BIKE_DATA_UUID {
            Some(self.state.lock().await.encode_ftms_data())
        } else {
            None
        }
    }

    /// Serve a characteristic write. Only the Control Point accepts writes;
    /// the returned bytes are the indication to deliver back to the writer.
    pub async fn handle_write(&self, characteristic: Uuid, value: &[u8]) -> Option<Vec<u8>> {
        if characteristic == CONTROL_POINT_UUID {
            self.control.handle_write(value).await
        } else {
            warn!("Write to non-writable characteristic {}", characteristic);
            None
        }
    }

    /// Record a subscriber. Indoor Bike Data subscribers gate the 4 Hz
    /// stream and are reported on the status channel.
    pub async fn handle_subscribe(&self, characteristic: Uuid, client: &str) {
        if characteristic == INDOOR_BIKE_DATA_UUID {
            self.subscribers.lock().await.insert(client.to_string());
            self.emitter.connected(client);
            info!("Client {} subscribed to Indoor Bike Data", client);
        } else {
            debug!("Client {} subscribed to {}", client, characteristic);
        }
    }

    /// Unsubscribes are logged but the set never shrinks: one lost client
    /// must not stall the stream for the rest, and per-client liveness
    /// belongs to the transport.
    pub async fn handle_unsubscribe(&self, characteristic: Uuid, client: &str) {
        info!("Client {} unsubscribed from {}", client, characteristic);
    }

    async fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().await.is_empty()
    }

    /// Human-readable snapshot for the TCP debug backend's `state` command.
    pub async fn describe(&self) -> String {
        let s = self.state.lock().await.clone();
        let phase = self.phase().await;
        let granted = self.control.granted().await;
        let subscribers = self.subscribers.lock().await.len();
        format!(
            "phase:       {:?}\n\
             power:       {} W\n\
             cadence:     {:.1} rpm\n\
             heart rate:  {} bpm\n\
             distance:    {} m ({:.2} km)\n\
             calories:    {} kcal\n\
             elapsed:     {}s ({}:{:02})\n\
             control:     {}\n\
             subscribers: {}",
            phase,
            s.power_watts,
            s.cadence_rpm,
            s.heart_rate_bpm,
            s.distance_meters,
            s.distance_meters as f64 / 1000.0,
            s.calories_kcal,
            s.elapsed_secs,
            s.elapsed_secs / 60,
            s.elapsed_secs % 60,
            if granted { "granted" } else { "not requested" },
            subscribers,
        )
    }

    /// Run the broadcaster to completion: register the service, advertise,
    /// notify at 4 Hz, shut down when `stop_rx` delivers (or closes).
    ///
    /// Registration or advertising failure is fatal: no `advertising` status
    /// is emitted, `stopped` is, and the error propagates to the caller.
    pub async fn run<B: Backend>(
        self: Arc<Self>,
        mut backend: B,
        mut stop_rx: mpsc::Receiver<()>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Err(e) = backend
            .register_service(FTMS_SERVICE_UUID, self.characteristics(), self.clone())
            .await
        {
            self.emitter.log(&format!("GATT registration failed: {}", e));
            self.shutdown(&mut backend).await;
            return Err(e);
        }
        info!("FTMS GATT service registered");

        if let Err(e) = backend
            .start_advertising(&self.device_name, &[FTMS_SERVICE_UUID])
            .await
        {
            self.emitter.log(&format!("Failed to start advertising: {}", e));
            self.shutdown(&mut backend).await;
            return Err(e);
        }

        *self.phase.lock().await = Phase::Advertising;
        self.emitter.advertising(&self.device_name);
        info!("Advertising as '{}' with FTMS service", self.device_name);

        let mut ticker = interval(NOTIFY_PERIOD);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.has_subscribers().await {
                        continue;
                    }
                    // Encode under the state lock, push without it
                    let data = self.state.lock().await.encode_ftms_data();
                    debug!("Indoor Bike Data notify: {} bytes", data.len());
                    if let Err(e) = backend.notify(INDOOR_BIKE_DATA_UUID, data).await {
                        warn!("Indoor Bike Data notify error: {}", e);
                    }
                }
                _ = stop_rx.recv() => {
                    info!("Stop requested, shutting down");
                    break;
                }
            }
        }

        self.shutdown(&mut backend).await;
        Ok(())
    }

    /// Tear down advertising and report `stopped`. Safe to call more than
    /// once; only the first call does the work.
    pub async fn shutdown<B: Backend>(&self, backend: &mut B) {
        {
            let mut phase = self.phase.lock().await;
            if *phase == Phase::Stopped {
                debug!("Shutdown already complete");
                return;
            }
            *phase = Phase::Stopped;
        }
        backend.stop_advertising().await;
        self.emitter.stopped();
        info!("Broadcaster stopped");
    }
}
