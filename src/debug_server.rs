//! TCP debug transport for driving the daemon without BLE hardware.
//!
//! Speaks a line protocol with hex-encoded payloads over a TCP port,
//! mirroring exactly what a BLE FTMS client would exchange via GATT:
//! reads, control point writes with indication responses, and subscribed
//! notification streams.
//!
//! Usage from a dev machine:
//!   nc localhost 8830
//!
//! Commands:
//!   read <uuid16>         → characteristic value as hex
//!   write <uuid16> <hex>  → write, response indication as hex
//!   sub <uuid16>          → stream notifications as 'data <uuid16> <hex>'
//!   state                 → human-readable bike state
//!   help                  → list commands
//!
//! Characteristic values pushed or indicated are cached, so `read 2ad9`
//! after a control point write returns the last response, the same way the
//! GATT attribute value would.

use std::collections::HashMap;
use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::backend::{Backend, CharacteristicSpec};
use crate::broadcaster::Broadcaster;
use crate::protocol;

type SharedWriter = Arc<Mutex<OwnedWriteHalf>>;
type SubscriberMap = Arc<Mutex<HashMap<Uuid, Vec<(String, SharedWriter)>>>>;
type ValueMap = Arc<Mutex<HashMap<Uuid, Vec<u8>>>>;

pub struct TcpBackend {
    port: u16,
    handler: Option<Arc<Broadcaster>>,
    specs: Arc<Vec<CharacteristicSpec>>,
    subscribers: SubscriberMap,
    values: ValueMap,
    listener_task: Option<JoinHandle<()>>,
}

impl TcpBackend {
    pub fn new(port: u16) -> Self {
        TcpBackend {
            port,
            handler: None,
            specs: Arc::new(Vec::new()),
            subscribers: Arc::new(Mutex::new(HashMap::new())),
            values: Arc::new(Mutex::new(HashMap::new())),
            listener_task: None,
        }
    }
}

impl Backend for TcpBackend {
    async fn register_service(
        &mut self,
        service_uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
        handler: Arc<Broadcaster>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        info!(
            "Debug service {} with {} characteristics",
            service_uuid,
            characteristics.len()
        );
        self.specs = Arc::new(characteristics);
        self.handler = Some(handler);
        Ok(())
    }

    async fn start_advertising(
        &mut self,
        device_name: &str,
        _service_uuids: &[Uuid],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => return Err("advertising requires a registered service".into()),
        };

        let listener = TcpListener::bind(("0.0.0.0", self.port)).await?;
        info!("Debug server listening on port {} as '{}'", self.port, device_name);

        let specs = self.specs.clone();
        let subscribers = self.subscribers.clone();
        let values = self.values.clone();
        let device_name = device_name.to_string();

        self.listener_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        info!("Debug client connected from {}", addr);
                        let handler = handler.clone();
                        let specs = specs.clone();
                        let subscribers = subscribers.clone();
                        let values = values.clone();
                        let device_name = device_name.clone();
                        tokio::spawn(async move {
                            let res = handle_client(
                                stream,
                                addr,
                                device_name,
                                handler,
                                specs,
                                subscribers,
                                values,
                            )
                            .await;
                            if let Err(e) = res {
                                info!("Debug client {} disconnected: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Debug server accept failed: {}", e);
                        break;
                    }
                }
            }
        }));
        Ok(())
    }

    async fn notify(
        &mut self,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let line = format!("data {} {}\n", short_uuid(characteristic), hex_encode(&value));
        // Cache the frame so `read` sees the latest pushed value
        self.values.lock().await.insert(characteristic, value);

        let mut dropped = Vec::new();
        {
            let mut subs = self.subscribers.lock().await;
            if let Some(list) = subs.get_mut(&characteristic) {
                let mut kept = Vec::new();
                for (client, writer) in list.drain(..) {
                    let res = writer.lock().await.write_all(line.as_bytes()).await;
                    match res {
                        Ok(()) => kept.push((client, writer)),
                        Err(e) => {
                            warn!("Debug subscriber {} gone: {}", client, e);
                            dropped.push(client);
                        }
                    }
                }
                *list = kept;
            }
        }
        if let Some(handler) = &self.handler {
            for client in dropped {
                handler.handle_unsubscribe(characteristic, &client).await;
            }
        }
        Ok(())
    }

    async fn stop_advertising(&mut self) {
        if let Some(task) = self.listener_task.take() {
            task.abort();
            info!("Debug server stopped");
        }
        self.subscribers.lock().await.clear();
    }
}

async fn handle_client(
    stream: TcpStream,
    addr: SocketAddr,
    device_name: String,
    handler: Arc<Broadcaster>,
    specs: Arc<Vec<CharacteristicSpec>>,
    subscribers: SubscriberMap,
    values: ValueMap,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    // Shared with the notify fan-out once the client subscribes
    let writer: SharedWriter = Arc::new(Mutex::new(writer));

    let banner = format!(
        "ftms-debug> connected to '{}'. type 'help' for commands.",
        device_name
    );
    write_line(&writer, &banner).await?;

    loop {
        writer.lock().await.write_all(b"ftms-debug> ").await?;

        match lines.next_line().await? {
            Some(line) => {
                let line = line.trim().to_lowercase();
                if line.is_empty() {
                    continue;
                }

                let response = match line.split_once(' ') {
                    Some(("read", arg)) => handle_read(arg.trim(), &handler, &specs, &values).await,
                    Some(("write", arg)) => {
                        handle_write(arg.trim(), &handler, &specs, &values).await
                    }
                    Some(("sub", arg)) => {
                        handle_sub(arg.trim(), addr, &handler, &specs, &subscribers, &writer).await
                    }
                    _ => match line.as_str() {
                        "help" => HELP_TEXT.to_string(),
                        "state" => handler.describe().await,
                        "read" | "write" | "sub" => "missing argument. type 'help'.".to_string(),
                        "quit" | "exit" => return Ok(()),
                        _ => format!("unknown command: '{}'. type 'help'.", line),
                    },
                };

                write_line(&writer, &response).await?;
            }
            None => return Ok(()), // EOF
        }
    }
}

async fn handle_read(
    arg: &str,
    handler: &Arc<Broadcaster>,
    specs: &[CharacteristicSpec],
    values: &ValueMap,
) -> String {
    let spec = match find_spec(specs, arg) {
        Ok(spec) => spec,
        Err(e) => return e,
    };
    if !spec.readable {
        return format!("error: {} is not readable", short_uuid(spec.uuid));
    }
    if let Some(value) = handler.read_value(spec.uuid).await {
        return format!("value {}", hex_encode(&value));
    }
    match values.lock().await.get(&spec.uuid) {
        Some(value) => format!("value {}", hex_encode(value)),
        None => "value (empty)".to_string(),
    }
}

async fn handle_write(
    arg: &str,
    handler: &Arc<Broadcaster>,
    specs: &[CharacteristicSpec],
    values: &ValueMap,
) -> String {
    let (uuid_arg, hex) = match arg.split_once(' ') {
        Some((uuid_arg, hex)) => (uuid_arg.trim(), hex.trim()),
        None => (arg, ""),
    };
    let spec = match find_spec(specs, uuid_arg) {
        Ok(spec) => spec,
        Err(e) => return e,
    };
    if !spec.writeable {
        return format!("error: {} is not writeable", short_uuid(spec.uuid));
    }
    let bytes = match hex_decode(hex) {
        Ok(bytes) => bytes,
        Err(e) => return format!("error: {}", e),
    };
    match handler.handle_write(spec.uuid, &bytes).await {
        Some(response) => {
            values.lock().await.insert(spec.uuid, response.clone());
            format!("resp {}", hex_encode(&response))
        }
        None => "(no response)".to_string(),
    }
}

async fn handle_sub(
    arg: &str,
    addr: SocketAddr,
    handler: &Arc<Broadcaster>,
    specs: &[CharacteristicSpec],
    subscribers: &SubscriberMap,
    writer: &SharedWriter,
) -> String {
    let spec = match find_spec(specs, arg) {
        Ok(spec) => spec,
        Err(e) => return e,
    };
    if !spec.notify && !spec.indicate {
        return format!("error: {} does not notify", short_uuid(spec.uuid));
    }

    let client = addr.to_string();
    {
        let mut subs = subscribers.lock().await;
        let list = subs.entry(spec.uuid).or_default();
        if !list.iter().any(|(c, _)| c == &client) {
            list.push((client.clone(), writer.clone()));
        }
    }
    handler.handle_subscribe(spec.uuid, &client).await;
    format!(
        "subscribed to {}. pushed as 'data {} <hex>' lines.",
        short_uuid(spec.uuid),
        short_uuid(spec.uuid),
    )
}

/// Resolve a 16-bit hex UUID argument against the registered characteristics.
/// Errors come back as ready-to-print lines.
fn find_spec<'a>(specs: &'a [CharacteristicSpec], arg: &str) -> Result<&'a CharacteristicSpec, String> {
    let short = match u16::from_str_radix(arg.trim_start_matches("0x"), 16) {
        Ok(short) => short,
        Err(_) => return Err(format!("error: bad characteristic '{}'", arg)),
    };
    let uuid = protocol::ble_uuid(short);
    specs
        .iter()
        .find(|s| s.uuid == uuid)
        .ok_or_else(|| format!("error: no characteristic {:04x}", short))
}

async fn write_line(
    writer: &SharedWriter,
    line: &str,
) -> Result<(), Box<dyn Error + Send + Sync>> {
    let mut w = writer.lock().await;
    w.write_all(line.as_bytes()).await?;
    w.write_all(b"\n").await?;
    Ok(())
}

/// The 16-bit alias of a full 128-bit BLE UUID, as lowercase hex.
fn short_uuid(uuid: Uuid) -> String {
    format!("{:04x}", (uuid.as_u128() >> 96) as u16)
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect::<Vec<_>>().join("")
}

fn hex_decode(hex: &str) -> Result<Vec<u8>, Box<dyn Error + Send + Sync>> {
    let hex = hex.replace(' ', "");
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|e| -> Box<dyn Error + Send + Sync> { Box::new(e) })
        })
        .collect()
}

const HELP_TEXT: &str = "\
commands:
  read <uuid16>        read a characteristic value as hex
  write <uuid16> <hex> write to a characteristic, show the indication
  sub <uuid16>         stream a characteristic's notifications as hex
  state                show current bike state (human-readable)
  help                 this message
  quit                 disconnect

characteristics:
  2acc  Fitness Machine Feature (read)
  2ad2  Indoor Bike Data (notify, 4 Hz)
  2ad6  Supported Resistance Level Range (read)
  2ad8  Supported Power Range (read)
  2ad9  Fitness Machine Control Point (write + indicate)
  2ada  Fitness Machine Status (notify)

control point examples:
  write 2ad9 00        Request Control
  write 2ad9 01        Reset
  write 2ad9 04 14     Set Target Resistance 20
  write 2ad9 05 c800   Set Target Power 200 W (watts as int16 LE)
  write 2ad9 07        Start or Resume
  write 2ad9 08 01     Stop
  write 2ad9 08 02     Pause
  write 2ad9 11        Set Simulation Parameters

all values are little-endian hex, matching raw BLE GATT traffic.";
