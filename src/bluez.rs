//! BLE GATT transport on BlueZ.
//!
//! Registers the FTMS service with bluer and advertises it so fitness apps
//! like Zwift, QZ Fitness, and Apple Watch can subscribe to Indoor Bike Data
//! and send control commands.
//!
//! Read-only characteristics use the Fun callback model. Everything that
//! notifies, indicates, or accepts writes uses the IO model instead: the IO
//! writer carries the subscriber's device address, which the engine needs
//! for its connection reporting, and the IO reader delivers each control
//! point write as one datagram.

use std::collections::HashMap;
use std::error::Error;
use std::sync::Arc;

use bluer::{
    adv::{Advertisement, AdvertisementHandle},
    gatt::local::{
        characteristic_control, Application, ApplicationHandle, Characteristic,
        CharacteristicControl, CharacteristicControlEvent, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, ReqError, Service,
    },
    gatt::{CharacteristicReader, CharacteristicWriter},
};
use futures::{pin_mut, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{Backend, CharacteristicSpec};
use crate::broadcaster::Broadcaster;
use crate::protocol::FTMS_SERVICE_UUID;

type WriterMap = Arc<Mutex<HashMap<Uuid, Vec<CharacteristicWriter>>>>;

pub struct BluezBackend {
    adapter: Option<bluer::Adapter>,
    handler: Option<Arc<Broadcaster>>,
    writers: WriterMap,
    adv_handle: Option<AdvertisementHandle>,
    app_handle: Option<ApplicationHandle>,
}

impl BluezBackend {
    pub fn new() -> Self {
        BluezBackend {
            adapter: None,
            handler: None,
            writers: Arc::new(Mutex::new(HashMap::new())),
            adv_handle: None,
            app_handle: None,
        }
    }
}

impl Backend for BluezBackend {
    async fn register_service(
        &mut self,
        service_uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
        handler: Arc<Broadcaster>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;

        info!(
            "Using Bluetooth adapter {} ({})",
            adapter.name(),
            adapter.address().await?
        );

        let mut gatt_characteristics = Vec::new();
        for spec in characteristics {
            let mut characteristic = Characteristic {
                uuid: spec.uuid,
                ..Default::default()
            };

            if spec.read {
                let handler = handler.clone();
                let uuid = spec.uuid;
                characteristic.read = Some(CharacteristicRead {
                    read: true,
                    fun: Box::new(move |_req| {
                        let handler = handler.clone();
                        async move {
                            debug!("Characteristic {} read", uuid);
                            match handler.read_value(uuid).await {
                                Some(value) => Ok(value),
                                None => Err(ReqError::NotSupported),
                            }
                        }
                        .boxed()
                    }),
                    ..Default::default()
                });
            }

            if spec.write || spec.notify || spec.indicate {
                let (control, control_handle) = characteristic_control();
                if spec.write {
                    characteristic.write = Some(CharacteristicWrite {
                        write: true,
                        method: CharacteristicWriteMethod::Io,
                        ..Default::default()
                    });
                }
                if spec.notify || spec.indicate {
                    characteristic.notify = Some(CharacteristicNotify {
                        notify: spec.notify,
                        indicate: spec.indicate,
                        method: CharacteristicNotifyMethod::Io,
                        ..Default::default()
                    });
                }
                characteristic.control_handle = control_handle;
                tokio::spawn(characteristic_loop(
                    spec.uuid,
                    control,
                    handler.clone(),
                    self.writers.clone(),
                ));
            }

            gatt_characteristics.push(characteristic);
        }

        let app = Application {
            services: vec![Service {
                uuid: service_uuid,
                primary: true,
                characteristics: gatt_characteristics,
                ..Default::default()
            }],
            ..Default::default()
        };

        self.app_handle = Some(adapter.serve_gatt_application(app).await?);
        self.adapter = Some(adapter);
        self.handler = Some(handler);
        Ok(())
    }

    async fn start_advertising(
        &mut self,
        device_name: &str,
        service_uuids: &[Uuid],
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let adapter = match &self.adapter {
            Some(adapter) => adapter,
            None => return Err("advertising requires a registered service".into()),
        };

        // FTMS spec Section 3.1: Service Data carries Flags (available) +
        // Fitness Machine Type (indoor bike)
        let ftms_service_data: Vec<u8> = vec![
            0x01, // Flags: bit 0 = Fitness Machine Available
            0x20, // Fitness Machine Type: bit 5 = Indoor Bike Supported
        ];
        let adv = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: service_uuids.iter().copied().collect(),
            service_data: [(FTMS_SERVICE_UUID, ftms_service_data)]
                .into_iter()
                .collect(),
            local_name: Some(device_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };
        self.adv_handle = Some(adapter.advertise(adv).await?);
        Ok(())
    }

    async fn notify(
        &mut self,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        if let Some(handler) = &self.handler {
            fan_out(&self.writers, handler, characteristic, &value).await;
        }
        Ok(())
    }

    async fn stop_advertising(&mut self) {
        if self.adv_handle.take().is_some() {
            info!("Advertising stopped");
        }
        // Unpublishing the application ends the characteristic IO streams,
        // which lets the per-characteristic tasks wind down
        drop(self.app_handle.take());
        self.writers.lock().await.clear();
    }
}

/// Push `value` to every live writer of `characteristic`, dropping the dead
/// ones. This is a datagram socket per writer, so a single write delivers
/// the whole frame as one notification or indication.
async fn fan_out(writers: &WriterMap, handler: &Arc<Broadcaster>, characteristic: Uuid, value: &[u8]) {
    let mut dropped: Vec<String> = Vec::new();
    {
        let mut map = writers.lock().await;
        if let Some(list) = map.get_mut(&characteristic) {
            let mut kept = Vec::new();
            for mut writer in list.drain(..) {
                let client = writer.device_address().to_string();
                match writer.write(value).await {
                    Ok(_) => kept.push(writer),
                    Err(e) => {
                        warn!("Push to {} on {} failed: {}", client, characteristic, e);
                        dropped.push(client);
                    }
                }
            }
            *list = kept;
        }
    }
    for client in dropped {
        handler.handle_unsubscribe(characteristic, &client).await;
    }
}

/// Event loop for one IO-mode characteristic: accepts write sessions, tracks
/// notify/indicate sessions, and routes incoming writes to the engine. The
/// loop ends when the application is unpublished.
async fn characteristic_loop(
    uuid: Uuid,
    control: CharacteristicControl,
    handler: Arc<Broadcaster>,
    writers: WriterMap,
) {
    let mut reader: Option<CharacteristicReader> = None;
    let mut read_buf = Vec::new();

    pin_mut!(control);

    loop {
        tokio::select! {
            evt = control.next() => {
                match evt {
                    Some(CharacteristicControlEvent::Write(req)) => {
                        info!(
                            "Write session on {} from {} (MTU {})",
                            uuid, req.device_address(), req.mtu()
                        );
                        read_buf = vec![0u8; req.mtu()];
                        match req.accept() {
                            Ok(r) => reader = Some(r),
                            Err(e) => error!("Failed to accept write on {}: {}", uuid, e),
                        }
                    }
                    Some(CharacteristicControlEvent::Notify(writer)) => {
                        let client = writer.device_address().to_string();
                        info!(
                            "Notify session on {} from {} (MTU {})",
                            uuid, client, writer.mtu()
                        );
                        writers.lock().await.entry(uuid).or_default().push(writer);
                        handler.handle_subscribe(uuid, &client).await;
                    }
                    None => {
                        debug!("Control stream for {} ended", uuid);
                        break;
                    }
                }
            }

            read_res = async {
                match &mut reader {
                    Some(reader) => reader.read(&mut read_buf).await,
                    None => futures::future::pending().await,
                }
            } => {
                match read_res {
                    Ok(0) => {
                        info!("Write stream on {} ended", uuid);
                        reader = None;
                    }
                    Ok(n) => {
                        let bytes = &read_buf[..n];
                        debug!("Write on {}: {} bytes {:02x?}", uuid, n, bytes);
                        if let Some(response) = handler.handle_write(uuid, bytes).await {
                            fan_out(&writers, &handler, uuid, &response).await;
                        }
                    }
                    Err(e) => {
                        warn!("Write read error on {}: {}", uuid, e);
                        reader = None;
                    }
                }
            }
        }
    }
}
