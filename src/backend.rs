//! Transport abstraction between the FTMS engine and whatever carries GATT.
//!
//! Two implementations: the real BlueZ stack (`bluez`) and a TCP line
//! protocol (`debug_server`) for driving the daemon without BLE hardware.
//! A backend owns the client-facing plumbing; it calls back into the
//! [`Broadcaster`] for characteristic reads, control point writes, and
//! subscribe/unsubscribe bookkeeping, and delivers control point responses
//! as indications itself.

use std::error::Error;
use std::sync::Arc;

use uuid::Uuid;

use crate::broadcaster::Broadcaster;

/// One GATT characteristic to expose: UUID plus the property set
/// (read/write/notify/indicate) and permission set (readable/writeable)
/// the transport must honor.
#[derive(Debug, Clone)]
pub struct CharacteristicSpec {
    pub uuid: Uuid,
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
    pub readable: bool,
    pub writeable: bool,
}

impl CharacteristicSpec {
    pub fn read_only(uuid: Uuid) -> Self {
        CharacteristicSpec {
            uuid,
            read: true,
            write: false,
            notify: false,
            indicate: false,
            readable: true,
            writeable: false,
        }
    }

    /// Notify property only, but still readable at the permission level so
    /// debug transports can inspect the current value.
    pub fn notify_only(uuid: Uuid) -> Self {
        CharacteristicSpec {
            uuid,
            read: false,
            write: false,
            notify: true,
            indicate: false,
            readable: true,
            writeable: false,
        }
    }

    /// Write + indicate, the Control Point shape.
    pub fn write_indicate(uuid: Uuid) -> Self {
        CharacteristicSpec {
            uuid,
            read: false,
            write: true,
            notify: false,
            indicate: true,
            readable: true,
            writeable: true,
        }
    }
}

/// A GATT transport.
///
/// `register_service` wires the characteristics to the handler;
/// `notify` pushes a value to the live subscribers of one characteristic.
/// Registration and advertising failures are fatal to the caller;
/// `stop_advertising` failures are not (shutdown proceeds regardless).
pub trait Backend {
    async fn register_service(
        &mut self,
        service_uuid: Uuid,
        characteristics: Vec<CharacteristicSpec>,
        handler: Arc<Broadcaster>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn start_advertising(
        &mut self,
        device_name: &str,
        service_uuids: &[Uuid],
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn notify(
        &mut self,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), Box<dyn Error + Send + Sync>>;

    async fn stop_advertising(&mut self);
}
