//! JSON status channel on stdout.
//!
//! The parent process consumes stdout line by line, so every record is one
//! JSON object per line, flushed as soon as it is written. Diagnostics go to
//! stderr via `log`; stdout carries only protocol records:
//!
//!   {"status": "advertising", "device_name": "..."}
//!   {"status": "connected", "client": "..."}
//!   {"status": "stopped"}
//!   {"log": "..."}

use std::io::Write;
#[cfg(test)]
use std::sync::{Arc, Mutex};

use log::info;
use serde_json::json;

/// Clone-able emitter for the line-oriented stdout protocol.
#[derive(Clone)]
pub struct Emitter {
    sink: Sink,
}

#[derive(Clone)]
enum Sink {
    Stdout,
    #[cfg(test)]
    Memory(Arc<Mutex<Vec<String>>>),
}

impl Emitter {
    pub fn stdout() -> Self {
        Emitter { sink: Sink::Stdout }
    }

    /// Emitter that captures records in memory instead of writing stdout.
    #[cfg(test)]
    pub fn memory() -> (Self, Arc<Mutex<Vec<String>>>) {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let emitter = Emitter {
            sink: Sink::Memory(buf.clone()),
        };
        (emitter, buf)
    }

    pub fn advertising(&self, device_name: &str) {
        self.emit(json!({"status": "advertising", "device_name": device_name}));
    }

    pub fn connected(&self, client: &str) {
        self.emit(json!({"status": "connected", "client": client}));
    }

    pub fn stopped(&self) {
        self.emit(json!({"status": "stopped"}));
    }

    /// Emit a protocol log record, mirrored to the stderr diagnostic log.
    pub fn log(&self, msg: &str) {
        info!("{}", msg);
        self.emit(json!({"log": msg}));
    }

    fn emit(&self, record: serde_json::Value) {
        match &self.sink {
            Sink::Stdout => {
                // The consumer may disappear mid-run (closed pipe); dropping
                // the record is better than taking the daemon down with it.
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", record);
                let _ = out.flush();
            }
            #[cfg(test)]
            Sink::Memory(buf) => {
                buf.lock().unwrap().push(record.to_string());
            }
        }
    }
}
