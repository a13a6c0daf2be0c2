//! FTMS Control Point engine.
//!
//! Processes Control Point writes against the session state and produces the
//! 3-byte response indication for each opcode-bearing write. Target commands
//! are acknowledged but drive no actuator: this daemon emulates an
//! instrument, not a trainer, so clients get the handshake they expect and
//! nothing moves.

use log::debug;
use tokio::sync::Mutex;

use crate::protocol::{self, ControlRequest, DecodeError};
use crate::status::Emitter;

/// Control Point authority state. The grant is recorded and reported but
/// never enforced: a single-rider machine has no arbitration to do, and
/// apps expect their commands to work immediately after REQUEST_CONTROL.
#[derive(Debug, Default)]
pub struct Session {
    control_granted: bool,
}

impl Session {
    pub fn granted(&self) -> bool {
        self.control_granted
    }
}

/// The Control Point request/response engine.
pub struct ControlPoint {
    session: Mutex<Session>,
    emitter: Emitter,
}

impl ControlPoint {
    pub fn new(emitter: Emitter) -> Self {
        ControlPoint {
            session: Mutex::new(Session::default()),
            emitter,
        }
    }

    /// Whether any client has requested control yet.
    pub async fn granted(&self) -> bool {
        self.session.lock().await.granted()
    }

    /// Process one Control Point write. Returns the 3-byte response
    /// indication, or `None` for a zero-length write (no opcode to echo,
    /// nothing to respond to).
    pub async fn handle_write(&self, bytes: &[u8]) -> Option<Vec<u8>> {
        let request = match protocol::parse_control_request(bytes) {
            Ok(req) => req,
            Err(DecodeError::EmptyWrite) => {
                self.emitter.log("Ignoring empty control point write");
                return None;
            }
        };

        let result = match &request {
            ControlRequest::RequestControl => {
                self.session.lock().await.control_granted = true;
                self.emitter.log("Control granted to client");
                protocol::RESULT_SUCCESS
            }
            ControlRequest::Reset => {
                self.emitter.log("Reset requested");
                protocol::RESULT_SUCCESS
            }
            ControlRequest::SetTargetResistance(level) => {
                match level {
                    Some(level) => {
                        self.emitter.log(&format!("Target resistance set to {}", level))
                    }
                    None => debug!("Target resistance write without a level byte"),
                }
                protocol::RESULT_SUCCESS
            }
            ControlRequest::SetTargetPower(watts) => {
                match watts {
                    Some(watts) => {
                        self.emitter.log(&format!("Target power set to {} W", watts))
                    }
                    None => debug!("Target power write without a target"),
                }
                protocol::RESULT_SUCCESS
            }
            ControlRequest::StartOrResume => {
                self.emitter.log("Start/Resume requested");
                protocol::RESULT_SUCCESS
            }
            ControlRequest::StopOrPause(param) => {
                self.emitter
                    .log(&format!("Stop/Pause requested (param={})", param));
                protocol::RESULT_SUCCESS
            }
            ControlRequest::SetSimulation => {
                self.emitter.log("Simulation parameters received");
                protocol::RESULT_SUCCESS
            }
            ControlRequest::Unrecognized(op) => {
                self.emitter
                    .log(&format!("Unsupported opcode: 0x{:02x}", op));
                protocol::RESULT_NOT_SUPPORTED
            }
        };

        Some(protocol::encode_control_response(request.opcode(), result))
    }
}
