//! FTMS (Fitness Machine Service) binary protocol encoding/decoding.
//!
//! All multi-byte values are little-endian per the Bluetooth GATT specification.
//! Indoor bike units: cadence in 0.5 rpm resolution, power in watts, distance
//! in meters.

use thiserror::Error;
use uuid::Uuid;

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

// FTMS service and characteristic UUIDs
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const INDOOR_BIKE_DATA_UUID: Uuid = ble_uuid(0x2AD2);
pub const RESISTANCE_RANGE_UUID: Uuid = ble_uuid(0x2AD6);
pub const POWER_RANGE_UUID: Uuid = ble_uuid(0x2AD8);
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

#[derive(Debug, PartialEq)]
pub enum ControlRequest {
    RequestControl,
    Reset,
    SetTargetResistance(Option<u8>), // resistance level; None = written without its param
    SetTargetPower(Option<i16>),     // watts; None = written without its param
    StartOrResume,
    StopOrPause(u8),                 // 1=stop, 2=pause
    SetSimulation,                   // wind/grade/crr/cw params are not interpreted
    Unrecognized(u8),
}

impl ControlRequest {
    /// The request opcode, echoed back in the response indication.
    pub fn opcode(&self) -> u8 {
        match self {
            ControlRequest::RequestControl => 0x00,
            ControlRequest::Reset => 0x01,
            ControlRequest::SetTargetResistance(_) => 0x04,
            ControlRequest::SetTargetPower(_) => 0x05,
            ControlRequest::StartOrResume => 0x07,
            ControlRequest::StopOrPause(_) => 0x08,
            ControlRequest::SetSimulation => 0x11,
            ControlRequest::Unrecognized(op) => *op,
        }
    }
}

// Control Point result codes (FTMS spec Table 4.24)
pub const RESULT_SUCCESS: u8 = 0x01;
pub const RESULT_NOT_SUPPORTED: u8 = 0x02;
pub const RESULT_INVALID_PARAM: u8 = 0x03;
pub const RESULT_FAILED: u8 = 0x04;
pub const RESPONSE_CODE: u8 = 0x80;

/// Error from decoding a Control Point write.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// Zero-length writes carry no opcode and get no response indication.
    #[error("empty control point write")]
    EmptyWrite,
}

/// Encode FTMS Indoor Bike Data characteristic (0x2AD2).
///
/// Flags 0x0B54 = bits 2,4,6,8,9,11 set:
///   - Bit 0 = 0: Instantaneous Speed present (we always report 0)
///   - Bit 2 = 1: Instantaneous Cadence present
///   - Bit 4 = 1: Total Distance present
///   - Bit 6 = 1: Instantaneous Power present
///   - Bit 8 = 1: Expended Energy present
///   - Bit 9 = 1: Heart Rate present
///   - Bit 11 = 1: Elapsed Time present
///
/// Layout: flags(2) + speed(2) + cadence(2) + distance(3) + power(2)
/// + energy(2+2+1) + heart_rate(1) + elapsed(2) = 19 bytes
pub fn encode_indoor_bike_data(
    cadence_half_rpm: u16,
    distance_meters: u32,
    power_watts: i16,
    calories_kcal: u16,
    heart_rate_bpm: u8,
    elapsed_secs: u16,
) -> Vec<u8> {
    let flags: u16 = 0x0B54;
    let mut buf = Vec::with_capacity(19);

    // Flags (uint16 LE)
    buf.extend_from_slice(&flags.to_le_bytes());

    // Instantaneous Speed (uint16 LE, km/h with 0.01 resolution) — no speed
    // sensor, always 0; apps derive speed from power/cadence anyway
    buf.extend_from_slice(&0u16.to_le_bytes());

    // Instantaneous Cadence (uint16 LE, rpm with 0.5 resolution)
    buf.extend_from_slice(&cadence_half_rpm.to_le_bytes());

    // Total Distance (uint24 LE, meters)
    let dist_bytes = distance_meters.to_le_bytes();
    buf.push(dist_bytes[0]);
    buf.push(dist_bytes[1]);
    buf.push(dist_bytes[2]);

    // Instantaneous Power (sint16 LE, watts)
    buf.extend_from_slice(&power_watts.to_le_bytes());

    // Total Energy (uint16 LE, kcal)
    buf.extend_from_slice(&calories_kcal.to_le_bytes());

    // Energy Per Hour (uint16 LE) and Energy Per Minute (uint8) — not tracked
    buf.extend_from_slice(&0u16.to_le_bytes());
    buf.push(0u8);

    // Heart Rate (uint8, bpm)
    buf.push(heart_rate_bpm);

    // Elapsed Time (uint16 LE, seconds)
    buf.extend_from_slice(&elapsed_secs.to_le_bytes());

    buf
}

/// Encode FTMS Feature characteristic (0x2ACC).
///
/// Fitness Machine Features (uint32 LE):
///   - Bit 1: Cadence Supported
///   - Bit 2: Total Distance Supported
///   - Bit 6: Heart Rate Measurement Supported
///   - Bit 7: Expended Energy Supported
///   - Bit 14: Power Measurement Supported
///   = 0x0000_40C6
///
/// Target Setting Features (uint32 LE): none advertised = 0
/// (targets are acknowledged on the Control Point but drive no actuator).
pub fn encode_feature() -> [u8; 8] {
    let machine_features: u32 = 0x0000_40C6;
    let target_features: u32 = 0x0000_0000;
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Encode Supported Power Range characteristic (0x2AD8).
///
/// 3x uint16 LE: minimum, maximum, step (all in watts).
///   - Min: 0
///   - Max: 2000
///   - Step: 1
pub fn encode_power_range() -> [u8; 6] {
    let min: u16 = 0;
    let max: u16 = 2000;
    let step: u16 = 1;
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&min.to_le_bytes());
    buf[2..4].copy_from_slice(&max.to_le_bytes());
    buf[4..6].copy_from_slice(&step.to_le_bytes());
    buf
}

/// Encode Supported Resistance Level Range characteristic (0x2AD6).
///
/// 3x sint16 LE: minimum, maximum, step (unitless resistance levels).
///   - Min: 0
///   - Max: 100
///   - Step: 1
pub fn encode_resistance_range() -> [u8; 6] {
    let min: i16 = 0;
    let max: i16 = 100;
    let step: i16 = 1;
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&min.to_le_bytes());
    buf[2..4].copy_from_slice(&max.to_le_bytes());
    buf[4..6].copy_from_slice(&step.to_le_bytes());
    buf
}

/// Parse an FTMS Control Point write (0x2AD9).
///
/// Every opcode-bearing write parses: unknown opcodes come back as
/// `Unrecognized` so the caller can answer NOT_SUPPORTED, and the optional
/// params of stop, target power, and target resistance may be absent.
/// Only a zero-length write is an error.
pub fn parse_control_request(bytes: &[u8]) -> Result<ControlRequest, DecodeError> {
    let opcode = *bytes.first().ok_or(DecodeError::EmptyWrite)?;
    let req = match opcode {
        0x00 => ControlRequest::RequestControl,
        0x01 => ControlRequest::Reset,
        0x04 => {
            // Set Target Resistance Level: opcode(1) + uint8
            ControlRequest::SetTargetResistance(bytes.get(1).copied())
        }
        0x05 => {
            // Set Target Power: opcode(1) + sint16 LE
            let target = if bytes.len() >= 3 {
                Some(i16::from_le_bytes([bytes[1], bytes[2]]))
            } else {
                None
            };
            ControlRequest::SetTargetPower(target)
        }
        0x07 => ControlRequest::StartOrResume,
        0x08 => {
            // Stop or Pause: opcode(1) + uint8; a bare opcode means stop
            ControlRequest::StopOrPause(bytes.get(1).copied().unwrap_or(1))
        }
        0x11 => ControlRequest::SetSimulation,
        other => ControlRequest::Unrecognized(other),
    };
    Ok(req)
}

/// Encode a Control Point response indication.
///
/// Format: `[0x80, request_opcode, result_code]`
pub fn encode_control_response(request_opcode: u8, result: u8) -> Vec<u8> {
    vec![RESPONSE_CODE, request_opcode, result]
}
