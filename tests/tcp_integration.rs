//! End-to-end integration tests via the TCP debug backend.
//!
//! These tests connect to a running ftms-bike-daemon debug port, exchange
//! raw FTMS bytes, and verify the daemon:
//! 1. Serves the advertised characteristic values
//! 2. Returns correct control point response indications
//! 3. Streams Indoor Bike Data frames at 4 Hz to subscribers
//!
//! Requirements:
//!   - ftms-bike-daemon running with: --backend tcp [--port 8830]
//!
//! Run:
//!   cargo test --test tcp_integration -- --ignored --test-threads=1
//!
//! Set FTMS_HOST to override the target (default: localhost)
//! Set FTMS_PORT to override the port (default: 8830)

use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::sleep;

fn host() -> String {
    std::env::var("FTMS_HOST").unwrap_or_else(|_| "localhost".to_string())
}

fn port() -> u16 {
    std::env::var("FTMS_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8830)
}

struct DebugClient {
    reader: tokio::io::Lines<BufReader<tokio::net::tcp::OwnedReadHalf>>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl DebugClient {
    async fn connect() -> Self {
        let addr = format!("{}:{}", host(), port());
        let stream = TcpStream::connect(&addr)
            .await
            .unwrap_or_else(|e| panic!("Failed to connect to debug server at {}: {}", addr, e));

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader).lines();

        // Consume the welcome line
        let welcome = reader.next_line().await.unwrap().unwrap();
        assert!(
            welcome.contains("connected"),
            "Expected welcome message, got: {}",
            welcome
        );

        Self { reader, writer }
    }

    /// Send a command and collect all response lines until quiet.
    async fn send_cmd(&mut self, cmd: &str) -> Vec<String> {
        self.send_cmd_timeout(cmd, Duration::from_secs(2)).await
    }

    /// Like send_cmd but with a shorter timeout, for batch tests where we
    /// send hundreds of commands and don't want to wait 2s each.
    async fn send_cmd_fast(&mut self, cmd: &str) -> Vec<String> {
        self.send_cmd_timeout(cmd, Duration::from_millis(200)).await
    }

    async fn send_cmd_timeout(&mut self, cmd: &str, timeout: Duration) -> Vec<String> {
        self.writer
            .write_all(format!("{}\n", cmd).as_bytes())
            .await
            .unwrap();

        // Small delay to let the daemon process
        sleep(Duration::from_millis(50)).await;

        let mut lines = Vec::new();
        // The server writes "ftms-debug> " as a prompt between responses;
        // read until quiet and strip the prompt wherever it lands.
        loop {
            match tokio::time::timeout(timeout, self.reader.next_line()).await {
                Ok(Ok(Some(line))) => {
                    let trimmed = line.trim().to_string();
                    if trimmed.is_empty() || trimmed == "ftms-debug>" {
                        continue;
                    }
                    let clean = if trimmed.starts_with("ftms-debug> ") {
                        trimmed.trim_start_matches("ftms-debug> ").to_string()
                    } else {
                        trimmed
                    };
                    if clean.is_empty() {
                        continue;
                    }
                    lines.push(clean);
                }
                Ok(Ok(None)) => break, // EOF
                Ok(Err(_)) => break,   // IO error
                Err(_) => break,       // Timeout, no more lines
            }
        }
        lines
    }

    /// Collect pushed `data <uuid16> <hex>` lines for roughly `window`.
    async fn collect_data_lines(&mut self, window: Duration) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + window;
        let mut data_lines = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.reader.next_line()).await {
                Ok(Ok(Some(line))) => {
                    let trimmed = line.trim().trim_start_matches("ftms-debug>").trim();
                    if trimmed.starts_with("data ") {
                        data_lines.push(trimmed.to_string());
                    }
                }
                _ => break,
            }
        }
        data_lines
    }

    /// Extract the hex response from a "resp XXXX" line.
    fn extract_resp(lines: &[String]) -> Option<String> {
        lines
            .iter()
            .find(|l| l.starts_with("resp "))
            .map(|l| l.trim_start_matches("resp ").to_string())
    }

    /// Extract the hex value from a "value XXXX" line.
    fn extract_value(lines: &[String]) -> Option<String> {
        lines
            .iter()
            .find(|l| l.starts_with("value "))
            .map(|l| l.trim_start_matches("value ").to_string())
    }

    /// Parse the "state" response into key-value pairs.
    fn parse_state(lines: &[String]) -> std::collections::HashMap<String, String> {
        let mut map = std::collections::HashMap::new();
        for line in lines {
            if let Some((key, val)) = line.split_once(':') {
                map.insert(key.trim().to_string(), val.trim().to_string());
            }
        }
        map
    }
}

// ---- Tests ----
// Run sequentially: --test-threads=1
// Each test is self-contained against a freshly connected client.

#[tokio::test]
#[ignore]
async fn test_01_connect_and_read_state() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("state").await;
    assert!(!lines.is_empty(), "state should return output");

    let state = DebugClient::parse_state(&lines);
    assert!(state.contains_key("phase"), "state should contain phase");
    assert!(state.contains_key("power"), "state should contain power");
    assert!(state.contains_key("cadence"), "state should contain cadence");
    assert!(
        state["phase"].contains("Advertising"),
        "daemon should be advertising, got: {}",
        state["phase"]
    );

    println!("State: {:?}", state);
}

#[tokio::test]
#[ignore]
async fn test_02_read_feature_characteristic() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("read 2acc").await;
    let hex = DebugClient::extract_value(&lines).expect("should get value");
    assert_eq!(hex.len(), 16, "Feature should be 8 bytes = 16 hex chars");

    // Machine features: cadence + distance + heart rate + energy + power
    assert_eq!(hex, "c640000000000000");
    println!("Feature: {}", hex);
}

#[tokio::test]
#[ignore]
async fn test_03_read_power_range() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("read 2ad8").await;
    let hex = DebugClient::extract_value(&lines).expect("should get value");
    let bytes = hex_to_bytes(&hex);
    assert_eq!(bytes.len(), 6);

    let min = u16::from_le_bytes([bytes[0], bytes[1]]);
    let max = u16::from_le_bytes([bytes[2], bytes[3]]);
    let step = u16::from_le_bytes([bytes[4], bytes[5]]);

    assert_eq!(min, 0, "min power 0 W");
    assert_eq!(max, 2000, "max power 2000 W");
    assert_eq!(step, 1, "step 1 W");

    println!("Power range: min={} max={} step={}", min, max, step);
}

#[tokio::test]
#[ignore]
async fn test_04_read_resistance_range() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("read 2ad6").await;
    let hex = DebugClient::extract_value(&lines).expect("should get value");
    let bytes = hex_to_bytes(&hex);
    assert_eq!(bytes.len(), 6);

    let min = i16::from_le_bytes([bytes[0], bytes[1]]);
    let max = i16::from_le_bytes([bytes[2], bytes[3]]);
    let step = i16::from_le_bytes([bytes[4], bytes[5]]);

    assert_eq!(min, 0, "min resistance 0");
    assert_eq!(max, 100, "max resistance 100");
    assert_eq!(step, 1, "step 1");

    println!("Resistance range: min={} max={} step={}", min, max, step);
}

#[tokio::test]
#[ignore]
async fn test_05_request_control() {
    let mut client = DebugClient::connect().await;

    // FTMS opcode 0x00 = Request Control
    let lines = client.send_cmd("write 2ad9 00").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");

    // Expected: 0x80 (response), 0x00 (request opcode), 0x01 (success)
    assert_eq!(resp, "800001", "Request Control should succeed");

    // state should reflect the grant
    let lines = client.send_cmd("state").await;
    let state = DebugClient::parse_state(&lines);
    assert!(
        state["control"].contains("granted"),
        "control should be granted, got: {}",
        state["control"]
    );
    println!("Request Control response: {}", resp);
}

#[tokio::test]
#[ignore]
async fn test_06_control_point_command_set() {
    let mut client = DebugClient::connect().await;

    // Every supported opcode acknowledges with SUCCESS
    let cases = [
        ("write 2ad9 00", "800001"),      // Request Control
        ("write 2ad9 01", "800101"),      // Reset
        ("write 2ad9 04 14", "800401"),   // Set Target Resistance 20
        ("write 2ad9 05 c800", "800501"), // Set Target Power 200 W
        ("write 2ad9 07", "800701"),      // Start/Resume
        ("write 2ad9 08 01", "800801"),   // Stop
        ("write 2ad9 08 02", "800801"),   // Pause (same echo, param differs)
        ("write 2ad9 11", "801101"),      // Set Simulation Parameters
    ];

    for (cmd, expected) in &cases {
        let lines = client.send_cmd(cmd).await;
        let resp = DebugClient::extract_resp(&lines)
            .unwrap_or_else(|| panic!("no resp for '{}'", cmd));
        assert_eq!(&resp, expected, "unexpected response for '{}'", cmd);
    }
    println!("All supported opcodes acknowledged");
}

#[tokio::test]
#[ignore]
async fn test_07_unknown_opcode_returns_not_supported() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("write 2ad9 ff").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");

    // Expected: 0x80 (response), 0xFF (request opcode), 0x02 (not supported)
    assert_eq!(resp, "80ff02", "Unknown opcode should return NOT_SUPPORTED");
    println!("Unknown opcode response: {}", resp);
}

#[tokio::test]
#[ignore]
async fn test_08_subscribe_data_stream() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("sub 2ad2").await;
    assert!(
        lines.iter().any(|l| l.contains("subscribed")),
        "sub should confirm, got: {:?}",
        lines
    );

    // 4 Hz: a 1.2 s window should deliver at least 3 frames
    let data_lines = client.collect_data_lines(Duration::from_millis(1200)).await;
    assert!(
        data_lines.len() >= 3,
        "expected >=3 frames in 1.2s at 4 Hz, got {}",
        data_lines.len()
    );

    for line in &data_lines {
        let mut parts = line.split_whitespace();
        assert_eq!(parts.next(), Some("data"));
        assert_eq!(parts.next(), Some("2ad2"));
        let hex = parts.next().expect("data line should carry hex");
        let bytes = hex_to_bytes(hex);
        assert_eq!(bytes.len(), 19, "Indoor Bike Data frame is 19 bytes");

        let flags = u16::from_le_bytes([bytes[0], bytes[1]]);
        assert_eq!(flags, 0x0B54, "flags: cadence+distance+power+energy+hr+elapsed");
    }
    println!("Received {} frames at 4 Hz", data_lines.len());
}

#[tokio::test]
#[ignore]
async fn test_09_machine_status_stays_silent() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("sub 2ada").await;
    assert!(lines.iter().any(|l| l.contains("subscribed")));

    // Registered but never pushed
    let data_lines = client.collect_data_lines(Duration::from_millis(1200)).await;
    let status_lines: Vec<_> = data_lines
        .iter()
        .filter(|l| l.starts_with("data 2ada"))
        .collect();
    assert!(
        status_lines.is_empty(),
        "Machine Status should never notify, got {:?}",
        status_lines
    );
    println!("Machine Status stayed silent");
}

#[tokio::test]
#[ignore]
async fn test_10_control_point_value_tracks_last_response() {
    let mut client = DebugClient::connect().await;

    let lines = client.send_cmd("write 2ad9 07").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");
    assert_eq!(resp, "800701");

    // Reading the control point returns the response just indicated
    let lines = client.send_cmd("read 2ad9").await;
    let value = DebugClient::extract_value(&lines).expect("should get value");
    assert_eq!(value, "800701", "CP value should be the last response");
    println!("CP value tracks last response");
}

// ---- Robustness tests ----
// These hammer the daemon with garbage to verify it never crashes or hangs.

#[tokio::test]
#[ignore]
async fn test_20_garbage_commands() {
    let mut client = DebugClient::connect().await;

    let garbage = [
        "",
        " ",
        "   ",
        "asdfghjkl",
        "DROP TABLE",
        "../../etc/passwd",
        "\x00\x01\x02\x03",
        "read",            // read with no uuid
        "read zz",         // read with bad uuid
        "read 9999",       // read of unknown characteristic
        "write",           // write with no argument
        "write 2ad9 xyz",  // write with invalid hex
        "write 2ad9 0",    // odd-length hex
        "sub",             // sub with no uuid
        "sub 2acc",        // sub to a non-notifying characteristic
        "STATE",           // wrong case (lowercased by the server)
        "sTaTe",           // mixed case
        "stat",            // close but wrong
        &"a".repeat(10000), // very long command
    ];

    for cmd in &garbage {
        let lines = client.send_cmd_fast(cmd).await;
        println!(
            "Garbage '{}...' -> {} lines",
            &cmd[..cmd.len().min(30)],
            lines.len()
        );
    }

    // Very long hex payload, separate because it's an owned String
    let long_hex = "write 2ad9 ".to_owned() + &"ff".repeat(5000);
    let lines = client.send_cmd(&long_hex).await;
    println!("Long hex payload -> {} lines", lines.len());

    // Daemon should still be functional after all the garbage
    let lines = client.send_cmd("state").await;
    assert!(!lines.is_empty(), "daemon should still respond after garbage");
    let state = DebugClient::parse_state(&lines);
    assert!(state.contains_key("phase"), "state should still be valid");
    println!("Daemon survived garbage barrage");
}

#[tokio::test]
#[ignore]
async fn test_21_all_single_byte_opcodes() {
    let mut client = DebugClient::connect().await;

    // Send every possible single-byte control point opcode (0x00 - 0xFF).
    // The goal is crash resistance, not per-opcode matching, so the response
    // format is verified generically.
    let mut valid_responses = 0;
    for byte in 0u8..=255 {
        let lines = client
            .send_cmd_fast(&format!("write 2ad9 {:02x}", byte))
            .await;

        if let Some(r) = DebugClient::extract_resp(&lines) {
            // Response is always 3 bytes: 80 <opcode> <result>
            assert_eq!(r.len(), 6, "response should be 3 bytes (6 hex), got: {}", r);
            assert!(r.starts_with("80"), "response should start with 0x80, got: {}", r);
            let result = u8::from_str_radix(&r[4..6], 16).unwrap();
            assert!(
                (1..=2).contains(&result),
                "result should be SUCCESS or NOT_SUPPORTED, got {} in {}",
                result,
                r
            );
            valid_responses += 1;
        }
    }

    assert!(
        valid_responses >= 200,
        "should get valid responses for most opcodes, got {}/256",
        valid_responses
    );

    // Still alive?
    let lines = client.send_cmd("read 2acc").await;
    assert!(!lines.is_empty(), "daemon should survive all 256 opcodes");
    println!(
        "Daemon survived all 256 single-byte opcodes ({} valid responses)",
        valid_responses
    );
}

#[tokio::test]
#[ignore]
async fn test_22_extreme_target_values() {
    let mut client = DebugClient::connect().await;
    client.send_cmd("write 2ad9 00").await; // Request control

    // Power = 0 W
    let lines = client.send_cmd("write 2ad9 05 0000").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");
    assert_eq!(resp, "800501");

    // Power = i16::MAX (32767 W, track sprinter on rocket fuel)
    let lines = client.send_cmd("write 2ad9 05 ff7f").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");
    assert_eq!(resp, "800501");

    // Power = i16::MIN (negative power, braking)
    let lines = client.send_cmd("write 2ad9 05 0080").await;
    let resp = DebugClient::extract_resp(&lines).expect("should get resp");
    assert_eq!(resp, "800501");

    // Resistance 0 and 255
    let lines = client.send_cmd("write 2ad9 04 00").await;
    assert_eq!(DebugClient::extract_resp(&lines).unwrap(), "800401");
    let lines = client.send_cmd("write 2ad9 04 ff").await;
    assert_eq!(DebugClient::extract_resp(&lines).unwrap(), "800401");

    // Truncated parameters still acknowledge
    let lines = client.send_cmd("write 2ad9 05 c8").await;
    assert_eq!(DebugClient::extract_resp(&lines).unwrap(), "800501");
    let lines = client.send_cmd("write 2ad9 04").await;
    assert_eq!(DebugClient::extract_resp(&lines).unwrap(), "800401");

    let lines = client.send_cmd("state").await;
    assert!(!lines.is_empty(), "daemon should survive extreme targets");
    println!("Daemon survived extreme target values");
}

#[tokio::test]
#[ignore]
async fn test_23_rapid_fire_commands() {
    let mut client = DebugClient::connect().await;
    client.send_cmd("write 2ad9 00").await;

    // Blast 100 target power changes as fast as possible
    for i in 0..100u16 {
        let power = i * 5;
        let lo = (power & 0xFF) as u8;
        let hi = ((power >> 8) & 0xFF) as u8;
        let _ = client
            .send_cmd_fast(&format!("write 2ad9 05 {:02x}{:02x}", lo, hi))
            .await;
    }

    // Still alive and responsive?
    let lines = client.send_cmd("state").await;
    assert!(!lines.is_empty(), "daemon should survive rapid fire");
    println!("Daemon survived 100 rapid-fire power commands");
}

#[tokio::test]
#[ignore]
async fn test_24_concurrent_connections() {
    // Open 5 connections simultaneously, all sending commands
    let mut handles = Vec::new();

    for i in 0..5 {
        let handle = tokio::spawn(async move {
            let mut client = DebugClient::connect().await;
            let lines = client.send_cmd("state").await;
            assert!(!lines.is_empty(), "connection {} should get state", i);
            let lines = client.send_cmd("read 2acc").await;
            assert!(!lines.is_empty(), "connection {} should get feature", i);
            let lines = client.send_cmd("write 2ad9 00").await;
            assert!(!lines.is_empty(), "connection {} should get resp", i);
            client.send_cmd("quit").await;
            println!("Connection {} completed successfully", i);
        });
        handles.push(handle);
    }

    for (i, handle) in handles.into_iter().enumerate() {
        handle
            .await
            .unwrap_or_else(|e| panic!("Connection {} panicked: {}", i, e));
    }

    println!("Daemon survived 5 concurrent connections");
}

// ---- Helpers ----

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}
