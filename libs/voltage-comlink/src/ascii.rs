//! Modbus ASCII transport over a half-duplex serial line
//!
//! Frame: `':'` + hex(unit, function, data) + hex(LRC) + CRLF.
//! One transaction owns the line at a time; waiting requests are served in
//! submission order by the fair `tokio::sync::Mutex` guarding the link.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout, Instant};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::constants::{
    ASCII_END, ASCII_MAX_FRAME_LEN, ASCII_MIN_FRAME_LEN, ASCII_START, DEFAULT_BAUD_RATE,
    DEFAULT_TIMEOUT_MS,
};
use crate::error::{Result, TransportError};
use crate::pdu::{parse_response_pdu, ModbusRequest, ModbusResponse};
use crate::traits::{ConnectionState, ModbusTransport};

/// Byte stream carrying the ASCII frames (serial port, or an in-memory pipe in tests)
pub trait SerialLink: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialLink for T {}

// ============================================================================
// Parameters
// ============================================================================

/// Serial line parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerialParams {
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Upper bound for one request/response transaction
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Quiet time held on the line after each transaction
    #[serde(default)]
    pub turnaround_ms: u64,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

// ASCII mode: 7 data bits, even parity, 1 stop bit
fn default_data_bits() -> u8 {
    7
}

fn default_parity() -> String {
    "Even".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for SerialParams {
    fn default() -> Self {
        Self {
            device: "/dev/ttyAMA0".to_string(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
            turnaround_ms: 0,
        }
    }
}

impl SerialParams {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn turnaround(&self) -> Duration {
        Duration::from_millis(self.turnaround_ms)
    }
}

// ============================================================================
// Frame Codec
// ============================================================================

/// LRC: two's complement of the 8-bit sum
pub fn calculate_lrc(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |acc, &b| acc.wrapping_add(b))
        .wrapping_neg()
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        _ => b'A' + nibble - 10,
    }
}

fn hex_value(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}

/// Build an ASCII frame for `unit` + `pdu`
pub fn encode_frame(unit: u8, pdu: &[u8]) -> Vec<u8> {
    let mut binary = Vec::with_capacity(pdu.len() + 2);
    binary.push(unit);
    binary.extend_from_slice(pdu);
    binary.push(calculate_lrc(&binary));

    let mut frame = Vec::with_capacity(1 + binary.len() * 2 + 2);
    frame.push(ASCII_START);
    for b in binary {
        frame.push(hex_digit(b >> 4));
        frame.push(hex_digit(b & 0x0F));
    }
    frame.extend_from_slice(ASCII_END);
    frame
}

/// Decode an ASCII frame into `(unit, pdu)`, verifying delimiters and LRC
pub fn decode_frame(frame: &[u8]) -> Result<(u8, Vec<u8>)> {
    if frame.len() < ASCII_MIN_FRAME_LEN {
        return Err(TransportError::malformed(format!(
            "ASCII frame too short: {} chars",
            frame.len()
        )));
    }
    if frame[0] != ASCII_START {
        return Err(TransportError::malformed("Missing ':' start delimiter"));
    }
    if !frame.ends_with(ASCII_END) {
        return Err(TransportError::malformed("Missing CRLF end delimiter"));
    }

    let hex = &frame[1..frame.len() - 2];
    if hex.len() % 2 != 0 {
        return Err(TransportError::malformed(format!(
            "Odd number of hex characters: {}",
            hex.len()
        )));
    }

    let mut binary = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks_exact(2) {
        match (hex_value(pair[0]), hex_value(pair[1])) {
            (Some(h), Some(l)) => binary.push((h << 4) | l),
            _ => {
                return Err(TransportError::malformed(format!(
                    "Invalid hex digits '{}{}'",
                    pair[0] as char, pair[1] as char
                )))
            },
        }
    }

    let (lrc, body) = match binary.split_last() {
        Some((lrc, body)) if body.len() >= 2 => (*lrc, body),
        _ => return Err(TransportError::malformed("ASCII frame without PDU")),
    };
    let expected = calculate_lrc(body);
    if expected != lrc {
        return Err(TransportError::Checksum {
            expected,
            actual: lrc,
        });
    }

    Ok((body[0], body[1..].to_vec()))
}

/// Read one frame: skip noise before ':' and stop at CRLF
async fn read_frame<L: SerialLink + ?Sized>(link: &mut L) -> Result<Vec<u8>> {
    let mut frame = Vec::with_capacity(64);
    let mut chunk = [0u8; 64];

    loop {
        let n = link.read(&mut chunk).await?;
        if n == 0 {
            return Err(TransportError::Io("early eof on serial line".to_string()));
        }
        for &b in &chunk[..n] {
            if frame.is_empty() && b != ASCII_START {
                trace!("ASCII noise byte {:02X} dropped", b);
                continue;
            }
            frame.push(b);
            if frame.ends_with(ASCII_END) {
                return Ok(frame);
            }
            if frame.len() > ASCII_MAX_FRAME_LEN {
                return Err(TransportError::malformed(format!(
                    "ASCII frame exceeds {} chars",
                    ASCII_MAX_FRAME_LEN
                )));
            }
        }
    }
}

/// Discard input until the line stays quiet for `quiet`, giving up after `limit`
async fn drain_stale<L: SerialLink + ?Sized>(
    link: &mut L,
    quiet: Duration,
    limit: Duration,
) -> Result<usize> {
    let started = Instant::now();
    let mut chunk = [0u8; 64];
    let mut dropped = 0;

    while started.elapsed() < limit {
        match timeout(quiet, link.read(&mut chunk)).await {
            Err(_) | Ok(Ok(0)) => return Ok(dropped),
            Ok(Ok(n)) => dropped += n,
            Ok(Err(e)) => return Err(e.into()),
        }
    }
    warn!("ASCII line still busy after {} ms of draining", limit.as_millis());
    Ok(dropped)
}

// ============================================================================
// Transport
// ============================================================================

/// Modbus ASCII client on one serial line
pub struct AsciiTransport {
    name: String,
    params: SerialParams,
    link: Mutex<Option<Box<dyn SerialLink>>>,
    state: parking_lot::Mutex<ConnectionState>,
    cancel: parking_lot::Mutex<CancellationToken>,
    /// Set after a failed exchange; a late reply may still be on the line
    resync: AtomicBool,
}

impl AsciiTransport {
    pub fn new(name: impl Into<String>, params: SerialParams) -> Self {
        Self {
            name: name.into(),
            params,
            link: Mutex::new(None),
            state: parking_lot::Mutex::new(ConnectionState::Closed),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
            resync: AtomicBool::new(false),
        }
    }

    pub fn params(&self) -> &SerialParams {
        &self.params
    }

    /// Open the configured serial device
    pub async fn open(&self) -> Result<()> {
        *self.state.lock() = ConnectionState::Connecting;

        let parity = match self.params.parity.as_str() {
            "Even" | "even" => tokio_serial::Parity::Even,
            "Odd" | "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        };
        let data_bits = match self.params.data_bits {
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = match self.params.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        };

        match tokio_serial::new(&self.params.device, self.params.baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(self.params.timeout())
            .open_native_async()
        {
            Ok(port) => {
                info!(
                    "ASCII opened: {} @{}baud {}{}{}",
                    self.params.device,
                    self.params.baud_rate,
                    self.params.data_bits,
                    self.params.parity.chars().next().unwrap_or('N'),
                    self.params.stop_bits
                );
                self.attach(Box::new(port)).await;
                Ok(())
            },
            Err(e) => {
                error!("ASCII open err: {} - {}", self.params.device, e);
                *self.state.lock() = ConnectionState::Closed;
                Err(TransportError::busy(format!(
                    "Failed to open serial port {}: {}",
                    self.params.device, e
                )))
            },
        }
    }

    /// Use an already opened byte stream as the line
    pub async fn attach(&self, link: Box<dyn SerialLink>) {
        *self.link.lock().await = Some(link);
        self.resync.store(false, Ordering::Release);
        *self.cancel.lock() = CancellationToken::new();
        *self.state.lock() = ConnectionState::Connected;
    }

    /// Close the line; in-flight and queued requests fail with `Cancelled`
    pub async fn close(&self) -> Result<()> {
        self.cancel.lock().cancel();
        let previous = self.link.lock().await.take();
        *self.state.lock() = ConnectionState::Closed;
        if previous.is_some() {
            info!("ASCII closed: {}", self.name);
        }
        Ok(())
    }

    async fn transact(&self, request: &ModbusRequest, frame: &[u8]) -> Result<ModbusResponse> {
        let mut guard = self.link.lock().await;
        let link = guard
            .as_mut()
            .ok_or_else(|| TransportError::busy(format!("{}: serial line not open", self.name)))?;

        // Late replies to a timed-out request must not answer this one
        if self.resync.load(Ordering::Acquire) {
            let quiet = self.params.timeout().max(self.params.turnaround());
            let dropped = drain_stale(link.as_mut(), quiet, quiet * 4).await?;
            if dropped > 0 {
                debug!("ASCII dropped {}B of stale input", dropped);
            }
            self.resync.store(false, Ordering::Release);
        }

        let exchange = async {
            link.write_all(frame).await?;
            link.flush().await?;
            debug!("ASCII TX: {}B unit={} {}", frame.len(), request.unit, request.function);
            let reply = read_frame(link.as_mut()).await?;
            Ok::<Vec<u8>, TransportError>(reply)
        };

        let reply = match timeout(self.params.timeout(), exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                error!("ASCII RX: {}", e);
                self.resync.store(true, Ordering::Release);
                return Err(e);
            },
            Err(_) => {
                self.resync.store(true, Ordering::Release);
                debug!("ASCII timeout: unit={} {}", request.unit, request.function);
                return Err(TransportError::timeout(format!(
                    "No reply from unit {} within {} ms",
                    request.unit, self.params.timeout_ms
                )));
            },
        };
        debug!("ASCII RX: {}B", reply.len());

        let turnaround = self.params.turnaround();
        if !turnaround.is_zero() {
            sleep(turnaround).await;
        }
        drop(guard);

        let (unit, pdu) = decode_frame(&reply)?;
        if unit != request.unit {
            warn!("ASCII unit mismatch: sent {}, got {}", request.unit, unit);
            return Err(TransportError::malformed(format!(
                "Unit mismatch: expected {}, got {}",
                request.unit, unit
            )));
        }
        parse_response_pdu(request, &pdu)
    }
}

#[async_trait]
impl ModbusTransport for AsciiTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    async fn request(&self, request: &ModbusRequest) -> Result<ModbusResponse> {
        request.validate()?;
        let token = self.cancel.lock().clone();
        if token.is_cancelled() {
            return Err(TransportError::Cancelled);
        }
        let frame = encode_frame(request.unit, &request.to_pdu());

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = self.transact(request, &frame) => result,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::sync::Arc;

    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};

    use super::*;

    // ========================================================================
    // Codec
    // ========================================================================

    #[test]
    fn test_lrc_calculation() {
        // 01 03 00 00 00 0A -> sum 0x0E -> LRC 0xF2
        assert_eq!(calculate_lrc(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xF2);
        assert_eq!(calculate_lrc(&[]), 0x00);
        assert_eq!(calculate_lrc(&[0xFF, 0x01]), 0x00);
    }

    #[test]
    fn test_encode_frame() {
        let frame = encode_frame(0x01, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(frame, b":01030000000AF2\r\n".to_vec());
    }

    #[test]
    fn test_decode_frame_lower_case() {
        let (unit, pdu) = decode_frame(b":0103020102f7\r\n").unwrap();
        assert_eq!(unit, 1);
        assert_eq!(pdu, vec![0x03, 0x02, 0x01, 0x02]);
    }

    #[test]
    fn test_decode_frame_checksum_error() {
        let err = decode_frame(b":0103020102F8\r\n").unwrap_err();
        assert_eq!(
            err,
            TransportError::Checksum {
                expected: 0xF7,
                actual: 0xF8
            }
        );
    }

    #[test]
    fn test_decode_frame_malformed() {
        assert!(matches!(
            decode_frame(b"0103020102F7\r\n"),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_frame(b":0103020102F7\n\n"),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_frame(b":010302010ZF7\r\n"),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            decode_frame(b":01030\r\n"),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    // ========================================================================
    // Transport over an in-memory pipe
    // ========================================================================

    async fn read_request_line(reader: &mut BufReader<DuplexStream>) -> Vec<u8> {
        let mut line = Vec::new();
        reader.read_until(b'\n', &mut line).await.unwrap();
        line
    }

    /// Slave answering every read with the register addresses as values
    fn spawn_echo_slave(
        side: DuplexStream,
        seen: Arc<parking_lot::Mutex<Vec<Vec<u8>>>>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut reader = BufReader::new(side);
            loop {
                let line = read_request_line(&mut reader).await;
                if line.is_empty() {
                    break;
                }
                seen.lock().push(line.clone());
                let (unit, pdu) = decode_frame(&line).unwrap();
                let address = u16::from_be_bytes([pdu[1], pdu[2]]);
                let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                let mut reply = vec![pdu[0], (count * 2) as u8];
                for a in address..address + count {
                    reply.extend_from_slice(&a.to_be_bytes());
                }
                let frame = encode_frame(unit, &reply);
                reader.get_mut().write_all(&frame).await.unwrap();
            }
        })
    }

    fn transport() -> AsciiTransport {
        AsciiTransport::new(
            "test-line",
            SerialParams {
                timeout_ms: 200,
                ..SerialParams::default()
            },
        )
    }

    #[tokio::test]
    async fn test_read_holding_registers() {
        let (client, server) = tokio::io::duplex(1024);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        spawn_echo_slave(server, seen.clone());

        let t = transport();
        t.attach(Box::new(client)).await;
        assert!(t.state().is_connected());

        let words = t.read_holding_registers(2, 100, 3).await.unwrap();
        assert_eq!(words, vec![100, 101, 102]);
        assert_eq!(seen.lock()[0], encode_frame(2, &[0x03, 0x00, 0x64, 0x00, 0x03]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_when_silent() {
        let (client, _server) = tokio::io::duplex(1024);
        let t = transport();
        t.attach(Box::new(client)).await;

        let err = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reply_is_not_taken_for_the_next_answer() {
        let (client, server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            let mut n: u16 = 0;
            loop {
                let line = read_request_line(&mut reader).await;
                if line.is_empty() {
                    break;
                }
                n += 1;
                if n == 1 {
                    // Answer the first request after the master gave up
                    sleep(Duration::from_millis(300)).await;
                }
                let mut reply = vec![0x03, 0x02];
                reply.extend_from_slice(&n.to_be_bytes());
                let frame = encode_frame(1, &reply);
                reader.get_mut().write_all(&frame).await.unwrap();
            }
        });

        let t = transport();
        t.attach(Box::new(client)).await;

        let first = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(first, TransportError::Timeout(_)));

        assert_eq!(t.read_holding_registers(1, 0, 1).await.unwrap(), vec![2]);
        assert_eq!(t.read_holding_registers(1, 0, 1).await.unwrap(), vec![3]);
    }

    #[tokio::test]
    async fn test_checksum_error_not_retried() {
        let (client, server) = tokio::io::duplex(1024);
        let seen = Arc::new(parking_lot::Mutex::new(0usize));
        let counter = seen.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(server);
            loop {
                let line = read_request_line(&mut reader).await;
                if line.is_empty() {
                    break;
                }
                *counter.lock() += 1;
                reader
                    .get_mut()
                    .write_all(b":0103020102F8\r\n")
                    .await
                    .unwrap();
            }
        });

        let t = transport();
        t.attach(Box::new(client)).await;
        let err = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::Checksum { .. }));
        assert_eq!(*seen.lock(), 1);
    }

    #[tokio::test]
    async fn test_requests_served_in_submission_order() {
        let (client, server) = tokio::io::duplex(1024);
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        spawn_echo_slave(server, seen.clone());

        let t = transport();
        t.attach(Box::new(client)).await;

        let (a, b, c) = tokio::join!(
            t.read_holding_registers(1, 10, 1),
            t.read_holding_registers(1, 20, 1),
            t.read_holding_registers(1, 30, 1),
        );
        assert_eq!(a.unwrap(), vec![10]);
        assert_eq!(b.unwrap(), vec![20]);
        assert_eq!(c.unwrap(), vec![30]);

        // Every frame arrived whole and in submission order
        let frames = seen.lock().clone();
        let addresses: Vec<u16> = frames
            .iter()
            .map(|f| {
                let (_, pdu) = decode_frame(f).unwrap();
                u16::from_be_bytes([pdu[1], pdu[2]])
            })
            .collect();
        assert_eq!(addresses, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_close_cancels_in_flight_request() {
        let (client, _server) = tokio::io::duplex(1024);
        let t = Arc::new(AsciiTransport::new(
            "test-line",
            SerialParams {
                timeout_ms: 60_000,
                ..SerialParams::default()
            },
        ));
        t.attach(Box::new(client)).await;

        let pending = {
            let t = t.clone();
            tokio::spawn(async move { t.read_holding_registers(1, 0, 1).await })
        };
        tokio::task::yield_now().await;
        t.close().await.unwrap();

        let result = pending.await.unwrap();
        assert_eq!(result.unwrap_err(), TransportError::Cancelled);
        assert_eq!(t.state(), ConnectionState::Closed);

        // Closed line rejects further requests
        let err = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert_eq!(err, TransportError::Cancelled);
    }

    #[tokio::test]
    async fn test_request_before_open_is_busy() {
        let t = transport();
        let err = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::BusBusy(_)));
    }
}
