//! Modbus/TCP transport
//!
//! Frame: [Transaction ID(2)][Protocol ID(2)][Length(2)][Unit ID(1)][PDU(N)].
//! At most one transaction is outstanding per connection. A lost connection
//! is re-established once per request before the request fails with `BusBusy`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::constants::{DEFAULT_TCP_PORT, DEFAULT_TIMEOUT_MS, MAX_MBAP_LENGTH, MBAP_HEADER_LEN};
use crate::error::{Result, TransportError};
use crate::pdu::{parse_response_pdu, ModbusRequest, ModbusResponse};
use crate::traits::{ConnectionState, ModbusTransport};

// ============================================================================
// Parameters
// ============================================================================

/// TCP endpoint parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TcpParams {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_TCP_PORT
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for TcpParams {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_port(),
            timeout_ms: default_timeout_ms(),
            connect_timeout_ms: default_timeout_ms(),
        }
    }
}

impl TcpParams {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// ============================================================================
// MBAP Codec
// ============================================================================

/// Modbus TCP MBAP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbapHeader {
    /// Transaction identifier
    pub transaction_id: u16,
    /// Protocol identifier (fixed to 0)
    pub protocol_id: u16,
    /// Length field (unit id + PDU)
    pub length: u16,
}

impl MbapHeader {
    pub fn parse(bytes: &[u8; MBAP_HEADER_LEN]) -> Result<Self> {
        let header = Self {
            transaction_id: u16::from_be_bytes([bytes[0], bytes[1]]),
            protocol_id: u16::from_be_bytes([bytes[2], bytes[3]]),
            length: u16::from_be_bytes([bytes[4], bytes[5]]),
        };
        if header.protocol_id != 0 {
            return Err(TransportError::malformed(format!(
                "Invalid protocol ID: expected 0, got {}",
                header.protocol_id
            )));
        }
        // Unit id plus at least a function code
        if header.length < 2 || header.length as usize > MAX_MBAP_LENGTH {
            return Err(TransportError::malformed(format!(
                "Invalid TCP frame length: {}",
                header.length
            )));
        }
        Ok(header)
    }
}

/// Build TCP frame (MBAP + PDU)
pub fn encode_frame(transaction_id: u16, unit: u8, pdu: &[u8]) -> Vec<u8> {
    let length = (pdu.len() + 1) as u16;
    let mut frame = Vec::with_capacity(MBAP_HEADER_LEN + 1 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.push(unit);
    frame.extend_from_slice(pdu);
    frame
}

// ============================================================================
// Transport
// ============================================================================

/// Modbus/TCP client for one remote endpoint
pub struct TcpTransport {
    name: String,
    params: TcpParams,
    stream: Mutex<Option<TcpStream>>,
    next_transaction_id: AtomicU16,
    state: parking_lot::Mutex<ConnectionState>,
    cancel: parking_lot::Mutex<CancellationToken>,
}

impl TcpTransport {
    pub fn new(name: impl Into<String>, params: TcpParams) -> Self {
        Self {
            name: name.into(),
            params,
            stream: Mutex::new(None),
            next_transaction_id: AtomicU16::new(1),
            state: parking_lot::Mutex::new(ConnectionState::Closed),
            cancel: parking_lot::Mutex::new(CancellationToken::new()),
        }
    }

    pub fn params(&self) -> &TcpParams {
        &self.params
    }

    /// Get next transaction ID, wrapping from 0xFFFF to 0x0000
    pub fn next_transaction_id(&self) -> u16 {
        self.next_transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Connect eagerly; requests reconnect lazily when this fails
    pub async fn start(&self) -> Result<()> {
        *self.cancel.lock() = CancellationToken::new();
        let mut guard = self.stream.lock().await;
        let stream = self.connect().await?;
        *guard = Some(stream);
        Ok(())
    }

    /// Drop the connection; in-flight and queued requests fail with `Cancelled`
    pub async fn stop(&self) -> Result<()> {
        self.cancel.lock().cancel();
        let previous = self.stream.lock().await.take();
        *self.state.lock() = ConnectionState::Closed;
        if previous.is_some() {
            info!("TCP closed: {}", self.params.addr());
        }
        Ok(())
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = self.params.addr();
        debug!("TCP connecting: {}", addr);
        *self.state.lock() = ConnectionState::Connecting;

        let connect_timeout = Duration::from_millis(self.params.connect_timeout_ms);
        match timeout(connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("TCP_NODELAY: {}", e);
                }
                info!("TCP connected: {}", addr);
                *self.state.lock() = ConnectionState::Connected;
                Ok(stream)
            },
            Ok(Err(e)) => {
                error!("TCP err: {} - {}", addr, e);
                *self.state.lock() = ConnectionState::Disconnected;
                Err(TransportError::busy(format!("Failed to connect to {addr}: {e}")))
            },
            Err(_) => {
                warn!("TCP timeout: {}", addr);
                *self.state.lock() = ConnectionState::Disconnected;
                Err(TransportError::busy(format!("Connection to {addr} timed out")))
            },
        }
    }

    /// One request/response on an open stream
    async fn exchange(&self, stream: &mut TcpStream, request: &ModbusRequest) -> Result<ModbusResponse> {
        let transaction_id = self.next_transaction_id();
        let frame = encode_frame(transaction_id, request.unit, &request.to_pdu());

        let io = async {
            stream.write_all(&frame).await?;
            debug!("TCP TX: {}B tid={:04X} {}", frame.len(), transaction_id, request.function);

            let mut header_bytes = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header_bytes).await?;
            let header = MbapHeader::parse(&header_bytes)?;

            let mut body = vec![0u8; header.length as usize];
            stream.read_exact(&mut body).await?;
            debug!("TCP RX: {}B", MBAP_HEADER_LEN + body.len());
            Ok::<(MbapHeader, Vec<u8>), TransportError>((header, body))
        };

        let (header, body) = match timeout(Duration::from_millis(self.params.timeout_ms), io).await {
            Ok(result) => result?,
            Err(_) => {
                debug!("TCP timeout: tid={:04X}", transaction_id);
                return Err(TransportError::timeout(format!(
                    "No reply from {} unit {} within {} ms",
                    self.params.addr(),
                    request.unit,
                    self.params.timeout_ms
                )));
            },
        };

        if header.transaction_id != transaction_id {
            return Err(TransportError::malformed(format!(
                "Transaction ID mismatch: expected {:04X}, got {:04X}",
                transaction_id, header.transaction_id
            )));
        }
        let unit = body[0];
        if unit != request.unit {
            return Err(TransportError::malformed(format!(
                "Unit mismatch: expected {}, got {}",
                request.unit, unit
            )));
        }
        parse_response_pdu(request, &body[1..])
    }

    async fn transact(&self, request: &ModbusRequest) -> Result<ModbusResponse> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::busy("TCP stream unavailable"));
        };

        match self.exchange(stream, request).await {
            Ok(response) => Ok(response),
            Err(e) if e.needs_reconnect() => {
                warn!("TCP link lost ({}): reconnecting {}", e, self.params.addr());
                *guard = None;
                *self.state.lock() = ConnectionState::Disconnected;

                let mut stream = self.connect().await?;
                let retry = self.exchange(&mut stream, request).await;
                match retry {
                    Err(e) if e.needs_reconnect() => {
                        *self.state.lock() = ConnectionState::Disconnected;
                        Err(TransportError::busy(format!(
                            "{} unreachable after reconnect: {}",
                            self.params.addr(),
                            e
                        )))
                    },
                    other => {
                        *guard = Some(stream);
                        other
                    },
                }
            },
            Err(e @ TransportError::Timeout(_)) | Err(e @ TransportError::MalformedFrame(_)) => {
                // Stream position unknown: a late reply would desync the next request
                *guard = None;
                *self.state.lock() = ConnectionState::Disconnected;
                Err(e)
            },
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ModbusTransport for TcpTransport {
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

        tokio::select! {
            biased;
            _ = token.cancelled() => Err(TransportError::Cancelled),
            result = self.transact(request) => result,
        }
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use std::sync::Arc;

    use tokio::net::TcpListener;

    use super::*;

    /// Serve one connection: answer reads with `base + offset`; `tid_skew` corrupts the transaction id
    async fn serve_connection(mut socket: TcpStream, max_requests: usize, tid_skew: u16) {
        for _ in 0..max_requests {
            let mut header = [0u8; MBAP_HEADER_LEN];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let length = u16::from_be_bytes([header[4], header[5]]) as usize;
            let mut body = vec![0u8; length];
            socket.read_exact(&mut body).await.unwrap();
            let tid = u16::from_be_bytes([header[0], header[1]]).wrapping_add(tid_skew);
            let unit = body[0];
            let fc = body[1];
            let address = u16::from_be_bytes([body[2], body[3]]);
            let count = u16::from_be_bytes([body[4], body[5]]);
            let mut pdu = vec![fc, (count * 2) as u8];
            for a in address..address + count {
                pdu.extend_from_slice(&a.wrapping_add(1000).to_be_bytes());
            }
            socket.write_all(&encode_frame(tid, unit, &pdu)).await.unwrap();
        }
    }

    async fn listener() -> (TcpListener, TcpParams) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let params = TcpParams {
            host: "127.0.0.1".to_string(),
            port,
            timeout_ms: 500,
            connect_timeout_ms: 500,
        };
        (listener, params)
    }

    #[test]
    fn test_tcp_frame_mbap_header_format() {
        let frame = encode_frame(0x1234, 1, &[0x03, 0x00, 0x01, 0x00, 0x02]);
        assert_eq!(
            frame,
            vec![0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x01, 0x00, 0x02]
        );
    }

    #[test]
    fn test_mbap_header_validation() {
        assert!(MbapHeader::parse(&[0, 1, 0, 0, 0, 5]).is_ok());
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0, 1, 0, 5]),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0, 0, 0, 0]),
            Err(TransportError::MalformedFrame(_))
        ));
        assert!(matches!(
            MbapHeader::parse(&[0, 1, 0, 0, 0x01, 0x00]),
            Err(TransportError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_transaction_id_wrap_around() {
        let t = TcpTransport::new("symo", TcpParams::default());
        t.next_transaction_id.store(0xFFFF, Ordering::Relaxed);
        assert_eq!(t.next_transaction_id(), 0xFFFF);
        assert_eq!(t.next_transaction_id(), 0x0000);
        assert_eq!(t.next_transaction_id(), 0x0001);
    }

    #[tokio::test]
    async fn test_read_roundtrip() {
        let (listener, params) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(socket, 10, 0).await;
        });

        let t = TcpTransport::new("symo", params);
        t.start().await.unwrap();
        assert!(t.state().is_connected());
        assert_eq!(t.read_holding_registers(1, 500, 2).await.unwrap(), vec![1500, 1501]);
        assert_eq!(t.read_input_registers(1, 7, 1).await.unwrap(), vec![1007]);
    }

    #[tokio::test]
    async fn test_transaction_id_mismatch() {
        let (listener, params) = listener().await;
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(socket, 1, 7).await;
        });

        let t = TcpTransport::new("symo", params);
        let err = t.read_holding_registers(1, 0, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::MalformedFrame(_)));
        assert_eq!(t.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_single_reconnect_after_connection_loss() {
        let (listener, params) = listener().await;
        tokio::spawn(async move {
            // First connection dies after one request, second one keeps serving
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(socket, 1, 0).await;
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(socket, 10, 0).await;
        });

        let t = TcpTransport::new("symo", params);
        assert_eq!(t.read_holding_registers(1, 1, 1).await.unwrap(), vec![1001]);
        assert_eq!(t.read_holding_registers(1, 2, 1).await.unwrap(), vec![1002]);
        assert!(t.state().is_connected());
    }

    #[tokio::test]
    async fn test_bus_busy_when_reconnect_fails() {
        let (listener, params) = listener().await;
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            serve_connection(socket, 1, 0).await;
            // listener dropped here: reconnect is refused
        });

        let t = TcpTransport::new("symo", params);
        t.read_holding_registers(1, 1, 1).await.unwrap();
        server.await.unwrap();

        let err = t.read_holding_registers(1, 1, 1).await.unwrap_err();
        assert!(matches!(err, TransportError::BusBusy(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_request() {
        let (listener, mut params) = listener().await;
        params.timeout_ms = 60_000;
        tokio::spawn(async move {
            // Accept and never answer
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });

        let t = Arc::new(TcpTransport::new("symo", params));
        t.start().await.unwrap();
        let pending = {
            let t = t.clone();
            tokio::spawn(async move { t.read_holding_registers(1, 0, 1).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        t.stop().await.unwrap();

        assert_eq!(pending.await.unwrap().unwrap_err(), TransportError::Cancelled);
        assert_eq!(t.state(), ConnectionState::Closed);
    }
}
