//! Modbus protocol constants
//!
//! Frame limits derive from the 253-byte PDU limit of the serial ADU.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// MBAP prefix read before the body: Transaction ID(2) + Protocol ID(2) + Length(2)
///
/// The unit id is counted by the length field and read together with the PDU.
pub const MBAP_HEADER_LEN: usize = 6;

/// Maximum PDU size
pub const MAX_PDU_SIZE: usize = 253;

/// Maximum MBAP length field value (Unit ID + PDU)
pub const MAX_MBAP_LENGTH: usize = 1 + MAX_PDU_SIZE;

// ============================================================================
// Register Operation Limits
// ============================================================================

/// Maximum number of registers for FC03/FC04
///
/// Response PDU: 1 (FC) + 1 (byte count) + N x 2 <= 253, so N <= 125
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of registers for FC16
///
/// Request PDU: 1 (FC) + 2 (addr) + 2 (qty) + 1 (byte count) + N x 2 <= 253, so N <= 123
pub const MAX_WRITE_REGISTERS: u16 = 123;

// ============================================================================
// ASCII Framing
// ============================================================================

/// ASCII frame start delimiter
pub const ASCII_START: u8 = b':';

/// ASCII frame end delimiter
pub const ASCII_END: &[u8; 2] = b"\r\n";

/// Shortest legal ASCII frame: ':' + addr(2) + fc(2) + one data byte(2) + LRC(2) + CRLF(2)
pub const ASCII_MIN_FRAME_LEN: usize = 11;

/// Longest ASCII frame: ':' + 2 x (1 + 253 + 1) hex chars + CRLF
pub const ASCII_MAX_FRAME_LEN: usize = 1 + 2 * (1 + MAX_PDU_SIZE + 1) + 2;

// ============================================================================
// Defaults
// ============================================================================

/// Default request timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Default Modbus/TCP port
pub const DEFAULT_TCP_PORT: u16 = 502;

/// Default serial baud rate
pub const DEFAULT_BAUD_RATE: u32 = 9600;
