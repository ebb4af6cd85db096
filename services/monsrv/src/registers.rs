//! Register abstraction
//!
//! Each device owns a static table of [`RegisterDescriptor`]s. Reads are
//! planned against that table: requested ids are validated, sorted by
//! address and merged into contiguous spans of at most
//! [`MAX_READ_REGISTERS`] words, one Modbus request per span. Decoding is a
//! pure function of descriptor and raw words.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use voltage_comlink::constants::MAX_READ_REGISTERS;
use voltage_comlink::{FunctionCode, ModbusTransport};

use crate::error::{DecodeError, DeviceError};

/// Register number as used by the device documentation
///
/// Absolute addresses for Fronius register/inverter blocks and the grid
/// meter, model offsets for SunSpec MPPT/storage/meter models, parameter
/// numbers for the heat pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RegisterId(pub u16);

impl fmt::Display for RegisterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How raw words turn into a value (big-endian word order throughout)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeRule {
    Int16,
    Int32,
    UInt32,
    UInt64,
    /// Signed integer of width 1 or 2 multiplied by the scale
    ScaledFloat(f64),
    /// Unsigned bit pattern of width 1 or 2
    Bitfield,
    /// Two characters per word, high byte first, NUL padded
    AsciiString,
}

impl DecodeRule {
    fn accepts_width(&self, width: usize) -> bool {
        match self {
            DecodeRule::Int16 => width == 1,
            DecodeRule::Int32 | DecodeRule::UInt32 => width == 2,
            DecodeRule::UInt64 => width == 4,
            DecodeRule::ScaledFloat(_) | DecodeRule::Bitfield => width == 1 || width == 2,
            DecodeRule::AsciiString => width >= 1,
        }
    }

    fn nominal_width(&self) -> usize {
        match self {
            DecodeRule::Int16 | DecodeRule::ScaledFloat(_) | DecodeRule::Bitfield => 1,
            DecodeRule::Int32 | DecodeRule::UInt32 => 2,
            DecodeRule::UInt64 => 4,
            DecodeRule::AsciiString => 1,
        }
    }
}

/// Static description of one register
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegisterDescriptor {
    pub id: RegisterId,
    pub name: &'static str,
    /// Modbus address sent on the wire
    pub address: u16,
    /// Width in 16-bit words
    pub width: u16,
    pub decode: DecodeRule,
    pub unit: &'static str,
    pub writable: bool,
}

impl RegisterDescriptor {
    /// Read-only descriptor whose id equals its address
    pub const fn at(
        address: u16,
        name: &'static str,
        width: u16,
        decode: DecodeRule,
        unit: &'static str,
    ) -> Self {
        Self {
            id: RegisterId(address),
            name,
            address,
            width,
            decode,
            unit,
            writable: false,
        }
    }

    /// Read-only descriptor addressed as `base + offset`, id is the offset
    pub const fn offset(
        base: u16,
        offset: u16,
        name: &'static str,
        width: u16,
        decode: DecodeRule,
        unit: &'static str,
    ) -> Self {
        Self {
            id: RegisterId(offset),
            name,
            address: base + offset,
            width,
            decode,
            unit,
            writable: false,
        }
    }

    pub const fn writable(mut self) -> Self {
        self.writable = true;
        self
    }

    fn end(&self) -> u32 {
        u32::from(self.address) + u32::from(self.width)
    }
}

/// Decoded register value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Int(i64),
    Float(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            Value::Text(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One decoded reading
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterValue {
    pub id: RegisterId,
    pub name: &'static str,
    pub raw: Vec<u16>,
    pub value: Value,
    pub unit: &'static str,
    pub captured_at: DateTime<Utc>,
}

fn join_high_first(words: &[u16]) -> u64 {
    words
        .iter()
        .fold(0u64, |acc, w| (acc << 16) | u64::from(*w))
}

/// Decode raw words according to the descriptor
pub fn decode(descriptor: &RegisterDescriptor, words: &[u16]) -> Result<Value, DecodeError> {
    let width_error = || DecodeError::WidthMismatch {
        id: descriptor.id,
        expected: descriptor.width as usize,
        actual: words.len(),
    };
    if words.len() != descriptor.width as usize {
        return Err(width_error());
    }
    if !descriptor.decode.accepts_width(words.len()) {
        return Err(DecodeError::WidthMismatch {
            id: descriptor.id,
            expected: descriptor.decode.nominal_width(),
            actual: words.len(),
        });
    }

    let value = match descriptor.decode {
        DecodeRule::Int16 => Value::Int(i64::from(words[0] as i16)),
        DecodeRule::Int32 => Value::Int(i64::from(join_high_first(words) as u32 as i32)),
        DecodeRule::UInt32 => Value::Int(join_high_first(words) as i64),
        DecodeRule::UInt64 => Value::Int(join_high_first(words) as i64),
        DecodeRule::Bitfield => Value::Int(join_high_first(words) as i64),
        DecodeRule::ScaledFloat(scale) => {
            let raw = if words.len() == 1 {
                i64::from(words[0] as i16)
            } else {
                i64::from(join_high_first(words) as u32 as i32)
            };
            Value::Float(raw as f64 * scale)
        },
        DecodeRule::AsciiString => {
            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
            let text = String::from_utf8_lossy(&bytes);
            Value::Text(text.trim_end_matches('\0').trim_end().to_string())
        },
    };
    trace!("Decoded {} {:04X?} -> {:?}", descriptor.name, words, value);
    Ok(value)
}

/// Encode a value for writing
///
/// Only integer and scaled rules can be written.
pub fn encode(descriptor: &RegisterDescriptor, value: f64) -> Result<Vec<u16>, DecodeError> {
    let raw = match descriptor.decode {
        DecodeRule::ScaledFloat(scale) if scale != 0.0 => (value / scale).round() as i64,
        DecodeRule::Int16 | DecodeRule::Int32 | DecodeRule::UInt32 | DecodeRule::Bitfield => {
            value.round() as i64
        },
        _ => {
            return Err(DecodeError::WidthMismatch {
                id: descriptor.id,
                expected: descriptor.decode.nominal_width(),
                actual: descriptor.width as usize,
            })
        },
    };
    match descriptor.width {
        1 => Ok(vec![raw as i16 as u16]),
        2 => {
            let v = raw as i32 as u32;
            Ok(vec![(v >> 16) as u16, v as u16])
        },
        _ => Err(DecodeError::WidthMismatch {
            id: descriptor.id,
            expected: descriptor.decode.nominal_width(),
            actual: descriptor.width as usize,
        }),
    }
}

/// Contiguous run of registers fetched by one request
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub address: u16,
    pub count: u16,
    pub members: Vec<RegisterDescriptor>,
}

/// Descriptor table of one device block
#[derive(Debug)]
pub struct RegisterTable {
    pub device: &'static str,
    pub function: FunctionCode,
    pub descriptors: &'static [RegisterDescriptor],
}

impl RegisterTable {
    pub const fn new(
        device: &'static str,
        function: FunctionCode,
        descriptors: &'static [RegisterDescriptor],
    ) -> Self {
        Self {
            device,
            function,
            descriptors,
        }
    }

    pub fn descriptor(&self, id: RegisterId) -> Result<&RegisterDescriptor, DecodeError> {
        self.descriptors
            .iter()
            .find(|d| d.id == id)
            .ok_or(DecodeError::UnknownRegister {
                device: self.device,
                id,
            })
    }

    pub fn ids(&self) -> Vec<RegisterId> {
        self.descriptors.iter().map(|d| d.id).collect()
    }

    /// Group ids into request spans
    ///
    /// Fails on the first id missing from the table. Duplicate ids are read
    /// once.
    pub fn plan(&self, ids: &[RegisterId]) -> Result<Vec<Span>, DecodeError> {
        let mut wanted = Vec::with_capacity(ids.len());
        for id in ids {
            let descriptor = self.descriptor(*id)?;
            if !wanted.iter().any(|d: &RegisterDescriptor| d.id == *id) {
                wanted.push(*descriptor);
            }
        }
        wanted.sort_by_key(|d| d.address);

        let mut spans: Vec<Span> = Vec::new();
        for descriptor in wanted {
            match spans.last_mut() {
                Some(span)
                    if u32::from(descriptor.address)
                        <= u32::from(span.address) + u32::from(span.count)
                        && descriptor.end() - u32::from(span.address)
                            <= u32::from(MAX_READ_REGISTERS) =>
                {
                    let end = descriptor
                        .end()
                        .max(u32::from(span.address) + u32::from(span.count));
                    span.count = (end - u32::from(span.address)) as u16;
                    span.members.push(descriptor);
                },
                _ => spans.push(Span {
                    address: descriptor.address,
                    count: descriptor.width,
                    members: vec![descriptor],
                }),
            }
        }
        Ok(spans)
    }
}

/// Ordered id to value map for one block read
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterSet {
    pub device: &'static str,
    pub captured_at: DateTime<Utc>,
    pub values: BTreeMap<RegisterId, RegisterValue>,
}

impl RegisterSet {
    pub fn new(device: &'static str, captured_at: DateTime<Utc>) -> Self {
        Self {
            device,
            captured_at,
            values: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: RegisterId) -> Option<&RegisterValue> {
        self.values.get(&id)
    }

    pub fn f64(&self, id: RegisterId) -> Option<f64> {
        self.get(id).and_then(|v| v.value.as_f64())
    }

    pub fn text(&self, id: RegisterId) -> Option<&str> {
        self.get(id).and_then(|v| v.value.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Changed values between `previous` and `self` inside `range`
    ///
    /// Ids present on only one side count as changed.
    pub fn diff(&self, previous: &RegisterSet, range: &InterestingRange) -> Vec<RegisterChange> {
        let mut ids: Vec<RegisterId> = self
            .values
            .keys()
            .chain(previous.values.keys())
            .copied()
            .filter(|id| range.contains(*id))
            .collect();
        ids.sort();
        ids.dedup();

        ids.into_iter()
            .filter_map(|id| {
                let before = previous.get(id).map(|v| v.value.clone());
                let after = self.get(id).map(|v| v.value.clone());
                (before != after).then(|| RegisterChange {
                    device: self.device,
                    id,
                    before,
                    after,
                })
            })
            .collect()
    }
}

/// Reported change of one register between two reads
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterChange {
    pub device: &'static str,
    pub id: RegisterId,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Inclusive id range with exclusions, selecting registers worth diffing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterestingRange {
    pub first: u16,
    pub last: u16,
    #[serde(default)]
    pub exclude: Vec<u16>,
}

impl InterestingRange {
    pub fn new(first: u16, last: u16, exclude: &[u16]) -> Self {
        Self {
            first,
            last,
            exclude: exclude.to_vec(),
        }
    }

    pub fn contains(&self, id: RegisterId) -> bool {
        (self.first..=self.last).contains(&id.0) && !self.exclude.contains(&id.0)
    }
}

/// Read `ids` from `table` on `unit`
///
/// Spans are read in address order. Any failing span fails the whole read
/// with [`DeviceError::PartialRead`]; values are only returned when every
/// span succeeded.
pub async fn read_registers(
    transport: &dyn ModbusTransport,
    unit: u8,
    table: &RegisterTable,
    ids: &[RegisterId],
) -> Result<RegisterSet, DeviceError> {
    let spans = table.plan(ids)?;
    let mut set = RegisterSet::new(table.device, Utc::now());

    for span in &spans {
        let words = match table.function {
            FunctionCode::ReadInputRegisters => {
                transport
                    .read_input_registers(unit, span.address, span.count)
                    .await
            },
            _ => {
                transport
                    .read_holding_registers(unit, span.address, span.count)
                    .await
            },
        }
        .map_err(|source| DeviceError::PartialRead {
            device: table.device,
            address: span.address,
            count: span.count,
            source,
        })?;

        let captured_at = Utc::now();
        for descriptor in &span.members {
            let start = (descriptor.address - span.address) as usize;
            let end = start + descriptor.width as usize;
            let raw = words.get(start..end).ok_or(DecodeError::WidthMismatch {
                id: descriptor.id,
                expected: descriptor.width as usize,
                actual: words.len().saturating_sub(start),
            })?;
            let value = decode(descriptor, raw)?;
            set.values.insert(
                descriptor.id,
                RegisterValue {
                    id: descriptor.id,
                    name: descriptor.name,
                    raw: raw.to_vec(),
                    value,
                    unit: descriptor.unit,
                    captured_at,
                },
            );
        }
    }

    debug!(
        "{}: read {} registers in {} spans",
        table.device,
        set.len(),
        spans.len()
    );
    Ok(set)
}

/// Read every register of `table`
pub async fn read_all(
    transport: &dyn ModbusTransport,
    unit: u8,
    table: &RegisterTable,
) -> Result<RegisterSet, DeviceError> {
    read_registers(transport, unit, table, &table.ids()).await
}

/// Write `value` into register `id`
///
/// Single-word registers go out as FC06, wider ones as FC16.
pub async fn write_register(
    transport: &dyn ModbusTransport,
    unit: u8,
    table: &RegisterTable,
    id: RegisterId,
    value: f64,
) -> Result<Vec<u16>, DeviceError> {
    let descriptor = table.descriptor(id)?;
    if !descriptor.writable {
        return Err(DeviceError::NotWritable(id));
    }
    let words = encode(descriptor, value)?;
    transport
        .write_registers(unit, descriptor.address, &words)
        .await?;
    debug!("{}: wrote {} = {} ({:04X?})", table.device, id, value, words);
    Ok(words)
}
