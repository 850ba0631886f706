//! Decoding raw event buffers against a logical layout.

use crate::layout::{AlignmentReport, DataField, LogicalLayout, RecordField};
use crate::types::{CanonicalType, Endianness, Scalar, host_byte_order};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use compact_str::CompactString;
use pastey::paste;
use smallvec::SmallVec;
use std::borrow::Cow;

/// Error type for decode operations. A failure aborts only the single
/// decode call; the layout stays valid for other buffers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated event buffer: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    /// The alignment report's mask length does not match the layout's
    /// field count. Caller paired a report with the wrong layout.
    #[error("alignment report does not match layout: {mask} != {fields}")]
    MismatchedReport { mask: usize, fields: usize },
    #[error("invalid dynamic data indexes: offset={offset} len={len}")]
    DynamicOutOfRange { offset: usize, len: usize },
    #[error("invalid kind for field {0}")]
    InvalidKind(CompactString),
    #[error("invalid fallback size for field {field}: {size}")]
    FallbackSize { field: CompactString, size: u32 },
    #[error("no data field at index {0}")]
    NoSuchField(usize),
    #[error("no layout registered for event id={0}")]
    UnknownId(u16),
}

/// A decoded field value.
///
/// Scalar variants are owned copies; `Bytes` and `Dynamic` borrow the
/// source buffer, so the decoded record lives no longer than the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value<'data> {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    U64(u64),
    I64(i64),
    /// Byte data: fixed arrays of width-1 elements and `char[]`-style
    /// out-of-line data. Trailing NUL bytes are not removed.
    Bytes(Cow<'data, [u8]>),
    /// Fixed array of wider scalars.
    Array(Vec<Value<'data>>),
    /// Out-of-line array of wider elements.
    Dynamic(DynamicArray<'data>),
}

impl Value<'_> {
    /// The value widened to `u64`, for unsigned scalar kinds.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            Self::U8(v) => Some(u64::from(v)),
            Self::U16(v) => Some(u64::from(v)),
            Self::U32(v) => Some(u64::from(v)),
            Self::U64(v) => Some(v),
            _ => None,
        }
    }

    /// The value widened to `i64`, for signed scalar kinds.
    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Self::I8(v) => Some(i64::from(v)),
            Self::I16(v) => Some(i64::from(v)),
            Self::I32(v) => Some(i64::from(v)),
            Self::I64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_ref()),
            Self::Dynamic(arr) => Some(arr.as_bytes()),
            _ => None,
        }
    }

    /// Lossy UTF-8 view of byte data, trimmed at the first NUL.
    pub fn as_str_lossy(&self) -> Option<Cow<'_, str>> {
        let data = self.as_bytes()?;
        let nul = memchr::memchr(0, data).unwrap_or(data.len());
        Some(String::from_utf8_lossy(&data[..nul]))
    }
}

/// A bounds-checked view over out-of-line array data, borrowed from the
/// event buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicArray<'data> {
    elem: Scalar,
    data: &'data [u8],
}

impl<'data> DynamicArray<'data> {
    pub fn elem(&self) -> Scalar {
        self.elem
    }

    /// Number of whole elements.
    pub fn len(&self) -> usize {
        self.data.len() / self.elem.width() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The underlying bytes, `len() * elem().width()` long.
    pub fn as_bytes(&self) -> &'data [u8] {
        self.data
    }

    /// Reads element `index` in the machine's byte order.
    pub fn get(&self, index: usize) -> Option<Value<'data>> {
        let w = self.elem.width() as usize;
        let bytes = self.data.get(index * w..index * w + w)?;
        Some(match host_byte_order() {
            Endianness::Little => read_scalar::<LittleEndian>(self.elem, bytes),
            Endianness::Big => read_scalar::<BigEndian>(self.elem, bytes),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Value<'data>> + '_ {
        (0..self.len()).filter_map(|index| self.get(index))
    }
}

/// A fully decoded event: probe name plus one `(exported name, value)`
/// entry per data field, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent<'data> {
    name: CompactString,
    values: Vec<(CompactString, Value<'data>)>,
}

impl<'data> DecodedEvent<'data> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[(CompactString, Value<'data>)] {
        &self.values
    }

    /// Looks a field up by its exported display name.
    pub fn get(&self, export: &str) -> Option<&Value<'data>> {
        self.values
            .iter()
            .find(|(name, _)| name.as_str() == export)
            .map(|(_, value)| value)
    }
}

/// Reader for scalar fields at `index` in the layout's field sequence.
macro_rules! scalar_reader {
    ($ty:tt) => {
        paste! {
            #[doc = concat!("Reads the data field at `index` as `", stringify!($ty), "`.")]
            pub fn [<read_ $ty>](&self, index: usize, data: &[u8]) -> Result<$ty, DecodeError> {
                match self.read_value(index, data)? {
                    Value::[<$ty:upper>](v) => Ok(v),
                    _ => Err(DecodeError::InvalidKind(self.export_of(index))),
                }
            }
        }
    };
}

/// Decoder for one event format, combining a [`LogicalLayout`] with the
/// alignment report produced alongside its record layout.
///
/// Immutable after construction; decode calls are pure reads and may run
/// concurrently on independent buffers.
#[derive(Debug, Clone)]
pub struct EventDecoder {
    layout: LogicalLayout,
    report: Option<AlignmentReport>,
}

impl EventDecoder {
    pub fn new(
        layout: LogicalLayout,
        report: Option<AlignmentReport>,
    ) -> Result<Self, DecodeError> {
        if let Some(report) = &report {
            if report.unaligned.len() != layout.fields.len() {
                return Err(DecodeError::MismatchedReport {
                    mask: report.unaligned.len(),
                    fields: layout.fields.len(),
                });
            }
        }
        Ok(Self { layout, report })
    }

    pub fn layout(&self) -> &LogicalLayout {
        &self.layout
    }

    pub fn report(&self) -> Option<&AlignmentReport> {
        self.report.as_ref()
    }

    /// Decodes a complete event buffer.
    ///
    /// `data` must hold at least the record's fixed-size portion; dynamic
    /// fields additionally reference the out-of-line bytes beyond it.
    pub fn decode<'data>(&self, data: &'data [u8]) -> Result<DecodedEvent<'data>, DecodeError> {
        match host_byte_order() {
            Endianness::Little => self.decode_impl::<LittleEndian>(data),
            Endianness::Big => self.decode_impl::<BigEndian>(data),
        }
    }

    fn decode_impl<'data, O: ByteOrder>(
        &self,
        data: &'data [u8],
    ) -> Result<DecodedEvent<'data>, DecodeError> {
        let need = self.layout.total_size as usize;
        if data.len() < need {
            return Err(DecodeError::Truncated {
                need,
                got: data.len(),
            });
        }
        let mut values = Vec::with_capacity(self.layout.fields.len());
        let mut deferred: SmallVec<[(usize, usize); 4]> = SmallVec::new();
        for (index, field) in self.layout.fields.iter().enumerate() {
            let RecordField::Data(d) = field else { continue };
            if self.is_flagged(index) && !matches!(d.ty, CanonicalType::DynamicArrayRef(_)) {
                // Placeholder, overwritten by the fallback pass below.
                deferred.push((values.len(), index));
                values.push((d.export.clone(), Value::U8(0)));
                continue;
            }
            values.push((d.export.clone(), decode_field::<O>(d, data)?));
        }
        for (slot, index) in deferred {
            let RecordField::Data(d) = &self.layout.fields[index] else {
                continue;
            };
            values[slot].1 = decode_fallback(d, data)?;
        }
        Ok(DecodedEvent {
            name: self.layout.name.clone(),
            values,
        })
    }

    scalar_reader!(u8);

    scalar_reader!(i8);

    scalar_reader!(u16);

    scalar_reader!(i16);

    scalar_reader!(u32);

    scalar_reader!(i32);

    scalar_reader!(u64);

    scalar_reader!(i64);

    /// Reads the field at `index` (into the field sequence, padding
    /// included), routing through the fallback path when flagged.
    pub fn read_value<'data>(
        &self,
        index: usize,
        data: &'data [u8],
    ) -> Result<Value<'data>, DecodeError> {
        let Some(RecordField::Data(d)) = self.layout.fields.get(index) else {
            return Err(DecodeError::NoSuchField(index));
        };
        if self.is_flagged(index) && !matches!(d.ty, CanonicalType::DynamicArrayRef(_)) {
            return decode_fallback(d, data);
        }
        match host_byte_order() {
            Endianness::Little => decode_field::<LittleEndian>(d, data),
            Endianness::Big => decode_field::<BigEndian>(d, data),
        }
    }

    /// Reads the field at `index` as byte data (fixed width-1 arrays and
    /// `char[]`-style out-of-line data).
    pub fn read_bytes<'data>(
        &self,
        index: usize,
        data: &'data [u8],
    ) -> Result<Cow<'data, [u8]>, DecodeError> {
        match self.read_value(index, data)? {
            Value::Bytes(bytes) => Ok(bytes),
            Value::Dynamic(arr) => Ok(Cow::Borrowed(arr.as_bytes())),
            _ => Err(DecodeError::InvalidKind(self.export_of(index))),
        }
    }

    /// Reads the out-of-line array referenced by the field at `index`.
    pub fn read_dynamic<'data>(
        &self,
        index: usize,
        data: &'data [u8],
    ) -> Result<DynamicArray<'data>, DecodeError> {
        match self.read_value(index, data)? {
            Value::Dynamic(arr) => Ok(arr),
            Value::Bytes(Cow::Borrowed(data)) => Ok(DynamicArray {
                elem: Scalar::U8,
                data,
            }),
            _ => Err(DecodeError::InvalidKind(self.export_of(index))),
        }
    }

    fn is_flagged(&self, index: usize) -> bool {
        self.report.as_ref().is_some_and(|r| r.unaligned[index])
    }

    fn export_of(&self, index: usize) -> CompactString {
        match self.layout.fields.get(index) {
            Some(RecordField::Data(d)) => d.export.clone(),
            _ => CompactString::from(format!("#{index}")),
        }
    }
}

fn field_bytes(data: &[u8], offset: u32, size: u32) -> Result<&[u8], DecodeError> {
    let start = offset as usize;
    let end = start + size as usize;
    data.get(start..end).ok_or(DecodeError::Truncated {
        need: end,
        got: data.len(),
    })
}

fn read_scalar<O: ByteOrder>(scalar: Scalar, bytes: &[u8]) -> Value<'static> {
    match scalar {
        Scalar::U8 => Value::U8(bytes[0]),
        Scalar::I8 => Value::I8(bytes[0] as i8),
        Scalar::U16 => Value::U16(O::read_u16(bytes)),
        Scalar::I16 => Value::I16(O::read_i16(bytes)),
        Scalar::U32 => Value::U32(O::read_u32(bytes)),
        Scalar::I32 => Value::I32(O::read_i32(bytes)),
        Scalar::U64 => Value::U64(O::read_u64(bytes)),
        Scalar::I64 => Value::I64(O::read_i64(bytes)),
    }
}

fn decode_field<'data, O: ByteOrder>(
    d: &DataField,
    data: &'data [u8],
) -> Result<Value<'data>, DecodeError> {
    match d.ty {
        CanonicalType::Scalar(scalar) => {
            let bytes = field_bytes(data, d.offset, scalar.width())?;
            Ok(read_scalar::<O>(scalar, bytes))
        }
        CanonicalType::FixedArray(elem, count) => {
            let bytes = field_bytes(data, d.offset, d.size)?;
            if elem.width() == 1 {
                return Ok(Value::Bytes(Cow::Borrowed(bytes)));
            }
            let w = elem.width() as usize;
            let values = (0..count as usize)
                .map(|i| read_scalar::<O>(elem, &bytes[i * w..i * w + w]))
                .collect();
            Ok(Value::Array(values))
        }
        CanonicalType::DynamicArrayRef(elem) => decode_dynamic::<O>(d, elem, data),
        // Fallback storage never survives logical derivation.
        CanonicalType::Fallback(_) => Err(DecodeError::InvalidKind(d.export.clone())),
    }
}

fn decode_dynamic<'data, O: ByteOrder>(
    d: &DataField,
    elem: Scalar,
    data: &'data [u8],
) -> Result<Value<'data>, DecodeError> {
    if d.size != 4 {
        return Err(DecodeError::InvalidKind(d.export.clone()));
    }
    let bytes = field_bytes(data, d.offset, 4)?;
    let packed = O::read_u32(bytes);
    // Low 16 bits: byte offset of the out-of-line data from the start of
    // the full event buffer. High 16 bits: its byte length, matching the
    // kernel's __get_dynamic_array_len().
    let offset = (packed & 0xffff) as usize;
    let len = (packed >> 16) as usize;
    let Some(slice) = data.get(offset..offset + len) else {
        return Err(DecodeError::DynamicOutOfRange { offset, len });
    };
    if elem.width() == 1 && !elem.signed() {
        return Ok(Value::Bytes(Cow::Borrowed(slice)));
    }
    let w = elem.width() as usize;
    // Whole elements only; stray trailing bytes are dropped.
    Ok(Value::Dynamic(DynamicArray {
        elem,
        data: &slice[..len / w * w],
    }))
}

/// Re-reads a field whose storage is an alignment-fallback byte array,
/// reinterpreting it in the machine's byte order with sign preserved at
/// the field's width.
fn decode_fallback<'data>(d: &DataField, data: &'data [u8]) -> Result<Value<'data>, DecodeError> {
    let CanonicalType::Scalar(scalar) = d.ty else {
        return Err(DecodeError::InvalidKind(d.export.clone()));
    };
    if !matches!(scalar.width(), 2 | 4 | 8) || d.size != scalar.width() {
        return Err(DecodeError::FallbackSize {
            field: d.export.clone(),
            size: d.size,
        });
    }
    let bytes = field_bytes(data, d.offset, d.size)?;
    Ok(match host_byte_order() {
        Endianness::Little => read_scalar::<LittleEndian>(scalar, bytes),
        Endianness::Big => read_scalar::<BigEndian>(scalar, bytes),
    })
}
