//! Canonical field types and the resolution of C type spellings onto them.

use crate::format::FormatError;
use std::sync::LazyLock;

/// Marker prefix on the type spelling of an out-of-line array field.
pub(crate) const DATA_LOC_PREFIX: &str = "__data_loc ";

/// Byte order of the executing machine.
///
/// Tracepoint records are produced by the local kernel, so one process-wide
/// probe is enough; no cross-endian conversion is supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Little,
    Big,
}

/// Returns the native byte order, probed once per process.
pub fn host_byte_order() -> Endianness {
    static MACHINE: LazyLock<Endianness> = LazyLock::new(|| {
        match u16::from_ne_bytes([0x01, 0x02]) {
            0x0102 => Endianness::Big,
            _ => Endianness::Little,
        }
    });
    *MACHINE
}

/// One of the eight fixed-width integer kinds a field can resolve to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub enum Scalar {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
}

impl Scalar {
    /// Looks up the scalar for a `(byte width, signedness)` class.
    pub const fn from_class(width: u32, signed: bool) -> Option<Self> {
        Some(match (width, signed) {
            (1, false) => Self::U8,
            (1, true) => Self::I8,
            (2, false) => Self::U16,
            (2, true) => Self::I16,
            (4, false) => Self::U32,
            (4, true) => Self::I32,
            (8, false) => Self::U64,
            (8, true) => Self::I64,
            _ => return None,
        })
    }

    pub const fn width(self) -> u32 {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 | Self::I32 => 4,
            Self::U64 | Self::I64 => 8,
        }
    }

    pub const fn signed(self) -> bool {
        matches!(self, Self::I8 | Self::I16 | Self::I32 | Self::I64)
    }

    /// Natural alignment requirement, equal to the width for every
    /// canonical scalar on the targets this crate supports.
    pub const fn align(self) -> u32 {
        self.width()
    }
}

/// Resolved runtime type of a record field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub enum CanonicalType {
    Scalar(Scalar),
    /// Fixed-size array of `count` scalars, e.g. `char comm[16]`.
    FixedArray(Scalar, u32),
    /// 32-bit packed offset+length descriptor referencing out-of-line data
    /// of the given element type. Only appears in logical layouts.
    DynamicArrayRef(Scalar),
    /// Raw byte-array stand-in for a field whose declared offset breaks the
    /// true type's natural alignment. Only appears in record layouts.
    Fallback(u32),
}

/// Whether [`resolve`] enforces natural alignment against the declared
/// offset. Logical derivation skips the check and so can never fall back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResolveMode {
    Construction,
    Logical,
}

/// Array suffix on a type spelling: `[N]` for fixed arrays, bare `[]` for
/// dynamic ones.
static ARRAY_SUFFIX: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\[([0-9]*)\]$").expect("Failed to compile regex"));

/// Returns the element count and dynamic flag for a type spelling.
fn array_size(ctyp: &str) -> Result<(u32, bool), FormatError> {
    let Some(caps) = ARRAY_SUFFIX.captures(ctyp) else {
        if ctyp.ends_with(']') {
            return Err(FormatError::InvalidDataType(ctyp.into()));
        }
        return Ok((1, false));
    };
    let digits = &caps[1];
    if digits.is_empty() {
        // An empty suffix is only legal on out-of-line array fields.
        if !ctyp.starts_with(DATA_LOC_PREFIX) {
            return Err(FormatError::InvalidDataType(ctyp.into()));
        }
        return Ok((1, true));
    }
    let n = digits
        .parse()
        .map_err(|_| FormatError::InvalidDataType(ctyp.into()))?;
    Ok((n, false))
}

/// Maps a descriptor's `(ctyp, offset, size, signed)` onto a canonical type.
///
/// The returned flag is true when the field's true type could not be placed
/// at the declared offset and its storage becomes a raw byte array instead.
pub(crate) fn resolve(
    ctyp: &str,
    offset: u32,
    size: u32,
    signed: bool,
    mode: ResolveMode,
) -> Result<(CanonicalType, bool), FormatError> {
    let (n, dynamic) = array_size(ctyp)?;
    if n == 0 || size % n != 0 {
        return Err(FormatError::InvalidArraySize { size, elements: n });
    }
    let width = size / n;
    // Out-of-line fields carry an unsigned packed descriptor in the record
    // regardless of the declared element signedness.
    let scalar = Scalar::from_class(width, signed && !dynamic)
        .ok_or(FormatError::UnsupportedWidth(width))?;
    if mode == ResolveMode::Construction && offset % scalar.align() != 0 {
        return Ok((CanonicalType::Fallback(size), true));
    }
    if n > 1 {
        return Ok((CanonicalType::FixedArray(scalar, n), false));
    }
    Ok((CanonicalType::Scalar(scalar), false))
}

/// Width of the C `long` family on the targeted ABI. Named C types cannot be
/// introspected from Rust, so this is pinned by pointer width: 8 bytes on
/// 64-bit Linux targets, 4 on 32-bit ones.
const C_LONG_WIDTH: u32 = if cfg!(target_pointer_width = "64") { 8 } else { 4 };

/// Element type referenced by an out-of-line array spelling such as
/// `__data_loc char[]`. Returns `None` for unsupported element spellings.
pub(crate) fn dynamic_element(ctyp: &str) -> Option<Scalar> {
    let spelling = ctyp
        .strip_prefix(DATA_LOC_PREFIX)
        .unwrap_or(ctyp)
        .trim_start_matches('_');
    let (width, signed) = match spelling {
        // char is decoded as bytes, not as a signed element type.
        "char[]" | "uchar[]" => (1, false),
        "schar[]" => (1, true),
        "short[]" | "signed short[]" => (2, true),
        "unsigned short[]" => (2, false),
        "long[]" | "signed long[]" => (C_LONG_WIDTH, true),
        "unsigned long[]" => (C_LONG_WIDTH, false),
        "long long[]" | "signed long long[]" => (8, true),
        "unsigned long long[]" => (8, false),
        "s8[]" => (1, true),
        "s16[]" => (2, true),
        "s32[]" => (4, true),
        "s64[]" => (8, true),
        "u8[]" => (1, false),
        "u16[]" => (2, false),
        "u32[]" => (4, false),
        "u64[]" => (8, false),
        _ => return None,
    };
    Scalar::from_class(width, signed)
}
