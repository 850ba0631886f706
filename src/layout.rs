//! Record layouts built from an event format, and the logical views used
//! for decoding.

use crate::format::{EventFormat, FormatError};
use crate::types::{CanonicalType, ResolveMode, dynamic_element, resolve};
use compact_str::CompactString;
use smallvec::SmallVec;
use std::collections::HashSet;
use std::fmt;

/// Error type for layout construction and logical derivation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error(transparent)]
    Format(#[from] FormatError),
    /// A field's declared offset fell before the end of the previous field.
    #[error("invalid offset for field {index}: {offset}")]
    OffsetRegression { index: usize, offset: u32 },
    /// Two fields mapped to the same exported display name.
    #[error("duplicate field name: {0}")]
    DuplicateField(CompactString),
    /// Post-construction verification found a field whose position does not
    /// reproduce its declared offset.
    #[error("could not reproduce declared offset for {name}: {got} != {want}")]
    OffsetMismatch {
        name: CompactString,
        got: u32,
        want: u32,
    },
    #[error("record size mismatch: {got} != {want}")]
    SizeMismatch { got: u32, want: u32 },
    /// An out-of-line field references an element type this crate has no
    /// width entry for.
    #[error("unsupported dynamic array element type: {0}")]
    UnsupportedElement(CompactString),
}

/// A positioned, typed field of a record layout.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct DataField {
    /// Original C field name.
    pub name: CompactString,
    /// Exported display identifier, e.g. `Probe_ip` for `__probe_ip`.
    pub export: CompactString,
    /// C type spelling, array suffix included.
    pub ctyp: CompactString,
    pub offset: u32,
    pub size: u32,
    pub signed: bool,
    pub ty: CanonicalType,
    /// True when the declared offset breaks the true type's natural
    /// alignment and `ty` is a raw-byte fallback.
    pub fallback: bool,
}

/// One unit of a record layout: declared data or synthetic padding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub enum RecordField {
    Padding { offset: u32, size: u32 },
    Data(DataField),
}

impl RecordField {
    pub fn size(&self) -> u32 {
        match self {
            Self::Padding { size, .. } => *size,
            Self::Data(d) => d.size,
        }
    }

    pub fn offset(&self) -> u32 {
        match self {
            Self::Padding { offset, .. } => *offset,
            Self::Data(d) => d.offset,
        }
    }
}

/// Indices of fields that need the fallback decode path.
///
/// Produced alongside an otherwise valid [`RecordLayout`]; its presence is a
/// routing signal, not a failure.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct AlignmentReport {
    /// Indices into the layout's field sequence, padding included.
    pub fields: SmallVec<[usize; 4]>,
    /// Per-index mask of the same length as the field sequence.
    pub unaligned: Vec<bool>,
    /// The layout contains a `__data_loc` field.
    pub dynamic_array: bool,
}

impl fmt::Display for AlignmentReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fields.is_empty() && self.dynamic_array {
            return write!(f, "dynamic array in record");
        }
        if self.dynamic_array {
            return write!(
                f,
                "dynamic array and unaligned fields in record: {:?}",
                self.fields
            );
        }
        write!(f, "unaligned fields in record: {:?}", self.fields)
    }
}

/// Converts a C field name to its exported display identifier: leading
/// underscores stripped, first remaining character uppercased. A name with
/// nothing left after stripping maps to itself.
pub(crate) fn export_name(name: &str) -> CompactString {
    let trimmed = name.trim_start_matches('_');
    let Some(first) = trimmed.chars().next() else {
        return CompactString::from(name);
    };
    if first.is_uppercase() {
        return CompactString::from(trimmed);
    }
    let mut out = CompactString::default();
    out.extend(first.to_uppercase());
    out.push_str(&trimmed[first.len_utf8()..]);
    out
}

/// An offset-exact record layout for one event format.
///
/// Immutable once built; decoding only reads it, so one layout can serve
/// arbitrarily many decode calls concurrently.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct RecordLayout {
    /// Probe name.
    pub name: CompactString,
    /// 16-bit format identifier.
    pub id: u16,
    /// Byte length of the fixed-size portion: the end offset of the last
    /// field, with no trailing natural-alignment padding.
    pub total_size: u32,
    pub fields: Vec<RecordField>,
}

impl RecordLayout {
    /// Assembles the descriptors of `format` into a layout reproducing the
    /// declared byte offsets exactly, inserting padding for gaps.
    ///
    /// The report is `Some` when any field required alignment fallback or
    /// the format contains an out-of-line array; the layout is still valid
    /// and decodable in that case.
    pub fn build(format: &EventFormat) -> Result<(Self, Option<AlignmentReport>), LayoutError> {
        let mut fields = Vec::with_capacity(format.fields.len());
        let mut report = AlignmentReport::default();
        let mut seen = HashSet::new();
        let mut next_offset = 0;
        for (index, desc) in format.fields.iter().enumerate() {
            if desc.ctyp.starts_with("__data_loc") {
                report.dynamic_array = true;
            }
            if desc.offset < next_offset {
                return Err(LayoutError::OffsetRegression {
                    index,
                    offset: desc.offset,
                });
            }
            let pad = desc.offset - next_offset;
            if pad > 0 {
                fields.push(RecordField::Padding {
                    offset: next_offset,
                    size: pad,
                });
            }
            let (ty, fallback) = resolve(
                &desc.ctyp,
                desc.offset,
                desc.size,
                desc.signed,
                ResolveMode::Construction,
            )?;
            if fallback {
                report.fields.push(fields.len());
            }
            let export = export_name(&desc.name);
            if !seen.insert(export.clone()) {
                return Err(LayoutError::DuplicateField(export));
            }
            fields.push(RecordField::Data(DataField {
                name: desc.name.clone(),
                export,
                ctyp: desc.ctyp.clone(),
                offset: desc.offset,
                size: desc.size,
                signed: desc.signed,
                ty,
                fallback,
            }));
            next_offset = desc.offset + desc.size;
        }
        let layout = Self {
            name: format.name.clone(),
            id: format.id,
            total_size: next_offset,
            fields,
        };
        layout.verify()?;
        if report.fields.is_empty() && !report.dynamic_array {
            return Ok((layout, None));
        }
        report.unaligned = vec![false; layout.fields.len()];
        for &index in &report.fields {
            report.unaligned[index] = true;
        }
        Ok((layout, Some(report)))
    }

    /// Re-walks the field sequence confirming that every field sits exactly
    /// at its declared offset and the sequence is contiguous.
    fn verify(&self) -> Result<(), LayoutError> {
        let mut cursor = 0;
        for field in &self.fields {
            if field.offset() != cursor {
                let name = match field {
                    RecordField::Padding { .. } => CompactString::from("padding"),
                    RecordField::Data(d) => d.export.clone(),
                };
                return Err(LayoutError::OffsetMismatch {
                    name,
                    got: cursor,
                    want: field.offset(),
                });
            }
            cursor += field.size();
        }
        if cursor != self.total_size {
            return Err(LayoutError::SizeMismatch {
                got: cursor,
                want: self.total_size,
            });
        }
        Ok(())
    }
}

/// The decode-time view of a [`RecordLayout`]: padding shrunk to zero
/// length, fallback fields restored to their true type and out-of-line
/// fields expanded to dynamic-array references.
///
/// Field order and indices match the record layout exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct LogicalLayout {
    pub name: CompactString,
    pub id: u16,
    pub total_size: u32,
    pub fields: Vec<RecordField>,
}

impl LogicalLayout {
    pub fn derive(layout: &RecordLayout) -> Result<Self, LayoutError> {
        let fields = layout
            .fields
            .iter()
            .map(|field| {
                let d = match field {
                    RecordField::Padding { offset, .. } => {
                        // Zero-length placeholder keeping indices aligned
                        // with the record layout.
                        return Ok(RecordField::Padding {
                            offset: *offset,
                            size: 0,
                        });
                    }
                    RecordField::Data(d) => d,
                };
                if d.ctyp.starts_with("__data_loc") {
                    let elem = dynamic_element(&d.ctyp)
                        .ok_or_else(|| LayoutError::UnsupportedElement(d.ctyp.clone()))?;
                    return Ok(RecordField::Data(DataField {
                        ty: CanonicalType::DynamicArrayRef(elem),
                        fallback: false,
                        ..d.clone()
                    }));
                }
                if d.fallback {
                    let (ty, _) =
                        resolve(&d.ctyp, d.offset, d.size, d.signed, ResolveMode::Logical)?;
                    return Ok(RecordField::Data(DataField {
                        ty,
                        fallback: false,
                        ..d.clone()
                    }));
                }
                Ok(RecordField::Data(d.clone()))
            })
            .collect::<Result<Vec<_>, LayoutError>>()?;
        Ok(Self {
            name: layout.name.clone(),
            id: layout.id,
            total_size: layout.total_size,
            fields,
        })
    }
}
