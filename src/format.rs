//! Parser for the per-event `format` description emitted under
//! `/sys/kernel/tracing/events`.

use compact_str::CompactString;
use smallvec::SmallVec;

/// Error type for format description parsing and type resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FormatError {
    /// A field line did not split into the four expected tokens.
    #[error("invalid field line: expected 4 tokens, got {0}")]
    FieldTokenCount(usize),
    /// A field-line token had no `key:value` shape.
    #[error("field token does not contain a colon: {0:?}")]
    MissingColon(String),
    /// A field-line token carried an unknown key.
    #[error("unknown field token: {0:?}")]
    UnknownFieldKey(String),
    /// A field line was missing one of its four tokens.
    #[error("missing field token: {0}")]
    MissingToken(&'static str),
    /// The `field:` token had no space separating type from name.
    #[error("invalid field description: {0:?}")]
    InvalidFieldDescription(String),
    #[error("invalid offset value: {0:?}")]
    InvalidOffset(String),
    #[error("invalid size value: {0:?}")]
    InvalidSize(String),
    #[error("invalid signed value: {0:?}")]
    InvalidSigned(String),
    #[error("invalid ID value: {0:?}")]
    InvalidId(String),
    /// Format IDs are guaranteed by the kernel to fit in 16 bits.
    #[error("format id overflows u16: {0}")]
    IdOverflow(u64),
    /// Array syntax that is neither `[N]` nor a `__data_loc` empty bracket.
    #[error("invalid data type: {0:?}")]
    InvalidDataType(String),
    #[error("invalid size for array: size={size} elements={elements}")]
    InvalidArraySize { size: u32, elements: u32 },
    /// Element byte width outside the canonical {1, 2, 4, 8} set.
    #[error("unsupported field width: {0}")]
    UnsupportedWidth(u32),
}

/// One declared field of an event record, exactly as the schema spells it.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct FieldDescriptor {
    /// The C field name, e.g. `common_pid`, `__probe_ip`.
    pub name: CompactString,
    /// The C type spelling with any array suffix folded in, e.g. `int`,
    /// `char[16]`, `__data_loc char[]`.
    pub ctyp: CompactString,
    /// Byte offset from the start of the record.
    pub offset: u32,
    /// Total byte size including array multiplicity.
    pub size: u32,
    /// Whether the declared type is signed.
    pub signed: bool,
}

impl FieldDescriptor {
    /// Parses one `\tfield:...` line into a descriptor.
    fn parse(line: &str) -> Result<Self, FormatError> {
        let parts: SmallVec<[&str; 4]> = line[1..].split('\t').collect();
        if parts.len() != 4 {
            return Err(FormatError::FieldTokenCount(parts.len()));
        }
        let mut ctyp = None;
        let mut name = None;
        let mut offset = None;
        let mut size = None;
        let mut signed = None;
        for part in parts {
            let part = part.strip_suffix(';').unwrap_or(part);
            let (key, value) = part
                .split_once(':')
                .ok_or_else(|| FormatError::MissingColon(part.to_owned()))?;
            match key {
                "field" => {
                    // Split type from name at the last space; a `[N]` suffix
                    // on the name belongs to the type.
                    let last_space = value
                        .rfind(' ')
                        .ok_or_else(|| FormatError::InvalidFieldDescription(value.to_owned()))?;
                    let ftype = &value[..last_space];
                    let mut fname = &value[last_space + 1..];
                    if let Some(idx) = fname.rfind('[') {
                        ctyp = Some(CompactString::from(format!("{ftype}{}", &fname[idx..])));
                        fname = &fname[..idx];
                    } else {
                        ctyp = Some(CompactString::from(ftype));
                    }
                    name = Some(CompactString::from(fname));
                }
                "offset" => {
                    offset = Some(
                        value
                            .parse()
                            .map_err(|_| FormatError::InvalidOffset(value.to_owned()))?,
                    );
                }
                "size" => {
                    size = Some(
                        value
                            .parse()
                            .map_err(|_| FormatError::InvalidSize(value.to_owned()))?,
                    );
                }
                "signed" => {
                    signed = Some(match value {
                        "1" => true,
                        "0" => false,
                        _ => return Err(FormatError::InvalidSigned(value.to_owned())),
                    });
                }
                _ => return Err(FormatError::UnknownFieldKey(key.to_owned())),
            }
        }
        Ok(Self {
            name: name.ok_or(FormatError::MissingToken("field"))?,
            ctyp: ctyp.ok_or(FormatError::MissingToken("field"))?,
            offset: offset.ok_or(FormatError::MissingToken("offset"))?,
            size: size.ok_or(FormatError::MissingToken("size"))?,
            signed: signed.ok_or(FormatError::MissingToken("signed"))?,
        })
    }
}

/// A parsed event format: probe name, 16-bit format ID and the declared
/// fields in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde_derive::Serialize))]
pub struct EventFormat {
    pub name: CompactString,
    pub id: u16,
    pub fields: Vec<FieldDescriptor>,
}

impl EventFormat {
    /// Parses the text of a format description.
    ///
    /// Field lines are recognised solely by their `\tfield:` prefix;
    /// `name:` and `ID:` lines set the probe name and format ID. Everything
    /// else (`format:`, `print fmt:`, blank lines) is ignored.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        let mut name = CompactString::default();
        let mut id = 0;
        let mut fields = Vec::new();
        for line in text.split('\n') {
            if line.starts_with("\tfield:") {
                fields.push(FieldDescriptor::parse(line)?);
            } else if let Some(value) = line.strip_prefix("name: ") {
                name = CompactString::from(value);
            } else if let Some(value) = line.strip_prefix("ID: ") {
                let n: u64 = value
                    .trim()
                    .parse()
                    .map_err(|_| FormatError::InvalidId(value.to_owned()))?;
                id = u16::try_from(n).map_err(|_| FormatError::IdOverflow(n))?;
            } else if !line.is_empty() {
                log::debug!("ignoring format line: {line:?}");
            }
        }
        Ok(Self { name, id, fields })
    }
}
