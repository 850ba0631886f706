//! Schema compiler and binary decoder for Linux tracing `format` files.
//!
//! A tracefs `format` description (one per kprobe or tracepoint event)
//! declares the fields of that event's binary record: a C type, a byte
//! offset, a size and a signedness flag per field. This crate compiles
//! such a description into an offset-exact record layout and decodes raw
//! event buffers against it:
//!
//! 1. [`EventFormat::parse`] turns the text into field descriptors.
//! 2. [`RecordLayout::build`] produces a contiguous, padding-explicit
//!    layout plus an [`AlignmentReport`] when any field is misaligned or
//!    out-of-line.
//! 3. [`LogicalLayout::derive`] restores misaligned fields to their true
//!    scalar types and expands `__data_loc` fields into dynamic-array
//!    references.
//! 4. [`EventDecoder::decode`] reads a raw buffer into named [`Value`]s;
//!    [`Registry::decode`] dispatches on the event id in the buffer's
//!    first two bytes when several formats are in play.
//!
//! Buffers are interpreted in the machine's byte order, the order the
//! kernel wrote them in.

pub mod decode;
pub mod format;
pub mod layout;
pub mod registry;
pub mod types;

pub use crate::decode::DecodeError;
pub use crate::decode::DecodedEvent;
pub use crate::decode::DynamicArray;
pub use crate::decode::EventDecoder;
pub use crate::decode::Value;
pub use crate::format::EventFormat;
pub use crate::format::FieldDescriptor;
pub use crate::format::FormatError;
pub use crate::layout::AlignmentReport;
pub use crate::layout::DataField;
pub use crate::layout::LayoutError;
pub use crate::layout::LogicalLayout;
pub use crate::layout::RecordField;
pub use crate::layout::RecordLayout;
pub use crate::registry::Registry;
pub use crate::registry::RegistryError;
pub use crate::types::CanonicalType;
pub use crate::types::Endianness;
pub use crate::types::Scalar;
pub use crate::types::host_byte_order;
