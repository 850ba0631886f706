//! Multi-event registry keyed by numeric event id.

use crate::decode::{DecodeError, DecodedEvent, EventDecoder};
use crate::format::{EventFormat, FormatError};
use crate::layout::{LayoutError, LogicalLayout, RecordLayout};
use crate::types::{Endianness, host_byte_order};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use compact_str::CompactString;
use std::collections::HashMap;

/// Error type for registration and registry-level decode.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// A set of event decoders addressable by the id stamped into the first
/// two bytes of every event record.
///
/// Registration runs the full pipeline once per format; per-event decode
/// only dispatches on the leading id.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    decoders: HashMap<u16, EventDecoder>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses `text` and installs a decoder for its event id, returning
    /// the probe name and id. A format re-registered under an id that is
    /// already taken replaces the previous decoder.
    pub fn register(&mut self, text: &str) -> Result<(CompactString, u16), RegistryError> {
        let format = EventFormat::parse(text)?;
        let (layout, report) = RecordLayout::build(&format)?;
        let logical = LogicalLayout::derive(&layout)?;
        let decoder = EventDecoder::new(logical, report)?;
        let name = format.name.clone();
        let id = format.id;
        if let Some(old) = self.decoders.insert(id, decoder) {
            log::warn!(
                "replacing decoder for event id={id}: {} -> {name}",
                old.layout().name
            );
        }
        Ok((name, id))
    }

    /// The decoder registered under `id`, if any.
    pub fn decoder(&self, id: u16) -> Option<&EventDecoder> {
        self.decoders.get(&id)
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Decodes an event buffer, selecting the decoder by the id in the
    /// buffer's first two bytes.
    pub fn decode<'data>(&self, data: &'data [u8]) -> Result<DecodedEvent<'data>, DecodeError> {
        if data.len() < 2 {
            return Err(DecodeError::Truncated {
                need: 2,
                got: data.len(),
            });
        }
        let id = match host_byte_order() {
            Endianness::Little => LittleEndian::read_u16(data),
            Endianness::Big => BigEndian::read_u16(data),
        };
        let Some(decoder) = self.decoders.get(&id) else {
            return Err(DecodeError::UnknownId(id));
        };
        decoder.decode(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::Value;
    use indoc::indoc;
    use std::borrow::Cow;

    const DO_SYS_OPEN: &str = indoc! {"
    name: do_sys_open
    ID: 7090
    format:
    \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
    \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
    \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
    \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

    \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;
    \tfield:u32 dfd;\toffset:16;\tsize:4;\tsigned:0;
    \tfield:__data_loc char[] filename;\toffset:20;\tsize:4;\tsigned:1;
    \tfield:u32 flags;\toffset:24;\tsize:4;\tsigned:0;
    \tfield:u32 mode;\toffset:28;\tsize:4;\tsigned:0;
    "};

    const IP_LOCAL_OUT_CALL: &str = indoc! {"
    name: ip_local_out_call
    ID: 3965
    format:
    \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
    \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
    \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
    \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

    \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;
    \tfield:u64 sock;\toffset:16;\tsize:8;\tsigned:0;
    \tfield:u32 size;\toffset:24;\tsize:4;\tsigned:0;
    \tfield:u16 af;\toffset:28;\tsize:2;\tsigned:0;
    \tfield:u32 laddr;\toffset:30;\tsize:4;\tsigned:0;
    \tfield:u16 lport;\toffset:34;\tsize:2;\tsigned:0;
    \tfield:u32 raddr;\toffset:36;\tsize:4;\tsigned:0;
    \tfield:u16 rport;\toffset:40;\tsize:2;\tsigned:0;
    "};

    const VFS_READ: &str = indoc! {"
    name: vfs_read
    ID: 3842
    format:
    \tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
    \tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
    \tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
    \tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

    \tfield:unsigned long __probe_ip;\toffset:8;\tsize:8;\tsigned:0;
    \tfield:u64 arg1;\toffset:16;\tsize:8;\tsigned:0;
    \tfield:u8 arg2[8];\toffset:24;\tsize:8;\tsigned:0;
    "};

    fn registry() -> Registry {
        let mut registry = Registry::new();
        assert_eq!(
            registry.register(DO_SYS_OPEN),
            Ok((CompactString::from("do_sys_open"), 7090))
        );
        assert_eq!(
            registry.register(IP_LOCAL_OUT_CALL),
            Ok((CompactString::from("ip_local_out_call"), 3965))
        );
        assert_eq!(
            registry.register(VFS_READ),
            Ok((CompactString::from("vfs_read"), 3842))
        );
        registry
    }

    #[test]
    fn test_register() {
        let registry = registry();
        assert_eq!(registry.len(), 3);
        assert!(registry.decoder(7090).is_some());
        assert!(registry.decoder(3965).is_some());
        assert!(registry.decoder(3842).is_some());
        assert!(registry.decoder(1).is_none());
    }

    #[test]
    fn test_register_invalid_format() {
        let mut registry = Registry::new();
        assert!(matches!(
            registry.register("format:\n\tfield:int a;\toffset:0;\tsize:4;\n"),
            Err(RegistryError::Format(_))
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_replaces() {
        let mut registry = registry();
        let renamed = DO_SYS_OPEN.replace("name: do_sys_open", "name: do_sys_open2");
        assert_eq!(
            registry.register(&renamed),
            Ok((CompactString::from("do_sys_open2"), 7090))
        );
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.decoder(7090).unwrap().layout().name, "do_sys_open2");
    }

    #[test]
    #[cfg(target_endian = "little")]
    fn test_decode_dispatch() {
        let registry = registry();

        // do_sys_open, id 7090 in the leading two bytes.
        let data: &[u8] = &[
            0xb2, 0x1b, 0x00, 0x00, 0xc1, 0x7f, 0x00, 0x00, //
            0xf0, 0xa1, 0x6d, 0xae, 0xff, 0xff, 0xff, 0xff, //
            0x30, 0xa5, 0x6d, 0xae, 0x20, 0x00, 0x0a, 0x00, //
            0x41, 0x82, 0x08, 0x00, 0xa4, 0x01, 0x00, 0x00, //
            0x66, 0x69, 0x6c, 0x65, 0x2e, 0x74, 0x65, 0x78, //
            0x74, 0x00, 0x00, 0x00,
        ];
        let event = registry.decode(data).unwrap();
        assert_eq!(event.name(), "do_sys_open");
        assert_eq!(event.get("Common_pid"), Some(&Value::I32(32705)));
        assert_eq!(
            event.get("Filename"),
            Some(&Value::Bytes(Cow::Borrowed(b"file.text\0")))
        );
        assert_eq!(event.get("Mode"), Some(&Value::U32(420)));

        // ip_local_out_call, id 3965.
        let data: &[u8] = &[
            0x7d, 0x0f, 0x00, 0x00, 0xc7, 0x29, 0x00, 0x00, //
            0x0f, 0x2b, 0xdb, 0xef, 0x00, 0x00, 0x00, 0x00, //
            0x40, 0xe0, 0x73, 0x97, 0x7d, 0x9e, 0x00, 0x00, //
            0x3c, 0x00, 0x00, 0x00, 0x02, 0x00, 0x7f, 0x00, //
            0x00, 0x01, 0xde, 0xad, 0x7f, 0x00, 0x00, 0x01, //
            0xbe, 0xef, 0x00, 0x00,
        ];
        let event = registry.decode(data).unwrap();
        assert_eq!(event.name(), "ip_local_out_call");
        assert_eq!(event.get("Laddr"), Some(&Value::U32(16_777_343)));
        assert_eq!(event.get("Lport"), Some(&Value::U16(44510)));

        // vfs_read, id 3842.
        let data: &[u8] = &[
            0x02, 0x0f, 0x00, 0x00, 0x73, 0x1e, 0x00, 0x00, //
            0x0f, 0xeb, 0xd4, 0x3f, 0x00, 0x00, 0x00, 0x00, //
            0xb0, 0x1d, 0xfa, 0xce, 0x11, 0xe5, 0x00, 0x00, //
            0x52, 0x12, 0x1b, 0x81, 0xff, 0xff, 0xff, 0xff,
        ];
        let event = registry.decode(data).unwrap();
        assert_eq!(event.name(), "vfs_read");
        assert_eq!(event.get("Arg1"), Some(&Value::U64(251_864_649_702_832)));
    }

    #[test]
    fn test_decode_unknown_id() {
        let registry = registry();
        let data = 9999_u16.to_ne_bytes();
        assert_eq!(registry.decode(&data), Err(DecodeError::UnknownId(9999)));
    }

    #[test]
    fn test_decode_short_buffer() {
        let registry = registry();
        assert_eq!(
            registry.decode(&[0x01]),
            Err(DecodeError::Truncated { need: 2, got: 1 })
        );
    }
}
