//! Container-level parsing: magic/version check and the section walk with
//! known-section ordering enforcement.

use crate::reader::Reader;
use crate::{Error, Result};

pub const SECTION_CUSTOM: u8 = 0;
pub const SECTION_TYPE: u8 = 1;
pub const SECTION_IMPORT: u8 = 2;
pub const SECTION_FUNCTION: u8 = 3;
pub const SECTION_TABLE: u8 = 4;
pub const SECTION_MEMORY: u8 = 5;
pub const SECTION_GLOBAL: u8 = 6;
pub const SECTION_EXPORT: u8 = 7;
pub const SECTION_START: u8 = 8;
pub const SECTION_ELEMENT: u8 = 9;
pub const SECTION_CODE: u8 = 10;
pub const SECTION_DATA: u8 = 11;
pub const SECTION_DATACOUNT: u8 = 12;

/// One raw section: id, payload slice, and the payload's offset within the
/// whole file (relocation offsets are relative to section bodies).
pub struct Section<'a> {
    pub id: u8,
    pub payload: &'a [u8],
    pub file_offset: usize,
}

/// Known sections must appear in this relative order; datacount sits
/// between element and code.
fn section_rank(id: u8) -> Option<u8> {
    Some(match id {
        SECTION_TYPE => 1,
        SECTION_IMPORT => 2,
        SECTION_FUNCTION => 3,
        SECTION_TABLE => 4,
        SECTION_MEMORY => 5,
        SECTION_GLOBAL => 6,
        SECTION_EXPORT => 7,
        SECTION_START => 8,
        SECTION_ELEMENT => 9,
        SECTION_DATACOUNT => 10,
        SECTION_CODE => 11,
        SECTION_DATA => 12,
        _ => return None,
    })
}

pub const WASM_MAGIC: u32 = 0x6d73_6100; // "\0asm" little-endian
pub const WASM_VERSION: u32 = 1;

/// Split a binary module into its sections, validating the header and the
/// ordering of known section ids.
pub fn split_sections(buf: &[u8]) -> Result<Vec<Section<'_>>> {
    let mut r = Reader::new(buf);

    let magic = r.read_u32_le()?;
    if magic != WASM_MAGIC && magic.swap_bytes() != WASM_MAGIC {
        return Err(Error::load("magic header not detected"));
    }
    // A big-endian magic means the whole header was byte-swapped by the
    // producer; accept either orientation for the version word too.
    let version = r.read_u32_le()?;
    if version != WASM_VERSION && version.swap_bytes() != WASM_VERSION {
        return Err(Error::load("unknown binary version"));
    }

    let mut sections = Vec::new();
    let mut last_rank = 0u8;

    while !r.is_empty() {
        let id = r.read_u8()?;
        let size = r.read_leb_u32()? as usize;
        let file_offset = r.pos();
        let payload = r
            .read_bytes(size)
            .map_err(|_| Error::load("section size mismatch"))?;

        if id == SECTION_CUSTOM {
            sections.push(Section { id, payload, file_offset });
            continue;
        }

        let Some(rank) = section_rank(id) else {
            return Err(Error::load("invalid section id"));
        };
        if rank <= last_rank {
            return Err(Error::load("unexpected content after last section"));
        }
        last_rank = rank;
        sections.push(Section { id, payload, file_offset });
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module() {
        let buf = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
        assert!(split_sections(&buf).unwrap().is_empty());
    }

    #[test]
    fn bad_magic() {
        let buf = [0x00, 0x61, 0x73, 0x6e, 0x01, 0x00, 0x00, 0x00];
        let err = split_sections(&buf).unwrap_err();
        assert!(err.to_string().contains("magic header not detected"));
    }

    #[test]
    fn bad_version() {
        let buf = [0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00];
        let err = split_sections(&buf).unwrap_err();
        assert!(err.to_string().contains("unknown binary version"));
    }

    #[test]
    fn out_of_order_sections_rejected() {
        // memory (5) before table (4)
        let buf = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
            0x05, 0x01, 0x00, // memory section, 0 entries
            0x04, 0x01, 0x00, // table section, 0 entries
        ];
        let err = split_sections(&buf).unwrap_err();
        assert!(err.to_string().contains("unexpected content after last section"));
    }

    #[test]
    fn duplicate_section_rejected() {
        let buf = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
            0x01, 0x01, 0x00, // type section
            0x01, 0x01, 0x00, // type section again
        ];
        assert!(split_sections(&buf).is_err());
    }

    #[test]
    fn truncated_section_body() {
        let buf = [
            0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, //
            0x01, 0x7f, 0x00, // declared size far beyond the buffer
        ];
        let err = split_sections(&buf).unwrap_err();
        assert!(err.to_string().contains("section size mismatch"));
    }
}
