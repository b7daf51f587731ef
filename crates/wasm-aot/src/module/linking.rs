//! Decoders for the `name`, `linking` (LLVM lld, version 2), and
//! `reloc.CODE` / `reloc.DATA` custom sections.

use crate::reader::Reader;
use crate::sections;
use crate::{Error, Result};

use super::Module;

pub const LINKING_VERSION: u32 = 2;

// Linking subsection ids.
const WASM_SEGMENT_INFO: u8 = 5;
const WASM_INIT_FUNCS: u8 = 6;
const WASM_COMDAT_INFO: u8 = 7;
const WASM_SYMBOL_TABLE: u8 = 8;

// Symbol flags.
pub const WASM_SYM_BINDING_WEAK: u32 = 0x01;
pub const WASM_SYM_BINDING_LOCAL: u32 = 0x02;
pub const WASM_SYM_VISIBILITY_HIDDEN: u32 = 0x04;
pub const WASM_SYM_UNDEFINED: u32 = 0x10;
pub const WASM_SYM_EXPORTED: u32 = 0x20;
pub const WASM_SYM_EXPLICIT_NAME: u32 = 0x40;
pub const WASM_SYM_NO_STRIP: u32 = 0x80;
pub const WASM_SYM_TLS: u32 = 0x100;
pub const WASM_SYM_ABSOLUTE: u32 = 0x200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    Function,
    Data,
    Global,
    Section,
    Tag,
    Table,
}

impl SymbolKind {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0 => Self::Function,
            1 => Self::Data,
            2 => Self::Global,
            3 => Self::Section,
            4 => Self::Tag,
            5 => Self::Table,
            _ => return None,
        })
    }
}

pub struct Symbol<'a> {
    pub kind: SymbolKind,
    pub flags: u32,
    pub name: Option<&'a str>,
    /// Function/global/table/tag/section index.
    pub index: u32,
    /// Data symbols only.
    pub seg_index: u32,
    pub data_offset: u64,
    pub data_size: u64,
}

impl Symbol<'_> {
    #[must_use]
    pub fn is_defined(&self) -> bool {
        self.flags & WASM_SYM_UNDEFINED == 0
    }

    #[must_use]
    pub fn is_weak(&self) -> bool {
        self.flags & WASM_SYM_BINDING_WEAK != 0
    }

    #[must_use]
    pub fn is_local(&self) -> bool {
        self.flags & WASM_SYM_BINDING_LOCAL != 0
    }

    #[must_use]
    pub fn is_absolute(&self) -> bool {
        self.flags & WASM_SYM_ABSOLUTE != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(non_camel_case_types, reason = "R_WASM_* kinds keep their lld spelling")]
pub enum RelocKind {
    R_WASM_FUNCTION_INDEX_LEB = 0,
    R_WASM_TABLE_INDEX_SLEB = 1,
    R_WASM_TABLE_INDEX_I32 = 2,
    R_WASM_MEMORY_ADDR_LEB = 3,
    R_WASM_MEMORY_ADDR_SLEB = 4,
    R_WASM_MEMORY_ADDR_I32 = 5,
    R_WASM_TYPE_INDEX_LEB = 6,
    R_WASM_GLOBAL_INDEX_LEB = 7,
    R_WASM_FUNCTION_OFFSET_I32 = 8,
    R_WASM_SECTION_OFFSET_I32 = 9,
    R_WASM_TAG_INDEX_LEB = 10,
    R_WASM_MEMORY_ADDR_REL_SLEB = 11,
    R_WASM_TABLE_INDEX_REL_SLEB = 12,
    R_WASM_GLOBAL_INDEX_I32 = 13,
    R_WASM_MEMORY_ADDR_LEB64 = 14,
    R_WASM_MEMORY_ADDR_SLEB64 = 15,
    R_WASM_MEMORY_ADDR_I64 = 16,
    R_WASM_MEMORY_ADDR_REL_SLEB64 = 17,
    R_WASM_TABLE_INDEX_SLEB64 = 18,
    R_WASM_TABLE_INDEX_I64 = 19,
    R_WASM_TABLE_NUMBER_LEB = 20,
    R_WASM_MEMORY_ADDR_TLS_SLEB = 21,
    R_WASM_FUNCTION_OFFSET_I64 = 22,
    R_WASM_MEMORY_ADDR_LOCREL_I32 = 23,
    R_WASM_TABLE_INDEX_REL_SLEB64 = 24,
    R_WASM_MEMORY_ADDR_TLS_SLEB64 = 25,
    R_WASM_FUNCTION_INDEX_I32 = 26,
}

impl RelocKind {
    #[must_use]
    pub fn from_u32(value: u32) -> Option<Self> {
        use RelocKind as K;
        Some(match value {
            0 => K::R_WASM_FUNCTION_INDEX_LEB,
            1 => K::R_WASM_TABLE_INDEX_SLEB,
            2 => K::R_WASM_TABLE_INDEX_I32,
            3 => K::R_WASM_MEMORY_ADDR_LEB,
            4 => K::R_WASM_MEMORY_ADDR_SLEB,
            5 => K::R_WASM_MEMORY_ADDR_I32,
            6 => K::R_WASM_TYPE_INDEX_LEB,
            7 => K::R_WASM_GLOBAL_INDEX_LEB,
            8 => K::R_WASM_FUNCTION_OFFSET_I32,
            9 => K::R_WASM_SECTION_OFFSET_I32,
            10 => K::R_WASM_TAG_INDEX_LEB,
            11 => K::R_WASM_MEMORY_ADDR_REL_SLEB,
            12 => K::R_WASM_TABLE_INDEX_REL_SLEB,
            13 => K::R_WASM_GLOBAL_INDEX_I32,
            14 => K::R_WASM_MEMORY_ADDR_LEB64,
            15 => K::R_WASM_MEMORY_ADDR_SLEB64,
            16 => K::R_WASM_MEMORY_ADDR_I64,
            17 => K::R_WASM_MEMORY_ADDR_REL_SLEB64,
            18 => K::R_WASM_TABLE_INDEX_SLEB64,
            19 => K::R_WASM_TABLE_INDEX_I64,
            20 => K::R_WASM_TABLE_NUMBER_LEB,
            21 => K::R_WASM_MEMORY_ADDR_TLS_SLEB,
            22 => K::R_WASM_FUNCTION_OFFSET_I64,
            23 => K::R_WASM_MEMORY_ADDR_LOCREL_I32,
            24 => K::R_WASM_TABLE_INDEX_REL_SLEB64,
            25 => K::R_WASM_MEMORY_ADDR_TLS_SLEB64,
            26 => K::R_WASM_FUNCTION_INDEX_I32,
            _ => return None,
        })
    }

    /// Number of bytes the relocated field occupies in the section body.
    #[must_use]
    pub fn encoded_width(self) -> u64 {
        use RelocKind as K;
        match self {
            K::R_WASM_TABLE_INDEX_I32
            | K::R_WASM_MEMORY_ADDR_I32
            | K::R_WASM_FUNCTION_OFFSET_I32
            | K::R_WASM_SECTION_OFFSET_I32
            | K::R_WASM_GLOBAL_INDEX_I32
            | K::R_WASM_MEMORY_ADDR_LOCREL_I32
            | K::R_WASM_FUNCTION_INDEX_I32 => 4,
            K::R_WASM_MEMORY_ADDR_I64 | K::R_WASM_TABLE_INDEX_I64 => 8,
            K::R_WASM_MEMORY_ADDR_LEB64
            | K::R_WASM_MEMORY_ADDR_SLEB64
            | K::R_WASM_MEMORY_ADDR_REL_SLEB64
            | K::R_WASM_TABLE_INDEX_SLEB64
            | K::R_WASM_TABLE_INDEX_REL_SLEB64
            | K::R_WASM_MEMORY_ADDR_TLS_SLEB64 => 10,
            _ => 5,
        }
    }

    /// Memory-address, function-offset, and section-offset relocations
    /// carry an explicit addend.
    #[must_use]
    pub fn has_addend(self) -> bool {
        use RelocKind as K;
        matches!(
            self,
            K::R_WASM_MEMORY_ADDR_LEB
                | K::R_WASM_MEMORY_ADDR_SLEB
                | K::R_WASM_MEMORY_ADDR_I32
                | K::R_WASM_MEMORY_ADDR_REL_SLEB
                | K::R_WASM_FUNCTION_OFFSET_I32
                | K::R_WASM_SECTION_OFFSET_I32
                | K::R_WASM_MEMORY_ADDR_LEB64
                | K::R_WASM_MEMORY_ADDR_SLEB64
                | K::R_WASM_MEMORY_ADDR_I64
                | K::R_WASM_MEMORY_ADDR_REL_SLEB64
                | K::R_WASM_MEMORY_ADDR_TLS_SLEB
                | K::R_WASM_FUNCTION_OFFSET_I64
                | K::R_WASM_MEMORY_ADDR_LOCREL_I32
                | K::R_WASM_MEMORY_ADDR_TLS_SLEB64
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Reloc {
    pub kind: RelocKind,
    pub offset: u64,
    pub symbol_index: u32,
    pub addend: i64,
}

/// Decode the custom sections collected during the main section walk.
pub(super) fn load_custom_sections(module: &mut Module<'_>) -> Result<()> {
    let customs = std::mem::take(&mut module.custom_sections);
    // Symbols must exist before the reloc sections that reference them.
    for custom in &customs {
        match custom.name {
            "name" => load_name_section(module, custom.data)?,
            "linking" => load_linking_section(module, custom.data)?,
            _ => {}
        }
    }
    for custom in &customs {
        match custom.name {
            "reloc.CODE" => {
                let relocs = load_reloc_section(
                    module,
                    custom.data,
                    module.code_section_size as u64,
                )?;
                module.code_relocs = relocs;
            }
            "reloc.DATA" => {
                let relocs = load_reloc_section(
                    module,
                    custom.data,
                    module.data_section_size as u64,
                )?;
                module.data_relocs = relocs;
            }
            _ => {}
        }
    }
    module.custom_sections = customs;
    Ok(())
}

fn load_name_section<'a>(module: &mut Module<'a>, payload: &'a [u8]) -> Result<()> {
    let mut r = Reader::new(payload);

    while !r.is_empty() {
        let subsection_id = r.read_u8()?;
        let size = r.read_leb_u32()? as usize;
        let body = r.read_bytes(size)?;

        // Only the function-name subsection is consumed.
        if subsection_id != 1 {
            tracing::debug!("skipping name subsection {subsection_id}");
            continue;
        }

        let mut sr = Reader::new(body);
        let count = sr.read_leb_u32()?;
        let mut prev_idx: Option<u32> = None;
        for _ in 0..count {
            let func_idx = sr.read_leb_u32()?;
            if prev_idx.is_some_and(|prev| func_idx <= prev) {
                return Err(Error::load("out-of-order function index in name section"));
            }
            prev_idx = Some(func_idx);
            let name = sr.read_name()?;
            let import_count = module.import_funcs.len() as u32;
            if func_idx >= module.func_count() {
                return Err(Error::load("unknown function"));
            }
            // Import names come from the import section; only defined
            // functions get name-section names attached.
            if func_idx >= import_count {
                module.functions[(func_idx - import_count) as usize].name = Some(name);
            }
        }
    }
    Ok(())
}

fn load_linking_section<'a>(module: &mut Module<'a>, payload: &'a [u8]) -> Result<()> {
    let mut r = Reader::new(payload);
    let version = r.read_leb_u32()?;
    if version != LINKING_VERSION {
        return Err(Error::load("invalid linking metadata version"));
    }

    while !r.is_empty() {
        let subsection_id = r.read_u8()?;
        let size = r.read_leb_u32()? as usize;
        let body = r.read_bytes(size)?;
        match subsection_id {
            WASM_SYMBOL_TABLE => load_symbol_table(module, body)?,
            WASM_SEGMENT_INFO => load_segment_info(module, body)?,
            WASM_INIT_FUNCS | WASM_COMDAT_INFO => {
                tracing::debug!("skipping linking subsection {subsection_id}");
            }
            _ => tracing::debug!("skipping unknown linking subsection {subsection_id}"),
        }
    }
    Ok(())
}

fn load_symbol_table<'a>(module: &mut Module<'a>, body: &'a [u8]) -> Result<()> {
    let mut r = Reader::new(body);
    let count = r.read_leb_u32()?;
    let mut symbols = Vec::with_capacity(count as usize);

    for _ in 0..count {
        let kind_byte = r.read_u8()?;
        let kind = SymbolKind::from_byte(kind_byte)
            .ok_or_else(|| Error::load("invalid symbol type"))?;
        let flags = r.read_leb_u32()?;
        let is_defined = flags & WASM_SYM_UNDEFINED == 0;

        let mut symbol = Symbol {
            kind,
            flags,
            name: None,
            index: 0,
            seg_index: 0,
            data_offset: 0,
            data_size: 0,
        };

        match kind {
            SymbolKind::Function | SymbolKind::Global | SymbolKind::Table | SymbolKind::Tag => {
                let index = r.read_leb_u32()?;
                symbol.index = index;
                let (import_count, total) = match kind {
                    SymbolKind::Function => {
                        (module.import_funcs.len() as u32, module.func_count())
                    }
                    SymbolKind::Global => {
                        (module.import_globals.len() as u32, module.global_count())
                    }
                    SymbolKind::Table => {
                        (module.import_tables.len() as u32, module.table_count())
                    }
                    _ => (0, u32::MAX),
                };
                if kind != SymbolKind::Tag {
                    if index >= total {
                        return Err(Error::load("invalid symbol index"));
                    }
                    if !is_defined && index >= import_count {
                        return Err(Error::load("invalid symbol index"));
                    }
                }

                if is_defined || flags & WASM_SYM_EXPLICIT_NAME != 0 {
                    symbol.name = Some(r.read_name()?);
                } else {
                    // Undefined symbols inherit the import's field name.
                    symbol.name = match kind {
                        SymbolKind::Function => module
                            .import_funcs
                            .get(index as usize)
                            .map(|i| i.field_name),
                        SymbolKind::Global => module
                            .import_globals
                            .get(index as usize)
                            .map(|i| i.field_name),
                        _ => None,
                    };
                }

                if !is_defined
                    && flags & WASM_SYM_BINDING_WEAK != 0
                    && matches!(kind, SymbolKind::Global | SymbolKind::Table)
                {
                    return Err(Error::load("undefined weak global/table symbol"));
                }
            }
            SymbolKind::Data => {
                symbol.name = Some(r.read_name()?);
                if is_defined {
                    let seg_index = r.read_leb_u32()?;
                    let offset = r.read_leb_u64()?;
                    let size = r.read_leb_u64()?;
                    if flags & WASM_SYM_ABSOLUTE == 0 {
                        let Some(seg) = module.data_segs.get(seg_index as usize) else {
                            return Err(Error::load("unknown data segment"));
                        };
                        if offset > seg.data.len() as u64 {
                            return Err(Error::load("invalid data symbol offset"));
                        }
                    }
                    symbol.seg_index = seg_index;
                    symbol.data_offset = offset;
                    symbol.data_size = size;
                }
            }
            SymbolKind::Section => {
                if flags & WASM_SYM_BINDING_LOCAL == 0 {
                    return Err(Error::load("section symbols must have local binding"));
                }
                symbol.index = r.read_leb_u32()?;
            }
        }

        symbols.push(symbol);
    }

    module.symbols = symbols;
    Ok(())
}

fn load_segment_info<'a>(module: &mut Module<'a>, body: &'a [u8]) -> Result<()> {
    let mut r = Reader::new(body);
    let count = r.read_leb_u32()?;
    if count as usize != module.data_segs.len() {
        return Err(Error::load("segment info count mismatch"));
    }
    for i in 0..count as usize {
        let name = r.read_name()?;
        let alignment = r.read_leb_u32()?;
        let flags = r.read_leb_u32()?;
        let seg = &mut module.data_segs[i];
        seg.name = Some(name);
        seg.alignment = alignment;
        seg.flags = flags;
    }
    Ok(())
}

fn load_reloc_section(
    module: &Module<'_>,
    payload: &[u8],
    target_body_size: u64,
) -> Result<Vec<Reloc>> {
    let mut r = Reader::new(payload);
    let _target_section_index = r.read_leb_u32()?;
    let count = r.read_leb_u32()?;
    let mut relocs = Vec::with_capacity(count as usize);
    let mut prev_offset = 0u64;

    for _ in 0..count {
        let kind_raw = r.read_leb_u32()?;
        let kind = RelocKind::from_u32(kind_raw)
            .ok_or_else(|| Error::load("unknown relocation type"))?;
        let offset = u64::from(r.read_leb_u32()?);
        let symbol_index = r.read_leb_u32()?;
        let addend = if kind.has_addend() { r.read_leb_i64()? } else { 0 };

        if offset < prev_offset {
            return Err(Error::load("relocations not in offset order"));
        }
        prev_offset = offset;

        if offset + kind.encoded_width() > target_body_size {
            return Err(Error::load("invalid relocation offset"));
        }
        if symbol_index as usize >= module.symbols.len() {
            return Err(Error::load("invalid symbol index"));
        }

        relocs.push(Reloc { kind, offset, symbol_index, addend });
    }
    Ok(relocs)
}
