//! In-memory representation of a loaded module: fully resolved type,
//! function, memory, table, global, export, element, and data tables plus
//! the linking/reloc metadata consumed by the no-sandbox emitter.
//!
//! The module borrows the caller's byte buffer: names and data-segment
//! payloads are `&'a` slices. Function bodies are owned copies because the
//! validator rewrites opcodes in place.

pub mod linking;
pub mod loader;

use std::collections::BTreeMap;
use std::rc::Rc;

pub use linking::{Reloc, RelocKind, Symbol, SymbolKind};

pub const PAGE_SIZE: u32 = 65_536;
pub const MAX_PAGE_COUNT_32: u64 = 65_536;
pub const MAX_PAGE_COUNT_64: u64 = u32::MAX as u64;
pub const TABLE_MAX_SIZE: u32 = 1024;

/// Limits flag bits shared by tables and memories.
pub const LIMITS_FLAG_HAS_MAX: u32 = 0x01;
pub const LIMITS_FLAG_SHARED: u32 = 0x02;
pub const LIMITS_FLAG_INDEX64: u32 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValType {
    I32,
    I64,
    F32,
    F64,
    V128,
    /// Empty block result.
    Void,
    /// Validator-only: any type, produced by a polymorphic stack.
    Any,
}

impl ValType {
    /// Number of 32-bit operand-stack cells this type occupies.
    #[must_use]
    pub fn cell_num(self) -> u32 {
        match self {
            Self::I32 | Self::F32 | Self::Any => 1,
            Self::I64 | Self::F64 => 2,
            Self::V128 => 4,
            Self::Void => 0,
        }
    }

    #[must_use]
    pub fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x7f => Self::I32,
            0x7e => Self::I64,
            0x7d => Self::F32,
            0x7c => Self::F64,
            0x7b => Self::V128,
            0x40 => Self::Void,
            _ => return None,
        })
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::I32 => "i32",
            Self::I64 => "i64",
            Self::F32 => "f32",
            Self::F64 => "f64",
            Self::V128 => "v128",
            Self::Void => "void",
            Self::Any => "any",
        }
    }

    /// Signature-string character used by the native-symbol tables and the
    /// export-API registry: i32→i, i64→I, f32→f, f64→F.
    #[must_use]
    pub fn sig_char(self) -> char {
        match self {
            Self::I32 => 'i',
            Self::I64 => 'I',
            Self::F32 => 'f',
            Self::F64 => 'F',
            Self::V128 => 'v',
            Self::Void | Self::Any => '?',
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct FuncType {
    pub params: Box<[ValType]>,
    pub results: Box<[ValType]>,
    pub param_cell_num: u16,
    pub ret_cell_num: u16,
}

impl FuncType {
    pub(crate) fn new(params: Vec<ValType>, results: Vec<ValType>) -> Option<Self> {
        let param_cells: u32 = params.iter().map(|t| t.cell_num()).sum();
        let ret_cells: u32 = results.iter().map(|t| t.cell_num()).sum();
        Some(Self {
            params: params.into_boxed_slice(),
            results: results.into_boxed_slice(),
            param_cell_num: u16::try_from(param_cells).ok()?,
            ret_cell_num: u16::try_from(ret_cells).ok()?,
        })
    }

    /// `(params)results` signature string, e.g. `(ii)i`.
    #[must_use]
    pub fn signature(&self) -> String {
        let mut s = String::with_capacity(self.params.len() + self.results.len() + 2);
        s.push('(');
        for p in &self.params {
            s.push(p.sig_char());
        }
        s.push(')');
        for r in &self.results {
            s.push(r.sig_char());
        }
        s
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub flags: u32,
    pub initial: u64,
    pub max: Option<u64>,
}

impl Limits {
    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags & LIMITS_FLAG_SHARED != 0
    }

    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.flags & LIMITS_FLAG_INDEX64 != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Memory {
    pub flags: u32,
    pub init_page_count: u64,
    pub max_page_count: u64,
    pub num_bytes_per_page: u32,
}

impl Memory {
    #[must_use]
    pub fn is_memory64(&self) -> bool {
        self.flags & LIMITS_FLAG_INDEX64 != 0
    }

    #[must_use]
    pub fn is_shared(&self) -> bool {
        self.flags & LIMITS_FLAG_SHARED != 0
    }

    /// Initial linear-memory size in bytes.
    #[must_use]
    pub fn data_size(&self) -> u64 {
        self.init_page_count * u64::from(self.num_bytes_per_page)
    }

    /// Fixed-size memories never grow; their bound-check globals may be
    /// emitted as constants.
    #[must_use]
    pub fn is_fixed_size(&self) -> bool {
        self.init_page_count == self.max_page_count
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub elem_type: u8,
    pub flags: u32,
    pub init_size: u32,
    pub max_size: u32,
}

/// A constant initializer expression, already evaluated to its single
/// producing instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InitExpr {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    V128([u8; 16]),
    /// `global.get` of an imported global.
    GlobalGet(u32),
    /// `ref.func` of an in-range function.
    FuncRef(u32),
    RefNullFunc,
}

impl InitExpr {
    #[must_use]
    pub fn value_type(&self) -> Option<ValType> {
        Some(match self {
            Self::I32(_) => ValType::I32,
            Self::I64(_) => ValType::I64,
            Self::F32(_) => ValType::F32,
            Self::F64(_) => ValType::F64,
            Self::V128(_) => ValType::V128,
            Self::GlobalGet(_) | Self::FuncRef(_) | Self::RefNullFunc => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExternKind {
    Func,
    Table,
    Memory,
    Global,
}

pub struct ImportFunc<'a> {
    pub module_name: &'a str,
    pub field_name: &'a str,
    pub type_idx: u32,
    pub func_type: Rc<FuncType>,
}

pub struct ImportGlobal<'a> {
    pub module_name: &'a str,
    pub field_name: &'a str,
    pub ty: ValType,
    pub mutable: bool,
    /// Present when the import matched a built-in linkable global.
    pub linked_value: Option<InitExpr>,
}

pub struct Function<'a> {
    pub type_idx: u32,
    pub func_type: Rc<FuncType>,
    pub local_types: Vec<ValType>,
    pub local_cell_num: u32,
    /// Owned copy of the body (past the local declarations); the validator
    /// rewrites opcodes in place.
    pub code: Vec<u8>,
    /// File offset of `code[0]`, for reloc.CODE resolution.
    pub code_file_offset: usize,
    pub name: Option<&'a str>,
    /// Filled by the validator.
    pub max_stack_cell_num: u16,
    pub max_block_num: u16,
    /// Depth vectors of rewritten `br_table` opcodes, keyed by the opcode's
    /// offset within `code`.
    pub br_table_cache: BTreeMap<usize, Vec<u32>>,
}

pub struct Global {
    pub ty: ValType,
    pub mutable: bool,
    pub init: InitExpr,
}

pub struct Export<'a> {
    pub name: &'a str,
    pub kind: ExternKind,
    pub index: u32,
}

pub struct ElementSeg {
    pub table_index: u32,
    pub base_offset: InitExpr,
    pub func_indices: Vec<u32>,
}

pub struct DataSeg<'a> {
    pub is_passive: bool,
    pub memory_index: u32,
    pub base_offset: Option<InitExpr>,
    pub data: &'a [u8],
    /// Offset of `data[0]` within the data section body, for reloc.DATA
    /// resolution.
    pub section_offset: usize,
    /// Attached by the linking section's segment-info subsection.
    pub name: Option<&'a str>,
    pub alignment: u32,
    pub flags: u32,
}

pub struct CustomSection<'a> {
    pub name: &'a str,
    pub data: &'a [u8],
}

/// Auxiliary data resolved from well-known exports: the Clang/Emscripten
/// shadow-stack global and the heap/data boundary markers.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuxData {
    pub heap_base: Option<u64>,
    pub data_end: Option<u64>,
    pub stack_top: Option<u64>,
    pub stack_size: u32,
    pub stack_global_idx: Option<u32>,
}

#[derive(Default)]
pub struct Module<'a> {
    pub types: Vec<Rc<FuncType>>,

    pub import_funcs: Vec<ImportFunc<'a>>,
    pub import_tables: Vec<Table>,
    pub import_memories: Vec<Memory>,
    pub import_globals: Vec<ImportGlobal<'a>>,

    pub functions: Vec<Function<'a>>,
    pub tables: Vec<Table>,
    pub memories: Vec<Memory>,
    pub globals: Vec<Global>,
    pub exports: Vec<Export<'a>>,
    pub element_segs: Vec<ElementSeg>,
    pub data_segs: Vec<DataSeg<'a>>,
    pub data_count: Option<u32>,
    pub start_func: Option<u32>,

    pub symbols: Vec<Symbol<'a>>,
    pub code_relocs: Vec<Reloc>,
    pub data_relocs: Vec<Reloc>,
    pub custom_sections: Vec<CustomSection<'a>>,

    pub aux: AuxData,

    /// File offset of the code section body (reloc.CODE offsets are
    /// relative to it).
    pub code_section_offset: usize,
    pub code_section_size: usize,
    pub data_section_offset: usize,
    pub data_section_size: usize,
}

impl<'a> Module<'a> {
    #[must_use]
    pub fn func_count(&self) -> u32 {
        self.import_funcs.len() as u32 + self.functions.len() as u32
    }

    #[must_use]
    pub fn global_count(&self) -> u32 {
        self.import_globals.len() as u32 + self.globals.len() as u32
    }

    #[must_use]
    pub fn table_count(&self) -> u32 {
        self.import_tables.len() as u32 + self.tables.len() as u32
    }

    #[must_use]
    pub fn memory_count(&self) -> u32 {
        self.import_memories.len() as u32 + self.memories.len() as u32
    }

    /// The module's single memory, imported or defined.
    #[must_use]
    pub fn memory(&self) -> Option<&Memory> {
        self.import_memories.first().or_else(|| self.memories.first())
    }

    /// The module's single table, imported or defined.
    #[must_use]
    pub fn table(&self) -> Option<&Table> {
        self.import_tables.first().or_else(|| self.tables.first())
    }

    #[must_use]
    pub fn is_memory64(&self) -> bool {
        self.memory().is_some_and(Memory::is_memory64)
    }

    /// Function type for any function index (imports first).
    #[must_use]
    pub fn func_type(&self, func_idx: u32) -> Option<&Rc<FuncType>> {
        let idx = func_idx as usize;
        if idx < self.import_funcs.len() {
            Some(&self.import_funcs[idx].func_type)
        } else {
            self.functions
                .get(idx - self.import_funcs.len())
                .map(|f| &f.func_type)
        }
    }

    /// Declared type index for any function index.
    #[must_use]
    pub fn func_type_idx(&self, func_idx: u32) -> Option<u32> {
        let idx = func_idx as usize;
        if idx < self.import_funcs.len() {
            Some(self.import_funcs[idx].type_idx)
        } else {
            self.functions
                .get(idx - self.import_funcs.len())
                .map(|f| f.type_idx)
        }
    }

    /// Global type and mutability for any global index (imports first).
    #[must_use]
    pub fn global_type(&self, global_idx: u32) -> Option<(ValType, bool)> {
        let idx = global_idx as usize;
        if idx < self.import_globals.len() {
            let g = &self.import_globals[idx];
            Some((g.ty, g.mutable))
        } else {
            self.globals
                .get(idx - self.import_globals.len())
                .map(|g| (g.ty, g.mutable))
        }
    }

    #[must_use]
    pub fn export_by_name(&self, name: &str) -> Option<&Export<'a>> {
        self.exports.iter().find(|e| e.name == name)
    }
}
