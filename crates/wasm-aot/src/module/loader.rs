//! Per-section decoders producing the typed [`Module`].

use std::rc::Rc;

use crate::reader::Reader;
use crate::sections::{self, Section};
use crate::validator;
use crate::{Error, Result};

use super::{
    AuxData, CustomSection, DataSeg, ElementSeg, Export, ExternKind, FuncType, Function, Global,
    ImportFunc, ImportGlobal, InitExpr, Limits, Memory, Module, Table, ValType,
    LIMITS_FLAG_HAS_MAX, LIMITS_FLAG_INDEX64, LIMITS_FLAG_SHARED, MAX_PAGE_COUNT_32,
    MAX_PAGE_COUNT_64, PAGE_SIZE, TABLE_MAX_SIZE,
};

const FUNC_REF_TYPE: u8 = 0x70;

/// Built-in linkable import globals: `(module, field, type, mutable, value)`.
const LINKABLE_GLOBALS: &[(&str, &str, ValType, bool, InitExpr)] = &[
    ("global", "Math.PI", ValType::F64, false, InitExpr::F64(std::f64::consts::PI)),
    ("spectest", "global_f32", ValType::F32, false, InitExpr::F32(666.6)),
    ("spectest", "global_f64", ValType::F64, false, InitExpr::F64(666.6)),
    ("spectest", "global_i32", ValType::I32, false, InitExpr::I32(666)),
    ("spectest", "global_i64", ValType::I64, false, InitExpr::I64(666)),
    ("test", "global-f32", ValType::F32, false, InitExpr::F32(0.0)),
    ("test", "global-i32", ValType::I32, false, InitExpr::I32(0)),
    ("test", "global-mut-i32", ValType::I32, true, InitExpr::I32(0)),
    ("test", "global-mut-i64", ValType::I64, true, InitExpr::I64(0)),
];

/// Parse and validate a binary module. The returned module borrows `buf`
/// for names and data-segment payloads; callers keep the buffer alive for
/// the module's lifetime.
pub fn parse(buf: &[u8]) -> Result<Module<'_>> {
    let sections = sections::split_sections(buf)?;
    let mut module = Module::default();
    let mut declared_func_count = 0u32;

    for section in &sections {
        match section.id {
            sections::SECTION_TYPE => load_type_section(&mut module, section)?,
            sections::SECTION_IMPORT => load_import_section(&mut module, section)?,
            sections::SECTION_FUNCTION => {
                declared_func_count = load_function_section(&mut module, section)?;
            }
            sections::SECTION_TABLE => load_table_section(&mut module, section)?,
            sections::SECTION_MEMORY => load_memory_section(&mut module, section)?,
            sections::SECTION_GLOBAL => load_global_section(&mut module, section)?,
            sections::SECTION_EXPORT => load_export_section(&mut module, section)?,
            sections::SECTION_START => load_start_section(&mut module, section)?,
            sections::SECTION_ELEMENT => load_element_section(&mut module, section)?,
            sections::SECTION_DATACOUNT => {
                let mut r = Reader::new(section.payload);
                module.data_count = Some(r.read_leb_u32()?);
            }
            sections::SECTION_CODE => load_code_section(&mut module, section, declared_func_count)?,
            sections::SECTION_DATA => load_data_section(&mut module, section)?,
            sections::SECTION_CUSTOM => {
                let mut r = Reader::new(section.payload);
                let name = r.read_name()?;
                module.custom_sections.push(CustomSection {
                    name,
                    data: &section.payload[r.pos()..],
                });
            }
            _ => return Err(Error::load("invalid section id")),
        }
    }

    if declared_func_count as usize != module.functions.len()
        || module.functions.iter().any(|f| f.code.is_empty())
    {
        return Err(Error::load("function and code section have inconsistent lengths"));
    }

    if let Some(count) = module.data_count {
        if count as usize != module.data_segs.len() {
            return Err(Error::load("data count and data section have inconsistent lengths"));
        }
    }

    check_start_function(&module)?;
    resolve_aux_data(&mut module);

    // Custom sections are decoded after the core sections: the name section
    // refers to functions, linking to data segments, relocs to symbols.
    super::linking::load_custom_sections(&mut module)?;

    validator::validate_module(&mut module)?;

    Ok(module)
}

fn load_type_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let type_count = r.read_leb_u32()?;

    for _ in 0..type_count {
        let form = r.read_u8()?;
        if form != 0x60 {
            return Err(Error::load("invalid type form"));
        }
        let param_count = r.read_leb_u32()?;
        if param_count > u32::from(u16::MAX) {
            return Err(Error::load("param count too large"));
        }
        let mut params = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            params.push(read_value_type(&mut r)?);
        }
        let result_count = r.read_leb_u32()?;
        if result_count > u32::from(u16::MAX) {
            return Err(Error::load("result count too large"));
        }
        let mut results = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            results.push(read_value_type(&mut r)?);
        }

        let func_type = FuncType::new(params, results)
            .ok_or_else(|| Error::load("param or result cell count too large"))?;

        // Structurally identical types share storage; the declared index
        // aliases the earlier entry.
        if let Some(existing) = module.types.iter().find(|t| ***t == func_type) {
            if Rc::strong_count(existing) >= usize::from(u16::MAX) {
                return Err(Error::load("wasm type ref count too large"));
            }
            let shared = Rc::clone(existing);
            module.types.push(shared);
        } else {
            module.types.push(Rc::new(func_type));
        }
    }

    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_import_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    // Pass 1: tally counts per kind so the single-table/single-memory rule
    // can be enforced before materializing anything.
    let mut r = Reader::new(section.payload);
    let import_count = r.read_leb_u32()?;
    let (mut table_count, mut memory_count) = (0u32, 0u32);

    for _ in 0..import_count {
        let _module_name = r.read_name()?;
        let _field_name = r.read_name()?;
        match r.read_u8()? {
            0 => {
                r.read_leb_u32()?;
            }
            1 => {
                table_count += 1;
                if table_count > 1 {
                    return Err(Error::load("multiple tables"));
                }
                r.read_u8()?;
                skip_limits(&mut r)?;
            }
            2 => {
                memory_count += 1;
                if memory_count > 1 {
                    return Err(Error::load("multiple memories"));
                }
                skip_limits(&mut r)?;
            }
            3 => {
                r.read_u8()?;
                r.read_u8()?;
            }
            _ => return Err(Error::load("invalid import kind")),
        }
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }

    // Pass 2: materialize.
    let mut r = Reader::new(section.payload);
    let import_count = r.read_leb_u32()?;

    for _ in 0..import_count {
        let module_name = r.read_name()?;
        let field_name = r.read_name()?;
        match r.read_u8()? {
            0 => {
                let declared_idx = r.read_leb_u32()?;
                let type_idx = resolve_type_index(module, declared_idx)?;
                let func_type = Rc::clone(&module.types[type_idx as usize]);
                module.import_funcs.push(ImportFunc {
                    module_name,
                    field_name,
                    type_idx,
                    func_type,
                });
            }
            1 => {
                let table = read_table_type(&mut r)?;
                module.import_tables.push(table);
            }
            2 => {
                let memory = read_memory_type(&mut r)?;
                module.import_memories.push(memory);
            }
            3 => {
                let ty = read_value_type(&mut r)?;
                let mutable = read_mutability(&mut r)?;
                let linked_value = LINKABLE_GLOBALS
                    .iter()
                    .find(|(m, f, t, m2, _)| {
                        *m == module_name && *f == field_name && *t == ty && *m2 == mutable
                    })
                    .map(|(_, _, _, _, v)| *v);
                if linked_value.is_none() {
                    tracing::warn!(
                        "failed to link import global ({module_name}, {field_name})"
                    );
                }
                module.import_globals.push(ImportGlobal {
                    module_name,
                    field_name,
                    ty,
                    mutable,
                    linked_value,
                });
            }
            _ => return Err(Error::load("invalid import kind")),
        }
    }
    Ok(())
}

fn load_function_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<u32> {
    let mut r = Reader::new(section.payload);
    let func_count = r.read_leb_u32()?;

    for _ in 0..func_count {
        let declared_idx = r.read_leb_u32()?;
        let type_idx = resolve_type_index(module, declared_idx)?;
        let func_type = Rc::clone(&module.types[type_idx as usize]);
        module.functions.push(Function {
            type_idx,
            func_type,
            local_types: Vec::new(),
            local_cell_num: 0,
            code: Vec::new(),
            code_file_offset: 0,
            name: None,
            max_stack_cell_num: 0,
            max_block_num: 0,
            br_table_cache: std::collections::BTreeMap::new(),
        });
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(func_count)
}

fn load_table_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let table_count = r.read_leb_u32()?;
    if table_count + module.table_count() > 1 {
        return Err(Error::load("multiple tables"));
    }
    for _ in 0..table_count {
        let table = read_table_type(&mut r)?;
        module.tables.push(table);
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_memory_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let memory_count = r.read_leb_u32()?;
    if memory_count + module.memory_count() > 1 {
        return Err(Error::load("multiple memories"));
    }
    for _ in 0..memory_count {
        let memory = read_memory_type(&mut r)?;
        module.memories.push(memory);
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_global_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let global_count = r.read_leb_u32()?;

    for _ in 0..global_count {
        let ty = read_value_type(&mut r)?;
        let mutable = read_mutability(&mut r)?;
        let init = read_init_expr(module, &mut r, ty)?;
        module.globals.push(Global { ty, mutable, init });
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_export_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let export_count = r.read_leb_u32()?;

    for _ in 0..export_count {
        let name = r.read_name()?;
        if module.exports.iter().any(|e| e.name == name) {
            return Err(Error::load("duplicate export name"));
        }
        let kind_byte = r.read_u8()?;
        let index = r.read_leb_u32()?;
        let kind = match kind_byte {
            0 => {
                if index >= module.func_count() {
                    return Err(Error::load("unknown function"));
                }
                ExternKind::Func
            }
            1 => {
                if index >= module.table_count() {
                    return Err(Error::load("unknown table"));
                }
                ExternKind::Table
            }
            2 => {
                if index >= module.memory_count() {
                    return Err(Error::load("unknown memory"));
                }
                ExternKind::Memory
            }
            3 => {
                if index >= module.global_count() {
                    return Err(Error::load("unknown global"));
                }
                ExternKind::Global
            }
            _ => return Err(Error::load("invalid export kind")),
        };
        module.exports.push(Export { name, kind, index });
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_start_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let func_idx = r.read_leb_u32()?;
    if func_idx >= module.func_count() {
        return Err(Error::load("unknown function"));
    }
    module.start_func = Some(func_idx);
    Ok(())
}

fn check_start_function(module: &Module<'_>) -> Result<()> {
    if let Some(func_idx) = module.start_func {
        let Some(func_type) = module.func_type(func_idx) else {
            return Err(Error::load("unknown function"));
        };
        if !func_type.params.is_empty() || !func_type.results.is_empty() {
            return Err(Error::load("invalid start function"));
        }
    }
    Ok(())
}

fn load_element_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let seg_count = r.read_leb_u32()?;

    for _ in 0..seg_count {
        let table_index = r.read_leb_u32()?;
        if table_index != 0 || module.table_count() == 0 {
            return Err(Error::load("unknown table"));
        }
        let table = *module.table().ok_or_else(|| Error::load("unknown table"))?;
        let offset_type = if table.flags & LIMITS_FLAG_INDEX64 != 0 {
            ValType::I64
        } else {
            ValType::I32
        };
        let base_offset = read_init_expr(module, &mut r, offset_type)?;

        let count = r.read_leb_u32()?;
        let mut func_indices = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let func_idx = r.read_leb_u32()?;
            if func_idx >= module.func_count() {
                return Err(Error::load("unknown function"));
            }
            func_indices.push(func_idx);
        }

        // Constant base offsets are checked against the table's initial
        // size at load time; imported-global offsets are checked by the
        // instance constructor.
        if let InitExpr::I32(base) = base_offset {
            let end = i64::from(base) + func_indices.len() as i64;
            if base < 0 || end > i64::from(table.init_size) {
                return Err(Error::load("out of bounds table access from element segment"));
            }
        }

        module.element_segs.push(ElementSeg { table_index, base_offset, func_indices });
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_code_section<'a>(
    module: &mut Module<'a>,
    section: &Section<'a>,
    declared_func_count: u32,
) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let body_count = r.read_leb_u32()?;
    if body_count != declared_func_count {
        return Err(Error::load("function and code section have inconsistent lengths"));
    }

    module.code_section_offset = section.file_offset;
    module.code_section_size = section.payload.len();

    for i in 0..body_count as usize {
        let body_size = r.read_leb_u32()? as usize;
        let body_start = r.pos();
        let body = r.read_bytes(body_size)?;
        let mut br = Reader::new(body);

        // Pre-scan local groups: total count must not wrap a u32.
        let group_count = br.read_leb_u32()?;
        let func = &mut module.functions[i];
        let param_count = func.func_type.params.len() as u32;
        let mut local_count = 0u32;
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            let count = br.read_leb_u32()?;
            let ty = read_value_type(&mut br)?;
            local_count = local_count
                .checked_add(count)
                .and_then(|c| c.checked_add(param_count).map(|_| c))
                .ok_or_else(|| Error::load("invalid local count"))?;
            groups.push((count, ty));
        }

        let mut local_types = Vec::with_capacity(local_count as usize);
        let mut local_cell_num = 0u32;
        for (count, ty) in groups {
            for _ in 0..count {
                local_types.push(ty);
            }
            local_cell_num = local_cell_num.saturating_add(count.saturating_mul(ty.cell_num()));
        }

        let code_start = br.pos();
        if code_start >= body.len() {
            return Err(Error::load("unexpected end of section or function"));
        }
        func.local_types = local_types;
        func.local_cell_num = local_cell_num;
        func.code = body[code_start..].to_vec();
        func.code_file_offset = body_start + code_start + section.file_offset;
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

fn load_data_section<'a>(module: &mut Module<'a>, section: &Section<'a>) -> Result<()> {
    let mut r = Reader::new(section.payload);
    let seg_count = r.read_leb_u32()?;

    module.data_section_offset = section.file_offset;
    module.data_section_size = section.payload.len();

    let is_memory64 = module.is_memory64();
    let offset_type = if is_memory64 { ValType::I64 } else { ValType::I32 };

    for _ in 0..seg_count {
        let tag = r.read_leb_u32()?;
        let (is_passive, memory_index, base_offset) = match tag {
            0 => (false, 0, Some(read_init_expr(module, &mut r, offset_type)?)),
            1 => (true, 0, None),
            2 => {
                let memory_index = r.read_leb_u32()?;
                if memory_index >= module.memory_count() {
                    return Err(Error::load("unknown memory"));
                }
                (false, memory_index, Some(read_init_expr(module, &mut r, offset_type)?))
            }
            _ => return Err(Error::load("invalid data segment flags")),
        };

        let len = r.read_leb_u32()? as usize;
        let section_offset = r.pos();
        let data = r.read_bytes(len)?;

        if !is_passive {
            let memory = module.memory().ok_or_else(|| Error::load("unknown memory"))?;
            let base = match base_offset {
                Some(InitExpr::I32(v)) => Some(i64::from(v) as u64),
                Some(InitExpr::I64(v)) => Some(v as u64),
                _ => None,
            };
            if let Some(base) = base {
                let end = base.checked_add(len as u64);
                if end.is_none() || end.unwrap_or(u64::MAX) > memory.data_size() {
                    return Err(Error::load("out of bounds memory access from data segment"));
                }
            }
        }

        module.data_segs.push(DataSeg {
            is_passive,
            memory_index,
            base_offset,
            data,
            section_offset,
            name: None,
            alignment: 0,
            flags: 0,
        });
    }
    if !r.is_empty() {
        return Err(Error::load("section size mismatch"));
    }
    Ok(())
}

// ── shared decode helpers ──

fn read_value_type(r: &mut Reader<'_>) -> Result<ValType> {
    let byte = r.read_u8()?;
    match ValType::from_byte(byte) {
        Some(ValType::Void) | None => Err(Error::load("unknown type")),
        Some(ty) => Ok(ty),
    }
}

fn read_mutability(r: &mut Reader<'_>) -> Result<bool> {
    match r.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::load("invalid mutability")),
    }
}

fn resolve_type_index(module: &Module<'_>, declared_idx: u32) -> Result<u32> {
    if declared_idx as usize >= module.types.len() {
        return Err(Error::load("unknown type"));
    }
    // Deduplicated types alias the smallest-index equivalent entry.
    let target = &module.types[declared_idx as usize];
    for (i, ty) in module.types.iter().enumerate() {
        if Rc::ptr_eq(ty, target) {
            return Ok(i as u32);
        }
    }
    Ok(declared_idx)
}

fn read_limits(r: &mut Reader<'_>, max_flag_bits: u32) -> Result<Limits> {
    let flags = r.read_leb_u32()?;
    if flags & !max_flag_bits != 0 {
        return Err(Error::load("invalid limits flags"));
    }
    let is_64 = flags & LIMITS_FLAG_INDEX64 != 0;
    let initial = if is_64 { r.read_leb_u64()? } else { u64::from(r.read_leb_u32()?) };
    let max = if flags & LIMITS_FLAG_HAS_MAX != 0 {
        Some(if is_64 { r.read_leb_u64()? } else { u64::from(r.read_leb_u32()?) })
    } else {
        None
    };
    Ok(Limits { flags, initial, max })
}

fn skip_limits(r: &mut Reader<'_>) -> Result<()> {
    read_limits(r, LIMITS_FLAG_HAS_MAX | LIMITS_FLAG_SHARED | LIMITS_FLAG_INDEX64).map(|_| ())
}

fn read_table_type(r: &mut Reader<'_>) -> Result<Table> {
    let elem_type = r.read_u8()?;
    if elem_type != FUNC_REF_TYPE {
        return Err(Error::load("unsupported table elem type"));
    }
    let limits = read_limits(r, LIMITS_FLAG_HAS_MAX | LIMITS_FLAG_SHARED | LIMITS_FLAG_INDEX64)?;
    if limits.is_shared() {
        return Err(Error::load("tables cannot be shared"));
    }
    let init_size =
        u32::try_from(limits.initial).map_err(|_| Error::load("integer too large"))?;
    let max_size = match limits.max {
        Some(max) => {
            let max = u32::try_from(max).map_err(|_| Error::load("integer too large"))?;
            if max < init_size {
                return Err(Error::load("size minimum must not be greater than maximum"));
            }
            max
        }
        None => init_size.saturating_mul(2).max(TABLE_MAX_SIZE),
    };
    Ok(Table { elem_type, flags: limits.flags, init_size, max_size })
}

fn read_memory_type(r: &mut Reader<'_>) -> Result<Memory> {
    let limits = read_limits(r, LIMITS_FLAG_HAS_MAX | LIMITS_FLAG_SHARED | LIMITS_FLAG_INDEX64)?;
    if limits.is_shared() && limits.max.is_none() {
        return Err(Error::load("shared memory must have maximum"));
    }
    let page_ceiling = if limits.is_64bit() { MAX_PAGE_COUNT_64 } else { MAX_PAGE_COUNT_32 };
    if limits.initial > page_ceiling {
        return Err(Error::load("memory size must be at most 65536 pages"));
    }
    let max_page_count = match limits.max {
        Some(max) => {
            if max < limits.initial {
                return Err(Error::load("size minimum must not be greater than maximum"));
            }
            if max > page_ceiling {
                return Err(Error::load("memory size must be at most 65536 pages"));
            }
            max
        }
        None => page_ceiling,
    };
    Ok(Memory {
        flags: limits.flags,
        init_page_count: limits.initial,
        max_page_count,
        num_bytes_per_page: PAGE_SIZE,
    })
}

/// Decode a constant initializer expression and check it against the
/// expected type.
fn read_init_expr(module: &Module<'_>, r: &mut Reader<'_>, expected: ValType) -> Result<InitExpr> {
    use crate::opcode as op;

    let opcode = r.read_u8()?;
    let expr = match opcode {
        op::I32_CONST => InitExpr::I32(r.read_leb_i32()?),
        op::I64_CONST => InitExpr::I64(r.read_leb_i64()?),
        op::F32_CONST => InitExpr::F32(r.read_f32()?),
        op::F64_CONST => InitExpr::F64(r.read_f64()?),
        op::PREFIX_SIMD => {
            if r.read_leb_u32()? != op::SIMD_V128_CONST {
                return Err(Error::load("type mismatch"));
            }
            InitExpr::V128(r.read_v128()?)
        }
        op::GLOBAL_GET => {
            let global_idx = r.read_leb_u32()?;
            // Initializers may only reference imported globals.
            let Some(import) = module.import_globals.get(global_idx as usize) else {
                return Err(Error::load("unknown global"));
            };
            if import.ty != expected {
                return Err(Error::load("type mismatch"));
            }
            InitExpr::GlobalGet(global_idx)
        }
        0xd0 => {
            if r.read_u8()? != FUNC_REF_TYPE {
                return Err(Error::load("unknown type"));
            }
            InitExpr::RefNullFunc
        }
        0xd2 => {
            let func_idx = r.read_leb_u32()?;
            if func_idx >= module.func_count() {
                return Err(Error::load("unknown function"));
            }
            InitExpr::FuncRef(func_idx)
        }
        _ => return Err(Error::load("type mismatch")),
    };

    if r.read_u8()? != op::END {
        return Err(Error::load("END opcode expected"));
    }

    if let Some(ty) = expr.value_type() {
        if ty != expected {
            return Err(Error::load("type mismatch"));
        }
    }
    Ok(expr)
}

/// Resolve `__heap_base` / `__data_end` and detect the Clang auxiliary
/// stack-pointer global: the sole mutable i32 global whose initial value
/// is at most `__heap_base`.
fn resolve_aux_data(module: &mut Module<'_>) {
    let mut aux = AuxData::default();

    for export in &module.exports {
        if export.kind != ExternKind::Global {
            continue;
        }
        let local_idx = export.index as usize;
        let Some(global) = local_idx
            .checked_sub(module.import_globals.len())
            .and_then(|i| module.globals.get(i))
        else {
            continue;
        };
        if global.mutable || global.ty != ValType::I32 {
            continue;
        }
        if let InitExpr::I32(value) = global.init {
            match export.name {
                "__heap_base" => aux.heap_base = Some(i64::from(value) as u64),
                "__data_end" => aux.data_end = Some(i64::from(value) as u64),
                _ => {}
            }
        }
    }

    if let (Some(heap_base), Some(data_end)) = (aux.heap_base, aux.data_end) {
        let mut candidate: Option<(u32, u64)> = None;
        let mut mutable_i32_count = 0u32;
        for (i, global) in module.globals.iter().enumerate() {
            if !global.mutable || global.ty != ValType::I32 {
                continue;
            }
            mutable_i32_count += 1;
            if let InitExpr::I32(value) = global.init {
                let value = i64::from(value) as u64;
                if value <= heap_base {
                    candidate = Some((module.import_globals.len() as u32 + i as u32, value));
                }
            }
        }
        if mutable_i32_count == 1 {
            if let Some((idx, top)) = candidate {
                aux.stack_global_idx = Some(idx);
                aux.stack_top = Some(top);
                aux.stack_size = top.saturating_sub(data_end) as u32;
                tracing::debug!(
                    "aux stack: global {idx}, top {top:#x}, size {}",
                    aux.stack_size
                );
            }
        }
    }

    module.aux = aux;
}
