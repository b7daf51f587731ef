//! Module-level runtime emission: the `.wasm_globals` global set, the
//! instance constructor/destructor, the host accessor functions, and the
//! export-API table.

use inkwell::module::Linkage;
use inkwell::types::BasicTypeEnum;
use inkwell::values::{
    BasicValue, BasicValueEnum, FunctionValue, GlobalValue, IntValue, PointerValue,
};
use inkwell::IntPredicate;

use crate::module::{ExternKind, InitExpr, ValType};
use crate::trap::{ExceptionId, EXCEPTION_ID_MIN, EXCEPTION_MSGS};
use crate::{Error, Result};

use super::context::CompContext;

const WASM_GLOBALS_SECTION: &str = ".wasm_globals";
const CTOR_PRIORITY: u64 = 65_535;

fn add_wasm_global<'ctx>(
    cc: &CompContext<'ctx, '_>,
    name: &str,
    ty: BasicTypeEnum<'ctx>,
    init: &dyn BasicValue<'ctx>,
    is_const: bool,
) -> GlobalValue<'ctx> {
    let global = cc.module.add_global(ty, None, name);
    global.set_section(Some(WASM_GLOBALS_SECTION));
    global.set_linkage(Linkage::Internal);
    global.set_constant(is_const);
    global.set_initializer(init);
    global
}

fn add_string_constant<'ctx>(
    cc: &CompContext<'ctx, '_>,
    name: &str,
    text: &str,
) -> GlobalValue<'ctx> {
    let array = cc.context.const_string(text.as_bytes(), true);
    let global = cc.module.add_global(array.get_type(), None, name);
    global.set_linkage(Linkage::Internal);
    global.set_constant(true);
    global.set_initializer(&array);
    global
}

/// Evaluate a constant initializer to a plain LLVM constant, resolving
/// `global.get` through the built-in linked import globals.
fn const_init_value<'ctx>(
    cc: &CompContext<'ctx, '_>,
    init: &InitExpr,
    ty: ValType,
) -> Result<BasicValueEnum<'ctx>> {
    Ok(match *init {
        InitExpr::I32(v) => cc.i32t().const_int(v as u32 as u64, false).into(),
        InitExpr::I64(v) => cc.i64t().const_int(v as u64, false).into(),
        InitExpr::F32(v) => cc.f32t().const_float(f64::from(v)).into(),
        InitExpr::F64(v) => cc.f64t().const_float(v).into(),
        InitExpr::V128(bytes) => {
            let lo = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
            let hi = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
            inkwell::types::VectorType::const_vector(&[
                cc.i64t().const_int(lo, false),
                cc.i64t().const_int(hi, false),
            ])
            .into()
        }
        InitExpr::GlobalGet(idx) => {
            let import = cc
                .wasm
                .import_globals
                .get(idx as usize)
                .ok_or_else(|| Error::Internal("unknown import global".into()))?;
            match import.linked_value {
                Some(linked) => const_init_value(cc, &linked, ty)?,
                None => {
                    tracing::warn!(
                        "initializer references unlinked import global ({}, {}), using zero",
                        import.module_name,
                        import.field_name
                    );
                    zero_const(cc, ty)
                }
            }
        }
        InitExpr::FuncRef(idx) => cc.i32t().const_int(u64::from(idx), false).into(),
        InitExpr::RefNullFunc => cc.i32t().const_all_ones().into(),
    })
}

fn zero_const<'ctx>(cc: &CompContext<'ctx, '_>, ty: ValType) -> BasicValueEnum<'ctx> {
    match ty {
        ValType::I32 => cc.i32t().const_zero().into(),
        ValType::I64 => cc.i64t().const_zero().into(),
        ValType::F32 => cc.f32t().const_zero().into(),
        ValType::F64 => cc.f64t().const_zero().into(),
        _ => cc.v128t().const_zero().into(),
    }
}

/// Constant base offset of an active segment, when it can be known at
/// compile time.
fn const_base_offset(cc: &CompContext<'_, '_>, init: &InitExpr) -> Option<u64> {
    match *init {
        InitExpr::I32(v) => Some(i64::from(v) as u64 & 0xffff_ffff),
        InitExpr::I64(v) => Some(v as u64),
        InitExpr::GlobalGet(idx) => {
            let linked = cc.wasm.import_globals.get(idx as usize)?.linked_value?;
            const_base_offset(cc, &linked)
        }
        _ => None,
    }
}

/// Emit every named runtime global of the ABI.
pub(super) fn emit_runtime_globals(cc: &CompContext<'_, '_>) -> Result<()> {
    let wasm = cc.wasm;
    let memory = wasm.memory().copied();
    let memory_data_size = memory.map_or(0, |m| m.data_size());
    let fixed = memory.is_some_and(|m| m.is_fixed_size());

    let null_ptr = cc.ptrt().const_null();
    add_wasm_global(cc, "memory_data", cc.ptrt().into(), &null_ptr, false);
    let size_init = cc.i64t().const_int(memory_data_size, false);
    add_wasm_global(cc, "memory_data_size", cc.i64t().into(), &size_init, fixed);

    if !cc.options.no_sandbox_mode {
        let page_size = cc
            .i32t()
            .const_int(u64::from(memory.map_or(crate::module::PAGE_SIZE, |m| m.num_bytes_per_page)), false);
        add_wasm_global(cc, "num_bytes_per_page", cc.i32t().into(), &page_size, true);
        let cur_pages = cc.i32t().const_int(memory.map_or(0, |m| m.init_page_count), false);
        add_wasm_global(cc, "cur_page_count", cc.i32t().into(), &cur_pages, fixed);
        let max_pages = cc.i32t().const_int(memory.map_or(0, |m| m.max_page_count), false);
        add_wasm_global(cc, "max_page_count", cc.i32t().into(), &max_pages, true);
        add_wasm_global(cc, "host_managed_heap_handle", cc.ptrt().into(), &null_ptr, false);

        for bytes in [1u64, 2, 4, 8, 16] {
            let name = if bytes == 1 {
                "mem_bound_check_1byte".to_string()
            } else {
                format!("mem_bound_check_{bytes}bytes")
            };
            let bound = if memory_data_size == 0 { 0 } else { memory_data_size - bytes };
            let bound_init = cc.i64t().const_int(bound, false);
            add_wasm_global(cc, &name, cc.i64t().into(), &bound_init, fixed);
        }
    }

    // Data segments: one byte-array global per segment plus the pointer
    // and passive-length tables used by memory.init / data.drop.
    let mut seg_ptrs: Vec<PointerValue<'_>> = Vec::with_capacity(wasm.data_segs.len());
    let mut passive_lengths: Vec<IntValue<'_>> = Vec::with_capacity(wasm.data_segs.len());
    for (i, seg) in wasm.data_segs.iter().enumerate() {
        let array = cc.context.const_string(seg.data, false);
        let global = cc.module.add_global(array.get_type(), None, &format!("data_seg#{i}"));
        global.set_section(Some(WASM_GLOBALS_SECTION));
        global.set_linkage(Linkage::Internal);
        global.set_constant(true);
        global.set_initializer(&array);
        seg_ptrs.push(global.as_pointer_value());
        let len = if seg.is_passive { seg.data.len() as u64 } else { 0 };
        passive_lengths.push(cc.i32t().const_int(len, false));
    }
    let seg_ptr_array = cc.ptrt().const_array(&seg_ptrs);
    add_wasm_global(
        cc,
        "data_segs",
        cc.ptrt().array_type(seg_ptrs.len() as u32).into(),
        &seg_ptr_array,
        true,
    );
    let lengths_array = cc.i32t().const_array(&passive_lengths);
    add_wasm_global(
        cc,
        "data_seg_lengths_passive",
        cc.i32t().array_type(passive_lengths.len() as u32).into(),
        &lengths_array,
        false,
    );

    // Table elements, resolved from the element segments; -1 marks an
    // uninitialized slot.
    let table_size = wasm.table().map_or(0, |t| t.init_size) as usize;
    let mut elems = vec![-1i64; table_size];
    for seg in &wasm.element_segs {
        let Some(base) = const_base_offset(cc, &seg.base_offset) else {
            tracing::warn!("element segment with unlinked base offset is skipped");
            continue;
        };
        for (i, &func_idx) in seg.func_indices.iter().enumerate() {
            let slot = base as usize + i;
            if let Some(entry) = elems.get_mut(slot) {
                *entry = i64::from(func_idx);
            }
        }
    }
    let elem_consts: Vec<IntValue<'_>> = elems
        .iter()
        .map(|&v| cc.i32t().const_int(v as u64 & 0xffff_ffff, false))
        .collect();
    let elems_array = cc.i32t().const_array(&elem_consts);
    add_wasm_global(
        cc,
        "table_elems",
        cc.i32t().array_type(table_size as u32).into(),
        &elems_array,
        false,
    );

    // Function pointer and type-index tables.
    let func_count = wasm.func_count() as usize;
    let mut func_ptrs: Vec<PointerValue<'_>> = Vec::with_capacity(func_count);
    let mut type_idxs: Vec<IntValue<'_>> = Vec::with_capacity(func_count);
    for i in 0..func_count {
        let ptr = match cc.func_values.get(i).copied().flatten() {
            // Imports resolve at instance creation; defined functions are
            // known now.
            Some(f) if i >= wasm.import_funcs.len() => f.as_global_value().as_pointer_value(),
            _ => cc.ptrt().const_null(),
        };
        func_ptrs.push(ptr);
        let type_idx = wasm.func_type_idx(i as u32).unwrap_or(0);
        type_idxs.push(cc.i32t().const_int(u64::from(type_idx), false));
    }
    let func_ptrs_array = cc.ptrt().const_array(&func_ptrs);
    add_wasm_global(
        cc,
        "func_ptrs",
        cc.ptrt().array_type(func_count as u32).into(),
        &func_ptrs_array,
        false,
    );
    let type_idx_array = cc.i32t().const_array(&type_idxs);
    add_wasm_global(
        cc,
        "func_type_indexes",
        cc.i32t().array_type(func_count as u32).into(),
        &type_idx_array,
        true,
    );

    // Wasm globals, imports first.
    for (i, import) in wasm.import_globals.iter().enumerate() {
        let init = match import.linked_value {
            Some(linked) => const_init_value(cc, &linked, import.ty)?,
            None => zero_const(cc, import.ty),
        };
        add_wasm_global(
            cc,
            &format!("wasm_import_global#{i}"),
            cc.llvm_type(import.ty),
            &init,
            false,
        );
    }
    for (i, global) in wasm.globals.iter().enumerate() {
        let init = const_init_value(cc, &global.init, global.ty)?;
        add_wasm_global(
            cc,
            &format!("wasm_global#{i}"),
            cc.llvm_type(global.ty),
            &init,
            !global.mutable,
        );
    }

    // Exception message table and the exception id itself.
    let mut msg_ptrs: Vec<PointerValue<'_>> = Vec::with_capacity(EXCEPTION_MSGS.len());
    for (i, msg) in EXCEPTION_MSGS.iter().enumerate() {
        let global = add_string_constant(cc, &format!("exception_msg#{i}"), msg);
        msg_ptrs.push(global.as_pointer_value());
    }
    let msgs_array = cc.ptrt().const_array(&msg_ptrs);
    add_wasm_global(
        cc,
        "exception_msgs",
        cc.ptrt().array_type(EXCEPTION_MSGS.len() as u32).into(),
        &msgs_array,
        true,
    );
    let zero_i32 = cc.i32t().const_zero();
    add_wasm_global(cc, "exception_id", cc.i32t().into(), &zero_i32, false);

    let zero_i8 = cc.i8t().const_zero();
    add_wasm_global(cc, "is_instance_inited", cc.i8t().into(), &zero_i8, false);

    emit_export_api_table(cc)?;
    Ok(())
}

/// `exported_apis`: `{name, signature, func_ptr}` per exported function.
fn emit_export_api_table(cc: &CompContext<'_, '_>) -> Result<()> {
    let wasm = cc.wasm;
    let mut entries = Vec::new();
    for (i, export) in wasm.exports.iter().enumerate() {
        if export.kind != ExternKind::Func {
            continue;
        }
        let func_type = wasm
            .func_type(export.index)
            .ok_or_else(|| Error::Internal("unknown export function".into()))?;
        let name_global = add_string_constant(cc, &format!("export_name#{i}"), export.name);
        let sig_global =
            add_string_constant(cc, &format!("export_sig#{i}"), &func_type.signature());
        let func_ptr = match cc.func_values.get(export.index as usize).copied().flatten() {
            Some(f) => f.as_global_value().as_pointer_value(),
            None => cc.ptrt().const_null(),
        };
        let entry = cc.context.const_struct(
            &[
                name_global.as_pointer_value().into(),
                sig_global.as_pointer_value().into(),
                func_ptr.into(),
            ],
            false,
        );
        entries.push(entry);
    }

    let struct_ty = cc.context.struct_type(&[cc.ptrt().into(), cc.ptrt().into(), cc.ptrt().into()], false);
    let array = struct_ty.const_array(&entries);
    add_wasm_global(
        cc,
        "exported_apis",
        struct_ty.array_type(entries.len() as u32).into(),
        &array,
        true,
    );
    Ok(())
}

struct RuntimeBuilder<'cc, 'ctx, 'm> {
    cc: &'cc CompContext<'ctx, 'm>,
}

impl<'cc, 'ctx, 'm> RuntimeBuilder<'cc, 'ctx, 'm> {
    fn global(&self, name: &str) -> Result<GlobalValue<'ctx>> {
        self.cc
            .module
            .get_global(name)
            .ok_or_else(|| Error::Internal(format!("missing runtime global {name}")))
    }

    fn load_global(&self, name: &str, ty: BasicTypeEnum<'ctx>) -> Result<BasicValueEnum<'ctx>> {
        let g = self.global(name)?;
        Ok(self.cc.builder.build_load(ty, g.as_pointer_value(), name)?)
    }

    fn store_global(&self, name: &str, value: BasicValueEnum<'ctx>) -> Result<()> {
        let g = self.global(name)?;
        self.cc.builder.build_store(g.as_pointer_value(), value)?;
        Ok(())
    }

    fn libc_fn(
        &self,
        name: &str,
        fn_type: inkwell::types::FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        self.cc
            .module
            .get_function(name)
            .unwrap_or_else(|| self.cc.module.add_function(name, fn_type, None))
    }

    /// `base[index]` element pointer via integer arithmetic.
    fn elem_ptr(
        &self,
        base: PointerValue<'ctx>,
        index: u64,
        elem_size: u64,
    ) -> Result<PointerValue<'ctx>> {
        let i64t = self.cc.i64t();
        let base_int = self.cc.builder.build_ptr_to_int(base, i64t, "elem_base")?;
        let addr = self.cc.builder.build_int_add(
            base_int,
            i64t.const_int(index * elem_size, false),
            "elem_addr",
        )?;
        Ok(self.cc.builder.build_int_to_ptr(addr, self.cc.ptrt(), "elem_ptr")?)
    }

    fn mem_ptr_at(&self, base: PointerValue<'ctx>, offset: u64) -> Result<PointerValue<'ctx>> {
        let i64t = self.cc.i64t();
        let base_int = self.cc.builder.build_ptr_to_int(base, i64t, "mem_int")?;
        let addr =
            self.cc.builder.build_int_add(base_int, i64t.const_int(offset, false), "mem_at")?;
        Ok(self.cc.builder.build_int_to_ptr(addr, self.cc.ptrt(), "mem_ptr")?)
    }

    fn size_arg(&self, size: u64) -> BasicValueEnum<'ctx> {
        self.cc.intptr().const_int(size, false).into()
    }
}

/// Emit `wasm_instance_create`, `wasm_instance_destroy`, the accessor
/// functions, and (in no-sandbox mode) the global ctor/dtor registration
/// plus the `main` wrapper.
pub(super) fn emit_instance_functions(cc: &CompContext<'_, '_>) -> Result<()> {
    emit_instance_create(cc)?;
    emit_instance_destroy(cc)?;
    emit_accessors(cc)?;
    if cc.options.no_sandbox_mode {
        register_ctor_dtor(cc)?;
        emit_main_wrapper(cc)?;
    }
    Ok(())
}

fn emit_instance_create(cc: &CompContext<'_, '_>) -> Result<()> {
    let rb = RuntimeBuilder { cc };
    let b = &cc.builder;
    let void_fn = cc.context.void_type().fn_type(&[], false);
    let func = cc.module.add_function("wasm_instance_create", void_fn, None);

    let entry = cc.context.append_basic_block(func, "entry");
    let init_bb = cc.context.append_basic_block(func, "do_init");
    let fail_bb = cc.context.append_basic_block(func, "alloc_fail");
    let end_bb = cc.context.append_basic_block(func, "end");

    b.position_at_end(entry);
    let inited = rb.load_global("is_instance_inited", cc.i8t().into())?.into_int_value();
    let not_inited =
        b.build_int_compare(IntPredicate::EQ, inited, cc.i8t().const_zero(), "not_inited")?;
    b.build_conditional_branch(not_inited, init_bb, end_bb)?;

    b.position_at_end(init_bb);

    // 1. Register native imports: resolved ones land in func_ptrs, the
    //    rest warn at runtime (sandbox mode) and stay null.
    let func_ptrs = rb.global("func_ptrs")?;
    let puts_fn = rb.libc_fn("puts", cc.i32t().fn_type(&[cc.ptrt().into()], false));
    for (i, import) in cc.wasm.import_funcs.iter().enumerate() {
        match cc.func_values.get(i).copied().flatten() {
            Some(native) => {
                let slot = rb.elem_ptr(func_ptrs.as_pointer_value(), i as u64, cc.ptr_size)?;
                b.build_store(slot, native.as_global_value().as_pointer_value())?;
            }
            None if !cc.options.no_sandbox_mode => {
                let msg = format!(
                    "warning: failed to link import function ({}, {})",
                    import.module_name, import.field_name
                );
                let msg_global = add_string_constant(cc, &format!("unlinked_msg#{i}"), &msg);
                b.build_call(puts_fn, &[msg_global.as_pointer_value().into()], "warn")?;
            }
            None => {}
        }
    }

    // 2. Allocate and zero linear memory (plus any host-managed heap).
    let memory_size = cc.wasm.memory().map_or(0, |m| m.data_size());
    let heap_size = u64::from(cc.options.heap_size);
    let total_size = memory_size + heap_size;
    let after_alloc_bb = cc.context.append_basic_block(func, "after_alloc");
    if total_size > 0 {
        let malloc_fn = rb.libc_fn("malloc", cc.ptrt().fn_type(&[cc.intptr().into()], false));
        let mem = b
            .build_call(malloc_fn, &[rb.size_arg(total_size)], "malloc")?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| Error::Llvm("malloc returned void".into()))?
            .into_pointer_value();
        rb.store_global("memory_data", mem.into())?;
        let is_null = b.build_is_null(mem, "malloc_null")?;
        let zero_bb = cc.context.append_basic_block(func, "zero_mem");
        b.build_conditional_branch(is_null, fail_bb, zero_bb)?;

        b.position_at_end(zero_bb);
        let size64 = cc.i64t().const_int(total_size, false);
        b.build_memset(mem, 1, cc.i8t().const_zero(), size64)?;

        // 3. Copy active data segments, skipping all-zero ones (memory is
        //    already zero-filled).
        for (i, seg) in cc.wasm.data_segs.iter().enumerate() {
            if seg.is_passive || seg.data.is_empty() || seg.data.iter().all(|&byte| byte == 0) {
                continue;
            }
            let Some(base) = seg.base_offset.as_ref().and_then(|e| const_base_offset(cc, e))
            else {
                tracing::warn!("data segment {i} with unlinked base offset is skipped");
                continue;
            };
            let dest = rb.mem_ptr_at(mem, base)?;
            let src = rb.global(&format!("data_seg#{i}"))?;
            let len = cc.i64t().const_int(seg.data.len() as u64, false);
            b.build_memcpy(dest, 1, src.as_pointer_value(), 1, len)?;
        }

        // 4. No-sandbox pointer fixups driven by reloc.DATA.
        if cc.options.no_sandbox_mode {
            emit_data_reloc_fixups(cc, &rb, mem)?;
        }

        // 5. Host-managed heap past the fixed memory.
        if heap_size > 0 && !cc.options.no_sandbox_mode {
            let create_fn = rb.libc_fn(
                "mem_allocator_create",
                cc.ptrt().fn_type(&[cc.ptrt().into(), cc.i32t().into()], false),
            );
            let heap_base = rb.mem_ptr_at(mem, memory_size)?;
            let handle = b
                .build_call(
                    create_fn,
                    &[heap_base.into(), cc.i32t().const_int(heap_size, false).into()],
                    "heap",
                )?
                .try_as_basic_value()
                .left()
                .ok_or_else(|| Error::Llvm("mem_allocator_create returned void".into()))?
                .into_pointer_value();
            rb.store_global("host_managed_heap_handle", handle.into())?;
            let heap_null = b.build_is_null(handle, "heap_null")?;
            let heap_ok_bb = cc.context.append_basic_block(func, "heap_ok");
            b.build_conditional_branch(heap_null, fail_bb, heap_ok_bb)?;
            b.position_at_end(heap_ok_bb);
        }
        b.build_unconditional_branch(after_alloc_bb)?;
    } else {
        b.build_unconditional_branch(after_alloc_bb)?;
    }

    b.position_at_end(after_alloc_bb);

    // 6. The wasm start function.
    if let Some(start_idx) = cc.wasm.start_func {
        if let Some(Some(f)) = cc.func_values.get(start_idx as usize) {
            b.build_call(*f, &[], "start")?;
        } else {
            tracing::warn!("start function is an unlinked import, skipping the call");
        }
    }

    // 7. Post-instantiation: __wasm_call_ctors, with exception
    //    propagation through exception_id.
    if let Some(export) = cc.wasm.export_by_name("__wasm_call_ctors") {
        if export.kind == ExternKind::Func {
            let ty_ok = cc
                .wasm
                .func_type(export.index)
                .is_some_and(|t| t.params.is_empty() && t.results.is_empty());
            if ty_ok {
                if let Some(Some(f)) = cc.func_values.get(export.index as usize) {
                    b.build_call(*f, &[], "call_ctors")?;
                    let exce = rb.load_global("exception_id", cc.i32t().into())?.into_int_value();
                    let has_exce = b.build_int_compare(
                        IntPredicate::NE,
                        exce,
                        cc.i32t().const_zero(),
                        "has_exce",
                    )?;
                    let ok_bb = cc.context.append_basic_block(func, "ctors_ok");
                    b.build_conditional_branch(has_exce, end_bb, ok_bb)?;
                    b.position_at_end(ok_bb);
                }
            }
        }
    }

    // 8. Mark the instance live.
    rb.store_global("is_instance_inited", cc.i8t().const_int(1, false).into())?;
    b.build_unconditional_branch(end_bb)?;

    b.position_at_end(fail_bb);
    let exce_id = cc
        .i32t()
        .const_int(ExceptionId::AllocateMemoryFailed as i32 as u32 as u64, true);
    rb.store_global("exception_id", exce_id.into())?;
    b.build_unconditional_branch(end_bb)?;

    b.position_at_end(end_bb);
    b.build_return(None)?;
    Ok(())
}

/// In no-sandbox mode the data section carries absolute-pointer slots
/// whose link-time addends must be replaced with real host addresses.
fn emit_data_reloc_fixups<'ctx>(
    cc: &CompContext<'ctx, '_>,
    rb: &RuntimeBuilder<'_, 'ctx, '_>,
    mem: PointerValue<'ctx>,
) -> Result<()> {
    use crate::module::RelocKind;

    let b = &cc.builder;
    let wasm = cc.wasm;
    let mem_int = b.build_ptr_to_int(mem, cc.i64t(), "mem_int")?;

    // Linear-memory base offset of the segment containing a
    // section-relative offset.
    let locate = |section_offset: u64| -> Option<(usize, u64)> {
        wasm.data_segs.iter().enumerate().find_map(|(i, seg)| {
            let start = seg.section_offset as u64;
            let end = start + seg.data.len() as u64;
            if (start..end).contains(&section_offset) {
                let base = seg.base_offset.as_ref().and_then(|e| const_base_offset(cc, e))?;
                Some((i, base + (section_offset - start)))
            } else {
                None
            }
        })
    };

    for reloc in &wasm.data_relocs {
        let Some((seg_idx, slot_linear)) = locate(reloc.offset) else {
            return Err(Error::Load("invalid relocation offset".into()));
        };
        let seg = &wasm.data_segs[seg_idx];
        let slot_in_seg = (reloc.offset - seg.section_offset as u64) as usize;
        let slot_bytes: [u8; 8] = seg
            .data
            .get(slot_in_seg..slot_in_seg + 8)
            .and_then(|s| s.try_into().ok())
            .ok_or_else(|| Error::Load("invalid relocation offset".into()))?;
        let initial = u64::from_le_bytes(slot_bytes);

        let slot_ptr = rb.mem_ptr_at(mem, slot_linear)?;

        match reloc.kind {
            RelocKind::R_WASM_MEMORY_ADDR_I64 => {
                let symbol = wasm
                    .symbols
                    .get(reloc.symbol_index as usize)
                    .ok_or_else(|| Error::Load("invalid symbol index".into()))?;
                let target_seg = wasm
                    .data_segs
                    .get(symbol.seg_index as usize)
                    .ok_or_else(|| Error::Load("unknown data segment".into()))?;
                let seg_base = target_seg
                    .base_offset
                    .as_ref()
                    .and_then(|e| const_base_offset(cc, e))
                    .unwrap_or(0);
                let target_off = seg_base + symbol.data_offset + reloc.addend as u64;
                let value = b.build_int_add(
                    mem_int,
                    cc.i64t().const_int(target_off, false),
                    "reloc_addr",
                )?;
                b.build_store(slot_ptr, value)?;
            }
            RelocKind::R_WASM_TABLE_INDEX_I64 => {
                // The addend stored in the binary is the table slot whose
                // function pointer must land here.
                let elem_idx = initial;
                let func_idx = wasm
                    .element_segs
                    .iter()
                    .find_map(|seg| {
                        let base = const_base_offset(cc, &seg.base_offset)?;
                        elem_idx
                            .checked_sub(base)
                            .and_then(|i| seg.func_indices.get(i as usize))
                            .copied()
                    })
                    .ok_or_else(|| {
                        Error::Load("invalid relocation offset".into())
                    })?;
                let target = cc
                    .func_values
                    .get(func_idx as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| {
                        Error::Unsupported(format!(
                            "table relocation against unlinked function {func_idx}"
                        ))
                    })?;
                let fn_int = b.build_ptr_to_int(
                    target.as_global_value().as_pointer_value(),
                    cc.i64t(),
                    "fn_int",
                )?;
                b.build_store(slot_ptr, fn_int)?;
            }
            other => {
                return Err(Error::Unsupported(format!(
                    "data relocation kind {other:?}"
                )));
            }
        }
    }
    Ok(())
}

fn emit_instance_destroy(cc: &CompContext<'_, '_>) -> Result<()> {
    let rb = RuntimeBuilder { cc };
    let b = &cc.builder;
    let void_fn = cc.context.void_type().fn_type(&[], false);
    let func = cc.module.add_function("wasm_instance_destroy", void_fn, None);

    let entry = cc.context.append_basic_block(func, "entry");
    let destroy_bb = cc.context.append_basic_block(func, "destroy");
    let free_bb = cc.context.append_basic_block(func, "free_mem");
    let finish_bb = cc.context.append_basic_block(func, "finish");
    let end_bb = cc.context.append_basic_block(func, "end");

    b.position_at_end(entry);
    let inited = rb.load_global("is_instance_inited", cc.i8t().into())?.into_int_value();
    let is_inited =
        b.build_int_compare(IntPredicate::NE, inited, cc.i8t().const_zero(), "is_inited")?;
    b.build_conditional_branch(is_inited, destroy_bb, end_bb)?;

    b.position_at_end(destroy_bb);
    let mem = rb.load_global("memory_data", cc.ptrt().into())?.into_pointer_value();
    let is_null = b.build_is_null(mem, "mem_null")?;
    b.build_conditional_branch(is_null, finish_bb, free_bb)?;

    b.position_at_end(free_bb);
    let free_fn = rb.libc_fn(
        "free",
        cc.context.void_type().fn_type(&[cc.ptrt().into()], false),
    );
    b.build_call(free_fn, &[mem.into()], "")?;
    b.build_unconditional_branch(finish_bb)?;

    b.position_at_end(finish_bb);
    rb.store_global("memory_data", cc.ptrt().const_null().into())?;
    rb.store_global("is_instance_inited", cc.i8t().const_zero().into())?;
    b.build_unconditional_branch(end_bb)?;

    b.position_at_end(end_bb);
    b.build_return(None)?;
    Ok(())
}

fn emit_accessors(cc: &CompContext<'_, '_>) -> Result<()> {
    let rb = RuntimeBuilder { cc };
    let b = &cc.builder;

    let simple = |name: &str,
                  ret_ty: BasicTypeEnum<'_>,
                  global: &str|
     -> Result<()> {
        let fn_ty = match ret_ty {
            BasicTypeEnum::IntType(t) => t.fn_type(&[], false),
            BasicTypeEnum::PointerType(t) => t.fn_type(&[], false),
            _ => return Err(Error::Internal("unsupported accessor type".into())),
        };
        let func = cc.module.add_function(name, fn_ty, None);
        let entry = cc.context.append_basic_block(func, "entry");
        cc.builder.position_at_end(entry);
        let value = rb.load_global(global, ret_ty)?;
        cc.builder.build_return(Some(&value))?;
        Ok(())
    };

    simple("wasm_instance_is_created", cc.i8t().into(), "is_instance_inited")?;
    simple("wasm_get_memory", cc.ptrt().into(), "memory_data")?;
    simple("wasm_get_memory_size", cc.i64t().into(), "memory_data_size")?;
    simple("wasm_get_exception", cc.i32t().into(), "exception_id")?;
    if cc.options.no_sandbox_mode {
        let func = cc
            .module
            .add_function("wasm_get_heap_handle", cc.ptrt().fn_type(&[], false), None);
        let entry = cc.context.append_basic_block(func, "entry");
        b.position_at_end(entry);
        b.build_return(Some(&cc.ptrt().const_null()))?;
    } else {
        simple("wasm_get_heap_handle", cc.ptrt().into(), "host_managed_heap_handle")?;
    }

    // wasm_set_exception(i32)
    {
        let fn_ty = cc.context.void_type().fn_type(&[cc.i32t().into()], false);
        let func = cc.module.add_function("wasm_set_exception", fn_ty, None);
        let entry = cc.context.append_basic_block(func, "entry");
        b.position_at_end(entry);
        let arg = func
            .get_nth_param(0)
            .ok_or_else(|| Error::Internal("missing param".into()))?;
        rb.store_global("exception_id", arg)?;
        b.build_return(None)?;
    }

    // wasm_get_exception_msg() -> *u8
    {
        let fn_ty = cc.ptrt().fn_type(&[], false);
        let func = cc.module.add_function("wasm_get_exception_msg", fn_ty, None);
        let entry = cc.context.append_basic_block(func, "entry");
        let lookup_bb = cc.context.append_basic_block(func, "lookup");
        let none_bb = cc.context.append_basic_block(func, "no_exception");
        b.position_at_end(entry);
        let id = rb.load_global("exception_id", cc.i32t().into())?.into_int_value();
        let is_zero =
            b.build_int_compare(IntPredicate::EQ, id, cc.i32t().const_zero(), "no_exce")?;
        b.build_conditional_branch(is_zero, none_bb, lookup_bb)?;

        b.position_at_end(none_bb);
        b.build_return(Some(&cc.ptrt().const_null()))?;

        b.position_at_end(lookup_bb);
        let min = cc.i32t().const_int(EXCEPTION_ID_MIN as u32 as u64, true);
        let index = b.build_int_sub(id, min, "msg_index")?;
        let index64 = b.build_int_s_extend(index, cc.i64t(), "msg_index64")?;
        let msgs = rb.global("exception_msgs")?;
        let base_int =
            b.build_ptr_to_int(msgs.as_pointer_value(), cc.i64t(), "msgs_base")?;
        let byte_off = b.build_int_mul(
            index64,
            cc.i64t().const_int(cc.ptr_size, false),
            "msg_off",
        )?;
        let addr = b.build_int_add(base_int, byte_off, "msg_addr")?;
        let slot = b.build_int_to_ptr(addr, cc.ptrt(), "msg_slot")?;
        let msg = b.build_load(cc.ptrt(), slot, "msg")?;
        b.build_return(Some(&msg))?;
    }

    // wasm_get_export_apis() -> *u8 / wasm_get_export_api_num() -> u32
    {
        let fn_ty = cc.ptrt().fn_type(&[], false);
        let func = cc.module.add_function("wasm_get_export_apis", fn_ty, None);
        let entry = cc.context.append_basic_block(func, "entry");
        b.position_at_end(entry);
        let apis = rb.global("exported_apis")?;
        b.build_return(Some(&apis.as_pointer_value()))?;

        let count = cc
            .wasm
            .exports
            .iter()
            .filter(|e| e.kind == ExternKind::Func)
            .count() as u64;
        let fn_ty = cc.i32t().fn_type(&[], false);
        let func = cc.module.add_function("wasm_get_export_api_num", fn_ty, None);
        let entry = cc.context.append_basic_block(func, "entry");
        b.position_at_end(entry);
        b.build_return(Some(&cc.i32t().const_int(count, false)))?;
    }

    Ok(())
}

/// Register the instance constructor/destructor in `llvm.global_ctors` /
/// `llvm.global_dtors` with the canonical priority.
fn register_ctor_dtor(cc: &CompContext<'_, '_>) -> Result<()> {
    let struct_ty = cc.context.struct_type(
        &[cc.i32t().into(), cc.ptrt().into(), cc.ptrt().into()],
        false,
    );

    for (list_name, func_name) in [
        ("llvm.global_ctors", "wasm_instance_create"),
        ("llvm.global_dtors", "wasm_instance_destroy"),
    ] {
        let func = cc
            .module
            .get_function(func_name)
            .ok_or_else(|| Error::Internal(format!("missing {func_name}")))?;
        let entry = cc.context.const_struct(
            &[
                cc.i32t().const_int(CTOR_PRIORITY, false).into(),
                func.as_global_value().as_pointer_value().into(),
                cc.ptrt().const_null().into(),
            ],
            false,
        );
        let array = struct_ty.const_array(&[entry]);
        let global = cc.module.add_global(struct_ty.array_type(1), None, list_name);
        global.set_linkage(Linkage::Appending);
        global.set_initializer(&array);
    }
    Ok(())
}

/// `main(argc, argv)` wrapper, generated iff the module exports
/// `__main_argc_argv`.
fn emit_main_wrapper(cc: &CompContext<'_, '_>) -> Result<()> {
    let Some(export) = cc.wasm.export_by_name("__main_argc_argv") else {
        return Ok(());
    };
    if export.kind != ExternKind::Func {
        return Ok(());
    }
    let Some(Some(wasm_main)) = cc.func_values.get(export.index as usize) else {
        return Ok(());
    };
    let func_type = cc
        .wasm
        .func_type(export.index)
        .ok_or_else(|| Error::Internal("unknown export function".into()))?;

    let b = &cc.builder;
    let fn_ty = cc
        .i32t()
        .fn_type(&[cc.i32t().into(), cc.i64t().into()], false);
    let func = cc.module.add_function("main", fn_ty, None);
    let entry = cc.context.append_basic_block(func, "entry");
    b.position_at_end(entry);

    let argc = func
        .get_nth_param(0)
        .ok_or_else(|| Error::Internal("missing argc".into()))?
        .into_int_value();
    let argv = func
        .get_nth_param(1)
        .ok_or_else(|| Error::Internal("missing argv".into()))?
        .into_int_value();

    let mut args: Vec<inkwell::values::BasicMetadataValueEnum<'_>> = Vec::new();
    for (i, &ty) in func_type.params.iter().enumerate() {
        let value: BasicValueEnum<'_> = match (i, ty) {
            (0, ValType::I32) => argc.into(),
            (0, ValType::I64) => b.build_int_s_extend(argc, cc.i64t(), "argc64")?.into(),
            (_, ValType::I64) => argv.into(),
            (_, ValType::I32) => b.build_int_truncate(argv, cc.i32t(), "argv32")?.into(),
            _ => return Err(Error::Unsupported("unexpected main signature".into())),
        };
        args.push(value.into());
    }
    let ret = b
        .build_call(*wasm_main, &args, "wasm_main")?
        .try_as_basic_value()
        .left();
    match ret {
        Some(v) => b.build_return(Some(&v))?,
        None => b.build_return(Some(&cc.i32t().const_zero()))?,
    };
    Ok(())
}
