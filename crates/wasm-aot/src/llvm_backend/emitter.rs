//! Per-function opcode emitter: drives the validated (and rewritten)
//! bytecode through a value-stack machine producing LLVM IR.

use inkwell::basic_block::BasicBlock;
use inkwell::types::BasicTypeEnum;
use inkwell::values::{BasicValueEnum, FunctionValue, GlobalValue, IntValue, PhiValue, PointerValue};

use crate::module::{Function, Module, ValType};
use crate::opcode as op;
use crate::reader::Reader;
use crate::validator::BlockType;
use crate::{Error, Result};

use super::context::CompContext;
use super::control_flow::{Frame, FrameKind};

pub struct FuncEmitter<'ctx, 'm> {
    pub cc: &'m CompContext<'ctx, 'm>,
    pub wasm: &'m Module<'m>,
    pub func: &'m Function<'m>,
    pub func_idx: u32,
    pub fn_val: FunctionValue<'ctx>,
    pub wasm_param_count: usize,
    pub locals: Vec<(PointerValue<'ctx>, ValType)>,
    pub stack: Vec<BasicValueEnum<'ctx>>,
    pub frames: Vec<Frame<'ctx>>,
    pub unreachable: bool,
    pub(super) exce_block: Option<BasicBlock<'ctx>>,
    pub(super) exce_phi: Option<PhiValue<'ctx>>,
}

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    pub fn new(
        cc: &'m CompContext<'ctx, 'm>,
        func_local_idx: usize,
        fn_val: FunctionValue<'ctx>,
    ) -> Self {
        let wasm = cc.wasm;
        let func = &wasm.functions[func_local_idx];
        Self {
            cc,
            wasm,
            func,
            func_idx: wasm.import_funcs.len() as u32 + func_local_idx as u32,
            fn_val,
            wasm_param_count: func.func_type.params.len(),
            locals: Vec::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            unreachable: false,
            exce_block: None,
            exce_phi: None,
        }
    }

    // ── small shared helpers ──

    pub(super) fn push(&mut self, value: BasicValueEnum<'ctx>) {
        self.stack.push(value);
    }

    pub(super) fn pop(&mut self) -> Result<BasicValueEnum<'ctx>> {
        self.stack
            .pop()
            .ok_or_else(|| Error::Internal("operand stack underflow".into()))
    }

    pub(super) fn pop_int(&mut self) -> Result<IntValue<'ctx>> {
        Ok(self.pop()?.into_int_value())
    }

    pub(super) fn current_block(&self) -> BasicBlock<'ctx> {
        self.cc
            .builder
            .get_insert_block()
            .unwrap_or_else(|| self.fn_val.get_first_basic_block().unwrap_or_else(|| unreachable!()))
    }

    pub(super) fn append_block(&self, name: &str) -> BasicBlock<'ctx> {
        self.cc.context.append_basic_block(self.fn_val, name)
    }

    pub(super) fn undef_value(ty: BasicTypeEnum<'ctx>) -> BasicValueEnum<'ctx> {
        match ty {
            BasicTypeEnum::IntType(t) => t.get_undef().into(),
            BasicTypeEnum::FloatType(t) => t.get_undef().into(),
            BasicTypeEnum::PointerType(t) => t.get_undef().into(),
            BasicTypeEnum::VectorType(t) => t.get_undef().into(),
            BasicTypeEnum::ArrayType(t) => t.get_undef().into(),
            BasicTypeEnum::StructType(t) => t.get_undef().into(),
            BasicTypeEnum::ScalableVectorType(t) => t.get_undef().into(),
        }
    }

    pub(super) fn named_global(&self, name: &str) -> Result<GlobalValue<'ctx>> {
        self.cc
            .module
            .get_global(name)
            .ok_or_else(|| Error::Internal(format!("missing runtime global {name}")))
    }

    /// Load a named runtime global.
    pub(super) fn load_runtime_global(
        &self,
        name: &str,
        ty: BasicTypeEnum<'ctx>,
    ) -> Result<BasicValueEnum<'ctx>> {
        let global = self.named_global(name)?;
        Ok(self.cc.builder.build_load(ty, global.as_pointer_value(), name)?)
    }

    /// Address of `base[index]` for an array global, computed with integer
    /// arithmetic on the pointer.
    pub(super) fn array_elem_ptr(
        &self,
        base: PointerValue<'ctx>,
        index: IntValue<'ctx>,
        elem_size: u64,
    ) -> Result<PointerValue<'ctx>> {
        let i64t = self.cc.i64t();
        let base_int = self.cc.builder.build_ptr_to_int(base, i64t, "arr_base")?;
        let index64 = if index.get_type() == i64t {
            index
        } else {
            self.cc.builder.build_int_z_extend(index, i64t, "arr_idx")?
        };
        let byte_off = self.cc.builder.build_int_mul(
            index64,
            i64t.const_int(elem_size, false),
            "arr_off",
        )?;
        let addr = self.cc.builder.build_int_add(base_int, byte_off, "arr_addr")?;
        Ok(self.cc.builder.build_int_to_ptr(addr, self.cc.ptrt(), "arr_ptr")?)
    }

    /// The code-section-relative offset of a position in this function's
    /// body, for matching reloc.CODE entries.
    pub(super) fn code_section_rel(&self, code_pos: usize) -> u64 {
        (self.func.code_file_offset - self.wasm.code_section_offset + code_pos) as u64
    }

    // ── function body emission ──

    pub fn emit(&mut self) -> Result<()> {
        let entry_bb = self.append_block("entry");
        self.cc.builder.position_at_end(entry_bb);

        // Allocas for parameters and declared locals.
        let param_types = self.func.func_type.params.to_vec();
        for (i, &ty) in param_types.iter().enumerate() {
            let alloca = self
                .cc
                .builder
                .build_alloca(self.cc.llvm_type(ty), &format!("local{i}#"))?;
            let param = self
                .fn_val
                .get_nth_param(i as u32)
                .ok_or_else(|| Error::Internal(format!("missing param {i}")))?;
            self.cc.builder.build_store(alloca, param)?;
            self.locals.push((alloca, ty));
        }
        let local_types = self.func.local_types.clone();
        for (i, &ty) in local_types.iter().enumerate() {
            let n = param_types.len() + i;
            let llvm_ty = self.cc.llvm_type(ty);
            let alloca = self.cc.builder.build_alloca(llvm_ty, &format!("local{n}#"))?;
            self.cc.builder.build_store(alloca, Self::zero_value(llvm_ty))?;
            self.locals.push((alloca, ty));
        }

        // Implicit function frame; the body's final `end` emits the return.
        let merge_bb = self.append_block("func_return");
        let result_types = self.func.func_type.results.to_vec();
        let current = self.current_block();
        self.cc.builder.position_at_end(merge_bb);
        let mut result_phis = Vec::with_capacity(result_types.len());
        for (i, &ty) in result_types.iter().enumerate() {
            result_phis.push(self.cc.builder.build_phi(self.cc.llvm_type(ty), &format!("ret{i}"))?);
        }
        self.cc.builder.position_at_end(current);
        self.frames.push(Frame {
            kind: FrameKind::Function,
            param_types: Vec::new(),
            result_types,
            merge_bb,
            header_bb: None,
            param_phis: Vec::new(),
            result_phis,
            else_bb: None,
            else_seen: false,
            saved_params: Vec::new(),
            stack_depth: 0,
            merge_reached: false,
            dead: false,
        });

        let code = self.func.code.clone();
        let mut r = Reader::new(&code);
        while !self.frames.is_empty() {
            let opcode_pos = r.pos();
            let opcode = r.read_u8()?;
            self.emit_op(opcode, opcode_pos, &mut r)?;
        }
        Ok(())
    }

    pub(super) fn zero_value(ty: BasicTypeEnum<'ctx>) -> BasicValueEnum<'ctx> {
        match ty {
            BasicTypeEnum::IntType(t) => t.const_zero().into(),
            BasicTypeEnum::FloatType(t) => t.const_zero().into(),
            BasicTypeEnum::PointerType(t) => t.const_null().into(),
            BasicTypeEnum::VectorType(t) => t.const_zero().into(),
            BasicTypeEnum::ArrayType(t) => t.const_zero().into(),
            BasicTypeEnum::StructType(t) => t.const_zero().into(),
            BasicTypeEnum::ScalableVectorType(t) => t.const_zero().into(),
        }
    }

    fn block_type_from_byte(&self, byte: u8) -> Result<BlockType> {
        ValType::from_byte(byte)
            .map(BlockType::Value)
            .ok_or_else(|| Error::Internal("invalid block type byte".into()))
    }

    fn block_type_from_index(&self, type_idx: u32) -> Result<BlockType> {
        self.wasm
            .types
            .get(type_idx as usize)
            .map(|t| BlockType::Type(std::rc::Rc::clone(t)))
            .ok_or_else(|| Error::Internal("invalid block type index".into()))
    }

    fn emit_op(&mut self, opcode: u8, opcode_pos: usize, r: &mut Reader<'_>) -> Result<()> {
        // Dead code is decoded (to stay in sync) but not emitted; only the
        // block structure is tracked so `else`/`end` stay matched.
        if self.unreachable
            && !matches!(
                opcode,
                op::BLOCK
                    | op::LOOP
                    | op::IF
                    | op::EXT_OP_BLOCK
                    | op::EXT_OP_LOOP
                    | op::EXT_OP_IF
                    | op::ELSE
                    | op::END
            )
        {
            return self.skip_immediates(opcode, r);
        }

        match opcode {
            op::UNREACHABLE => {
                self.raise_exception(crate::trap::ExceptionId::Unreachable, None)?;
                self.unreachable = true;
            }
            op::NOP => {}

            op::BLOCK | op::LOOP | op::IF | op::EXT_OP_BLOCK | op::EXT_OP_LOOP | op::EXT_OP_IF => {
                let block_type = if matches!(opcode, op::BLOCK | op::LOOP | op::IF) {
                    let byte = r.read_u8()?;
                    self.block_type_from_byte(byte)?
                } else {
                    let idx = r.read_leb_u32()?;
                    self.block_type_from_index(idx)?
                };
                if self.unreachable {
                    let kind = match opcode {
                        op::BLOCK | op::EXT_OP_BLOCK => FrameKind::Block,
                        op::LOOP | op::EXT_OP_LOOP => FrameKind::Loop,
                        _ => FrameKind::If,
                    };
                    self.push_dead_frame(kind);
                    return Ok(());
                }
                match opcode {
                    op::BLOCK | op::EXT_OP_BLOCK => self.emit_block(&block_type)?,
                    op::LOOP | op::EXT_OP_LOOP => self.emit_loop(&block_type)?,
                    _ => self.emit_if(&block_type)?,
                }
            }

            op::ELSE => self.emit_else()?,
            op::END => self.emit_end()?,

            op::BR => {
                let depth = r.read_leb_u32()?;
                self.emit_br(depth)?;
            }
            op::BR_IF => {
                let depth = r.read_leb_u32()?;
                self.emit_br_if(depth)?;
            }
            op::BR_TABLE | op::EXT_OP_BR_TABLE_CACHE => {
                let depths = self.read_br_table_depths(
                    r,
                    opcode_pos,
                    opcode == op::EXT_OP_BR_TABLE_CACHE,
                )?;
                self.emit_br_table(&depths)?;
            }
            op::RETURN => self.emit_return()?,

            op::CALL => {
                let func_idx = r.read_leb_u32()?;
                self.emit_call(func_idx, false)?;
            }
            op::RETURN_CALL => {
                let func_idx = r.read_leb_u32()?;
                self.emit_call(func_idx, true)?;
            }
            op::CALL_INDIRECT => {
                let type_idx = r.read_leb_u32()?;
                let _table_idx = r.read_leb_u32()?;
                self.emit_call_indirect(type_idx, false)?;
            }
            op::RETURN_CALL_INDIRECT => {
                let type_idx = r.read_leb_u32()?;
                let _table_idx = r.read_leb_u32()?;
                self.emit_call_indirect(type_idx, true)?;
            }

            op::DROP | op::EXT_OP_DROP_64 => {
                self.pop()?;
            }
            op::SELECT | op::EXT_OP_SELECT_64 => {
                let cond = self.pop_int()?;
                let false_value = self.pop()?;
                let true_value = self.pop()?;
                let cond_bool = self.cc.builder.build_int_compare(
                    inkwell::IntPredicate::NE,
                    cond,
                    cond.get_type().const_zero(),
                    "sel_test",
                )?;
                let result =
                    self.cc.builder.build_select(cond_bool, true_value, false_value, "select")?;
                self.push(result);
            }
            op::SELECT_T => {
                r.read_leb_u32()?;
                r.read_u8()?;
                let cond = self.pop_int()?;
                let false_value = self.pop()?;
                let true_value = self.pop()?;
                let cond_bool = self.cc.builder.build_int_compare(
                    inkwell::IntPredicate::NE,
                    cond,
                    cond.get_type().const_zero(),
                    "sel_test",
                )?;
                let result =
                    self.cc.builder.build_select(cond_bool, true_value, false_value, "select")?;
                self.push(result);
            }

            op::LOCAL_GET => {
                let idx = r.read_leb_u32()? as usize;
                let (ptr, ty) = self.locals[idx];
                let value =
                    self.cc.builder.build_load(self.cc.llvm_type(ty), ptr, &format!("local{idx}#"))?;
                self.push(value);
            }
            op::LOCAL_SET => {
                let idx = r.read_leb_u32()? as usize;
                let value = self.pop()?;
                self.cc.builder.build_store(self.locals[idx].0, value)?;
            }
            op::LOCAL_TEE => {
                let idx = r.read_leb_u32()? as usize;
                let value = self.pop()?;
                self.cc.builder.build_store(self.locals[idx].0, value)?;
                self.push(value);
            }

            op::GLOBAL_GET | op::EXT_OP_GLOBAL_GET_64 => {
                let idx = r.read_leb_u32()?;
                self.emit_global_get(idx, opcode_pos)?;
            }
            op::GLOBAL_SET | op::EXT_OP_GLOBAL_SET_64 => {
                let idx = r.read_leb_u32()?;
                self.emit_global_set(idx, opcode_pos, false)?;
            }
            op::EXT_OP_GLOBAL_SET_AUX_STACK => {
                let idx = r.read_leb_u32()?;
                self.emit_global_set(idx, opcode_pos, true)?;
            }

            op::I32_LOAD..=op::MEMORY_GROW => self.emit_memory_op(opcode, r)?,

            op::I32_CONST => {
                let value = r.read_leb_i32()?;
                self.push(self.cc.i32t().const_int(value as u32 as u64, false).into());
            }
            op::I64_CONST => {
                let value = r.read_leb_i64()?;
                self.push(self.cc.i64t().const_int(value as u64, false).into());
            }
            op::F32_CONST => {
                let value = r.read_f32()?;
                self.push(self.cc.f32t().const_float(f64::from(value)).into());
            }
            op::F64_CONST => {
                let value = r.read_f64()?;
                self.push(self.cc.f64t().const_float(value).into());
            }

            op::I32_EQZ..=op::I64_EXTEND32_S => self.emit_numeric_op(opcode)?,

            op::PREFIX_MISC => {
                let subop = r.read_leb_u32()?;
                self.emit_misc_op(subop, r)?;
            }
            op::PREFIX_SIMD => {
                let subop = r.read_leb_u32()?;
                self.emit_simd_op(subop, r)?;
            }
            op::PREFIX_ATOMIC => {
                let subop = r.read_leb_u32()?;
                self.emit_atomic_op(subop, r)?;
            }

            _ => {
                return Err(Error::Unsupported(format!("opcode 0x{opcode:02x}")));
            }
        }
        Ok(())
    }

    /// Advance the reader past an opcode's immediates without emitting
    /// anything (dead-code path).
    fn skip_immediates(&self, opcode: u8, r: &mut Reader<'_>) -> Result<()> {
        let is_memory64 = self.wasm.is_memory64();
        match opcode {
            op::BR | op::BR_IF | op::CALL | op::RETURN_CALL | op::LOCAL_GET | op::LOCAL_SET
            | op::LOCAL_TEE | op::GLOBAL_GET | op::GLOBAL_SET | op::EXT_OP_GLOBAL_GET_64
            | op::EXT_OP_GLOBAL_SET_64 | op::EXT_OP_GLOBAL_SET_AUX_STACK => {
                r.read_leb_u32()?;
            }
            op::BR_TABLE => {
                let count = r.read_leb_u32()?;
                for _ in 0..=count {
                    r.read_leb_u32()?;
                }
            }
            op::EXT_OP_BR_TABLE_CACHE => {
                // Padded depth bytes decode as nops afterwards.
                r.read_leb_u32()?;
            }
            op::CALL_INDIRECT | op::RETURN_CALL_INDIRECT => {
                r.read_leb_u32()?;
                r.read_leb_u32()?;
            }
            op::SELECT_T => {
                r.read_leb_u32()?;
                r.read_u8()?;
            }
            op::MEMORY_SIZE | op::MEMORY_GROW => {
                r.read_u8()?;
            }
            op::I32_LOAD..=op::I64_STORE32 => {
                r.read_leb_u32()?;
                r.read_leb_mem_offset(is_memory64)?;
            }
            op::I32_CONST => {
                r.read_leb_i32()?;
            }
            op::I64_CONST => {
                r.read_leb_i64()?;
            }
            op::F32_CONST => {
                r.read_bytes(4)?;
            }
            op::F64_CONST => {
                r.read_bytes(8)?;
            }
            op::PREFIX_MISC => {
                let subop = r.read_leb_u32()?;
                match subop {
                    op::MISC_MEMORY_INIT => {
                        r.read_leb_u32()?;
                        r.read_u8()?;
                    }
                    op::MISC_DATA_DROP => {
                        r.read_leb_u32()?;
                    }
                    op::MISC_MEMORY_COPY => {
                        r.read_u8()?;
                        r.read_u8()?;
                    }
                    op::MISC_MEMORY_FILL => {
                        r.read_u8()?;
                    }
                    _ => {}
                }
            }
            op::PREFIX_SIMD => {
                let subop = r.read_leb_u32()?;
                match subop {
                    op::SIMD_V128_LOAD | op::SIMD_V128_STORE => {
                        r.read_leb_u32()?;
                        r.read_leb_mem_offset(is_memory64)?;
                    }
                    op::SIMD_V128_CONST => {
                        r.read_bytes(16)?;
                    }
                    op::SIMD_I8X16_EXTRACT_LANE_S..=op::SIMD_F64X2_REPLACE_LANE => {
                        r.read_u8()?;
                    }
                    _ => {}
                }
            }
            op::PREFIX_ATOMIC => {
                let subop = r.read_leb_u32()?;
                if subop == op::ATOMIC_FENCE {
                    r.read_u8()?;
                } else {
                    r.read_leb_u32()?;
                    r.read_leb_mem_offset(is_memory64)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ── globals ──

    pub(super) fn global_name(&self, idx: u32) -> String {
        let import_count = self.wasm.import_globals.len() as u32;
        if idx < import_count {
            format!("wasm_import_global#{idx}")
        } else {
            format!("wasm_global#{}", idx - import_count)
        }
    }

    /// Find a reloc.CODE entry covering the immediate at `code_pos`.
    fn memory_addr_reloc_at(&self, code_pos: usize) -> bool {
        use crate::module::RelocKind as K;
        let target = self.code_section_rel(code_pos);
        self.wasm.code_relocs.iter().any(|rel| {
            rel.offset == target
                && matches!(
                    rel.kind,
                    K::R_WASM_MEMORY_ADDR_LEB
                        | K::R_WASM_MEMORY_ADDR_SLEB
                        | K::R_WASM_MEMORY_ADDR_LEB64
                        | K::R_WASM_MEMORY_ADDR_SLEB64
                )
        })
    }

    fn emit_global_get(&mut self, idx: u32, opcode_pos: usize) -> Result<()> {
        let (ty, _) = self
            .wasm
            .global_type(idx)
            .ok_or_else(|| Error::Internal("unknown global".into()))?;
        let global = self.named_global(&self.global_name(idx))?;
        let mut value =
            self.cc.builder.build_load(self.cc.llvm_type(ty), global.as_pointer_value(), "global")?;

        // In no-sandbox mode a relocated global holds a linear-memory
        // offset that must read back as a native pointer.
        if self.cc.options.no_sandbox_mode && self.memory_addr_reloc_at(opcode_pos + 1) {
            let mem_base = self.load_memory_base()?;
            let base_int =
                self.cc.builder.build_ptr_to_int(mem_base, self.cc.i64t(), "mem_base_int")?;
            let off = value.into_int_value();
            let off64 = if off.get_type() == self.cc.i64t() {
                off
            } else {
                self.cc.builder.build_int_z_extend(off, self.cc.i64t(), "gext")?
            };
            let addr = self.cc.builder.build_int_add(base_int, off64, "stack_pointer")?;
            value = if ty == ValType::I32 {
                self.cc.builder.build_int_truncate(addr, self.cc.i32t(), "gtrunc")?.into()
            } else {
                addr.into()
            };
        }

        self.push(value);
        Ok(())
    }

    fn emit_global_set(&mut self, idx: u32, opcode_pos: usize, is_aux_stack: bool) -> Result<()> {
        let (ty, _) = self
            .wasm
            .global_type(idx)
            .ok_or_else(|| Error::Internal("unknown global".into()))?;
        let global = self.named_global(&self.global_name(idx))?;
        let mut value = self.pop()?;

        if is_aux_stack && self.cc.options.enable_aux_stack_check {
            self.emit_aux_stack_check(value.into_int_value())?;
        }

        if self.cc.options.no_sandbox_mode && self.memory_addr_reloc_at(opcode_pos + 1) {
            let mem_base = self.load_memory_base()?;
            let base_int =
                self.cc.builder.build_ptr_to_int(mem_base, self.cc.i64t(), "mem_base_int")?;
            let v = value.into_int_value();
            let v64 = if v.get_type() == self.cc.i64t() {
                v
            } else {
                self.cc.builder.build_int_z_extend(v, self.cc.i64t(), "sext")?
            };
            let off = self.cc.builder.build_int_sub(v64, base_int, "stack_pointer")?;
            value = if ty == ValType::I32 {
                self.cc.builder.build_int_truncate(off, self.cc.i32t(), "strunc")?.into()
            } else {
                off.into()
            };
        }

        self.cc.builder.build_store(global.as_pointer_value(), value)?;
        Ok(())
    }

    /// Overflow/underflow guards on stores to the auxiliary stack-pointer
    /// global.
    fn emit_aux_stack_check(&mut self, new_sp: IntValue<'ctx>) -> Result<()> {
        use crate::trap::ExceptionId;
        let Some(stack_top) = self.wasm.aux.stack_top else {
            return Ok(());
        };
        let stack_size = u64::from(self.wasm.aux.stack_size);
        let bound = stack_top.saturating_sub(stack_size);
        let i32t = self.cc.i32t();

        let overflow = self.cc.builder.build_int_compare(
            inkwell::IntPredicate::ULT,
            new_sp,
            i32t.const_int(bound, false),
            "aux_overflow",
        )?;
        self.raise_exception(ExceptionId::AuxStackOverflow, Some(overflow))?;

        let underflow = self.cc.builder.build_int_compare(
            inkwell::IntPredicate::UGT,
            new_sp,
            i32t.const_int(stack_top, false),
            "aux_underflow",
        )?;
        self.raise_exception(ExceptionId::AuxStackUnderflow, Some(underflow))?;
        Ok(())
    }
}
