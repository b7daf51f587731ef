//! Linear-memory access emission: bound-checked loads and stores, atomic
//! variants, `memory.size`/`memory.grow`, and the bulk-memory family.

use inkwell::types::BasicTypeEnum;
use inkwell::values::{BasicValueEnum, IntValue, PointerValue};
use inkwell::{AtomicOrdering, AtomicRMWBinOp, IntPredicate};

use crate::opcode as op;
use crate::reader::Reader;
use crate::trap::ExceptionId;
use crate::{Error, Result};

use super::emitter::FuncEmitter;

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    pub(super) fn load_memory_base(&self) -> Result<PointerValue<'ctx>> {
        Ok(self
            .load_runtime_global("memory_data", self.cc.ptrt().into())?
            .into_pointer_value())
    }

    fn set_alignment_and_volatile(
        &self,
        value: BasicValueEnum<'ctx>,
        alignment: u32,
        volatile: bool,
    ) -> Result<()> {
        let inst = value
            .as_instruction_value()
            .ok_or_else(|| Error::Internal("expected an instruction value".into()))?;
        inst.set_alignment(alignment)
            .map_err(|e| Error::Llvm(e.to_string()))?;
        if volatile {
            inst.set_volatile(true).map_err(|e| Error::Llvm(e.to_string()))?;
        }
        Ok(())
    }

    fn store_alignment_and_volatile(
        &self,
        inst: inkwell::values::InstructionValue<'ctx>,
        alignment: u32,
        volatile: bool,
    ) -> Result<()> {
        inst.set_alignment(alignment)
            .map_err(|e| Error::Llvm(e.to_string()))?;
        if volatile {
            inst.set_volatile(true).map_err(|e| Error::Llvm(e.to_string()))?;
        }
        Ok(())
    }

    /// Pop the address operand and produce the native pointer for an
    /// access of `bytes` bytes at static `offset`, raising
    /// `OutOfBoundsMemoryAccess` in sandbox mode when
    /// `offset + addr > mem_bound_check_<bytes>bytes`.
    pub(super) fn emit_check_memory_access(
        &mut self,
        offset: u64,
        bytes: u32,
    ) -> Result<PointerValue<'ctx>> {
        let addr = self.pop_int()?;
        let i64t = self.cc.i64t();
        let addr64 = if addr.get_type() == i64t {
            addr
        } else {
            self.cc.builder.build_int_z_extend(addr, i64t, "addr64")?
        };
        let total = if offset == 0 {
            addr64
        } else {
            self.cc
                .builder
                .build_int_add(addr64, i64t.const_int(offset, false), "mem_offset")?
        };

        if self.cc.options.no_sandbox_mode {
            // Addresses are native pointers already.
            return Ok(self.cc.builder.build_int_to_ptr(total, self.cc.ptrt(), "maddr")?);
        }

        let bound = self
            .load_runtime_global(&format!("mem_bound_check_{}byte{}", bytes, if bytes == 1 { "" } else { "s" }), i64t.into())?
            .into_int_value();
        let out_of_bounds =
            self.cc
                .builder
                .build_int_compare(IntPredicate::UGT, total, bound, "cmp_oob")?;
        self.raise_exception(ExceptionId::OutOfBoundsMemoryAccess, Some(out_of_bounds))?;

        let mem_base = self.load_memory_base()?;
        let base_int = self.cc.builder.build_ptr_to_int(mem_base, i64t, "mem_base_int")?;
        let addr_int = self.cc.builder.build_int_add(base_int, total, "maddr_int")?;
        Ok(self.cc.builder.build_int_to_ptr(addr_int, self.cc.ptrt(), "maddr")?)
    }

    /// Plain loads/stores plus memory.size/grow (opcodes 0x28..=0x40).
    pub(super) fn emit_memory_op(&mut self, opcode: u8, r: &mut Reader<'_>) -> Result<()> {
        if matches!(opcode, op::MEMORY_SIZE | op::MEMORY_GROW) {
            r.read_u8()?;
            return if opcode == op::MEMORY_SIZE {
                self.emit_memory_size()
            } else {
                self.emit_memory_grow()
            };
        }

        let _align = r.read_leb_u32()?;
        let offset = r.read_leb_mem_offset(self.wasm.is_memory64())?;

        match opcode {
            op::I32_LOAD => self.emit_load(offset, 4, self.cc.i32t().into(), None),
            op::I64_LOAD => self.emit_load(offset, 8, self.cc.i64t().into(), None),
            op::F32_LOAD => self.emit_load(offset, 4, self.cc.f32t().into(), None),
            op::F64_LOAD => self.emit_load(offset, 8, self.cc.f64t().into(), None),
            op::I32_LOAD8_S => self.emit_load(offset, 1, self.cc.i32t().into(), Some(true)),
            op::I32_LOAD8_U => self.emit_load(offset, 1, self.cc.i32t().into(), Some(false)),
            op::I32_LOAD16_S => self.emit_load(offset, 2, self.cc.i32t().into(), Some(true)),
            op::I32_LOAD16_U => self.emit_load(offset, 2, self.cc.i32t().into(), Some(false)),
            op::I64_LOAD8_S => self.emit_load(offset, 1, self.cc.i64t().into(), Some(true)),
            op::I64_LOAD8_U => self.emit_load(offset, 1, self.cc.i64t().into(), Some(false)),
            op::I64_LOAD16_S => self.emit_load(offset, 2, self.cc.i64t().into(), Some(true)),
            op::I64_LOAD16_U => self.emit_load(offset, 2, self.cc.i64t().into(), Some(false)),
            op::I64_LOAD32_S => self.emit_load(offset, 4, self.cc.i64t().into(), Some(true)),
            op::I64_LOAD32_U => self.emit_load(offset, 4, self.cc.i64t().into(), Some(false)),
            op::I32_STORE => self.emit_store(offset, 4, false),
            op::I64_STORE => self.emit_store(offset, 8, false),
            op::F32_STORE => self.emit_store(offset, 4, false),
            op::F64_STORE => self.emit_store(offset, 8, false),
            op::I32_STORE8 | op::I64_STORE8 => self.emit_store(offset, 1, true),
            op::I32_STORE16 | op::I64_STORE16 => self.emit_store(offset, 2, true),
            op::I64_STORE32 => self.emit_store(offset, 4, true),
            _ => Err(Error::Unsupported(format!("memory opcode 0x{opcode:02x}"))),
        }
    }

    /// `narrow_sign`: `Some(sign)` for sub-width integer loads that widen
    /// into `result_ty`.
    fn emit_load(
        &mut self,
        offset: u64,
        bytes: u32,
        result_ty: BasicTypeEnum<'ctx>,
        narrow_sign: Option<bool>,
    ) -> Result<()> {
        let ptr = self.emit_check_memory_access(offset, bytes)?;
        let value = match narrow_sign {
            None => {
                let v = self.cc.builder.build_load(result_ty, ptr, "mload")?;
                self.set_alignment_and_volatile(v, 1, false)?;
                v
            }
            Some(sign) => {
                let narrow_ty = self.cc.context.custom_width_int_type(bytes * 8);
                let v = self.cc.builder.build_load(narrow_ty, ptr, "mload_narrow")?;
                self.set_alignment_and_volatile(v, 1, false)?;
                let narrow = v.into_int_value();
                let wide = if sign {
                    self.cc.builder.build_int_s_extend(
                        narrow,
                        result_ty.into_int_type(),
                        "mload_s",
                    )?
                } else {
                    self.cc.builder.build_int_z_extend(
                        narrow,
                        result_ty.into_int_type(),
                        "mload_u",
                    )?
                };
                wide.into()
            }
        };
        self.push(value);
        Ok(())
    }

    fn emit_store(&mut self, offset: u64, bytes: u32, narrow: bool) -> Result<()> {
        let value = self.pop()?;
        let ptr = self.emit_check_memory_access(offset, bytes)?;
        let store_value: BasicValueEnum<'ctx> = if narrow {
            let narrow_ty = self.cc.context.custom_width_int_type(bytes * 8);
            self.cc
                .builder
                .build_int_truncate(value.into_int_value(), narrow_ty, "mstore_narrow")?
                .into()
        } else {
            value
        };
        let inst = self.cc.builder.build_store(ptr, store_value)?;
        self.store_alignment_and_volatile(inst, 1, false)?;
        Ok(())
    }

    fn emit_memory_size(&mut self) -> Result<()> {
        let memory = self
            .wasm
            .memory()
            .ok_or_else(|| Error::Internal("no memory".into()))?;
        let value: IntValue<'ctx> = if self.cc.options.no_sandbox_mode {
            // Fixed-size memory; the page count is a compile-time constant.
            self.cc.i32t().const_int(memory.init_page_count, false)
        } else {
            self.load_runtime_global("cur_page_count", self.cc.i32t().into())?
                .into_int_value()
        };
        let value = if self.wasm.is_memory64() {
            self.cc.builder.build_int_z_extend(value, self.cc.i64t(), "size64")?
        } else {
            value
        };
        self.push(value.into());
        Ok(())
    }

    /// Grow via `realloc`, zero-fill the fresh pages, refresh every
    /// memory-derived global, and yield the previous page count; any
    /// failure yields −1 with nothing touched.
    fn emit_memory_grow(&mut self) -> Result<()> {
        let memory = *self
            .wasm
            .memory()
            .ok_or_else(|| Error::Internal("no memory".into()))?;
        let delta = self.pop_int()?;

        if self.cc.options.no_sandbox_mode {
            let minus_one = if self.wasm.is_memory64() {
                self.cc.i64t().const_all_ones()
            } else {
                self.cc.i32t().const_all_ones()
            };
            self.push(minus_one.into());
            return Ok(());
        }

        let b = &self.cc.builder;
        let i32t = self.cc.i32t();
        let i64t = self.cc.i64t();
        let page_size = u64::from(memory.num_bytes_per_page);

        let delta32 = if delta.get_type() == i64t {
            b.build_int_truncate(delta, i32t, "delta32")?
        } else {
            delta
        };
        let cur = self
            .load_runtime_global("cur_page_count", i32t.into())?
            .into_int_value();
        let max = self
            .load_runtime_global("max_page_count", i32t.into())?
            .into_int_value();

        let cur64 = b.build_int_z_extend(cur, i64t, "cur64")?;
        let delta64 = b.build_int_z_extend(delta32, i64t, "delta64")?;
        let total64 = b.build_int_add(cur64, delta64, "total64")?;
        let max64 = b.build_int_z_extend(max, i64t, "max64")?;

        let grow_bb = self.append_block("grow");
        let fail_bb = self.append_block("grow_fail");
        let done_bb = self.append_block("grow_done");

        let too_big = b.build_int_compare(IntPredicate::UGT, total64, max64, "grow_too_big")?;
        b.build_conditional_branch(too_big, fail_bb, grow_bb)?;

        // grow: realloc, zero the delta, refresh the globals.
        b.position_at_end(grow_bb);
        let old_size = b.build_int_mul(cur64, i64t.const_int(page_size, false), "old_size")?;
        let new_size = b.build_int_mul(total64, i64t.const_int(page_size, false), "new_size")?;
        let mem_base = self.load_memory_base()?;
        let realloc = self.declare_libc_fn(
            "realloc",
            self.cc.ptrt().fn_type(&[self.cc.ptrt().into(), self.cc.intptr().into()], false),
        );
        let new_size_arg = if self.cc.ptr_size == 4 {
            b.build_int_truncate(new_size, i32t, "new_size32")?.into()
        } else {
            new_size.into()
        };
        let new_ptr = b
            .build_call(realloc, &[mem_base.into(), new_size_arg], "realloc")?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| Error::Llvm("realloc returned void".into()))?
            .into_pointer_value();
        let is_null = b.build_is_null(new_ptr, "realloc_null")?;

        let zero_bb = self.append_block("grow_zero");
        b.build_conditional_branch(is_null, fail_bb, zero_bb)?;

        b.position_at_end(zero_bb);
        let new_int = b.build_ptr_to_int(new_ptr, i64t, "new_int")?;
        let fresh_int = b.build_int_add(new_int, old_size, "fresh_int")?;
        let fresh_ptr = b.build_int_to_ptr(fresh_int, self.cc.ptrt(), "fresh_ptr")?;
        let delta_bytes = b.build_int_sub(new_size, old_size, "delta_bytes")?;
        b.build_memset(fresh_ptr, 1, self.cc.i8t().const_zero(), delta_bytes)?;

        let total32 = b.build_int_truncate(total64, i32t, "total32")?;
        let store = |name: &str, value: BasicValueEnum<'ctx>| -> Result<()> {
            let global = self.named_global(name)?;
            self.cc.builder.build_store(global.as_pointer_value(), value)?;
            Ok(())
        };
        store("memory_data", new_ptr.into())?;
        store("memory_data_size", new_size.into())?;
        store("cur_page_count", total32.into())?;
        for bytes in [1u64, 2, 4, 8, 16] {
            let name = if bytes == 1 {
                "mem_bound_check_1byte".to_string()
            } else {
                format!("mem_bound_check_{bytes}bytes")
            };
            let bound = b.build_int_sub(new_size, i64t.const_int(bytes, false), "bound")?;
            store(&name, bound.into())?;
        }
        b.build_unconditional_branch(done_bb)?;
        let zero_end_bb = self.current_block();

        b.position_at_end(fail_bb);
        b.build_unconditional_branch(done_bb)?;

        b.position_at_end(done_bb);
        let result_phi = b.build_phi(i32t, "grow_result")?;
        let minus_one = i32t.const_all_ones();
        result_phi.add_incoming(&[(&cur, zero_end_bb), (&minus_one, fail_bb)]);
        let result = result_phi.as_basic_value().into_int_value();
        let result = if self.wasm.is_memory64() {
            b.build_int_z_extend(result, i64t, "grow64")?
        } else {
            result
        };
        self.push(result.into());
        Ok(())
    }

    /// Bound check for bulk-memory ops: trap when `offset + len` exceeds
    /// the current memory size, otherwise yield the native pointer.
    fn emit_check_bulk_memory(
        &mut self,
        offset: IntValue<'ctx>,
        len: IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        let b = &self.cc.builder;
        let i64t = self.cc.i64t();
        let off64 = if offset.get_type() == i64t {
            offset
        } else {
            b.build_int_z_extend(offset, i64t, "bulk_off")?
        };
        let len64 = if len.get_type() == i64t {
            len
        } else {
            b.build_int_z_extend(len, i64t, "bulk_len")?
        };

        if self.cc.options.no_sandbox_mode {
            return Ok(self.cc.builder.build_int_to_ptr(off64, self.cc.ptrt(), "bulk_ptr")?);
        }

        let end = b.build_int_add(off64, len64, "bulk_end")?;
        let size = self
            .load_runtime_global("memory_data_size", i64t.into())?
            .into_int_value();
        let oob = b.build_int_compare(IntPredicate::UGT, end, size, "bulk_oob")?;
        self.raise_exception(ExceptionId::OutOfBoundsMemoryAccess, Some(oob))?;

        let mem_base = self.load_memory_base()?;
        let base_int = self.cc.builder.build_ptr_to_int(mem_base, i64t, "bulk_base")?;
        let addr = self.cc.builder.build_int_add(base_int, off64, "bulk_addr")?;
        Ok(self.cc.builder.build_int_to_ptr(addr, self.cc.ptrt(), "bulk_ptr")?)
    }

    /// 0xFC-prefixed ops: saturating truncations and the bulk-memory
    /// family.
    pub(super) fn emit_misc_op(&mut self, subop: u32, r: &mut Reader<'_>) -> Result<()> {
        match subop {
            op::MISC_I32_TRUNC_SAT_F32_S..=op::MISC_I64_TRUNC_SAT_F64_U => {
                self.emit_trunc_sat(subop)
            }
            op::MISC_MEMORY_INIT => {
                let seg_idx = r.read_leb_u32()?;
                r.read_u8()?;
                self.emit_memory_init(seg_idx)
            }
            op::MISC_DATA_DROP => {
                let seg_idx = r.read_leb_u32()?;
                self.emit_data_drop(seg_idx)
            }
            op::MISC_MEMORY_COPY => {
                r.read_u8()?;
                r.read_u8()?;
                let len = self.pop_int()?;
                let src = self.pop_int()?;
                let dst = self.pop_int()?;
                let src_ptr = self.emit_check_bulk_memory(src, len)?;
                let dst_ptr = self.emit_check_bulk_memory(dst, len)?;
                let len64 = self.to_i64(len)?;
                self.cc.builder.build_memmove(dst_ptr, 1, src_ptr, 1, len64)?;
                Ok(())
            }
            op::MISC_MEMORY_FILL => {
                r.read_u8()?;
                let len = self.pop_int()?;
                let value = self.pop_int()?;
                let dst = self.pop_int()?;
                let dst_ptr = self.emit_check_bulk_memory(dst, len)?;
                let value8 =
                    self.cc.builder.build_int_truncate(value, self.cc.i8t(), "fill_val")?;
                let len64 = self.to_i64(len)?;
                self.cc.builder.build_memset(dst_ptr, 1, value8, len64)?;
                Ok(())
            }
            _ => Err(Error::Unsupported(format!("opcode 0xfc 0x{subop:02x}"))),
        }
    }

    pub(super) fn to_i64(&self, value: IntValue<'ctx>) -> Result<IntValue<'ctx>> {
        if value.get_type() == self.cc.i64t() {
            Ok(value)
        } else {
            Ok(self.cc.builder.build_int_z_extend(value, self.cc.i64t(), "to64")?)
        }
    }

    fn emit_memory_init(&mut self, seg_idx: u32) -> Result<()> {
        let b = &self.cc.builder;
        let i32t = self.cc.i32t();
        let i64t = self.cc.i64t();

        let len = self.pop_int()?;
        let src = self.pop_int()?;
        let dst = self.pop_int()?;

        // Source bounds against the passive segment's effective length
        // (dropped segments read as length 0).
        let lengths = self.named_global("data_seg_lengths_passive")?;
        let len_ptr = self.array_elem_ptr(
            lengths.as_pointer_value(),
            i32t.const_int(u64::from(seg_idx), false),
            4,
        )?;
        let seg_len = self.cc.builder.build_load(i32t, len_ptr, "seg_len")?.into_int_value();
        let src64 = self.to_i64(src)?;
        let len64 = self.to_i64(len)?;
        let seg_len64 = self.to_i64(seg_len)?;
        let src_end = b.build_int_add(src64, len64, "src_end")?;
        let src_oob = b.build_int_compare(IntPredicate::UGT, src_end, seg_len64, "src_oob")?;
        self.raise_exception(ExceptionId::OutOfBoundsMemoryAccess, Some(src_oob))?;

        let dst_ptr = self.emit_check_bulk_memory(dst, len)?;

        let segs = self.named_global("data_segs")?;
        let seg_ptr_ptr = self.array_elem_ptr(
            segs.as_pointer_value(),
            i32t.const_int(u64::from(seg_idx), false),
            self.cc.ptr_size,
        )?;
        let seg_base = self
            .cc
            .builder
            .build_load(self.cc.ptrt(), seg_ptr_ptr, "seg_base")?
            .into_pointer_value();
        let seg_int = self.cc.builder.build_ptr_to_int(seg_base, i64t, "seg_int")?;
        let src_addr = self.cc.builder.build_int_add(seg_int, src64, "src_addr")?;
        let src_ptr = self.cc.builder.build_int_to_ptr(src_addr, self.cc.ptrt(), "src_ptr")?;

        self.cc.builder.build_memcpy(dst_ptr, 1, src_ptr, 1, len64)?;
        Ok(())
    }

    fn emit_data_drop(&mut self, seg_idx: u32) -> Result<()> {
        let i32t = self.cc.i32t();
        let lengths = self.named_global("data_seg_lengths_passive")?;
        let len_ptr = self.array_elem_ptr(
            lengths.as_pointer_value(),
            i32t.const_int(u64::from(seg_idx), false),
            4,
        )?;
        self.cc.builder.build_store(len_ptr, i32t.const_zero())?;
        Ok(())
    }

    /// 0xFE-prefixed shared-memory atomics.
    pub(super) fn emit_atomic_op(&mut self, subop: u32, r: &mut Reader<'_>) -> Result<()> {
        if subop == op::ATOMIC_FENCE {
            r.read_u8()?;
            self.cc
                .builder
                .build_fence(AtomicOrdering::SequentiallyConsistent, 0, "fence")?;
            return Ok(());
        }

        let align = op::atomic_natural_align(subop)
            .ok_or_else(|| Error::Unsupported(format!("opcode 0xfe 0x{subop:02x}")))?;
        let _align_imm = r.read_leb_u32()?;
        let offset = r.read_leb_mem_offset(self.wasm.is_memory64())?;
        let bytes = 1u32 << align;

        // Pre-check: the effective address must be naturally aligned.
        // The address operand sits beneath any value operands, so the
        // check happens after the operands are popped, on the computed
        // pointer.
        match subop {
            op::ATOMIC_I32_LOAD | op::ATOMIC_I32_LOAD8_U | op::ATOMIC_I32_LOAD16_U => {
                self.emit_atomic_load(offset, bytes, align, self.cc.i32t().into())
            }
            op::ATOMIC_I64_LOAD | op::ATOMIC_I64_LOAD8_U | op::ATOMIC_I64_LOAD16_U
            | op::ATOMIC_I64_LOAD32_U => {
                self.emit_atomic_load(offset, bytes, align, self.cc.i64t().into())
            }
            op::ATOMIC_I32_STORE | op::ATOMIC_I32_STORE8 | op::ATOMIC_I32_STORE16
            | op::ATOMIC_I64_STORE | op::ATOMIC_I64_STORE8 | op::ATOMIC_I64_STORE16
            | op::ATOMIC_I64_STORE32 => self.emit_atomic_store(offset, bytes, align),
            op::ATOMIC_RMW_FIRST..=op::ATOMIC_RMW_LAST => {
                self.emit_atomic_rmw(subop, offset, bytes, align)
            }
            _ => Err(Error::Unsupported(format!("opcode 0xfe 0x{subop:02x}"))),
        }
    }

    fn emit_alignment_check(
        &mut self,
        ptr: PointerValue<'ctx>,
        align: u32,
    ) -> Result<()> {
        if align == 0 {
            return Ok(());
        }
        let i64t = self.cc.i64t();
        let addr = self.cc.builder.build_ptr_to_int(ptr, i64t, "align_addr")?;
        let mask = i64t.const_int(u64::from((1u32 << align) - 1), false);
        let low = self.cc.builder.build_and(addr, mask, "align_low")?;
        let unaligned = self.cc.builder.build_int_compare(
            IntPredicate::NE,
            low,
            i64t.const_zero(),
            "unaligned",
        )?;
        self.raise_exception(ExceptionId::UnalignedAtomic, Some(unaligned))
    }

    fn emit_atomic_load(
        &mut self,
        offset: u64,
        bytes: u32,
        align: u32,
        result_ty: BasicTypeEnum<'ctx>,
    ) -> Result<()> {
        let ptr = self.emit_check_memory_access(offset, bytes)?;
        self.emit_alignment_check(ptr, align)?;
        let load_ty = self.cc.context.custom_width_int_type(bytes * 8);
        let v = self.cc.builder.build_load(load_ty, ptr, "aload")?;
        self.set_atomic_seqcst(v, bytes)?;
        let narrow = v.into_int_value();
        let wide = if load_ty == result_ty.into_int_type() {
            narrow
        } else {
            self.cc
                .builder
                .build_int_z_extend(narrow, result_ty.into_int_type(), "aload_u")?
        };
        self.push(wide.into());
        Ok(())
    }

    fn set_atomic_seqcst(&self, value: BasicValueEnum<'ctx>, bytes: u32) -> Result<()> {
        let inst = value
            .as_instruction_value()
            .ok_or_else(|| Error::Internal("expected an instruction value".into()))?;
        inst.set_atomic_ordering(AtomicOrdering::SequentiallyConsistent)
            .map_err(|e| Error::Llvm(e.to_string()))?;
        inst.set_alignment(bytes).map_err(|e| Error::Llvm(e.to_string()))?;
        inst.set_volatile(true).map_err(|e| Error::Llvm(e.to_string()))?;
        Ok(())
    }

    fn emit_atomic_store(&mut self, offset: u64, bytes: u32, align: u32) -> Result<()> {
        let value = self.pop_int()?;
        let ptr = self.emit_check_memory_access(offset, bytes)?;
        self.emit_alignment_check(ptr, align)?;
        let store_ty = self.cc.context.custom_width_int_type(bytes * 8);
        let narrow = if value.get_type() == store_ty {
            value
        } else {
            self.cc.builder.build_int_truncate(value, store_ty, "astore_narrow")?
        };
        let inst = self.cc.builder.build_store(ptr, narrow)?;
        inst.set_atomic_ordering(AtomicOrdering::SequentiallyConsistent)
            .map_err(|e| Error::Llvm(e.to_string()))?;
        inst.set_alignment(bytes).map_err(|e| Error::Llvm(e.to_string()))?;
        inst.set_volatile(true).map_err(|e| Error::Llvm(e.to_string()))?;
        Ok(())
    }

    fn emit_atomic_rmw(&mut self, subop: u32, offset: u64, bytes: u32, align: u32) -> Result<()> {
        let rel = subop - op::ATOMIC_RMW_FIRST;
        let family = rel / 7;
        let is_cmpxchg = family == 6;
        let wide_ty = match rel % 7 {
            0 | 2 | 3 => self.cc.i32t(),
            _ => self.cc.i64t(),
        };
        let memory_ty = self.cc.context.custom_width_int_type(bytes * 8);

        let replacement = if is_cmpxchg { Some(self.pop_int()?) } else { None };
        let operand = self.pop_int()?;
        let ptr = self.emit_check_memory_access(offset, bytes)?;
        self.emit_alignment_check(ptr, align)?;

        let narrow = |v: IntValue<'ctx>| -> Result<IntValue<'ctx>> {
            if v.get_type() == memory_ty {
                Ok(v)
            } else {
                Ok(self.cc.builder.build_int_truncate(v, memory_ty, "rmw_narrow")?)
            }
        };

        let old = if let Some(replacement) = replacement {
            let expected = narrow(operand)?;
            let replacement = narrow(replacement)?;
            let pair = self
                .cc
                .builder
                .build_cmpxchg(
                    ptr,
                    expected,
                    replacement,
                    AtomicOrdering::SequentiallyConsistent,
                    AtomicOrdering::SequentiallyConsistent,
                )
                .map_err(|e| Error::Llvm(e.to_string()))?;
            self.cc
                .builder
                .build_extract_value(pair, 0, "cmpxchg_old")
                .map_err(|e| Error::Llvm(format!("{e:?}")))?
                .into_int_value()
        } else {
            let rmw_op = match family {
                0 => AtomicRMWBinOp::Add,
                1 => AtomicRMWBinOp::Sub,
                2 => AtomicRMWBinOp::And,
                3 => AtomicRMWBinOp::Or,
                4 => AtomicRMWBinOp::Xor,
                _ => AtomicRMWBinOp::Xchg,
            };
            let operand = narrow(operand)?;
            self.cc
                .builder
                .build_atomicrmw(rmw_op, ptr, operand, AtomicOrdering::SequentiallyConsistent)
                .map_err(|e| Error::Llvm(e.to_string()))?
        };

        let result = if old.get_type() == wide_ty {
            old
        } else {
            self.cc.builder.build_int_z_extend(old, wide_ty, "rmw_wide")?
        };
        self.push(result.into());
        Ok(())
    }
}
