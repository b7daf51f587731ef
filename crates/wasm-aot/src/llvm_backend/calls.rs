//! Call emission: direct calls, calls through unresolved imports, tail
//! calls, and `call_indirect` with its full check chain.

use inkwell::types::{BasicMetadataTypeEnum, FunctionType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FunctionValue, PointerValue};
use inkwell::IntPredicate;

use crate::module::FuncType;
use crate::trap::ExceptionId;
use crate::{Error, Result};

use super::context::CompContext;
use super::emitter::FuncEmitter;

impl<'ctx, 'm> CompContext<'ctx, 'm> {
    /// LLVM signature for a wasm function type: the first result is
    /// returned by value, the remaining results go through trailing
    /// out-pointer parameters.
    pub fn wasm_fn_type(&self, func_type: &FuncType) -> FunctionType<'ctx> {
        let mut params: Vec<BasicMetadataTypeEnum<'ctx>> = func_type
            .params
            .iter()
            .map(|&t| self.llvm_type(t).into())
            .collect();
        for _ in func_type.results.iter().skip(1) {
            params.push(self.ptrt().into());
        }
        match func_type.results.first() {
            Some(&ty) => self.llvm_type(ty).fn_type(&params, false),
            None => self.context.void_type().fn_type(&params, false),
        }
    }
}

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    pub(super) fn declare_libc_fn(
        &self,
        name: &str,
        fn_type: FunctionType<'ctx>,
    ) -> FunctionValue<'ctx> {
        self.cc
            .module
            .get_function(name)
            .unwrap_or_else(|| self.cc.module.add_function(name, fn_type, None))
    }

    /// Pop call arguments (in reverse), append allocas for any extra
    /// results, and return `(args, result_allocas)`.
    fn build_call_args(
        &mut self,
        func_type: &FuncType,
    ) -> Result<(Vec<BasicMetadataValueEnum<'ctx>>, Vec<PointerValue<'ctx>>)> {
        let mut args: Vec<BasicMetadataValueEnum<'ctx>> =
            Vec::with_capacity(func_type.params.len() + func_type.results.len());
        for _ in 0..func_type.params.len() {
            args.push(self.pop()?.into());
        }
        args.reverse();

        let mut result_slots = Vec::new();
        for &ty in func_type.results.iter().skip(1) {
            let slot = self.cc.builder.build_alloca(self.cc.llvm_type(ty), "call_result")?;
            args.push(slot.into());
            result_slots.push(slot);
        }
        Ok((args, result_slots))
    }

    fn push_call_results(
        &mut self,
        func_type: &FuncType,
        ret: Option<BasicValueEnum<'ctx>>,
        result_slots: &[PointerValue<'ctx>],
    ) -> Result<()> {
        if let Some(ret) = ret {
            self.push(ret);
        }
        for (&ty, &slot) in func_type.results.iter().skip(1).zip(result_slots) {
            let value = self.cc.builder.build_load(self.cc.llvm_type(ty), slot, "call_result")?;
            self.push(value);
        }
        Ok(())
    }

    /// After a `return_call`, hand the callee's results straight back.
    fn emit_tail_return(&mut self, func_type: &FuncType) -> Result<()> {
        let result_count = func_type.results.len();
        let mut values = Vec::with_capacity(result_count);
        for _ in 0..result_count {
            values.push(self.pop()?);
        }
        values.reverse();
        for (i, value) in values.iter().enumerate().skip(1) {
            if let Some(param) = self
                .fn_val
                .get_nth_param((self.wasm_param_count + i - 1) as u32)
            {
                self.cc.builder.build_store(param.into_pointer_value(), *value)?;
            }
        }
        match values.first() {
            Some(v) => self.cc.builder.build_return(Some(v))?,
            None => self.cc.builder.build_return(None)?,
        };
        self.unreachable = true;
        Ok(())
    }

    pub(super) fn emit_call(&mut self, func_idx: u32, is_tail: bool) -> Result<()> {
        let func_type = self
            .wasm
            .func_type(func_idx)
            .cloned()
            .ok_or_else(|| Error::Internal("unknown function".into()))?;
        let (args, result_slots) = self.build_call_args(&func_type)?;

        let ret = if let Some(Some(callee)) = self.cc.func_values.get(func_idx as usize) {
            self.cc
                .builder
                .build_call(*callee, &args, "call")?
                .try_as_basic_value()
                .left()
        } else if (func_idx as usize) < self.wasm.import_funcs.len() {
            // Unresolved import: go through the func_ptrs slot so the
            // runtime null check reports the unlinked function.
            let fn_ptr = self.load_func_ptr_entry(self.cc.i32t().const_int(u64::from(func_idx), false))?;
            let is_null = self.cc.builder.build_is_null(fn_ptr, "import_null")?;
            self.raise_exception(ExceptionId::CallUnlinkedImportFunc, Some(is_null))?;
            let fn_type = self.cc.wasm_fn_type(&func_type);
            self.cc
                .builder
                .build_indirect_call(fn_type, fn_ptr, &args, "call_import")?
                .try_as_basic_value()
                .left()
        } else {
            return Err(Error::Internal(format!("missing function value {func_idx}")));
        };

        self.push_call_results(&func_type, ret, &result_slots)?;
        if is_tail {
            self.emit_tail_return(&func_type)?;
        }
        Ok(())
    }

    fn load_func_ptr_entry(
        &mut self,
        index: inkwell::values::IntValue<'ctx>,
    ) -> Result<PointerValue<'ctx>> {
        let func_ptrs = self.named_global("func_ptrs")?;
        let slot = self.array_elem_ptr(func_ptrs.as_pointer_value(), index, self.cc.ptr_size)?;
        Ok(self
            .cc
            .builder
            .build_load(self.cc.ptrt(), slot, "func_ptr")?
            .into_pointer_value())
    }

    /// `call_indirect`: element-index bound check, null-entry check, type
    /// check, unlinked check, then an indirect call through `func_ptrs`.
    pub(super) fn emit_call_indirect(&mut self, type_idx: u32, is_tail: bool) -> Result<()> {
        let func_type = self
            .wasm
            .types
            .get(type_idx as usize)
            .cloned()
            .ok_or_else(|| Error::Internal("unknown type".into()))?;
        let table = self
            .wasm
            .table()
            .ok_or_else(|| Error::Internal("unknown table".into()))?;
        let i32t = self.cc.i32t();

        let elem_idx = self.pop_int()?;
        let elem_idx32 = if elem_idx.get_type() == self.cc.i64t() {
            self.cc.builder.build_int_truncate(elem_idx, i32t, "elem_idx32")?
        } else {
            elem_idx
        };

        let table_size = i32t.const_int(u64::from(table.init_size), false);
        let oob = self.cc.builder.build_int_compare(
            IntPredicate::UGE,
            elem_idx32,
            table_size,
            "elem_oob",
        )?;
        self.raise_exception(ExceptionId::UndefinedElement, Some(oob))?;

        let table_elems = self.named_global("table_elems")?;
        let elem_ptr = self.array_elem_ptr(table_elems.as_pointer_value(), elem_idx32, 4)?;
        let func_idx = self
            .cc
            .builder
            .build_load(i32t, elem_ptr, "table_elem")?
            .into_int_value();
        let uninit = self.cc.builder.build_int_compare(
            IntPredicate::EQ,
            func_idx,
            i32t.const_all_ones(),
            "elem_uninit",
        )?;
        self.raise_exception(ExceptionId::UninitializedElement, Some(uninit))?;

        let type_indexes = self.named_global("func_type_indexes")?;
        let type_ptr = self.array_elem_ptr(type_indexes.as_pointer_value(), func_idx, 4)?;
        let actual_type = self
            .cc
            .builder
            .build_load(i32t, type_ptr, "func_type_idx")?
            .into_int_value();
        // Compare against the canonical (deduplicated) type index, the
        // same index space func_type_indexes is built from.
        let canonical_idx = self
            .wasm
            .types
            .iter()
            .position(|t| std::rc::Rc::ptr_eq(t, &func_type))
            .unwrap_or(type_idx as usize);
        let expected = i32t.const_int(canonical_idx as u64, false);
        let type_mismatch = self.cc.builder.build_int_compare(
            IntPredicate::NE,
            actual_type,
            expected,
            "type_mismatch",
        )?;
        self.raise_exception(ExceptionId::InvalidFunctionTypeIndex, Some(type_mismatch))?;

        let fn_ptr = self.load_func_ptr_entry(func_idx)?;
        let is_null = self.cc.builder.build_is_null(fn_ptr, "fn_null")?;
        self.raise_exception(ExceptionId::CallUnlinkedImportFunc, Some(is_null))?;

        let (args, result_slots) = self.build_call_args(&func_type)?;
        let fn_type = self.cc.wasm_fn_type(&func_type);
        let ret = self
            .cc
            .builder
            .build_indirect_call(fn_type, fn_ptr, &args, "call_indirect")?
            .try_as_basic_value()
            .left();
        self.push_call_results(&func_type, ret, &result_slots)?;
        if is_tail {
            self.emit_tail_return(&func_type)?;
        }
        Ok(())
    }
}
