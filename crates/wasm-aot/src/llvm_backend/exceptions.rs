//! Exception raising: a single lazily created `got_exception` block per
//! function with an id phi, a store to the `exception_id` global, and a
//! zero-valued return.

use inkwell::values::IntValue;

use crate::trap::ExceptionId;
use crate::Result;

use super::emitter::FuncEmitter;

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    /// Raise `id`. With `cond` the raise is conditional: the true edge
    /// goes to the exception block and emission continues on the false
    /// edge. Without it the current block is terminated.
    pub(super) fn raise_exception(
        &mut self,
        id: ExceptionId,
        cond: Option<IntValue<'ctx>>,
    ) -> Result<()> {
        let current = self.current_block();

        if self.exce_block.is_none() {
            let exce_bb = self.append_block("got_exception");
            self.cc.builder.position_at_end(exce_bb);
            let phi = self.cc.builder.build_phi(self.cc.i32t(), "exception_id_phi")?;
            let exce_global = self.named_global("exception_id")?;
            self.cc
                .builder
                .build_store(exce_global.as_pointer_value(), phi.as_basic_value())?;
            self.build_zero_return()?;
            self.cc.builder.position_at_end(current);
            self.exce_block = Some(exce_bb);
            self.exce_phi = Some(phi);
        }

        let exce_bb = self.exce_block.unwrap_or_else(|| unreachable!());
        let phi = self.exce_phi.unwrap_or_else(|| unreachable!());
        let id_const = self.cc.i32t().const_int(id as i32 as u32 as u64, true);
        phi.add_incoming(&[(&id_const, current)]);

        match cond {
            None => {
                self.cc.builder.build_unconditional_branch(exce_bb)?;
            }
            Some(cond) => {
                let ok_bb = self.append_block("no_exception");
                self.cc.builder.build_conditional_branch(cond, exce_bb, ok_bb)?;
                self.cc.builder.position_at_end(ok_bb);
            }
        }
        Ok(())
    }

    /// Return a zero value of the function's result type (zero also goes
    /// through any multi-value out-pointers).
    pub(super) fn build_zero_return(&self) -> Result<()> {
        let results = &self.func.func_type.results;
        for (i, &ty) in results.iter().enumerate().skip(1) {
            if let Some(param) = self
                .fn_val
                .get_nth_param((self.wasm_param_count + i - 1) as u32)
            {
                let zero = Self::zero_value(self.cc.llvm_type(ty));
                self.cc.builder.build_store(param.into_pointer_value(), zero)?;
            }
        }
        match results.first() {
            Some(&ty) => {
                let zero = Self::zero_value(self.cc.llvm_type(ty));
                self.cc.builder.build_return(Some(&zero))?;
            }
            None => {
                self.cc.builder.build_return(None)?;
            }
        }
        Ok(())
    }
}
