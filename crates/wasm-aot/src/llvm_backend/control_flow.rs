//! Control-flow frames and branch emission: blocks, loops, ifs, and the
//! br family, with phi plumbing for block parameters and (multi-value)
//! results.

use inkwell::basic_block::BasicBlock;
use inkwell::values::{BasicValueEnum, PhiValue};

use crate::module::ValType;
use crate::reader::Reader;
use crate::validator::BlockType;
use crate::{Error, Result};

use super::emitter::FuncEmitter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Function,
    Block,
    Loop,
    If,
}

pub struct Frame<'ctx> {
    pub kind: FrameKind,
    pub param_types: Vec<ValType>,
    pub result_types: Vec<ValType>,
    pub merge_bb: BasicBlock<'ctx>,
    /// Loop frames only: the back-edge target with one phi per parameter.
    pub header_bb: Option<BasicBlock<'ctx>>,
    pub param_phis: Vec<PhiValue<'ctx>>,
    pub result_phis: Vec<PhiValue<'ctx>>,
    pub else_bb: Option<BasicBlock<'ctx>>,
    pub else_seen: bool,
    /// Block-entry parameter values, replayed at the start of an else arm.
    pub saved_params: Vec<BasicValueEnum<'ctx>>,
    pub stack_depth: usize,
    /// Whether any branch actually targets `merge_bb`; a merge without
    /// predecessors is finished with `unreachable` and its phis dropped.
    pub merge_reached: bool,
    /// Frame opened inside dead code: no blocks were created for it.
    pub dead: bool,
}

impl<'ctx> Frame<'ctx> {
    /// The target of a `br` to this frame: the loop header, or the merge
    /// block for everything else.
    pub fn br_target(&self) -> BasicBlock<'ctx> {
        self.header_bb.unwrap_or(self.merge_bb)
    }

    /// Branch arity: a loop label takes its parameters, other labels their
    /// results.
    pub fn br_arity(&self) -> &[ValType] {
        if self.kind == FrameKind::Loop { &self.param_types } else { &self.result_types }
    }

    pub fn br_phis(&self) -> &[PhiValue<'ctx>] {
        if self.kind == FrameKind::Loop { &self.param_phis } else { &self.result_phis }
    }
}

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    pub(super) fn push_dead_frame(&mut self, kind: FrameKind) {
        let bb = self.current_block();
        self.frames.push(Frame {
            kind,
            param_types: Vec::new(),
            result_types: Vec::new(),
            merge_bb: bb,
            header_bb: None,
            param_phis: Vec::new(),
            result_phis: Vec::new(),
            else_bb: None,
            else_seen: false,
            saved_params: Vec::new(),
            stack_depth: self.stack.len(),
            merge_reached: false,
            dead: true,
        });
    }

    fn make_result_phis(
        &self,
        merge_bb: BasicBlock<'ctx>,
        result_types: &[ValType],
    ) -> Result<Vec<PhiValue<'ctx>>> {
        let current = self.current_block();
        self.cc.builder.position_at_end(merge_bb);
        let mut phis = Vec::with_capacity(result_types.len());
        for (i, &ty) in result_types.iter().enumerate() {
            let phi = self
                .cc
                .builder
                .build_phi(self.cc.llvm_type(ty), &format!("block_result{i}"))?;
            phis.push(phi);
        }
        self.cc.builder.position_at_end(current);
        Ok(phis)
    }

    pub(super) fn emit_block(&mut self, block_type: &BlockType) -> Result<()> {
        let params = block_type.params().to_vec();
        let results = block_type.results().to_vec();
        let merge_bb = self.append_block("block_merge");
        let result_phis = self.make_result_phis(merge_bb, &results)?;

        let mut saved_params = Vec::with_capacity(params.len());
        for _ in &params {
            saved_params.push(self.pop()?);
        }
        saved_params.reverse();
        let stack_depth = self.stack.len();
        for &v in &saved_params {
            self.push(v);
        }

        self.frames.push(Frame {
            kind: FrameKind::Block,
            param_types: params,
            result_types: results,
            merge_bb,
            header_bb: None,
            param_phis: Vec::new(),
            result_phis,
            else_bb: None,
            else_seen: false,
            saved_params,
            stack_depth,
            merge_reached: false,
            dead: false,
        });
        Ok(())
    }

    pub(super) fn emit_loop(&mut self, block_type: &BlockType) -> Result<()> {
        let params = block_type.params().to_vec();
        let results = block_type.results().to_vec();
        let header_bb = self.append_block("loop_header");
        let merge_bb = self.append_block("loop_merge");
        let result_phis = self.make_result_phis(merge_bb, &results)?;

        // Pop the initial parameter values and feed them into the header
        // phis; inside the loop the parameters *are* the phis.
        let mut init_params = Vec::with_capacity(params.len());
        for _ in &params {
            init_params.push(self.pop()?);
        }
        init_params.reverse();
        let stack_depth = self.stack.len();

        let entry_bb = self.current_block();
        self.cc.builder.build_unconditional_branch(header_bb)?;
        self.cc.builder.position_at_end(header_bb);
        let mut param_phis = Vec::with_capacity(params.len());
        for (i, &ty) in params.iter().enumerate() {
            let phi = self
                .cc
                .builder
                .build_phi(self.cc.llvm_type(ty), &format!("loop_param{i}"))?;
            phi.add_incoming(&[(&init_params[i], entry_bb)]);
            param_phis.push(phi);
        }
        for phi in &param_phis {
            self.push(phi.as_basic_value());
        }

        self.frames.push(Frame {
            kind: FrameKind::Loop,
            param_types: params,
            result_types: results,
            merge_bb,
            header_bb: Some(header_bb),
            param_phis,
            result_phis,
            else_bb: None,
            else_seen: false,
            saved_params: Vec::new(),
            stack_depth,
            merge_reached: false,
            dead: false,
        });
        Ok(())
    }

    pub(super) fn emit_if(&mut self, block_type: &BlockType) -> Result<()> {
        let params = block_type.params().to_vec();
        let results = block_type.results().to_vec();

        let cond = self.pop()?.into_int_value();
        let cond_bool = self.cc.builder.build_int_compare(
            inkwell::IntPredicate::NE,
            cond,
            cond.get_type().const_zero(),
            "if_test",
        )?;

        let then_bb = self.append_block("if_then");
        let else_bb = self.append_block("if_else");
        let merge_bb = self.append_block("if_merge");
        let result_phis = self.make_result_phis(merge_bb, &results)?;

        let mut saved_params = Vec::with_capacity(params.len());
        for _ in &params {
            saved_params.push(self.pop()?);
        }
        saved_params.reverse();
        let stack_depth = self.stack.len();

        self.cc.builder.build_conditional_branch(cond_bool, then_bb, else_bb)?;
        self.cc.builder.position_at_end(then_bb);
        for &v in &saved_params {
            self.push(v);
        }

        self.frames.push(Frame {
            kind: FrameKind::If,
            param_types: params,
            result_types: results,
            merge_bb,
            header_bb: None,
            param_phis: Vec::new(),
            result_phis,
            else_bb: Some(else_bb),
            else_seen: false,
            saved_params,
            stack_depth,
            merge_reached: false,
            dead: false,
        });
        Ok(())
    }

    pub(super) fn emit_else(&mut self) -> Result<()> {
        let frame_idx = self
            .frames
            .len()
            .checked_sub(1)
            .ok_or_else(|| Error::Internal("else without frame".into()))?;
        if self.frames[frame_idx].dead {
            // The whole if (and so its else arm) sits in dead code.
            return Ok(());
        }

        // Close the then arm.
        if !self.unreachable {
            let result_count = self.frames[frame_idx].result_phis.len();
            let mut values = Vec::with_capacity(result_count);
            for _ in 0..result_count {
                values.push(self.pop()?);
            }
            values.reverse();
            let current = self.current_block();
            let frame = &mut self.frames[frame_idx];
            for (phi, value) in frame.result_phis.iter().zip(&values) {
                phi.add_incoming(&[(value, current)]);
            }
            frame.merge_reached = true;
            self.cc.builder.build_unconditional_branch(frame.merge_bb)?;
        }

        let frame = &mut self.frames[frame_idx];
        frame.else_seen = true;
        let else_bb = frame
            .else_bb
            .ok_or_else(|| Error::Internal("else without else block".into()))?;
        let depth = frame.stack_depth;
        let params = frame.saved_params.clone();
        self.cc.builder.position_at_end(else_bb);
        self.stack.truncate(depth);
        for v in params {
            self.push(v);
        }
        self.unreachable = false;
        Ok(())
    }

    pub(super) fn emit_end(&mut self) -> Result<()> {
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| Error::Internal("end without frame".into()))?;
        if frame.dead {
            return Ok(());
        }

        // Fallthrough edge into the merge block.
        if !self.unreachable {
            let mut values = Vec::with_capacity(frame.result_phis.len());
            for _ in 0..frame.result_phis.len() {
                values.push(self.pop()?);
            }
            values.reverse();
            let current = self.current_block();
            for (phi, value) in frame.result_phis.iter().zip(&values) {
                phi.add_incoming(&[(value, current)]);
            }
            frame.merge_reached = true;
            self.cc.builder.build_unconditional_branch(frame.merge_bb)?;
        }

        // An if without an else: the false edge flows straight through,
        // carrying the block parameters (which equal the results).
        if frame.kind == FrameKind::If && !frame.else_seen {
            if let Some(else_bb) = frame.else_bb {
                self.cc.builder.position_at_end(else_bb);
                for (phi, value) in frame.result_phis.iter().zip(&frame.saved_params) {
                    phi.add_incoming(&[(value, else_bb)]);
                }
                frame.merge_reached = true;
                self.cc.builder.build_unconditional_branch(frame.merge_bb)?;
            }
        }

        self.cc.builder.position_at_end(frame.merge_bb);
        self.stack.truncate(frame.stack_depth);

        if frame.merge_reached {
            for phi in &frame.result_phis {
                self.push(phi.as_basic_value());
            }
            self.unreachable = false;
        } else {
            // No predecessor ever reaches this merge: drop the phis and
            // seal the block. Anything the parent pops from here is dead.
            for phi in &frame.result_phis {
                phi.as_instruction().erase_from_basic_block();
            }
            self.cc.builder.build_unreachable()?;
            for &ty in &frame.result_types.clone() {
                let undef = Self::undef_value(self.cc.llvm_type(ty));
                self.push(undef);
            }
            self.unreachable = true;
        }

        if frame.kind == FrameKind::Function {
            self.finish_function_return(&frame)?;
        }
        Ok(())
    }

    /// Emit the actual `ret` in the function's merge block: the first
    /// result by value, the rest through the trailing out-pointer params.
    fn finish_function_return(&mut self, frame: &Frame<'ctx>) -> Result<()> {
        if !frame.merge_reached {
            return Ok(());
        }
        let results: Vec<BasicValueEnum<'ctx>> =
            frame.result_phis.iter().map(|p| p.as_basic_value()).collect();
        for (i, value) in results.iter().enumerate().skip(1) {
            let out_ptr = self
                .fn_val
                .get_nth_param((self.wasm_param_count + i - 1) as u32)
                .ok_or_else(|| Error::Internal("missing result out-pointer".into()))?
                .into_pointer_value();
            self.cc.builder.build_store(out_ptr, *value)?;
        }
        match results.first() {
            Some(v) => self.cc.builder.build_return(Some(v))?,
            None => self.cc.builder.build_return(None)?,
        };
        Ok(())
    }

    /// Add phi incomings for a branch to `depth`, reading (without
    /// popping) the top arity values.
    fn add_branch_incomings(&mut self, depth: u32) -> Result<()> {
        let idx = self
            .frames
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| Error::Internal("branch depth out of range".into()))?;
        let arity = self.frames[idx].br_phis().len();
        if arity > self.stack.len() {
            return Err(Error::Internal("operand stack underflow".into()));
        }
        let values = self.stack[self.stack.len() - arity..].to_vec();
        let current = self.current_block();
        let frame = &mut self.frames[idx];
        for (phi, value) in frame.br_phis().iter().zip(&values) {
            phi.add_incoming(&[(value, current)]);
        }
        if frame.header_bb.is_none() {
            frame.merge_reached = true;
        }
        Ok(())
    }

    pub(super) fn emit_br(&mut self, depth: u32) -> Result<()> {
        self.add_branch_incomings(depth)?;
        let idx = self.frames.len() - 1 - depth as usize;
        let target = self.frames[idx].br_target();
        self.cc.builder.build_unconditional_branch(target)?;
        self.unreachable = true;
        Ok(())
    }

    pub(super) fn emit_br_if(&mut self, depth: u32) -> Result<()> {
        let cond = self.pop()?.into_int_value();
        let cond_bool = self.cc.builder.build_int_compare(
            inkwell::IntPredicate::NE,
            cond,
            cond.get_type().const_zero(),
            "brif_test",
        )?;
        self.add_branch_incomings(depth)?;
        let idx = self.frames.len() - 1 - depth as usize;
        let target = self.frames[idx].br_target();
        let cont_bb = self.append_block("brif_cont");
        self.cc.builder.build_conditional_branch(cond_bool, target, cont_bb)?;
        self.cc.builder.position_at_end(cont_bb);
        Ok(())
    }

    pub(super) fn emit_br_table(&mut self, depths: &[u32]) -> Result<()> {
        let index = self.pop()?.into_int_value();
        let (&default_depth, case_depths) = depths
            .split_last()
            .ok_or_else(|| Error::Internal("empty br_table".into()))?;

        for &d in depths {
            self.add_branch_incomings(d)?;
        }

        let default_bb =
            self.frames[self.frames.len() - 1 - default_depth as usize].br_target();
        let cases: Vec<_> = case_depths
            .iter()
            .enumerate()
            .map(|(i, &d)| {
                let case_val = index.get_type().const_int(i as u64, false);
                (case_val, self.frames[self.frames.len() - 1 - d as usize].br_target())
            })
            .collect();
        self.cc.builder.build_switch(index, default_bb, &cases)?;
        self.unreachable = true;
        Ok(())
    }

    pub(super) fn emit_return(&mut self) -> Result<()> {
        let depth = self.frames.len() as u32 - 1;
        self.emit_br(depth)
    }

    /// Read a `br_table` depth vector: either the rewritten cached form
    /// (count leb followed by nop padding) or the plain immediate list.
    pub(super) fn read_br_table_depths(
        &self,
        r: &mut Reader<'_>,
        opcode_pos: usize,
        cached: bool,
    ) -> Result<Vec<u32>> {
        let count = r.read_leb_u32()?;
        if cached {
            // The padded immediate bytes decode as nops; leave them for
            // the dead-code skipper.
            return self
                .func
                .br_table_cache
                .get(&opcode_pos)
                .cloned()
                .ok_or_else(|| Error::Internal("missing br_table cache entry".into()));
        }
        let mut depths = Vec::with_capacity(count as usize + 1);
        for _ in 0..=count {
            depths.push(r.read_leb_u32()?);
        }
        Ok(depths)
    }
}
