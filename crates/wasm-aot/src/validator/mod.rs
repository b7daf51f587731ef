//! Single-pass function validation: an abstract interpretation over a
//! typed operand stack and a control-frame stack.
//!
//! Besides type checking, the pass computes each function's maximum
//! operand-stack depth (in 32-bit cells) and block nesting, and rewrites a
//! handful of opcodes in place so the emitter does not have to re-derive
//! what validation already knows: block types given as type indices, 64-bit
//! variants of the cell-polymorphic ops, stores to the auxiliary stack
//! pointer, and `br_table` depth vectors that do not fit in one byte.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::module::{FuncType, Module, ValType};
use crate::opcode as op;
use crate::reader::Reader;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelType {
    Function,
    Block,
    Loop,
    If,
}

#[derive(Clone)]
pub enum BlockType {
    Value(ValType),
    Type(Rc<FuncType>),
}

impl BlockType {
    #[must_use]
    pub fn params(&self) -> &[ValType] {
        match self {
            Self::Value(_) => &[],
            Self::Type(t) => &t.params,
        }
    }

    #[must_use]
    pub fn results(&self) -> &[ValType] {
        match self {
            Self::Value(ValType::Void) => &[],
            Self::Value(v) => std::slice::from_ref(v),
            Self::Type(t) => &t.results,
        }
    }
}

pub struct ControlFrame {
    pub label_type: LabelType,
    pub block_type: BlockType,
    pub start_pc: usize,
    pub else_pc: Option<usize>,
    stack_num_at_entry: usize,
    cell_num_at_entry: u32,
    pub is_polymorphic: bool,
}

/// Validate every function body in the module, filling in the per-function
/// stack/block maxima and the `br_table` depth caches.
pub fn validate_module(module: &mut Module<'_>) -> Result<()> {
    for func_idx in 0..module.functions.len() {
        let mut code = std::mem::take(&mut module.functions[func_idx].code);
        let mut v = FuncValidator::new(module, func_idx);
        let outcome = v.run(&mut code);
        let (max_cells, max_blocks, cache) = (v.max_stack_cell_num, v.max_block_num, v.br_table_cache);
        let func = &mut module.functions[func_idx];
        func.code = code;
        outcome?;
        func.max_stack_cell_num = max_cells as u16;
        func.max_block_num = max_blocks as u16;
        func.br_table_cache = cache;
    }
    Ok(())
}

struct FuncValidator<'m, 'a> {
    module: &'m Module<'a>,
    func_type: Rc<FuncType>,
    /// Parameter types followed by declared local types.
    locals: Vec<ValType>,
    stack: Vec<ValType>,
    stack_cell_num: u32,
    max_stack_cell_num: u32,
    ctrl: Vec<ControlFrame>,
    max_block_num: u32,
    br_table_cache: BTreeMap<usize, Vec<u32>>,
    is_memory64: bool,
}

// Immediate readers over the code buffer; the buffer itself stays mutable
// for the in-place opcode rewrites.
fn leb_u32(code: &[u8], pos: &mut usize) -> Result<u32> {
    let mut r = Reader::new(&code[*pos..]);
    let v = r.read_leb_u32()?;
    *pos += r.pos();
    Ok(v)
}

fn leb_i32(code: &[u8], pos: &mut usize) -> Result<i32> {
    let mut r = Reader::new(&code[*pos..]);
    let v = r.read_leb_i32()?;
    *pos += r.pos();
    Ok(v)
}

fn leb_i64(code: &[u8], pos: &mut usize) -> Result<i64> {
    let mut r = Reader::new(&code[*pos..]);
    let v = r.read_leb_i64()?;
    *pos += r.pos();
    Ok(v)
}

fn leb_mem_offset(code: &[u8], pos: &mut usize, is_memory64: bool) -> Result<u64> {
    let mut r = Reader::new(&code[*pos..]);
    let v = r.read_leb_mem_offset(is_memory64)?;
    *pos += r.pos();
    Ok(v)
}

fn read_byte(code: &[u8], pos: &mut usize) -> Result<u8> {
    let Some(&b) = code.get(*pos) else {
        return Err(Error::load("unexpected end of section or function"));
    };
    *pos += 1;
    Ok(b)
}

fn skip_bytes(code: &[u8], pos: &mut usize, n: usize) -> Result<()> {
    if *pos + n > code.len() {
        return Err(Error::load("unexpected end of section or function"));
    }
    *pos += n;
    Ok(())
}

impl<'m, 'a> FuncValidator<'m, 'a> {
    fn new(module: &'m Module<'a>, func_idx: usize) -> Self {
        let func = &module.functions[func_idx];
        let mut locals =
            Vec::with_capacity(func.func_type.params.len() + func.local_types.len());
        locals.extend_from_slice(&func.func_type.params);
        locals.extend_from_slice(&func.local_types);
        Self {
            func_type: Rc::clone(&func.func_type),
            locals,
            stack: Vec::new(),
            stack_cell_num: 0,
            max_stack_cell_num: 0,
            ctrl: Vec::new(),
            max_block_num: 0,
            br_table_cache: BTreeMap::new(),
            is_memory64: module.is_memory64(),
            module,
        }
    }

    // ── operand stack ──

    fn push(&mut self, ty: ValType) -> Result<()> {
        self.stack.push(ty);
        self.stack_cell_num += ty.cell_num();
        if self.stack_cell_num > u32::from(u16::MAX) {
            return Err(Error::load("operand stack depth limit exceeded"));
        }
        self.max_stack_cell_num = self.max_stack_cell_num.max(self.stack_cell_num);
        Ok(())
    }

    fn pop(&mut self, expected: ValType) -> Result<ValType> {
        let frame = self.ctrl.last().ok_or_else(|| Error::Internal("no frame".into()))?;
        if self.stack.len() == frame.stack_num_at_entry {
            if frame.is_polymorphic {
                // Anything can be popped from a polymorphic stack without
                // changing its apparent depth.
                return Ok(expected);
            }
            return Err(Error::load(format!(
                "type mismatch: expected {} but got nothing",
                expected.name()
            )));
        }
        let actual = self.stack.pop().unwrap_or(ValType::Any);
        self.stack_cell_num -= actual.cell_num();
        if actual != expected && actual != ValType::Any && expected != ValType::Any {
            return Err(Error::load(format!(
                "type mismatch: expected {} but got {}",
                expected.name(),
                actual.name()
            )));
        }
        Ok(actual)
    }

    fn set_polymorphic(&mut self) {
        let Some(frame) = self.ctrl.last_mut() else { return };
        frame.is_polymorphic = true;
        let (num, cells) = (frame.stack_num_at_entry, frame.cell_num_at_entry);
        self.stack.truncate(num);
        self.stack_cell_num = cells;
    }

    // ── control stack ──

    fn push_frame(&mut self, label_type: LabelType, block_type: BlockType, start_pc: usize) -> Result<()> {
        self.ctrl.push(ControlFrame {
            label_type,
            block_type,
            start_pc,
            else_pc: None,
            stack_num_at_entry: self.stack.len(),
            cell_num_at_entry: self.stack_cell_num,
            is_polymorphic: false,
        });
        if self.ctrl.len() > usize::from(u16::MAX) {
            return Err(Error::load("label stack depth limit exceeded"));
        }
        self.max_block_num = self.max_block_num.max(self.ctrl.len() as u32);
        Ok(())
    }

    /// Branch-target arity: a loop's label takes its parameters, any other
    /// label its results.
    fn branch_arity(&self, depth: u32) -> Result<Vec<ValType>> {
        let idx = self
            .ctrl
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| Error::load("unknown label"))?;
        let frame = &self.ctrl[idx];
        let types = if frame.label_type == LabelType::Loop {
            frame.block_type.params()
        } else {
            frame.block_type.results()
        };
        Ok(types.to_vec())
    }

    /// Check the stack top against a branch target's arity, leaving the
    /// stack unchanged.
    fn check_branch(&mut self, depth: u32) -> Result<()> {
        let arity = self.branch_arity(depth)?;
        let mut popped = Vec::with_capacity(arity.len());
        for &ty in arity.iter().rev() {
            popped.push(self.pop(ty)?);
        }
        for &ty in popped.iter().rev() {
            self.push(ty)?;
        }
        Ok(())
    }

    /// Pop a block's result types and verify the stack is back at the
    /// frame's entry depth.
    fn check_block_exit(&mut self, results: &[ValType]) -> Result<()> {
        for &ty in results.iter().rev() {
            self.pop(ty)?;
        }
        let frame = self.ctrl.last().ok_or_else(|| Error::Internal("no frame".into()))?;
        if !frame.is_polymorphic && self.stack.len() != frame.stack_num_at_entry {
            return Err(Error::load("type mismatch: stack size mismatch at block end"));
        }
        Ok(())
    }

    // ── shared op patterns ──

    fn binop(&mut self, ty: ValType) -> Result<()> {
        self.pop(ty)?;
        self.pop(ty)?;
        self.push(ty)
    }

    fn unop(&mut self, ty: ValType) -> Result<()> {
        self.pop(ty)?;
        self.push(ty)
    }

    fn relop(&mut self, ty: ValType) -> Result<()> {
        self.pop(ty)?;
        self.pop(ty)?;
        self.push(ValType::I32)
    }

    fn cvtop(&mut self, from: ValType, to: ValType) -> Result<()> {
        self.pop(from)?;
        self.push(to)
    }

    fn mem_addr_type(&self) -> ValType {
        if self.is_memory64 { ValType::I64 } else { ValType::I32 }
    }

    fn check_memory(&self) -> Result<()> {
        if self.module.memory_count() == 0 {
            return Err(Error::load("unknown memory"));
        }
        Ok(())
    }

    /// Read a memarg and enforce natural alignment; returns the offset.
    fn check_memarg(
        &mut self,
        code: &[u8],
        pos: &mut usize,
        natural: u32,
        exact: bool,
    ) -> Result<u64> {
        self.check_memory()?;
        let align = leb_u32(code, pos)?;
        if exact {
            if align != natural {
                return Err(Error::load("alignment isn't equal to natural"));
            }
        } else if align > natural {
            return Err(Error::load("alignment must not be larger than natural"));
        }
        leb_mem_offset(code, pos, self.is_memory64)
    }

    fn mem_load(&mut self, code: &[u8], pos: &mut usize, natural: u32, result: ValType) -> Result<()> {
        self.check_memarg(code, pos, natural, false)?;
        self.pop(self.mem_addr_type())?;
        self.push(result)
    }

    fn mem_store(&mut self, code: &[u8], pos: &mut usize, natural: u32, value: ValType) -> Result<()> {
        self.check_memarg(code, pos, natural, false)?;
        self.pop(value)?;
        self.pop(self.mem_addr_type())?;
        Ok(())
    }

    fn read_block_type(&self, code: &mut [u8], pos: &mut usize, opcode_pos: usize) -> Result<BlockType> {
        let byte = code
            .get(*pos)
            .copied()
            .ok_or_else(|| Error::load("unexpected end of section or function"))?;
        if ValType::from_byte(byte).is_some() {
            *pos += 1;
            // from_byte never yields Any, so unwrap-free default is fine.
            return Ok(BlockType::Value(ValType::from_byte(byte).unwrap_or(ValType::Void)));
        }
        // Type-index block: rewrite the opcode so the emitter skips the
        // is-value-type branch.
        let type_idx = leb_i32(code, pos)?;
        let ty = u32::try_from(type_idx)
            .ok()
            .and_then(|i| self.module.types.get(i as usize))
            .ok_or_else(|| Error::load("unknown type"))?;
        code[opcode_pos] = match code[opcode_pos] {
            op::BLOCK => op::EXT_OP_BLOCK,
            op::LOOP => op::EXT_OP_LOOP,
            op::IF => op::EXT_OP_IF,
            other => other,
        };
        Ok(BlockType::Type(Rc::clone(ty)))
    }

    fn local_type(&self, idx: u32) -> Result<ValType> {
        self.locals
            .get(idx as usize)
            .copied()
            .ok_or_else(|| Error::load("unknown local"))
    }

    // ── main loop ──

    fn run(&mut self, code: &mut Vec<u8>) -> Result<()> {
        self.push_frame(LabelType::Function, BlockType::Type(Rc::clone(&self.func_type)), 0)?;

        let mut pos = 0usize;

        while !self.ctrl.is_empty() {
            let opcode_pos = pos;
            let opcode = read_byte(code, &mut pos)?;

            match opcode {
                op::UNREACHABLE => self.set_polymorphic(),
                op::NOP => {}

                op::BLOCK | op::LOOP | op::IF => {
                    let block_type = self.read_block_type(code, &mut pos, opcode_pos)?;
                    if opcode == op::IF {
                        self.pop(ValType::I32)?;
                    }
                    let params = block_type.params().to_vec();
                    for &ty in params.iter().rev() {
                        self.pop(ty)?;
                    }
                    let label_type = match opcode {
                        op::BLOCK => LabelType::Block,
                        op::LOOP => LabelType::Loop,
                        _ => LabelType::If,
                    };
                    self.push_frame(label_type, block_type, opcode_pos)?;
                    for &ty in &params {
                        self.push(ty)?;
                    }
                }

                op::ELSE => {
                    let frame = self
                        .ctrl
                        .last()
                        .filter(|f| f.label_type == LabelType::If)
                        .ok_or_else(|| {
                            Error::load("opcode else found without matched opcode if")
                        })?;
                    if frame.else_pc.is_some() {
                        return Err(Error::load("opcode else found without matched opcode if"));
                    }
                    let results = frame.block_type.results().to_vec();
                    let params = frame.block_type.params().to_vec();
                    self.check_block_exit(&results)?;
                    let frame = self.ctrl.last_mut().ok_or_else(|| Error::Internal("no frame".into()))?;
                    frame.else_pc = Some(opcode_pos);
                    frame.is_polymorphic = false;
                    let (num, cells) = (frame.stack_num_at_entry, frame.cell_num_at_entry);
                    self.stack.truncate(num);
                    self.stack_cell_num = cells;
                    for &ty in &params {
                        self.push(ty)?;
                    }
                }

                op::END => {
                    let frame = self.ctrl.last().ok_or_else(|| Error::Internal("no frame".into()))?;
                    let results = frame.block_type.results().to_vec();
                    // An if without an else must produce exactly its inputs.
                    if frame.label_type == LabelType::If
                        && frame.else_pc.is_none()
                        && frame.block_type.params() != frame.block_type.results()
                    {
                        return Err(Error::load("type mismatch: else branch missing"));
                    }
                    self.check_block_exit(&results)?;
                    self.ctrl.pop();
                    if !self.ctrl.is_empty() {
                        for &ty in &results {
                            self.push(ty)?;
                        }
                    }
                }

                op::BR => {
                    let depth = leb_u32(code, &mut pos)?;
                    self.check_branch(depth)?;
                    self.set_polymorphic();
                }

                op::BR_IF => {
                    let depth = leb_u32(code, &mut pos)?;
                    self.pop(ValType::I32)?;
                    self.check_branch(depth)?;
                }

                op::BR_TABLE => {
                    let count_pos = pos;
                    let count = leb_u32(code, &mut pos)?;
                    let depths_pos = {
                        let mut p = count_pos;
                        leb_u32(code, &mut p)?;
                        p
                    };
                    let mut depths = Vec::with_capacity(count as usize + 1);
                    for _ in 0..=count {
                        depths.push(leb_u32(code, &mut pos)?);
                    }
                    let immediates_end = pos;

                    self.pop(ValType::I32)?;
                    let default_arity = self.branch_arity(depths[count as usize])?;
                    for &depth in &depths {
                        let arity = self.branch_arity(depth)?;
                        if arity != default_arity {
                            return Err(Error::load("type mismatch: br_table targets must all have the same types"));
                        }
                    }
                    self.check_branch(depths[count as usize])?;
                    self.set_polymorphic();

                    if depths.iter().any(|&d| d > 255) {
                        // The depth vector does not fit in single bytes:
                        // move it to the side table, keep the count, and
                        // nop-pad the stale immediate bytes (they sit in
                        // dead code and decode as harmless nops).
                        code[opcode_pos] = op::EXT_OP_BR_TABLE_CACHE;
                        for byte in &mut code[depths_pos..immediates_end] {
                            *byte = op::NOP;
                        }
                        self.br_table_cache.insert(opcode_pos, depths);
                    }
                }

                op::RETURN => {
                    let results = self.func_type.results.to_vec();
                    for &ty in results.iter().rev() {
                        self.pop(ty)?;
                    }
                    self.set_polymorphic();
                }

                op::CALL | op::RETURN_CALL => {
                    let func_idx = leb_u32(code, &mut pos)?;
                    let callee = self
                        .module
                        .func_type(func_idx)
                        .cloned()
                        .ok_or_else(|| Error::load("unknown function"))?;
                    for &ty in callee.params.iter().rev() {
                        self.pop(ty)?;
                    }
                    if opcode == op::RETURN_CALL {
                        if callee.results != self.func_type.results {
                            return Err(Error::load("type mismatch"));
                        }
                        self.set_polymorphic();
                    } else {
                        for &ty in &callee.results {
                            self.push(ty)?;
                        }
                    }
                }

                op::CALL_INDIRECT | op::RETURN_CALL_INDIRECT => {
                    let type_idx = leb_u32(code, &mut pos)?;
                    let table_idx = leb_u32(code, &mut pos)?;
                    let callee = self
                        .module
                        .types
                        .get(type_idx as usize)
                        .cloned()
                        .ok_or_else(|| Error::load("unknown type"))?;
                    if table_idx != 0 || self.module.table_count() == 0 {
                        return Err(Error::load("unknown table"));
                    }
                    let table = self.module.table().ok_or_else(|| Error::load("unknown table"))?;
                    let idx_type = if table.flags & crate::module::LIMITS_FLAG_INDEX64 != 0 {
                        ValType::I64
                    } else {
                        ValType::I32
                    };
                    self.pop(idx_type)?;
                    for &ty in callee.params.iter().rev() {
                        self.pop(ty)?;
                    }
                    if opcode == op::RETURN_CALL_INDIRECT {
                        if callee.results != self.func_type.results {
                            return Err(Error::load("type mismatch"));
                        }
                        self.set_polymorphic();
                    } else {
                        for &ty in &callee.results {
                            self.push(ty)?;
                        }
                    }
                }

                op::DROP => {
                    let ty = self.pop(ValType::Any)?;
                    if ty.cell_num() == 2 {
                        code[opcode_pos] = op::EXT_OP_DROP_64;
                    }
                }

                op::SELECT => {
                    self.pop(ValType::I32)?;
                    let t1 = self.pop(ValType::Any)?;
                    let t2 = self.pop(t1)?;
                    let ty = if t1 == ValType::Any { t2 } else { t1 };
                    if ty.cell_num() == 2 {
                        code[opcode_pos] = op::EXT_OP_SELECT_64;
                    }
                    self.push(ty)?;
                }

                op::SELECT_T => {
                    let arity = leb_u32(code, &mut pos)?;
                    if arity != 1 {
                        return Err(Error::load("invalid result arity"));
                    }
                    let ty = ValType::from_byte(read_byte(code, &mut pos)?)
                        .filter(|t| *t != ValType::Void)
                        .ok_or_else(|| Error::load("unknown type"))?;
                    self.pop(ValType::I32)?;
                    self.pop(ty)?;
                    self.pop(ty)?;
                    // Not rewritten to the _64 form: the typed select
                    // carries immediates the emitter must still skip.
                    self.push(ty)?;
                }

                op::LOCAL_GET => {
                    let idx = leb_u32(code, &mut pos)?;
                    let ty = self.local_type(idx)?;
                    self.push(ty)?;
                }
                op::LOCAL_SET => {
                    let idx = leb_u32(code, &mut pos)?;
                    let ty = self.local_type(idx)?;
                    self.pop(ty)?;
                }
                op::LOCAL_TEE => {
                    let idx = leb_u32(code, &mut pos)?;
                    let ty = self.local_type(idx)?;
                    self.pop(ty)?;
                    self.push(ty)?;
                }

                op::GLOBAL_GET => {
                    let idx = leb_u32(code, &mut pos)?;
                    let (ty, _) = self
                        .module
                        .global_type(idx)
                        .ok_or_else(|| Error::load("unknown global"))?;
                    if ty.cell_num() == 2 {
                        code[opcode_pos] = op::EXT_OP_GLOBAL_GET_64;
                    }
                    self.push(ty)?;
                }
                op::GLOBAL_SET => {
                    let idx = leb_u32(code, &mut pos)?;
                    let (ty, mutable) = self
                        .module
                        .global_type(idx)
                        .ok_or_else(|| Error::load("unknown global"))?;
                    if !mutable {
                        return Err(Error::load("global is immutable"));
                    }
                    if self.module.aux.stack_global_idx == Some(idx) {
                        code[opcode_pos] = op::EXT_OP_GLOBAL_SET_AUX_STACK;
                    } else if ty.cell_num() == 2 {
                        code[opcode_pos] = op::EXT_OP_GLOBAL_SET_64;
                    }
                    self.pop(ty)?;
                }

                // Memory loads/stores: natural alignment comes from the
                // per-opcode table.
                op::I32_LOAD | op::I32_LOAD8_S | op::I32_LOAD8_U | op::I32_LOAD16_S
                | op::I32_LOAD16_U => {
                    let natural = op::natural_align(opcode).unwrap_or(0);
                    self.mem_load(code, &mut pos, natural, ValType::I32)?;
                }
                op::I64_LOAD | op::I64_LOAD8_S | op::I64_LOAD8_U | op::I64_LOAD16_S
                | op::I64_LOAD16_U | op::I64_LOAD32_S | op::I64_LOAD32_U => {
                    let natural = op::natural_align(opcode).unwrap_or(0);
                    self.mem_load(code, &mut pos, natural, ValType::I64)?;
                }
                op::F32_LOAD => self.mem_load(code, &mut pos, 2, ValType::F32)?,
                op::F64_LOAD => self.mem_load(code, &mut pos, 3, ValType::F64)?,

                op::I32_STORE | op::I32_STORE8 | op::I32_STORE16 => {
                    let natural = op::natural_align(opcode).unwrap_or(0);
                    self.mem_store(code, &mut pos, natural, ValType::I32)?;
                }
                op::I64_STORE | op::I64_STORE8 | op::I64_STORE16 | op::I64_STORE32 => {
                    let natural = op::natural_align(opcode).unwrap_or(0);
                    self.mem_store(code, &mut pos, natural, ValType::I64)?;
                }
                op::F32_STORE => self.mem_store(code, &mut pos, 2, ValType::F32)?,
                op::F64_STORE => self.mem_store(code, &mut pos, 3, ValType::F64)?,

                op::MEMORY_SIZE => {
                    self.check_memory()?;
                    if read_byte(code, &mut pos)? != 0 {
                        return Err(Error::load("zero byte expected"));
                    }
                    self.push(self.mem_addr_type())?;
                }
                op::MEMORY_GROW => {
                    self.check_memory()?;
                    if read_byte(code, &mut pos)? != 0 {
                        return Err(Error::load("zero byte expected"));
                    }
                    self.pop(self.mem_addr_type())?;
                    self.push(self.mem_addr_type())?;
                }

                op::I32_CONST => {
                    leb_i32(code, &mut pos)?;
                    self.push(ValType::I32)?;
                }
                op::I64_CONST => {
                    leb_i64(code, &mut pos)?;
                    self.push(ValType::I64)?;
                }
                op::F32_CONST => {
                    skip_bytes(code, &mut pos, 4)?;
                    self.push(ValType::F32)?;
                }
                op::F64_CONST => {
                    skip_bytes(code, &mut pos, 8)?;
                    self.push(ValType::F64)?;
                }

                op::I32_EQZ => self.cvtop(ValType::I32, ValType::I32)?,
                op::I64_EQZ => self.cvtop(ValType::I64, ValType::I32)?,
                op::I32_EQ..=op::I32_GE_U => self.relop(ValType::I32)?,
                op::I64_EQ..=op::I64_GE_U => self.relop(ValType::I64)?,
                op::F32_EQ..=op::F32_GE => self.relop(ValType::F32)?,
                op::F64_EQ..=op::F64_GE => self.relop(ValType::F64)?,

                op::I32_CLZ | op::I32_CTZ | op::I32_POPCNT => self.unop(ValType::I32)?,
                op::I32_ADD..=op::I32_ROTR => self.binop(ValType::I32)?,
                op::I64_CLZ | op::I64_CTZ | op::I64_POPCNT => self.unop(ValType::I64)?,
                op::I64_ADD..=op::I64_ROTR => self.binop(ValType::I64)?,

                op::F32_ABS..=op::F32_SQRT => self.unop(ValType::F32)?,
                op::F32_ADD..=op::F32_COPYSIGN => self.binop(ValType::F32)?,
                op::F64_ABS..=op::F64_SQRT => self.unop(ValType::F64)?,
                op::F64_ADD..=op::F64_COPYSIGN => self.binop(ValType::F64)?,

                op::I32_WRAP_I64 => self.cvtop(ValType::I64, ValType::I32)?,
                op::I32_TRUNC_F32_S | op::I32_TRUNC_F32_U => {
                    self.cvtop(ValType::F32, ValType::I32)?;
                }
                op::I32_TRUNC_F64_S | op::I32_TRUNC_F64_U => {
                    self.cvtop(ValType::F64, ValType::I32)?;
                }
                op::I64_EXTEND_I32_S | op::I64_EXTEND_I32_U => {
                    self.cvtop(ValType::I32, ValType::I64)?;
                }
                op::I64_TRUNC_F32_S | op::I64_TRUNC_F32_U => {
                    self.cvtop(ValType::F32, ValType::I64)?;
                }
                op::I64_TRUNC_F64_S | op::I64_TRUNC_F64_U => {
                    self.cvtop(ValType::F64, ValType::I64)?;
                }
                op::F32_CONVERT_I32_S | op::F32_CONVERT_I32_U => {
                    self.cvtop(ValType::I32, ValType::F32)?;
                }
                op::F32_CONVERT_I64_S | op::F32_CONVERT_I64_U => {
                    self.cvtop(ValType::I64, ValType::F32)?;
                }
                op::F32_DEMOTE_F64 => self.cvtop(ValType::F64, ValType::F32)?,
                op::F64_CONVERT_I32_S | op::F64_CONVERT_I32_U => {
                    self.cvtop(ValType::I32, ValType::F64)?;
                }
                op::F64_CONVERT_I64_S | op::F64_CONVERT_I64_U => {
                    self.cvtop(ValType::I64, ValType::F64)?;
                }
                op::F64_PROMOTE_F32 => self.cvtop(ValType::F32, ValType::F64)?,
                op::I32_REINTERPRET_F32 => self.cvtop(ValType::F32, ValType::I32)?,
                op::I64_REINTERPRET_F64 => self.cvtop(ValType::F64, ValType::I64)?,
                op::F32_REINTERPRET_I32 => self.cvtop(ValType::I32, ValType::F32)?,
                op::F64_REINTERPRET_I64 => self.cvtop(ValType::I64, ValType::F64)?,

                op::I32_EXTEND8_S | op::I32_EXTEND16_S => self.unop(ValType::I32)?,
                op::I64_EXTEND8_S | op::I64_EXTEND16_S | op::I64_EXTEND32_S => {
                    self.unop(ValType::I64)?;
                }

                op::PREFIX_MISC => {
                    let subop = leb_u32(code, &mut pos)?;
                    self.validate_misc_op(code, &mut pos, subop)?;
                }
                op::PREFIX_SIMD => {
                    let subop = leb_u32(code, &mut pos)?;
                    self.validate_simd_op(code, &mut pos, subop)?;
                }
                op::PREFIX_ATOMIC => {
                    let subop = leb_u32(code, &mut pos)?;
                    self.validate_atomic_op(code, &mut pos, subop)?;
                }

                _ => {
                    return Err(Error::load(format!("unsupported opcode 0x{opcode:02x}")));
                }
            }
        }

        if pos != code.len() {
            return Err(Error::load("section size mismatch"));
        }
        Ok(())
    }

    fn validate_misc_op(&mut self, code: &[u8], pos: &mut usize, subop: u32) -> Result<()> {
        match subop {
            op::MISC_I32_TRUNC_SAT_F32_S | op::MISC_I32_TRUNC_SAT_F32_U => {
                self.cvtop(ValType::F32, ValType::I32)
            }
            op::MISC_I32_TRUNC_SAT_F64_S | op::MISC_I32_TRUNC_SAT_F64_U => {
                self.cvtop(ValType::F64, ValType::I32)
            }
            op::MISC_I64_TRUNC_SAT_F32_S | op::MISC_I64_TRUNC_SAT_F32_U => {
                self.cvtop(ValType::F32, ValType::I64)
            }
            op::MISC_I64_TRUNC_SAT_F64_S | op::MISC_I64_TRUNC_SAT_F64_U => {
                self.cvtop(ValType::F64, ValType::I64)
            }
            op::MISC_MEMORY_INIT => {
                self.check_memory()?;
                if self.module.data_count.is_none() {
                    return Err(Error::load("data count section required"));
                }
                let seg_idx = leb_u32(code, pos)?;
                if seg_idx as usize >= self.module.data_segs.len() {
                    return Err(Error::load("unknown data segment"));
                }
                if read_byte(code, pos)? != 0 {
                    return Err(Error::load("zero byte expected"));
                }
                self.pop(ValType::I32)?;
                self.pop(ValType::I32)?;
                self.pop(self.mem_addr_type())?;
                Ok(())
            }
            op::MISC_DATA_DROP => {
                if self.module.data_count.is_none() {
                    return Err(Error::load("data count section required"));
                }
                let seg_idx = leb_u32(code, pos)?;
                if seg_idx as usize >= self.module.data_segs.len() {
                    return Err(Error::load("unknown data segment"));
                }
                Ok(())
            }
            op::MISC_MEMORY_COPY => {
                self.check_memory()?;
                // Both memory indices must name memory 0.
                if read_byte(code, pos)? != 0 || read_byte(code, pos)? != 0 {
                    return Err(Error::load("zero byte expected"));
                }
                let addr = self.mem_addr_type();
                self.pop(addr)?;
                self.pop(addr)?;
                self.pop(addr)?;
                Ok(())
            }
            op::MISC_MEMORY_FILL => {
                self.check_memory()?;
                if read_byte(code, pos)? != 0 {
                    return Err(Error::load("zero byte expected"));
                }
                let addr = self.mem_addr_type();
                self.pop(addr)?;
                self.pop(ValType::I32)?;
                self.pop(addr)?;
                Ok(())
            }
            _ => Err(Error::load(format!("unsupported opcode 0xfc 0x{subop:02x}"))),
        }
    }

    fn validate_simd_op(&mut self, code: &[u8], pos: &mut usize, subop: u32) -> Result<()> {
        let check_lane = |code: &[u8], pos: &mut usize, lanes: u8| -> Result<u8> {
            let lane = read_byte(code, pos)?;
            if lane >= lanes {
                return Err(Error::load("invalid lane index"));
            }
            Ok(lane)
        };

        match subop {
            op::SIMD_V128_LOAD => {
                self.check_memarg(code, pos, 4, false)?;
                self.pop(self.mem_addr_type())?;
                self.push(ValType::V128)
            }
            op::SIMD_V128_STORE => {
                self.check_memarg(code, pos, 4, false)?;
                self.pop(ValType::V128)?;
                self.pop(self.mem_addr_type())?;
                Ok(())
            }
            op::SIMD_V128_CONST => {
                skip_bytes(code, pos, 16)?;
                self.push(ValType::V128)
            }
            op::SIMD_I8X16_SPLAT | op::SIMD_I16X8_SPLAT | op::SIMD_I32X4_SPLAT => {
                self.cvtop(ValType::I32, ValType::V128)
            }
            op::SIMD_I64X2_SPLAT => self.cvtop(ValType::I64, ValType::V128),
            op::SIMD_F32X4_SPLAT => self.cvtop(ValType::F32, ValType::V128),
            op::SIMD_F64X2_SPLAT => self.cvtop(ValType::F64, ValType::V128),

            op::SIMD_I8X16_EXTRACT_LANE_S | op::SIMD_I8X16_EXTRACT_LANE_U => {
                check_lane(code, pos, 16)?;
                self.cvtop(ValType::V128, ValType::I32)
            }
            op::SIMD_I16X8_EXTRACT_LANE_S | op::SIMD_I16X8_EXTRACT_LANE_U => {
                check_lane(code, pos, 8)?;
                self.cvtop(ValType::V128, ValType::I32)
            }
            op::SIMD_I32X4_EXTRACT_LANE => {
                check_lane(code, pos, 4)?;
                self.cvtop(ValType::V128, ValType::I32)
            }
            op::SIMD_I64X2_EXTRACT_LANE => {
                check_lane(code, pos, 2)?;
                self.cvtop(ValType::V128, ValType::I64)
            }
            op::SIMD_F32X4_EXTRACT_LANE => {
                check_lane(code, pos, 4)?;
                self.cvtop(ValType::V128, ValType::F32)
            }
            op::SIMD_F64X2_EXTRACT_LANE => {
                check_lane(code, pos, 2)?;
                self.cvtop(ValType::V128, ValType::F64)
            }

            op::SIMD_I8X16_REPLACE_LANE | op::SIMD_I16X8_REPLACE_LANE
            | op::SIMD_I32X4_REPLACE_LANE | op::SIMD_I64X2_REPLACE_LANE
            | op::SIMD_F32X4_REPLACE_LANE | op::SIMD_F64X2_REPLACE_LANE => {
                let (lanes, lane_ty) = match subop {
                    op::SIMD_I8X16_REPLACE_LANE => (16, ValType::I32),
                    op::SIMD_I16X8_REPLACE_LANE => (8, ValType::I32),
                    op::SIMD_I32X4_REPLACE_LANE => (4, ValType::I32),
                    op::SIMD_I64X2_REPLACE_LANE => (2, ValType::I64),
                    op::SIMD_F32X4_REPLACE_LANE => (4, ValType::F32),
                    _ => (2, ValType::F64),
                };
                check_lane(code, pos, lanes)?;
                self.pop(lane_ty)?;
                self.pop(ValType::V128)?;
                self.push(ValType::V128)
            }

            op::SIMD_V128_NOT => self.unop(ValType::V128),
            op::SIMD_V128_AND | op::SIMD_V128_ANDNOT | op::SIMD_V128_OR | op::SIMD_V128_XOR
            | op::SIMD_I8X16_ADD | op::SIMD_I8X16_SUB | op::SIMD_I16X8_ADD
            | op::SIMD_I16X8_SUB | op::SIMD_I16X8_MUL | op::SIMD_I32X4_ADD
            | op::SIMD_I32X4_SUB | op::SIMD_I32X4_MUL | op::SIMD_I64X2_ADD
            | op::SIMD_I64X2_SUB | op::SIMD_I64X2_MUL => self.binop(ValType::V128),

            _ => Err(Error::load(format!("unsupported opcode 0xfd 0x{subop:02x}"))),
        }
    }

    fn validate_atomic_op(&mut self, code: &[u8], pos: &mut usize, subop: u32) -> Result<()> {
        if subop == op::ATOMIC_FENCE {
            if read_byte(code, pos)? != 0 {
                return Err(Error::load("zero byte expected"));
            }
            return Ok(());
        }
        if matches!(subop, op::ATOMIC_NOTIFY | op::ATOMIC_WAIT32 | op::ATOMIC_WAIT64) {
            return Err(Error::load(format!("unsupported opcode 0xfe 0x{subop:02x}")));
        }

        let natural = op::atomic_natural_align(subop)
            .ok_or_else(|| Error::load(format!("unsupported opcode 0xfe 0x{subop:02x}")))?;
        self.check_memarg(code, pos, natural, true)?;
        let addr = self.mem_addr_type();

        match subop {
            op::ATOMIC_I32_LOAD | op::ATOMIC_I32_LOAD8_U | op::ATOMIC_I32_LOAD16_U => {
                self.pop(addr)?;
                self.push(ValType::I32)
            }
            op::ATOMIC_I64_LOAD | op::ATOMIC_I64_LOAD8_U | op::ATOMIC_I64_LOAD16_U
            | op::ATOMIC_I64_LOAD32_U => {
                self.pop(addr)?;
                self.push(ValType::I64)
            }
            op::ATOMIC_I32_STORE | op::ATOMIC_I32_STORE8 | op::ATOMIC_I32_STORE16 => {
                self.pop(ValType::I32)?;
                self.pop(addr)?;
                Ok(())
            }
            op::ATOMIC_I64_STORE | op::ATOMIC_I64_STORE8 | op::ATOMIC_I64_STORE16
            | op::ATOMIC_I64_STORE32 => {
                self.pop(ValType::I64)?;
                self.pop(addr)?;
                Ok(())
            }
            op::ATOMIC_RMW_FIRST..=op::ATOMIC_RMW_LAST => {
                // Each RMW family repeats in blocks of 7 width variants;
                // even positions within a block operate on i32.
                let ty = match (subop - op::ATOMIC_RMW_FIRST) % 7 {
                    0 | 2 | 3 => ValType::I32,
                    _ => ValType::I64,
                };
                let is_cmpxchg =
                    (subop - op::ATOMIC_RMW_FIRST) / 7 == 6;
                if is_cmpxchg {
                    self.pop(ty)?;
                }
                self.pop(ty)?;
                self.pop(addr)?;
                self.push(ty)
            }
            _ => Err(Error::load(format!("unsupported opcode 0xfe 0x{subop:02x}"))),
        }
    }
}
