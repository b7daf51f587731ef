//! Numeric opcode lowering: integer and float arithmetic with the trap
//! guards WebAssembly demands, conversions, and the v128 subset.

use inkwell::intrinsics::Intrinsic;
use inkwell::types::{BasicTypeEnum, FloatType, IntType, VectorType};
use inkwell::values::{BasicMetadataValueEnum, BasicValueEnum, FloatValue, IntValue, VectorValue};
use inkwell::{FloatPredicate, IntPredicate};

use crate::opcode as op;
use crate::reader::Reader;
use crate::trap::ExceptionId;
use crate::{Error, Result};

use super::emitter::FuncEmitter;

impl<'ctx, 'm> FuncEmitter<'ctx, 'm> {
    fn pop_float(&mut self) -> Result<FloatValue<'ctx>> {
        Ok(self.pop()?.into_float_value())
    }

    /// Call an overloaded LLVM intrinsic.
    pub(super) fn call_intrinsic(
        &self,
        name: &str,
        overload: &[BasicTypeEnum<'ctx>],
        args: &[BasicMetadataValueEnum<'ctx>],
    ) -> Result<BasicValueEnum<'ctx>> {
        let intrinsic = Intrinsic::find(name)
            .ok_or_else(|| Error::Llvm(format!("intrinsic {name} not found")))?;
        let decl = intrinsic
            .get_declaration(&self.cc.module, overload)
            .ok_or_else(|| Error::Llvm(format!("{name} declaration failed")))?;
        self.cc
            .builder
            .build_call(decl, args, "intrinsic")?
            .try_as_basic_value()
            .left()
            .ok_or_else(|| Error::Llvm(format!("{name} returned void")))
    }

    pub(super) fn emit_numeric_op(&mut self, opcode: u8) -> Result<()> {
        let i32t = self.cc.i32t();
        let i64t = self.cc.i64t();
        let f32t = self.cc.f32t();
        let f64t = self.cc.f64t();

        match opcode {
            op::I32_EQZ => self.emit_eqz(i32t),
            op::I64_EQZ => self.emit_eqz(i64t),

            op::I32_EQ => self.emit_int_cmp(IntPredicate::EQ),
            op::I32_NE => self.emit_int_cmp(IntPredicate::NE),
            op::I32_LT_S => self.emit_int_cmp(IntPredicate::SLT),
            op::I32_LT_U => self.emit_int_cmp(IntPredicate::ULT),
            op::I32_GT_S => self.emit_int_cmp(IntPredicate::SGT),
            op::I32_GT_U => self.emit_int_cmp(IntPredicate::UGT),
            op::I32_LE_S => self.emit_int_cmp(IntPredicate::SLE),
            op::I32_LE_U => self.emit_int_cmp(IntPredicate::ULE),
            op::I32_GE_S => self.emit_int_cmp(IntPredicate::SGE),
            op::I32_GE_U => self.emit_int_cmp(IntPredicate::UGE),
            op::I64_EQ => self.emit_int_cmp(IntPredicate::EQ),
            op::I64_NE => self.emit_int_cmp(IntPredicate::NE),
            op::I64_LT_S => self.emit_int_cmp(IntPredicate::SLT),
            op::I64_LT_U => self.emit_int_cmp(IntPredicate::ULT),
            op::I64_GT_S => self.emit_int_cmp(IntPredicate::SGT),
            op::I64_GT_U => self.emit_int_cmp(IntPredicate::UGT),
            op::I64_LE_S => self.emit_int_cmp(IntPredicate::SLE),
            op::I64_LE_U => self.emit_int_cmp(IntPredicate::ULE),
            op::I64_GE_S => self.emit_int_cmp(IntPredicate::SGE),
            op::I64_GE_U => self.emit_int_cmp(IntPredicate::UGE),

            op::F32_EQ | op::F64_EQ => self.emit_float_cmp(FloatPredicate::OEQ),
            op::F32_NE | op::F64_NE => self.emit_float_cmp(FloatPredicate::UNE),
            op::F32_LT | op::F64_LT => self.emit_float_cmp(FloatPredicate::OLT),
            op::F32_GT | op::F64_GT => self.emit_float_cmp(FloatPredicate::OGT),
            op::F32_LE | op::F64_LE => self.emit_float_cmp(FloatPredicate::OLE),
            op::F32_GE | op::F64_GE => self.emit_float_cmp(FloatPredicate::OGE),

            op::I32_CLZ => self.emit_count_bits("llvm.ctlz", i32t, true),
            op::I32_CTZ => self.emit_count_bits("llvm.cttz", i32t, true),
            op::I32_POPCNT => self.emit_count_bits("llvm.ctpop", i32t, false),
            op::I64_CLZ => self.emit_count_bits("llvm.ctlz", i64t, true),
            op::I64_CTZ => self.emit_count_bits("llvm.cttz", i64t, true),
            op::I64_POPCNT => self.emit_count_bits("llvm.ctpop", i64t, false),

            op::I32_ADD | op::I64_ADD => {
                self.emit_int_binop(|b, l, r| Ok(b.build_int_add(l, r, "add")?))
            }
            op::I32_SUB | op::I64_SUB => {
                self.emit_int_binop(|b, l, r| Ok(b.build_int_sub(l, r, "sub")?))
            }
            op::I32_MUL | op::I64_MUL => {
                self.emit_int_binop(|b, l, r| Ok(b.build_int_mul(l, r, "mul")?))
            }
            op::I32_DIV_S | op::I64_DIV_S => self.emit_int_div(true, false),
            op::I32_DIV_U | op::I64_DIV_U => self.emit_int_div(false, false),
            op::I32_REM_S | op::I64_REM_S => self.emit_int_div(true, true),
            op::I32_REM_U | op::I64_REM_U => self.emit_int_div(false, true),
            op::I32_AND | op::I64_AND => {
                self.emit_int_binop(|b, l, r| Ok(b.build_and(l, r, "and")?))
            }
            op::I32_OR | op::I64_OR => {
                self.emit_int_binop(|b, l, r| Ok(b.build_or(l, r, "or")?))
            }
            op::I32_XOR | op::I64_XOR => {
                self.emit_int_binop(|b, l, r| Ok(b.build_xor(l, r, "xor")?))
            }
            op::I32_SHL | op::I64_SHL => {
                self.emit_shift(|b, l, r| Ok(b.build_left_shift(l, r, "shl")?))
            }
            op::I32_SHR_S | op::I64_SHR_S => {
                self.emit_shift(|b, l, r| Ok(b.build_right_shift(l, r, true, "shrs")?))
            }
            op::I32_SHR_U | op::I64_SHR_U => {
                self.emit_shift(|b, l, r| Ok(b.build_right_shift(l, r, false, "shru")?))
            }
            op::I32_ROTL | op::I64_ROTL => self.emit_rotate("llvm.fshl"),
            op::I32_ROTR | op::I64_ROTR => self.emit_rotate("llvm.fshr"),

            op::F32_ABS | op::F64_ABS => self.emit_float_unary_intrinsic("llvm.fabs"),
            op::F32_NEG | op::F64_NEG => {
                let v = self.pop_float()?;
                let r = self.cc.builder.build_float_neg(v, "fneg")?;
                self.push(r.into());
                Ok(())
            }
            op::F32_CEIL | op::F64_CEIL => self.emit_float_unary_intrinsic("llvm.ceil"),
            op::F32_FLOOR | op::F64_FLOOR => self.emit_float_unary_intrinsic("llvm.floor"),
            op::F32_TRUNC | op::F64_TRUNC => self.emit_float_unary_intrinsic("llvm.trunc"),
            op::F32_NEAREST | op::F64_NEAREST => self.emit_float_unary_intrinsic("llvm.rint"),
            op::F32_SQRT | op::F64_SQRT => self.emit_float_unary_intrinsic("llvm.sqrt"),

            op::F32_ADD | op::F64_ADD => {
                self.emit_float_binop(|b, l, r| Ok(b.build_float_add(l, r, "fadd")?))
            }
            op::F32_SUB | op::F64_SUB => {
                self.emit_float_binop(|b, l, r| Ok(b.build_float_sub(l, r, "fsub")?))
            }
            op::F32_MUL | op::F64_MUL => {
                self.emit_float_binop(|b, l, r| Ok(b.build_float_mul(l, r, "fmul")?))
            }
            op::F32_DIV | op::F64_DIV => {
                self.emit_float_binop(|b, l, r| Ok(b.build_float_div(l, r, "fdiv")?))
            }
            op::F32_MIN | op::F64_MIN => self.emit_float_binary_intrinsic("llvm.minimum"),
            op::F32_MAX | op::F64_MAX => self.emit_float_binary_intrinsic("llvm.maximum"),
            op::F32_COPYSIGN | op::F64_COPYSIGN => {
                self.emit_float_binary_intrinsic("llvm.copysign")
            }

            op::I32_WRAP_I64 => {
                let v = self.pop_int()?;
                let r = self.cc.builder.build_int_truncate(v, i32t, "wrap")?;
                self.push(r.into());
                Ok(())
            }
            op::I32_TRUNC_F32_S => self.emit_float_to_int(f32t, i32t, true),
            op::I32_TRUNC_F32_U => self.emit_float_to_int(f32t, i32t, false),
            op::I32_TRUNC_F64_S => self.emit_float_to_int(f64t, i32t, true),
            op::I32_TRUNC_F64_U => self.emit_float_to_int(f64t, i32t, false),
            op::I64_EXTEND_I32_S => {
                let v = self.pop_int()?;
                let r = self.cc.builder.build_int_s_extend(v, i64t, "extend_s")?;
                self.push(r.into());
                Ok(())
            }
            op::I64_EXTEND_I32_U => {
                let v = self.pop_int()?;
                let r = self.cc.builder.build_int_z_extend(v, i64t, "extend_u")?;
                self.push(r.into());
                Ok(())
            }
            op::I64_TRUNC_F32_S => self.emit_float_to_int(f32t, i64t, true),
            op::I64_TRUNC_F32_U => self.emit_float_to_int(f32t, i64t, false),
            op::I64_TRUNC_F64_S => self.emit_float_to_int(f64t, i64t, true),
            op::I64_TRUNC_F64_U => self.emit_float_to_int(f64t, i64t, false),

            op::F32_CONVERT_I32_S | op::F32_CONVERT_I64_S => self.emit_int_to_float(f32t, true),
            op::F32_CONVERT_I32_U | op::F32_CONVERT_I64_U => self.emit_int_to_float(f32t, false),
            op::F32_DEMOTE_F64 => {
                let v = self.pop_float()?;
                let r = self.cc.builder.build_float_trunc(v, f32t, "demote")?;
                self.push(r.into());
                Ok(())
            }
            op::F64_CONVERT_I32_S | op::F64_CONVERT_I64_S => self.emit_int_to_float(f64t, true),
            op::F64_CONVERT_I32_U | op::F64_CONVERT_I64_U => self.emit_int_to_float(f64t, false),
            op::F64_PROMOTE_F32 => {
                let v = self.pop_float()?;
                let r = self.cc.builder.build_float_ext(v, f64t, "promote")?;
                self.push(r.into());
                Ok(())
            }

            op::I32_REINTERPRET_F32 => self.emit_bitcast(i32t.into()),
            op::I64_REINTERPRET_F64 => self.emit_bitcast(i64t.into()),
            op::F32_REINTERPRET_I32 => self.emit_bitcast(f32t.into()),
            op::F64_REINTERPRET_I64 => self.emit_bitcast(f64t.into()),

            op::I32_EXTEND8_S => self.emit_sign_extend_inner(i32t, 8),
            op::I32_EXTEND16_S => self.emit_sign_extend_inner(i32t, 16),
            op::I64_EXTEND8_S => self.emit_sign_extend_inner(i64t, 8),
            op::I64_EXTEND16_S => self.emit_sign_extend_inner(i64t, 16),
            op::I64_EXTEND32_S => self.emit_sign_extend_inner(i64t, 32),

            _ => Err(Error::Unsupported(format!("opcode 0x{opcode:02x}"))),
        }
    }

    // ── integer helpers ──

    fn emit_eqz(&mut self, ty: IntType<'ctx>) -> Result<()> {
        let v = self.pop_int()?;
        let cmp =
            self.cc
                .builder
                .build_int_compare(IntPredicate::EQ, v, ty.const_zero(), "eqz")?;
        let r = self.cc.builder.build_int_z_extend(cmp, self.cc.i32t(), "eqz_ext")?;
        self.push(r.into());
        Ok(())
    }

    fn emit_int_cmp(&mut self, pred: IntPredicate) -> Result<()> {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let cmp = self.cc.builder.build_int_compare(pred, lhs, rhs, "cmp")?;
        let r = self.cc.builder.build_int_z_extend(cmp, self.cc.i32t(), "cmp_ext")?;
        self.push(r.into());
        Ok(())
    }

    fn emit_float_cmp(&mut self, pred: FloatPredicate) -> Result<()> {
        let rhs = self.pop_float()?;
        let lhs = self.pop_float()?;
        let cmp = self.cc.builder.build_float_compare(pred, lhs, rhs, "fcmp")?;
        let r = self.cc.builder.build_int_z_extend(cmp, self.cc.i32t(), "fcmp_ext")?;
        self.push(r.into());
        Ok(())
    }

    fn emit_int_binop<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(
            &inkwell::builder::Builder<'ctx>,
            IntValue<'ctx>,
            IntValue<'ctx>,
        ) -> Result<IntValue<'ctx>>,
    {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let r = f(&self.cc.builder, lhs, rhs)?;
        self.push(r.into());
        Ok(())
    }

    /// Shift counts are taken modulo the operand width.
    fn emit_shift<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(
            &inkwell::builder::Builder<'ctx>,
            IntValue<'ctx>,
            IntValue<'ctx>,
        ) -> Result<IntValue<'ctx>>,
    {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let bits = lhs.get_type().get_bit_width();
        let mask = lhs.get_type().const_int(u64::from(bits) - 1, false);
        let amount = self.cc.builder.build_and(rhs, mask, "shift_amount")?;
        let r = f(&self.cc.builder, lhs, amount)?;
        self.push(r.into());
        Ok(())
    }

    fn emit_rotate(&mut self, intrinsic: &str) -> Result<()> {
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let r = self.call_intrinsic(
            intrinsic,
            &[lhs.get_type().into()],
            &[lhs.into(), lhs.into(), rhs.into()],
        )?;
        self.push(r);
        Ok(())
    }

    fn emit_count_bits(&mut self, intrinsic: &str, ty: IntType<'ctx>, zero_poison_arg: bool) -> Result<()> {
        let v = self.pop_int()?;
        let r = if zero_poison_arg {
            let zero_is_defined = self.cc.context.bool_type().const_zero();
            self.call_intrinsic(intrinsic, &[ty.into()], &[v.into(), zero_is_defined.into()])?
        } else {
            self.call_intrinsic(intrinsic, &[ty.into()], &[v.into()])?
        };
        self.push(r);
        Ok(())
    }

    /// Division and remainder with the zero / overflow guards. `INT_MIN
    /// rem -1` is defined (0), so the divisor is sanitized instead of
    /// trapped.
    fn emit_int_div(&mut self, signed: bool, is_rem: bool) -> Result<()> {
        let b = &self.cc.builder;
        let rhs = self.pop_int()?;
        let lhs = self.pop_int()?;
        let ty = lhs.get_type();

        let zero = b.build_int_compare(IntPredicate::EQ, rhs, ty.const_zero(), "div_zero")?;
        self.raise_exception(ExceptionId::IntegerDivideByZero, Some(zero))?;

        let b = &self.cc.builder;
        let result: IntValue<'ctx> = if signed {
            let min = ty.const_int(
                if ty.get_bit_width() == 32 { u64::from(i32::MIN as u32) } else { i64::MIN as u64 },
                false,
            );
            let minus_one = ty.const_all_ones();
            if is_rem {
                let is_m1 =
                    b.build_int_compare(IntPredicate::EQ, rhs, minus_one, "rem_m1")?;
                let safe_rhs = b
                    .build_select(is_m1, ty.const_int(1, false), rhs, "rem_safe_rhs")?
                    .into_int_value();
                let rem = b.build_int_signed_rem(lhs, safe_rhs, "srem")?;
                b.build_select(is_m1, ty.const_zero(), rem, "rem_result")?
                    .into_int_value()
            } else {
                let lhs_min = b.build_int_compare(IntPredicate::EQ, lhs, min, "div_lhs_min")?;
                let rhs_m1 =
                    b.build_int_compare(IntPredicate::EQ, rhs, minus_one, "div_rhs_m1")?;
                let overflow = b.build_and(lhs_min, rhs_m1, "div_overflow")?;
                self.raise_exception(ExceptionId::IntegerOverflow, Some(overflow))?;
                self.cc.builder.build_int_signed_div(lhs, rhs, "sdiv")?
            }
        } else if is_rem {
            b.build_int_unsigned_rem(lhs, rhs, "urem")?
        } else {
            b.build_int_unsigned_div(lhs, rhs, "udiv")?
        };
        self.push(result.into());
        Ok(())
    }

    // ── float helpers ──

    fn emit_float_unary_intrinsic(&mut self, name: &str) -> Result<()> {
        let v = self.pop_float()?;
        let r = self.call_intrinsic(name, &[v.get_type().into()], &[v.into()])?;
        self.push(r);
        Ok(())
    }

    fn emit_float_binary_intrinsic(&mut self, name: &str) -> Result<()> {
        let rhs = self.pop_float()?;
        let lhs = self.pop_float()?;
        let r = self.call_intrinsic(name, &[lhs.get_type().into()], &[lhs.into(), rhs.into()])?;
        self.push(r);
        Ok(())
    }

    fn emit_float_binop<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(
            &inkwell::builder::Builder<'ctx>,
            FloatValue<'ctx>,
            FloatValue<'ctx>,
        ) -> Result<FloatValue<'ctx>>,
    {
        let rhs = self.pop_float()?;
        let lhs = self.pop_float()?;
        let r = f(&self.cc.builder, lhs, rhs)?;
        self.push(r.into());
        Ok(())
    }

    /// Trap-checked float→int truncation: NaN raises
    /// `InvalidConversionToInteger`, out-of-range raises `IntegerOverflow`.
    fn emit_float_to_int(
        &mut self,
        src: FloatType<'ctx>,
        dst: IntType<'ctx>,
        signed: bool,
    ) -> Result<()> {
        let v = self.pop_float()?;

        let nan = self.cc.builder.build_float_compare(FloatPredicate::UNO, v, v, "is_nan")?;
        self.raise_exception(ExceptionId::InvalidConversionToInteger, Some(nan))?;

        let is_f32 = src == self.cc.f32t();
        let is_32 = dst.get_bit_width() == 32;
        let (min, max) = match (is_32, signed, is_f32) {
            (true, true, true) => (-2_147_483_904.0, 2_147_483_648.0),
            (true, true, false) => (-2_147_483_649.0, 2_147_483_648.0),
            (true, false, _) => (-1.0, 4_294_967_296.0),
            (false, true, true) => (-9_223_373_136_366_403_584.0, 9_223_372_036_854_775_808.0),
            (false, true, false) => (-9_223_372_036_854_777_856.0, 9_223_372_036_854_775_808.0),
            (false, false, _) => (-1.0, 18_446_744_073_709_551_616.0),
        };
        let b = &self.cc.builder;
        let too_low =
            b.build_float_compare(FloatPredicate::OLE, v, src.const_float(min), "trunc_low")?;
        let too_high =
            b.build_float_compare(FloatPredicate::OGE, v, src.const_float(max), "trunc_high")?;
        let out_of_range = b.build_or(too_low, too_high, "trunc_range")?;
        self.raise_exception(ExceptionId::IntegerOverflow, Some(out_of_range))?;

        let b = &self.cc.builder;
        let r = if signed {
            b.build_float_to_signed_int(v, dst, "fptosi")?
        } else {
            b.build_float_to_unsigned_int(v, dst, "fptoui")?
        };
        self.push(r.into());
        Ok(())
    }

    pub(super) fn emit_trunc_sat(&mut self, subop: u32) -> Result<()> {
        let (src, dst, signed): (BasicTypeEnum<'ctx>, IntType<'ctx>, bool) = match subop {
            op::MISC_I32_TRUNC_SAT_F32_S => (self.cc.f32t().into(), self.cc.i32t(), true),
            op::MISC_I32_TRUNC_SAT_F32_U => (self.cc.f32t().into(), self.cc.i32t(), false),
            op::MISC_I32_TRUNC_SAT_F64_S => (self.cc.f64t().into(), self.cc.i32t(), true),
            op::MISC_I32_TRUNC_SAT_F64_U => (self.cc.f64t().into(), self.cc.i32t(), false),
            op::MISC_I64_TRUNC_SAT_F32_S => (self.cc.f32t().into(), self.cc.i64t(), true),
            op::MISC_I64_TRUNC_SAT_F32_U => (self.cc.f32t().into(), self.cc.i64t(), false),
            op::MISC_I64_TRUNC_SAT_F64_S => (self.cc.f64t().into(), self.cc.i64t(), true),
            _ => (self.cc.f64t().into(), self.cc.i64t(), false),
        };
        let v = self.pop_float()?;
        let name = if signed { "llvm.fptosi.sat" } else { "llvm.fptoui.sat" };
        let r = self.call_intrinsic(name, &[dst.into(), src], &[v.into()])?;
        self.push(r);
        Ok(())
    }

    fn emit_int_to_float(&mut self, dst: FloatType<'ctx>, signed: bool) -> Result<()> {
        let v = self.pop_int()?;
        let r = if signed {
            self.cc.builder.build_signed_int_to_float(v, dst, "sitofp")?
        } else {
            self.cc.builder.build_unsigned_int_to_float(v, dst, "uitofp")?
        };
        self.push(r.into());
        Ok(())
    }

    fn emit_bitcast(&mut self, dst: BasicTypeEnum<'ctx>) -> Result<()> {
        let v = self.pop()?;
        let r = self.cc.builder.build_bit_cast(v, dst, "reinterpret")?;
        self.push(r);
        Ok(())
    }

    fn emit_sign_extend_inner(&mut self, ty: IntType<'ctx>, from_bits: u32) -> Result<()> {
        let v = self.pop_int()?;
        let narrow_ty = self.cc.context.custom_width_int_type(from_bits);
        let narrow = self.cc.builder.build_int_truncate(v, narrow_ty, "se_narrow")?;
        let r = self.cc.builder.build_int_s_extend(narrow, ty, "se_wide")?;
        self.push(r.into());
        Ok(())
    }

    // ── v128 subset ──

    fn lane_vec_type(&self, subop: u32) -> VectorType<'ctx> {
        match subop {
            op::SIMD_I8X16_SPLAT
            | op::SIMD_I8X16_EXTRACT_LANE_S
            | op::SIMD_I8X16_EXTRACT_LANE_U
            | op::SIMD_I8X16_REPLACE_LANE
            | op::SIMD_I8X16_ADD
            | op::SIMD_I8X16_SUB => self.cc.i8t().vec_type(16),
            op::SIMD_I16X8_SPLAT
            | op::SIMD_I16X8_EXTRACT_LANE_S
            | op::SIMD_I16X8_EXTRACT_LANE_U
            | op::SIMD_I16X8_REPLACE_LANE
            | op::SIMD_I16X8_ADD
            | op::SIMD_I16X8_SUB
            | op::SIMD_I16X8_MUL => self.cc.context.i16_type().vec_type(8),
            op::SIMD_I32X4_SPLAT
            | op::SIMD_I32X4_EXTRACT_LANE
            | op::SIMD_I32X4_REPLACE_LANE
            | op::SIMD_I32X4_ADD
            | op::SIMD_I32X4_SUB
            | op::SIMD_I32X4_MUL => self.cc.i32t().vec_type(4),
            op::SIMD_F32X4_SPLAT | op::SIMD_F32X4_EXTRACT_LANE | op::SIMD_F32X4_REPLACE_LANE => {
                self.cc.f32t().vec_type(4)
            }
            op::SIMD_F64X2_SPLAT | op::SIMD_F64X2_EXTRACT_LANE | op::SIMD_F64X2_REPLACE_LANE => {
                self.cc.f64t().vec_type(2)
            }
            _ => self.cc.v128t(),
        }
    }

    fn pop_v128_as(&mut self, vec_ty: VectorType<'ctx>) -> Result<VectorValue<'ctx>> {
        let v = self.pop()?;
        Ok(self
            .cc
            .builder
            .build_bit_cast(v, vec_ty, "v128_cast")?
            .into_vector_value())
    }

    fn push_v128(&mut self, v: VectorValue<'ctx>) -> Result<()> {
        let r = self.cc.builder.build_bit_cast(v, self.cc.v128t(), "v128_repr")?;
        self.push(r);
        Ok(())
    }

    pub(super) fn emit_simd_op(&mut self, subop: u32, r: &mut Reader<'_>) -> Result<()> {
        if !self.cc.options.enable_simd {
            return Err(Error::Unsupported("SIMD is disabled".into()));
        }
        match subop {
            op::SIMD_V128_LOAD => {
                let _align = r.read_leb_u32()?;
                let offset = r.read_leb_mem_offset(self.wasm.is_memory64())?;
                let ptr = self.emit_check_memory_access(offset, 16)?;
                let v = self.cc.builder.build_load(self.cc.v128t(), ptr, "v128_load")?;
                if let Some(inst) = v.as_instruction_value() {
                    inst.set_alignment(1).map_err(|e| Error::Llvm(e.to_string()))?;
                }
                self.push(v);
                Ok(())
            }
            op::SIMD_V128_STORE => {
                let _align = r.read_leb_u32()?;
                let offset = r.read_leb_mem_offset(self.wasm.is_memory64())?;
                let value = self.pop()?;
                let ptr = self.emit_check_memory_access(offset, 16)?;
                let inst = self.cc.builder.build_store(ptr, value)?;
                inst.set_alignment(1).map_err(|e| Error::Llvm(e.to_string()))?;
                Ok(())
            }
            op::SIMD_V128_CONST => {
                let bytes = r.read_v128()?;
                let lo = u64::from_le_bytes(bytes[0..8].try_into().unwrap_or_default());
                let hi = u64::from_le_bytes(bytes[8..16].try_into().unwrap_or_default());
                let i64t = self.cc.i64t();
                let v = VectorType::const_vector(&[
                    i64t.const_int(lo, false),
                    i64t.const_int(hi, false),
                ]);
                self.push(v.into());
                Ok(())
            }

            op::SIMD_I8X16_SPLAT | op::SIMD_I16X8_SPLAT | op::SIMD_I32X4_SPLAT
            | op::SIMD_I64X2_SPLAT | op::SIMD_F32X4_SPLAT | op::SIMD_F64X2_SPLAT => {
                let vec_ty = if subop == op::SIMD_I64X2_SPLAT {
                    self.cc.v128t()
                } else {
                    self.lane_vec_type(subop)
                };
                let scalar = self.pop()?;
                let scalar: BasicValueEnum<'ctx> = match subop {
                    op::SIMD_I8X16_SPLAT => self
                        .cc
                        .builder
                        .build_int_truncate(scalar.into_int_value(), self.cc.i8t(), "splat_i8")?
                        .into(),
                    op::SIMD_I16X8_SPLAT => self
                        .cc
                        .builder
                        .build_int_truncate(
                            scalar.into_int_value(),
                            self.cc.context.i16_type(),
                            "splat_i16",
                        )?
                        .into(),
                    _ => scalar,
                };
                let mut vec = Self::undef_value(vec_ty.into()).into_vector_value();
                for lane in 0..vec_ty.get_size() {
                    let idx = self.cc.i32t().const_int(u64::from(lane), false);
                    vec = self
                        .cc
                        .builder
                        .build_insert_element(vec, scalar, idx, "splat")?;
                }
                self.push_v128(vec)
            }

            op::SIMD_I8X16_EXTRACT_LANE_S | op::SIMD_I8X16_EXTRACT_LANE_U
            | op::SIMD_I16X8_EXTRACT_LANE_S | op::SIMD_I16X8_EXTRACT_LANE_U
            | op::SIMD_I32X4_EXTRACT_LANE | op::SIMD_I64X2_EXTRACT_LANE
            | op::SIMD_F32X4_EXTRACT_LANE | op::SIMD_F64X2_EXTRACT_LANE => {
                let lane = r.read_u8()?;
                let vec_ty = self.lane_vec_type(subop);
                let vec = self.pop_v128_as(vec_ty)?;
                let idx = self.cc.i32t().const_int(u64::from(lane), false);
                let value = self.cc.builder.build_extract_element(vec, idx, "extract_lane")?;
                let value = match subop {
                    op::SIMD_I8X16_EXTRACT_LANE_S | op::SIMD_I16X8_EXTRACT_LANE_S => self
                        .cc
                        .builder
                        .build_int_s_extend(value.into_int_value(), self.cc.i32t(), "lane_s")?
                        .into(),
                    op::SIMD_I8X16_EXTRACT_LANE_U | op::SIMD_I16X8_EXTRACT_LANE_U => self
                        .cc
                        .builder
                        .build_int_z_extend(value.into_int_value(), self.cc.i32t(), "lane_u")?
                        .into(),
                    _ => value,
                };
                self.push(value);
                Ok(())
            }

            op::SIMD_I8X16_REPLACE_LANE | op::SIMD_I16X8_REPLACE_LANE
            | op::SIMD_I32X4_REPLACE_LANE | op::SIMD_I64X2_REPLACE_LANE
            | op::SIMD_F32X4_REPLACE_LANE | op::SIMD_F64X2_REPLACE_LANE => {
                let lane = r.read_u8()?;
                let vec_ty = self.lane_vec_type(subop);
                let value = self.pop()?;
                let vec = self.pop_v128_as(vec_ty)?;
                let value: BasicValueEnum<'ctx> = match subop {
                    op::SIMD_I8X16_REPLACE_LANE => self
                        .cc
                        .builder
                        .build_int_truncate(value.into_int_value(), self.cc.i8t(), "lane_i8")?
                        .into(),
                    op::SIMD_I16X8_REPLACE_LANE => self
                        .cc
                        .builder
                        .build_int_truncate(
                            value.into_int_value(),
                            self.cc.context.i16_type(),
                            "lane_i16",
                        )?
                        .into(),
                    _ => value,
                };
                let idx = self.cc.i32t().const_int(u64::from(lane), false);
                let vec = self.cc.builder.build_insert_element(vec, value, idx, "replace_lane")?;
                self.push_v128(vec)
            }

            op::SIMD_V128_NOT => {
                let v = self.pop_v128_as(self.cc.v128t())?;
                let ones = self.cc.i64t().const_all_ones();
                let all_ones = VectorType::const_vector(&[ones, ones]);
                let r = self.cc.builder.build_xor(v, all_ones, "v128_not")?;
                self.push_v128(r)
            }
            op::SIMD_V128_AND | op::SIMD_V128_ANDNOT | op::SIMD_V128_OR | op::SIMD_V128_XOR => {
                let rhs = self.pop_v128_as(self.cc.v128t())?;
                let lhs = self.pop_v128_as(self.cc.v128t())?;
                let result = match subop {
                    op::SIMD_V128_AND => self.cc.builder.build_and(lhs, rhs, "v128_and")?,
                    op::SIMD_V128_OR => self.cc.builder.build_or(lhs, rhs, "v128_or")?,
                    op::SIMD_V128_XOR => self.cc.builder.build_xor(lhs, rhs, "v128_xor")?,
                    _ => {
                        let ones = self.cc.i64t().const_all_ones();
                        let all_ones = VectorType::const_vector(&[ones, ones]);
                        let not_rhs = self.cc.builder.build_xor(rhs, all_ones, "v128_nrhs")?;
                        self.cc.builder.build_and(lhs, not_rhs, "v128_andnot")?
                    }
                };
                self.push_v128(result)
            }

            op::SIMD_I8X16_ADD | op::SIMD_I16X8_ADD | op::SIMD_I32X4_ADD | op::SIMD_I64X2_ADD
            | op::SIMD_I8X16_SUB | op::SIMD_I16X8_SUB | op::SIMD_I32X4_SUB | op::SIMD_I64X2_SUB
            | op::SIMD_I16X8_MUL | op::SIMD_I32X4_MUL | op::SIMD_I64X2_MUL => {
                let vec_ty = self.lane_vec_type(subop);
                let rhs = self.pop_v128_as(vec_ty)?;
                let lhs = self.pop_v128_as(vec_ty)?;
                let result = match subop {
                    op::SIMD_I8X16_ADD | op::SIMD_I16X8_ADD | op::SIMD_I32X4_ADD
                    | op::SIMD_I64X2_ADD => self.cc.builder.build_int_add(lhs, rhs, "v_add")?,
                    op::SIMD_I8X16_SUB | op::SIMD_I16X8_SUB | op::SIMD_I32X4_SUB
                    | op::SIMD_I64X2_SUB => self.cc.builder.build_int_sub(lhs, rhs, "v_sub")?,
                    _ => self.cc.builder.build_int_mul(lhs, rhs, "v_mul")?,
                };
                self.push_v128(result)
            }

            _ => Err(Error::Unsupported(format!("opcode 0xfd 0x{subop:02x}"))),
        }
    }
}
