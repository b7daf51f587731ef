//! WebAssembly opcode bytes plus the extended opcode space the validator
//! rewrites into.
//!
//! The extended opcodes live in the unassigned 0xd3..0xda range. They are
//! only ever produced by the validator (the binary format never contains
//! them) and let the emitter skip re-deriving information the validator
//! already computed: block types encoded as type indices, 64-bit variants
//! of polymorphic stack ops, and `br_table` depth vectors too wide for a
//! single byte.

pub const UNREACHABLE: u8 = 0x00;
pub const NOP: u8 = 0x01;
pub const BLOCK: u8 = 0x02;
pub const LOOP: u8 = 0x03;
pub const IF: u8 = 0x04;
pub const ELSE: u8 = 0x05;
pub const END: u8 = 0x0b;
pub const BR: u8 = 0x0c;
pub const BR_IF: u8 = 0x0d;
pub const BR_TABLE: u8 = 0x0e;
pub const RETURN: u8 = 0x0f;
pub const CALL: u8 = 0x10;
pub const CALL_INDIRECT: u8 = 0x11;
pub const RETURN_CALL: u8 = 0x12;
pub const RETURN_CALL_INDIRECT: u8 = 0x13;

pub const DROP: u8 = 0x1a;
pub const SELECT: u8 = 0x1b;
pub const SELECT_T: u8 = 0x1c;

pub const LOCAL_GET: u8 = 0x20;
pub const LOCAL_SET: u8 = 0x21;
pub const LOCAL_TEE: u8 = 0x22;
pub const GLOBAL_GET: u8 = 0x23;
pub const GLOBAL_SET: u8 = 0x24;

pub const I32_LOAD: u8 = 0x28;
pub const I64_LOAD: u8 = 0x29;
pub const F32_LOAD: u8 = 0x2a;
pub const F64_LOAD: u8 = 0x2b;
pub const I32_LOAD8_S: u8 = 0x2c;
pub const I32_LOAD8_U: u8 = 0x2d;
pub const I32_LOAD16_S: u8 = 0x2e;
pub const I32_LOAD16_U: u8 = 0x2f;
pub const I64_LOAD8_S: u8 = 0x30;
pub const I64_LOAD8_U: u8 = 0x31;
pub const I64_LOAD16_S: u8 = 0x32;
pub const I64_LOAD16_U: u8 = 0x33;
pub const I64_LOAD32_S: u8 = 0x34;
pub const I64_LOAD32_U: u8 = 0x35;
pub const I32_STORE: u8 = 0x36;
pub const I64_STORE: u8 = 0x37;
pub const F32_STORE: u8 = 0x38;
pub const F64_STORE: u8 = 0x39;
pub const I32_STORE8: u8 = 0x3a;
pub const I32_STORE16: u8 = 0x3b;
pub const I64_STORE8: u8 = 0x3c;
pub const I64_STORE16: u8 = 0x3d;
pub const I64_STORE32: u8 = 0x3e;
pub const MEMORY_SIZE: u8 = 0x3f;
pub const MEMORY_GROW: u8 = 0x40;

pub const I32_CONST: u8 = 0x41;
pub const I64_CONST: u8 = 0x42;
pub const F32_CONST: u8 = 0x43;
pub const F64_CONST: u8 = 0x44;

pub const I32_EQZ: u8 = 0x45;
pub const I32_EQ: u8 = 0x46;
pub const I32_NE: u8 = 0x47;
pub const I32_LT_S: u8 = 0x48;
pub const I32_LT_U: u8 = 0x49;
pub const I32_GT_S: u8 = 0x4a;
pub const I32_GT_U: u8 = 0x4b;
pub const I32_LE_S: u8 = 0x4c;
pub const I32_LE_U: u8 = 0x4d;
pub const I32_GE_S: u8 = 0x4e;
pub const I32_GE_U: u8 = 0x4f;
pub const I64_EQZ: u8 = 0x50;
pub const I64_EQ: u8 = 0x51;
pub const I64_NE: u8 = 0x52;
pub const I64_LT_S: u8 = 0x53;
pub const I64_LT_U: u8 = 0x54;
pub const I64_GT_S: u8 = 0x55;
pub const I64_GT_U: u8 = 0x56;
pub const I64_LE_S: u8 = 0x57;
pub const I64_LE_U: u8 = 0x58;
pub const I64_GE_S: u8 = 0x59;
pub const I64_GE_U: u8 = 0x5a;
pub const F32_EQ: u8 = 0x5b;
pub const F32_NE: u8 = 0x5c;
pub const F32_LT: u8 = 0x5d;
pub const F32_GT: u8 = 0x5e;
pub const F32_LE: u8 = 0x5f;
pub const F32_GE: u8 = 0x60;
pub const F64_EQ: u8 = 0x61;
pub const F64_NE: u8 = 0x62;
pub const F64_LT: u8 = 0x63;
pub const F64_GT: u8 = 0x64;
pub const F64_LE: u8 = 0x65;
pub const F64_GE: u8 = 0x66;

pub const I32_CLZ: u8 = 0x67;
pub const I32_CTZ: u8 = 0x68;
pub const I32_POPCNT: u8 = 0x69;
pub const I32_ADD: u8 = 0x6a;
pub const I32_SUB: u8 = 0x6b;
pub const I32_MUL: u8 = 0x6c;
pub const I32_DIV_S: u8 = 0x6d;
pub const I32_DIV_U: u8 = 0x6e;
pub const I32_REM_S: u8 = 0x6f;
pub const I32_REM_U: u8 = 0x70;
pub const I32_AND: u8 = 0x71;
pub const I32_OR: u8 = 0x72;
pub const I32_XOR: u8 = 0x73;
pub const I32_SHL: u8 = 0x74;
pub const I32_SHR_S: u8 = 0x75;
pub const I32_SHR_U: u8 = 0x76;
pub const I32_ROTL: u8 = 0x77;
pub const I32_ROTR: u8 = 0x78;
pub const I64_CLZ: u8 = 0x79;
pub const I64_CTZ: u8 = 0x7a;
pub const I64_POPCNT: u8 = 0x7b;
pub const I64_ADD: u8 = 0x7c;
pub const I64_SUB: u8 = 0x7d;
pub const I64_MUL: u8 = 0x7e;
pub const I64_DIV_S: u8 = 0x7f;
pub const I64_DIV_U: u8 = 0x80;
pub const I64_REM_S: u8 = 0x81;
pub const I64_REM_U: u8 = 0x82;
pub const I64_AND: u8 = 0x83;
pub const I64_OR: u8 = 0x84;
pub const I64_XOR: u8 = 0x85;
pub const I64_SHL: u8 = 0x86;
pub const I64_SHR_S: u8 = 0x87;
pub const I64_SHR_U: u8 = 0x88;
pub const I64_ROTL: u8 = 0x89;
pub const I64_ROTR: u8 = 0x8a;

pub const F32_ABS: u8 = 0x8b;
pub const F32_NEG: u8 = 0x8c;
pub const F32_CEIL: u8 = 0x8d;
pub const F32_FLOOR: u8 = 0x8e;
pub const F32_TRUNC: u8 = 0x8f;
pub const F32_NEAREST: u8 = 0x90;
pub const F32_SQRT: u8 = 0x91;
pub const F32_ADD: u8 = 0x92;
pub const F32_SUB: u8 = 0x93;
pub const F32_MUL: u8 = 0x94;
pub const F32_DIV: u8 = 0x95;
pub const F32_MIN: u8 = 0x96;
pub const F32_MAX: u8 = 0x97;
pub const F32_COPYSIGN: u8 = 0x98;
pub const F64_ABS: u8 = 0x99;
pub const F64_NEG: u8 = 0x9a;
pub const F64_CEIL: u8 = 0x9b;
pub const F64_FLOOR: u8 = 0x9c;
pub const F64_TRUNC: u8 = 0x9d;
pub const F64_NEAREST: u8 = 0x9e;
pub const F64_SQRT: u8 = 0x9f;
pub const F64_ADD: u8 = 0xa0;
pub const F64_SUB: u8 = 0xa1;
pub const F64_MUL: u8 = 0xa2;
pub const F64_DIV: u8 = 0xa3;
pub const F64_MIN: u8 = 0xa4;
pub const F64_MAX: u8 = 0xa5;
pub const F64_COPYSIGN: u8 = 0xa6;

pub const I32_WRAP_I64: u8 = 0xa7;
pub const I32_TRUNC_F32_S: u8 = 0xa8;
pub const I32_TRUNC_F32_U: u8 = 0xa9;
pub const I32_TRUNC_F64_S: u8 = 0xaa;
pub const I32_TRUNC_F64_U: u8 = 0xab;
pub const I64_EXTEND_I32_S: u8 = 0xac;
pub const I64_EXTEND_I32_U: u8 = 0xad;
pub const I64_TRUNC_F32_S: u8 = 0xae;
pub const I64_TRUNC_F32_U: u8 = 0xaf;
pub const I64_TRUNC_F64_S: u8 = 0xb0;
pub const I64_TRUNC_F64_U: u8 = 0xb1;
pub const F32_CONVERT_I32_S: u8 = 0xb2;
pub const F32_CONVERT_I32_U: u8 = 0xb3;
pub const F32_CONVERT_I64_S: u8 = 0xb4;
pub const F32_CONVERT_I64_U: u8 = 0xb5;
pub const F32_DEMOTE_F64: u8 = 0xb6;
pub const F64_CONVERT_I32_S: u8 = 0xb7;
pub const F64_CONVERT_I32_U: u8 = 0xb8;
pub const F64_CONVERT_I64_S: u8 = 0xb9;
pub const F64_CONVERT_I64_U: u8 = 0xba;
pub const F64_PROMOTE_F32: u8 = 0xbb;
pub const I32_REINTERPRET_F32: u8 = 0xbc;
pub const I64_REINTERPRET_F64: u8 = 0xbd;
pub const F32_REINTERPRET_I32: u8 = 0xbe;
pub const F64_REINTERPRET_I64: u8 = 0xbf;

pub const I32_EXTEND8_S: u8 = 0xc0;
pub const I32_EXTEND16_S: u8 = 0xc1;
pub const I64_EXTEND8_S: u8 = 0xc2;
pub const I64_EXTEND16_S: u8 = 0xc3;
pub const I64_EXTEND32_S: u8 = 0xc4;

// Validator-produced extended opcodes (not part of the binary format).
pub const EXT_OP_BLOCK: u8 = 0xd3;
pub const EXT_OP_LOOP: u8 = 0xd4;
pub const EXT_OP_IF: u8 = 0xd5;
pub const EXT_OP_BR_TABLE_CACHE: u8 = 0xd6;
pub const EXT_OP_DROP_64: u8 = 0xd7;
pub const EXT_OP_SELECT_64: u8 = 0xd8;
pub const EXT_OP_GLOBAL_GET_64: u8 = 0xd9;
pub const EXT_OP_GLOBAL_SET_64: u8 = 0xda;
pub const EXT_OP_GLOBAL_SET_AUX_STACK: u8 = 0xdb;

// Prefix bytes.
pub const PREFIX_MISC: u8 = 0xfc;
pub const PREFIX_SIMD: u8 = 0xfd;
pub const PREFIX_ATOMIC: u8 = 0xfe;

// 0xFC sub-opcodes.
pub const MISC_I32_TRUNC_SAT_F32_S: u32 = 0x00;
pub const MISC_I32_TRUNC_SAT_F32_U: u32 = 0x01;
pub const MISC_I32_TRUNC_SAT_F64_S: u32 = 0x02;
pub const MISC_I32_TRUNC_SAT_F64_U: u32 = 0x03;
pub const MISC_I64_TRUNC_SAT_F32_S: u32 = 0x04;
pub const MISC_I64_TRUNC_SAT_F32_U: u32 = 0x05;
pub const MISC_I64_TRUNC_SAT_F64_S: u32 = 0x06;
pub const MISC_I64_TRUNC_SAT_F64_U: u32 = 0x07;
pub const MISC_MEMORY_INIT: u32 = 0x08;
pub const MISC_DATA_DROP: u32 = 0x09;
pub const MISC_MEMORY_COPY: u32 = 0x0a;
pub const MISC_MEMORY_FILL: u32 = 0x0b;

// 0xFD sub-opcodes (the lowered subset).
pub const SIMD_V128_LOAD: u32 = 0x00;
pub const SIMD_V128_STORE: u32 = 0x0b;
pub const SIMD_V128_CONST: u32 = 0x0c;
pub const SIMD_I8X16_EXTRACT_LANE_S: u32 = 0x15;
pub const SIMD_I8X16_EXTRACT_LANE_U: u32 = 0x16;
pub const SIMD_I8X16_REPLACE_LANE: u32 = 0x17;
pub const SIMD_I16X8_EXTRACT_LANE_S: u32 = 0x18;
pub const SIMD_I16X8_EXTRACT_LANE_U: u32 = 0x19;
pub const SIMD_I16X8_REPLACE_LANE: u32 = 0x1a;
pub const SIMD_I32X4_EXTRACT_LANE: u32 = 0x1b;
pub const SIMD_I32X4_REPLACE_LANE: u32 = 0x1c;
pub const SIMD_I64X2_EXTRACT_LANE: u32 = 0x1d;
pub const SIMD_I64X2_REPLACE_LANE: u32 = 0x1e;
pub const SIMD_F32X4_EXTRACT_LANE: u32 = 0x1f;
pub const SIMD_F32X4_REPLACE_LANE: u32 = 0x20;
pub const SIMD_F64X2_EXTRACT_LANE: u32 = 0x21;
pub const SIMD_F64X2_REPLACE_LANE: u32 = 0x22;
pub const SIMD_V128_NOT: u32 = 0x4d;
pub const SIMD_V128_AND: u32 = 0x4e;
pub const SIMD_V128_ANDNOT: u32 = 0x4f;
pub const SIMD_V128_OR: u32 = 0x50;
pub const SIMD_V128_XOR: u32 = 0x51;
pub const SIMD_I8X16_SPLAT: u32 = 0x0f;
pub const SIMD_I16X8_SPLAT: u32 = 0x10;
pub const SIMD_I32X4_SPLAT: u32 = 0x11;
pub const SIMD_I64X2_SPLAT: u32 = 0x12;
pub const SIMD_F32X4_SPLAT: u32 = 0x13;
pub const SIMD_F64X2_SPLAT: u32 = 0x14;
pub const SIMD_I8X16_ADD: u32 = 0x6e;
pub const SIMD_I8X16_SUB: u32 = 0x71;
pub const SIMD_I16X8_ADD: u32 = 0x8e;
pub const SIMD_I16X8_SUB: u32 = 0x91;
pub const SIMD_I16X8_MUL: u32 = 0x95;
pub const SIMD_I32X4_ADD: u32 = 0xae;
pub const SIMD_I32X4_SUB: u32 = 0xb1;
pub const SIMD_I32X4_MUL: u32 = 0xb5;
pub const SIMD_I64X2_ADD: u32 = 0xce;
pub const SIMD_I64X2_SUB: u32 = 0xd1;
pub const SIMD_I64X2_MUL: u32 = 0xd5;

// 0xFE sub-opcodes.
pub const ATOMIC_NOTIFY: u32 = 0x00;
pub const ATOMIC_WAIT32: u32 = 0x01;
pub const ATOMIC_WAIT64: u32 = 0x02;
pub const ATOMIC_FENCE: u32 = 0x03;
pub const ATOMIC_I32_LOAD: u32 = 0x10;
pub const ATOMIC_I64_LOAD: u32 = 0x11;
pub const ATOMIC_I32_LOAD8_U: u32 = 0x12;
pub const ATOMIC_I32_LOAD16_U: u32 = 0x13;
pub const ATOMIC_I64_LOAD8_U: u32 = 0x14;
pub const ATOMIC_I64_LOAD16_U: u32 = 0x15;
pub const ATOMIC_I64_LOAD32_U: u32 = 0x16;
pub const ATOMIC_I32_STORE: u32 = 0x17;
pub const ATOMIC_I64_STORE: u32 = 0x18;
pub const ATOMIC_I32_STORE8: u32 = 0x19;
pub const ATOMIC_I32_STORE16: u32 = 0x1a;
pub const ATOMIC_I64_STORE8: u32 = 0x1b;
pub const ATOMIC_I64_STORE16: u32 = 0x1c;
pub const ATOMIC_I64_STORE32: u32 = 0x1d;
pub const ATOMIC_RMW_FIRST: u32 = 0x1e;
pub const ATOMIC_RMW_LAST: u32 = 0x4e;

/// Natural alignment (log2 of access width) for a plain memory opcode.
/// Returns `None` for opcodes that are not memory accesses.
pub fn natural_align(op: u8) -> Option<u32> {
    Some(match op {
        I32_LOAD | F32_LOAD | I64_LOAD32_S | I64_LOAD32_U | I32_STORE | F32_STORE
        | I64_STORE32 => 2,
        I64_LOAD | F64_LOAD | I64_STORE | F64_STORE => 3,
        I32_LOAD8_S | I32_LOAD8_U | I64_LOAD8_S | I64_LOAD8_U | I32_STORE8 | I64_STORE8 => 0,
        I32_LOAD16_S | I32_LOAD16_U | I64_LOAD16_S | I64_LOAD16_U | I32_STORE16
        | I64_STORE16 => 1,
        _ => return None,
    })
}

/// Natural alignment (log2) for an atomic (0xFE-prefixed) sub-opcode.
pub fn atomic_natural_align(subop: u32) -> Option<u32> {
    Some(match subop {
        ATOMIC_NOTIFY | ATOMIC_WAIT32 | ATOMIC_I32_LOAD | ATOMIC_I64_LOAD32_U
        | ATOMIC_I32_STORE | ATOMIC_I64_STORE32 => 2,
        ATOMIC_WAIT64 | ATOMIC_I64_LOAD | ATOMIC_I64_STORE => 3,
        ATOMIC_I32_LOAD8_U | ATOMIC_I64_LOAD8_U | ATOMIC_I32_STORE8 | ATOMIC_I64_STORE8 => 0,
        ATOMIC_I32_LOAD16_U | ATOMIC_I64_LOAD16_U | ATOMIC_I32_STORE16 | ATOMIC_I64_STORE16 => 1,
        ATOMIC_RMW_FIRST..=ATOMIC_RMW_LAST => {
            // RMW groups repeat in blocks of 7: full, 8u, 16u, 32u widths.
            match (subop - ATOMIC_RMW_FIRST) % 7 {
                // .rmw (i32 or i64 full width)
                0 => 2,
                1 => 3,
                2 | 4 => 0,
                3 | 5 => 1,
                _ => 2,
            }
        }
        _ => return None,
    })
}
