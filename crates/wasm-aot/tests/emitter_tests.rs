//! Emitted-IR structure: the runtime global set, the instance lifecycle
//! functions, and the trap paths of representative opcodes.

use wasm_aot::test_harness::*;
use wasm_aot::CompOptions;

const FIXTURE: &str = r#"
    (module
        (import "env" "printf" (func $printf (param i32 i32) (result i32)))
        (memory 1 1)
        (table 2 funcref)
        (global $g (mut i32) (i32.const 7))
        (data (i32.const 16) "Hello world!\n")
        (elem (i32.const 0) func $main $add)
        (func $main (export "main") (param i32 i32) (result i32)
            i32.const 16
            i32.const 0
            call $printf
        )
        (func $add (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add
        )
    )
"#;

#[test]
fn runtime_globals_exist_with_stated_shapes() {
    with_compiled_wat(FIXTURE, CompOptions::default(), |module| {
        for name in [
            "memory_data",
            "memory_data_size",
            "num_bytes_per_page",
            "cur_page_count",
            "max_page_count",
            "host_managed_heap_handle",
            "mem_bound_check_1byte",
            "mem_bound_check_2bytes",
            "mem_bound_check_4bytes",
            "mem_bound_check_8bytes",
            "mem_bound_check_16bytes",
            "data_segs",
            "data_seg_lengths_passive",
            "table_elems",
            "func_ptrs",
            "func_type_indexes",
            "exception_msgs",
            "exception_id",
            "is_instance_inited",
            "exported_apis",
            "wasm_global#0",
            "data_seg#0",
        ] {
            let Some(global) = module.get_global(name) else {
                panic!("missing runtime global {name}");
            };
            if name != "data_seg#0" {
                let section = global
                    .get_section()
                    .map(|s| s.to_string_lossy().into_owned());
                assert_eq!(
                    section,
                    Some(".wasm_globals".to_string()),
                    "global {name} must live in .wasm_globals"
                );
            }
        }
    })
    .expect("fixture must compile");
}

#[test]
fn instance_lifecycle_functions_exist() {
    with_compiled_wat(FIXTURE, CompOptions::default(), |module| {
        for name in [
            "wasm_instance_create",
            "wasm_instance_destroy",
            "wasm_instance_is_created",
            "wasm_get_memory",
            "wasm_get_memory_size",
            "wasm_get_heap_handle",
            "wasm_get_exception",
            "wasm_get_exception_msg",
            "wasm_set_exception",
            "wasm_get_export_apis",
            "wasm_get_export_api_num",
        ] {
            assert!(module.get_function(name).is_some(), "missing function {name}");
        }
        // One function per wasm function, named by local index.
        assert!(module.get_function("wasm_func#0").is_some());
        assert!(module.get_function("wasm_func#1").is_some());
        // The resolved native import is declared by its table name.
        assert!(module.get_function("printf").is_some());
    })
    .expect("fixture must compile");
}

#[test]
fn constructor_allocates_and_copies_data() {
    let ir = compile_wat_to_ir(FIXTURE, &CompOptions::default()).expect("compile");
    assert!(ir.contains("wasm_instance_create"));
    assert!(ir.contains("call ptr @malloc"));
    assert!(ir.contains("llvm.memcpy"), "data segments are copied with memcpy");
    assert!(ir.contains("@is_instance_inited"));
}

#[test]
fn division_by_zero_routes_through_the_exception_block() {
    let wat = r#"
        (module
            (func (export "main") (result i32)
                i32.const 1
                i32.const 0
                i32.div_s
            )
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    assert!(ir.contains("got_exception"));
    // EXCE_INTEGER_DIVIDE_BY_ZERO
    assert!(ir.contains("-96"), "divide-by-zero exception id must appear");
    assert!(ir.contains("@exception_id"));
}

#[test]
fn memory_access_is_bound_checked() {
    let wat = r#"
        (module
            (memory 1)
            (func (export "peek") (param i32) (result i32)
                local.get 0
                i32.load
            )
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    assert!(ir.contains("@mem_bound_check_4bytes"));
    // EXCE_OUT_OF_BOUNDS_MEMORY_ACCESS
    assert!(ir.contains("-99"));
}

#[test]
fn unreachable_stores_its_exception_id() {
    let wat = r#"(module (func (export "dead") unreachable))"#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    // EXCE_UNREACHABLE
    assert!(ir.contains("-100"));
}

#[test]
fn call_indirect_checks_the_full_chain() {
    let wat = r#"
        (module
            (table 2 funcref)
            (func $f (result i32) i32.const 3)
            (elem (i32.const 0) func $f)
            (func (export "dispatch") (param i32) (result i32)
                local.get 0
                call_indirect (result i32)
            )
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    assert!(ir.contains("@table_elems"));
    assert!(ir.contains("@func_type_indexes"));
    assert!(ir.contains("@func_ptrs"));
    // undefined element, uninitialized element, bad type index
    assert!(ir.contains("-93"));
    assert!(ir.contains("-92"));
    assert!(ir.contains("-94"));
}

#[test]
fn memory_grow_refreshes_the_bound_checks() {
    let wat = r#"
        (module
            (memory 1 4)
            (func (export "grow") (param i32) (result i32)
                local.get 0
                memory.grow
            )
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    assert!(ir.contains("call ptr @realloc"));
    for name in [
        "mem_bound_check_1byte",
        "mem_bound_check_2bytes",
        "mem_bound_check_4bytes",
        "mem_bound_check_8bytes",
        "mem_bound_check_16bytes",
    ] {
        assert!(ir.contains(name), "grow must refresh {name}");
    }
}

#[test]
fn unresolved_import_warns_at_instance_creation() {
    let wat = r#"
        (module
            (import "env" "mystery_host_call" (func $m (param i32)))
            (func (export "main") i32.const 1 call $m)
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    assert!(ir.contains("warning: failed to link import function (env, mystery_host_call)"));
    assert!(ir.contains("call i32 @puts"));
    // The direct call goes through func_ptrs with a null check.
    assert!(ir.contains("-91"));
}

#[test]
fn export_api_table_carries_names_and_signatures() {
    with_compiled_wat(FIXTURE, CompOptions::default(), |module| {
        let apis = module.get_global("exported_apis").expect("exported_apis");
        let _ = apis;
        let num = module.get_function("wasm_get_export_api_num").expect("num fn");
        assert_eq!(num.count_params(), 0);
    })
    .expect("fixture must compile");

    let ir = compile_wat_to_ir(FIXTURE, &CompOptions::default()).expect("compile");
    // Signature string of (i32,i32)->i32.
    assert!(ir.contains("(ii)i"));
}

#[test]
fn no_sandbox_mode_registers_global_ctors() {
    let wat = r#"
        (module
            (memory 1 1)
            (func (export "main") (result i32) i32.const 0)
        )
    "#;
    let options = CompOptions { no_sandbox_mode: true, ..CompOptions::default() };
    let ir = compile_wat_to_ir(wat, &options).expect("compile");
    assert!(ir.contains("llvm.global_ctors"));
    assert!(ir.contains("llvm.global_dtors"));
    assert!(ir.contains("65535"));
    // No bound-check globals in no-sandbox mode.
    assert!(!ir.contains("mem_bound_check"));
}

#[test]
fn multi_value_results_use_out_pointers() {
    let wat = r#"
        (module
            (func (export "pair") (result i32 i64)
                i32.const 1
                i64.const 2
            )
        )
    "#;
    let ir = compile_wat_to_ir(wat, &CompOptions::default()).expect("compile");
    // First result by value, second through a pointer parameter.
    assert!(ir.contains("define internal i32 @\"wasm_func#0\"(ptr"));
}
