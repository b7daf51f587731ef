//! Load-failure behaviors at the binary level: malformed LEBs, bad UTF-8,
//! limit violations, and cross-section consistency checks.

use wasm_aot::test_harness::*;

fn leb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
    out
}

fn section(id: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![id];
    out.extend(leb(body.len() as u64));
    out.extend_from_slice(body);
    out
}

fn module_with(sections: &[Vec<u8>]) -> Vec<u8> {
    let mut out = vec![0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];
    for s in sections {
        out.extend_from_slice(s);
    }
    out
}

#[test]
fn import_name_with_overlong_nul_is_rejected() {
    // Import section with a module name encoded as the overlong sequence
    // C0 80.
    let mut body = leb(1);
    body.extend(leb(2));
    body.extend_from_slice(&[0xc0, 0x80]);
    body.extend(leb(1));
    body.extend_from_slice(b"f");
    body.push(0x00); // func import
    body.extend(leb(0));
    // A type section must precede so the type index resolves.
    let types = {
        let mut b = leb(1);
        b.extend_from_slice(&[0x60]);
        b.extend(leb(0));
        b.extend(leb(0));
        b
    };
    let wasm = module_with(&[section(1, &types), section(2, &body)]);
    assert!(load_error(&wasm).contains("invalid UTF-8 encoding"));
}

#[test]
fn memory_too_many_pages_is_rejected() {
    let mut body = leb(1);
    body.push(0x00); // no max
    body.extend(leb(65_537));
    let wasm = module_with(&[section(5, &body)]);
    assert!(load_error(&wasm).contains("memory size must be at most 65536 pages"));
}

#[test]
fn memory_min_above_max_is_rejected() {
    let mut body = leb(1);
    body.push(0x01);
    body.extend(leb(4));
    body.extend(leb(2));
    let wasm = module_with(&[section(5, &body)]);
    assert!(load_error(&wasm).contains("size minimum must not be greater than maximum"));
}

#[test]
fn shared_memory_without_max_is_rejected() {
    let mut body = leb(1);
    body.push(0x02); // shared, no max
    body.extend(leb(1));
    let wasm = module_with(&[section(5, &body)]);
    assert!(load_error(&wasm).contains("shared memory must have maximum"));
}

#[test]
fn two_memories_are_rejected() {
    let mut body = leb(2);
    body.push(0x00);
    body.extend(leb(1));
    body.push(0x00);
    body.extend(leb(1));
    let wasm = module_with(&[section(5, &body)]);
    assert!(load_error(&wasm).contains("multiple memories"));
}

#[test]
fn shared_table_is_rejected() {
    let mut body = leb(1);
    body.push(0x70); // funcref
    body.push(0x02); // shared flag
    body.extend(leb(1));
    let wasm = module_with(&[section(4, &body)]);
    assert!(load_error(&wasm).contains("tables cannot be shared"));
}

#[test]
fn duplicate_export_name_is_rejected() {
    // wat rejects duplicate export names itself, so build the binary by
    // hand: two exports named "foo" pointing at function 0.
    let types = {
        let mut b = leb(1);
        b.extend_from_slice(&[0x60]);
        b.extend(leb(0));
        b.extend(leb(0));
        b
    };
    let funcs = {
        let mut b = leb(1);
        b.extend(leb(0));
        b
    };
    let exports = {
        let mut b = leb(2);
        for _ in 0..2 {
            b.extend(leb(3));
            b.extend_from_slice(b"foo");
            b.push(0x00);
            b.extend(leb(0));
        }
        b
    };
    let code = {
        let mut b = leb(1);
        b.extend(leb(2));
        b.extend_from_slice(&[0x00, 0x0b]);
        b
    };
    let wasm = module_with(&[
        section(1, &types),
        section(3, &funcs),
        section(7, &exports),
        section(10, &code),
    ]);
    assert!(load_error(&wasm).contains("duplicate export name"));
}

#[test]
fn datacount_mismatch_is_rejected() {
    // datacount declares 2 segments, the data section carries 3.
    let memory = {
        let mut b = leb(1);
        b.push(0x00);
        b.extend(leb(1));
        b
    };
    let datacount = leb(2);
    let data = {
        let mut b = leb(3);
        for _ in 0..3 {
            b.extend(leb(0)); // active, memory 0
            b.extend_from_slice(&[0x41, 0x00, 0x0b]); // i32.const 0; end
            b.extend(leb(1));
            b.push(0xaa);
        }
        b
    };
    let wasm = module_with(&[
        section(5, &memory),
        section(12, &datacount),
        section(11, &data),
    ]);
    assert!(load_error(&wasm).contains("data count and data section have inconsistent lengths"));
}

#[test]
fn data_segment_past_memory_end_is_rejected() {
    // One page of memory; a 2-byte segment at 65535 ends one byte past it.
    let memory = {
        let mut b = leb(1);
        b.push(0x00);
        b.extend(leb(1));
        b
    };
    let data = {
        let mut b = leb(1);
        b.extend(leb(0));
        b.extend_from_slice(&[0x41, 0xff, 0xff, 0x03, 0x0b]); // i32.const 65535
        b.extend(leb(2));
        b.extend_from_slice(&[0xaa, 0xbb]);
        b
    };
    let wasm = module_with(&[section(5, &memory), section(11, &data)]);
    assert!(load_error(&wasm).contains("out of bounds memory access from data segment"));
}

#[test]
fn function_and_code_count_mismatch_is_rejected() {
    let types = {
        let mut b = leb(1);
        b.extend_from_slice(&[0x60]);
        b.extend(leb(0));
        b.extend(leb(0));
        b
    };
    let funcs = {
        let mut b = leb(2);
        b.extend(leb(0));
        b.extend(leb(0));
        b
    };
    let code = {
        let mut b = leb(1);
        b.extend(leb(2));
        b.extend_from_slice(&[0x00, 0x0b]);
        b
    };
    let wasm = module_with(&[section(1, &types), section(3, &funcs), section(10, &code)]);
    assert!(load_error(&wasm).contains("function and code section have inconsistent lengths"));
}

#[test]
fn element_segment_past_table_end_is_rejected() {
    let wat = r#"
        (module
            (table 1 funcref)
            (func $f)
            (elem (i32.const 1) func $f)
        )
    "#;
    let wasm = wat_to_wasm(wat);
    assert!(load_error(&wasm).contains("out of bounds table access from element segment"));
}

#[test]
fn start_function_with_params_is_rejected() {
    let types = {
        let mut b = leb(1);
        b.extend_from_slice(&[0x60]);
        b.extend(leb(1));
        b.push(0x7f);
        b.extend(leb(0));
        b
    };
    let funcs = {
        let mut b = leb(1);
        b.extend(leb(0));
        b
    };
    let start = leb(0);
    let code = {
        let mut b = leb(1);
        b.extend(leb(2));
        b.extend_from_slice(&[0x00, 0x0b]);
        b
    };
    let wasm = module_with(&[
        section(1, &types),
        section(3, &funcs),
        section(8, &start),
        section(10, &code),
    ]);
    assert!(load_error(&wasm).contains("invalid start function"));
}

#[test]
fn unknown_export_index_is_rejected() {
    let exports = {
        let mut b = leb(1);
        b.extend(leb(1));
        b.extend_from_slice(b"m");
        b.push(0x02); // memory export
        b.extend(leb(0));
        b
    };
    let wasm = module_with(&[section(7, &exports)]);
    assert!(load_error(&wasm).contains("unknown memory"));
}

#[test]
fn valid_minimal_module_loads() {
    let wat = r#"
        (module
            (memory 1)
            (func (export "answer") (result i32) i32.const 42)
        )
    "#;
    with_parsed_wat(wat, |module| {
        assert_eq!(module.functions.len(), 1);
        assert_eq!(module.exports.len(), 1);
        assert_eq!(module.memory().map(|m| m.init_page_count), Some(1));
    })
    .expect("module must load");
}
