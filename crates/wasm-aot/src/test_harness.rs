//! Helpers shared by the integration tests: WAT compilation and LLVM IR
//! inspection.

use inkwell::context::Context;

use crate::config::CompOptions;
use crate::module::Module;
use crate::{Error, Result};

/// Assemble a WAT module to binary.
pub fn wat_to_wasm(wat_src: &str) -> Vec<u8> {
    wat::parse_str(wat_src).expect("WAT fixture must assemble")
}

/// Parse and validate a WAT module, handing the loaded module to `f`.
pub fn with_parsed_wat<R>(wat_src: &str, f: impl FnOnce(&Module<'_>) -> R) -> Result<R> {
    let wasm = wat::parse_str(wat_src).map_err(|e| Error::Internal(format!("WAT: {e}")))?;
    let module = crate::module::loader::parse(&wasm)?;
    Ok(f(&module))
}

/// Compile a WAT module and hand the emitted LLVM module to `f`.
pub fn with_compiled_wat<R>(
    wat_src: &str,
    options: CompOptions,
    f: impl FnOnce(&inkwell::module::Module<'_>) -> R,
) -> Result<R> {
    let wasm = wat::parse_str(wat_src).map_err(|e| Error::Internal(format!("WAT: {e}")))?;
    let module = crate::module::loader::parse(&wasm)?;
    let context = Context::create();
    let llvm_module = crate::llvm_backend::compile_module(&context, &module, options)?;
    Ok(f(&llvm_module))
}

/// Compile a WAT module to textual LLVM IR.
pub fn compile_wat_to_ir(wat_src: &str, options: &CompOptions) -> Result<String> {
    let wasm = wat::parse_str(wat_src).map_err(|e| Error::Internal(format!("WAT: {e}")))?;
    crate::llvm_backend::compile_to_ir(&wasm, options)
}

/// Error message of a load failure for a raw binary.
pub fn load_error(wasm: &[u8]) -> String {
    match crate::module::loader::parse(wasm) {
        Ok(_) => panic!("expected the module to fail loading"),
        Err(e) => e.to_string(),
    }
}
