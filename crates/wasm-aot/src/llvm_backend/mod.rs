//! LLVM backend: turns a loaded, validated module into an LLVM module
//! containing one function per wasm function, the runtime global set, and
//! the instance lifecycle functions.

mod alu;
mod calls;
mod context;
mod control_flow;
mod emitter;
mod exceptions;
mod memory;
mod runtime;

pub use context::{supported_targets, CompContext};

use inkwell::context::Context;
use inkwell::module::{Linkage, Module as LlvmModule};
use inkwell::passes::PassBuilderOptions;

use crate::config::{CompOptions, OutputFormat, MIN_HEAP_SIZE};
use crate::module::Module;
use crate::natives;
use crate::{Error, Result};

/// Validate option combinations that cannot be expressed in the type.
pub fn check_options(wasm: &Module<'_>, options: &CompOptions) -> Result<()> {
    if options.opt_level > 3 {
        return Err(Error::InvalidOption("opt_level must be 0..=3".into()));
    }
    if options.size_level > 3 {
        return Err(Error::InvalidOption("size_level must be 0..=3".into()));
    }
    if options.heap_size > 0 {
        if options.heap_size < MIN_HEAP_SIZE {
            return Err(Error::InvalidOption(format!(
                "heap size must be 0 or at least {MIN_HEAP_SIZE}"
            )));
        }
        if options.no_sandbox_mode {
            return Err(Error::InvalidOption(
                "a host-managed heap cannot be combined with no-sandbox mode".into(),
            ));
        }
        if !wasm.memory().is_some_and(crate::module::Memory::is_fixed_size) {
            return Err(Error::InvalidOption(
                "a host-managed heap requires a fixed-size memory".into(),
            ));
        }
    }
    Ok(())
}

/// Build the LLVM module for a loaded wasm module.
pub fn compile_module<'ctx, 'm>(
    context: &'ctx Context,
    wasm: &'m Module<'m>,
    options: CompOptions,
) -> Result<LlvmModule<'ctx>> {
    check_options(wasm, &options)?;
    let mut cc = CompContext::new(context, wasm, options)?;

    declare_functions(&mut cc)?;
    runtime::emit_runtime_globals(&cc)?;
    runtime::emit_instance_functions(&cc)?;

    for local_idx in 0..wasm.functions.len() {
        let func_idx = wasm.import_funcs.len() + local_idx;
        let fn_val = cc
            .func_values
            .get(func_idx)
            .copied()
            .flatten()
            .ok_or_else(|| Error::Internal(format!("missing function value {func_idx}")))?;
        let mut emitter = emitter::FuncEmitter::new(&cc, local_idx, fn_val);
        emitter.emit()?;
    }

    emit_custom_sections(&cc)?;

    cc.module
        .verify()
        .map_err(|e| Error::Llvm(format!("module verification failed: {e}")))?;

    Ok(cc.module)
}

/// Run the standard optimization pipeline for the selected opt level.
pub fn optimize_module(
    module: &LlvmModule<'_>,
    cc_target: &inkwell::targets::TargetMachine,
    options: &CompOptions,
) -> Result<()> {
    let passes = format!("default<O{}>", options.opt_level.min(3));
    module
        .run_passes(&passes, cc_target, PassBuilderOptions::create())
        .map_err(|e| Error::Llvm(format!("optimization pipeline failed: {e}")))
}

/// Declare one LLVM function per wasm function index. Imports resolve
/// against the built-in native symbol tables; unresolved imports stay
/// `None` and are reported at instance creation.
fn declare_functions(cc: &mut CompContext<'_, '_>) -> Result<()> {
    let wasm = cc.wasm;
    let is_memory64 = wasm.is_memory64();
    let mut values = Vec::with_capacity(wasm.func_count() as usize);

    for import in &wasm.import_funcs {
        let resolved = natives::lookup(
            import.module_name,
            import.field_name,
            is_memory64,
            cc.options.no_sandbox_mode,
        );
        let value = match resolved {
            Some(native) if native.signature == import.func_type.signature() => {
                let fn_type = cc.wasm_fn_type(&import.func_type);
                Some(cc.module.add_function(native.field_name, fn_type, None))
            }
            Some(native) => {
                tracing::warn!(
                    "import ({}, {}) signature {} does not match native {}",
                    import.module_name,
                    import.field_name,
                    import.func_type.signature(),
                    native.signature
                );
                None
            }
            None => {
                tracing::warn!(
                    "failed to resolve import function ({}, {})",
                    import.module_name,
                    import.field_name
                );
                None
            }
        };
        values.push(value);
    }

    for (i, func) in wasm.functions.iter().enumerate() {
        let fn_type = cc.wasm_fn_type(&func.func_type);
        let fn_val =
            cc.module
                .add_function(&format!("wasm_func#{i}"), fn_type, Some(Linkage::Internal));
        values.push(Some(fn_val));
    }

    cc.func_values = values;
    Ok(())
}

/// Re-emit requested custom sections as constant globals carrying the
/// original bytes.
fn emit_custom_sections(cc: &CompContext<'_, '_>) -> Result<()> {
    for wanted in &cc.options.custom_sections {
        let Some(custom) = cc.wasm.custom_sections.iter().find(|c| c.name == *wanted) else {
            tracing::warn!("custom section {wanted} not found in module, skipping");
            continue;
        };
        let array = cc.context.const_string(custom.data, false);
        let global = cc
            .module
            .add_global(array.get_type(), None, &format!("custom_section#{wanted}"));
        let section_name = format!(".custom_section.{wanted}");
        global.set_section(Some(&section_name));
        global.set_linkage(Linkage::Internal);
        global.set_constant(true);
        global.set_initializer(&array);
    }
    Ok(())
}

/// Compile wasm bytes all the way to textual LLVM IR.
pub fn compile_to_ir(wasm_bytes: &[u8], options: &CompOptions) -> Result<String> {
    let module = crate::module::loader::parse(wasm_bytes)?;
    let context = Context::create();
    let llvm_module = compile_module(&context, &module, options.clone())?;

    if options.output_format == OutputFormat::LlvmIrOpt {
        let tm = {
            let cc = CompContext::new(&context, &module, options.clone())?;
            cc.target_machine
        };
        optimize_module(&llvm_module, &tm, options)?;
    }
    Ok(llvm_module.print_to_string().to_string())
}

/// Compile wasm bytes to a native object file at `path`.
pub fn compile_to_object(
    wasm_bytes: &[u8],
    options: &CompOptions,
    path: &std::path::Path,
) -> Result<()> {
    let module = crate::module::loader::parse(wasm_bytes)?;
    let context = Context::create();
    let llvm_module = compile_module(&context, &module, options.clone())?;

    let tm = {
        let cc = CompContext::new(&context, &module, options.clone())?;
        cc.target_machine
    };
    if options.opt_level > 0 {
        optimize_module(&llvm_module, &tm, options)?;
    }
    tm.write_to_file(&llvm_module, inkwell::targets::FileType::Object, path)
        .map_err(|e| Error::Llvm(format!("object emission failed: {e}")))
}
