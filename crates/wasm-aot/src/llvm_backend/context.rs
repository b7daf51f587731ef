//! Compiler context: LLVM context/module/builder, target machine
//! selection, and the shared type/constant helpers every emit site uses.

use inkwell::builder::Builder;
use inkwell::context::Context;
use inkwell::module::Module as LlvmModule;
use inkwell::targets::{
    CodeModel, InitializationConfig, RelocMode, Target, TargetMachine, TargetTriple,
};
use inkwell::types::{BasicTypeEnum, FloatType, IntType, PointerType, VectorType};
use inkwell::values::FunctionValue;
use inkwell::{AddressSpace, OptimizationLevel};

use crate::config::CompOptions;
use crate::module::{Module, ValType};
use crate::{Error, Result};

pub struct CompContext<'ctx, 'm> {
    pub context: &'ctx Context,
    pub module: LlvmModule<'ctx>,
    pub builder: Builder<'ctx>,
    pub target_machine: TargetMachine,
    pub wasm: &'m Module<'m>,
    pub options: CompOptions,
    /// One entry per wasm function index (imports first). Import entries
    /// are the resolved native declarations, or `None` when unlinked.
    pub func_values: Vec<Option<FunctionValue<'ctx>>>,
    /// Byte width of a pointer on the selected target.
    pub ptr_size: u64,
}

impl<'ctx, 'm> CompContext<'ctx, 'm> {
    pub fn new(
        context: &'ctx Context,
        wasm: &'m Module<'m>,
        options: CompOptions,
    ) -> Result<Self> {
        let module = context.create_module("wasm_aot_module");
        let builder = context.create_builder();
        let target_machine = create_target_machine(&options)?;

        module.set_triple(&target_machine.get_triple());
        let target_data = target_machine.get_target_data();
        module.set_data_layout(&target_data.get_data_layout());

        if let Some(abi) = &options.target_abi {
            if options.target_arch.as_deref().is_some_and(|a| a.starts_with("riscv")) {
                module.add_metadata_flag(
                    "target-abi",
                    inkwell::module::FlagBehavior::Error,
                    context.metadata_string(abi),
                );
            }
        }

        let ptr_size =
            u64::from(target_data.get_store_size(&context.ptr_type(AddressSpace::default())));

        Ok(Self {
            context,
            module,
            builder,
            target_machine,
            wasm,
            options,
            func_values: Vec::new(),
            ptr_size,
        })
    }

    // ── type helpers ──

    pub fn i8t(&self) -> IntType<'ctx> {
        self.context.i8_type()
    }

    pub fn i32t(&self) -> IntType<'ctx> {
        self.context.i32_type()
    }

    pub fn i64t(&self) -> IntType<'ctx> {
        self.context.i64_type()
    }

    pub fn f32t(&self) -> FloatType<'ctx> {
        self.context.f32_type()
    }

    pub fn f64t(&self) -> FloatType<'ctx> {
        self.context.f64_type()
    }

    pub fn ptrt(&self) -> PointerType<'ctx> {
        self.context.ptr_type(AddressSpace::default())
    }

    /// v128 values are carried as `<2 x i64>` and bitcast per lane shape.
    pub fn v128t(&self) -> VectorType<'ctx> {
        self.i64t().vec_type(2)
    }

    /// Pointer-width integer type of the target.
    pub fn intptr(&self) -> IntType<'ctx> {
        if self.ptr_size == 4 { self.i32t() } else { self.i64t() }
    }

    pub fn llvm_type(&self, ty: ValType) -> BasicTypeEnum<'ctx> {
        match ty {
            ValType::I32 => self.i32t().into(),
            ValType::I64 => self.i64t().into(),
            ValType::F32 => self.f32t().into(),
            ValType::F64 => self.f64t().into(),
            ValType::V128 => self.v128t().into(),
            ValType::Void | ValType::Any => self.i32t().into(),
        }
    }

    /// Address type of the linear memory index space.
    pub fn mem_addr_type(&self) -> IntType<'ctx> {
        if self.wasm.is_memory64() { self.i64t() } else { self.i32t() }
    }

    pub fn opt_level(&self) -> OptimizationLevel {
        match self.options.opt_level {
            0 => OptimizationLevel::None,
            1 => OptimizationLevel::Less,
            2 => OptimizationLevel::Default,
            _ => OptimizationLevel::Aggressive,
        }
    }
}

/// Resolve the target triple/cpu/features from the options, defaulting to
/// the host, and build the target machine.
fn create_target_machine(options: &CompOptions) -> Result<TargetMachine> {
    Target::initialize_all(&InitializationConfig::default());

    let (triple, cpu, features) = if let Some(arch) = &options.target_arch {
        let abi = options.target_abi.as_deref().unwrap_or("gnu");
        let vendor_sys = if abi.starts_with("msvc") {
            if arch.starts_with("win") { "-pc-win32-" } else { "-pc-windows-" }
        } else if abi == "none" {
            "-unknown-none-"
        } else {
            "-pc-linux-"
        };
        let triple = TargetTriple::create(&format!("{arch}{vendor_sys}{abi}"));
        let cpu = options.target_cpu.clone().unwrap_or_default();
        let mut features = options.cpu_features.clone().unwrap_or_default();
        // Double-float RISC-V ABIs require the D extension.
        if arch.starts_with("riscv")
            && matches!(abi, "lp64d" | "ilp32d")
            && !features.contains("+d")
        {
            if !features.is_empty() {
                features.push(',');
            }
            features.push_str("+d");
        }
        (triple, cpu, features)
    } else {
        let triple = TargetMachine::get_default_triple();
        let cpu = options
            .target_cpu
            .clone()
            .unwrap_or_else(|| TargetMachine::get_host_cpu_name().to_string());
        let features = options
            .cpu_features
            .clone()
            .unwrap_or_else(|| TargetMachine::get_host_cpu_features().to_string());
        (triple, cpu, features)
    };

    let target = Target::from_triple(&triple)
        .map_err(|e| Error::InvalidOption(format!("unknown target triple: {e}")))?;

    let code_model = match options.size_level {
        0 => CodeModel::Large,
        1 => CodeModel::Medium,
        2 => CodeModel::Kernel,
        _ => CodeModel::Small,
    };
    let opt_level = match options.opt_level {
        0 => OptimizationLevel::None,
        1 => OptimizationLevel::Less,
        2 => OptimizationLevel::Default,
        _ => OptimizationLevel::Aggressive,
    };

    target
        .create_target_machine(&triple, &cpu, &features, opt_level, RelocMode::PIC, code_model)
        .ok_or_else(|| Error::InvalidOption("failed to create target machine".into()))
}

/// The `"help"` listings for `--target-arch` / `--target-cpu`.
#[must_use]
pub fn supported_targets() -> Vec<String> {
    Target::initialize_all(&InitializationConfig::default());
    let mut targets = Vec::new();
    let mut cursor = Target::get_first();
    while let Some(t) = cursor {
        targets.push(format!(
            "{}: {}",
            t.get_name().to_string_lossy(),
            t.get_description().to_string_lossy()
        ));
        cursor = t.get_next();
    }
    targets
}
