//! Compilation options: target selection, optimization knobs, and the
//! sandbox / no-sandbox mode switch.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Textual LLVM IR before optimization.
    LlvmIrUnopt,
    /// Textual LLVM IR after the optimization pipeline.
    LlvmIrOpt,
    /// Native object file.
    #[default]
    Object,
}

#[derive(Debug, Clone)]
pub struct CompOptions {
    /// 0..=3, maps to the LLVM optimization level.
    pub opt_level: u32,
    /// 0..=3, maps to the LLVM code model: 0 = large, 1 = medium,
    /// 2 = kernel, 3 = small.
    pub size_level: u32,
    pub target_arch: Option<String>,
    pub target_abi: Option<String>,
    pub target_cpu: Option<String>,
    pub cpu_features: Option<String>,
    pub output_format: OutputFormat,
    /// Extra host-managed heap appended past the fixed-size memory; 0 or
    /// at least 512 bytes.
    pub heap_size: u32,
    pub enable_simd: bool,
    pub enable_aux_stack_check: bool,
    pub disable_llvm_lto: bool,
    /// Treat linear-memory offsets as native pointers: no bound checks, no
    /// host-managed heap, reloc-driven pointer fixups, ctor/dtor
    /// registration as global constructors.
    pub no_sandbox_mode: bool,
    /// Custom section names to re-emit into the output.
    pub custom_sections: Vec<String>,
}

impl Default for CompOptions {
    fn default() -> Self {
        Self {
            opt_level: 3,
            size_level: 3,
            target_arch: None,
            target_abi: None,
            target_cpu: None,
            cpu_features: None,
            output_format: OutputFormat::default(),
            heap_size: 0,
            enable_simd: true,
            enable_aux_stack_check: false,
            disable_llvm_lto: false,
            no_sandbox_mode: false,
            custom_sections: Vec::new(),
        }
    }
}

pub const MIN_HEAP_SIZE: u32 = 512;
