use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::fs;
use std::path::PathBuf;

use wasm_aot::{CompOptions, OutputFormat};

const COMPILER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "wasm-aot")]
#[command(about = "WebAssembly to native AOT compiler")]
#[command(version = COMPILER_VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    /// Textual LLVM IR before optimization
    LlvmirUnopt,
    /// Textual LLVM IR after optimization
    LlvmirOpt,
    /// Native object file
    Object,
}

#[derive(Subcommand)]
enum Commands {
    Compile {
        #[arg(help = "Input WASM or WAT file")]
        input: PathBuf,

        #[arg(short, long, help = "Output file")]
        output: PathBuf,

        #[arg(long, default_value_t = 3, help = "Optimization level (0-3)")]
        opt_level: u32,

        #[arg(long, default_value_t = 3, help = "Size level (0-3), maps to the code model")]
        size_level: u32,

        #[arg(long, help = "Target architecture, e.g. x86_64, riscv64 ('help' to list)")]
        target: Option<String>,

        #[arg(long, help = "Target ABI, e.g. gnu, msvc, lp64d")]
        target_abi: Option<String>,

        #[arg(long, help = "Target CPU ('help' to list)")]
        cpu: Option<String>,

        #[arg(long, help = "CPU feature string, e.g. +simd128,-bulk-memory")]
        cpu_features: Option<String>,

        #[arg(long, value_enum, default_value_t = Format::Object, help = "Output format")]
        format: Format,

        #[arg(
            long,
            default_value_t = 0,
            help = "Host-managed heap size appended past a fixed-size memory (0 or >= 512)"
        )]
        heap_size: u32,

        #[arg(long, help = "Disable SIMD lowering")]
        disable_simd: bool,

        #[arg(long, help = "Enable auxiliary-stack overflow checks")]
        enable_aux_stack_check: bool,

        #[arg(long, help = "Disable LLVM link-time optimization")]
        disable_llvm_lto: bool,

        #[arg(long, help = "Treat linear-memory offsets as native pointers (no bound checks)")]
        no_sandbox: bool,

        #[arg(long = "emit-custom-section", help = "Custom section name to re-emit (repeatable)")]
        custom_sections: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile {
            input,
            output,
            opt_level,
            size_level,
            target,
            target_abi,
            cpu,
            cpu_features,
            format,
            heap_size,
            disable_simd,
            enable_aux_stack_check,
            disable_llvm_lto,
            no_sandbox,
            custom_sections,
        } => {
            // Any target option set to "help" lists the supported values
            // and exits.
            if target.as_deref() == Some("help") || cpu.as_deref() == Some("help") {
                for line in wasm_aot::llvm_backend::supported_targets() {
                    println!("{line}");
                }
                return Ok(());
            }

            let wasm = read_wasm(&input)?;
            let options = CompOptions {
                opt_level,
                size_level,
                target_arch: target,
                target_abi,
                target_cpu: cpu,
                cpu_features,
                output_format: match format {
                    Format::LlvmirUnopt => OutputFormat::LlvmIrUnopt,
                    Format::LlvmirOpt => OutputFormat::LlvmIrOpt,
                    Format::Object => OutputFormat::Object,
                },
                heap_size,
                enable_simd: !disable_simd,
                enable_aux_stack_check,
                disable_llvm_lto,
                no_sandbox_mode: no_sandbox,
                custom_sections,
            };

            match options.output_format {
                OutputFormat::Object => {
                    wasm_aot::compile_to_object(&wasm, &options, &output)
                        .context("Compilation failed")?;
                }
                OutputFormat::LlvmIrUnopt | OutputFormat::LlvmIrOpt => {
                    let ir = wasm_aot::compile_to_ir(&wasm, &options)
                        .context("Compilation failed")?;
                    fs::write(&output, ir).with_context(|| {
                        format!("Failed to write output to {}", output.display())
                    })?;
                }
            }
            println!("Compiled {} -> {}", input.display(), output.display());
        }
    }

    Ok(())
}

fn read_wasm(path: &PathBuf) -> Result<Vec<u8>> {
    let contents = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().is_some_and(|e| e == "wat") {
        wat::parse_bytes(&contents)
            .map(std::borrow::Cow::into_owned)
            .map_err(|e| anyhow::anyhow!("WAT parse error: {e}"))
    } else {
        Ok(contents)
    }
}
