//! Kiln CLI
//!
//! Main entry point for the `kiln` command.

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result, WrapErr};
use std::path::{Path, PathBuf};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use kiln::codegen::spirv::{bytes_to_words, disassemble_words, words_to_bytes};
use kiln::codegen::{TargetInfo, assemble_module};
use kiln::config::Config;
use kiln::lir::LirModule;
use kiln::runtime::{DeviceBuffer, DeviceContext, DeviceInfo, KernelArg, LaunchConfig, cache_key};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SPIR-V kernel assembler and device runtime", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (TOML)
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Assemble a LIR module (JSON) into SPIR-V
    Assemble {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Output file
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,

        /// Spill every value to a function-scope slot
        #[arg(long)]
        spill: bool,

        /// Print the disassembly
        #[arg(long)]
        disassemble: bool,

        /// Assemble for a device without double precision
        #[arg(long)]
        no_fp64: bool,

        /// Assemble for a device without half precision
        #[arg(long)]
        no_fp16: bool,
    },

    /// Disassemble a SPIR-V binary
    Disasm {
        #[arg(value_name = "FILE")]
        input: PathBuf,
    },

    /// Assemble a LIR module and run one kernel on the simulated device
    Run {
        #[arg(value_name = "FILE")]
        input: PathBuf,

        /// Kernel entry point
        #[arg(short, long)]
        kernel: String,

        /// Global work size (1-D)
        #[arg(short, long, default_value = "1")]
        global: u32,

        /// Workgroup size (1-D)
        #[arg(short, long, default_value = "1")]
        local: u32,

        /// Kernel arguments: `i:<int>`, `f:<float>`, `d:<double>`, `b:<bool>`,
        /// `buf:<i32|i64|f32|f64>:<v,v,...>` or `zeros:<i32|i64|f32|f64>:<count>`
        #[arg(short, long = "arg", value_name = "ARG")]
        args: Vec<String>,
    },

    /// Show version and device information
    Info,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "kiln=debug" } else { "kiln=warn" };
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)))
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path).map_err(|e| miette::miette!("{}", e))?,
        None => Config::from_env(),
    };

    match cli.command {
        Commands::Assemble {
            input,
            output,
            spill,
            disassemble,
            no_fp64,
            no_fp16,
        } => {
            let target = TargetInfo {
                fp64: !no_fp64,
                fp16: !no_fp16,
            };
            assemble(&config, &input, output.as_deref(), spill, disassemble, target)
        }

        Commands::Disasm { input } => disasm(&input),

        Commands::Run {
            input,
            kernel,
            global,
            local,
            args,
        } => run(&config, &input, &kernel, global, local, &args),

        Commands::Info => info(),
    }
}

fn load_module(input: &Path) -> Result<LirModule> {
    let content = std::fs::read_to_string(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", input.display()))?;
    serde_json::from_str(&content)
        .into_diagnostic()
        .wrap_err_with(|| format!("{} is not a LIR module", input.display()))
}

fn assemble(
    config: &Config,
    input: &Path,
    output: Option<&Path>,
    spill: bool,
    disassemble: bool,
    target: TargetInfo,
) -> Result<()> {
    let module = load_module(input)?;
    let mut codegen = config.codegen.clone();
    if spill {
        codegen.optimize_load_store = false;
    }

    let compiled = assemble_module(&module, target, &codegen)?;
    let output = output.map(Path::to_path_buf).unwrap_or_else(|| input.with_extension("spv"));
    std::fs::write(&output, words_to_bytes(&compiled.words))
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to write {}", output.display()))?;

    println!(
        "Assembled {} ({} words, entry points: {}) -> {}",
        input.display(),
        compiled.words.len(),
        compiled.entry_points.join(", "),
        output.display()
    );
    if disassemble {
        println!("{}", compiled.disassemble()?);
    }
    Ok(())
}

fn disasm(input: &Path) -> Result<()> {
    let bytes = std::fs::read(input)
        .into_diagnostic()
        .wrap_err_with(|| format!("failed to read {}", input.display()))?;
    let words = bytes_to_words(&bytes)?;
    println!("{}", disassemble_words(&words)?);
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Element {
    I32,
    I64,
    F32,
    F64,
}

impl Element {
    fn parse(name: &str) -> Result<Self> {
        match name {
            "i32" => Ok(Element::I32),
            "i64" => Ok(Element::I64),
            "f32" => Ok(Element::F32),
            "f64" => Ok(Element::F64),
            other => Err(miette::miette!("unknown buffer element type `{}`", other)),
        }
    }

    fn size(self) -> usize {
        match self {
            Element::I32 | Element::F32 => 4,
            Element::I64 | Element::F64 => 8,
        }
    }

    fn encode(self, value: &str, out: &mut Vec<u8>) -> Result<()> {
        let bad = || miette::miette!("`{}` is not a valid {:?}", value, self);
        match self {
            Element::I32 => out.extend(value.parse::<i32>().map_err(|_| bad())?.to_le_bytes()),
            Element::I64 => out.extend(value.parse::<i64>().map_err(|_| bad())?.to_le_bytes()),
            Element::F32 => out.extend(value.parse::<f32>().map_err(|_| bad())?.to_le_bytes()),
            Element::F64 => out.extend(value.parse::<f64>().map_err(|_| bad())?.to_le_bytes()),
        }
        Ok(())
    }

    fn format(self, bytes: &[u8]) -> Vec<String> {
        bytes
            .chunks_exact(self.size())
            .map(|chunk| {
                let mut raw = [0u8; 8];
                raw[..chunk.len()].copy_from_slice(chunk);
                match self {
                    Element::I32 => i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
                    Element::I64 => i64::from_le_bytes(raw).to_string(),
                    Element::F32 => f32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]).to_string(),
                    Element::F64 => f64::from_le_bytes(raw).to_string(),
                }
            })
            .collect()
    }
}

/// One `--arg` as given on the command line
enum CliArg {
    Scalar(KernelArg),
    Buffer { element: Element, bytes: Vec<u8> },
}

fn parse_arg(text: &str) -> Result<CliArg> {
    let (tag, rest) = text
        .split_once(':')
        .ok_or_else(|| miette::miette!("argument `{}` has no type prefix", text))?;
    let invalid = || miette::miette!("invalid argument `{}`", text);
    match tag {
        "i" => Ok(CliArg::Scalar(KernelArg::Int(rest.parse().map_err(|_| invalid())?))),
        "f" => Ok(CliArg::Scalar(KernelArg::F32(rest.parse().map_err(|_| invalid())?))),
        "d" => Ok(CliArg::Scalar(KernelArg::F64(rest.parse().map_err(|_| invalid())?))),
        "b" => Ok(CliArg::Scalar(KernelArg::Bool(rest.parse().map_err(|_| invalid())?))),
        "buf" | "zeros" => {
            let (element, values) = rest.split_once(':').ok_or_else(invalid)?;
            let element = Element::parse(element)?;
            let mut bytes = Vec::new();
            if tag == "buf" {
                for value in values.split(',').map(str::trim).filter(|v| !v.is_empty()) {
                    element.encode(value, &mut bytes)?;
                }
            } else {
                let count: usize = values.parse().map_err(|_| invalid())?;
                bytes.resize(count * element.size(), 0);
            }
            Ok(CliArg::Buffer { element, bytes })
        }
        _ => Err(invalid()),
    }
}

fn run(config: &Config, input: &Path, kernel: &str, global: u32, local: u32, args: &[String]) -> Result<()> {
    const PLAN: u64 = 0;
    const DEVICE: usize = 0;

    let module = load_module(input)?;
    let context = DeviceContext::simulated(config.runtime.clone());
    let compiled = assemble_module(&module, context.target(DEVICE)?, &config.codegen)?;
    if !compiled.entry_points.iter().any(|e| e == kernel) {
        return Err(miette::miette!(
            "`{}` is not a kernel of {} (kernels: {})",
            kernel,
            module.name,
            compiled.entry_points.join(", ")
        ));
    }
    context.install_module(PLAN, DEVICE, &module.name, &compiled)?;

    let mut kernel_args = Vec::with_capacity(args.len());
    let mut buffers: Vec<(usize, Element, DeviceBuffer)> = Vec::new();
    for (position, text) in args.iter().enumerate() {
        match parse_arg(text)? {
            CliArg::Scalar(arg) => kernel_args.push(arg),
            CliArg::Buffer { element, bytes } => {
                let buffer = context.allocate(PLAN, DEVICE, bytes.len())?;
                context.write_buffer(PLAN, &buffer, 0, &bytes)?;
                kernel_args.push(KernelArg::from(buffer));
                buffers.push((position, element, buffer));
            }
        }
    }

    let launch = LaunchConfig::new_1d(global, local);
    let event = context.launch(
        PLAN,
        DEVICE,
        &cache_key(&module.name, kernel),
        &launch,
        &kernel_args,
    )?;
    context.wait_for_events(PLAN, DEVICE, &[event])?;
    let timers = context.get_timers(PLAN, DEVICE, event)?;
    println!(
        "Ran {} over {} work-items ({} ns)",
        kernel,
        launch.total_work_items(),
        timers.elapsed_ns().unwrap_or_default()
    );

    for (position, element, buffer) in &buffers {
        let bytes = context.read_buffer(PLAN, buffer, 0, buffer.size)?;
        println!("  arg {}: [{}]", position, element.format(&bytes).join(", "));
    }
    context.reset(PLAN)?;
    Ok(())
}

fn info() -> Result<()> {
    println!("Kiln SPIR-V assembler and device runtime");
    println!("Version: {}", kiln::VERSION);
    println!();
    println!("Devices:");
    println!("  0: {}", DeviceInfo::simulated());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalar_args() {
        assert!(matches!(parse_arg("i:-3").unwrap(), CliArg::Scalar(KernelArg::Int(-3))));
        assert!(matches!(parse_arg("b:true").unwrap(), CliArg::Scalar(KernelArg::Bool(true))));
        assert!(parse_arg("x:1").is_err());
        assert!(parse_arg("7").is_err());
    }

    #[test]
    fn test_parse_buffer_args() {
        match parse_arg("buf:i32:1, 2,3").unwrap() {
            CliArg::Buffer { element, bytes } => {
                assert_eq!(element, Element::I32);
                assert_eq!(element.format(&bytes), vec!["1", "2", "3"]);
            }
            CliArg::Scalar(_) => panic!("expected a buffer"),
        }
        match parse_arg("zeros:f64:2").unwrap() {
            CliArg::Buffer { bytes, .. } => assert_eq!(bytes.len(), 16),
            CliArg::Scalar(_) => panic!("expected a buffer"),
        }
    }
}
