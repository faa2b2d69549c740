use clap::Parser;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use kcc::codegen::{CodegenOptions, IvdepStyle};
use kcc::diag::{DiagLevel, Diagnostic};
use kcc::kernel::ClVersion;
use kcc::pass::PassId;
use kcc::pipeline::{run_pipeline, CompilationState, PipelineError};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum EmitStage {
    C,
    Opencl,
    Ssa,
    Alloc,
    Manifest,
    Dot,
}

#[derive(Parser, Debug)]
#[command(
    name = "kcc",
    version,
    about = "Kernel Compiler Collection — lowers typed SSA listings to C and OpenCL kernels"
)]
struct Cli {
    /// Input .ssa listing
    source: PathBuf,

    /// Output file path (stdout when absent)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output stage
    #[arg(long, value_enum, default_value_t = EmitStage::C)]
    emit: EmitStage,

    /// JSON file with code generation options
    #[arg(long)]
    config: Option<PathBuf>,

    /// Vectorization pragma emitted before sequential loops
    #[arg(long, value_parser = ["none", "gcc", "intel", "clang"])]
    ivdep: Option<String>,

    /// Emit `// line N` comments
    #[arg(long)]
    line_comments: bool,

    /// Subgroup size assumed by subgroup schedules
    #[arg(long)]
    sub_group_size: Option<u32>,

    /// Emulate subgroups with local memory
    #[arg(long)]
    warp_fallback: bool,

    /// Allow cooperative schedules under `auto`
    #[arg(long)]
    try_cooperative: bool,

    /// Prefer the subgroup variant of cooperative schedules
    #[arg(long)]
    prefer_subgroup: bool,

    /// Highest OpenCL C version generated kernels may require
    #[arg(long, value_parser = ["1.0", "1.1", "1.2", "2.0"])]
    max_cl_version: Option<String>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let default = if verbose { "kcc=debug" } else { "kcc=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn io_failure(path: &Path, e: std::io::Error) -> ! {
    eprintln!("kcc: error: {}: {}", path.display(), e);
    std::process::exit(2);
}

fn load_options(cli: &Cli) -> CodegenOptions {
    let mut options = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).unwrap_or_else(|e| io_failure(path, e));
            match serde_json::from_str::<CodegenOptions>(&text) {
                Ok(o) => o,
                Err(e) => {
                    eprintln!("kcc: error: {}: {}", path.display(), e);
                    std::process::exit(1);
                }
            }
        }
        None => CodegenOptions::default(),
    };
    if let Some(style) = cli.ivdep.as_deref().and_then(IvdepStyle::from_name) {
        options.ivdep = style;
    }
    if let Some(version) = cli.max_cl_version.as_deref().and_then(ClVersion::from_name) {
        options.max_cl_version = Some(version);
    }
    if let Some(size) = cli.sub_group_size {
        options.sub_group_size = size;
    }
    options.line_comments |= cli.line_comments;
    options.warp_fallback |= cli.warp_fallback;
    options.try_cooperative |= cli.try_cooperative;
    options.prefer_subgroup |= cli.prefer_subgroup;
    options
}

fn fail(e: &PipelineError) -> ! {
    eprintln!("kcc: {}", e.to_diagnostic());
    std::process::exit(1);
}

fn print_diagnostics(diagnostics: &[Diagnostic]) {
    for d in diagnostics {
        eprintln!("kcc: {}", d);
    }
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let options = load_options(&cli);

    debug!(source = %cli.source.display(), emit = ?cli.emit, "starting");

    // ── Read and parse source ──
    let source =
        std::fs::read_to_string(&cli.source).unwrap_or_else(|e| io_failure(&cli.source, e));
    let parse_result = kcc::parser::parse(&source);
    if !parse_result.errors.is_empty() {
        for err in &parse_result.errors {
            eprintln!("kcc: parse error: {}", err);
        }
        std::process::exit(1);
    }
    let Some(program) = parse_result.program else {
        eprintln!("kcc: parse failed with no output");
        std::process::exit(1);
    };
    debug!(functions = program.functions.len(), "parsed");

    // ── Emit ──
    let text = match cli.emit {
        EmitStage::Ssa => program.to_string(),
        EmitStage::Dot => kcc::dot::emit_dot(&program),
        EmitStage::Alloc => {
            let mut state = CompilationState::new(program);
            run_pipeline(&mut state, PassId::Allocate, &options, |_, _| {})
                .unwrap_or_else(|e| fail(&e));
            print_diagnostics(&state.diagnostics);
            state
                .allocations
                .map(|listings| listings.into_values().collect::<Vec<_>>().join("\n"))
                .unwrap_or_default()
        }
        EmitStage::C | EmitStage::Opencl | EmitStage::Manifest => {
            let out = kcc::pipeline::compile(&program, &options).unwrap_or_else(|e| fail(&e));
            print_diagnostics(&out.diagnostics);
            if out.diagnostics.iter().any(|d| d.level == DiagLevel::Error) {
                std::process::exit(1);
            }
            match cli.emit {
                EmitStage::C => out.c_source,
                EmitStage::Opencl => {
                    let mut buf = String::new();
                    for (name, program) in &out.opencl {
                        let _ = writeln!(buf, "// ── kernel {name} ──");
                        buf.push_str(program);
                        buf.push('\n');
                    }
                    buf
                }
                _ => match serde_json::to_string_pretty(&out.manifest) {
                    Ok(s) => s + "\n",
                    Err(e) => {
                        eprintln!("kcc: error: manifest: {}", e);
                        std::process::exit(1);
                    }
                },
            }
        }
    };

    match &cli.output {
        Some(path) => {
            if let Err(e) = std::fs::write(path, text) {
                io_failure(path, e);
            }
        }
        None => print!("{text}"),
    }
}
