//! The `gs` command-line driver: compiles a script and runs it on the
//! selected backend.

use anyhow::Result;
use clap::{Parser as ClapParser, ValueEnum};
use gscript::backend::{self, Backend, NativeBackend, VmBackend, VmOptions};
use gscript::compiler::{CompileOptions, Pipeline};
use gscript::error::{Diagnostic, Error, Severity};
use gscript::source::SourceBuffer;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

const MIN_VM_BYTES: u64 = 1024;
const MAX_VM_BYTES: u64 = 128 * 1024 * 1024;
const DEFAULT_VM_BYTES: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BackendChoice {
    Vm,
    Native,
}

/// GScript compiler and runtime driver
#[derive(Debug, ClapParser)]
#[command(name = "gs", version, about)]
struct Cli {
    /// Script to compile and run
    script: PathBuf,

    /// Backend selection
    #[arg(short = 'b', value_enum, default_value = "native")]
    backend: BackendChoice,

    /// VM stack size in bytes (1 KiB to 128 MiB)
    #[arg(short = 's')]
    stack_size: Option<u64>,

    /// VM heap size in bytes (1 KiB to 128 MiB)
    #[arg(short = 'm')]
    heap_size: Option<u64>,

    /// Log optimized IR per function
    #[arg(long = "log-ir")]
    log_ir: bool,

    /// Log lowered VM instructions
    #[arg(long = "log-vmi")]
    log_vmi: bool,

    /// Trace VM execution
    #[arg(long = "log-vm-exec")]
    log_vm_exec: bool,

    /// Log IR as seen by the native backend
    #[arg(long = "log-native-ir")]
    log_native_ir: bool,

    /// Directory for cached compiled modules
    #[arg(long = "cache-dir")]
    cache_dir: Option<PathBuf>,
}

fn validate_vm_size(name: &str, value: u64) -> Result<u32, String> {
    if !(MIN_VM_BYTES..=MAX_VM_BYTES).contains(&value) {
        return Err(format!(
            "The {} size parameter was given an invalid argument '{}'. \
             Size must be >= 1024 B and <= 128 MB",
            name, value
        ));
    }
    Ok(value as u32)
}

fn print_diagnostic(diag: &Diagnostic) {
    eprintln!("{}", diag);
    // source snippet with a caret under the offending column
    if let Ok(src) = std::fs::read_to_string(&diag.module_path) {
        let buffer = SourceBuffer::new(diag.module_path.clone(), src);
        let line = buffer.line_text(diag.span.line);
        if !line.is_empty() {
            let trimmed = line.trim_start();
            let removed = line.len() - trimmed.len();
            eprintln!("{}", trimmed);
            let col = (diag.span.col as usize).saturating_sub(removed + 1);
            eprintln!("{}^", " ".repeat(col));
        }
    }
    for note in &diag.notes {
        eprintln!("    note: {}: {}", note.severity, note.message);
    }
}

fn print_diagnostics(diags: &[Diagnostic]) {
    for diag in diags {
        if diag.severity == Severity::Debug {
            continue;
        }
        print_diagnostic(diag);
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    // VM-only flags reject the native backend up front
    if cli.backend == BackendChoice::Native {
        for (set, flag) in [
            (cli.stack_size.is_some(), "-s"),
            (cli.heap_size.is_some(), "-m"),
            (cli.log_vmi, "--log-vmi"),
            (cli.log_vm_exec, "--log-vm-exec"),
        ] {
            if set {
                eprintln!("error: '{}' cannot be used with the native backend", flag);
                return Ok(ExitCode::from(3));
            }
        }
    } else if cli.log_native_ir {
        eprintln!("error: '--log-native-ir' cannot be used with the vm backend");
        return Ok(ExitCode::from(3));
    }

    let stack_size = match cli.stack_size {
        Some(v) => match validate_vm_size("stack", v) {
            Ok(v) => v,
            Err(msg) => {
                eprintln!("error: {}", msg);
                return Ok(ExitCode::from(3));
            }
        },
        None => DEFAULT_VM_BYTES as u32,
    };
    let heap_size = match cli.heap_size {
        Some(v) => match validate_vm_size("memory", v) {
            Ok(v) => v,
            Err(msg) => {
                eprintln!("error: {}", msg);
                return Ok(ExitCode::from(3));
            }
        },
        None => DEFAULT_VM_BYTES as u32,
    };

    let options = CompileOptions {
        opt_level: 1,
        log_ir: cli.log_ir,
        cache_dir: cli.cache_dir.clone(),
    };
    let mut pipeline = Pipeline::new(options);

    let mut output = match pipeline.compile_file(&cli.script) {
        Ok(output) => {
            print_diagnostics(&output.diagnostics);
            output
        }
        Err(Error::Compile { diagnostics }) => {
            print_diagnostics(&diagnostics);
            return Ok(ExitCode::from(2));
        }
        Err(e) => {
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(2));
        }
    };

    let mut backend: Box<dyn Backend> = match cli.backend {
        BackendChoice::Vm => Box::new(VmBackend::new(VmOptions {
            stack_size,
            heap_size,
            log_exec: cli.log_vm_exec,
            log_instructions: cli.log_vmi,
        })),
        BackendChoice::Native => Box::new(NativeBackend::new(cli.log_native_ir)),
    };

    let ctx = pipeline.context().clone();

    // dependencies generate and initialize ahead of the root module
    let mut dep_outputs = pipeline.take_dependency_outputs();
    for dep in dep_outputs.iter_mut() {
        if let Err(e) = backend::finalize_module(backend.as_mut(), &ctx, dep) {
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(2));
        }
    }
    if let Err(e) = backend::finalize_module(backend.as_mut(), &ctx, &mut output) {
        eprintln!("error: {}", e);
        return Ok(ExitCode::from(2));
    }

    for dep in &dep_outputs {
        if let Err(e) = backend::run_module_init(backend.as_mut(), &ctx, dep) {
            eprintln!("error: {}", e);
            return Ok(ExitCode::from(1));
        }
    }
    if let Err(e) = backend::run_module_init(backend.as_mut(), &ctx, &output) {
        eprintln!("error: {}", e);
        return Ok(ExitCode::from(1));
    }

    // entry point: `main` in the script's module, if declared
    let main_fqn = format!("{}::main", output.module.name);
    let main = ctx.funcs.read().get_by_fqn(&main_fqn).first().copied();
    if let Some(main) = main {
        let mut result = 0u64;
        match backend.call(&ctx, main, Some(&mut result), &[]) {
            Ok(()) => {
                tracing::debug!(result, "main returned");
            }
            Err(Error::Runtime(e)) => {
                eprintln!("runtime error: {}", e);
                return Ok(ExitCode::from(1));
            }
            Err(e) => {
                eprintln!("error: {}", e);
                return Ok(ExitCode::from(1));
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::from(1)
        }
    }
}
