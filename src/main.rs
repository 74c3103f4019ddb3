//! Run a bytecode program.
//!
//! Usage: `cinder <file> [--dis] [--emit FILE] [--capacity N] [--max-steps N]`
//!
//! `<file>` is textual bytecode (`.casm`) or a persisted image.

use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use clap::Parser;
use tracing::{debug, error};
use tracing_subscriber::{EnvFilter, fmt};

use cinder::bytecode::disasm::format_program;
use cinder::bytecode::{ProgramImage, asm};
use cinder::runtime::{LinkTable, Vm, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "cinder")]
#[command(about = "Load and run a cinder bytecode program")]
struct Args {
    /// Textual bytecode (.casm) or a persisted image
    file: PathBuf,

    /// Print the disassembly instead of running
    #[arg(long)]
    dis: bool,

    /// Write the loaded program as a persisted image
    #[arg(long)]
    emit: Option<PathBuf>,

    /// Machine memory in cells
    #[arg(long)]
    capacity: Option<usize>,

    /// Stop after this many instructions
    #[arg(long = "max-steps")]
    max_steps: Option<usize>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(false).init();
}

fn load(path: &Path) -> Result<ProgramImage, String> {
    let is_text = path.extension().and_then(|e| e.to_str()) == Some("casm");
    if is_text {
        let source = fs::read_to_string(path)
            .map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
        asm::assemble(&source).map_err(|e| format!("{}: {}", path.display(), e))
    } else {
        let bytes =
            fs::read(path).map_err(|e| format!("failed to read '{}': {}", path.display(), e))?;
        ProgramImage::from_bytes(&bytes).map_err(|e| format!("{}: {}", path.display(), e))
    }
}

fn main() {
    init_logging();
    let args = Args::parse();

    let image = match load(&args.file) {
        Ok(image) => image,
        Err(message) => {
            error!("{}", message);
            process::exit(1);
        }
    };
    debug!(cells = image.len(), "image loaded");

    if let Some(out) = &args.emit {
        let written = image
            .to_bytes()
            .map_err(|e| e.to_string())
            .and_then(|bytes| fs::write(out, bytes).map_err(|e| e.to_string()));
        if let Err(message) = written {
            error!("failed to write '{}': {}", out.display(), message);
            process::exit(1);
        }
    }

    if args.dis {
        match format_program(&image) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                error!("{}", e);
                process::exit(1);
            }
        }
        return;
    }

    let defaults = VmConfig::default();
    let config = VmConfig {
        capacity: args.capacity.unwrap_or(defaults.capacity),
        max_steps: args.max_steps,
        ..defaults
    };

    let mut vm = Vm::with_config(config, LinkTable::with_core());
    let result = vm.initialize(&image).map_err(|e| e.to_string()).and_then(|()| {
        vm.run().map_err(|trap| trap.to_string())
    });

    match result {
        Ok(value) => println!("{}", value),
        Err(message) => {
            error!("{}", message);
            process::exit(1);
        }
    }
}
