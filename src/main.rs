//! Runs bytecode programs concurrently, one VM thread per file.
//!
//! # Usage
//! ```text
//! regvm [OPTIONS] <file>...
//! ```
//!
//! # Options
//! - `-d`, `--dump`: Print every program as hex and exit without running
//! - `-t`, `--trace`: Log every instruction and the register file
//! - `--max-steps <n>`: Fault any VM that executes more than `n` instructions
//!
//! Settings are read from `REGVM_TRACE` and `REGVM_MAX_STEPS` first and the
//! flags override them.

use regvm::config::{ConfigError, RunConfig, parse_steps};
use regvm::utils::log::{self, Level};
use regvm::virtual_machine::program::{Program, read_program_file};
use regvm::virtual_machine::registry::{Supervisor, VmHandle};
use regvm::warn;
use std::env;
use std::path::PathBuf;
use std::process;

const USAGE: &str = "\
Register VM runner

USAGE:
    {program} [OPTIONS] <file>...

ARGS:
    <file>...    Program files, raw 8-byte instruction records

OPTIONS:
    -d, --dump           Print each program as hex and exit
    -t, --trace          Log every executed instruction and the registers
    --max-steps <n>      Fault a VM after n executed instructions
    -h, --help           Print this help message

ENVIRONMENT:
    REGVM_TRACE          Enable tracing (1, true, yes, on)
    REGVM_MAX_STEPS      Default for --max-steps

EXAMPLES:
    # Run two programs side by side
    {program} add.bin loop.bin

    # Inspect a program without running it
    {program} --dump add.bin";

fn main() {
    let args: Vec<String> = env::args().collect();
    let program = args.first().map(String::as_str).unwrap_or("regvm");

    let mut config = RunConfig::from_env().unwrap_or_else(|e| {
        eprintln!("{e}");
        process::exit(1);
    });
    let mut dump = false;
    let mut files: Vec<PathBuf> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_usage(program);
                process::exit(1);
            }
            "-d" | "--dump" => dump = true,
            "-t" | "--trace" => config = config.with_trace(true),
            "--max-steps" => {
                i += 1;
                let Some(raw) = args.get(i) else {
                    eprintln!(
                        "{}",
                        ConfigError::MissingArgument {
                            flag: "--max-steps".to_string()
                        }
                    );
                    process::exit(1);
                };
                match parse_steps("--max-steps", raw) {
                    Ok(n) => config = config.with_max_steps(Some(n)),
                    Err(e) => {
                        eprintln!("{e}");
                        process::exit(1);
                    }
                }
            }
            other if other.len() > 1 && other.starts_with('-') => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(program);
                process::exit(1);
            }
            file => files.push(PathBuf::from(file)),
        }
        i += 1;
    }

    if files.is_empty() {
        print_usage(program);
        process::exit(1);
    }

    if config.trace {
        log::set_min_level(Level::Debug);
    }

    if dump {
        for path in &files {
            match read_program_file(path) {
                Ok(bytes) if bytes.is_empty() => warn!("skipping: '{}' is empty", path.display()),
                Ok(bytes) => {
                    let compiled = Program::compile(&bytes);
                    if let Some(warning) = compiled.warning {
                        warn!("{}: {}", path.display(), warning);
                    }
                    println!("{}:", path.display());
                    print!("{}", compiled.program.hex_dump());
                }
                Err(e) => warn!("skipping: {e}"),
            }
        }
        return;
    }

    let supervisor = Supervisor::new(config);

    let handles: Vec<VmHandle> = files
        .iter()
        .filter_map(|path| match supervisor.load_file(path) {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("skipping: {e}");
                None
            }
        })
        .collect();

    for state in supervisor.run_all(handles) {
        println!("{state}");
    }
}

fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
