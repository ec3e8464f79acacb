use clap::Parser;
use std::fs;
use std::io::{BufRead, Write};
use std::path::PathBuf;

use mylox::backend::vm::{InterpretResult, LogLevel, VirtualMachine};

#[derive(Parser)]
#[command(name = "myloxc")]
#[command(version = "1.0")]
#[command(author = "Yuyang Feng && Zimeng Li")]
#[command(about = "Mylox: a unified Lox compiler and VM", long_about = None)]
struct Cli {
    /// Script to run; omit it for the interactive prompt.
    input: Option<PathBuf>,

    #[arg(short, long, value_enum, default_value_t = LogLevel::Release)]
    mode: LogLevel,

    /// Collect before every growing allocation (GC stress test).
    #[arg(long)]
    gc_stress: bool,
}

fn main() {
    let cli = Cli::parse();

    let mut vm = VirtualMachine::new();
    vm.log_level = cli.mode;
    vm.heap.stress = cli.gc_stress;

    match cli.input {
        Some(path) => run_file(&mut vm, &path),
        None => repl(&mut vm),
    }
}

fn run_file(vm: &mut VirtualMachine, path: &PathBuf) {
    let source = match fs::read_to_string(path) {
        Ok(source) => source,
        Err(err) => {
            eprintln!("Could not read file '{}': {}", path.display(), err);
            std::process::exit(74);
        }
    };

    if vm.log_level != LogLevel::Release {
        println!("[Mylox] Compiling: {}", path.display());
    }

    match vm.interpret(&source) {
        InterpretResult::Ok => {}
        InterpretResult::CompileError => std::process::exit(65),
        InterpretResult::RuntimeError => std::process::exit(70),
    }
}

/// Line-at-a-time prompt. Errors are reported and the session keeps going;
/// globals survive between lines because the VM does.
fn repl(vm: &mut VirtualMachine) {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        print!("> ");
        let _ = std::io::stdout().flush();

        match lines.next() {
            Some(Ok(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                vm.interpret(&line);
            }
            _ => {
                println!();
                break;
            }
        }
    }
}
