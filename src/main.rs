// File: src/main.rs
//
// Main entry point for the Ruff programming language interpreter.
// Handles command-line argument parsing and dispatches to the appropriate
// subcommand (run, repl, or check).

mod builtins;
mod bytecode;
mod compiler;
mod errors;
mod gc;
mod lexer;
mod module;
mod repl;
mod type_checker;
mod type_info;
mod value;
mod vm;

use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "ruff",
    about = "Ruff: A small statically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
#[command(arg_required_else_help = true)]
enum Commands {
    /// Run a Ruff script file
    Run {
        /// Path to the .ruff file
        file: PathBuf,
    },

    /// Launch the interactive Ruff REPL
    Repl,

    /// Type-check a Ruff script without executing it
    Check {
        /// Path to the .ruff file
        file: PathBuf,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file } => run_file(file),
        Commands::Repl => match repl::Repl::new() {
            Ok(mut repl) => match repl.run() {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("REPL error: {}", e);
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("Failed to start REPL: {}", e);
                ExitCode::FAILURE
            }
        },
        Commands::Check { file } => check_file(file),
    }
}

fn run_file(file: PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot read '{}': {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let filename = file.to_string_lossy().to_string();

    let mut interpreter = vm::VM::new();
    match interpreter.run_source(&source, Some(filename)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(errors) => {
            for error in &errors {
                eprintln!("{}", error);
            }
            ExitCode::FAILURE
        }
    }
}

fn check_file(file: PathBuf) -> ExitCode {
    let source = match std::fs::read_to_string(&file) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("Cannot read '{}': {}", file.display(), e);
            return ExitCode::FAILURE;
        }
    };
    let filename = file.to_string_lossy().to_string();

    let errors = type_checker::TypeChecker::new(&source, Some(filename)).check();
    if errors.is_empty() {
        println!("No type errors found.");
        ExitCode::SUCCESS
    } else {
        for error in &errors {
            eprintln!("{}", error);
        }
        ExitCode::FAILURE
    }
}
