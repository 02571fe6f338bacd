//! BX Compiler CLI
//!
//! `build` runs the full pipeline to a native executable; `check` and
//! `emit-tac` stop partway through for debugging, built on the same
//! library entry points the `build` subcommand uses.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};
use tracing_subscriber::EnvFilter;

use bxc::{check_file, compile_file, emit_tac, CompilerConfig};

#[derive(ClapParser)]
#[command(name = "bxc", about = "Ahead-of-time compiler for BX, targeting x86-64", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a BX source file to a native executable.
    Build {
        input: PathBuf,
        /// Output executable path (default: input with its extension stripped).
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Disable the §4.G/§4.H optimization passes.
        #[arg(long)]
        no_optimize: bool,
        /// Write FILE.tac.json alongside the output.
        #[arg(long)]
        keep_tac: bool,
        /// Keep the generated FILE.s after linking.
        #[arg(long)]
        keep_asm: bool,
    },
    /// Parse and type-check only; no code is generated.
    Check { input: PathBuf },
    /// Lower to TAC and print it as JSON, without generating assembly.
    EmitTac {
        input: PathBuf,
        #[arg(long)]
        no_optimize: bool,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BXC_LOG").unwrap_or_else(|_| EnvFilter::new("off"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Build { input, output, no_optimize, keep_tac, keep_asm } => {
            let mut config = CompilerConfig::new().with_optimize(!no_optimize).with_keep_tac(keep_tac).with_keep_asm(keep_asm);
            if let Some(output) = output {
                config = config.with_output(output);
            }
            compile_file(&input, &config).map(|path| println!("{} -> {}", input.display(), path.display()))
        }
        Commands::Check { input } => check_file(&input).map(|_| println!("{}: ok", input.display())),
        Commands::EmitTac { input, no_optimize, output } => {
            let config = CompilerConfig::new().with_optimize(!no_optimize);
            emit_tac(&input, &config).map(|tac| {
                let json = serde_json::to_string_pretty(&tac).expect("TacProgram always serializes");
                match output {
                    Some(path) => {
                        if let Err(e) = std::fs::write(&path, json) {
                            eprintln!("{}: cannot write: {e}", path.display());
                        }
                    }
                    None => println!("{json}"),
                }
            })
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(diag) => {
            eprintln!("{diag}");
            ExitCode::FAILURE
        }
    }
}
