//! MIL Compiler CLI
//!
//! Command-line interface for compiling `.mil` and `.lc` programs to
//! executables, running the optimizer standalone, and interpreting
//! programs directly.

use clap::{CommandFactory, Parser as ClapParser, Subcommand};
use clap_complete::{Shell, generate};
use milc::{CompilerConfig, Dialect};
use std::io;
use std::path::{Path, PathBuf};
use std::process;

#[derive(ClapParser)]
#[command(name = "milc")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "MIL compiler - compile .mil/.lc programs to executables", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a source file to an executable
    Build {
        /// Input .mil or .lc source file
        input: PathBuf,

        /// Output executable path (defaults to input filename without extension)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Keep intermediate LLVM IR file (.ll)
        #[arg(long)]
        keep_ir: bool,

        /// Compiler configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Disable a pass (inline, flow, dedup, unused-args, lift, lower-reps)
        #[arg(long = "disable", value_name = "PASS")]
        disable: Vec<String>,
    },

    /// Run the optimizer and print the transformed MIL
    Opt {
        /// Input .mil or .lc source file
        input: PathBuf,

        /// Compiler configuration file (TOML)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Disable a pass (inline, flow, dedup, unused-args, lift, lower-reps)
        #[arg(long = "disable", value_name = "PASS")]
        disable: Vec<String>,

        /// Dump the program after each pass iteration (debug log level)
        #[arg(long)]
        dump: bool,
    },

    /// Interpret a program directly and print its trace
    Run {
        /// Input .mil or .lc source file
        input: PathBuf,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Build {
            input,
            output,
            keep_ir,
            config,
            disable,
        } => {
            let output = output.unwrap_or_else(|| {
                let stem = input.file_stem().unwrap_or_default();
                PathBuf::from(stem)
            });
            let config = match load_config(config.as_deref(), &disable, false) {
                Ok(c) => c,
                Err(e) => fail(&e),
            };
            if let Err(e) = milc::compile_file(&input, &output, keep_ir, &config) {
                fail(&e);
            }
        }
        Commands::Opt {
            input,
            config,
            disable,
            dump,
        } => {
            let config = match load_config(config.as_deref(), &disable, dump) {
                Ok(c) => c,
                Err(e) => fail(&e),
            };
            match read_source(&input)
                .and_then(|src| milc::optimize_to_text(&src, Dialect::from_path(&input), &config))
            {
                Ok(text) => print!("{}", text),
                Err(e) => fail(&e),
            }
        }
        Commands::Run { input } => {
            match read_source(&input)
                .and_then(|src| milc::run_source(&src, Dialect::from_path(&input)))
            {
                Ok(out) => {
                    for w in &out.trace {
                        println!("{}", w);
                    }
                }
                Err(e) => fail(&e),
            }
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            generate(shell, &mut cmd, name, &mut io::stdout());
        }
    }
}

fn read_source(path: &Path) -> Result<String, String> {
    std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read '{}': {}", path.display(), e))
}

fn load_config(
    path: Option<&Path>,
    disable: &[String],
    dump: bool,
) -> Result<CompilerConfig, String> {
    let mut config = match path {
        Some(p) => CompilerConfig::from_file(p)?,
        None => CompilerConfig::default(),
    };
    for pass in disable {
        config = config.without_pass(pass)?;
    }
    Ok(config.with_dump_passes(dump))
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    process::exit(1);
}
