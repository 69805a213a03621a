//! The `svi` binary: run, translate, and inspect SVI programs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use svi_core::Config;
use svi_vm::{Pipeline, StdSink, VmError};

#[derive(Parser)]
#[command(name = "svi", version, about = "The SVI virtual machine")]
struct Cli {
    /// Emit per-instruction traces.
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a program (textual SVI or binary SBI).
    Run {
        /// Program file; the SBI marker selects the binary loader.
        file: PathBuf,

        /// Run with purely local, synchronous drivers (no worker pool).
        #[arg(long)]
        locally: bool,

        /// Worker threads for deferred calls.
        #[arg(long)]
        workers: Option<usize>,

        /// Skip the bundled prologue provider.
        #[arg(long)]
        no_prologue: bool,
    },

    /// Translate a textual program to its binary SBI form.
    Emit {
        file: PathBuf,

        /// Output path; defaults to the input with an `.sbi` extension.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Print the parsed instruction list.
    Parse { file: PathBuf },

    /// Print the token stream of a textual program.
    Tokens { file: PathBuf },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Run {
            file,
            locally,
            workers,
            no_prologue,
        } => {
            let pipeline = Pipeline::from_path(&file)?;
            let mut config = Config {
                verbose: cli.verbose,
                with_prologue: !no_prologue,
                ..Config::default()
            };
            if let Some(workers) = workers {
                config.workers = workers;
            }

            let sink = Arc::new(StdSink);
            let outcome = if locally {
                let mut vm = pipeline.target_local(config, sink)?;
                vm.execute()
            } else {
                let (mut vm, handles, shutdown) = pipeline.target_threaded(config, sink)?;
                let outcome = vm.execute();
                shutdown.trigger();
                for handle in handles {
                    let _ = handle.join();
                }
                outcome
            };

            match outcome {
                Ok(()) => Ok(ExitCode::SUCCESS),
                Err(VmError::UnhandledException { code }) => {
                    eprintln!("error: unhandled exception with code {code}");
                    let status = (code as i64).clamp(1, 255) as u8;
                    Ok(ExitCode::from(status))
                }
                Err(err) => Err(err.into()),
            }
        }

        Command::Emit { file, output } => {
            let pipeline = Pipeline::from_path(&file)?;
            let bytes = pipeline.binary_representation()?;
            let output = output.unwrap_or_else(|| file.with_extension("sbi"));
            std::fs::write(&output, bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("wrote {}", output.display());
            Ok(ExitCode::SUCCESS)
        }

        Command::Parse { file } => {
            let pipeline = Pipeline::from_path(&file)?;
            for instruction in pipeline.instructions()? {
                println!("{instruction}");
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Tokens { file } => {
            let pipeline = Pipeline::from_path(&file)?;
            for token in pipeline.tokens()? {
                println!("{token}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
