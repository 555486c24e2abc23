//! ForgeDB command-line interface.
//!
//! # Usage
//!
//! ```bash
//! # Interactive shell
//! forge -f my_database.db
//!
//! # Single-shot command mode (for scripting and visualisers)
//! forge insert 1 alice alice@example.com
//! forge .json
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;
mod formatter;
mod repl;

use commands::Command;
use forge_storage::Database;
use repl::Repl;

/// ForgeDB command-line interface
#[derive(Parser, Debug)]
#[command(
    name = "forge",
    version,
    about = "Single-file B+ tree key/value store",
    long_about = "ForgeDB: a single-file, single-writer key/value store.\n\n\
                  With no arguments an interactive shell starts. Any trailing\n\
                  arguments are joined and executed as one command, then the\n\
                  process exits."
)]
struct Args {
    /// Database file path
    #[arg(short = 'f', long, default_value = "my_database.db", env = "FORGE_DB")]
    file: PathBuf,

    /// Enable verbose engine logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Suppress the banner (for scripting)
    #[arg(short = 'q', long)]
    quiet: bool,

    /// A single command to execute instead of starting the shell
    #[arg(trailing_var_arg = true)]
    command: Vec<String>,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let db = Database::open(&args.file)?;

    if !args.command.is_empty() {
        // Single-shot mode: run one command and exit
        let line = args.command.join(" ");
        let mut db = db;
        Command::parse(&line).execute(&mut db)?;
        db.close()?;
        return Ok(());
    }

    let repl = Repl::new(db)?;
    if !args.quiet {
        repl.print_banner();
    }
    repl.run()
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("forge_storage=debug,forge_cli=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();
}
