//! DLR CLI - Load DLR runtime builds and run compiled models from the command line.

use clap::{Parser, Subcommand};

mod commands;

use commands::{InfoCommand, PathCommand, RunCommand};

/// DLR CLI - Load DLR runtime builds and run compiled models.
///
/// Runtime libraries are looked up in ~/.djl.ai/dlr/ unless DLR_LIBRARY_PATH
/// or a config file says otherwise.
#[derive(Parser)]
#[command(name = "dlr")]
#[command(about = "DLR inference runtime CLI tool")]
#[command(version)]
pub struct Cli {
    /// Runtime config file (YAML or JSON)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Output file (default: stdout)
    #[arg(short = 'o', long, global = true)]
    pub output: Option<String>,

    /// Input request file (YAML or JSON)
    #[arg(short = 'f', long = "file", global = true)]
    pub input: Option<String>,

    /// Output as JSON (for piping)
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose output
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show the inputs, weights and outputs of a model
    Info(InfoCommand),
    /// Run a model on the inputs of a request file
    Run(RunCommand),
    /// Print the library path resolved for a runtime id
    Path(PathCommand),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_target(false)
            .init();
    }

    match &cli.command {
        Commands::Info(cmd) => cmd.run(&cli),
        Commands::Run(cmd) => cmd.run(&cli),
        Commands::Path(cmd) => cmd.run(&cli),
    }
}
