use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "phasegate")]
#[command(version, about = "Evidence-gated lifecycle orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding session state. Overrides phasegate.toml and PHASEGATE_STATE_DIR.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Also write JSON logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create and initialize a session
    Init { session: String },
    /// Show the phase table and overall status of a session
    Status { session: String },
    /// Record explicit approval to continue an incomplete session
    Approve {
        session: String,
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
        /// Name recorded as the approver (defaults to $USER)
        #[arg(long)]
        approver: Option<String>,
    },
    /// Generate and print the final report
    Report { session: String },
    /// Verify the sealed evidence index of a session
    Verify { session: String },
    /// List operations that have no evidence
    Inventory {
        session: String,
        /// Operation ids expected to have evidence (comma-separated)
        #[arg(long, value_delimiter = ',')]
        operations: Vec<String>,
    },
    /// Judge files against the six review criteria
    Review {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// File holding the executor's response text
        #[arg(long)]
        response: Option<PathBuf>,
        /// Evidence ids attached to the artifact
        #[arg(long)]
        evidence: Vec<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default phasegate.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = phasegate::logging::init_tracing(cli.verbose, cli.log_dir.as_deref())
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;
    let ctx = cmd::Context::resolve(&cli)?;

    match &cli.command {
        Commands::Init { session } => cmd::cmd_init(&ctx, session)?,
        Commands::Status { session } => cmd::cmd_status(&ctx, session)?,
        Commands::Approve {
            session,
            yes,
            approver,
        } => cmd::cmd_approve(&ctx, session, *yes, approver.as_deref())?,
        Commands::Report { session } => cmd::cmd_report(&ctx, session)?,
        Commands::Verify { session } => cmd::cmd_verify(&ctx, session)?,
        Commands::Inventory {
            session,
            operations,
        } => cmd::cmd_inventory(&ctx, session, operations)?,
        Commands::Review {
            files,
            response,
            evidence,
        } => {
            let passed = cmd::cmd_review(&ctx, files, response.as_deref(), evidence)?;
            if !passed {
                std::process::exit(1);
            }
        }
        Commands::Config { command } => cmd::cmd_config(&ctx, command.clone())?,
    }

    Ok(())
}
