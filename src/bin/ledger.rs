use anyhow::Result;
use clap::{Parser, Subcommand};
use refunder::config::Config;
use refunder::query::commands::{cmd_init, cmd_refunded, cmd_show};
use refunder::query::formatters::OutputFormat;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ledger")]
#[command(about = "Inspect and initialize the refunder's persisted ledger", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    #[arg(short, long, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cursor, cumulative spend, giveaway total and refunded count.
    Show,
    /// Every address refunded so far.
    Refunded,
    /// Create missing ledger files with their initial values.
    Init,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let format = OutputFormat::from(cli.format.as_str());
    let config = Config::read(&cli.config)?;

    match cli.command {
        Commands::Show => cmd_show(&config, &format)?,
        Commands::Refunded => cmd_refunded(&config, &format)?,
        Commands::Init => cmd_init(&config, &format)?,
    }

    Ok(())
}
