//! Main entry point for the Relay command-line client.

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use dotenv::dotenv;
use std::path::PathBuf;

mod commands;

/// Relay CLI
#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Command-line client for the Relay broadcast service", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the broadcast and chat interactively
    Chat(commands::chat::ChatArgs),

    /// Generate shell completion scripts for the CLI
    Completion {
        /// The shell to generate the completion script for
        #[arg(long, short, value_enum)]
        shell: Shell,
    },

    /// Generate a server configuration file
    Config {
        /// Format of the configuration file (yaml or json)
        #[arg(long, short, default_value = "yaml")]
        format: String,

        /// Where to write the file (default: config.yaml or config.json)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Chat(args) => commands::chat::handle_chat(args).await?,
        Commands::Completion { shell } => commands::completion::generate_completion(shell),
        Commands::Config { format, output } => {
            commands::config::generate_config(&format, output)?;
        }
    }

    Ok(())
}
