#![cfg_attr(not(test), forbid(unsafe_code))]

//! Main entry point for the Relay server binary.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use relay_server::server;
use shared::config::server::Config;

#[derive(Debug, Parser)]
#[command(name = "relay-server")]
#[command(about = "Durable broadcast messaging server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the server
    Serve {
        /// Port to bind, overriding the configuration file and environment
        #[arg(long, short)]
        port: Option<u16>,

        /// Configuration file (.yaml, .yml or .json); defaults are used when omitted
        #[arg(long, short)]
        config: Option<PathBuf>,
    },
}

/// Loads configuration and runs the server until shutdown.
///
/// # Errors
/// Returns an error if configuration loading or server startup fails.
pub async fn handle_serve_command(port: Option<u16>, config: Option<PathBuf>) -> anyhow::Result<()> {
    let resolved = Config::load_config(config, port).context("loading configuration")?;
    server::run(resolved).await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, config } => handle_serve_command(port, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_accepts_port_and_config() {
        let cli = Cli::try_parse_from(["relay-server", "serve", "--port", "8080", "-c", "relay.yaml"])
            .unwrap();
        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, Some(8080));
        assert_eq!(config, Some(PathBuf::from("relay.yaml")));
    }

    #[test]
    fn serve_without_arguments_uses_configuration() {
        let cli = Cli::try_parse_from(["relay-server", "serve"]).unwrap();
        let Commands::Serve { port, config } = cli.command;
        assert_eq!(port, None);
        assert_eq!(config, None);
    }

    #[tokio::test]
    async fn unsupported_config_file_fails_before_serving() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "port = 1").unwrap();

        let err = handle_serve_command(None, Some(path)).await.unwrap_err();
        assert!(err.to_string().contains("loading configuration"));
    }
}
