//! Command handlers for the peerlink CLI

use tracing::info;

use crate::cli::{Cli, Commands};
use crate::config::AppConfig;
use crate::demo::{self, DemoReport};
use crate::error::Result;

/// Command dispatcher for handling CLI commands
pub struct CommandDispatcher;

impl CommandDispatcher {
    /// Execute a CLI command
    pub async fn execute(cli: Cli, config: AppConfig) -> Result<()> {
        match cli.command {
            Commands::Demo {
                peers,
                messages,
                identity,
            } => {
                let config = Self::apply_demo_overrides(config, peers, messages, identity);
                Self::handle_demo_command(&config, cli.json).await
            }
            Commands::ShowConfig => Self::handle_show_config_command(&config, cli.json),
        }
    }

    /// Layer command line flags over the loaded configuration
    pub fn apply_demo_overrides(
        mut config: AppConfig,
        peers: Option<usize>,
        messages: Vec<String>,
        identity: Option<String>,
    ) -> AppConfig {
        if let Some(peers) = peers {
            config.demo.peers = peers;
        }
        if !messages.is_empty() {
            config.demo.messages = messages;
        }
        if identity.is_some() {
            config.identity.identity = identity;
        }
        config
    }

    /// Handle the demo command
    async fn handle_demo_command(config: &AppConfig, json: bool) -> Result<()> {
        info!(
            "Starting demo with {} peers and {} messages each",
            config.demo.peers,
            config.demo.messages.len()
        );
        let report = demo::run(config).await?;

        if json {
            println!("{}", serde_json::to_string(&report)?);
        } else {
            Self::print_report(&report);
        }
        Ok(())
    }

    /// Handle the show-config command
    fn handle_show_config_command(config: &AppConfig, json: bool) -> Result<()> {
        if json {
            println!("{}", serde_json::to_string_pretty(config)?);
        } else {
            print!("{}", config.to_toml()?);
        }
        Ok(())
    }

    fn print_report(report: &DemoReport) {
        println!("Local identity: {}", report.local_identity);
        for event in &report.events {
            println!("  {}", event);
        }
        for exchange in &report.exchanges {
            match &exchange.received {
                Some(reply) => println!("  {} <- {:?} -> {:?}", exchange.peer, exchange.sent, reply),
                None => println!("  {} <- {:?} (no reply)", exchange.peer, exchange.sent),
            }
        }
        println!(
            "{} peers found, {}/{} messages echoed",
            report.found(),
            report.echoed(),
            report.exchanges.len()
        );
    }
}
