//! CLI commands
//!
//! - `agents`: bring up every configured agent and print the readiness report
//! - `route <text>`: route one request on a fresh thread and print the answer

use crate::loader::load_config;
use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use switchboard_core::{
    format_error_for_chat, initialize, CapabilityTable, HeuristicJudge, ReadinessReport, ReflectionController,
    SupervisorRouter, SwitchboardConfig, TaskState,
};
use tracing::{info, warn};

/// Switchboard CLI
#[derive(Parser, Debug)]
#[command(name = "switchboard")]
#[command(about = "Routes operational requests to specialized agents")]
#[command(version)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring up the configured agents and report readiness
    Agents {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Route one request and print the aggregated answer
    Route {
        /// The request
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
    },
}

/// Run the CLI command
pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Some(Commands::Agents { json }) => agents(json).await,
        Some(Commands::Route { text, json }) => route(&text.join(" "), json).await,
        None => {
            let mut cmd = <Cli as clap::CommandFactory>::command();
            cmd.print_help()?;
            println!();
            Ok(())
        }
    }
}

async fn bring_up(config: &SwitchboardConfig) -> Result<ReadinessReport> {
    let endpoints = config
        .endpoints()
        .map_err(|e| anyhow!(format_error_for_chat(&e)))?;
    if endpoints.is_empty() {
        warn!("No agents configured. Add [[agents]] entries to config/local.toml.");
    }
    Ok(initialize(endpoints, &config.connector, config.stream.dedup).await)
}

async fn agents(json: bool) -> Result<()> {
    let config = load_config()?;
    let report = bring_up(&config).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

async fn route(text: &str, json: bool) -> Result<()> {
    let config = load_config()?;
    let report = bring_up(&config).await?;
    info!(ready = report.ready_count(), "Agents initialized");

    let router = SupervisorRouter::new(
        CapabilityTable::from_report(&report),
        ReflectionController::new(config.retry.to_retry_config(), Arc::new(HeuristicJudge)),
        config.supervisor.clone(),
    );
    let thread_id = router.new_thread().await;

    let routing = router.route(thread_id, text);
    tokio::pin!(routing);
    let result = tokio::select! {
        result = &mut routing => result,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling");
            router.cancel_thread(&thread_id).await;
            routing.await
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", result.text);
    }

    if matches!(result.state, TaskState::Failed | TaskState::Canceled) {
        std::process::exit(1);
    }
    Ok(())
}
