//! toolrelay - conversational agent backend
//!
//! This is the main entry point for the toolrelay binary.

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod assistant;
mod audit;
mod cli;
mod config;
mod conversation;
mod error;
mod plugins;
mod run_loop;
mod server;
#[cfg(test)]
mod testing;

use assistant::{provision_assistant, AssistantsClient, RemoteAgent};
use audit::AuditLog;
use cli::Args;
use config::Config;
use conversation::ConversationService;
use plugins::{BuiltinTools, PluginLoader, ToolCallExecutor, ToolRegistry};
use run_loop::{RunOrchestrator, RunSettings};
use server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(args.debug, args.json_logs);

    info!("Starting toolrelay v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let mut config =
        Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    config.validate().context("Invalid configuration")?;

    // Register tools; any plugin load failure aborts startup
    let tools_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.plugins.timeout))
        .build()
        .context("Failed to build HTTP client")?;
    let registry = Arc::new(build_registry(&config, tools_client)?);
    info!("Registered tools: {}", registry.tool_names().join(", "));

    if args.list_tools {
        println!("{}", serde_json::to_string_pretty(&tool_listing(&registry))?);
        return Ok(());
    }

    if let Err(e) = serve(config, registry).await {
        error!("toolrelay stopped: {:#}", e);
        std::process::exit(1);
    }

    info!("toolrelay exited");
    Ok(())
}

/// Provision the assistant and serve HTTP until Ctrl-C
async fn serve(config: Config, registry: Arc<ToolRegistry>) -> Result<()> {
    let assistant_key = config.assistant_api_key()?;
    let service_key = config.service_api_key()?;
    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("Invalid bind address '{}'", config.server.bind))?;

    let client = AssistantsClient::new(&config.assistant, &assistant_key)?;
    let assistant_id = provision_assistant(&client, &registry, &config.assistant).await?;
    info!("Using assistant {}", assistant_id);

    let remote: Arc<dyn RemoteAgent> = Arc::new(client);
    let orchestrator = RunOrchestrator::new(
        remote.clone(),
        ToolCallExecutor::new(registry),
        RunSettings::from(&config.run),
    )
    .with_audit(AuditLog::new(config.audit.clone()).map(Arc::new));

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        signal.cancel();
    });

    let state = AppState {
        conversations: ConversationService::new(remote, orchestrator, assistant_id),
        api_key: Arc::from(service_key),
        shutdown,
    };
    server::start_server(addr, state).await?;
    Ok(())
}

/// Built-in tools first, then directory plugins
fn build_registry(config: &Config, client: reqwest::Client) -> error::Result<ToolRegistry> {
    let mut units = BuiltinTools::units(&config.tools, client);
    units.extend(PluginLoader::new(config.plugins.clone()).load_units()?);
    Ok(ToolRegistry::load(units, config.plugins.on_collision)?)
}

/// Declarations as advertised to the assistant, tagged with their origin
fn tool_listing(registry: &ToolRegistry) -> Vec<Value> {
    registry
        .declarations()
        .iter()
        .map(|declaration| {
            let mut tool = declaration.to_function_tool();
            tool["builtin"] = Value::Bool(BuiltinTools::is_builtin(&declaration.name));
            tool
        })
        .collect()
}

/// Initialize the logging/tracing subsystem
fn init_logging(debug: bool, json: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init();
    }
}
