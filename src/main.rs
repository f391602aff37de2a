use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;

use azure_bot::backend::azure::AzureClientFactory;
use azure_bot::chat::discord::{DiscordGateway, DiscordSink, spawn_supervised};
use azure_bot::cli::{Cli, Command};
use azure_bot::config;
use azure_bot::dispatch::Dispatcher;
use azure_bot::error::BotError;
use azure_bot::logging;
use azure_bot::orchestrator::Orchestrator;
use azure_bot::registry::VmRegistry;

const TOKEN_ENV: &str = "AZURE_BOT_DISCORD_TOKEN";
const EVENT_QUEUE: usize = 64;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_file.as_deref())?;

    match cli.command() {
        Command::Check => {
            let registry = load_registry(&cli)?;
            println!("{} VM(s) configured:", registry.len());
            for entry in registry.entries() {
                println!("  {entry}");
            }
        }
        Command::Run => {
            if std::env::var("CI").is_ok_and(|v| v == "true") {
                tracing::info!("CI=true, skipping bot startup");
                return Ok(());
            }
            let token = std::env::var(TOKEN_ENV)
                .ok()
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| BotError::MissingEnv {
                    name: TOKEN_ENV.to_string(),
                })?;
            let registry = load_registry(&cli)?;
            run(registry, token, cli.operation_timeout.map(Duration::from_secs)).await?;
        }
    }

    Ok(())
}

fn load_registry(cli: &Cli) -> Result<VmRegistry, BotError> {
    let override_path = std::env::var(config::CONFIG_PATH_ENV).ok();
    let path = config::resolve_path(&cli.config, override_path.as_deref());
    config::load_registry(&path)
}

async fn run(
    registry: VmRegistry,
    token: String,
    deadline: Option<Duration>,
) -> Result<(), BotError> {
    tracing::info!(vms = registry.len(), "starting azure-bot");

    let http = reqwest::Client::new();
    let orchestrator = Orchestrator::new(Arc::new(AzureClientFactory::from_env()))
        .with_deadline(deadline);
    let sink = Arc::new(DiscordSink::new(http, token.clone()));
    let mut dispatcher = Dispatcher::new(Arc::new(registry), orchestrator, sink);

    let (tx, mut rx) = mpsc::channel(EVENT_QUEUE);
    let supervisor = spawn_supervised(DiscordGateway::new(token), tx);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                // Handler tasks run detached; nothing joins them.
                Some(event) => drop(dispatcher.handle_event(event)),
                None => {
                    tracing::error!("gateway supervisor stopped");
                    break;
                }
            },
            result = &mut shutdown => {
                result?;
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    supervisor.abort();
    Ok(())
}

fn signal_error(source: std::io::Error) -> BotError {
    BotError::Io {
        context: "failed to install signal handler".into(),
        source,
    }
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<(), BotError> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate()).map_err(signal_error)?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map_err(signal_error),
        _ = term.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<(), BotError> {
    tokio::signal::ctrl_c().await.map_err(signal_error)
}
