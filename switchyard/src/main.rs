#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod args;
mod chat;
mod serve;

use std::path::Path;

use args::{Args, Command, DEFAULT_CONFIG};
use clap::Parser;
use switchyard_config::Config;
use switchyard_llm::{BusEvent, Dispatcher};
use switchyard_telemetry::UsageMetrics;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;

    // Chat output goes to stdout, so keep logs quiet there unless asked
    let default_filter = match args.command {
        Command::Serve { .. } => "info",
        Command::Chat { .. } => "warn",
    };
    let _telemetry_guard = switchyard_telemetry::init(config.telemetry.as_ref(), default_filter)?;

    tracing::info!(config_path = %args.config.display(), "starting switchyard");

    let dispatcher = Dispatcher::new(config.llm.clone())?;
    let metrics = UsageMetrics::default();

    tokio::spawn(record_usage(dispatcher.bus().subscribe(), metrics.clone()));

    match args.command {
        Command::Serve { listen } => {
            serve::run(dispatcher, metrics, listen.unwrap_or(config.server.listen)).await
        }
        Command::Chat {
            model,
            system,
            stream,
            prompt,
        } => {
            let chat = chat::Chat {
                model,
                system,
                stream,
                prompt,
            };
            chat::run(&dispatcher, &metrics, chat).await
        }
    }
}

/// Load the config file, tolerating a missing default file
fn load_config(path: &Path) -> anyhow::Result<Config> {
    if path == Path::new(DEFAULT_CONFIG) && !path.exists() {
        return Ok(Config::default());
    }

    Config::load(path)
}

/// Feed out-of-band usage reports into the token metrics
async fn record_usage(mut events: broadcast::Receiver<BusEvent>, metrics: UsageMetrics) {
    loop {
        match events.recv().await {
            Ok(BusEvent::Usage(event)) => {
                tracing::debug!(provider = %event.provider, model = %event.model, "usage reported");

                if let Some(usage) = event.usage {
                    metrics.record_tokens(
                        &event.provider,
                        &event.model,
                        u64::from(usage.prompt_tokens),
                        u64::from(usage.completion_tokens),
                    );
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "usage recorder lagged behind the bus");
            }
            Err(RecvError::Closed) => break,
        }
    }
}
