use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use notify_dispatch::config::{LoggingConfig, Settings};
use notify_dispatch::metrics::encode_metrics;
use notify_dispatch::notification::{Message, NotificationService, Priority, Recipient, Target};
use notify_dispatch::pipeline::LoggingPublisher;
use notify_dispatch::store::{create_store, DefaultStorePolicy};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One line of input on stdin
#[derive(Debug, Deserialize)]
struct MessageRequest {
    #[serde(default)]
    priority: Priority,
    #[serde(default)]
    target: Target,
    #[serde(default)]
    recipients: Vec<Recipient>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    data: serde_json::Value,
}

impl From<MessageRequest> for Message {
    fn from(request: MessageRequest) -> Self {
        let mut builder = Message::builder()
            .with_priority(request.priority)
            .with_target(request.target)
            .with_recipients(request.recipients)
            .with_data(request.data);
        if let Some(subject) = request.subject {
            builder = builder.with_subject(subject);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    init_tracing(&settings.logging);
    tracing::info!("Configuration loaded");

    // Create the service
    let store = create_store(&settings.dispatcher.store);
    let policy = Arc::new(DefaultStorePolicy::new(&settings.dispatcher.policy));
    let service = NotificationService::builder()
        .store(store)
        .policy(policy)
        .publisher(LoggingPublisher::default())
        .build();

    service.start().await?;

    let drained = async {
        read_requests(&service).await;
        tracing::info!("Input closed, waiting for queued messages to be dispatched");
        service.wait_until_idle(DRAIN_POLL_INTERVAL).await;
    };

    tokio::select! {
        _ = drained => {
            tracing::info!("Queue drained, initiating graceful shutdown");
        }
        _ = shutdown_signal() => {}
    }

    service.stop().await?;

    let stats = service.stats();
    tracing::info!(
        added = stats.added,
        dispatched = stats.dispatched,
        published = stats.published,
        "Dispatcher shutdown complete"
    );
    match encode_metrics() {
        Ok(metrics) => tracing::debug!(metrics = %metrics, "Final metrics"),
        Err(e) => tracing::warn!(error = %e, "Failed to encode metrics"),
    }

    Ok(())
}

/// Submit every newline-delimited JSON request read from stdin until EOF
async fn read_requests(service: &NotificationService) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: MessageRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed request");
                continue;
            }
        };

        match service.add(request.into()).await {
            Ok(id) => tracing::info!(message_id = %id, "Message queued"),
            Err(e) if e.is_validation() => {
                tracing::warn!(error = %e, "Rejected invalid message");
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to queue message");
                break;
            }
        }
    }
}

fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if config.format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
