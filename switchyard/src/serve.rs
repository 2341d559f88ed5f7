use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use switchyard_llm::{Dispatcher, Served, llm_router};
use switchyard_telemetry::UsageMetrics;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Serve the gateway until `SIGINT` or `SIGTERM`
pub async fn run(
    dispatcher: Dispatcher,
    metrics: UsageMetrics,
    listen: SocketAddr,
) -> anyhow::Result<()> {
    let tracking = middleware::from_fn_with_state(metrics, track_completions);
    let app = llm_router(dispatcher).layer(tracking);

    let listener = TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind {listen}: {e}"))?;

    tracing::info!(address = %listener.local_addr()?, "listening");

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();

    tokio::spawn(async move {
        shutdown_signal().await;
        trigger.cancel();
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    tracing::info!("switchyard stopped");
    Ok(())
}

/// Record count and latency of every chat request
///
/// For streams the latency is time to the first byte.
async fn track_completions(
    State(metrics): State<UsageMetrics>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let response = next.run(request).await;

    if let Some(served) = response.extensions().get::<Served>() {
        let outcome = if response.status().is_success() { "ok" } else { "error" };
        metrics.record_request(served.provider.as_str(), &served.model, outcome, started.elapsed());
    }

    response
}

/// Wait for a shutdown signal (`SIGINT` or `SIGTERM`)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    tracing::info!("shutdown signal received");
}
