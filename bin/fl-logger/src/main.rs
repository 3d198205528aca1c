//! FieldLog data-acquisition service
//!
//! Polls Modbus/TCP devices and ingests MQTT telemetry, persisting every
//! reading to a TimescaleDB hypertable with a file-backed dead-letter queue
//! behind the writer.
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `FIELDLOG_CONFIG` | - | Path to the TOML config file |
//! | `FIELDLOG_DB_URL` | - | Overrides `timescale.connection_string` |
//! | `FIELDLOG_HTTP_PORT` | `8080` | Admin health/status port |
//! | `LOG_FORMAT` | text | Set to `json` for JSON logs |
//! | `RUST_LOG` | `info` | Log level filter |

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

use fl_config::ConfigLoader;
use fl_service::{LoggerService, ServiceStatus};

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    fl_common::logging::init_logging("fl-logger");
    info!("Starting FieldLog");

    let config = match std::env::args().nth(1) {
        Some(path) => ConfigLoader::with_path(path).load()?,
        None => ConfigLoader::new().load()?,
    };

    let service = LoggerService::start(config).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Minimal admin surface: liveness plus the in-process status snapshot.
    // Monitoring treats anything but 200 on /health as failure.
    let http_port: u16 = env_or_parse("FIELDLOG_HTTP_PORT", 8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let app = axum::Router::new()
        .route("/health", axum::routing::get(health_handler))
        .route("/status", axum::routing::get(status_handler))
        .with_state(Arc::clone(&service));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Admin endpoints listening on http://{addr}");

    let server = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("FieldLog started");
    shutdown_signal().await;
    info!("Shutdown signal received...");

    let _ = shutdown_tx.send(());
    service.stop().await;
    let _ = server.await;

    info!("FieldLog shutdown complete");
    Ok(())
}

async fn health_handler(
    State(service): State<Arc<LoggerService>>,
) -> (StatusCode, Json<serde_json::Value>) {
    if service.is_healthy() {
        (StatusCode::OK, Json(serde_json::json!({ "status": "UP" })))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "DOWN" })),
        )
    }
}

async fn status_handler(State(service): State<Arc<LoggerService>>) -> Json<ServiceStatus> {
    Json(service.status())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
