//! Listener lifecycle for the observer API.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{info, warn};

use super::routes::{ApiState, build_router};
use crate::config::HttpConfig;
use crate::engine::Engine;

/// Status of the HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpStatus {
    Running,
    /// Bind failed; retrying in the background.
    Retrying,
    Stopped,
}

/// Handle for managing the HTTP server lifecycle.
pub struct HttpHandle {
    shutdown_tx: Option<oneshot::Sender<()>>,
    status_rx: watch::Receiver<HttpStatus>,
}

impl HttpHandle {
    pub fn status(&self) -> HttpStatus {
        *self.status_rx.borrow()
    }

    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Start the HTTP server on localhost.
///
/// Returns a oneshot sender that can be used to signal shutdown,
/// and the actual address the server is bound to.
pub async fn start_server(
    engine: Arc<Engine>,
    port: u16,
) -> anyhow::Result<(oneshot::Sender<()>, SocketAddr)> {
    let app = build_router(ApiState::new(engine));

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    info!("Observer API listening on http://{}", bound_addr);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("Observer API shutting down");
            })
            .await
        {
            // The engine keeps running without its observers.
            tracing::error!("Observer API error: {}", e);
        }
    });

    Ok((shutdown_tx, bound_addr))
}

fn next_delay(current_ms: u64, multiplier: f64, max_ms: u64) -> u64 {
    ((current_ms as f64 * multiplier) as u64).clamp(current_ms.min(max_ms), max_ms)
}

/// Start the HTTP server, retrying in the background while the port is taken.
pub fn start_server_with_retry(engine: Arc<Engine>, config: &HttpConfig) -> HttpHandle {
    let port = config.port;
    let retry_max_ms = config.retry_max_ms;
    let retry_multiplier = config.retry_multiplier;
    let mut current_delay_ms = config.retry_initial_ms;

    let (status_tx, status_rx) = watch::channel(HttpStatus::Retrying);
    let (handle_shutdown_tx, mut handle_shutdown_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        loop {
            match start_server(Arc::clone(&engine), port).await {
                Ok((server_shutdown_tx, bound_addr)) => {
                    info!("Observer API available at http://{}", bound_addr);
                    let _ = status_tx.send(HttpStatus::Running);
                    let _ = (&mut handle_shutdown_rx).await;
                    let _ = server_shutdown_tx.send(());
                    break;
                }
                Err(e) => {
                    warn!(
                        "Failed to bind observer API on port {}: {}. Retrying in {:.1}s...",
                        port,
                        e,
                        current_delay_ms as f64 / 1000.0
                    );
                    let _ = status_tx.send(HttpStatus::Retrying);
                    tokio::select! {
                        _ = &mut handle_shutdown_rx => break,
                        _ = tokio::time::sleep(Duration::from_millis(current_delay_ms)) => {}
                    }
                    current_delay_ms = next_delay(current_delay_ms, retry_multiplier, retry_max_ms);
                }
            }
        }
        info!("Observer API stopped");
        let _ = status_tx.send(HttpStatus::Stopped);
    });

    HttpHandle {
        shutdown_tx: Some(handle_shutdown_tx),
        status_rx,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_to_cap() {
        assert_eq!(next_delay(15_000, 2.0, 240_000), 30_000);
        assert_eq!(next_delay(200_000, 2.0, 240_000), 240_000);
        assert_eq!(next_delay(240_000, 2.0, 240_000), 240_000);
    }
}
