//! Connection Listener
//!
//! Owns both sockets. Each accepted control connection gets its own handler
//! task; the media router runs beside the accept loop.

use crate::control::handle_connection;
use crate::media::MediaRouter;
use crate::state::{AppState, Config};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for connection handlers to run their cleanup
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct RelayServer {
    state: AppState,
    control: TcpListener,
    media: Arc<UdpSocket>,
}

impl RelayServer {
    /// Prepare storage and bind both sockets
    pub async fn bind(config: Config) -> Result<Self> {
        let control_addr = format!("{}:{}", config.bind_host, config.control_port);
        let media_addr = format!("{}:{}", config.bind_host, config.media_port);

        let state = AppState::new(config).await?;
        let control = TcpListener::bind(&control_addr)
            .await
            .with_context(|| format!("Failed to bind control channel on {}", control_addr))?;
        let media = UdpSocket::bind(&media_addr)
            .await
            .with_context(|| format!("Failed to bind media channel on {}", media_addr))?;

        Ok(Self {
            state,
            control,
            media: Arc::new(media),
        })
    }

    pub fn control_addr(&self) -> Result<SocketAddr> {
        Ok(self.control.local_addr()?)
    }

    pub fn media_addr(&self) -> Result<SocketAddr> {
        Ok(self.media.local_addr()?)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Cancelling this token stops the server
    pub fn shutdown_token(&self) -> CancellationToken {
        self.state.shutdown.clone()
    }

    /// Serve until the shutdown token is cancelled
    pub async fn run(self) -> Result<()> {
        let shutdown = self.state.shutdown.clone();
        tracing::info!(
            "Control channel on {}, media channel on {}",
            self.control_addr()?,
            self.media_addr()?
        );

        let router = MediaRouter::new(self.media.clone(), &self.state);
        let router_task = tokio::spawn(router.run(shutdown.clone()));

        let mut handlers = JoinSet::new();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(finished) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            tracing::warn!("Connection handler panicked: {}", e);
                        }
                    }
                }
                accepted = self.control.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(peer = %peer, "Accepted control connection");
                        handlers.spawn(handle_connection(stream, peer, self.state.clone()));
                    }
                    Err(e) => {
                        // Usually fd exhaustion; back off instead of spinning
                        tracing::warn!("Failed to accept connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }

        tracing::info!(
            "Shutting down, waiting for {} connections",
            handlers.len()
        );
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while handlers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::warn!("{} connections did not finish in time", handlers.len());
            handlers.shutdown().await;
        }

        if let Err(e) = router_task.await {
            tracing::warn!("Media router task failed: {}", e);
        }
        tracing::info!("Server stopped");
        Ok(())
    }
}
