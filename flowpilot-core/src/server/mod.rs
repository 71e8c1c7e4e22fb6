//! HTTP server hosting the flowpilot API

pub mod api;

use crate::runtime::FlowRuntime;
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;

pub use api::create_api_routes;

/// Serves the HTTP API for a runtime until Ctrl-C
pub struct FlowServer {
    runtime: Arc<FlowRuntime>,
    host: String,
    port: u16,
}

impl FlowServer {
    pub fn new(runtime: Arc<FlowRuntime>) -> Self {
        let host = runtime.config().server_host.clone();
        let port = runtime.config().server_port;
        Self {
            runtime,
            host,
            port,
        }
    }

    pub fn with_address(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = host.into();
        self.port = port;
        self
    }

    pub fn address(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse::<SocketAddr>()
            .with_context(|| format!("Invalid server address {}", addr))
    }

    /// Bind, serve, and shut the runtime down on Ctrl-C
    pub async fn start(self) -> Result<()> {
        let addr = self.address()?;
        let routes = create_api_routes(Arc::clone(&self.runtime));

        let (bound, server) = warp::serve(routes)
            .try_bind_with_graceful_shutdown(addr, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!("Failed to listen for Ctrl-C: {}", e);
                }
            })
            .with_context(|| format!("Failed to bind to {}", addr))?;

        tracing::info!("flowpilot API listening on http://{}", bound);
        server.await;

        tracing::info!("Shutting down server...");
        self.runtime.shutdown().await;
        Ok(())
    }
}
