//! Broker server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

use super::router::create_router;
use crate::broker::Broker;
use crate::config::Config;
use crate::{Error, Result};

/// HTTP front end for the [`Broker`]
pub struct BrokerServer {
    /// Configuration
    config: Config,
    /// Shared broker
    broker: Arc<Broker>,
}

impl BrokerServer {
    /// Create a server around an assembled broker
    pub fn new(config: Config, broker: Broker) -> Self {
        Self {
            config,
            broker: Arc::new(broker),
        }
    }

    /// Build the broker from configuration, then the server
    pub async fn from_config(config: Config) -> Result<Self> {
        let broker = Broker::from_config(&config).await?;
        Ok(Self::new(config, broker))
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let app = create_router(Arc::clone(&self.broker), self.config.server.request_timeout);

        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("Auth broker v{}", env!("CARGO_PKG_VERSION"));
        info!("Listening on http://{addr}");
        info!(
            "  admin surface:  /api/admin/*  (issuer {})",
            display_issuer(&self.config.providers.admin.issuer)
        );
        info!(
            "  member surface: /api/*        (issuer {})",
            display_issuer(&self.config.providers.member.issuer)
        );
        if self.config.broker.trust_proxy_assertion {
            info!("  proxy assertions accepted via {}", self.config.broker.assertion_header);
        }
        if !self.config.broker.accept_bearer_tokens {
            warn!("Bearer tokens disabled - only proxy assertions are accepted");
        }
        if self.broker.delegation_enabled() {
            info!("  on-behalf-of exchange enabled");
        }
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        info!("Auth broker stopped");
        Ok(())
    }
}

fn display_issuer(issuer: &str) -> &str {
    if issuer.is_empty() { "<none>" } else { issuer }
}

/// Shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
