//! Tool HTTP server

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, http::StatusCode};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tower_http::{catch_panic::CatchPanicLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

use crate::config::Config;
use crate::lti::{LtiService, handler::lti_routes, session::spawn_sweeper};
use crate::{Error, Result};

/// Build the full router around a service.
pub fn create_router(service: Arc<LtiService>, config: &Config) -> Router {
    lti_routes(service)
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.server.request_timeout,
        ))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// LTI tool server
pub struct ToolServer {
    config: Config,
    service: Arc<LtiService>,
}

impl ToolServer {
    /// Create a server; loads or generates the tool key.
    pub fn new(config: Config) -> Result<Self> {
        let service = Arc::new(LtiService::from_config(&config)?);
        Ok(Self { config, service })
    }

    /// Serve until Ctrl-C or SIGTERM.
    pub async fn run(self) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.port,
        );

        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = spawn_sweeper(
            Arc::clone(&self.service.sessions),
            self.config.launch.sweep_interval,
            shutdown_tx.subscribe(),
        );

        let app = create_router(Arc::clone(&self.service), &self.config);
        let listener = TcpListener::bind(addr).await?;

        info!("============================================================");
        info!("LTI BRIDGE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(host = %self.config.server.host, port = %self.config.server.port, "Listening");
        info!(platforms = self.service.registry.len(), kid = %self.service.keys.kid(), "Platforms registered");
        info!("  JWKS:          /lti/jwks");
        info!("  OIDC login:    /lti/oidc/login");
        info!("  Launch:        /lti/launch");
        info!("  Deep linking:  /lti/deep-linking/response");
        info!("============================================================");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(shutdown_tx))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?;

        let _ = sweeper.await;
        Ok(())
    }
}

/// Wait for Ctrl-C (or SIGTERM) and broadcast shutdown.
async fn shutdown_signal(shutdown_tx: broadcast::Sender<()>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
    let _ = shutdown_tx.send(());
}
