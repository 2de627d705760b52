//! HTTP server for the Prometheus metrics endpoint.

use std::fs::File;
use std::io::BufReader;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::middleware;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::auth::{BasicAuth, require_basic_auth};
use crate::collector::{CollectError, SharedCollector};
use crate::config::TlsConfig;
use crate::mapping;

/// Application state shared across handlers.
#[derive(Clone)]
struct AppState {
    collector: SharedCollector,
    namespace: String,
    metrics_path: String,
}

/// Create the HTTP router; every route requires credentials when `auth` is set.
fn create_router(
    collector: SharedCollector,
    metrics_path: &str,
    namespace: &str,
    auth: Option<BasicAuth>,
) -> Router {
    let state = AppState {
        collector,
        namespace: namespace.to_string(),
        metrics_path: metrics_path.to_string(),
    };

    let router = Router::new()
        .route("/", get(index_handler))
        .route(metrics_path, get(metrics_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    match auth {
        Some(auth) => router.layer(middleware::from_fn_with_state(auth, require_basic_auth)),
        None => router,
    }
}

/// Handler for the metrics endpoint; runs one collection cycle per request.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let collector = state.collector.clone();
    let collection = match tokio::task::spawn_blocking(move || collector.collect()).await {
        Ok(Ok(collection)) => collection,
        Ok(Err(e @ CollectError::Busy(_))) => {
            warn!(error = %e, "Rejecting scrape");
            return (StatusCode::SERVICE_UNAVAILABLE, format!("{}\n", e)).into_response();
        }
        Err(e) => {
            error!(error = %e, "Collection task failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                "collection failed\n".to_string(),
            )
                .into_response();
        }
    };

    match mapping::render(&collection, &state.namespace) {
        Ok(body) => (StatusCode::OK, [(CONTENT_TYPE, mapping::CONTENT_TYPE)], body).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics\n".to_string(),
            )
                .into_response()
        }
    }
}

/// Handler for the landing page.
async fn index_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>NVIDIA GPU Exporter</title></head>\n\
         <body>\n\
         <h1>NVIDIA GPU Exporter</h1>\n\
         <p><a href='{}'>Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.metrics_path
    ))
}

/// Handler for the /health endpoint.
async fn health_handler() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Build the rustls server configuration from PEM files.
fn load_tls_config(tls: &TlsConfig) -> anyhow::Result<RustlsConfig> {
    let cert_file = File::open(&tls.cert_file)
        .with_context(|| format!("Failed to open TLS certificate {}", tls.cert_file.display()))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to read TLS certificate {}", tls.cert_file.display()))?;
    if certs.is_empty() {
        anyhow::bail!("No certificate found in {}", tls.cert_file.display());
    }

    let key_file = File::open(&tls.key_file)
        .with_context(|| format!("Failed to open TLS key {}", tls.key_file.display()))?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .with_context(|| format!("Failed to read TLS key {}", tls.key_file.display()))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {}", tls.key_file.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Invalid TLS certificate or key")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(RustlsConfig::from_config(Arc::new(config)))
}

/// Resolve once the shutdown flag is raised or its sender is gone.
async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            break;
        }
        if shutdown.changed().await.is_err() {
            break;
        }
    }
    info!("HTTP server shutting down");
}

/// HTTP server configuration.
pub struct HttpServer {
    collector: SharedCollector,
    listen_addr: SocketAddr,
    metrics_path: String,
    namespace: String,
    tls: Option<TlsConfig>,
    auth: Option<BasicAuth>,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(
        collector: SharedCollector,
        listen_addr: SocketAddr,
        metrics_path: String,
        namespace: String,
    ) -> Self {
        Self {
            collector,
            listen_addr,
            metrics_path,
            namespace,
            tls: None,
            auth: None,
        }
    }

    /// Serve over HTTPS.
    pub fn with_tls(mut self, tls: Option<TlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    /// Require basic authentication on every route.
    pub fn with_basic_auth(mut self, auth: Option<BasicAuth>) -> Self {
        self.auth = auth;
        self
    }

    /// Run the HTTP server until the shutdown signal is received.
    ///
    /// An unspecified IPv6 address falls back to IPv4 on hosts without IPv6.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = match TcpListener::bind(self.listen_addr).await {
            Ok(listener) => listener,
            Err(e)
                if self.listen_addr.ip() == IpAddr::V6(Ipv6Addr::UNSPECIFIED)
                    && e.kind() != std::io::ErrorKind::AddrInUse =>
            {
                let fallback = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.listen_addr.port()));
                debug!(error = %e, addr = %fallback, "IPv6 unavailable, listening on IPv4");
                TcpListener::bind(fallback)
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", fallback, e))?
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "Failed to bind to {}: {}",
                    self.listen_addr,
                    e
                ));
            }
        };

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener until the shutdown signal is received.
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let tls_config = self.tls.as_ref().map(load_tls_config).transpose()?;
        let router = create_router(
            self.collector,
            &self.metrics_path,
            &self.namespace,
            self.auth,
        );
        let addr = listener.local_addr()?;

        info!(
            addr = %addr,
            path = %self.metrics_path,
            tls = tls_config.is_some(),
            "HTTP server listening"
        );

        match tls_config {
            Some(tls_config) => {
                let handle = axum_server::Handle::new();
                let shutdown_handle = handle.clone();
                tokio::spawn(async move {
                    wait_for_shutdown(shutdown).await;
                    shutdown_handle.graceful_shutdown(Some(Duration::from_secs(5)));
                });

                axum_server::from_tcp_rustls(listener.into_std()?, tls_config)
                    .handle(handle)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| anyhow::anyhow!("HTTPS server error: {}", e))?;
            }
            None => {
                axum::serve(listener, router)
                    .with_graceful_shutdown(wait_for_shutdown(shutdown))
                    .await
                    .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;
            }
        }

        info!("HTTP server stopped");
        Ok(())
    }
}
