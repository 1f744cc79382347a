//! HTTP server exposing the admission filter as a forward-auth endpoint.
//!
//! A proxy in front of the protected service sends each request (or a
//! subrequest carrying its headers) here; `200` means continue, `429` means
//! reject. `/healthz` is answered without an admission check.

use std::future::Future;
use std::net::SocketAddr;

use axum::{http::StatusCode, middleware, routing::get, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission_middleware, AdmissionState};
use crate::error::{BouncerError, Result};

/// HTTP server for the admission filter.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AdmissionState,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, state: AdmissionState) -> Self {
        Self { addr, state }
    }

    /// Build the router: every path except `/healthz` goes through the
    /// admission middleware.
    pub fn router(&self) -> Router {
        Router::new()
            .fallback(admitted)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                admission_middleware,
            ))
            .route("/healthz", get(health))
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let router = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            e
        })?;

        info!(addr = %self.addr, "Starting HTTP server for admission checks");

        axum::serve(listener, router)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                BouncerError::Io(e)
            })
    }
}

async fn admitted() -> StatusCode {
    StatusCode::OK
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
