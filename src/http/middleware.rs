//! Admission middleware for axum routers.
//!
//! Maps an admission [`Decision`] onto the request pipeline: admitted
//! requests continue to the next handler, denied ones are answered here with
//! a plain-text status response.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, warn};

use crate::admission::{AdmissionEngine, Decision, DenyReason, RequestDescriptor};

/// Where the checked path is read from.
#[derive(Debug, Clone)]
pub enum PathSource {
    /// The path of the request being handled
    Uri,
    /// A header set by a proxy that carries the original request URI
    Header(HeaderName),
}

/// State handed to [`admission_middleware`].
#[derive(Debug, Clone)]
pub struct AdmissionState {
    engine: Arc<AdmissionEngine>,
    path_source: PathSource,
}

impl AdmissionState {
    pub fn new(engine: Arc<AdmissionEngine>) -> Self {
        Self {
            engine,
            path_source: PathSource::Uri,
        }
    }

    /// Read the path from `header` instead of the request URI, as needed
    /// when answering forward-auth subrequests.
    pub fn with_forwarded_uri_header(mut self, header: HeaderName) -> Self {
        self.path_source = PathSource::Header(header);
        self
    }

    pub fn engine(&self) -> &Arc<AdmissionEngine> {
        &self.engine
    }

    fn request_path(&self, req: &Request<Body>) -> String {
        if let PathSource::Header(ref name) = self.path_source {
            let forwarded = req
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|uri| uri.split(['?', '#']).next())
                .filter(|path| !path.is_empty());
            if let Some(path) = forwarded {
                return path.to_string();
            }
        }
        req.uri().path().to_string()
    }
}

/// Run the admission check for one request.
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let path = state.request_path(&req);
    let descriptor = RequestDescriptor::from_headers(&path, req.headers(), state.engine.client_ip());

    match state.engine.decide(&descriptor).await {
        Decision::Allow(_) => next.run(req).await,
        Decision::AllowOnError(cause) => {
            warn!(
                error = %cause,
                path = %descriptor.path,
                client = %descriptor.client_id,
                "Counter store unavailable, admitting request"
            );
            next.run(req).await
        }
        Decision::Deny(reason) => {
            debug!(
                path = %descriptor.path,
                client = %descriptor.client_id,
                reason = %reason,
                "Request rejected"
            );
            deny_response(&reason)
        }
    }
}

/// Response sent for a denied request.
pub fn deny_response(reason: &DenyReason) -> Response {
    let status = match reason {
        DenyReason::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
        DenyReason::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, reason.message()).into_response()
}
