//! Request descriptor and client identifier derivation.

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;

use crate::config::ClientIpConfig;

/// The identity a rate limit counter is kept for.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier from request headers.
    ///
    /// The trusted-proxy header wins over the forwarded-for header; when
    /// neither carries a value the configured fallback is used. Only the
    /// first hop of a forwarded-for list is kept.
    ///
    /// A header that is present but blank counts as absent, so an empty
    /// trusted-proxy header falls through to forwarded-for instead of
    /// keying every such request under the empty identifier.
    pub fn from_headers(headers: &HeaderMap, config: &ClientIpConfig) -> Self {
        let lookup = |name: &str| {
            headers
                .get(name)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.split(',').next())
                .map(str::trim)
                .filter(|value| !value.is_empty())
        };

        let id = lookup(&config.trusted_header)
            .or_else(|| lookup(&config.forwarded_header))
            .unwrap_or(&config.fallback);

        Self(id.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Build the counter store key for this client.
    pub fn counter_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the admission engine needs to know about one request.
#[derive(Clone)]
pub struct RequestDescriptor {
    /// Request path, without query string
    pub path: String,
    /// Raw Authorization header value
    pub authorization: Option<String>,
    /// Identity the rate limit applies to
    pub client_id: ClientId,
}

impl RequestDescriptor {
    pub fn new(path: impl Into<String>, authorization: Option<String>, client_id: ClientId) -> Self {
        Self {
            path: path.into(),
            authorization,
            client_id,
        }
    }

    /// Build a descriptor from a request path and its headers.
    pub fn from_headers(path: &str, headers: &HeaderMap, client_ip: &ClientIpConfig) -> Self {
        let authorization = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        Self {
            path: path.to_string(),
            authorization,
            client_id: ClientId::from_headers(headers, client_ip),
        }
    }
}

impl std::fmt::Debug for RequestDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestDescriptor")
            .field("path", &self.path)
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "[REDACTED]"),
            )
            .field("client_id", &self.client_id)
            .finish()
    }
}
