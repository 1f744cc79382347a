//! Outcomes of an admission check.

use crate::error::StoreError;

/// Why a request was admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The path is on the allowlist
    AllowedPath,
    /// The request carried a trusted bearer token
    TrustedToken,
    /// The client is within its window budget
    WithinLimit { count: u64, limit: u64 },
}

/// Why a request was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The client exhausted its window budget
    RateLimitExceeded { count: u64, limit: u64 },
    /// The counter store failed and the failure policy is closed
    StoreUnavailable(StoreError),
}

impl DenyReason {
    /// Plain-text body returned to the client.
    pub fn message(&self) -> &'static str {
        match self {
            DenyReason::RateLimitExceeded { .. } => "rate limit exceeded",
            DenyReason::StoreUnavailable(_) => "rate limiter unavailable",
        }
    }
}

impl std::fmt::Display for DenyReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

/// The admission decision for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow(Admission),
    Deny(DenyReason),
    /// The counter store failed and the request is admitted anyway. The
    /// cause must be logged by whoever acts on the decision.
    AllowOnError(StoreError),
}

impl Decision {
    /// Whether the pipeline should continue to the next handler.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Decision::Deny(_))
    }

    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Decision::Allow(_) => "allow",
            Decision::Deny(_) => "deny",
            Decision::AllowOnError(_) => "allow_on_error",
        }
    }
}
