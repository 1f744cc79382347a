//! Admission decisions: allowlist, trusted tokens and rate limiting.

mod decision;
mod engine;
mod limiter;
mod request;
mod tokens;

pub use decision::{Admission, Decision, DenyReason};
pub use engine::AdmissionEngine;
pub use limiter::{FixedWindowLimiter, WindowCount};
pub use request::{ClientId, RequestDescriptor};
pub use tokens::{bearer_token, TrustedTokens};
