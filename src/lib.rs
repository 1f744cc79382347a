//! Bouncer - Request Admission Filter
//!
//! This crate decides, for every inbound request and before any application
//! logic runs, whether to admit or reject it. Requests for allowlisted paths
//! and requests bearing a trusted token bypass all checks; everything else
//! is subject to a fixed-window rate limit per client, counted in a shared
//! store (Redis) so that every instance enforces the same budget.

pub mod admission;
pub mod config;
pub mod error;
pub mod http;
pub mod store;
