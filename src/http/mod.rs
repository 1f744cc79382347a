//! HTTP boundary for the admission engine.

mod middleware;
mod server;

pub use middleware::{admission_middleware, deny_response, AdmissionState, PathSource};
pub use server::HttpServer;
