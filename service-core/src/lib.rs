//! service-core: Shared infrastructure for the subscription services.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod utils;
