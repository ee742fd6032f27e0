//! A resilient REST client: retries with backoff, pluggable authentication
//! with single-flight credential refresh, and an LRU response cache with
//! conditional revalidation.

pub mod auth;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod http;
pub mod retry;

pub use client::{Client, ClientBuilder, RequestOptions};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
