//! Authenticated Azure Resource Manager REST plumbing.
//!
//! This crate provides:
//! - `RestError` and the transient-error classifier used by retry
//! - `with_retry` with capped exponential backoff and `retry-after` honoring
//! - `AzureClient`, typed JSON wrappers over bearer-authenticated HTTPS
//! - `InstanceMetadata`, the IMDS client (image reference, scheduled events)

pub mod client;
pub mod error;
pub mod metadata;
pub mod retry;

pub use client::{AzureClient, SessionProvider, StaticTokenSession, MANAGEMENT_ENDPOINT};
pub use error::{RestError, RestResult};
pub use metadata::{InstanceMetadata, IMDS_ENDPOINT};
pub use retry::{with_retry, RetryPolicy};
