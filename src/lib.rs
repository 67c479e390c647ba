//! Auth Broker Library
//!
//! Authentication & authorization broker for an HTTP application with two
//! surfaces (admin and member), each fronted by its own identity provider.
//!
//! # Features
//!
//! - **Two input shapes**: reverse-proxy principal assertions and bearer JWTs
//! - **JWT verification**: per-provider JWKS cache with single-flight refresh
//! - **Provider routing**: each surface admits exactly one identity provider
//! - **Directory-backed roles**: auto-provisioning, suspension, admin from the store only
//! - **On-behalf-of exchange**: downstream tokens from a verified caller token
//! - **Audit trail**: structured events for every decision and record change

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod cli;
pub mod config;
pub mod error;
pub mod gateway;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}")))?,
    }

    Ok(())
}
