//! HTTP surface for the broker

pub mod auth;
pub mod router;
mod server;

pub use auth::{SurfaceGuard, auth_middleware};
pub use router::create_router;
pub use server::BrokerServer;
