//! HTTP surface of the gateway.

pub mod error;
pub mod messages;
pub mod oauth;
pub mod rate_limit;
pub mod routes;
pub mod sse;

pub use routes::create_router;
