//! HTTP and WebSocket gateway for the talk pipeline.
//!
//! Turn-based talk is plain JSON over HTTP (`/talk`); streaming talk runs
//! over one WebSocket per client (`/ws`), driven by the voice orchestrator.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod routes;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
