//! Calypso signaling relay.
//!
//! Clients connect through a [`transport`] (a direct WebSocket or a managed
//! push gateway), are tracked in the [`registry`], and exchange JSON envelopes
//! that the [`relay`] routes by target id. The relay never inspects the
//! negotiation payloads it forwards.

pub mod cli;
pub mod config;
pub mod gateway;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socket;
pub mod store;
pub mod telemetry;
pub mod transport;

pub use config::{BroadcastPolicy, RelayConfig, TransportKind};
pub use registry::{ConnectionRegistry, RegistryError};
pub use relay::{Relay, RelayError, Routed};
pub use server::{build_relay, router, serve, serve_on, AppState};
