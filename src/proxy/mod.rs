//! Client-facing proxy: accept loop, handshake, relay modes

pub mod client;
pub mod context;
pub mod direct_relay;
pub mod handshake;
pub mod listener;
pub mod middle_relay;
pub mod relay;

pub use context::ProxyContext;
pub use listener::run_listener;
