//! Middle Proxy RPC Transport
//!
//! Routes client sessions through Telegram middle-ends, which reach every
//! DC (CDN included) and account traffic to the proxy's ad tag.

pub mod codec;
pub mod handshake;
pub mod pool;
mod reader;
pub mod registry;
pub mod secret;

pub use pool::{IpFamily, MePool};
pub use registry::MeResponse;
pub use secret::fetch_proxy_secret;
