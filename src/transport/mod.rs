//! Transport layer: sockets, DC dialing, middle-end RPC

pub mod middle_proxy;
pub mod socket;
pub mod upstream;

pub use socket::{bind_listener, configure_client_socket, ListenOptions};
pub use upstream::UpstreamManager;
