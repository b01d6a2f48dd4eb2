//! Stream wrappers

pub mod buffer_pool;
pub mod crypto_stream;
pub mod frame;

pub use buffer_pool::{BufferPool, PooledBuffer};
pub use crypto_stream::{CryptoReader, CryptoWriter};
pub use frame::{AckFlags, FramedReader, FramedWriter};
