//! MTProto transport definitions

pub mod constants;
pub mod obfuscation;
pub mod rpc;
