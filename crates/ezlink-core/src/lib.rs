//! ezlink-core: wire grammar, chunk codec and configuration.
//! The other ezlink crates depend on this one.

pub mod codec;
pub mod config;
pub mod wire;

pub use codec::CodecError;
pub use config::{ConfigError, EzlinkConfig};
pub use wire::{ChunkAck, Command, InboundKind, WireError};
