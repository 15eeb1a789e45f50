#![forbid(unsafe_code)]

//! braid-proxy: a traffic-obfuscation proxy that braids one upstream
//! byte stream across several downstream connections as block-framed,
//! chaff-padded traffic, and reassembles it on the far side.

pub mod config;
pub mod error;
pub mod metrics;
pub mod mux;
pub mod proxy;
pub mod socks;

pub use config::{load_from_path, Config, Frontend, Mode};
pub use error::{ProxyError, Result};
pub use mux::circuit::{BlockPolicy, Circuit, UniformBlocks};
pub use mux::registry::{CircuitRef, Registry};
pub use mux::wire::{BlockHeader, Flags, HEADER_LEN, MAX_BLOCK, MIN_BLOCK};
pub use mux::ProtocolError;
pub use proxy::run;
