#![forbid(unsafe_code)]

use thiserror::Error;

use crate::mux::ProtocolError;
use crate::socks::SocksError;

/// Errors surfaced by the proxy layers.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no downstream addresses configured")]
    NoDownstreams,

    #[error("no upstream target configured")]
    NoUpstream,

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("socks handshake failed: {0}")]
    Socks(#[from] SocksError),
}

pub type Result<T> = std::result::Result<T, ProxyError>;
