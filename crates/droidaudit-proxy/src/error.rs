use std::net::SocketAddr;

use droidaudit_core::AuditError;
use thiserror::Error;

pub type ProxyResult<T> = Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("recorder runtime error: {0}")]
    Runtime(String),

    #[error("{host}:{port} is already registered in-process")]
    AlreadyRegistered { host: String, port: u16 },

    #[error("http transport to {addr} failed: {source}")]
    Http {
        addr: SocketAddr,
        #[source]
        source: reqwest::Error,
    },

    #[error("invalid proxy address {0}")]
    InvalidAddress(String),

    #[error(transparent)]
    Audit(#[from] AuditError),
}
