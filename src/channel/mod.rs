//! Command channel server.
//!
//! The server:
//! - Listens on two TLS ports, one per protocol generation
//! - Parses framed boxes and routes them to registered handlers
//! - Audits every request and response
//! - Answers handler errors with failure boxes, closing only on malformed frames

pub mod audit;
pub mod commands;
pub mod connection;
pub mod dispatch;
pub mod server;
pub mod tls;

pub use audit::TracingSink;
pub use server::ChannelServer;

use crate::config::ConfigError;
use std::path::PathBuf;
use thiserror::Error;

/// Server setup and listener failures.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot read {}: {source}", .path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {}", .0.display())]
    NoCertificate(PathBuf),

    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid bind address: {0}")]
    InvalidAddress(String),

    #[error("cannot listen on {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
