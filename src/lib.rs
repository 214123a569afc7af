pub mod config;
pub mod context;
pub mod crypto;
pub mod external;
pub mod logging;
pub mod protocol;
pub mod server;

pub use config::ServerConfig;
pub use context::Context;
pub use server::TcpServer;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnteaterError {
    #[error("Server already exists: {0}")]
    DuplicateServer(String),

    #[error("Address resolution failed: {0}")]
    Resolve(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Probe failed: {0}")]
    Probe(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AnteaterError>;
