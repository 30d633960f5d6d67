use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::ProtocolError;
use crate::scheduler::QueryId;

#[derive(Error, Debug)]
pub enum MasterError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Peer connection {0} is closed")]
    PeerClosed(u64),

    #[error("Invalid priority {0}, must be >= 0")]
    InvalidPriority(i32),

    #[error("Connection {0} already owns query {1}")]
    SessionBusy(u64, QueryId),

    #[error("Handshake rejected: expected HANDSHAKE_OK, got opcode {0}")]
    HandshakeRejected(u32),

    #[error("Query file not found: {0}")]
    QueryFileNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MasterError>;
