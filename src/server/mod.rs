//! Socket side of the master: accept loop, per-connection handlers, and the
//! peer handles the scheduler sends through.

pub mod connection;
pub mod listener;
pub mod peer;

pub use connection::handle_connection;
pub use listener::MasterServer;
pub use peer::{spawn_writer, OutboundFrame, PeerHandle, PendingSend, PEER_QUEUE_DEPTH};
