use std::fmt;

use serde::Serialize;

use crate::scheduler::{ConnId, QueryId};
use crate::server::PeerHandle;

/// Stable worker identity, derived from the number a worker announces in its
/// handshake. A reconnect with the same number maps to the same identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn from_number(n: i32) -> Self {
        WorkerId(format!("WORKER_{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WorkerStatus {
    Idle,
    Busy,
    /// A suspend or cancel request is outstanding.
    Preempting,
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerStatus::Idle => write!(f, "IDLE"),
            WorkerStatus::Busy => write!(f, "BUSY"),
            WorkerStatus::Preempting => write!(f, "PREEMPTING"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerRecord {
    pub id: WorkerId,
    pub peer: PeerHandle,
    pub status: WorkerStatus,
    pub current_query: Option<QueryId>,
}

impl WorkerRecord {
    pub fn new(id: WorkerId, peer: PeerHandle) -> Self {
        Self {
            id,
            peer,
            status: WorkerStatus::Idle,
            current_query: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.peer.conn_id()
    }

    /// Idle and still reachable.
    pub fn is_available(&self) -> bool {
        self.status == WorkerStatus::Idle && !self.peer.is_closed()
    }
}

/// A query control session. Each session owns at most one live query.
#[derive(Debug, Clone)]
pub struct QueryControlRecord {
    pub peer: PeerHandle,
    pub query_id: QueryId,
}
