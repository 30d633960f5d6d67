use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::scheduler::{ConnId, QueryId, WorkerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum QueryState {
    New,
    Ready,
    Exec,
    Canceling,
    Exit,
    Error,
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryState::New => write!(f, "NEW"),
            QueryState::Ready => write!(f, "READY"),
            QueryState::Exec => write!(f, "EXEC"),
            QueryState::Canceling => write!(f, "CANCELING"),
            QueryState::Exit => write!(f, "EXIT"),
            QueryState::Error => write!(f, "ERROR"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Query {
    pub id: QueryId,
    pub path: String,
    /// Current priority; lower runs first. Aging lowers it toward 0.
    pub priority: u64,
    pub original_priority: u64,
    pub state: QueryState,
    /// Resume point reported by the last worker that suspended this query.
    pub pc: u32,
    pub owner: ConnId,
    /// Set iff the query is EXEC or CANCELING.
    pub worker: Option<WorkerId>,
    pub created_at: DateTime<Utc>,
}

impl Query {
    pub fn new(id: QueryId, path: String, priority: u64, owner: ConnId) -> Self {
        Self {
            id,
            path,
            priority,
            original_priority: priority,
            state: QueryState::New,
            pc: 0,
            owner,
            worker: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, QueryState::Exit | QueryState::Error)
    }
}
