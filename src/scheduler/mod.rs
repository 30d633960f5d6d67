pub mod aging;
pub mod query;
pub mod registry;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;

pub use aging::spawn_aging_task;
pub use query::{Query, QueryState};
pub use registry::Registry;
pub use service::Scheduler;
pub use state::{Outbound, SchedulerSnapshot, SchedulerState, WorkerSnapshot};
pub use store::QueryStore;
pub use worker::{QueryControlRecord, WorkerId, WorkerRecord, WorkerStatus};

/// Process-unique query identifier. Starts at 1; 0 never names a live query.
pub type QueryId = u64;

/// Identifies one accepted connection for its whole lifetime.
pub type ConnId = u64;
