use std::collections::HashMap;

use crate::scheduler::worker::{QueryControlRecord, WorkerRecord, WorkerStatus};
use crate::scheduler::{ConnId, WorkerId};

/// Connected workers and query controls.
///
/// Workers are kept in registration order, which is the order the idle search
/// and the victim search walk them in.
#[derive(Debug, Default)]
pub struct Registry {
    workers: Vec<WorkerRecord>,
    query_controls: HashMap<ConnId, QueryControlRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker. The caller must have evicted any record with the
    /// same identity first.
    pub fn insert_worker(&mut self, record: WorkerRecord) {
        debug_assert!(self.worker(&record.id).is_none());
        self.workers.push(record);
    }

    pub fn worker(&self, id: &WorkerId) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| &w.id == id)
    }

    pub fn worker_mut(&mut self, id: &WorkerId) -> Option<&mut WorkerRecord> {
        self.workers.iter_mut().find(|w| &w.id == id)
    }

    pub fn worker_by_conn(&self, conn_id: ConnId) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.conn_id() == conn_id)
    }

    /// First idle worker whose connection is still open.
    pub fn idle_worker(&self) -> Option<&WorkerRecord> {
        self.workers.iter().find(|w| w.is_available())
    }

    pub fn idle_count(&self) -> usize {
        self.workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Idle)
            .count()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.workers.iter()
    }

    pub fn remove_worker(&mut self, id: &WorkerId) -> Option<WorkerRecord> {
        let idx = self.workers.iter().position(|w| &w.id == id)?;
        Some(self.workers.remove(idx))
    }

    pub fn insert_query_control(&mut self, conn_id: ConnId, record: QueryControlRecord) {
        self.query_controls.insert(conn_id, record);
    }

    pub fn query_control(&self, conn_id: ConnId) -> Option<&QueryControlRecord> {
        self.query_controls.get(&conn_id)
    }

    pub fn remove_query_control(&mut self, conn_id: ConnId) -> Option<QueryControlRecord> {
        self.query_controls.remove(&conn_id)
    }

    pub fn query_control_count(&self) -> usize {
        self.query_controls.len()
    }
}
