use std::collections::{HashMap, VecDeque};

use crate::scheduler::query::{Query, QueryState};
use crate::scheduler::{QueryId, WorkerId};

/// Live queries and the partition each one currently sits in.
///
/// A query is in at most one of `ready`, `running`, `pending_preemption` and
/// `pending_cancellation`. Queries in `New` state (ack not yet sent) are in
/// none of them.
#[derive(Debug, Default)]
pub struct QueryStore {
    queries: HashMap<QueryId, Query>,
    ready: VecDeque<QueryId>,
    running: HashMap<WorkerId, QueryId>,
    pending_preemption: HashMap<WorkerId, QueryId>,
    pending_cancellation: HashMap<WorkerId, QueryId>,
}

impl QueryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, query: Query) {
        self.queries.insert(query.id, query);
    }

    pub fn get(&self, id: QueryId) -> Option<&Query> {
        self.queries.get(&id)
    }

    pub fn get_mut(&mut self, id: QueryId) -> Option<&mut Query> {
        self.queries.get_mut(&id)
    }

    /// Drop a query from every partition and from the live set.
    pub fn remove(&mut self, id: QueryId) -> Option<Query> {
        self.ready.retain(|&q| q != id);
        self.running.retain(|_, q| *q != id);
        self.pending_preemption.retain(|_, q| *q != id);
        self.pending_cancellation.retain(|_, q| *q != id);
        self.queries.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.queries.values()
    }

    // --- ready queue ---

    /// Mark a query READY and append it to the ready queue.
    pub fn enqueue(&mut self, id: QueryId) {
        if let Some(query) = self.queries.get_mut(&id) {
            query.state = QueryState::Ready;
            query.worker = None;
            if !self.ready.contains(&id) {
                self.ready.push_back(id);
            }
        }
    }

    pub fn ready_ids(&self) -> impl Iterator<Item = QueryId> + '_ {
        self.ready.iter().copied()
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_ready(&self, id: QueryId) -> bool {
        self.ready.contains(&id)
    }

    pub fn pop_front_ready(&mut self) -> Option<QueryId> {
        self.ready.pop_front()
    }

    /// Remove and return the ready query with the lowest priority number.
    /// Ties go to the one queued first.
    pub fn pop_min_priority_ready(&mut self) -> Option<QueryId> {
        let queries = &self.queries;
        let (pos, _) = self
            .ready
            .iter()
            .enumerate()
            .filter_map(|(pos, id)| queries.get(id).map(|q| (pos, q.priority)))
            .min_by_key(|&(pos, priority)| (priority, pos))?;
        self.ready.remove(pos)
    }

    pub fn remove_ready(&mut self, id: QueryId) -> bool {
        let before = self.ready.len();
        self.ready.retain(|&q| q != id);
        before != self.ready.len()
    }

    // --- running map ---

    pub fn running_on(&self, worker: &WorkerId) -> Option<QueryId> {
        self.running.get(worker).copied()
    }

    pub fn set_running(&mut self, worker: WorkerId, id: QueryId) {
        self.running.insert(worker, id);
    }

    pub fn take_running(&mut self, worker: &WorkerId) -> Option<QueryId> {
        self.running.remove(worker)
    }

    // --- pending maps ---

    pub fn pending_preemption_on(&self, worker: &WorkerId) -> Option<QueryId> {
        self.pending_preemption.get(worker).copied()
    }

    /// Park `id` as the incoming query for `worker`, returning any query it
    /// displaced.
    pub fn park_preemption(&mut self, worker: WorkerId, id: QueryId) -> Option<QueryId> {
        self.pending_preemption.insert(worker, id)
    }

    pub fn take_pending_preemption(&mut self, worker: &WorkerId) -> Option<QueryId> {
        self.pending_preemption.remove(worker)
    }

    pub fn pending_cancellation_on(&self, worker: &WorkerId) -> Option<QueryId> {
        self.pending_cancellation.get(worker).copied()
    }

    pub fn set_pending_cancellation(&mut self, worker: WorkerId, id: QueryId) {
        self.pending_cancellation.insert(worker, id);
    }

    pub fn take_pending_cancellation(&mut self, worker: &WorkerId) -> Option<QueryId> {
        self.pending_cancellation.remove(worker)
    }

    /// Which worker, if any, has `id` parked as its incoming query.
    pub fn parked_on(&self, id: QueryId) -> Option<WorkerId> {
        self.pending_preemption
            .iter()
            .find(|(_, q)| **q == id)
            .map(|(w, _)| w.clone())
    }

    /// Number of partitions `id` currently appears in.
    pub fn partition_count(&self, id: QueryId) -> usize {
        self.ready.iter().filter(|&&q| q == id).count()
            + self.running.values().filter(|&&q| q == id).count()
            + self.pending_preemption.values().filter(|&&q| q == id).count()
            + self.pending_cancellation.values().filter(|&&q| q == id).count()
    }

    pub(crate) fn running_entries(&self) -> impl Iterator<Item = (&WorkerId, &QueryId)> {
        self.running.iter()
    }

    pub(crate) fn pending_preemption_entries(&self) -> impl Iterator<Item = (&WorkerId, &QueryId)> {
        self.pending_preemption.iter()
    }

    pub(crate) fn pending_cancellation_entries(
        &self,
    ) -> impl Iterator<Item = (&WorkerId, &QueryId)> {
        self.pending_cancellation.iter()
    }
}
