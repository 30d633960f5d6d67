//! Lock-guarded scheduler state.
//!
//! Every method takes `&mut self` and is only reachable through the guard
//! held by [`Scheduler`](crate::scheduler::Scheduler), so code in here can
//! compose registry and store operations freely without re-locking. Methods
//! never touch the network: they return the [`Outbound`] messages the caller
//! must send once the lock is released.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::SchedulingAlgorithm;
use crate::error::MasterError;
use crate::protocol::Message;
use crate::scheduler::query::{Query, QueryState};
use crate::scheduler::registry::Registry;
use crate::scheduler::store::QueryStore;
use crate::scheduler::worker::{QueryControlRecord, WorkerRecord, WorkerStatus};
use crate::scheduler::{ConnId, QueryId, WorkerId};
use crate::server::PeerHandle;

/// A message the scheduler decided to send, plus enough identity to roll the
/// decision back if the send fails.
#[derive(Debug, Clone)]
pub enum Outbound {
    Execute {
        worker: WorkerId,
        peer: PeerHandle,
        query_id: QueryId,
        path: String,
        pc: u32,
        priority: u64,
    },
    Preempt {
        worker: WorkerId,
        peer: PeerHandle,
        query_id: QueryId,
        incoming: QueryId,
    },
    Cancel {
        worker: WorkerId,
        peer: PeerHandle,
        query_id: QueryId,
    },
    /// Best-effort message to a query control.
    Notify {
        peer: PeerHandle,
        query_id: QueryId,
        message: Message,
    },
}

impl Outbound {
    pub fn message(&self) -> Message {
        match self {
            Outbound::Execute {
                query_id, path, pc, ..
            } => Message::ExecuteQuery {
                query_id: *query_id,
                path: path.clone(),
                pc: *pc,
            },
            Outbound::Preempt { query_id, .. } => Message::PreemptQuery {
                query_id: *query_id,
            },
            Outbound::Cancel { query_id, .. } => Message::CancelQuery {
                query_id: *query_id,
            },
            Outbound::Notify { message, .. } => message.clone(),
        }
    }

    pub fn peer(&self) -> &PeerHandle {
        match self {
            Outbound::Execute { peer, .. }
            | Outbound::Preempt { peer, .. }
            | Outbound::Cancel { peer, .. }
            | Outbound::Notify { peer, .. } => peer,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub id: WorkerId,
    pub status: WorkerStatus,
    pub current_query: Option<QueryId>,
}

/// Point-in-time view of the scheduler, for logs and tests.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerSnapshot {
    pub algorithm: String,
    pub live_queries: usize,
    pub ready: Vec<QueryId>,
    /// Creation time of the longest-waiting ready query.
    pub oldest_ready_since: Option<DateTime<Utc>>,
    pub query_controls: usize,
    pub idle_workers: usize,
    pub workers: Vec<WorkerSnapshot>,
}

impl SchedulerSnapshot {
    pub fn worker(&self, id: &str) -> Option<&WorkerSnapshot> {
        self.workers.iter().find(|w| w.id.as_str() == id)
    }
}

#[derive(Debug)]
pub struct SchedulerState {
    algorithm: SchedulingAlgorithm,
    registry: Registry,
    store: QueryStore,
    next_query_id: QueryId,
}

impl SchedulerState {
    pub fn new(algorithm: SchedulingAlgorithm) -> Self {
        Self {
            algorithm,
            registry: Registry::new(),
            store: QueryStore::new(),
            next_query_id: 1,
        }
    }

    pub fn algorithm(&self) -> SchedulingAlgorithm {
        self.algorithm
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn store(&self) -> &QueryStore {
        &self.store
    }

    pub fn query(&self, id: QueryId) -> Option<&Query> {
        self.store.get(id)
    }

    pub fn worker_status(&self, id: &WorkerId) -> Option<WorkerStatus> {
        self.registry.worker(id).map(|w| w.status)
    }

    pub fn ready_queue(&self) -> Vec<QueryId> {
        self.store.ready_ids().collect()
    }

    // =========================================================================
    // Query controls
    // =========================================================================

    /// Create the query owned by the session behind `peer`.
    ///
    /// Under FIFO the requested priority is ignored and the query id is used
    /// instead. Under PRIORITY a negative value is rejected.
    pub fn create_query(
        &mut self,
        peer: PeerHandle,
        path: String,
        priority: i32,
    ) -> Result<QueryId, MasterError> {
        let conn_id = peer.conn_id();
        if let Some(existing) = self.registry.query_control(conn_id) {
            return Err(MasterError::SessionBusy(conn_id, existing.query_id));
        }
        let requested = match self.algorithm {
            SchedulingAlgorithm::Priority => {
                Some(u64::try_from(priority).map_err(|_| MasterError::InvalidPriority(priority))?)
            }
            SchedulingAlgorithm::Fifo => None,
        };

        let id = self.next_query_id;
        self.next_query_id += 1;
        let priority = requested.unwrap_or(id);

        self.store.insert(Query::new(id, path.clone(), priority, conn_id));
        self.registry
            .insert_query_control(conn_id, QueryControlRecord { peer, query_id: id });

        tracing::info!(
            query_id = id,
            conn_id,
            path = %path,
            priority,
            workers = self.registry.worker_count(),
            "Query control connected, query created"
        );
        Ok(id)
    }

    /// Forget a query whose acknowledgement could not be delivered.
    pub fn discard_query(&mut self, conn_id: ConnId) -> Option<QueryId> {
        let record = self.registry.remove_query_control(conn_id)?;
        self.store.remove(record.query_id);
        tracing::debug!(query_id = record.query_id, conn_id, "Query discarded");
        Some(record.query_id)
    }

    pub fn query_control_disconnected(&mut self, conn_id: ConnId) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(record) = self.registry.remove_query_control(conn_id) else {
            tracing::debug!(conn_id, "Query control disconnected with no live query");
            return out;
        };
        let id = record.query_id;
        let Some(query) = self.store.get(id) else {
            return out;
        };
        let (state, worker, priority) = (query.state, query.worker.clone(), query.priority);

        tracing::info!(
            query_id = id,
            conn_id,
            priority,
            workers = self.registry.worker_count(),
            "Query control disconnected, finalizing its query"
        );

        if self.store.remove_ready(id) {
            self.finalize(id, QueryState::Exit, &mut out);
        } else if let Some(parked_on) = self.store.parked_on(id) {
            // The worker keeps its outstanding suspend request; the ack will
            // find nothing parked and free the worker.
            self.store.take_pending_preemption(&parked_on);
            self.finalize(id, QueryState::Exit, &mut out);
        } else if let Some(worker) = worker {
            match (state, self.worker_status(&worker)) {
                (QueryState::Exec, Some(WorkerStatus::Busy)) => {
                    out.extend(self.begin_cancel(&worker, id));
                }
                (QueryState::Exec, Some(WorkerStatus::Preempting)) => {
                    // One request per worker: settle on the pending suspend ack.
                    if let Some(query) = self.store.get_mut(id) {
                        query.state = QueryState::Canceling;
                    }
                    tracing::debug!(
                        query_id = id,
                        worker_id = %worker,
                        "Query canceled while its worker is preempting"
                    );
                }
                _ => {}
            }
        } else {
            self.finalize(id, QueryState::Exit, &mut out);
        }

        out.extend(self.dispatch_next());
        out
    }

    // =========================================================================
    // Assignment
    // =========================================================================

    /// Place a freshly created query: idle worker, else preemption victim
    /// (priority mode), else the ready queue.
    pub fn assign(&mut self, id: QueryId) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(query) = self.store.get(id) else {
            tracing::debug!(query_id = id, "Query vanished before assignment");
            return out;
        };
        if query.state != QueryState::New {
            return out;
        }
        let priority = query.priority;

        if let Some(worker) = self.registry.idle_worker().map(|w| w.id.clone()) {
            out.extend(self.bind(id, &worker));
            return out;
        }

        if self.algorithm.is_priority() {
            if let Some(worker) = self.find_victim(priority) {
                out.extend(self.preempt(&worker, id));
                return out;
            }
        }

        self.store.enqueue(id);
        tracing::debug!(
            query_id = id,
            priority,
            ready = self.store.ready_len(),
            idle = self.registry.idle_count(),
            workers = self.registry.worker_count(),
            "No idle worker, query queued"
        );
        out
    }

    /// Bind ready queries to idle workers until one of them runs out.
    pub fn dispatch_next(&mut self) -> Vec<Outbound> {
        let mut out = Vec::new();
        while self.store.ready_len() > 0 {
            let Some(worker) = self.registry.idle_worker().map(|w| w.id.clone()) else {
                break;
            };
            let next = match self.algorithm {
                SchedulingAlgorithm::Fifo => self.store.pop_front_ready(),
                SchedulingAlgorithm::Priority => self.store.pop_min_priority_ready(),
            };
            let Some(id) = next else {
                break;
            };
            match self.bind(id, &worker) {
                Some(effect) => out.push(effect),
                None => tracing::warn!(query_id = id, "Ready query vanished during dispatch"),
            }
        }
        out
    }

    fn bind(&mut self, id: QueryId, worker: &WorkerId) -> Option<Outbound> {
        let record = self.registry.worker_mut(worker)?;
        let query = self.store.get_mut(id)?;

        record.status = WorkerStatus::Busy;
        record.current_query = Some(id);
        query.state = QueryState::Exec;
        query.worker = Some(worker.clone());

        let effect = Outbound::Execute {
            worker: worker.clone(),
            peer: record.peer.clone(),
            query_id: id,
            path: query.path.clone(),
            pc: query.pc,
            priority: query.priority,
        };
        self.store.set_running(worker.clone(), id);
        Some(effect)
    }

    /// The busy or preempting worker running the least important query that
    /// is still less important than `priority`.
    fn find_victim(&self, priority: u64) -> Option<WorkerId> {
        let mut best: Option<(WorkerId, u64)> = None;
        for worker in self.registry.workers() {
            if worker.status == WorkerStatus::Idle {
                continue;
            }
            let Some(running) = self
                .store
                .running_on(&worker.id)
                .and_then(|q| self.store.get(q))
            else {
                continue;
            };
            if running.state != QueryState::Exec || running.priority <= priority {
                continue;
            }
            if best.as_ref().map_or(true, |(_, p)| running.priority > *p) {
                best = Some((worker.id.clone(), running.priority));
            }
        }
        best.map(|(id, _)| id)
    }

    fn preempt(&mut self, worker: &WorkerId, incoming: QueryId) -> Vec<Outbound> {
        let Some(record) = self.registry.worker(worker) else {
            self.store.enqueue(incoming);
            return Vec::new();
        };
        let (status, peer) = (record.status, record.peer.clone());
        let Some(victim) = self.store.running_on(worker) else {
            self.store.enqueue(incoming);
            return Vec::new();
        };

        match status {
            WorkerStatus::Busy => {
                self.park(worker, incoming);
                if let Some(record) = self.registry.worker_mut(worker) {
                    record.status = WorkerStatus::Preempting;
                }
                let victim_priority = self.store.get(victim).map(|q| q.priority);
                tracing::info!(
                    query_id = victim,
                    priority = ?victim_priority,
                    worker_id = %worker,
                    incoming,
                    reason = "PRIORITY",
                    "Preempting query"
                );
                vec![Outbound::Preempt {
                    worker: worker.clone(),
                    peer,
                    query_id: victim,
                    incoming,
                }]
            }
            WorkerStatus::Preempting => {
                let incoming_priority = self.store.get(incoming).map(|q| q.priority);
                match self.store.pending_preemption_on(worker) {
                    Some(parked) => {
                        let parked_priority = self.store.get(parked).map(|q| q.priority);
                        if incoming_priority < parked_priority {
                            self.park(worker, incoming);
                            self.store.enqueue(parked);
                            tracing::debug!(
                                query_id = incoming,
                                displaced = parked,
                                worker_id = %worker,
                                "Replaced query waiting on preemption"
                            );
                        } else {
                            self.store.enqueue(incoming);
                        }
                    }
                    None => self.park(worker, incoming),
                }
                Vec::new()
            }
            WorkerStatus::Idle => {
                self.store.enqueue(incoming);
                Vec::new()
            }
        }
    }

    fn park(&mut self, worker: &WorkerId, id: QueryId) {
        if let Some(query) = self.store.get_mut(id) {
            query.state = QueryState::Ready;
            query.worker = None;
        }
        self.store.park_preemption(worker.clone(), id);
    }

    fn begin_cancel(&mut self, worker: &WorkerId, id: QueryId) -> Option<Outbound> {
        let peer = self.registry.worker(worker)?.peer.clone();
        self.store.take_running(worker);
        self.store.set_pending_cancellation(worker.clone(), id);
        if let Some(query) = self.store.get_mut(id) {
            query.state = QueryState::Canceling;
        }
        if let Some(record) = self.registry.worker_mut(worker) {
            record.status = WorkerStatus::Preempting;
        }
        tracing::info!(query_id = id, worker_id = %worker, "Canceling query on worker");
        Some(Outbound::Cancel {
            worker: worker.clone(),
            peer,
            query_id: id,
        })
    }

    // =========================================================================
    // Workers
    // =========================================================================

    /// Register a worker, replacing any stale session under the same identity.
    ///
    /// Returns the messages produced by recovering the stale session and its
    /// peer handle, which the caller must close.
    pub fn register_worker(
        &mut self,
        id: WorkerId,
        peer: PeerHandle,
    ) -> (Vec<Outbound>, Option<PeerHandle>) {
        let mut out = Vec::new();
        let mut stale = None;
        if self.registry.worker(&id).is_some() {
            tracing::warn!(worker_id = %id, "Worker reconnected, evicting stale session");
            let (effects, record) = self.evict_worker(&id);
            out.extend(effects);
            stale = record.map(|r| r.peer);
        }

        self.registry.insert_worker(WorkerRecord::new(id.clone(), peer));
        tracing::info!(
            worker_id = %id,
            workers = self.registry.worker_count(),
            "Worker connected"
        );
        (out, stale)
    }

    pub fn worker_disconnected(&mut self, conn_id: ConnId) -> Vec<Outbound> {
        let Some(id) = self.registry.worker_by_conn(conn_id).map(|w| w.id.clone()) else {
            tracing::debug!(conn_id, "Disconnect from an unregistered worker session");
            return Vec::new();
        };
        let (mut out, _) = self.evict_worker(&id);
        tracing::info!(
            worker_id = %id,
            workers = self.registry.worker_count(),
            "Worker disconnected"
        );
        out.extend(self.dispatch_next());
        out
    }

    fn evict_worker(&mut self, id: &WorkerId) -> (Vec<Outbound>, Option<WorkerRecord>) {
        let mut out = Vec::new();

        if let Some(running) = self.store.take_running(id) {
            let canceling = self
                .store
                .get(running)
                .is_some_and(|q| q.state == QueryState::Canceling);
            if canceling {
                self.finalize(running, QueryState::Exit, &mut out);
            } else {
                tracing::info!(
                    query_id = running,
                    worker_id = %id,
                    reason = "DISCONNECTION",
                    "Evicting query from worker"
                );
                self.finalize(running, QueryState::Error, &mut out);
            }
        }
        if let Some(parked) = self.store.take_pending_preemption(id) {
            self.store.enqueue(parked);
            tracing::debug!(query_id = parked, worker_id = %id, "Parked query returned to ready queue");
        }
        if let Some(canceled) = self.store.take_pending_cancellation(id) {
            self.finalize(canceled, QueryState::Exit, &mut out);
        }

        (out, self.registry.remove_worker(id))
    }

    pub fn query_finished(&mut self, conn_id: ConnId, id: QueryId) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(worker) = self.registry.worker_by_conn(conn_id) else {
            tracing::warn!(conn_id, query_id = id, "Completion from an unregistered session");
            return out;
        };
        let (worker, status) = (worker.id.clone(), worker.status);

        if self.store.running_on(&worker) == Some(id) {
            self.store.take_running(&worker);
            self.finalize(id, QueryState::Exit, &mut out);
            self.set_idle(&worker);

            if status == WorkerStatus::Preempting {
                // The query finished before the suspend ack: the parked query
                // goes straight to this worker.
                if let Some(incoming) = self.store.take_pending_preemption(&worker) {
                    out.extend(self.bind(incoming, &worker));
                    return out;
                }
            }
            out.extend(self.dispatch_next());
        } else if self.store.pending_cancellation_on(&worker) == Some(id) {
            self.store.take_pending_cancellation(&worker);
            self.finalize(id, QueryState::Exit, &mut out);
            self.set_idle(&worker);
            out.extend(self.dispatch_next());
        } else {
            tracing::warn!(
                query_id = id,
                worker_id = %worker,
                "Completion for a query this worker is not running"
            );
        }
        out
    }

    pub fn preemption_ack(&mut self, conn_id: ConnId, pc: u32) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(worker) = self.registry.worker_by_conn(conn_id) else {
            tracing::warn!(conn_id, "Preemption ack from an unregistered session");
            return out;
        };
        let (worker, status) = (worker.id.clone(), worker.status);
        if status != WorkerStatus::Preempting {
            tracing::warn!(worker_id = %worker, status = %status, "Unexpected preemption ack, ignoring");
            return out;
        }
        let Some(outgoing) = self.store.take_running(&worker) else {
            tracing::warn!(worker_id = %worker, "Preemption ack while a cancellation is outstanding");
            return out;
        };

        let mut canceled = false;
        if let Some(query) = self.store.get_mut(outgoing) {
            query.pc = pc;
            canceled = query.state == QueryState::Canceling;
        }
        if canceled {
            self.finalize(outgoing, QueryState::Exit, &mut out);
        } else {
            self.store.enqueue(outgoing);
            tracing::debug!(query_id = outgoing, pc, worker_id = %worker, "Preempted query back in ready queue");
        }
        self.set_idle(&worker);

        match self.store.take_pending_preemption(&worker) {
            Some(incoming) => out.extend(self.bind(incoming, &worker)),
            None => out.extend(self.dispatch_next()),
        }
        out
    }

    pub fn cancel_ack(&mut self, conn_id: ConnId, pc: u32) -> Vec<Outbound> {
        let mut out = Vec::new();
        let Some(worker) = self.registry.worker_by_conn(conn_id) else {
            tracing::warn!(conn_id, "Cancel ack from an unregistered session");
            return out;
        };
        let (worker, status) = (worker.id.clone(), worker.status);
        if status != WorkerStatus::Preempting {
            tracing::warn!(worker_id = %worker, status = %status, "Unexpected cancel ack, ignoring");
            return out;
        }
        let Some(id) = self.store.take_pending_cancellation(&worker) else {
            tracing::warn!(worker_id = %worker, "Cancel ack while a preemption is outstanding");
            return out;
        };

        if let Some(query) = self.store.get_mut(id) {
            query.pc = pc;
        }
        self.finalize(id, QueryState::Exit, &mut out);
        self.set_idle(&worker);
        out.extend(self.dispatch_next());
        out
    }

    pub fn read_result(
        &mut self,
        conn_id: ConnId,
        id: QueryId,
        origin: String,
        content: String,
    ) -> Vec<Outbound> {
        let Some(query) = self.store.get(id) else {
            tracing::warn!(conn_id, query_id = id, "Read result for an unknown query");
            return Vec::new();
        };
        let Some(owner) = self
            .registry
            .query_control(query.owner)
            .filter(|qc| qc.query_id == id)
        else {
            tracing::debug!(query_id = id, "Owner gone, dropping read result");
            return Vec::new();
        };

        tracing::info!(query_id = id, origin = %origin, "Forwarding read result to query control");
        vec![Outbound::Notify {
            peer: owner.peer.clone(),
            query_id: id,
            message: Message::ReadResult {
                query_id: id,
                origin,
                content,
            },
        }]
    }

    fn set_idle(&mut self, worker: &WorkerId) {
        if let Some(record) = self.registry.worker_mut(worker) {
            record.status = WorkerStatus::Idle;
            record.current_query = None;
        }
    }

    /// Remove a query for good and tell its owner, if still attached.
    fn finalize(&mut self, id: QueryId, state: QueryState, out: &mut Vec<Outbound>) {
        let Some(mut query) = self.store.remove(id) else {
            return;
        };
        query.state = state;

        let owns = self
            .registry
            .query_control(query.owner)
            .is_some_and(|qc| qc.query_id == id);
        if owns {
            if let Some(owner) = self.registry.remove_query_control(query.owner) {
                let message = match state {
                    QueryState::Exit => Message::QueryFinished { query_id: id },
                    _ => Message::Error { query_id: id },
                };
                out.push(Outbound::Notify {
                    peer: owner.peer,
                    query_id: id,
                    message,
                });
            }
        }

        match state {
            QueryState::Exit => tracing::info!(
                query_id = id,
                priority = query.original_priority,
                pc = query.pc,
                elapsed_ms = (Utc::now() - query.created_at).num_milliseconds(),
                "Query finished"
            ),
            _ => tracing::warn!(query_id = id, state = %state, "Query failed"),
        }
    }

    // =========================================================================
    // Aging
    // =========================================================================

    /// Lower the priority number of every ready query by one, stopping at 0.
    /// Returns how many queries changed.
    pub fn age(&mut self) -> usize {
        if !self.algorithm.is_priority() {
            return 0;
        }
        let ready: Vec<QueryId> = self.store.ready_ids().collect();
        let mut changed = 0;
        for id in ready {
            let Some(query) = self.store.get_mut(id) else {
                continue;
            };
            if query.priority > 0 {
                let old = query.priority;
                query.priority -= 1;
                changed += 1;
                tracing::info!(query_id = id, old, new = query.priority, "Query priority changed");
            }
        }
        if changed > 0 {
            tracing::debug!(queries = changed, "Aging applied");
        }
        changed
    }

    // =========================================================================
    // Rollback after failed sends
    // =========================================================================

    /// Undo a binding whose execute request never reached the worker, then
    /// offer the query to any other idle worker. The failed peer is closed by
    /// then, so dispatch skips it.
    pub fn rollback_execute(&mut self, worker: &WorkerId, id: QueryId) -> Vec<Outbound> {
        let bound = self.store.running_on(worker) == Some(id)
            && self.worker_status(worker) == Some(WorkerStatus::Busy);
        if !bound {
            tracing::debug!(query_id = id, worker_id = %worker, "Binding already changed, nothing to roll back");
            return Vec::new();
        }
        self.store.take_running(worker);
        self.set_idle(worker);
        self.store.enqueue(id);
        tracing::warn!(query_id = id, worker_id = %worker, "Execute request failed, query requeued");
        self.dispatch_next()
    }

    /// Undo a preemption whose suspend request never reached the worker.
    pub fn rollback_preempt(&mut self, worker: &WorkerId, outgoing: QueryId) -> Vec<Outbound> {
        let preempting = self.store.running_on(worker) == Some(outgoing)
            && self.worker_status(worker) == Some(WorkerStatus::Preempting);
        if !preempting {
            return Vec::new();
        }
        if let Some(parked) = self.store.take_pending_preemption(worker) {
            self.store.enqueue(parked);
        }
        if let Some(record) = self.registry.worker_mut(worker) {
            record.status = WorkerStatus::Busy;
        }
        tracing::warn!(query_id = outgoing, worker_id = %worker, "Preempt request failed, worker left running");

        let canceled = self
            .store
            .get(outgoing)
            .is_some_and(|q| q.state == QueryState::Canceling);
        if canceled {
            return self.begin_cancel(worker, outgoing).into_iter().collect();
        }
        Vec::new()
    }

    /// Settle a cancellation whose request never reached the worker.
    pub fn rollback_cancel(&mut self, worker: &WorkerId, id: QueryId) -> Vec<Outbound> {
        if self.store.pending_cancellation_on(worker) != Some(id) {
            return Vec::new();
        }
        let mut out = Vec::new();
        self.store.take_pending_cancellation(worker);
        self.finalize(id, QueryState::Exit, &mut out);
        self.set_idle(worker);
        tracing::warn!(query_id = id, worker_id = %worker, "Cancel request failed, query finalized");
        out.extend(self.dispatch_next());
        out
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            algorithm: self.algorithm.to_string(),
            live_queries: self.store.len(),
            ready: self.ready_queue(),
            oldest_ready_since: self
                .store
                .ready_ids()
                .filter_map(|id| self.store.get(id))
                .map(|q| q.created_at)
                .min(),
            query_controls: self.registry.query_control_count(),
            idle_workers: self.registry.idle_count(),
            workers: self
                .registry
                .workers()
                .map(|w| WorkerSnapshot {
                    id: w.id.clone(),
                    status: w.status,
                    current_query: w.current_query,
                })
                .collect(),
        }
    }

    /// Check the partition and worker-status invariants.
    pub fn check_invariants(&self) -> Result<(), MasterError> {
        let violation = |msg: String| Err(MasterError::Internal(msg));

        for query in self.store.queries() {
            let count = self.store.partition_count(query.id);
            let expected = match query.state {
                QueryState::New => 0,
                _ => 1,
            };
            if count != expected {
                return violation(format!(
                    "query {} in state {} is in {} partitions",
                    query.id, query.state, count
                ));
            }
            if query.state == QueryState::Ready
                && !self.store.is_ready(query.id)
                && self.store.parked_on(query.id).is_none()
            {
                return violation(format!(
                    "query {} is READY but neither queued nor parked",
                    query.id
                ));
            }
            let should_have_worker =
                matches!(query.state, QueryState::Exec | QueryState::Canceling);
            if query.worker.is_some() != should_have_worker {
                return violation(format!(
                    "query {} in state {} has worker {:?}",
                    query.id, query.state, query.worker
                ));
            }
        }

        for (worker, id) in self.store.running_entries() {
            let Some(query) = self.store.get(*id) else {
                return violation(format!("running entry for dead query {id}"));
            };
            if query.worker.as_ref() != Some(worker) {
                return violation(format!("query {id} running on {worker} but bound elsewhere"));
            }
            if !matches!(query.state, QueryState::Exec | QueryState::Canceling) {
                return violation(format!("query {id} running in state {}", query.state));
            }
        }
        for (worker, id) in self.store.pending_cancellation_entries() {
            if self.store.get(*id).map(|q| q.state) != Some(QueryState::Canceling) {
                return violation(format!("query {id} pending cancellation on {worker} is not CANCELING"));
            }
        }
        for (worker, id) in self.store.pending_preemption_entries() {
            if self.store.get(*id).map(|q| q.state) != Some(QueryState::Ready) {
                return violation(format!("query {id} parked on {worker} is not READY"));
            }
        }

        for worker in self.registry.workers() {
            let running = self.store.running_on(&worker.id);
            let parked = self.store.pending_preemption_on(&worker.id);
            let canceling = self.store.pending_cancellation_on(&worker.id);
            let consistent = match worker.status {
                WorkerStatus::Idle => {
                    running.is_none()
                        && parked.is_none()
                        && canceling.is_none()
                        && worker.current_query.is_none()
                }
                WorkerStatus::Busy => {
                    running.is_some()
                        && parked.is_none()
                        && canceling.is_none()
                        && worker.current_query == running
                        && running
                            .and_then(|id| self.store.get(id))
                            .is_some_and(|q| q.state == QueryState::Exec)
                }
                WorkerStatus::Preempting => {
                    running.is_some() != canceling.is_some()
                        && (parked.is_none() || running.is_some())
                        && worker.current_query == running.or(canceling)
                }
            };
            if !consistent {
                return violation(format!(
                    "worker {} is {} with running={:?} parked={:?} canceling={:?} current={:?}",
                    worker.id, worker.status, running, parked, canceling, worker.current_query
                ));
            }
        }
        Ok(())
    }
}
