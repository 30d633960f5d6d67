use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{Mutex, MutexGuard};

use crate::config::SchedulingAlgorithm;
use crate::error::{MasterError, Result};
use crate::protocol::Message;
use crate::scheduler::state::{Outbound, SchedulerSnapshot, SchedulerState};
use crate::scheduler::{ConnId, QueryId, WorkerId};
use crate::server::{PeerHandle, PendingSend};

/// The master's scheduler: one lock around all registry and query state.
///
/// Each public method takes the lock, runs a state transition and queues the
/// resulting frames on their peers before releasing it, so every peer sees
/// frames in decision order. Writes to workers are then awaited outside the
/// lock; when one fails the lock is re-acquired and the decision is rolled
/// back by identity, since another connection may have changed the state in
/// between. Query control notifications are queued and never awaited.
pub struct Scheduler {
    state: Mutex<SchedulerState>,
    next_conn_id: AtomicU64,
}

impl Scheduler {
    pub fn new(algorithm: SchedulingAlgorithm) -> Self {
        Self {
            state: Mutex::new(SchedulerState::new(algorithm)),
            next_conn_id: AtomicU64::new(1),
        }
    }

    pub fn next_conn_id(&self) -> ConnId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Direct access to the state. Do not hold the guard across a send.
    pub async fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().await
    }

    pub async fn snapshot(&self) -> SchedulerSnapshot {
        self.state.lock().await.snapshot()
    }

    /// Handle NEW_QUERY from a query control session.
    pub async fn submit_query(
        &self,
        peer: &PeerHandle,
        path: String,
        priority: i32,
    ) -> Result<QueryId> {
        let created = self
            .state
            .lock()
            .await
            .create_query(peer.clone(), path.clone(), priority);
        let id = match created {
            Ok(id) => id,
            Err(e @ MasterError::InvalidPriority(_)) => {
                tracing::error!(conn_id = peer.conn_id(), path = %path, priority, "Rejecting query with negative priority");
                if let Err(send_err) = enqueue(peer, &Message::Error { query_id: 0 }) {
                    tracing::debug!(conn_id = peer.conn_id(), error = %send_err, "Could not report rejection");
                }
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(conn_id = peer.conn_id(), error = %e, "Rejecting query");
                return Err(e);
            }
        };

        if let Err(e) = send(peer, &Message::NewQueryAck { query_id: id }).await {
            tracing::error!(query_id = id, error = %e, "Failed to acknowledge query");
            self.state.lock().await.discard_query(peer.conn_id());
            return Err(e);
        }

        let mut state = self.state.lock().await;
        let effects = state.assign(id);
        self.commit(state, effects).await;
        Ok(id)
    }

    /// Handle HANDSHAKE_WORKER. The handshake reply goes out before the worker
    /// becomes visible to dispatch, so it always precedes the first execute.
    pub async fn register_worker(&self, worker_number: i32, peer: &PeerHandle) -> Result<WorkerId> {
        let id = WorkerId::from_number(worker_number);
        send(peer, &Message::HandshakeOk).await?;

        let mut state = self.state.lock().await;
        let (mut effects, stale) = state.register_worker(id.clone(), peer.clone());
        if let Some(stale) = stale {
            stale.close();
        }
        effects.extend(state.dispatch_next());
        self.commit(state, effects).await;
        Ok(id)
    }

    pub async fn dispatch_next(&self) {
        let mut state = self.state.lock().await;
        let effects = state.dispatch_next();
        self.commit(state, effects).await;
    }

    pub async fn query_finished(&self, conn_id: ConnId, query_id: QueryId) {
        let mut state = self.state.lock().await;
        let effects = state.query_finished(conn_id, query_id);
        self.commit(state, effects).await;
    }

    pub async fn preemption_ack(&self, conn_id: ConnId, pc: u32) {
        let mut state = self.state.lock().await;
        let effects = state.preemption_ack(conn_id, pc);
        self.commit(state, effects).await;
    }

    pub async fn cancel_ack(&self, conn_id: ConnId, pc: u32) {
        let mut state = self.state.lock().await;
        let effects = state.cancel_ack(conn_id, pc);
        self.commit(state, effects).await;
    }

    pub async fn read_result(&self, conn_id: ConnId, query_id: QueryId, origin: String, content: String) {
        let mut state = self.state.lock().await;
        let effects = state.read_result(conn_id, query_id, origin, content);
        self.commit(state, effects).await;
    }

    pub async fn worker_disconnected(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        let effects = state.worker_disconnected(conn_id);
        self.commit(state, effects).await;
    }

    pub async fn query_control_disconnected(&self, conn_id: ConnId) {
        let mut state = self.state.lock().await;
        let effects = state.query_control_disconnected(conn_id);
        self.commit(state, effects).await;
    }

    pub async fn age(&self) -> usize {
        self.state.lock().await.age()
    }

    /// Queue `effects` while `state` is still locked, release it, then wait
    /// for the worker-bound writes. Rollbacks can produce more effects, which
    /// go through the same cycle.
    async fn commit(&self, state: MutexGuard<'_, SchedulerState>, effects: Vec<Outbound>) {
        let mut in_flight = enqueue_all(effects);
        drop(state);

        loop {
            let mut failed = Vec::new();
            for (effect, pending) in in_flight {
                let result = match (&effect, pending) {
                    (Outbound::Notify { .. }, Ok(_)) => continue,
                    (_, Ok(pending)) => pending.wait().await,
                    (_, Err(e)) => Err(e),
                };
                match (effect, result) {
                    (
                        Outbound::Execute {
                            worker,
                            query_id,
                            priority,
                            ..
                        },
                        Ok(()),
                    ) => {
                        tracing::info!(query_id, priority, worker_id = %worker, "Query sent to worker");
                    }
                    (_, Ok(())) => {}
                    (effect, Err(e)) => failed.push((effect, e)),
                }
            }
            if failed.is_empty() {
                break;
            }

            let mut state = self.state.lock().await;
            let mut more = Vec::new();
            for (effect, e) in failed {
                match effect {
                    Outbound::Execute { worker, query_id, .. } => {
                        tracing::error!(query_id, worker_id = %worker, error = %e, "Failed to send query to worker");
                        more.extend(state.rollback_execute(&worker, query_id));
                    }
                    Outbound::Preempt { worker, query_id, .. } => {
                        tracing::error!(query_id, worker_id = %worker, error = %e, "Failed to send preempt request");
                        more.extend(state.rollback_preempt(&worker, query_id));
                    }
                    Outbound::Cancel { worker, query_id, .. } => {
                        tracing::error!(query_id, worker_id = %worker, error = %e, "Failed to send cancel request");
                        more.extend(state.rollback_cancel(&worker, query_id));
                    }
                    Outbound::Notify { query_id, message, peer } => {
                        tracing::warn!(
                            query_id,
                            conn_id = peer.conn_id(),
                            opcode = %message.opcode(),
                            error = %e,
                            "Failed to notify query control"
                        );
                    }
                }
            }
            in_flight = enqueue_all(more);
            drop(state);
        }
    }
}

fn enqueue_all(effects: Vec<Outbound>) -> Vec<(Outbound, Result<PendingSend>)> {
    effects
        .into_iter()
        .map(|effect| {
            let pending = enqueue(effect.peer(), &effect.message());
            (effect, pending)
        })
        .collect()
}

fn enqueue(peer: &PeerHandle, message: &Message) -> Result<PendingSend> {
    let frame = message.encode()?;
    peer.enqueue(frame)
}

async fn send(peer: &PeerHandle, message: &Message) -> Result<()> {
    enqueue(peer, message)?.wait().await
}
