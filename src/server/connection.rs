use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::protocol::{read_frame, Frame, Message, OpCode, Origin};
use crate::scheduler::{Scheduler, WorkerId};
use crate::server::peer::{spawn_writer, PeerHandle, PEER_QUEUE_DEPTH};

/// What a connection turned out to be after its handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Role {
    Unidentified,
    QueryControl,
    Worker(WorkerId),
}

/// Serve one accepted socket until it closes, is evicted, or the master shuts
/// down. Frames from a single connection are handled strictly in order.
pub async fn handle_connection(
    stream: TcpStream,
    scheduler: Arc<Scheduler>,
    shutdown: CancellationToken,
) {
    let conn_id = scheduler.next_conn_id();
    let remote = stream.peer_addr().ok();
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();

    let (peer, inbox) = PeerHandle::channel(conn_id, PEER_QUEUE_DEPTH);
    let writer = spawn_writer(conn_id, write_half, inbox, peer.close_token());
    let mut reader = BufReader::new(read_half);
    let mut role = Role::Unidentified;

    tracing::debug!(conn_id, remote = ?remote, "Connection accepted");

    loop {
        let next = tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = peer.closed() => {
                tracing::debug!(conn_id, "Connection closed by the master");
                break;
            }
            next = read_frame(&mut reader) => next,
        };
        let frame = match next {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                tracing::debug!(conn_id, "Peer closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id, error = %e, "Connection failed");
                break;
            }
        };
        if !dispatch_frame(&scheduler, &peer, &mut role, frame).await {
            break;
        }
    }

    // Shutdown skips recovery: nothing should be sent to peers that are
    // about to lose the master anyway.
    if !shutdown.is_cancelled() {
        match &role {
            Role::QueryControl => scheduler.query_control_disconnected(conn_id).await,
            Role::Worker(_) => scheduler.worker_disconnected(conn_id).await,
            Role::Unidentified => {}
        }
    }

    peer.close();
    let _ = writer.await;
}

/// Route one frame. Returns false when the connection should be dropped.
async fn dispatch_frame(
    scheduler: &Scheduler,
    peer: &PeerHandle,
    role: &mut Role,
    frame: Frame,
) -> bool {
    let conn_id = peer.conn_id();
    let message = match Message::decode(&frame, Origin::Peer) {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(conn_id, opcode = frame.opcode, error = %e, "Dropping malformed message");
            return true;
        }
    };

    let current = role.clone();
    match (current, message) {
        (Role::Unidentified, Message::HandshakeQueryControl) => {
            if let Err(e) = peer.send(Frame::empty(OpCode::HandshakeOk)).await {
                tracing::warn!(conn_id, error = %e, "Failed to answer query control handshake");
                return false;
            }
            tracing::debug!(conn_id, "Query control handshake completed");
            *role = Role::QueryControl;
        }
        (Role::Unidentified, Message::HandshakeWorker { worker_number }) => {
            match scheduler.register_worker(worker_number, peer).await {
                Ok(id) => *role = Role::Worker(id),
                Err(e) => {
                    tracing::warn!(conn_id, worker_number, error = %e, "Worker handshake failed");
                    return false;
                }
            }
        }
        (Role::QueryControl, Message::NewQuery { path, priority }) => {
            // The session stays open after a rejection.
            if let Err(e) = scheduler.submit_query(peer, path, priority).await {
                tracing::debug!(conn_id, error = %e, "New query not accepted");
            }
        }
        (Role::Worker(_), Message::QueryFinished { query_id }) => {
            scheduler.query_finished(conn_id, query_id).await;
        }
        (Role::Worker(_), Message::ReadResult { query_id, origin, content }) => {
            scheduler.read_result(conn_id, query_id, origin, content).await;
        }
        (Role::Worker(_), Message::PreemptionAck { pc }) => {
            scheduler.preemption_ack(conn_id, pc).await;
        }
        (Role::Worker(_), Message::CancelAck { pc }) => {
            scheduler.cancel_ack(conn_id, pc).await;
        }
        (current, message) => {
            tracing::warn!(
                conn_id,
                role = ?current,
                opcode = %message.opcode(),
                "Unexpected message, ignoring"
            );
        }
    }
    true
}
