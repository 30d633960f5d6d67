//! End-to-end tests against a master listening on a real socket.
//!
//! Workers and query controls are scripted peers from the harness; the last
//! tests drive the real query control client.


use std::path::Path;
use std::time::Duration;

use query_master::client::{QueryControlClient, QueryOutcome};
use query_master::config::{ClientConfig, SchedulingAlgorithm};
use query_master::protocol::{Frame, Message};
use test_harness::{assert_eventually, TestMaster, TestPeer};

// ==================== Scheduling ====================

/// Queries run one at a time in arrival order on a single worker
#[tokio::test]
async fn test_fifo_end_to_end() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let mut qc_a = TestPeer::query_control(master.addr).await;
    let mut qc_b = TestPeer::query_control(master.addr).await;

    let a = qc_a.submit("query_a", 7).await;
    assert_eq!(
        worker.recv().await,
        Message::ExecuteQuery {
            query_id: a,
            path: "query_a".to_string(),
            pc: 0
        }
    );
    let b = qc_b.submit("query_b", 0).await;

    worker
        .send(Message::ReadResult {
            query_id: a,
            origin: "users".to_string(),
            content: "alice".to_string(),
        })
        .await;
    assert_eq!(
        qc_a.recv().await,
        Message::ReadResult {
            query_id: a,
            origin: "users".to_string(),
            content: "alice".to_string()
        }
    );

    worker.send(Message::QueryFinished { query_id: a }).await;
    assert_eq!(qc_a.recv().await, Message::QueryFinished { query_id: a });
    assert_eq!(
        worker.recv().await,
        Message::ExecuteQuery {
            query_id: b,
            path: "query_b".to_string(),
            pc: 0
        }
    );

    master.shutdown().await;
}

/// A more important query suspends a running one, which later resumes
/// from the reported resume point
#[tokio::test]
async fn test_priority_preemption_end_to_end() {
    let master = TestMaster::start(SchedulingAlgorithm::Priority).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let mut qc_low = TestPeer::query_control(master.addr).await;
    let mut qc_high = TestPeer::query_control(master.addr).await;

    let low = qc_low.submit("low", 9).await;
    assert!(matches!(worker.recv().await, Message::ExecuteQuery { .. }));

    let high = qc_high.submit("high", 1).await;
    assert_eq!(worker.recv().await, Message::PreemptQuery { query_id: low });

    worker.send(Message::PreemptionAck { pc: 12 }).await;
    assert_eq!(
        worker.recv().await,
        Message::ExecuteQuery {
            query_id: high,
            path: "high".to_string(),
            pc: 0
        }
    );

    worker.send(Message::QueryFinished { query_id: high }).await;
    assert_eq!(qc_high.recv().await, Message::QueryFinished { query_id: high });
    assert_eq!(
        worker.recv().await,
        Message::ExecuteQuery {
            query_id: low,
            path: "low".to_string(),
            pc: 12
        }
    );

    worker.send(Message::QueryFinished { query_id: low }).await;
    assert_eq!(qc_low.recv().await, Message::QueryFinished { query_id: low });

    master.shutdown().await;
}

/// Queued queries lose priority numbers over time
#[tokio::test]
async fn test_aging_over_time() {
    let master = TestMaster::start_with_aging(SchedulingAlgorithm::Priority, 20).await;
    let _worker = TestPeer::worker(master.addr, 1).await;
    let mut qc_running = TestPeer::query_control(master.addr).await;
    let mut qc_queued = TestPeer::query_control(master.addr).await;

    qc_running.submit("running", 0).await;
    let queued = qc_queued.submit("queued", 4).await;

    assert_eventually(
        || async { master.priority_of(queued).await == Some(0) },
        Duration::from_secs(5),
        "queued query should age down to priority 0",
    )
    .await;

    master.shutdown().await;
}

// ==================== Rejections and malformed input ====================

#[tokio::test]
async fn test_negative_priority_rejected_session_stays_open() {
    let master = TestMaster::start(SchedulingAlgorithm::Priority).await;
    let mut qc = TestPeer::query_control(master.addr).await;

    qc.send(Message::NewQuery {
        path: "bad".to_string(),
        priority: -1,
    })
    .await;
    assert_eq!(qc.recv().await, Message::Error { query_id: 0 });
    assert_eq!(master.live_queries().await, 0);

    let id = qc.submit("good", 2).await;
    assert_eq!(id, 1);

    master.shutdown().await;
}

#[tokio::test]
async fn test_unknown_opcode_is_dropped() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut peer = TestPeer::connect(master.addr).await;

    peer.send_frame(Frame {
        opcode: 99,
        payload: vec![1, 2, 3],
    })
    .await;
    peer.send(Message::HandshakeQueryControl).await;
    assert_eq!(peer.recv().await, Message::HandshakeOk);

    master.shutdown().await;
}

// ==================== Disconnect recovery ====================

/// The owner of a query running on a vanished worker gets ERROR
#[tokio::test]
async fn test_worker_disconnect_reports_error() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let mut qc = TestPeer::query_control(master.addr).await;

    let id = qc.submit("query", 0).await;
    assert!(matches!(worker.recv().await, Message::ExecuteQuery { .. }));
    drop(worker);

    assert_eq!(qc.recv().await, Message::Error { query_id: id });
    assert_eventually(
        || async { master.scheduler.snapshot().await.workers.is_empty() },
        Duration::from_secs(5),
        "worker should be unregistered",
    )
    .await;

    master.shutdown().await;
}

/// A query whose owner leaves is canceled on its worker
#[tokio::test]
async fn test_query_control_disconnect_cancels_query() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let mut qc = TestPeer::query_control(master.addr).await;

    let id = qc.submit("query", 0).await;
    assert!(matches!(worker.recv().await, Message::ExecuteQuery { .. }));
    drop(qc);

    assert_eq!(worker.recv().await, Message::CancelQuery { query_id: id });
    worker.send(Message::CancelAck { pc: 3 }).await;

    assert_eventually(
        || async { master.idle_workers().await == 1 && master.live_queries().await == 0 },
        Duration::from_secs(5),
        "worker should be idle after the cancel ack",
    )
    .await;

    master.shutdown().await;
}

/// A queued query whose owner leaves never reaches a worker
#[tokio::test]
async fn test_query_control_disconnect_while_queued() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let mut qc_running = TestPeer::query_control(master.addr).await;
    let mut qc_queued = TestPeer::query_control(master.addr).await;

    let running = qc_running.submit("running", 0).await;
    assert!(matches!(worker.recv().await, Message::ExecuteQuery { .. }));
    qc_queued.submit("queued", 0).await;
    drop(qc_queued);

    assert_eventually(
        || async { master.live_queries().await == 1 },
        Duration::from_secs(5),
        "queued query should be dropped",
    )
    .await;

    worker.send(Message::QueryFinished { query_id: running }).await;
    assert_eq!(
        qc_running.recv().await,
        Message::QueryFinished { query_id: running }
    );
    worker.expect_silence(Duration::from_millis(200)).await;

    master.shutdown().await;
}

/// Reconnecting under the same worker number replaces the old session
#[tokio::test]
async fn test_worker_reconnect_evicts_stale_connection() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut old = TestPeer::worker(master.addr, 3).await;
    let mut qc = TestPeer::query_control(master.addr).await;
    let id = qc.submit("query", 0).await;
    assert!(matches!(old.recv().await, Message::ExecuteQuery { .. }));

    let _new = TestPeer::worker(master.addr, 3).await;
    old.expect_closed().await;
    assert_eq!(qc.recv().await, Message::Error { query_id: id });
    assert_eq!(master.scheduler.snapshot().await.workers.len(), 1);

    master.shutdown().await;
}

// ==================== Query control client ====================

fn client_config(master: &TestMaster, queries_dir: &Path) -> ClientConfig {
    ClientConfig {
        master_host: master.addr.ip().to_string(),
        master_port: master.addr.port(),
        queries_dir: queries_dir.to_path_buf(),
        ..ClientConfig::default()
    }
}

#[tokio::test]
async fn test_client_follows_query_to_completion() {
    let master = TestMaster::start(SchedulingAlgorithm::Priority).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("report.q"), "SELECT 1").unwrap();

    let client = QueryControlClient::new(client_config(&master, dir.path()));
    let run = tokio::spawn(async move { client.run(Path::new("report.q"), 2).await });

    let id = match worker.recv().await {
        Message::ExecuteQuery { query_id, path, pc } => {
            assert_eq!(path, "report.q");
            assert_eq!(pc, 0);
            query_id
        }
        other => panic!("expected EXECUTE_QUERY, got {other:?}"),
    };
    worker
        .send(Message::ReadResult {
            query_id: id,
            origin: "sales".to_string(),
            content: "100".to_string(),
        })
        .await;
    worker.send(Message::QueryFinished { query_id: id }).await;

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, QueryOutcome::Finished);
    assert!(report.succeeded());
    assert_eq!(report.query_id, Some(id));
    assert_eq!(report.reads.len(), 1);
    assert_eq!(report.reads[0].origin, "sales");

    master.shutdown().await;
}

#[tokio::test]
async fn test_client_reports_worker_failure() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let mut worker = TestPeer::worker(master.addr, 1).await;
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("q"), "").unwrap();

    let client = QueryControlClient::new(client_config(&master, dir.path()));
    let run = tokio::spawn(async move { client.run(Path::new("q"), 0).await });

    assert!(matches!(worker.recv().await, Message::ExecuteQuery { .. }));
    drop(worker);

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.outcome, QueryOutcome::Failed);
    assert!(!report.succeeded());

    master.shutdown().await;
}

#[tokio::test]
async fn test_client_rejects_missing_query_file() {
    let master = TestMaster::start(SchedulingAlgorithm::Fifo).await;
    let dir = tempfile::tempdir().unwrap();

    let client = QueryControlClient::new(client_config(&master, dir.path()));
    assert!(client.run(Path::new("missing.q"), 0).await.is_err());
    assert_eq!(master.live_queries().await, 0);

    master.shutdown().await;
}
