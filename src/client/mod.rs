//! Query Control: submits one query to the master and follows it to the end.

use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::TcpStream;

use crate::config::ClientConfig;
use crate::error::{MasterError, Result};
use crate::protocol::{read_frame, write_frame, Message, OpCode, Origin};
use crate::scheduler::QueryId;

#[derive(Debug, Clone, Serialize)]
pub struct ReadEvent {
    pub origin: String,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryOutcome {
    /// The master reported QUERY_FINISHED.
    Finished,
    /// The master reported ERROR for the query (or rejected it).
    Failed,
    /// The connection ended before either.
    Disconnected,
}

impl std::fmt::Display for QueryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueryOutcome::Finished => write!(f, "finished"),
            QueryOutcome::Failed => write!(f, "execution error"),
            QueryOutcome::Disconnected => write!(f, "master disconnected"),
        }
    }
}

/// Everything observed about one submitted query.
#[derive(Debug, Clone, Serialize)]
pub struct QueryReport {
    pub path: String,
    pub priority: i32,
    pub query_id: Option<QueryId>,
    pub outcome: QueryOutcome,
    pub reads: Vec<ReadEvent>,
    pub finished_at: DateTime<Utc>,
}

impl QueryReport {
    pub fn succeeded(&self) -> bool {
        self.outcome == QueryOutcome::Finished
    }
}

pub struct QueryControlClient {
    config: ClientConfig,
}

impl QueryControlClient {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Submit `query` with `priority` and wait for it to finish or fail.
    ///
    /// The query file must exist locally (as given, or under `queries_dir`),
    /// but the name is sent as given: workers resolve it themselves.
    pub async fn run(&self, query: &Path, priority: i32) -> Result<QueryReport> {
        if priority < 0 {
            return Err(MasterError::InvalidPriority(priority));
        }
        let resolved = self
            .config
            .resolve_query_path(query)
            .ok_or_else(|| MasterError::QueryFileNotFound(query.display().to_string()))?;
        tracing::debug!(path = %resolved.display(), "Query file found");

        let addr = self.config.master_addr();
        let stream = TcpStream::connect(&addr).await?;
        tracing::info!(addr = %addr, "Connected to master");
        let (read_half, mut writer) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        write_frame(&mut writer, &Message::HandshakeQueryControl.encode()?).await?;
        match read_frame(&mut reader).await? {
            Some(frame) if frame.opcode == OpCode::HandshakeOk.as_u32() => {}
            Some(frame) => return Err(MasterError::HandshakeRejected(frame.opcode)),
            None => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "master closed the connection during handshake",
                )
                .into())
            }
        }

        let path = query.to_string_lossy().into_owned();
        write_frame(
            &mut writer,
            &Message::NewQuery {
                path: path.clone(),
                priority,
            }
            .encode()?,
        )
        .await?;
        tracing::info!(path = %path, priority, "Query execution requested");

        let mut report = QueryReport {
            path,
            priority,
            query_id: None,
            outcome: QueryOutcome::Disconnected,
            reads: Vec::new(),
            finished_at: Utc::now(),
        };

        loop {
            let frame = match read_frame(&mut reader).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::error!("Master closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "Lost connection to master");
                    break;
                }
            };
            let message = match Message::decode(&frame, Origin::Master) {
                Ok(message) => message,
                Err(e) => {
                    tracing::warn!(opcode = frame.opcode, error = %e, "Dropping malformed message");
                    continue;
                }
            };

            match message {
                Message::NewQueryAck { query_id } => {
                    tracing::info!(query_id, "Query accepted by master");
                    report.query_id = Some(query_id);
                }
                Message::ReadResult {
                    query_id,
                    origin,
                    content,
                } => {
                    check_id(&report, query_id);
                    tracing::info!("Read performed: File {origin}, content: {content}");
                    report.reads.push(ReadEvent { origin, content });
                }
                Message::QueryFinished { query_id } => {
                    check_id(&report, query_id);
                    report.outcome = QueryOutcome::Finished;
                    break;
                }
                Message::Error { query_id } => {
                    check_id(&report, query_id);
                    report.outcome = QueryOutcome::Failed;
                    break;
                }
                other => {
                    tracing::warn!(opcode = %other.opcode(), "Unexpected message from master");
                }
            }
        }

        report.finished_at = Utc::now();
        tracing::info!("Query finished - {}", report.outcome);
        Ok(report)
    }
}

fn check_id(report: &QueryReport, received: QueryId) {
    // ERROR{0} rejects a query that never got an id.
    if let Some(expected) = report.query_id {
        if expected != received {
            tracing::warn!(received, expected, "Query id does not match the submitted query");
        }
    }
}
