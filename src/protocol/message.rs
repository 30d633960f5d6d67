use crate::protocol::{Frame, OpCode, ProtocolError};

/// Who sent a frame. Needed because `CANCEL_QUERY` carries a query id when the
/// master sends it and a resume counter when a worker answers with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Master,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    HandshakeQueryControl,
    HandshakeWorker { worker_number: i32 },
    HandshakeOk,
    NewQuery { path: String, priority: i32 },
    NewQueryAck { query_id: u64 },
    ExecuteQuery { query_id: u64, path: String, pc: u32 },
    QueryFinished { query_id: u64 },
    ReadResult { query_id: u64, origin: String, content: String },
    PreemptQuery { query_id: u64 },
    PreemptionAck { pc: u32 },
    /// Master to worker: tear down the named query.
    CancelQuery { query_id: u64 },
    /// Worker to master: cancellation done, with the final counter.
    CancelAck { pc: u32 },
    Error { query_id: u64 },
}

impl Message {
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::HandshakeQueryControl => OpCode::HandshakeQueryControl,
            Message::HandshakeWorker { .. } => OpCode::HandshakeWorker,
            Message::HandshakeOk => OpCode::HandshakeOk,
            Message::NewQuery { .. } => OpCode::NewQuery,
            Message::NewQueryAck { .. } => OpCode::NewQueryAck,
            Message::ExecuteQuery { .. } => OpCode::ExecuteQuery,
            Message::QueryFinished { .. } => OpCode::QueryFinished,
            Message::ReadResult { .. } => OpCode::ReadResult,
            Message::PreemptQuery { .. } => OpCode::PreemptQuery,
            Message::PreemptionAck { .. } => OpCode::PreemptionAck,
            Message::CancelQuery { .. } | Message::CancelAck { .. } => OpCode::CancelQuery,
            Message::Error { .. } => OpCode::Error,
        }
    }

    pub fn encode(&self) -> Result<Frame, ProtocolError> {
        let mut w = PayloadWriter::default();
        match self {
            Message::HandshakeQueryControl | Message::HandshakeOk => {}
            Message::HandshakeWorker { worker_number } => w.i32(*worker_number),
            Message::NewQuery { path, priority } => {
                w.string(path)?;
                w.i32(*priority);
            }
            Message::NewQueryAck { query_id }
            | Message::QueryFinished { query_id }
            | Message::PreemptQuery { query_id }
            | Message::CancelQuery { query_id }
            | Message::Error { query_id } => w.u64(*query_id),
            Message::ExecuteQuery { query_id, path, pc } => {
                w.u64(*query_id);
                w.string(path)?;
                w.u32(*pc);
            }
            Message::ReadResult {
                query_id,
                origin,
                content,
            } => {
                w.u64(*query_id);
                w.string(origin)?;
                w.string(content)?;
            }
            Message::PreemptionAck { pc } | Message::CancelAck { pc } => w.u32(*pc),
        }
        w.finish(self.opcode())
    }

    pub fn decode(frame: &Frame, origin: Origin) -> Result<Message, ProtocolError> {
        let op = frame.op()?;
        let mut r = PayloadReader::new(op, &frame.payload);
        let msg = match op {
            OpCode::HandshakeQueryControl => Message::HandshakeQueryControl,
            OpCode::HandshakeWorker => Message::HandshakeWorker {
                worker_number: r.i32()?,
            },
            OpCode::HandshakeOk => Message::HandshakeOk,
            OpCode::NewQuery => Message::NewQuery {
                path: r.string()?,
                priority: r.i32()?,
            },
            OpCode::NewQueryAck => Message::NewQueryAck {
                query_id: r.u64()?,
            },
            OpCode::ExecuteQuery => Message::ExecuteQuery {
                query_id: r.u64()?,
                path: r.string()?,
                pc: r.u32()?,
            },
            OpCode::QueryFinished => Message::QueryFinished {
                query_id: r.u64()?,
            },
            OpCode::ReadResult => Message::ReadResult {
                query_id: r.u64()?,
                origin: r.string()?,
                content: r.string()?,
            },
            OpCode::PreemptQuery => Message::PreemptQuery {
                query_id: r.u64()?,
            },
            OpCode::PreemptionAck => Message::PreemptionAck { pc: r.u32()? },
            OpCode::CancelQuery => match origin {
                Origin::Master => Message::CancelQuery {
                    query_id: r.u64()?,
                },
                Origin::Peer => Message::CancelAck { pc: r.u32()? },
            },
            OpCode::Error => Message::Error {
                query_id: r.u64()?,
            },
            OpCode::Success => return Err(ProtocolError::UnexpectedMessage(op)),
        };
        Ok(msg)
    }
}

#[derive(Default)]
struct PayloadWriter {
    buf: Vec<u8>,
}

impl PayloadWriter {
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) -> Result<(), ProtocolError> {
        if s.as_bytes().contains(&0) {
            return Err(ProtocolError::Encode("string contains a NUL byte".into()));
        }
        let len = i32::try_from(s.len() + 1)
            .map_err(|_| ProtocolError::Encode(format!("string of {} bytes", s.len())))?;
        self.i32(len);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
        Ok(())
    }

    fn finish(self, op: OpCode) -> Result<Frame, ProtocolError> {
        if self.buf.len() > super::MAX_FRAME_LEN {
            return Err(ProtocolError::FrameTooLarge(self.buf.len()));
        }
        Ok(Frame::new(op, self.buf))
    }
}

struct PayloadReader<'a> {
    op: OpCode,
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    fn new(op: OpCode, buf: &'a [u8]) -> Self {
        Self { op, buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let remaining = self.buf.len() - self.pos;
        if remaining < n {
            return Err(ProtocolError::Truncated {
                opcode: self.op,
                needed: self.pos + n,
                got: self.buf.len(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    fn string(&mut self) -> Result<String, ProtocolError> {
        let len = self.i32()?;
        if len < 0 {
            return Err(ProtocolError::InvalidString(len as i64));
        }
        let bytes = self.take(len as usize)?;
        // Length includes the terminator; tolerate senders that omit it and
        // stop at the first NUL.
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        Ok(String::from_utf8_lossy(&bytes[..end]).into_owned())
    }
}
