use std::fmt;

use crate::protocol::ProtocolError;

/// Operation codes understood by the master.
///
/// Numbering is fixed by the wire format shared with workers and query
/// controls. Codes 11..=18 belong to the storage service and are never
/// valid on a master connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum OpCode {
    HandshakeQueryControl = 0,
    HandshakeWorker = 1,
    HandshakeOk = 2,
    NewQuery = 3,
    NewQueryAck = 4,
    ExecuteQuery = 5,
    QueryFinished = 6,
    ReadResult = 7,
    PreemptQuery = 8,
    PreemptionAck = 9,
    CancelQuery = 10,
    Success = 19,
    Error = 20,
}

impl OpCode {
    pub fn as_u32(self) -> u32 {
        self as u32
    }
}

impl TryFrom<u32> for OpCode {
    type Error = ProtocolError;

    fn try_from(raw: u32) -> Result<Self, ProtocolError> {
        let op = match raw {
            0 => OpCode::HandshakeQueryControl,
            1 => OpCode::HandshakeWorker,
            2 => OpCode::HandshakeOk,
            3 => OpCode::NewQuery,
            4 => OpCode::NewQueryAck,
            5 => OpCode::ExecuteQuery,
            6 => OpCode::QueryFinished,
            7 => OpCode::ReadResult,
            8 => OpCode::PreemptQuery,
            9 => OpCode::PreemptionAck,
            10 => OpCode::CancelQuery,
            19 => OpCode::Success,
            20 => OpCode::Error,
            other => return Err(ProtocolError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OpCode::HandshakeQueryControl => "HANDSHAKE_QUERY_CONTROL",
            OpCode::HandshakeWorker => "HANDSHAKE_WORKER",
            OpCode::HandshakeOk => "HANDSHAKE_OK",
            OpCode::NewQuery => "NEW_QUERY",
            OpCode::NewQueryAck => "NEW_QUERY_ACK",
            OpCode::ExecuteQuery => "EXECUTE_QUERY",
            OpCode::QueryFinished => "QUERY_FINISHED",
            OpCode::ReadResult => "READ_RESULT",
            OpCode::PreemptQuery => "PREEMPT_QUERY",
            OpCode::PreemptionAck => "PREEMPTION_ACK",
            OpCode::CancelQuery => "CANCEL_QUERY",
            OpCode::Success => "SUCCESS",
            OpCode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_numbering_is_stable() {
        assert_eq!(OpCode::HandshakeQueryControl.as_u32(), 0);
        assert_eq!(OpCode::CancelQuery.as_u32(), 10);
        assert_eq!(OpCode::Error.as_u32(), 20);
        assert_eq!(OpCode::try_from(9).unwrap(), OpCode::PreemptionAck);
    }

    #[test]
    fn storage_opcodes_are_unknown_to_the_master() {
        for raw in 11..=18 {
            assert_eq!(
                OpCode::try_from(raw),
                Err(ProtocolError::UnknownOpcode(raw))
            );
        }
        assert!(OpCode::try_from(999).is_err());
    }
}
