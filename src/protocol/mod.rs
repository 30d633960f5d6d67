//! Wire protocol shared by the master, workers, and query controls.
//!
//! Every message travels as a frame:
//!
//! ```text
//! [opcode: u32 LE][payload length: u32 LE][payload: length bytes]
//! ```
//!
//! A zero length is a valid, payload-less message. Payload layouts are defined
//! in [`message`]; framing lives in [`codec`].
//!
//! # Error classes
//!
//! - A frame whose opcode is unknown or whose payload is too short decodes to a
//!   [`ProtocolError`]; the caller logs and drops that single message.
//! - A frame header announcing more than [`MAX_FRAME_LEN`] bytes, or a stream that
//!   ends mid-frame, is a stream-level failure and ends the connection.

pub mod codec;
pub mod message;
pub mod opcode;

pub use codec::{read_frame, write_frame, Frame, MAX_FRAME_LEN};
pub use message::{Message, Origin};
pub use opcode::OpCode;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown opcode {0}")]
    UnknownOpcode(u32),

    #[error("Truncated {opcode:?} payload: needed {needed} bytes, got {got}")]
    Truncated {
        opcode: OpCode,
        needed: usize,
        got: usize,
    },

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Invalid string length {0}")]
    InvalidString(i64),

    #[error("Unexpected {0:?} message in this direction")]
    UnexpectedMessage(OpCode),

    #[error("Failed to encode message: {0}")]
    Encode(String),
}
