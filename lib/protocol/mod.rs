//! Raw block protocol for remote consumers.
//!
//! A consumer opens a session, polls raw blocks per source and acks them by sequence.
//! Nothing is decoded on this side. Every frame is a `u32` big-endian length followed by
//! a JSON [`Request`] or [`Response`].

mod server;
mod session;

pub use server::{read_frame, serve, write_frame, MAX_FRAME_LEN};
pub use session::{ProtocolSession, SessionState, DEFAULT_POLL_TIMEOUT};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::source::{SourceDescriptor, SourceKey};

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("protocol io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    FrameTooLarge { length: usize, max: usize },

    #[error("malformed protocol message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Open,
    Poll { source: SourceKey },
    Ack { source: SourceKey, seq: i64 },
    Close,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Poll { .. } => "poll",
            Self::Ack { .. } => "ack",
            Self::Close => "close",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// Sources this host advertises, plus the cluster members.
    Opened {
        sources: Vec<SourceDescriptor>,
        members: Vec<String>,
    },
    Block {
        source: SourceKey,
        seq: i64,
        committed_seq: Option<i64>,
        generation: u64,
        row_count: u32,
        /// Length-prefixed row frames, exactly as stored in the log.
        payload: Vec<u8>,
    },
    /// Nothing arrived before the poll timeout.
    NoData { source: SourceKey },
    EndOfStream { source: SourceKey },
    /// The source is fenced or gone; stop polling it.
    SourceUnavailable { source: SourceKey, reason: String },
    Acked { source: SourceKey, seq: i64 },
    Closed,
    /// The request was not valid in the current state. The session is closed.
    ProtocolError { message: String },
}
