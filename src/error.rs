use crate::client::State;
use crate::piece::Block;

/// Errors surfaced by decoding, tracker and peer operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Bencode grammar violation
    #[error("Malformed bencode at offset {offset}: {reason}")]
    MalformedEncoding { offset: usize, reason: String },

    /// Torrent document missing a required field or carrying one of the wrong shape
    #[error("Invalid metainfo: {0}")]
    InvalidMetadata(String),

    /// Unusable or failure-signalling tracker response
    #[error("Tracker error: {0}")]
    Tracker(String),

    #[error("Info hash mismatch: us={expected}, peer={received}")]
    HandshakeMismatch { expected: String, received: String },

    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Received message not allowed in the current protocol state
    #[error("Unexpected message while in state {state:?}: {message}")]
    UnexpectedMessage { state: State, message: String },

    /// Piece message doesn't answer the outstanding block request
    #[error(
        "Protocol desync: requested block (index={}, begin={}), received (index={index}, begin={begin})",
        .expected.index,
        .expected.begin
    )]
    ProtocolDesync { expected: Block, index: u32, begin: u32 },

    #[error("Incomplete piece {index}: expected {expected} bytes, received {received}")]
    IncompletePiece {
        index: u32,
        expected: usize,
        received: usize,
    },

    #[error("Hash mismatch for piece {index}")]
    HashMismatch { index: u32 },

    #[error("Invalid piece index {index}, torrent has {count} pieces")]
    InvalidPieceIndex { index: u32, count: usize },

    /// Output sink stopped accepting pieces or received them out of order
    #[error("Output sink error: {0}")]
    Sink(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
