//! Protocol error types.

/// Maximum frame size accepted in either direction (16 MiB).
///
/// Large enough for any batch of derivation metadata or log records; small
/// enough that a corrupt length prefix cannot ask for an absurd
/// allocation.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Errors raised by the framing layer and the worker command discipline.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// A frame announced a payload larger than the configured bound.
    ///
    /// The length is validated before any allocation happens.
    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    FrameTooLarge {
        /// Announced payload size.
        size: usize,
        /// Configured bound.
        max: usize,
    },

    /// A frame payload failed to decode as the expected message type.
    #[error("undecodable frame payload")]
    Payload(#[from] serde_json::Error),

    /// The worker's first command did not match its launch verb.
    #[error("unexpected starting command {got:?} for verb {verb}")]
    UnexpectedStartingCommand {
        /// Verb the worker was launched with.
        verb: String,
        /// Tag of the command actually received.
        got: String,
    },

    /// The peer closed the stream before the exchange completed.
    #[error("protocol stream ended unexpectedly")]
    UnexpectedEof,

    /// Transport failure.
    #[error("protocol transport error")]
    Io(#[from] std::io::Error),
}
