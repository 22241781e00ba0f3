//! The framed, typed stream spoken between the controller and a worker
//! subprocess.
//!
//! The stack is deliberately small:
//!
//! ```text
//! +-------------------------------------+
//! |  Command / Event (serde_json)       |
//! +-------------------------------------+
//! |  Framing (4-byte BE length prefix)  |
//! +-------------------------------------+
//! |  Child stdio                        |
//! +-------------------------------------+
//! ```
//!
//! Commands flow controller → worker over the child's stdin; events flow
//! worker → controller over its stdout. stderr stays free-form for humans.
//! A single protocol stream is owned by exactly one worker subprocess, and
//! events are delivered in producer order.

pub mod error;
pub mod framing;
pub mod messages;

pub use error::{ProtocolError, MAX_FRAME_SIZE};
pub use framing::MessageCodec;
pub use messages::{
    AttemptId, BuildParams, BuildStatus, Command, EvalParams, Event, StartingVerb,
};
