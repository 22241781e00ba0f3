//! Data model and worker protocol for the effect execution core.
//!
//! This crate holds the pure, I/O-free half of the effect runner:
//!
//! - [`sensitive`]: the [`Sensitive`] wrapper that keeps secret material out
//!   of logs, error messages, and serialized events.
//! - [`derivation`]: realized derivations ([`Derivation`], [`DrvPath`]) and
//!   the `secretsMap` extraction.
//! - [`secret`]: secret records and the access context they are evaluated
//!   against.
//! - [`condition`]: the boolean access-condition DSL and its tracing
//!   evaluator.
//! - [`protocol`]: the framed, typed command/event stream spoken between the
//!   controller and a worker subprocess.
//!
//! Everything that touches the filesystem, spawns processes, or owns a
//! socket lives in `hercules-effects-runner`.

pub mod condition;
pub mod derivation;
pub mod protocol;
pub mod secret;
pub mod sensitive;

pub use condition::Condition;
pub use derivation::{Derivation, DrvPath, SecretsMap, SecretsMapError, SECRETS_MAP_ENV};
pub use protocol::{
    AttemptId, BuildParams, BuildStatus, Command, EvalParams, Event, MessageCodec, ProtocolError,
    StartingVerb, MAX_FRAME_SIZE,
};
pub use secret::{Secret, SecretContext};
pub use sensitive::Sensitive;
