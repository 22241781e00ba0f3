//! Shipping of build and effect logs to the agent's log socket.
//!
//! A linear pipeline of explicit stages, one task per stage, communicating
//! through bounded queues:
//!
//! ```text
//! push(batch) → unbatch → filter → renumber → batch → end-marker + sink
//! ```
//!
//! - *unbatch* flattens incoming chunks so the later stages see single
//!   records;
//! - *filter* drops progress samples, which are high-volume and
//!   reconstructible;
//! - *renumber* assigns the dense, monotone `i` the receiving side uses
//!   for deduplication after reconnects;
//! - *batch* regroups up to [`BATCH_MAX`] records or whatever arrived
//!   within [`BATCH_FLUSH_INTERVAL`];
//! - the sink appends the end marker once the stream is closed and writes
//!   length-prefixed JSON frames to the Unix socket.
//!
//! Draining is bounded by [`LOG_DRAIN_TIMEOUT`]; expiry is fatal to the
//! run, because an unshipped log tail means the run's record is
//! incomplete.

use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::SinkExt;
use hercules_effects_core::{MessageCodec, ProtocolError};
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedWrite;
use tracing::debug;

/// Hard bound on waiting for the pipeline to flush.
pub const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(600);

/// Most records shipped in one frame.
pub const BATCH_MAX: usize = 100;

/// How long a partial batch may wait for company.
pub const BATCH_FLUSH_INTERVAL: Duration = Duration::from_millis(400);

/// Queue depth between adjacent stages.
const STAGE_QUEUE_DEPTH: usize = 256;

/// What a log record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// A plain log line.
    Line,
    /// An activity began.
    ActivityStart,
    /// An activity ended.
    ActivityStop,
    /// An activity produced a result.
    ActivityResult,
    /// A progress sample; dropped by the pipeline.
    ActivityProgress,
}

/// One log record as shipped to the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    /// Dense sequence number, assigned by the pipeline.
    pub i: u64,

    /// Milliseconds since the producing process started.
    pub ms: u64,

    /// Verbosity level, lower is more important.
    pub level: u8,

    /// Record kind.
    pub kind: LogKind,

    /// Message text; empty for pure structure records.
    pub text: String,

    /// Activity this record belongs to, 0 for none.
    pub activity: u64,

    /// Activity type, as reported by the producer.
    #[serde(rename = "type")]
    pub typ: u64,

    /// Parent activity, 0 for none.
    pub parent: u64,

    /// Structured fields attached by the producer.
    pub fields: Vec<serde_json::Value>,
}

impl LogMessage {
    /// A plain line at the given level.
    #[must_use]
    pub fn line(ms: u64, level: u8, text: impl Into<String>) -> Self {
        Self {
            i: 0,
            ms,
            level,
            kind: LogKind::Line,
            text: text.into(),
            activity: 0,
            typ: 0,
            parent: 0,
            fields: Vec::new(),
        }
    }
}

/// Wire frames written to the log socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogFrame {
    /// A batch of records.
    Chunk(Vec<LogMessage>),
    /// No further records will follow.
    End,
}

/// Log pipeline failures.
#[derive(Debug, thiserror::Error)]
pub enum LogShipError {
    /// The log socket could not be reached.
    #[error("failed to connect to log socket {path:?}")]
    Connect {
        /// Socket path.
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The pipeline died before this record was accepted.
    #[error("log pipeline is closed")]
    PipelineClosed,

    /// Writing to the socket failed.
    #[error("log transport failed")]
    Transport(#[from] ProtocolError),

    /// The pipeline did not flush within [`LOG_DRAIN_TIMEOUT`].
    #[error("log drain did not finish within {}s", LOG_DRAIN_TIMEOUT.as_secs())]
    DrainTimeout,

    /// A pipeline stage panicked.
    #[error("log pipeline stage failed: {0}")]
    Pipeline(String),
}

/// Handle for feeding the pipeline.
pub struct LogShipper {
    input_tx: mpsc::Sender<Vec<LogMessage>>,
    sink: JoinHandle<Result<(), LogShipError>>,
}

impl LogShipper {
    /// Connect to the agent's log socket and start the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`LogShipError::Connect`] when the socket is unreachable.
    pub async fn connect(socket_path: &Path) -> Result<Self, LogShipError> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|source| LogShipError::Connect {
                path: socket_path.to_path_buf(),
                source,
            })?;
        Ok(Self::over(stream))
    }

    /// Start the pipeline over an established stream.
    #[must_use]
    pub fn over(stream: UnixStream) -> Self {
        let (input_tx, input_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);
        let (single_tx, single_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);
        let (kept_tx, kept_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);
        let (numbered_tx, numbered_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);
        let (batched_tx, batched_rx) = mpsc::channel(STAGE_QUEUE_DEPTH);

        tokio::spawn(unbatch_stage(input_rx, single_tx));
        tokio::spawn(filter_stage(single_rx, kept_tx));
        tokio::spawn(renumber_stage(kept_rx, numbered_tx));
        tokio::spawn(batch_stage(numbered_rx, batched_tx));
        let sink = tokio::spawn(sink_stage(
            batched_rx,
            FramedWrite::new(stream, MessageCodec::<LogFrame>::new()),
        ));

        Self { input_tx, sink }
    }

    /// Feed a batch of records into the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`LogShipError::PipelineClosed`] when the pipeline has
    /// already shut down.
    pub async fn push(&self, batch: Vec<LogMessage>) -> Result<(), LogShipError> {
        self.input_tx
            .send(batch)
            .await
            .map_err(|_| LogShipError::PipelineClosed)
    }

    /// Close the input and wait — bounded by [`LOG_DRAIN_TIMEOUT`] — for
    /// everything to reach the socket.
    ///
    /// # Errors
    ///
    /// Returns [`LogShipError::DrainTimeout`] on expiry, or the sink's
    /// transport error.
    pub async fn drain(self) -> Result<(), LogShipError> {
        self.drain_within(LOG_DRAIN_TIMEOUT).await
    }

    /// [`drain`](Self::drain) with an explicit bound.
    ///
    /// # Errors
    ///
    /// Returns [`LogShipError::DrainTimeout`] on expiry, or the sink's
    /// transport error.
    pub async fn drain_within(self, limit: Duration) -> Result<(), LogShipError> {
        drop(self.input_tx);
        match tokio::time::timeout(limit, self.sink).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(LogShipError::Pipeline(join_error.to_string())),
            Err(_) => Err(LogShipError::DrainTimeout),
        }
    }
}

async fn unbatch_stage(
    mut input: mpsc::Receiver<Vec<LogMessage>>,
    output: mpsc::Sender<LogMessage>,
) {
    while let Some(batch) = input.recv().await {
        for message in batch {
            if output.send(message).await.is_err() {
                return;
            }
        }
    }
}

async fn filter_stage(mut input: mpsc::Receiver<LogMessage>, output: mpsc::Sender<LogMessage>) {
    while let Some(message) = input.recv().await {
        if message.kind == LogKind::ActivityProgress {
            continue;
        }
        if output.send(message).await.is_err() {
            return;
        }
    }
}

async fn renumber_stage(mut input: mpsc::Receiver<LogMessage>, output: mpsc::Sender<LogMessage>) {
    let mut next = 0u64;
    while let Some(mut message) = input.recv().await {
        message.i = next;
        next += 1;
        if output.send(message).await.is_err() {
            return;
        }
    }
}

async fn batch_stage(
    mut input: mpsc::Receiver<LogMessage>,
    output: mpsc::Sender<Vec<LogMessage>>,
) {
    loop {
        let Some(first) = input.recv().await else {
            return;
        };
        let mut batch = vec![first];
        let mut closed = false;

        let deadline = tokio::time::sleep(BATCH_FLUSH_INTERVAL);
        tokio::pin!(deadline);
        while batch.len() < BATCH_MAX {
            tokio::select! {
                () = &mut deadline => break,
                next = input.recv() => match next {
                    Some(message) => batch.push(message),
                    None => {
                        closed = true;
                        break;
                    },
                },
            }
        }

        if output.send(batch).await.is_err() || closed {
            return;
        }
    }
}

/// Final stage: chunk frames, then the end marker.
async fn sink_stage(
    mut input: mpsc::Receiver<Vec<LogMessage>>,
    mut socket: FramedWrite<UnixStream, MessageCodec<LogFrame>>,
) -> Result<(), LogShipError> {
    let mut shipped = 0usize;
    while let Some(batch) = input.recv().await {
        shipped += batch.len();
        socket.send(LogFrame::Chunk(batch)).await?;
    }
    socket.send(LogFrame::End).await?;
    socket.flush().await?;
    debug!(records = shipped, "log stream drained");
    Ok(())
}
