use std::path::PathBuf;
use thiserror::Error;

/// How an error should be handled by the worker that hit it.
///
/// Workers recover from `Transient` (retry with backoff, then degrade) and
/// `Invariant` (log, quarantine the item, keep running). `BadInput` is
/// rejected at the boundary without retry. `Fatal` terminates the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    BadInput,
    Invariant,
    Fatal,
}

/// The central error type for the KAIT system.
///
/// This hierarchy enables programmatic recovery and unified error handling
/// across ingest, queue, store, and advisory layers.
#[derive(Error, Debug)]
pub enum KaitError {
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Advisory error: {0}")]
    Advisory(#[from] AdvisoryError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Data directory not writable: {0}")]
    DataRootNotWritable(PathBuf),

    #[error("Port {0} already in use")]
    PortBind(u16),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Malformed event JSON: {0}")]
    MalformedEvent(String),

    #[error("Batch exceeds {limit} bytes")]
    BatchTooLarge { limit: usize },

    #[error("Missing or invalid bearer token")]
    Unauthorized,

    #[error("Queue under pressure, retry after {retry_after_secs}s")]
    Backpressure { retry_after_secs: u64 },

    #[error("Token file unreadable at {path}: {message}")]
    TokenUnreadable { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Append failed after retries: {0}")]
    AppendFailed(String),

    #[error("Offset state corrupted: {0}")]
    StateCorrupted(String),

    #[error("Rotation failed: {0}")]
    RotationFailed(String),

    #[error("I/O error at {path}: {message}")]
    Io { path: PathBuf, message: String },
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Write failed at {path}: {message}")]
    WriteFailed { path: PathBuf, message: String },

    #[error("Corrupt record in {store}: {detail}")]
    CorruptRecord { store: String, detail: String },

    #[error("Contradictory reliability counters for insight {key}")]
    BadCounters { key: String },

    #[error("Step {step_id} has no parent episode")]
    OrphanedStep { step_id: String },

    #[error("Schema version {found} unsupported (expected {expected})")]
    SchemaMismatch { found: i64, expected: i64 },

    #[error("Store {store} is degraded, writes disabled")]
    Degraded { store: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
}

#[derive(Error, Debug)]
pub enum AdvisoryError {
    #[error("Retrieval deadline exceeded")]
    DeadlineExceeded,

    #[error("Source '{name}' failed: {message}")]
    SourceFailed { name: String, message: String },

    #[error("Decision ledger write failed: {0}")]
    LedgerWrite(String),
}

impl KaitError {
    /// Classify per the recovery taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            KaitError::Ingest(e) => match e {
                IngestError::MalformedEvent(_)
                | IngestError::BatchTooLarge { .. }
                | IngestError::Unauthorized => ErrorClass::BadInput,
                IngestError::Backpressure { .. } => ErrorClass::Transient,
                IngestError::TokenUnreadable { .. } => ErrorClass::Fatal,
            },
            KaitError::Queue(e) => match e {
                QueueError::StateCorrupted(_) => ErrorClass::Invariant,
                _ => ErrorClass::Transient,
            },
            KaitError::Store(e) => match e {
                StoreError::CorruptRecord { .. }
                | StoreError::BadCounters { .. }
                | StoreError::OrphanedStep { .. } => ErrorClass::Invariant,
                StoreError::SchemaMismatch { .. } => ErrorClass::Fatal,
                _ => ErrorClass::Transient,
            },
            KaitError::Advisory(_) => ErrorClass::Transient,
            KaitError::Config(_) => ErrorClass::Fatal,
            KaitError::DataRootNotWritable(_) => ErrorClass::Fatal,
            KaitError::PortBind(_) => ErrorClass::Fatal,
            KaitError::Internal(_) => ErrorClass::Invariant,
            KaitError::Other(_) => ErrorClass::Transient,
        }
    }

    /// Process exit code for fatal errors.
    ///
    /// 1 = configuration or startup error, 2 = data directory not writable,
    /// 3 = port bind conflict.
    pub fn exit_code(&self) -> i32 {
        match self {
            KaitError::DataRootNotWritable(_) => 2,
            KaitError::PortBind(_) => 3,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, KaitError>;
