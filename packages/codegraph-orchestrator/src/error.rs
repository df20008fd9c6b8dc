use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Stage not found: {0}")]
    StageNotFound(String),

    #[error("No handler registered for stage {0}")]
    HandlerNotRegistered(String),

    #[error("DAG cycle detected among stages: {}", .stages.join(", "))]
    DagCycleDetected { stages: Vec<String> },

    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    #[error("Corrupt checkpoint {cache_key}: {reason}")]
    CorruptCheckpoint { cache_key: String, reason: String },

    #[error("Checkpoint {0} already has a writer in flight")]
    ConcurrentWrite(String),

    #[error("Snapshot {repo_id}:{snapshot_id} is already being processed by job {job_id}")]
    SnapshotBusy {
        repo_id: String,
        snapshot_id: String,
        job_id: String,
    },

    #[error("Dependency index unavailable for {0}")]
    DependencyIndexUnavailable(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bincode error: {0}")]
    Bincode(#[from] Box<bincode::ErrorKind>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    pub fn serialization<E: std::fmt::Display>(e: E) -> Self {
        Self::Serialization(e.to_string())
    }

    pub fn parse<E: std::fmt::Display>(e: E) -> Self {
        Self::Parse(e.to_string())
    }

    /// Failure class when this error surfaces inside a running job.
    ///
    /// Storage-side failures (IO, database, corrupt checkpoints) are
    /// infrastructure problems; malformed input is permanent.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Database(_) | Self::Io(_) | Self::CorruptCheckpoint { .. } => {
                ErrorCategory::Infrastructure
            }
            Self::ConcurrentWrite(_) | Self::SnapshotBusy { .. } => ErrorCategory::Transient,
            Self::InvalidIdentifier(_)
            | Self::Parse(_)
            | Self::Config(_)
            | Self::DagCycleDetected { .. }
            | Self::MissingDependency(_)
            | Self::HandlerNotRegistered(_)
            | Self::DependencyIndexUnavailable(_) => ErrorCategory::Permanent,
            Self::Other(e) => classify_anyhow(e),
            _ => ErrorCategory::Transient,
        }
    }
}

/// Error category for retry logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transient error - retry automatically (e.g., timeout, connection)
    Transient,
    /// Permanent error - don't retry (e.g., invalid input, parse error)
    Permanent,
    /// Infrastructure error - alert ops (e.g., OOM, disk full)
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "transient" => Ok(ErrorCategory::Transient),
            "permanent" => Ok(ErrorCategory::Permanent),
            "infrastructure" => Ok(ErrorCategory::Infrastructure),
            _ => Err(OrchestratorError::parse(format!(
                "Invalid error category: {}",
                s
            ))),
        }
    }

    /// Only transient failures are retried by the orchestrator.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed failure returned by a stage handler.
#[derive(Error, Debug)]
pub enum StageError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("infrastructure failure: {0}")]
    Infrastructure(String),

    #[error("stage timed out after {0}ms")]
    Timeout(u64),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StageError {
    pub fn transient<E: std::fmt::Display>(e: E) -> Self {
        Self::Transient(e.to_string())
    }

    pub fn permanent<E: std::fmt::Display>(e: E) -> Self {
        Self::Permanent(e.to_string())
    }

    pub fn infrastructure<E: std::fmt::Display>(e: E) -> Self {
        Self::Infrastructure(e.to_string())
    }

    /// Classify the failure. Unknown causes default to transient.
    pub fn category(&self) -> ErrorCategory {
        match self {
            StageError::Transient(_) | StageError::Timeout(_) => ErrorCategory::Transient,
            StageError::Permanent(_) => ErrorCategory::Permanent,
            StageError::Infrastructure(_) => ErrorCategory::Infrastructure,
            StageError::Other(e) => classify_anyhow(e),
        }
    }
}

impl From<std::io::Error> for StageError {
    fn from(e: std::io::Error) -> Self {
        StageError::Other(e.into())
    }
}

impl From<OrchestratorError> for StageError {
    fn from(e: OrchestratorError) -> Self {
        match e.category() {
            ErrorCategory::Transient => StageError::Transient(e.to_string()),
            ErrorCategory::Permanent => StageError::Permanent(e.to_string()),
            ErrorCategory::Infrastructure => StageError::Infrastructure(e.to_string()),
        }
    }
}

/// Classify an opaque error: io kinds first, then the message text.
fn classify_anyhow(error: &anyhow::Error) -> ErrorCategory {
    for cause in error.chain() {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if let Some(category) = classify_io_kind(io.kind()) {
                return category;
            }
        }
    }

    classify_message(&format!("{:#}", error))
}

fn classify_io_kind(kind: std::io::ErrorKind) -> Option<ErrorCategory> {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted => Some(ErrorCategory::Transient),
        ErrorKind::OutOfMemory | ErrorKind::PermissionDenied => {
            Some(ErrorCategory::Infrastructure)
        }
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::UnexpectedEof => {
            Some(ErrorCategory::Permanent)
        }
        _ => None,
    }
}

/// Message heuristics for errors that carry no structured cause.
pub fn classify_message(message: &str) -> ErrorCategory {
    // "OOM" only as a standalone word, so "room" or "bloom" don't match
    let oom = message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word == "OOM");
    let message = message.to_lowercase();

    if message.contains("timeout")
        || message.contains("timed out")
        || message.contains("connection")
    {
        ErrorCategory::Transient
    } else if oom
        || message.contains("out of memory")
        || message.contains("no space left")
        || message.contains("disk full")
    {
        ErrorCategory::Infrastructure
    } else if message.contains("parse error")
        || message.contains("invalid")
        || message.contains("malformed")
    {
        ErrorCategory::Permanent
    } else {
        ErrorCategory::Transient
    }
}
