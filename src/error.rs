use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Stale term: current term {current}, received {received}")]
    StaleTerm { current: u64, received: u64 },

    #[error("Not the leader, current leader: {leader:?}")]
    NotLeader { leader: Option<String> },

    #[error("A configuration change is already in progress")]
    ConfigurationChangeInProgress,

    #[error("No quorum available")]
    NoQuorum,

    #[error("Checksum mismatch in segment {segment} at position {position}")]
    ChecksumMismatch { segment: u64, position: usize },

    #[error("Invalid segment {segment}: {reason}")]
    InvalidSegment { segment: u64, reason: String },

    #[error("Invalid index for segment {segment}")]
    InvalidIndex { segment: u64 },

    #[error("Segment not found: {0}")]
    SegmentNotFound(u64),

    #[error("Log entry {requested} has been compacted, first available is {first_available}")]
    LogCompacted { requested: u64, first_available: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid sequence number for aggregate {aggregate}: expected {expected}, found {found}")]
    SequenceConflict {
        aggregate: String,
        expected: i64,
        found: i64,
    },

    #[error("Invalid sequence for aggregate {aggregate}: {reason}")]
    InvalidSequence { aggregate: String, reason: String },

    #[error("Size of transaction too large: {size}, max size = {max}")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("Log entry out of order: expected index {expected}, got {found}")]
    InvalidLogEntry { expected: u64, found: u64 },

    #[error("Component has been shut down")]
    Shutdown,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn error_code(&self) -> i32 {
        match self {
            Error::Io(_) => -1,
            Error::StaleTerm { .. } => -2,
            Error::NotLeader { .. } => -3,
            Error::ConfigurationChangeInProgress => -4,
            Error::NoQuorum => -5,
            Error::ChecksumMismatch { .. } => -6,
            Error::InvalidSegment { .. } => -7,
            Error::InvalidIndex { .. } => -8,
            Error::SegmentNotFound(_) => -9,
            Error::LogCompacted { .. } => -10,
            Error::Serialization(_) => -11,
            Error::SequenceConflict { .. } => -12,
            Error::InvalidSequence { .. } => -13,
            Error::PayloadTooLarge { .. } => -14,
            Error::Shutdown => -15,
            Error::Config(_) => -16,
            Error::InvalidTransaction(_) => -17,
            Error::InvalidLogEntry { .. } => -18,
        }
    }

    /// Errors a caller may retry once the cluster settles.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotLeader { .. }
                | Error::NoQuorum
                | Error::ConfigurationChangeInProgress
                | Error::StaleTerm { .. }
        )
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
