use std::error::Error;
use std::fmt::{Display, Formatter};

/// Canonical status codes shared by the wire protocol, persistence faults and
/// user-facing failures. Mirrors the gRPC status space minus `OK`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StoreErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl StoreErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreErrorCode::Cancelled => "syncstore/cancelled",
            StoreErrorCode::Unknown => "syncstore/unknown",
            StoreErrorCode::InvalidArgument => "syncstore/invalid-argument",
            StoreErrorCode::DeadlineExceeded => "syncstore/deadline-exceeded",
            StoreErrorCode::NotFound => "syncstore/not-found",
            StoreErrorCode::AlreadyExists => "syncstore/already-exists",
            StoreErrorCode::PermissionDenied => "syncstore/permission-denied",
            StoreErrorCode::ResourceExhausted => "syncstore/resource-exhausted",
            StoreErrorCode::FailedPrecondition => "syncstore/failed-precondition",
            StoreErrorCode::Aborted => "syncstore/aborted",
            StoreErrorCode::OutOfRange => "syncstore/out-of-range",
            StoreErrorCode::Unimplemented => "syncstore/unimplemented",
            StoreErrorCode::Internal => "syncstore/internal",
            StoreErrorCode::Unavailable => "syncstore/unavailable",
            StoreErrorCode::DataLoss => "syncstore/data-loss",
            StoreErrorCode::Unauthenticated => "syncstore/unauthenticated",
        }
    }

    /// Whether a stream-level error with this code should stop retries.
    ///
    /// `Unauthenticated` counts as retryable: the token is refreshed before
    /// the next attempt. `Aborted` is retryable in general; the write stream
    /// narrows that during its handshake (see
    /// [`is_permanent_write_error`]).
    pub fn is_permanent(&self) -> bool {
        match self {
            StoreErrorCode::Cancelled
            | StoreErrorCode::Unknown
            | StoreErrorCode::DeadlineExceeded
            | StoreErrorCode::ResourceExhausted
            | StoreErrorCode::Internal
            | StoreErrorCode::Unavailable
            | StoreErrorCode::Unauthenticated => false,
            StoreErrorCode::InvalidArgument
            | StoreErrorCode::NotFound
            | StoreErrorCode::AlreadyExists
            | StoreErrorCode::PermissionDenied
            | StoreErrorCode::FailedPrecondition
            | StoreErrorCode::Aborted
            | StoreErrorCode::OutOfRange
            | StoreErrorCode::Unimplemented
            | StoreErrorCode::DataLoss => true,
        }
    }
}

/// Error classification for completed write requests. `Aborted` means the
/// commit raced and can be replayed verbatim, so it stays retryable here even
/// though [`StoreErrorCode::is_permanent`] treats it as final.
pub fn is_permanent_write_error(code: StoreErrorCode) -> bool {
    code.is_permanent() && code != StoreErrorCode::Aborted
}

#[derive(Clone, Debug)]
pub struct StoreError {
    pub code: StoreErrorCode,
    message: String,
}

impl StoreError {
    pub fn new(code: StoreErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn code(&self) -> StoreErrorCode {
        self.code
    }

    pub fn code_str(&self) -> &'static str {
        self.code.as_str()
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code_str())
    }
}

impl Error for StoreError {}

pub type StoreResult<T> = Result<T, StoreError>;

pub fn cancelled(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Cancelled, message)
}

pub fn unknown_error(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Unknown, message)
}

pub fn invalid_argument(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::InvalidArgument, message)
}

pub fn deadline_exceeded(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::DeadlineExceeded, message)
}

pub fn not_found(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::NotFound, message)
}

pub fn already_exists(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::AlreadyExists, message)
}

pub fn permission_denied(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::PermissionDenied, message)
}

pub fn resource_exhausted(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::ResourceExhausted, message)
}

pub fn failed_precondition(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::FailedPrecondition, message)
}

pub fn aborted(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Aborted, message)
}

pub fn out_of_range(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::OutOfRange, message)
}

pub fn unimplemented(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Unimplemented, message)
}

pub fn internal_error(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Internal, message)
}

pub fn unavailable(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Unavailable, message)
}

pub fn data_loss(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::DataLoss, message)
}

pub fn unauthenticated(message: impl Into<String>) -> StoreError {
    StoreError::new(StoreErrorCode::Unauthenticated, message)
}
