//! Typed records for the watch protocol.
//!
//! The listen backend interleaves three kinds of change on a single stream:
//! per-document updates, per-target state transitions and existence filters.
//! [`WatchChange`] is the stream-level union; the aggregator folds a run of
//! them into a [`super::remote_event::RemoteEvent`].

use bytes::Bytes;

use crate::error::{
    self, internal_error, unknown_error, StoreError,
};
use crate::model::{DocumentKey, MaybeDocument};

/// States a target can report on the watch stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

/// A document change scoped to the targets it affects.
///
/// The backend sends the document once and lists the targets whose result
/// sets now include it (`updated_target_ids`) and those that no longer do
/// (`removed_target_ids`).
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<i32>,
    pub removed_target_ids: Vec<i32>,
    pub key: DocumentKey,
    /// The new state of the document, or `None` when the backend only
    /// reports removal from the listed targets without a fresh snapshot.
    pub new_document: Option<MaybeDocument>,
}

impl DocumentWatchChange {
    pub fn new(
        updated_target_ids: Vec<i32>,
        removed_target_ids: Vec<i32>,
        key: DocumentKey,
        new_document: Option<MaybeDocument>,
    ) -> Self {
        DocumentWatchChange {
            updated_target_ids,
            removed_target_ids,
            key,
            new_document,
        }
    }
}

/// A target state transition.
///
/// An empty `target_ids` list addresses every active target; this is how the
/// backend marks a global consistent snapshot.
#[derive(Clone, Debug)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    pub target_ids: Vec<i32>,
    /// Checkpoint for the listed targets. Empty when the backend did not
    /// include one.
    pub resume_token: Bytes,
    /// Populated for `Removed` transitions the backend initiated because the
    /// listen itself failed.
    pub cause: Option<StoreError>,
}

impl WatchTargetChange {
    pub fn new(state: WatchTargetChangeState, target_ids: Vec<i32>) -> Self {
        WatchTargetChange {
            state,
            target_ids,
            resume_token: Bytes::new(),
            cause: None,
        }
    }

    pub fn with_resume_token(mut self, resume_token: Bytes) -> Self {
        self.resume_token = resume_token;
        self
    }

    pub fn with_cause(mut self, cause: StoreError) -> Self {
        self.cause = Some(cause);
        self
    }
}

/// The backend's count of documents in a target, sent so the client can
/// detect that its cached view has drifted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: i32,
    pub count: i32,
}

/// One frame of the watch stream.
#[derive(Clone, Debug)]
pub enum WatchChange {
    Document(DocumentWatchChange),
    Target(WatchTargetChange),
    ExistenceFilter(ExistenceFilterChange),
}

/// Maps a canonical RPC status code to a [`StoreError`].
///
/// Codes outside the canonical space come back as `Unknown` rather than
/// failing, since the cause still has to be delivered to listeners.
pub fn map_rpc_status(code: i32, message: impl Into<String>) -> StoreError {
    let message = message.into();
    match code {
        1 => error::cancelled(message),
        2 => unknown_error(message),
        3 => error::invalid_argument(message),
        4 => error::deadline_exceeded(message),
        5 => error::not_found(message),
        6 => error::already_exists(message),
        7 => error::permission_denied(message),
        8 => error::resource_exhausted(message),
        9 => error::failed_precondition(message),
        10 => error::aborted(message),
        11 => error::out_of_range(message),
        12 => error::unimplemented(message),
        13 => internal_error(message),
        14 => error::unavailable(message),
        15 => error::data_loss(message),
        16 => error::unauthenticated(message),
        _ => unknown_error(format!("Unknown status code {code}: {message}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreErrorCode;

    #[test]
    fn maps_canonical_status_codes() {
        assert_eq!(
            map_rpc_status(7, "denied").code(),
            StoreErrorCode::PermissionDenied
        );
        assert_eq!(
            map_rpc_status(14, "down").code(),
            StoreErrorCode::Unavailable
        );
        assert_eq!(map_rpc_status(14, "down").message(), "down");
    }

    #[test]
    fn unknown_codes_keep_the_original_message() {
        let err = map_rpc_status(99, "weird");
        assert_eq!(err.code(), StoreErrorCode::Unknown);
        assert!(err.message().contains("99"));
        assert!(err.message().contains("weird"));
    }

    #[test]
    fn target_change_builders() {
        let change = WatchTargetChange::new(WatchTargetChangeState::Removed, vec![2])
            .with_resume_token(Bytes::from_static(b"tok"))
            .with_cause(error::permission_denied("no"));
        assert_eq!(change.resume_token, Bytes::from_static(b"tok"));
        assert_eq!(
            change.cause.map(|c| c.code()),
            Some(StoreErrorCode::PermissionDenied)
        );
    }
}
