//! Transitions of the singleton [`IndexStatus`].
//!
//! Every function here is pure: it takes the status it is evaluated against (and the clock
//! reading, where one is recorded) and returns either the next status or a [`StatusError`]
//! carrying the status that was rejected. Persisting the result is the caller's job.

use chrono::{DateTime, Utc};
use offender_model::{IndexState, IndexStatus, QueueStatus, SyncIndex};

/// Expected state conflicts. Each carries the status it was evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatusError {
    #[error("build already in progress: {0}")]
    BuildAlreadyInProgress(IndexStatus),
    #[error("no build in progress: {0}")]
    BuildNotInProgress(IndexStatus),
    #[error("no active index: {0}")]
    NoActiveIndexes(IndexStatus),
    #[error("build was cancelled: {0}")]
    BuildCancelled(IndexStatus),
    #[error("other index was never built: {0}")]
    BuildAbsent(IndexStatus),
    #[error("index {requested} is not the index being built: {status}")]
    WrongIndexRequested { requested: SyncIndex, status: IndexStatus },
    #[error("build messages still pending ({queue:?}): {status}")]
    ActiveMessagesExist { status: IndexStatus, queue: QueueStatus },
    #[error("index holds {actual} of {expected} offenders, more than {threshold} missing: {status}")]
    ThresholdNotMet { status: IndexStatus, expected: u64, actual: u64, threshold: u64 },
}

impl StatusError {
    pub fn status(&self) -> &IndexStatus {
        match self {
            StatusError::BuildAlreadyInProgress(s)
            | StatusError::BuildNotInProgress(s)
            | StatusError::NoActiveIndexes(s)
            | StatusError::BuildCancelled(s)
            | StatusError::BuildAbsent(s) => s,
            StatusError::WrongIndexRequested { status, .. }
            | StatusError::ActiveMessagesExist { status, .. }
            | StatusError::ThresholdNotMet { status, .. } => status,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StatusError::BuildAlreadyInProgress(_) => "BuildAlreadyInProgress",
            StatusError::BuildNotInProgress(_) => "BuildNotInProgress",
            StatusError::NoActiveIndexes(_) => "NoActiveIndexes",
            StatusError::BuildCancelled(_) => "BuildCancelled",
            StatusError::BuildAbsent(_) => "BuildAbsent",
            StatusError::WrongIndexRequested { .. } => "WrongIndexRequested",
            StatusError::ActiveMessagesExist { .. } => "ActiveMessagesExist",
            StatusError::ThresholdNotMet { .. } => "ThresholdNotMet",
        }
    }
}

/// Start building the other index.
pub fn prepare_for_rebuild(status: &IndexStatus, now: DateTime<Utc>) -> Result<IndexStatus, StatusError> {
    match (status.current_index_state, status.other_index_state) {
        (_, IndexState::Building) | (IndexState::Building, _) => Err(StatusError::BuildAlreadyInProgress(status.clone())),
        (_, IndexState::Absent | IndexState::Cancelled | IndexState::Completed) => Ok(IndexStatus {
            other_index_state: IndexState::Building,
            other_index_start_build_time: Some(now),
            other_index_end_build_time: None,
            ..status.clone()
        }),
    }
}

pub fn mark_complete(status: &IndexStatus, now: DateTime<Utc>) -> Result<IndexStatus, StatusError> {
    match status.other_index_state {
        IndexState::Building => Ok(IndexStatus {
            other_index_state: IndexState::Completed,
            other_index_end_build_time: Some(now),
            ..status.clone()
        }),
        IndexState::Absent | IndexState::Cancelled | IndexState::Completed => {
            Err(StatusError::BuildNotInProgress(status.clone()))
        }
    }
}

/// Abandon the build. The end time stays empty: a cancelled build never finished.
pub fn cancel(status: &IndexStatus) -> Result<IndexStatus, StatusError> {
    match status.other_index_state {
        IndexState::Building => Ok(IndexStatus { other_index_state: IndexState::Cancelled, ..status.clone() }),
        IndexState::Absent | IndexState::Cancelled | IndexState::Completed => {
            Err(StatusError::BuildNotInProgress(status.clone()))
        }
    }
}

/// Exchange the roles of the two colours together with their state and build times.
pub fn swap(status: &IndexStatus) -> IndexStatus {
    IndexStatus {
        current_index: status.other_index(),
        current_index_state: status.other_index_state,
        current_index_start_build_time: status.other_index_start_build_time,
        current_index_end_build_time: status.other_index_end_build_time,
        other_index_state: status.current_index_state,
        other_index_start_build_time: status.current_index_start_build_time,
        other_index_end_build_time: status.current_index_end_build_time,
    }
}

/// Finish the build and make the freshly completed colour the current one.
pub fn complete_and_promote(status: &IndexStatus, now: DateTime<Utc>) -> Result<IndexStatus, StatusError> {
    mark_complete(status, now).map(|completed| swap(&completed))
}

/// Switch between the two colours.
///
/// Without `force` both colours must be complete. With `force` a building other index is
/// cancelled first; the colours then swap only if the other one is complete, otherwise the
/// complete current colour stays live. Only a complete colour ever becomes current.
pub fn switch_index(status: &IndexStatus, force: bool) -> Result<IndexStatus, StatusError> {
    if !force {
        return match status.other_index_state {
            IndexState::Building => Err(StatusError::BuildAlreadyInProgress(status.clone())),
            IndexState::Cancelled => Err(StatusError::BuildCancelled(status.clone())),
            IndexState::Absent => Err(StatusError::BuildAbsent(status.clone())),
            IndexState::Completed if status.is_current_complete() => Ok(swap(status)),
            IndexState::Completed => Err(StatusError::NoActiveIndexes(status.clone())),
        };
    }
    let demoted = match status.other_index_state {
        IndexState::Building => IndexStatus { other_index_state: IndexState::Cancelled, ..status.clone() },
        IndexState::Absent | IndexState::Cancelled | IndexState::Completed => status.clone(),
    };
    if demoted.is_other_complete() {
        Ok(swap(&demoted))
    } else if demoted.is_current_complete() {
        Ok(demoted)
    } else {
        Err(StatusError::NoActiveIndexes(status.clone()))
    }
}
