pub mod sqlite_queue;
pub mod status_repo;
pub mod tantivy_index;

use offender_model::{IndexStatus, OffenderDetail, SyncIndex};

/// Physical blue/green indices plus the alias that makes one of them visible.
pub trait IndexStore: Send + Sync {
    /// Create an empty physical index for `colour`, deleting any stale one first.
    fn create_index(&self, colour: SyncIndex) -> Result<(), IndexError>;
    fn delete_index(&self, colour: SyncIndex) -> Result<(), IndexError>;
    fn index_exists(&self, colour: SyncIndex) -> bool;
    /// Write `detail` as a full replace of any document with the same crn.
    fn save_offender(&self, colour: SyncIndex, detail: &OffenderDetail) -> Result<(), IndexError>;
    fn get_offender(&self, colour: SyncIndex, crn: &str) -> Result<Option<OffenderDetail>, IndexError>;
    fn delete_offender(&self, colour: SyncIndex, crn: &str) -> Result<(), IndexError>;
    /// Live (non-deleted) documents in the physical index.
    fn count(&self, colour: SyncIndex) -> Result<u64, IndexError>;
    fn alias_target(&self) -> Option<SyncIndex>;
    /// Repoint the alias at `colour`; the change is visible atomically.
    fn switch_alias(&self, colour: SyncIndex) -> Result<(), IndexError>;
}

/// Persistence of the singleton [`IndexStatus`] with optimistic versioning.
pub trait StatusStore: Send + Sync {
    /// Load the status (bootstrapping it on first use) and its version.
    fn load(&self) -> Result<(IndexStatus, i64), StoreError>;
    /// Compare-and-swap: persists only if the stored version is still `expected_version`.
    /// Returns the new version.
    fn save(&self, status: &IndexStatus, expected_version: i64) -> Result<i64, StoreError>;
}

/// Opaque handle acknowledging one particular delivery of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receipt {
    pub id: i64,
    pub receive_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub receipt: Receipt,
    pub body: String,
}

/// Where a queue's messages go once they have been received `max_receive_count` times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dlq: String,
    pub max_receive_count: u32,
}

/// At-least-once queue with visibility timeout and redrive-to-DLQ.
pub trait QueueTransport: Send + Sync {
    fn set_redrive_policy(&self, queue: &str, policy: &RedrivePolicy) -> Result<(), QueueError>;
    fn send(&self, queue: &str, body: &str) -> Result<(), QueueError>;
    /// Receive the next visible message, hiding it for the visibility timeout.
    fn receive(&self, queue: &str) -> Result<Option<ReceivedMessage>, QueueError>;
    /// Acknowledge a delivery. Returns false when the receipt is stale.
    fn delete(&self, receipt: &Receipt) -> Result<bool, QueueError>;
    fn visible_count(&self, queue: &str) -> Result<u64, QueueError>;
    fn in_flight_count(&self, queue: &str) -> Result<u64, QueueError>;
    /// Remove every message on `queue`; returns how many were removed.
    fn purge(&self, queue: &str) -> Result<u64, QueueError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("backend error: {0}")]
    Backend(String),
    #[error("status was modified concurrently (expected version {expected})")]
    Conflict { expected: i64 },
    #[error("corrupt status record: {0}")]
    Corrupt(String),
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("no physical index for {0}")]
    Missing(SyncIndex),
    #[error("index backend error: {0}")]
    Backend(String),
    #[error("io error: {0}")]
    Io(String),
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self { StoreError::Backend(e.to_string()) }
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self { QueueError::Backend(e.to_string()) }
}

impl From<tantivy::TantivyError> for IndexError {
    fn from(e: tantivy::TantivyError) -> Self { IndexError::Backend(e.to_string()) }
}

impl From<std::io::Error> for IndexError {
    fn from(e: std::io::Error) -> Self { IndexError::Io(e.to_string()) }
}

pub(crate) fn now_ms() -> i64 { chrono::Utc::now().timestamp_millis() }
