pub mod config;
pub mod housekeeping;
pub mod listeners;
pub mod orchestrator;
pub mod queues;
pub mod source;
pub mod status;
pub mod telemetry;

use std::path::Path;
use std::sync::Arc;

use index_store::sqlite_queue::SqliteQueue;
use index_store::status_repo::SqliteStatusRepo;
use index_store::tantivy_index::TantivyIndexStore;
use index_store::{IndexError, IndexStore, QueueError, StatusStore, StoreError};
use tracing::info;

use crate::config::IndexerConfig;
use crate::housekeeping::QueueAdmin;
use crate::listeners::{BuildWorkListener, ChangeEventListener};
use crate::orchestrator::IndexService;
use crate::queues::QueueGateway;
use crate::source::{OffenderSource, SourceError};
use crate::status::StatusError;
use crate::telemetry::Telemetry;

pub use crate::listeners::CancelToken;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The operation is not allowed in the current index status.
    #[error(transparent)]
    Conflict(#[from] StatusError),
    #[error("offender {0} not found")]
    OffenderNotFound(String),
    #[error("status store error: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error("malformed message: {0}")]
    Codec(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn is_conflict(&self) -> bool { matches!(self, ServiceError::Conflict(_)) }

    /// Outcomes a caller is expected to see in normal operation rather than faults.
    pub fn is_expected(&self) -> bool {
        matches!(self, ServiceError::Conflict(_) | ServiceError::OffenderNotFound(_))
    }
}

/// The indexer's components wired together over one set of stores.
pub struct Indexer {
    service: Arc<IndexService>,
    admin: Arc<QueueAdmin>,
    queues: Arc<QueueGateway>,
    index_store: Arc<dyn IndexStore>,
}

impl Indexer {
    /// Open the persistent stores named by `cfg`: status and queues in one SQLite file,
    /// indices under [`IndexerConfig::index_dir`].
    pub fn open(
        cfg: &IndexerConfig,
        source: Arc<dyn OffenderSource>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ServiceError> {
        cfg.validate()?;
        let db_path: &Path = &cfg.store.db_path;
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ServiceError::Config(format!("{}: {e}", parent.display())))?;
        }
        let status_store = Arc::new(SqliteStatusRepo::open(db_path)?);
        let transport = Arc::new(SqliteQueue::open(db_path, cfg.queues.visibility_timeout())?);
        let index_store = Arc::new(TantivyIndexStore::open_dir(cfg.index_dir())?);
        info!(db = %db_path.display(), indices = %cfg.index_dir().display(), "indexer stores opened");
        Self::assemble(cfg, status_store, index_store, transport, source, telemetry)
    }

    /// Volatile stores, for tests and dry runs.
    pub fn in_memory(
        cfg: &IndexerConfig,
        source: Arc<dyn OffenderSource>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ServiceError> {
        cfg.validate()?;
        let status_store = Arc::new(SqliteStatusRepo::new()?);
        let transport = Arc::new(SqliteQueue::new(cfg.queues.visibility_timeout())?);
        let index_store = Arc::new(TantivyIndexStore::new_ram());
        Self::assemble(cfg, status_store, index_store, transport, source, telemetry)
    }

    fn assemble(
        cfg: &IndexerConfig,
        status_store: Arc<dyn StatusStore>,
        index_store: Arc<dyn IndexStore>,
        transport: Arc<dyn index_store::QueueTransport>,
        source: Arc<dyn OffenderSource>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Result<Self, ServiceError> {
        let queues = Arc::new(QueueGateway::new(transport, &cfg.queues)?);
        let service = Arc::new(IndexService::new(
            cfg.index.clone(),
            status_store,
            index_store.clone(),
            queues.clone(),
            source,
            telemetry.clone(),
        ));
        let admin = Arc::new(QueueAdmin::new(service.clone(), queues.clone(), telemetry));
        Ok(Self { service, admin, queues, index_store })
    }

    pub fn service(&self) -> &Arc<IndexService> { &self.service }

    pub fn admin(&self) -> &Arc<QueueAdmin> { &self.admin }

    pub fn queues(&self) -> &Arc<QueueGateway> { &self.queues }

    pub fn index_store(&self) -> &Arc<dyn IndexStore> { &self.index_store }

    pub fn build_listener(&self) -> BuildWorkListener { BuildWorkListener::new(self.service.clone()) }

    pub fn event_listener(&self) -> ChangeEventListener { ChangeEventListener::new(self.service.clone()) }
}
