//! Drives blue/green rebuilds end to end.
//!
//! Every status change goes through [`crate::status`] inside a process-wide critical section
//! and is persisted with a compare-and-swap, so two rebuilds can never both claim the other
//! index, even across processes sharing the same status store.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use index_store::{IndexStore, StatusStore};
use offender_model::{BuildWorkItem, IndexStatus, OffenderDetail, OffenderPage, QueueStatus, SyncIndex};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::IndexConfig;
use crate::queues::{Channel, QueueGateway};
use crate::source::OffenderSource;
use crate::status::{self, StatusError};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::ServiceError;

/// Snapshot of the indexer: status, index sizes, alias and queue backlogs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexInfo {
    pub status: IndexStatus,
    pub alias: Option<SyncIndex>,
    pub current_index_count: Option<u64>,
    pub other_index_count: Option<u64>,
    pub build_queue: QueueStatus,
    pub event_queue: QueueStatus,
}

pub struct IndexService {
    cfg: IndexConfig,
    status_store: Arc<dyn StatusStore>,
    index_store: Arc<dyn IndexStore>,
    queues: Arc<QueueGateway>,
    source: Arc<dyn OffenderSource>,
    telemetry: Arc<dyn Telemetry>,
    status_lock: Mutex<()>,
}

impl IndexService {
    pub fn new(
        cfg: IndexConfig,
        status_store: Arc<dyn StatusStore>,
        index_store: Arc<dyn IndexStore>,
        queues: Arc<QueueGateway>,
        source: Arc<dyn OffenderSource>,
        telemetry: Arc<dyn Telemetry>,
    ) -> Self {
        Self { cfg, status_store, index_store, queues, source, telemetry, status_lock: Mutex::new(()) }
    }

    fn lock_status(&self) -> Result<MutexGuard<'_, ()>, ServiceError> {
        self.status_lock.lock().map_err(|_| ServiceError::Internal("status lock poisoned".into()))
    }

    pub fn index_status(&self) -> Result<IndexStatus, ServiceError> { Ok(self.status_store.load()?.0) }

    pub fn index_info(&self) -> Result<IndexInfo, ServiceError> {
        let status = self.index_status()?;
        let count_of = |colour: SyncIndex| {
            if self.index_store.index_exists(colour) { self.index_store.count(colour).ok() } else { None }
        };
        Ok(IndexInfo {
            alias: self.index_store.alias_target(),
            current_index_count: count_of(status.current_index),
            other_index_count: count_of(status.other_index()),
            build_queue: self.queues.status(Channel::Build)?,
            event_queue: self.queues.status(Channel::Event)?,
            status,
        })
    }

    /// Claim the other index for a rebuild, recreate it empty and start the fan-out.
    pub fn prepare_index_for_rebuild(&self) -> Result<IndexStatus, ServiceError> {
        let _guard = self.lock_status()?;
        let (current, version) = self.status_store.load()?;
        let next = status::prepare_for_rebuild(&current, Utc::now())?;
        let claimed_version = self.status_store.save(&next, version)?;

        let target = next.other_index();
        let side_effects = self
            .index_store
            .create_index(target)
            .map_err(ServiceError::from)
            .and_then(|_| self.queues.send_work(&BuildWorkItem::PopulateIndex { index: target }));
        if let Err(e) = side_effects {
            warn!(index = %target, error = %e, "rebuild could not start; restoring previous status");
            if let Err(restore) = self.status_store.save(&current, claimed_version) {
                warn!(error = %restore, "failed to restore status after aborted rebuild");
            }
            return Err(e);
        }

        info!(index = %target, "building index");
        self.telemetry.track(TelemetryEvent::BuildingIndex { index: target });
        Ok(next)
    }

    /// Fan a populate-index request out into one page message per page of offender ids.
    /// Returns the number of pages sent.
    pub fn populate_index(&self, index: SyncIndex) -> Result<u64, ServiceError> {
        let status = self.index_status()?;
        if !status.is_building() {
            return Err(StatusError::BuildNotInProgress(status).into());
        }
        if index != status.other_index() {
            return Err(StatusError::WrongIndexRequested { requested: index, status }.into());
        }
        let total = self.source.total_offenders()?;
        let pages = OffenderPage::count_for(total, self.cfg.page_size);
        for page in 0..pages {
            self.queues.send_work(&BuildWorkItem::PopulateOffenderPage {
                offender_page: OffenderPage::new(page, self.cfg.page_size),
                index: Some(index),
            })?;
        }
        info!(%index, total, pages, "populating index");
        self.telemetry.track(TelemetryEvent::PopulateOffenderPages { index, pages, total });
        Ok(pages)
    }

    /// Index every offender of one page into the building index.
    ///
    /// Ids whose fetch or write fails are re-queued individually so the rest of the page is kept;
    /// ids the upstream no longer knows are skipped. Returns the number indexed here.
    pub fn populate_index_with_offender_page(
        &self,
        page: &OffenderPage,
        index: Option<SyncIndex>,
    ) -> Result<u64, ServiceError> {
        if page.page_size == 0 {
            return Err(ServiceError::Codec(format!("offender page {} has page size 0", page.page)));
        }
        let target = self.build_target(index)?;
        let crns = self.source.offender_ids(page)?;
        let mut indexed = 0;
        for crn in crns {
            match self.index_offender_into(target, &crn) {
                Ok(true) => indexed += 1,
                Ok(false) => debug!(%crn, "offender vanished upstream; skipping"),
                Err(e) => {
                    warn!(%crn, index = %target, error = %e, "offender failed; re-queueing individually");
                    self.queues.send_work(&BuildWorkItem::PopulateOffender { crn, index: Some(target) })?;
                }
            }
        }
        debug!(page = page.page, index = %target, indexed, "page populated");
        Ok(indexed)
    }

    /// Index a single offender into the building index.
    pub fn populate_index_with_offender(
        &self,
        crn: &str,
        index: Option<SyncIndex>,
    ) -> Result<OffenderDetail, ServiceError> {
        let target = self.build_target(index)?;
        let detail = self
            .source
            .offender_detail(crn)?
            .ok_or_else(|| ServiceError::OffenderNotFound(crn.to_string()))?;
        self.index_store.save_offender(target, &detail)?;
        Ok(detail)
    }

    /// Finish the build and promote it to the current index.
    pub fn mark_indexing_complete(&self, ignore_threshold: bool) -> Result<IndexStatus, ServiceError> {
        let _guard = self.lock_status()?;
        let (current, version) = self.status_store.load()?;
        if !current.is_building() {
            return Err(StatusError::BuildNotInProgress(current).into());
        }
        let queue = self.queues.status(Channel::Build)?;
        if queue.active() {
            return Err(StatusError::ActiveMessagesExist { status: current, queue }.into());
        }
        let built = current.other_index();
        let actual = self.index_store.count(built)?;
        if !ignore_threshold {
            let expected = self.source.total_offenders()?;
            let threshold = self.cfg.complete_threshold;
            if expected.saturating_sub(actual) > threshold {
                return Err(StatusError::ThresholdNotMet { status: current, expected, actual, threshold }.into());
            }
        }
        let next = status::complete_and_promote(&current, Utc::now())?;
        self.status_store.save(&next, version)?;
        self.index_store.switch_alias(next.current_index)?;

        info!(index = %next.current_index, offenders = actual, ignore_threshold, "index build complete");
        self.telemetry.track(TelemetryEvent::CompletedBuildingIndex { index: next.current_index, offenders: actual });
        Ok(next)
    }

    /// Abandon the build and drop all of its pending work.
    ///
    /// The purge happens under the status lock so it cannot remove the work of a rebuild
    /// started right after the cancel.
    pub fn cancel_indexing(&self) -> Result<IndexStatus, ServiceError> {
        let _guard = self.lock_status()?;
        let (current, version) = self.status_store.load()?;
        let next = status::cancel(&current)?;
        self.status_store.save(&next, version)?;
        let purged = self.queues.purge_main(Channel::Build)? + self.queues.purge_dlq(Channel::Build)?;
        info!(index = %next.other_index(), purged, "index build cancelled");
        self.telemetry.track(TelemetryEvent::CancelledBuildingIndex { index: next.other_index() });
        Ok(next)
    }

    pub fn switch_index(&self, force: bool) -> Result<IndexStatus, ServiceError> {
        let _guard = self.lock_status()?;
        let (current, version) = self.status_store.load()?;
        let next = status::switch_index(&current, force)?;
        self.status_store.save(&next, version)?;
        self.index_store.switch_alias(next.current_index)?;
        if current.is_building() && !next.is_building() {
            self.queues.purge_main(Channel::Build)?;
            self.queues.purge_dlq(Channel::Build)?;
        }
        info!(current = %next.current_index, force, "index switched");
        self.telemetry.track(TelemetryEvent::SwitchedIndex { current: next.current_index, force });
        Ok(next)
    }

    /// Re-sync one offender into the live index, mirroring it into a building index.
    pub fn update_offender(&self, crn: &str) -> Result<OffenderDetail, ServiceError> {
        let status = self.index_status()?;
        if status.current_index == SyncIndex::None {
            return Err(StatusError::NoActiveIndexes(status).into());
        }
        let detail = self
            .source
            .offender_detail(crn)?
            .ok_or_else(|| ServiceError::OffenderNotFound(crn.to_string()))?;
        self.index_store.save_offender(status.current_index, &detail)?;
        let mirrored = status.is_building();
        if mirrored {
            self.index_store.save_offender(status.other_index(), &detail)?;
        }
        debug!(%crn, index = %status.current_index, mirrored, "offender updated");
        self.telemetry.track(TelemetryEvent::OffenderUpdated {
            crn: crn.to_string(),
            index: status.current_index,
            mirrored,
        });
        Ok(detail)
    }

    /// Point the alias back at the current index if it drifted. Returns true when repaired.
    pub fn ensure_alias(&self) -> Result<bool, ServiceError> {
        let status = self.index_status()?;
        if status.current_index == SyncIndex::None || self.index_store.alias_target() == Some(status.current_index) {
            return Ok(false);
        }
        if !self.index_store.index_exists(status.current_index) {
            return Ok(false);
        }
        self.index_store.switch_alias(status.current_index)?;
        warn!(index = %status.current_index, "alias did not match current index; repointed");
        Ok(true)
    }

    /// Resolve the colour a build message writes to, refusing once that build is over.
    fn build_target(&self, index: Option<SyncIndex>) -> Result<SyncIndex, ServiceError> {
        let status = self.index_status()?;
        let target = index.unwrap_or_else(|| status.other_index());
        if !status.is_building() {
            return Err(StatusError::BuildNotInProgress(status).into());
        }
        if target != status.other_index() {
            return Err(StatusError::WrongIndexRequested { requested: target, status }.into());
        }
        Ok(target)
    }

    fn index_offender_into(&self, target: SyncIndex, crn: &str) -> Result<bool, ServiceError> {
        match self.source.offender_detail(crn)? {
            Some(detail) => {
                self.index_store.save_offender(target, &detail)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
