//! Queue administration and the periodic housekeeping pass.

use std::sync::Arc;

use offender_model::IndexStatus;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::orchestrator::IndexService;
use crate::queues::{Channel, QueueGateway};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::ServiceError;

/// What one housekeeping pass did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HousekeepingReport {
    pub build_dlq_redriven: u64,
    pub event_dlq_redriven: u64,
    pub alias_repaired: bool,
    /// Set when this pass finished a build.
    pub completed: Option<IndexStatus>,
}

pub struct QueueAdmin {
    service: Arc<IndexService>,
    queues: Arc<QueueGateway>,
    telemetry: Arc<dyn Telemetry>,
}

impl QueueAdmin {
    pub fn new(service: Arc<IndexService>, queues: Arc<QueueGateway>, telemetry: Arc<dyn Telemetry>) -> Self {
        Self { service, queues, telemetry }
    }

    pub fn purge_build_queue(&self) -> Result<u64, ServiceError> {
        let n = self.queues.purge_main(Channel::Build)?;
        self.report_purge(self.queues.queue_name(Channel::Build), n);
        Ok(n)
    }

    pub fn purge_build_dlq(&self) -> Result<u64, ServiceError> {
        let n = self.queues.purge_dlq(Channel::Build)?;
        self.report_purge(self.queues.dlq_name(Channel::Build), n);
        Ok(n)
    }

    pub fn purge_event_dlq(&self) -> Result<u64, ServiceError> {
        let n = self.queues.purge_dlq(Channel::Event)?;
        self.report_purge(self.queues.dlq_name(Channel::Event), n);
        Ok(n)
    }

    fn report_purge(&self, queue: &str, messages: u64) {
        if messages > 0 {
            info!(queue, messages, "purged queue");
            self.telemetry.track(TelemetryEvent::PurgedQueue { queue: queue.to_string(), messages });
        }
    }

    /// Move the messages currently on a channel's DLQ back to its main queue.
    ///
    /// Only the backlog seen at the start is moved, so a message that fails straight back onto
    /// the DLQ is not picked up again in the same call. Returns the number moved.
    pub fn redrive_dlq(&self, channel: Channel) -> Result<u64, ServiceError> {
        let backlog = self.queues.dlq_depth(channel)?;
        let mut moved = 0;
        while moved < backlog {
            let Some(msg) = self.queues.receive_one_from_dlq(channel)? else { break };
            self.queues.send_raw(channel, &msg.body)?;
            self.queues.ack(&msg.receipt)?;
            moved += 1;
        }
        if moved > 0 {
            let dlq = self.queues.dlq_name(channel).to_string();
            info!(%dlq, messages = moved, "transferred dlq messages");
            self.telemetry.track(TelemetryEvent::TransferredDlq { dlq, messages: moved });
        }
        Ok(moved)
    }

    /// Redrive both DLQs, repair the alias and finish a build whose queue has drained.
    ///
    /// Every step is attempted; a failing step is logged and the rest still run.
    pub fn run_housekeeping(&self) -> HousekeepingReport {
        let mut report = HousekeepingReport::default();
        match self.redrive_dlq(Channel::Build) {
            Ok(n) => report.build_dlq_redriven = n,
            Err(e) => warn!(error = %e, "build dlq redrive failed"),
        }
        match self.redrive_dlq(Channel::Event) {
            Ok(n) => report.event_dlq_redriven = n,
            Err(e) => warn!(error = %e, "event dlq redrive failed"),
        }
        match self.service.ensure_alias() {
            Ok(repaired) => report.alias_repaired = repaired,
            Err(e) => warn!(error = %e, "alias check failed"),
        }
        report.completed = self.try_complete_build();
        debug!(?report, "housekeeping pass done");
        report
    }

    fn try_complete_build(&self) -> Option<IndexStatus> {
        let building = match self.service.index_status() {
            Ok(status) => status.is_building(),
            Err(e) => {
                warn!(error = %e, "could not read index status");
                return None;
            }
        };
        if !building {
            return None;
        }
        match self.queues.status(Channel::Build) {
            Ok(q) if q.active() => return None,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "could not read build queue status");
                return None;
            }
        }
        match self.service.mark_indexing_complete(false) {
            Ok(status) => Some(status),
            Err(e) if e.is_expected() => {
                info!(reason = %e, "build not ready to complete");
                None
            }
            Err(e) => {
                warn!(error = %e, "completing build failed");
                None
            }
        }
    }
}
