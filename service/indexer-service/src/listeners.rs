//! Queue consumers for build work and change events, plus the worker threads that drive them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use offender_model::{BuildWorkItem, EventEnvelope, OFFENDER_CHANGED};
use tracing::{debug, error, info, warn};

use crate::housekeeping::QueueAdmin;
use crate::orchestrator::IndexService;
use crate::queues::{Channel, QueueGateway};
use crate::ServiceError;

#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self { Self(Arc::new(AtomicBool::new(false))) }
    pub fn cancel(&self) { self.0.store(true, Ordering::Relaxed); }
    pub fn is_canceled(&self) -> bool { self.0.load(Ordering::Relaxed) }
}

/// Handles the bodies received on one channel.
pub trait MessageHandler: Send + Sync {
    fn channel(&self) -> Channel;
    fn handle(&self, body: &str) -> Result<(), ServiceError>;
}

/// What happened to a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Deleted from the queue.
    Acknowledged,
    /// Left for redelivery, and eventually the DLQ.
    Retained,
}

pub struct BuildWorkListener {
    service: Arc<IndexService>,
}

impl BuildWorkListener {
    pub fn new(service: Arc<IndexService>) -> Self { Self { service } }
}

impl MessageHandler for BuildWorkListener {
    fn channel(&self) -> Channel { Channel::Build }

    fn handle(&self, body: &str) -> Result<(), ServiceError> {
        let item = BuildWorkItem::from_json(body).map_err(|e| ServiceError::Codec(e.to_string()))?;
        debug!(kind = item.kind(), "build work received");
        match item {
            BuildWorkItem::PopulateIndex { index } => self.service.populate_index(index).map(|_| ()),
            BuildWorkItem::PopulateOffenderPage { offender_page, index } => {
                self.service.populate_index_with_offender_page(&offender_page, index).map(|_| ())
            }
            BuildWorkItem::PopulateOffender { crn, index } => {
                self.service.populate_index_with_offender(&crn, index).map(|_| ())
            }
        }
    }
}

pub struct ChangeEventListener {
    service: Arc<IndexService>,
}

impl ChangeEventListener {
    pub fn new(service: Arc<IndexService>) -> Self { Self { service } }
}

impl MessageHandler for ChangeEventListener {
    fn channel(&self) -> Channel { Channel::Event }

    fn handle(&self, body: &str) -> Result<(), ServiceError> {
        let envelope: EventEnvelope = serde_json::from_str(body).map_err(|e| ServiceError::Codec(e.to_string()))?;
        match envelope.event_type() {
            Some(OFFENDER_CHANGED) => {
                let event = envelope.change_event().map_err(|e| ServiceError::Codec(e.to_string()))?;
                self.service.update_offender(&event.crn).map(|_| ())
            }
            other => {
                info!(event_type = ?other, "ignoring change event of unhandled type");
                Ok(())
            }
        }
    }
}

/// Receive and handle at most one message. `None` when the queue had nothing visible.
///
/// Successful messages and expected refusals (a state conflict, an offender that no longer
/// exists) are acknowledged. Anything else is left on the queue to be redelivered.
pub fn process_next(handler: &dyn MessageHandler, queues: &QueueGateway) -> Result<Option<Disposition>, ServiceError> {
    let channel = handler.channel();
    let Some(msg) = queues.receive(channel)? else { return Ok(None) };
    let disposition = match handler.handle(&msg.body) {
        Ok(()) => Disposition::Acknowledged,
        Err(e) if e.is_expected() => {
            info!(queue = queues.queue_name(channel), reason = %e, "message dropped");
            Disposition::Acknowledged
        }
        Err(e) => {
            warn!(
                queue = queues.queue_name(channel),
                receive_count = msg.receipt.receive_count,
                error = %e,
                "message failed; leaving for redelivery"
            );
            Disposition::Retained
        }
    };
    if disposition == Disposition::Acknowledged && !queues.ack(&msg.receipt)? {
        debug!(queue = queues.queue_name(channel), "receipt expired before ack");
    }
    Ok(Some(disposition))
}

/// Process messages until the queue has nothing visible or `max` messages were handled.
/// Returns how many were handled.
pub fn drain(handler: &dyn MessageHandler, queues: &QueueGateway, max: usize) -> Result<usize, ServiceError> {
    let mut handled = 0;
    while handled < max {
        if process_next(handler, queues)?.is_none() {
            break;
        }
        handled += 1;
    }
    Ok(handled)
}

/// Run `handler` on its own thread, polling every `poll` while the queue is empty.
pub fn spawn_listener(
    handler: Arc<dyn MessageHandler>,
    queues: Arc<QueueGateway>,
    poll: Duration,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("listener-{}", queues.queue_name(handler.channel()));
    std::thread::Builder::new().name(name).spawn(move || {
        info!(queue = queues.queue_name(handler.channel()), "listener started");
        while !cancel.is_canceled() {
            match process_next(handler.as_ref(), &queues) {
                Ok(Some(_)) => {}
                Ok(None) => sleep_unless_cancelled(&cancel, poll),
                Err(e) => {
                    error!(queue = queues.queue_name(handler.channel()), error = %e, "queue receive failed");
                    sleep_unless_cancelled(&cancel, poll);
                }
            }
        }
        info!(queue = queues.queue_name(handler.channel()), "listener stopped");
    })
}

/// One thread per channel.
pub fn spawn_listeners(
    service: Arc<IndexService>,
    queues: Arc<QueueGateway>,
    poll: Duration,
    cancel: CancelToken,
) -> std::io::Result<Vec<JoinHandle<()>>> {
    let handlers: [Arc<dyn MessageHandler>; 2] = [
        Arc::new(BuildWorkListener::new(service.clone())),
        Arc::new(ChangeEventListener::new(service)),
    ];
    handlers
        .into_iter()
        .map(|h| spawn_listener(h, queues.clone(), poll, cancel.clone()))
        .collect()
}

/// Run a housekeeping pass every `interval` until cancelled.
pub fn spawn_housekeeping(
    admin: Arc<QueueAdmin>,
    interval: Duration,
    cancel: CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    std::thread::Builder::new().name("housekeeping".into()).spawn(move || {
        while !cancel.is_canceled() {
            let report = admin.run_housekeeping();
            if report.completed.is_some() {
                info!(?report, "housekeeping completed a build");
            }
            sleep_unless_cancelled(&cancel, interval);
        }
    })
}

fn sleep_unless_cancelled(cancel: &CancelToken, total: Duration) {
    let deadline = Instant::now() + total;
    while !cancel.is_canceled() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(Duration::from_millis(50)));
    }
}
