#![allow(dead_code)]

use std::sync::Arc;

use indexer_service::config::IndexerConfig;
use indexer_service::listeners::drain;
use indexer_service::queues::Channel;
use indexer_service::source::{InMemorySource, OffenderSource};
use indexer_service::telemetry::RecordingTelemetry;
use indexer_service::Indexer;
use offender_model::{ChangeEvent, EventEnvelope, OffenderDetail, OFFENDER_CHANGED};
use serde_json::json;

/// Immediate redelivery and a short retry budget keep failing messages moving in tests.
pub fn test_config(page_size: u64, complete_threshold: u64) -> IndexerConfig {
    let mut cfg = IndexerConfig::default();
    cfg.index.page_size = page_size;
    cfg.index.complete_threshold = complete_threshold;
    cfg.queues.visibility_timeout_ms = 0;
    cfg.queues.max_receive_count = 3;
    cfg
}

pub fn crn(i: usize) -> String { format!("X{i:05}") }

pub fn offender(i: usize) -> OffenderDetail {
    let crn = crn(i);
    OffenderDetail::new(crn.clone(), json!({ "otherIds": { "crn": crn }, "surname": format!("Surname{i}") }))
}

pub fn seeded_source(n: usize) -> Arc<InMemorySource> {
    Arc::new(InMemorySource::with_offenders((0..n).map(offender)))
}

pub struct Harness {
    pub indexer: Indexer,
    pub telemetry: Arc<RecordingTelemetry>,
}

pub fn harness_with(cfg: &IndexerConfig, source: Arc<dyn OffenderSource>) -> Harness {
    let telemetry = Arc::new(RecordingTelemetry::new());
    let indexer = Indexer::in_memory(cfg, source, telemetry.clone()).expect("in-memory indexer opens");
    Harness { indexer, telemetry }
}

pub fn harness(offenders: usize, page_size: u64) -> (Harness, Arc<InMemorySource>) {
    let source = seeded_source(offenders);
    (harness_with(&test_config(page_size, 0), source.clone()), source)
}

/// Handle build work until the queue has nothing left to deliver.
pub fn drain_build(indexer: &Indexer) -> usize {
    drain(&indexer.build_listener(), indexer.queues(), 10_000).expect("build queue drains")
}

pub fn drain_events(indexer: &Indexer) -> usize {
    drain(&indexer.event_listener(), indexer.queues(), 10_000).expect("event queue drains")
}

pub fn publish_change(indexer: &Indexer, event_type: &str, crn: &str) {
    let envelope = EventEnvelope::new(event_type, &ChangeEvent { crn: crn.to_string() }).expect("envelope encodes");
    let body = serde_json::to_string(&envelope).expect("envelope serializes");
    indexer.queues().send_raw(Channel::Event, &body).expect("event sent");
}

pub fn publish_offender_changed(indexer: &Indexer, crn: &str) { publish_change(indexer, OFFENDER_CHANGED, crn) }

/// Run one rebuild to completion and return the promoted colour's document count.
pub fn build_and_complete(indexer: &Indexer) -> u64 {
    indexer.service().prepare_index_for_rebuild().expect("build starts");
    drain_build(indexer);
    let status = indexer.service().mark_indexing_complete(false).expect("build completes");
    indexer.index_store().count(status.current_index).expect("current index counts")
}
