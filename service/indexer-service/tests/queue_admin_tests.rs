mod common;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use common::*;
use indexer_service::listeners::{drain, process_next, Disposition};
use indexer_service::queues::Channel;
use indexer_service::source::{InMemorySource, OffenderSource, SourceError};
use indexer_service::ServiceError;
use offender_model::{BuildWorkItem, IndexState, OffenderDetail, OffenderPage, SyncIndex};

#[test]
fn purging_the_build_dlq_leaves_the_main_queue() {
    let (h, _source) = harness(1, 10);
    let q = h.indexer.queues();
    for i in 0..10 {
        q.send_to_dlq(Channel::Build, &format!("{{\"n\":{i}}}")).expect("dlq send");
    }
    q.send_raw(Channel::Build, "{\"n\":99}").expect("main send");

    assert_eq!(h.indexer.admin().purge_build_dlq().expect("purge"), 10);
    assert_eq!(q.dlq_depth(Channel::Build).expect("dlq depth"), 0);
    assert_eq!(q.depth(Channel::Build).expect("depth"), 1);
    assert_eq!(h.telemetry.named("PURGED_QUEUE").len(), 1);

    assert_eq!(h.indexer.admin().purge_build_dlq().expect("empty purge"), 0);
    assert_eq!(h.telemetry.named("PURGED_QUEUE").len(), 1, "empty purges are not reported");
}

#[test]
fn purge_queue_and_event_dlq_are_scoped() {
    let (h, _source) = harness(1, 10);
    let q = h.indexer.queues();
    q.send_raw(Channel::Build, "a").expect("send");
    q.send_raw(Channel::Build, "b").expect("send");
    q.send_to_dlq(Channel::Event, "c").expect("send");
    q.send_raw(Channel::Event, "d").expect("send");

    assert_eq!(h.indexer.admin().purge_build_queue().expect("purge"), 2);
    assert_eq!(h.indexer.admin().purge_event_dlq().expect("purge"), 1);
    assert_eq!(q.depth(Channel::Event).expect("depth"), 1);
}

#[test]
fn housekeeping_redrives_a_dead_offender_into_the_build() {
    let (h, source) = harness(2, 10);
    let svc = h.indexer.service();
    let building = svc.prepare_index_for_rebuild().expect("build starts");
    drain_build(&h.indexer);
    let store = h.indexer.index_store();
    let before = store.count(SyncIndex::Green).expect("count");
    assert_eq!(before, 2);

    source.upsert(offender(7));
    let late = BuildWorkItem::PopulateOffender { crn: crn(7), index: Some(building.other_index()) };
    h.indexer.queues().send_to_dlq(Channel::Build, &late.to_json().expect("encode")).expect("dlq send");

    let report = h.indexer.admin().run_housekeeping();
    assert_eq!(report.build_dlq_redriven, 1);
    assert!(report.completed.is_none(), "redriven work keeps the build open");
    assert_eq!(h.telemetry.named("TRANSFERRED_DLQ").len(), 1);

    assert_eq!(drain_build(&h.indexer), 1);
    assert_eq!(store.count(SyncIndex::Green).expect("count"), before + 1);
}

#[test]
fn housekeeping_completes_a_drained_build() {
    let (h, _source) = harness(3, 2);
    h.indexer.service().prepare_index_for_rebuild().expect("build starts");
    assert!(h.indexer.admin().run_housekeeping().completed.is_none(), "queue still holds populate-index");

    drain_build(&h.indexer);
    let report = h.indexer.admin().run_housekeeping();
    let completed = report.completed.expect("housekeeping completes the build");
    assert_eq!(completed.current_index, SyncIndex::Green);
    assert_eq!(completed.current_index_state, IndexState::Completed);
    assert!(h.indexer.admin().run_housekeeping().completed.is_none());
}

#[test]
fn housekeeping_leaves_a_short_build_open() {
    let source = seeded_source(4);
    let h = harness_with(&test_config(2, 0), source.clone());
    h.indexer.service().prepare_index_for_rebuild().expect("build starts");
    drain_build(&h.indexer);
    source.upsert(offender(9));

    assert!(h.indexer.admin().run_housekeeping().completed.is_none());
    assert!(h.indexer.service().index_status().expect("status").is_building());
}

#[test]
fn redrive_moves_only_the_existing_backlog() {
    let (h, _source) = harness(1, 10);
    let q = h.indexer.queues();
    for body in ["one", "two", "three"] {
        q.send_to_dlq(Channel::Event, body).expect("dlq send");
    }
    assert_eq!(h.indexer.admin().redrive_dlq(Channel::Event).expect("redrive"), 3);
    assert_eq!(q.dlq_depth(Channel::Event).expect("dlq depth"), 0);
    assert_eq!(q.depth(Channel::Event).expect("depth"), 3);
    assert_eq!(h.indexer.admin().redrive_dlq(Channel::Event).expect("empty redrive"), 0);
}

#[test]
fn malformed_build_message_ends_on_the_dlq() {
    let (h, _source) = harness(1, 10);
    let q = h.indexer.queues();
    q.send_raw(Channel::Build, "not json").expect("send");

    let listener = h.indexer.build_listener();
    assert_eq!(process_next(&listener, q).expect("process"), Some(Disposition::Retained));
    assert_eq!(drain(&listener, q, 100).expect("drain"), 2, "remaining deliveries before redrive");
    assert_eq!(q.depth(Channel::Build).expect("depth"), 0);
    assert_eq!(q.dlq_depth(Channel::Build).expect("dlq depth"), 1);
}

/// Fails the first fetch of each listed crn.
struct FlakySource {
    inner: InMemorySource,
    failing: Mutex<HashSet<String>>,
}

impl OffenderSource for FlakySource {
    fn total_offenders(&self) -> Result<u64, SourceError> { self.inner.total_offenders() }

    fn offender_ids(&self, page: &OffenderPage) -> Result<Vec<String>, SourceError> { self.inner.offender_ids(page) }

    fn offender_detail(&self, crn: &str) -> Result<Option<OffenderDetail>, SourceError> {
        if self.failing.lock().expect("lock").remove(crn) {
            return Err(SourceError::Unavailable(format!("timeout fetching {crn}")));
        }
        self.inner.offender_detail(crn)
    }
}

#[test]
fn failed_offenders_are_requeued_individually() {
    let source = Arc::new(FlakySource {
        inner: InMemorySource::with_offenders((0..5).map(offender)),
        failing: Mutex::new([crn(1), crn(3)].into_iter().collect()),
    });
    let h = harness_with(&test_config(5, 0), source);
    let svc = h.indexer.service();
    svc.prepare_index_for_rebuild().expect("build starts");
    svc.populate_index(SyncIndex::Green).expect("fan out");

    let indexed = svc.populate_index_with_offender_page(&OffenderPage::new(0, 5), None).expect("page");
    assert_eq!(indexed, 3);
    let store = h.indexer.index_store();
    assert_eq!(store.count(SyncIndex::Green).expect("count"), 3);
    assert!(store.get_offender(SyncIndex::Green, &crn(1)).expect("lookup").is_none());

    drain_build(&h.indexer);
    assert_eq!(store.count(SyncIndex::Green).expect("count"), 5);
    assert!(h.indexer.queues().dlq_depth(Channel::Build).expect("dlq depth") == 0);
    svc.mark_indexing_complete(false).expect("complete after retries");
}

#[test]
fn vanished_offenders_are_skipped() {
    let (h, source) = harness(3, 3);
    let svc = h.indexer.service();
    svc.prepare_index_for_rebuild().expect("build starts");
    source.remove(&crn(1));
    assert_eq!(svc.populate_index_with_offender_page(&OffenderPage::new(0, 3), None).expect("page"), 2);
    assert_eq!(h.indexer.queues().depth(Channel::Build).expect("depth"), 1, "only populate-index queued");
}

#[test]
fn zero_sized_page_is_rejected_as_malformed() {
    let (h, _source) = harness(3, 3);
    let svc = h.indexer.service();
    svc.prepare_index_for_rebuild().expect("build starts");
    h.indexer.queues().purge_main(Channel::Build).expect("purge");

    match svc.populate_index_with_offender_page(&OffenderPage { page: 0, page_size: 0 }, None) {
        Err(ServiceError::Codec(_)) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    let body = r#"{"type":"POPULATE_OFFENDER_PAGE","offenderPage":{"page":0,"pageSize":0}}"#;
    h.indexer.queues().send_raw(Channel::Build, body).expect("send");
    let listener = h.indexer.build_listener();
    assert_eq!(process_next(&listener, h.indexer.queues()).expect("process"), Some(Disposition::Retained));
    drain(&listener, h.indexer.queues(), 100).expect("drain");
    assert_eq!(h.indexer.queues().dlq_depth(Channel::Build).expect("dlq depth"), 1);
}

#[test]
fn dlq_message_held_by_a_redrive_keeps_the_queue_active() {
    let mut cfg = test_config(10, 0);
    cfg.queues.visibility_timeout_ms = 60_000;
    let h = harness_with(&cfg, seeded_source(1));
    let q = h.indexer.queues();
    q.send_to_dlq(Channel::Build, "{}").expect("dlq send");

    let held = q.receive_one_from_dlq(Channel::Build).expect("receive").expect("message");
    let status = q.status(Channel::Build).expect("status");
    assert_eq!((status.on_queue, status.on_dlq, status.in_flight), (0, 0, 1));
    assert!(status.active());

    q.send_raw(Channel::Build, &held.body).expect("resend");
    q.ack(&held.receipt).expect("ack");
    let status = q.status(Channel::Build).expect("status");
    assert_eq!((status.on_queue, status.in_flight), (1, 0));
}
