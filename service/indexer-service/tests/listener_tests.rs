mod common;

use std::time::{Duration, Instant};

use common::*;
use indexer_service::listeners::{process_next, spawn_housekeeping, spawn_listeners, Disposition};
use indexer_service::queues::Channel;
use indexer_service::status::StatusError;
use indexer_service::telemetry::TelemetryEvent;
use indexer_service::{CancelToken, ServiceError};
use offender_model::{OffenderDetail, SyncIndex};
use serde_json::json;

#[test]
fn change_event_updates_the_live_index() {
    let (h, source) = harness(3, 10);
    build_and_complete(&h.indexer);
    source.upsert(OffenderDetail::new(crn(1), json!({ "crn": crn(1), "surname": "Renamed" })));

    publish_offender_changed(&h.indexer, &crn(1));
    assert_eq!(drain_events(&h.indexer), 1);

    let stored = h.indexer.index_store().get_offender(SyncIndex::Green, &crn(1)).expect("lookup").expect("present");
    assert_eq!(stored.body["surname"], json!("Renamed"));
    match &h.telemetry.named("OFFENDER_UPDATED")[..] {
        [TelemetryEvent::OffenderUpdated { mirrored, index, .. }] => {
            assert!(!mirrored);
            assert_eq!(*index, SyncIndex::Green);
        }
        other => panic!("unexpected telemetry: {other:?}"),
    }
}

#[test]
fn updates_during_a_rebuild_reach_both_colours() {
    let (h, source) = harness(3, 10);
    build_and_complete(&h.indexer);
    h.indexer.service().prepare_index_for_rebuild().expect("blue build starts");

    source.upsert(OffenderDetail::new(crn(2), json!({ "crn": crn(2), "surname": "Mirrored" })));
    let detail = h.indexer.service().update_offender(&crn(2)).expect("update");
    assert_eq!(detail.body["surname"], json!("Mirrored"));

    let store = h.indexer.index_store();
    for colour in [SyncIndex::Green, SyncIndex::Blue] {
        let stored = store.get_offender(colour, &crn(2)).expect("lookup").expect("present");
        assert_eq!(stored.body["surname"], json!("Mirrored"), "{colour} misses the update");
    }
    assert_eq!(store.count(SyncIndex::Blue).expect("count"), 1);
}

#[test]
fn updates_need_a_live_index() {
    let (h, _source) = harness(2, 10);
    match h.indexer.service().update_offender(&crn(0)) {
        Err(ServiceError::Conflict(StatusError::NoActiveIndexes(_))) => {}
        other => panic!("unexpected result: {other:?}"),
    }

    publish_offender_changed(&h.indexer, &crn(0));
    let listener = h.indexer.event_listener();
    assert_eq!(process_next(&listener, h.indexer.queues()).expect("process"), Some(Disposition::Acknowledged));
    assert_eq!(h.indexer.queues().depth(Channel::Event).expect("depth"), 0);
}

#[test]
fn unknown_offenders_and_event_types_are_acknowledged() {
    let (h, _source) = harness(2, 10);
    build_and_complete(&h.indexer);

    match h.indexer.service().update_offender("Z99999") {
        Err(ServiceError::OffenderNotFound(crn)) => assert_eq!(crn, "Z99999"),
        other => panic!("unexpected result: {other:?}"),
    }

    publish_offender_changed(&h.indexer, "Z99999");
    publish_change(&h.indexer, "OFFENDER_DELETED", &crn(0));
    assert_eq!(drain_events(&h.indexer), 2);
    let q = h.indexer.queues().status(Channel::Event).expect("status");
    assert!(!q.active(), "nothing retried or dead-lettered: {q:?}");
    assert!(h.telemetry.named("OFFENDER_UPDATED").is_empty());
}

#[test]
fn malformed_envelope_is_retained() {
    let (h, _source) = harness(1, 10);
    h.indexer.queues().send_raw(Channel::Event, "{\"Message\":").expect("send");
    let listener = h.indexer.event_listener();
    assert_eq!(process_next(&listener, h.indexer.queues()).expect("process"), Some(Disposition::Retained));
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    check()
}

#[test]
fn worker_threads_build_and_complete_an_index() {
    let (h, _source) = harness(25, 4);
    let cancel = CancelToken::new();
    let mut workers = spawn_listeners(
        h.indexer.service().clone(),
        h.indexer.queues().clone(),
        Duration::from_millis(10),
        cancel.clone(),
    )
    .expect("listeners start");
    workers.push(
        spawn_housekeeping(h.indexer.admin().clone(), Duration::from_millis(25), cancel.clone())
            .expect("housekeeping starts"),
    );

    h.indexer.service().prepare_index_for_rebuild().expect("build starts");
    let svc = h.indexer.service().clone();
    let promoted = wait_until(Duration::from_secs(20), || {
        svc.index_status().map(|s| s.current_index == SyncIndex::Green).unwrap_or(false)
    });

    cancel.cancel();
    for w in workers {
        w.join().expect("worker exits cleanly");
    }
    assert!(promoted, "housekeeping never completed the build");
    assert_eq!(h.indexer.index_store().count(SyncIndex::Green).expect("count"), 25);
    assert_eq!(h.indexer.index_store().alias_target(), Some(SyncIndex::Green));
}
