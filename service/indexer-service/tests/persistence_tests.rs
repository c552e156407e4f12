mod common;

use std::sync::Arc;

use common::*;
use indexer_service::config::IndexerConfig;
use indexer_service::queues::Channel;
use indexer_service::telemetry::TracingTelemetry;
use indexer_service::Indexer;
use offender_model::{IndexState, SyncIndex};

fn on_disk_config(dir: &std::path::Path) -> IndexerConfig {
    let mut cfg = test_config(3, 0);
    cfg.store.db_path = dir.join("state").join("indexer.db");
    cfg
}

#[test]
fn status_indices_and_queues_survive_a_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = on_disk_config(dir.path());
    let source = seeded_source(7);

    {
        let indexer = Indexer::open(&cfg, source.clone(), Arc::new(TracingTelemetry)).expect("first open");
        assert_eq!(build_and_complete(&indexer), 7);
        indexer.service().prepare_index_for_rebuild().expect("blue build starts");
    }

    let indexer = Indexer::open(&cfg, source, Arc::new(TracingTelemetry)).expect("reopen");
    let status = indexer.service().index_status().expect("status");
    assert_eq!(status.current_index, SyncIndex::Green);
    assert_eq!(status.current_index_state, IndexState::Completed);
    assert_eq!(status.other_index_state, IndexState::Building);
    assert_eq!(indexer.index_store().alias_target(), Some(SyncIndex::Green));
    assert_eq!(indexer.index_store().count(SyncIndex::Green).expect("count"), 7);
    assert_eq!(indexer.queues().depth(Channel::Build).expect("depth"), 1, "populate-index still pending");

    drain_build(&indexer);
    let done = indexer.service().mark_indexing_complete(false).expect("resumed build completes");
    assert_eq!(done.current_index, SyncIndex::Blue);
    assert!(cfg.index_dir().join("alias").exists());
}

#[test]
fn invalid_config_is_rejected_before_opening_stores() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut cfg = on_disk_config(dir.path());
    cfg.index.page_size = 0;
    assert!(Indexer::open(&cfg, seeded_source(1), Arc::new(TracingTelemetry)).is_err());
    assert!(!cfg.store.db_path.exists());
}

#[test]
fn a_second_indexer_on_the_same_stores_can_drive_the_build() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cfg = on_disk_config(dir.path());
    let source = seeded_source(5);

    let worker = Indexer::open(&cfg, source.clone(), Arc::new(TracingTelemetry)).expect("worker opens");
    let operator = Indexer::open(&cfg, source.clone(), Arc::new(TracingTelemetry)).expect("operator opens alongside");

    operator.service().prepare_index_for_rebuild().expect("build starts from the operator");
    assert_eq!(drain_build(&worker), 3, "worker fans out and indexes the new colour");
    assert_eq!(operator.index_store().count(SyncIndex::Green).expect("count"), 5);

    let done = operator.service().mark_indexing_complete(false).expect("operator completes");
    assert_eq!(done.current_index, SyncIndex::Green);
    assert_eq!(worker.index_store().alias_target(), Some(SyncIndex::Green));
    worker.service().update_offender(&crn(2)).expect("worker updates the promoted index");

    let late = Indexer::open(&cfg, source, Arc::new(TracingTelemetry)).expect("third open is not locked out");
    assert_eq!(late.service().index_info().expect("info").current_index_count, Some(5));
}
