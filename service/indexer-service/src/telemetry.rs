use std::sync::Mutex;

use offender_model::SyncIndex;
use tracing::info;

/// Business events worth counting, emitted alongside the operation logs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelemetryEvent {
    BuildingIndex { index: SyncIndex },
    CompletedBuildingIndex { index: SyncIndex, offenders: u64 },
    CancelledBuildingIndex { index: SyncIndex },
    SwitchedIndex { current: SyncIndex, force: bool },
    PopulateOffenderPages { index: SyncIndex, pages: u64, total: u64 },
    OffenderUpdated { crn: String, index: SyncIndex, mirrored: bool },
    PurgedQueue { queue: String, messages: u64 },
    TransferredDlq { dlq: String, messages: u64 },
}

impl TelemetryEvent {
    pub fn name(&self) -> &'static str {
        match self {
            TelemetryEvent::BuildingIndex { .. } => "BUILDING_INDEX",
            TelemetryEvent::CompletedBuildingIndex { .. } => "COMPLETED_BUILDING_INDEX",
            TelemetryEvent::CancelledBuildingIndex { .. } => "CANCELLED_BUILDING_INDEX",
            TelemetryEvent::SwitchedIndex { .. } => "SWITCH_INDEX",
            TelemetryEvent::PopulateOffenderPages { .. } => "POPULATE_OFFENDER_PAGES",
            TelemetryEvent::OffenderUpdated { .. } => "OFFENDER_UPDATED",
            TelemetryEvent::PurgedQueue { .. } => "PURGED_QUEUE",
            TelemetryEvent::TransferredDlq { .. } => "TRANSFERRED_DLQ",
        }
    }
}

pub trait Telemetry: Send + Sync {
    fn track(&self, event: TelemetryEvent);
}

/// Emits every event as a structured `tracing` record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn track(&self, event: TelemetryEvent) {
        info!(target: "telemetry", event = event.name(), details = ?event);
    }
}

/// Keeps events in memory so callers can inspect what was reported.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<TelemetryEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self { Self::default() }

    pub fn events(&self) -> Vec<TelemetryEvent> { self.events.lock().map(|g| g.clone()).unwrap_or_default() }

    pub fn named(&self, name: &str) -> Vec<TelemetryEvent> {
        self.events().into_iter().filter(|e| e.name() == name).collect()
    }
}

impl Telemetry for RecordingTelemetry {
    fn track(&self, event: TelemetryEvent) {
        if let Ok(mut g) = self.events.lock() {
            g.push(event);
        }
    }
}
