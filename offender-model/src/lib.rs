//! Shared models used across crates

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Event type of the upstream change feed that triggers a single-record resync.
pub const OFFENDER_CHANGED: &str = "OFFENDER_CHANGED";

/// Colour of a physical index. `None` only ever appears as `current_index` before the first build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncIndex {
    None,
    Green,
    Blue,
}

impl SyncIndex {
    /// The colour that is not `self`. A fresh system (`None`) builds `Green` first.
    pub fn other(self) -> SyncIndex {
        match self {
            SyncIndex::None => SyncIndex::Green,
            SyncIndex::Green => SyncIndex::Blue,
            SyncIndex::Blue => SyncIndex::Green,
        }
    }

    /// Physical index name for a colour; `None` has no physical index.
    pub fn index_name(self) -> Option<&'static str> {
        match self {
            SyncIndex::None => None,
            SyncIndex::Green => Some("offender-search-green"),
            SyncIndex::Blue => Some("offender-search-blue"),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SyncIndex::None => "NONE",
            SyncIndex::Green => "GREEN",
            SyncIndex::Blue => "BLUE",
        }
    }

    pub fn parse(s: &str) -> Option<SyncIndex> {
        match s {
            "NONE" => Some(SyncIndex::None),
            "GREEN" => Some(SyncIndex::Green),
            "BLUE" => Some(SyncIndex::Blue),
            _ => None,
        }
    }
}

impl fmt::Display for SyncIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IndexState {
    Absent,
    Building,
    Cancelled,
    Completed,
}

impl IndexState {
    pub fn as_str(self) -> &'static str {
        match self {
            IndexState::Absent => "ABSENT",
            IndexState::Building => "BUILDING",
            IndexState::Cancelled => "CANCELLED",
            IndexState::Completed => "COMPLETED",
        }
    }

    pub fn parse(s: &str) -> Option<IndexState> {
        match s {
            "ABSENT" => Some(IndexState::Absent),
            "BUILDING" => Some(IndexState::Building),
            "CANCELLED" => Some(IndexState::Cancelled),
            "COMPLETED" => Some(IndexState::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// The singleton record describing which colour is live and how each colour's build went.
///
/// Only the other colour (`current_index.other()`) is ever rebuilt; the current colour is
/// read from or switched into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexStatus {
    pub current_index: SyncIndex,
    pub current_index_start_build_time: Option<DateTime<Utc>>,
    pub current_index_end_build_time: Option<DateTime<Utc>>,
    pub current_index_state: IndexState,
    pub other_index_start_build_time: Option<DateTime<Utc>>,
    pub other_index_end_build_time: Option<DateTime<Utc>>,
    pub other_index_state: IndexState,
}

impl IndexStatus {
    /// Bootstrap value: nothing built yet.
    pub fn new() -> Self {
        Self {
            current_index: SyncIndex::None,
            current_index_start_build_time: None,
            current_index_end_build_time: None,
            current_index_state: IndexState::Absent,
            other_index_start_build_time: None,
            other_index_end_build_time: None,
            other_index_state: IndexState::Absent,
        }
    }

    pub fn other_index(&self) -> SyncIndex { self.current_index.other() }

    pub fn is_building(&self) -> bool { self.other_index_state == IndexState::Building }

    pub fn is_current_complete(&self) -> bool {
        self.current_index != SyncIndex::None && self.current_index_state == IndexState::Completed
    }

    pub fn is_other_complete(&self) -> bool { self.other_index_state == IndexState::Completed }
}

impl Default for IndexStatus {
    fn default() -> Self { Self::new() }
}

impl fmt::Display for IndexStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "current={} ({}), other={} ({})",
            self.current_index,
            self.current_index_state,
            self.other_index(),
            self.other_index_state
        )
    }
}

/// Paging cursor into the upstream identifier listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OffenderPage {
    pub page: u64,
    pub page_size: u64,
}

impl OffenderPage {
    pub fn new(page: u64, page_size: u64) -> Self { Self { page, page_size: page_size.max(1) } }

    /// First position covered by this page.
    pub fn from(&self) -> u64 { self.page.saturating_mul(self.page_size) }

    /// One past the last position covered by this page.
    pub fn to(&self) -> u64 { self.from().saturating_add(self.page_size) }

    /// Pages needed to cover `total` records.
    pub fn count_for(total: u64, page_size: u64) -> u64 {
        let size = page_size.max(1);
        total.div_ceil(size)
    }
}

/// Queue payload of the build pipeline. The discriminant is explicit on the wire (`type`).
///
/// `index` on the page/offender variants names the colour that was building when the work
/// was fanned out; when absent, consumers fall back to the live other index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BuildWorkItem {
    #[serde(rename = "POPULATE_INDEX")]
    PopulateIndex { index: SyncIndex },
    #[serde(rename = "POPULATE_OFFENDER_PAGE", rename_all = "camelCase")]
    PopulateOffenderPage {
        offender_page: OffenderPage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<SyncIndex>,
    },
    #[serde(rename = "POPULATE_OFFENDER")]
    PopulateOffender {
        crn: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<SyncIndex>,
    },
}

impl BuildWorkItem {
    pub fn to_json(&self) -> Result<String, serde_json::Error> { serde_json::to_string(self) }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> { serde_json::from_str(s) }

    pub fn kind(&self) -> &'static str {
        match self {
            BuildWorkItem::PopulateIndex { .. } => "POPULATE_INDEX",
            BuildWorkItem::PopulateOffenderPage { .. } => "POPULATE_OFFENDER_PAGE",
            BuildWorkItem::PopulateOffender { .. } => "POPULATE_OFFENDER",
        }
    }
}

/// Inner payload of a change-feed notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub crn: String,
}

/// Notification envelope delivered on the change-event queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "Message")]
    pub message: String,
    #[serde(rename = "MessageAttributes", default)]
    pub message_attributes: MessageAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttributes {
    #[serde(rename = "eventType", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<MessageAttribute>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAttribute {
    #[serde(rename = "Type", default)]
    pub data_type: String,
    #[serde(rename = "Value")]
    pub value: String,
}

impl EventEnvelope {
    /// Wrap a change event the way the upstream feed does.
    pub fn new(event_type: &str, event: &ChangeEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            message: serde_json::to_string(event)?,
            message_attributes: MessageAttributes {
                event_type: Some(MessageAttribute { data_type: "String".into(), value: event_type.into() }),
            },
        })
    }

    pub fn event_type(&self) -> Option<&str> {
        self.message_attributes.event_type.as_ref().map(|a| a.value.as_str())
    }

    pub fn change_event(&self) -> Result<ChangeEvent, serde_json::Error> { serde_json::from_str(&self.message) }
}

/// Message counts of one logical channel (main queue + DLQ).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub on_queue: u64,
    pub on_dlq: u64,
    pub in_flight: u64,
}

impl QueueStatus {
    pub fn active(&self) -> bool { self.on_queue > 0 || self.on_dlq > 0 || self.in_flight > 0 }
}

/// Full upstream record. `body` is opaque to the indexer and stored verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffenderDetail {
    pub crn: String,
    pub body: JsonValue,
}

impl OffenderDetail {
    pub fn new(crn: impl Into<String>, body: JsonValue) -> Self { Self { crn: crn.into(), body } }
}
