//! The upstream system of record: a paged listing of offender ids plus full records.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::RwLock;

use offender_model::{OffenderDetail, OffenderPage};
use serde_json::Value as JsonValue;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("invalid upstream data: {0}")]
    Invalid(String),
}

pub trait OffenderSource: Send + Sync {
    fn total_offenders(&self) -> Result<u64, SourceError>;
    /// Ids in the deterministic range covered by `page`.
    fn offender_ids(&self, page: &OffenderPage) -> Result<Vec<String>, SourceError>;
    /// Full record for `crn`; `None` when the upstream has no such offender.
    fn offender_detail(&self, crn: &str) -> Result<Option<OffenderDetail>, SourceError>;
}

/// Offender records held in memory and listed in crn order.
#[derive(Default)]
pub struct InMemorySource {
    records: RwLock<BTreeMap<String, JsonValue>>,
}

impl InMemorySource {
    pub fn new() -> Self { Self::default() }

    pub fn with_offenders<I: IntoIterator<Item = OffenderDetail>>(items: I) -> Self {
        let src = Self::new();
        for item in items {
            src.upsert(item);
        }
        src
    }

    /// Load one JSON document per line; the crn is taken from `otherIds.crn` or `crn`.
    pub fn load_json_lines<P: AsRef<Path>>(path: P) -> Result<Self, SourceError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| SourceError::Unavailable(format!("read {}: {e}", path.display())))?;
        let src = Self::new();
        for (line_no, line) in raw.lines().enumerate() {
            if line.trim().is_empty() { continue; }
            let body: JsonValue = serde_json::from_str(line)
                .map_err(|e| SourceError::Invalid(format!("line {}: {e}", line_no + 1)))?;
            let crn = crn_of(&body).ok_or_else(|| SourceError::Invalid(format!("line {}: no crn", line_no + 1)))?;
            src.upsert(OffenderDetail::new(crn, body));
        }
        Ok(src)
    }

    pub fn upsert(&self, detail: OffenderDetail) {
        if let Ok(mut w) = self.records.write() {
            w.insert(detail.crn, detail.body);
        }
    }

    pub fn remove(&self, crn: &str) -> bool {
        self.records.write().map(|mut w| w.remove(crn).is_some()).unwrap_or(false)
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, BTreeMap<String, JsonValue>>, SourceError> {
        self.records.read().map_err(|_| SourceError::Unavailable("record map poisoned".into()))
    }
}

impl OffenderSource for InMemorySource {
    fn total_offenders(&self) -> Result<u64, SourceError> { Ok(self.read()?.len() as u64) }

    fn offender_ids(&self, page: &OffenderPage) -> Result<Vec<String>, SourceError> {
        let skip = usize::try_from(page.from()).unwrap_or(usize::MAX);
        let take = usize::try_from(page.page_size).unwrap_or(usize::MAX);
        Ok(self.read()?.keys().skip(skip).take(take).cloned().collect())
    }

    fn offender_detail(&self, crn: &str) -> Result<Option<OffenderDetail>, SourceError> {
        Ok(self.read()?.get(crn).map(|body| OffenderDetail::new(crn, body.clone())))
    }
}

fn crn_of(body: &JsonValue) -> Option<String> {
    body.pointer("/otherIds/crn")
        .or_else(|| body.get("crn"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn pages_cover_ids_in_order() {
        let src = InMemorySource::with_offenders(
            ["C3", "A1", "B2", "D4", "E5"].map(|crn| OffenderDetail::new(crn, json!({ "crn": crn }))),
        );
        assert_eq!(src.total_offenders().unwrap(), 5);
        assert_eq!(src.offender_ids(&OffenderPage::new(0, 2)).unwrap(), vec!["A1", "B2"]);
        assert_eq!(src.offender_ids(&OffenderPage::new(2, 2)).unwrap(), vec!["E5"]);
        assert!(src.offender_ids(&OffenderPage::new(3, 2)).unwrap().is_empty());
        assert!(src.offender_detail("Z9").unwrap().is_none());
    }

    #[test]
    fn json_lines_take_crn_from_other_ids() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("offenders.jsonl");
        std::fs::write(&path, "{\"otherIds\":{\"crn\":\"X1\"},\"surname\":\"Smith\"}\n\n{\"crn\":\"X2\"}\n").unwrap();
        let src = InMemorySource::load_json_lines(&path).unwrap();
        assert_eq!(src.total_offenders().unwrap(), 2);
        assert_eq!(src.offender_detail("X1").unwrap().unwrap().body["surname"], json!("Smith"));

        std::fs::write(&path, "{\"surname\":\"NoId\"}\n").unwrap();
        assert!(matches!(InMemorySource::load_json_lines(&path), Err(SourceError::Invalid(_))));
    }
}
