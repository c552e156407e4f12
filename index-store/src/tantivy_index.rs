use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use offender_model::{OffenderDetail, SyncIndex};
use serde_json::Value as JsonValue;
use tantivy::collector::DocSetCollector;
use tantivy::directory::error::LockError;
use tantivy::query::TermQuery;
use tantivy::schema::Value as _;
use tantivy::schema::{Field, IndexRecordOption, Schema, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, TantivyError, Term};
use tracing::{debug, info};

use crate::{IndexError, IndexStore};

const WRITER_MEMORY_BYTES: usize = 50_000_000;
const WRITER_LOCK_ATTEMPTS: u32 = 100;
const WRITER_LOCK_BACKOFF: Duration = Duration::from_millis(50);
const ALIAS_FILE: &str = "alias";

/// One physical tantivy index (a single colour).
///
/// No writer is held between operations: each write takes the directory lock, commits and
/// releases it, so several processes can share one index root.
struct PhysicalIndex {
    index: Index,
    /// Token written when the index was created; a different token on disk means it was recreated.
    generation: Option<String>,
    reader: IndexReader,
    write_lock: Mutex<()>,
    f_crn: Field,
    f_body: Field,
    f_text: Field,
}

impl PhysicalIndex {
    fn from_index(index: Index, generation: Option<String>) -> Result<Self, IndexError> {
        let schema = index.schema();
        let f_crn = schema.get_field("crn")?;
        let f_body = schema.get_field("body")?;
        let f_text = schema.get_field("text")?;
        let reader = index.reader_builder().reload_policy(ReloadPolicy::Manual).try_into()?;
        Ok(Self { index, generation, reader, write_lock: Mutex::new(()), f_crn, f_body, f_text })
    }

    /// Run `f` against a fresh writer, commit, and release the writer.
    fn write<F>(&self, f: F) -> Result<(), IndexError>
    where
        F: FnOnce(&mut IndexWriter) -> Result<(), IndexError>,
    {
        let _guard = self.write_lock.lock().map_err(|_| IndexError::Backend("index writer poisoned".into()))?;
        let mut writer = acquire_writer(&self.index)?;
        f(&mut writer)?;
        writer.commit()?;
        drop(writer);
        self.reader.reload()?;
        Ok(())
    }

    fn searcher(&self) -> Result<tantivy::Searcher, IndexError> {
        self.reader.reload()?;
        Ok(self.reader.searcher())
    }
}

/// Take the index's writer lock, waiting while another process holds it.
fn acquire_writer(index: &Index) -> Result<IndexWriter, IndexError> {
    let mut attempt = 1;
    loop {
        match index.writer_with_num_threads(1, WRITER_MEMORY_BYTES) {
            Ok(writer) => return Ok(writer),
            Err(TantivyError::LockFailure(LockError::LockBusy, _)) if attempt < WRITER_LOCK_ATTEMPTS => {
                debug!(attempt, "index writer busy; retrying");
                attempt += 1;
                std::thread::sleep(WRITER_LOCK_BACKOFF);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Schema of an offender document: exact-match crn, the upstream JSON verbatim, and its text.
fn offender_schema() -> Schema {
    let mut schema_builder = Schema::builder();
    schema_builder.add_text_field("crn", STRING | STORED);
    schema_builder.add_text_field("body", STORED);
    schema_builder.add_text_field("text", TEXT);
    schema_builder.build()
}

/// Tantivy-backed [`IndexStore`] holding the green and blue indices and the alias pointer.
///
/// With a root directory each colour lives under `<root>/<index name>` and the alias is
/// persisted in `<root>/alias`; without one everything is kept in RAM. A directory store
/// always resolves colours and the alias against the disk, so changes made by another store
/// on the same root are picked up on the next call.
pub struct TantivyIndexStore {
    root: Option<PathBuf>,
    indexes: RwLock<HashMap<SyncIndex, Arc<PhysicalIndex>>>,
    alias: RwLock<Option<SyncIndex>>,
}

impl TantivyIndexStore {
    pub fn new_ram() -> Self {
        Self { root: None, indexes: RwLock::new(HashMap::new()), alias: RwLock::new(None) }
    }

    /// Open (or initialize) a store rooted at `root`. Colour indices are opened on first use.
    pub fn open_dir<P: AsRef<Path>>(root: P) -> Result<Self, IndexError> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        let alias = read_alias(&root);
        Ok(Self { root: Some(root), indexes: RwLock::new(HashMap::new()), alias: RwLock::new(alias) })
    }

    fn cached(&self, colour: SyncIndex) -> Result<Option<Arc<PhysicalIndex>>, IndexError> {
        let guard = self.indexes.read().map_err(|_| IndexError::Backend("index map poisoned".into()))?;
        Ok(guard.get(&colour).cloned())
    }

    fn cache(&self, colour: SyncIndex, idx: Option<Arc<PhysicalIndex>>) -> Result<(), IndexError> {
        let mut guard = self.indexes.write().map_err(|_| IndexError::Backend("index map poisoned".into()))?;
        match idx {
            Some(idx) => guard.insert(colour, idx),
            None => guard.remove(&colour),
        };
        Ok(())
    }

    fn physical(&self, colour: SyncIndex) -> Result<Arc<PhysicalIndex>, IndexError> {
        let cached = self.cached(colour)?;
        let Some(root) = self.root.as_deref() else { return cached.ok_or(IndexError::Missing(colour)) };
        let Some(dir) = colour_dir(root, colour) else { return Err(IndexError::Missing(colour)) };
        let on_disk = read_generation(root, colour).filter(|_| dir.join("meta.json").exists());
        match (cached, on_disk) {
            (Some(idx), Some(token)) if idx.generation.as_deref() == Some(token.as_str()) => Ok(idx),
            (_, Some(token)) => {
                let idx = Arc::new(PhysicalIndex::from_index(Index::open_in_dir(&dir)?, Some(token))?);
                self.cache(colour, Some(idx.clone()))?;
                debug!(%colour, dir = %dir.display(), "opened physical index");
                Ok(idx)
            }
            (_, None) => {
                self.cache(colour, None)?;
                Err(IndexError::Missing(colour))
            }
        }
    }

    fn remove_physical(&self, colour: SyncIndex) -> Result<(), IndexError> {
        self.cache(colour, None)?;
        if let Some(root) = self.root.as_deref() {
            remove_if_exists(&generation_file(root, colour))?;
            if let Some(dir) = colour_dir(root, colour) {
                if dir.exists() {
                    fs::remove_dir_all(&dir)?;
                }
            }
        }
        Ok(())
    }

    fn persist_alias(&self, colour: SyncIndex) -> Result<(), IndexError> {
        let Some(root) = &self.root else { return Ok(()) };
        let tmp = root.join("alias.tmp");
        fs::write(&tmp, format!("{colour}\n"))?;
        fs::rename(tmp, root.join(ALIAS_FILE))?;
        Ok(())
    }
}

impl IndexStore for TantivyIndexStore {
    fn create_index(&self, colour: SyncIndex) -> Result<(), IndexError> {
        if colour == SyncIndex::None {
            return Err(IndexError::Missing(colour));
        }
        self.remove_physical(colour)?;
        let physical = match self.root.as_deref() {
            Some(root) => {
                let dir = colour_dir(root, colour).ok_or(IndexError::Missing(colour))?;
                fs::create_dir_all(&dir)?;
                let index = Index::create_in_dir(&dir, offender_schema())?;
                let generation = new_generation();
                fs::write(generation_file(root, colour), &generation)?;
                PhysicalIndex::from_index(index, Some(generation))?
            }
            None => PhysicalIndex::from_index(Index::create_in_ram(offender_schema()), None)?,
        };
        self.cache(colour, Some(Arc::new(physical)))?;
        info!(%colour, "created physical index");
        Ok(())
    }

    fn delete_index(&self, colour: SyncIndex) -> Result<(), IndexError> {
        self.remove_physical(colour)?;
        info!(%colour, "deleted physical index");
        Ok(())
    }

    fn index_exists(&self, colour: SyncIndex) -> bool { self.physical(colour).is_ok() }

    fn save_offender(&self, colour: SyncIndex, detail: &OffenderDetail) -> Result<(), IndexError> {
        let idx = self.physical(colour)?;
        let body = serde_json::to_string(&detail.body).map_err(|e| IndexError::Backend(e.to_string()))?;
        let mut text = String::new();
        flatten_text(&detail.body, &mut text);
        idx.write(|writer| {
            writer.delete_term(Term::from_field_text(idx.f_crn, &detail.crn));
            writer.add_document(doc!(
                idx.f_crn => detail.crn.clone(),
                idx.f_body => body,
                idx.f_text => text,
            ))?;
            Ok(())
        })
    }

    fn get_offender(&self, colour: SyncIndex, crn: &str) -> Result<Option<OffenderDetail>, IndexError> {
        let idx = self.physical(colour)?;
        let searcher = idx.searcher()?;
        let query = TermQuery::new(Term::from_field_text(idx.f_crn, crn), IndexRecordOption::Basic);
        let hits: HashSet<_> = searcher.search(&query, &DocSetCollector)?;
        let Some(addr) = hits.into_iter().next() else { return Ok(None) };
        let doc: TantivyDocument = searcher.doc(addr)?;
        let Some(raw) = doc.get_first(idx.f_body).and_then(|v| v.as_str()) else { return Ok(None) };
        let body: JsonValue = serde_json::from_str(raw).map_err(|e| IndexError::Backend(e.to_string()))?;
        Ok(Some(OffenderDetail::new(crn, body)))
    }

    fn delete_offender(&self, colour: SyncIndex, crn: &str) -> Result<(), IndexError> {
        let idx = self.physical(colour)?;
        idx.write(|writer| {
            writer.delete_term(Term::from_field_text(idx.f_crn, crn));
            Ok(())
        })
    }

    fn count(&self, colour: SyncIndex) -> Result<u64, IndexError> {
        let idx = self.physical(colour)?;
        Ok(idx.searcher()?.num_docs())
    }

    fn alias_target(&self) -> Option<SyncIndex> {
        match self.root.as_deref() {
            Some(root) => read_alias(root),
            None => self.alias.read().ok().and_then(|g| *g),
        }
    }

    fn switch_alias(&self, colour: SyncIndex) -> Result<(), IndexError> {
        if !self.index_exists(colour) {
            return Err(IndexError::Missing(colour));
        }
        self.persist_alias(colour)?;
        let mut guard = self.alias.write().map_err(|_| IndexError::Backend("alias poisoned".into()))?;
        *guard = Some(colour);
        info!(%colour, "alias switched");
        Ok(())
    }
}

fn colour_dir(root: &Path, colour: SyncIndex) -> Option<PathBuf> { colour.index_name().map(|n| root.join(n)) }

fn generation_file(root: &Path, colour: SyncIndex) -> PathBuf {
    root.join(format!("{}.generation", colour.index_name().unwrap_or("none")))
}

fn read_generation(root: &Path, colour: SyncIndex) -> Option<String> {
    fs::read_to_string(generation_file(root, colour)).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn new_generation() -> String {
    let now = chrono::Utc::now();
    format!("{}-{}", std::process::id(), now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp_micros()))
}

fn read_alias(root: &Path) -> Option<SyncIndex> {
    let raw = fs::read_to_string(root.join(ALIAS_FILE)).ok()?;
    SyncIndex::parse(raw.trim()).filter(|c| *c != SyncIndex::None)
}

fn remove_if_exists(path: &Path) -> Result<(), IndexError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn flatten_text(v: &JsonValue, out: &mut String) {
    match v {
        JsonValue::String(s) => {
            if !out.is_empty() { out.push(' '); }
            out.push_str(s);
        }
        JsonValue::Array(items) => items.iter().for_each(|i| flatten_text(i, out)),
        JsonValue::Object(map) => map.values().for_each(|i| flatten_text(i, out)),
        JsonValue::Number(n) => {
            if !out.is_empty() { out.push(' '); }
            out.push_str(&n.to_string());
        }
        JsonValue::Bool(_) | JsonValue::Null => {}
    }
}
