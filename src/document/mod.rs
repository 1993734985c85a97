//! Indexed, lossless store for a VirtualDJ `database.xml`.
//!
//! Songs live in an arena (`Vec<Option<SongNode>>`) with a key -> slot map
//! beside it. Removal leaves a tombstone; the arena is compacted once
//! tombstones outnumber live nodes. Every single-record operation is a map
//! lookup plus work proportional to that record's size.

mod node;
mod parse;
mod record;

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

pub use record::{
    AUDIO_EXTENSIONS, CuePoint, FieldUpdate, FieldValue, Infos, MAX_HOT_CUES, PoiKind, Record,
    RecordField, Scan, Tags, parse_energy,
};

use crate::atomic::write_atomic;
use crate::error::{CatalogError, Result};
use node::{Attr, ChildNode, Layout, SongNode, poi_element};
use parse::{ParsedDocument, parse_document};

const COMPACT_MIN_TOMBSTONES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Copy only attributes this catalog lacks or has empty.
    FillMissing,
    /// The other catalog's values win on conflict.
    PreferOther,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub index_lookups: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStats {
    pub total: usize,
    pub local_files: usize,
    pub windows_paths: usize,
    /// Windows paths by upper-cased drive letter.
    pub windows_drives: BTreeMap<char, usize>,
    pub netsearch: usize,
    pub audio_files: usize,
    pub non_audio_files: usize,
    pub with_energy: usize,
    pub with_mood: usize,
    pub with_cue_points: usize,
    pub with_scan_bpm: usize,
    /// Only counted when existence checking was requested.
    pub missing_files: Option<usize>,
    pub by_extension: BTreeMap<String, usize>,
}

struct Document {
    bom: bool,
    preamble: String,
    root_name: String,
    root_self_closing: bool,
    nodes: Vec<Option<SongNode>>,
    index: HashMap<String, usize>,
    tombstones: usize,
    epilogue: String,
    layout: Layout,
}

impl From<ParsedDocument> for Document {
    fn from(parsed: ParsedDocument) -> Self {
        Self {
            bom: parsed.bom,
            preamble: parsed.preamble,
            root_name: parsed.root_name,
            root_self_closing: parsed.root_self_closing,
            nodes: parsed.nodes.into_iter().map(Some).collect(),
            index: parsed.index,
            tombstones: 0,
            epilogue: parsed.epilogue,
            layout: parsed.layout,
        }
    }
}

impl Document {
    fn slot(&self, key: &str) -> Result<usize> {
        self.index
            .get(key)
            .copied()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    fn node(&self, key: &str) -> Result<&SongNode> {
        let slot = self.slot(key)?;
        self.nodes[slot]
            .as_ref()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    fn node_mut(&mut self, key: &str) -> Result<&mut SongNode> {
        let slot = self.slot(key)?;
        self.nodes[slot]
            .as_mut()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))
    }

    fn live(&self) -> impl Iterator<Item = &SongNode> {
        self.nodes.iter().flatten()
    }

    fn insert(&mut self, node: SongNode) {
        self.index.insert(node.key.clone(), self.nodes.len());
        self.nodes.push(Some(node));
    }

    fn remove(&mut self, key: &str) -> Result<SongNode> {
        let slot = self.slot(key)?;
        let node = self.nodes[slot]
            .take()
            .ok_or_else(|| CatalogError::NotFound(key.to_string()))?;
        self.index.remove(key);
        self.tombstones += 1;

        // Comments or verbatim entries sitting before the removed song move
        // to whatever follows it.
        let carried = trim_trailing_indent(&node.lead);
        if !carried.trim().is_empty() {
            let next = self.nodes[slot + 1..].iter_mut().flatten().next();
            match next {
                Some(next) => next.lead.insert_str(0, carried),
                None => self.epilogue.insert_str(0, carried),
            }
        }

        if self.tombstones >= COMPACT_MIN_TOMBSTONES && self.tombstones * 2 > self.nodes.len() {
            self.compact();
        }
        Ok(node)
    }

    fn compact(&mut self) {
        self.nodes.retain(Option::is_some);
        self.index = self
            .nodes
            .iter()
            .enumerate()
            .filter_map(|(slot, node)| node.as_ref().map(|n| (n.key.clone(), slot)))
            .collect();
        self.tombstones = 0;
        tracing::debug!(live = self.index.len(), "compacted song arena");
    }

    fn render(&self) -> String {
        let mut out = String::with_capacity(
            self.preamble.len() + self.epilogue.len() + self.index.len() * 512,
        );
        if self.bom {
            out.push('\u{feff}');
        }
        let expand_root = self.root_self_closing && !self.index.is_empty();
        if expand_root {
            let open = self.preamble.strip_suffix("/>").unwrap_or(&self.preamble);
            out.push_str(open.trim_end());
            out.push('>');
        } else {
            out.push_str(&self.preamble);
        }
        for node in self.live() {
            node.render(&mut out);
        }
        if expand_root {
            out.push_str(self.layout.line_ending);
            out.push_str("</");
            out.push_str(&self.root_name);
            out.push('>');
        }
        out.push_str(&self.epilogue);
        out
    }
}

fn trim_trailing_indent(lead: &str) -> &str {
    let end = lead.trim_end().len();
    &lead[..end]
}

fn should_take(existing: Option<&Attr>, incoming: &Attr, strategy: MergeStrategy) -> bool {
    match existing {
        None => true,
        Some(current) if current.value().trim().is_empty() => !incoming.value().trim().is_empty(),
        Some(current) => strategy == MergeStrategy::PreferOther && current.value() != incoming.value(),
    }
}

/// Field-level merge of `source` into `target`. Returns whether anything changed.
fn merge_node(target: &mut SongNode, source: &SongNode, strategy: MergeStrategy, layout: &Layout) -> bool {
    let mut changed = false;
    for attr in &source.element.attrs {
        if attr.name == "FilePath" {
            continue;
        }
        if should_take(target.element.get(&attr.name), attr, strategy) {
            changed |= target.element.put(attr.clone());
        }
    }
    for child in &source.children {
        let name = child.element.name.as_str();
        if !matches!(name, "Tags" | "Infos" | "Scan") {
            continue;
        }
        for attr in &child.element.attrs {
            let existing = target.child(name).and_then(|c| c.element.get(&attr.name));
            if should_take(existing, attr, strategy) {
                let slot = target.ensure_child(name, layout);
                if slot.element.put(attr.clone()) {
                    slot.source = None;
                    changed = true;
                }
            }
        }
    }
    if !target.children.iter().any(|c| c.element.name == "Poi") {
        for poi in source.children.iter().filter(|c| c.element.name == "Poi") {
            let mut copy = poi.clone();
            copy.lead = layout.child_lead.clone();
            target.push_in_order(copy, layout);
            changed = true;
        }
    }
    if changed {
        target.source = None;
    }
    changed
}

fn is_cue_poi(child: &ChildNode) -> bool {
    child.element.name == "Poi"
        && child
            .element
            .value("Type")
            .is_none_or(|kind| kind == "cue")
}

/// Catalog file handle. Operations other than `load` fail with
/// `NotLoaded` until the file has been read.
pub struct DocumentStore {
    path: PathBuf,
    doc: Option<Document>,
    /// Staged remap target -> the key that claimed it.
    staged: HashMap<String, String>,
}

impl DocumentStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: None,
            staged: HashMap::new(),
        }
    }

    /// `new` followed by `load`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut store = Self::new(path);
        store.load()?;
        Ok(store)
    }

    /// Build a store from in-memory text; `path` is where `save(None)` writes.
    pub fn from_xml(path: impl Into<PathBuf>, text: &str) -> Result<Self> {
        Ok(Self {
            path: path.into(),
            doc: Some(parse_document(text)?.into()),
            staged: HashMap::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.doc.is_some()
    }

    fn doc(&self) -> Result<&Document> {
        self.doc.as_ref().ok_or(CatalogError::NotLoaded)
    }

    fn doc_mut(&mut self) -> Result<&mut Document> {
        self.doc.as_mut().ok_or(CatalogError::NotLoaded)
    }

    /// Read and index the catalog, replacing any previously loaded state.
    pub fn load(&mut self) -> Result<()> {
        let bytes = fs::read(&self.path).map_err(|e| CatalogError::from_io(&self.path, e))?;
        let text = String::from_utf8(bytes).map_err(|e| {
            CatalogError::corrupt(
                "catalog document",
                format!("{} is not UTF-8: {e}", self.path.display()),
            )
        })?;
        let parsed = parse_document(&text)?;
        tracing::info!(
            path = %self.path.display(),
            songs = parsed.nodes.len(),
            skipped = parsed.skipped,
            "loaded catalog"
        );
        self.doc = Some(parsed.into());
        self.staged.clear();
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.doc.as_ref().map_or(0, |d| d.index.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.doc.as_ref().is_some_and(|d| d.index.contains_key(key))
    }

    pub fn get_record(&self, key: &str) -> Result<Record> {
        Ok(self.doc()?.node(key)?.to_record())
    }

    /// Record keys in document order.
    pub fn keys(&self) -> Result<impl Iterator<Item = &str>> {
        Ok(self.doc()?.live().map(|n| n.key.as_str()))
    }

    /// Typed views of every record in document order. Walks the whole catalog.
    pub fn records(&self) -> Result<impl Iterator<Item = Record> + '_> {
        Ok(self.doc()?.live().map(SongNode::to_record))
    }

    /// Merge `update` into one record. Nothing is written if any value is invalid.
    pub fn update_fields(&mut self, key: &str, update: &FieldUpdate) -> Result<()> {
        let doc = self.doc_mut()?;
        doc.slot(key)?;
        let rendered = update
            .iter()
            .map(|(field, value)| Ok((*field, field.render(value)?)))
            .collect::<Result<Vec<_>>>()?;
        let layout = doc.layout.clone();
        let node = doc.node_mut(key)?;
        for (field, value) in rendered {
            node.write_field(field, value.as_deref(), &layout);
        }
        Ok(())
    }

    /// Replace the record's hot cues, keeping beatgrid, loop, and other POIs.
    /// Cues past `MAX_HOT_CUES` are dropped.
    pub fn set_cue_points(&mut self, key: &str, cues: &[CuePoint]) -> Result<()> {
        for cue in cues {
            if cue.kind != PoiKind::Cue {
                return Err(CatalogError::ValidationFailed(format!(
                    "{} point passed as a hot cue",
                    cue.kind.as_str()
                )));
            }
            if !cue.pos.is_finite() || cue.pos < 0.0 {
                return Err(CatalogError::ValidationFailed(format!(
                    "cue position {} is not a valid time",
                    cue.pos
                )));
            }
        }
        if cues.len() > MAX_HOT_CUES {
            tracing::warn!(key, given = cues.len(), "keeping the first {MAX_HOT_CUES} hot cues");
        }

        let doc = self.doc_mut()?;
        let layout = doc.layout.clone();
        let node = doc.node_mut(key)?;
        node.remove_children(|c| !is_cue_poi(c));
        for (i, cue) in cues.iter().take(MAX_HOT_CUES).enumerate() {
            let mut cue = cue.clone();
            cue.num = cue.num.or(Some(i as u32 + 1));
            node.push_in_order(ChildNode::new(&layout.child_lead, poi_element(&cue)), &layout);
        }
        node.source = None;
        Ok(())
    }

    pub fn add_record(&mut self, record: &Record) -> Result<()> {
        if record.file_path.is_empty() {
            return Err(CatalogError::ValidationFailed("record has no file path".into()));
        }
        for field in RecordField::ALL {
            if let Some(text) = record.field_text(*field) {
                field.render(&FieldValue::Text(text))?;
            }
        }
        let doc = self.doc_mut()?;
        if doc.index.contains_key(&record.file_path) {
            return Err(CatalogError::ValidationFailed(format!(
                "{} is already in the catalog",
                record.file_path
            )));
        }
        let node = SongNode::from_record(record, &doc.layout);
        doc.insert(node);
        Ok(())
    }

    /// Remove a record and return its last view.
    pub fn remove_record(&mut self, key: &str) -> Result<Record> {
        Ok(self.doc_mut()?.remove(key)?.to_record())
    }

    /// Rewrite the stored path without touching the index; `key` stays valid.
    /// A target already in the catalog or staged by another key is rejected.
    pub fn stage_remap(&mut self, key: &str, new_path: &str) -> Result<()> {
        if new_path.is_empty() {
            return Err(CatalogError::ValidationFailed("empty remap target".into()));
        }
        if let Some(owner) = self.staged.get(new_path).filter(|owner| *owner != key) {
            return Err(CatalogError::ValidationFailed(format!(
                "{new_path} is already staged for {owner}"
            )));
        }
        let doc = self.doc.as_mut().ok_or(CatalogError::NotLoaded)?;
        if new_path != key && doc.index.contains_key(new_path) {
            return Err(CatalogError::ValidationFailed(format!(
                "{new_path} is already in the catalog"
            )));
        }
        let node = doc.node_mut(key)?;
        if node.element.set("FilePath", new_path) {
            node.source = None;
        }
        self.staged.retain(|_, owner| owner != key);
        if new_path != key {
            self.staged.insert(new_path.to_string(), key.to_string());
        }
        Ok(())
    }

    /// Move the index entry for `key` to the node's stored path.
    /// Returns the key the record is now reachable under.
    pub fn commit_rekey(&mut self, key: &str) -> Result<String> {
        let doc = self.doc.as_mut().ok_or(CatalogError::NotLoaded)?;
        let slot = doc.slot(key)?;
        let new_key = doc.node(key)?.file_path().map(|p| p.into_owned()).unwrap_or_default();
        if new_key == key {
            return Ok(new_key);
        }
        if doc.index.contains_key(&new_key) {
            return Err(CatalogError::ValidationFailed(format!(
                "{new_key} is already in the catalog"
            )));
        }
        // Both keys resolve until the old one is dropped.
        doc.index.insert(new_key.clone(), slot);
        if let Some(node) = doc.nodes[slot].as_mut() {
            node.key = new_key.clone();
        }
        doc.index.remove(key);
        self.staged.remove(&new_key);
        Ok(new_key)
    }

    pub fn remap_path(&mut self, old: &str, new: &str) -> Result<()> {
        self.stage_remap(old, new)?;
        self.commit_rekey(old)?;
        Ok(())
    }

    /// Fold `other` into this catalog: existing keys are merged field by
    /// field, new keys get a copy of `other`'s node.
    pub fn merge_from(&mut self, other: &DocumentStore, strategy: MergeStrategy) -> Result<MergeStats> {
        let source = other.doc()?;
        let doc = self.doc_mut()?;
        let relayout = source.layout != doc.layout;
        let mut stats = MergeStats::default();

        for incoming in source.live() {
            stats.index_lookups += 1;
            match doc.index.get(&incoming.key).copied() {
                Some(slot) => {
                    let layout = &doc.layout;
                    let changed = match doc.nodes[slot].as_mut() {
                        Some(target) => merge_node(target, incoming, strategy, layout),
                        None => false,
                    };
                    if changed {
                        stats.updated += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
                None => {
                    let mut copy = incoming.clone();
                    if relayout {
                        copy.relayout(&doc.layout);
                    } else {
                        copy.lead = doc.layout.song_lead.clone();
                    }
                    doc.insert(copy);
                    stats.added += 1;
                }
            }
        }
        tracing::info!(
            added = stats.added,
            updated = stats.updated,
            skipped = stats.skipped,
            "merged {}",
            other.path.display()
        );
        Ok(stats)
    }

    /// Whole-catalog report. This walks every record (and stats every local
    /// file when `check_existence` is set), unlike the per-record operations.
    pub fn stats(&self, check_existence: bool) -> Result<CatalogStats> {
        let doc = self.doc()?;
        let mut stats = CatalogStats {
            total: doc.index.len(),
            missing_files: check_existence.then_some(0),
            ..CatalogStats::default()
        };
        for record in doc.live().map(SongNode::to_record) {
            if record.is_netsearch() {
                stats.netsearch += 1;
            } else if record.is_windows_path() {
                stats.windows_paths += 1;
                if let Some(drive) = record.file_path.chars().next() {
                    *stats.windows_drives.entry(drive.to_ascii_uppercase()).or_default() += 1;
                }
            } else {
                stats.local_files += 1;
                if let Some(missing) = stats.missing_files.as_mut()
                    && !Path::new(&record.file_path).exists()
                {
                    *missing += 1;
                }
            }
            if record.is_audio() {
                stats.audio_files += 1;
            } else if !record.is_netsearch() {
                stats.non_audio_files += 1;
            }
            let ext = record.extension();
            if !ext.is_empty() {
                *stats.by_extension.entry(ext).or_default() += 1;
            }
            if record.energy().is_some() {
                stats.with_energy += 1;
            }
            if record.mood().is_some() {
                stats.with_mood += 1;
            }
            if record.hot_cues().next().is_some() {
                stats.with_cue_points += 1;
            }
            if record.scan.bpm.is_some() {
                stats.with_scan_bpm += 1;
            }
        }
        Ok(stats)
    }

    /// Serialized catalog text.
    pub fn to_xml_string(&self) -> Result<String> {
        Ok(self.doc()?.render())
    }

    /// Atomically write the catalog to `path` (default: the loaded path).
    pub fn save(&self, path: Option<&Path>) -> Result<PathBuf> {
        let doc = self.doc()?;
        let target = path.unwrap_or(&self.path).to_path_buf();
        write_atomic(&target, doc.render().as_bytes())?;
        tracing::info!(path = %target.display(), songs = doc.index.len(), "saved catalog");
        Ok(target)
    }

    #[cfg(test)]
    fn assert_index_consistent(&self) {
        let doc = self.doc().unwrap();
        let live: Vec<_> = doc.nodes.iter().enumerate().filter(|(_, n)| n.is_some()).collect();
        assert_eq!(live.len(), doc.index.len());
        for (slot, node) in live {
            let node = node.as_ref().unwrap();
            assert_eq!(doc.index.get(&node.key), Some(&slot), "index drift for {}", node.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    const CATALOG: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\r\n\
<VirtualDJ_Database Version=\"2024\">\r\n \
<Song FilePath=\"/Music/a.mp3\" FileSize=\"1000\">\r\n  \
<Tags Author=\"Artist A\" Title=\"Song A\" Grouping=\"Energy 7\" User2=\"#Floor #happy\" />\r\n  \
<Infos SongLength=\"240.5\" Bitrate=\"320\" />\r\n  \
<Scan Bpm=\"0.5\" Key=\"Am\" Volume=\"1\" />\r\n  \
<Poi Pos=\"0.1\" Type=\"beatgrid\" />\r\n  \
<Poi Name=\"Drop\" Pos=\"64.25\" Num=\"1\" Type=\"cue\" />\r\n \
</Song>\r\n \
<Song FilePath=\"D:\\Music\\b.flac\" FileSize=\"2000\">\r\n  \
<Tags Author=\"B &amp; C\" Title='It&apos;s' />\r\n \
</Song>\r\n \
<Song FilePath=\"td123456://stream\" />\r\n\
</VirtualDJ_Database>\r\n";

    fn store_with(text: &str) -> (tempfile::TempDir, DocumentStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.xml");
        fs::write(&path, text).unwrap();
        let store = DocumentStore::open(&path).unwrap();
        (dir, store)
    }

    #[test]
    fn unmodified_round_trip_is_byte_identical() {
        let (dir, store) = store_with(CATALOG);
        let out = dir.path().join("out.xml");
        store.save(Some(&out)).unwrap();
        assert_eq!(fs::read(&out).unwrap(), CATALOG.as_bytes());
    }

    #[test]
    fn load_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = DocumentStore::open(dir.path().join("nope.xml")).err().unwrap();
        assert!(matches!(err, CatalogError::NotFound(_)));
    }

    #[test]
    fn non_utf8_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("database.xml");
        fs::write(&path, b"<R><Song FilePath=\"\xff\"/></R>").unwrap();
        assert!(matches!(DocumentStore::open(&path), Err(CatalogError::Corrupt { .. })));
    }

    #[test]
    fn operations_before_load_fail() {
        let mut store = DocumentStore::new("/tmp/never-read.xml");
        assert!(matches!(store.get_record("/a"), Err(CatalogError::NotLoaded)));
        assert!(matches!(store.save(None), Err(CatalogError::NotLoaded)));
        assert!(matches!(
            store.update_fields("/a", &FieldUpdate::new()),
            Err(CatalogError::NotLoaded)
        ));
    }

    #[test]
    fn typed_view_of_record() {
        let (_dir, store) = store_with(CATALOG);
        let a = store.get_record("/Music/a.mp3").unwrap();
        assert_eq!(a.file_size, Some(1000));
        assert_eq!(a.tags.author.as_deref(), Some("Artist A"));
        assert_eq!(a.energy(), Some(7));
        assert_eq!(a.mood(), Some("happy"));
        assert_eq!(a.infos.bitrate, Some(320));
        assert_eq!(a.actual_bpm(), Some(120.0));
        assert_eq!(a.cue_points.len(), 2);
        assert_eq!(a.hot_cues().count(), 1);

        let b = store.get_record("D:\\Music\\b.flac").unwrap();
        assert_eq!(b.tags.author.as_deref(), Some("B & C"));
        assert_eq!(b.tags.title.as_deref(), Some("It's"));
        assert!(matches!(store.get_record("/missing"), Err(CatalogError::NotFound(_))));
    }

    #[test]
    fn update_changes_only_the_edited_node() {
        let (_dir, mut store) = store_with(CATALOG);
        store
            .update_fields(
                "/Music/a.mp3",
                &FieldUpdate::new().energy(9).unwrap().set(RecordField::Comment, "Don't stop"),
            )
            .unwrap();
        let out = store.to_xml_string().unwrap();
        assert!(out.contains(
            "<Tags Author=\"Artist A\" Title=\"Song A\" Grouping=\"9\" User2=\"#Floor #happy\" Comment=\"Don&apos;t stop\" />"
        ));
        // Untouched songs keep their exact text.
        assert!(out.contains("<Tags Author=\"B &amp; C\" Title='It&apos;s' />\r\n </Song>"));
        assert_eq!(out.len(), CATALOG.len() - "Energy 7".len() + "9".len() + " Comment=\"Don&apos;t stop\"".len());

        let record = store.get_record("/Music/a.mp3").unwrap();
        assert_eq!(record.energy(), Some(9));
        assert_eq!(record.tags.comment.as_deref(), Some("Don't stop"));
    }

    #[test]
    fn clearing_removes_attribute() {
        let (_dir, mut store) = store_with(CATALOG);
        store
            .update_fields("/Music/a.mp3", &FieldUpdate::new().clear(RecordField::ScanKey))
            .unwrap();
        let out = store.to_xml_string().unwrap();
        assert!(out.contains("<Scan Bpm=\"0.5\" Volume=\"1\" />"));
        assert_eq!(store.get_record("/Music/a.mp3").unwrap().scan.key, None);
    }

    #[test]
    fn invalid_update_writes_nothing() {
        let (_dir, mut store) = store_with(CATALOG);
        let update = FieldUpdate::new()
            .set(RecordField::Title, "New")
            .set(RecordField::Rating, 9i64);
        let err = store.update_fields("/Music/a.mp3", &update).unwrap_err();
        assert!(matches!(err, CatalogError::ValidationFailed(_)));
        assert_eq!(store.to_xml_string().unwrap(), CATALOG);
    }

    #[test]
    fn update_creates_missing_child_element() {
        let (_dir, mut store) = store_with(CATALOG);
        store
            .update_fields("td123456://stream", &FieldUpdate::new().set(RecordField::Title, "Live"))
            .unwrap();
        let out = store.to_xml_string().unwrap();
        assert!(out.contains(
            " <Song FilePath=\"td123456://stream\">\r\n  <Tags Title=\"Live\" />\r\n </Song>\r\n</VirtualDJ_Database>"
        ));
    }

    #[test]
    fn add_and_remove_keep_index_consistent() {
        let (_dir, mut store) = store_with(CATALOG);
        let mut record = Record::new("/Music/new.mp3");
        record.tags.title = Some("New".into());
        record.scan.bpm = Some(0.4);
        store.add_record(&record).unwrap();
        assert!(store.add_record(&record).is_err());
        assert_eq!(store.len(), 4);
        store.assert_index_consistent();

        let removed = store.remove_record("D:\\Music\\b.flac").unwrap();
        assert_eq!(removed.tags.title.as_deref(), Some("It's"));
        assert!(!store.contains("D:\\Music\\b.flac"));
        assert!(matches!(store.remove_record("D:\\Music\\b.flac"), Err(CatalogError::NotFound(_))));
        store.assert_index_consistent();

        let out = store.to_xml_string().unwrap();
        assert!(out.contains("<Song FilePath=\"/Music/new.mp3\">\r\n  <Tags Title=\"New\" />\r\n  <Scan Bpm=\"0.4\" />\r\n </Song>"));
        assert!(!out.contains("b.flac"));
        let reloaded = DocumentStore::from_xml("/tmp/x.xml", &out).unwrap();
        assert_eq!(reloaded.get_record("/Music/new.mp3").unwrap().scan.bpm, Some(0.4));
    }

    #[test]
    fn removal_keeps_comments_before_the_song() {
        let text = "<R>\n <!-- first -->\n <Song FilePath=\"/a\"/>\n <Song FilePath=\"/b\"/>\n</R>";
        let mut store = DocumentStore::from_xml("/tmp/r.xml", text).unwrap();
        store.remove_record("/a").unwrap();
        assert_eq!(
            store.to_xml_string().unwrap(),
            "<R>\n <!-- first -->\n <Song FilePath=\"/b\"/>\n</R>"
        );
    }

    #[test]
    fn heavy_churn_compacts_and_stays_consistent() {
        let mut store = DocumentStore::from_xml("/tmp/c.xml", "<R>\n</R>").unwrap();
        for i in 0..5000 {
            store.add_record(&Record::new(format!("/m/{i}.mp3"))).unwrap();
        }
        for i in (0..5000).filter(|i| i % 5 != 0) {
            store.remove_record(&format!("/m/{i}.mp3")).unwrap();
        }
        store.assert_index_consistent();
        assert_eq!(store.len(), 1000);
        let doc = store.doc().unwrap();
        assert!(doc.nodes.len() < 5000, "arena was never compacted");
        assert_eq!(store.keys().unwrap().next(), Some("/m/0.mp3"));
    }

    #[test]
    fn single_record_ops_do_not_scale_with_catalog_size() {
        fn build(n: usize) -> DocumentStore {
            let mut text = String::from("<R>\n");
            for i in 0..n {
                text.push_str(&format!(" <Song FilePath=\"/m/{i}.mp3\"><Tags Title=\"t{i}\"/></Song>\n"));
            }
            text.push_str("</R>");
            DocumentStore::from_xml("/tmp/s.xml", &text).unwrap()
        }
        fn time_updates(store: &mut DocumentStore, n: usize) -> std::time::Duration {
            let start = Instant::now();
            for i in 0..2000 {
                let key = format!("/m/{}.mp3", (i * 7919) % n);
                store
                    .update_fields(&key, &FieldUpdate::new().set(RecordField::Comment, format!("c{i}")))
                    .unwrap();
                store.get_record(&key).unwrap();
            }
            start.elapsed()
        }
        let mut small = build(1_000);
        let mut large = build(50_000);
        let small_time = time_updates(&mut small, 1_000);
        let large_time = time_updates(&mut large, 50_000);
        // A linear scan would make the large catalog ~50x slower.
        assert!(
            large_time < small_time * 10 + std::time::Duration::from_millis(50),
            "small {small_time:?} large {large_time:?}"
        );
    }

    #[test]
    fn remap_keeps_old_key_until_commit() {
        let (_dir, mut store) = store_with(CATALOG);
        let old = "D:\\Music\\b.flac";
        let new = "/Volumes/Music/b.flac";
        store.stage_remap(old, new).unwrap();
        assert!(store.contains(old));
        assert!(!store.contains(new));
        assert_eq!(store.get_record(old).unwrap().file_path, new);

        assert_eq!(store.commit_rekey(old).unwrap(), new);
        assert!(!store.contains(old));
        assert_eq!(store.get_record(new).unwrap().tags.title.as_deref(), Some("It's"));
        store.assert_index_consistent();
    }

    #[test]
    fn remap_onto_existing_key_is_rejected() {
        let (_dir, mut store) = store_with(CATALOG);
        let err = store.remap_path("D:\\Music\\b.flac", "/Music/a.mp3").unwrap_err();
        assert!(matches!(err, CatalogError::ValidationFailed(_)));
        assert!(store.contains("D:\\Music\\b.flac"));
    }

    #[test]
    fn two_staged_remaps_cannot_share_a_target() {
        let (_dir, mut store) = store_with(CATALOG);
        let target = "/Volumes/Music/shared.mp3";
        store.stage_remap("D:\\Music\\b.flac", target).unwrap();
        let err = store.stage_remap("/Music/a.mp3", target).unwrap_err();
        assert!(matches!(err, CatalogError::ValidationFailed(_)));
        assert_eq!(store.get_record("/Music/a.mp3").unwrap().file_path, "/Music/a.mp3");

        // Restaging the first key elsewhere frees the target.
        store.stage_remap("D:\\Music\\b.flac", "/Volumes/Music/b.flac").unwrap();
        store.stage_remap("/Music/a.mp3", target).unwrap();
        assert_eq!(store.commit_rekey("/Music/a.mp3").unwrap(), target);
        assert_eq!(store.commit_rekey("D:\\Music\\b.flac").unwrap(), "/Volumes/Music/b.flac");
        store.assert_index_consistent();
    }

    #[test]
    fn set_cue_points_replaces_only_cues() {
        let (_dir, mut store) = store_with(CATALOG);
        let cues: Vec<_> = (1..=10).map(|n| CuePoint::cue(n, n as f64 * 10.0, format!("C{n}"))).collect();
        store.set_cue_points("/Music/a.mp3", &cues).unwrap();
        let record = store.get_record("/Music/a.mp3").unwrap();
        assert_eq!(record.hot_cues().count(), MAX_HOT_CUES);
        assert!(record.cue_points.iter().any(|p| p.kind == PoiKind::Beatgrid));
        assert!(!record.hot_cues().any(|c| c.name.as_deref() == Some("Drop")));

        let mut loop_point = CuePoint::cue(1, 1.0, "x");
        loop_point.kind = PoiKind::Loop;
        assert!(store.set_cue_points("/Music/a.mp3", &[loop_point]).is_err());
    }

    fn other_catalog() -> DocumentStore {
        let text = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<VirtualDJ_Database Version=\"2024\">\n\
 <Song FilePath=\"/Music/a.mp3\" FileSize=\"1000\">\n  <Tags Author=\"Other A\" Genre=\"House\" />\n </Song>\n\
 <Song FilePath=\"/Music/c.mp3\">\n  <Tags Title=\"Song C\" />\n  <Poi Pos=\"3\" Type=\"cue\" Num=\"1\" />\n </Song>\n\
</VirtualDJ_Database>\n";
        DocumentStore::from_xml("/tmp/other.xml", text).unwrap()
    }

    #[test]
    fn merge_fill_missing_adds_and_fills() {
        let (_dir, mut store) = store_with(CATALOG);
        let stats = store.merge_from(&other_catalog(), MergeStrategy::FillMissing).unwrap();
        assert_eq!(stats, MergeStats { added: 1, updated: 1, skipped: 0, index_lookups: 2 });

        let a = store.get_record("/Music/a.mp3").unwrap();
        assert_eq!(a.tags.author.as_deref(), Some("Artist A"));
        assert_eq!(a.tags.genre.as_deref(), Some("House"));

        // The copied node adopts this catalog's CRLF layout.
        let out = store.to_xml_string().unwrap();
        assert!(out.contains(" <Song FilePath=\"/Music/c.mp3\">\r\n  <Tags Title=\"Song C\" />\r\n  <Poi Pos=\"3\" Type=\"cue\" Num=\"1\" />\r\n </Song>\r\n</VirtualDJ_Database>"));
        store.assert_index_consistent();
    }

    #[test]
    fn merge_prefer_other_overwrites() {
        let (_dir, mut store) = store_with(CATALOG);
        store.merge_from(&other_catalog(), MergeStrategy::PreferOther).unwrap();
        let a = store.get_record("/Music/a.mp3").unwrap();
        assert_eq!(a.tags.author.as_deref(), Some("Other A"));
        assert_eq!(a.tags.title.as_deref(), Some("Song A"));

        let again = store.merge_from(&other_catalog(), MergeStrategy::PreferOther).unwrap();
        assert_eq!(again.updated, 0);
        assert_eq!(again.skipped, 2);
    }

    #[test]
    fn merge_lookups_follow_the_incoming_catalog() {
        let mut text = String::from("<VirtualDJ_Database Version=\"2024\">\n");
        for i in 0..20_000 {
            text.push_str(&format!(" <Song FilePath=\"/m/{i}.mp3\">\n  <Infos Bitrate=\"320\" />\n </Song>\n"));
        }
        text.push_str("</VirtualDJ_Database>\n");
        let mut large = DocumentStore::from_xml("/tmp/large.xml", &text).unwrap();
        let other = DocumentStore::from_xml(
            "/tmp/three.xml",
            "<VirtualDJ_Database Version=\"2024\">\n <Song FilePath=\"/m/7.mp3\">\n  <Tags Title=\"Seven\" />\n </Song>\n \
<Song FilePath=\"/new/a.mp3\" />\n <Song FilePath=\"/new/b.mp3\" />\n</VirtualDJ_Database>\n",
        )
        .unwrap();

        let stats = large.merge_from(&other, MergeStrategy::FillMissing).unwrap();
        assert_eq!(stats.index_lookups, 3);
        assert_eq!(stats.added, 2);
        assert_eq!(stats.updated, 1);
        assert_eq!(large.len(), 20_002);
        assert_eq!(large.get_record("/m/7.mp3").unwrap().tags.title.as_deref(), Some("Seven"));
    }

    #[test]
    fn stats_counts_categories() {
        let (_dir, store) = store_with(CATALOG);
        let stats = store.stats(true).unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.netsearch, 1);
        assert_eq!(stats.windows_paths, 1);
        assert_eq!(stats.windows_drives.get(&'D'), Some(&1));
        assert_eq!(stats.local_files, 1);
        assert_eq!(stats.missing_files, Some(1));
        assert_eq!(stats.audio_files, 2);
        assert_eq!(stats.with_energy, 1);
        assert_eq!(stats.with_cue_points, 1);
        assert_eq!(store.stats(false).unwrap().missing_files, None);
    }

    #[test]
    fn self_closing_root_expands_when_records_added() {
        let mut store =
            DocumentStore::from_xml("/tmp/e.xml", "<?xml version=\"1.0\"?>\n<VirtualDJ_Database Version=\"8\" />\n").unwrap();
        assert_eq!(store.to_xml_string().unwrap(), "<?xml version=\"1.0\"?>\n<VirtualDJ_Database Version=\"8\" />\n");
        store.add_record(&Record::new("/a.mp3")).unwrap();
        assert_eq!(
            store.to_xml_string().unwrap(),
            "<?xml version=\"1.0\"?>\n<VirtualDJ_Database Version=\"8\">\n <Song FilePath=\"/a.mp3\" />\n</VirtualDJ_Database>\n"
        );
    }

    #[test]
    fn save_defaults_to_loaded_path() {
        let (dir, mut store) = store_with(CATALOG);
        store
            .update_fields("/Music/a.mp3", &FieldUpdate::new().set(RecordField::Rating, 5u32))
            .unwrap();
        let written = store.save(None).unwrap();
        assert_eq!(written, dir.path().join("database.xml"));
        let reloaded = DocumentStore::open(&written).unwrap();
        assert_eq!(reloaded.get_record("/Music/a.mp3").unwrap().tags.rating, Some(5));
        assert!(!dir.path().join("database.xml.tmp").exists());
    }
}
