//! Prefix-based path rewriting, e.g. a Windows drive folder to a macOS volume.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::document::{DocumentStore, Record};
use crate::error::{CatalogError, Result};

fn normalize_separators(path: &str) -> String {
    path.replace('\\', "/")
}

#[derive(Debug, Clone, Default)]
pub struct PathRemapper {
    mappings: BTreeMap<String, String>,
    /// Mapping prefixes, longest first.
    ordered: Vec<String>,
}

/// One proposed rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemapEntry {
    pub old_path: String,
    pub new_path: String,
    pub exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RemapReport {
    pub remapped: usize,
    pub skipped_missing: usize,
    /// Entries rejected by the store, with the reason.
    pub conflicts: Vec<(String, String)>,
}

impl PathRemapper {
    pub fn new(mappings: impl IntoIterator<Item = (String, String)>) -> Self {
        let mut remapper = Self::default();
        for (from, to) in mappings {
            remapper.add_mapping(&from, &to);
        }
        remapper
    }

    pub fn add_mapping(&mut self, from_prefix: &str, to_prefix: &str) {
        self.mappings
            .insert(normalize_separators(from_prefix), to_prefix.to_string());
        self.reorder();
    }

    pub fn remove_mapping(&mut self, from_prefix: &str) -> bool {
        let removed = self.mappings.remove(&normalize_separators(from_prefix)).is_some();
        if removed {
            self.reorder();
        }
        removed
    }

    fn reorder(&mut self) {
        self.ordered = self.mappings.keys().cloned().collect();
        self.ordered.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    }

    pub fn mappings(&self) -> &BTreeMap<String, String> {
        &self.mappings
    }

    /// Rewrite `path` with the longest matching prefix, if any.
    pub fn remap_path(&self, path: &str) -> Option<String> {
        let normalized = normalize_separators(path);
        self.ordered.iter().find_map(|prefix| {
            let rest = normalized.strip_prefix(prefix.as_str())?;
            Some(format!("{}{rest}", self.mappings[prefix]))
        })
    }

    pub fn can_remap(&self, path: &str) -> bool {
        self.remap_path(path).is_some()
    }

    /// Proposed rewrites for every Windows-style record path that has a mapping.
    pub fn plan<'a>(&self, records: impl IntoIterator<Item = &'a Record>, verify_exists: bool) -> Vec<RemapEntry> {
        records
            .into_iter()
            .filter(|record| record.is_windows_path())
            .filter_map(|record| {
                let new_path = self.remap_path(&record.file_path)?;
                let exists = !verify_exists || Path::new(&new_path).exists();
                Some(RemapEntry {
                    old_path: record.file_path.clone(),
                    new_path,
                    exists,
                })
            })
            .collect()
    }

    /// Windows prefixes without a covering mapping.
    pub fn unmapped_prefixes<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<String> {
        detect_windows_prefixes(records)
            .into_keys()
            .filter(|prefix| {
                !self
                    .mappings
                    .keys()
                    .any(|mapped| prefix.starts_with(mapped.as_str()) || mapped.starts_with(prefix.as_str()))
            })
            .collect()
    }
}

/// Group Windows paths by drive plus first folder (`D:/Main/`), keeping
/// every original path as an example.
pub fn detect_windows_prefixes<'a>(records: impl IntoIterator<Item = &'a Record>) -> BTreeMap<String, Vec<String>> {
    let mut prefixes: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for record in records {
        if !record.is_windows_path() {
            continue;
        }
        let normalized = normalize_separators(&record.file_path);
        let mut parts = normalized.split('/');
        let drive = parts.next().unwrap_or_default();
        let prefix = match parts.next() {
            Some(folder) if !folder.is_empty() && parts.next().is_some() => format!("{drive}/{folder}/"),
            _ => format!("{drive}/"),
        };
        prefixes.entry(prefix).or_default().push(record.file_path.clone());
    }
    prefixes
}

/// Apply a plan to the catalog. Each record stays reachable under its old
/// key until its new key is committed.
pub fn apply_plan(store: &mut DocumentStore, plan: &[RemapEntry], skip_missing: bool) -> Result<RemapReport> {
    let mut report = RemapReport::default();
    for entry in plan {
        if skip_missing && !entry.exists {
            report.skipped_missing += 1;
            continue;
        }
        let staged = store
            .stage_remap(&entry.old_path, &entry.new_path)
            .and_then(|()| store.commit_rekey(&entry.old_path));
        match staged {
            Ok(_) => report.remapped += 1,
            Err(e @ CatalogError::NotLoaded) => return Err(e),
            Err(e) => {
                tracing::warn!(old = %entry.old_path, new = %entry.new_path, error = %e, "remap rejected");
                // Undo a staged rewrite whose rekey failed.
                if store.contains(&entry.old_path) {
                    let _ = store.stage_remap(&entry.old_path, &entry.old_path);
                }
                report.conflicts.push((entry.old_path.clone(), e.to_string()));
            }
        }
    }
    tracing::info!(
        remapped = report.remapped,
        skipped = report.skipped_missing,
        conflicts = report.conflicts.len(),
        "path remap applied"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn records(paths: &[&str]) -> Vec<Record> {
        paths.iter().map(|p| Record::new(*p)).collect()
    }

    #[test]
    fn longest_prefix_wins() {
        let remapper = PathRemapper::new([
            ("D:/".to_string(), "/Volumes/D/".to_string()),
            ("D:\\Main\\".to_string(), "/Volumes/Music/Main/".to_string()),
        ]);
        assert_eq!(
            remapper.remap_path("D:\\Main\\House\\a.mp3").as_deref(),
            Some("/Volumes/Music/Main/House/a.mp3")
        );
        assert_eq!(remapper.remap_path("D:/Other/b.mp3").as_deref(), Some("/Volumes/D/Other/b.mp3"));
        assert!(!remapper.can_remap("E:/c.mp3"));
    }

    #[test]
    fn removing_a_mapping_reorders() {
        let mut remapper = PathRemapper::new([
            ("D:/".to_string(), "/d/".to_string()),
            ("D:/Main/".to_string(), "/main/".to_string()),
        ]);
        assert!(remapper.remove_mapping("D:\\Main\\"));
        assert!(!remapper.remove_mapping("D:/Main/"));
        assert_eq!(remapper.remap_path("D:/Main/a.mp3").as_deref(), Some("/d/Main/a.mp3"));
    }

    #[test]
    fn detects_prefixes() {
        let recs = records(&[
            "D:\\Main\\a.mp3",
            "D:/Main/sub/b.mp3",
            "E:\\c.mp3",
            "/Users/me/d.mp3",
        ]);
        let prefixes = detect_windows_prefixes(&recs);
        assert_eq!(prefixes.len(), 2);
        assert_eq!(prefixes["D:/Main/"].len(), 2);
        assert_eq!(prefixes["E:/"], vec!["E:\\c.mp3".to_string()]);

        let remapper = PathRemapper::new([("D:/".to_string(), "/d/".to_string())]);
        assert_eq!(remapper.unmapped_prefixes(&recs), vec!["E:/".to_string()]);
    }

    #[test]
    fn plan_and_apply() {
        let dir = tempfile::tempdir().unwrap();
        let music = dir.path().join("Main");
        std::fs::create_dir_all(&music).unwrap();
        std::fs::write(music.join("a.mp3"), b"a").unwrap();
        let target = format!("{}/", music.to_string_lossy());

        let xml = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<VirtualDJ_Database Version=\"8\">\n\
<Song FilePath=\"D:\\Main\\a.mp3\" FileSize=\"1\" />\n\
<Song FilePath=\"D:\\Main\\missing.mp3\" FileSize=\"2\" />\n\
<Song FilePath=\"/Users/me/c.mp3\" FileSize=\"3\" />\n</VirtualDJ_Database>\n";
        let mut store = DocumentStore::from_xml(dir.path().join("database.xml"), xml).unwrap();
        let remapper = PathRemapper::new([("D:/Main/".to_string(), target.clone())]);

        let all: Vec<Record> = store.records().unwrap().collect();
        let plan = remapper.plan(&all, true);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().any(|e| e.old_path == "D:\\Main\\a.mp3" && e.exists));
        assert!(plan.iter().any(|e| e.old_path == "D:\\Main\\missing.mp3" && !e.exists));

        let report = apply_plan(&mut store, &plan, true).unwrap();
        assert_eq!(report.remapped, 1);
        assert_eq!(report.skipped_missing, 1);
        let new_key = format!("{target}a.mp3");
        assert!(store.contains(&new_key));
        assert!(!store.contains("D:\\Main\\a.mp3"));
        assert!(store.contains("D:\\Main\\missing.mp3"));
        assert_eq!(store.get_record(&new_key).unwrap().file_size, Some(1));
    }

    #[test]
    fn collisions_are_reported_and_left_alone() {
        let xml = "<VirtualDJ_Database Version=\"8\">\n<Song FilePath=\"D:/a.mp3\" />\n<Song FilePath=\"/m/a.mp3\" />\n</VirtualDJ_Database>\n";
        let mut store = DocumentStore::from_xml("database.xml", xml).unwrap();
        let plan = vec![RemapEntry {
            old_path: "D:/a.mp3".into(),
            new_path: "/m/a.mp3".into(),
            exists: true,
        }];
        let report = apply_plan(&mut store, &plan, false).unwrap();
        assert_eq!(report.remapped, 0);
        assert_eq!(report.conflicts.len(), 1);
        assert_eq!(store.get_record("D:/a.mp3").unwrap().file_path, "D:/a.mp3");
        assert_eq!(store.to_xml_string().unwrap(), xml);
    }
}
