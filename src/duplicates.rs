//! Duplicate detection across catalog records.
//!
//! Content matching is staged: records are grouped by `FileSize`, then by
//! a SHA-256 of the first MiB, and only ambiguous groups (three or more
//! members) are confirmed with a full-file hash.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::document::Record;

pub const PARTIAL_HASH_BYTES: u64 = 1024 * 1024;
const HASH_CHUNK: usize = 64 * 1024;

/// Hex SHA-256 of the whole file, or `None` if it cannot be read.
pub fn file_hash(path: &Path) -> Option<String> {
    let mut file = File::open(path).ok()?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    loop {
        let read = file.read(&mut buffer).ok()?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Some(format!("{:x}", hasher.finalize()))
}

/// Hex SHA-256 of at most the first `limit` bytes.
pub fn partial_hash(path: &Path, limit: u64) -> Option<String> {
    let file = File::open(path).ok()?;
    let mut data = Vec::new();
    file.take(limit).read_to_end(&mut data).ok()?;
    Some(format!("{:x}", Sha256::digest(&data)))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateSummary {
    pub metadata_groups: usize,
    pub filename_groups: usize,
    /// Records beyond the first in every content group.
    pub exact_duplicates: usize,
    pub partial_hashes: usize,
    pub full_hashes: usize,
}

/// Content groups plus how many files had to be hashed to find them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentScan {
    pub groups: Vec<Vec<String>>,
    pub partial_hashes: usize,
    pub full_hashes: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DuplicateReport {
    pub by_metadata: BTreeMap<String, Vec<String>>,
    pub by_filename: BTreeMap<String, Vec<String>>,
    pub by_content: Vec<Vec<String>>,
    pub summary: DuplicateSummary,
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateDetector {
    /// Confirm partial-hash groups of three or more with a full hash.
    pub verify_full: bool,
    pub partial_bytes: u64,
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self {
            verify_full: true,
            partial_bytes: PARTIAL_HASH_BYTES,
        }
    }
}

fn keep_groups<K: Ord>(groups: BTreeMap<K, Vec<String>>) -> BTreeMap<K, Vec<String>> {
    groups.into_iter().filter(|(_, paths)| paths.len() > 1).collect()
}

impl DuplicateDetector {
    /// Same author and title, case-insensitive.
    pub fn by_metadata<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            let (Some(author), Some(title)) = (&record.tags.author, &record.tags.title) else {
                continue;
            };
            let key = format!("{}|{}", author.trim().to_lowercase(), title.trim().to_lowercase());
            groups.entry(key).or_default().push(record.file_path.clone());
        }
        keep_groups(groups)
    }

    /// Same file name regardless of folder, case-insensitive.
    pub fn by_filename<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> BTreeMap<String, Vec<String>> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in records {
            let normalized = record.file_path.replace('\\', "/");
            let name = normalized.rsplit('/').next().unwrap_or_default().to_lowercase();
            if name.is_empty() {
                continue;
            }
            groups.entry(name).or_default().push(record.file_path.clone());
        }
        keep_groups(groups)
    }

    /// Byte-identical local files. Windows and streaming paths are skipped.
    pub fn by_content<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<Vec<String>> {
        self.scan_content(records).groups
    }

    pub fn scan_content<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> ContentScan {
        let mut scan = ContentScan::default();
        let mut by_size: BTreeMap<u64, Vec<String>> = BTreeMap::new();
        for record in records {
            if record.is_windows_path() || record.is_netsearch() {
                continue;
            }
            if let Some(size) = record.file_size.filter(|size| *size > 0) {
                by_size.entry(size).or_default().push(record.file_path.clone());
            }
        }

        for (size, paths) in keep_groups(by_size) {
            let mut by_partial: BTreeMap<String, Vec<String>> = BTreeMap::new();
            for path in paths {
                scan.partial_hashes += 1;
                if let Some(hash) = partial_hash(Path::new(&path), self.partial_bytes) {
                    by_partial.entry(hash).or_default().push(path);
                }
            }
            for (_, group) in keep_groups(by_partial) {
                // A pair matching on size and the leading MiB is taken as identical.
                if self.verify_full && group.len() > 2 && size > self.partial_bytes {
                    let mut by_full: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for path in group {
                        scan.full_hashes += 1;
                        if let Some(hash) = file_hash(Path::new(&path)) {
                            by_full.entry(hash).or_default().push(path);
                        }
                    }
                    scan.groups.extend(keep_groups(by_full).into_values());
                } else {
                    scan.groups.push(group);
                }
            }
        }
        tracing::debug!(
            groups = scan.groups.len(),
            partial = scan.partial_hashes,
            full = scan.full_hashes,
            "content duplicate scan finished"
        );
        scan
    }

    /// Metadata and filename groups always; content groups when `include_content`.
    pub fn find_all(&self, records: &[Record], include_content: bool) -> DuplicateReport {
        let by_metadata = self.by_metadata(records);
        let by_filename = self.by_filename(records);
        let scan = if include_content {
            self.scan_content(records)
        } else {
            ContentScan::default()
        };
        let summary = DuplicateSummary {
            metadata_groups: by_metadata.len(),
            filename_groups: by_filename.len(),
            exact_duplicates: scan.groups.iter().map(|group| group.len() - 1).sum(),
            partial_hashes: scan.partial_hashes,
            full_hashes: scan.full_hashes,
        };
        let by_content = scan.groups;
        DuplicateReport {
            by_metadata,
            by_filename,
            by_content,
            summary,
        }
    }
}

/// For each group keep the best copy and return the rest. Preference:
/// file exists, then lives under `/Users/` (or not, with `prefer_local`
/// off), then has an author tag.
pub fn suggest_removals(groups: &[Vec<&Record>], prefer_local: bool) -> Vec<String> {
    let mut remove = Vec::new();
    for group in groups.iter().filter(|group| group.len() > 1) {
        let mut ranked: Vec<&Record> = group.clone();
        ranked.sort_by_key(|record| {
            let exists = !record.is_windows_path() && Path::new(&record.file_path).exists();
            let local = record.file_path.starts_with("/Users/");
            let tagged = record.tags.author.is_some();
            (!exists, local != prefer_local, !tagged)
        });
        remove.extend(ranked.iter().skip(1).map(|record| record.file_path.clone()));
    }
    remove
}
