//! Storage layer for loglens: chunk files, the manifest that indexes them, and range reads.
//!
//! A dataset directory holds `chunk-NNNNNN.jsonl` files plus one `manifest.json`. Read in
//! manifest order, the chunks form a single newest-first stream; the pager turns that physical
//! order into the ascending logical order clients see.

use std::path::Path;

use tracing::warn;

use crate::loglens_core::LogRecord;

mod chunks;
mod jsonl;
mod manifest;
mod window;

pub use chunks::ChunkStore;
pub use manifest::{ChunkEntry, Manifest};
pub use window::{LineRange, ReadOptions, WindowReader};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const CHUNK_PREFIX: &str = "chunk-";
pub const CHUNK_EXT: &str = "jsonl";
pub const DEFAULT_CHUNK_MAX_LINES: usize = 5_000;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt record in {file} at line {line}")]
    CorruptLine { file: String, line: u64 },
    #[error("invalid range {from}..{to}")]
    InvalidRange { from: u64, to: u64 },
    #[error("chunk {file} starts at {start}, expected {expected}")]
    Discontiguous { file: String, start: u64, expected: u64 },
}

/// A chunk file as reported by [`ChunkStore`]: its name, its line count after the last
/// write, and the physical offset of its first line within the store's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub file: String,
    pub lines: u64,
    pub start: u64,
}

/// A [`ChunkStore`] paired with the [`Manifest`] of the same directory. Every write updates
/// and saves the manifest before returning.
pub struct DatasetWriter {
    store: ChunkStore,
    manifest: Manifest,
}

impl DatasetWriter {
    pub fn create(dir: impl AsRef<Path>, max_lines: usize) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        let manifest = Manifest::load_or_create(dir)?;
        let first_seq = manifest
            .chunks()
            .iter()
            .filter_map(|chunk| chunks::chunk_seq(&chunk.file))
            .max()
            .map_or(0, |seq| seq + 1);
        let store = ChunkStore::new(dir, max_lines, first_seq, manifest.merged_lines())?;
        Ok(Self { store, manifest })
    }

    /// Appends records that are older than everything written so far (merge output).
    pub fn append_older(&mut self, records: &[LogRecord]) -> Result<Vec<ChunkDescriptor>, StorageError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let touched = self.store.append_batch(records)?;
        for chunk in &touched {
            self.manifest.add_chunk(&chunk.file, chunk.lines, chunk.start)?;
        }
        self.manifest.save()?;
        Ok(touched)
    }

    /// Writes newest-first `records` that are newer than everything written so far (live
    /// tail). The newest chunk is topped up to `max_lines` first, then the rest goes into new
    /// chunks at the newest end, so steady small pulses do not leave one file each.
    ///
    /// A topped-up chunk is rewritten under a new name and the manifest switched over before
    /// the old file is removed; readers of either snapshot see consistent files.
    pub fn prepend_newest(&mut self, records: &[LogRecord]) -> Result<Vec<ChunkDescriptor>, StorageError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(sealed) = self.store.flush_remainder()? {
            self.manifest.add_chunk(&sealed.file, sealed.lines, sealed.start)?;
        }

        let max_lines = self.store.max_lines();
        let head = self.manifest.chunks().first().cloned();
        let room = head.as_ref().map_or(0, |head| max_lines.saturating_sub(head.lines));
        let split = records.len() - records.len().min(room as usize);
        let (newer, top_up) = records.split_at(split);

        let mut touched = Vec::new();
        let mut replaced = None;
        if let Some(head) = head.filter(|_| !top_up.is_empty()) {
            let grown = self.store.write_with_prefix(&head.file, head.lines, top_up)?;
            replaced = self.manifest.replace_newest(&grown.file, grown.lines);
            touched.push(grown);
        }

        // Full chunks at the old side, the partial one newest, so the next pulse tops it up.
        let mut fresh = Vec::new();
        let mut end = newer.len();
        while end > 0 {
            let start = end.saturating_sub(max_lines as usize);
            fresh.push(self.store.write_sealed(&newer[start..end])?);
            end = start;
        }
        fresh.reverse();
        self.manifest.insert_newest(&fresh);
        fresh.append(&mut touched);
        self.manifest.save()?;

        if let Some(previous) = replaced {
            if let Err(err) = std::fs::remove_file(self.manifest.dir().join(&previous)) {
                warn!(file = %previous, error = %err, "failed to remove replaced chunk");
            }
        }
        Ok(fresh)
    }

    pub fn set_total(&mut self, total: u64) {
        self.manifest.set_total(total);
    }

    /// Seals the open chunk, records it, and saves the manifest.
    pub fn finish(&mut self) -> Result<Option<ChunkDescriptor>, StorageError> {
        let sealed = self.store.flush_remainder()?;
        if let Some(chunk) = &sealed {
            self.manifest.add_chunk(&chunk.file, chunk.lines, chunk.start)?;
        }
        self.manifest.save()?;
        Ok(sealed)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn records(ids: std::ops::Range<u64>) -> Vec<LogRecord> {
        ids.map(|id| LogRecord::from_line(id, "src", format!("line {id}"), Some(id))).collect()
    }

    #[test]
    fn append_older_saves_manifest_after_every_write() {
        let dir = TempDir::new().expect("temp dir");
        let mut writer = DatasetWriter::create(dir.path(), 4).expect("writer");

        writer.append_older(&records(0..6)).expect("append");
        let on_disk = Manifest::load_or_create(dir.path()).expect("reload");
        assert_eq!(on_disk.merged_lines(), 6);
        assert_eq!(on_disk.chunk_count(), 2);

        writer.append_older(&records(6..7)).expect("append more");
        let on_disk = Manifest::load_or_create(dir.path()).expect("reload");
        assert_eq!(on_disk.merged_lines(), 7);
        assert_eq!(on_disk.chunk_count(), 2);
    }

    #[test]
    fn reopened_writer_continues_after_existing_chunks() {
        let dir = TempDir::new().expect("temp dir");
        {
            let mut writer = DatasetWriter::create(dir.path(), 4).expect("writer");
            writer.append_older(&records(0..5)).expect("append");
            writer.finish().expect("finish");
        }

        let mut writer = DatasetWriter::create(dir.path(), 4).expect("reopen");
        writer.append_older(&records(5..7)).expect("append");
        let files: Vec<&str> =
            writer.manifest().chunks().iter().map(|chunk| chunk.file.as_str()).collect();
        assert_eq!(files, vec!["chunk-000000.jsonl", "chunk-000001.jsonl", "chunk-000002.jsonl"]);
        assert_eq!(writer.manifest().merged_lines(), 7);
    }

    fn newest_first(ids: std::ops::Range<u64>) -> Vec<LogRecord> {
        let mut batch = records(ids);
        batch.reverse();
        batch
    }

    fn chunk_ids(dir: &Path, file: &str) -> Vec<u64> {
        std::fs::read_to_string(dir.join(file))
            .expect("read chunk")
            .lines()
            .map(|line| jsonl::decode_record(line.as_bytes()).expect("decode").id)
            .collect()
    }

    #[test]
    fn small_pulses_fill_one_chunk_instead_of_one_file_each() {
        let dir = TempDir::new().expect("temp dir");
        let mut writer = DatasetWriter::create(dir.path(), 100).expect("writer");

        for pulse in 0..20u64 {
            writer.prepend_newest(&newest_first(pulse * 3..pulse * 3 + 3)).expect("pulse");
        }

        let manifest = writer.manifest();
        assert_eq!(manifest.chunk_count(), 1);
        assert_eq!(manifest.merged_lines(), 60);
        let head = &manifest.chunks()[0].file;
        assert_eq!(chunk_ids(dir.path(), head), (0..60).rev().collect::<Vec<u64>>());

        let jsonl_files = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".jsonl"))
            .count();
        assert_eq!(jsonl_files, 1);
        assert!(writer.finish().expect("finish").is_none());
    }

    #[test]
    fn prepend_newest_tops_up_the_head_before_opening_new_chunks() {
        let dir = TempDir::new().expect("temp dir");
        let mut writer = DatasetWriter::create(dir.path(), 4).expect("writer");

        writer.prepend_newest(&newest_first(0..3)).expect("first pulse");
        writer.prepend_newest(&newest_first(3..5)).expect("second pulse");
        writer.prepend_newest(&newest_first(5..11)).expect("third pulse");

        let manifest = Manifest::load_or_create(dir.path()).expect("reload");
        let lines: Vec<u64> = manifest.chunks().iter().map(|chunk| chunk.lines).collect();
        assert_eq!(lines, vec![3, 4, 4]);
        assert_eq!(manifest.merged_lines(), 11);

        let stream: Vec<u64> =
            manifest.chunks().iter().flat_map(|chunk| chunk_ids(dir.path(), &chunk.file)).collect();
        assert_eq!(stream, (0..11).rev().collect::<Vec<u64>>());
    }
}
