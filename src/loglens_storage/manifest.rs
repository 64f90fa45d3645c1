use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{ChunkDescriptor, StorageError, MANIFEST_FILE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub file: String,
    pub lines: u64,
    pub start: u64,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    chunk_count: usize,
    chunks: Vec<ChunkEntry>,
    merged_lines: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    total_lines: Option<u64>,
}

/// Index of the chunk files of one dataset, newest records first.
///
/// `chunks[i].start` is always the sum of the line counts before it, and `merged_lines` the
/// sum of all of them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    dir: PathBuf,
    path: PathBuf,
    chunks: Vec<ChunkEntry>,
    merged_lines: u64,
    total_lines: Option<u64>,
}

impl Manifest {
    /// Opens the manifest in `dir`, creating the directory and a zero-chunk manifest when
    /// either is missing.
    pub fn load_or_create(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        let path = dir.join(MANIFEST_FILE);

        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let manifest =
                    Self { dir, path, chunks: Vec::new(), merged_lines: 0, total_lines: None };
                manifest.save()?;
                return Ok(manifest);
            }
            Err(err) => return Err(err.into()),
        };

        let document: ManifestDocument = serde_json::from_slice(&contents)?;
        if document.chunk_count != document.chunks.len() {
            warn!(
                path = %path.display(),
                declared = document.chunk_count,
                actual = document.chunks.len(),
                "manifest chunk count disagrees with chunk list"
            );
        }
        let mut manifest = Self {
            dir,
            path,
            chunks: document.chunks,
            merged_lines: document.merged_lines,
            total_lines: document.total_lines,
        };
        if !manifest.is_consistent() {
            warn!(path = %manifest.path.display(), "manifest offsets inconsistent, recomputing");
            manifest.reindex();
        }
        Ok(manifest)
    }

    /// Records a chunk written at the old end of the dataset. Repeating the last chunk's file
    /// updates its line count, so a file that grew across writes keeps a single entry.
    pub fn add_chunk(&mut self, file: &str, lines: u64, start: u64) -> Result<(), StorageError> {
        if let Some(last) = self.chunks.last_mut() {
            if last.file == file {
                if last.start != start {
                    return Err(StorageError::Discontiguous {
                        file: file.to_string(),
                        start,
                        expected: last.start,
                    });
                }
                self.merged_lines = self.merged_lines - last.lines + lines;
                last.lines = lines;
                return Ok(());
            }
        }

        if start != self.merged_lines {
            return Err(StorageError::Discontiguous {
                file: file.to_string(),
                start,
                expected: self.merged_lines,
            });
        }
        self.chunks.push(ChunkEntry { file: file.to_string(), lines, start });
        self.merged_lines += lines;
        Ok(())
    }

    /// Places `chunks` (themselves newest-first) ahead of every existing chunk.
    pub fn insert_newest(&mut self, chunks: &[ChunkDescriptor]) {
        let mut merged: Vec<ChunkEntry> = chunks
            .iter()
            .filter(|chunk| chunk.lines > 0)
            .map(|chunk| ChunkEntry { file: chunk.file.clone(), lines: chunk.lines, start: 0 })
            .collect();
        merged.append(&mut self.chunks);
        self.chunks = merged;
        self.reindex();
    }

    /// Points the newest entry at `file`, which holds `lines` lines. Returns the file the
    /// entry referred to before.
    pub fn replace_newest(&mut self, file: &str, lines: u64) -> Option<String> {
        let head = self.chunks.first_mut()?;
        let previous = std::mem::replace(&mut head.file, file.to_string());
        head.lines = lines;
        self.reindex();
        Some(previous)
    }

    pub fn set_total(&mut self, total: u64) {
        self.total_lines = Some(total);
    }

    /// Writes the whole manifest to a temporary file and renames it into place, so a
    /// concurrent reader sees either the previous or the new snapshot.
    pub fn save(&self) -> Result<(), StorageError> {
        let document = ManifestDocument {
            chunk_count: self.chunks.len(),
            chunks: self.chunks.clone(),
            merged_lines: self.merged_lines,
            total_lines: self.total_lines,
        };
        let bytes = serde_json::to_vec_pretty(&document)?;
        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;
        debug!(path = %self.path.display(), chunks = self.chunks.len(), merged = self.merged_lines, "saved manifest");
        Ok(())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunks(&self) -> &[ChunkEntry] {
        &self.chunks
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn merged_lines(&self) -> u64 {
        self.merged_lines
    }

    pub fn total_lines(&self) -> Option<u64> {
        self.total_lines
    }

    /// Index of the chunk holding physical line `physical`.
    pub fn locate(&self, physical: u64) -> Option<usize> {
        if physical >= self.merged_lines {
            return None;
        }
        let idx = self.chunks.partition_point(|chunk| chunk.start + chunk.lines <= physical);
        (idx < self.chunks.len()).then_some(idx)
    }

    fn is_consistent(&self) -> bool {
        let mut expected = 0;
        for chunk in &self.chunks {
            if chunk.start != expected {
                return false;
            }
            expected += chunk.lines;
        }
        expected == self.merged_lines
    }

    fn reindex(&mut self) {
        let mut start = 0;
        for chunk in &mut self.chunks {
            chunk.start = start;
            start += chunk.lines;
        }
        self.merged_lines = start;
    }
}
