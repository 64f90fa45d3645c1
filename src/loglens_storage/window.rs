use std::path::Path;
use std::sync::Arc;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use crate::loglens_core::LogRecord;

use super::{jsonl, Manifest, StorageError};

#[derive(Debug, Clone, Copy, Default)]
pub struct ReadOptions {
    /// Drop lines that fail to decode instead of failing the read.
    pub skip_invalid: bool,
}

/// Records read from a physical range, each paired with the position it was read from.
/// Positions skip exactly the lines that were dropped as corrupt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineRange {
    pub positions: Vec<u64>,
    pub records: Vec<LogRecord>,
}

/// Reads physical (newest-first) line ranges across the chunk files of one manifest snapshot.
#[derive(Debug, Clone)]
pub struct WindowReader {
    manifest: Arc<Manifest>,
}

impl WindowReader {
    pub fn new(manifest: Arc<Manifest>) -> Self {
        Self { manifest }
    }

    pub fn manifest(&self) -> &Arc<Manifest> {
        &self.manifest
    }

    pub fn total(&self) -> u64 {
        self.manifest.merged_lines()
    }

    /// Returns the records at physical positions `from..to`, in physical order. Ranges past the
    /// end of the dataset are truncated.
    pub async fn read_line_range(
        &self,
        from: u64,
        to: u64,
        options: ReadOptions,
    ) -> Result<LineRange, StorageError> {
        if from > to {
            return Err(StorageError::InvalidRange { from, to });
        }
        let to = to.min(self.total());
        if from >= to {
            return Ok(LineRange::default());
        }
        let Some(first) = self.manifest.locate(from) else {
            return Ok(LineRange::default());
        };

        let capacity = (to - from) as usize;
        let mut out = LineRange { positions: Vec::with_capacity(capacity), records: Vec::with_capacity(capacity) };
        for chunk in &self.manifest.chunks()[first..] {
            if chunk.start >= to {
                break;
            }
            let local_from = from.max(chunk.start) - chunk.start;
            let local_to = to.min(chunk.start + chunk.lines) - chunk.start;
            let path = self.manifest.dir().join(&chunk.file);
            let slice = ChunkSlice { path: &path, file: &chunk.file, start: chunk.start };
            read_chunk_slice(slice, local_from, local_to, options, &mut out).await?;
        }
        Ok(out)
    }
}

struct ChunkSlice<'a> {
    path: &'a Path,
    file: &'a str,
    start: u64,
}

async fn read_chunk_slice(
    chunk: ChunkSlice<'_>,
    from: u64,
    to: u64,
    options: ReadOptions,
    out: &mut LineRange,
) -> Result<(), StorageError> {
    let file_name = chunk.file;
    let file = File::open(chunk.path).await?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    let mut line_no = 0u64;

    while line_no < to {
        buf.clear();
        let bytes = reader.read_until(b'\n', &mut buf).await?;
        if bytes == 0 {
            warn!(file = file_name, expected = to, found = line_no, "chunk shorter than manifest");
            break;
        }
        if line_no >= from {
            match jsonl::decode_record(jsonl::trim_line_ending(&buf)) {
                Ok(record) => {
                    out.positions.push(chunk.start + line_no);
                    out.records.push(record);
                }
                Err(err) if options.skip_invalid => {
                    warn!(?err, file = file_name, line = line_no, "skipping corrupt chunk line");
                }
                Err(_) => {
                    return Err(StorageError::CorruptLine {
                        file: file_name.to_string(),
                        line: line_no,
                    });
                }
            }
        }
        line_no += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loglens_storage::DatasetWriter;
    use rstest::rstest;
    use tempfile::TempDir;

    /// Writes `count` records with ids `0..count` across chunks of four lines.
    fn dataset(count: u64) -> (TempDir, WindowReader) {
        let dir = TempDir::new().expect("temp dir");
        let mut writer = DatasetWriter::create(dir.path(), 4).expect("writer");
        let records: Vec<LogRecord> = (0..count)
            .map(|id| LogRecord::from_line(id, "src", format!("line {id}"), Some(count - id)))
            .collect();
        writer.append_older(&records).expect("append");
        writer.finish().expect("finish");
        let manifest = Manifest::load_or_create(dir.path()).expect("manifest");
        (dir, WindowReader::new(Arc::new(manifest)))
    }

    fn ids(records: &[LogRecord]) -> Vec<u64> {
        records.iter().map(|record| record.id).collect()
    }

    #[rstest]
    #[case(0, 3, vec![0, 1, 2])]
    #[case(2, 7, vec![2, 3, 4, 5, 6])]
    #[case(8, 10, vec![8, 9])]
    #[case(9, 40, vec![9])]
    #[case(10, 12, vec![])]
    #[tokio::test]
    async fn reads_ranges_across_chunk_boundaries(
        #[case] from: u64,
        #[case] to: u64,
        #[case] expected: Vec<u64>,
    ) {
        let (_dir, reader) = dataset(10);
        let range = reader.read_line_range(from, to, ReadOptions::default()).await.expect("read");
        assert_eq!(ids(&range.records), expected);
        assert_eq!(range.positions, expected);
    }

    #[tokio::test]
    async fn inverted_range_is_an_error() {
        let (_dir, reader) = dataset(3);
        let err = reader.read_line_range(2, 1, ReadOptions::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidRange { .. }));
    }

    #[tokio::test]
    async fn corrupt_lines_are_skipped_when_requested() {
        let (dir, reader) = dataset(4);
        let chunk = reader.manifest().chunks()[0].file.clone();
        let path = dir.path().join(&chunk);
        let contents = std::fs::read_to_string(&path).expect("read chunk");
        let mut lines: Vec<&str> = contents.lines().collect();
        lines[1] = "{not json";
        std::fs::write(&path, lines.join("\n") + "\n").expect("corrupt chunk");

        let skipped = reader
            .read_line_range(0, 4, ReadOptions { skip_invalid: true })
            .await
            .expect("tolerant read");
        assert_eq!(ids(&skipped.records), vec![0, 2, 3]);
        assert_eq!(skipped.positions, vec![0, 2, 3]);

        let err = reader.read_line_range(0, 4, ReadOptions::default()).await.unwrap_err();
        assert!(matches!(err, StorageError::CorruptLine { line: 1, .. }));
    }
}
