use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::loglens_core::LogRecord;

use super::{jsonl, ChunkDescriptor, StorageError, CHUNK_EXT, CHUNK_PREFIX};

struct OpenChunk {
    file: String,
    writer: BufWriter<File>,
    lines: u64,
    start: u64,
}

impl OpenChunk {
    fn descriptor(&self) -> ChunkDescriptor {
        ChunkDescriptor { file: self.file.clone(), lines: self.lines, start: self.start }
    }
}

/// Append-only writer that spreads records over chunk files of at most `max_lines` lines.
pub struct ChunkStore {
    dir: PathBuf,
    max_lines: u64,
    next_seq: u64,
    written: u64,
    current: Option<OpenChunk>,
}

impl ChunkStore {
    /// `first_seq` names the first chunk file this store creates; `start` is the physical
    /// offset of the first record it writes.
    pub fn new(
        dir: impl AsRef<Path>,
        max_lines: usize,
        first_seq: u64,
        start: u64,
    ) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_lines: max_lines.max(1) as u64, next_seq: first_seq, written: start, current: None })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_lines(&self) -> u64 {
        self.max_lines
    }

    /// Writes `records` in order. Returns one descriptor per chunk file touched by this call,
    /// carrying that file's line count after the write.
    pub fn append_batch(&mut self, records: &[LogRecord]) -> Result<Vec<ChunkDescriptor>, StorageError> {
        let mut touched: Vec<ChunkDescriptor> = Vec::new();

        for record in records {
            let full = self.current.as_ref().is_some_and(|chunk| chunk.lines >= self.max_lines);
            if full {
                if let Some(sealed) = self.seal()? {
                    upsert(&mut touched, sealed);
                }
            }
            if self.current.is_none() {
                self.current = Some(self.open_next()?);
            }

            if let Some(chunk) = self.current.as_mut() {
                write_record(&mut chunk.writer, record)?;
                chunk.lines += 1;
                self.written += 1;
                upsert(&mut touched, chunk.descriptor());
            }
        }

        if let Some(chunk) = self.current.as_mut() {
            chunk.writer.flush()?;
        }
        Ok(touched)
    }

    /// Writes `records` into a new file of their own and seals it at once, ignoring
    /// `max_lines`. Used for the newest end of a live dataset, where `start` is assigned by
    /// the manifest.
    pub fn write_sealed(&mut self, records: &[LogRecord]) -> Result<ChunkDescriptor, StorageError> {
        let file = self.reserve_name();
        let path = self.dir.join(&file);
        let mut writer = BufWriter::new(File::create(&path)?);
        for record in records {
            write_record(&mut writer, record)?;
        }
        sync(writer)?;
        self.written += records.len() as u64;
        debug!(file = %file, lines = records.len(), "sealed chunk");
        Ok(ChunkDescriptor { file, lines: records.len() as u64, start: 0 })
    }

    /// Copies chunk `previous` into a new file with `records` placed ahead of its lines.
    /// `previous` stays untouched, so the caller can switch the manifest over atomically
    /// and remove it afterwards.
    pub fn write_with_prefix(
        &mut self,
        previous: &str,
        previous_lines: u64,
        records: &[LogRecord],
    ) -> Result<ChunkDescriptor, StorageError> {
        let file = self.reserve_name();
        let mut writer = BufWriter::new(File::create(self.dir.join(&file))?);
        for record in records {
            write_record(&mut writer, record)?;
        }
        let mut existing = File::open(self.dir.join(previous))?;
        io::copy(&mut existing, &mut writer)?;
        sync(writer)?;
        self.written += records.len() as u64;
        let lines = previous_lines + records.len() as u64;
        debug!(from = previous, to = %file, lines, "grew newest chunk");
        Ok(ChunkDescriptor { file, lines, start: 0 })
    }

    /// Seals the partially filled chunk, if any. The next append starts a new file.
    pub fn flush_remainder(&mut self) -> Result<Option<ChunkDescriptor>, StorageError> {
        self.seal()
    }

    fn seal(&mut self) -> Result<Option<ChunkDescriptor>, StorageError> {
        let Some(mut chunk) = self.current.take() else {
            return Ok(None);
        };
        chunk.writer.flush()?;
        if chunk.lines == 0 {
            return Ok(None);
        }
        debug!(file = %chunk.file, lines = chunk.lines, "sealed chunk");
        Ok(Some(chunk.descriptor()))
    }

    fn reserve_name(&mut self) -> String {
        let file = chunk_file_name(self.next_seq);
        self.next_seq += 1;
        file
    }

    fn open_next(&mut self) -> Result<OpenChunk, StorageError> {
        let file = self.reserve_name();
        let handle = File::create(self.dir.join(&file))?;
        Ok(OpenChunk { file, writer: BufWriter::new(handle), lines: 0, start: self.written })
    }
}

fn write_record(writer: &mut impl Write, record: &LogRecord) -> Result<(), StorageError> {
    writer.write_all(&jsonl::encode_record(record)?)?;
    writer.write_all(b"\n")?;
    Ok(())
}

fn sync(writer: BufWriter<File>) -> Result<(), StorageError> {
    let handle = writer.into_inner().map_err(|err| err.into_error())?;
    handle.sync_all()?;
    Ok(())
}

pub(crate) fn chunk_file_name(seq: u64) -> String {
    format!("{CHUNK_PREFIX}{seq:06}.{CHUNK_EXT}")
}

pub(crate) fn chunk_seq(file: &str) -> Option<u64> {
    file.strip_prefix(CHUNK_PREFIX)?.strip_suffix(CHUNK_EXT)?.strip_suffix('.')?.parse().ok()
}

pub(crate) fn upsert(touched: &mut Vec<ChunkDescriptor>, descriptor: ChunkDescriptor) {
    match touched.last_mut() {
        Some(last) if last.file == descriptor.file => *last = descriptor,
        _ => touched.push(descriptor),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::TempDir;

    fn records(count: usize) -> Vec<LogRecord> {
        (0..count)
            .map(|id| LogRecord::from_line(id as u64, "src", format!("line {id}"), Some(1)))
            .collect()
    }

    fn line_count(dir: &Path, file: &str) -> usize {
        std::fs::read_to_string(dir.join(file)).expect("read chunk").lines().count()
    }

    #[rstest]
    #[case(3, 10, vec![3])]
    #[case(10, 10, vec![10])]
    #[case(25, 10, vec![10, 10, 5])]
    fn append_batch_reports_every_file_boundary(
        #[case] count: usize,
        #[case] max_lines: usize,
        #[case] expected: Vec<u64>,
    ) {
        let dir = TempDir::new().expect("temp dir");
        let mut store = ChunkStore::new(dir.path(), max_lines, 0, 0).expect("store");

        let touched = store.append_batch(&records(count)).expect("append");
        let lines: Vec<u64> = touched.iter().map(|chunk| chunk.lines).collect();
        assert_eq!(lines, expected);

        let mut start = 0;
        for chunk in &touched {
            assert_eq!(chunk.start, start);
            assert_eq!(line_count(dir.path(), &chunk.file) as u64, chunk.lines);
            start += chunk.lines;
        }
    }

    #[test]
    fn later_batches_grow_the_open_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = ChunkStore::new(dir.path(), 10, 0, 0).expect("store");

        let first = store.append_batch(&records(4)).expect("first");
        let second = store.append_batch(&records(8)).expect("second");

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
        assert_eq!(second[0].file, first[0].file);
        assert_eq!(second[0].lines, 10);
        assert_eq!(second[1].lines, 2);
        assert_eq!(second[1].start, 10);
    }

    #[test]
    fn flush_remainder_seals_partial_chunk() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = ChunkStore::new(dir.path(), 10, 3, 0).expect("store");

        assert!(store.flush_remainder().expect("flush empty").is_none());

        store.append_batch(&records(4)).expect("append");
        let sealed = store.flush_remainder().expect("flush").expect("partial chunk");
        assert_eq!(sealed.lines, 4);
        assert_eq!(chunk_seq(&sealed.file), Some(3));

        let next = store.append_batch(&records(1)).expect("append after seal");
        assert_ne!(next[0].file, sealed.file);
        assert_eq!(next[0].start, 4);
    }

    #[test]
    fn write_with_prefix_leaves_the_previous_file_alone() {
        let dir = TempDir::new().expect("temp dir");
        let mut store = ChunkStore::new(dir.path(), 10, 0, 0).expect("store");

        let old = store.write_sealed(&records(2)).expect("sealed");
        let grown = store.write_with_prefix(&old.file, old.lines, &records(3)).expect("grown");

        assert_ne!(grown.file, old.file);
        assert_eq!(grown.lines, 5);
        assert_eq!(line_count(dir.path(), &grown.file), 5);
        assert_eq!(line_count(dir.path(), &old.file), 2);
        let contents = std::fs::read_to_string(dir.path().join(&grown.file)).expect("read");
        let first_ids: Vec<u64> = contents
            .lines()
            .map(|line| jsonl::decode_record(line.as_bytes()).expect("decode").id)
            .collect();
        assert_eq!(first_ids, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn chunk_names_round_trip_sequence() {
        assert_eq!(chunk_file_name(12), "chunk-000012.jsonl");
        assert_eq!(chunk_seq("chunk-000012.jsonl"), Some(12));
        assert_eq!(chunk_seq("manifest.json"), None);
    }
}
