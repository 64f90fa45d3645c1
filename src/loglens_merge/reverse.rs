use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use memchr::memrchr;
use smol_str::SmolStr;

use crate::loglens_core::{LogRecord, ParsedLine, Timestamp, Walk, YearRollover};

use super::{is_blank, SourceFile, READ_BLOCK_BYTES};

/// Yields the non-blank lines of a file from last to first, reading fixed-size blocks from the
/// end so memory stays bounded by the longest line.
pub struct ReverseLines {
    file: File,
    pos: u64,
    block: usize,
    /// Start of the line that straddles the previous block boundary.
    partial: Vec<u8>,
    /// Complete lines of the current block, oldest first.
    ready: Vec<Vec<u8>>,
}

impl ReverseLines {
    pub fn open(path: &Path) -> io::Result<Self> {
        Self::with_block_size(path, READ_BLOCK_BYTES)
    }

    pub fn with_block_size(path: &Path, block: usize) -> io::Result<Self> {
        let file = File::open(path)?;
        let pos = file.metadata()?.len();
        Ok(Self { file, pos, block: block.max(1), partial: Vec::new(), ready: Vec::new() })
    }

    pub fn next_line(&mut self) -> io::Result<Option<String>> {
        loop {
            while let Some(line) = self.ready.pop() {
                let line = trim_cr(&line);
                if !is_blank(line) {
                    return Ok(Some(String::from_utf8_lossy(line).into_owned()));
                }
            }
            if !self.fill()? {
                return Ok(None);
            }
        }
    }

    fn fill(&mut self) -> io::Result<bool> {
        if self.pos == 0 {
            if self.partial.is_empty() {
                return Ok(false);
            }
            self.ready.push(std::mem::take(&mut self.partial));
            return Ok(true);
        }

        let len = self.block.min(self.pos as usize);
        self.pos -= len as u64;
        self.file.seek(SeekFrom::Start(self.pos))?;
        let mut data = vec![0u8; len];
        self.file.read_exact(&mut data)?;
        data.extend_from_slice(&self.partial);

        let mut end = data.len();
        while let Some(newline) = memrchr(b'\n', &data[..end]) {
            self.ready.push(data[newline + 1..end].to_vec());
            end = newline;
        }
        self.ready.reverse();
        data.truncate(end);
        self.partial = data;
        Ok(true)
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// A line paired with the timestamp it sorts under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Entry {
    pub(crate) timestamp: Timestamp,
    pub(crate) text: String,
}

/// Walks one source newest-first, giving continuation lines (no parsable timestamp) the
/// timestamp of the line they follow. Year-less prefixes are rolled back a year whenever
/// the walk crosses New Year.
pub struct SourceCursor {
    lines: ReverseLines,
    tag: SmolStr,
    rank: usize,
    queue: VecDeque<Entry>,
    rollover: YearRollover,
    oldest_seen: Option<Timestamp>,
    exhausted: bool,
}

impl SourceCursor {
    pub fn open(source: &SourceFile) -> io::Result<Self> {
        Ok(Self {
            lines: ReverseLines::open(&source.path)?,
            tag: source.tag.clone(),
            rank: source.rank,
            queue: VecDeque::new(),
            rollover: YearRollover::new(Walk::Backward),
            oldest_seen: None,
            exhausted: false,
        })
    }

    pub fn tag(&self) -> &SmolStr {
        &self.tag
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.queue.is_empty()
    }

    pub(crate) fn next_entry(&mut self) -> io::Result<Option<Entry>> {
        if let Some(entry) = self.queue.pop_front() {
            return Ok(Some(entry));
        }
        if self.exhausted {
            return Ok(None);
        }

        let mut continuation = Vec::new();
        loop {
            match self.lines.next_line()? {
                Some(text) => match stamp_of(&text) {
                    Some((time, yearless)) => {
                        let timestamp = self.rollover.adjust(time, yearless);
                        self.oldest_seen = Some(timestamp);
                        self.queue.extend(
                            continuation.drain(..).map(|text| Entry { timestamp, text }),
                        );
                        self.queue.push_back(Entry { timestamp, text });
                        break;
                    }
                    None => continuation.push(text),
                },
                None => {
                    // Untimed lines at the head of the file sort with the oldest line seen.
                    let timestamp = self.oldest_seen.unwrap_or(0);
                    self.queue.extend(continuation.drain(..).map(|text| Entry { timestamp, text }));
                    self.exhausted = true;
                    break;
                }
            }
        }
        Ok(self.queue.pop_front())
    }

    pub fn next_record(&mut self, id: u64) -> io::Result<Option<LogRecord>> {
        Ok(self
            .next_entry()?
            .map(|entry| LogRecord::with_timestamp(id, self.tag.clone(), entry.text, entry.timestamp)))
    }
}

fn stamp_of(text: &str) -> Option<(Timestamp, bool)> {
    let parsed = ParsedLine::parse(text);
    parsed.time.map(|time| (time, parsed.yearless))
}
