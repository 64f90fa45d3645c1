//! Merging a directory of rotated log files into one newest-first stream.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};

use memchr::memchr;
#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Serialize;
use smol_str::SmolStr;
use tracing::{debug, warn};

use crate::loglens_core::LogRecord;

mod kway;
mod reverse;
mod warmup;

pub use kway::{merge_directory, merge_sources, MergeSummary};
pub use reverse::{ReverseLines, SourceCursor};
pub use warmup::{warmup_sources, warmup_tail_prepass, WarmupResult};

const READ_BLOCK_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid include pattern `{pattern}`: {message}")]
    Pattern { pattern: String, message: String },
    #[error("merge cancelled")]
    Cancelled,
    #[error("batch sink failed: {0}")]
    Sink(String),
}

#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// Glob patterns matched against file names. Empty means every file participates.
    pub include: Vec<String>,
    pub batch_lines: usize,
    /// Lines read from the tail of each source during warmup.
    pub per_source_cap: usize,
    /// Below this many source bytes, warmup reads every source completely.
    pub memory_mode_threshold_bytes: u64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            batch_lines: 2_000,
            per_source_cap: 2_000,
            memory_mode_threshold_bytes: 8 * 1024 * 1024,
        }
    }
}

/// One input file, in merge input order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub tag: SmolStr,
    /// Position in input order; equal timestamps sort older-rank first.
    pub rank: usize,
    pub len: u64,
}

/// Lists the sources of `dir`: regular, non-hidden files directly inside it, restricted to
/// `include` when given, ordered by base name and then rotation suffix, oldest rotation first.
pub fn discover_sources(dir: &Path, include: &[String]) -> Result<Vec<SourceFile>, MergeError> {
    let patterns = include
        .iter()
        .map(|pattern| {
            glob::Pattern::new(pattern).map_err(|err| MergeError::Pattern {
                pattern: pattern.clone(),
                message: err.msg.to_string(),
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut found: Vec<(String, u64, u64, PathBuf)> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            debug!(path = %entry.path().display(), "skipping non-utf8 file name");
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let metadata = match fs::metadata(entry.path()) {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => continue,
            Err(err) => {
                warn!(?err, file = %name, "cannot stat source, skipping");
                continue;
            }
        };
        if !patterns.is_empty() && !patterns.iter().any(|pattern| pattern.matches(&name)) {
            continue;
        }
        let (_, rotation) = split_rotation(&name);
        found.push((name, rotation, metadata.len(), entry.path()));
    }

    found.sort_by(|left, right| {
        let (left_base, _) = split_rotation(&left.0);
        let (right_base, _) = split_rotation(&right.0);
        left_base.cmp(right_base).then_with(|| right.1.cmp(&left.1)).then_with(|| left.0.cmp(&right.0))
    });

    Ok(found
        .into_iter()
        .enumerate()
        .map(|(rank, (name, _, len, path))| SourceFile { path, tag: SmolStr::new(name), rank, len })
        .collect())
}

/// `messages.2` -> (`messages`, 2); names without a numeric suffix have rotation 0.
fn split_rotation(name: &str) -> (&str, u64) {
    if let Some((base, suffix)) = name.rsplit_once('.') {
        if !base.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(rotation) = suffix.parse() {
                return (base, rotation);
            }
        }
    }
    (name, 0)
}

pub(crate) fn is_blank(line: &[u8]) -> bool {
    line.iter().all(u8::is_ascii_whitespace)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EstimatedTotal {
    pub lines: u64,
    /// False when a source changed size while being counted.
    pub exact: bool,
}

/// Counts the non-empty lines of every source. Any unreadable source makes the whole estimate
/// unknown.
pub fn estimate_total_lines(sources: &[SourceFile]) -> Option<EstimatedTotal> {
    let count = |source: &SourceFile| -> io::Result<(u64, bool)> {
        let lines = count_nonempty_lines(&source.path)?;
        let len = fs::metadata(&source.path)?.len();
        Ok((lines, len == source.len))
    };

    #[cfg(feature = "rayon")]
    let counts: Vec<io::Result<(u64, bool)>> = sources.par_iter().map(count).collect();
    #[cfg(not(feature = "rayon"))]
    let counts: Vec<io::Result<(u64, bool)>> = sources.iter().map(count).collect();

    let mut total = EstimatedTotal { lines: 0, exact: true };
    for (source, result) in sources.iter().zip(counts) {
        match result {
            Ok((lines, unchanged)) => {
                total.lines += lines;
                total.exact &= unchanged;
            }
            Err(err) => {
                warn!(?err, file = %source.tag, "line count estimate failed");
                return None;
            }
        }
    }
    Some(total)
}

/// Stand-in for [`estimate_total_lines`] that needs no extra read: the sample size when the
/// sample covers every source, otherwise total source bytes over the sample's mean line
/// length. Unknown when nothing was sampled from sources that were not fully read.
pub fn approximate_total_lines(sources: &[SourceFile], sample: &[LogRecord], fully_covered: bool) -> Option<u64> {
    let held = sample.len() as u64;
    if fully_covered {
        return Some(held);
    }
    if held == 0 {
        return None;
    }
    let sample_bytes: u64 = sample.iter().map(|record| record.text.len() as u64 + 1).sum();
    let total_bytes: u64 = sources.iter().map(|source| source.len).sum();
    let scaled = u128::from(total_bytes) * u128::from(held) / u128::from(sample_bytes.max(1));
    Some(u64::try_from(scaled).unwrap_or(u64::MAX).max(held))
}

fn count_nonempty_lines(path: &Path) -> io::Result<u64> {
    let mut reader = BufReader::with_capacity(READ_BLOCK_BYTES, File::open(path)?);
    let mut count = 0u64;
    let mut has_content = false;

    loop {
        let buf = reader.fill_buf()?;
        if buf.is_empty() {
            break;
        }
        let consumed = buf.len();
        let mut rest = buf;
        while let Some(pos) = memchr(b'\n', rest) {
            if has_content || !is_blank(&rest[..pos]) {
                count += 1;
            }
            has_content = false;
            rest = &rest[pos + 1..];
        }
        if !is_blank(rest) {
            has_content = true;
        }
        reader.consume(consumed);
    }

    if has_content {
        count += 1;
    }
    Ok(count)
}
