use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::ops::ControlFlow;
use std::path::Path;

use tracing::{debug, info};

use crate::loglens_core::LogRecord;

use super::reverse::Entry;
use super::{discover_sources, MergeError, MergeOptions, SourceCursor, SourceFile};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub sources: usize,
    pub lines: u64,
    pub cancelled: bool,
}

struct Head {
    entry: Entry,
    rank: usize,
    cursor: usize,
}

impl Head {
    fn key(&self) -> (u64, usize) {
        (self.entry.timestamp, self.rank)
    }
}

impl PartialEq for Head {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Head {}

impl PartialOrd for Head {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Head {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Discovers the sources of `dir` and merges them. See [`merge_sources`].
pub fn merge_directory<F>(
    dir: &Path,
    options: &MergeOptions,
    on_batch: F,
) -> Result<MergeSummary, MergeError>
where
    F: FnMut(Vec<LogRecord>) -> Result<ControlFlow<()>, MergeError>,
{
    let sources = discover_sources(dir, &options.include)?;
    merge_sources(&sources, options.batch_lines, on_batch)
}

/// K-way merges `sources` newest-first and hands the output to `on_batch` in batches of
/// `batch_lines`. Equal timestamps come out higher rank first, so in ascending order the
/// earlier input wins. `on_batch` returning `Break` stops the merge after that batch.
pub fn merge_sources<F>(
    sources: &[SourceFile],
    batch_lines: usize,
    mut on_batch: F,
) -> Result<MergeSummary, MergeError>
where
    F: FnMut(Vec<LogRecord>) -> Result<ControlFlow<()>, MergeError>,
{
    let batch_lines = batch_lines.max(1);
    let mut cursors = sources.iter().map(SourceCursor::open).collect::<Result<Vec<_>, _>>()?;
    let mut heap = BinaryHeap::with_capacity(cursors.len());
    for (index, cursor) in cursors.iter_mut().enumerate() {
        if let Some(entry) = cursor.next_entry()? {
            heap.push(Head { entry, rank: cursor.rank(), cursor: index });
        }
    }

    let mut summary = MergeSummary { sources: sources.len(), ..MergeSummary::default() };
    let mut batch = Vec::with_capacity(batch_lines);

    while let Some(head) = heap.pop() {
        let cursor = &mut cursors[head.cursor];
        let record =
            LogRecord::with_timestamp(summary.lines, cursor.tag().clone(), head.entry.text, head.entry.timestamp);
        if let Some(entry) = cursor.next_entry()? {
            heap.push(Head { entry, rank: head.rank, cursor: head.cursor });
        }
        batch.push(record);
        summary.lines += 1;

        if batch.len() >= batch_lines {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(batch_lines));
            if on_batch(full)?.is_break() {
                summary.cancelled = true;
                info!(lines = summary.lines, "merge stopped early");
                return Ok(summary);
            }
        }
    }

    if !batch.is_empty() && on_batch(batch)?.is_break() {
        summary.cancelled = true;
    }
    debug!(sources = summary.sources, lines = summary.lines, "merge complete");
    Ok(summary)
}
