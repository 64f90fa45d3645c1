use std::path::Path;

use tracing::debug;

use crate::loglens_core::LogRecord;

use super::reverse::Entry;
use super::{discover_sources, MergeError, MergeOptions, SourceCursor, SourceFile};

/// Newest-first sample of the tails of all sources.
#[derive(Debug, Clone, Default)]
pub struct WarmupResult {
    pub logs: Vec<LogRecord>,
    /// Every source was read to its first line. Only a hint: sources may still be growing.
    pub fully_covered: bool,
    pub sources: usize,
}

pub fn warmup_tail_prepass(dir: &Path, options: &MergeOptions) -> Result<WarmupResult, MergeError> {
    let sources = discover_sources(dir, &options.include)?;
    warmup_sources(&sources, options)
}

/// Reads up to `per_source_cap` lines from the end of each source, or everything when the
/// sources together fit under `memory_mode_threshold_bytes`.
pub fn warmup_sources(sources: &[SourceFile], options: &MergeOptions) -> Result<WarmupResult, MergeError> {
    let total_bytes: u64 = sources.iter().map(|source| source.len).sum();
    let cap = if total_bytes <= options.memory_mode_threshold_bytes {
        usize::MAX
    } else {
        options.per_source_cap
    };

    let mut sampled: Vec<(Entry, &SourceFile)> = Vec::new();
    let mut fully_covered = true;

    for source in sources {
        let mut cursor = SourceCursor::open(source)?;
        let mut taken = 0usize;
        while taken < cap {
            let Some(entry) = cursor.next_entry()? else {
                break;
            };
            sampled.push((entry, source));
            taken += 1;
        }
        if !cursor.is_exhausted() && cursor.next_entry()?.is_some() {
            fully_covered = false;
        }
    }

    // Stable, so lines of one source keep their newest-first order.
    sampled.sort_by(|(left, left_source), (right, right_source)| {
        (right.timestamp, right_source.rank).cmp(&(left.timestamp, left_source.rank))
    });

    let logs: Vec<LogRecord> = sampled
        .into_iter()
        .enumerate()
        .map(|(id, (entry, source))| {
            LogRecord::with_timestamp(id as u64, source.tag.clone(), entry.text, entry.timestamp)
        })
        .collect();

    debug!(lines = logs.len(), fully_covered, cap, "warmup sample ready");
    Ok(WarmupResult { logs, fully_covered, sources: sources.len() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_seconds(dir: &Path, name: &str, seconds: &[u32]) {
        let lines: Vec<String> = seconds
            .iter()
            .map(|second| format!("Jan  1 00:00:{second:02} host app[1]: {name} {second}"))
            .collect();
        std::fs::write(dir.join(name), lines.join("\n") + "\n").expect("write source");
    }

    #[test]
    fn small_datasets_are_sampled_completely() {
        let dir = TempDir::new().expect("temp dir");
        write_seconds(dir.path(), "a", &[1, 3, 5]);
        write_seconds(dir.path(), "b", &[2, 4]);

        let result = warmup_tail_prepass(dir.path(), &MergeOptions::default()).expect("warmup");
        assert!(result.fully_covered);
        assert_eq!(result.sources, 2);
        let seconds: Vec<u64> = result.logs.iter().map(|record| record.timestamp % 60_000 / 1_000).collect();
        assert_eq!(seconds, vec![5, 4, 3, 2, 1]);
    }

    #[test]
    fn capped_sample_keeps_only_tails() {
        let dir = TempDir::new().expect("temp dir");
        write_seconds(dir.path(), "a", &[1, 3, 5, 7]);
        write_seconds(dir.path(), "b", &[2, 4]);
        let options = MergeOptions { per_source_cap: 2, memory_mode_threshold_bytes: 0, ..MergeOptions::default() };

        let result = warmup_tail_prepass(dir.path(), &options).expect("warmup");
        assert!(!result.fully_covered);
        let texts: Vec<&str> = result.logs.iter().map(|record| record.parsed().message).collect();
        assert_eq!(texts, vec!["a 7", "a 5", "b 4", "b 2"]);
    }

    #[test]
    fn cap_equal_to_source_length_still_counts_as_covered() {
        let dir = TempDir::new().expect("temp dir");
        write_seconds(dir.path(), "a", &[1, 2]);
        let options = MergeOptions { per_source_cap: 2, memory_mode_threshold_bytes: 0, ..MergeOptions::default() };

        let result = warmup_tail_prepass(dir.path(), &options).expect("warmup");
        assert!(result.fully_covered);
        assert_eq!(result.logs.len(), 2);
    }
}
