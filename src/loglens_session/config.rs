use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::loglens_merge::MergeOptions;

/// Engine knobs shared by both session kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum lines per chunk file.
    pub chunk_max_lines: usize,
    /// Live-tail flush interval.
    pub pulse_ms: u64,
    /// Size of the newest window pushed to the client after each flush.
    pub window_lines: u64,
    pub merge_batch_lines: usize,
    pub warmup_per_source_lines: usize,
    pub memory_mode_threshold_bytes: u64,
    /// Largest warm sample that may be persisted in place of a full merge.
    pub skip_merge_max_lines: u64,
    pub progress_interval_ms: u64,
    pub progress_min_percent: f64,
    pub scan_window_lines: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_max_lines: 5_000,
            pulse_ms: 250,
            window_lines: 500,
            merge_batch_lines: 2_000,
            warmup_per_source_lines: 2_000,
            memory_mode_threshold_bytes: 8 * 1024 * 1024,
            skip_merge_max_lines: 50_000,
            progress_interval_ms: 200,
            progress_min_percent: 1.0,
            scan_window_lines: 4_096,
        }
    }
}

impl EngineConfig {
    pub fn pulse(&self) -> Duration {
        Duration::from_millis(self.pulse_ms.max(1))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn merge_options(&self, include: Vec<String>) -> MergeOptions {
        MergeOptions {
            include,
            batch_lines: self.merge_batch_lines,
            per_source_cap: self.warmup_per_source_lines,
            memory_mode_threshold_bytes: self.memory_mode_threshold_bytes,
        }
    }
}
