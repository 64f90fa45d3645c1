//! Session orchestration: live tail and directory merge.
//!
//! Both session kinds write a dataset directory through a
//! [`DatasetWriter`](crate::loglens_storage::DatasetWriter), keep a shared
//! [`PaginationIndex`](crate::loglens_pager::PaginationIndex) bound to it and report to the
//! client through a [`SessionSink`](crate::loglens_core::SessionSink).

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::warn;

use crate::loglens_core::{Refresh, SessionEvent, SessionSink, StageKind};
use crate::loglens_merge::MergeError;
use crate::loglens_pager::{PagerError, PaginationIndex};
use crate::loglens_storage::StorageError;

mod config;
mod live;
mod merge;
mod plan;
mod progress;

pub use config::EngineConfig;
pub use live::{LiveState, LiveSummary, LiveTailSession};
pub use merge::{MergeOutcome, MergeSession, MergeStage};
pub use plan::{decide_merge_plan, MergePlan};
pub use progress::ProgressThrottle;

pub const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),
    #[error("pager error: {0}")]
    Pager(#[from] PagerError),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Live,
    Merge,
}

impl SessionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionKind::Live => "live",
            SessionKind::Merge => "merge",
        }
    }
}

/// A fresh output directory, `<data_dir>/sessions/<kind>-<yyyymmdd-hhmmss>-<short id>`.
pub fn session_dir(data_dir: &Path, kind: SessionKind) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let id = uuid::Uuid::new_v4().simple().to_string();
    data_dir.join(SESSIONS_DIR).join(format!("{}-{stamp}-{}", kind.as_str(), &id[..8]))
}

/// Sends `event`, logging instead of failing when the client has gone away. The dataset on
/// disk stays valid either way.
pub(crate) fn emit<S: SessionSink>(sink: &S, event: SessionEvent) {
    if let Err(err) = sink.emit(event) {
        warn!(%err, "dropping session event");
    }
}

pub(crate) fn stage<S: SessionSink>(sink: &S, text: impl Into<String>, kind: StageKind) {
    emit(sink, SessionEvent::Stage { text: text.into(), kind });
}

/// Reads the newest `window_lines` records of the current index space and pushes them as a
/// batch, followed by a refresh notice.
pub(crate) async fn deliver_newest_window<S: SessionSink>(
    pager: &PaginationIndex,
    sink: &S,
    window_lines: u64,
    seq: Option<u64>,
) -> Result<(), SessionError> {
    let total = pager.get_filtered_total().await?;
    let start = total.saturating_sub(window_lines.max(1)) + 1;
    let page = pager.read_range_by_idx(start, total).await?;
    let warm = pager.is_warmup_active()?;
    emit(sink, SessionEvent::Batch { records: page.records, total: Some(page.total), seq });
    emit(sink, SessionEvent::Refresh(Refresh { total: page.total, version: page.version, warm }));
    Ok(())
}
