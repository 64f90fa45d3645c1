//! Virtual pagination over a newest-first dataset.
//!
//! Clients address records by a 1-based ascending logical index (oldest = 1). Storage holds the
//! newest record at physical 0, so every read goes through [`physical_range`]. The index serves
//! either an in-memory warm snapshot or the chunk files of a manifest, and every response
//! carries the `version` that was current when the read started.

use std::borrow::Cow;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

#[cfg(feature = "rayon")]
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info};

use crate::loglens_core::{Filter, FilterRequest, LogRecord};
use crate::loglens_storage::{LineRange, Manifest, ReadOptions, StorageError, WindowReader};

mod range;
mod search;

pub use range::{logical_idx, physical_range, PhysicalRange};
pub use search::{SearchHit, SearchOptions, SearchResult};

use search::compile_query;

pub const DEFAULT_SCAN_WINDOW_LINES: u64 = 4_096;

#[cfg(feature = "rayon")]
const PAR_FILTER_THRESHOLD: usize = 2048;

const TOLERANT: ReadOptions = ReadOptions { skip_invalid: true };

#[derive(Debug, thiserror::Error)]
pub enum PagerError {
    #[error("no dataset is open yet")]
    NotReady,
    #[error("warm buffer is still active; clear it before reloading")]
    WarmActive,
    #[error("invalid regex `{pattern}`: {message}")]
    InvalidRegex { pattern: String, message: String },
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("pager state poisoned")]
    Poisoned,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModeKind {
    Uninitialized,
    Warm,
    FileBacked,
}

/// In-memory snapshot, newest first. `virtual_total` is the size of the dataset the snapshot
/// stands in for, which may exceed what it holds.
#[derive(Debug)]
struct WarmBuffer {
    records: Vec<LogRecord>,
    virtual_total: u64,
}

#[derive(Clone, Debug)]
enum Mode {
    Uninitialized,
    Warm { buffer: Arc<WarmBuffer>, fallback: Option<WindowReader> },
    FileBacked(WindowReader),
}

impl Mode {
    fn kind(&self) -> ModeKind {
        match self {
            Mode::Uninitialized => ModeKind::Uninitialized,
            Mode::Warm { .. } => ModeKind::Warm,
            Mode::FileBacked(_) => ModeKind::FileBacked,
        }
    }

    fn total(&self) -> u64 {
        match self {
            Mode::Uninitialized => 0,
            Mode::Warm { buffer, fallback } => {
                buffer.virtual_total.max(fallback.as_ref().map_or(0, WindowReader::total))
            }
            Mode::FileBacked(reader) => reader.total(),
        }
    }

    fn file_view(&self) -> Option<&WindowReader> {
        match self {
            Mode::Uninitialized => None,
            Mode::Warm { fallback, .. } => fallback.as_ref(),
            Mode::FileBacked(reader) => Some(reader),
        }
    }

    /// Where filtered counts and searches read from. A warm snapshot shadows its fallback.
    fn scan_source(&self) -> Option<ScanSource<'_>> {
        match self {
            Mode::Uninitialized => None,
            Mode::Warm { buffer, .. } => Some(ScanSource::Buffer(&buffer.records)),
            Mode::FileBacked(reader) => Some(ScanSource::File(reader)),
        }
    }
}

#[derive(Clone, Debug)]
struct PagerState {
    mode: Mode,
    version: u64,
    manifest_dir: Option<PathBuf>,
    filter: Option<Filter>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct TotalKey {
    filter: String,
    version: u64,
    mode: ModeKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Page {
    pub version: u64,
    /// Size of the index space the page was cut from (filtered when a filter is active).
    pub total: u64,
    pub records: Vec<LogRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PagerStatus {
    pub version: u64,
    pub total: u64,
    pub warm: bool,
    pub mode: ModeKind,
    pub manifest_dir: Option<PathBuf>,
    pub filter: Option<Filter>,
}

/// The query engine behind one dataset.
///
/// Mutations (`open_manifest`, `reload`, `refresh_files`, `seed_warmup_buffer`,
/// `clear_warmup`, `set_filter`) swap in a new state snapshot and bump `version`; reads work on the snapshot they started
/// with, so a read racing a mutation answers consistently for the older version.
pub struct PaginationIndex {
    state: RwLock<Arc<PagerState>>,
    filtered_total: Mutex<Option<(TotalKey, u64)>>,
    scan_window: u64,
}

impl Default for PaginationIndex {
    fn default() -> Self {
        Self::new(DEFAULT_SCAN_WINDOW_LINES)
    }
}

impl PaginationIndex {
    pub fn new(scan_window: u64) -> Self {
        Self {
            state: RwLock::new(Arc::new(PagerState {
                mode: Mode::Uninitialized,
                version: 0,
                manifest_dir: None,
                filter: None,
            })),
            filtered_total: Mutex::new(None),
            scan_window: scan_window.max(1),
        }
    }

    fn snapshot(&self) -> Result<Arc<PagerState>, PagerError> {
        Ok(self.state.read().map_err(|_| PagerError::Poisoned)?.clone())
    }

    /// Applies `change` to a copy of the state. When it reports a change, the copy becomes
    /// current with the next version, which is returned.
    fn mutate<F>(&self, change: F) -> Result<Option<u64>, PagerError>
    where
        F: FnOnce(&mut PagerState) -> Result<bool, PagerError>,
    {
        let mut guard = self.state.write().map_err(|_| PagerError::Poisoned)?;
        let mut next = PagerState::clone(&guard);
        if !change(&mut next)? {
            return Ok(None);
        }
        next.version += 1;
        let version = next.version;
        *guard = Arc::new(next);
        Ok(Some(version))
    }

    pub fn version(&self) -> Result<u64, PagerError> {
        Ok(self.snapshot()?.version)
    }

    pub fn is_warmup_active(&self) -> Result<bool, PagerError> {
        Ok(matches!(self.snapshot()?.mode, Mode::Warm { .. }))
    }

    /// Unfiltered size of the current index space.
    pub fn total(&self) -> Result<u64, PagerError> {
        Ok(self.snapshot()?.mode.total())
    }

    pub fn status(&self) -> Result<PagerStatus, PagerError> {
        let state = self.snapshot()?;
        Ok(PagerStatus {
            version: state.version,
            total: state.mode.total(),
            warm: matches!(state.mode, Mode::Warm { .. }),
            mode: state.mode.kind(),
            manifest_dir: state.manifest_dir.clone(),
            filter: state.filter.clone(),
        })
    }

    /// Binds to the manifest in `dir`. While a warm buffer is active the files only become
    /// its fallback for ranges the buffer does not hold.
    pub fn open_manifest(&self, dir: &Path) -> Result<u64, PagerError> {
        let manifest = Manifest::load_or_create(dir)?;
        let reader = WindowReader::new(Arc::new(manifest));
        let dir = dir.to_path_buf();
        let version = self.mutate(move |state| {
            state.mode = match std::mem::replace(&mut state.mode, Mode::Uninitialized) {
                Mode::Warm { buffer, .. } => Mode::Warm { buffer, fallback: Some(reader) },
                _ => Mode::FileBacked(reader),
            };
            state.manifest_dir = Some(dir);
            Ok(true)
        })?;
        debug!(?version, "opened manifest");
        Ok(version.unwrap_or_default())
    }

    /// Re-reads the bound manifest. Refused while warm mode is active, so a warm read can
    /// never shadow fresher file data.
    pub fn reload(&self) -> Result<u64, PagerError> {
        let state = self.snapshot()?;
        if matches!(state.mode, Mode::Warm { .. }) {
            return Err(PagerError::WarmActive);
        }
        let dir = state.manifest_dir.clone().ok_or(PagerError::NotReady)?;
        let manifest = Manifest::load_or_create(&dir)?;
        let reader = WindowReader::new(Arc::new(manifest));
        let version = self.mutate(move |state| {
            if matches!(state.mode, Mode::Warm { .. }) {
                return Err(PagerError::WarmActive);
            }
            state.mode = Mode::FileBacked(reader);
            Ok(true)
        })?;
        Ok(version.unwrap_or_default())
    }

    /// Re-reads the bound manifest without leaving warm mode: the buffer keeps serving what it
    /// holds and the fallback sees every chunk saved so far. Outside warm mode this is a
    /// plain reload.
    pub fn refresh_files(&self) -> Result<u64, PagerError> {
        let dir = self.snapshot()?.manifest_dir.clone().ok_or(PagerError::NotReady)?;
        let manifest = Manifest::load_or_create(&dir)?;
        let lines = manifest.merged_lines();
        let reader = WindowReader::new(Arc::new(manifest));
        let version = self.mutate(move |state| {
            state.mode = match std::mem::replace(&mut state.mode, Mode::Uninitialized) {
                Mode::Warm { buffer, .. } => Mode::Warm { buffer, fallback: Some(reader) },
                _ => Mode::FileBacked(reader),
            };
            Ok(true)
        })?;
        debug!(lines, ?version, "refreshed file view");
        Ok(version.unwrap_or_default())
    }

    /// Installs a newest-first snapshot standing in for `virtual_total` records. A manifest
    /// that is already open stays bound as the fallback.
    pub fn seed_warmup_buffer(
        &self,
        records: Vec<LogRecord>,
        virtual_total: Option<u64>,
    ) -> Result<u64, PagerError> {
        let held = records.len() as u64;
        let buffer = Arc::new(WarmBuffer {
            virtual_total: virtual_total.unwrap_or(held).max(held),
            records,
        });
        let version = self.mutate(move |state| {
            let fallback = state.mode.file_view().cloned();
            state.mode = Mode::Warm { buffer, fallback };
            Ok(true)
        })?;
        info!(held, ?version, "seeded warm buffer");
        Ok(version.unwrap_or_default())
    }

    /// Drops the warm snapshot, falling back to the bound files if any.
    pub fn clear_warmup(&self) -> Result<u64, PagerError> {
        let version = self.mutate(|state| {
            let Mode::Warm { fallback, .. } = &state.mode else {
                return Ok(false);
            };
            state.mode = match fallback.clone() {
                Some(reader) => Mode::FileBacked(reader),
                None => Mode::Uninitialized,
            };
            Ok(true)
        })?;
        match version {
            Some(version) => Ok(version),
            None => self.version(),
        }
    }

    /// Returns whether the normalized filter changed. Before any dataset is bound this is a
    /// no-op.
    pub fn set_filter(&self, request: &FilterRequest) -> Result<bool, PagerError> {
        let filter = Filter::normalize(request);
        let changed = self.mutate(move |state| {
            if matches!(state.mode, Mode::Uninitialized) || state.filter == filter {
                return Ok(false);
            }
            state.filter = filter;
            Ok(true)
        })?;
        if changed.is_some() {
            self.filtered_total.lock().map_err(|_| PagerError::Poisoned)?.take();
        }
        Ok(changed.is_some())
    }

    /// Reads logical records `start_idx..=end_idx` of the current index space, oldest first.
    pub async fn read_range_by_idx(&self, start_idx: u64, end_idx: u64) -> Result<Page, PagerError> {
        let state = self.snapshot()?;
        if start_idx > end_idx {
            return Ok(Page { version: state.version, total: state.mode.total(), records: Vec::new() });
        }
        match &state.filter {
            Some(filter) => self.read_filtered_in(&state, filter, start_idx, end_idx).await,
            None => self.read_unfiltered_in(&state, start_idx, end_idx).await,
        }
    }

    /// Same contract as [`read_range_by_idx`](Self::read_range_by_idx), in the space of
    /// records matching the active filter, renumbered from 1.
    pub async fn read_range_filtered(&self, start_idx: u64, end_idx: u64) -> Result<Page, PagerError> {
        self.read_range_by_idx(start_idx, end_idx).await
    }

    async fn read_unfiltered_in(
        &self,
        state: &PagerState,
        start_idx: u64,
        end_idx: u64,
    ) -> Result<Page, PagerError> {
        let version = state.version;
        let total = state.mode.total();
        let read = match &state.mode {
            Mode::Uninitialized => return Err(PagerError::NotReady),
            Mode::Warm { buffer, fallback } => {
                let Some(range) = physical_range(total, start_idx, end_idx) else {
                    return Ok(Page { version, total, records: Vec::new() });
                };
                let held = buffer.records.len() as u64;
                if range.start < held {
                    let end = range.end.min(held);
                    LineRange {
                        positions: (range.start..end).collect(),
                        records: buffer.records[range.start as usize..end as usize].to_vec(),
                    }
                } else if let Some(reader) = fallback {
                    reader.read_line_range(range.start, range.end, TOLERANT).await?
                } else {
                    debug!(start_idx, end_idx, held, "range beyond warm buffer, nothing to serve yet");
                    LineRange::default()
                }
            }
            Mode::FileBacked(reader) => {
                let Some(range) = physical_range(total, start_idx, end_idx) else {
                    return Ok(Page { version, total, records: Vec::new() });
                };
                reader.read_line_range(range.start, range.end, TOLERANT).await?
            }
        };
        Ok(Page { version, total, records: into_ascending(read, total) })
    }

    async fn read_filtered_in(
        &self,
        state: &PagerState,
        filter: &Filter,
        start_idx: u64,
        end_idx: u64,
    ) -> Result<Page, PagerError> {
        let total = self.filtered_total_in(state, filter).await?;
        let Some(range) = physical_range(total, start_idx, end_idx) else {
            return Ok(Page { version: state.version, total, records: Vec::new() });
        };
        let source = state.mode.scan_source().ok_or(PagerError::NotReady)?;

        // Newest-first match ranks that map onto the requested logical window.
        let (first_rank, last_rank) = (range.start + 1, range.end);
        let mut rank = 0u64;
        let mut records = Vec::with_capacity(range.len() as usize);
        source
            .for_each_window(0, u64::MAX, self.scan_window, Direction::NewestFirst, |window| {
                for record in window.records() {
                    if !filter.matches(record) {
                        continue;
                    }
                    rank += 1;
                    if rank >= first_rank {
                        records.push(record.clone());
                    }
                    if rank >= last_rank {
                        return ControlFlow::Break(());
                    }
                }
                ControlFlow::Continue(())
            })
            .await?;

        records.reverse();
        for (offset, record) in records.iter_mut().enumerate() {
            record.idx = Some(range.first_idx + offset as u64);
        }
        Ok(Page { version: state.version, total, records })
    }

    /// Number of records in the current index space: all of them without a filter, the
    /// matching ones with one. Cached per filter, version and mode.
    pub async fn get_filtered_total(&self) -> Result<u64, PagerError> {
        let state = self.snapshot()?;
        if matches!(state.mode, Mode::Uninitialized) {
            return Err(PagerError::NotReady);
        }
        match &state.filter {
            Some(filter) => self.filtered_total_in(&state, filter).await,
            None => Ok(state.mode.total()),
        }
    }

    async fn filtered_total_in(&self, state: &PagerState, filter: &Filter) -> Result<u64, PagerError> {
        let key = TotalKey { filter: filter.key(), version: state.version, mode: state.mode.kind() };
        {
            let cache = self.filtered_total.lock().map_err(|_| PagerError::Poisoned)?;
            if let Some((cached_key, total)) = cache.as_ref() {
                if *cached_key == key {
                    return Ok(*total);
                }
            }
        }

        let source = state.mode.scan_source().ok_or(PagerError::NotReady)?;
        let mut total = 0u64;
        source
            .for_each_window(0, u64::MAX, self.scan_window, Direction::NewestFirst, |window| {
                total += count_matching(filter, window.records());
                ControlFlow::Continue(())
            })
            .await?;

        debug!(total, version = state.version, "computed filtered total");
        *self.filtered_total.lock().map_err(|_| PagerError::Poisoned)? = Some((key, total));
        Ok(total)
    }

    /// One ascending pass over the current index space, returning `{idx, text}` for every
    /// record whose text matches `query`.
    pub async fn search_all(&self, query: &str, options: &SearchOptions) -> Result<SearchResult, PagerError> {
        let state = self.snapshot()?;
        let matcher = compile_query(query, options.regex)?;
        let source = state.mode.scan_source().ok_or(PagerError::NotReady)?;
        let top = options.top.unwrap_or(usize::MAX);
        let mut hits = Vec::new();
        let (Some(matcher), true) = (matcher, top > 0) else {
            return Ok(SearchResult { version: state.version, hits });
        };

        match &state.filter {
            None => {
                let total = state.mode.total();
                let (from, to) = match options.range {
                    Some((start, end)) => match physical_range(total, start, end) {
                        Some(range) => (range.start, range.end),
                        None => return Ok(SearchResult { version: state.version, hits }),
                    },
                    None => (0, total),
                };
                source
                    .for_each_window(from, to, self.scan_window, Direction::OldestFirst, |window| {
                        for (offset, record) in window.records().iter().enumerate().rev() {
                            if matcher.matches(&record.text) {
                                let idx = logical_idx(total, window.position(offset));
                                hits.push(SearchHit { idx, text: record.text.clone() });
                                if hits.len() >= top {
                                    return ControlFlow::Break(());
                                }
                            }
                        }
                        ControlFlow::Continue(())
                    })
                    .await?;
            }
            Some(filter) => {
                let (first, last) = options.range.map_or((1, u64::MAX), |(start, end)| (start.max(1), end));
                if first > last {
                    return Ok(SearchResult { version: state.version, hits });
                }
                let mut idx = 0u64;
                source
                    .for_each_window(0, u64::MAX, self.scan_window, Direction::OldestFirst, |window| {
                        for record in window.records().iter().rev() {
                            if !filter.matches(record) {
                                continue;
                            }
                            idx += 1;
                            if idx > last {
                                return ControlFlow::Break(());
                            }
                            if idx >= first && matcher.matches(&record.text) {
                                hits.push(SearchHit { idx, text: record.text.clone() });
                                if hits.len() >= top {
                                    return ControlFlow::Break(());
                                }
                            }
                        }
                        ControlFlow::Continue(())
                    })
                    .await?;
            }
        }
        Ok(SearchResult { version: state.version, hits })
    }
}

/// Stamps each record with the logical index of the position it was read from and turns
/// the physical slice into ascending order. A skipped corrupt line leaves a gap in `idx`
/// rather than shifting its neighbours.
fn into_ascending(read: LineRange, total: u64) -> Vec<LogRecord> {
    let LineRange { positions, mut records } = read;
    for (record, physical) in records.iter_mut().zip(positions) {
        record.idx = Some(logical_idx(total, physical));
    }
    records.reverse();
    records
}

fn count_matching(filter: &Filter, records: &[LogRecord]) -> u64 {
    #[cfg(feature = "rayon")]
    {
        if records.len() >= PAR_FILTER_THRESHOLD {
            return records.par_iter().filter(|record| filter.matches(record)).count() as u64;
        }
    }
    records.iter().filter(|record| filter.matches(record)).count() as u64
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Direction {
    NewestFirst,
    OldestFirst,
}

/// One slice of a scan in physical order, with the physical position of each record.
struct Window<'a> {
    start: u64,
    records: Cow<'a, [LogRecord]>,
    /// Set when the slice came from files, where skipped lines leave gaps.
    positions: Option<Vec<u64>>,
}

impl Window<'_> {
    fn records(&self) -> &[LogRecord] {
        &self.records
    }

    fn position(&self, offset: usize) -> u64 {
        match &self.positions {
            Some(positions) => positions[offset],
            None => self.start + offset as u64,
        }
    }
}

enum ScanSource<'a> {
    Buffer(&'a [LogRecord]),
    File(&'a WindowReader),
}

impl<'a> ScanSource<'a> {
    fn len(&self) -> u64 {
        match self {
            ScanSource::Buffer(records) => records.len() as u64,
            ScanSource::File(reader) => reader.total(),
        }
    }

    async fn window(&self, start: u64, end: u64) -> Result<Window<'a>, PagerError> {
        match self {
            ScanSource::Buffer(records) => {
                let records: &'a [LogRecord] = *records;
                Ok(Window { start, records: Cow::Borrowed(&records[start as usize..end as usize]), positions: None })
            }
            ScanSource::File(reader) => {
                let LineRange { positions, records } = reader.read_line_range(start, end, TOLERANT).await?;
                Ok(Window { start, records: Cow::Owned(records), positions: Some(positions) })
            }
        }
    }

    /// Visits physical `from..to` in windows of `window` lines. Each slice is handed over in
    /// physical order; `direction` only decides which end the windows start from.
    async fn for_each_window<F>(
        &self,
        from: u64,
        to: u64,
        window: u64,
        direction: Direction,
        mut visit: F,
    ) -> Result<(), PagerError>
    where
        F: FnMut(&Window<'_>) -> ControlFlow<()>,
    {
        let to = to.min(self.len());
        if from >= to {
            return Ok(());
        }
        match direction {
            Direction::NewestFirst => {
                let mut start = from;
                while start < to {
                    let end = start.saturating_add(window).min(to);
                    let slice = self.window(start, end).await?;
                    if visit(&slice).is_break() {
                        break;
                    }
                    start = end;
                }
            }
            Direction::OldestFirst => {
                let mut end = to;
                while end > from {
                    let start = end.saturating_sub(window).max(from);
                    let slice = self.window(start, end).await?;
                    if visit(&slice).is_break() {
                        break;
                    }
                    end = start;
                }
            }
        }
        Ok(())
    }
}
