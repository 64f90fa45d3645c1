use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::loglens_core::{LogRecord, Progress, Refresh, Saved, SessionEvent, SessionSink, StageKind};
use crate::loglens_merge::{
    approximate_total_lines, discover_sources, estimate_total_lines, merge_sources, warmup_sources,
    EstimatedTotal, MergeError, WarmupResult,
};
use crate::loglens_pager::PaginationIndex;
use crate::loglens_storage::DatasetWriter;

use super::{
    decide_merge_plan, deliver_newest_window, emit, stage, EngineConfig, MergePlan, ProgressThrottle,
    SessionError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStage {
    Estimating,
    Warmup,
    Merging,
    Finalizing,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    pub plan: MergePlan,
    pub estimate: Option<EstimatedTotal>,
    pub warm_lines: u64,
    pub merged: u64,
    pub chunk_count: usize,
    pub cancelled: bool,
}

/// Progress reported from the blocking merge to the async side.
enum MergeSignal {
    Written { merged: u64 },
}

/// Merges a directory of rotated logs into a dataset, serving a warm tail sample while the
/// full merge runs.
pub struct MergeSession<S> {
    config: EngineConfig,
    source_dir: PathBuf,
    out_dir: PathBuf,
    include: Vec<String>,
    pager: Arc<PaginationIndex>,
    sink: S,
    stage: MergeStage,
}

impl<S: SessionSink> MergeSession<S> {
    pub fn new(
        config: EngineConfig,
        source_dir: impl Into<PathBuf>,
        out_dir: impl Into<PathBuf>,
        include: Vec<String>,
        pager: Arc<PaginationIndex>,
        sink: S,
    ) -> Self {
        Self {
            config,
            source_dir: source_dir.into(),
            out_dir: out_dir.into(),
            include,
            pager,
            sink,
            stage: MergeStage::Estimating,
        }
    }

    pub fn stage(&self) -> MergeStage {
        self.stage
    }

    fn enter(&mut self, next: MergeStage, label: &str) {
        info!(from = ?self.stage, to = ?next, "merge session stage");
        self.stage = next;
        stage(&self.sink, label, if next == MergeStage::Done { StageKind::Done } else { StageKind::Busy });
    }

    pub async fn run(mut self, cancel: watch::Receiver<bool>) -> Result<MergeOutcome, SessionError> {
        let options = self.config.merge_options(self.include.clone());

        self.enter(MergeStage::Estimating, "Estimating size");
        let source_dir = self.source_dir.clone();
        let include = options.include.clone();
        let sources = tokio::task::spawn_blocking(move || discover_sources(&source_dir, &include)).await??;
        let sources = Arc::new(sources);

        let mut warm = WarmupResult::default();
        let mut estimate = None;
        if !is_cancelled(&cancel) {
            // The exact count reads every source; it runs next to warmup so the first window
            // only waits for the tail reads.
            let counting = {
                let sources = sources.clone();
                tokio::task::spawn_blocking(move || estimate_total_lines(&sources))
            };

            self.enter(MergeStage::Warmup, "Reading newest lines");
            warm = {
                let sources = sources.clone();
                let options = options.clone();
                match tokio::task::spawn_blocking(move || warmup_sources(&sources, &options)).await? {
                    Ok(warm) => warm,
                    Err(err) => {
                        warn!(?err, "warmup failed, continuing with full merge");
                        WarmupResult::default()
                    }
                }
            };
            let approximate = approximate_total_lines(&sources, &warm.logs, warm.fully_covered);
            emit(
                &self.sink,
                SessionEvent::Progress(Progress { done: 0, total: approximate, active: true, reset: true }),
            );
            if !warm.logs.is_empty() {
                self.pager.seed_warmup_buffer(warm.logs.clone(), approximate)?;
                deliver_newest_window(&self.pager, &self.sink, self.config.window_lines, None).await?;
            }

            if !is_cancelled(&cancel) {
                estimate = counting.await?;
                info!(sources = sources.len(), ?estimate, ?approximate, "estimated merge size");
                let exact = estimate.map(|estimate| estimate.lines);
                if exact.is_some() && exact != approximate {
                    if !warm.logs.is_empty() {
                        self.pager.seed_warmup_buffer(warm.logs.clone(), exact)?;
                        deliver_newest_window(&self.pager, &self.sink, self.config.window_lines, None).await?;
                    }
                    emit(
                        &self.sink,
                        SessionEvent::Progress(Progress { done: 0, total: exact, active: true, reset: false }),
                    );
                }
            }
        }
        let estimated_lines = estimate.map(|estimate| estimate.lines);
        let warm_lines = warm.logs.len() as u64;

        let plan = decide_merge_plan(warm.fully_covered, warm_lines, estimate, self.config.skip_merge_max_lines);
        info!(?plan, fully_covered = warm.fully_covered, warm_lines, "merge plan");

        let writer = DatasetWriter::create(&self.out_dir, self.config.chunk_max_lines)?;
        let mut opened = false;
        let (mut writer, cancelled) = if is_cancelled(&cancel) {
            (writer, true)
        } else {
            self.enter(MergeStage::Merging, "Merging sources");
            let (signals, mut signal_rx) = mpsc::unbounded_channel();
            let batch_lines = options.batch_lines;
            let merge_cancel = cancel.clone();
            let merge_sources_list = sources.clone();
            let warm_logs = warm.logs;

            let handle = tokio::task::spawn_blocking(move || {
                let mut writer = writer;
                let result = match plan {
                    MergePlan::SkipFullMerge => persist_sample(&mut writer, &warm_logs, batch_lines, &signals),
                    MergePlan::FullMerge => {
                        let mut merged = 0u64;
                        merge_sources(&merge_sources_list, batch_lines, |batch| {
                            if *merge_cancel.borrow() {
                                return Ok(ControlFlow::Break(()));
                            }
                            writer.append_older(&batch).map_err(|err| MergeError::Sink(err.to_string()))?;
                            merged += batch.len() as u64;
                            let _ = signals.send(MergeSignal::Written { merged });
                            Ok(ControlFlow::Continue(()))
                        })
                        .map(|summary| summary.cancelled)
                    }
                };
                (writer, result)
            });

            let mut throttle =
                ProgressThrottle::new(self.config.progress_interval(), self.config.progress_min_percent);
            while let Some(MergeSignal::Written { merged }) = signal_rx.recv().await {
                if !throttle.should_emit(merged, estimated_lines, Instant::now()) {
                    continue;
                }
                // Rebind the file view on every update the client sees, so ranges beyond the
                // warm sample follow the chunks saved so far.
                let version = if opened {
                    self.pager.refresh_files()?
                } else {
                    opened = true;
                    self.pager.open_manifest(&self.out_dir)?
                };
                emit(
                    &self.sink,
                    SessionEvent::Refresh(Refresh {
                        total: self.pager.total()?,
                        version,
                        warm: self.pager.is_warmup_active()?,
                    }),
                );
                emit(
                    &self.sink,
                    SessionEvent::Progress(Progress { done: merged, total: estimated_lines, active: true, reset: false }),
                );
            }
            let (writer, result) = handle.await?;
            (writer, result?)
        };
        if cancelled {
            stage(&self.sink, "Merge cancelled, keeping merged lines", StageKind::Warning);
        }

        self.enter(MergeStage::Finalizing, "Finalizing");
        let merged = writer.manifest().merged_lines();
        writer.set_total(if cancelled { estimated_lines.unwrap_or(merged).max(merged) } else { merged });
        writer.finish()?;

        self.pager.clear_warmup()?;
        if opened {
            self.pager.reload()?;
        } else {
            self.pager.open_manifest(&self.out_dir)?;
        }
        deliver_newest_window(&self.pager, &self.sink, self.config.window_lines, None).await?;
        emit(
            &self.sink,
            SessionEvent::Progress(Progress { done: merged, total: Some(merged), active: false, reset: false }),
        );

        let manifest = writer.manifest();
        emit(
            &self.sink,
            SessionEvent::Saved(Saved {
                out_dir: self.out_dir.clone(),
                manifest_path: manifest.path().to_path_buf(),
                chunk_count: manifest.chunk_count(),
                total: manifest.total_lines().unwrap_or(merged),
                merged,
            }),
        );
        let outcome = MergeOutcome {
            plan,
            estimate,
            warm_lines,
            merged,
            chunk_count: manifest.chunk_count(),
            cancelled,
        };
        self.enter(MergeStage::Done, if cancelled { "Merge stopped" } else { "Merge complete" });
        Ok(outcome)
    }
}

fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow()
}

/// Writes an already newest-first sample as the dataset.
fn persist_sample(
    writer: &mut DatasetWriter,
    logs: &[LogRecord],
    batch_lines: usize,
    signals: &mpsc::UnboundedSender<MergeSignal>,
) -> Result<bool, MergeError> {
    let mut merged = 0u64;
    for batch in logs.chunks(batch_lines.max(1)) {
        writer.append_older(batch).map_err(|err| MergeError::Sink(err.to_string()))?;
        merged += batch.len() as u64;
        let _ = signals.send(MergeSignal::Written { merged });
    }
    Ok(false)
}
