use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use smol_str::SmolStr;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::loglens_core::{
    LogRecord, ParsedLine, Saved, SessionEvent, SessionSink, StageKind, Timestamp, Walk, YearRollover,
};
use crate::loglens_pager::PaginationIndex;
use crate::loglens_storage::DatasetWriter;

use super::{deliver_newest_window, emit, stage, EngineConfig, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LiveState {
    Starting,
    Streaming,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LiveSummary {
    pub lines: u64,
    pub flushes: u64,
    pub chunk_count: usize,
}

/// Ingests an upstream line stream, flushing on a fixed pulse instead of per line.
pub struct LiveTailSession<S> {
    config: EngineConfig,
    out_dir: PathBuf,
    source_tag: SmolStr,
    pager: Arc<PaginationIndex>,
    sink: S,
    state: LiveState,
    next_id: u64,
    last_timestamp: Option<Timestamp>,
    rollover: YearRollover,
    flushes: u64,
    opened: bool,
}

impl<S: SessionSink> LiveTailSession<S> {
    pub fn new(
        config: EngineConfig,
        out_dir: impl Into<PathBuf>,
        source_tag: impl Into<SmolStr>,
        pager: Arc<PaginationIndex>,
        sink: S,
    ) -> Self {
        Self {
            config,
            out_dir: out_dir.into(),
            source_tag: source_tag.into(),
            pager,
            sink,
            state: LiveState::Starting,
            next_id: 0,
            last_timestamp: None,
            rollover: YearRollover::new(Walk::Forward),
            flushes: 0,
            opened: false,
        }
    }

    pub fn state(&self) -> LiveState {
        self.state
    }

    fn transition(&mut self, next: LiveState) {
        info!(from = ?self.state, to = ?next, "live session state");
        self.state = next;
    }

    /// Streams until `lines` closes or `cancel` flips to true, then drains what is pending,
    /// including lines still queued in the channel. Lines arrive oldest to newest.
    pub async fn run(
        mut self,
        mut lines: mpsc::Receiver<String>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<LiveSummary, SessionError> {
        let mut writer = DatasetWriter::create(&self.out_dir, self.config.chunk_max_lines)?;
        stage(&self.sink, "Waiting for log stream", StageKind::Busy);

        let mut pulse = tokio::time::interval(self.config.pulse());
        pulse.set_missed_tick_behavior(MissedTickBehavior::Delay);
        pulse.tick().await;

        self.transition(LiveState::Streaming);
        stage(&self.sink, "Streaming", StageKind::Info);
        let mut pending: Vec<String> = Vec::new();

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!("live session cancelled");
                        break;
                    }
                }
                _ = pulse.tick() => {
                    self.flush(&mut writer, &mut pending).await?;
                }
                line = lines.recv() => match line {
                    Some(line) => pending.push(line),
                    None => {
                        debug!("log stream ended");
                        break;
                    }
                },
            }
        }

        self.transition(LiveState::Draining);
        while let Ok(line) = lines.try_recv() {
            pending.push(line);
        }
        self.flush(&mut writer, &mut pending).await?;
        let total = writer.manifest().merged_lines();
        writer.set_total(total);
        writer.finish()?;

        let manifest = writer.manifest();
        emit(
            &self.sink,
            SessionEvent::Saved(Saved {
                out_dir: self.out_dir.clone(),
                manifest_path: manifest.path().to_path_buf(),
                chunk_count: manifest.chunk_count(),
                total,
                merged: manifest.merged_lines(),
            }),
        );
        stage(&self.sink, "Stream closed", StageKind::Done);
        let summary = LiveSummary { lines: self.next_id, flushes: self.flushes, chunk_count: manifest.chunk_count() };
        self.transition(LiveState::Closed);
        Ok(summary)
    }

    async fn flush(&mut self, writer: &mut DatasetWriter, pending: &mut Vec<String>) -> Result<(), SessionError> {
        let mut records = Vec::with_capacity(pending.len());
        for text in pending.drain(..) {
            if text.trim().is_empty() {
                continue;
            }
            let stamped = {
                let parsed = ParsedLine::parse(&text);
                parsed.time.map(|time| self.rollover.adjust(time, parsed.yearless))
            };
            let record = match stamped.or(self.last_timestamp) {
                Some(timestamp) => LogRecord::with_timestamp(self.next_id, self.source_tag.clone(), text, timestamp),
                None => LogRecord::from_line(self.next_id, self.source_tag.clone(), text, None),
            };
            self.next_id += 1;
            self.last_timestamp = Some(record.timestamp);
            records.push(record);
        }
        if records.is_empty() {
            return Ok(());
        }

        records.reverse();
        let chunks = writer.prepend_newest(&records)?;
        self.flushes += 1;
        debug!(lines = records.len(), chunks = chunks.len(), "flushed live batch");

        if self.opened {
            self.pager.reload()?;
        } else {
            self.pager.open_manifest(&self.out_dir)?;
            self.opened = true;
        }
        deliver_newest_window(&self.pager, &self.sink, self.config.window_lines, Some(self.flushes)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loglens_storage::Manifest;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<SessionEvent>>,
    }

    impl SessionSink for RecordingSink {
        fn emit(&self, event: SessionEvent) -> Result<(), String> {
            self.events.lock().map_err(|_| "sink poisoned".to_string())?.push(event);
            Ok(())
        }
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<(Vec<u64>, Option<u64>)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .filter_map(|event| match event {
                    SessionEvent::Batch { records, seq, .. } => {
                        Some((records.iter().filter_map(|record| record.idx).collect(), *seq))
                    }
                    _ => None,
                })
                .collect()
        }
    }

    fn line(n: u32) -> String {
        format!("Jan  1 00:00:{n:02} router hostapd[9]: line {n}")
    }

    #[tokio::test(start_paused = true)]
    async fn lines_within_one_pulse_become_one_chunk_and_one_batch() {
        let dir = TempDir::new().expect("temp dir");
        let pager = Arc::new(PaginationIndex::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        for n in 0..10 {
            tx.send(line(n)).await.expect("send");
        }

        let session = LiveTailSession::new(EngineConfig::default(), dir.path(), "live", pager.clone(), sink.clone());
        let handle = tokio::spawn(session.run(rx, cancel_rx));
        tokio::time::sleep(Duration::from_millis(400)).await;
        drop(tx);
        let summary = handle.await.expect("join").expect("session");

        assert_eq!(summary.lines, 10);
        assert_eq!(summary.flushes, 1);
        assert_eq!(summary.chunk_count, 1);
        let manifest = Manifest::load_or_create(dir.path()).expect("manifest");
        assert_eq!(manifest.chunk_count(), 1);
        assert_eq!(manifest.chunks()[0].lines, 10);

        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, (1..=10).collect::<Vec<u64>>());
        assert_eq!(batches[0].1, Some(1));

        let page = pager.read_range_by_idx(1, 10).await.expect("page");
        let texts: Vec<&str> = page.records.iter().map(|record| record.text.as_str()).collect();
        let expected: Vec<String> = (0..10).map(line).collect();
        assert_eq!(texts, expected.iter().map(String::as_str).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn later_pulses_append_at_the_newest_end() {
        let dir = TempDir::new().expect("temp dir");
        let pager = Arc::new(PaginationIndex::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let session = LiveTailSession::new(EngineConfig::default(), dir.path(), "live", pager.clone(), sink.clone());
        let handle = tokio::spawn(session.run(rx, cancel_rx));

        for n in 0..3 {
            tx.send(line(n)).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        for n in 3..5 {
            tx.send(line(n)).await.expect("send");
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        tx.send("\tcontinuation of line 4".to_string()).await.expect("send");
        tokio::task::yield_now().await;
        cancel_tx.send(true).expect("cancel");
        let summary = handle.await.expect("join").expect("session");

        assert_eq!(summary.flushes, 3);
        assert_eq!(summary.lines, 6);
        let batches = sink.batches();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[1].0, vec![1, 2, 3, 4, 5]);

        let page = pager.read_range_by_idx(1, 6).await.expect("page");
        let ids: Vec<u64> = page.records.iter().map(|record| record.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 4, 5]);
        assert_eq!(page.records[5].timestamp, page.records[4].timestamp);

        let saved = sink
            .events
            .lock()
            .unwrap()
            .iter()
            .find_map(|event| match event {
                SessionEvent::Saved(saved) => Some(saved.clone()),
                _ => None,
            })
            .expect("saved event");
        assert_eq!(saved.total, 6);
        assert_eq!(saved.chunk_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_drains_lines_still_queued_in_the_channel() {
        let dir = TempDir::new().expect("temp dir");
        let pager = Arc::new(PaginationIndex::default());
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        for n in 0..5 {
            tx.send(line(n)).await.expect("send");
        }
        cancel_tx.send(true).expect("cancel");

        let session = LiveTailSession::new(EngineConfig::default(), dir.path(), "live", pager.clone(), sink.clone());
        let summary = session.run(rx, cancel_rx).await.expect("session");

        assert_eq!(summary.lines, 5);
        let manifest = Manifest::load_or_create(dir.path()).expect("manifest");
        assert_eq!(manifest.merged_lines(), 5);
        let page = pager.read_range_by_idx(1, 5).await.expect("page");
        assert_eq!(page.records.last().map(|record| record.text.as_str()), Some(line(4).as_str()));
        drop(tx);
    }

    #[tokio::test(start_paused = true)]
    async fn stream_crossing_new_year_stays_in_order() {
        let dir = TempDir::new().expect("temp dir");
        let pager = Arc::new(PaginationIndex::default());
        let (tx, rx) = mpsc::channel(64);
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        tx.send("Dec 31 23:59:59 router hostapd[9]: old year".to_string()).await.expect("send");
        tx.send("Jan  1 00:00:00 router hostapd[9]: new year".to_string()).await.expect("send");
        drop(tx);

        let session = LiveTailSession::new(EngineConfig::default(), dir.path(), "live", pager.clone(), RecordingSink::default());
        session.run(rx, cancel_rx).await.expect("session");

        let page = pager.read_range_by_idx(1, 2).await.expect("page");
        assert_eq!(page.records[1].timestamp - page.records[0].timestamp, 1_000);
    }
}
