use serde::Serialize;
use smol_str::SmolStr;

use crate::loglens_core::{Level, LogRecord, Timestamp};

/// On-disk shape of a record. Mirrors [`LogRecord`] minus the view-dependent `idx`.
#[derive(Serialize)]
struct StoredRecord<'a> {
    id: u64,
    ts: Timestamp,
    lvl: Level,
    src: &'a SmolStr,
    text: &'a str,
}

pub(crate) fn encode_record(record: &LogRecord) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(&StoredRecord {
        id: record.id,
        ts: record.timestamp,
        lvl: record.level,
        src: &record.source_tag,
        text: &record.text,
    })
}

pub(crate) fn decode_record(line: &[u8]) -> Result<LogRecord, serde_json::Error> {
    let mut record: LogRecord = serde_json::from_slice(line)?;
    record.idx = None;
    Ok(record)
}

pub(crate) fn trim_line_ending(mut line: &[u8]) -> &[u8] {
    if line.ends_with(b"\n") {
        line = &line[..line.len() - 1];
    }
    if line.ends_with(b"\r") {
        line = &line[..line.len() - 1];
    }
    line
}
