//! Core domain types for loglens: records, line parsing, filters and session events.

pub mod types {
    use std::sync::OnceLock;

    use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
    use regex::{Captures, Regex};
    use serde::{Deserialize, Serialize};
    use smol_str::SmolStr;

    /// Milliseconds since the Unix epoch.
    pub type Timestamp = u64;

    /// Year assumed for formats that do not carry one (syslog, logcat).
    pub const REFERENCE_YEAR: i32 = 2000;

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum Level {
        #[serde(rename = "V")]
        Verbose,
        #[serde(rename = "D")]
        Debug,
        #[serde(rename = "I")]
        Info,
        #[serde(rename = "W")]
        Warn,
        #[serde(rename = "E")]
        Error,
        #[serde(rename = "F")]
        Fatal,
        #[default]
        #[serde(rename = "?")]
        Unknown,
    }

    impl Level {
        pub fn from_logcat(letter: &str) -> Self {
            match letter {
                "V" => Level::Verbose,
                "D" => Level::Debug,
                "I" => Level::Info,
                "W" => Level::Warn,
                "E" => Level::Error,
                "F" | "A" => Level::Fatal,
                _ => Level::Unknown,
            }
        }

        /// Maps syslog priorities (`daemon.err`) and common level words (`WARN`).
        pub fn from_word(word: &str) -> Self {
            match word.to_ascii_lowercase().as_str() {
                "trace" | "verbose" => Level::Verbose,
                "debug" => Level::Debug,
                "info" | "notice" => Level::Info,
                "warn" | "warning" => Level::Warn,
                "err" | "error" => Level::Error,
                "crit" | "critical" | "alert" | "emerg" | "fatal" | "panic" => Level::Fatal,
                _ => Level::Unknown,
            }
        }
    }

    /// One log line as stored in a chunk.
    ///
    /// `idx` is the logical, view-dependent position handed out by the pager. It is never
    /// written to disk and must not be used as identity.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
    pub struct LogRecord {
        pub id: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pub idx: Option<u64>,
        #[serde(rename = "ts")]
        pub timestamp: Timestamp,
        #[serde(rename = "lvl", default)]
        pub level: Level,
        #[serde(rename = "src")]
        pub source_tag: SmolStr,
        pub text: String,
    }

    impl LogRecord {
        /// Builds a record from a raw line. Lines without a recognizable timestamp inherit
        /// `fallback` (the timestamp of the record they continue).
        pub fn from_line(
            id: u64,
            source_tag: impl Into<SmolStr>,
            text: impl Into<String>,
            fallback: Option<Timestamp>,
        ) -> Self {
            let text = text.into();
            let parsed = ParsedLine::parse(&text);
            Self {
                id,
                idx: None,
                timestamp: parsed.time.or(fallback).unwrap_or(0),
                level: parsed.level,
                source_tag: source_tag.into(),
                text,
            }
        }

        /// Builds a record whose timestamp was already resolved by the caller, e.g. after a
        /// year rollover was applied to a year-less line.
        pub fn with_timestamp(
            id: u64,
            source_tag: impl Into<SmolStr>,
            text: impl Into<String>,
            timestamp: Timestamp,
        ) -> Self {
            let text = text.into();
            let level = ParsedLine::parse(&text).level;
            Self { id, idx: None, timestamp, level, source_tag: source_tag.into(), text }
        }

        pub fn parsed(&self) -> ParsedLine<'_> {
            ParsedLine::parse(&self.text)
        }
    }

    /// The fields of a line that filters match against.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct ParsedLine<'a> {
        pub time: Option<Timestamp>,
        /// The prefix carries no year and `time` was built with [`REFERENCE_YEAR`].
        pub yearless: bool,
        pub level: Level,
        pub process: Option<&'a str>,
        pub pid: Option<&'a str>,
        pub message: &'a str,
    }

    impl<'a> ParsedLine<'a> {
        pub fn parse(text: &'a str) -> Self {
            if let Some(caps) = logcat_re().captures(text) {
                let time = parse_time(&caps[3]).and_then(|time| {
                    month_day(REFERENCE_YEAR, caps[1].parse().ok()?, caps[2].parse().ok()?)
                        .map(|date| to_millis(date.and_time(time)))
                });
                let tag = caps.get(6).map(|tag| tag.as_str().trim()).filter(|tag| !tag.is_empty());
                return Self {
                    time,
                    yearless: true,
                    level: Level::from_logcat(&caps[5]),
                    process: tag,
                    pid: caps.get(4).map(|pid| pid.as_str()),
                    message: caps.get(7).map_or("", |msg| msg.as_str()),
                };
            }

            if let Some(caps) = openwrt_re().captures(text) {
                let time = caps[4]
                    .parse::<i32>()
                    .ok()
                    .and_then(|year| date_from_names(year, &caps[1], &caps[2]))
                    .zip(parse_time(&caps[3]))
                    .map(|(date, time)| to_millis(date.and_time(time)));
                let level = caps.get(5).map_or(Level::Unknown, |word| Level::from_word(word.as_str()));
                return Self::with_tail(time, false, level, &caps, 6);
            }

            if let Some(caps) = syslog_re().captures(text) {
                let time = date_from_names(REFERENCE_YEAR, &caps[1], &caps[2])
                    .zip(parse_time(&caps[3]))
                    .map(|(date, time)| to_millis(date.and_time(time)));
                return Self::with_tail(time, true, Level::Unknown, &caps, 4);
            }

            if let Some(caps) = iso_re().captures(text) {
                let time = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d")
                    .ok()
                    .zip(parse_time(&caps[2].replace(',', ".")))
                    .map(|(date, time)| date.and_time(time))
                    .map(|naive| apply_offset(to_millis(naive), caps.get(3).map(|m| m.as_str())));
                let level = caps.get(4).map_or(Level::Unknown, |word| Level::from_word(word.as_str()));
                return Self::with_tail(time, false, level, &caps, 5);
            }

            Self {
                time: None,
                yearless: false,
                level: Level::Unknown,
                process: None,
                pid: None,
                message: text,
            }
        }

        /// Reads `process`, `pid`, `message` from three consecutive capture groups.
        fn with_tail(
            time: Option<Timestamp>,
            yearless: bool,
            level: Level,
            caps: &Captures<'a>,
            first: usize,
        ) -> Self {
            Self {
                time,
                yearless,
                level,
                process: caps.get(first).map(|m| m.as_str()),
                pid: caps.get(first + 1).map(|m| m.as_str()),
                message: caps.get(first + 2).map_or("", |m| m.as_str()),
            }
        }
    }

    /// Jump that marks a New Year boundary between two neighbouring year-less lines.
    const ROLLOVER_GAP_MS: Timestamp = 183 * 24 * 60 * 60 * 1000;

    /// Order in which a source's lines are fed to a [`YearRollover`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Walk {
        Forward,
        Backward,
    }

    /// Keeps the year-less timestamps of one source monotonic across New Year.
    ///
    /// Syslog and logcat lines are stamped with [`REFERENCE_YEAR`], so `Dec 31` sorts after
    /// `Jan 1` of the following day. Whenever two neighbouring lines jump by more than half
    /// a year against the walk direction, every later line in the walk is moved by one year.
    #[derive(Clone, Debug)]
    pub struct YearRollover {
        walk: Walk,
        shift: i32,
        last: Option<Timestamp>,
    }

    impl YearRollover {
        pub fn new(walk: Walk) -> Self {
            Self { walk, shift: 0, last: None }
        }

        pub fn adjust(&mut self, time: Timestamp, yearless: bool) -> Timestamp {
            if !yearless {
                self.last = Some(time);
                return time;
            }
            let mut adjusted = shift_years(time, self.shift);
            if let Some(last) = self.last {
                let wrapped = match self.walk {
                    Walk::Backward => adjusted > last.saturating_add(ROLLOVER_GAP_MS),
                    Walk::Forward => adjusted.saturating_add(ROLLOVER_GAP_MS) < last,
                };
                if wrapped {
                    self.shift += match self.walk {
                        Walk::Backward => -1,
                        Walk::Forward => 1,
                    };
                    adjusted = shift_years(time, self.shift);
                }
            }
            self.last = Some(adjusted);
            adjusted
        }
    }

    /// Moves a timestamp by whole calendar years; Feb 29 lands on Feb 28 in common years.
    pub fn shift_years(time: Timestamp, years: i32) -> Timestamp {
        if years == 0 {
            return time;
        }
        let Some(naive) = i64::try_from(time)
            .ok()
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|utc| utc.naive_utc())
        else {
            return time;
        };
        let year = naive.year() + years;
        let date = naive
            .date()
            .with_year(year)
            .or_else(|| NaiveDate::from_ymd_opt(year, naive.month(), 28));
        date.map_or(time, |date| to_millis(date.and_time(naive.time())))
    }

    fn logcat_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(
                r"^(\d{2})-(\d{2}) (\d{2}:\d{2}:\d{2}\.\d{3}) +(\d+) +\d+ ([VDIWEFA]) (.*?): ?(.*)$",
            )
            .expect("logcat pattern")
        })
    }

    fn openwrt_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(
                r"^[A-Z][a-z]{2} ([A-Z][a-z]{2}) +(\d{1,2}) (\d{2}:\d{2}:\d{2}) (\d{4}) (?:[a-z0-9]+\.([a-z]+) )?(?:([^\s\[:]+)(?:\[(\d+)\])?: ?)?(.*)$",
            )
            .expect("openwrt pattern")
        })
    }

    fn syslog_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(
                r"^([A-Z][a-z]{2}) +(\d{1,2}) (\d{2}:\d{2}:\d{2}) \S+ (?:([^\s\[:]+)(?:\[(\d+)\])?: ?)?(.*)$",
            )
            .expect("syslog pattern")
        })
    }

    fn iso_re() -> &'static Regex {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| {
            Regex::new(
                r"^(\d{4}-\d{2}-\d{2})[T ](\d{2}:\d{2}:\d{2}(?:[.,]\d{1,9})?)(Z|[+-]\d{2}:?\d{2})?\s+(?:(TRACE|DEBUG|INFO|NOTICE|WARN|WARNING|ERROR|FATAL|CRITICAL)\s+)?(?:([^\s\[:]+)(?:\[(\d+)\])?: ?)?(.*)$",
            )
            .expect("iso pattern")
        })
    }

    fn parse_time(value: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(value, "%H:%M:%S%.f").ok()
    }

    fn month_day(year: i32, month: u32, day: u32) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(year, month, day)
    }

    fn date_from_names(year: i32, month: &str, day: &str) -> Option<NaiveDate> {
        const MONTHS: [&str; 12] =
            ["Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec"];
        let month = MONTHS.iter().position(|name| *name == month)? as u32 + 1;
        month_day(year, month, day.parse().ok()?)
    }

    fn to_millis(naive: NaiveDateTime) -> Timestamp {
        u64::try_from(naive.and_utc().timestamp_millis()).unwrap_or(0)
    }

    fn apply_offset(millis: Timestamp, offset: Option<&str>) -> Timestamp {
        let Some(offset) = offset.filter(|offset| *offset != "Z") else {
            return millis;
        };
        let (sign, digits) = offset.split_at(1);
        let digits: String = digits.chars().filter(char::is_ascii_digit).collect();
        let (Ok(hours), Ok(minutes)) = (digits[..2].parse::<u64>(), digits[2..].parse::<u64>())
        else {
            return millis;
        };
        let shift = (hours * 60 + minutes) * 60_000;
        if sign == "+" {
            millis.saturating_sub(shift)
        } else {
            millis.saturating_add(shift)
        }
    }
}

pub mod filters {
    use serde::{Deserialize, Serialize};

    use crate::loglens_core::types::LogRecord;

    /// A filter as it arrives from a client: every field optional and untrimmed.
    #[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
    pub struct FilterRequest {
        #[serde(default)]
        pub pid: Option<String>,
        #[serde(default)]
        pub src: Option<String>,
        #[serde(default, rename = "proc")]
        pub process: Option<String>,
        #[serde(default)]
        pub msg: Option<String>,
    }

    /// OR across comma-separated groups, AND across the space-separated tokens of a group.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    pub struct TermSet {
        groups: Vec<Vec<String>>,
    }

    impl TermSet {
        pub fn parse(raw: Option<&str>) -> Option<Self> {
            let mut groups: Vec<Vec<String>> = raw?
                .split(',')
                .map(|group| {
                    let mut tokens: Vec<String> =
                        group.split_whitespace().map(str::to_lowercase).collect();
                    tokens.sort();
                    tokens.dedup();
                    tokens
                })
                .filter(|tokens| !tokens.is_empty())
                .collect();
            if groups.is_empty() {
                return None;
            }
            groups.sort();
            groups.dedup();
            Some(Self { groups })
        }

        pub fn groups(&self) -> &[Vec<String>] {
            &self.groups
        }

        fn contains_in(&self, value: Option<&str>) -> bool {
            let Some(value) = value else {
                return false;
            };
            let lower = value.to_lowercase();
            self.groups.iter().any(|group| group.iter().all(|token| lower.contains(token.as_str())))
        }

        fn equals(&self, value: Option<&str>) -> bool {
            let Some(value) = value else {
                return false;
            };
            self.groups.iter().any(|group| group.iter().all(|token| token.eq_ignore_ascii_case(value)))
        }
    }

    /// Normalized filter. Only constructed through [`Filter::normalize`], so every present
    /// field has at least one non-empty group.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    pub struct Filter {
        pid: Option<TermSet>,
        src: Option<TermSet>,
        #[serde(rename = "proc")]
        process: Option<TermSet>,
        msg: Option<TermSet>,
    }

    impl Filter {
        /// Returns `None` when no field carries a constraint.
        pub fn normalize(request: &FilterRequest) -> Option<Self> {
            let filter = Self {
                pid: TermSet::parse(request.pid.as_deref()),
                src: TermSet::parse(request.src.as_deref()),
                process: TermSet::parse(request.process.as_deref()),
                msg: TermSet::parse(request.msg.as_deref()),
            };
            if filter.pid.is_none()
                && filter.src.is_none()
                && filter.process.is_none()
                && filter.msg.is_none()
            {
                return None;
            }
            Some(filter)
        }

        /// Canonical serialized form; two filters are equal iff their keys are.
        pub fn key(&self) -> String {
            serde_json::to_string(self).unwrap_or_default()
        }

        pub fn matches(&self, record: &LogRecord) -> bool {
            if let Some(src) = &self.src {
                if !src.contains_in(Some(record.source_tag.as_str())) {
                    return false;
                }
            }
            if self.pid.is_none() && self.process.is_none() && self.msg.is_none() {
                return true;
            }

            let parsed = record.parsed();
            if let Some(pid) = &self.pid {
                if !pid.equals(parsed.pid) {
                    return false;
                }
            }
            if let Some(process) = &self.process {
                if !process.contains_in(parsed.process) {
                    return false;
                }
            }
            if let Some(msg) = &self.msg {
                if !msg.contains_in(Some(parsed.message)) {
                    return false;
                }
            }
            true
        }
    }
}

pub mod events {
    use std::path::PathBuf;
    use std::sync::Arc;

    use serde::Serialize;
    use tokio::sync::mpsc;

    use crate::loglens_core::types::LogRecord;

    #[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "snake_case")]
    pub enum StageKind {
        Info,
        Busy,
        Done,
        Warning,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    pub struct Progress {
        pub done: u64,
        pub total: Option<u64>,
        pub active: bool,
        #[serde(skip_serializing_if = "std::ops::Not::not")]
        pub reset: bool,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Saved {
        pub out_dir: PathBuf,
        pub manifest_path: PathBuf,
        pub chunk_count: usize,
        pub total: u64,
        pub merged: u64,
    }

    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    pub struct Refresh {
        pub total: u64,
        pub version: u64,
        pub warm: bool,
    }

    /// Everything a session reports back to its client.
    #[derive(Clone, Debug, PartialEq, Eq, Serialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum SessionEvent {
        Batch { records: Vec<LogRecord>, total: Option<u64>, seq: Option<u64> },
        Progress(Progress),
        Saved(Saved),
        Refresh(Refresh),
        Stage { text: String, kind: StageKind },
    }

    pub trait SessionSink {
        fn emit(&self, event: SessionEvent) -> Result<(), String>;
    }

    impl<T> SessionSink for &T
    where
        T: SessionSink + ?Sized,
    {
        fn emit(&self, event: SessionEvent) -> Result<(), String> {
            (*self).emit(event)
        }
    }

    impl<T> SessionSink for Arc<T>
    where
        T: SessionSink + ?Sized,
    {
        fn emit(&self, event: SessionEvent) -> Result<(), String> {
            (**self).emit(event)
        }
    }

    impl SessionSink for mpsc::UnboundedSender<SessionEvent> {
        fn emit(&self, event: SessionEvent) -> Result<(), String> {
            self.send(event).map_err(|_| "session event receiver dropped".to_string())
        }
    }
}

pub use events::{Progress, Refresh, Saved, SessionEvent, SessionSink, StageKind};
pub use filters::{Filter, FilterRequest, TermSet};
pub use types::{Level, LogRecord, ParsedLine, Timestamp, Walk, YearRollover, REFERENCE_YEAR};

#[cfg(test)]
mod tests {
    use super::filters::{Filter, FilterRequest};
    use super::types::{Level, LogRecord, ParsedLine, Walk, YearRollover};
    use rstest::rstest;

    fn record(text: &str) -> LogRecord {
        LogRecord::from_line(1, "messages", text, None)
    }

    fn msg_filter(msg: &str) -> Filter {
        Filter::normalize(&FilterRequest { msg: Some(msg.to_string()), ..FilterRequest::default() })
            .expect("filter")
    }

    #[test]
    fn parses_openwrt_logread_line() {
        let line = "Mon Jan 15 10:23:45 2024 daemon.info hostapd[1234]: wlan0: STA deauth";
        let parsed = ParsedLine::parse(line);
        assert_eq!(parsed.process, Some("hostapd"));
        assert_eq!(parsed.pid, Some("1234"));
        assert_eq!(parsed.message, "wlan0: STA deauth");
        assert_eq!(parsed.level, Level::Info);
        assert_eq!(parsed.time, Some(1_705_314_225_000));
    }

    #[test]
    fn parses_syslog_line_without_pid() {
        let parsed = ParsedLine::parse("Feb  3 07:00:01 router kernel: link up");
        assert_eq!(parsed.process, Some("kernel"));
        assert_eq!(parsed.pid, None);
        assert_eq!(parsed.message, "link up");
        assert!(parsed.time.is_some());
    }

    #[test]
    fn parses_logcat_threadtime_line() {
        let parsed =
            ParsedLine::parse("01-15 10:23:45.123  1234  5678 W ActivityManager: slow start");
        assert_eq!(parsed.process, Some("ActivityManager"));
        assert_eq!(parsed.pid, Some("1234"));
        assert_eq!(parsed.level, Level::Warn);
        assert_eq!(parsed.message, "slow start");
        let base = ParsedLine::parse("01-15 10:23:45.000  1  1 I t: x").time.expect("time");
        assert_eq!(parsed.time, Some(base + 123));
    }

    #[test]
    fn parses_iso_line_with_offset() {
        let utc = ParsedLine::parse("2024-01-15T10:00:00Z app[7]: ready").time;
        let shifted = ParsedLine::parse("2024-01-15T12:00:00+02:00 app[7]: ready").time;
        assert!(utc.is_some());
        assert_eq!(utc, shifted);
    }

    #[test]
    fn unparsed_line_keeps_whole_text_as_message() {
        let parsed = ParsedLine::parse("    at com.example.Foo.bar(Foo.java:12)");
        assert_eq!(parsed.time, None);
        assert_eq!(parsed.message, "    at com.example.Foo.bar(Foo.java:12)");
    }

    #[test]
    fn continuation_line_inherits_fallback_timestamp() {
        let record = LogRecord::from_line(9, "live", "\tstack frame", Some(42));
        assert_eq!(record.timestamp, 42);
        assert_eq!(record.idx, None);
    }

    #[test]
    fn only_syslog_and_logcat_prefixes_are_yearless() {
        assert!(ParsedLine::parse("Feb  3 07:00:01 router kernel: link up").yearless);
        assert!(ParsedLine::parse("01-15 10:23:45.123  1234  5678 W Tag: x").yearless);
        assert!(!ParsedLine::parse("2024-01-15T10:00:00Z app[7]: ready").yearless);
        assert!(!ParsedLine::parse("Mon Jan 15 10:23:45 2024 daemon.info app: x").yearless);
    }

    #[rstest]
    #[case::backward(Walk::Backward, ["Jan  1 00:00:01 h a: y", "Dec 31 23:59:58 h a: x"])]
    #[case::forward(Walk::Forward, ["Dec 31 23:59:58 h a: x", "Jan  1 00:00:01 h a: y"])]
    fn new_year_keeps_december_before_january(#[case] walk: Walk, #[case] lines: [&str; 2]) {
        let mut rollover = YearRollover::new(walk);
        let stamped: Vec<(&str, u64)> = lines
            .iter()
            .map(|line| {
                let parsed = ParsedLine::parse(line);
                (parsed.message, rollover.adjust(parsed.time.expect("time"), parsed.yearless))
            })
            .collect();
        let december = stamped.iter().find(|(msg, _)| *msg == "x").expect("x").1;
        let january = stamped.iter().find(|(msg, _)| *msg == "y").expect("y").1;
        assert!(december < january);
        assert_eq!(january - december, 3_000);
    }

    #[test]
    fn small_clock_jitter_does_not_roll_the_year() {
        let mut rollover = YearRollover::new(Walk::Backward);
        let newer = ParsedLine::parse("Mar  1 10:00:00 h a: x").time.expect("time");
        let older = ParsedLine::parse("Mar  1 10:00:05 h a: y").time.expect("time");
        assert_eq!(rollover.adjust(newer, true), newer);
        assert_eq!(rollover.adjust(older, true), older);
    }

    #[rstest]
    #[case("Jan 1 00:00:00 h wifi[1]: WLAN Host joined", true)]
    #[case("Jan 1 00:00:00 h wifi[1]: deauth reason 3", true)]
    #[case("Jan 1 00:00:00 h wifi[1]: wlan only", false)]
    #[case("Jan 1 00:00:00 h wifi[1]: host only", false)]
    fn msg_filter_is_or_of_and_groups(#[case] line: &str, #[case] expected: bool) {
        assert_eq!(msg_filter("wlan host, deauth").matches(&record(line)), expected);
    }

    #[test]
    fn blank_fields_normalize_to_none() {
        let request = FilterRequest {
            pid: Some("   ".to_string()),
            src: Some(" , ,".to_string()),
            process: None,
            msg: Some(String::new()),
        };
        assert!(Filter::normalize(&request).is_none());
    }

    #[test]
    fn equivalent_filters_share_a_key() {
        let left = msg_filter("Host wlan, deauth");
        let right = msg_filter("  deauth ,wlan   HOST ");
        assert_eq!(left.key(), right.key());
        assert_eq!(left, right);
    }

    #[test]
    fn pid_and_process_filters_use_parsed_fields() {
        let line = record("Jan 1 00:00:00 h dnsmasq[812]: query A example.com");
        let by_pid = Filter::normalize(&FilterRequest {
            pid: Some("812".to_string()),
            ..FilterRequest::default()
        })
        .expect("filter");
        let by_wrong_pid = Filter::normalize(&FilterRequest {
            pid: Some("81".to_string()),
            ..FilterRequest::default()
        })
        .expect("filter");
        let by_proc = Filter::normalize(&FilterRequest {
            process: Some("DNS".to_string()),
            src: Some("messages".to_string()),
            ..FilterRequest::default()
        })
        .expect("filter");
        assert!(by_pid.matches(&line));
        assert!(!by_wrong_pid.matches(&line));
        assert!(by_proc.matches(&line));
    }
}
