use std::{
    collections::BTreeMap,
    env,
    io::BufRead,
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::loglens_core::{FilterRequest, SessionEvent};
use crate::loglens_http;
use crate::loglens_pager::{PaginationIndex, SearchOptions};
use crate::loglens_session::{session_dir, EngineConfig, LiveTailSession, MergeSession, SessionKind};

const CONFIG_FILE: &str = "loglens.json";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 7878;
const DEFAULT_SOURCE_TAG: &str = "live";
const LINE_CHANNEL_CAPACITY: usize = 4096;

pub type DynError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "loglens", version, about = "Chunked storage and paging for large device log datasets")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    chunk_max_lines: Option<usize>,
    #[arg(long, global = true)]
    pulse_ms: Option<u64>,
    #[arg(long, global = true)]
    window_lines: Option<u64>,
    #[arg(long, global = true)]
    skip_merge_max_lines: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Merge a directory of rotated logs into a new dataset.
    Merge {
        source_dir: PathBuf,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long = "include")]
        include: Vec<String>,
    },
    /// Record lines from stdin into a new dataset until EOF or Ctrl-C.
    Tail {
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long, default_value = DEFAULT_SOURCE_TAG)]
        source_tag: String,
    },
    /// Print logical lines START..=END of a dataset.
    Page {
        dir: PathBuf,
        start: u64,
        end: u64,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Search a dataset.
    Search {
        dir: PathBuf,
        query: String,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        regex: bool,
        #[arg(long)]
        top: Option<usize>,
        #[command(flatten)]
        filter: FilterArgs,
    },
    /// Serve page, filter and search queries for a dataset over HTTP.
    Serve {
        dir: PathBuf,
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
        #[arg(long, action = clap::ArgAction::SetTrue)]
        allow_remote: bool,
    },
}

#[derive(Args, Debug, Default, Clone)]
struct FilterArgs {
    #[arg(long)]
    pid: Option<String>,
    #[arg(long)]
    src: Option<String>,
    #[arg(long = "proc")]
    process: Option<String>,
    #[arg(long)]
    msg: Option<String>,
}

impl FilterArgs {
    fn to_request(&self) -> FilterRequest {
        FilterRequest {
            pid: self.pid.clone(),
            src: self.src.clone(),
            process: self.process.clone(),
            msg: self.msg.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.pid.is_none() && self.src.is_none() && self.process.is_none() && self.msg.is_none()
    }
}

#[derive(Debug, Clone)]
struct Config {
    data_dir: Option<PathBuf>,
    host: String,
    port: u16,
    allow_remote: bool,
    engine: EngineConfig,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct PartialConfig {
    data_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    allow_remote: Option<bool>,
    chunk_max_lines: Option<usize>,
    pulse_ms: Option<u64>,
    window_lines: Option<u64>,
    merge_batch_lines: Option<usize>,
    warmup_per_source_lines: Option<usize>,
    memory_mode_threshold_bytes: Option<u64>,
    skip_merge_max_lines: Option<u64>,
    progress_interval_ms: Option<u64>,
    progress_min_percent: Option<f64>,
    scan_window_lines: Option<u64>,
}

fn overlay<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

impl PartialConfig {
    fn merge(&mut self, other: PartialConfig) {
        overlay(&mut self.data_dir, other.data_dir);
        overlay(&mut self.host, other.host);
        overlay(&mut self.port, other.port);
        overlay(&mut self.allow_remote, other.allow_remote);
        overlay(&mut self.chunk_max_lines, other.chunk_max_lines);
        overlay(&mut self.pulse_ms, other.pulse_ms);
        overlay(&mut self.window_lines, other.window_lines);
        overlay(&mut self.merge_batch_lines, other.merge_batch_lines);
        overlay(&mut self.warmup_per_source_lines, other.warmup_per_source_lines);
        overlay(&mut self.memory_mode_threshold_bytes, other.memory_mode_threshold_bytes);
        overlay(&mut self.skip_merge_max_lines, other.skip_merge_max_lines);
        overlay(&mut self.progress_interval_ms, other.progress_interval_ms);
        overlay(&mut self.progress_min_percent, other.progress_min_percent);
        overlay(&mut self.scan_window_lines, other.scan_window_lines);
    }
}

impl Config {
    fn from_partial(partial: PartialConfig) -> Self {
        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            chunk_max_lines: partial.chunk_max_lines.unwrap_or(defaults.chunk_max_lines).max(1),
            pulse_ms: partial.pulse_ms.unwrap_or(defaults.pulse_ms),
            window_lines: partial.window_lines.unwrap_or(defaults.window_lines),
            merge_batch_lines: partial.merge_batch_lines.unwrap_or(defaults.merge_batch_lines).max(1),
            warmup_per_source_lines: partial.warmup_per_source_lines.unwrap_or(defaults.warmup_per_source_lines),
            memory_mode_threshold_bytes: partial
                .memory_mode_threshold_bytes
                .unwrap_or(defaults.memory_mode_threshold_bytes),
            skip_merge_max_lines: partial.skip_merge_max_lines.unwrap_or(defaults.skip_merge_max_lines),
            progress_interval_ms: partial.progress_interval_ms.unwrap_or(defaults.progress_interval_ms),
            progress_min_percent: partial.progress_min_percent.unwrap_or(defaults.progress_min_percent),
            scan_window_lines: partial.scan_window_lines.unwrap_or(defaults.scan_window_lines).max(1),
        };
        Self {
            data_dir: partial.data_dir,
            host: partial.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: partial.port.unwrap_or(DEFAULT_PORT),
            allow_remote: partial.allow_remote.unwrap_or(false),
            engine,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileConfig {
    #[serde(alias = "dataDir")]
    data_dir: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    #[serde(alias = "allowRemote")]
    allow_remote: Option<bool>,
    engine: FileEngineConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct FileEngineConfig {
    chunk_max_lines: Option<usize>,
    pulse_ms: Option<u64>,
    window_lines: Option<u64>,
    merge_batch_lines: Option<usize>,
    warmup_per_source_lines: Option<usize>,
    memory_mode_threshold_bytes: Option<u64>,
    skip_merge_max_lines: Option<u64>,
    progress_interval_ms: Option<u64>,
    progress_min_percent: Option<f64>,
    scan_window_lines: Option<u64>,
}

impl FileConfig {
    fn into_partial(self) -> PartialConfig {
        let engine = self.engine;
        PartialConfig {
            data_dir: self.data_dir,
            host: self.host,
            port: self.port,
            allow_remote: self.allow_remote,
            chunk_max_lines: engine.chunk_max_lines,
            pulse_ms: engine.pulse_ms,
            window_lines: engine.window_lines,
            merge_batch_lines: engine.merge_batch_lines,
            warmup_per_source_lines: engine.warmup_per_source_lines,
            memory_mode_threshold_bytes: engine.memory_mode_threshold_bytes,
            skip_merge_max_lines: engine.skip_merge_max_lines,
            progress_interval_ms: engine.progress_interval_ms,
            progress_min_percent: engine.progress_min_percent,
            scan_window_lines: engine.scan_window_lines,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("failed to parse config file {path}: {source}")]
    ParseFile { path: PathBuf, source: serde_json::Error },
    #[error("config file not found: {path}")]
    MissingConfig { path: PathBuf },
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

fn cli_overrides(cli: &Cli) -> PartialConfig {
    let mut partial = PartialConfig {
        data_dir: cli.data_dir.clone(),
        chunk_max_lines: cli.chunk_max_lines,
        pulse_ms: cli.pulse_ms,
        window_lines: cli.window_lines,
        skip_merge_max_lines: cli.skip_merge_max_lines,
        ..PartialConfig::default()
    };
    if let Command::Serve { host, port, allow_remote, .. } = &cli.command {
        partial.host = host.clone();
        partial.port = *port;
        if *allow_remote {
            partial.allow_remote = Some(true);
        }
    }
    partial
}

fn env_overrides(env: &BTreeMap<String, String>) -> Result<PartialConfig, ConfigError> {
    let mut partial = PartialConfig::default();
    if let Some(value) = env.get("LOGLENS_DATA_DIR") {
        if !value.trim().is_empty() {
            partial.data_dir = Some(PathBuf::from(value));
        }
    }
    if let Some(host) = env.get("LOGLENS_HOST") {
        partial.host = Some(host.clone());
    }
    if let Some(port) = env.get("LOGLENS_PORT") {
        partial.port = Some(parse_u16("LOGLENS_PORT", port)?);
    }
    if let Some(value) = env.get("LOGLENS_ALLOW_REMOTE") {
        partial.allow_remote = Some(parse_bool("LOGLENS_ALLOW_REMOTE", value)?);
    }
    if let Some(value) = env.get("LOGLENS_CHUNK_MAX_LINES") {
        partial.chunk_max_lines = Some(parse_usize("LOGLENS_CHUNK_MAX_LINES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_PULSE_MS") {
        partial.pulse_ms = Some(parse_u64("LOGLENS_PULSE_MS", value)?);
    }
    if let Some(value) = env.get("LOGLENS_WINDOW_LINES") {
        partial.window_lines = Some(parse_u64("LOGLENS_WINDOW_LINES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_MERGE_BATCH_LINES") {
        partial.merge_batch_lines = Some(parse_usize("LOGLENS_MERGE_BATCH_LINES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_WARMUP_PER_SOURCE_LINES") {
        partial.warmup_per_source_lines = Some(parse_usize("LOGLENS_WARMUP_PER_SOURCE_LINES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_MEMORY_MODE_THRESHOLD_BYTES") {
        partial.memory_mode_threshold_bytes = Some(parse_u64("LOGLENS_MEMORY_MODE_THRESHOLD_BYTES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_SKIP_MERGE_MAX_LINES") {
        partial.skip_merge_max_lines = Some(parse_u64("LOGLENS_SKIP_MERGE_MAX_LINES", value)?);
    }
    if let Some(value) = env.get("LOGLENS_PROGRESS_INTERVAL_MS") {
        partial.progress_interval_ms = Some(parse_u64("LOGLENS_PROGRESS_INTERVAL_MS", value)?);
    }
    if let Some(value) = env.get("LOGLENS_PROGRESS_MIN_PERCENT") {
        partial.progress_min_percent = Some(parse_percent("LOGLENS_PROGRESS_MIN_PERCENT", value)?);
    }
    if let Some(value) = env.get("LOGLENS_SCAN_WINDOW_LINES") {
        partial.scan_window_lines = Some(parse_u64("LOGLENS_SCAN_WINDOW_LINES", value)?);
    }
    Ok(partial)
}

fn invalid_env(name: &str, value: &str) -> ConfigError {
    ConfigError::InvalidEnv { name: name.to_string(), value: value.to_string() }
}

fn parse_u16(name: &str, value: &str) -> Result<u16, ConfigError> {
    value.trim().parse::<u16>().map_err(|_| invalid_env(name, value))
}

fn parse_usize(name: &str, value: &str) -> Result<usize, ConfigError> {
    value.trim().parse::<usize>().map_err(|_| invalid_env(name, value))
}

fn parse_u64(name: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse::<u64>().map_err(|_| invalid_env(name, value))
}

fn parse_percent(name: &str, value: &str) -> Result<f64, ConfigError> {
    match value.trim().parse::<f64>() {
        Ok(parsed) if (0.0..=100.0).contains(&parsed) => Ok(parsed),
        _ => Err(invalid_env(name, value)),
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid_env(name, value)),
    }
}

fn load_config_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;
    let parsed: FileConfig = serde_json::from_str(&contents)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })?;
    Ok(parsed.into_partial())
}

fn find_config_path(start: &Path) -> Option<PathBuf> {
    let mut current = start.to_path_buf();
    loop {
        let candidate = current.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !current.pop() {
            break;
        }
    }
    None
}

fn resolve_config(
    cli: &Cli,
    cwd: &Path,
    env: &BTreeMap<String, String>,
) -> Result<(Config, Option<PathBuf>), ConfigError> {
    let mut partial = PartialConfig::default();

    let config_path = if let Some(path) = &cli.config {
        if !path.is_file() {
            return Err(ConfigError::MissingConfig { path: path.clone() });
        }
        Some(path.clone())
    } else {
        find_config_path(cwd)
    };

    if let Some(path) = config_path.as_ref() {
        partial.merge(load_config_file(path)?);
    }
    partial.merge(env_overrides(env)?);
    partial.merge(cli_overrides(cli));

    Ok((Config::from_partial(partial), config_path))
}

fn resolve_bind_addr(host: &str, port: u16) -> Result<SocketAddr, std::io::Error> {
    let mut addrs = (host, port).to_socket_addrs()?;
    addrs.next().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "no bind addresses resolved")
    })
}

fn check_bind_allowed(addr: SocketAddr, allow_remote: bool) -> Result<(), DynError> {
    if !allow_remote && !addr.ip().is_loopback() {
        return Err(format!(
            "refusing to bind to non-loopback address {addr}. Set LOGLENS_ALLOW_REMOTE=1 or pass --allow-remote."
        )
        .into());
    }
    Ok(())
}

/// Session output lands under the configured data dir, or next to the config file, or in the
/// working directory.
fn data_root(config: &Config, cwd: &Path, config_path: Option<&PathBuf>) -> PathBuf {
    match &config.data_dir {
        Some(dir) if dir.is_absolute() => dir.clone(),
        Some(dir) => cwd.join(dir),
        None => config_path.and_then(|path| path.parent()).unwrap_or(cwd).join("data"),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), DynError> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Prints session events as JSON lines until every sender is gone.
fn spawn_event_printer(mut events: mpsc::UnboundedReceiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            if let Err(err) = print_json(&event) {
                warn!(%err, "failed to print session event");
            }
        }
    })
}

fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling session");
            let _ = cancel_tx.send(true);
        }
        // Hold the sender until the process exits so a dropped channel never reads as cancel.
        std::future::pending::<()>().await;
    });
    cancel_rx
}

/// Reads stdin on a plain thread so a blocked read never holds up runtime shutdown.
fn spawn_stdin_reader(lines: mpsc::Sender<String>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) => {
                    if lines.blocking_send(line).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "stopped reading stdin");
                    break;
                }
            }
        }
    });
}

fn open_dataset(dir: &Path, config: &Config, filter: &FilterArgs) -> Result<PaginationIndex, DynError> {
    let pager = PaginationIndex::new(config.engine.scan_window_lines);
    pager.open_manifest(dir)?;
    if !filter.is_empty() {
        pager.set_filter(&filter.to_request())?;
    }
    Ok(pager)
}

async fn run_merge(
    config: Config,
    data_root: PathBuf,
    source_dir: PathBuf,
    out: Option<PathBuf>,
    include: Vec<String>,
) -> Result<(), DynError> {
    let out_dir = out.unwrap_or_else(|| session_dir(&data_root, SessionKind::Merge));
    info!(source = %source_dir.display(), out = %out_dir.display(), "starting merge session");
    let pager = Arc::new(PaginationIndex::new(config.engine.scan_window_lines));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(events_rx);

    let session = MergeSession::new(config.engine, source_dir, out_dir, include, pager, events_tx);
    let outcome = session.run(cancel_on_ctrl_c()).await;
    printer.await?;
    let outcome = outcome?;
    info!(
        plan = ?outcome.plan,
        merged = outcome.merged,
        chunks = outcome.chunk_count,
        cancelled = outcome.cancelled,
        "merge session finished"
    );
    Ok(())
}

async fn run_tail(
    config: Config,
    data_root: PathBuf,
    out: Option<PathBuf>,
    source_tag: String,
) -> Result<(), DynError> {
    let out_dir = out.unwrap_or_else(|| session_dir(&data_root, SessionKind::Live));
    info!(out = %out_dir.display(), "starting live tail session");
    let pager = Arc::new(PaginationIndex::new(config.engine.scan_window_lines));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let printer = spawn_event_printer(events_rx);
    let (lines_tx, lines_rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    spawn_stdin_reader(lines_tx);

    let session = LiveTailSession::new(config.engine, out_dir, source_tag, pager, events_tx);
    let summary = session.run(lines_rx, cancel_on_ctrl_c()).await;
    printer.await?;
    let summary = summary?;
    info!(lines = summary.lines, flushes = summary.flushes, chunks = summary.chunk_count, "live tail finished");
    Ok(())
}

async fn run_serve(config: Config, dir: PathBuf) -> Result<(), DynError> {
    let addr = resolve_bind_addr(&config.host, config.port)?;
    check_bind_allowed(addr, config.allow_remote)?;
    let pager = Arc::new(open_dataset(&dir, &config, &FilterArgs::default())?);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, dataset = %dir.display(), "starting http server");
    loglens_http::serve(listener, pager).await?;
    Ok(())
}

pub async fn run() -> Result<(), DynError> {
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

    let cli = Cli::parse();
    let cwd = env::current_dir()?;
    let env_map: BTreeMap<String, String> = env::vars().collect();
    let (config, config_path) = resolve_config(&cli, &cwd, &env_map)?;

    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config file");
    } else {
        info!("no {CONFIG_FILE} found, using defaults and env/cli overrides");
    }
    info!(
        host = %config.host,
        port = config.port,
        allow_remote = config.allow_remote,
        chunk_max_lines = config.engine.chunk_max_lines,
        pulse_ms = config.engine.pulse_ms,
        window_lines = config.engine.window_lines,
        skip_merge_max_lines = config.engine.skip_merge_max_lines,
        "resolved config"
    );

    let data_root = data_root(&config, &cwd, config_path.as_ref());
    match cli.command {
        Command::Merge { source_dir, out, include } => run_merge(config, data_root, source_dir, out, include).await,
        Command::Tail { out, source_tag } => run_tail(config, data_root, out, source_tag).await,
        Command::Page { dir, start, end, filter } => {
            let pager = open_dataset(&dir, &config, &filter)?;
            print_json(&pager.read_range_by_idx(start, end).await?)
        }
        Command::Search { dir, query, regex, top, filter } => {
            let pager = open_dataset(&dir, &config, &filter)?;
            let options = SearchOptions { regex, range: None, top };
            print_json(&pager.search_all(&query, &options).await?)
        }
        Command::Serve { dir, .. } => run_serve(config, dir).await,
    }
}
