//! Acquisition cycles, the recurring scheduler that drives them, CSV export and
//! the service facade the CLI and web layers call into.

use std::collections::VecDeque;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;
use vtrend_adapters::{FetchClientConfig, FetchError, TrendingSource, YouTubeTrendingClient};
use vtrend_core::{
    AcquisitionParams, ChannelViews, CountryCount, DateViews, DuplicatePolicy, Outcome,
    ScheduleEntry, StoredRow, ValidatedParams, ValidationError, DEFAULT_COUNTRY,
    DEFAULT_MAX_RESULTS,
};
use vtrend_storage::{
    CredentialError, CredentialStore, StorageError, VideoStore, DEFAULT_TOP_CHANNELS,
};

pub const CRATE_NAME: &str = "vtrend-sync";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub api_key_file: PathBuf,
    pub encryption_key_file: PathBuf,
    pub api_base_url: String,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub country: String,
    pub max_results: u32,
    pub duplicate_policy: DuplicatePolicy,
    pub schedule_minutes: Option<u32>,
    pub web_port: u16,
    /// Root for exports requested over HTTP; requested names resolve inside it.
    pub export_dir: PathBuf,
    /// Takes precedence over the encrypted key file when set.
    pub api_key: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("youtube_data.db"),
            api_key_file: PathBuf::from("api_key.enc"),
            encryption_key_file: PathBuf::from("encryption.key"),
            api_base_url: vtrend_adapters::DEFAULT_API_URL.to_string(),
            http_timeout_secs: 20,
            user_agent: "vtrend/0.1".to_string(),
            country: DEFAULT_COUNTRY.to_string(),
            max_results: DEFAULT_MAX_RESULTS,
            duplicate_policy: DuplicatePolicy::Skip,
            schedule_minutes: None,
            web_port: 8000,
            export_dir: PathBuf::from("exports"),
            api_key: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("VTREND_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_path),
            api_key_file: std::env::var("VTREND_API_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.api_key_file),
            encryption_key_file: std::env::var("VTREND_ENCRYPTION_KEY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.encryption_key_file),
            api_base_url: std::env::var("VTREND_API_BASE_URL").unwrap_or(defaults.api_base_url),
            http_timeout_secs: std::env::var("VTREND_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: std::env::var("VTREND_USER_AGENT").unwrap_or(defaults.user_agent),
            country: std::env::var("VTREND_COUNTRY").unwrap_or(defaults.country),
            max_results: std::env::var("VTREND_MAX_RESULTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_results),
            duplicate_policy: std::env::var("VTREND_DUPLICATE_POLICY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.duplicate_policy),
            schedule_minutes: std::env::var("VTREND_SCHEDULE_MINUTES")
                .ok()
                .and_then(|v| v.parse().ok()),
            web_port: std::env::var("VTREND_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.web_port),
            export_dir: std::env::var("VTREND_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),
            api_key: std::env::var("VTREND_API_KEY")
                .ok()
                .filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn credential_store(&self) -> CredentialStore {
        CredentialStore::new(&self.encryption_key_file, &self.api_key_file)
    }

    pub fn fetch_client_config(&self) -> FetchClientConfig {
        FetchClientConfig {
            base_url: self.api_base_url.clone(),
            timeout: Duration::from_secs(self.http_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    fn initial_params(&self, api_key: String) -> AcquisitionParams {
        AcquisitionParams::new(api_key, self.country.clone())
            .with_max_results(self.max_results)
            .with_policy(self.duplicate_policy)
    }
}

/// Sink for the human-readable progress lines a cycle emits. Manual and
/// scheduled cycles may write to the same sink at once.
pub trait CycleLog: Send + Sync {
    fn line(&self, message: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLog;

impl CycleLog for TracingLog {
    fn line(&self, message: &str) {
        info!(target: "vtrend::cycle", "{message}");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutLog;

impl CycleLog for StdoutLog {
    fn line(&self, message: &str) {
        println!("{message}");
    }
}

/// Bounded in-memory log; oldest lines fall off once `capacity` is reached.
#[derive(Debug)]
pub struct MemoryLog {
    capacity: usize,
    lines: Mutex<VecDeque<String>>,
}

impl MemoryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            lines: Mutex::new(VecDeque::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(500)
    }
}

impl CycleLog for MemoryLog {
    fn line(&self, message: &str) {
        let mut lines = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(message.to_string());
    }
}

pub struct FanoutLog {
    sinks: Vec<Arc<dyn CycleLog>>,
}

impl FanoutLog {
    pub fn new(sinks: Vec<Arc<dyn CycleLog>>) -> Self {
        Self { sinks }
    }
}

impl CycleLog for FanoutLog {
    fn line(&self, message: &str) {
        for sink in &self.sinks {
            sink.line(message);
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("cycle failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("cycle failed: {0}")]
    Storage(#[from] StorageError),
    #[error("cycle task did not finish: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub country: String,
    pub policy: DuplicatePolicy,
    pub fetched: usize,
    pub outcomes: Vec<Outcome>,
}

impl CycleReport {
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.iter().filter(|o| **o == outcome).count()
    }
}

pub struct AcquisitionOrchestrator {
    source: Arc<dyn TrendingSource>,
    store: VideoStore,
}

impl AcquisitionOrchestrator {
    pub fn new(source: Arc<dyn TrendingSource>, store: VideoStore) -> Self {
        Self { source, store }
    }

    pub fn store(&self) -> &VideoStore {
        &self.store
    }

    /// One fetch-then-reconcile cycle. Cycles are not serialized against each
    /// other; the store's per-video locking keeps concurrent runs consistent.
    pub async fn run_cycle(
        &self,
        params: &AcquisitionParams,
        log: &dyn CycleLog,
    ) -> Result<CycleReport, CycleError> {
        let result = match params.validate() {
            Ok(validated) => self.execute(validated, log).await,
            Err(err) => Err(err.into()),
        };
        if let Err(err) = &result {
            log.line(&format!("Error: {err}"));
            warn!(error = %err, "acquisition cycle failed");
        }
        result
    }

    async fn execute(
        &self,
        params: ValidatedParams,
        log: &dyn CycleLog,
    ) -> Result<CycleReport, CycleError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "cycle",
            %run_id,
            country = params.country_code,
            policy = %params.policy
        );

        async {
            let started_at = Utc::now();
            log.line("Starting data scraping...");

            let records = self
                .source
                .fetch(&params.api_key, params.country_code, params.max_results)
                .await?;
            log.line(&format!(
                "Fetched {} videos for country: {}",
                records.len(),
                params.country_code
            ));

            let outcomes = self.store.reconcile(&records, params.policy).await?;
            for (record, outcome) in records.iter().zip(&outcomes) {
                let line = match outcome {
                    Outcome::Inserted => continue,
                    Outcome::Skipped => "Skipped duplicate record",
                    Outcome::Updated => "Overwrote duplicate record",
                    Outcome::InsertedAsDuplicate => "Ignored duplicate and added new record",
                };
                log.line(&format!("{line} for Video ID {}.", record.video_id));
            }
            log.line("Data saved to the database.");

            let report = CycleReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                country: params.country_code.to_string(),
                policy: params.policy,
                fetched: records.len(),
                outcomes,
            };
            info!(
                fetched = report.fetched,
                inserted = report.count(Outcome::Inserted),
                updated = report.count(Outcome::Updated),
                skipped = report.count(Outcome::Skipped),
                duplicates = report.count(Outcome::InsertedAsDuplicate),
                "cycle finished"
            );
            log.line("Data scraping completed!");
            Ok(report)
        }
        .instrument(span)
        .await
    }
}

/// Shared, updatable acquisition parameters.
#[derive(Debug, Clone)]
pub struct LiveParams(Arc<RwLock<AcquisitionParams>>);

impl LiveParams {
    pub fn new(params: AcquisitionParams) -> Self {
        Self(Arc::new(RwLock::new(params)))
    }

    pub fn get(&self) -> AcquisitionParams {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn set(&self, params: AcquisitionParams) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = params;
    }

    pub fn update(&self, f: impl FnOnce(&mut AcquisitionParams)) -> AcquisitionParams {
        let mut guard = self.0.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard);
        guard.clone()
    }
}

/// Where a scheduled trigger takes its parameters from when it fires.
#[derive(Debug, Clone)]
pub enum ParamsSource {
    /// Parameters captured when the trigger was created.
    Snapshot(AcquisitionParams),
    /// Whatever the live parameters hold at fire time.
    Live(LiveParams),
}

impl ParamsSource {
    pub fn resolve(&self) -> AcquisitionParams {
        match self {
            Self::Snapshot(params) => params.clone(),
            Self::Live(live) => live.get(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("schedule interval is too large")]
    IntervalTooLarge,
    #[error("job scheduler: {0:?}")]
    Scheduler(JobSchedulerError),
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        Self::Scheduler(err)
    }
}

/// Recurring acquisition triggers. Triggers are append-only and independent:
/// registering the same interval twice yields two triggers.
pub struct CycleScheduler {
    sched: JobScheduler,
    orchestrator: Arc<AcquisitionOrchestrator>,
    log: Arc<dyn CycleLog>,
    entries: Arc<Mutex<Vec<ScheduleEntry>>>,
}

impl CycleScheduler {
    pub async fn start(
        orchestrator: Arc<AcquisitionOrchestrator>,
        log: Arc<dyn CycleLog>,
    ) -> Result<Self, SchedulerError> {
        let sched = JobScheduler::new().await?;
        sched.start().await?;
        Ok(Self {
            sched,
            orchestrator,
            log,
            entries: Arc::default(),
        })
    }

    pub async fn schedule_every(
        &self,
        minutes: u32,
        params: ParamsSource,
    ) -> Result<ScheduleEntry, SchedulerError> {
        if minutes == 0 {
            return Err(ValidationError::ZeroInterval.into());
        }
        self.schedule_interval(Duration::from_secs(u64::from(minutes) * 60), minutes, params)
            .await
    }

    async fn schedule_interval(
        &self,
        interval: Duration,
        interval_minutes: u32,
        params: ParamsSource,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let step =
            chrono::Duration::from_std(interval).map_err(|_| SchedulerError::IntervalTooLarge)?;
        let orchestrator = Arc::clone(&self.orchestrator);
        let log = Arc::clone(&self.log);
        let entries = Arc::clone(&self.entries);

        let job = Job::new_repeated_async(interval, move |job_id, _sched| {
            let orchestrator = Arc::clone(&orchestrator);
            let log = Arc::clone(&log);
            let entries = Arc::clone(&entries);
            let params = params.clone();
            Box::pin(async move {
                advance_next_fire(&entries, job_id, step);
                run_scheduled_cycle(&orchestrator, &params, log.as_ref()).await;
            })
        })?;
        let job_id = self.sched.add(job).await?;

        let entry = ScheduleEntry {
            id: job_id.to_string(),
            interval_minutes,
            next_fire_time: Utc::now() + step,
        };
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        info!(job_id = %job_id, interval_minutes, "scheduled recurring acquisition");
        Ok(entry)
    }

    pub fn entries(&self) -> Vec<ScheduleEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop future firings. A cycle already running is left to finish.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        let mut sched = self.sched.clone();
        sched.shutdown().await?;
        info!("scheduler stopped");
        Ok(())
    }
}

fn advance_next_fire(entries: &Mutex<Vec<ScheduleEntry>>, job_id: Uuid, step: chrono::Duration) {
    let id = job_id.to_string();
    let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(entry) = entries.iter_mut().find(|e| e.id == id) {
        entry.next_fire_time = Utc::now() + step;
    }
}

async fn run_scheduled_cycle(
    orchestrator: &AcquisitionOrchestrator,
    params: &ParamsSource,
    log: &dyn CycleLog,
) {
    let params = params.resolve();
    match orchestrator.run_cycle(&params, log).await {
        Ok(report) => {
            log.line("Scheduled scraping completed successfully.");
            info!(run_id = %report.run_id, "scheduled cycle completed");
        }
        Err(err) => {
            log.line(&format!("Scheduled scraping failed: {err}"));
            warn!(error = %err, "scheduled cycle failed; trigger stays registered");
        }
    }
}

pub const CSV_HEADER: [&str; 8] = [
    "ID",
    "Video ID",
    "Title",
    "Published At",
    "Channel Title",
    "View Count",
    "Like Count",
    "Comment Count",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExportOutcome {
    /// The table is empty; nothing was written.
    NoData,
    Written { path: PathBuf, rows: usize },
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("encoding CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error("export path `{0}` must be a relative path inside the export directory")]
    UnsafePath(String),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Encode rows under [`CSV_HEADER`]. Each row has exactly the header's eight
/// columns; `country` is intentionally not exported.
pub fn rows_to_csv(rows: &[StoredRow]) -> Result<Vec<u8>, ExportError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(CSV_HEADER)?;
    for row in rows {
        let r = &row.record;
        writer.write_record([
            row.row_id.to_string(),
            r.video_id.clone(),
            r.title.clone(),
            r.published_at.clone(),
            r.channel_title.clone(),
            r.view_count.to_string(),
            r.like_count.to_string(),
            r.comment_count.to_string(),
        ])?;
    }
    writer.into_inner().map_err(|err| ExportError::Io {
        action: "flushing",
        path: "<csv buffer>".to_string(),
        source: err.into_error(),
    })
}

/// Resolve a caller-supplied export name under `export_dir`. Absolute paths,
/// `..` and anything else that could leave the directory are rejected.
pub fn resolve_export_path(
    export_dir: &Path,
    requested: impl AsRef<Path>,
) -> Result<PathBuf, ExportError> {
    let requested = requested.as_ref();
    let unsafe_path = || ExportError::UnsafePath(requested.display().to_string());
    let mut resolved = export_dir.to_path_buf();
    let mut pushed = false;
    for component in requested.components() {
        match component {
            Component::Normal(part) => {
                resolved.push(part);
                pushed = true;
            }
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path())
            }
        }
    }
    if !pushed {
        return Err(unsafe_path());
    }
    Ok(resolved)
}

/// Export every stored row to `path`. An empty table is reported as
/// [`ExportOutcome::NoData`] and leaves the filesystem untouched.
pub async fn export_to_csv(
    store: &VideoStore,
    path: impl AsRef<Path>,
) -> Result<ExportOutcome, ExportError> {
    let path = path.as_ref();
    let rows = store.all_rows().await?;
    if rows.is_empty() {
        return Ok(ExportOutcome::NoData);
    }
    let bytes = rows_to_csv(&rows)?;

    let temp_path = path.with_file_name(format!(".{}.csv.tmp", Uuid::new_v4()));
    fs::write(&temp_path, &bytes)
        .await
        .map_err(|source| ExportError::Io {
            action: "writing",
            path: temp_path.display().to_string(),
            source,
        })?;
    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(ExportError::Io {
            action: "renaming export onto",
            path: path.display().to_string(),
            source,
        });
    }

    Ok(ExportOutcome::Written {
        path: path.to_path_buf(),
        rows: rows.len(),
    })
}

/// Partial update of the live acquisition parameters.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ParamsUpdate {
    pub api_key: Option<String>,
    pub country: Option<String>,
    pub max_results: Option<u32>,
    pub policy: Option<DuplicatePolicy>,
}

/// Entry points used by the presentation layers.
pub struct TrendService {
    store: VideoStore,
    credentials: CredentialStore,
    orchestrator: Arc<AcquisitionOrchestrator>,
    scheduler: CycleScheduler,
    live: LiveParams,
    export_dir: PathBuf,
    memory_log: Arc<MemoryLog>,
    log: Arc<dyn CycleLog>,
}

impl TrendService {
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        Self::from_config_with_log(config, Arc::new(TracingLog)).await
    }

    /// Like [`TrendService::from_config`], mirroring cycle lines to `sink`
    /// in addition to the in-memory buffer.
    pub async fn from_config_with_log(config: &AppConfig, sink: Arc<dyn CycleLog>) -> Result<Self> {
        let store = VideoStore::open(&config.database_path)
            .await
            .with_context(|| format!("opening {}", config.database_path.display()))?;
        let source = YouTubeTrendingClient::new(config.fetch_client_config())?;
        let service = Self::assemble(config, store, Arc::new(source), sink).await?;
        if let Some(minutes) = config.schedule_minutes {
            service
                .schedule_every(minutes)
                .await
                .with_context(|| format!("scheduling startup trigger every {minutes} minutes"))?;
        }
        Ok(service)
    }

    /// Assemble a service around an already opened store and any source.
    pub async fn with_source(
        config: &AppConfig,
        store: VideoStore,
        source: Arc<dyn TrendingSource>,
    ) -> Result<Self> {
        Self::assemble(config, store, source, Arc::new(TracingLog)).await
    }

    async fn assemble(
        config: &AppConfig,
        store: VideoStore,
        source: Arc<dyn TrendingSource>,
        sink: Arc<dyn CycleLog>,
    ) -> Result<Self> {
        let memory_log = Arc::new(MemoryLog::default());
        let log: Arc<dyn CycleLog> = Arc::new(FanoutLog::new(vec![
            memory_log.clone() as Arc<dyn CycleLog>,
            sink,
        ]));

        let credentials = config.credential_store();
        let api_key = match &config.api_key {
            Some(key) => key.clone(),
            None => match credentials.load_api_key().await {
                Ok(Some(key)) => {
                    log.line("API Key loaded successfully.");
                    key
                }
                Ok(None) => String::new(),
                Err(err) => {
                    log.line(&format!("Failed to decrypt API Key: {err}"));
                    String::new()
                }
            },
        };

        let orchestrator = Arc::new(AcquisitionOrchestrator::new(source, store.clone()));
        let scheduler = CycleScheduler::start(Arc::clone(&orchestrator), Arc::clone(&log))
            .await
            .context("starting scheduler")?;

        Ok(Self {
            store,
            credentials,
            orchestrator,
            scheduler,
            live: LiveParams::new(config.initial_params(api_key)),
            export_dir: config.export_dir.clone(),
            memory_log,
            log,
        })
    }

    pub fn store(&self) -> &VideoStore {
        &self.store
    }

    pub fn params(&self) -> AcquisitionParams {
        self.live.get()
    }

    pub fn live_params(&self) -> LiveParams {
        self.live.clone()
    }

    pub fn update_params(&self, update: ParamsUpdate) -> AcquisitionParams {
        self.live.update(|params| {
            if let Some(api_key) = update.api_key {
                params.api_key = api_key;
            }
            if let Some(country) = update.country {
                params.country = country;
            }
            if let Some(max_results) = update.max_results {
                params.max_results = max_results;
            }
            if let Some(policy) = update.policy {
                params.policy = policy;
            }
        })
    }

    /// Encrypt and persist the key, then use it for subsequent cycles.
    pub async fn save_api_key(&self, api_key: &str) -> Result<(), CredentialError> {
        self.credentials.save_api_key(api_key).await?;
        let api_key = api_key.trim().to_string();
        self.live.update(|params| params.api_key = api_key);
        self.log.line("API Key saved and encrypted successfully!");
        Ok(())
    }

    pub async fn start_scraping(&self) -> Result<CycleReport, CycleError> {
        self.start_scraping_with(&self.live.get()).await
    }

    /// Run one cycle on its own task. Dropping the returned future does not
    /// stop the cycle; it still runs to completion or failure and logs either.
    pub async fn start_scraping_with(
        &self,
        params: &AcquisitionParams,
    ) -> Result<CycleReport, CycleError> {
        let orchestrator = Arc::clone(&self.orchestrator);
        let log = Arc::clone(&self.log);
        let params = params.clone();
        let handle =
            tokio::spawn(async move { orchestrator.run_cycle(&params, log.as_ref()).await });
        handle.await?
    }

    /// Register a trigger that reads the live parameters each time it fires.
    pub async fn schedule_every(&self, minutes: u32) -> Result<ScheduleEntry, SchedulerError> {
        self.schedule_every_with(minutes, ParamsSource::Live(self.live.clone()))
            .await
    }

    pub async fn schedule_every_with(
        &self,
        minutes: u32,
        params: ParamsSource,
    ) -> Result<ScheduleEntry, SchedulerError> {
        let entry = self.scheduler.schedule_every(minutes, params).await?;
        self.log
            .line(&format!("Scraping scheduled every {minutes} minutes."));
        Ok(entry)
    }

    pub fn schedules(&self) -> Vec<ScheduleEntry> {
        self.scheduler.entries()
    }

    pub async fn export_to_csv(&self, path: impl AsRef<Path>) -> Result<ExportOutcome, ExportError> {
        let outcome = export_to_csv(&self.store, path).await?;
        match &outcome {
            ExportOutcome::NoData => self.log.line("No data available to export."),
            ExportOutcome::Written { path, .. } => {
                self.log
                    .line(&format!("Data exported to {}", path.display()))
            }
        }
        Ok(outcome)
    }

    /// Export to `name` resolved inside the configured export directory,
    /// creating the directory when needed.
    pub async fn export_named(&self, name: impl AsRef<Path>) -> Result<ExportOutcome, ExportError> {
        let path = resolve_export_path(&self.export_dir, name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| ExportError::Io {
                    action: "creating",
                    path: parent.display().to_string(),
                    source,
                })?;
        }
        self.export_to_csv(path).await
    }

    pub fn export_dir(&self) -> &Path {
        &self.export_dir
    }

    pub async fn list_rows(&self) -> Result<Vec<StoredRow>, StorageError> {
        self.store.all_rows().await
    }

    pub async fn top_channels_by_views(&self) -> Result<Vec<ChannelViews>, StorageError> {
        self.store.top_channels_by_views(DEFAULT_TOP_CHANNELS).await
    }

    pub async fn counts_by_country(&self) -> Result<Vec<CountryCount>, StorageError> {
        self.store.counts_by_country().await
    }

    pub async fn views_by_date(&self) -> Result<Vec<DateViews>, StorageError> {
        self.store.views_by_publish_date().await
    }

    pub fn recent_log(&self) -> Vec<String> {
        self.memory_log.lines()
    }

    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.scheduler.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;
    use vtrend_core::Record;

    fn record(video_id: &str, views: u64) -> Record {
        Record {
            video_id: video_id.to_string(),
            title: format!("Video {video_id}"),
            channel_title: "Channel".to_string(),
            published_at: "2024-04-10T10:00:00Z".to_string(),
            view_count: views,
            like_count: 1,
            comment_count: 2,
            country: "US".to_string(),
        }
    }

    /// Serves a fixed batch, failing the first `fail_first` calls with a quota error.
    struct StubSource {
        records: Vec<Record>,
        fail_first: usize,
        delay: Duration,
        calls: AtomicUsize,
        last_country: Mutex<Option<String>>,
    }

    impl StubSource {
        fn new(records: Vec<Record>) -> Self {
            Self {
                records,
                fail_first: 0,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
                last_country: Mutex::new(None),
            }
        }

        fn failing_first(mut self, n: usize) -> Self {
            self.fail_first = n;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl TrendingSource for StubSource {
        fn name(&self) -> &'static str {
            "stub"
        }

        async fn fetch(
            &self,
            _api_key: &str,
            country_code: &str,
            max_results: u32,
        ) -> Result<Vec<Record>, FetchError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            *self.last_country.lock().unwrap() = Some(country_code.to_string());
            if call < self.fail_first {
                return Err(FetchError::Api {
                    status: 403,
                    message: "quota exceeded".into(),
                });
            }
            Ok(self
                .records
                .iter()
                .take(max_results as usize)
                .cloned()
                .map(|mut r| {
                    r.country = country_code.to_string();
                    r
                })
                .collect())
        }
    }

    async fn orchestrator_with(source: Arc<StubSource>) -> (tempfile::TempDir, AcquisitionOrchestrator) {
        let dir = tempdir().unwrap();
        let store = VideoStore::open(dir.path().join("videos.db")).await.unwrap();
        (dir, AcquisitionOrchestrator::new(source, store))
    }

    fn test_config(dir: &Path) -> AppConfig {
        AppConfig {
            database_path: dir.join("videos.db"),
            api_key_file: dir.join("api_key.enc"),
            encryption_key_file: dir.join("encryption.key"),
            export_dir: dir.join("exports"),
            api_key: Some("test-key".into()),
            ..AppConfig::default()
        }
    }

    async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        tokio::time::timeout(timeout, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok()
    }

    #[tokio::test]
    async fn invalid_params_never_reach_the_source() {
        let source = Arc::new(StubSource::new(vec![record("a", 1)]));
        let (_dir, orchestrator) = orchestrator_with(source.clone()).await;
        let log = MemoryLog::default();

        for max_results in [0, 51] {
            let params = AcquisitionParams::new("key", "US").with_max_results(max_results);
            let err = orchestrator.run_cycle(&params, &log).await.unwrap_err();
            assert!(matches!(
                err,
                CycleError::Validation(ValidationError::MaxResultsOutOfRange(n)) if n == max_results
            ));
        }
        let err = orchestrator
            .run_cycle(&AcquisitionParams::new("", "US"), &log)
            .await
            .unwrap_err();
        assert!(matches!(err, CycleError::Validation(ValidationError::EmptyApiKey)));

        assert_eq!(source.calls(), 0);
        assert!(log.contains("Error: Please provide a valid API key."));
    }

    #[tokio::test]
    async fn every_valid_max_results_passes_validation() {
        let source = Arc::new(StubSource::new(vec![record("a", 1)]));
        let (_dir, orchestrator) = orchestrator_with(source.clone()).await;
        for max_results in 1..=50 {
            let params = AcquisitionParams::new("key", "US").with_max_results(max_results);
            assert!(orchestrator.run_cycle(&params, &TracingLog).await.is_ok());
        }
        assert_eq!(source.calls(), 50);
    }

    #[tokio::test]
    async fn fetch_failure_skips_reconciliation() {
        let source = Arc::new(StubSource::new(vec![record("a", 1)]).failing_first(1));
        let (_dir, orchestrator) = orchestrator_with(source.clone()).await;
        let log = MemoryLog::default();

        let err = orchestrator
            .run_cycle(&AcquisitionParams::new("key", "US"), &log)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CycleError::Fetch(FetchError::Api { ref message, .. }) if message == "quota exceeded"
        ));
        assert_eq!(orchestrator.store().row_count().await.unwrap(), 0);
        assert!(log.contains("Error: cycle failed: API Error: quota exceeded"));
    }

    #[tokio::test]
    async fn successful_cycle_reports_outcomes_and_logs_steps() {
        let source = Arc::new(StubSource::new(vec![record("a", 1), record("b", 2)]));
        let (_dir, orchestrator) = orchestrator_with(source.clone()).await;
        let log = MemoryLog::default();
        let params = AcquisitionParams::new("key", "Germany");

        let first = orchestrator.run_cycle(&params, &log).await.unwrap();
        assert_eq!(first.fetched, 2);
        assert_eq!(first.country, "DE");
        assert_eq!(first.count(Outcome::Inserted), 2);
        assert_eq!(source.last_country.lock().unwrap().as_deref(), Some("DE"));

        let second = orchestrator.run_cycle(&params, &log).await.unwrap();
        assert_eq!(second.outcomes, vec![Outcome::Skipped, Outcome::Skipped]);
        assert_eq!(orchestrator.store().row_count().await.unwrap(), 2);

        let lines = log.lines();
        assert_eq!(
            &lines[..4],
            &[
                "Starting data scraping...".to_string(),
                "Fetched 2 videos for country: DE".to_string(),
                "Data saved to the database.".to_string(),
                "Data scraping completed!".to_string(),
            ]
        );
        assert!(log.contains("Skipped duplicate record for Video ID a."));
    }

    #[tokio::test]
    async fn policies_are_reported_per_record() {
        let source = Arc::new(StubSource::new(vec![record("a", 1)]));
        let (_dir, orchestrator) = orchestrator_with(source).await;
        let log = MemoryLog::default();
        let base = AcquisitionParams::new("key", "US");

        orchestrator.run_cycle(&base, &log).await.unwrap();
        let overwrite = base.clone().with_policy(DuplicatePolicy::Overwrite);
        let report = orchestrator.run_cycle(&overwrite, &log).await.unwrap();
        assert_eq!(report.outcomes, vec![Outcome::Updated]);
        let ignore = base.with_policy(DuplicatePolicy::Ignore);
        let report = orchestrator.run_cycle(&ignore, &log).await.unwrap();
        assert_eq!(report.outcomes, vec![Outcome::InsertedAsDuplicate]);

        assert!(log.contains("Overwrote duplicate record for Video ID a."));
        assert!(log.contains("Ignored duplicate and added new record for Video ID a."));
        assert_eq!(orchestrator.store().rows_for_video("a").await.unwrap().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn overlapping_cycles_do_not_double_insert() {
        let batch: Vec<Record> = (0..20).map(|i| record(&format!("v{i}"), i)).collect();
        let source = Arc::new(StubSource::new(batch));
        let (_dir, orchestrator) = orchestrator_with(source).await;
        let orchestrator = Arc::new(orchestrator);
        let log = Arc::new(MemoryLog::default());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let orchestrator = Arc::clone(&orchestrator);
            let log = Arc::clone(&log);
            handles.push(tokio::spawn(async move {
                let params = AcquisitionParams::new("key", "US");
                orchestrator.run_cycle(&params, log.as_ref()).await
            }));
        }
        let mut inserted = 0;
        for handle in handles {
            inserted += handle.await.unwrap().unwrap().count(Outcome::Inserted);
        }
        assert_eq!(inserted, 20);
        assert_eq!(orchestrator.store().row_count().await.unwrap(), 20);
    }

    #[test]
    fn live_params_are_read_at_resolve_time_snapshots_are_not() {
        let live = LiveParams::new(AcquisitionParams::new("key", "US"));
        let snapshot = ParamsSource::Snapshot(live.get());
        let source = ParamsSource::Live(live.clone());

        live.update(|p| p.country = "FR".into());
        assert_eq!(source.resolve().country, "FR");
        assert_eq!(snapshot.resolve().country, "US");
    }

    #[test]
    fn memory_log_drops_oldest_lines_past_capacity() {
        let log = MemoryLog::new(2);
        log.line("one");
        log.line("two");
        log.line("three");
        assert_eq!(log.lines(), vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn csv_rows_follow_the_export_header() {
        let rows = vec![StoredRow {
            row_id: 7,
            record: Record {
                title: "Hello, \"world\"".into(),
                ..record("abc", 10)
            },
        }];
        let text = String::from_utf8(rows_to_csv(&rows).unwrap()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "ID,Video ID,Title,Published At,Channel Title,View Count,Like Count,Comment Count"
        );
        assert_eq!(
            lines[1],
            "7,abc,\"Hello, \"\"world\"\"\",2024-04-10T10:00:00Z,Channel,10,1,2"
        );
        assert_eq!(lines.len(), 2);
    }

    #[tokio::test]
    async fn empty_table_exports_no_data_and_writes_nothing() {
        let dir = tempdir().unwrap();
        let store = VideoStore::open(dir.path().join("videos.db")).await.unwrap();
        let target = dir.path().join("out.csv");

        assert_eq!(export_to_csv(&store, &target).await.unwrap(), ExportOutcome::NoData);
        assert!(!target.exists());

        store
            .reconcile(&[record("a", 1), record("b", 2)], DuplicatePolicy::Skip)
            .await
            .unwrap();
        assert_eq!(
            export_to_csv(&store, &target).await.unwrap(),
            ExportOutcome::Written { path: target.clone(), rows: 2 }
        );
        let written = std::fs::read_to_string(&target).unwrap();
        assert_eq!(written.lines().count(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn schedule_rejects_zero_and_appends_duplicates() {
        let source = Arc::new(StubSource::new(vec![]));
        let (_dir, orchestrator) = orchestrator_with(source).await;
        let scheduler = CycleScheduler::start(Arc::new(orchestrator), Arc::new(MemoryLog::default()))
            .await
            .unwrap();
        let params = ParamsSource::Snapshot(AcquisitionParams::new("key", "US"));

        assert!(matches!(
            scheduler.schedule_every(0, params.clone()).await,
            Err(SchedulerError::Validation(ValidationError::ZeroInterval))
        ));

        let before = Utc::now();
        let first = scheduler.schedule_every(10, params.clone()).await.unwrap();
        let second = scheduler.schedule_every(10, params).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(scheduler.entries().len(), 2);
        assert!(first.next_fire_time >= before + chrono::Duration::minutes(10));
        assert!(first.next_fire_time <= Utc::now() + chrono::Duration::minutes(10));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_scheduled_cycle_does_not_stop_later_ones() {
        let source = Arc::new(StubSource::new(vec![record("a", 1)]).failing_first(1));
        let (_dir, orchestrator) = orchestrator_with(source.clone()).await;
        let orchestrator = Arc::new(orchestrator);
        let log = Arc::new(MemoryLog::default());
        let scheduler = CycleScheduler::start(Arc::clone(&orchestrator), log.clone())
            .await
            .unwrap();

        let live = LiveParams::new(AcquisitionParams::new("key", "US"));
        scheduler
            .schedule_interval(Duration::from_secs(1), 1, ParamsSource::Live(live.clone()))
            .await
            .unwrap();
        live.update(|p| p.country = "IN".into());

        let fired_twice = wait_until(Duration::from_secs(15), || source.calls() >= 2).await;
        assert!(fired_twice, "trigger stopped after a failed cycle");
        assert!(
            wait_until(Duration::from_secs(5), || {
                log.contains("Scheduled scraping completed successfully.")
            })
            .await
        );
        assert!(log.contains("Scheduled scraping failed: cycle failed: API Error: quota exceeded"));
        assert_eq!(source.last_country.lock().unwrap().as_deref(), Some("IN"));

        scheduler.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn service_exposes_collaborator_operations() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = VideoStore::open(&config.database_path).await.unwrap();
        let source = Arc::new(StubSource::new(vec![record("a", 5), record("b", 9)]));
        let service = TrendService::with_source(&config, store, source).await.unwrap();

        let export_path = dir.path().join("export.csv");
        assert_eq!(service.export_to_csv(&export_path).await.unwrap(), ExportOutcome::NoData);

        service.update_params(ParamsUpdate {
            country: Some("AU".into()),
            max_results: Some(1),
            ..ParamsUpdate::default()
        });
        let report = service.start_scraping().await.unwrap();
        assert_eq!(report.country, "AU");
        assert_eq!(report.fetched, 1);

        let rows = service.list_rows().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].record.country, "AU");
        assert_eq!(service.counts_by_country().await.unwrap()[0].country, "AU");
        assert_eq!(service.top_channels_by_views().await.unwrap()[0].total_views, 5);
        assert_eq!(service.views_by_date().await.unwrap()[0].date, "2024-04-10");

        assert!(matches!(
            service.export_to_csv(&export_path).await.unwrap(),
            ExportOutcome::Written { rows: 1, .. }
        ));

        service.schedule_every(30).await.unwrap();
        service.schedule_every(30).await.unwrap();
        assert_eq!(service.schedules().len(), 2);

        let log = service.recent_log();
        assert!(log.iter().any(|l| l == "No data available to export."));
        assert!(log.iter().any(|l| l == "Scraping scheduled every 30 minutes."));
        assert!(log.iter().any(|l| l.starts_with("Data exported to ")));

        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn service_loads_saved_key_when_no_override() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.api_key = None;
        config
            .credential_store()
            .save_api_key("stored-key")
            .await
            .unwrap();

        let store = VideoStore::in_memory().await.unwrap();
        let service = TrendService::with_source(&config, store, Arc::new(StubSource::new(vec![])))
            .await
            .unwrap();
        assert_eq!(service.params().api_key, "stored-key");
        assert!(service
            .recent_log()
            .contains(&"API Key loaded successfully.".to_string()));

        service.save_api_key(" rotated ").await.unwrap();
        assert_eq!(service.params().api_key, "rotated");
        service.shutdown().await.unwrap();
    }

    #[test]
    fn export_names_stay_inside_the_export_directory() {
        let root = Path::new("/srv/exports");
        assert_eq!(
            resolve_export_path(root, "daily/us.csv").unwrap(),
            root.join("daily").join("us.csv")
        );
        assert_eq!(resolve_export_path(root, "./out.csv").unwrap(), root.join("out.csv"));
        for bad in ["../victim.txt", "a/../../etc/passwd", "/etc/passwd", "", "."] {
            assert!(
                matches!(resolve_export_path(root, bad), Err(ExportError::UnsafePath(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_scrape_future_still_finishes_the_cycle() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = VideoStore::open(&config.database_path).await.unwrap();
        let batch: Vec<Record> = (0..300).map(|i| record(&format!("v{i}"), i)).collect();
        let source = Arc::new(StubSource::new(batch).delayed(Duration::from_millis(200)));
        let service = TrendService::with_source(&config, store, source).await.unwrap();
        service.update_params(ParamsUpdate {
            max_results: Some(50),
            ..ParamsUpdate::default()
        });

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), service.start_scraping()).await;
        assert!(abandoned.is_err());

        let finished = wait_until(Duration::from_secs(10), || {
            service
                .recent_log()
                .iter()
                .any(|l| l == "Data scraping completed!")
        })
        .await;
        assert!(finished, "cycle stopped when its caller went away");
        assert_eq!(service.store().row_count().await.unwrap(), 50);
        service.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn named_export_writes_under_export_dir_and_rejects_escapes() {
        let dir = tempdir().unwrap();
        let config = test_config(dir.path());
        let store = VideoStore::open(&config.database_path).await.unwrap();
        store
            .reconcile(&[record("a", 1)], DuplicatePolicy::Skip)
            .await
            .unwrap();
        let service = TrendService::with_source(&config, store, Arc::new(StubSource::new(vec![])))
            .await
            .unwrap();

        let victim = dir.path().join("victim.txt");
        std::fs::write(&victim, "important").unwrap();
        let err = service.export_named("../victim.txt").await.unwrap_err();
        assert!(matches!(err, ExportError::UnsafePath(_)));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "important");

        let outcome = service.export_named("runs/today.csv").await.unwrap();
        let expected = dir.path().join("exports").join("runs").join("today.csv");
        assert_eq!(outcome, ExportOutcome::Written { path: expected.clone(), rows: 1 });
        assert!(expected.exists());
        service.shutdown().await.unwrap();
    }
}
