//! Runtime supervision: YAML configuration loading, the scan orchestrator
//! with its four schedules, bounded health tracking with operator alerts,
//! and the Telegram command listener.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Local;
use fjr_analyze::{JobAnalyzer, ScoringEngine};
use fjr_core::{CycleStats, FreelancerProfile, Recommendation};
use fjr_notify::{
    escape_html, format_system_status, Channel, Dispatcher, SystemStatus, TelegramChannel,
    TelegramSettings,
};
use fjr_scrape::{ScrapePipeline, ScraperSettings};
use fjr_storage::{CircuitBreaker, SqliteStore};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use serde_yaml::{Mapping, Value as YamlValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fjr-monitor";

// ── configuration ────────────────────────────────────────────────────────

/// Everything that can go wrong between reading the two YAML documents and
/// handing validated settings to the runtime.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {}", .0.display())]
    NotFound(PathBuf),
    #[error("configuration file is empty: {}", .0.display())]
    Empty(PathBuf),
    #[error(
        "environment variable '${{{0}}}' is required but not set; \
         add it to your .env file or export it in your shell"
    )]
    MissingEnvVar(String),
    #[error("missing required configuration keys in '{section}': {keys}")]
    MissingKeys { section: String, keys: String },
    #[error("scoring weights must sum to 1.0, got {total:.4}; current weights: {weights}")]
    BadWeights { total: f64, weights: String },
    #[error("invalid yaml in {}: {source}", .path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Validated runtime settings: the `settings.yaml` sections plus the
/// freelancer profile document.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub scraper: ScraperSettings,
    pub ai: fjr_analyze::AiSettings,
    pub telegram: TelegramSettings,
    pub scoring: fjr_analyze::ScoringSettings,
    pub profile: FreelancerProfile,
    pub database_path: PathBuf,
    pub log_level: String,
}

/// Load and validate both configuration documents.
///
/// `${VAR}` placeholders anywhere in either document are substituted from
/// the environment before validation; a referenced-but-unset variable is a
/// hard error even if the value would go unused.
pub fn load_config(settings_path: &Path, profile_path: &Path) -> Result<AppConfig, ConfigError> {
    let mut settings = read_document(settings_path)?;
    let profile_doc = read_document(profile_path)?;

    validate_keys(
        &settings,
        "settings",
        &["scraper", "ai", "telegram", "scoring", "database", "logging"],
    )?;
    validate_keys(
        &settings["scraper"],
        "scraper",
        &[
            "base_url",
            "projects_url",
            "xhr_endpoint",
            "scan_interval_seconds",
            "max_pages_per_scan",
            "request_delay_seconds",
            "max_retries",
            "timeout_seconds",
            "user_agents",
        ],
    )?;
    validate_keys(
        &settings["ai"],
        "ai",
        &["primary_provider", "fallback_provider", "gemini", "groq"],
    )?;
    for provider in ["gemini", "groq"] {
        validate_keys(
            &settings["ai"][provider],
            &format!("ai.{provider}"),
            &["api_key", "model", "max_tokens", "temperature", "rpm_limit"],
        )?;
    }
    validate_keys(
        &settings["telegram"],
        "telegram",
        &[
            "bot_token",
            "chat_id",
            "instant_alert_threshold",
            "digest_threshold",
            "digest_interval_minutes",
            "daily_report_hour",
            "daily_report_minute",
        ],
    )?;
    validate_keys(&settings["scoring"], "scoring", &["weights", "bonuses", "penalties"])?;
    validate_keys(
        &profile_doc,
        "profile",
        &["name", "skills", "experience_years", "preferences", "bio"],
    )?;

    // Numeric chat ids are accepted and carried as strings.
    if let Some(chat_id) = settings.get_mut("telegram").and_then(|t| t.get_mut("chat_id")) {
        if let YamlValue::Number(n) = &*chat_id {
            let as_string = n.to_string();
            *chat_id = YamlValue::String(as_string);
        }
    }

    let scraper: ScraperSettings = section(&settings, "scraper", settings_path)?;
    let ai: fjr_analyze::AiSettings = section(&settings, "ai", settings_path)?;
    let telegram: TelegramSettings = section(&settings, "telegram", settings_path)?;
    let scoring: fjr_analyze::ScoringSettings = section(&settings, "scoring", settings_path)?;

    let total = scoring.weights.sum();
    if !(0.99..=1.01).contains(&total) {
        return Err(ConfigError::BadWeights {
            total,
            weights: format!("{:?}", scoring.weights),
        });
    }

    let profile: FreelancerProfile =
        serde_yaml::from_value(profile_doc).map_err(|source| ConfigError::Yaml {
            path: profile_path.to_path_buf(),
            source,
        })?;

    let database_path = settings["database"]
        .get("path")
        .and_then(YamlValue::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| ConfigError::MissingKeys {
            section: "database".to_string(),
            keys: "path".to_string(),
        })?;
    let log_level = settings["logging"]
        .get("level")
        .and_then(YamlValue::as_str)
        .unwrap_or("info")
        .to_string();

    Ok(AppConfig {
        scraper,
        ai,
        telegram,
        scoring,
        profile,
        database_path,
        log_level,
    })
}

fn read_document(path: &Path) -> Result<YamlValue, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }
    let text = std::fs::read_to_string(path)?;
    let value: YamlValue = serde_yaml::from_str(&text).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })?;
    if value.is_null() {
        return Err(ConfigError::Empty(path.to_path_buf()));
    }
    resolve_env_value(value)
}

/// Substitute every `${VAR}` occurrence in `text` from the environment.
/// An unterminated `${` passes through verbatim.
fn resolve_env_str(text: &str) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find('}') else {
            out.push_str(&rest[start..]);
            return Ok(out);
        };
        let name = &after[..end];
        if name.is_empty() {
            out.push_str("${}");
        } else {
            match std::env::var(name) {
                Ok(value) => out.push_str(&value),
                Err(_) => return Err(ConfigError::MissingEnvVar(name.to_string())),
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve_env_value(value: YamlValue) -> Result<YamlValue, ConfigError> {
    Ok(match value {
        YamlValue::String(text) => YamlValue::String(resolve_env_str(&text)?),
        YamlValue::Sequence(items) => YamlValue::Sequence(
            items
                .into_iter()
                .map(resolve_env_value)
                .collect::<Result<_, _>>()?,
        ),
        YamlValue::Mapping(map) => {
            let mut resolved = Mapping::new();
            for (key, item) in map {
                resolved.insert(key, resolve_env_value(item)?);
            }
            YamlValue::Mapping(resolved)
        }
        other => other,
    })
}

fn validate_keys(value: &YamlValue, section: &str, required: &[&str]) -> Result<(), ConfigError> {
    let missing: Vec<&str> = required
        .iter()
        .copied()
        .filter(|key| value.get(*key).is_none())
        .collect();
    if missing.is_empty() {
        return Ok(());
    }
    Err(ConfigError::MissingKeys {
        section: section.to_string(),
        keys: missing.join(", "),
    })
}

fn section<T: DeserializeOwned>(doc: &YamlValue, name: &str, path: &Path) -> Result<T, ConfigError> {
    serde_yaml::from_value(doc[name].clone()).map_err(|source| ConfigError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}

// ── health tracking ──────────────────────────────────────────────────────

const DEFAULT_MAX_HISTORY: usize = 200;
const MEMORY_CEILING_MB: f64 = 800.0;
const STALE_SCAN_SECS: u64 = 1800;
const RECENT_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CycleRecord {
    at: Instant,
    duration_secs: f64,
}

#[derive(Debug, Clone)]
struct ErrorRecord {
    at: Instant,
    component: String,
    message: String,
}

/// Bounded in-memory view of recent runtime behavior.
///
/// Ring buffers keep the last `max_history` cycle and error records; the
/// aggregate counters are never reset. Nothing here touches the database.
pub struct HealthMonitor {
    started: Instant,
    started_at: String,
    max_history: usize,
    cycles: VecDeque<CycleRecord>,
    errors: VecDeque<ErrorRecord>,
    total_cycles: u64,
    total_jobs: u64,
    total_analyzed: u64,
    total_alerts: u64,
    total_errors: u64,
    total_tokens: u64,
    last_cycle_at: Option<Instant>,
    last_cycle_duration: f64,
}

/// Point-in-time health readout.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub uptime: String,
    pub uptime_seconds: u64,
    pub started_at: String,
    pub total_cycles: u64,
    pub total_jobs: u64,
    pub total_analyzed: u64,
    pub total_alerts: u64,
    pub total_errors: u64,
    pub total_tokens: u64,
    pub error_rate_1h: f64,
    pub recent_errors_1h: usize,
    pub avg_cycle_duration: f64,
    pub last_cycle_duration: f64,
    pub seconds_since_last_cycle: Option<u64>,
    pub memory_mb: f64,
    pub last_error: Option<String>,
}

impl HealthMonitor {
    pub fn new(max_history: usize) -> Self {
        Self {
            started: Instant::now(),
            started_at: Local::now().format("%Y-%m-%d %H:%M").to_string(),
            max_history: max_history.max(1),
            cycles: VecDeque::new(),
            errors: VecDeque::new(),
            total_cycles: 0,
            total_jobs: 0,
            total_analyzed: 0,
            total_alerts: 0,
            total_errors: 0,
            total_tokens: 0,
            last_cycle_at: None,
            last_cycle_duration: 0.0,
        }
    }

    pub fn record_cycle(&mut self, stats: &CycleStats, tokens_used: u64) {
        let now = Instant::now();
        self.cycles.push_back(CycleRecord {
            at: now,
            duration_secs: stats.duration_seconds,
        });
        if self.cycles.len() > self.max_history {
            self.cycles.pop_front();
        }

        self.total_cycles += 1;
        self.total_jobs += stats.new_jobs as u64;
        self.total_analyzed += stats.analyzed as u64;
        self.total_alerts += stats.alerts_sent as u64;
        self.total_errors += stats.errors as u64;
        self.total_tokens += tokens_used;
        self.last_cycle_at = Some(now);
        self.last_cycle_duration = stats.duration_seconds;

        if self.total_cycles % 10 == 0 {
            info!(
                cycle = self.total_cycles,
                rss_mb = %format!("{:.1}", process_rss_mb()),
                errors_1h = self.recent_errors(RECENT_WINDOW),
                total_jobs = self.total_jobs,
                total_analyzed = self.total_analyzed,
                "health checkpoint"
            );
        }
    }

    /// Error descriptions are capped at 200 characters.
    pub fn record_error(&mut self, component: &str, error: &str) {
        let message: String = error.chars().take(200).collect();
        debug!(component, "health: error recorded");
        self.errors.push_back(ErrorRecord {
            at: Instant::now(),
            component: component.to_string(),
            message,
        });
        if self.errors.len() > self.max_history {
            self.errors.pop_front();
        }
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let uptime_seconds = self.started.elapsed().as_secs();
        let recent_errors = self.recent_errors(RECENT_WINDOW);
        let recent_cycles = self.recent_cycles(RECENT_WINDOW);
        let error_rate_1h = if recent_cycles > 0 {
            round1(recent_errors as f64 / recent_cycles as f64 * 100.0)
        } else {
            0.0
        };

        let recent: Vec<f64> = self
            .cycles
            .iter()
            .rev()
            .take(20)
            .map(|c| c.duration_secs)
            .collect();
        let avg_cycle_duration = if recent.is_empty() {
            0.0
        } else {
            round1(recent.iter().sum::<f64>() / recent.len() as f64)
        };

        HealthSnapshot {
            uptime: format_uptime(uptime_seconds),
            uptime_seconds,
            started_at: self.started_at.clone(),
            total_cycles: self.total_cycles,
            total_jobs: self.total_jobs,
            total_analyzed: self.total_analyzed,
            total_alerts: self.total_alerts,
            total_errors: self.total_errors,
            total_tokens: self.total_tokens,
            error_rate_1h,
            recent_errors_1h: recent_errors,
            avg_cycle_duration,
            last_cycle_duration: round1(self.last_cycle_duration),
            seconds_since_last_cycle: self.last_cycle_at.map(|at| at.elapsed().as_secs()),
            memory_mb: process_rss_mb(),
            last_error: self
                .errors
                .back()
                .map(|e| format!("{}: {}", e.component, e.message)),
        }
    }

    /// Evaluate the alert triggers against the trailing one-hour window.
    /// Any satisfied trigger contributes one bullet; `None` means healthy.
    ///
    /// An open breaker alerts once per open episode: the alerted flag is
    /// set here and cleared by the breaker when the circuit closes again.
    pub async fn should_alert(&self, breakers: &[&CircuitBreaker]) -> Option<String> {
        let mut alerts = Vec::new();

        let recent_errors = self.recent_errors(RECENT_WINDOW);
        let recent_cycles = self.recent_cycles(RECENT_WINDOW);
        if recent_cycles >= 3 && recent_errors as f64 / recent_cycles as f64 > 0.5 {
            let pct = recent_errors as f64 / recent_cycles as f64 * 100.0;
            alerts.push(format!(
                "معدل الأخطاء مرتفع: {recent_errors}/{recent_cycles} ({pct:.0}%)"
            ));
        }

        if let Some(last) = self.last_cycle_at {
            let since = last.elapsed().as_secs();
            if since > STALE_SCAN_SECS && self.total_cycles > 0 {
                alerts.push(format!("لم يتم فحص ناجح منذ {} دقيقة", since / 60));
            }
        }

        let memory_mb = process_rss_mb();
        if memory_mb > MEMORY_CEILING_MB {
            alerts.push(format!("استخدام ذاكرة مرتفع: {memory_mb:.0}MB"));
        }

        for breaker in breakers {
            if breaker.is_open().await && !breaker.has_alerted().await {
                alerts.push(format!("خدمة {} غير متاحة", breaker.name()));
                breaker.mark_alerted().await;
            }
        }

        if alerts.is_empty() {
            return None;
        }
        let bullets: Vec<String> = alerts.iter().map(|a| format!("• {a}")).collect();
        Some(format!("⚠️ تنبيه النظام:\n{}", bullets.join("\n")))
    }

    fn recent_cycles(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.cycles
            .iter()
            .filter(|c| now.saturating_duration_since(c.at) < window)
            .count()
    }

    fn recent_errors(&self, window: Duration) -> usize {
        let now = Instant::now();
        self.errors
            .iter()
            .filter(|e| now.saturating_duration_since(e.at) < window)
            .count()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// RSS of the current process read from `/proc/self/status`, in MB.
/// Returns 0.0 when the file is unavailable or malformed.
fn process_rss_mb() -> f64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0.0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            if let Some(kb) = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<f64>().ok())
            {
                return kb / 1024.0;
            }
        }
    }
    0.0
}

fn format_uptime(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours >= 24 {
        format!("{}d {}h {minutes}m", hours / 24, hours % 24)
    } else if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

// ── orchestrator ─────────────────────────────────────────────────────────

const MAX_CONSECUTIVE_ANALYSIS_FAILURES: usize = 5;
const CLEANUP_RETENTION_DAYS: u32 = 30;
const MAINTENANCE_CRON: &str = "0 30 4 * * *";

/// Top-level driver for the four scheduled activities.
///
/// The scan cycle is guarded by an advisory lock: a trigger that finds a
/// cycle already running is skipped, never queued. Digest, report and
/// maintenance run independently of the scan and of each other. Pausing
/// suppresses only the scan's work; the other schedules keep firing.
pub struct Orchestrator {
    pipeline: ScrapePipeline,
    analyzer: JobAnalyzer,
    scoring: ScoringEngine,
    dispatcher: Arc<Dispatcher>,
    store: SqliteStore,
    health: Mutex<HealthMonitor>,
    scan_lock: Mutex<()>,
    paused: AtomicBool,
    cycle_count: AtomicU64,
    errors_count: AtomicU64,
    last_scan: Mutex<String>,
    started: Instant,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        store: SqliteStore,
        dispatcher: Arc<Dispatcher>,
    ) -> anyhow::Result<Self> {
        let scoring = ScoringEngine::new(
            config.scoring,
            config.telegram.instant_alert_threshold,
            config.telegram.digest_threshold,
        );
        let pipeline = ScrapePipeline::new(config.scraper, &config.profile, store.clone(), "data/debug");
        let analyzer = JobAnalyzer::new(&config.ai, config.profile)?;

        Ok(Self {
            pipeline,
            analyzer,
            scoring,
            dispatcher,
            store,
            health: Mutex::new(HealthMonitor::default()),
            scan_lock: Mutex::new(()),
            paused: AtomicBool::new(false),
            cycle_count: AtomicU64::new(0),
            errors_count: AtomicU64::new(0),
            last_scan: Mutex::new(String::new()),
            started: Instant::now(),
        })
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scanning paused by operator");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("scanning resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Resolved AI provider names, for the startup message.
    pub fn providers(&self) -> (&str, &str) {
        (self.analyzer.primary_provider(), self.analyzer.fallback_provider())
    }

    /// Operator-triggered cycle. Bypasses the pause flag; when a cycle is
    /// already in flight the trigger is skipped, which still counts as
    /// success for the caller.
    pub async fn force_scan(&self) -> anyhow::Result<()> {
        info!("manual scan requested");
        self.run_scan_cycle().await
    }

    /// Scheduled scan entry point: honors pause, reports failures, then
    /// runs the health check regardless of outcome.
    pub async fn scan_tick(&self) {
        if self.is_paused() {
            info!("scanning paused, scheduled cycle skipped");
        } else if let Err(e) = self.run_scan_cycle().await {
            error!(error = %e, "scan cycle failed");
            self.errors_count.fetch_add(1, Ordering::Relaxed);
            self.health
                .lock()
                .await
                .record_error("orchestrator", &e.to_string());
            self.dispatcher
                .send_error_alert(&format!("فشلت دورة الفحص: {e}"))
                .await;
        }
        self.run_health_check().await;
    }

    /// One full cycle: scrape, analyze pending work one listing at a time,
    /// score, then dispatch instant alerts and flush the fallback queue.
    async fn run_scan_cycle(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.scan_lock.try_lock() else {
            info!("scan cycle already running, trigger skipped");
            return Ok(());
        };

        let started = Instant::now();
        let mut stats = self.pipeline.run_scrape_cycle(None, None).await?;
        let mut tokens_used: u64 = 0;

        let pending = self.store.jobs_needing_analysis().await?;
        if !pending.is_empty() {
            info!(pending = pending.len(), "analyzing new jobs");
        }

        // Five failures in a row mean a systemic outage, not five unlucky
        // listings; the rest of the batch is abandoned for this cycle.
        let mut consecutive_failures = 0usize;
        for (index, job) in pending.iter().enumerate() {
            if consecutive_failures >= MAX_CONSECUTIVE_ANALYSIS_FAILURES {
                warn!(
                    consecutive_failures,
                    remaining = pending.len() - index,
                    "analysis batch aborted"
                );
                break;
            }

            let Some(analysis) = self.analyzer.analyze_job(job).await else {
                stats.errors += 1;
                consecutive_failures += 1;
                self.health.lock().await.record_error(
                    "analyzer",
                    &format!("analysis failed for {}", job.listing_id),
                );
                continue;
            };
            tokens_used += analysis.tokens_used.max(0) as u64;

            if let Err(e) = self.store.insert_analysis(&analysis).await {
                warn!(listing_id = %job.listing_id, error = %e, "failed to persist analysis");
                stats.errors += 1;
                consecutive_failures += 1;
                self.health.lock().await.record_error("database", &e.to_string());
                continue;
            }

            let breakdown = self.scoring.score(&analysis, job);
            if let Err(e) = self.store.apply_score(&job.listing_id, &breakdown).await {
                warn!(listing_id = %job.listing_id, error = %e, "failed to persist score");
                stats.errors += 1;
                consecutive_failures += 1;
                self.health.lock().await.record_error("database", &e.to_string());
                continue;
            }

            stats.analyzed += 1;
            consecutive_failures = 0;
        }

        match self.dispatcher.process_instant_alerts().await {
            Ok(sent) => stats.alerts_sent = sent,
            Err(e) => {
                warn!(error = %e, "instant alert dispatch failed");
                stats.errors += 1;
                self.health.lock().await.record_error("telegram", &e.to_string());
            }
        }
        if let Err(e) = self.dispatcher.flush_queue().await {
            warn!(error = %e, "queue flush failed");
        }

        stats.duration_seconds = started.elapsed().as_secs_f64();
        self.dispatcher.note_cycle(&stats);
        self.health.lock().await.record_cycle(&stats, tokens_used);
        self.cycle_count.fetch_add(1, Ordering::Relaxed);
        self.errors_count
            .fetch_add(stats.errors as u64, Ordering::Relaxed);
        *self.last_scan.lock().await = Local::now().format("%Y-%m-%d %H:%M").to_string();

        info!(
            run_id = %stats.run_id,
            new_jobs = stats.new_jobs,
            analyzed = stats.analyzed,
            alerts_sent = stats.alerts_sent,
            errors = stats.errors,
            duration_secs = %format!("{:.1}", stats.duration_seconds),
            "scan cycle complete"
        );
        Ok(())
    }

    async fn run_health_check(&self) {
        let health = self.health.lock().await;
        let snap = health.snapshot();
        debug!(
            cycles = snap.total_cycles,
            error_rate_1h = %format!("{:.1}", snap.error_rate_1h),
            avg_cycle_secs = %format!("{:.1}", snap.avg_cycle_duration),
            memory_mb = %format!("{:.1}", snap.memory_mb),
            "health snapshot"
        );

        let [primary, fallback] = self.analyzer.circuit_breakers();
        let breakers = [primary, fallback, self.dispatcher.breaker()];
        if let Some(alert) = health.should_alert(&breakers).await {
            warn!(alert = %alert, "health alert raised");
            drop(health);
            self.dispatcher.send_system_alert(&alert).await;
        }
    }

    pub async fn digest_tick(&self) {
        match self.dispatcher.process_digest().await {
            Ok(0) => {}
            Ok(sent) => info!(jobs = sent, "digest dispatched"),
            Err(e) => {
                error!(error = %e, "digest dispatch failed");
                self.errors_count.fetch_add(1, Ordering::Relaxed);
                self.health.lock().await.record_error("telegram", &e.to_string());
            }
        }
    }

    pub async fn report_tick(&self) {
        match self.dispatcher.process_daily_report().await {
            Ok(true) => info!("daily report dispatched"),
            Ok(false) => warn!("daily report delivery failed"),
            Err(e) => {
                error!(error = %e, "daily report failed");
                self.errors_count.fetch_add(1, Ordering::Relaxed);
                self.health.lock().await.record_error("telegram", &e.to_string());
            }
        }
    }

    /// Purge aged never-escalated records and reclaim file space.
    pub async fn maintenance_tick(&self) {
        match self.store.cleanup_old_data(CLEANUP_RETENTION_DAYS).await {
            Ok(purged) => {
                if let Err(e) = self.store.vacuum().await {
                    warn!(error = %e, "vacuum failed");
                }
                let db_bytes = self.store.database_size_bytes().await.unwrap_or(0);
                info!(purged, db_bytes, "maintenance complete");
            }
            Err(e) => {
                error!(error = %e, "maintenance failed");
                self.health.lock().await.record_error("database", &e.to_string());
            }
        }
    }

    /// Data behind the /status command.
    pub async fn system_status(&self) -> SystemStatus {
        let (jobs_today, instant_today, digest_today) = match self.store.today_stats().await {
            Ok(stats) => (stats.jobs_discovered, stats.instant_count, stats.digest_count),
            Err(e) => {
                warn!(error = %e, "status query failed");
                (0, 0, 0)
            }
        };
        SystemStatus {
            paused: self.is_paused(),
            uptime: format_uptime(self.started.elapsed().as_secs()),
            cycles: self.cycle_count.load(Ordering::Relaxed),
            last_scan: self.last_scan.lock().await.clone(),
            errors: self.errors_count.load(Ordering::Relaxed),
            jobs_today,
            instant_today,
            digest_today,
        }
    }
}

// ── command listener ─────────────────────────────────────────────────────

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const POLL_TIMEOUT_SECS: u64 = 50;

const START_TEXT: &str = "<b>🤖 Freelance Job Radar</b>\n\n\
    مرحباً! أنا بوت مراقبة سوق العمل الحر.\n\
    أقوم برصد المشاريع الجديدة وإرسال تنبيهات ذكية.\n\n\
    <b>الأوامر المتاحة:</b>\n\
    /status — حالة النظام\n\
    /stats — إحصائيات اليوم\n\
    /pause — إيقاف الفحص مؤقتاً\n\
    /resume — استئناف الفحص\n\
    /last — آخر 5 مشاريع\n\
    /force — فحص فوري";

/// Long-polling Telegram command loop.
///
/// Only updates from the configured chat are honored; everything else is
/// dropped. Each command calls back into the orchestrator or dispatcher
/// and replies on the shared delivery channel.
pub struct CommandListener {
    http: reqwest::Client,
    settings: TelegramSettings,
    api_base: String,
    orchestrator: Arc<Orchestrator>,
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn Channel>,
    store: SqliteStore,
}

impl CommandListener {
    pub fn new(
        settings: TelegramSettings,
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<Dispatcher>,
        channel: Arc<dyn Channel>,
        store: SqliteStore,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .build()
            .context("building command poll client")?;
        Ok(Self {
            http,
            settings,
            api_base: TELEGRAM_API_BASE.to_string(),
            orchestrator,
            dispatcher,
            channel,
            store,
        })
    }

    /// Drive the poll loop until the task is aborted.
    pub async fn run(self) {
        info!("command listener started");
        let mut offset: i64 = 0;
        loop {
            match self.poll_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        if let Some(id) = update.get("update_id").and_then(JsonValue::as_i64) {
                            offset = offset.max(id + 1);
                        }
                        let Some(message) = update.get("message") else {
                            continue;
                        };
                        let Some(text) = message.get("text").and_then(JsonValue::as_str) else {
                            continue;
                        };
                        let chat_id = message
                            .pointer("/chat/id")
                            .map(|v| match v.as_i64() {
                                Some(n) => n.to_string(),
                                None => v.as_str().unwrap_or_default().to_string(),
                            })
                            .unwrap_or_default();
                        if chat_id != self.settings.chat_id {
                            debug!(chat_id = %chat_id, "update from foreign chat dropped");
                            continue;
                        }
                        self.dispatch_command(text.trim()).await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "update poll failed");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    async fn poll_updates(&self, offset: i64) -> anyhow::Result<Vec<JsonValue>> {
        let url = format!("{}/bot{}/getUpdates", self.api_base, self.settings.bot_token);
        let response = self
            .http
            .get(&url)
            .query(&[("timeout", POLL_TIMEOUT_SECS as i64), ("offset", offset)])
            .send()
            .await
            .context("polling updates")?;
        let payload: JsonValue = response.json().await.context("decoding updates")?;
        if payload.get("ok").and_then(JsonValue::as_bool) != Some(true) {
            anyhow::bail!(
                "getUpdates rejected: {}",
                payload
                    .get("description")
                    .and_then(JsonValue::as_str)
                    .unwrap_or("unknown")
            );
        }
        Ok(payload
            .get("result")
            .and_then(JsonValue::as_array)
            .cloned()
            .unwrap_or_default())
    }

    async fn dispatch_command(&self, text: &str) {
        let token = text.split_whitespace().next().unwrap_or("");
        let command = token.split('@').next().unwrap_or(token);
        match command {
            "/start" => self.reply(START_TEXT, false).await,
            "/status" => {
                let status = self.orchestrator.system_status().await;
                self.reply(&format_system_status(&status), false).await;
            }
            "/stats" => match self.dispatcher.render_daily_report().await {
                Ok(report) => self.reply(&report, false).await,
                Err(e) => {
                    self.reply(&format!("❌ خطأ: {}", escape_html(&e.to_string())), false)
                        .await;
                }
            },
            "/pause" => {
                self.orchestrator.pause();
                self.reply("⏸ <b>تم إيقاف الفحص مؤقتاً</b>\n\nاستخدم /resume للاستئناف", false)
                    .await;
            }
            "/resume" => {
                self.orchestrator.resume();
                self.reply("▶️ <b>تم استئناف الفحص</b>", false).await;
            }
            "/last" => self.reply_last_jobs().await,
            "/force" => self.start_forced_scan().await,
            _ => debug!(command, "unhandled command ignored"),
        }
    }

    async fn reply_last_jobs(&self) {
        let jobs = match self.store.top_jobs_today(5).await {
            Ok(jobs) => jobs,
            Err(e) => {
                self.reply(&format!("❌ خطأ: {}", escape_html(&e.to_string())), false)
                    .await;
                return;
            }
        };
        if jobs.is_empty() {
            self.reply("لا توجد مشاريع محللة اليوم", false).await;
            return;
        }

        let mut lines = vec!["<b>📋 آخر المشاريع المحللة:</b>".to_string(), String::new()];
        for (i, job) in jobs.iter().enumerate() {
            let emoji = match job.recommendation {
                Recommendation::InstantAlert => "⚡",
                Recommendation::Digest => "📋",
                Recommendation::Skip => "⏭️",
            };
            let title: String = job.title.chars().take(40).collect();
            let line = if job.url.is_empty() {
                format!(
                    "{emoji} {}. {} — <b>{}%</b>",
                    i + 1,
                    escape_html(&title),
                    job.overall_score
                )
            } else {
                format!(
                    "{emoji} {}. <a href=\"{}\">{}</a> — <b>{}%</b>",
                    i + 1,
                    job.url,
                    escape_html(&title),
                    job.overall_score
                )
            };
            lines.push(line);
        }
        self.reply(&lines.join("\n"), true).await;
    }

    /// Reply immediately, then run the cycle in the background so the
    /// poll loop stays responsive.
    async fn start_forced_scan(&self) {
        self.reply("🔄 <b>جاري بدء فحص فوري...</b>", false).await;
        let orchestrator = Arc::clone(&self.orchestrator);
        let channel = Arc::clone(&self.channel);
        tokio::spawn(async move {
            let outcome = match orchestrator.force_scan().await {
                Ok(()) => "✅ <b>تم الفحص الفوري بنجاح</b>".to_string(),
                Err(e) => format!("❌ خطأ في الفحص: {}", escape_html(&e.to_string())),
            };
            if let Err(e) = channel.send(&outcome, false).await {
                warn!(error = %e, "forced scan reply failed");
            }
        });
    }

    async fn reply(&self, text: &str, disable_preview: bool) {
        if let Err(e) = self.channel.send(text, disable_preview).await {
            warn!(error = %e, "command reply failed");
        }
    }
}

// ── runtime ──────────────────────────────────────────────────────────────

/// Bring the whole system up and run until a termination signal.
///
/// Startup order: store, delivery connectivity probe, startup message,
/// schedules, one immediate scan. Shutdown stops the schedule triggers,
/// sends a best-effort farewell and closes the store; an in-flight cycle
/// is abandoned safely since every write it makes commits independently.
pub async fn run(config: AppConfig) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database_path)
        .await
        .context("opening database")?;

    let telegram = config.telegram.clone();
    let scan_interval = config.scraper.scan_interval_seconds.max(1);
    let digest_interval_secs = config.telegram.digest_interval_minutes.max(1) * 60;
    let report_cron = format!(
        "0 {} {} * * *",
        config.telegram.daily_report_minute, config.telegram.daily_report_hour
    );

    let channel = TelegramChannel::new(config.telegram.clone()).context("building telegram channel")?;
    let bot = channel
        .connect()
        .await
        .context("telegram connectivity check failed")?;
    info!(bot = %bot, "telegram channel verified");
    let channel: Arc<dyn Channel> = Arc::new(channel);

    let dispatcher = Arc::new(Dispatcher::new(
        telegram.clone(),
        store.clone(),
        Arc::clone(&channel),
    ));
    let orchestrator = Arc::new(Orchestrator::new(config, store.clone(), Arc::clone(&dispatcher))?);

    let (primary, fallback) = orchestrator.providers();
    dispatcher
        .send_startup_message(primary, fallback, scan_interval)
        .await;

    let mut sched = JobScheduler::new().await.context("creating scheduler")?;

    let scan_job = {
        let orchestrator = Arc::clone(&orchestrator);
        Job::new_repeated_async(Duration::from_secs(scan_interval), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.scan_tick().await;
            })
        })
        .context("creating scan job")?
    };
    sched.add(scan_job).await.context("adding scan job")?;

    let digest_job = {
        let orchestrator = Arc::clone(&orchestrator);
        Job::new_repeated_async(Duration::from_secs(digest_interval_secs), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.digest_tick().await;
            })
        })
        .context("creating digest job")?
    };
    sched.add(digest_job).await.context("adding digest job")?;

    let report_job = {
        let orchestrator = Arc::clone(&orchestrator);
        Job::new_async(report_cron.as_str(), move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.report_tick().await;
            })
        })
        .with_context(|| format!("creating report job for cron {report_cron}"))?
    };
    sched.add(report_job).await.context("adding report job")?;

    let maintenance_job = {
        let orchestrator = Arc::clone(&orchestrator);
        Job::new_async(MAINTENANCE_CRON, move |_uuid, _l| {
            let orchestrator = Arc::clone(&orchestrator);
            Box::pin(async move {
                orchestrator.maintenance_tick().await;
            })
        })
        .context("creating maintenance job")?
    };
    sched
        .add(maintenance_job)
        .await
        .context("adding maintenance job")?;

    sched.start().await.context("starting scheduler")?;
    info!(
        scan_interval,
        digest_interval_secs,
        report_cron = %report_cron,
        "schedules registered"
    );

    let listener = CommandListener::new(
        telegram,
        Arc::clone(&orchestrator),
        Arc::clone(&dispatcher),
        Arc::clone(&channel),
        store.clone(),
    )?;
    let listener_task = tokio::spawn(listener.run());

    orchestrator.scan_tick().await;
    info!("startup complete, waiting for schedule triggers");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown signal received");

    if let Err(e) = sched.shutdown().await {
        warn!(error = %e, "scheduler shutdown failed");
    }
    listener_task.abort();
    dispatcher.send_shutdown_message().await;
    store.close().await;
    info!("shutdown complete");
    Ok(())
}

/// One scan cycle and exit. No schedules, no listener, no startup message.
pub async fn run_once(config: AppConfig) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.database_path)
        .await
        .context("opening database")?;
    let channel = TelegramChannel::new(config.telegram.clone()).context("building telegram channel")?;
    let bot = channel
        .connect()
        .await
        .context("telegram connectivity check failed")?;
    info!(bot = %bot, "telegram channel verified");
    let channel: Arc<dyn Channel> = Arc::new(channel);
    let dispatcher = Arc::new(Dispatcher::new(config.telegram.clone(), store.clone(), channel));
    let orchestrator = Orchestrator::new(config, store.clone(), dispatcher)?;

    orchestrator.force_scan().await?;
    store.close().await;
    Ok(())
}

// ── tests ────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Mutex as StdMutex;

    use async_trait::async_trait;
    use fjr_core::{AnalysisRecord, JobListing};
    use fjr_notify::NotifyError;
    use fjr_storage::BreakerError;
    use tempfile::tempdir;

    const SETTINGS_YAML: &str = r#"
scraper:
  base_url: "https://market.example"
  projects_url: "https://market.example/projects"
  xhr_endpoint: "https://market.example/projects?page={page}"
  scan_interval_seconds: 900
  max_pages_per_scan: 3
  request_delay_seconds: 2
  max_retries: 3
  timeout_seconds: 30
  user_agents:
    - "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36"

ai:
  primary_provider: gemini
  fallback_provider: groq
  gemini:
    api_key: "gm-test-key"
    model: "gemini-2.0-flash"
    max_tokens: 2000
    temperature: 0.3
    rpm_limit: 10
  groq:
    api_key: "gq-test-key"
    model: "llama-3.3-70b-versatile"
    max_tokens: 2000
    temperature: 0.3
    rpm_limit: 30

telegram:
  bot_token: "123:abc"
  chat_id: 123456789
  instant_alert_threshold: 80
  digest_threshold: 55
  digest_interval_minutes: 30
  daily_report_hour: 20
  daily_report_minute: 0

scoring:
  weights:
    hiring_probability: 0.30
    fit_score: 0.30
    budget_fairness: 0.15
    job_clarity: 0.10
    competition_level: 0.10
    urgency_score: 0.05
  bonuses:
    publisher_verified: 5
    hire_rate_above_70: 10
    less_than_5_proposals: 8
    budget_above_200: 3
  penalties:
    no_description: -20
    too_many_proposals: -10
    publisher_never_hired: -15
    budget_below_100: -10

database:
  path: "data/test.db"

logging:
  level: info
"#;

    const PROFILE_YAML: &str = r#"
name: "Test Freelancer"
skills:
  expert:
    - "Python"
    - "Web Scraping"
  intermediate:
    - "Rust"
  beginner: []
experience_years: 6
preferences:
  min_budget_usd: 100
  max_budget_usd: 3000
  preferred_categories:
    - "تطوير"
  positive_keywords:
    - "api"
  negative_keywords:
    - "تصميم شعار"
bio: "Backend developer."
"#;

    fn write_fixture(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn load_fixture_config(dir: &tempfile::TempDir) -> Result<AppConfig, ConfigError> {
        let settings = write_fixture(dir.path(), "settings.yaml", SETTINGS_YAML);
        let profile = write_fixture(dir.path(), "profile.yaml", PROFILE_YAML);
        load_config(&settings, &profile)
    }

    // ── configuration ──

    #[test]
    fn env_placeholders_are_substituted() {
        std::env::set_var("FJR_TEST_SUBST_TOKEN", "secret-token");
        let resolved = resolve_env_str("bot ${FJR_TEST_SUBST_TOKEN} end").unwrap();
        assert_eq!(resolved, "bot secret-token end");
    }

    #[test]
    fn missing_env_variable_is_an_error() {
        std::env::remove_var("FJR_TEST_UNSET_TOKEN");
        let err = resolve_env_str("${FJR_TEST_UNSET_TOKEN}").unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingEnvVar(ref name) if name == "FJR_TEST_UNSET_TOKEN")
        );
        assert!(err.to_string().contains(".env"));
    }

    #[test]
    fn unterminated_placeholder_passes_through() {
        assert_eq!(resolve_env_str("${NOT_CLOSED").unwrap(), "${NOT_CLOSED");
    }

    #[test]
    fn full_settings_document_loads() {
        let dir = tempdir().unwrap();
        let config = load_fixture_config(&dir).unwrap();

        assert_eq!(config.scraper.scan_interval_seconds, 900);
        assert_eq!(config.telegram.chat_id, "123456789");
        assert_eq!(config.ai.gemini.rpd_limit, 1500);
        assert_eq!(config.scraper.detail_delay_seconds, 3);
        assert_eq!(config.profile.skills.expert.len(), 2);
        assert_eq!(config.database_path, PathBuf::from("data/test.db"));
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn missing_section_is_reported() {
        let dir = tempdir().unwrap();
        let crippled = SETTINGS_YAML.replace("telegram:", "telegram_x:");
        let settings = write_fixture(dir.path(), "settings.yaml", &crippled);
        let profile = write_fixture(dir.path(), "profile.yaml", PROFILE_YAML);
        match load_config(&settings, &profile).unwrap_err() {
            ConfigError::MissingKeys { section, keys } => {
                assert_eq!(section, "settings");
                assert_eq!(keys, "telegram");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unbalanced_weights_are_rejected() {
        let dir = tempdir().unwrap();
        let skewed = SETTINGS_YAML.replace("hiring_probability: 0.30", "hiring_probability: 0.20");
        let settings = write_fixture(dir.path(), "settings.yaml", &skewed);
        let profile = write_fixture(dir.path(), "profile.yaml", PROFILE_YAML);
        let err = load_config(&settings, &profile).unwrap_err();
        assert!(matches!(err, ConfigError::BadWeights { .. }));
        assert!(err.to_string().contains("0.9000"));
    }

    #[test]
    fn absent_settings_file_is_reported() {
        let dir = tempdir().unwrap();
        let profile = write_fixture(dir.path(), "profile.yaml", PROFILE_YAML);
        let err = load_config(&dir.path().join("nope.yaml"), &profile).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn empty_settings_file_is_reported() {
        let dir = tempdir().unwrap();
        let settings = write_fixture(dir.path(), "settings.yaml", "");
        let profile = write_fixture(dir.path(), "profile.yaml", PROFILE_YAML);
        let err = load_config(&settings, &profile).unwrap_err();
        assert!(matches!(err, ConfigError::Empty(_)));
    }

    // ── health ──

    fn cycle_stats_with_errors(errors: usize) -> CycleStats {
        let mut stats = CycleStats::begin();
        stats.errors = errors;
        stats.duration_seconds = 2.0;
        stats
    }

    #[tokio::test]
    async fn high_error_rate_raises_an_alert() {
        let mut monitor = HealthMonitor::new(10);
        monitor.record_cycle(&cycle_stats_with_errors(1), 0);
        monitor.record_cycle(&cycle_stats_with_errors(1), 0);
        monitor.record_cycle(&cycle_stats_with_errors(0), 0);
        monitor.record_error("scraper", "timeout");
        monitor.record_error("gemini", "quota exhausted");

        let alert = monitor.should_alert(&[]).await.unwrap();
        assert!(alert.starts_with("⚠️ تنبيه النظام:"));
        assert!(alert.contains("معدل الأخطاء مرتفع: 2/3 (67%)"));
    }

    #[tokio::test]
    async fn sparse_history_stays_quiet() {
        let mut monitor = HealthMonitor::new(10);
        monitor.record_cycle(&cycle_stats_with_errors(1), 0);
        monitor.record_cycle(&cycle_stats_with_errors(1), 0);
        monitor.record_error("scraper", "timeout");
        monitor.record_error("scraper", "timeout");

        assert!(monitor.should_alert(&[]).await.is_none());
    }

    #[tokio::test]
    async fn stale_scans_raise_an_alert() {
        let mut monitor = HealthMonitor::new(10);
        monitor.record_cycle(&cycle_stats_with_errors(0), 0);
        monitor.last_cycle_at = Instant::now().checked_sub(Duration::from_secs(2000));

        let alert = monitor.should_alert(&[]).await.unwrap();
        assert!(alert.contains("لم يتم فحص ناجح منذ 33 دقيقة"));
    }

    #[tokio::test]
    async fn open_breaker_alerts_once_per_episode() {
        let breaker = CircuitBreaker::new(
            "groq",
            1,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        let result: Result<(), BreakerError<std::io::Error>> = breaker
            .call(|| async { Err(std::io::Error::other("boom")) })
            .await;
        assert!(result.is_err());
        assert!(breaker.is_open().await);

        let monitor = HealthMonitor::new(10);
        let first = monitor.should_alert(&[&breaker]).await.unwrap();
        assert!(first.contains("خدمة groq غير متاحة"));
        assert!(monitor.should_alert(&[&breaker]).await.is_none());
    }

    #[test]
    fn snapshot_aggregates_recent_history() {
        let mut monitor = HealthMonitor::new(10);
        let mut stats = CycleStats::begin();
        stats.new_jobs = 4;
        stats.analyzed = 3;
        stats.alerts_sent = 1;
        stats.errors = 1;
        stats.duration_seconds = 3.0;
        monitor.record_cycle(&stats, 250);
        stats.duration_seconds = 5.0;
        monitor.record_cycle(&stats, 250);
        monitor.record_error("telegram", "flood wait");

        let snap = monitor.snapshot();
        assert_eq!(snap.total_cycles, 2);
        assert_eq!(snap.total_jobs, 8);
        assert_eq!(snap.total_tokens, 500);
        assert_eq!(snap.avg_cycle_duration, 4.0);
        assert_eq!(snap.error_rate_1h, 50.0);
        assert_eq!(snap.last_error.as_deref(), Some("telegram: flood wait"));
        assert_eq!(snap.seconds_since_last_cycle, Some(0));
    }

    #[test]
    fn ring_buffers_stay_bounded() {
        let mut monitor = HealthMonitor::new(3);
        for i in 0..5 {
            monitor.record_cycle(&cycle_stats_with_errors(0), 0);
            monitor.record_error("scraper", &format!("error {i}"));
        }
        assert_eq!(monitor.cycles.len(), 3);
        assert_eq!(monitor.errors.len(), 3);
        assert_eq!(monitor.total_cycles, 5);
        assert_eq!(
            monitor.snapshot().last_error.as_deref(),
            Some("scraper: error 4")
        );
    }

    #[test]
    fn uptime_formatting_scales_with_duration() {
        assert_eq!(format_uptime(300), "5m");
        assert_eq!(format_uptime(3700), "1h 1m");
        assert_eq!(format_uptime(90061), "1d 1h 1m");
    }

    // ── orchestrator and commands ──

    struct StubChannel {
        sent: StdMutex<Vec<String>>,
    }

    impl StubChannel {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: StdMutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        async fn send(&self, text: &str, _disable_preview: bool) -> Result<String, NotifyError> {
            let mut sent = self.sent.lock().unwrap();
            sent.push(text.to_string());
            Ok(format!("{}", 1000 + sent.len()))
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        dispatcher: Arc<Dispatcher>,
        stub: Arc<StubChannel>,
        store: SqliteStore,
        telegram: TelegramSettings,
    }

    async fn harness() -> Harness {
        let dir = tempdir().unwrap();
        let config = load_fixture_config(&dir).unwrap();
        let telegram = config.telegram.clone();
        let store = SqliteStore::open_in_memory().await.unwrap();
        let stub = StubChannel::new();
        let channel: Arc<dyn Channel> = stub.clone();
        let dispatcher = Arc::new(Dispatcher::new(telegram.clone(), store.clone(), channel));
        let orchestrator =
            Arc::new(Orchestrator::new(config, store.clone(), Arc::clone(&dispatcher)).unwrap());
        Harness {
            orchestrator,
            dispatcher,
            stub,
            store,
            telegram,
        }
    }

    fn listener_for(h: &Harness) -> CommandListener {
        CommandListener::new(
            h.telegram.clone(),
            Arc::clone(&h.orchestrator),
            Arc::clone(&h.dispatcher),
            h.stub.clone(),
            h.store.clone(),
        )
        .unwrap()
    }

    async fn seed_analysis(store: &SqliteStore, id: &str, rec: Recommendation, overall: i64) {
        let listing = JobListing::new(id, format!("مشروع {id}"), format!("https://m.test/p/{id}"));
        store.insert_listing(&listing).await.expect("listing");
        let mut analysis = AnalysisRecord::new(id);
        analysis.recommendation = rec;
        analysis.overall_score = overall;
        store.insert_analysis(&analysis).await.expect("analysis");
    }

    #[tokio::test]
    async fn pause_and_resume_toggle_scan_state() {
        let h = harness().await;
        assert!(!h.orchestrator.is_paused());
        h.orchestrator.pause();
        assert!(h.orchestrator.is_paused());
        h.orchestrator.resume();
        assert!(!h.orchestrator.is_paused());
    }

    #[tokio::test]
    async fn paused_tick_skips_the_cycle() {
        let h = harness().await;
        h.orchestrator.pause();
        h.orchestrator.scan_tick().await;
        let status = h.orchestrator.system_status().await;
        assert_eq!(status.cycles, 0);
        assert!(status.last_scan.is_empty());
        assert!(status.paused);
    }

    #[tokio::test]
    async fn overlapping_scan_trigger_is_skipped() {
        let h = harness().await;
        let _guard = h.orchestrator.scan_lock.lock().await;
        h.orchestrator.force_scan().await.unwrap();
        let status = h.orchestrator.system_status().await;
        assert_eq!(status.cycles, 0);
    }

    #[tokio::test]
    async fn status_renders_running_and_paused_states() {
        let h = harness().await;
        let rendered = format_system_status(&h.orchestrator.system_status().await);
        assert!(rendered.contains("🟢 يعمل"));
        assert!(rendered.contains("لم يتم بعد"));

        h.orchestrator.pause();
        let rendered = format_system_status(&h.orchestrator.system_status().await);
        assert!(rendered.contains("⏸ متوقف مؤقتاً"));
    }

    #[tokio::test]
    async fn pause_command_pauses_and_replies() {
        let h = harness().await;
        let listener = listener_for(&h);

        listener.dispatch_command("/pause").await;
        assert!(h.orchestrator.is_paused());
        let sent = h.stub.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("تم إيقاف الفحص مؤقتاً"));

        listener.dispatch_command("/resume").await;
        assert!(!h.orchestrator.is_paused());
        assert!(h.stub.sent()[1].contains("تم استئناف الفحص"));
    }

    #[tokio::test]
    async fn status_command_strips_bot_mention() {
        let h = harness().await;
        let listener = listener_for(&h);
        listener.dispatch_command("/status@job_radar_bot").await;
        let sent = h.stub.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("حالة النظام"));
        assert!(sent[0].contains("🟢 يعمل"));
    }

    #[tokio::test]
    async fn start_command_lists_available_commands() {
        let h = harness().await;
        let listener = listener_for(&h);
        listener.dispatch_command("/start").await;
        let sent = h.stub.sent();
        assert!(sent[0].contains("Freelance Job Radar"));
        assert!(sent[0].contains("/force"));
    }

    #[tokio::test]
    async fn stats_command_sends_daily_report() {
        let h = harness().await;
        let listener = listener_for(&h);
        listener.dispatch_command("/stats").await;
        let sent = h.stub.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("التقرير اليومي"));
    }

    #[tokio::test]
    async fn last_command_handles_empty_history() {
        let h = harness().await;
        let listener = listener_for(&h);
        listener.dispatch_command("/last").await;
        assert_eq!(h.stub.sent()[0], "لا توجد مشاريع محللة اليوم");
    }

    #[tokio::test]
    async fn last_command_lists_scored_jobs() {
        let h = harness().await;
        seed_analysis(&h.store, "j9", Recommendation::InstantAlert, 88).await;
        let listener = listener_for(&h);
        listener.dispatch_command("/last").await;
        let sent = h.stub.sent();
        assert!(sent[0].contains("آخر المشاريع المحللة"));
        assert!(sent[0].contains("⚡"));
        assert!(sent[0].contains("88%"));
        assert!(sent[0].contains("https://m.test/p/j9"));
    }

    #[tokio::test]
    async fn unknown_commands_are_ignored() {
        let h = harness().await;
        let listener = listener_for(&h);
        listener.dispatch_command("/destroy").await;
        listener.dispatch_command("hello").await;
        assert!(h.stub.sent().is_empty());
    }
}
