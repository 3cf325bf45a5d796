//! Telegram delivery: HTML message formatting, length-aware splitting,
//! plain-text fallback, and the notification dispatcher with its durable
//! fallback queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::Local;
use fjr_core::{CycleStats, DailyStats, ScoreBreakdown, ScoredJob};
use fjr_storage::{BreakerError, CircuitBreaker, SqliteStore};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fjr-notify";

const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
/// Telegram rejects messages above 4096 characters; splitting targets 4000
/// to leave headroom for the final-chunk ellipsis.
const SAFE_MESSAGE_LEN: usize = 4000;
const MAX_SEND_ATTEMPTS: u32 = 3;
const DIGEST_BATCH_LIMIT: usize = 15;
const APP_TITLE: &str = "Freelance Job Radar";

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("telegram api error {status}: {description}")]
    Api { status: u16, description: String },
    #[error("empty message")]
    Empty,
    #[error("send retries exhausted")]
    Exhausted,
    #[error(transparent)]
    Store(#[from] fjr_storage::StoreError),
}

/// The `telegram` section of the settings document.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: String,
    pub chat_id: String,
    pub instant_alert_threshold: i64,
    pub digest_threshold: i64,
    pub digest_interval_minutes: u64,
    pub daily_report_hour: u32,
    pub daily_report_minute: u32,
}

/// An outbound message channel. The only implementation talks to the
/// Telegram Bot API; tests substitute recording stubs.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Deliver one message and return the channel's message id.
    async fn send(&self, text: &str, disable_preview: bool) -> Result<String, NotifyError>;
}

// ── telegram client ─────────────────────────────────────────────────────

/// Bot API client handling splitting, retries, rate-limit waits, and the
/// plain-text fallback when HTML markup is rejected.
pub struct TelegramChannel {
    http: reqwest::Client,
    settings: TelegramSettings,
    api_base: String,
}

impl TelegramChannel {
    pub fn new(settings: TelegramSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("building telegram http client")?;
        Ok(Self {
            http,
            settings,
            api_base: TELEGRAM_API_BASE.to_string(),
        })
    }

    pub fn with_api_base(mut self, url: impl Into<String>) -> Self {
        self.api_base = url.into();
        self
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.settings.bot_token, method)
    }

    /// `getMe` connectivity check; returns the bot username.
    pub async fn connect(&self) -> Result<String, NotifyError> {
        let response = self.http.get(self.method_url("getMe")).send().await?;
        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        let payload: JsonValue = serde_json::from_str(&raw).unwrap_or_default();

        if !status.is_success() || payload["ok"] != JsonValue::Bool(true) {
            let description = payload["description"].as_str().unwrap_or("").to_string();
            error!(status = status.as_u16(), %description, "telegram bot connection failed");
            return Err(NotifyError::Api {
                status: status.as_u16(),
                description,
            });
        }
        let username = payload
            .pointer("/result/username")
            .and_then(JsonValue::as_str)
            .unwrap_or("")
            .to_string();
        info!(%username, "telegram bot connected");
        Ok(username)
    }

    pub async fn send_message(
        &self,
        text: &str,
        disable_preview: bool,
    ) -> Result<String, NotifyError> {
        if text.is_empty() {
            return Err(NotifyError::Empty);
        }

        let chunks = split_message(text, SAFE_MESSAGE_LEN);
        let total = chunks.len();
        let mut last_id = None;
        let mut last_err = None;

        for (i, chunk) in chunks.iter().enumerate() {
            match self.send_single(chunk, disable_preview).await {
                Ok(id) => last_id = Some(id),
                Err(e) => {
                    warn!(chunk = i + 1, total, error = %e, "chunk send failed");
                    last_err = Some(e);
                }
            }
            if i + 1 < total {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }

        match (last_id, last_err) {
            (Some(id), _) => Ok(id),
            (None, Some(e)) => Err(e),
            (None, None) => Err(NotifyError::Exhausted),
        }
    }

    async fn send_single(&self, text: &str, disable_preview: bool) -> Result<String, NotifyError> {
        let url = self.method_url("sendMessage");

        for attempt in 0..MAX_SEND_ATTEMPTS {
            let body = serde_json::json!({
                "chat_id": self.settings.chat_id,
                "text": text,
                "parse_mode": "HTML",
                "disable_web_page_preview": disable_preview,
            });
            let response = match self.http.post(&url).json(&body).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max = MAX_SEND_ATTEMPTS,
                        error = %e,
                        "telegram network error"
                    );
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                    continue;
                }
            };

            let status = response.status();
            let raw = response.text().await.unwrap_or_default();
            let payload: JsonValue = serde_json::from_str(&raw).unwrap_or_default();

            if status.is_success() && payload["ok"] == JsonValue::Bool(true) {
                if let Some(id) = payload
                    .pointer("/result/message_id")
                    .and_then(JsonValue::as_i64)
                {
                    return Ok(id.to_string());
                }
                return Err(NotifyError::Api {
                    status: status.as_u16(),
                    description: "missing message_id".to_string(),
                });
            }

            let description = payload["description"].as_str().unwrap_or("").to_string();

            if let Some(wait) = payload
                .pointer("/parameters/retry_after")
                .and_then(JsonValue::as_u64)
            {
                warn!(wait, "telegram rate limited, waiting");
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }
            if status == StatusCode::BAD_REQUEST && description.to_lowercase().contains("parse") {
                warn!(
                    description = %truncate_chars(&description, 200),
                    "parse error, retrying as plain text"
                );
                return self.send_plain(text, disable_preview).await;
            }
            if status.is_server_error() {
                warn!(
                    attempt = attempt + 1,
                    status = status.as_u16(),
                    "telegram server error"
                );
                tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                continue;
            }

            error!(status = status.as_u16(), %description, "telegram rejected message");
            return Err(NotifyError::Api {
                status: status.as_u16(),
                description,
            });
        }

        error!(attempts = MAX_SEND_ATTEMPTS, "failed to send message");
        Err(NotifyError::Exhausted)
    }

    async fn send_plain(&self, text: &str, disable_preview: bool) -> Result<String, NotifyError> {
        let body = serde_json::json!({
            "chat_id": self.settings.chat_id,
            "text": strip_formatting(text),
            "disable_web_page_preview": disable_preview,
        });
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await.unwrap_or_default();
        let payload: JsonValue = serde_json::from_str(&raw).unwrap_or_default();

        if status.is_success() && payload["ok"] == JsonValue::Bool(true) {
            if let Some(id) = payload
                .pointer("/result/message_id")
                .and_then(JsonValue::as_i64)
            {
                return Ok(id.to_string());
            }
        }
        let description = payload["description"].as_str().unwrap_or("").to_string();
        error!(status = status.as_u16(), %description, "plain text fallback also failed");
        Err(NotifyError::Api {
            status: status.as_u16(),
            description,
        })
    }
}

#[async_trait]
impl Channel for TelegramChannel {
    async fn send(&self, text: &str, disable_preview: bool) -> Result<String, NotifyError> {
        self.send_message(text, disable_preview).await
    }
}

// ── text utilities ──────────────────────────────────────────────────────

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn byte_of_char(text: &str, n: usize) -> usize {
    text.char_indices().nth(n).map(|(i, _)| i).unwrap_or(text.len())
}

/// Split long text at paragraph boundaries first, then line boundaries,
/// then a forced cut. Chunks are trimmed so no chunk starts or ends with
/// stray newlines.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text.to_string();

    while remaining.chars().count() > max_len {
        let window_end = byte_of_char(&remaining, max_len);
        let window = &remaining[..window_end];
        let cut = match window.rfind("\n\n") {
            Some(i) if i > 0 => i,
            _ => match window.rfind('\n') {
                Some(i) if i > 0 => i,
                _ => window_end,
            },
        };
        chunks.push(remaining[..cut].trim_end().to_string());
        remaining = remaining[cut..].trim_start_matches('\n').to_string();
    }

    if !remaining.trim().is_empty() {
        chunks.push(remaining.trim().to_string());
    }
    chunks
}

fn flatten_links(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("<a href=\"") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 9..];
        let Some(url_end) = after.find("\">") else {
            out.push_str(&rest[start..]);
            return out;
        };
        let url = &after[..url_end];
        let body = &after[url_end + 2..];
        let Some(close) = body.find("</a>") else {
            out.push_str(&rest[start..]);
            return out;
        };
        out.push_str(&body[..close]);
        out.push_str(" (");
        out.push_str(url);
        out.push(')');
        rest = &body[close + 4..];
    }
    out.push_str(rest);
    out
}

fn drop_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        out.push_str(&rest[..start]);
        match rest[start..].find('>') {
            Some(offset) => rest = &rest[start + offset + 1..],
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Plain-text fallback: anchors become "text (url)", remaining tags and
/// markup markers are dropped, entities are unescaped.
pub fn strip_formatting(text: &str) -> String {
    let text = flatten_links(text);
    let text = drop_tags(&text);
    let text: String = text
        .chars()
        .filter(|ch| !matches!(ch, '*' | '_' | '~' | '\\'))
        .collect();
    text.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

// ── formatters ──────────────────────────────────────────────────────────

const SECTION_SEP: &str = "━━━━━━━━━━━━━━━━━━";

/// Escape the three characters Telegram's HTML mode cares about.
pub fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn html_link(text: &str, url: &str) -> String {
    format!(
        "<a href=\"{}\">{}</a>",
        url.replace('&', "&amp;"),
        escape_html(text)
    )
}

fn progress_bar(value: i64, length: usize) -> String {
    let value = value.clamp(0, 100);
    let filled = ((value as f64 / 100.0) * length as f64).round() as usize;
    "▰".repeat(filled) + &"▱".repeat(length - filled)
}

pub fn format_budget(min: Option<f64>, max: Option<f64>) -> String {
    if let (Some(lo), Some(hi)) = (min, max) {
        if lo > 0.0 && hi > 0.0 {
            if lo == hi {
                return format!("${lo:.0}");
            }
            return format!("${lo:.0} - ${hi:.0}");
        }
    }
    if let Some(hi) = max.filter(|b| *b > 0.0) {
        return format!("${hi:.0}");
    }
    if let Some(lo) = min.filter(|b| *b > 0.0) {
        return format!("${lo:.0}+");
    }
    "غير محدد".to_string()
}

/// High-priority alert: tiered header, job facts one per line, progress
/// bar, sub-scores, AI sections, and the score breakdown when adjustments
/// were applied. Vertical layout sized for phone screens.
pub fn format_instant_alert(job: &ScoredJob, breakdown: Option<&ScoreBreakdown>) -> String {
    let title = if job.title.is_empty() {
        "مشروع بدون عنوان"
    } else {
        &job.title
    };
    let overall = job.overall_score;

    let header = if overall >= 90 {
        "🔥🔥🔥 فرصة استثنائية!"
    } else if overall >= 80 {
        "🔥🔥 فرصة مميزة — تقدم الآن!"
    } else if overall >= 70 {
        "🔥 فرصة جيدة"
    } else {
        "📋 فرصة جديدة"
    };

    let mut lines = vec![format!("<b>{}</b>", escape_html(header)), String::new()];

    if job.url.is_empty() {
        lines.push(format!("📌 <b>{}</b>", escape_html(title)));
    } else {
        lines.push(format!("📌 {}", html_link(title, &job.url)));
    }

    let budget = format_budget(job.budget_min, job.budget_max);
    lines.push(format!("💰 {}", escape_html(&budget)));
    lines.push(format!("📊 {} عروض", job.proposals_count));

    let duration = job.duration.split_whitespace().collect::<Vec<_>>().join(" ");
    if !duration.is_empty() {
        lines.push(format!("⏱ المدة: {}", escape_html(&duration)));
    }
    if !job.time_posted.is_empty() {
        lines.push(format!(
            "🕐 نُشر: {}",
            escape_html(&truncate_chars(&job.time_posted, 16))
        ));
    }
    if !job.skills.is_empty() {
        let shown = job
            .skills
            .iter()
            .take(5)
            .cloned()
            .collect::<Vec<_>>()
            .join(" · ");
        lines.push(format!("🏷 {}", escape_html(&shown)));
    }
    if !job.category.is_empty() {
        lines.push(format!("📁 {}", escape_html(&job.category)));
    }
    if !job.publisher_name.is_empty() {
        lines.push(format!("👤 الناشر: {}", escape_html(&job.publisher_name)));
    }

    lines.push(String::new());
    lines.push(SECTION_SEP.to_string());
    lines.push(String::new());

    lines.push(format!("⚡ الدرجة الكلية: <b>{overall}/100</b>"));
    lines.push(progress_bar(overall, 15));
    lines.push(String::new());

    lines.push(format!("🎯 التوافق: <b>{}%</b>", job.fit_score));
    lines.push(format!("📈 احتمال التوظيف: <b>{}%</b>", job.hiring_probability));
    lines.push(format!("💰 عدالة السعر: <b>{}%</b>", job.budget_fairness));
    lines.push(format!("📝 وضوح المشروع: <b>{}%</b>", job.job_clarity));
    lines.push(format!("🏆 المنافسة: <b>{}%</b>", job.competition_level));

    if !job.job_summary.is_empty() || !job.required_skills_analysis.is_empty() {
        lines.push(String::new());
        lines.push(SECTION_SEP.to_string());
        lines.push(String::new());
    }
    if !job.job_summary.is_empty() {
        lines.push("📝 <b>الملخص:</b>".to_string());
        lines.push(escape_html(&job.job_summary));
        lines.push(String::new());
    }
    if !job.required_skills_analysis.is_empty() {
        lines.push("🎯 <b>المهارات:</b>".to_string());
        lines.push(escape_html(&job.required_skills_analysis));
        lines.push(String::new());
    }

    if !job.green_flags.is_empty() || !job.red_flags.is_empty() {
        lines.push(SECTION_SEP.to_string());
        lines.push(String::new());
    }
    if !job.green_flags.is_empty() {
        lines.push("✅ <b>إيجابيات:</b>".to_string());
        for flag in job.green_flags.iter().take(4) {
            lines.push(format!("  • {}", escape_html(flag)));
        }
        lines.push(String::new());
    }
    if !job.red_flags.is_empty() {
        lines.push("⚠️ <b>تحذيرات:</b>".to_string());
        for flag in job.red_flags.iter().take(4) {
            lines.push(format!("  • {}", escape_html(flag)));
        }
        lines.push(String::new());
    }

    if !job.recommended_proposal_angle.is_empty() {
        lines.push(SECTION_SEP.to_string());
        lines.push(String::new());
        lines.push("💡 <b>استراتيجية العرض:</b>".to_string());
        lines.push(escape_html(&job.recommended_proposal_angle));
        lines.push(String::new());
    }

    if let Some(b) = breakdown {
        let total_bonus = b.total_bonus();
        let total_penalty = b.total_penalty();
        if total_bonus != 0 || total_penalty != 0 {
            lines.push(format!(
                "📊 القاعدة: {:.0} + مكافآت: {total_bonus} - خصومات: {total_penalty}",
                b.base_score
            ));
        }
    }

    let msg = lines.join("\n");
    if msg.chars().count() > 4000 {
        warn!("instant alert truncated to fit telegram limit");
        let mut capped = truncate_chars(&msg, 3950);
        capped.push_str("\n...");
        return capped;
    }
    msg
}

/// Batched digest: top jobs by score, three lines each.
pub fn format_digest(jobs: &[ScoredJob]) -> String {
    if jobs.is_empty() {
        return "<b>📋 لا توجد فرص جديدة في هذه الفترة</b>".to_string();
    }

    let total = jobs.len();
    let mut sorted: Vec<&ScoredJob> = jobs.iter().collect();
    sorted.sort_by(|a, b| b.overall_score.cmp(&a.overall_score));
    sorted.truncate(DIGEST_BATCH_LIMIT);

    let mut lines = vec![
        format!("<b>📋 ملخص الفرص — {total} مشروع جديد</b>"),
        String::new(),
    ];

    for (i, job) in sorted.iter().enumerate() {
        let indicator = if job.overall_score >= 70 { "🟢" } else { "🟡" };
        let title = if job.title.is_empty() {
            "بدون عنوان".to_string()
        } else {
            truncate_chars(&job.title, 45)
        };

        if i > 0 {
            lines.push(String::new());
        }
        if job.url.is_empty() {
            lines.push(format!("{indicator} {}", escape_html(&title)));
        } else {
            lines.push(format!("{indicator} {}", html_link(&title, &job.url)));
        }
        lines.push(format!(
            "   💰 {}  ·  📊 {} عروض",
            escape_html(&format_budget(job.budget_min, job.budget_max)),
            job.proposals_count
        ));
        lines.push(format!("   🎯 الدرجة: <b>{}%</b>", job.overall_score));
    }

    let msg = lines.join("\n");
    if msg.chars().count() > 4000 {
        let mut capped = truncate_chars(&msg, 3950);
        capped.push_str("\n...");
        return capped;
    }
    msg
}

/// End-of-day summary: discovery counts, recommendation split, averages,
/// top five, and a system health footer.
pub fn format_daily_report(
    stats: &DailyStats,
    top_jobs: &[ScoredJob],
    requests_made: u64,
    errors: i64,
) -> String {
    let date_str = if stats.date.is_empty() {
        "اليوم"
    } else {
        &stats.date
    };

    let mut lines = vec![
        format!("<b>📊 التقرير اليومي — {}</b>", escape_html(date_str)),
        String::new(),
        format!("📌 المشاريع المكتشفة: <b>{}</b>", stats.jobs_discovered),
        format!("⚡ تنبيهات فورية: <b>{}</b>", stats.instant_count),
        format!("📋 في الملخصات: <b>{}</b>", stats.digest_count),
        format!("⏭️ تم تخطيها: <b>{}</b>", stats.skipped_count),
        String::new(),
        SECTION_SEP.to_string(),
        String::new(),
        format!("🎯 متوسط التوافق: <b>{:.1}%</b>", stats.avg_fit_score),
        format!("📈 متوسط التوظيف: <b>{:.1}%</b>", stats.avg_hiring_probability),
    ];

    if !top_jobs.is_empty() {
        lines.push(String::new());
        lines.push(SECTION_SEP.to_string());
        lines.push(String::new());
        lines.push("<b>🏆 أفضل الفرص:</b>".to_string());
        for (i, job) in top_jobs.iter().take(5).enumerate() {
            let title = truncate_chars(&job.title, 35);
            if job.url.is_empty() {
                lines.push(format!(
                    "  {}. {} — <b>{}%</b>",
                    i + 1,
                    escape_html(&title),
                    job.overall_score
                ));
            } else {
                lines.push(format!(
                    "  {}. {} — <b>{}%</b>",
                    i + 1,
                    html_link(&title, &job.url),
                    job.overall_score
                ));
            }
        }
    }

    lines.push(String::new());
    lines.push(SECTION_SEP.to_string());
    lines.push(String::new());
    lines.push("<b>🔧 صحة النظام:</b>".to_string());
    lines.push(format!("  🔄 طلبات HTTP: {requests_made}"));
    lines.push(format!("  🤖 رموز AI: {}", stats.tokens_used));
    if errors > 0 {
        lines.push(format!("  ❌ أخطاء: {errors}"));
    } else {
        lines.push("  ✅ بدون أخطاء".to_string());
    }

    lines.join("\n")
}

/// Inputs for the /status reply, assembled by the command listener.
#[derive(Debug, Clone, Default)]
pub struct SystemStatus {
    pub paused: bool,
    pub uptime: String,
    pub cycles: u64,
    pub last_scan: String,
    pub errors: u64,
    pub jobs_today: i64,
    pub instant_today: i64,
    pub digest_today: i64,
}

pub fn format_system_status(status: &SystemStatus) -> String {
    let state = if status.paused {
        "⏸ متوقف مؤقتاً"
    } else {
        "🟢 يعمل"
    };
    let last_scan = if status.last_scan.is_empty() {
        "لم يتم بعد"
    } else {
        &status.last_scan
    };

    [
        "<b>🤖 حالة النظام</b>".to_string(),
        String::new(),
        format!("📍 الحالة: {state}"),
        format!("⏱ التشغيل: {}", escape_html(&status.uptime)),
        format!("🔄 الدورات: {}", status.cycles),
        format!("🕐 آخر فحص: {}", escape_html(last_scan)),
        format!("❌ أخطاء: {}", status.errors),
        String::new(),
        format!("📌 مشاريع اليوم: <b>{}</b>", status.jobs_today),
        format!("⚡ تنبيهات فورية: <b>{}</b>", status.instant_today),
        format!("📋 ملخصات: <b>{}</b>", status.digest_today),
    ]
    .join("\n")
}

// ── dispatcher ──────────────────────────────────────────────────────────

/// Read-then-send-then-mark delivery driver. The notification row written
/// after a successful send is the only deduplication; a failed send leaves
/// the analysis eligible for the next cycle.
///
/// Alert-class messages (startup, shutdown, errors, health) have no unsent
/// row behind them, so an open delivery circuit parks them in the durable
/// queue instead of dropping them.
pub struct Dispatcher {
    settings: TelegramSettings,
    store: SqliteStore,
    channel: Arc<dyn Channel>,
    breaker: CircuitBreaker,
    started_at: Instant,
    requests_today: AtomicU64,
    errors_today: AtomicU64,
}

impl Dispatcher {
    pub fn new(settings: TelegramSettings, store: SqliteStore, channel: Arc<dyn Channel>) -> Self {
        Self {
            settings,
            store,
            channel,
            breaker: CircuitBreaker::with_defaults("telegram"),
            started_at: Instant::now(),
            requests_today: AtomicU64::new(0),
            errors_today: AtomicU64::new(0),
        }
    }

    /// The delivery circuit, for health tracking.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Fold one scan cycle's counters into the day totals for the report.
    pub fn note_cycle(&self, stats: &CycleStats) {
        self.requests_today
            .fetch_add(stats.requests_made, Ordering::Relaxed);
        self.errors_today
            .fetch_add(stats.errors as u64, Ordering::Relaxed);
    }

    async fn deliver(&self, text: &str, disable_preview: bool) -> Option<String> {
        match self
            .breaker
            .call(|| self.channel.send(text, disable_preview))
            .await
        {
            Ok(id) => Some(id),
            Err(BreakerError::Open { name, retry_in_secs }) => {
                debug!(breaker = %name, retry_in_secs, "delivery circuit open");
                None
            }
            Err(BreakerError::Inner(e)) => {
                error!(error = %e, "message delivery failed");
                None
            }
        }
    }

    async fn deliver_or_queue(&self, text: &str, msg_type: &str) {
        match self.breaker.call(|| self.channel.send(text, true)).await {
            Ok(_) => debug!(msg_type, "alert message sent"),
            Err(BreakerError::Open { .. }) => {
                info!(msg_type, "delivery circuit open, message queued");
                if let Err(e) = self.store.queue_message(text, msg_type).await {
                    error!(error = %e, "failed to queue message");
                }
            }
            Err(BreakerError::Inner(e)) => {
                error!(msg_type, error = %e, "alert delivery failed");
            }
        }
    }

    /// Send every unsent instant alert, one message per job.
    pub async fn process_instant_alerts(&self) -> Result<usize, NotifyError> {
        let rows = self.store.unsent_instant_alerts().await?;
        if rows.is_empty() {
            debug!("no unsent instant alerts");
            return Ok(0);
        }

        let total = rows.len();
        let mut sent = 0;
        for job in &rows {
            let text = format_instant_alert(job, None);
            match self.deliver(&text, false).await {
                Some(message_id) => {
                    if let Err(e) = self
                        .store
                        .mark_notified(&job.listing_id, "instant", &message_id)
                        .await
                    {
                        warn!(listing_id = %job.listing_id, error = %e, "failed to mark alert notified");
                        continue;
                    }
                    sent += 1;
                    info!(
                        listing_id = %job.listing_id,
                        title = %truncate_chars(&job.title, 40),
                        %message_id,
                        "instant alert sent"
                    );
                }
                None => {
                    error!(listing_id = %job.listing_id, "failed to send instant alert");
                }
            }
        }

        info!(sent, total, "instant alerts dispatched");
        Ok(sent)
    }

    /// Send unsent digest jobs as one batched message, best first. All
    /// included jobs are marked under the single message id.
    pub async fn process_digest(&self) -> Result<usize, NotifyError> {
        let mut rows = self.store.unsent_digest_jobs().await?;
        if rows.is_empty() {
            debug!("no unsent digest jobs");
            return Ok(0);
        }

        rows.sort_by(|a, b| b.overall_score.cmp(&a.overall_score));
        rows.truncate(DIGEST_BATCH_LIMIT);

        let text = format_digest(&rows);
        let Some(message_id) = self.deliver(&text, true).await else {
            error!("failed to send digest");
            return Ok(0);
        };

        for job in &rows {
            if let Err(e) = self
                .store
                .mark_notified(&job.listing_id, "digest", &message_id)
                .await
            {
                warn!(listing_id = %job.listing_id, error = %e, "failed to mark digest notified");
            }
        }
        info!(jobs = rows.len(), %message_id, "digest sent");
        Ok(rows.len())
    }

    /// Today's report text, computed fresh from aggregate queries. Also
    /// serves the /stats command reply.
    pub async fn render_daily_report(&self) -> Result<String, NotifyError> {
        let stats = self.store.today_stats().await?;
        let top_jobs = self.store.top_jobs_today(5).await?;
        let requests = self.requests_today.load(Ordering::Relaxed);
        let errors = self.errors_today.load(Ordering::Relaxed) as i64;
        Ok(format_daily_report(&stats, &top_jobs, requests, errors))
    }

    /// Send today's report. Regenerable, so there is no unsent state to
    /// mark; day counters reset only after a successful send.
    pub async fn process_daily_report(&self) -> Result<bool, NotifyError> {
        let text = self.render_daily_report().await?;
        match self.deliver(&text, true).await {
            Some(message_id) => {
                info!(%message_id, "daily report sent");
                self.requests_today.store(0, Ordering::Relaxed);
                self.errors_today.store(0, Ordering::Relaxed);
                Ok(true)
            }
            None => {
                error!("failed to send daily report");
                Ok(false)
            }
        }
    }

    pub async fn send_startup_message(
        &self,
        primary_provider: &str,
        fallback_provider: &str,
        scan_interval_seconds: u64,
    ) {
        let lines = [
            format!("🚀 <b>{APP_TITLE} — تم التشغيل</b>"),
            String::new(),
            format!(
                "⏱ الوقت: {}",
                Local::now().format("%Y-%m-%d %H:%M")
            ),
            format!(
                "🤖 AI: {} (fallback: {})",
                escape_html(primary_provider),
                escape_html(fallback_provider)
            ),
            format!("📊 فحص كل: {scan_interval_seconds} ثانية"),
            format!("⚡ تنبيه فوري: ≥ {}", self.settings.instant_alert_threshold),
            format!("📋 ملخص: ≥ {}", self.settings.digest_threshold),
        ];
        self.deliver_or_queue(&lines.join("\n"), "startup").await;
    }

    pub async fn send_shutdown_message(&self) {
        let uptime = self.started_at.elapsed().as_secs();
        let hours = uptime / 3600;
        let mins = (uptime % 3600) / 60;
        let uptime_str = if hours > 0 {
            format!("{hours}h {mins}m")
        } else {
            format!("{mins}m")
        };

        let lines = [
            format!("🔴 <b>{APP_TITLE} — تم الإيقاف</b>"),
            String::new(),
            format!("⏱ مدة التشغيل: {uptime_str}"),
        ];
        self.deliver_or_queue(&lines.join("\n"), "shutdown").await;
    }

    pub async fn send_error_alert(&self, message: &str) {
        let lines = [
            format!("❌ <b>{APP_TITLE} — خطأ</b>"),
            String::new(),
            format!("⚠️ {}", escape_html(message)),
        ];
        self.deliver_or_queue(&lines.join("\n"), "error").await;
    }

    /// Health alerts arrive pre-formatted from the monitor.
    pub async fn send_system_alert(&self, text: &str) {
        self.deliver_or_queue(&escape_html(text), "alert").await;
    }

    /// FIFO flush of parked messages once the delivery circuit is closed.
    /// Stops on the first failure so ordering is preserved.
    pub async fn flush_queue(&self) -> Result<usize, NotifyError> {
        if self.breaker.is_open().await {
            debug!("delivery circuit still open, queue untouched");
            return Ok(0);
        }
        let pending = self.store.queued_messages().await?;
        if pending.is_empty() {
            return Ok(0);
        }

        let mut flushed = 0;
        for queued in &pending {
            match self.deliver(&queued.message, true).await {
                Some(_) => {
                    self.store.delete_queued_message(queued.id).await?;
                    flushed += 1;
                }
                None => {
                    warn!(
                        remaining = pending.len() - flushed,
                        "queue flush interrupted"
                    );
                    break;
                }
            }
        }
        if flushed > 0 {
            info!(flushed, "queued messages flushed");
        }
        Ok(flushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fjr_core::{AnalysisRecord, JobListing, Recommendation, ScoreAdjustment};
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    fn scored(id: &str, title: &str, overall: i64) -> ScoredJob {
        ScoredJob {
            listing_id: id.to_string(),
            title: title.to_string(),
            url: format!("https://market.test/project/{id}"),
            budget_min: Some(100.0),
            budget_max: Some(300.0),
            proposals_count: 3,
            overall_score: overall,
            fit_score: 80,
            hiring_probability: 75,
            budget_fairness: 70,
            job_clarity: 65,
            competition_level: 60,
            job_summary: "ملخص المشروع".to_string(),
            green_flags: vec!["ناشر موثق".to_string()],
            ..ScoredJob::default()
        }
    }

    #[test]
    fn html_escaping_is_ordered() {
        assert_eq!(escape_html("a & <b>"), "a &amp; &lt;b&gt;");
        assert_eq!(
            html_link("نص <هام>", "https://x.test/?a=1&b=2"),
            "<a href=\"https://x.test/?a=1&amp;b=2\">نص &lt;هام&gt;</a>"
        );
    }

    #[test]
    fn progress_bar_rounds_to_length() {
        assert_eq!(progress_bar(0, 10), "▱▱▱▱▱▱▱▱▱▱");
        assert_eq!(progress_bar(100, 10), "▰▰▰▰▰▰▰▰▰▰");
        assert_eq!(progress_bar(50, 10), "▰▰▰▰▰▱▱▱▱▱");
        assert_eq!(progress_bar(73, 15), "▰▰▰▰▰▰▰▰▰▰▰▱▱▱▱");
        assert_eq!(progress_bar(-10, 10), "▱▱▱▱▱▱▱▱▱▱");
    }

    #[test]
    fn budget_formatting_covers_partial_ranges() {
        assert_eq!(format_budget(Some(100.0), Some(100.0)), "$100");
        assert_eq!(format_budget(Some(50.0), Some(150.0)), "$50 - $150");
        assert_eq!(format_budget(None, Some(200.0)), "$200");
        assert_eq!(format_budget(Some(0.0), Some(200.0)), "$200");
        assert_eq!(format_budget(Some(50.0), None), "$50+");
        assert_eq!(format_budget(Some(0.0), Some(0.0)), "غير محدد");
        assert_eq!(format_budget(None, None), "غير محدد");
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("hello", 4000), vec!["hello".to_string()]);
    }

    #[test]
    fn long_messages_split_at_paragraphs() {
        let first = "a".repeat(3000);
        let second = "b".repeat(2000);
        let text = format!("{first}\n\n{second}");
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks, vec![first, second]);
    }

    #[test]
    fn unbroken_text_is_force_split() {
        let text = "x".repeat(9000);
        let chunks = split_message(&text, 4000);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 4000);
        assert_eq!(chunks[2].len(), 1000);
    }

    #[test]
    fn formatting_strip_flattens_links_and_tags() {
        let text = "<b>عنوان</b>\n<a href=\"https://x.test/p/1\">مشروع</a>\nscore &gt; 80 &amp; rising";
        assert_eq!(
            strip_formatting(text),
            "عنوان\nمشروع (https://x.test/p/1)\nscore > 80 & rising"
        );
    }

    #[test]
    fn instant_alert_header_tiers_follow_score() {
        let mut job = scored("p1", "تطوير موقع", 92);
        assert!(format_instant_alert(&job, None).starts_with("<b>🔥🔥🔥 فرصة استثنائية!</b>"));
        job.overall_score = 83;
        assert!(format_instant_alert(&job, None).contains("🔥🔥 فرصة مميزة"));
        job.overall_score = 71;
        assert!(format_instant_alert(&job, None).starts_with("<b>🔥 فرصة جيدة</b>"));
        job.overall_score = 50;
        assert!(format_instant_alert(&job, None).contains("📋 فرصة جديدة"));
    }

    #[test]
    fn instant_alert_lists_facts_and_caps_flags() {
        let mut job = scored("p1", "تطوير موقع", 85);
        job.red_flags = (1..=6).map(|i| format!("تحذير {i}")).collect();
        let text = format_instant_alert(&job, None);

        assert!(text.contains("<a href=\"https://market.test/project/p1\">تطوير موقع</a>"));
        assert!(text.contains("💰 $100 - $300"));
        assert!(text.contains("📊 3 عروض"));
        assert!(text.contains("⚡ الدرجة الكلية: <b>85/100</b>"));
        assert!(text.contains("🎯 التوافق: <b>80%</b>"));
        assert!(text.contains("تحذير 4"));
        assert!(!text.contains("تحذير 5"));
        // No breakdown supplied, so no base/bonus line.
        assert!(!text.contains("📊 القاعدة"));
    }

    #[test]
    fn instant_alert_shows_breakdown_when_adjustments_applied() {
        let job = scored("p1", "تطوير موقع", 85);
        let breakdown = ScoreBreakdown {
            base_score: 72.4,
            bonuses: vec![ScoreAdjustment {
                label: "الناشر موثق (+5)".to_string(),
                points: 5,
            }],
            penalties: vec![ScoreAdjustment {
                label: "ميزانية منخفضة $90 (-10)".to_string(),
                points: 10,
            }],
            final_score: 68,
            recommendation: Recommendation::Digest,
            reasoning: String::new(),
        };
        let text = format_instant_alert(&job, Some(&breakdown));
        assert!(text.contains("📊 القاعدة: 72 + مكافآت: 5 - خصومات: 10"));
    }

    #[test]
    fn oversized_alert_is_truncated() {
        let mut job = scored("p1", "مشروع", 85);
        job.job_summary = "و".repeat(5000);
        let text = format_instant_alert(&job, None);
        assert!(text.chars().count() <= 3954);
        assert!(text.ends_with("\n..."));
    }

    #[test]
    fn empty_digest_has_fixed_text() {
        assert_eq!(
            format_digest(&[]),
            "<b>📋 لا توجد فرص جديدة في هذه الفترة</b>"
        );
    }

    #[test]
    fn digest_sorts_and_marks_scores() {
        let jobs = vec![
            scored("p1", "مشروع أول", 55),
            scored("p2", "مشروع ثان", 75),
        ];
        let text = format_digest(&jobs);
        assert!(text.starts_with("<b>📋 ملخص الفرص — 2 مشروع جديد</b>"));
        let high = text.find("مشروع ثان").expect("high scorer present");
        let low = text.find("مشروع أول").expect("low scorer present");
        assert!(high < low);
        assert!(text.contains("🟢"));
        assert!(text.contains("🟡"));
        assert!(text.contains("🎯 الدرجة: <b>75%</b>"));
    }

    #[test]
    fn daily_report_includes_counts_and_health() {
        let stats = DailyStats {
            date: "2026-03-01".to_string(),
            jobs_discovered: 12,
            instant_count: 2,
            digest_count: 5,
            skipped_count: 4,
            avg_fit_score: 57.3,
            avg_hiring_probability: 61.0,
            tokens_used: 8400,
            ..DailyStats::default()
        };
        let top = vec![scored("p2", "مشروع ثان", 88)];
        let text = format_daily_report(&stats, &top, 42, 0);

        assert!(text.contains("📊 التقرير اليومي — 2026-03-01"));
        assert!(text.contains("📌 المشاريع المكتشفة: <b>12</b>"));
        assert!(text.contains("🎯 متوسط التوافق: <b>57.3%</b>"));
        assert!(text.contains("1. <a href="));
        assert!(text.contains("🔄 طلبات HTTP: 42"));
        assert!(text.contains("🤖 رموز AI: 8400"));
        assert!(text.contains("✅ بدون أخطاء"));
    }

    #[test]
    fn system_status_reflects_pause_state() {
        let mut status = SystemStatus {
            paused: false,
            uptime: "2h 15m".to_string(),
            cycles: 9,
            last_scan: String::new(),
            errors: 0,
            jobs_today: 14,
            instant_today: 2,
            digest_today: 6,
        };
        let text = format_system_status(&status);
        assert!(text.contains("📍 الحالة: 🟢 يعمل"));
        assert!(text.contains("🕐 آخر فحص: لم يتم بعد"));
        assert!(text.contains("📌 مشاريع اليوم: <b>14</b>"));

        status.paused = true;
        status.last_scan = "2026-03-01 14:05".to_string();
        let text = format_system_status(&status);
        assert!(text.contains("📍 الحالة: ⏸ متوقف مؤقتاً"));
        assert!(text.contains("🕐 آخر فحص: 2026-03-01 14:05"));
    }

    struct StubChannel {
        ok: AtomicBool,
        sent: Mutex<Vec<String>>,
    }

    impl StubChannel {
        fn new(ok: bool) -> Arc<Self> {
            Arc::new(Self {
                ok: AtomicBool::new(ok),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent_count(&self) -> usize {
            self.sent.lock().expect("lock").len()
        }
    }

    #[async_trait]
    impl Channel for StubChannel {
        async fn send(&self, text: &str, _disable_preview: bool) -> Result<String, NotifyError> {
            if !self.ok.load(Ordering::SeqCst) {
                return Err(NotifyError::Exhausted);
            }
            let mut sent = self.sent.lock().expect("lock");
            sent.push(text.to_string());
            Ok(format!("{}", 1000 + sent.len()))
        }
    }

    fn settings() -> TelegramSettings {
        TelegramSettings {
            bot_token: "token".to_string(),
            chat_id: "1234".to_string(),
            instant_alert_threshold: 80,
            digest_threshold: 55,
            digest_interval_minutes: 30,
            daily_report_hour: 20,
            daily_report_minute: 0,
        }
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
    async fn instant_alerts_are_marked_and_not_resent() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        seed_analysis(&store, "a1", Recommendation::InstantAlert, 85).await;
        seed_analysis(&store, "a2", Recommendation::Skip, 30).await;

        let channel = StubChannel::new(true);
        let dispatcher = Dispatcher::new(settings(), store, channel.clone());

        assert_eq!(dispatcher.process_instant_alerts().await.expect("send"), 1);
        assert_eq!(channel.sent_count(), 1);
        assert_eq!(dispatcher.process_instant_alerts().await.expect("send"), 0);
        assert_eq!(channel.sent_count(), 1);
    }

    #[tokio::test]
    async fn digest_batches_into_one_message() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        seed_analysis(&store, "d1", Recommendation::Digest, 60).await;
        seed_analysis(&store, "d2", Recommendation::Digest, 68).await;

        let channel = StubChannel::new(true);
        let dispatcher = Dispatcher::new(settings(), store, channel.clone());

        assert_eq!(dispatcher.process_digest().await.expect("send"), 2);
        assert_eq!(channel.sent_count(), 1);
        {
            let sent = channel.sent.lock().expect("lock");
            assert!(sent[0].contains("مشروع d1"));
            assert!(sent[0].contains("مشروع d2"));
        }
        assert_eq!(dispatcher.process_digest().await.expect("send"), 0);
    }

    #[tokio::test]
    async fn failed_sends_leave_jobs_eligible() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        seed_analysis(&store, "a1", Recommendation::InstantAlert, 85).await;

        let channel = StubChannel::new(false);
        let dispatcher = Dispatcher::new(settings(), store, channel.clone());

        assert_eq!(dispatcher.process_instant_alerts().await.expect("run"), 0);
        channel.ok.store(true, Ordering::SeqCst);
        assert_eq!(dispatcher.process_instant_alerts().await.expect("run"), 1);
    }

    #[tokio::test]
    async fn open_circuit_queues_alerts_until_flush() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        let channel = StubChannel::new(false);
        let dispatcher = Dispatcher::new(settings(), store.clone(), channel.clone());

        // Five failures open the circuit; those messages are lost.
        for _ in 0..5 {
            dispatcher.send_error_alert("قاعدة البيانات لا تستجيب").await;
        }
        assert!(dispatcher.breaker().is_open().await);

        dispatcher.send_error_alert("انقطاع مستمر").await;
        let queued = store.queued_messages().await.expect("queue");
        assert_eq!(queued.len(), 1);
        assert!(queued[0].message.contains("انقطاع مستمر"));

        // Channel heals, circuit closes, flush drains in order.
        channel.ok.store(true, Ordering::SeqCst);
        dispatcher.breaker().reset().await;
        assert_eq!(dispatcher.flush_queue().await.expect("flush"), 1);
        assert!(store.queued_messages().await.expect("queue").is_empty());
        assert_eq!(channel.sent_count(), 1);
    }

    #[tokio::test]
    async fn flush_skips_while_circuit_open() {
        let store = SqliteStore::open_in_memory().await.expect("store");
        store.queue_message("parked", "alert").await.expect("queue");

        let channel = StubChannel::new(false);
        let dispatcher = Dispatcher::new(settings(), store.clone(), channel.clone());
        for _ in 0..5 {
            dispatcher.send_error_alert("فشل").await;
        }

        assert_eq!(dispatcher.flush_queue().await.expect("flush"), 0);
        assert_eq!(store.queued_messages().await.expect("queue").len(), 1);
    }
}
