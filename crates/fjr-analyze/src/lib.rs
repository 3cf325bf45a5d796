//! AI job analysis: provider clients with failover, response parsing,
//! prompt building, and the rule-based scoring engine.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fjr_core::{AnalysisRecord, CandidateJob, FreelancerProfile, Recommendation, ScoreAdjustment, ScoreBreakdown};
use fjr_storage::{BreakerError, CircuitBreaker, SlidingWindowLimiter};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fjr-analyze";

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const GROQ_API_URL: &str = "https://api.groq.com/openai/v1/chat/completions";
const GROQ_SYSTEM_PROMPT: &str =
    "You are a freelancing job analyst. Always respond with valid JSON only, no markdown.";
const PROVIDER_TIMEOUT: Duration = Duration::from_secs(120);

/// One provider call's failure modes. All of them count as breaker
/// failures when surfaced through [`UnifiedAiClient`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("http status {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited")]
    Throttled,
    #[error("empty response")]
    Empty,
    #[error("malformed response: {0}")]
    Malformed(String),
}

// ── settings ────────────────────────────────────────────────────────────

/// The `ai` section of the settings document.
#[derive(Debug, Clone, Deserialize)]
pub struct AiSettings {
    pub primary_provider: String,
    pub fallback_provider: String,
    pub gemini: GeminiSettings,
    pub groq: GroqSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub rpm_limit: u32,
    #[serde(default = "default_rpd_limit")]
    pub rpd_limit: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GroqSettings {
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub rpm_limit: u32,
}

fn default_rpd_limit() -> u32 {
    1500
}

// ── provider trait ──────────────────────────────────────────────────────

/// A JSON-producing analysis provider. Implementations own their rate
/// limiting; failure handling and failover live in [`UnifiedAiClient`].
#[async_trait]
pub trait AiProvider: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;
    /// Send a prompt and return the parsed JSON object with the
    /// `_provider`, `_model` and `_tokens_used` metadata keys merged in.
    async fn generate(&self, prompt: &str) -> Result<JsonValue, ProviderError>;
}

/// Pull the first JSON object out of a model reply: strips markdown
/// fences, then scans for balanced braces when the text does not already
/// start with one. An unclosed object is returned to the end of the text.
pub fn extract_json_object(text: &str) -> &str {
    let mut out = text.trim();
    if let Some(rest) = out.strip_prefix("```") {
        out = rest.strip_prefix("json").unwrap_or(rest).trim_start();
    }
    if let Some(rest) = out.trim_end().strip_suffix("```") {
        out = rest.trim_end();
    }
    out = out.trim();

    if out.starts_with('{') {
        return out;
    }
    if let Some(start) = out.find('{') {
        let mut depth = 0usize;
        for (i, ch) in out[start..].char_indices() {
            match ch {
                '{' => depth += 1,
                '}' => {
                    depth -= 1;
                    if depth == 0 {
                        return &out[start..start + i + 1];
                    }
                }
                _ => {}
            }
        }
        return &out[start..];
    }
    out
}

/// Clean and parse a raw model reply, then merge provider metadata into
/// the resulting object.
fn finish_payload(
    raw_text: &str,
    provider: &str,
    model: &str,
    tokens: i64,
) -> Result<JsonValue, ProviderError> {
    let cleaned = extract_json_object(raw_text);
    let parsed: JsonValue = serde_json::from_str(cleaned)
        .map_err(|e| ProviderError::Malformed(format!("json parse: {e}")))?;
    let JsonValue::Object(mut map) = parsed else {
        return Err(ProviderError::Malformed("reply is not a json object".to_string()));
    };
    map.insert("_tokens_used".to_string(), JsonValue::from(tokens));
    map.insert("_provider".to_string(), JsonValue::from(provider));
    map.insert("_model".to_string(), JsonValue::from(model));
    Ok(JsonValue::Object(map))
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

// ── gemini ──────────────────────────────────────────────────────────────

/// Client for the Gemini `generateContent` endpoint.
pub struct GeminiClient {
    http: reqwest::Client,
    settings: GeminiSettings,
    base_url: String,
    limiter: SlidingWindowLimiter,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .context("building gemini http client")?;
        let limiter =
            SlidingWindowLimiter::new(settings.rpm_limit.max(1) as usize, Duration::from_secs(60));
        Ok(Self {
            http,
            settings,
            base_url: GEMINI_API_BASE.to_string(),
            limiter,
        })
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }
}

fn gemini_request_body(prompt: &str, settings: &GeminiSettings) -> JsonValue {
    serde_json::json!({
        "contents": [{ "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "temperature": settings.temperature,
            "maxOutputTokens": settings.max_tokens,
            "responseMimeType": "application/json",
            "thinkingConfig": { "thinkingBudget": 0 },
        },
        "safetySettings": [
            { "category": "HARM_CATEGORY_HARASSMENT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_HATE_SPEECH", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_SEXUALLY_EXPLICIT", "threshold": "BLOCK_NONE" },
            { "category": "HARM_CATEGORY_DANGEROUS_CONTENT", "threshold": "BLOCK_NONE" },
        ],
    })
}

/// Last non-thought text part of the first candidate. Thinking models
/// emit reasoning parts flagged `thought: true` ahead of the answer.
fn gemini_extract_text(data: &JsonValue) -> Result<String, ProviderError> {
    let parts = data
        .pointer("/candidates/0/content/parts")
        .and_then(JsonValue::as_array)
        .ok_or(ProviderError::Empty)?;
    parts
        .iter()
        .filter(|part| !part.get("thought").and_then(JsonValue::as_bool).unwrap_or(false))
        .filter_map(|part| part.get("text").and_then(JsonValue::as_str))
        .last()
        .map(str::to_string)
        .ok_or(ProviderError::Empty)
}

#[async_trait]
impl AiProvider for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, prompt: &str) -> Result<JsonValue, ProviderError> {
        self.limiter.acquire().await;

        let url = format!("{}/{}:generateContent", self.base_url, self.settings.model);
        let body = gemini_request_body(prompt, &self.settings);
        let response = self
            .http
            .post(&url)
            .query(&[("key", self.settings.api_key.as_str())])
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("gemini rate limited (429), waiting 60s");
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Err(ProviderError::Throttled);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = truncate_chars(&text, 300);
            error!(status = status.as_u16(), %body, "gemini http error");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: JsonValue = response.json().await?;
        let raw_text = match gemini_extract_text(&data) {
            Ok(text) => text,
            Err(e) => {
                warn!("gemini returned no usable text parts");
                return Err(e);
            }
        };
        let tokens = data
            .pointer("/usageMetadata/totalTokenCount")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);

        let result = finish_payload(&raw_text, "gemini", &self.settings.model, tokens)?;
        info!(tokens, "gemini response ok");
        Ok(result)
    }
}

// ── groq ────────────────────────────────────────────────────────────────

/// Client for the Groq chat-completions endpoint (OpenAI-compatible).
pub struct GroqClient {
    http: reqwest::Client,
    settings: GroqSettings,
    url: String,
    limiter: SlidingWindowLimiter,
}

impl GroqClient {
    pub fn new(settings: GroqSettings) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(PROVIDER_TIMEOUT)
            .build()
            .context("building groq http client")?;
        let limiter =
            SlidingWindowLimiter::new(settings.rpm_limit.max(1) as usize, Duration::from_secs(60));
        Ok(Self {
            http,
            settings,
            url: GROQ_API_URL.to_string(),
            limiter,
        })
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

fn groq_request_body(prompt: &str, settings: &GroqSettings) -> JsonValue {
    serde_json::json!({
        "model": settings.model,
        "messages": [
            { "role": "system", "content": GROQ_SYSTEM_PROMPT },
            { "role": "user", "content": prompt },
        ],
        "temperature": settings.temperature,
        "max_tokens": settings.max_tokens,
        "response_format": { "type": "json_object" },
    })
}

fn groq_extract_text(data: &JsonValue) -> Result<String, ProviderError> {
    data.pointer("/choices/0/message/content")
        .and_then(JsonValue::as_str)
        .map(str::to_string)
        .ok_or(ProviderError::Empty)
}

#[async_trait]
impl AiProvider for GroqClient {
    fn name(&self) -> &str {
        "groq"
    }

    fn model(&self) -> &str {
        &self.settings.model
    }

    async fn generate(&self, prompt: &str) -> Result<JsonValue, ProviderError> {
        self.limiter.acquire().await;

        let body = groq_request_body(prompt, &self.settings);
        let response = self
            .http
            .post(&self.url)
            .header(AUTHORIZATION, format!("Bearer {}", self.settings.api_key))
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!("groq rate limited (429), waiting 60s");
            tokio::time::sleep(Duration::from_secs(60)).await;
            return Err(ProviderError::Throttled);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let body = truncate_chars(&text, 300);
            error!(status = status.as_u16(), %body, "groq http error");
            return Err(ProviderError::Http {
                status: status.as_u16(),
                body,
            });
        }

        let data: JsonValue = response.json().await?;
        let raw_text = match groq_extract_text(&data) {
            Ok(text) => text,
            Err(e) => {
                warn!("groq returned no choices");
                return Err(e);
            }
        };
        let tokens = data
            .pointer("/usage/total_tokens")
            .and_then(JsonValue::as_i64)
            .unwrap_or(0);

        let result = finish_payload(&raw_text, "groq", &self.settings.model, tokens)?;
        info!(tokens, "groq response ok");
        Ok(result)
    }
}

// ── unified client ──────────────────────────────────────────────────────

/// Primary/fallback provider pair, each behind its own circuit breaker.
///
/// `analyze` never returns an error: a reply from either provider is
/// `Some`, anything else is `None` after both circuits have recorded the
/// failure.
pub struct UnifiedAiClient {
    primary: Box<dyn AiProvider>,
    fallback: Box<dyn AiProvider>,
    breaker_primary: CircuitBreaker,
    breaker_fallback: CircuitBreaker,
}

impl UnifiedAiClient {
    pub fn new(settings: &AiSettings) -> anyhow::Result<Self> {
        let gemini = GeminiClient::new(settings.gemini.clone())?;
        let groq = GroqClient::new(settings.groq.clone())?;
        let client = if settings.primary_provider == "gemini" {
            Self::from_parts(Box::new(gemini), Box::new(groq))
        } else {
            Self::from_parts(Box::new(groq), Box::new(gemini))
        };
        info!(
            primary = client.primary.name(),
            fallback = client.fallback.name(),
            "ai client initialized"
        );
        Ok(client)
    }

    /// Assemble from arbitrary providers. Breaker defaults match the
    /// provider policy: 5 failures, 5 minute cooldown.
    pub fn from_parts(primary: Box<dyn AiProvider>, fallback: Box<dyn AiProvider>) -> Self {
        let breaker_primary = CircuitBreaker::with_defaults(primary.name());
        let breaker_fallback = CircuitBreaker::with_defaults(fallback.name());
        Self {
            primary,
            fallback,
            breaker_primary,
            breaker_fallback,
        }
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    pub fn fallback_name(&self) -> &str {
        self.fallback.name()
    }

    /// Breakers in primary, fallback order, for health reporting.
    pub fn circuit_breakers(&self) -> [&CircuitBreaker; 2] {
        [&self.breaker_primary, &self.breaker_fallback]
    }

    pub async fn analyze(&self, prompt: &str) -> Option<JsonValue> {
        match self.breaker_primary.call(|| self.primary.generate(prompt)).await {
            Ok(value) => {
                info!(provider = self.primary.name(), "analysis complete");
                return Some(value);
            }
            Err(BreakerError::Open { .. }) => {
                debug!(
                    provider = self.primary.name(),
                    "primary circuit is open, skipping to fallback"
                );
            }
            Err(BreakerError::Inner(e)) => {
                warn!(
                    provider = self.primary.name(),
                    error = %e,
                    "primary provider failed, trying fallback"
                );
            }
        }

        let result = match self.breaker_fallback.call(|| self.fallback.generate(prompt)).await {
            Ok(value) => {
                info!(provider = self.fallback.name(), "analysis complete via fallback");
                Some(value)
            }
            Err(BreakerError::Open { .. }) => {
                error!(
                    primary = self.primary.name(),
                    fallback = self.fallback.name(),
                    "both ai circuits open"
                );
                None
            }
            Err(BreakerError::Inner(e)) => {
                error!(provider = self.fallback.name(), error = %e, "fallback provider also failed");
                None
            }
        };
        if result.is_none() {
            error!("both ai providers failed");
        }
        result
    }
}

// ── response parsing ────────────────────────────────────────────────────

fn coerce_int(value: Option<&JsonValue>, default: i64) -> i64 {
    match value {
        None | Some(JsonValue::Null) => default,
        Some(JsonValue::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(default),
        Some(JsonValue::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(|f| f as i64)
            .unwrap_or(default),
        _ => default,
    }
}

fn coerce_string(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn coerce_string_list(value: Option<&JsonValue>) -> Vec<String> {
    match value {
        None | Some(JsonValue::Null) => Vec::new(),
        Some(JsonValue::Array(items)) => items
            .iter()
            .map(|item| match item {
                JsonValue::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(JsonValue::String(s)) => {
            if s.trim().is_empty() {
                Vec::new()
            } else {
                vec![s.clone()]
            }
        }
        _ => Vec::new(),
    }
}

fn score_field(map: &serde_json::Map<String, JsonValue>, key: &str) -> i64 {
    coerce_int(map.get(key), 50).clamp(0, 100)
}

/// Normalize a raw provider reply into an [`AnalysisRecord`]. Missing
/// fields get defaults, scores are clamped to 0-100, string values are
/// wrapped where lists are expected. Returns `None` only when the reply
/// is not a JSON object at all.
pub fn parse_analysis(raw: &JsonValue, listing_id: &str) -> Option<AnalysisRecord> {
    let Some(map) = raw.as_object() else {
        error!(listing_id, "ai reply is not a json object");
        return None;
    };

    let mut record = AnalysisRecord::new(listing_id);
    record.hiring_probability = score_field(map, "hiring_probability");
    record.fit_score = score_field(map, "fit_score");
    record.budget_fairness = score_field(map, "budget_fairness");
    record.job_clarity = score_field(map, "job_clarity");
    record.competition_level = score_field(map, "competition_level");
    record.urgency_score = score_field(map, "urgency_score");
    record.overall_score = score_field(map, "overall_score");

    record.job_summary = coerce_string(map.get("job_summary"));
    record.required_skills_analysis = coerce_string(map.get("required_skills_analysis"));
    record.recommended_proposal_angle = coerce_string(map.get("recommended_proposal_angle"));
    record.estimated_real_budget = coerce_string(map.get("estimated_real_budget"));
    record.recommendation_reason = coerce_string(map.get("recommendation_reason"));
    record.red_flags = coerce_string_list(map.get("red_flags"));
    record.green_flags = coerce_string_list(map.get("green_flags"));

    let rec_text = match map.get("recommendation") {
        None => "skip".to_string(),
        some => coerce_string(some),
    };
    record.recommendation = match Recommendation::parse(&rec_text) {
        Some(rec) => rec,
        None => {
            warn!(listing_id, value = %rec_text, "invalid recommendation, defaulting to skip");
            Recommendation::Skip
        }
    };

    record.ai_provider = coerce_string(map.get("_provider"));
    record.ai_model = coerce_string(map.get("_model"));
    record.tokens_used = coerce_int(map.get("_tokens_used"), 0);

    debug!(
        listing_id,
        overall = record.overall_score,
        recommendation = record.recommendation.as_str(),
        "analysis parsed"
    );
    Some(record)
}

/// Sanity warnings over a parsed record. Nothing here blocks the record;
/// callers log the warnings and move on.
pub fn validate_scores(record: &AnalysisRecord) -> Vec<String> {
    let mut warnings = Vec::new();
    let scores = [
        ("hiring_probability", record.hiring_probability),
        ("fit_score", record.fit_score),
        ("budget_fairness", record.budget_fairness),
        ("job_clarity", record.job_clarity),
        ("competition_level", record.competition_level),
        ("urgency_score", record.urgency_score),
        ("overall_score", record.overall_score),
    ];

    for (name, score) in scores {
        if !(0..=100).contains(&score) {
            warnings.push(format!("{name} out of range: {score}"));
        }
        if score == 0 {
            warnings.push(format!("{name} is exactly 0 (suspiciously low)"));
        }
        if score == 100 {
            warnings.push(format!("{name} is exactly 100 (suspiciously perfect)"));
        }
    }

    if record.job_summary.is_empty() {
        warnings.push("job_summary is empty".to_string());
    }
    if record.red_flags.is_empty() && record.green_flags.is_empty() {
        warnings.push("Both red_flags and green_flags are empty".to_string());
    }
    warnings
}

// ── prompt ──────────────────────────────────────────────────────────────

/// The analysis prompt: job facts, publisher facts, the freelancer
/// profile, and the scoring rubric. English instructions, Arabic
/// qualitative outputs.
pub fn build_analysis_prompt(job: &CandidateJob, profile: &FreelancerProfile) -> String {
    let mut description = if job.full_description.is_empty() {
        job.brief_description.clone()
    } else {
        job.full_description.clone()
    };
    if description.chars().count() > 600 {
        description = description.chars().take(600).collect();
        description.push_str("...");
    }

    let budget_display = match (job.budget_min, job.budget_max) {
        (Some(min), Some(max)) => format!("{} (${min:.0}-${max:.0})", job.budget_raw),
        _ => job.budget_raw.clone(),
    };
    let skills_display = if job.skills.is_empty() {
        "Not specified".to_string()
    } else {
        job.skills.join(", ")
    };
    let verified = if job.identity_verified { "Yes" } else { "No" };
    let preferred_budget = format!(
        "${}-${}",
        profile.preferences.min_budget_usd, profile.preferences.max_budget_usd
    );

    format!(
"You are a freelancing market analyst. Analyze this job for a specific freelancer.

=== JOB DATA ===
Title: {title}
Category: {category}
Budget: {budget_display}
Duration: {duration}
Status: {status}
Posted: {time_posted}
Proposals: {proposals}
Skills Required: {skills_display}
Description: {description}

=== PUBLISHER INFO ===
Name: {publisher_name}
Hire Rate: {hire_rate_raw} ({hire_rate:.0}%)
Registered: {registration_date}
Open Projects: {open_projects}
Identity Verified: {verified}

=== FREELANCER PROFILE ===
Expert Skills: {expert}
Intermediate Skills: {intermediate}
Experience: {experience_years} years
Preferred Budget: {preferred_budget}

=== ANALYSIS INSTRUCTIONS ===
Score each dimension 0-100. Be CONSERVATIVE — underestimate rather than overestimate.

Score calibration:
- 0-20: Very negative signal
- 21-40: Below average, concerning
- 41-60: Average, uncertain, insufficient data
- 61-80: Above average, positive signal
- 81-100: Very strong positive signal (rare, needs strong evidence)

1. hiring_probability: Will the client actually hire someone?
   High (70+): verified identity, high hire rate (>60%), clear budget, past history
   Low (<40): new account, no hire history, vague budget, no verification

2. fit_score: Does this match the freelancer's skills?
   High (70+): multiple expert skills overlap, matching category, right experience level
   Low (<40): no skill overlap, wrong category, overqualified or underqualified

3. budget_fairness: Is the budget fair for the described work?
   High (70+): budget matches scope, competitive with market rates
   Low (<40): severely underpaid, unrealistic expectations for the budget

4. job_clarity: How well-defined is the job?
   High (70+): detailed description, clear deliverables, specific timeline
   Low (<40): vague description, unclear scope, no deliverables mentioned

5. competition_level: How favorable is the competition? (100 = almost no competition)
   High (70+): few proposals (<3), niche skills, recently posted
   Low (<40): many proposals (>10), generic skills, posted long ago

6. urgency_score: How time-sensitive is this job?
   High (70+): mentions deadline, urgent language, posted very recently
   Low (<40): no timeline pressure, posted days ago

Also provide:
- overall_score: Weighted average (fit_score×0.3 + hiring_probability×0.25 + budget_fairness×0.15 + job_clarity×0.1 + competition_level×0.1 + urgency_score×0.1)
- job_summary: 2-3 sentence summary in Arabic
- required_skills_analysis: Which freelancer skills match and what's missing (Arabic)
- red_flags: List of concerns (Arabic strings)
- green_flags: List of positives (Arabic strings)
- recommended_proposal_angle: Specific advice for a winning proposal (Arabic)
- estimated_real_budget: What the client would actually pay (e.g. \"$50-$100\")
- recommendation: One of \"instant_alert\", \"digest\", or \"skip\"
  - \"instant_alert\": overall_score >= 70 AND fit_score >= 60
  - \"digest\": overall_score >= 45 AND overall_score < 70
  - \"skip\": overall_score < 45
- recommendation_reason: Why this recommendation (Arabic)

Return ONLY a valid JSON object with exactly these keys. No markdown, no explanation, no extra text.",
        title = job.title,
        category = job.category,
        duration = job.duration,
        status = job.status,
        time_posted = job.time_posted,
        proposals = job.proposals_count,
        publisher_name = job.publisher_name,
        hire_rate_raw = job.hire_rate_raw,
        hire_rate = job.hire_rate,
        registration_date = job.registration_date,
        open_projects = job.open_projects,
        expert = profile.skills.expert.join(", "),
        intermediate = profile.skills.intermediate.join(", "),
        experience_years = profile.experience_years,
    )
}

// ── analyzer ────────────────────────────────────────────────────────────

/// Prompt + provider + parser pipeline for one candidate job.
pub struct JobAnalyzer {
    client: UnifiedAiClient,
    profile: FreelancerProfile,
}

impl JobAnalyzer {
    pub fn new(settings: &AiSettings, profile: FreelancerProfile) -> anyhow::Result<Self> {
        Ok(Self {
            client: UnifiedAiClient::new(settings)?,
            profile,
        })
    }

    pub fn circuit_breakers(&self) -> [&CircuitBreaker; 2] {
        self.client.circuit_breakers()
    }

    pub fn primary_provider(&self) -> &str {
        self.client.primary_name()
    }

    pub fn fallback_provider(&self) -> &str {
        self.client.fallback_name()
    }

    pub async fn analyze_job(&self, job: &CandidateJob) -> Option<AnalysisRecord> {
        info!(
            listing_id = %job.listing_id,
            title = %truncate_chars(&job.title, 50),
            "analyzing job"
        );
        let prompt = build_analysis_prompt(job, &self.profile);
        let Some(raw) = self.client.analyze(&prompt).await else {
            error!(listing_id = %job.listing_id, "analysis failed, both providers exhausted");
            return None;
        };
        let Some(record) = parse_analysis(&raw, &job.listing_id) else {
            error!(listing_id = %job.listing_id, "unparseable ai reply");
            return None;
        };
        for warning in validate_scores(&record) {
            warn!(listing_id = %job.listing_id, %warning, "score validation");
        }
        info!(
            listing_id = %job.listing_id,
            overall = record.overall_score,
            recommendation = record.recommendation.as_str(),
            provider = %record.ai_provider,
            tokens = record.tokens_used,
            "analysis complete"
        );
        Some(record)
    }
}

// ── scoring ─────────────────────────────────────────────────────────────

/// The `scoring` section of the settings document. Penalty values are
/// negative in the file; the engine applies their magnitude.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScoringSettings {
    #[serde(default)]
    pub weights: ScoreWeights,
    #[serde(default)]
    pub bonuses: BonusValues,
    #[serde(default)]
    pub penalties: PenaltyValues,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "w_hiring")]
    pub hiring_probability: f64,
    #[serde(default = "w_fit")]
    pub fit_score: f64,
    #[serde(default = "w_budget")]
    pub budget_fairness: f64,
    #[serde(default = "w_clarity")]
    pub job_clarity: f64,
    #[serde(default = "w_competition")]
    pub competition_level: f64,
    #[serde(default = "w_urgency")]
    pub urgency_score: f64,
}

fn w_hiring() -> f64 {
    0.3
}
fn w_fit() -> f64 {
    0.3
}
fn w_budget() -> f64 {
    0.15
}
fn w_clarity() -> f64 {
    0.1
}
fn w_competition() -> f64 {
    0.1
}
fn w_urgency() -> f64 {
    0.05
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            hiring_probability: w_hiring(),
            fit_score: w_fit(),
            budget_fairness: w_budget(),
            job_clarity: w_clarity(),
            competition_level: w_competition(),
            urgency_score: w_urgency(),
        }
    }
}

impl ScoreWeights {
    pub fn sum(&self) -> f64 {
        self.hiring_probability
            + self.fit_score
            + self.budget_fairness
            + self.job_clarity
            + self.competition_level
            + self.urgency_score
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BonusValues {
    #[serde(default = "b_verified")]
    pub publisher_verified: i64,
    #[serde(default = "b_hire_rate")]
    pub hire_rate_above_70: i64,
    #[serde(default = "b_few_proposals")]
    pub less_than_5_proposals: i64,
    #[serde(default = "b_budget")]
    pub budget_above_200: i64,
}

fn b_verified() -> i64 {
    5
}
fn b_hire_rate() -> i64 {
    10
}
fn b_few_proposals() -> i64 {
    8
}
fn b_budget() -> i64 {
    3
}

impl Default for BonusValues {
    fn default() -> Self {
        Self {
            publisher_verified: b_verified(),
            hire_rate_above_70: b_hire_rate(),
            less_than_5_proposals: b_few_proposals(),
            budget_above_200: b_budget(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PenaltyValues {
    #[serde(default = "p_no_description")]
    pub no_description: i64,
    #[serde(default = "p_too_many_proposals")]
    pub too_many_proposals: i64,
    #[serde(default = "p_never_hired")]
    pub publisher_never_hired: i64,
    #[serde(default = "p_low_budget")]
    pub budget_below_100: i64,
}

fn p_no_description() -> i64 {
    -20
}
fn p_too_many_proposals() -> i64 {
    -10
}
fn p_never_hired() -> i64 {
    -15
}
fn p_low_budget() -> i64 {
    -10
}

impl Default for PenaltyValues {
    fn default() -> Self {
        Self {
            no_description: p_no_description(),
            too_many_proposals: p_too_many_proposals(),
            publisher_never_hired: p_never_hired(),
            budget_below_100: p_low_budget(),
        }
    }
}

/// Weighted base from the six AI dimensions, rule bonuses and penalties
/// on top, clamped final score, then the recommendation decision with
/// the instant-alert override gate.
pub struct ScoringEngine {
    settings: ScoringSettings,
    instant_threshold: i64,
    digest_threshold: i64,
}

impl ScoringEngine {
    pub fn new(settings: ScoringSettings, instant_threshold: i64, digest_threshold: i64) -> Self {
        Self {
            settings,
            instant_threshold,
            digest_threshold,
        }
    }

    pub fn score(&self, analysis: &AnalysisRecord, job: &CandidateJob) -> ScoreBreakdown {
        let w = &self.settings.weights;
        let base = analysis.hiring_probability as f64 * w.hiring_probability
            + analysis.fit_score as f64 * w.fit_score
            + analysis.budget_fairness as f64 * w.budget_fairness
            + analysis.competition_level as f64 * w.competition_level
            + analysis.job_clarity as f64 * w.job_clarity
            + analysis.urgency_score as f64 * w.urgency_score;

        let bonuses = self.check_bonuses(job);
        let total_bonus: i64 = bonuses.iter().map(|b| b.points).sum();
        let penalties = self.check_penalties(job);
        let total_penalty: i64 = penalties.iter().map(|p| p.points).sum();

        let final_score =
            ((base + total_bonus as f64 - total_penalty as f64).round() as i64).clamp(0, 100);
        let recommendation = self.decide(final_score, analysis, job);
        let reasoning = build_reasoning(
            final_score,
            base,
            total_bonus,
            total_penalty,
            &bonuses,
            &penalties,
            recommendation,
        );

        info!(
            listing_id = %analysis.listing_id,
            base = (base * 10.0).round() / 10.0,
            bonus = total_bonus,
            penalty = total_penalty,
            score = final_score,
            recommendation = recommendation.as_str(),
            "job scored"
        );

        ScoreBreakdown {
            base_score: (base * 10.0).round() / 10.0,
            bonuses,
            penalties,
            final_score,
            recommendation,
            reasoning,
        }
    }

    fn check_bonuses(&self, job: &CandidateJob) -> Vec<ScoreAdjustment> {
        let mut bonuses = Vec::new();
        let cfg = &self.settings.bonuses;

        if job.identity_verified {
            bonuses.push(ScoreAdjustment {
                label: format!("الناشر موثق (+{})", cfg.publisher_verified),
                points: cfg.publisher_verified,
            });
        }
        if job.hire_rate > 70.0 {
            bonuses.push(ScoreAdjustment {
                label: format!(
                    "معدل توظيف عالي {:.0}% (+{})",
                    job.hire_rate, cfg.hire_rate_above_70
                ),
                points: cfg.hire_rate_above_70,
            });
        }
        if job.proposals_count < 5 {
            bonuses.push(ScoreAdjustment {
                label: format!(
                    "منافسة منخفضة — {} عروض فقط (+{})",
                    job.proposals_count, cfg.less_than_5_proposals
                ),
                points: cfg.less_than_5_proposals,
            });
        }
        if let Some(budget) = job.effective_budget() {
            if budget > 200.0 {
                bonuses.push(ScoreAdjustment {
                    label: format!("ميزانية جيدة ${budget:.0} (+{})", cfg.budget_above_200),
                    points: cfg.budget_above_200,
                });
            }
        }
        bonuses
    }

    fn check_penalties(&self, job: &CandidateJob) -> Vec<ScoreAdjustment> {
        let mut penalties = Vec::new();
        let cfg = &self.settings.penalties;

        let description = if job.full_description.is_empty() {
            &job.brief_description
        } else {
            &job.full_description
        };
        if description.trim().chars().count() < 20 {
            let points = cfg.no_description.abs();
            penalties.push(ScoreAdjustment {
                label: format!("بدون وصف (-{points})"),
                points,
            });
        }
        if job.proposals_count > 20 {
            let points = cfg.too_many_proposals.abs();
            penalties.push(ScoreAdjustment {
                label: format!("منافسة عالية جداً — {} عرض (-{points})", job.proposals_count),
                points,
            });
        }
        // "لم يحسب بعد" marks a new publisher; 0% means posted but never hired.
        let never_hired = job.hire_rate_raw == "لم يحسب بعد" || job.hire_rate == 0.0;
        if never_hired {
            let points = cfg.publisher_never_hired.abs();
            penalties.push(ScoreAdjustment {
                label: format!("الناشر لم يوظف أحداً بعد (-{points})"),
                points,
            });
        }
        if let Some(budget) = job.effective_budget() {
            if budget < 100.0 {
                let points = cfg.budget_below_100.abs();
                penalties.push(ScoreAdjustment {
                    label: format!("ميزانية منخفضة ${budget:.0} (-{points})"),
                    points,
                });
            }
        }
        penalties
    }

    /// Instant alerts are blocked for tiny budgets, crowded jobs, and
    /// publishers unlikely to hire, no matter how high the score got.
    fn blocks_instant(&self, job: &CandidateJob, analysis: &AnalysisRecord) -> bool {
        if let Some(budget) = job.effective_budget() {
            if budget < 15.0 {
                return true;
            }
        }
        if job.proposals_count > 30 {
            return true;
        }
        analysis.hiring_probability < 30
    }

    fn decide(
        &self,
        final_score: i64,
        analysis: &AnalysisRecord,
        job: &CandidateJob,
    ) -> Recommendation {
        let mut instant = final_score >= self.instant_threshold;
        if analysis.fit_score >= 85 && analysis.hiring_probability >= 60 {
            instant = true;
        }
        if instant && self.blocks_instant(job, analysis) {
            info!(listing_id = %analysis.listing_id, "instant alert blocked by override");
            instant = false;
        }

        if instant {
            return Recommendation::InstantAlert;
        }
        if final_score >= self.digest_threshold {
            return Recommendation::Digest;
        }
        Recommendation::Skip
    }
}

fn build_reasoning(
    final_score: i64,
    base: f64,
    total_bonus: i64,
    total_penalty: i64,
    bonuses: &[ScoreAdjustment],
    penalties: &[ScoreAdjustment],
    recommendation: Recommendation,
) -> String {
    let rec_ar = match recommendation {
        Recommendation::InstantAlert => "⚡ تنبيه فوري",
        Recommendation::Digest => "📋 ملخص",
        Recommendation::Skip => "⏭️ تخطي",
    };
    let mut lines = vec![format!(
        "الدرجة الكلية: {final_score}/100 | القاعدة: {base:.0} + مكافآت: {total_bonus} - خصومات: {total_penalty} | القرار: {rec_ar}"
    )];
    for bonus in bonuses {
        lines.push(format!("✅ {}", bonus.label));
    }
    for penalty in penalties {
        lines.push(format!("⚠️ {}", penalty.label));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use fjr_core::{ProfilePreferences, SkillTiers};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn test_profile() -> FreelancerProfile {
        FreelancerProfile {
            name: "Tester".to_string(),
            skills: SkillTiers {
                expert: vec!["Python".to_string(), "Django".to_string()],
                intermediate: vec!["Docker".to_string()],
                beginner: vec![],
            },
            experience_years: 6,
            preferences: ProfilePreferences {
                min_budget_usd: 50.0,
                max_budget_usd: 5000.0,
                preferred_categories: vec![],
                positive_keywords: vec![],
                negative_keywords: vec![],
            },
            bio: "Backend developer".to_string(),
            proposal_style: String::new(),
        }
    }

    fn candidate() -> CandidateJob {
        CandidateJob {
            listing_id: "j1".to_string(),
            title: "Build a booking system".to_string(),
            full_description: "A long and detailed description of the booking system project."
                .to_string(),
            budget_min: Some(250.0),
            budget_max: Some(500.0),
            budget_raw: "$250.00 - $500.00".to_string(),
            proposals_count: 2,
            identity_verified: true,
            hire_rate: 80.0,
            hire_rate_raw: "80%".to_string(),
            ..CandidateJob::default()
        }
    }

    fn analysis(scores: [i64; 6]) -> AnalysisRecord {
        let mut record = AnalysisRecord::new("j1");
        record.hiring_probability = scores[0];
        record.fit_score = scores[1];
        record.budget_fairness = scores[2];
        record.job_clarity = scores[3];
        record.competition_level = scores[4];
        record.urgency_score = scores[5];
        record
    }

    fn engine() -> ScoringEngine {
        ScoringEngine::new(ScoringSettings::default(), 80, 55)
    }

    #[test]
    fn json_extraction_strips_fences() {
        assert_eq!(extract_json_object("```json\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json_object("```\n{\"a\": 1}\n```"), "{\"a\": 1}");
        assert_eq!(extract_json_object("{\"a\": 1}"), "{\"a\": 1}");
    }

    #[test]
    fn json_extraction_finds_balanced_object_after_preamble() {
        let text = "Sure, here is the analysis: {\"a\": {\"b\": 2}} hope it helps";
        assert_eq!(extract_json_object(text), "{\"a\": {\"b\": 2}}");
    }

    #[test]
    fn json_extraction_takes_rest_when_unclosed() {
        assert_eq!(extract_json_object("prefix {\"a\": 1"), "{\"a\": 1");
        assert_eq!(extract_json_object("no object here"), "no object here");
    }

    #[test]
    fn gemini_body_disables_thinking_and_safety() {
        let settings = GeminiSettings {
            api_key: "k".to_string(),
            model: "gemini-2.5-flash".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
            rpm_limit: 10,
            rpd_limit: 1500,
        };
        let body = gemini_request_body("hello", &settings);
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingBudget"], 0);
        assert_eq!(body["safetySettings"].as_array().map(Vec::len), Some(4));
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
    }

    #[test]
    fn gemini_text_extraction_skips_thought_parts() {
        let data = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "thinking...", "thought": true },
                    { "text": "{\"overall_score\": 70}" }
                ]}
            }],
            "usageMetadata": { "totalTokenCount": 321 }
        });
        assert_eq!(
            gemini_extract_text(&data).expect("text"),
            "{\"overall_score\": 70}"
        );
        assert!(matches!(
            gemini_extract_text(&json!({ "candidates": [] })),
            Err(ProviderError::Empty)
        ));
    }

    #[test]
    fn groq_body_forces_json_mode() {
        let settings = GroqSettings {
            api_key: "k".to_string(),
            model: "llama-3.3-70b".to_string(),
            max_tokens: 2048,
            temperature: 0.3,
            rpm_limit: 30,
        };
        let body = groq_request_body("hello", &settings);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hello");
        assert_eq!(body["response_format"]["type"], "json_object");
    }

    #[test]
    fn finish_payload_injects_metadata() {
        let value = finish_payload("{\"overall_score\": 66}", "gemini", "g-2.5", 123)
            .expect("payload");
        assert_eq!(value["overall_score"], 66);
        assert_eq!(value["_provider"], "gemini");
        assert_eq!(value["_model"], "g-2.5");
        assert_eq!(value["_tokens_used"], 123);

        assert!(matches!(
            finish_payload("[1, 2, 3]", "gemini", "m", 0),
            Err(ProviderError::Malformed(_))
        ));
    }

    #[test]
    fn parse_analysis_coerces_and_clamps() {
        let raw = json!({
            "hiring_probability": "85.5",
            "fit_score": 150,
            "budget_fairness": -5,
            "job_clarity": 70,
            "competition_level": null,
            "overall_score": 88,
            "job_summary": "ملخص",
            "red_flags": "ميزانية غير واضحة",
            "green_flags": ["ناشر موثق"],
            "recommendation": "instant_alert",
            "_provider": "gemini",
            "_model": "g-2.5",
            "_tokens_used": 456
        });
        let record = parse_analysis(&raw, "j9").expect("record");
        assert_eq!(record.listing_id, "j9");
        assert_eq!(record.hiring_probability, 85);
        assert_eq!(record.fit_score, 100);
        assert_eq!(record.budget_fairness, 0);
        assert_eq!(record.competition_level, 50);
        assert_eq!(record.urgency_score, 50);
        assert_eq!(record.red_flags, vec!["ميزانية غير واضحة".to_string()]);
        assert_eq!(record.recommendation, Recommendation::InstantAlert);
        assert_eq!(record.ai_provider, "gemini");
        assert_eq!(record.tokens_used, 456);
    }

    #[test]
    fn parse_analysis_rejects_non_objects_and_bad_recommendations() {
        assert!(parse_analysis(&json!([1, 2]), "j1").is_none());

        let raw = json!({ "recommendation": "send_it_now" });
        let record = parse_analysis(&raw, "j1").expect("record");
        assert_eq!(record.recommendation, Recommendation::Skip);
    }

    #[test]
    fn score_validation_flags_suspicious_patterns() {
        let mut record = analysis([50, 50, 50, 50, 50, 50]);
        record.overall_score = 0;
        record.fit_score = 100;
        let warnings = validate_scores(&record);
        assert!(warnings.iter().any(|w| w.contains("overall_score is exactly 0")));
        assert!(warnings.iter().any(|w| w.contains("fit_score is exactly 100")));
        assert!(warnings.iter().any(|w| w == "job_summary is empty"));
        assert!(warnings
            .iter()
            .any(|w| w == "Both red_flags and green_flags are empty"));
    }

    #[test]
    fn prompt_truncates_description_and_lists_profile() {
        let mut job = candidate();
        job.full_description = "د".repeat(700);
        job.skills = vec![];
        let prompt = build_analysis_prompt(&job, &test_profile());
        assert!(prompt.contains("=== FREELANCER PROFILE ==="));
        assert!(prompt.contains("Expert Skills: Python, Django"));
        assert!(prompt.contains("Skills Required: Not specified"));
        assert!(prompt.contains("Identity Verified: Yes"));
        assert!(prompt.contains("Preferred Budget: $50-$5000"));
        assert!(prompt.contains(&format!("Description: {}...", "د".repeat(600))));
        assert!(prompt.contains("Budget: $250.00 - $500.00 ($250-$500)"));
    }

    #[test]
    fn default_weights_sum_to_one() {
        assert!((ScoreWeights::default().sum() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn strong_job_gets_instant_alert() {
        let breakdown = engine().score(&analysis([85, 90, 80, 75, 85, 60]), &candidate());
        // Base 83.5 plus all four bonuses pushes past the clamp.
        assert_eq!(breakdown.final_score, 100);
        assert_eq!(breakdown.bonuses.len(), 4);
        assert!(breakdown.penalties.is_empty());
        assert_eq!(breakdown.recommendation, Recommendation::InstantAlert);
        assert!(breakdown.reasoning.starts_with("الدرجة الكلية: 100/100"));
        assert!(breakdown.reasoning.contains("⚡ تنبيه فوري"));
    }

    #[test]
    fn tiny_budget_overrides_instant_to_digest() {
        let mut job = candidate();
        job.identity_verified = false;
        job.budget_min = Some(10.0);
        job.budget_max = Some(10.0);
        job.budget_raw = "$10.00".to_string();
        let breakdown = engine().score(&analysis([70, 90, 60, 60, 50, 60]), &job);
        // Fit 90 / hiring 70 opens the side door; the $10 budget slams it.
        assert_eq!(breakdown.final_score, 79);
        assert_eq!(breakdown.recommendation, Recommendation::Digest);
    }

    #[test]
    fn weak_crowded_job_is_skipped() {
        let mut job = candidate();
        job.full_description = String::new();
        job.brief_description = String::new();
        job.proposals_count = 25;
        job.identity_verified = false;
        job.hire_rate = 0.0;
        job.hire_rate_raw = "0%".to_string();
        job.budget_min = Some(12.0);
        job.budget_max = Some(12.0);
        let breakdown = engine().score(&analysis([50, 50, 50, 50, 50, 50]), &job);
        assert_eq!(breakdown.final_score, 0);
        assert!(breakdown.bonuses.is_empty());
        assert_eq!(breakdown.penalties.len(), 4);
        assert_eq!(breakdown.recommendation, Recommendation::Skip);
    }

    struct StubProvider {
        provider: &'static str,
        ok: bool,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AiProvider for StubProvider {
        fn name(&self) -> &str {
            self.provider
        }

        fn model(&self) -> &str {
            "stub"
        }

        async fn generate(&self, _prompt: &str) -> Result<JsonValue, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.ok {
                Ok(json!({ "overall_score": 61, "_provider": self.provider }))
            } else {
                Err(ProviderError::Empty)
            }
        }
    }

    #[tokio::test]
    async fn open_primary_circuit_routes_straight_to_fallback() {
        let primary_calls = Arc::new(AtomicUsize::new(0));
        let fallback_calls = Arc::new(AtomicUsize::new(0));
        let client = UnifiedAiClient::from_parts(
            Box::new(StubProvider {
                provider: "gemini",
                ok: false,
                calls: primary_calls.clone(),
            }),
            Box::new(StubProvider {
                provider: "groq",
                ok: true,
                calls: fallback_calls.clone(),
            }),
        );

        // Five failures open the primary circuit; every reply still comes
        // from the fallback.
        for _ in 0..5 {
            let result = client.analyze("prompt").await.expect("fallback reply");
            assert_eq!(result["_provider"], "groq");
        }
        assert_eq!(primary_calls.load(Ordering::SeqCst), 5);
        assert!(client.circuit_breakers()[0].is_open().await);

        let result = client.analyze("prompt").await.expect("fallback reply");
        assert_eq!(result["_provider"], "groq");
        // The open circuit short-circuits without touching the primary.
        assert_eq!(primary_calls.load(Ordering::SeqCst), 5);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 6);
    }
}
