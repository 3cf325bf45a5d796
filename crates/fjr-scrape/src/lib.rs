//! Marketplace scraping: rate-limited HTTP client, listing and detail
//! parsers, the profile-based quick filter, and the scrape pipeline.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use fjr_core::{CycleStats, FreelancerProfile, JobDetail, JobListing, ProposalInfo, PublisherInfo};
use fjr_storage::{SlidingWindowLimiter, SqliteStore};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, RETRY_AFTER, USER_AGENT};
use reqwest::StatusCode;
use scraper::{ElementRef, Html, Selector};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "fjr-scrape";

const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (X11; Linux x86_64; rv:128.0) Gecko/20100101 Firefox/128.0";

/// Scrape-layer failures.
#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("invalid url: {0}")]
    Url(String),
    #[error("invalid selector: {0}")]
    Selector(String),
    #[error(transparent)]
    Store(#[from] fjr_storage::StoreError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// The `scraper` section of the settings document.
#[derive(Debug, Clone, Deserialize)]
pub struct ScraperSettings {
    pub base_url: String,
    pub projects_url: String,
    pub xhr_endpoint: String,
    pub scan_interval_seconds: u64,
    pub max_pages_per_scan: u32,
    pub request_delay_seconds: u64,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub user_agents: Vec<String>,
    #[serde(default)]
    pub xhr_headers: BTreeMap<String, String>,
    #[serde(default = "default_detail_delay")]
    pub detail_delay_seconds: u64,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub proxy_url: String,
}

fn default_detail_delay() -> u64 {
    3
}

// ── http client ─────────────────────────────────────────────────────────

/// Anything that can serve listing JSON and detail HTML. The pipeline is
/// written against this seam so cycles can run from canned fixtures.
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Fetch one listing page as the XHR JSON envelope.
    async fn listing_page(&self, page: u32) -> Result<JsonValue, ScrapeError>;
    /// Fetch one job detail page as raw HTML.
    async fn detail_page(&self, url: &str) -> Result<String, ScrapeError>;
    /// HTTP requests completed so far on this source.
    fn requests_made(&self) -> u64;
}

/// Rate-limited, retrying HTTP client for the marketplace.
///
/// One request per `request_delay_seconds` across the whole client, with
/// user-agent rotation per request and the retry matrix: 429 honors
/// Retry-After (default 30s), 5xx backs off 5s per attempt, timeouts 3s
/// per attempt, connection errors 10s, other 4xx fail immediately.
pub struct MarketClient {
    http: reqwest::Client,
    settings: ScraperSettings,
    limiter: SlidingWindowLimiter,
    ua_cursor: AtomicUsize,
    total_requests: AtomicU64,
}

impl MarketClient {
    pub fn new(settings: ScraperSettings) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("ar,en;q=0.9"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"),
        );
        headers.insert("sec-fetch-dest", HeaderValue::from_static("document"));
        headers.insert("sec-fetch-mode", HeaderValue::from_static("navigate"));
        headers.insert("sec-fetch-site", HeaderValue::from_static("same-origin"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_seconds));
        if !settings.proxy_url.is_empty() {
            let proxy = reqwest::Proxy::all(&settings.proxy_url)
                .with_context(|| format!("invalid proxy url {}", settings.proxy_url))?;
            builder = builder.proxy(proxy);
        }
        let http = builder.build().context("building http client")?;

        let limiter = SlidingWindowLimiter::new(
            1,
            Duration::from_secs(settings.request_delay_seconds.max(1)),
        );
        Ok(Self {
            http,
            settings,
            limiter,
            ua_cursor: AtomicUsize::new(0),
            total_requests: AtomicU64::new(0),
        })
    }

    fn next_user_agent(&self) -> String {
        if self.settings.user_agents.is_empty() {
            return DEFAULT_USER_AGENT.to_string();
        }
        let idx = self.ua_cursor.fetch_add(1, Ordering::Relaxed) % self.settings.user_agents.len();
        self.settings.user_agents[idx].clone()
    }

    /// Fetch a listing page via the XHR endpoint. The response is a JSON
    /// envelope with a `collection` array of rendered rows.
    pub async fn fetch_listing_page(&self, page: u32) -> Result<JsonValue, ScrapeError> {
        let mut params: Vec<(String, String)> = vec![
            ("page".to_string(), page.to_string()),
            ("sort".to_string(), "latest".to_string()),
        ];
        for category in &self.settings.categories {
            params.push(("category".to_string(), category.clone()));
        }
        let url = reqwest::Url::parse_with_params(&self.settings.projects_url, &params)
            .map_err(|e| ScrapeError::Url(e.to_string()))?;

        info!(page, url = %url, "fetching listing page");
        let response = self.request(url, true).await?;
        let payload: JsonValue = response.json().await?;
        let items = payload
            .get("collection")
            .and_then(JsonValue::as_array)
            .map_or(0, Vec::len);
        info!(page, items, "listing page fetched");
        Ok(payload)
    }

    /// Fetch a detail page as raw HTML. Waits out the extra detail delay
    /// before the shared rate limit applies.
    pub async fn fetch_detail_page(&self, url: &str) -> Result<String, ScrapeError> {
        let extra = self
            .settings
            .detail_delay_seconds
            .saturating_sub(self.settings.request_delay_seconds);
        if extra > 0 {
            tokio::time::sleep(Duration::from_secs(extra)).await;
        }

        info!(url, "fetching detail page");
        let parsed = reqwest::Url::parse(url).map_err(|e| ScrapeError::Url(e.to_string()))?;
        let response = self.request(parsed, false).await?;
        Ok(response.text().await?)
    }

    async fn request(&self, url: reqwest::Url, xhr: bool) -> Result<reqwest::Response, ScrapeError> {
        let max_attempts = self.settings.max_retries.max(1);
        let mut attempt: u32 = 1;

        loop {
            self.limiter.acquire().await;

            let mut req = self
                .http
                .get(url.clone())
                .header(USER_AGENT, self.next_user_agent());
            if xhr {
                req = req
                    .header("x-requested-with", "XMLHttpRequest")
                    .header(ACCEPT, "application/json, text/javascript, */*; q=0.01");
                for (name, value) in &self.settings.xhr_headers {
                    req = req.header(name.as_str(), value.as_str());
                }
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.trim().parse::<u64>().ok())
                            .unwrap_or(30);
                        warn!(attempt, max_attempts, retry_after, "rate limited (429)");
                        if attempt >= max_attempts {
                            return Err(ScrapeError::HttpStatus {
                                status: status.as_u16(),
                                url: url.to_string(),
                            });
                        }
                        tokio::time::sleep(Duration::from_secs(retry_after)).await;
                        attempt += 1;
                        continue;
                    }
                    if status.is_server_error() {
                        let wait = 5 * u64::from(attempt);
                        warn!(status = status.as_u16(), attempt, max_attempts, wait, "server error");
                        if attempt >= max_attempts {
                            return Err(ScrapeError::HttpStatus {
                                status: status.as_u16(),
                                url: url.to_string(),
                            });
                        }
                        tokio::time::sleep(Duration::from_secs(wait)).await;
                        attempt += 1;
                        continue;
                    }
                    if !status.is_success() {
                        error!(status = status.as_u16(), url = %url, "http error, not retrying");
                        return Err(ScrapeError::HttpStatus {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                    self.total_requests.fetch_add(1, Ordering::Relaxed);
                    return Ok(response);
                }
                Err(err) => {
                    let wait = if err.is_timeout() {
                        Duration::from_secs(3 * u64::from(attempt))
                    } else if err.is_connect() {
                        Duration::from_secs(10)
                    } else if err.is_request() {
                        Duration::from_secs(3 * u64::from(attempt))
                    } else {
                        return Err(ScrapeError::Request(err));
                    };
                    warn!(attempt, max_attempts, error = %err, "request failed");
                    if attempt >= max_attempts {
                        return Err(ScrapeError::Request(err));
                    }
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl JobSource for MarketClient {
    async fn listing_page(&self, page: u32) -> Result<JsonValue, ScrapeError> {
        self.fetch_listing_page(page).await
    }

    async fn detail_page(&self, url: &str) -> Result<String, ScrapeError> {
        self.fetch_detail_page(url).await
    }

    fn requests_made(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

// ── select helpers ──────────────────────────────────────────────────────

fn sel(css: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(css).map_err(|e| ScrapeError::Selector(e.to_string()))
}

fn first_el<'a>(root: ElementRef<'a>, css: &str) -> Result<Option<ElementRef<'a>>, ScrapeError> {
    Ok(root.select(&sel(css)?).next())
}

fn all_els<'a>(root: ElementRef<'a>, css: &str) -> Result<Vec<ElementRef<'a>>, ScrapeError> {
    Ok(root.select(&sel(css)?).collect())
}

fn el_text(el: ElementRef<'_>) -> String {
    el.text().collect::<String>().trim().to_string()
}

fn first_text(root: ElementRef<'_>, css: &str) -> Result<String, ScrapeError> {
    Ok(first_el(root, css)?.map(el_text).unwrap_or_default())
}

fn first_attr(root: ElementRef<'_>, css: &str, attr: &str) -> Result<String, ScrapeError> {
    Ok(first_el(root, css)?
        .and_then(|el| el.value().attr(attr))
        .map(|s| s.trim().to_string())
        .unwrap_or_default())
}

fn truncate_chars(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

/// All non-negative numbers in the text, decimals included.
fn extract_numbers(text: &str) -> Vec<f64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut seen_dot = false;
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == '.' && !seen_dot && !current.is_empty() {
            current.push(ch);
            seen_dot = true;
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
                out.push(v);
            }
            current.clear();
            seen_dot = false;
        }
    }
    if !current.is_empty() {
        if let Ok(v) = current.trim_end_matches('.').parse::<f64>() {
            out.push(v);
        }
    }
    out
}

fn first_integer(text: &str) -> Option<i64> {
    let mut current = String::new();
    for ch in text.chars() {
        if ch.is_ascii_digit() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    current.parse().ok()
}

// ── listing parser ──────────────────────────────────────────────────────

/// Result of parsing one listing response: parsed jobs plus the rendered
/// HTML of rows that could not be parsed, kept for debug dumps.
#[derive(Debug, Default)]
pub struct ParsedListing {
    pub jobs: Vec<JobListing>,
    pub failed_rows: Vec<String>,
}

enum CardOutcome {
    Parsed(JobListing),
    Incomplete,
    Unparseable(String),
}

/// Parses the XHR listing envelope: a `collection` array where every item
/// carries an `id` and a `rendered` HTML row.
#[derive(Debug, Clone)]
pub struct ListScraper {
    base_url: String,
}

impl ListScraper {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn parse_listing_response(&self, payload: &JsonValue) -> ParsedListing {
        let mut parsed = ParsedListing::default();
        let Some(collection) = payload.get("collection").and_then(JsonValue::as_array) else {
            return parsed;
        };

        for (idx, item) in collection.iter().enumerate() {
            match self.parse_card(item) {
                Ok(CardOutcome::Parsed(job)) => parsed.jobs.push(job),
                Ok(CardOutcome::Incomplete) => {
                    debug!(idx, "collection item missing id or rendered html");
                }
                Ok(CardOutcome::Unparseable(html)) => {
                    warn!(idx, "failed to parse listing card");
                    parsed.failed_rows.push(html);
                }
                Err(e) => {
                    warn!(idx, error = %e, "failed to parse listing card");
                    if let Some(html) = item.get("rendered").and_then(JsonValue::as_str) {
                        parsed.failed_rows.push(html.to_string());
                    }
                }
            }
        }
        parsed
    }

    fn parse_card(&self, item: &JsonValue) -> Result<CardOutcome, ScrapeError> {
        let listing_id = match item.get("id") {
            Some(JsonValue::Number(n)) => n.to_string(),
            Some(JsonValue::String(s)) => s.clone(),
            _ => String::new(),
        };
        let rendered = item
            .get("rendered")
            .and_then(JsonValue::as_str)
            .unwrap_or_default();
        if listing_id.is_empty() || rendered.is_empty() {
            return Ok(CardOutcome::Incomplete);
        }

        let fragment = Html::parse_fragment(rendered);
        let root = fragment.root_element();

        let title_el = match first_el(root, "h2.mrg--bt-reset > a")?
            .or(first_el(root, "h2 > a")?)
            .or(first_el(root, "a[href*='/projects/']")?)
        {
            Some(el) => el,
            None => {
                warn!(listing_id, "no title link found in listing row");
                return Ok(CardOutcome::Unparseable(rendered.to_string()));
            }
        };
        let title = el_text(title_el);
        let href = title_el.value().attr("href").unwrap_or_default();
        let url = if href.starts_with("http") {
            href.to_string()
        } else {
            format!("{}{}", self.base_url, href)
        };

        let publisher_name = match first_el(root, "ul.project__meta bdi")?
            .or(first_el(root, ".project__meta bdi")?)
            .or(first_el(root, "bdi")?)
        {
            Some(el) => el_text(el),
            None => String::new(),
        };

        let mut time_posted = first_attr(root, "time[datetime]", "datetime")?;
        if time_posted.is_empty() {
            time_posted = first_text(root, "time")?;
        }

        let mut proposals_count = 0;
        for li in all_els(root, "ul.project__meta > li.text-muted")? {
            let text = el_text(li);
            if text.contains("عرض") || text.contains("أضف") {
                proposals_count = parse_proposals_count(&text);
                break;
            }
        }
        if proposals_count == 0 {
            for li in all_els(root, "li")? {
                let text = el_text(li);
                if text.contains("عرض") || text.contains("أضف") {
                    proposals_count = parse_proposals_count(&text);
                    break;
                }
            }
        }

        let brief = match first_el(root, "p.project__brief a")?
            .or(first_el(root, "p.project__brief")?)
            .or(first_el(root, ".project__brief")?)
        {
            Some(el) => el_text(el),
            None => String::new(),
        };

        let mut job = JobListing::new(listing_id, title, url);
        job.publisher_name = publisher_name;
        job.time_posted = time_posted;
        job.brief_description = brief;
        job.proposals_count = proposals_count;
        Ok(CardOutcome::Parsed(job))
    }
}

/// Coerce the Arabic proposal phrasing into a count:
/// "أضف أول عرض" is zero, "عرض واحد" one, "عرضان"/"عرضين" two, otherwise
/// the first integer in the text.
pub fn parse_proposals_count(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    if text.contains("أضف") {
        return 0;
    }
    if text.contains("واحد") {
        return 1;
    }
    if text.contains("عرضان") || text.contains("عرضين") {
        return 2;
    }
    first_integer(text).unwrap_or(0)
}

// ── detail parser ───────────────────────────────────────────────────────

/// Parses full detail pages. Every field is optional: missing pieces are
/// logged and defaulted, never fatal.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetailScraper;

impl DetailScraper {
    pub fn new() -> Self {
        Self
    }

    pub fn parse_detail_page(&self, html: &str, listing_id: &str) -> Result<JobDetail, ScrapeError> {
        let document = Html::parse_document(html);
        let root = document.root_element();

        let mut title = first_text(root, "span[data-type='page-header-title']")?;
        if title.is_empty() {
            title = first_text(root, "h1")?;
        }

        let sidebar = first_el(root, "#project-meta-panel")?;

        let mut budget_min = None;
        let mut budget_max = None;
        let mut budget_raw = String::new();
        let mut duration = String::new();
        let mut experience_level = String::new();
        let mut skills: Vec<String> = Vec::new();
        let mut status = String::new();

        if let Some(sidebar) = sidebar {
            status = first_text(
                sidebar,
                ".label-prj-open, .label-prj-closed, .label-prj-inprogress",
            )?;
            if status.is_empty() {
                status = extract_meta_value(sidebar, "حالة المشروع")?;
            }

            budget_raw = first_text(sidebar, "[data-type='project-budget_range']")?;
            if budget_raw.is_empty() {
                budget_raw = extract_meta_value(sidebar, "الميزانية")?;
            }
            (budget_min, budget_max) = parse_budget(&budget_raw);

            duration = extract_meta_value(sidebar, "مدة التنفيذ")?;
            experience_level = extract_meta_value(sidebar, "مستوى الخبرة")?;

            skills = all_els(sidebar, "li.skills__item bdi")?
                .into_iter()
                .map(el_text)
                .filter(|s| !s.is_empty())
                .collect();
            if skills.is_empty() {
                skills = all_els(sidebar, "li.skills__item")?
                    .into_iter()
                    .map(el_text)
                    .filter(|s| !s.is_empty())
                    .collect();
            }
        } else {
            warn!(listing_id, "no meta sidebar found on detail page");
        }

        let full_description = match first_el(root, "#projectDetailsTab .carda__content")?
            .or(first_el(root, ".carda__content")?)
            .or(first_el(root, ".project-description")?)
        {
            Some(el) => el_text(el),
            None => String::new(),
        };

        let publisher = match first_el(
            root,
            "#project-meta-panel [data-type='employer_widget'], [data-type='employer_widget']",
        )? {
            Some(widget) => Some(extract_publisher(widget)?),
            None => None,
        };

        let proposals = match first_el(root, "#project-bids")? {
            Some(section) => extract_proposals(section)?,
            None => Vec::new(),
        };

        let attachments_count =
            all_els(root, ".project-attachments .attachment, .attachments .attachment")?.len() as i64;

        let fields_present = [
            !full_description.is_empty(),
            !duration.is_empty(),
            !budget_raw.is_empty(),
            !skills.is_empty(),
            publisher.is_some(),
            !status.is_empty(),
        ]
        .iter()
        .filter(|present| **present)
        .count();
        info!(
            listing_id,
            title = %truncate_chars(&title, 40),
            fields = fields_present,
            "detail page parsed"
        );

        Ok(JobDetail {
            listing_id: listing_id.to_string(),
            full_description,
            duration,
            experience_level,
            budget_min,
            budget_max,
            budget_raw,
            skills,
            attachments_count,
            publisher,
            proposals,
        })
    }
}

fn extract_meta_value(sidebar: ElementRef<'_>, label: &str) -> Result<String, ScrapeError> {
    for row in all_els(sidebar, ".meta-row")? {
        if let Some(label_el) = first_el(row, ".meta-label")? {
            if el_text(label_el).contains(label) {
                if let Some(value_el) = first_el(row, ".meta-value")? {
                    return Ok(el_text(value_el));
                }
            }
        }
    }
    Ok(String::new())
}

/// Parse a budget string into a (min, max) pair. Two or more numbers give
/// the extremes, a single number both ends, no numbers nothing.
pub fn parse_budget(raw: &str) -> (Option<f64>, Option<f64>) {
    if raw.is_empty() {
        return (None, None);
    }
    let numbers = extract_numbers(&raw.replace(',', ""));
    match numbers.len() {
        0 => (None, None),
        1 => (Some(numbers[0]), Some(numbers[0])),
        _ => {
            let min = numbers.iter().copied().fold(f64::INFINITY, f64::min);
            let max = numbers.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (Some(min), Some(max))
        }
    }
}

/// Parse a hire-rate percentage. "لم يحسب بعد" and other non-numeric text
/// come back as 0.0.
pub fn parse_hire_rate(raw: &str) -> f64 {
    extract_numbers(&raw.replace('%', ""))
        .first()
        .copied()
        .unwrap_or(0.0)
}

/// Derive a stable publisher id from the profile link, falling back to a
/// slug of the display name.
fn derive_publisher_id(profile_url: &str, display_name: &str) -> String {
    if !profile_url.is_empty() {
        if let Some(rest) = profile_url.split("/u/").nth(1) {
            let id: String = rest.chars().take_while(|c| *c != '/' && *c != '?').collect();
            if !id.is_empty() {
                return id;
            }
        }
        return display_name.to_lowercase().replace(' ', "-");
    }
    let slug: String = display_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-');
    if slug.is_empty() {
        "unknown".to_string()
    } else {
        slug.to_string()
    }
}

fn extract_publisher(widget: ElementRef<'_>) -> Result<PublisherInfo, ScrapeError> {
    let mut display_name = first_text(widget, ".profile__name bdi")?;
    if display_name.is_empty() {
        display_name = first_text(widget, ".profile__name")?;
    }

    let profile_url = first_attr(widget, "a[href*='/u/']", "href")?;
    let publisher_id = derive_publisher_id(&profile_url, &display_name);

    let mut role = first_text(widget, "ul.meta_items li")?;
    if role.is_empty() {
        role = first_text(widget, ".meta_items li")?;
    }

    let identity_verified = first_el(
        widget,
        ".profile-verification-badge, .verified-badge, .identity-verified",
    )?
    .is_some();

    let mut registration_date = String::new();
    let mut hire_rate_raw = String::new();
    let mut open_projects_text = String::new();
    if let Some(table) = first_el(widget, "table.table-meta")? {
        for row in all_els(table, "tr")? {
            let cells = all_els(row, "td")?;
            if cells.len() < 2 {
                continue;
            }
            let label = el_text(cells[0]);
            let value = el_text(cells[1]);
            if label.contains("تاريخ التسجيل") {
                registration_date = value;
            } else if label.contains("معدل التوظيف") {
                hire_rate_raw = value;
            } else if label.contains("المشاريع المفتوحة") {
                open_projects_text = value;
            }
        }
    }

    Ok(PublisherInfo {
        publisher_id,
        display_name,
        role,
        profile_url,
        identity_verified,
        registration_date,
        hire_rate: parse_hire_rate(&hire_rate_raw),
        hire_rate_raw,
        open_projects: first_integer(&open_projects_text).unwrap_or(0),
        ..PublisherInfo::default()
    })
}

fn extract_proposals(section: ElementRef<'_>) -> Result<Vec<ProposalInfo>, ScrapeError> {
    let mut proposals = Vec::new();
    for bid in all_els(section, ".bid[data-bid-item]")? {
        let mut name = first_text(bid, ".profile__name bdi")?;
        if name.is_empty() {
            name = first_text(bid, ".profile__name")?;
        }

        let rating_text = first_text(bid, "li.rating-stars")?;
        let rating = extract_numbers(&rating_text).first().copied().unwrap_or(0.0);

        let proposed_at = first_attr(bid, "time[datetime]", "datetime")?;
        let verified =
            first_el(bid, ".profile-verification-badge, .verified-badge")?.is_some();

        proposals.push(ProposalInfo {
            proposer_name: name,
            proposer_verified: verified,
            proposer_rating: rating,
            proposed_at,
        });
    }
    Ok(proposals)
}

// ── debug dumps ─────────────────────────────────────────────────────────

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Writes unparseable listing rows to disk, content-addressed so repeated
/// failures on the same row do not pile up.
#[derive(Debug, Clone)]
pub struct DebugDumper {
    dir: PathBuf,
}

impl DebugDumper {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn dump_row(&self, html: &str) -> Result<PathBuf, ScrapeError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!("row-{}.html", &sha256_hex(html.as_bytes())[..12]);
        let path = self.dir.join(name);
        tokio::fs::write(&path, html).await?;
        debug!(path = %path.display(), "saved debug dump");
        Ok(path)
    }
}

// ── quick filter ────────────────────────────────────────────────────────

// (Arabic signal, English label, skill exception that waives the rule)
const IRRELEVANT_SIGNALS: &[(&str, &str, Option<&str>)] = &[
    ("ترجمة", "translation", None),
    ("كتابة مقالات", "article writing", None),
    ("تفريغ صوتي", "transcription", None),
    ("فويس أوفر", "voice over", None),
    ("voice over", "voice over", None),
    ("تصميم شعار", "logo design", Some("design")),
    ("تصميم جرافيك", "graphic design", Some("design")),
    ("إدخال بيانات", "data entry", Some("data entry")),
    ("تسويق", "marketing", Some("marketing")),
    ("سيو", "SEO", Some("seo")),
    ("SEO", "SEO", Some("seo")),
];

const SKILL_ALIASES: &[(&str, &[&str])] = &[
    ("javascript", &["javascript", "js", "جافاسكربت", "جافا سكريبت"]),
    ("typescript", &["typescript", "ts", "تايبسكريبت"]),
    ("python", &["python", "بايثون", "بيثون"]),
    ("react", &["react", "reactjs", "react.js", "رياكت"]),
    ("vue", &["vue", "vuejs", "vue.js", "فيو"]),
    ("angular", &["angular", "angularjs", "أنجولار"]),
    ("node", &["node", "nodejs", "node.js", "نود"]),
    ("docker", &["docker", "دوكر"]),
    ("postgresql", &["postgresql", "postgres", "بوستجرس"]),
    ("mysql", &["mysql", "ماي إس كيو إل"]),
    ("mongodb", &["mongodb", "mongo", "مونجو"]),
    ("php", &["php", "بي إتش بي"]),
    ("laravel", &["laravel", "لارافيل"]),
    ("django", &["django", "جانغو"]),
    ("flask", &["flask", "فلاسك"]),
    (
        "web scraping",
        &["web scraping", "scraping", "سكرابنج", "سكرابينج", "استخراج بيانات"],
    ),
    ("rest api", &["rest api", "api", "واجهة برمجية", "واجهات برمجية"]),
    ("machine learning", &["machine learning", "ml", "تعلم آلي", "تعلم الآلة"]),
    ("data science", &["data science", "علم البيانات"]),
    ("wordpress", &["wordpress", "ووردبريس", "وردبريس"]),
];

fn normalize(text: &str) -> String {
    text.to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Strip the Arabic definite article "ال" from a word longer than the
/// article itself.
fn strip_arabic_article(word: &str) -> &str {
    if word.starts_with("ال") && word.chars().count() > 2 {
        word.strip_prefix("ال").unwrap_or(word)
    } else {
        word
    }
}

fn text_contains(haystack: &str, needle: &str) -> bool {
    if haystack.contains(needle) {
        return true;
    }
    let stripped_needle = strip_arabic_article(needle);
    if stripped_needle != needle && haystack.contains(stripped_needle) {
        return true;
    }
    haystack.split_whitespace().any(|word| {
        let stripped_word = strip_arabic_article(word);
        stripped_word == stripped_needle || stripped_word == needle
    })
}

fn expand_skill(skill: &str) -> Vec<String> {
    let key = normalize(skill);
    for (name, aliases) in SKILL_ALIASES {
        if *name == key {
            return aliases.iter().map(|s| s.to_string()).collect();
        }
    }
    vec![key]
}

/// One quick-filter verdict with the rule that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterDecision {
    pub relevant: bool,
    pub reason: String,
}

/// Local, zero-request relevance screen applied between listing discovery
/// and detail scraping.
///
/// Rules run in order: negative keywords reject, irrelevant-category
/// signals reject unless the profile holds the exception skill, skill and
/// positive-keyword matches accept, and anything unmatched passes through
/// to analysis.
#[derive(Debug, Clone)]
pub struct QuickFilter {
    negative_keywords: Vec<String>,
    positive_keywords: Vec<String>,
    match_skills: Vec<String>,
    user_skills: HashSet<String>,
}

impl QuickFilter {
    pub fn new(profile: &FreelancerProfile) -> Self {
        let negative_keywords = profile
            .preferences
            .negative_keywords
            .iter()
            .map(|kw| normalize(kw))
            .collect();
        let positive_keywords = profile
            .preferences
            .positive_keywords
            .iter()
            .map(|kw| normalize(kw))
            .collect::<Vec<_>>();

        let mut match_skills: Vec<String> = Vec::new();
        for skill in profile.skills.expert.iter().chain(&profile.skills.intermediate) {
            for alias in expand_skill(skill) {
                if !match_skills.contains(&alias) {
                    match_skills.push(alias);
                }
            }
        }

        let mut user_skills = HashSet::new();
        for skill in profile
            .skills
            .expert
            .iter()
            .chain(&profile.skills.intermediate)
            .chain(&profile.skills.beginner)
        {
            user_skills.insert(normalize(skill));
        }

        let filter = Self {
            negative_keywords,
            positive_keywords,
            match_skills,
            user_skills,
        };
        debug!(
            negative = filter.negative_keywords.len(),
            positive = filter.positive_keywords.len(),
            skills = filter.match_skills.len(),
            "quick filter initialized"
        );
        filter
    }

    pub fn is_relevant(&self, job: &JobListing) -> FilterDecision {
        let combined = format!(
            "{} {}",
            normalize(&job.title),
            normalize(&job.brief_description)
        );

        for kw in &self.negative_keywords {
            if text_contains(&combined, kw) {
                return FilterDecision {
                    relevant: false,
                    reason: format!("Negative keyword: {kw}"),
                };
            }
        }

        for (signal, label, exception_skill) in IRRELEVANT_SIGNALS {
            if text_contains(&combined, &normalize(signal)) {
                if let Some(exception) = exception_skill {
                    if self.user_skills.contains(&normalize(exception)) {
                        continue;
                    }
                }
                return FilterDecision {
                    relevant: false,
                    reason: format!("Irrelevant category: {label}"),
                };
            }
        }

        for skill in &self.match_skills {
            if text_contains(&combined, skill) {
                return FilterDecision {
                    relevant: true,
                    reason: format!("Skill match: {skill}"),
                };
            }
        }

        for kw in &self.positive_keywords {
            if text_contains(&combined, kw) {
                return FilterDecision {
                    relevant: true,
                    reason: format!("Keyword match: {kw}"),
                };
            }
        }

        FilterDecision {
            relevant: true,
            reason: "No negative signals — will analyze".to_string(),
        }
    }

    pub fn filter_batch(&self, jobs: Vec<JobListing>) -> (Vec<JobListing>, Vec<JobListing>) {
        let total = jobs.len();
        let mut relevant = Vec::new();
        let mut filtered_out = Vec::new();

        for job in jobs {
            let decision = self.is_relevant(&job);
            debug!(
                listing_id = %job.listing_id,
                title = %truncate_chars(&job.title, 40),
                relevant = decision.relevant,
                reason = %decision.reason,
                "quick filter decision"
            );
            if decision.relevant {
                relevant.push(job);
            } else {
                filtered_out.push(job);
            }
        }

        info!(
            passed = relevant.len(),
            filtered = filtered_out.len(),
            total,
            "quick filter complete"
        );
        (relevant, filtered_out)
    }
}

// ── pipeline ────────────────────────────────────────────────────────────

/// One full scrape cycle: listing discovery, dedup against the database,
/// quick filtering, and detail scraping for whatever passed.
pub struct ScrapePipeline {
    settings: ScraperSettings,
    store: SqliteStore,
    list_scraper: ListScraper,
    detail_scraper: DetailScraper,
    quick_filter: QuickFilter,
    dumper: DebugDumper,
}

impl ScrapePipeline {
    pub fn new(
        settings: ScraperSettings,
        profile: &FreelancerProfile,
        store: SqliteStore,
        debug_dir: impl Into<PathBuf>,
    ) -> Self {
        let list_scraper = ListScraper::new(settings.base_url.clone());
        Self {
            settings,
            store,
            list_scraper,
            detail_scraper: DetailScraper::new(),
            quick_filter: QuickFilter::new(profile),
            dumper: DebugDumper::new(debug_dir),
        }
    }

    /// Run one cycle against the live marketplace. A fresh client is built
    /// per cycle so the request counter covers exactly this run.
    pub async fn run_scrape_cycle(
        &self,
        max_pages: Option<u32>,
        max_details: Option<usize>,
    ) -> anyhow::Result<CycleStats> {
        let client = MarketClient::new(self.settings.clone())?;
        self.run_cycle_with(&client, max_pages, max_details).await
    }

    /// Cycle body, driven through the [`JobSource`] seam.
    pub async fn run_cycle_with(
        &self,
        source: &dyn JobSource,
        max_pages: Option<u32>,
        max_details: Option<usize>,
    ) -> anyhow::Result<CycleStats> {
        let started = Instant::now();
        let mut stats = CycleStats::begin();
        let pages = max_pages.unwrap_or(self.settings.max_pages_per_scan);
        info!(run_id = %stats.run_id, pages, "scrape cycle starting");

        let listings = self.collect_listings(source, pages).await;
        stats.total_listed = listings.len();

        for job in &listings {
            match self.store.insert_listing(job).await {
                Ok(true) => stats.new_jobs += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(listing_id = %job.listing_id, error = %e, "failed to insert job");
                    stats.errors += 1;
                }
            }
        }
        info!(
            new = stats.new_jobs,
            known = stats.total_listed - stats.new_jobs,
            "listings deduplicated against database"
        );

        let needing_details = self.store.jobs_needing_details().await?;
        info!(count = needing_details.len(), "jobs without details before filter");
        let (relevant, filtered_out) = self.quick_filter.filter_batch(needing_details);
        stats.passed_filter = relevant.len();
        stats.filtered_out = filtered_out.len();

        let mut targets = relevant;
        if let Some(limit) = max_details {
            targets.truncate(limit);
            info!(limit, "detail scraping limited");
        }

        let total = targets.len();
        for (i, job) in targets.iter().enumerate() {
            info!(
                n = i + 1,
                total,
                listing_id = %job.listing_id,
                "scraping detail page"
            );
            let html = match source.detail_page(&job.url).await {
                Ok(html) => html,
                Err(e) => {
                    warn!(listing_id = %job.listing_id, error = %e, "detail fetch failed");
                    stats.errors += 1;
                    continue;
                }
            };
            let detail = match self.detail_scraper.parse_detail_page(&html, &job.listing_id) {
                Ok(detail) => detail,
                Err(e) => {
                    warn!(listing_id = %job.listing_id, error = %e, "detail parse failed");
                    stats.errors += 1;
                    continue;
                }
            };
            if let Err(e) = self.store.insert_detail(&detail).await {
                error!(listing_id = %job.listing_id, error = %e, "failed to store detail");
                stats.errors += 1;
                continue;
            }
            stats.details_scraped += 1;
            info!(
                listing_id = %job.listing_id,
                budget = %detail.budget_raw,
                skills = detail.skills.len(),
                publisher = %detail
                    .publisher
                    .as_ref()
                    .map(|p| p.display_name.as_str())
                    .unwrap_or("-"),
                "detail stored"
            );
        }

        stats.requests_made = source.requests_made();
        stats.duration_seconds = (started.elapsed().as_secs_f64() * 10.0).round() / 10.0;
        info!(
            listed = stats.total_listed,
            new = stats.new_jobs,
            passed = stats.passed_filter,
            filtered = stats.filtered_out,
            details = stats.details_scraped,
            errors = stats.errors,
            seconds = stats.duration_seconds,
            "scrape cycle complete"
        );
        Ok(stats)
    }

    /// Walk listing pages until the configured limit, an empty page, or a
    /// fetch failure, deduplicating across pages by listing id.
    async fn collect_listings(&self, source: &dyn JobSource, pages: u32) -> Vec<JobListing> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut all_jobs: Vec<JobListing> = Vec::new();

        for page in 1..=pages.max(1) {
            let payload = match source.listing_page(page).await {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(page, error = %e, "failed to fetch listing page, stopping");
                    break;
                }
            };

            let parsed = self.list_scraper.parse_listing_response(&payload);
            for row in &parsed.failed_rows {
                if let Err(e) = self.dumper.dump_row(row).await {
                    warn!(error = %e, "failed to save debug dump");
                }
            }
            if parsed.jobs.is_empty() {
                info!(page, "no projects on page, stopping");
                break;
            }

            let mut new_on_page = 0;
            let parsed_count = parsed.jobs.len();
            for job in parsed.jobs {
                if seen.insert(job.listing_id.clone()) {
                    all_jobs.push(job);
                    new_on_page += 1;
                }
            }
            info!(page, parsed = parsed_count, new = new_on_page, total = all_jobs.len(), "listing page parsed");
        }

        info!(unique = all_jobs.len(), "listing scrape complete");
        all_jobs
    }
}
