//! Full scrape cycle against canned fixtures and an in-memory database.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use fjr_core::{FreelancerProfile, ProfilePreferences, SkillTiers};
use fjr_scrape::{JobSource, ScrapeError, ScrapePipeline, ScraperSettings};
use fjr_storage::SqliteStore;
use serde_json::Value as JsonValue;

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join(name);
    std::fs::read_to_string(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
}

struct FixtureSource {
    listing: JsonValue,
    detail: String,
    requests: AtomicU64,
}

impl FixtureSource {
    fn new() -> Self {
        Self {
            listing: serde_json::from_str(&fixture("listing_page.json")).expect("listing fixture"),
            detail: fixture("detail_page.html"),
            requests: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl JobSource for FixtureSource {
    async fn listing_page(&self, page: u32) -> Result<JsonValue, ScrapeError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if page == 1 {
            Ok(self.listing.clone())
        } else {
            Ok(serde_json::json!({ "collection": [] }))
        }
    }

    async fn detail_page(&self, url: &str) -> Result<String, ScrapeError> {
        self.requests.fetch_add(1, Ordering::Relaxed);
        assert!(url.contains("901001"), "only the relevant job should be detailed, got {url}");
        Ok(self.detail.clone())
    }

    fn requests_made(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }
}

fn test_settings() -> ScraperSettings {
    ScraperSettings {
        base_url: "https://market.test".to_string(),
        projects_url: "https://market.test/projects".to_string(),
        xhr_endpoint: "https://market.test/projects?xhr=true".to_string(),
        scan_interval_seconds: 900,
        max_pages_per_scan: 3,
        request_delay_seconds: 1,
        max_retries: 3,
        timeout_seconds: 30,
        user_agents: vec!["test-agent/1.0".to_string()],
        xhr_headers: Default::default(),
        detail_delay_seconds: 1,
        categories: vec![],
        proxy_url: String::new(),
    }
}

fn test_profile() -> FreelancerProfile {
    FreelancerProfile {
        name: "Tester".to_string(),
        skills: SkillTiers {
            expert: vec!["Python".to_string(), "Django".to_string()],
            intermediate: vec![],
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

#[tokio::test]
async fn full_cycle_persists_relevant_jobs() {
    let store = SqliteStore::open_in_memory().await.expect("store");
    let debug_dir = tempfile::tempdir().expect("tempdir");
    let pipeline = ScrapePipeline::new(test_settings(), &test_profile(), store.clone(), debug_dir.path());

    let source = FixtureSource::new();
    let stats = pipeline
        .run_cycle_with(&source, None, None)
        .await
        .expect("cycle");

    assert_eq!(stats.total_listed, 2);
    assert_eq!(stats.new_jobs, 2);
    assert_eq!(stats.passed_filter, 1);
    assert_eq!(stats.filtered_out, 1);
    assert_eq!(stats.details_scraped, 1);
    assert_eq!(stats.errors, 0);
    // Two listing pages (second empty) plus one detail fetch.
    assert_eq!(stats.requests_made, 3);

    assert!(store.job_exists("901001").await.expect("exists"));
    assert!(store.job_exists("901002").await.expect("exists"));
    assert!(store.has_detail("901001").await.expect("has detail"));
    assert!(!store.has_detail("901002").await.expect("has detail"));

    let candidates = store.jobs_needing_analysis().await.expect("candidates");
    assert_eq!(candidates.len(), 1);
    let job = &candidates[0];
    assert_eq!(job.listing_id, "901001");
    assert_eq!(job.url, "https://market.test/project/901001");
    assert_eq!(job.budget_min, Some(250.0));
    assert_eq!(job.budget_max, Some(500.0));
    assert_eq!(job.budget_raw, "$250.00 - $500.00");
    assert_eq!(job.skills, vec!["Python".to_string(), "Django".to_string()]);
    assert_eq!(job.duration, "30 يوم");
    assert_eq!(job.experience_level, "خبير");
    assert_eq!(job.attachments_count, 1);
    // One proposal row captured on the detail page beats the listing count.
    assert_eq!(job.proposals_count, 1);
    assert_eq!(job.publisher_id.as_deref(), Some("solutions-co"));
    assert_eq!(job.publisher_name, "شركة الحلول");
    assert_eq!(job.publisher_role, "صاحب مشروع");
    assert!(job.identity_verified);
    assert_eq!(job.registration_date, "2020-05-01");
    assert_eq!(job.hire_rate_raw, "75%");
    assert_eq!(job.hire_rate, 75.0);
    assert_eq!(job.open_projects, 3);

    // The promo row without a title link lands in the debug dir once.
    let dumps = std::fs::read_dir(debug_dir.path()).expect("read dir").count();
    assert_eq!(dumps, 1);
}

#[tokio::test]
async fn second_cycle_discovers_nothing_new() {
    let store = SqliteStore::open_in_memory().await.expect("store");
    let debug_dir = tempfile::tempdir().expect("tempdir");
    let pipeline = ScrapePipeline::new(test_settings(), &test_profile(), store.clone(), debug_dir.path());

    let source = FixtureSource::new();
    pipeline
        .run_cycle_with(&source, None, None)
        .await
        .expect("first cycle");
    let stats = pipeline
        .run_cycle_with(&source, None, None)
        .await
        .expect("second cycle");

    assert_eq!(stats.total_listed, 2);
    assert_eq!(stats.new_jobs, 0);
    // The translation job still has no details and is re-filtered each run.
    assert_eq!(stats.passed_filter, 0);
    assert_eq!(stats.filtered_out, 1);
    assert_eq!(stats.details_scraped, 0);

    // Content-addressed dumps do not accumulate across runs.
    let dumps = std::fs::read_dir(debug_dir.path()).expect("read dir").count();
    assert_eq!(dumps, 1);
}

#[tokio::test]
async fn detail_limit_caps_scraping() {
    let store = SqliteStore::open_in_memory().await.expect("store");
    let debug_dir = tempfile::tempdir().expect("tempdir");
    let pipeline = ScrapePipeline::new(test_settings(), &test_profile(), store.clone(), debug_dir.path());

    let source = FixtureSource::new();
    let stats = pipeline
        .run_cycle_with(&source, Some(1), Some(0))
        .await
        .expect("cycle");

    assert_eq!(stats.total_listed, 2);
    assert_eq!(stats.passed_filter, 1);
    assert_eq!(stats.details_scraped, 0);
    assert!(!store.has_detail("901001").await.expect("has detail"));
}
