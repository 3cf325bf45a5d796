//! Core domain model for Freelance Job Radar.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "fjr-core";

/// A job as it appears in the marketplace listing feed, before the detail
/// page has been visited.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobListing {
    pub listing_id: String,
    pub title: String,
    pub url: String,
    pub publisher_name: String,
    pub time_posted: String,
    pub brief_description: String,
    pub category: String,
    pub proposals_count: i64,
    pub status: String,
}

impl JobListing {
    pub fn new(listing_id: impl Into<String>, title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            title: title.into(),
            url: url.into(),
            status: "open".to_string(),
            ..Self::default()
        }
    }
}

/// Publisher facts extracted from a job detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PublisherInfo {
    pub publisher_id: String,
    pub display_name: String,
    pub role: String,
    pub profile_url: String,
    pub identity_verified: bool,
    /// Raw registration date string as shown on the profile widget.
    pub registration_date: String,
    pub total_projects_posted: i64,
    pub open_projects: i64,
    pub total_hired: i64,
    /// Raw hire-rate text; "لم يحسب بعد" means no projects completed yet.
    pub hire_rate_raw: String,
    pub hire_rate: f64,
    pub avg_rating: Option<f64>,
}

/// One visible proposal on a job detail page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ProposalInfo {
    pub proposer_name: String,
    pub proposer_verified: bool,
    pub proposer_rating: f64,
    pub proposed_at: String,
}

/// Full data from a job detail page: description, parsed budget, skills,
/// publisher widget, and visible proposals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct JobDetail {
    pub listing_id: String,
    pub full_description: String,
    pub duration: String,
    pub experience_level: String,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub budget_raw: String,
    pub skills: Vec<String>,
    pub attachments_count: i64,
    pub publisher: Option<PublisherInfo>,
    pub proposals: Vec<ProposalInfo>,
}

/// Dispatch decision attached to every analyzed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    InstantAlert,
    Digest,
    #[default]
    Skip,
}

impl Recommendation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Recommendation::InstantAlert => "instant_alert",
            Recommendation::Digest => "digest",
            Recommendation::Skip => "skip",
        }
    }

    /// Parse a stored label. Unknown labels yield `None`.
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "instant_alert" => Some(Recommendation::InstantAlert),
            "digest" => Some(Recommendation::Digest),
            "skip" => Some(Recommendation::Skip),
            _ => None,
        }
    }
}

/// AI-generated analysis of one job against the freelancer profile.
///
/// `overall_score`, `recommendation`, and `recommendation_reason` hold the
/// model's raw suggestion until the deterministic scoring pass overwrites
/// them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AnalysisRecord {
    pub listing_id: String,
    pub hiring_probability: i64,
    pub fit_score: i64,
    pub budget_fairness: i64,
    pub job_clarity: i64,
    pub competition_level: i64,
    pub urgency_score: i64,
    pub overall_score: i64,
    pub job_summary: String,
    pub required_skills_analysis: String,
    pub red_flags: Vec<String>,
    pub green_flags: Vec<String>,
    pub recommended_proposal_angle: String,
    pub estimated_real_budget: String,
    pub recommendation: Recommendation,
    pub recommendation_reason: String,
    pub ai_provider: String,
    pub ai_model: String,
    pub tokens_used: i64,
}

impl AnalysisRecord {
    pub fn new(listing_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            ..Self::default()
        }
    }
}

/// One labeled bonus or penalty applied by the scoring pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreAdjustment {
    pub label: String,
    pub points: i64,
}

/// Deterministic final score assembled from the weighted AI sub-scores plus
/// rule-based adjustments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub base_score: f64,
    pub bonuses: Vec<ScoreAdjustment>,
    pub penalties: Vec<ScoreAdjustment>,
    pub final_score: i64,
    pub recommendation: Recommendation,
    pub reasoning: String,
}

impl ScoreBreakdown {
    pub fn total_bonus(&self) -> i64 {
        self.bonuses.iter().map(|b| b.points).sum()
    }

    pub fn total_penalty(&self) -> i64 {
        self.penalties.iter().map(|p| p.points).sum()
    }
}

/// Joined jobs + details + publisher row, the unit of work for analysis and
/// scoring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CandidateJob {
    pub listing_id: String,
    pub url: String,
    pub title: String,
    pub brief_description: String,
    pub category: String,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub budget_raw: String,
    pub skills: Vec<String>,
    pub time_posted: String,
    pub status: String,
    /// Count of rows in the proposals table when any were captured,
    /// otherwise the count shown on the listing page.
    pub proposals_count: i64,
    pub full_description: String,
    pub duration: String,
    pub experience_level: String,
    pub attachments_count: i64,
    pub publisher_id: Option<String>,
    pub publisher_name: String,
    pub publisher_role: String,
    pub identity_verified: bool,
    pub registration_date: String,
    pub total_projects_posted: i64,
    pub open_projects: i64,
    pub total_hired: i64,
    pub hire_rate_raw: String,
    pub hire_rate: f64,
    pub avg_rating: Option<f64>,
}

impl CandidateJob {
    /// Budget used by scoring rules: max when positive, else min when
    /// positive, else none.
    pub fn effective_budget(&self) -> Option<f64> {
        self.budget_max
            .filter(|b| *b > 0.0)
            .or(self.budget_min.filter(|b| *b > 0.0))
    }
}

/// Joined job + analysis + publisher row ready for notification rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ScoredJob {
    pub listing_id: String,
    pub title: String,
    pub url: String,
    pub category: String,
    pub budget_min: Option<f64>,
    pub budget_max: Option<f64>,
    pub budget_raw: String,
    pub duration: String,
    pub skills: Vec<String>,
    pub proposals_count: i64,
    pub time_posted: String,
    pub publisher_name: String,
    pub publisher_verified: bool,
    pub hire_rate: f64,
    pub overall_score: i64,
    pub hiring_probability: i64,
    pub fit_score: i64,
    pub budget_fairness: i64,
    pub job_clarity: i64,
    pub competition_level: i64,
    pub urgency_score: i64,
    pub job_summary: String,
    pub required_skills_analysis: String,
    pub red_flags: Vec<String>,
    pub green_flags: Vec<String>,
    pub recommended_proposal_angle: String,
    pub recommendation: Recommendation,
    pub recommendation_reason: String,
}

/// Aggregate counters for one local day, feeding the daily report and the
/// status command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DailyStats {
    pub date: String,
    pub jobs_discovered: i64,
    pub jobs_analyzed: i64,
    pub instant_count: i64,
    pub digest_count: i64,
    pub skipped_count: i64,
    pub alerts_sent: i64,
    pub digests_sent: i64,
    pub avg_fit_score: f64,
    pub avg_hiring_probability: f64,
    pub avg_overall_score: f64,
    pub top_score: i64,
    pub tokens_used: i64,
}

/// Counters for a single scan cycle, filled in as the cycle progresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleStats {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub total_listed: usize,
    pub new_jobs: usize,
    pub passed_filter: usize,
    pub filtered_out: usize,
    pub details_scraped: usize,
    pub analyzed: usize,
    pub alerts_sent: usize,
    pub errors: usize,
    pub requests_made: u64,
    pub duration_seconds: f64,
}

impl CycleStats {
    pub fn begin() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            total_listed: 0,
            new_jobs: 0,
            passed_filter: 0,
            filtered_out: 0,
            details_scraped: 0,
            analyzed: 0,
            alerts_sent: 0,
            errors: 0,
            requests_made: 0,
            duration_seconds: 0.0,
        }
    }
}

/// Skill lists grouped by proficiency tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SkillTiers {
    #[serde(default)]
    pub expert: Vec<String>,
    #[serde(default)]
    pub intermediate: Vec<String>,
    #[serde(default)]
    pub beginner: Vec<String>,
}

/// Matching preferences from the profile document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfilePreferences {
    #[serde(default)]
    pub min_budget_usd: f64,
    #[serde(default = "default_max_budget")]
    pub max_budget_usd: f64,
    #[serde(default)]
    pub preferred_categories: Vec<String>,
    #[serde(default)]
    pub positive_keywords: Vec<String>,
    #[serde(default)]
    pub negative_keywords: Vec<String>,
}

fn default_max_budget() -> f64 {
    5000.0
}

impl Default for ProfilePreferences {
    fn default() -> Self {
        Self {
            min_budget_usd: 0.0,
            max_budget_usd: default_max_budget(),
            preferred_categories: Vec::new(),
            positive_keywords: Vec::new(),
            negative_keywords: Vec::new(),
        }
    }
}

/// The freelancer profile every job is matched against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreelancerProfile {
    pub name: String,
    pub skills: SkillTiers,
    pub experience_years: u32,
    pub preferences: ProfilePreferences,
    pub bio: String,
    #[serde(default)]
    pub proposal_style: String,
}
