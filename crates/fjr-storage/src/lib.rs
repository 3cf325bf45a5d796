//! SQLite persistence and shared resilience primitives for Freelance Job Radar.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use fjr_core::{
    AnalysisRecord, CandidateJob, DailyStats, JobDetail, JobListing, ProposalInfo, PublisherInfo,
    Recommendation, ScoreBreakdown, ScoredJob,
};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "fjr-storage";

/// Storage-layer failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

const SCHEMA_SQL: &str = r#"
-- jobs: core listing data, one row per marketplace listing id
CREATE TABLE IF NOT EXISTS jobs (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id        TEXT    UNIQUE NOT NULL,
    url               TEXT    NOT NULL,
    title             TEXT    NOT NULL,
    brief_description TEXT    DEFAULT '',
    category          TEXT    DEFAULT '',
    budget_min        REAL,
    budget_max        REAL,
    budget_raw        TEXT    DEFAULT '',
    skills            TEXT    DEFAULT '[]',
    proposals_count   INTEGER DEFAULT 0,
    time_posted       TEXT    DEFAULT '',
    status            TEXT    DEFAULT 'open',
    first_seen_at     DATETIME DEFAULT (datetime('now', 'localtime'))
);

-- job_details: extended data from the detail page
CREATE TABLE IF NOT EXISTS job_details (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id        TEXT    UNIQUE NOT NULL,
    full_description  TEXT    DEFAULT '',
    duration          TEXT    DEFAULT '',
    experience_level  TEXT    DEFAULT '',
    attachments_count INTEGER DEFAULT 0,
    publisher_id      TEXT,
    scraped_at        DATETIME DEFAULT (datetime('now', 'localtime')),
    FOREIGN KEY (listing_id) REFERENCES jobs(listing_id) ON DELETE CASCADE
);

-- publishers: client profiles, upserted on every detail scrape
CREATE TABLE IF NOT EXISTS publishers (
    id                    INTEGER PRIMARY KEY AUTOINCREMENT,
    publisher_id          TEXT    UNIQUE NOT NULL,
    display_name          TEXT    DEFAULT '',
    role                  TEXT    DEFAULT '',
    profile_url           TEXT    DEFAULT '',
    identity_verified     INTEGER DEFAULT 0,
    registration_date     TEXT    DEFAULT '',
    total_projects_posted INTEGER DEFAULT 0,
    open_projects         INTEGER DEFAULT 0,
    total_hired           INTEGER DEFAULT 0,
    hire_rate_raw         TEXT    DEFAULT '',
    hire_rate             REAL    DEFAULT 0.0,
    avg_rating            REAL,
    last_scraped_at       DATETIME DEFAULT (datetime('now', 'localtime'))
);

-- analyses: one AI analysis per job; score and recommendation are
-- overwritten afterwards by the deterministic scoring pass
CREATE TABLE IF NOT EXISTS analyses (
    id                         INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id                 TEXT    UNIQUE NOT NULL,
    hiring_probability         INTEGER DEFAULT 0,
    fit_score                  INTEGER DEFAULT 0,
    budget_fairness            INTEGER DEFAULT 0,
    job_clarity                INTEGER DEFAULT 0,
    competition_level          INTEGER DEFAULT 0,
    urgency_score              INTEGER DEFAULT 0,
    overall_score              INTEGER DEFAULT 0,
    job_summary                TEXT    DEFAULT '',
    required_skills_analysis   TEXT    DEFAULT '',
    red_flags                  TEXT    DEFAULT '[]',
    green_flags                TEXT    DEFAULT '[]',
    recommended_proposal_angle TEXT    DEFAULT '',
    estimated_real_budget      TEXT    DEFAULT '',
    recommendation             TEXT    DEFAULT 'skip',
    recommendation_reason      TEXT    DEFAULT '',
    ai_provider                TEXT    DEFAULT '',
    ai_model                   TEXT    DEFAULT '',
    tokens_used                INTEGER DEFAULT 0,
    analyzed_at                DATETIME DEFAULT (datetime('now', 'localtime')),
    FOREIGN KEY (listing_id) REFERENCES jobs(listing_id) ON DELETE CASCADE
);

-- notifications: at-most-once send guard per (job, type)
CREATE TABLE IF NOT EXISTS notifications (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id        TEXT    NOT NULL,
    notification_type TEXT    NOT NULL,
    message_id        TEXT,
    sent_at           DATETIME DEFAULT (datetime('now', 'localtime')),
    FOREIGN KEY (listing_id) REFERENCES jobs(listing_id) ON DELETE CASCADE
);

-- proposals: visible competing proposals captured from detail pages
CREATE TABLE IF NOT EXISTS proposals (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    listing_id        TEXT    NOT NULL,
    proposer_name     TEXT    DEFAULT '',
    proposer_verified INTEGER DEFAULT 0,
    proposer_rating   REAL    DEFAULT 0.0,
    proposed_at       TEXT    DEFAULT '',
    FOREIGN KEY (listing_id) REFERENCES jobs(listing_id) ON DELETE CASCADE
);

-- message_queue: durable fallback when the delivery channel is down
CREATE TABLE IF NOT EXISTS message_queue (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    message    TEXT    NOT NULL,
    msg_type   TEXT    DEFAULT 'general',
    created_at DATETIME DEFAULT (datetime('now', 'localtime'))
);

CREATE INDEX IF NOT EXISTS idx_jobs_listing_id         ON jobs(listing_id);
CREATE INDEX IF NOT EXISTS idx_jobs_status             ON jobs(status);
CREATE INDEX IF NOT EXISTS idx_jobs_first_seen         ON jobs(first_seen_at);
CREATE INDEX IF NOT EXISTS idx_jobs_category           ON jobs(category);
CREATE INDEX IF NOT EXISTS idx_details_listing_id      ON job_details(listing_id);
CREATE INDEX IF NOT EXISTS idx_details_publisher       ON job_details(publisher_id);
CREATE INDEX IF NOT EXISTS idx_publishers_id           ON publishers(publisher_id);
CREATE INDEX IF NOT EXISTS idx_analyses_listing_id     ON analyses(listing_id);
CREATE INDEX IF NOT EXISTS idx_analyses_recommendation ON analyses(recommendation);
CREATE INDEX IF NOT EXISTS idx_analyses_overall_score  ON analyses(overall_score DESC);
CREATE INDEX IF NOT EXISTS idx_analyses_analyzed_at    ON analyses(analyzed_at);
CREATE INDEX IF NOT EXISTS idx_notifications_listing   ON notifications(listing_id);
CREATE INDEX IF NOT EXISTS idx_notifications_type      ON notifications(notification_type);
CREATE INDEX IF NOT EXISTS idx_notifications_sent_at   ON notifications(sent_at);
CREATE INDEX IF NOT EXISTS idx_proposals_listing_id    ON proposals(listing_id);
CREATE INDEX IF NOT EXISTS idx_message_queue_created   ON message_queue(created_at);
"#;

/// A message parked in the durable queue while the delivery channel is down.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct QueuedMessage {
    pub id: i64,
    pub message: String,
    pub msg_type: String,
    pub created_at: String,
}

/// Row counts across the main tables, for status output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct TableCounts {
    pub jobs: i64,
    pub job_details: i64,
    pub analyses: i64,
    pub notifications: i64,
    pub proposals: i64,
}

/// SQLite-backed store for every persisted entity: jobs, details,
/// publishers, analyses, notifications, proposals, and the message queue.
///
/// WAL journal mode allows concurrent readers alongside the single writer.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (creating if missing) a file-backed store and run the idempotent
    /// schema script.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;

        info!(path = %path.display(), "database initialized, all tables ready");
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory store for tests and one-shot runs. Pinned to a single
    /// connection so the database outlives individual acquisitions.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .in_memory(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::raw_sql(SCHEMA_SQL).execute(&pool).await?;
        Ok(Self { pool, path: None })
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("database connection closed");
    }

    // ── jobs ────────────────────────────────────────────────────────────

    pub async fn job_exists(&self, listing_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM jobs WHERE listing_id = ? LIMIT 1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert a listing-page job. Returns `true` when the row is new;
    /// duplicates on `listing_id` are ignored.
    pub async fn insert_listing(&self, job: &JobListing) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO jobs (
                listing_id, url, title, brief_description, category,
                proposals_count, time_posted, status
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.listing_id)
        .bind(&job.url)
        .bind(&job.title)
        .bind(&job.brief_description)
        .bind(&job.category)
        .bind(job.proposals_count)
        .bind(&job.time_posted)
        .bind(&job.status)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(listing_id = %job.listing_id, inserted, "insert_listing");
        Ok(inserted)
    }

    pub async fn update_job_status(&self, listing_id: &str, status: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = ? WHERE listing_id = ?")
            .bind(status)
            .bind(listing_id)
            .execute(&self.pool)
            .await?;
        debug!(listing_id, status, "update_job_status");
        Ok(())
    }

    pub async fn get_job(&self, listing_id: &str) -> Result<Option<JobListing>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT listing_id, url, title, brief_description, category,
                   proposals_count, time_posted, status
            FROM jobs WHERE listing_id = ?
            "#,
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| listing_from_row(&r)).transpose().map_err(Into::into)
    }

    // ── job details ─────────────────────────────────────────────────────

    pub async fn has_detail(&self, listing_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM job_details WHERE listing_id = ? LIMIT 1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Store detail-page data: the detail row, budget/skills backfill on the
    /// jobs row, the publisher upsert, and any visible proposals, all in one
    /// transaction.
    pub async fn insert_detail(&self, detail: &JobDetail) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT OR IGNORE INTO job_details (
                listing_id, full_description, duration, experience_level,
                attachments_count, publisher_id
            ) VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&detail.listing_id)
        .bind(&detail.full_description)
        .bind(&detail.duration)
        .bind(&detail.experience_level)
        .bind(detail.attachments_count)
        .bind(detail.publisher.as_ref().map(|p| p.publisher_id.clone()))
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE jobs SET budget_min = ?, budget_max = ?, budget_raw = ?, skills = ?
            WHERE listing_id = ?
            "#,
        )
        .bind(detail.budget_min)
        .bind(detail.budget_max)
        .bind(&detail.budget_raw)
        .bind(encode_string_list(&detail.skills))
        .bind(&detail.listing_id)
        .execute(&mut *tx)
        .await?;

        if let Some(publisher) = &detail.publisher {
            upsert_publisher_inner(&mut tx, publisher).await?;
        }
        if !detail.proposals.is_empty() {
            insert_proposals_inner(&mut tx, &detail.listing_id, &detail.proposals).await?;
        }

        tx.commit().await?;
        debug!(listing_id = %detail.listing_id, "insert_detail");
        Ok(())
    }

    // ── publishers ──────────────────────────────────────────────────────

    /// Insert or refresh a publisher. Last write wins on every field.
    pub async fn upsert_publisher(&self, publisher: &PublisherInfo) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        upsert_publisher_inner(&mut tx, publisher).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_publisher(&self, publisher_id: &str) -> Result<Option<PublisherInfo>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT publisher_id, display_name, role, profile_url, identity_verified,
                   registration_date, total_projects_posted, open_projects,
                   total_hired, hire_rate_raw, hire_rate, avg_rating
            FROM publishers WHERE publisher_id = ?
            "#,
        )
        .bind(publisher_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| publisher_from_row(&r)).transpose().map_err(Into::into)
    }

    // ── analyses ────────────────────────────────────────────────────────

    pub async fn is_analyzed(&self, listing_id: &str) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM analyses WHERE listing_id = ? LIMIT 1")
            .bind(listing_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Insert an analysis. Returns `true` when the row is new; a second
    /// analysis for the same job is ignored.
    pub async fn insert_analysis(&self, analysis: &AnalysisRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO analyses (
                listing_id, hiring_probability, fit_score, budget_fairness,
                job_clarity, competition_level, urgency_score, overall_score,
                job_summary, required_skills_analysis, red_flags, green_flags,
                recommended_proposal_angle, estimated_real_budget,
                recommendation, recommendation_reason,
                ai_provider, ai_model, tokens_used
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&analysis.listing_id)
        .bind(analysis.hiring_probability)
        .bind(analysis.fit_score)
        .bind(analysis.budget_fairness)
        .bind(analysis.job_clarity)
        .bind(analysis.competition_level)
        .bind(analysis.urgency_score)
        .bind(analysis.overall_score)
        .bind(&analysis.job_summary)
        .bind(&analysis.required_skills_analysis)
        .bind(encode_string_list(&analysis.red_flags))
        .bind(encode_string_list(&analysis.green_flags))
        .bind(&analysis.recommended_proposal_angle)
        .bind(&analysis.estimated_real_budget)
        .bind(analysis.recommendation.as_str())
        .bind(&analysis.recommendation_reason)
        .bind(&analysis.ai_provider)
        .bind(&analysis.ai_model)
        .bind(analysis.tokens_used)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(
            listing_id = %analysis.listing_id,
            score = analysis.overall_score,
            recommendation = analysis.recommendation.as_str(),
            inserted,
            "insert_analysis"
        );
        Ok(inserted)
    }

    /// Overwrite the stored score and recommendation with the deterministic
    /// scoring result.
    pub async fn apply_score(&self, listing_id: &str, score: &ScoreBreakdown) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE analyses
            SET overall_score = ?, recommendation = ?, recommendation_reason = ?
            WHERE listing_id = ?
            "#,
        )
        .bind(score.final_score)
        .bind(score.recommendation.as_str())
        .bind(&score.reasoning)
        .bind(listing_id)
        .execute(&self.pool)
        .await?;
        debug!(
            listing_id,
            final_score = score.final_score,
            recommendation = score.recommendation.as_str(),
            "apply_score"
        );
        Ok(())
    }

    // ── pipeline queries ────────────────────────────────────────────────

    /// Jobs discovered on the listing feed that have no detail row yet.
    pub async fn jobs_needing_details(&self) -> Result<Vec<JobListing>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT j.listing_id, j.url, j.title, j.brief_description, j.category,
                   j.proposals_count, j.time_posted, j.status
            FROM jobs j
            LEFT JOIN job_details jd ON j.listing_id = jd.listing_id
            WHERE jd.id IS NULL
            ORDER BY j.first_seen_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .iter()
            .map(listing_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        debug!(count = jobs.len(), "jobs_needing_details");
        Ok(jobs)
    }

    /// Jobs with details but no analysis, joined with publisher data into
    /// the full unit of work for the analysis stage.
    pub async fn jobs_needing_analysis(&self) -> Result<Vec<CandidateJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                j.listing_id, j.url, j.title, j.brief_description,
                j.category, j.budget_min, j.budget_max, j.budget_raw,
                j.skills, j.time_posted, j.status,
                CASE
                    WHEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id) > 0
                    THEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id)
                    ELSE j.proposals_count
                END AS proposals_count,
                jd.full_description, jd.duration, jd.experience_level,
                jd.attachments_count,
                p.publisher_id, p.display_name AS publisher_name,
                p.role AS publisher_role, p.identity_verified, p.registration_date,
                p.total_projects_posted, p.open_projects, p.total_hired,
                p.hire_rate_raw, p.hire_rate, p.avg_rating
            FROM jobs j
            INNER JOIN job_details jd ON j.listing_id = jd.listing_id
            LEFT JOIN publishers p ON jd.publisher_id = p.publisher_id
            LEFT JOIN analyses a ON j.listing_id = a.listing_id
            WHERE a.id IS NULL
            ORDER BY j.first_seen_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .iter()
            .map(candidate_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        debug!(count = jobs.len(), "jobs_needing_analysis");
        Ok(jobs)
    }

    /// Instant-alert analyses with no 'instant' notification row yet,
    /// best first.
    pub async fn unsent_instant_alerts(&self) -> Result<Vec<ScoredJob>, StoreError> {
        self.unsent_scored(Recommendation::InstantAlert, "instant").await
    }

    /// Digest analyses with no 'digest' notification row yet, best first.
    pub async fn unsent_digest_jobs(&self) -> Result<Vec<ScoredJob>, StoreError> {
        self.unsent_scored(Recommendation::Digest, "digest").await
    }

    async fn unsent_scored(
        &self,
        recommendation: Recommendation,
        notif_type: &str,
    ) -> Result<Vec<ScoredJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                j.listing_id, j.title, j.url, j.category,
                j.budget_min, j.budget_max, j.budget_raw,
                j.skills, j.time_posted,
                CASE
                    WHEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id) > 0
                    THEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id)
                    ELSE j.proposals_count
                END AS proposals_count,
                jd.duration,
                a.overall_score, a.hiring_probability, a.fit_score,
                a.budget_fairness, a.job_clarity, a.competition_level,
                a.urgency_score, a.job_summary, a.required_skills_analysis,
                a.red_flags, a.green_flags, a.recommended_proposal_angle,
                a.recommendation, a.recommendation_reason,
                p.display_name AS publisher_name, p.identity_verified, p.hire_rate
            FROM analyses a
            INNER JOIN jobs j ON a.listing_id = j.listing_id
            LEFT JOIN job_details jd ON j.listing_id = jd.listing_id
            LEFT JOIN publishers p ON jd.publisher_id = p.publisher_id
            LEFT JOIN notifications n
                ON a.listing_id = n.listing_id AND n.notification_type = ?2
            WHERE a.recommendation = ?1 AND n.id IS NULL
            ORDER BY a.overall_score DESC
            "#,
        )
        .bind(recommendation.as_str())
        .bind(notif_type)
        .fetch_all(&self.pool)
        .await?;
        let jobs = rows
            .iter()
            .map(scored_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()?;
        debug!(count = jobs.len(), notif_type, "unsent_scored");
        Ok(jobs)
    }

    pub async fn mark_notified(
        &self,
        listing_id: &str,
        notif_type: &str,
        message_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO notifications (listing_id, notification_type, message_id) VALUES (?, ?, ?)",
        )
        .bind(listing_id)
        .bind(notif_type)
        .bind(message_id)
        .execute(&self.pool)
        .await?;
        debug!(listing_id, notif_type, message_id, "mark_notified");
        Ok(())
    }

    // ── statistics ──────────────────────────────────────────────────────

    pub async fn today_stats(&self) -> Result<DailyStats, StoreError> {
        let counts = sqlx::query(
            r#"
            SELECT
                DATE('now', 'localtime') AS date,
                (SELECT COUNT(*) FROM jobs
                   WHERE DATE(first_seen_at) = DATE('now', 'localtime')) AS jobs_discovered,
                (SELECT COUNT(*) FROM notifications
                   WHERE notification_type = 'instant'
                     AND DATE(sent_at) = DATE('now', 'localtime')) AS alerts_sent,
                (SELECT COUNT(*) FROM notifications
                   WHERE notification_type = 'digest'
                     AND DATE(sent_at) = DATE('now', 'localtime')) AS digests_sent
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let analyses = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS analyzed,
                COALESCE(SUM(CASE WHEN recommendation = 'instant_alert' THEN 1 ELSE 0 END), 0) AS instant_count,
                COALESCE(SUM(CASE WHEN recommendation = 'digest' THEN 1 ELSE 0 END), 0) AS digest_count,
                COALESCE(SUM(CASE WHEN recommendation = 'skip' THEN 1 ELSE 0 END), 0) AS skipped_count,
                COALESCE(AVG(fit_score), 0.0) AS avg_fit,
                COALESCE(AVG(hiring_probability), 0.0) AS avg_hiring,
                COALESCE(AVG(overall_score), 0.0) AS avg_overall,
                COALESCE(MAX(overall_score), 0) AS top_score,
                COALESCE(SUM(tokens_used), 0) AS tokens_used
            FROM analyses
            WHERE DATE(analyzed_at) = DATE('now', 'localtime')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let stats = DailyStats {
            date: counts.try_get("date")?,
            jobs_discovered: counts.try_get("jobs_discovered")?,
            jobs_analyzed: analyses.try_get("analyzed")?,
            instant_count: analyses.try_get("instant_count")?,
            digest_count: analyses.try_get("digest_count")?,
            skipped_count: analyses.try_get("skipped_count")?,
            alerts_sent: counts.try_get("alerts_sent")?,
            digests_sent: counts.try_get("digests_sent")?,
            avg_fit_score: round_tenth(analyses.try_get("avg_fit")?),
            avg_hiring_probability: round_tenth(analyses.try_get("avg_hiring")?),
            avg_overall_score: round_tenth(analyses.try_get("avg_overall")?),
            top_score: analyses.try_get("top_score")?,
            tokens_used: analyses.try_get("tokens_used")?,
        };
        debug!(?stats, "today_stats");
        Ok(stats)
    }

    /// Best-scored jobs analyzed today, for the daily report and /last.
    pub async fn top_jobs_today(&self, limit: i64) -> Result<Vec<ScoredJob>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                j.listing_id, j.title, j.url, j.category,
                j.budget_min, j.budget_max, j.budget_raw,
                j.skills, j.time_posted,
                CASE
                    WHEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id) > 0
                    THEN (SELECT COUNT(*) FROM proposals pr WHERE pr.listing_id = j.listing_id)
                    ELSE j.proposals_count
                END AS proposals_count,
                jd.duration,
                a.overall_score, a.hiring_probability, a.fit_score,
                a.budget_fairness, a.job_clarity, a.competition_level,
                a.urgency_score, a.job_summary, a.required_skills_analysis,
                a.red_flags, a.green_flags, a.recommended_proposal_angle,
                a.recommendation, a.recommendation_reason,
                p.display_name AS publisher_name, p.identity_verified, p.hire_rate
            FROM analyses a
            INNER JOIN jobs j ON a.listing_id = j.listing_id
            LEFT JOIN job_details jd ON j.listing_id = jd.listing_id
            LEFT JOIN publishers p ON jd.publisher_id = p.publisher_id
            WHERE DATE(a.analyzed_at) = DATE('now', 'localtime')
            ORDER BY a.overall_score DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(scored_from_row)
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(Into::into)
    }

    // ── message queue ───────────────────────────────────────────────────

    pub async fn queue_message(&self, text: &str, msg_type: &str) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO message_queue (message, msg_type) VALUES (?, ?)")
            .bind(text)
            .bind(msg_type)
            .execute(&self.pool)
            .await?;
        debug!(msg_type, len = text.len(), "queue_message");
        Ok(())
    }

    pub async fn queued_messages(&self) -> Result<Vec<QueuedMessage>, StoreError> {
        let messages = sqlx::query_as::<_, QueuedMessage>(
            "SELECT id, message, msg_type, created_at FROM message_queue ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(messages)
    }

    pub async fn delete_queued_message(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM message_queue WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        debug!(id, "delete_queued_message");
        Ok(())
    }

    // ── maintenance ─────────────────────────────────────────────────────

    /// Delete skip-recommended jobs older than `days`, cascading through
    /// their analyses, proposals, and details. Returns the number of jobs
    /// removed.
    pub async fn cleanup_old_data(&self, days: u32) -> Result<u64, StoreError> {
        let modifier = format!("-{days} days");
        let mut tx = self.pool.begin().await?;

        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS cnt FROM jobs j
            INNER JOIN analyses a ON j.listing_id = a.listing_id
            WHERE a.recommendation = 'skip'
              AND j.first_seen_at < datetime('now', ?)
            "#,
        )
        .bind(&modifier)
        .fetch_one(&mut *tx)
        .await?
        .try_get("cnt")?;

        if count == 0 {
            debug!(days, "no old data to clean up");
            return Ok(0);
        }

        sqlx::query(
            r#"
            DELETE FROM analyses
            WHERE listing_id IN (
                SELECT j.listing_id FROM jobs j
                INNER JOIN analyses a ON j.listing_id = a.listing_id
                WHERE a.recommendation = 'skip'
                  AND j.first_seen_at < datetime('now', ?)
            )
            "#,
        )
        .bind(&modifier)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM proposals
            WHERE listing_id IN (
                SELECT listing_id FROM jobs
                WHERE first_seen_at < datetime('now', ?)
                  AND listing_id NOT IN (SELECT listing_id FROM analyses)
            )
            "#,
        )
        .bind(&modifier)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM job_details
            WHERE listing_id IN (
                SELECT listing_id FROM jobs
                WHERE first_seen_at < datetime('now', ?)
                  AND listing_id NOT IN (SELECT listing_id FROM analyses)
            )
            "#,
        )
        .bind(&modifier)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE first_seen_at < datetime('now', ?)
              AND listing_id NOT IN (SELECT listing_id FROM analyses)
            "#,
        )
        .bind(&modifier)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        info!(removed = count, days, "cleaned up old skipped jobs");
        Ok(count.max(0) as u64)
    }

    /// Rebuild the database file to reclaim space freed by cleanup.
    pub async fn vacuum(&self) -> Result<(), StoreError> {
        sqlx::query("VACUUM").execute(&self.pool).await?;
        info!("database VACUUM complete");
        Ok(())
    }

    pub async fn database_size_bytes(&self) -> Result<u64, StoreError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn total_counts(&self) -> Result<TableCounts, StoreError> {
        let counts = sqlx::query_as::<_, TableCounts>(
            r#"
            SELECT
                (SELECT COUNT(*) FROM jobs)          AS jobs,
                (SELECT COUNT(*) FROM job_details)   AS job_details,
                (SELECT COUNT(*) FROM analyses)      AS analyses,
                (SELECT COUNT(*) FROM notifications) AS notifications,
                (SELECT COUNT(*) FROM proposals)     AS proposals
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(counts)
    }
}

async fn upsert_publisher_inner(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    publisher: &PublisherInfo,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO publishers (
            publisher_id, display_name, role, profile_url,
            identity_verified, registration_date, total_projects_posted,
            open_projects, total_hired, hire_rate_raw, hire_rate, avg_rating
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(publisher_id) DO UPDATE SET
            display_name = excluded.display_name,
            role = excluded.role,
            profile_url = excluded.profile_url,
            identity_verified = excluded.identity_verified,
            registration_date = excluded.registration_date,
            total_projects_posted = excluded.total_projects_posted,
            open_projects = excluded.open_projects,
            total_hired = excluded.total_hired,
            hire_rate_raw = excluded.hire_rate_raw,
            hire_rate = excluded.hire_rate,
            avg_rating = excluded.avg_rating,
            last_scraped_at = CURRENT_TIMESTAMP
        "#,
    )
    .bind(&publisher.publisher_id)
    .bind(&publisher.display_name)
    .bind(&publisher.role)
    .bind(&publisher.profile_url)
    .bind(publisher.identity_verified)
    .bind(&publisher.registration_date)
    .bind(publisher.total_projects_posted)
    .bind(publisher.open_projects)
    .bind(publisher.total_hired)
    .bind(&publisher.hire_rate_raw)
    .bind(publisher.hire_rate)
    .bind(publisher.avg_rating)
    .execute(&mut **tx)
    .await?;
    debug!(publisher_id = %publisher.publisher_id, "upsert_publisher");
    Ok(())
}

async fn insert_proposals_inner(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    listing_id: &str,
    proposals: &[ProposalInfo],
) -> Result<(), StoreError> {
    for proposal in proposals {
        sqlx::query(
            r#"
            INSERT INTO proposals (
                listing_id, proposer_name, proposer_verified,
                proposer_rating, proposed_at
            ) VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(listing_id)
        .bind(&proposal.proposer_name)
        .bind(proposal.proposer_verified)
        .bind(proposal.proposer_rating)
        .bind(&proposal.proposed_at)
        .execute(&mut **tx)
        .await?;
    }
    debug!(listing_id, count = proposals.len(), "insert_proposals");
    Ok(())
}

// ── row mapping ─────────────────────────────────────────────────────────

fn listing_from_row(row: &SqliteRow) -> Result<JobListing, sqlx::Error> {
    Ok(JobListing {
        listing_id: row.try_get("listing_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        publisher_name: String::new(),
        time_posted: row.try_get("time_posted")?,
        brief_description: row.try_get("brief_description")?,
        category: row.try_get("category")?,
        proposals_count: row.try_get("proposals_count")?,
        status: row.try_get("status")?,
    })
}

fn publisher_from_row(row: &SqliteRow) -> Result<PublisherInfo, sqlx::Error> {
    Ok(PublisherInfo {
        publisher_id: row.try_get("publisher_id")?,
        display_name: row.try_get("display_name")?,
        role: row.try_get("role")?,
        profile_url: row.try_get("profile_url")?,
        identity_verified: row.try_get("identity_verified")?,
        registration_date: row.try_get("registration_date")?,
        total_projects_posted: row.try_get("total_projects_posted")?,
        open_projects: row.try_get("open_projects")?,
        total_hired: row.try_get("total_hired")?,
        hire_rate_raw: row.try_get("hire_rate_raw")?,
        hire_rate: row.try_get("hire_rate")?,
        avg_rating: row.try_get("avg_rating")?,
    })
}

fn candidate_from_row(row: &SqliteRow) -> Result<CandidateJob, sqlx::Error> {
    Ok(CandidateJob {
        listing_id: row.try_get("listing_id")?,
        url: row.try_get("url")?,
        title: row.try_get("title")?,
        brief_description: row.try_get("brief_description")?,
        category: row.try_get("category")?,
        budget_min: row.try_get("budget_min")?,
        budget_max: row.try_get("budget_max")?,
        budget_raw: row.try_get("budget_raw")?,
        skills: decode_string_list(row.try_get("skills")?),
        time_posted: row.try_get("time_posted")?,
        status: row.try_get("status")?,
        proposals_count: row.try_get("proposals_count")?,
        full_description: row.try_get("full_description")?,
        duration: row.try_get("duration")?,
        experience_level: row.try_get("experience_level")?,
        attachments_count: row.try_get("attachments_count")?,
        publisher_id: row.try_get("publisher_id")?,
        publisher_name: row.try_get::<Option<String>, _>("publisher_name")?.unwrap_or_default(),
        publisher_role: row.try_get::<Option<String>, _>("publisher_role")?.unwrap_or_default(),
        identity_verified: row.try_get::<Option<bool>, _>("identity_verified")?.unwrap_or(false),
        registration_date: row.try_get::<Option<String>, _>("registration_date")?.unwrap_or_default(),
        total_projects_posted: row.try_get::<Option<i64>, _>("total_projects_posted")?.unwrap_or(0),
        open_projects: row.try_get::<Option<i64>, _>("open_projects")?.unwrap_or(0),
        total_hired: row.try_get::<Option<i64>, _>("total_hired")?.unwrap_or(0),
        hire_rate_raw: row.try_get::<Option<String>, _>("hire_rate_raw")?.unwrap_or_default(),
        hire_rate: row.try_get::<Option<f64>, _>("hire_rate")?.unwrap_or(0.0),
        avg_rating: row.try_get("avg_rating")?,
    })
}

fn scored_from_row(row: &SqliteRow) -> Result<ScoredJob, sqlx::Error> {
    let recommendation: String = row.try_get("recommendation")?;
    Ok(ScoredJob {
        listing_id: row.try_get("listing_id")?,
        title: row.try_get("title")?,
        url: row.try_get("url")?,
        category: row.try_get("category")?,
        budget_min: row.try_get("budget_min")?,
        budget_max: row.try_get("budget_max")?,
        budget_raw: row.try_get("budget_raw")?,
        duration: row.try_get::<Option<String>, _>("duration")?.unwrap_or_default(),
        skills: decode_string_list(row.try_get("skills")?),
        proposals_count: row.try_get("proposals_count")?,
        time_posted: row.try_get("time_posted")?,
        publisher_name: row.try_get::<Option<String>, _>("publisher_name")?.unwrap_or_default(),
        publisher_verified: row.try_get::<Option<bool>, _>("identity_verified")?.unwrap_or(false),
        hire_rate: row.try_get::<Option<f64>, _>("hire_rate")?.unwrap_or(0.0),
        overall_score: row.try_get("overall_score")?,
        hiring_probability: row.try_get("hiring_probability")?,
        fit_score: row.try_get("fit_score")?,
        budget_fairness: row.try_get("budget_fairness")?,
        job_clarity: row.try_get("job_clarity")?,
        competition_level: row.try_get("competition_level")?,
        urgency_score: row.try_get("urgency_score")?,
        job_summary: row.try_get("job_summary")?,
        required_skills_analysis: row.try_get("required_skills_analysis")?,
        red_flags: decode_string_list(row.try_get("red_flags")?),
        green_flags: decode_string_list(row.try_get("green_flags")?),
        recommended_proposal_angle: row.try_get("recommended_proposal_angle")?,
        recommendation: Recommendation::parse(&recommendation).unwrap_or_default(),
        recommendation_reason: row.try_get("recommendation_reason")?,
    })
}

fn encode_string_list(list: &[String]) -> String {
    serde_json::to_string(list).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON list column. Legacy comma-separated values are tolerated.
fn decode_string_list(raw: Option<String>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Vec<String>>(&raw) {
        Ok(list) => list,
        Err(_) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
    }
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

// ── rate limiting ───────────────────────────────────────────────────────

/// Sliding-window rate limiter: at most `max_calls` acquisitions per
/// window, extra callers sleep until the oldest timestamp falls out.
#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_calls: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_calls: usize, window: Duration) -> Self {
        Self {
            max_calls: max_calls.max(1),
            window,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    /// Block until a slot is free, then claim it. The lock is released
    /// while sleeping so other callers keep making progress.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut stamps = self.timestamps.lock().await;
                let now = Instant::now();
                while stamps
                    .front()
                    .is_some_and(|t| now.duration_since(*t) >= self.window)
                {
                    stamps.pop_front();
                }
                if stamps.len() < self.max_calls {
                    stamps.push_back(now);
                    debug!(used = stamps.len(), max = self.max_calls, "rate limit slot acquired");
                    return;
                }
                match stamps.front() {
                    Some(oldest) => self.window.saturating_sub(now.duration_since(*oldest)),
                    None => Duration::ZERO,
                }
            };
            debug!(wait_ms = wait.as_millis() as u64, "rate limit reached, waiting");
            tokio::time::sleep(wait).await;
        }
    }

    /// Approximate free-slot count. Returns 0 while another task holds the
    /// window lock.
    pub fn available_slots(&self) -> usize {
        match self.timestamps.try_lock() {
            Ok(stamps) => {
                let now = Instant::now();
                let live = stamps
                    .iter()
                    .filter(|t| now.duration_since(**t) < self.window)
                    .count();
                self.max_calls.saturating_sub(live)
            }
            Err(_) => 0,
        }
    }
}

// ── circuit breaker ─────────────────────────────────────────────────────

/// Circuit state as observed by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(label)
    }
}

/// Failure surfaced by [`CircuitBreaker::call`].
#[derive(Debug, Error)]
pub enum BreakerError<E>
where
    E: std::error::Error,
{
    /// The call was not attempted; the circuit is blocking requests.
    #[error("circuit '{name}' is open, retry in {retry_in_secs:.0}s")]
    Open { name: String, retry_in_secs: f64 },
    #[error(transparent)]
    Inner(E),
}

/// Point-in-time breaker state for health reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub total_trips: u64,
    pub remaining_cooldown_secs: f64,
}

#[derive(Debug)]
struct BreakerInner {
    // Stored state is only ever Closed or Open; HalfOpen is derived from
    // the elapsed cooldown.
    state: BreakerState,
    cooldown: Duration,
    failure_count: u32,
    opened_at: Option<Instant>,
    total_trips: u64,
    alerted: bool,
}

/// Circuit breaker for an external service.
///
/// `failure_threshold` consecutive failures open the circuit for
/// `cooldown`. Once the cooldown elapses the next call is a half-open
/// probe: success closes the circuit, failure reopens it with the longer
/// `half_open_cooldown` from then on.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    half_open_cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        cooldown: Duration,
        half_open_cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            half_open_cooldown,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                cooldown,
                failure_count: 0,
                opened_at: None,
                total_trips: 0,
                alerted: false,
            }),
        }
    }

    /// Defaults used by every external service: 5 failures, 5 minute
    /// cooldown, 10 minutes after a failed half-open probe.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(
            name,
            5,
            Duration::from_secs(300),
            Duration::from_secs(600),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker. The lock is not held while `op` runs.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error,
    {
        let observed = {
            let inner = self.inner.lock().await;
            let observed = observe(&inner);
            if observed == BreakerState::Open {
                return Err(BreakerError::Open {
                    name: self.name.clone(),
                    retry_in_secs: remaining(&inner).as_secs_f64(),
                });
            }
            observed
        };

        match op().await {
            Ok(value) => {
                self.on_success(observed).await;
                Ok(value)
            }
            Err(err) => {
                self.on_failure(observed, &err).await;
                Err(BreakerError::Inner(err))
            }
        }
    }

    pub async fn state(&self) -> BreakerState {
        observe(&*self.inner.lock().await)
    }

    pub async fn is_open(&self) -> bool {
        self.state().await == BreakerState::Open
    }

    pub async fn remaining_cooldown(&self) -> Duration {
        remaining(&*self.inner.lock().await)
    }

    /// Whether an operator alert was already sent for the current open
    /// episode.
    pub async fn has_alerted(&self) -> bool {
        self.inner.lock().await.alerted
    }

    pub async fn mark_alerted(&self) {
        self.inner.lock().await.alerted = true;
    }

    /// Force the circuit back to closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.alerted = false;
        info!(breaker = %self.name, "circuit manually reset to CLOSED");
    }

    pub async fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock().await;
        BreakerSnapshot {
            name: self.name.clone(),
            state: observe(&inner),
            failure_count: inner.failure_count,
            total_trips: inner.total_trips,
            remaining_cooldown_secs: (remaining(&inner).as_secs_f64() * 10.0).round() / 10.0,
        }
    }

    async fn on_success(&self, observed: BreakerState) {
        let mut inner = self.inner.lock().await;
        if observed == BreakerState::HalfOpen {
            info!(breaker = %self.name, "HALF_OPEN -> CLOSED, probe succeeded");
        } else if inner.failure_count > 0 {
            debug!(breaker = %self.name, was = inner.failure_count, "failure count reset");
        }
        inner.state = BreakerState::Closed;
        inner.failure_count = 0;
        inner.alerted = false;
    }

    async fn on_failure<E: fmt::Display>(&self, observed: BreakerState, err: &E) {
        let mut inner = self.inner.lock().await;
        inner.failure_count += 1;

        if observed == BreakerState::HalfOpen {
            // Probe failed: reopen with the extended cooldown from now on.
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.cooldown = self.half_open_cooldown;
            inner.alerted = false;
            warn!(
                breaker = %self.name,
                cooldown_secs = inner.cooldown.as_secs(),
                error = %err,
                "HALF_OPEN -> OPEN, probe failed"
            );
            return;
        }

        if inner.failure_count >= self.failure_threshold {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.total_trips += 1;
            inner.alerted = false;
            warn!(
                breaker = %self.name,
                trip = inner.total_trips,
                failures = inner.failure_count,
                cooldown_secs = inner.cooldown.as_secs(),
                error = %err,
                "CLOSED -> OPEN"
            );
        } else {
            debug!(
                breaker = %self.name,
                failures = inner.failure_count,
                threshold = self.failure_threshold,
                error = %err,
                "call failed"
            );
        }
    }
}

fn observe(inner: &BreakerInner) -> BreakerState {
    if inner.state == BreakerState::Open {
        if let Some(opened_at) = inner.opened_at {
            if opened_at.elapsed() >= inner.cooldown {
                return BreakerState::HalfOpen;
            }
        }
    }
    inner.state
}

fn remaining(inner: &BreakerInner) -> Duration {
    if inner.state != BreakerState::Open {
        return Duration::ZERO;
    }
    match inner.opened_at {
        Some(opened_at) => inner.cooldown.saturating_sub(opened_at.elapsed()),
        None => Duration::ZERO,
    }
}

// ── retry classification ────────────────────────────────────────────────

/// How a failed HTTP exchange should be handled by retry loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Transient server-side failure, retry after a short delay.
    Retryable,
    /// Rate limited, honor the server's retry hint before the next attempt.
    Throttled,
    /// Permanent failure, do not retry.
    Fatal,
}

pub fn classify_status(status: reqwest::StatusCode) -> RetryDisposition {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Throttled
    } else if status.is_server_error() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::Fatal
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::Fatal
    }
}

/// Exponential backoff schedule: `base_delay * 2^attempt`, capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(multiplier).min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn sample_listing(id: &str) -> JobListing {
        let mut job = JobListing::new(id, format!("Build API {id}"), format!("https://example.com/p/{id}"));
        job.brief_description = "REST API with auth".to_string();
        job.category = "تطوير المواقع".to_string();
        job.proposals_count = 3;
        job.time_posted = "2026-02-25 21:28".to_string();
        job
    }

    fn sample_detail(id: &str) -> JobDetail {
        JobDetail {
            listing_id: id.to_string(),
            full_description: "Need a Django REST backend with payment integration".to_string(),
            duration: "شهر واحد".to_string(),
            experience_level: "خبير".to_string(),
            budget_min: Some(250.0),
            budget_max: Some(500.0),
            budget_raw: "$250.00 - $500.00".to_string(),
            skills: vec!["python".to_string(), "django".to_string()],
            attachments_count: 1,
            publisher: Some(PublisherInfo {
                publisher_id: "u-1001".to_string(),
                display_name: "شركة التقنية".to_string(),
                identity_verified: true,
                hire_rate: 85.0,
                hire_rate_raw: "85%".to_string(),
                total_projects_posted: 12,
                ..PublisherInfo::default()
            }),
            proposals: vec![ProposalInfo {
                proposer_name: "أحمد".to_string(),
                proposer_verified: true,
                proposer_rating: 4.8,
                proposed_at: "2026-02-25".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn listing_insert_is_idempotent() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        let job = sample_listing("j1");

        assert!(store.insert_listing(&job).await.expect("first insert"));
        assert!(!store.insert_listing(&job).await.expect("second insert"));
        assert!(store.job_exists("j1").await.expect("exists"));

        let fetched = store.get_job("j1").await.expect("get").expect("present");
        assert_eq!(fetched.title, job.title);
        assert_eq!(fetched.proposals_count, 3);
    }

    #[tokio::test]
    async fn detail_insert_joins_into_analysis_candidates() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        store.insert_listing(&sample_listing("j1")).await.expect("insert job");
        store.insert_listing(&sample_listing("j2")).await.expect("insert job");

        let needing = store.jobs_needing_details().await.expect("needing details");
        assert_eq!(needing.len(), 2);

        store.insert_detail(&sample_detail("j1")).await.expect("insert detail");

        let needing = store.jobs_needing_details().await.expect("needing details");
        assert_eq!(needing.len(), 1);
        assert_eq!(needing[0].listing_id, "j2");

        let candidates = store.jobs_needing_analysis().await.expect("candidates");
        assert_eq!(candidates.len(), 1);
        let candidate = &candidates[0];
        assert_eq!(candidate.listing_id, "j1");
        assert_eq!(candidate.budget_max, Some(500.0));
        assert_eq!(candidate.skills, vec!["python", "django"]);
        assert_eq!(candidate.publisher_name, "شركة التقنية");
        assert!(candidate.identity_verified);
        // One captured proposal row takes precedence over the listing count.
        assert_eq!(candidate.proposals_count, 1);
    }

    #[tokio::test]
    async fn publisher_upsert_keeps_latest_values() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        let mut publisher = PublisherInfo {
            publisher_id: "u-7".to_string(),
            display_name: "Old Name".to_string(),
            ..PublisherInfo::default()
        };
        store.upsert_publisher(&publisher).await.expect("first upsert");

        publisher.display_name = "New Name".to_string();
        publisher.identity_verified = true;
        store.upsert_publisher(&publisher).await.expect("second upsert");

        let fetched = store
            .get_publisher("u-7")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(fetched.display_name, "New Name");
        assert!(fetched.identity_verified);
    }

    #[tokio::test]
    async fn score_overwrite_feeds_unsent_alerts_once() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        store.insert_listing(&sample_listing("j1")).await.expect("insert job");
        store.insert_detail(&sample_detail("j1")).await.expect("insert detail");

        let mut analysis = AnalysisRecord::new("j1");
        analysis.fit_score = 92;
        analysis.hiring_probability = 90;
        assert!(store.insert_analysis(&analysis).await.expect("insert analysis"));
        assert!(!store.insert_analysis(&analysis).await.expect("re-insert analysis"));

        // Raw analysis defaults to skip, so nothing is pending yet.
        assert!(store.unsent_instant_alerts().await.expect("unsent").is_empty());

        let score = ScoreBreakdown {
            base_score: 88.4,
            bonuses: vec![],
            penalties: vec![],
            final_score: 91,
            recommendation: Recommendation::InstantAlert,
            reasoning: "الدرجة الكلية: 91/100".to_string(),
        };
        store.apply_score("j1", &score).await.expect("apply score");

        let pending = store.unsent_instant_alerts().await.expect("unsent");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].overall_score, 91);
        assert_eq!(pending[0].recommendation, Recommendation::InstantAlert);

        store.mark_notified("j1", "instant", "msg-42").await.expect("mark");
        assert!(store.unsent_instant_alerts().await.expect("unsent").is_empty());
    }

    #[tokio::test]
    async fn message_queue_is_fifo() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        store.queue_message("first", "digest").await.expect("queue");
        store.queue_message("second", "general").await.expect("queue");

        let queued = store.queued_messages().await.expect("queued");
        assert_eq!(queued.len(), 2);
        assert_eq!(queued[0].message, "first");
        assert_eq!(queued[1].message, "second");

        store.delete_queued_message(queued[0].id).await.expect("delete");
        let queued = store.queued_messages().await.expect("queued");
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].message, "second");
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_skipped_jobs() {
        let store = SqliteStore::open_in_memory().await.expect("open store");
        store.insert_listing(&sample_listing("old-skip")).await.expect("insert");
        store.insert_listing(&sample_listing("fresh-skip")).await.expect("insert");

        let mut skip = AnalysisRecord::new("old-skip");
        skip.recommendation = Recommendation::Skip;
        store.insert_analysis(&skip).await.expect("analysis");
        let mut skip2 = AnalysisRecord::new("fresh-skip");
        skip2.recommendation = Recommendation::Skip;
        store.insert_analysis(&skip2).await.expect("analysis");

        sqlx::query("UPDATE jobs SET first_seen_at = datetime('now', '-40 days') WHERE listing_id = 'old-skip'")
            .execute(&store.pool)
            .await
            .expect("age job");

        let removed = store.cleanup_old_data(30).await.expect("cleanup");
        assert_eq!(removed, 1);
        assert!(!store.job_exists("old-skip").await.expect("exists"));
        assert!(store.job_exists("fresh-skip").await.expect("exists"));
    }

    #[tokio::test]
    async fn file_backed_store_persists_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("radar.db");

        {
            let store = SqliteStore::open(&path).await.expect("open");
            store.insert_listing(&sample_listing("j1")).await.expect("insert");
            assert!(store.database_size_bytes().await.expect("size") > 0);
            store.close().await;
        }

        let store = SqliteStore::open(&path).await.expect("reopen");
        assert!(store.job_exists("j1").await.expect("exists"));
        let counts = store.total_counts().await.expect("counts");
        assert_eq!(counts.jobs, 1);
    }

    #[tokio::test]
    async fn limiter_blocks_once_window_is_full() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_millis(200));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.available_slots(), 0);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire()).await;
        assert!(blocked.is_err(), "third acquire should wait for the window");

        tokio::time::sleep(Duration::from_millis(220)).await;
        assert_eq!(limiter.available_slots(), 2);
        limiter.acquire().await;
    }

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    #[tokio::test]
    async fn breaker_opens_at_exact_threshold_and_blocks() {
        let breaker = CircuitBreaker::new(
            "svc",
            3,
            Duration::from_secs(300),
            Duration::from_secs(600),
        );

        for _ in 0..2 {
            let result = breaker.call(|| async { Err::<(), _>(Boom) }).await;
            assert!(matches!(result, Err(BreakerError::Inner(Boom))));
        }
        assert_eq!(breaker.state().await, BreakerState::Closed);

        let result = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert!(matches!(result, Err(BreakerError::Inner(Boom))));
        assert_eq!(breaker.state().await, BreakerState::Open);

        let calls = AtomicUsize::new(0);
        let result = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, Boom>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 0, "open circuit must not invoke the call");

        let snapshot = breaker.snapshot().await;
        assert_eq!(snapshot.total_trips, 1);
        assert_eq!(snapshot.failure_count, 3);
    }

    #[tokio::test]
    async fn breaker_half_open_probe_success_closes() {
        let breaker = CircuitBreaker::new(
            "svc",
            1,
            Duration::from_millis(20),
            Duration::from_millis(200),
        );
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let result = breaker.call(|| async { Ok::<_, Boom>(7) }).await;
        assert!(matches!(result, Ok(7)));
        assert_eq!(breaker.state().await, BreakerState::Closed);
        assert_eq!(breaker.snapshot().await.failure_count, 0);
    }

    #[tokio::test]
    async fn breaker_half_open_probe_failure_extends_cooldown() {
        let breaker = CircuitBreaker::new(
            "svc",
            1,
            Duration::from_millis(20),
            Duration::from_millis(500),
        );
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(breaker.state().await, BreakerState::HalfOpen);

        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert_eq!(breaker.state().await, BreakerState::Open);

        // Reopened with the longer cooldown, and a probe failure is not a
        // new trip.
        assert!(breaker.remaining_cooldown().await > Duration::from_millis(100));
        assert_eq!(breaker.snapshot().await.total_trips, 1);
    }

    #[tokio::test]
    async fn breaker_alert_latch_resets_per_episode() {
        let breaker = CircuitBreaker::new(
            "svc",
            1,
            Duration::from_millis(20),
            Duration::from_millis(20),
        );
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        assert!(!breaker.has_alerted().await);
        breaker.mark_alerted().await;
        assert!(breaker.has_alerted().await);

        tokio::time::sleep(Duration::from_millis(30)).await;
        let _ = breaker.call(|| async { Err::<(), _>(Boom) }).await;
        // New open episode clears the latch.
        assert!(!breaker.has_alerted().await);
    }

    #[test]
    fn status_classification_matches_retry_matrix() {
        use reqwest::StatusCode;
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Throttled);
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::INTERNAL_SERVER_ERROR), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::Fatal);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::Fatal);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(8));
    }

    #[test]
    fn string_list_decoding_tolerates_legacy_values() {
        assert_eq!(
            decode_string_list(Some(r#"["a","b"]"#.to_string())),
            vec!["a", "b"]
        );
        assert_eq!(decode_string_list(Some("a, b".to_string())), vec!["a", "b"]);
        assert!(decode_string_list(Some("".to_string())).is_empty());
        assert!(decode_string_list(None).is_empty());
    }
}
