use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};
use fjr_monitor::load_config;
use fjr_notify::{format_daily_report, strip_formatting};
use fjr_storage::SqliteStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "fjr-cli")]
#[command(about = "Freelance Job Radar command-line interface")]
struct Cli {
    #[arg(long, default_value = "config/settings.yaml")]
    settings: PathBuf,
    #[arg(long, default_value = "config/my_profile.yaml")]
    profile: PathBuf,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run,
    ScanOnce,
    Report,
    InitDb,
}

const REQUIRED_ENV_VARS: [&str; 3] = ["GEMINI_API_KEY", "TELEGRAM_BOT_TOKEN", "TELEGRAM_CHAT_ID"];
const PLACEHOLDER_VALUES: [&str; 2] = ["your_key_here", "test"];

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            preflight(&cli.settings, &cli.profile)?;
            let config = load_config(&cli.settings, &cli.profile)?;
            init_tracing(&config.log_level);
            info!(
                settings = %cli.settings.display(),
                profile = %cli.profile.display(),
                "configuration loaded"
            );
            fjr_monitor::run(config).await?;
        }
        Commands::ScanOnce => {
            let config = load_config(&cli.settings, &cli.profile)?;
            init_tracing(&config.log_level);
            fjr_monitor::run_once(config).await?;
        }
        Commands::Report => {
            let config = load_config(&cli.settings, &cli.profile)?;
            init_tracing(&config.log_level);
            let store = SqliteStore::open(&config.database_path).await?;
            let stats = store.today_stats().await?;
            let top_jobs = store.top_jobs_today(5).await?;
            let report = format_daily_report(&stats, &top_jobs, 0, 0);
            println!("{}", strip_formatting(&report));
            store.close().await;
        }
        Commands::InitDb => {
            let config = load_config(&cli.settings, &cli.profile)?;
            init_tracing(&config.log_level);
            let store = SqliteStore::open(&config.database_path).await?;
            let counts = store.total_counts().await?;
            println!(
                "database ready at {}: {} jobs, {} details, {} analyses, {} notifications",
                config.database_path.display(),
                counts.jobs,
                counts.job_details,
                counts.analyses,
                counts.notifications
            );
            store.close().await;
        }
    }

    Ok(())
}

/// RUST_LOG wins when set; the configured level is the fallback.
fn init_tracing(default_level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn env_value(name: &str) -> Option<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() && !PLACEHOLDER_VALUES.contains(&value.as_str()) => {
            Some(value)
        }
        _ => None,
    }
}

fn mask(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() > 10 {
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    } else {
        "***".to_string()
    }
}

fn preflight(settings: &Path, profile: &Path) -> Result<()> {
    println!("═══ Pre-flight checks ═══");
    let mut ok = true;

    for var in REQUIRED_ENV_VARS {
        match env_value(var) {
            Some(value) => println!("✅ {var} = {}", mask(&value)),
            None => {
                println!("❌ {var} not set or invalid in .env");
                ok = false;
            }
        }
    }
    match env_value("GROQ_API_KEY") {
        Some(value) => println!("✅ GROQ_API_KEY = {}", mask(&value)),
        None => println!("⚠️  GROQ_API_KEY not set (fallback AI will be unavailable)"),
    }

    for path in [settings, profile] {
        if path.exists() {
            println!("✅ {} exists", path.display());
        } else {
            println!("❌ {} not found", path.display());
            ok = false;
        }
    }

    std::fs::create_dir_all("data")?;
    println!("✅ data/ directory ready");

    if !ok {
        anyhow::bail!("pre-flight checks failed");
    }
    println!("✅ all checks passed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_values_are_masked_with_head_and_tail() {
        assert_eq!(mask("AIzaSyD-1234567890abcd"), "AIzaSy...abcd");
    }

    #[test]
    fn short_values_are_fully_masked() {
        assert_eq!(mask("shortkey"), "***");
    }

    #[test]
    fn placeholder_values_are_rejected() {
        std::env::set_var("FJR_CLI_TEST_PLACEHOLDER", "your_key_here");
        assert!(env_value("FJR_CLI_TEST_PLACEHOLDER").is_none());
        std::env::set_var("FJR_CLI_TEST_PLACEHOLDER", "gm-real-key-123");
        assert_eq!(
            env_value("FJR_CLI_TEST_PLACEHOLDER").as_deref(),
            Some("gm-real-key-123")
        );
    }
}
