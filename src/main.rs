mod batch;
mod browser;
mod catalog;
mod config;
mod db;
mod matching;
mod plan;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{Datelike, Local, NaiveDate};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use catalog::driver::{RunRequest, RunSummary, StopReason, Traversal};
use catalog::{ClassRecord, DateWindow, Direction, RecordSink};
use config::TraversalConfig;

#[derive(Parser)]
#[command(name = "ride_catalog", about = "Cycling class catalog scraper and matcher")]
struct Cli {
    /// SQLite database path
    #[arg(long, global = true, default_value = config::DEFAULT_DB_PATH)]
    db: PathBuf,
    /// TOML file overriding traversal tunables
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape classes within a date range into the database
    Scrape {
        /// Earliest air date to keep (YYYY-MM-DD)
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Latest air date to keep (YYYY-MM-DD)
        #[arg(long)]
        end_date: Option<NaiveDate>,
        /// Max classes to extract (default: 10 without dates, unlimited with)
        #[arg(short = 'n', long)]
        max: Option<usize>,
        /// Walk the catalog oldest first
        #[arg(long)]
        oldest_first: bool,
        /// Run Chrome without a visible window
        #[arg(long)]
        headless: bool,
    },
    /// Scrape month by month with a fresh browser per month
    Batch {
        /// First month (YYYY-MM)
        #[arg(long)]
        from: String,
        /// Last month (YYYY-MM)
        #[arg(long)]
        to: String,
        /// Run Chrome without a visible window
        #[arg(long)]
        headless: bool,
    },
    /// Show database statistics
    Stats,
    /// Pick random cached classes for a template slot
    Match {
        /// Template type, e.g. "Power Zone Endurance"
        #[arg(short = 't', long = "type")]
        template_type: String,
        /// Target duration in minutes (0: any)
        #[arg(short, long, default_value = "0")]
        duration: u32,
        /// Minimum difficulty rating
        #[arg(long, default_value = "0")]
        min: f64,
        /// Maximum difficulty rating (0: any)
        #[arg(long, default_value = "0")]
        max: f64,
        /// Preferred instructors, comma separated
        #[arg(short, long, value_delimiter = ',')]
        instructors: Vec<String>,
        /// Restrict to a stored class type
        #[arg(long)]
        class_type: Option<String>,
        /// Widen the rating window before dropping it
        #[arg(long)]
        fallback: bool,
        /// Number of distinct classes to draw
        #[arg(short = 'n', long, default_value = "1")]
        count: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Build a dated training plan from a template CSV
    Plan {
        /// Template CSV (Week, Phase, Day, Type, Duration_Min, Intensity_Min, Intensity_Max, ...)
        #[arg(long)]
        template: PathBuf,
        /// Date of week 1 day 1 (default: next Monday)
        #[arg(long)]
        start_date: Option<NaiveDate>,
        /// Widen the rating window before dropping it
        #[arg(long)]
        fallback: bool,
        /// Directory the plan CSV is written to
        #[arg(long, default_value = "output")]
        out_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();
    let cfg = TraversalConfig::load(cli.config.as_deref())?;
    let command = invocation(&cli.db, cli.config.as_deref());

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received; finishing the current class");
                flag.store(true, Ordering::Relaxed);
            }
        });
    }

    let result = match cli.command {
        Commands::Scrape { start_date, end_date, max, oldest_first, headless } => {
            let request = build_request(&cfg, start_date, end_date, max, oldest_first)?;
            let db_path = cli.db.clone();
            let flag = interrupt.clone();
            let summary = tokio::task::spawn_blocking(move || {
                scrape_once(&db_path, &cfg, &request, headless, &flag)
            })
            .await
            .context("Scrape task panicked")??;
            summary.print(&command);
            if let StopReason::Aborted(e) = &summary.stop {
                bail!("Run aborted: {}", e);
            }
            Ok(())
        }
        Commands::Batch { from, to, headless } => {
            let ranges = batch::month_ranges(batch::parse_month(&from)?, batch::parse_month(&to)?);
            if ranges.is_empty() {
                bail!("--from {} is after --to {}", from, to);
            }
            println!("Batch: {} months from {} to {}", ranges.len(), from, to);
            let db_path = cli.db.clone();
            let flag = interrupt.clone();
            let report = tokio::task::spawn_blocking(move || {
                batch::run_months(&ranges, |start, end| {
                    let request = build_request(&cfg, Some(start), Some(end), None, false)?;
                    scrape_once(&db_path, &cfg, &request, headless, &flag)
                })
            })
            .await
            .context("Batch task panicked")?;
            report.print(&command);
            if !report.failed.is_empty() {
                bail!("{} months failed", report.failed.len());
            }
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Classes:       {}", s.total);
            println!("Rated:         {}", s.rated);
            println!("With duration: {}", s.with_duration);
            println!(
                "Air dates:     {} to {}",
                s.earliest.as_deref().unwrap_or("-"),
                s.latest.as_deref().unwrap_or("-")
            );
            if !s.by_type.is_empty() {
                println!("\n--- By class type ---");
                for (class_type, count) in &s.by_type {
                    println!("  {:<24} {:>6}", truncate(class_type, 24), count);
                }
            }
            Ok(())
        }
        Commands::Match {
            template_type,
            duration,
            min,
            max,
            instructors,
            class_type,
            fallback,
            count,
            json,
        } => {
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            let query = matching::MatchQuery {
                template_type,
                class_type,
                duration,
                intensity_min: min,
                intensity_max: max,
                instructors: instructors
                    .into_iter()
                    .map(|i| i.trim().to_string())
                    .filter(|i| !i.is_empty())
                    .collect(),
                allow_fallback: fallback,
                ..Default::default()
            };
            let picks = matching::find_candidates(&conn, &query, count)?;
            if json {
                let rows: Vec<_> = picks.iter().map(|(row, _)| row).collect();
                println!("{}", serde_json::to_string_pretty(&rows)?);
                return Ok(());
            }
            if picks.is_empty() {
                println!("No rated classes match {:?}.", query.template_type);
                return Ok(());
            }

            println!(
                "{:>3} | {:<40} | {:<20} | {:>4} | {:>6} | {:<10} | {:<14}",
                "#", "Title", "Instructor", "Min", "Rating", "Aired", "Matched by"
            );
            println!("{}", "-".repeat(112));
            for (i, (r, layer)) in picks.iter().enumerate() {
                println!(
                    "{:>3} | {:<40} | {:<20} | {:>4} | {:>6} | {:<10} | {:<14}",
                    i + 1,
                    truncate(&r.title, 40),
                    truncate(&r.instructor, 20),
                    r.duration_minutes.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                    r.difficulty_rating.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".into()),
                    r.original_air_time,
                    layer
                );
            }
            println!();
            for (r, _) in &picks {
                println!("  {}", r.url);
            }
            Ok(())
        }
        Commands::Plan { template, start_date, fallback, out_dir } => {
            let rows = plan::read_template(&template)?;
            let start = start_date.unwrap_or_else(|| plan::next_monday(Local::now().date_naive()));
            let conn = db::connect(&cli.db)?;
            db::init_schema(&conn)?;
            info!("Planning {} template rows from {}", rows.len(), start);
            let outcome = plan::build_plan(&conn, &rows, start, fallback, &cfg.plan)?;

            std::fs::create_dir_all(&out_dir)
                .with_context(|| format!("Failed to create {}", out_dir.display()))?;
            let path = plan::output_path(&template, &out_dir, Local::now().naive_local());
            let file = std::fs::File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            plan::write_plan(file, &outcome.rows)?;
            outcome.print(&path);
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

/// Resolve direction and record cap from the command line.
fn build_request(
    cfg: &TraversalConfig,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    max: Option<usize>,
    oldest_first: bool,
) -> Result<RunRequest> {
    if let (Some(s), Some(e)) = (start_date, end_date) {
        if s > e {
            bail!("--start-date {} is after --end-date {}", s, e);
        }
    }
    let window = DateWindow::new(start_date, end_date);

    let auto_oldest = match (start_date, cfg.auto_oldest_first_before_year) {
        (Some(s), Some(year)) => s.year() < year,
        _ => false,
    };
    let direction = if oldest_first || auto_oldest {
        if auto_oldest && !oldest_first {
            info!("Start date before {}; walking oldest first", cfg.auto_oldest_first_before_year.unwrap_or_default());
        }
        Direction::OldestFirst
    } else {
        Direction::NewestFirst
    };

    let max_entries = match max {
        Some(n) => Some(n),
        None if window.is_bounded() => None,
        None => Some(cfg.default_max_entries),
    };

    Ok(RunRequest {
        window,
        direction,
        max_entries,
        class_type: cfg.class_type.clone(),
        today: Local::now().date_naive(),
    })
}

/// One full session: open the store, launch and log in, traverse.
fn scrape_once(
    db_path: &Path,
    cfg: &TraversalConfig,
    request: &RunRequest,
    headless: bool,
    interrupt: &AtomicBool,
) -> Result<RunSummary> {
    let conn = db::connect(db_path)?;
    db::init_schema(&conn)?;
    let mut writer = db::ClassWriter::new(&conn)?;

    let email = std::env::var("PELOTON_EMAIL").context("PELOTON_EMAIL is not set")?;
    let password = std::env::var("PELOTON_PASSWORD").context("PELOTON_PASSWORD is not set")?;

    let mut host = browser::ChromeHost::launch(cfg, headless)?;
    host.login(&email, &password)?;
    host.open_catalog(&request.class_type, request.direction)?;

    let pb = match request.max_entries {
        Some(n) => ProgressBar::new(n as u64),
        None => ProgressBar::new_spinner(),
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] {pos} classes {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(200));

    let mut sink = |record: &ClassRecord| -> Result<()> {
        writer.persist(record)?;
        pb.inc(1);
        pb.set_message(truncate(&record.title, 40));
        Ok(())
    };
    let summary = Traversal::new(&mut host, &mut sink, cfg, request, interrupt).run();
    pb.finish_and_clear();
    Ok(summary)
}

/// Program name plus the global options, so printed follow-up commands hit
/// the same store with the same tunables.
fn invocation(db: &Path, config: Option<&Path>) -> String {
    let mut parts = vec!["ride_catalog".to_string(), "--db".to_string(), shell_arg(db)];
    if let Some(path) = config {
        parts.push("--config".to_string());
        parts.push(shell_arg(path));
    }
    parts.join(" ")
}

fn shell_arg(path: &Path) -> String {
    let s = path.display().to_string();
    if s.contains(char::is_whitespace) {
        format!("'{}'", s)
    } else {
        s
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
