mod browser;
mod config;
mod extract;
mod login;
mod store;
mod walker;

use std::time::Instant;

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::warn;

use crate::browser::Session;
use crate::config::Config;
use crate::login::Authenticator;
use crate::store::RunStore;

#[derive(Parser)]
#[command(name = "boss_scraper", about = "BOSS直聘 interested-jobs scraper")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in via the QR challenge and scrape every interested-jobs page
    Run {
        /// Run Chrome headless
        #[arg(long)]
        headless: bool,
        /// Skip the master merge after the walk
        #[arg(long)]
        no_merge: bool,
    },
    /// Merge a run table into the master all.csv
    Merge {
        /// Run CSV file name (default: newest in the data dir)
        #[arg(short, long)]
        file: Option<String>,
    },
    /// Convert a run table to JSON
    Convert {
        /// Run CSV file name
        file: String,
    },
    /// List saved tables with row counts
    Files,
    /// Print a saved table
    Show {
        file: String,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
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
    let cfg = Config::load()?;

    let result = match cli.command {
        Commands::Run { headless, no_merge } => run_scrape(&cfg, headless, no_merge).await,
        Commands::Merge { file } => {
            let run_file = match file {
                Some(f) => f,
                None => store::latest_run_file(&cfg.data_dir)?.ok_or_else(|| {
                    anyhow!("No run tables found in {}", cfg.data_dir.display())
                })?,
            };
            let run = RunStore::open(&cfg.data_dir, &run_file)?;
            if let Some(report) = run.merge_into_master()? {
                println!(
                    "Merged {}: {} rows before dedup, {} after, {} new.",
                    run_file, report.total_before, report.total_after, report.net_new
                );
            }
            Ok(())
        }
        Commands::Convert { file } => {
            let run = RunStore::open(&cfg.data_dir, &file)?;
            if let Some(path) = run.convert_to_json()? {
                println!("Wrote {}", path.display());
            }
            Ok(())
        }
        Commands::Files => {
            let tables = store::list_tables(&cfg.data_dir)?;
            if tables.is_empty() {
                println!("No saved tables in {}.", cfg.data_dir.display());
            } else {
                println!("{:<44} {:>8}", "File", "Rows");
                println!("{}", "-".repeat(53));
                for (name, rows) in &tables {
                    if name.ends_with(".csv") {
                        println!("{:<44} {:>8}", name, rows);
                    } else {
                        println!("{:<44} {:>8}", name, "-");
                    }
                }
            }
            Ok(())
        }
        Commands::Show { file, limit } => show_table(&cfg, &file, limit),
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {:.1}s", elapsed.as_secs_f64());
    }

    result
}

/// Full pipeline: authenticate, walk the listing, then convert and merge.
/// The browser is always shut down, even when authentication fails; a run
/// table written before an abort survives for a later manual merge.
async fn run_scrape(cfg: &Config, headless: bool, no_merge: bool) -> anyhow::Result<()> {
    let store = RunStore::create(&cfg.data_dir)?;
    println!("Writing run data to {}", store.csv_path().display());

    let (session, page) = Session::launch(headless).await?;
    let outcome = scrape_session(cfg, page.as_ref(), &store).await;
    if let Err(e) = session.close().await {
        warn!(error = %e, "browser shutdown failed");
    }
    let captured = outcome?;

    if captured == 0 {
        println!("No jobs captured this run.");
        return Ok(());
    }
    store.convert_to_json()?;
    if no_merge {
        println!("Captured {} jobs this run (merge skipped).", captured);
        return Ok(());
    }
    match store.merge_into_master()? {
        Some(report) => println!(
            "Captured {} jobs this run; master has {} listings ({} new).",
            captured, report.total_after, report.net_new
        ),
        None => println!("Captured {} jobs this run; master unchanged.", captured),
    }
    Ok(())
}

async fn scrape_session(
    cfg: &Config,
    page: &dyn browser::Page,
    store: &RunStore,
) -> anyhow::Result<usize> {
    Authenticator::new(cfg).login(page).await?;
    walker::walk(page, store, cfg).await
}

fn show_table(cfg: &Config, file: &str, limit: usize) -> anyhow::Result<()> {
    let path = cfg.data_dir.join(file);
    if file.ends_with(".json") {
        println!("{}", std::fs::read_to_string(&path)?);
        return Ok(());
    }

    let rows = store::read_table(&path)?;
    if rows.is_empty() {
        println!("{} is empty.", file);
        return Ok(());
    }

    println!(
        "{:>3} | {:<28} | {:<18} | {:<10} | {:<8} | {:<19}",
        "#", "Title", "Company", "Salary", "City", "Captured"
    );
    println!("{}", "-".repeat(100));
    for (i, r) in rows.iter().take(limit).enumerate() {
        println!(
            "{:>3} | {:<28} | {:<18} | {:<10} | {:<8} | {:<19}",
            i + 1,
            truncate(&r.title, 28),
            truncate(&r.company, 18),
            truncate(&r.salary, 10),
            truncate(&r.location, 8),
            r.captured_at
        );
    }
    println!("\n{} rows ({} shown)", rows.len(), rows.len().min(limit));
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
