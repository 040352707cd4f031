use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

mod config;
mod db;
mod flags;
mod input;
mod logging;
mod models;
mod report;

use config::FlagConfig;
use models::Measurement;
use report::ExportFormat;

#[derive(Parser)]
#[command(name = "athlete-flags")]
#[command(about = "Flags athletes for inactivity, decline, team-norm outliers and asymmetry", long_about = None)]
struct Cli {
    /// TOML file with flag thresholds (defaults to $FLAG_CONFIG, then built-ins)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "info")]
    log_level: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed measurements
    Seed,
    /// Import measurements from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Run the flag rules and export one row per flag
    Flag {
        /// Read measurements from a cleaned CSV instead of the database
        #[arg(long)]
        from_csv: Option<PathBuf>,
        #[arg(long)]
        team: Option<String>,
        /// Evaluate as of this date (midnight UTC) instead of now
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long, default_value = "flagged_athletes.csv")]
        out: PathBuf,
        #[arg(long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,
    },
    /// Generate a markdown report
    Report {
        #[arg(long)]
        from_csv: Option<PathBuf>,
        #[arg(long)]
        team: Option<String>,
        #[arg(long)]
        as_of: Option<NaiveDate>,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
    /// Summarise how many athletes per team have enough tests
    Sufficiency {
        #[arg(long)]
        from_csv: Option<PathBuf>,
        #[arg(long)]
        team: Option<String>,
    },
}

async fn connect() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Reads from `from_csv` when given, otherwise from Postgres. The pool is
/// closed as soon as the rows are in memory.
async fn load_measurements(
    from_csv: Option<&Path>,
    team: Option<&str>,
    config: &FlagConfig,
) -> anyhow::Result<Vec<Measurement>> {
    let mut measurements = match from_csv {
        Some(path) => input::load_csv(path)?,
        None => {
            let pool = connect().await?;
            let rows = db::fetch_measurements(&pool, &config.selected_metrics, team).await;
            pool.close().await;
            rows?
        }
    };

    if let Some(team) = team {
        measurements.retain(|m| m.team == team);
    }
    measurements.retain(|m| config.is_selected(&m.metric));
    info!(rows = measurements.len(), "measurements ready");
    Ok(measurements)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    logging::init_logger(&cli.log_level);
    let config = FlagConfig::load(cli.config.as_deref())?;

    match cli.command {
        Commands::InitDb => {
            let pool = connect().await?;
            db::init_db(&pool).await?;
            pool.close().await;
            println!("Schema ready.");
        }
        Commands::Seed => {
            let pool = connect().await?;
            let inserted = db::seed(&pool).await?;
            pool.close().await;
            println!("Seed data inserted ({inserted} new measurements).");
        }
        Commands::Import { csv } => {
            let pool = connect().await?;
            let inserted = db::import_csv(&pool, &csv).await?;
            pool.close().await;
            println!("Inserted {inserted} measurements from {}.", csv.display());
        }
        Commands::Flag {
            from_csv,
            team,
            as_of,
            out,
            format,
        } => {
            let measurements =
                load_measurements(from_csv.as_deref(), team.as_deref(), &config).await?;
            let now = flags::reference_time(as_of);
            let flagged = flags::run_flags(&measurements, now, &config);
            report::export_flags(&out, &flagged, format)?;

            if flagged.is_empty() {
                println!("No athletes flagged.");
            } else {
                for summary in report::summarize_by_type(&flagged) {
                    println!(
                        "- {}: {} flags across {} athletes",
                        summary.flag_type, summary.count, summary.athlete_count
                    );
                }
            }
            println!("Flags written to {}.", out.display());
        }
        Commands::Report {
            from_csv,
            team,
            as_of,
            out,
        } => {
            let measurements =
                load_measurements(from_csv.as_deref(), team.as_deref(), &config).await?;
            let now = flags::reference_time(as_of);
            let flagged = flags::run_flags(&measurements, now, &config);
            let report =
                report::build_report(now, &measurements, &flagged, config.min_measurements);
            std::fs::write(&out, report)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("Report written to {}.", out.display());
        }
        Commands::Sufficiency { from_csv, team } => {
            let measurements =
                load_measurements(from_csv.as_deref(), team.as_deref(), &config).await?;
            print!(
                "{}",
                report::build_sufficiency(&measurements, config.min_measurements)
            );
        }
    }

    Ok(())
}
