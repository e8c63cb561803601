use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod cache;
mod config;
mod coordinator;
mod db;
mod diff;
mod error;
mod grading;
#[cfg(test)]
mod memory;
mod models;
mod pool;
mod segments;
mod store;
mod sync;
mod thresholds;

use crate::cache::GradeCache;
use crate::coordinator::{AdjustmentCoordinator, Assignment};
use crate::models::{
    AdjustmentRequest, AdjustmentResult, CityAdjustment, ExamScope, Grade, PartialCutoffs,
    ThresholdKey,
};
use crate::pool::WorkerPool;
use crate::sync::FactStoreSyncer;

#[derive(Parser)]
#[command(name = "score-banding")]
#[command(
    about = "Percentile grade cutoffs with previewed, audited operator adjustments",
    long_about = None
)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct ScopeArgs {
    #[arg(long, default_value = "2026-spring")]
    exam_plan: String,
    #[arg(long, default_value = "math")]
    subject: String,
}

impl ScopeArgs {
    fn scope(&self) -> ExamScope {
        ExamScope::new(self.exam_plan.clone(), self.subject.clone())
    }
}

#[derive(Args)]
struct OperatorArgs {
    #[arg(long, default_value = "cli")]
    operator: String,
    #[arg(long, default_value = "manual adjustment")]
    reason: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load a synthetic score population
    Seed {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Compute and persist cutoffs for every key that has none stored yet
    Assign {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Show the effect of overriding cutoffs without saving anything
    Preview {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        city: String,
        /// Cutoff override such as `A=141`; repeat for several grades
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(Grade, i32)>,
    },
    /// Persist overridden cutoffs for one city
    Confirm {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long)]
        city: String,
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(Grade, i32)>,
        #[command(flatten)]
        operator: OperatorArgs,
    },
    /// Persist overridden cutoffs for several cities independently
    BatchConfirm {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Per-city overrides such as `Northgate:A=140,C=80`; repeat per city
        #[arg(long = "adjust", required = true)]
        adjustments: Vec<String>,
        #[command(flatten)]
        operator: OperatorArgs,
    },
    /// Relabel stored student grades from the confirmed cutoffs
    Sync {
        #[command(flatten)]
        scope: ScopeArgs,
        /// Limit to one city; all cities otherwise
        #[arg(long)]
        city: Option<String>,
    },
    /// Print the score-segment table
    Segments {
        #[command(flatten)]
        scope: ScopeArgs,
        /// One city; the whole population otherwise
        #[arg(long)]
        city: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;

    let store = Arc::new(db::PgStore::new(pool.clone()));
    let workers = Arc::new(WorkerPool::new(config.confirm.workers));
    info!(workers = workers.size(), "Worker pool ready");
    let coordinator = Arc::new(AdjustmentCoordinator::new(
        store.clone(),
        store.clone(),
        GradeCache::from_config(&config.cache),
        workers.clone(),
        &config,
    )?);

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed { scope } => {
            let inserted = db::seed(&pool, &scope.scope()).await?;
            println!("Seeded {inserted} students.");
        }
        Commands::Assign { scope } => {
            let assignments = coordinator.assign_initial(&scope.scope()).await?;
            for assignment in assignments {
                match assignment.outcome {
                    Ok(Assignment::Assigned(calculation)) => println!(
                        "- {}: A≥{} B≥{} C≥{} D≥{} counts {:?}{}",
                        assignment.key,
                        calculation.cutoffs.a,
                        calculation.cutoffs.b,
                        calculation.cutoffs.c,
                        calculation.cutoffs.d,
                        calculation.counts.as_array(),
                        if calculation.e_floor_applied { " (E floor applied)" } else { "" }
                    ),
                    Ok(Assignment::AlreadyAssigned(cutoffs)) => println!(
                        "- {}: already assigned (A≥{} B≥{} C≥{} D≥{}), left unchanged",
                        assignment.key,
                        show_cutoff(cutoffs.a),
                        show_cutoff(cutoffs.b),
                        show_cutoff(cutoffs.c),
                        show_cutoff(cutoffs.d),
                    ),
                    Ok(Assignment::NoScores) => println!("- {}: no data", assignment.key),
                    Err(e) => println!("- {}: failed: {e}", assignment.key),
                }
            }
        }
        Commands::Preview {
            scope,
            city,
            overrides,
        } => {
            let request = AdjustmentRequest {
                exam_plan: scope.exam_plan,
                subject: scope.subject,
                cities: vec![CityAdjustment {
                    city,
                    overrides: PartialCutoffs::from_pairs(&overrides)?,
                }],
                operator: "preview".to_string(),
                reason: String::new(),
            };
            let result = coordinator.preview_adjustment(&request).await?;
            print_result(&result);
        }
        Commands::Confirm {
            scope,
            city,
            overrides,
            operator,
        } => {
            let request = AdjustmentRequest {
                exam_plan: scope.exam_plan,
                subject: scope.subject,
                cities: vec![CityAdjustment {
                    city,
                    overrides: PartialCutoffs::from_pairs(&overrides)?,
                }],
                operator: operator.operator,
                reason: operator.reason,
            };
            let outcome = coordinator.confirm_adjustment(&request).await?;
            print_result(&outcome.result);
            if outcome.persisted {
                println!(
                    "Confirmed ({:?}): {} students change grade, {} ms.",
                    outcome.state,
                    outcome.affected_students,
                    outcome.elapsed.as_millis()
                );
            } else {
                println!("Nothing persisted.");
            }
        }
        Commands::BatchConfirm {
            scope,
            adjustments,
            operator,
        } => {
            let cities = adjustments
                .iter()
                .map(|raw| parse_city_adjustment(raw))
                .collect::<anyhow::Result<Vec<_>>>()?;
            let request = AdjustmentRequest {
                exam_plan: scope.exam_plan,
                subject: scope.subject,
                cities,
                operator: operator.operator,
                reason: operator.reason,
            };
            let outcome = coordinator.batch_confirm_adjustment(&request).await?;
            for city in &outcome.cities {
                match &city.outcome {
                    Ok(confirmed) if confirmed.persisted => println!(
                        "- {}: confirmed, {} students change grade",
                        city.city, confirmed.affected_students
                    ),
                    Ok(confirmed) => {
                        println!("- {}: rejected ({})", city.city, confirmed.result.warning())
                    }
                    Err(e) => println!("- {}: failed: {e}", city.city),
                }
            }
            println!(
                "{} succeeded, {} failed in {} ms.",
                outcome.success_count,
                outcome.failure_count,
                outcome.elapsed.as_millis()
            );
        }
        Commands::Sync { scope, city } => {
            let syncer =
                FactStoreSyncer::new(store.clone(), store.clone(), config.sync.chunk_size);
            let report = syncer
                .sync_grades(&scope.scope(), city.as_deref(), &CancellationToken::new())
                .await?;
            for city in &report.cities {
                match &city.result {
                    Ok(updated) => println!("- {}: {updated} grades updated", city.city),
                    Err(e) => println!("- {}: failed: {e}", city.city),
                }
            }
            println!("Synced {} grades.", report.synced_count);
        }
        Commands::Segments { scope, city } => {
            let scope = scope.scope();
            let key: ThresholdKey = match city.as_deref() {
                Some(city) => scope.city(city),
                None => scope.all_cities(),
            };
            match coordinator.segment_table(&key).await? {
                Some(table) => {
                    println!("Score segments for {key} ({} students):", table.total);
                    for row in table.rows.iter().filter(|row| row.count > 0) {
                        println!(
                            "{:>5} {:>6} {:>7} {:>6}% {}",
                            row.score,
                            row.count,
                            row.cumulative_count,
                            row.cumulative_percentage,
                            row.grade.map_or("-", Grade::as_str)
                        );
                    }
                }
                None => println!("No segment table stored for {key}; run `assign` first."),
            }
        }
    }

    workers.shutdown();
    info!("Done");
    Ok(())
}

fn print_result(result: &AdjustmentResult) {
    match result {
        AdjustmentResult::Previewed(preview) => {
            let cutoffs = preview.adjusted_cutoffs;
            println!(
                "{}: A≥{} B≥{} C≥{} D≥{} [{}]",
                preview.key, cutoffs.a, cutoffs.b, cutoffs.c, cutoffs.d, preview.warning
            );
            if let Some(original) = preview.original {
                println!("  before {:?}", original.as_array());
            }
            println!("  after  {:?}", preview.adjusted.as_array());
            println!(
                "  {} up, {} down, {} unchanged, {} newly graded ({:.1}% swing)",
                preview.diff.upgraded,
                preview.diff.downgraded,
                preview.diff.unchanged,
                preview.diff.newly_graded,
                preview.diff.swing * 100.0
            );
        }
        AdjustmentResult::Rejected(rejection) => {
            println!("{}: rejected [{}]: {}", result.key(), result.warning(), rejection.violation);
        }
    }
}

fn show_cutoff(cutoff: Option<i32>) -> String {
    cutoff.map_or_else(|| "-".to_string(), |cutoff| cutoff.to_string())
}

/// Parses `A=141`.
fn parse_override(raw: &str) -> Result<(Grade, i32), String> {
    let (grade, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected GRADE=SCORE, got '{raw}'"))?;
    let grade = Grade::parse(grade.trim()).ok_or_else(|| format!("unknown grade '{grade}'"))?;
    let value = value
        .trim()
        .parse()
        .map_err(|_| format!("invalid cutoff '{value}'"))?;
    Ok((grade, value))
}

/// Parses `Northgate:A=140,C=80`.
fn parse_city_adjustment(raw: &str) -> anyhow::Result<CityAdjustment> {
    let (city, pairs) = raw
        .split_once(':')
        .with_context(|| format!("expected CITY:GRADE=SCORE,..., got '{raw}'"))?;
    let pairs = pairs
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| parse_override(pair).map_err(anyhow::Error::msg))
        .collect::<anyhow::Result<Vec<_>>>()?;
    Ok(CityAdjustment {
        city: city.trim().to_string(),
        overrides: PartialCutoffs::from_pairs(&pairs).with_context(|| format!("in '{raw}'"))?,
    })
}
