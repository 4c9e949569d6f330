use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use bolag_core::models::{CompanyStatus, Filters, JobStatus, JobType};
use bolag_core::{CompanyListOptions, EngineConfig, ProxyConfig, ScrapeError};
use bolag_scraper::controller::{JobController, JobView};
use bolag_scraper::migrator::{MigrateOptions, SqliteProductionStore};
use bolag_scraper::UPSTREAM_BASE_URL;

/// **Allabolag Scraper CLI**
///
/// Operator surface for the three-stage scraping pipeline: preview a filter
/// selection, run and control jobs, inspect staged rows, validate, and
/// migrate approved financials to the production store.
#[derive(Parser)]
#[command(name = "bolag")]
#[command(about = "Swedish corporate financials scraping pipeline")]
#[command(version)]
struct Cli {
    /// Directory holding the per-job staging files
    #[arg(long, default_value = "staging")]
    staging_dir: PathBuf,

    /// Path of the SQLite production store used by migrate
    #[arg(long, default_value = "production.db")]
    production_db: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate how many companies a filter selection matches
    Preview {
        /// Lower revenue bound in mSEK
        #[arg(long)]
        revenue_from: i64,

        /// Upper revenue bound in mSEK
        #[arg(long)]
        revenue_to: i64,

        /// Lower profit bound in mSEK
        #[arg(long)]
        profit_from: Option<i64>,

        /// Upper profit bound in mSEK
        #[arg(long)]
        profit_to: Option<i64>,
    },

    /// Start a job and follow it to completion
    Start {
        #[arg(long)]
        revenue_from: i64,

        #[arg(long)]
        revenue_to: i64,

        #[arg(long)]
        profit_from: Option<i64>,

        #[arg(long)]
        profit_to: Option<i64>,

        /// segmentation | full_pipeline
        #[arg(long, default_value = "full_pipeline")]
        mode: String,

        /// Return immediately instead of following progress
        #[arg(long)]
        detach: bool,
    },

    /// Show job status and per-stage progress
    Status {
        job_id: Uuid,
    },

    /// Pause a running job (resumable)
    Pause {
        job_id: Uuid,
    },

    /// Resume a paused or errored job and follow it
    Resume {
        job_id: Uuid,

        #[arg(long)]
        detach: bool,
    },

    /// Stop a job permanently
    Stop {
        job_id: Uuid,
    },

    /// List staged companies
    Companies {
        job_id: Uuid,

        /// pending | id_resolved | financials_fetched | error
        #[arg(long)]
        status: Option<String>,

        /// Substring match on name or orgnr
        #[arg(long)]
        search: Option<String>,

        #[arg(long, default_value = "1")]
        page: u32,

        #[arg(long, default_value = "50")]
        limit: u32,
    },

    /// List failed companies with derived reasons
    Errors {
        job_id: Uuid,
    },

    /// Validate staged financial records
    Validate {
        job_id: Uuid,
    },

    /// Promote validated records to the production store
    Migrate {
        job_id: Uuid,

        /// Also migrate records that validated with warnings
        #[arg(long)]
        include_warnings: bool,

        /// Never overwrite an existing production row
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        skip_duplicates: bool,
    },

    /// Show proxy gateway counters and cost estimate
    Stats,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "bolag=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {:#}", err);
            let code = err
                .downcast_ref::<ScrapeError>()
                .map(ScrapeError::exit_code)
                .unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = EngineConfig::from_env();
    config.staging_dir = cli.staging_dir.clone();
    let production = Arc::new(SqliteProductionStore::open(&cli.production_db)?);
    let controller = JobController::new(
        config,
        ProxyConfig::from_env(),
        UPSTREAM_BASE_URL,
        production,
    );

    match cli.command {
        Commands::Preview {
            revenue_from,
            revenue_to,
            profit_from,
            profit_to,
        } => {
            let filters = Filters::from_msek(revenue_from, revenue_to, profit_from, profit_to);
            let preview = controller.preview_segmentation(&filters).await?;
            print_json(&preview)?;
            Ok(0)
        }

        Commands::Start {
            revenue_from,
            revenue_to,
            profit_from,
            profit_to,
            mode,
            detach,
        } => {
            let filters = Filters::from_msek(revenue_from, revenue_to, profit_from, profit_to);
            let job_type = match mode.as_str() {
                "segmentation" => JobType::Segmentation,
                "full_pipeline" => JobType::FullPipeline,
                other => {
                    return Err(ScrapeError::configuration(format!(
                        "unsupported mode {} (use segmentation or full_pipeline)",
                        other
                    ))
                    .into())
                }
            };
            let job_id = controller.start_job(filters, job_type).await?;
            println!("{}", job_id);
            if detach {
                return Ok(0);
            }
            follow(&controller, job_id).await
        }

        Commands::Status { job_id } => {
            let view = controller.get_job(job_id).await?;
            print_json(&view)?;
            Ok(0)
        }

        Commands::Pause { job_id } => {
            controller.pause(job_id).await?;
            Ok(0)
        }

        Commands::Resume { job_id, detach } => {
            let info = controller.resume(job_id).await?;
            print_json(&info)?;
            if detach {
                return Ok(0);
            }
            follow(&controller, job_id).await
        }

        Commands::Stop { job_id } => {
            controller.stop(job_id).await?;
            Ok(5)
        }

        Commands::Companies {
            job_id,
            status,
            search,
            page,
            limit,
        } => {
            let options = CompanyListOptions {
                status: status.map(CompanyStatus::from),
                search,
                page,
                limit,
            };
            let companies = controller.list_companies(job_id, &options).await?;
            print_json(&companies)?;
            Ok(0)
        }

        Commands::Errors { job_id } => {
            let errors = controller.list_errors(job_id).await?;
            print_json(&errors)?;
            Ok(0)
        }

        Commands::Validate { job_id } => {
            let summary = controller.validate_job(job_id).await?;
            print_json(&summary)?;
            Ok(0)
        }

        Commands::Migrate {
            job_id,
            include_warnings,
            skip_duplicates,
        } => {
            let summary = controller
                .migrate_job(
                    job_id,
                    MigrateOptions {
                        include_warnings,
                        skip_duplicates,
                    },
                )
                .await?;
            print_json(&summary)?;
            Ok(0)
        }

        Commands::Stats => {
            print_json(&controller.gateway_stats())?;
            Ok(0)
        }
    }
}

/// Poll the job until it reaches a terminal or waiting state.
async fn follow(controller: &JobController, job_id: Uuid) -> Result<i32> {
    loop {
        tokio::time::sleep(Duration::from_secs(2)).await;
        let view = controller.get_job(job_id).await?;
        info!(
            status = %view.status,
            stage = %view.stage,
            processed = view.processed_count,
            total = view.total_companies,
            errors = view.error_count,
            "progress"
        );
        match view.status {
            JobStatus::Done => {
                print_json(&view)?;
                return Ok(0);
            }
            JobStatus::Stopped => {
                print_json(&view)?;
                return Ok(5);
            }
            JobStatus::Paused => {
                print_json(&view)?;
                return Ok(0);
            }
            JobStatus::Error => {
                print_json(&view)?;
                return Ok(exit_code_for_failed_job(&view));
            }
            JobStatus::Pending | JobStatus::Running => {}
        }
    }
}

/// Map a failed job's message back onto the documented exit codes.
fn exit_code_for_failed_job(view: &JobView) -> i32 {
    match view.last_error.as_deref() {
        Some(msg) if msg.starts_with("Proxy") => 2,
        Some(msg) if msg.starts_with("Parse error") => 3,
        Some(msg) if msg.starts_with("Configuration") => 1,
        _ => 1,
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
