use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use orgrec_core::EmployeeId;
use orgrec_storage::PgRosterStore;
use orgrec_sync::{
    open_store, report_history_markdown, run_reconcile_once_from_env, HierarchyService,
    HierarchyStatus, ReconConfig, ReconPipeline,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "orgrec")]
#[command(about = "Reconcile a staff list against the roster and maintain the reporting hierarchy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and write its report.
    Reconcile {
        /// Feed path or http(s) URL; overrides ORGREC_FEED.
        #[arg(long)]
        feed: Option<String>,
        /// Write department/job title differences back to the roster.
        #[arg(long)]
        apply: bool,
    },
    /// Recompute the transitive reporting closure.
    RebuildHierarchy,
    /// Set or clear an employee's direct supervisor.
    Assign {
        employee: i64,
        #[arg(long)]
        supervisor: Option<i64>,
    },
    /// List everyone above an employee, nearest first.
    Ancestors { employee: i64 },
    /// Summarize recent reconciliation runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    Migrate,
    /// Run reconciliation on ORGREC_SYNC_CRON until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "orgrec=info,orgrec_cli=info,orgrec_sync=info,\
                 orgrec_storage=info,orgrec_adapters=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Reconcile {
        feed: None,
        apply: false,
    });

    match command {
        Commands::Reconcile { feed, apply } => {
            let summary = run_reconcile_once_from_env(feed, apply).await?;
            println!(
                "reconcile complete: run_id={} rows={} matched={} missing={} \
                 ambiguous={} changed={} issues={} report={}",
                summary.run_id,
                summary.summary.total_rows,
                summary.summary.matched,
                summary.summary.missing,
                summary.summary.ambiguous,
                summary.summary.changed_rows,
                summary.summary.issues,
                summary.report_location
            );
            if let Some(applied) = summary.applied_updates {
                println!("applied {applied} field updates");
            }
            match &summary.hierarchy {
                HierarchyStatus::Rebuilt { entries, .. } => {
                    println!("hierarchy closure rebuilt: {entries} entries")
                }
                HierarchyStatus::Failed { reason } => {
                    eprintln!("hierarchy closure NOT rebuilt: {reason}")
                }
            }
        }
        Commands::RebuildHierarchy => {
            let service = hierarchy_from_env().await?;
            let swap = service.rebuild().await.context("rebuilding hierarchy")?;
            println!(
                "hierarchy rebuilt: edges={} entries={} (was {})",
                swap.edges, swap.entries, swap.previous_entries
            );
        }
        Commands::Assign {
            employee,
            supervisor,
        } => {
            let service = hierarchy_from_env().await?;
            let swap = service
                .assign_supervisor(EmployeeId(employee), supervisor.map(EmployeeId))
                .await
                .with_context(|| format!("assigning supervisor for {}", EmployeeId(employee)))?;
            println!("supervisor updated; closure now has {} entries", swap.entries);
        }
        Commands::Ancestors { employee } => {
            let service = hierarchy_from_env().await?;
            let ancestors = service.ancestors(EmployeeId(employee)).await?;
            if ancestors.is_empty() {
                println!("{} has no supervisors", EmployeeId(employee));
            }
            for entry in ancestors {
                println!("level {}: {}", entry.level, entry.supervisor_id);
            }
        }
        Commands::Report { runs } => {
            let config = ReconConfig::from_env();
            println!("{}", report_history_markdown(runs, &config.reports_dir)?);
        }
        Commands::Migrate => {
            let config = ReconConfig::from_env();
            let Some(url) = config.database_url.as_deref() else {
                bail!("DATABASE_URL must be set to run migrations");
            };
            let store = PgRosterStore::connect(url).await?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Schedule => {
            let pipeline = Arc::new(ReconPipeline::from_config(ReconConfig::from_env()).await?);
            let source = pipeline
                .configured_source()
                .context("ORGREC_FEED must be set for scheduled runs")?;
            let Some(mut sched) = pipeline.clone().maybe_build_scheduler(source).await? else {
                bail!("scheduler disabled; set ORGREC_SCHEDULER_ENABLED=1");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}

async fn hierarchy_from_env() -> Result<HierarchyService> {
    let config = ReconConfig::from_env();
    Ok(HierarchyService::new(open_store(&config).await?))
}
