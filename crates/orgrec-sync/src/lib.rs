//! Reconciliation pipeline: feed in, classified report out, hierarchy refreshed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use chrono::{DateTime, Utc};
use orgrec_adapters::{adapter_for_source, deterministic_feed_id, AdapterError, FeedSource};
use orgrec_core::ReportSummary;
use orgrec_storage::{
    FeedArchive, FeedFetcher, FetcherConfig, PgRosterStore, ReportSink, RosterStore,
    SnapshotStore, StoreError,
};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod config;
pub mod export;
pub mod hierarchy;
pub mod normalize;
pub mod report;
pub mod resolver;
pub mod similarity;

pub use config::{ConfigError, DepartmentCategories, MatchingRules, ReconConfig};
pub use export::{report_history_markdown, FsReportSink};
pub use hierarchy::HierarchyService;
pub use report::{build_report, diff_fields, updates_from_diffs, RunMetadata};
pub use resolver::{ContactPolicy, MatchResolver};
pub use similarity::{JaroWinkler, NameScorer};

pub const CRATE_NAME: &str = "orgrec-sync";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HierarchyStatus {
    Rebuilt {
        entries: usize,
        previous_entries: usize,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed: String,
    pub feed_id: Uuid,
    pub feed_sha256: String,
    pub archived_path: String,
    pub archive_deduplicated: bool,
    pub summary: ReportSummary,
    pub report_location: String,
    pub applied_updates: Option<usize>,
    pub hierarchy: HierarchyStatus,
}

pub struct ReconPipeline {
    config: ReconConfig,
    resolver: MatchResolver,
    categories: DepartmentCategories,
    store: Arc<dyn RosterStore>,
    sink: Arc<dyn ReportSink>,
    hierarchy: HierarchyService,
    archive: FeedArchive,
    http: FeedFetcher,
}

impl ReconPipeline {
    pub fn new(
        config: ReconConfig,
        rules: MatchingRules,
        store: Arc<dyn RosterStore>,
        sink: Arc<dyn ReportSink>,
    ) -> Result<Self> {
        rules.validate()?;
        let categories = rules.department_categories()?;
        let http = FeedFetcher::new(FetcherConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            resolver: MatchResolver::from_rules(&rules),
            categories,
            hierarchy: HierarchyService::new(store.clone()),
            archive: FeedArchive::new(config.archive_dir.clone()),
            config,
            store,
            sink,
            http,
        })
    }

    /// Loads rules, opens the configured store and writes reports to disk.
    pub async fn from_config(config: ReconConfig) -> Result<Self> {
        let rules = MatchingRules::load(&config.rules_path)?;
        let store = open_store(&config).await?;
        let sink = Arc::new(FsReportSink::new(config.reports_dir.clone()));
        Self::new(config, rules, store, sink)
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn RosterStore> {
        &self.store
    }

    pub fn hierarchy(&self) -> &HierarchyService {
        &self.hierarchy
    }

    /// The configured feed, if any.
    pub fn configured_source(&self) -> Option<FeedSource> {
        self.config.feed.as_deref().map(FeedSource::parse)
    }

    pub async fn run_once(&self, source: &FeedSource) -> Result<ReconRunSummary> {
        let meta = RunMetadata::starting_now();
        let span = info_span!("reconcile_run", run_id = %meta.run_id, feed = %source);
        self.run_inner(meta, source).instrument(span).await
    }

    async fn run_inner(
        &self,
        mut meta: RunMetadata,
        source: &FeedSource,
    ) -> Result<ReconRunSummary> {
        let adapter = adapter_for_source(source)
            .ok_or_else(|| AdapterError::Unsupported(source.to_string()))?;
        // Without the roster there is nothing to reconcile against; fetch,
        // archive and report nothing.
        let roster = self.store.load_roster().await.context("loading roster")?;
        let raw = adapter
            .fetch(&self.http, source)
            .await
            .with_context(|| format!("fetching feed {source}"))?;
        let archived = self
            .archive
            .archive(raw.received_at, &source.name(), raw.format.extension(), &raw.bytes)
            .await?;
        let people = adapter
            .parse(&raw)
            .with_context(|| format!("parsing feed {source}"))?;
        info!(rows = people.len(), sha256 = %archived.content_hash, "feed parsed");

        let parsed = people
            .into_iter()
            .enumerate()
            .map(|(row, person)| normalize::parse_person(row, person))
            .collect::<Vec<_>>();
        let results = self.resolver.resolve_all(parsed, &roster);

        meta.finished_at = Utc::now();
        meta.feed_sha256 = Some(archived.content_hash.clone());
        let report = build_report(meta, &results, &self.categories);
        ensure!(
            report.summary.is_consistent(),
            "report partitions do not cover the feed: {:?}",
            report.summary
        );
        let location = self.sink.write_report(&report).await?;
        info!(
            matched = report.summary.matched,
            missing = report.summary.missing,
            ambiguous = report.summary.ambiguous,
            changed = report.summary.changed_rows,
            issues = report.summary.issues,
            location = %location.location,
            "reconciliation report written"
        );

        let applied_updates = if self.config.apply_updates {
            let diffs = results.iter().flat_map(diff_fields).collect::<Vec<_>>();
            let updates = updates_from_diffs(&diffs);
            let applied = self
                .store
                .apply_field_updates(&updates)
                .await
                .context("applying field updates")?;
            info!(requested = updates.len(), applied, "field updates applied");
            Some(applied)
        } else {
            None
        };

        let hierarchy = match self.hierarchy.rebuild().await {
            Ok(swap) => HierarchyStatus::Rebuilt {
                entries: swap.entries,
                previous_entries: swap.previous_entries,
            },
            Err(StoreError::Integrity(err)) => HierarchyStatus::Failed {
                reason: err.to_string(),
            },
            Err(err) => return Err(err).context("rebuilding hierarchy closure"),
        };

        Ok(ReconRunSummary {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            feed: source.to_string(),
            feed_id: deterministic_feed_id(&raw),
            feed_sha256: archived.content_hash,
            archived_path: archived.absolute_path.display().to_string(),
            archive_deduplicated: archived.deduplicated,
            summary: report.summary,
            report_location: location.location,
            applied_updates,
            hierarchy,
        })
    }

    /// Registers a cron job that reconciles `source` when scheduling is enabled.
    pub async fn maybe_build_scheduler(
        self: Arc<Self>,
        source: FeedSource,
    ) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.config.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            let source = source.clone();
            Box::pin(async move {
                match pipeline.run_once(&source).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        rows = summary.summary.total_rows,
                        "scheduled reconciliation finished"
                    ),
                    Err(err) => error!(error = ?err, "scheduled reconciliation failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise the JSON roster snapshot.
pub async fn open_store(config: &ReconConfig) -> Result<Arc<dyn RosterStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgRosterStore::connect(url)
                .await
                .context("connecting roster database")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!(
                path = %config.roster_path.display(),
                "DATABASE_URL unset; using roster snapshot file"
            );
            let store = SnapshotStore::open(&config.roster_path)
                .await
                .context("opening roster snapshot")?;
            Ok(Arc::new(store))
        }
    }
}

pub async fn run_reconcile_once_from_env(
    feed: Option<String>,
    apply: bool,
) -> Result<ReconRunSummary> {
    let mut config = ReconConfig::from_env();
    if feed.is_some() {
        config.feed = feed;
    }
    config.apply_updates |= apply;
    let pipeline = ReconPipeline::from_config(config).await?;
    let source = pipeline
        .configured_source()
        .context("no feed configured; pass --feed or set ORGREC_FEED")?;
    pipeline.run_once(&source).await
}
