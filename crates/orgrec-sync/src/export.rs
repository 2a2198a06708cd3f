//! Filesystem report sink: JSON partitions, Parquet tables and a hashed manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use arrow_array::{
    BooleanArray, Float64Array, Int64Array, RecordBatch, StringArray, UInt64Array,
};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orgrec_core::{
    AmbiguousRow, ChangedRow, IssueRow, MatchedRow, MissingRow, ReconReport, ReportSummary,
};
use orgrec_storage::{ReportLocation, ReportSink};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

const STAGING_PREFIX: &str = ".staging-";

/// Staging dirs untouched for this long belong to a run that died.
pub const DEFAULT_STALE_STAGING_AGE: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Run-level record written next to the partitions; read back by the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_sha256: Option<String>,
    pub summary: ReportSummary,
}

/// Writes each report into `<root>/.staging-<run_id>` and renames it to
/// `<root>/<run_id>` once complete, so a reader never sees a partial run.
/// Other runs' staging dirs are only removed once older than `stale_after`,
/// so concurrent writers sharing a root leave each other alone.
#[derive(Debug, Clone)]
pub struct FsReportSink {
    root: PathBuf,
    stale_after: Duration,
}

impl FsReportSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            stale_after: DEFAULT_STALE_STAGING_AGE,
        }
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn remove_stale_staging(&self) -> Result<()> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.root.display()))
            }
        };
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.root.display()))?
        {
            if !entry.file_name().to_string_lossy().starts_with(STAGING_PREFIX) {
                continue;
            }
            let path = entry.path();
            let modified = entry
                .metadata()
                .await
                .and_then(|meta| meta.modified())
                .with_context(|| format!("inspecting {}", path.display()))?;
            // A timestamp in the future reads as fresh.
            let age = modified.elapsed().unwrap_or_default();
            if age < self.stale_after {
                debug!(path = %path.display(), ?age, "leaving in-flight staging dir");
                continue;
            }
            warn!(path = %path.display(), ?age, "removing stale report staging dir");
            match fs::remove_dir_all(&path).await {
                Ok(()) => {}
                // Its writer finished or cleaned up between listing and removal.
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("removing {}", path.display()))
                }
            }
        }
        Ok(())
    }

    async fn write_staged(&self, staging: &Path, report: &ReconReport) -> Result<()> {
        let tables = staging.join("tables");
        fs::create_dir_all(&tables)
            .await
            .with_context(|| format!("creating {}", tables.display()))?;

        let record = RunRecord {
            run_id: report.run_id,
            started_at: report.started_at,
            finished_at: report.finished_at,
            feed_sha256: report.feed_sha256.clone(),
            summary: report.summary,
        };
        write_json(&staging.join("summary.json"), &record).await?;
        write_json(&staging.join("matched.json"), &report.matched).await?;
        write_json(&staging.join("missing.json"), &report.missing).await?;
        write_json(&staging.join("ambiguous.json"), &report.ambiguous).await?;
        write_json(&staging.join("changed.json"), &report.changed).await?;
        write_json(&staging.join("contact_issues.json"), &report.issues).await?;
        fs::write(staging.join("summary.md"), summary_markdown(report))
            .await
            .context("writing summary.md")?;

        write_matched_parquet(&tables.join("matched.parquet"), &report.matched)?;
        write_missing_parquet(&tables.join("missing.parquet"), &report.missing)?;
        write_ambiguous_parquet(&tables.join("ambiguous.parquet"), &report.ambiguous)?;
        write_changed_parquet(&tables.join("changed.parquet"), &report.changed)?;
        write_issues_parquet(&tables.join("issues.parquet"), &report.issues)?;

        let mut files = Vec::new();
        for name in [
            "summary.json",
            "matched.json",
            "missing.json",
            "ambiguous.json",
            "changed.json",
            "contact_issues.json",
            "summary.md",
            "tables/matched.parquet",
            "tables/missing.parquet",
            "tables/ambiguous.parquet",
            "tables/changed.parquet",
            "tables/issues.parquet",
        ] {
            files.push(manifest_entry(name, staging, &staging.join(name))?);
        }
        let manifest = ReportManifest {
            schema_version: 1,
            run_id: report.run_id,
            files,
        };
        write_json(&staging.join("manifest.json"), &manifest).await
    }
}

#[async_trait]
impl ReportSink for FsReportSink {
    async fn write_report(&self, report: &ReconReport) -> Result<ReportLocation> {
        self.remove_stale_staging().await?;

        let final_dir = self.root.join(report.run_id.to_string());
        if fs::try_exists(&final_dir)
            .await
            .with_context(|| format!("checking {}", final_dir.display()))?
        {
            bail!("report directory {} already exists", final_dir.display());
        }

        let staging = self.root.join(format!("{STAGING_PREFIX}{}", report.run_id));
        if let Err(err) = self.write_staged(&staging, report).await {
            let _ = fs::remove_dir_all(&staging).await;
            return Err(err);
        }
        fs::rename(&staging, &final_dir)
            .await
            .with_context(|| format!("publishing report to {}", final_dir.display()))?;

        info!(run_id = %report.run_id, path = %final_dir.display(), "report written");
        Ok(ReportLocation {
            run_id: report.run_id,
            location: final_dir.display().to_string(),
        })
    }
}

async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

fn summary_markdown(report: &ReconReport) -> String {
    let s = &report.summary;
    let mut out = format!(
        "# Roster Reconciliation\n\n\
         - Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Feed sha256: {}\n\n\
         ## Counts\n- rows: {}\n- matched: {}\n- missing: {}\n- ambiguous: {}\n\
         - rows with changes: {} ({} fields)\n- issues: {}\n",
        report.run_id,
        report.started_at,
        report.finished_at,
        report.feed_sha256.as_deref().unwrap_or("n/a"),
        s.total_rows,
        s.matched,
        s.missing,
        s.ambiguous,
        s.changed_rows,
        s.field_diffs,
        s.issues,
    );
    if !report.ambiguous.is_empty() {
        out.push_str("\n## Needs review\n");
        for row in &report.ambiguous {
            out.push_str(&format!(
                "- row {} `{}` ({} tier): {}\n",
                row.row, row.list_name, row.tier, row.candidates
            ));
        }
    }
    out
}

/// Markdown digest of the most recent `runs` reports under `reports_dir`.
pub fn report_history_markdown(runs: usize, reports_dir: &Path) -> Result<String> {
    let mut records = Vec::new();
    for entry in std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let entry = entry.with_context(|| format!("listing {}", reports_dir.display()))?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') || !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let summary_path = entry.path().join("summary.json");
        if !summary_path.exists() {
            continue;
        }
        let text = std::fs::read_to_string(&summary_path)
            .with_context(|| format!("reading {}", summary_path.display()))?;
        let record: RunRecord = serde_json::from_str(&text)
            .with_context(|| format!("parsing {}", summary_path.display()))?;
        records.push((record, entry.path()));
    }
    records.sort_by(|(a, _), (b, _)| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Reconciliation History".to_string(), String::new()];
    if records.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (record, dir) in records.into_iter().take(runs.max(1)) {
        let s = record.summary;
        lines.push(format!("## Run `{}`", record.run_id));
        lines.push(format!("- started: {}", record.started_at));
        lines.push(format!(
            "- rows: {} (matched {}, missing {}, ambiguous {})",
            s.total_rows, s.matched, s.missing, s.ambiguous
        ));
        lines.push(format!("- changed rows: {}", s.changed_rows));
        lines.push(format!("- issues: {}", s.issues));
        let manifest = dir.join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- manifest: `{}`", manifest.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn rows_array<T>(rows: &[T], row: impl Fn(&T) -> usize) -> UInt64Array {
    UInt64Array::from(rows.iter().map(|r| row(r) as u64).collect::<Vec<_>>())
}

fn strings<T>(rows: &[T], value: impl Fn(&T) -> &str) -> StringArray {
    StringArray::from(rows.iter().map(|r| Some(value(r))).collect::<Vec<_>>())
}

fn flags<T>(rows: &[T], value: impl Fn(&T) -> bool) -> BooleanArray {
    BooleanArray::from(rows.iter().map(value).collect::<Vec<_>>())
}

fn write_matched_parquet(path: &Path, rows: &[MatchedRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("list_name", DataType::Utf8, false),
        ArrowField::new("employee_id", DataType::Int64, false),
        ArrowField::new("employee_name", DataType::Utf8, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("score", DataType::Float64, true),
        ArrowField::new("department_match", DataType::Boolean, false),
        ArrowField::new("job_title_match", DataType::Boolean, false),
        ArrowField::new("department_category", DataType::Utf8, false),
        ArrowField::new("active", DataType::Boolean, false),
    ]));
    let tiers = rows.iter().map(|r| r.tier.to_string()).collect::<Vec<_>>();
    let categories = rows
        .iter()
        .map(|r| r.department_category.to_string())
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows_array(rows, |r| r.row)),
            Arc::new(strings(rows, |r| r.list_name.as_str())),
            Arc::new(Int64Array::from(
                rows.iter().map(|r| r.employee_id.0).collect::<Vec<_>>(),
            )),
            Arc::new(strings(rows, |r| r.employee_name.as_str())),
            Arc::new(StringArray::from(tiers)),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.score).collect::<Vec<_>>(),
            )),
            Arc::new(flags(rows, |r| r.department_match)),
            Arc::new(flags(rows, |r| r.job_title_match)),
            Arc::new(StringArray::from(categories)),
            Arc::new(flags(rows, |r| r.active)),
        ],
    )
    .context("building matched record batch")?;
    write_parquet(path, batch)
}

fn write_missing_parquet(path: &Path, rows: &[MissingRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("list_name", DataType::Utf8, false),
        ArrowField::new("department", DataType::Utf8, false),
        ArrowField::new("job_title", DataType::Utf8, false),
        ArrowField::new("supervisor_contact", DataType::Utf8, false),
        ArrowField::new("department_category", DataType::Utf8, false),
    ]));
    let categories = rows
        .iter()
        .map(|r| r.department_category.to_string())
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows_array(rows, |r| r.row)),
            Arc::new(strings(rows, |r| r.list_name.as_str())),
            Arc::new(strings(rows, |r| r.department.as_str())),
            Arc::new(strings(rows, |r| r.job_title.as_str())),
            Arc::new(strings(rows, |r| r.supervisor_contact.as_str())),
            Arc::new(StringArray::from(categories)),
        ],
    )
    .context("building missing record batch")?;
    write_parquet(path, batch)
}

fn write_ambiguous_parquet(path: &Path, rows: &[AmbiguousRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("list_name", DataType::Utf8, false),
        ArrowField::new("tier", DataType::Utf8, false),
        ArrowField::new("candidate_count", DataType::UInt64, false),
        ArrowField::new("candidates", DataType::Utf8, false),
    ]));
    let tiers = rows.iter().map(|r| r.tier.to_string()).collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows_array(rows, |r| r.row)),
            Arc::new(strings(rows, |r| r.list_name.as_str())),
            Arc::new(StringArray::from(tiers)),
            Arc::new(rows_array(rows, |r| r.candidate_count)),
            Arc::new(strings(rows, |r| r.candidates.as_str())),
        ],
    )
    .context("building ambiguous record batch")?;
    write_parquet(path, batch)
}

fn write_changed_parquet(path: &Path, rows: &[ChangedRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("employee_id", DataType::Int64, false),
        ArrowField::new("employee_name", DataType::Utf8, false),
        ArrowField::new("field", DataType::Utf8, false),
        ArrowField::new("list_value", DataType::Utf8, false),
        ArrowField::new("roster_value", DataType::Utf8, false),
    ]));
    let fields = rows.iter().map(|r| r.field.to_string()).collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows_array(rows, |r| r.row)),
            Arc::new(Int64Array::from(rows.iter().map(|r| r.employee_id.0).collect::<Vec<_>>())),
            Arc::new(strings(rows, |r| r.employee_name.as_str())),
            Arc::new(StringArray::from(fields)),
            Arc::new(strings(rows, |r| r.list_value.as_str())),
            Arc::new(strings(rows, |r| r.roster_value.as_str())),
        ],
    )
    .context("building changed record batch")?;
    write_parquet(path, batch)
}

fn write_issues_parquet(path: &Path, rows: &[IssueRow]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("row", DataType::UInt64, false),
        ArrowField::new("list_name", DataType::Utf8, false),
        ArrowField::new("match_kind", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("detail", DataType::Utf8, false),
    ]));
    let match_kinds = rows.iter().map(|r| r.match_kind.to_string()).collect::<Vec<_>>();
    let kinds = rows.iter().map(|r| r.kind.to_string()).collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(rows_array(rows, |r| r.row)),
            Arc::new(strings(rows, |r| r.list_name.as_str())),
            Arc::new(StringArray::from(match_kinds)),
            Arc::new(StringArray::from(kinds)),
            Arc::new(strings(rows, |r| r.detail.as_str())),
        ],
    )
    .context("building issues record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, base: &Path, path: &Path) -> Result<ManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let rel = path.strip_prefix(base).unwrap_or(path).display().to_string();
    Ok(ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
