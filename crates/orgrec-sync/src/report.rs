//! Field differ and reconciliation report builder.

use chrono::{DateTime, Utc};
use orgrec_core::{
    AmbiguousRow, Candidate, ChangedRow, DiffField, FieldDiff, FieldUpdate, IssueKind, IssueRow,
    MatchOutcome, MatchResult, MatchedRow, MissingRow, ReconReport, ReportSummary,
};
use uuid::Uuid;

use crate::config::DepartmentCategories;

/// One diff per mismatching attribute of an EXACT row; nothing otherwise.
pub fn diff_fields(result: &MatchResult) -> Vec<FieldDiff> {
    let MatchOutcome::Exact {
        employee, fields, ..
    } = &result.outcome
    else {
        return Vec::new();
    };

    let mut diffs = Vec::with_capacity(2);
    if !fields.department {
        diffs.push(FieldDiff {
            row: result.person.row,
            employee_id: employee.id,
            field: DiffField::Department,
            list_value: result.person.source.department.trim().to_string(),
            roster_value: employee.department.clone(),
        });
    }
    if !fields.job_title {
        diffs.push(FieldDiff {
            row: result.person.row,
            employee_id: employee.id,
            field: DiffField::JobTitle,
            list_value: result.person.source.job_title.trim().to_string(),
            roster_value: employee.job_title.clone(),
        });
    }
    diffs
}

/// Writes that would bring the roster in line with the list.
///
/// An empty list value is a data-quality gap, not an instruction to blank the
/// roster, so those diffs produce no update.
pub fn updates_from_diffs(diffs: &[FieldDiff]) -> Vec<FieldUpdate> {
    diffs
        .iter()
        .filter(|d| !d.list_value.trim().is_empty())
        .map(|d| FieldUpdate {
            employee_id: d.employee_id,
            field: d.field,
            value: d.list_value.trim().to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunMetadata {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_sha256: Option<String>,
}

impl RunMetadata {
    pub fn starting_now() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            finished_at: now,
            feed_sha256: None,
        }
    }
}

pub fn build_report(
    meta: RunMetadata,
    results: &[MatchResult],
    categories: &DepartmentCategories,
) -> ReconReport {
    let mut matched = Vec::new();
    let mut missing = Vec::new();
    let mut ambiguous = Vec::new();
    let mut changed = Vec::new();
    let mut issues = Vec::new();
    let mut field_diffs = 0usize;

    for result in results {
        let person = &result.person;
        let list_name = person.display_name();

        match &result.outcome {
            MatchOutcome::Exact {
                employee,
                tier,
                score,
                fields,
            } => {
                matched.push(MatchedRow {
                    row: person.row,
                    list_name: list_name.clone(),
                    employee_id: employee.id,
                    employee_name: employee.display_name(),
                    tier: *tier,
                    score: *score,
                    department_match: fields.department,
                    job_title_match: fields.job_title,
                    department_category: categories.categorize(&employee.department),
                    active: employee.active,
                });
                let diffs = diff_fields(result);
                field_diffs += diffs.len();
                changed.extend(diffs.into_iter().map(|d| ChangedRow {
                    row: d.row,
                    employee_id: d.employee_id,
                    employee_name: employee.display_name(),
                    field: d.field,
                    list_value: d.list_value,
                    roster_value: d.roster_value,
                }));
                if !employee.active {
                    issues.push(IssueRow {
                        row: person.row,
                        list_name: list_name.clone(),
                        match_kind: result.kind(),
                        kind: IssueKind::InactiveEmployee,
                        detail: format!("matched employee {} is inactive", employee.id),
                    });
                }
            }
            MatchOutcome::Ambiguous { tier, candidates } => ambiguous.push(AmbiguousRow {
                row: person.row,
                list_name: list_name.clone(),
                tier: *tier,
                candidate_count: candidates.len(),
                candidates: summarize_candidates(candidates),
            }),
            MatchOutcome::Missing => missing.push(MissingRow {
                row: person.row,
                list_name: list_name.clone(),
                department: person.source.department.trim().to_string(),
                job_title: person.source.job_title.trim().to_string(),
                supervisor_contact: person.source.supervisor_contact.trim().to_string(),
                department_category: categories.categorize(&person.source.department),
            }),
        }

        if let Some(issue) = &result.contact_issue {
            issues.push(IssueRow {
                row: person.row,
                list_name: list_name.clone(),
                match_kind: result.kind(),
                kind: IssueKind::ContactAddress,
                detail: issue.to_string(),
            });
        }
        if result.department_missing {
            issues.push(IssueRow {
                row: person.row,
                list_name,
                match_kind: result.kind(),
                kind: IssueKind::MissingDepartment,
                detail: "department is empty on the list".to_string(),
            });
        }
    }

    let mut changed_ids = changed.iter().map(|c| c.row).collect::<Vec<_>>();
    changed_ids.dedup();

    let summary = ReportSummary {
        total_rows: results.len(),
        matched: matched.len(),
        missing: missing.len(),
        ambiguous: ambiguous.len(),
        changed_rows: changed_ids.len(),
        field_diffs,
        issues: issues.len(),
    };

    ReconReport {
        run_id: meta.run_id,
        started_at: meta.started_at,
        finished_at: meta.finished_at,
        feed_sha256: meta.feed_sha256,
        summary,
        matched,
        missing,
        ambiguous,
        changed,
        issues,
    }
}

/// `"John Smith (#12, 0.973); Jon Smith (#14)"`; only fuzzy candidates carry a score.
pub fn summarize_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| match c.score {
            Some(score) => format!("{} ({}, {score:.3})", c.employee.display_name(), c.employee.id),
            None => format!("{} ({})", c.employee.display_name(), c.employee.id),
        })
        .collect::<Vec<_>>()
        .join("; ")
}
