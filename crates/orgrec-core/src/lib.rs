//! Core domain model for roster reconciliation and the reporting hierarchy.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "orgrec-core";

/// One row of the authoritative external list. Lives only for a single pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Person {
    #[serde(alias = "name")]
    pub full_name: String,
    #[serde(default, alias = "supervisor_email")]
    pub supervisor_contact: String,
    #[serde(default)]
    pub department: String,
    #[serde(default, alias = "title")]
    pub job_title: String,
}

/// A [`Person`] with its name split into first/last (display case preserved).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedPerson {
    pub row: usize,
    pub first_name: String,
    pub last_name: String,
    pub source: Person,
}

impl ParsedPerson {
    pub fn display_name(&self) -> String {
        join_name(&self.first_name, &self.last_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EmployeeId(pub i64);

impl fmt::Display for EmployeeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Roster record owned by the persistence layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub job_title: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl Employee {
    pub fn display_name(&self) -> String {
        join_name(&self.first_name, &self.last_name)
    }
}

fn join_name(first: &str, last: &str) -> String {
    match (first.is_empty(), last.is_empty()) {
        (true, _) => last.to_string(),
        (_, true) => first.to_string(),
        _ => format!("{first} {last}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchTier {
    Exact,
    Relaxed,
    Fuzzy,
}

impl fmt::Display for MatchTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "exact"),
            Self::Relaxed => write!(f, "relaxed"),
            Self::Fuzzy => write!(f, "fuzzy"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchKind {
    Exact,
    Ambiguous,
    Missing,
}

impl fmt::Display for MatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact => write!(f, "EXACT"),
            Self::Ambiguous => write!(f, "AMBIGUOUS"),
            Self::Missing => write!(f, "MISSING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChecks {
    pub department: bool,
    pub job_title: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub employee: Employee,
    /// Similarity score; only the fuzzy tier produces one.
    pub score: Option<f64>,
}

/// Classified resolution of one external row.
///
/// The variants carry the invariant directly: only `Exact` holds an employee,
/// `Ambiguous` always holds two or more candidates, `Missing` holds neither.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchOutcome {
    Exact {
        employee: Employee,
        tier: MatchTier,
        score: Option<f64>,
        fields: FieldChecks,
    },
    Ambiguous {
        tier: MatchTier,
        candidates: Vec<Candidate>,
    },
    Missing,
}

impl MatchOutcome {
    pub fn kind(&self) -> MatchKind {
        match self {
            Self::Exact { .. } => MatchKind::Exact,
            Self::Ambiguous { .. } => MatchKind::Ambiguous,
            Self::Missing => MatchKind::Missing,
        }
    }

    pub fn employee(&self) -> Option<&Employee> {
        match self {
            Self::Exact { employee, .. } => Some(employee),
            _ => None,
        }
    }

    pub fn candidates(&self) -> &[Candidate] {
        match self {
            Self::Ambiguous { candidates, .. } => candidates,
            _ => &[],
        }
    }
}

/// Problem with the supervisor contact address on an external row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum ContactIssue {
    Missing,
    Malformed { address: String },
    DomainTypo { domain: String, expected: String },
    ForeignDomain { domain: String, expected: String },
}

impl fmt::Display for ContactIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing => write!(f, "supervisor contact address is empty"),
            Self::Malformed { address } => write!(f, "malformed contact address '{address}'"),
            Self::DomainTypo { domain, expected } => {
                write!(f, "contact domain '{domain}' looks like a typo of '{expected}'")
            }
            Self::ForeignDomain { domain, expected } => {
                write!(f, "contact domain '{domain}' does not end with '{expected}'")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub person: ParsedPerson,
    pub outcome: MatchOutcome,
    pub contact_issue: Option<ContactIssue>,
    pub department_missing: bool,
}

impl MatchResult {
    pub fn kind(&self) -> MatchKind {
        self.outcome.kind()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiffField {
    Department,
    JobTitle,
}

impl fmt::Display for DiffField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Department => write!(f, "department"),
            Self::JobTitle => write!(f, "job_title"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDiff {
    pub row: usize,
    pub employee_id: EmployeeId,
    pub field: DiffField,
    pub list_value: String,
    pub roster_value: String,
}

/// Attribute write issued only on explicit apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub employee_id: EmployeeId,
    pub field: DiffField,
    pub value: String,
}

/// Direct-report relation: `employee_id` reports to `supervisor_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SupervisorEdge {
    pub employee_id: EmployeeId,
    pub supervisor_id: EmployeeId,
}

/// One row of the transitive reporting closure. `level` counts edges (>= 1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClosureEntry {
    pub report_id: EmployeeId,
    pub level: u32,
    pub supervisor_id: EmployeeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HierarchyError {
    #[error("supervisor cycle detected through {}", format_members(.members))]
    Cycle { members: Vec<EmployeeId> },
    #[error("employee {employee_id} has conflicting supervisors {first} and {second}")]
    ConflictingSupervisor {
        employee_id: EmployeeId,
        first: EmployeeId,
        second: EmployeeId,
    },
}

fn format_members(members: &[EmployeeId]) -> String {
    members
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DepartmentCategory {
    Academic,
    Administrative,
    Research,
    Support,
    #[default]
    Unassigned,
}

impl fmt::Display for DepartmentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Academic => write!(f, "academic"),
            Self::Administrative => write!(f, "administrative"),
            Self::Research => write!(f, "research"),
            Self::Support => write!(f, "support"),
            Self::Unassigned => write!(f, "unassigned"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedRow {
    pub row: usize,
    pub list_name: String,
    pub employee_id: EmployeeId,
    pub employee_name: String,
    pub tier: MatchTier,
    pub score: Option<f64>,
    pub department_match: bool,
    pub job_title_match: bool,
    pub department_category: DepartmentCategory,
    pub active: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingRow {
    pub row: usize,
    pub list_name: String,
    pub department: String,
    pub job_title: String,
    pub supervisor_contact: String,
    pub department_category: DepartmentCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousRow {
    pub row: usize,
    pub list_name: String,
    pub tier: MatchTier,
    pub candidate_count: usize,
    pub candidates: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangedRow {
    pub row: usize,
    pub employee_id: EmployeeId,
    pub employee_name: String,
    pub field: DiffField,
    pub list_value: String,
    pub roster_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    ContactAddress,
    MissingDepartment,
    InactiveEmployee,
}

impl fmt::Display for IssueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContactAddress => write!(f, "contact_address"),
            Self::MissingDepartment => write!(f, "missing_department"),
            Self::InactiveEmployee => write!(f, "inactive_employee"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueRow {
    pub row: usize,
    pub list_name: String,
    pub match_kind: MatchKind,
    pub kind: IssueKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ReportSummary {
    pub total_rows: usize,
    pub matched: usize,
    pub missing: usize,
    pub ambiguous: usize,
    pub changed_rows: usize,
    pub field_diffs: usize,
    pub issues: usize,
}

impl ReportSummary {
    /// Matched, missing and ambiguous must cover every input row exactly once.
    pub fn is_consistent(&self) -> bool {
        self.matched + self.missing + self.ambiguous == self.total_rows
            && self.changed_rows <= self.matched
    }
}

/// Output of one reconciliation pass, one row-set per partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub feed_sha256: Option<String>,
    pub summary: ReportSummary,
    pub matched: Vec<MatchedRow>,
    pub missing: Vec<MissingRow>,
    pub ambiguous: Vec<AmbiguousRow>,
    pub changed: Vec<ChangedRow>,
    pub issues: Vec<IssueRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn employee(id: i64, first: &str, last: &str) -> Employee {
        Employee {
            id: EmployeeId(id),
            first_name: first.into(),
            last_name: last.into(),
            department: String::new(),
            job_title: String::new(),
            contact: String::new(),
            active: true,
        }
    }

    #[test]
    fn outcome_accessors_follow_variant() {
        let exact = MatchOutcome::Exact {
            employee: employee(1, "John", "Smith"),
            tier: MatchTier::Exact,
            score: None,
            fields: FieldChecks {
                department: true,
                job_title: false,
            },
        };
        assert_eq!(exact.kind(), MatchKind::Exact);
        assert_eq!(exact.employee().map(|e| e.id), Some(EmployeeId(1)));
        assert!(exact.candidates().is_empty());

        let missing = MatchOutcome::Missing;
        assert!(missing.employee().is_none());
        assert!(missing.candidates().is_empty());
    }

    #[test]
    fn outcome_serializes_with_screaming_tag() {
        let json = serde_json::to_value(MatchOutcome::Missing).expect("serialize");
        assert_eq!(json["kind"], "MISSING");
    }

    #[test]
    fn employee_defaults_to_active_when_flag_absent() {
        let emp: Employee =
            serde_json::from_str(r#"{"id": 7, "first_name": "Ana", "last_name": "Ruiz"}"#)
                .expect("parse");
        assert!(emp.active);
        assert_eq!(emp.display_name(), "Ana Ruiz");
    }

    #[test]
    fn cycle_error_lists_members_in_order() {
        let err = HierarchyError::Cycle {
            members: vec![EmployeeId(1), EmployeeId(2), EmployeeId(1)],
        };
        assert_eq!(
            err.to_string(),
            "supervisor cycle detected through #1 -> #2 -> #1"
        );
    }

    #[test]
    fn summary_consistency_requires_exhaustive_partitions() {
        let mut summary = ReportSummary {
            total_rows: 3,
            matched: 1,
            missing: 1,
            ambiguous: 1,
            ..Default::default()
        };
        assert!(summary.is_consistent());
        summary.missing = 0;
        assert!(!summary.is_consistent());
    }
}
