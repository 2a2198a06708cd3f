//! Tiered identity resolution of external rows against the roster.
//!
//! Tiers run in fixed order: exact name pair, relaxed substring, fuzzy
//! similarity. A tier that yields one candidate decides the row; a tier that
//! yields several marks the row ambiguous and stops. Only an empty tier falls
//! through to the next one.

use std::cmp::Ordering;

use orgrec_core::{
    Candidate, ContactIssue, Employee, FieldChecks, MatchOutcome, MatchResult, MatchTier,
    ParsedPerson,
};
use tracing::{debug, info};

use crate::config::MatchingRules;
use crate::normalize::{eq_normalized, fold};
use crate::similarity::{JaroWinkler, NameScorer};

/// Domain similarity above which an unexpected domain is reported as a typo.
const DOMAIN_TYPO_SIMILARITY: f64 = 0.9;

/// Roster with comparison forms computed once per pass.
#[derive(Debug)]
pub struct RosterView<'a> {
    entries: Vec<IndexedEmployee<'a>>,
}

#[derive(Debug)]
struct IndexedEmployee<'a> {
    employee: &'a Employee,
    first: String,
    last: String,
    full: String,
    reversed: String,
}

impl<'a> RosterView<'a> {
    pub fn new(roster: &'a [Employee]) -> Self {
        let entries = roster
            .iter()
            .map(|employee| {
                let first = fold(&employee.first_name);
                let last = fold(&employee.last_name);
                IndexedEmployee {
                    employee,
                    full: fold(&format!("{first} {last}")),
                    reversed: fold(&format!("{last} {first}")),
                    first,
                    last,
                }
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Supervisor-contact checks applied to every row.
#[derive(Debug, Clone, Default)]
pub struct ContactPolicy {
    expected_domain: Option<String>,
    known_typos: Vec<String>,
}

impl ContactPolicy {
    pub fn new(expected_domain: Option<&str>, known_typos: &[String]) -> Self {
        Self {
            expected_domain: expected_domain
                .map(|d| d.trim().trim_start_matches('@').to_lowercase())
                .filter(|d| !d.is_empty()),
            known_typos: known_typos.iter().map(|d| d.trim().to_lowercase()).collect(),
        }
    }

    pub fn validate(&self, address: &str) -> Option<ContactIssue> {
        let address = address.trim();
        if address.is_empty() {
            return Some(ContactIssue::Missing);
        }
        let malformed = || ContactIssue::Malformed {
            address: address.to_string(),
        };
        let Some((local, domain)) = address.split_once('@') else {
            return Some(malformed());
        };
        if local.is_empty()
            || domain.is_empty()
            || domain.contains('@')
            || address.chars().any(char::is_whitespace)
            || domain.starts_with('.')
            || domain.contains("..")
        {
            return Some(malformed());
        }

        let domain = domain.trim_end_matches('.').to_lowercase();
        if self.known_typos.iter().any(|typo| *typo == domain) {
            return Some(ContactIssue::DomainTypo {
                expected: self.expected_domain.clone().unwrap_or_default(),
                domain,
            });
        }

        let expected = self.expected_domain.as_ref()?;
        if domain == *expected || domain.ends_with(&format!(".{expected}")) {
            return None;
        }
        if looks_like_typo(&domain, expected) {
            Some(ContactIssue::DomainTypo {
                domain,
                expected: expected.clone(),
            })
        } else {
            Some(ContactIssue::ForeignDomain {
                domain,
                expected: expected.clone(),
            })
        }
    }
}

/// Trailing junk ("org.edu.ttt"), truncation ("org.ed") or a near spelling.
fn looks_like_typo(domain: &str, expected: &str) -> bool {
    if domain.starts_with(expected) {
        return true;
    }
    if expected.starts_with(domain) && domain.len() + 1 >= expected.len() {
        return true;
    }
    JaroWinkler::default().score(domain, expected) >= DOMAIN_TYPO_SIMILARITY
}

#[derive(Debug, Clone)]
pub struct MatchResolver<S = JaroWinkler> {
    scorer: S,
    fuzzy_threshold: f64,
    relaxed_tier: bool,
    contact: ContactPolicy,
}

impl MatchResolver<JaroWinkler> {
    pub fn from_rules(rules: &MatchingRules) -> Self {
        Self::with_scorer(rules.scorer(), rules)
    }
}

impl<S: NameScorer> MatchResolver<S> {
    pub fn with_scorer(scorer: S, rules: &MatchingRules) -> Self {
        Self {
            scorer,
            fuzzy_threshold: rules.fuzzy_threshold,
            relaxed_tier: rules.relaxed_tier,
            contact: ContactPolicy::new(
                rules.contact.expected_domain.as_deref(),
                &rules.contact.known_typo_domains,
            ),
        }
    }

    pub fn scorer(&self) -> &S {
        &self.scorer
    }

    pub fn validate_contact(&self, address: &str) -> Option<ContactIssue> {
        self.contact.validate(address)
    }

    pub fn resolve(&self, person: ParsedPerson, roster: &[Employee]) -> MatchResult {
        self.resolve_in(person, &RosterView::new(roster))
    }

    /// Resolves one row against a prepared view; the tier policy lives here.
    pub fn resolve_in(&self, person: ParsedPerson, roster: &RosterView<'_>) -> MatchResult {
        let outcome = self.classify(&person, roster);
        let contact_issue = self.validate_contact(&person.source.supervisor_contact);
        let department_missing = person.source.department.trim().is_empty();
        if let Some(issue) = &contact_issue {
            debug!(row = person.row, %issue, "contact issue");
        }
        MatchResult {
            person,
            outcome,
            contact_issue,
            department_missing,
        }
    }

    /// Resolves every row against one shared view of the roster, preserving order.
    pub fn resolve_all(&self, people: Vec<ParsedPerson>, roster: &[Employee]) -> Vec<MatchResult> {
        let view = RosterView::new(roster);
        people
            .into_iter()
            .map(|person| self.resolve_in(person, &view))
            .collect()
    }

    fn classify(&self, person: &ParsedPerson, roster: &RosterView<'_>) -> MatchOutcome {
        let first = fold(&person.first_name);
        let last = fold(&person.last_name);

        let exact = roster
            .entries
            .iter()
            .filter(|e| e.first == first && e.last == last)
            .map(|e| (e.employee, None))
            .collect::<Vec<_>>();
        if let Some(outcome) = self.decide(person, MatchTier::Exact, exact) {
            return outcome;
        }

        if self.relaxed_tier {
            let relaxed = roster
                .entries
                .iter()
                .filter(|e| overlaps(&first, &e.first) || overlaps(&last, &e.last))
                .map(|e| (e.employee, None))
                .collect::<Vec<_>>();
            if let Some(outcome) = self.decide(person, MatchTier::Relaxed, relaxed) {
                return outcome;
            }
        }

        let full = fold(&format!("{first} {last}"));
        let reversed = fold(&format!("{last} {first}"));
        let mut fuzzy = roster
            .entries
            .iter()
            .filter_map(|e| {
                let score = self
                    .scorer
                    .score(&full, &e.full)
                    .max(self.scorer.score(&reversed, &e.reversed));
                (score >= self.fuzzy_threshold).then_some((e.employee, Some(score)))
            })
            .collect::<Vec<_>>();
        fuzzy.sort_by(|(a, sa), (b, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        self.decide(person, MatchTier::Fuzzy, fuzzy)
            .unwrap_or(MatchOutcome::Missing)
    }

    fn decide(
        &self,
        person: &ParsedPerson,
        tier: MatchTier,
        mut hits: Vec<(&Employee, Option<f64>)>,
    ) -> Option<MatchOutcome> {
        match hits.len() {
            0 => None,
            1 => {
                let (employee, score) = hits.remove(0);
                Some(MatchOutcome::Exact {
                    employee: employee.clone(),
                    tier,
                    score,
                    fields: field_checks(person, employee),
                })
            }
            n => {
                info!(row = person.row, %tier, candidates = n, "ambiguous row");
                Some(MatchOutcome::Ambiguous {
                    tier,
                    candidates: hits
                        .into_iter()
                        .map(|(employee, score)| Candidate {
                            employee: employee.clone(),
                            score,
                        })
                        .collect(),
                })
            }
        }
    }
}

fn overlaps(a: &str, b: &str) -> bool {
    !a.is_empty() && !b.is_empty() && (a.contains(b) || b.contains(a))
}

fn field_checks(person: &ParsedPerson, employee: &Employee) -> FieldChecks {
    FieldChecks {
        department: eq_normalized(&person.source.department, &employee.department),
        job_title: eq_normalized(&person.source.job_title, &employee.job_title),
    }
}
