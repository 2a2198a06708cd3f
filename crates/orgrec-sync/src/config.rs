//! Environment configuration and the YAML matching rules.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use orgrec_core::DepartmentCategory;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::normalize::fold;
use crate::similarity::JaroWinkler;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {error}")]
    Read {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("parsing {path}: {error}")]
    Parse {
        path: PathBuf,
        error: serde_yaml::Error,
    },
    #[error("invalid matching rules: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone)]
pub struct ReconConfig {
    pub database_url: Option<String>,
    pub roster_path: PathBuf,
    pub reports_dir: PathBuf,
    pub archive_dir: PathBuf,
    pub rules_path: PathBuf,
    pub feed: Option<String>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub apply_updates: bool,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl ReconConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            roster_path: std::env::var("ORGREC_ROSTER_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/roster.json")),
            reports_dir: std::env::var("ORGREC_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./reports")),
            archive_dir: std::env::var("ORGREC_ARCHIVE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./archive")),
            rules_path: std::env::var("ORGREC_RULES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./rules/matching.yaml")),
            feed: std::env::var("ORGREC_FEED").ok().filter(|v| !v.trim().is_empty()),
            scheduler_enabled: env_flag("ORGREC_SCHEDULER_ENABLED"),
            sync_cron: std::env::var("ORGREC_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * Mon-Fri".to_string()),
            user_agent: std::env::var("ORGREC_USER_AGENT")
                .unwrap_or_else(|_| "orgrec/0.1".to_string()),
            http_timeout_secs: std::env::var("ORGREC_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            apply_updates: env_flag("ORGREC_APPLY_UPDATES"),
        }
    }
}

/// Organizational suffix assumed when no rules file says otherwise.
pub const DEFAULT_EXPECTED_DOMAIN: &str = "org.edu";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContactRules {
    /// Organizational domain every supervisor address must end with.
    pub expected_domain: Option<String>,
    /// Domains seen in the wild that are known misspellings.
    pub known_typo_domains: Vec<String>,
}

impl Default for ContactRules {
    fn default() -> Self {
        Self {
            expected_domain: Some(DEFAULT_EXPECTED_DOMAIN.to_string()),
            known_typo_domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DepartmentRule {
    pub department: String,
    pub category: DepartmentCategory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MatchingRules {
    pub version: u32,
    pub fuzzy_threshold: f64,
    pub prefix_cap: usize,
    pub prefix_scaling: f64,
    pub relaxed_tier: bool,
    pub contact: ContactRules,
    pub departments: Vec<DepartmentRule>,
}

impl Default for MatchingRules {
    fn default() -> Self {
        Self {
            version: 1,
            fuzzy_threshold: 0.88,
            prefix_cap: 4,
            prefix_scaling: 0.1,
            relaxed_tier: true,
            contact: ContactRules::default(),
            departments: Vec::new(),
        }
    }
}

impl MatchingRules {
    /// Loads and validates the rules file; a missing file means defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(
                    path = %path.display(),
                    expected_domain = DEFAULT_EXPECTED_DOMAIN,
                    "no matching rules file, using default rules"
                );
                return Ok(Self::default());
            }
            Err(error) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    error,
                })
            }
        };
        let rules: Self = serde_yaml::from_str(&text).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            error,
        })?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let rules: Self = serde_yaml::from_str(text).map_err(|error| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            error,
        })?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.fuzzy_threshold > 0.0 && self.fuzzy_threshold <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "fuzzy_threshold {} must be in (0, 1]",
                self.fuzzy_threshold
            )));
        }
        if !(1..=8).contains(&self.prefix_cap) {
            return Err(ConfigError::Invalid(format!(
                "prefix_cap {} must be between 1 and 8",
                self.prefix_cap
            )));
        }
        if !(0.0..=0.25).contains(&self.prefix_scaling)
            || self.prefix_cap as f64 * self.prefix_scaling > 1.0
        {
            return Err(ConfigError::Invalid(format!(
                "prefix_scaling {} with prefix_cap {} would exceed a score of 1",
                self.prefix_scaling, self.prefix_cap
            )));
        }
        match &self.contact.expected_domain {
            None => {
                return Err(ConfigError::Invalid(
                    "contact.expected_domain is required".to_string(),
                ))
            }
            Some(domain) if domain.trim().is_empty() || domain.contains('@') => {
                return Err(ConfigError::Invalid(format!(
                    "expected_domain '{domain}' is not a bare domain"
                )));
            }
            Some(_) => {}
        }
        self.department_categories().map(|_| ())
    }

    pub fn scorer(&self) -> JaroWinkler {
        JaroWinkler {
            prefix_cap: self.prefix_cap,
            scaling: self.prefix_scaling,
        }
    }

    pub fn department_categories(&self) -> Result<DepartmentCategories, ConfigError> {
        let mut map = HashMap::with_capacity(self.departments.len());
        for rule in &self.departments {
            let key = fold(&rule.department);
            if key.is_empty() {
                return Err(ConfigError::Invalid("empty department label".to_string()));
            }
            if map.insert(key, rule.category).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "department '{}' is mapped more than once",
                    rule.department
                )));
            }
        }
        Ok(DepartmentCategories { map })
    }
}

/// Department label to category lookup, keyed by folded label.
#[derive(Debug, Clone, Default)]
pub struct DepartmentCategories {
    map: HashMap<String, DepartmentCategory>,
}

impl DepartmentCategories {
    pub fn categorize(&self, department: &str) -> DepartmentCategory {
        self.map
            .get(&fold(department))
            .copied()
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
