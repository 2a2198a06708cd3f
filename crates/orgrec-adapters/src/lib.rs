//! External-list feed contracts and the CSV/JSON feed adapters.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orgrec_core::Person;
use orgrec_storage::{FeedArchive, FeedFetcher, FetchError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "orgrec-adapters";

const NAME_HEADERS: &[&str] = &["full_name", "name", "employee_name", "employee"];
const CONTACT_HEADERS: &[&str] = &[
    "supervisor_contact",
    "supervisor_email",
    "supervisor_mail",
    "supervisor",
];
const DEPARTMENT_HEADERS: &[&str] = &["department", "dept", "department_name"];
const TITLE_HEADERS: &[&str] = &["job_title", "title", "position"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    Csv,
    Json,
}

impl FeedFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }

    fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "csv" | "txt" => Some(Self::Csv),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

/// Where an external list comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "location", rename_all = "snake_case")]
pub enum FeedSource {
    File(PathBuf),
    Url(String),
}

impl FeedSource {
    /// `http(s)://` locations become URLs, everything else a file path.
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Url(location.to_string())
        } else {
            Self::File(PathBuf::from(location))
        }
    }

    /// Short label used for archive paths and logs.
    pub fn name(&self) -> String {
        let stem = match self {
            Self::File(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_default(),
            Self::Url(url) => url_path(url)
                .rsplit('/')
                .find(|segment| !segment.is_empty())
                .map(|segment| segment.split('.').next().unwrap_or(segment).to_string())
                .unwrap_or_default(),
        };
        let cleaned = stem
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
            .collect::<String>();
        if cleaned.is_empty() {
            "feed".to_string()
        } else {
            cleaned
        }
    }

    fn format_hint(&self) -> Option<FeedFormat> {
        let ext = match self {
            Self::File(path) => path.extension()?.to_string_lossy().to_string(),
            Self::Url(url) => url_path(url).rsplit_once('.')?.1.to_string(),
        };
        FeedFormat::from_extension(&ext)
    }
}

impl std::fmt::Display for FeedSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

fn url_path(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    without_query
        .split_once("://")
        .map(|(_, rest)| rest.split_once('/').map(|(_, path)| path).unwrap_or(""))
        .unwrap_or(without_query)
}

/// Raw bytes of one external list, exactly as received.
#[derive(Debug, Clone)]
pub struct RawFeed {
    pub source: FeedSource,
    pub format: FeedFormat,
    pub received_at: DateTime<Utc>,
    pub bytes: Vec<u8>,
}

impl RawFeed {
    pub fn sha256(&self) -> String {
        FeedArchive::sha256_hex(&self.bytes)
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("feed {feed} is missing required column '{column}'")]
    MissingColumn { feed: String, column: &'static str },
    #[error("malformed csv feed: {0}")]
    Csv(#[from] csv::Error),
    #[error("malformed json feed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("reading feed {path}: {error}")]
    Io {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("no feed adapter for {0}")]
    Unsupported(String),
}

#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn format(&self) -> FeedFormat;

    async fn fetch(
        &self,
        http: &FeedFetcher,
        source: &FeedSource,
    ) -> Result<RawFeed, AdapterError> {
        let bytes = match source {
            FeedSource::File(path) => tokio::fs::read(path).await.map_err(|error| AdapterError::Io {
                path: path.clone(),
                error,
            })?,
            FeedSource::Url(url) => http.fetch(url).await?.body,
        };
        Ok(RawFeed {
            source: source.clone(),
            format: self.format(),
            received_at: Utc::now(),
            bytes,
        })
    }

    fn parse(&self, feed: &RawFeed) -> Result<Vec<Person>, AdapterError>;
}

/// Tabular feed with a header row; header names are matched loosely.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvFeedAdapter;

#[async_trait]
impl FeedAdapter for CsvFeedAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Csv
    }

    fn parse(&self, feed: &RawFeed) -> Result<Vec<Person>, AdapterError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(feed.bytes.as_slice());
        let headers = reader
            .headers()?
            .iter()
            .map(normalize_header)
            .collect::<Vec<_>>();

        let name_idx = column_index(&headers, NAME_HEADERS).ok_or_else(|| {
            AdapterError::MissingColumn {
                feed: feed.source.to_string(),
                column: "full_name",
            }
        })?;
        let contact_idx = column_index(&headers, CONTACT_HEADERS);
        let department_idx = column_index(&headers, DEPARTMENT_HEADERS);
        let title_idx = column_index(&headers, TITLE_HEADERS);

        let mut people = Vec::new();
        for record in reader.records() {
            let record = record?;
            if record.iter().all(|cell| cell.is_empty()) {
                continue;
            }
            let cell = |idx: Option<usize>| {
                idx.and_then(|i| record.get(i))
                    .unwrap_or_default()
                    .to_string()
            };
            people.push(Person {
                full_name: cell(Some(name_idx)),
                supervisor_contact: cell(contact_idx),
                department: cell(department_idx),
                job_title: cell(title_idx),
            });
        }
        Ok(people)
    }
}

/// JSON array of person objects.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonFeedAdapter;

#[async_trait]
impl FeedAdapter for JsonFeedAdapter {
    fn format(&self) -> FeedFormat {
        FeedFormat::Json
    }

    fn parse(&self, feed: &RawFeed) -> Result<Vec<Person>, AdapterError> {
        Ok(serde_json::from_slice(&feed.bytes)?)
    }
}

pub fn adapter_for_format(format: FeedFormat) -> Box<dyn FeedAdapter> {
    match format {
        FeedFormat::Csv => Box::new(CsvFeedAdapter),
        FeedFormat::Json => Box::new(JsonFeedAdapter),
    }
}

pub fn adapter_for_source(source: &FeedSource) -> Option<Box<dyn FeedAdapter>> {
    source.format_hint().map(adapter_for_format)
}

/// Stable identifier for a feed's content, independent of when it was received.
pub fn deterministic_feed_id(feed: &RawFeed) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_OID, feed.sha256().as_bytes())
}

pub fn load_feed_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<Person>> {
    use anyhow::Context;

    let path = path.as_ref();
    let source = FeedSource::File(path.to_path_buf());
    let adapter = adapter_for_source(&source)
        .ok_or_else(|| AdapterError::Unsupported(source.to_string()))?;
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let feed = RawFeed {
        source,
        format: adapter.format(),
        received_at: Utc::now(),
        bytes,
    };
    adapter
        .parse(&feed)
        .with_context(|| format!("parsing {}", path.display()))
}

fn normalize_header(header: &str) -> String {
    header
        .trim()
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .split('_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn column_index(headers: &[String], aliases: &[&str]) -> Option<usize> {
    aliases
        .iter()
        .find_map(|alias| headers.iter().position(|h| h == alias))
}
