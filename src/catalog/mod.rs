pub mod driver;
pub mod estimate;
pub mod extract;
pub mod tile_date;
pub mod window;

use chrono::NaiveDate;
use serde::Serialize;
use thiserror::Error;

use extract::DetailSnapshot;

/// Order in which the catalog lists classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Newest first (the catalog default, descending by air date).
    NewestFirst,
    /// Oldest first (`sort=original_air_time&desc=false`).
    OldestFirst,
}

/// Inclusive, date-only window. Either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl DateWindow {
    pub fn new(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Self {
        Self { start, end }
    }

    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start.map_or(true, |s| date >= s) && self.end.map_or(true, |e| date <= e)
    }
}

/// One rendered tile. Only valid until the host list re-renders.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry {
    pub index: usize,
    pub raw_date: Option<String>,
    pub title: String,
}

/// The persisted unit, keyed by `id`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRecord {
    pub id: String,
    pub title: String,
    pub instructor: String,
    pub duration_minutes: Option<u32>,
    pub difficulty_rating: Option<f64>,
    pub class_type: String,
    pub original_air_time: Option<NaiveDate>,
    pub url: String,
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("timed out waiting for {0}")]
    Timeout(String),
    #[error("stale element reference: {0}")]
    StaleReference(String),
    #[error("interaction failed: {0}")]
    Interaction(String),
    #[error("session expired (redirected to login)")]
    SessionExpired,
    #[error("navigation failed: {0}")]
    Navigation(String),
}

impl HostError {
    /// Session-level failures end the run immediately; the rest are counted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HostError::SessionExpired | HostError::Navigation(_))
    }
}

/// Capability view of the lazily-loading catalog page.
///
/// Implementations own every wait and must bound it.
pub trait CatalogHost {
    /// Snapshot of the tiles currently rendered, in list order.
    fn list_entries(&mut self) -> Result<Vec<CatalogEntry>, HostError>;

    /// Ask the page to load more tiles. `false` means the host knows nothing
    /// more can appear.
    fn request_more(&mut self) -> Result<bool, HostError>;

    /// Open the detail view for `entry`, returning the page URL afterwards.
    fn open_entry(&mut self, entry: &CatalogEntry) -> Result<String, HostError>;

    /// Read the in-place detail view once its presence marker shows up.
    fn read_detail(&mut self) -> Result<DetailSnapshot, HostError>;

    /// Read the detail view through a deep link in a separate, short-lived
    /// context. The context is gone when this returns.
    fn read_detail_isolated(&mut self, class_id: &str) -> Result<DetailSnapshot, HostError>;

    fn close_entry(&mut self) -> Result<(), HostError>;
}

/// Receives each record as soon as it is extracted.
pub trait RecordSink {
    fn persist(&mut self, record: &ClassRecord) -> anyhow::Result<()>;
}

impl<F> RecordSink for F
where
    F: FnMut(&ClassRecord) -> anyhow::Result<()>,
{
    fn persist(&mut self, record: &ClassRecord) -> anyhow::Result<()> {
        self(record)
    }
}

/// Pull the class identifier out of a detail URL.
pub fn class_id_from_url(url: &str) -> String {
    if let Some((_, rest)) = url.split_once("classId=") {
        return rest.split(['&', '#']).next().unwrap_or_default().to_string();
    }
    url.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string()
}

pub fn deep_link(base_url: &str, class_id: &str) -> String {
    format!("{}?modal=classDetailsModal&classId={}", base_url, class_id)
}
