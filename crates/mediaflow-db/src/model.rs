use crate::error::DbError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Row to insert into the `media` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMedia {
    pub filename: String,
    pub storage_key: String,
    pub storage_backend: String,
    pub content_type: String,
    pub size_bytes: i64,
    #[serde(default)]
    pub width: Option<i64>,
    #[serde(default)]
    pub height: Option<i64>,
    /// Defaults to the insertion time. Set when restoring a snapshot.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Stored media metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct MediaRecord {
    pub id: i64,
    pub filename: String,
    pub storage_key: String,
    pub storage_backend: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl From<MediaRecord> for NewMedia {
    fn from(record: MediaRecord) -> Self {
        Self {
            filename: record.filename,
            storage_key: record.storage_key,
            storage_backend: record.storage_backend,
            content_type: record.content_type,
            size_bytes: record.size_bytes,
            width: record.width,
            height: record.height,
            created_at: Some(record.created_at),
        }
    }
}

/// One updatable column with its new value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum MediaField {
    Filename(String),
    StorageKey(String),
    StorageBackend(String),
    ContentType(String),
    SizeBytes(i64),
    Width(Option<i64>),
    Height(Option<i64>),
}

impl MediaField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            MediaField::Filename(_) => "filename",
            MediaField::StorageKey(_) => "storage_key",
            MediaField::StorageBackend(_) => "storage_backend",
            MediaField::ContentType(_) => "content_type",
            MediaField::SizeBytes(_) => "size_bytes",
            MediaField::Width(_) => "width",
            MediaField::Height(_) => "height",
        }
    }
}

/// Sparse update of one row: only the listed fields change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaPatch {
    pub id: i64,
    pub fields: Vec<MediaField>,
}

impl MediaPatch {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: Vec::new(),
        }
    }

    pub fn set(mut self, field: MediaField) -> Self {
        self.fields.push(field);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaFilter {
    pub storage_backend: Option<String>,
    /// Prefix match, e.g. `image/`.
    pub content_type: Option<String>,
    /// Substring match on the filename.
    pub search: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    CreatedAt,
    Filename,
    SizeBytes,
}

impl SortBy {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            SortBy::CreatedAt => "created_at",
            SortBy::Filename => "filename",
            SortBy::SizeBytes => "size_bytes",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub(crate) fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

pub const DEFAULT_PAGE_SIZE: u32 = 30;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PageRequest {
    pub page: u32,
    pub page_size: u32,
    pub filters: MediaFilter,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: DEFAULT_PAGE_SIZE,
            filters: MediaFilter::default(),
            sort_by: SortBy::default(),
            sort_order: SortOrder::default(),
        }
    }
}

impl PageRequest {
    pub fn new(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ..Self::default()
        }
    }

    pub fn filters(mut self, filters: MediaFilter) -> Self {
        self.filters = filters;
        self
    }

    pub fn sort(mut self, by: SortBy, order: SortOrder) -> Self {
        self.sort_by = by;
        self.sort_order = order;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), DbError> {
        if self.page == 0 {
            return Err(DbError::InvalidInput("page starts at 1".to_string()));
        }
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(DbError::InvalidInput(format!(
                "pageSize must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }
        Ok(())
    }

    pub(crate) fn offset(&self) -> i64 {
        (i64::from(self.page) - 1) * i64::from(self.page_size)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(page: u32, page_size: u32, total: u64) -> Self {
        let size = u64::from(page_size.max(1));
        Self {
            page,
            page_size,
            total,
            total_pages: total.div_ceil(size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

/// Aggregates over the whole table; zeros when it is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStats {
    pub count: i64,
    pub total_bytes: i64,
    pub avg_bytes: f64,
    pub max_bytes: i64,
    pub min_bytes: i64,
}

/// Result of one chunk of a chunked import.
#[derive(Debug)]
pub struct ChunkOutcome {
    pub index: usize,
    /// Position of the chunk's first row in the input.
    pub start: usize,
    pub len: usize,
    pub result: Result<Vec<i64>, DbError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkFailure {
    pub index: usize,
    pub start: usize,
    pub len: usize,
    pub error: String,
}

/// Totals of a best-effort import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub chunks: usize,
    pub inserted: usize,
    pub failed_rows: usize,
    pub failures: Vec<ChunkFailure>,
}

impl ImportSummary {
    pub fn record(&mut self, outcome: &ChunkOutcome) {
        self.chunks += 1;
        match &outcome.result {
            Ok(ids) => self.inserted += ids.len(),
            Err(e) => {
                self.failed_rows += outcome.len;
                self.failures.push(ChunkFailure {
                    index: outcome.index,
                    start: outcome.start,
                    len: outcome.len,
                    error: e.to_string(),
                });
            }
        }
    }
}
