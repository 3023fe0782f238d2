use crate::error::Result;
use crate::model::{
    ChunkOutcome, ImportSummary, MediaField, MediaFilter, MediaPatch, MediaRecord, MediaStats,
    NewMedia, Page, PageRequest, Pagination,
};
use chrono::Utc;
use futures_util::stream::{self, Stream, StreamExt};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Type alias for the metadata pool
pub type DbPool = SqlitePool;

/// Rows per INSERT statement. Eight binds per row stay under SQLite's
/// 32766 parameter limit.
const INSERT_ROWS_PER_STATEMENT: usize = 4_000;

const COLUMNS: &str =
    "id, filename, storage_key, storage_backend, content_type, size_bytes, width, height, created_at";

/// Media metadata store with transactional batch operations.
///
/// Every call checks a connection out of the pool and returns it on every
/// exit path; concurrent callers never share a connection.
#[derive(Debug, Clone)]
pub struct MediaStore {
    pool: DbPool,
}

impl MediaStore {
    pub fn from_pool(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Connect and create the schema if needed.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        info!(url, max_connections, "Metadata store ready");
        Ok(store)
    }

    /// Private in-memory database on a single, never-recycled connection.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS media (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                storage_key TEXT NOT NULL UNIQUE,
                storage_backend TEXT NOT NULL,
                content_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL CHECK (size_bytes >= 0),
                width INTEGER,
                height INTEGER,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_media_created_at ON media (created_at);
            CREATE INDEX IF NOT EXISTS idx_media_storage_backend ON media (storage_backend);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Insert all rows in one transaction.
    ///
    /// Up to 4000 rows go out as a single multi-row statement; larger
    /// batches are split across statements inside the same transaction.
    /// Returns the new ids in input order. Any violation rolls the whole
    /// batch back and no id is returned.
    pub async fn batch_insert(&self, rows: &[NewMedia]) -> Result<Vec<i64>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(rows.len());

        for chunk in rows.chunks(INSERT_ROWS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT INTO media (filename, storage_key, storage_backend, content_type, size_bytes, width, height, created_at) ",
            );
            qb.push_values(chunk, |mut b, row| {
                b.push_bind(row.filename.clone())
                    .push_bind(row.storage_key.clone())
                    .push_bind(row.storage_backend.clone())
                    .push_bind(row.content_type.clone())
                    .push_bind(row.size_bytes)
                    .push_bind(row.width)
                    .push_bind(row.height)
                    .push_bind(row.created_at.unwrap_or(now));
            });
            qb.push(" RETURNING id");

            let mut chunk_ids: Vec<i64> = qb.build_query_scalar().fetch_all(&mut *tx).await?;
            // AUTOINCREMENT ids grow with insertion order
            chunk_ids.sort_unstable();
            ids.extend(chunk_ids);
        }

        tx.commit().await?;
        debug!(rows = ids.len(), "Batch insert committed");
        Ok(ids)
    }

    /// Apply sparse patches in one transaction. Returns rows changed.
    ///
    /// Patches naming ids that no longer exist change nothing.
    pub async fn batch_update(&self, patches: &[MediaPatch]) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let mut affected = 0;

        for patch in patches.iter().filter(|p| !p.fields.is_empty()) {
            let mut qb = QueryBuilder::<Sqlite>::new("UPDATE media SET ");
            let mut set = qb.separated(", ");
            for field in &patch.fields {
                set.push(field.column());
                set.push_unseparated(" = ");
                match field {
                    MediaField::Filename(v)
                    | MediaField::StorageKey(v)
                    | MediaField::StorageBackend(v)
                    | MediaField::ContentType(v) => set.push_bind_unseparated(v.clone()),
                    MediaField::SizeBytes(v) => set.push_bind_unseparated(*v),
                    MediaField::Width(v) | MediaField::Height(v) => set.push_bind_unseparated(*v),
                };
            }
            qb.push(" WHERE id = ").push_bind(patch.id);

            affected += qb.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(patches = patches.len(), affected, "Batch update committed");
        Ok(affected)
    }

    /// Delete every listed id in one statement. Missing ids are not an error.
    pub async fn batch_delete(&self, ids: &[i64]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut qb = QueryBuilder::<Sqlite>::new("DELETE FROM media WHERE id IN (");
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        qb.push(")");

        let deleted = qb.build().execute(&self.pool).await?.rows_affected();
        debug!(requested = ids.len(), deleted, "Batch delete");
        Ok(deleted)
    }

    /// Newest first; the order of `ids` is not kept.
    pub async fn get_by_ids(&self, ids: &[i64]) -> Result<Vec<MediaRecord>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM media WHERE id IN ("));
        let mut list = qb.separated(", ");
        for id in ids {
            list.push_bind(*id);
        }
        qb.push(") ORDER BY created_at DESC, id DESC");

        Ok(qb.build_query_as::<MediaRecord>().fetch_all(&self.pool).await?)
    }

    pub async fn get(&self, id: i64) -> Result<Option<MediaRecord>> {
        let record = sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {COLUMNS} FROM media WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// Count and page are read in the same transaction so `total` always
    /// matches `data`.
    pub async fn paginate(&self, request: &PageRequest) -> Result<Page<MediaRecord>> {
        request.validate()?;
        let mut tx = self.pool.begin().await?;

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM media");
        push_filters(&mut count, &request.filters);
        let total: i64 = count.build_query_scalar().fetch_one(&mut *tx).await?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {COLUMNS} FROM media"));
        push_filters(&mut select, &request.filters);
        select
            .push(" ORDER BY ")
            .push(request.sort_by.column())
            .push(" ")
            .push(request.sort_order.keyword())
            .push(", id ")
            .push(request.sort_order.keyword())
            .push(" LIMIT ")
            .push_bind(i64::from(request.page_size))
            .push(" OFFSET ")
            .push_bind(request.offset());
        let data = select
            .build_query_as::<MediaRecord>()
            .fetch_all(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Page {
            data,
            pagination: Pagination::new(request.page, request.page_size, total.max(0) as u64),
        })
    }

    /// Insert `rows` chunk by chunk, lazily.
    ///
    /// Each chunk is atomic on its own, but chunks are independent: a failed
    /// chunk leaves earlier ones committed and later ones are still tried.
    pub fn chunked_bulk_import(
        &self,
        rows: Vec<NewMedia>,
        chunk_size: usize,
    ) -> impl Stream<Item = ChunkOutcome> + Send + '_ {
        let size = chunk_size.max(1);
        let mut chunks = Vec::new();
        let mut rows = rows.into_iter().peekable();
        while rows.peek().is_some() {
            chunks.push(rows.by_ref().take(size).collect::<Vec<_>>());
        }

        stream::iter(chunks.into_iter().enumerate()).then(move |(index, chunk)| async move {
            let result = self.batch_insert(&chunk).await;
            if let Err(e) = &result {
                warn!(chunk = index, rows = chunk.len(), error = %e, "Import chunk rolled back");
            }
            ChunkOutcome {
                index,
                start: index * size,
                len: chunk.len(),
                result,
            }
        })
    }

    /// Drive [`chunked_bulk_import`](Self::chunked_bulk_import) to the end.
    pub async fn bulk_import(&self, rows: Vec<NewMedia>, chunk_size: usize) -> ImportSummary {
        let mut summary = ImportSummary::default();
        let mut outcomes = Box::pin(self.chunked_bulk_import(rows, chunk_size));
        while let Some(outcome) = outcomes.next().await {
            summary.record(&outcome);
        }
        info!(
            chunks = summary.chunks,
            inserted = summary.inserted,
            failed_rows = summary.failed_rows,
            "Bulk import finished"
        );
        summary
    }

    /// Aggregates in one query; an empty table yields zeros.
    pub async fn get_stats(&self) -> Result<MediaStats> {
        let (count, total, avg, max, min): (i64, Option<i64>, Option<f64>, Option<i64>, Option<i64>) =
            sqlx::query_as(
                "SELECT COUNT(*), SUM(size_bytes), AVG(size_bytes), MAX(size_bytes), MIN(size_bytes) FROM media",
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(MediaStats {
            count,
            total_bytes: total.unwrap_or(0),
            avg_bytes: avg.unwrap_or(0.0),
            max_bytes: max.unwrap_or(0),
            min_bytes: min.unwrap_or(0),
        })
    }

    pub async fn count(&self) -> Result<i64> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM media")
            .fetch_one(&self.pool)
            .await?)
    }

    /// Rows stored on one backend, oldest first.
    pub async fn list_by_backend(&self, backend: &str) -> Result<Vec<MediaRecord>> {
        Ok(sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {COLUMNS} FROM media WHERE storage_backend = ? ORDER BY id ASC"
        ))
        .bind(backend)
        .fetch_all(&self.pool)
        .await?)
    }

    /// Every row, oldest first.
    pub async fn export_all(&self) -> Result<Vec<MediaRecord>> {
        Ok(sqlx::query_as::<_, MediaRecord>(&format!(
            "SELECT {COLUMNS} FROM media ORDER BY id ASC"
        ))
        .fetch_all(&self.pool)
        .await?)
    }

    /// Storage keys already present among `keys`.
    pub async fn existing_keys(&self, keys: &[String]) -> Result<Vec<String>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT storage_key FROM media WHERE storage_key IN (");
        let mut list = qb.separated(", ");
        for key in keys {
            list.push_bind(key.clone());
        }
        qb.push(")");
        Ok(qb.build_query_scalar().fetch_all(&self.pool).await?)
    }
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filters: &MediaFilter) {
    let mut keyword = " WHERE ";
    let mut next = |qb: &mut QueryBuilder<'_, Sqlite>| {
        qb.push(keyword);
        keyword = " AND ";
    };

    if let Some(backend) = &filters.storage_backend {
        next(qb);
        qb.push("storage_backend = ").push_bind(backend.clone());
    }
    if let Some(prefix) = &filters.content_type {
        next(qb);
        qb.push("content_type LIKE ")
            .push_bind(format!("{}%", escape_like(prefix)))
            .push(" ESCAPE '\\'");
    }
    if let Some(search) = &filters.search {
        next(qb);
        qb.push("filename LIKE ")
            .push_bind(format!("%{}%", escape_like(search)))
            .push(" ESCAPE '\\'");
    }
    if let Some(after) = filters.created_after {
        next(qb);
        qb.push("created_at >= ").push_bind(after);
    }
    if let Some(before) = filters.created_before {
        next(qb);
        qb.push("created_at < ").push_bind(before);
    }
}

fn escape_like(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
