//! Transactional batch access to the media metadata table
//!
//! Multi-row inserts, sparse batch updates and deletes run as single
//! all-or-nothing units. The chunked import path is the one exception:
//! each chunk commits on its own.

pub mod error;
pub mod model;
pub mod store;

pub use error::{ConstraintKind, DbError, Result};
pub use model::{
    ChunkFailure, ChunkOutcome, ImportSummary, MediaField, MediaFilter, MediaPatch, MediaRecord,
    MediaStats, NewMedia, Page, PageRequest, Pagination, SortBy, SortOrder, DEFAULT_PAGE_SIZE,
    MAX_PAGE_SIZE,
};
pub use store::{DbPool, MediaStore};
