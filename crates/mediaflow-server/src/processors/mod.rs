//! Job processors registered on the media queues.

pub mod backup;
pub mod batch_upload;
pub mod migrate;
pub mod restore;
pub mod upload;

pub use backup::{BackupData, BackupJob, BackupOutput, Snapshot, SNAPSHOT_VERSION};
pub use batch_upload::{BatchItemError, BatchItemResult, BatchUploadData, BatchUploadJob, BatchUploadOutput};
pub use migrate::{MigrateData, MigrateItemError, MigrateJob, MigrateOutput};
pub use restore::{RestoreData, RestoreJob, RestoreOutput};
pub use upload::{UploadData, UploadJob, UploadOutput};

use crate::storage::StorageRegistry;
use crate::transform::Transformer;
use mediaflow_db::{DbError, MediaStore};
use mediaflow_jobs::JobError;
use std::sync::Arc;

/// Collaborators shared by every processor.
#[derive(Clone)]
pub struct Services {
    pub db: MediaStore,
    pub storage: StorageRegistry,
    pub transformer: Arc<dyn Transformer>,
}

impl Services {
    pub fn new(db: MediaStore, storage: StorageRegistry, transformer: Arc<dyn Transformer>) -> Self {
        Self {
            db,
            storage,
            transformer,
        }
    }
}

/// Database failures seen from inside a job.
///
/// Constraint violations and bad input will fail the same way next time.
pub(crate) fn db_failure(err: DbError) -> JobError {
    if err.is_constraint() || matches!(err, DbError::InvalidInput(_)) {
        JobError::Unrecoverable(err.to_string())
    } else {
        JobError::WorkerError(err.to_string())
    }
}

/// `ceil(done * 100 / total)`, 100 for an empty set.
pub(crate) fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    let pct = (done * 100).div_ceil(total);
    pct.min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use mediaflow_db::ConstraintKind;
    use proptest::prelude::*;

    #[test]
    fn percent_rounds_up() {
        assert_eq!(percent(0, 10), 0);
        assert_eq!(percent(1, 3), 34);
        assert_eq!(percent(3, 3), 100);
        assert_eq!(percent(0, 0), 100);
    }

    #[test]
    fn constraint_violations_are_not_retried() {
        let err = db_failure(DbError::Constraint {
            kind: ConstraintKind::Unique,
            message: "storage_key".into(),
        });
        assert!(!err.is_retryable());
        assert!(db_failure(DbError::Unavailable("pool".into())).is_retryable());
    }

    proptest! {
        /// Settling one more item never lowers the reported percentage
        #[test]
        fn prop_percent_is_monotonic_and_capped(total in 1usize..5_000, done in 0usize..5_000) {
            let done = done.min(total);
            let now = percent(done, total);
            prop_assert!(now <= 100);
            prop_assert_eq!(percent(0, total), 0);
            if done < total {
                prop_assert!(percent(done + 1, total) >= now);
            } else {
                prop_assert_eq!(now, 100);
            }
        }
    }
}
