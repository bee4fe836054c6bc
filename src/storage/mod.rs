//! SQLite storage layer.
//!
//! The store file is the only synchronization point between worker
//! processes. WAL mode lets readers proceed while one writer holds the
//! lock; every mutating operation runs inside an IMMEDIATE transaction so
//! the write intent is taken before the first read.

mod devices;
mod images;
pub mod migrate;
mod reviews;

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};

use crate::error::{Error, Result};
use crate::model::*;

pub use devices::EXHAUSTED_SOURCE;
pub use images::RegisterOutcome;
pub(crate) use reviews::Pool;

/// Connection settings.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// How long a writer waits for the lock before giving up.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(15),
        }
    }
}

/// Storage backend. Owns the SQLite connection.
pub struct Storage {
    conn: Connection,
}

/// Handle for performing storage operations within a transaction.
///
/// Every method executes against the transaction's connection, so a
/// closure passed to [`Storage::with_transaction`] either commits as a
/// whole or not at all.
pub(crate) struct TxContext<'a> {
    tx: &'a Connection,
}

impl TxContext<'_> {
    pub fn register_image(&self, new: &NewImage) -> Result<RegisterOutcome> {
        images::register_image_on(self.tx, new)
    }

    pub fn add_annotation(
        &self,
        review_id: ReviewId,
        x_norm: f64,
        y_norm: f64,
        button: MouseButton,
    ) -> Result<i64> {
        images::add_annotation_on(self.tx, review_id, x_norm, y_norm, button)
    }

    pub fn lease_from_pool(
        &self,
        pool: Pool,
        worker: &str,
        lease_id: LeaseId,
        limit: usize,
    ) -> Result<Vec<ReviewId>> {
        reviews::lease_from_pool_on(self.tx, pool, worker, lease_id, limit)
    }

    pub fn leased_items(&self, worker: &str, lease_id: LeaseId) -> Result<Vec<LeasedItem>> {
        reviews::leased_items_on(self.tx, worker, lease_id)
    }

    pub fn release(&self, worker: &str, lease_id: LeaseId) -> Result<usize> {
        reviews::release_on(self.tx, worker, lease_id)
    }

    pub fn record_decision(
        &self,
        review_id: ReviewId,
        worker: &str,
        lease_id: LeaseId,
        result: &ResultLabel,
        standard_version: &str,
    ) -> Result<usize> {
        reviews::record_decision_on(self.tx, review_id, worker, lease_id, result, standard_version)
    }

    pub fn leased_item(&self, review_id: ReviewId) -> Result<LeasedItem> {
        reviews::leased_item_on(self.tx, review_id)
    }

    pub fn open_review_for_path(&self, path: &str) -> Result<Option<(ReviewId, ReviewStatus)>> {
        reviews::open_review_for_path_on(self.tx, path)
    }

    pub fn force_skip(
        &self,
        review_id: ReviewId,
        skip: &ResultLabel,
        worker: &str,
        lease_id: LeaseId,
        standard_version: &str,
    ) -> Result<usize> {
        reviews::force_skip_on(self.tx, review_id, skip, worker, lease_id, standard_version)
    }

    pub fn assign(&self, review_id: ReviewId, worker: &str, lease_id: LeaseId) -> Result<usize> {
        reviews::assign_on(self.tx, review_id, worker, lease_id)
    }

    pub fn device_history(&self, device_id: &str) -> Result<Vec<(String, ResultLabel)>> {
        devices::device_history_on(self.tx, device_id)
    }

    pub fn close_remaining(
        &self,
        device_id: &str,
        code: SyntheticCode,
        worker: &str,
        lease_id: LeaseId,
        standard_version: &str,
    ) -> Result<usize> {
        devices::close_remaining_on(self.tx, device_id, code, worker, lease_id, standard_version)
    }

    pub fn set_verdict(
        &self,
        device_id: &str,
        verdict: DeviceVerdict,
        source: &str,
        notes: &str,
    ) -> Result<bool> {
        devices::set_verdict_on(self.tx, device_id, verdict, source, notes)
    }

    pub fn finalize_exhausted(&self) -> Result<Vec<String>> {
        devices::finalize_exhausted_on(self.tx)
    }
}

impl Storage {
    /// Open or create a store at the given path and bring its schema up to date.
    ///
    /// Missing parent directories are created. Failure to open or configure
    /// the file is reported as [`Error::StorageUnavailable`] with enough
    /// context (directory existence, writability) to diagnose a bad share.
    pub fn open(path: impl AsRef<Path>, options: &StoreOptions) -> Result<Self> {
        let path = path.as_ref();

        if let Some(dir) = parent_dir(path).filter(|dir| !dir.is_dir()) {
            std::fs::create_dir_all(dir).map_err(|e| unavailable(path, e))?;
        }

        let conn = Connection::open(path).map_err(|e| unavailable(path, e))?;
        configure(&conn, options).map_err(|e| unavailable(path, e))?;

        let mut storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, &StoreOptions::default())?;
        let mut storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    /// Apply pending migrations. Returns the resulting schema version.
    pub fn migrate(&mut self) -> Result<i64> {
        migrate::run(&mut self.conn)
    }

    /// Current value of the stored schema version counter.
    pub fn schema_version(&self) -> Result<i64> {
        migrate::user_version(&self.conn)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Execute a closure within an IMMEDIATE transaction.
    ///
    /// The write lock is acquired up front, so reads inside the closure see
    /// a snapshot no other writer can change before the closure's writes.
    /// Commits if the closure returns Ok, rolls back on Err.
    pub(crate) fn with_transaction<F, T>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&TxContext) -> Result<T>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let ctx = TxContext { tx: &tx };
        let result = f(&ctx)?;
        tx.commit()?;
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn get_image(&self, id: ImageId) -> Result<Image> {
        images::get_image_on(&self.conn, id)
    }

    pub fn get_review(&self, id: ReviewId) -> Result<Review> {
        reviews::get_review_on(&self.conn, id)
    }

    pub fn reviews_for_image(&self, id: ImageId) -> Result<Vec<Review>> {
        reviews::reviews_for_image_on(&self.conn, id)
    }

    pub fn get_device(&self, device_id: &str) -> Result<Device> {
        devices::get_device_on(&self.conn, device_id)
    }

    pub fn device_history(&self, device_id: &str) -> Result<Vec<(String, ResultLabel)>> {
        devices::device_history_on(&self.conn, device_id)
    }

    pub fn status_counts(&self) -> Result<Vec<(ReviewStatus, u64)>> {
        reviews::status_counts_on(&self.conn)
    }

    pub fn annotations_for(&self, review_id: ReviewId) -> Result<Vec<Annotation>> {
        images::annotations_for_on(&self.conn, review_id)
    }
}

fn configure(conn: &Connection, options: &StoreOptions) -> rusqlite::Result<()> {
    // Busy timeout first: switching to WAL needs the lock too.
    conn.busy_timeout(options.busy_timeout)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    conn.execute_batch("PRAGMA foreign_keys=ON;")?;
    Ok(())
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|p| !p.as_os_str().is_empty())
}

fn unavailable(
    path: &Path,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> Error {
    let dir: PathBuf = parent_dir(path)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let writable = std::fs::metadata(&dir)
        .map(|m| !m.permissions().readonly())
        .unwrap_or(false);

    Error::StorageUnavailable {
        path: path.to_path_buf(),
        dir_exists: dir.is_dir(),
        writable,
        source: source.into(),
    }
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

pub(crate) fn now_text() -> String {
    Utc::now().to_rfc3339()
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

pub(crate) fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    s.parse::<DateTime<Utc>>().map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_opt_ts(idx: usize, s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(idx, &s)).transpose()
}

pub(crate) fn parse_lease(idx: usize, s: Option<String>) -> rusqlite::Result<Option<LeaseId>> {
    s.map(|s| uuid::Uuid::parse_str(&s).map(LeaseId))
        .transpose()
        .map_err(|e| conversion_error(idx, e))
}

pub(crate) fn parse_text<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = Error>,
{
    s.parse::<T>().map_err(|e| conversion_error(idx, e))
}
