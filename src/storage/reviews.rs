//! Review row operations: pool selection, release, decisions, pair lookups.
//!
//! Every write here carries its precondition in the WHERE clause and
//! reports the number of rows it touched. Callers turn that count into an
//! outcome; a zero is never an error at this layer.

use rusqlite::{Connection, OptionalExtension, params};

use super::{parse_lease, parse_opt_ts, parse_text};
use crate::error::{Error, Result};
use crate::model::*;

/// Which slice of the unassigned pool a selection draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pool {
    /// QC-flagged images only.
    Qc,
    /// Non-QC images, plus QC-flagged ones when `include_qc` is set
    /// (the QC pool came up short).
    TopUp { include_qc: bool },
}

/// Select up to `limit` unassigned reviews from `pool` and lease them.
///
/// Selection and update are one statement, so the rows cannot change
/// between choosing and claiming. Candidates are collapsed to one review
/// per image, and images on which `worker` already holds a review are
/// excluded: a worker never receives both QC duplicates of one image.
pub(super) fn lease_from_pool_on(
    conn: &Connection,
    pool: Pool,
    worker: &str,
    lease_id: LeaseId,
    limit: usize,
) -> Result<Vec<ReviewId>> {
    if limit == 0 {
        return Ok(Vec::new());
    }

    let qc_filter = match pool {
        Pool::Qc => "i.qc_flag = 1",
        Pool::TopUp { include_qc: false } => "i.qc_flag = 0",
        Pool::TopUp { include_qc: true } => "1 = 1",
    };

    let sql = format!(
        "WITH candidates AS (
             SELECT MIN(r.review_id) AS review_id, i.variant AS variant
             FROM reviews r
             JOIN images i ON i.image_id = r.image_id
             WHERE r.status = 'unassigned'
               AND {qc_filter}
               AND NOT EXISTS (
                   SELECT 1 FROM reviews r2
                   WHERE r2.image_id = r.image_id AND r2.assigned_to = ?1
               )
             GROUP BY r.image_id
         ),
         pool AS (
             SELECT review_id FROM candidates
             ORDER BY variant ASC, RANDOM()
             LIMIT ?2
         )
         UPDATE reviews
         SET status = 'in_progress', assigned_to = ?1, batch_id = ?3
         WHERE review_id IN (SELECT review_id FROM pool)
         RETURNING review_id"
    );

    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map(
            params![worker, limit as i64, lease_id.to_string()],
            |row| row.get::<_, i64>(0).map(ReviewId),
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(ids)
}

/// Everything currently in progress under one lease, variant first then shuffled.
pub(super) fn leased_items_on(
    conn: &Connection,
    worker: &str,
    lease_id: LeaseId,
) -> Result<Vec<LeasedItem>> {
    let mut stmt = conn.prepare(
        "SELECT r.review_id, i.image_id, i.path, i.device_id, i.qc_flag
         FROM reviews r
         JOIN images i ON i.image_id = r.image_id
         WHERE r.batch_id = ?1 AND r.assigned_to = ?2 AND r.status = 'in_progress'
         ORDER BY i.variant ASC, RANDOM()",
    )?;

    let items = stmt
        .query_map(params![lease_id.to_string(), worker], row_to_leased_item)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(items)
}

pub(super) fn leased_item_on(conn: &Connection, review_id: ReviewId) -> Result<LeasedItem> {
    conn.query_row(
        "SELECT r.review_id, i.image_id, i.path, i.device_id, i.qc_flag
         FROM reviews r
         JOIN images i ON i.image_id = r.image_id
         WHERE r.review_id = ?1",
        params![review_id.0],
        row_to_leased_item,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("review {review_id}")))
}

pub(super) fn release_on(conn: &Connection, worker: &str, lease_id: LeaseId) -> Result<usize> {
    let released = conn.execute(
        "UPDATE reviews
         SET status = 'unassigned', assigned_to = NULL, batch_id = NULL
         WHERE batch_id = ?1 AND assigned_to = ?2 AND status = 'in_progress'",
        params![lease_id.to_string(), worker],
    )?;
    Ok(released)
}

pub(super) fn record_decision_on(
    conn: &Connection,
    review_id: ReviewId,
    worker: &str,
    lease_id: LeaseId,
    result: &ResultLabel,
    standard_version: &str,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE reviews
         SET status = 'done', result = ?1, standard_version = ?2, decided_at = ?3
         WHERE review_id = ?4 AND assigned_to = ?5 AND batch_id = ?6
           AND status = 'in_progress'",
        params![
            result.as_str(),
            standard_version,
            super::now_text(),
            review_id.0,
            worker,
            lease_id.to_string(),
        ],
    )?;
    Ok(updated)
}

/// The earliest not-yet-done review of the image at `path`, if any.
pub(super) fn open_review_for_path_on(
    conn: &Connection,
    path: &str,
) -> Result<Option<(ReviewId, ReviewStatus)>> {
    let row = conn
        .query_row(
            "SELECT r.review_id, r.status
             FROM images i
             JOIN reviews r ON r.image_id = i.image_id
             WHERE i.path = ?1 AND r.status != 'done'
             ORDER BY r.review_id ASC
             LIMIT 1",
            params![path],
            |row| {
                Ok((
                    ReviewId(row.get(0)?),
                    parse_text::<ReviewStatus>(1, &row.get::<_, String>(1)?)?,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

pub(super) fn force_skip_on(
    conn: &Connection,
    review_id: ReviewId,
    skip: &ResultLabel,
    worker: &str,
    lease_id: LeaseId,
    standard_version: &str,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE reviews
         SET status = 'done', result = ?1, decided_at = ?2, standard_version = ?3,
             assigned_to = ?4, batch_id = ?5
         WHERE review_id = ?6 AND status != 'done'",
        params![
            skip.as_str(),
            super::now_text(),
            standard_version,
            worker,
            lease_id.to_string(),
            review_id.0,
        ],
    )?;
    Ok(updated)
}

/// Lease one review to `worker` under `lease_id`.
///
/// Takes unassigned rows, or rows the worker already holds under an older
/// lease. Never takes a row in progress for someone else, and never hands a
/// worker a second review of an image they already touched.
pub(super) fn assign_on(
    conn: &Connection,
    review_id: ReviewId,
    worker: &str,
    lease_id: LeaseId,
) -> Result<usize> {
    let updated = conn.execute(
        "UPDATE reviews
         SET status = 'in_progress', assigned_to = ?1, batch_id = ?2
         WHERE review_id = ?3
           AND (status = 'unassigned' OR (status = 'in_progress' AND assigned_to = ?1))
           AND NOT EXISTS (
               SELECT 1 FROM reviews r2
               WHERE r2.image_id = reviews.image_id
                 AND r2.review_id != reviews.review_id
                 AND r2.assigned_to = ?1
           )",
        params![worker, lease_id.to_string(), review_id.0],
    )?;
    Ok(updated)
}

pub(super) fn get_review_on(conn: &Connection, id: ReviewId) -> Result<Review> {
    conn.query_row(
        &format!("{REVIEW_COLUMNS} WHERE review_id = ?1"),
        params![id.0],
        row_to_review,
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("review {id}")))
}

pub(super) fn reviews_for_image_on(conn: &Connection, id: ImageId) -> Result<Vec<Review>> {
    let mut stmt = conn.prepare(&format!(
        "{REVIEW_COLUMNS} WHERE image_id = ?1 ORDER BY review_id ASC"
    ))?;
    let reviews = stmt
        .query_map(params![id.0], row_to_review)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(reviews)
}

pub(super) fn status_counts_on(conn: &Connection) -> Result<Vec<(ReviewStatus, u64)>> {
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*) FROM reviews GROUP BY status ORDER BY status ASC",
    )?;
    let counts = stmt
        .query_map([], |row| {
            Ok((
                parse_text::<ReviewStatus>(0, &row.get::<_, String>(0)?)?,
                row.get::<_, i64>(1)? as u64,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(counts)
}

// ---------------------------------------------------------------------------
// Row parsing helpers
// ---------------------------------------------------------------------------

const REVIEW_COLUMNS: &str = "SELECT review_id, image_id, status, assigned_to, batch_id, result, standard_version, decided_at FROM reviews";

fn row_to_review(row: &rusqlite::Row) -> rusqlite::Result<Review> {
    Ok(Review {
        id: ReviewId(row.get(0)?),
        image_id: ImageId(row.get(1)?),
        status: parse_text(2, &row.get::<_, String>(2)?)?,
        assigned_to: row.get(3)?,
        lease_id: parse_lease(4, row.get(4)?)?,
        result: row.get::<_, Option<String>>(5)?.map(ResultLabel::new),
        standard_version: row.get(6)?,
        decided_at: parse_opt_ts(7, row.get(7)?)?,
    })
}

fn row_to_leased_item(row: &rusqlite::Row) -> rusqlite::Result<LeasedItem> {
    Ok(LeasedItem {
        review_id: ReviewId(row.get(0)?),
        image_id: ImageId(row.get(1)?),
        path: row.get(2)?,
        device_id: row.get(3)?,
        qc_flag: row.get(4)?,
    })
}
