//! Device rows: decision history, bulk close-out, final verdicts.

use rusqlite::{Connection, OptionalExtension, params};

use super::{now_text, parse_opt_ts, parse_text};
use crate::error::{Error, Result};
use crate::model::*;

/// Decision source recorded by the exhaustion sweep.
pub const EXHAUSTED_SOURCE: &str = "pool_exhausted";

/// Completed results for a device as `(variant, result)`, variant order.
pub(super) fn device_history_on(
    conn: &Connection,
    device_id: &str,
) -> Result<Vec<(String, ResultLabel)>> {
    let mut stmt = conn.prepare(
        "SELECT i.variant, r.result
         FROM reviews r
         JOIN images i ON i.image_id = r.image_id
         WHERE i.device_id = ?1
           AND r.status = 'done'
           AND r.result IS NOT NULL
         ORDER BY i.variant ASC, r.review_id ASC",
    )?;

    let history = stmt
        .query_map(params![device_id], |row| {
            Ok((row.get::<_, String>(0)?, ResultLabel::new(row.get::<_, String>(1)?)))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(history)
}

/// Mark every non-done review of a device done with a synthetic code.
///
/// Existing assignment, lease, and version stamps are kept; only the gaps
/// are filled with the triggering worker's values.
pub(super) fn close_remaining_on(
    conn: &Connection,
    device_id: &str,
    code: SyntheticCode,
    worker: &str,
    lease_id: LeaseId,
    standard_version: &str,
) -> Result<usize> {
    let closed = conn.execute(
        "UPDATE reviews
         SET status = 'done',
             result = ?1,
             decided_at = ?2,
             standard_version = COALESCE(standard_version, ?3),
             assigned_to = COALESCE(assigned_to, ?4),
             batch_id = COALESCE(batch_id, ?5)
         WHERE image_id IN (SELECT image_id FROM images WHERE device_id = ?6)
           AND status != 'done'",
        params![
            code.as_str(),
            now_text(),
            standard_version,
            worker,
            lease_id.to_string(),
            device_id,
        ],
    )?;
    Ok(closed)
}

/// Set a device's final verdict unless one is already set.
///
/// Returns whether the verdict was written. Notes are merged either way:
/// they fill an empty notes field but never replace existing notes.
pub(super) fn set_verdict_on(
    conn: &Connection,
    device_id: &str,
    verdict: DeviceVerdict,
    source: &str,
    notes: &str,
) -> Result<bool> {
    conn.execute(
        "INSERT INTO devices (device_id) VALUES (?1) ON CONFLICT (device_id) DO NOTHING",
        params![device_id],
    )?;

    let written = conn.execute(
        "UPDATE devices
         SET final_result = ?1,
             final_decision_source = ?2,
             decided_at = ?3,
             notes = COALESCE(notes, ?4)
         WHERE device_id = ?5 AND final_result IS NULL",
        params![verdict.as_str(), source, now_text(), notes, device_id],
    )?;

    if written == 0 {
        conn.execute(
            "UPDATE devices SET notes = COALESCE(notes, ?1) WHERE device_id = ?2",
            params![notes, device_id],
        )?;
    }

    Ok(written > 0)
}

/// Close open devices that have no remaining work as `unknown`.
/// Returns the ids of the devices closed.
pub(super) fn finalize_exhausted_on(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "UPDATE devices
         SET final_result = 'unknown',
             final_decision_source = ?1,
             decided_at = ?2,
             notes = COALESCE(notes, 'triggered_by: pool_exhausted')
         WHERE final_result IS NULL
           AND EXISTS (SELECT 1 FROM images i WHERE i.device_id = devices.device_id)
           AND NOT EXISTS (
               SELECT 1 FROM reviews r
               JOIN images i ON i.image_id = r.image_id
               WHERE i.device_id = devices.device_id AND r.status != 'done'
           )
         RETURNING device_id",
    )?;

    let closed = stmt
        .query_map(params![EXHAUSTED_SOURCE, now_text()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(closed)
}

pub(super) fn get_device_on(conn: &Connection, device_id: &str) -> Result<Device> {
    conn.query_row(
        "SELECT device_id, final_result, final_decision_source, decided_at, notes
         FROM devices WHERE device_id = ?1",
        params![device_id],
        |row| {
            Ok(Device {
                id: row.get(0)?,
                final_result: row
                    .get::<_, Option<String>>(1)?
                    .map(|s| parse_text::<DeviceVerdict>(1, &s))
                    .transpose()?,
                decision_source: row.get(2)?,
                decided_at: parse_opt_ts(3, row.get(3)?)?,
                notes: row.get(4)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("device {device_id}")))
}
