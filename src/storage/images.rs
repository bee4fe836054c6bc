//! Image registration and click annotations.

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use super::{now_text, parse_text, parse_ts};
use crate::error::{Error, Result};
use crate::model::*;

/// What happened when an image was registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegisterOutcome {
    /// New image stored with its review rows.
    Registered { image_id: ImageId, reviews: usize },
    /// The path was already registered; nothing changed.
    AlreadyRegistered { image_id: ImageId },
    /// Same content already registered under another path; nothing stored.
    Duplicate { existing_path: String },
}

pub(super) fn register_image_on(conn: &Connection, new: &NewImage) -> Result<RegisterOutcome> {
    if let Some(id) = conn
        .query_row(
            "SELECT image_id FROM images WHERE path = ?1",
            params![new.path],
            |row| row.get::<_, i64>(0),
        )
        .optional()?
    {
        return Ok(RegisterOutcome::AlreadyRegistered {
            image_id: ImageId(id),
        });
    }

    if let Some(existing_path) = conn
        .query_row(
            "SELECT path FROM images WHERE content_digest = ?1",
            params![new.content_digest],
            |row| row.get::<_, String>(0),
        )
        .optional()?
    {
        return Ok(RegisterOutcome::Duplicate { existing_path });
    }

    conn.execute(
        "INSERT INTO devices (device_id) VALUES (?1) ON CONFLICT (device_id) DO NOTHING",
        params![new.device_id],
    )?;

    conn.execute(
        "INSERT INTO images (path, device_id, variant, content_digest, registered_at, qc_flag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            new.path,
            new.device_id,
            new.variant,
            new.content_digest,
            now_text(),
            new.qc_flag,
        ],
    )?;
    let image_id = conn.last_insert_rowid();

    let reviews = if new.qc_flag { 2 } else { 1 };
    for _ in 0..reviews {
        conn.execute(
            "INSERT INTO reviews (image_id, status) VALUES (?1, 'unassigned')",
            params![image_id],
        )?;
    }

    Ok(RegisterOutcome::Registered {
        image_id: ImageId(image_id),
        reviews,
    })
}

pub(super) fn get_image_on(conn: &Connection, id: ImageId) -> Result<Image> {
    conn.query_row(
        "SELECT image_id, path, device_id, variant, content_digest, qc_flag, registered_at
         FROM images WHERE image_id = ?1",
        params![id.0],
        |row| {
            Ok(Image {
                id: ImageId(row.get(0)?),
                path: row.get(1)?,
                device_id: row.get(2)?,
                variant: row.get(3)?,
                content_digest: row.get(4)?,
                qc_flag: row.get(5)?,
                registered_at: parse_ts(6, &row.get::<_, String>(6)?)?,
            })
        },
    )
    .optional()?
    .ok_or_else(|| Error::NotFound(format!("image {id}")))
}

pub(super) fn add_annotation_on(
    conn: &Connection,
    review_id: ReviewId,
    x_norm: f64,
    y_norm: f64,
    button: MouseButton,
) -> Result<i64> {
    conn.execute(
        "INSERT INTO annotations (review_id, x_norm, y_norm, button, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![review_id.0, x_norm, y_norm, button.as_str(), now_text()],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(super) fn annotations_for_on(conn: &Connection, review_id: ReviewId) -> Result<Vec<Annotation>> {
    let mut stmt = conn.prepare(
        "SELECT ann_id, review_id, x_norm, y_norm, button, created_at
         FROM annotations WHERE review_id = ?1 ORDER BY ann_id ASC",
    )?;

    let annotations = stmt
        .query_map(params![review_id.0], |row| {
            Ok(Annotation {
                id: row.get(0)?,
                review_id: ReviewId(row.get(1)?),
                x_norm: row.get(2)?,
                y_norm: row.get(3)?,
                button: parse_text(4, &row.get::<_, String>(4)?)?,
                created_at: parse_ts(5, &row.get::<_, String>(5)?)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(annotations)
}
