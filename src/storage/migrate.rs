//! Forward-only schema migrations keyed by `PRAGMA user_version`.
//!
//! Each step inspects the current shape before mutating it, so a step is
//! safe against a database that already has the change (for example one
//! created by older tooling that never bumped the counter). All steps run
//! inside one IMMEDIATE transaction: a second process starting cold blocks
//! on the lock, then reads the already-bumped counter and does nothing.

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::info;

use crate::error::{Error, Result};

/// Highest schema version this build knows how to produce.
pub const SCHEMA_VERSION: i64 = 3;

struct Migration {
    version: i64,
    name: &'static str,
    apply: fn(&Connection) -> Result<()>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "base_tables",
        apply: base_tables,
    },
    Migration {
        version: 2,
        name: "unique_content_digest",
        apply: unique_content_digest,
    },
    Migration {
        version: 3,
        name: "device_decision_columns",
        apply: device_decision_columns,
    },
];

/// Bring the schema up to [`SCHEMA_VERSION`]. Returns the resulting version.
pub(crate) fn run(conn: &mut Connection) -> Result<i64> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current = user_version(&tx)?;
    if current > SCHEMA_VERSION {
        return Err(Error::UnsupportedSchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        (migration.apply)(&tx)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        info!(
            version = migration.version,
            name = migration.name,
            "schema migration applied"
        );
    }

    tx.commit()?;
    Ok(current.max(SCHEMA_VERSION))
}

pub(crate) fn user_version(conn: &Connection) -> Result<i64> {
    Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

fn base_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS images (
            image_id        INTEGER PRIMARY KEY,
            path            TEXT UNIQUE NOT NULL,
            device_id       TEXT NOT NULL,
            variant         TEXT NOT NULL,
            content_digest  TEXT NOT NULL,
            registered_at   TEXT NOT NULL,
            qc_flag         INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_images_device ON images(device_id, variant);

        CREATE TABLE IF NOT EXISTS reviews (
            review_id         INTEGER PRIMARY KEY,
            image_id          INTEGER NOT NULL REFERENCES images(image_id),
            status            TEXT NOT NULL DEFAULT 'unassigned'
                              CHECK (status IN ('unassigned', 'in_progress', 'done')),
            assigned_to       TEXT,
            batch_id          TEXT,
            result            TEXT,
            standard_version  TEXT,
            decided_at        TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_reviews_status ON reviews(status);
        CREATE INDEX IF NOT EXISTS idx_reviews_image ON reviews(image_id);
        CREATE INDEX IF NOT EXISTS idx_reviews_lease ON reviews(batch_id, assigned_to)
            WHERE batch_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS devices (
            device_id     TEXT PRIMARY KEY,
            final_result  TEXT
        );

        CREATE TABLE IF NOT EXISTS annotations (
            ann_id      INTEGER PRIMARY KEY,
            review_id   INTEGER NOT NULL REFERENCES reviews(review_id),
            x_norm      REAL NOT NULL,
            y_norm      REAL NOT NULL,
            button      TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_annotations_review ON annotations(review_id);
        ",
    )?;
    Ok(())
}

fn unique_content_digest(conn: &Connection) -> Result<()> {
    if has_unique_index_on(conn, "images", "content_digest")? {
        return Ok(());
    }

    let duplicate: Option<(String, i64)> = conn
        .query_row(
            "SELECT content_digest, COUNT(*) FROM images
             GROUP BY content_digest HAVING COUNT(*) > 1
             LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((digest, count)) = duplicate {
        return Err(Error::MigrationConflict {
            version: 2,
            reason: format!("{count} images share content digest {digest}"),
        });
    }

    conn.execute_batch(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_images_digest ON images(content_digest);",
    )?;
    Ok(())
}

fn device_decision_columns(conn: &Connection) -> Result<()> {
    let existing = column_names(conn, "devices")?;
    if existing.is_empty() {
        return Err(Error::MigrationConflict {
            version: 3,
            reason: "devices table is missing".to_string(),
        });
    }

    for (column, decl) in [
        ("final_decision_source", "TEXT"),
        ("decided_at", "TEXT"),
        ("notes", "TEXT"),
    ] {
        if !existing.iter().any(|c| c == column) {
            conn.execute_batch(&format!("ALTER TABLE devices ADD COLUMN {column} {decl};"))?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Shape inspection
// ---------------------------------------------------------------------------

fn column_names(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>("name"))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(names)
}

fn has_unique_index_on(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA index_list(\"{table}\")"))?;
    let indexes = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>("name")?, row.get::<_, bool>("unique")?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    for (name, unique) in indexes {
        if !unique {
            continue;
        }
        let mut info = conn.prepare(&format!("PRAGMA index_info(\"{name}\")"))?;
        let columns = info
            .query_map([], |row| row.get::<_, Option<String>>("name"))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        // Expression indexes report a NULL column name.
        if matches!(columns.as_slice(), [Some(only)] if only == column) {
            return Ok(true);
        }
    }
    Ok(false)
}
