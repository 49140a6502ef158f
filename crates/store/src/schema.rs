use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::info;

use crate::{Result, StoreError};

/// Bumped whenever a migration is appended below.
pub const SCHEMA_VERSION: i64 = 3;

const MIGRATIONS: &[(&str, &str)] = &[
    ("V0001__tasks", include_str!("../migrations/V0001__tasks.sql")),
    ("V0002__sync", include_str!("../migrations/V0002__sync.sql")),
    ("V0003__compaction", include_str!("../migrations/V0003__compaction.sql")),
];

/// Brings the schema up to [`SCHEMA_VERSION`]. Every migration is written
/// with `IF NOT EXISTS`, so rerunning on an existing database is a no-op.
pub(crate) fn apply_migrations(conn: &Connection) -> Result<()> {
    let current: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::Init(format!(
            "database schema v{current} is newer than supported v{SCHEMA_VERSION}"
        )));
    }

    for (name, sql) in MIGRATIONS {
        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT OR IGNORE INTO migrations(name, applied_at) VALUES(?1, ?2)",
            params![name, Utc::now().timestamp()],
        )?;
    }

    if current < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        info!(from = current, to = SCHEMA_VERSION, "store schema upgraded");
    }
    Ok(())
}

pub(crate) fn applied_migrations(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM migrations ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        apply_migrations(&conn).unwrap();

        let names = applied_migrations(&conn).unwrap();
        assert_eq!(names, vec!["V0001__tasks", "V0002__sync", "V0003__compaction"]);

        let version: i64 = conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let conn = Connection::open_in_memory().unwrap();
        conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
            .unwrap();
        assert!(matches!(apply_migrations(&conn), Err(StoreError::Init(_))));
    }

    #[test]
    fn test_ledger_trigger_blocks_rewrites() {
        let conn = Connection::open_in_memory().unwrap();
        apply_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO ledger_events(event_type, entity_id, timestamp, vector_clock, sync_status)
             VALUES('created', '1', 0, '[]', 'pending')",
            [],
        )
        .unwrap();

        assert!(conn
            .execute("UPDATE ledger_events SET entity_id = '2'", [])
            .is_err());
        conn.execute("UPDATE ledger_events SET sync_status = 'synced'", [])
            .unwrap();
        assert!(conn
            .execute("UPDATE ledger_events SET sync_status = 'pending'", [])
            .is_err());
    }
}
