use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reverie_core::{GameId, GameSummary, RecordId, TurnRecord};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 1;

pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS turn_records (
  record_id TEXT PRIMARY KEY,
  game_id TEXT NOT NULL,
  sequence INTEGER NOT NULL CHECK (sequence >= 1),
  created_at TEXT NOT NULL,
  turn_data_json TEXT NOT NULL CHECK (json_valid(turn_data_json)),
  UNIQUE(game_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_turn_records_game_sequence ON turn_records(game_id, sequence);
CREATE INDEX IF NOT EXISTS idx_turn_records_created_at ON turn_records(created_at);

CREATE TRIGGER IF NOT EXISTS turn_records_reject_update
BEFORE UPDATE ON turn_records
BEGIN
  SELECT RAISE(ABORT, 'turn_records is append-only');
END;

CREATE TRIGGER IF NOT EXISTS turn_records_reject_delete
BEFORE DELETE ON turn_records
BEGIN
  SELECT RAISE(ABORT, 'turn_records is append-only');
END;
";

/// Compare-and-append was attempted against a stale view of the game.
#[derive(Debug, Clone, Copy, thiserror::Error, PartialEq, Eq)]
#[error(
    "append conflict for game {game_id}: expected last sequence {expected:?}, found {actual:?}"
)]
pub struct AppendConflict {
    pub game_id: GameId,
    pub expected: Option<u64>,
    pub actual: Option<u64>,
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceGap {
    pub game_id: String,
    pub turn_count: i64,
    pub min_sequence: i64,
    pub max_sequence: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub sequence_gaps: Vec<SequenceGap>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug)]
struct TurnRow {
    record_id: String,
    game_id: String,
    sequence: i64,
    created_at: String,
    turn_data_json: String,
}

impl SqliteStore {
    /// Open a SQLite-backed history store with the default busy timeout.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_busy_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a SQLite-backed history store, waiting up to `busy_timeout` for write locks.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with_busy_timeout(path: &Path, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(busy_timeout).context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the database is newer than supported.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
            version = 1;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Append one turn at the next sequence number for `game_id`.
    ///
    /// Not idempotent: appending the same payload twice stores two records.
    ///
    /// # Errors
    /// Returns an error when the payload is not a JSON object or the write fails.
    pub fn append_turn(
        &mut self,
        game_id: GameId,
        turn_data: &serde_json::Value,
    ) -> Result<TurnRecord> {
        self.append(game_id, None, turn_data)
    }

    /// Append one turn only if the game's last sequence is still `expected_last`.
    ///
    /// `None` means the caller expects the game to have no records yet.
    ///
    /// # Errors
    /// Returns an [`AppendConflict`] (inside the `anyhow` chain) when another write landed
    /// first, or an error when the payload is not a JSON object or the write fails.
    pub fn append_turn_after(
        &mut self,
        game_id: GameId,
        expected_last: Option<u64>,
        turn_data: &serde_json::Value,
    ) -> Result<TurnRecord> {
        self.append(game_id, Some(expected_last), turn_data)
    }

    fn append(
        &mut self,
        game_id: GameId,
        expected_last: Option<Option<u64>>,
        turn_data: &serde_json::Value,
    ) -> Result<TurnRecord> {
        if !turn_data.is_object() {
            return Err(anyhow!("turn_data MUST be a JSON object"));
        }
        let turn_data_json =
            serde_json::to_string(turn_data).context("failed to serialize turn_data")?;

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start append transaction")?;

        let actual = last_sequence_in(&tx, game_id)?;
        if let Some(expected) = expected_last {
            if expected != actual {
                return Err(AppendConflict { game_id, expected, actual }.into());
            }
        }

        let sequence = actual.map_or(1, |last| last + 1);
        let record = TurnRecord {
            record_id: RecordId::new(),
            game_id,
            sequence,
            created_at: OffsetDateTime::now_utc(),
            turn_data: turn_data.clone(),
        };

        tx.execute(
            "INSERT INTO turn_records(record_id, game_id, sequence, created_at, turn_data_json)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.record_id.to_string(),
                game_id.to_string(),
                to_sql_sequence(sequence)?,
                rfc3339(record.created_at)?,
                turn_data_json,
            ],
        )
        .context("failed to insert turn record")?;

        tx.commit().context("failed to commit append transaction")?;
        Ok(record)
    }

    /// Highest stored sequence for `game_id`, or `None` when the game has no records.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn last_sequence(&self, game_id: GameId) -> Result<Option<u64>> {
        last_sequence_in(&self.conn, game_id)
    }

    /// Number of stored records for `game_id`.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn count_turns(&self, game_id: GameId) -> Result<u64> {
        let count = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM turn_records WHERE game_id = ?1",
                params![game_id.to_string()],
                |row| row.get::<_, i64>(0),
            )
            .context("failed to count turn records")?;
        u64::try_from(count).context("turn count is negative")
    }

    /// Load up to `limit` most recent records for `game_id`, oldest first.
    ///
    /// An unknown game yields an empty vector.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn fetch_recent(&self, game_id: GameId, limit: usize) -> Result<Vec<TurnRecord>> {
        let limit = i64::try_from(limit).context("history limit does not fit in i64")?;
        let mut stmt = self.conn.prepare(
            "SELECT record_id, game_id, sequence, created_at, turn_data_json
             FROM (
               SELECT record_id, game_id, sequence, created_at, turn_data_json
               FROM turn_records
               WHERE game_id = ?1
               ORDER BY sequence DESC
               LIMIT ?2
             )
             ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(params![game_id.to_string(), limit], read_turn_row)?;
        collect_turn_rows(rows)
    }

    /// Load every record for `game_id`, oldest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn fetch_all(&self, game_id: GameId) -> Result<Vec<TurnRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT record_id, game_id, sequence, created_at, turn_data_json
             FROM turn_records
             WHERE game_id = ?1
             ORDER BY sequence ASC",
        )?;
        let rows = stmt.query_map(params![game_id.to_string()], read_turn_row)?;
        collect_turn_rows(rows)
    }

    /// Summarize every game with at least one record, oldest game first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_games(&self) -> Result<Vec<GameSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT game_id, COUNT(*), MIN(created_at), MAX(created_at)
             FROM turn_records
             GROUP BY game_id
             ORDER BY MIN(created_at) ASC, game_id ASC",
        )?;
        let mut rows = stmt.query([])?;
        let mut games = Vec::new();

        while let Some(row) = rows.next()? {
            let game_id_raw: String = row.get(0)?;
            let turn_count: i64 = row.get(1)?;
            games.push(GameSummary {
                game_id: parse_game_id(&game_id_raw)?,
                turn_count: u64::try_from(turn_count).context("turn count is negative")?,
                started_at: parse_rfc3339(&row.get::<_, String>(2)?)?,
                last_turn_at: parse_rfc3339(&row.get::<_, String>(3)?)?,
            });
        }

        Ok(games)
    }

    /// Run quick-check, per-game sequence contiguity, and schema status checks.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let mut sequence_gaps = Vec::new();
        if schema_status.current_version >= 1 {
            let mut stmt = self.conn.prepare(
                "SELECT game_id, COUNT(*), MIN(sequence), MAX(sequence)
                 FROM turn_records
                 GROUP BY game_id
                 HAVING MIN(sequence) != 1 OR MAX(sequence) != COUNT(*)
                 ORDER BY game_id ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SequenceGap {
                    game_id: row.get(0)?,
                    turn_count: row.get(1)?,
                    min_sequence: row.get(2)?,
                    max_sequence: row.get(3)?,
                })
            })?;
            for row in rows {
                sequence_gaps.push(row?);
            }
        }

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            sequence_gaps,
            schema_status,
        })
    }
}

/// Whether `err` was caused by SQLite giving up on a busy or locked database.
#[must_use]
pub fn is_busy_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        let code = cause
            .downcast_ref::<rusqlite::Error>()
            .and_then(rusqlite::Error::sqlite_error_code);
        matches!(
            code,
            Some(rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked)
        )
    })
}

fn last_sequence_in(conn: &Connection, game_id: GameId) -> Result<Option<u64>> {
    let last = conn
        .query_row(
            "SELECT MAX(sequence) FROM turn_records WHERE game_id = ?1",
            params![game_id.to_string()],
            |row| row.get::<_, Option<i64>>(0),
        )
        .optional()
        .context("failed to read last turn sequence")?
        .flatten();
    last.map(|value| u64::try_from(value).context("stored sequence is negative")).transpose()
}

fn read_turn_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TurnRow> {
    Ok(TurnRow {
        record_id: row.get(0)?,
        game_id: row.get(1)?,
        sequence: row.get(2)?,
        created_at: row.get(3)?,
        turn_data_json: row.get(4)?,
    })
}

fn collect_turn_rows(
    rows: impl Iterator<Item = rusqlite::Result<TurnRow>>,
) -> Result<Vec<TurnRecord>> {
    let mut records = Vec::new();
    for row in rows {
        let row = row?;
        records.push(TurnRecord {
            record_id: RecordId(parse_ulid(&row.record_id)?),
            game_id: parse_game_id(&row.game_id)?,
            sequence: u64::try_from(row.sequence).context("stored sequence is negative")?,
            created_at: parse_rfc3339(&row.created_at)?,
            turn_data: serde_json::from_str(&row.turn_data_json)
                .with_context(|| format!("failed to deserialize turn_data for {}", row.record_id))?,
        });
    }
    Ok(records)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = rfc3339(OffsetDateTime::now_utc())?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn to_sql_sequence(sequence: u64) -> Result<i64> {
    i64::try_from(sequence).context("sequence does not fit in i64")
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn parse_game_id(raw: &str) -> Result<GameId> {
    Ok(GameId(parse_ulid(raw)?))
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::thread;

    use super::*;

    fn migrated_memory_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    fn turn_payload(label: &str) -> serde_json::Value {
        serde_json::json!({
            "kind": "continuation",
            "chosen_action": format!("choice {label}"),
            "scene": {
                "scene_description": format!("scene {label}"),
                "options": [
                    {"action": "wait", "facet": "patience"},
                    {"action": "run", "facet": "impulsivity"},
                    {"action": "ask", "facet": "trust"},
                    {"action": "hide", "facet": "caution"}
                ],
                "symbolic_word": "quiet-dawn"
            }
        })
    }

    fn cleanup_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = if suffix.is_empty() {
                db_path.to_path_buf()
            } else {
                PathBuf::from(format!("{}{}", db_path.display(), suffix))
            };
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    // Test IDs: TDB-001
    #[test]
    fn appended_turn_round_trips_byte_identical() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_id = GameId::new();
        let payload = serde_json::json!({
            "kind": "opening",
            "player_name": "Ana",
            "archetype": "Explorer",
            "scene": {"scene_description": "ñandú at dusk", "options": [], "symbolic_word": "dusk"},
            "zeta": 1,
            "alpha": [true, null]
        });

        let written = store.append_turn(game_id, &payload)?;
        let fetched = store.fetch_recent(game_id, 10)?;

        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].record_id, written.record_id);
        assert_eq!(fetched[0].sequence, 1);
        assert_eq!(serde_json::to_string(&fetched[0].turn_data)?, serde_json::to_string(&payload)?);
        Ok(())
    }

    // Test IDs: TDB-002
    #[test]
    fn duplicate_payloads_are_stored_as_distinct_records() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_id = GameId::new();
        let payload = turn_payload("same");

        let first = store.append_turn(game_id, &payload)?;
        let second = store.append_turn(game_id, &payload)?;

        assert_ne!(first.record_id, second.record_id);
        assert_eq!((first.sequence, second.sequence), (1, 2));
        assert_eq!(store.count_turns(game_id)?, 2);
        Ok(())
    }

    // Test IDs: TDB-003
    #[test]
    fn recent_window_drops_oldest_turn_past_limit() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_id = GameId::new();
        for index in 1..=11 {
            store.append_turn(game_id, &turn_payload(&index.to_string()))?;
        }

        let window = store.fetch_recent(game_id, 10)?;
        let sequences = window.iter().map(|record| record.sequence).collect::<Vec<_>>();
        assert_eq!(sequences, (2..=11).collect::<Vec<_>>());
        assert_eq!(store.fetch_all(game_id)?.len(), 11);

        let ten_only = store.fetch_recent(game_id, 11)?;
        assert_eq!(ten_only.first().map(|record| record.sequence), Some(1));
        Ok(())
    }

    // Test IDs: TDB-004
    #[test]
    fn unknown_game_yields_empty_history_and_games_are_isolated() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_a = GameId::new();
        let game_b = GameId::new();
        store.append_turn(game_a, &turn_payload("a1"))?;
        store.append_turn(game_b, &turn_payload("b1"))?;
        store.append_turn(game_a, &turn_payload("a2"))?;

        assert!(store.fetch_recent(GameId::new(), 10)?.is_empty());
        assert_eq!(store.last_sequence(GameId::new())?, None);

        let history_a = store.fetch_all(game_a)?;
        assert_eq!(history_a.len(), 2);
        assert!(history_a.iter().all(|record| record.game_id == game_a));
        assert_eq!(store.fetch_all(game_b)?[0].sequence, 1);
        Ok(())
    }

    // Test IDs: TDB-005
    #[test]
    fn stale_compare_and_append_is_rejected() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_id = GameId::new();

        store.append_turn_after(game_id, None, &turn_payload("opening"))?;
        store.append_turn_after(game_id, Some(1), &turn_payload("first"))?;

        let err = match store.append_turn_after(game_id, Some(1), &turn_payload("sibling")) {
            Ok(record) => return Err(anyhow!("stale append unexpectedly stored {record:?}")),
            Err(err) => err,
        };
        let Some(conflict) = err.downcast_ref::<AppendConflict>() else {
            return Err(anyhow!("expected AppendConflict, got {err:#}"));
        };
        assert_eq!(conflict.expected, Some(1));
        assert_eq!(conflict.actual, Some(2));

        let again = store.append_turn_after(game_id, None, &turn_payload("reopen"));
        assert!(again.is_err());
        assert_eq!(store.count_turns(game_id)?, 2);
        Ok(())
    }

    // Test IDs: TDB-006
    #[test]
    fn stored_turns_cannot_be_updated_or_deleted() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_id = GameId::new();
        store.append_turn(game_id, &turn_payload("keep"))?;

        let update = store.conn.execute("UPDATE turn_records SET sequence = 9", []);
        assert!(update.is_err());
        let delete = store.conn.execute("DELETE FROM turn_records", []);
        assert!(delete.is_err());
        assert_eq!(store.count_turns(game_id)?, 1);
        Ok(())
    }

    // Test IDs: TDB-007
    #[test]
    fn non_object_payload_is_rejected() -> Result<()> {
        let mut store = migrated_memory_store()?;
        assert!(store.append_turn(GameId::new(), &serde_json::json!(["not", "an", "object"])).is_err());
        Ok(())
    }

    // Test IDs: TDB-008
    #[test]
    fn schema_status_reports_pending_then_up_to_date() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    // Test IDs: TDB-009
    #[test]
    fn list_games_and_integrity_check_report_clean_store() -> Result<()> {
        let mut store = migrated_memory_store()?;
        let game_a = GameId::new();
        let game_b = GameId::new();
        store.append_turn(game_a, &turn_payload("a1"))?;
        store.append_turn(game_a, &turn_payload("a2"))?;
        store.append_turn(game_b, &turn_payload("b1"))?;

        let games = store.list_games()?;
        assert_eq!(games.len(), 2);
        let Some(summary_a) = games.iter().find(|game| game.game_id == game_a) else {
            return Err(anyhow!("game {game_a} missing from listing"));
        };
        assert_eq!(summary_a.turn_count, 2);
        assert!(summary_a.started_at <= summary_a.last_turn_at);

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.sequence_gaps.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        Ok(())
    }

    // Test IDs: TDB-010
    #[test]
    fn held_write_lock_surfaces_as_busy_error() -> Result<()> {
        let db_path = std::env::temp_dir().join(format!("reverie-busy-{}.sqlite3", Ulid::new()));
        let mut holder = SqliteStore::open(&db_path)?;
        holder.migrate()?;
        holder.conn.execute_batch("BEGIN IMMEDIATE")?;

        let mut waiter = SqliteStore::open_with_busy_timeout(&db_path, Duration::from_millis(50))?;
        let err = match waiter.append_turn(GameId::new(), &turn_payload("blocked")) {
            Ok(record) => return Err(anyhow!("append should block, stored {record:?}")),
            Err(err) => err,
        };
        assert!(is_busy_error(&err), "expected busy error, got {err:#}");
        assert!(!is_busy_error(&anyhow!("unrelated failure")));

        holder.conn.execute_batch("ROLLBACK")?;
        drop(waiter);
        drop(holder);
        cleanup_sqlite_files(&db_path)
    }

    // Test IDs: TCONC-001
    #[test]
    fn concurrent_compare_and_append_admits_exactly_one_writer() -> Result<()> {
        let db_path =
            std::env::temp_dir().join(format!("reverie-concurrency-{}.sqlite3", Ulid::new()));
        let game_id = GameId::new();
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            init.append_turn_after(game_id, None, &turn_payload("opening"))?;
        }

        let writer_threads = 6;
        let mut handles = Vec::new();
        for index in 0..writer_threads {
            let writer_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<bool> {
                let mut store = SqliteStore::open(&writer_path)?;
                match store.append_turn_after(game_id, Some(1), &turn_payload(&index.to_string())) {
                    Ok(_) => Ok(true),
                    Err(err) if err.downcast_ref::<AppendConflict>().is_some() => Ok(false),
                    Err(err) => Err(err),
                }
            }));
        }

        let mut winners = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            if thread_result? {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        let store = SqliteStore::open(&db_path)?;
        assert_eq!(store.count_turns(game_id)?, 2);
        assert!(store.integrity_check()?.sequence_gaps.is_empty());

        drop(store);
        cleanup_sqlite_files(&db_path)
    }
}
