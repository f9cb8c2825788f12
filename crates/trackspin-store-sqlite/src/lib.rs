use std::fmt::Display;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use trackspin_core::{
    CandidateSet, Catalog, HistoryStore, SimilarTracks, StoreError, TasteProfile, TasteProfiles,
    Track, TrackId, UserId,
};

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tracks (
  track_id INTEGER PRIMARY KEY,
  track_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS taste_profiles (
  user_id INTEGER PRIMARY KEY,
  tracks_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS listen_history (
  user_id INTEGER PRIMARY KEY,
  tracks_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreStats {
    pub tracks: usize,
    pub taste_profiles: usize,
    pub listen_histories: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub schema_status: SchemaStatus,
}

/// SQLite-backed key-value storage for the three recommendation stores:
/// catalog tracks (whose records carry the similarity pools), per-user taste
/// profiles, and per-user listen history. Values are JSON, written and read
/// through `serde_json`.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot
    /// be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let conn = self.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&conn)?;
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

    /// Apply all forward migrations up to the latest supported schema
    /// version. Idempotent.
    ///
    /// # Errors
    /// Returns an error when a migration step fails.
    pub fn migrate(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&conn)?;
        if version < 1 {
            conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&conn, 1)?;
        }

        let version = current_schema_version(&conn)?;
        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    /// Bulk-upsert catalog tracks. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error when serialization or any insert fails.
    pub fn upload_tracks(&self, tracks: &[Track]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("failed to start track upload transaction")?;
        for track in tracks {
            let track_json = serde_json::to_string(track)
                .with_context(|| format!("failed to serialize track {}", track.track))?;
            tx.execute(
                "INSERT INTO tracks(track_id, track_json) VALUES (?1, ?2)
                 ON CONFLICT(track_id) DO UPDATE SET track_json = excluded.track_json",
                params![track.track.0, track_json],
            )
            .with_context(|| format!("failed to upsert track {}", track.track))?;
        }
        tx.commit().context("failed to commit track upload")?;
        Ok(tracks.len())
    }

    /// Bulk-upsert taste profiles. Returns the number of rows written.
    ///
    /// # Errors
    /// Returns an error when serialization or any insert fails.
    pub fn upload_taste_profiles(&self, profiles: &[TasteProfile]) -> Result<usize> {
        let mut conn = self.lock();
        let tx = conn.transaction().context("failed to start taste upload transaction")?;
        for profile in profiles {
            let tracks_json = serde_json::to_string(&profile.tracks)
                .with_context(|| format!("failed to serialize taste profile {}", profile.user))?;
            tx.execute(
                "INSERT INTO taste_profiles(user_id, tracks_json) VALUES (?1, ?2)
                 ON CONFLICT(user_id) DO UPDATE SET tracks_json = excluded.tracks_json",
                params![profile.user.0, tracks_json],
            )
            .with_context(|| format!("failed to upsert taste profile {}", profile.user))?;
        }
        tx.commit().context("failed to commit taste upload")?;
        Ok(profiles.len())
    }

    /// Fetch one catalog record.
    ///
    /// # Errors
    /// Returns an error when the read or the stored JSON fails.
    pub fn get_track(&self, track: TrackId) -> Result<Option<Track>> {
        let conn = self.lock();
        let track_json: Option<String> = conn
            .query_row("SELECT track_json FROM tracks WHERE track_id = ?1", params![track.0], |row| {
                row.get(0)
            })
            .optional()
            .with_context(|| format!("failed to read track {track}"))?;

        match track_json {
            Some(track_json) => {
                let track = serde_json::from_str(&track_json)
                    .with_context(|| format!("stored track {track} is not valid JSON"))?;
                Ok(Some(track))
            }
            None => Ok(None),
        }
    }

    /// Row counts for the three stores.
    ///
    /// # Errors
    /// Returns an error when any count query fails.
    pub fn stats(&self) -> Result<StoreStats> {
        let conn = self.lock();
        Ok(StoreStats {
            tracks: count_rows(&conn, "tracks")?,
            taste_profiles: count_rows(&conn, "taste_profiles")?,
            listen_histories: count_rows(&conn, "listen_history")?,
        })
    }

    /// Run `PRAGMA quick_check` and report it with the schema status.
    ///
    /// # Errors
    /// Returns an error when the pragma or schema inspection fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = {
            let conn = self.lock();
            conn.query_row("PRAGMA quick_check", [], |row| row.get(0))
                .context("failed to run quick_check")?
        };
        let schema_status = self.schema_status()?;

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            schema_status,
        })
    }
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version: Option<i64> = conn
        .query_row("SELECT MAX(version) FROM schema_migrations", [], |row| row.get(0))
        .context("failed to read schema version")?;
    Ok(version.unwrap_or(0))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let applied_at = OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("failed to format migration timestamp")?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, applied_at],
    )
    .with_context(|| format!("failed to record schema version {version}"))?;
    Ok(())
}

fn count_rows(conn: &Connection, table: &str) -> Result<usize> {
    let count: i64 = conn
        .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
        .with_context(|| format!("failed to count rows in {table}"))?;
    Ok(usize::try_from(count).unwrap_or(0))
}

fn read_err(err: impl Display) -> StoreError {
    StoreError::Read(err.to_string())
}

fn codec_err(err: impl Display) -> StoreError {
    StoreError::Codec(err.to_string())
}

impl SimilarTracks for SqliteStore {
    fn similar_to(&self, track: TrackId) -> Result<Option<CandidateSet>, StoreError> {
        let conn = self.lock();
        let track_json: Option<String> = conn
            .query_row("SELECT track_json FROM tracks WHERE track_id = ?1", params![track.0], |row| {
                row.get(0)
            })
            .optional()
            .map_err(read_err)?;

        let Some(track_json) = track_json else {
            return Ok(None);
        };
        let record: Track = serde_json::from_str(&track_json).map_err(codec_err)?;
        if record.recommendations.is_empty() {
            // An empty similarity list is as unusable as a missing track.
            return Ok(None);
        }
        Ok(Some(record.recommendations.into_iter().collect()))
    }
}

impl TasteProfiles for SqliteStore {
    fn taste_of(&self, user: UserId) -> Result<Option<CandidateSet>, StoreError> {
        let conn = self.lock();
        let tracks_json: Option<String> = conn
            .query_row(
                "SELECT tracks_json FROM taste_profiles WHERE user_id = ?1",
                params![user.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?;

        let Some(tracks_json) = tracks_json else {
            return Ok(None);
        };
        let tracks: Vec<TrackId> = serde_json::from_str(&tracks_json).map_err(codec_err)?;
        Ok(Some(tracks.into_iter().collect()))
    }
}

impl HistoryStore for SqliteStore {
    fn load(&self, user: UserId) -> Result<Option<Vec<TrackId>>, StoreError> {
        let conn = self.lock();
        let tracks_json: Option<String> = conn
            .query_row(
                "SELECT tracks_json FROM listen_history WHERE user_id = ?1",
                params![user.0],
                |row| row.get(0),
            )
            .optional()
            .map_err(read_err)?;

        match tracks_json {
            Some(tracks_json) => {
                let history = serde_json::from_str(&tracks_json).map_err(codec_err)?;
                Ok(Some(history))
            }
            None => Ok(None),
        }
    }

    fn save(&self, user: UserId, history: &[TrackId]) -> Result<(), StoreError> {
        let tracks_json = serde_json::to_string(history).map_err(codec_err)?;
        let updated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|err| StoreError::Write(err.to_string()))?;
        let conn = self.lock();
        conn.execute(
            "INSERT INTO listen_history(user_id, tracks_json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id) DO UPDATE
             SET tracks_json = excluded.tracks_json, updated_at = excluded.updated_at",
            params![user.0, tracks_json, updated_at],
        )
        .map_err(|err| StoreError::Write(err.to_string()))?;
        Ok(())
    }
}

impl Catalog for SqliteStore {
    fn track_ids(&self) -> Result<Vec<TrackId>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT track_id FROM tracks ORDER BY track_id ASC").map_err(read_err)?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0)).map_err(read_err)?;

        let mut track_ids = Vec::new();
        for row in rows {
            track_ids.push(TrackId(row.map_err(read_err)?));
        }
        Ok(track_ids)
    }
}
