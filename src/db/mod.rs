pub mod models;
pub mod queries;

use rusqlite::Connection;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::similarity::SimilarityResult;
use models::{Track, TrackAnalysis};

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Migration failed: {0}")]
    Migration(String),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// What the analytical core needs from a library store. Every lookup may come
/// back empty; callers never assume freshness.
pub trait TrackStore {
    fn fetch_track(&self, id: i64) -> Result<Option<Track>>;
    fn fetch_analysis(&self, track_id: i64) -> Result<Option<TrackAnalysis>>;
    fn fetch_embedding(&self, track_id: i64) -> Result<Option<Vec<f32>>>;
    fn insert_similarity(&self, result: &SimilarityResult) -> Result<()>;
    fn fetch_music_locations(&self) -> Result<Vec<PathBuf>>;
}

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        // WAL mode for better concurrent read performance
        self.conn.pragma_update(None, "journal_mode", "WAL")?;
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", "ON")?;
        self.migrate()?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        let version: i32 = self
            .conn
            .pragma_query_value(None, "user_version", |row| row.get(0))
            .unwrap_or(0);

        if version > SCHEMA_VERSION {
            return Err(DbError::Migration(format!(
                "database schema v{version} is newer than this build (v{SCHEMA_VERSION})"
            )));
        }
        if version < 1 {
            self.migrate_v1()?;
        }
        if version < 2 {
            self.migrate_v2()?;
        }

        self.conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(())
    }

    /// V1: tracks, versioned analyses, embeddings
    fn migrate_v1(&self) -> Result<()> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS tracks (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash    TEXT NOT NULL,
                file_path       TEXT NOT NULL UNIQUE,
                title           TEXT NOT NULL,
                artist          TEXT NOT NULL DEFAULT '',
                album           TEXT,
                file_size       INTEGER NOT NULL DEFAULT 0,
                modified_at     TEXT NOT NULL,
                created_at      TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tracks_hash ON tracks(content_hash);
            CREATE INDEX IF NOT EXISTS idx_tracks_artist ON tracks(artist);

            CREATE TABLE IF NOT EXISTS track_analyses (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                track_id        INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                version         INTEGER NOT NULL,

                duration        REAL NOT NULL,
                bpm             REAL NOT NULL,
                bpm_confidence  REAL NOT NULL DEFAULT 0,
                key_value       TEXT NOT NULL DEFAULT '',
                key_format      TEXT NOT NULL DEFAULT 'camelot',
                key_confidence  REAL NOT NULL DEFAULT 0,
                energy_level    INTEGER NOT NULL DEFAULT 0,

                lufs            REAL,
                true_peak_db    REAL,
                loudness_range  REAL,

                -- JSON columns
                waveform_preview TEXT NOT NULL DEFAULT '[]',
                sections         TEXT NOT NULL DEFAULT '[]',
                cue_points       TEXT NOT NULL DEFAULT '[]',

                has_embedding   INTEGER NOT NULL DEFAULT 0,
                analyzed_at     TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE(track_id, version)
            );

            CREATE INDEX IF NOT EXISTS idx_analyses_track ON track_analyses(track_id);
            CREATE INDEX IF NOT EXISTS idx_analyses_key ON track_analyses(key_value);
            CREATE INDEX IF NOT EXISTS idx_analyses_bpm ON track_analyses(bpm);

            CREATE TABLE IF NOT EXISTS embeddings (
                track_id         INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                analysis_version INTEGER NOT NULL,
                dim              INTEGER NOT NULL,
                vector           BLOB NOT NULL,
                PRIMARY KEY (track_id, analysis_version)
            );
            ",
        )?;
        Ok(())
    }

    /// V2: QA metadata on analyses, similarity cache, music locations
    fn migrate_v2(&self) -> Result<()> {
        for col in ["sound_context TEXT", "qa_flags TEXT NOT NULL DEFAULT '[]'"] {
            try_add_column(&self.conn, "track_analyses", col)?;
        }

        self.conn.execute_batch(
            "
            -- Unordered pair cache: track_a < track_b always
            CREATE TABLE IF NOT EXISTS similarities (
                track_a              INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                track_b              INTEGER NOT NULL REFERENCES tracks(id) ON DELETE CASCADE,
                embedding_similarity REAL NOT NULL,
                tempo_similarity     REAL NOT NULL,
                key_similarity       REAL NOT NULL,
                energy_similarity    REAL NOT NULL,
                combined_score       REAL NOT NULL,
                key_relation         TEXT NOT NULL,
                explanation          TEXT NOT NULL,
                computed_at          TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (track_a, track_b),
                CHECK (track_a < track_b)
            );
            CREATE INDEX IF NOT EXISTS idx_similarities_b ON similarities(track_b);

            CREATE TABLE IF NOT EXISTS music_locations (
                id        INTEGER PRIMARY KEY AUTOINCREMENT,
                path      TEXT NOT NULL UNIQUE,
                added_at  TEXT NOT NULL DEFAULT (datetime('now'))
            );
            ",
        )?;
        Ok(())
    }
}

const SCHEMA_VERSION: i32 = 2;

/// Add a column, ignoring "duplicate column" failures from a re-run.
fn try_add_column(conn: &Connection, table: &str, column_def: &str) -> Result<()> {
    let sql = format!("ALTER TABLE {table} ADD COLUMN {column_def}");
    match conn.execute(&sql, []) {
        Ok(_) => Ok(()),
        Err(rusqlite::Error::SqliteFailure(err, Some(msg)))
            if err.code == rusqlite::ffi::ErrorCode::Unknown && msg.contains("duplicate column") =>
        {
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
