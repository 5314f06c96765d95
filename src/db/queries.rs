use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, Row};

use super::models::{ImportRecord, LibraryStats, NewTrack, Track, TrackAnalysis};
use super::{Database, Result, TrackStore};
use crate::keys::KeyRelation;
use crate::similarity::{EmbeddingMap, SimilarityResult};

const TRACK_COLUMNS: &str = "t.id, t.content_hash, t.file_path, t.title, t.artist, t.album,
    t.file_size, t.modified_at, t.created_at";

const ANALYSIS_COLUMNS: &str = "a.version, a.duration, a.bpm, a.bpm_confidence,
    a.key_value, a.key_format, a.key_confidence, a.energy_level,
    a.lufs, a.true_peak_db, a.loudness_range,
    a.waveform_preview, a.sections, a.cue_points,
    a.sound_context, a.qa_flags, a.has_embedding";

/// Number of columns in `TRACK_COLUMNS`; analysis columns follow at this offset.
const TRACK_COLUMN_COUNT: usize = 9;

/// Restricts a join to the newest analysis version of each track.
const LATEST_ANALYSIS: &str =
    "a.version = (SELECT MAX(version) FROM track_analyses WHERE track_id = t.id)";

/// Analysis row as stored; JSON columns are decoded outside the row closure
/// so serde errors surface as `DbError::Json`.
struct AnalysisRow {
    version: i64,
    duration: f64,
    bpm: f64,
    bpm_confidence: f64,
    key: String,
    key_format: String,
    key_confidence: f64,
    energy_level: i32,
    lufs: Option<f64>,
    true_peak_db: Option<f64>,
    loudness_range: Option<f64>,
    waveform_preview: String,
    sections: String,
    cue_points: String,
    sound_context: Option<String>,
    qa_flags: String,
    has_embedding: bool,
}

impl AnalysisRow {
    fn from_row(row: &Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            version: row.get(offset)?,
            duration: row.get(offset + 1)?,
            bpm: row.get(offset + 2)?,
            bpm_confidence: row.get(offset + 3)?,
            key: row.get(offset + 4)?,
            key_format: row.get(offset + 5)?,
            key_confidence: row.get(offset + 6)?,
            energy_level: row.get(offset + 7)?,
            lufs: row.get(offset + 8)?,
            true_peak_db: row.get(offset + 9)?,
            loudness_range: row.get(offset + 10)?,
            waveform_preview: row.get(offset + 11)?,
            sections: row.get(offset + 12)?,
            cue_points: row.get(offset + 13)?,
            sound_context: row.get(offset + 14)?,
            qa_flags: row.get(offset + 15)?,
            has_embedding: row.get(offset + 16)?,
        })
    }

    fn decode(self) -> Result<TrackAnalysis> {
        Ok(TrackAnalysis {
            version: self.version,
            duration: self.duration,
            bpm: self.bpm,
            bpm_confidence: self.bpm_confidence,
            key: self.key,
            key_format: self.key_format,
            key_confidence: self.key_confidence,
            energy_level: self.energy_level,
            lufs: self.lufs.unwrap_or(0.0),
            true_peak_db: self.true_peak_db.unwrap_or(0.0),
            loudness_range: self.loudness_range.unwrap_or(0.0),
            waveform_preview: serde_json::from_str(&self.waveform_preview)?,
            sections: serde_json::from_str(&self.sections)?,
            cue_points: serde_json::from_str(&self.cue_points)?,
            sound_context: self.sound_context,
            qa_flags: serde_json::from_str(&self.qa_flags)?,
            has_embedding: self.has_embedding,
        })
    }
}

fn track_from_row(row: &Row<'_>) -> rusqlite::Result<Track> {
    Ok(Track {
        id: row.get(0)?,
        content_hash: row.get(1)?,
        file_path: row.get(2)?,
        title: row.get(3)?,
        artist: row.get(4)?,
        album: row.get(5)?,
        file_size: row.get(6)?,
        modified_at: row.get(7)?,
        created_at: row.get(8)?,
        analysis: None,
    })
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

impl Database {
    /// Insert or update a track by file path. Returns the track id.
    pub fn upsert_track(&self, t: &NewTrack) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO tracks (
                content_hash, file_path, title, artist, album, file_size, modified_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(file_path) DO UPDATE SET
                content_hash = excluded.content_hash,
                title = excluded.title,
                artist = excluded.artist,
                album = excluded.album,
                file_size = excluded.file_size,
                modified_at = excluded.modified_at
            ",
            params![
                t.content_hash, t.file_path, t.title, t.artist, t.album,
                t.file_size, t.modified_at, Utc::now(),
            ],
        )?;

        let id: i64 = self.conn.query_row(
            "SELECT id FROM tracks WHERE file_path = ?1",
            params![t.file_path],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Store an analysis as the next version for the track. The `version`
    /// field of `a` is ignored. Returns the assigned version.
    pub fn store_analysis(&self, track_id: i64, a: &TrackAnalysis) -> Result<i64> {
        Self::store_analysis_row(&self.conn, track_id, a)
    }

    fn store_analysis_row(conn: &rusqlite::Connection, track_id: i64, a: &TrackAnalysis) -> Result<i64> {
        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) + 1 FROM track_analyses WHERE track_id = ?1",
            params![track_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO track_analyses (
                track_id, version, duration, bpm, bpm_confidence,
                key_value, key_format, key_confidence, energy_level,
                lufs, true_peak_db, loudness_range,
                waveform_preview, sections, cue_points,
                sound_context, qa_flags, has_embedding
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18)",
            params![
                track_id, version, a.duration, a.bpm, a.bpm_confidence,
                a.key, a.key_format, a.key_confidence, a.energy_level.clamp(0, 10),
                a.lufs, a.true_peak_db, a.loudness_range,
                serde_json::to_string(&a.waveform_preview)?,
                serde_json::to_string(&a.sections)?,
                serde_json::to_string(&a.cue_points)?,
                a.sound_context,
                serde_json::to_string(&a.qa_flags)?,
                a.has_embedding,
            ],
        )?;
        Self::clear_similarities_row(conn, track_id)?;
        Ok(version)
    }

    /// Cached pairs describe the previous analysis once a track changes.
    fn clear_similarities_row(conn: &rusqlite::Connection, track_id: i64) -> Result<()> {
        let removed = conn.execute(
            "DELETE FROM similarities WHERE track_a = ?1 OR track_b = ?1",
            params![track_id],
        )?;
        if removed > 0 {
            log::debug!("Track {track_id}: dropped {removed} cached similarity pairs");
        }
        Ok(())
    }

    /// Store an embedding under (track, analysis version) and flag the analysis.
    pub fn store_embedding(&self, track_id: i64, analysis_version: i64, vector: &[f32]) -> Result<()> {
        Self::store_embedding_row(&self.conn, track_id, analysis_version, vector)
    }

    fn store_embedding_row(
        conn: &rusqlite::Connection,
        track_id: i64,
        analysis_version: i64,
        vector: &[f32],
    ) -> Result<()> {
        if vector.len() != crate::EMBEDDING_DIM {
            log::warn!(
                "Track {track_id}: embedding has {} dimensions, expected {}",
                vector.len(),
                crate::EMBEDDING_DIM
            );
        }
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (track_id, analysis_version, dim, vector)
             VALUES (?1, ?2, ?3, ?4)",
            params![track_id, analysis_version, vector.len() as i64, encode_vector(vector)],
        )?;
        conn.execute(
            "UPDATE track_analyses SET has_embedding = 1 WHERE track_id = ?1 AND version = ?2",
            params![track_id, analysis_version],
        )?;
        Self::clear_similarities_row(conn, track_id)
    }

    /// Upsert a pipeline record (track, optional analysis, optional embedding)
    /// in one transaction. Returns the track id.
    pub fn import_record(&self, record: &ImportRecord) -> Result<i64> {
        let tx = self.conn.unchecked_transaction()?;
        let track_id = self.upsert_track(&record.track)?;

        if let Some(analysis) = &record.analysis {
            let version = Self::store_analysis_row(&tx, track_id, analysis)?;
            if let Some(vector) = &record.embedding {
                Self::store_embedding_row(&tx, track_id, version, vector)?;
            }
        } else if record.embedding.is_some() {
            log::warn!("{}: embedding without analysis, skipped", record.track.file_path);
        }

        tx.commit()?;
        Ok(track_id)
    }

    /// All tracks that have at least one analysis, with the latest attached.
    pub fn fetch_analyzed_tracks(&self) -> Result<Vec<Track>> {
        let sql = format!(
            "SELECT {TRACK_COLUMNS}, {ANALYSIS_COLUMNS}
             FROM tracks t
             JOIN track_analyses a ON a.track_id = t.id
             WHERE {LATEST_ANALYSIS}
             ORDER BY t.id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((track_from_row(row)?, AnalysisRow::from_row(row, TRACK_COLUMN_COUNT)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(mut track, analysis)| {
                track.analysis = Some(analysis.decode()?);
                Ok(track)
            })
            .collect()
    }

    /// Tracks by id in the requested order; unknown ids are skipped.
    pub fn fetch_tracks(&self, ids: &[i64]) -> Result<Vec<Track>> {
        let mut tracks = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.fetch_track(id)? {
                Some(t) => tracks.push(t),
                None => log::warn!("Track {id} not found, skipped"),
            }
        }
        Ok(tracks)
    }

    /// Latest embeddings for the given tracks. Tracks without one are absent.
    pub fn fetch_embeddings(&self, ids: &[i64]) -> Result<EmbeddingMap> {
        let mut map = EmbeddingMap::with_capacity(ids.len());
        for &id in ids {
            if let Some(v) = self.fetch_embedding(id)? {
                map.insert(id, v);
            }
        }
        Ok(map)
    }

    /// Write many results in a single transaction.
    pub fn store_similarities(&self, results: &[SimilarityResult]) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        for r in results {
            Self::insert_similarity_row(&tx, r)?;
        }
        tx.commit()?;
        Ok(())
    }

    fn insert_similarity_row(conn: &rusqlite::Connection, r: &SimilarityResult) -> Result<()> {
        if r.track_a == r.track_b {
            return Ok(());
        }
        let (a, b) = (r.track_a.min(r.track_b), r.track_a.max(r.track_b));
        let mut stmt = conn.prepare_cached(
            "INSERT OR REPLACE INTO similarities (
                track_a, track_b, embedding_similarity, tempo_similarity,
                key_similarity, energy_similarity, combined_score, key_relation,
                explanation, computed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
        )?;
        stmt.execute(params![
            a, b, r.embedding_similarity, r.tempo_similarity,
            r.key_similarity, r.energy_similarity, r.combined_score,
            r.key_relation.as_str(), r.explanation, Utc::now(),
        ])?;
        Ok(())
    }

    /// Cached result for an unordered pair, as it was stored.
    pub fn fetch_similarity(&self, a: i64, b: i64) -> Result<Option<SimilarityResult>> {
        let (lo, hi) = (a.min(b), a.max(b));
        let mut stmt = self.conn.prepare_cached(
            "SELECT track_a, track_b, embedding_similarity, tempo_similarity,
                    key_similarity, energy_similarity, combined_score,
                    key_relation, explanation
             FROM similarities WHERE track_a = ?1 AND track_b = ?2",
        )?;
        let result = stmt
            .query_row(
                params![lo, hi],
                |row| {
                    let relation: String = row.get(7)?;
                    Ok(SimilarityResult {
                        track_a: row.get(0)?,
                        track_b: row.get(1)?,
                        embedding_similarity: row.get(2)?,
                        tempo_similarity: row.get(3)?,
                        key_similarity: row.get(4)?,
                        energy_similarity: row.get(5)?,
                        combined_score: row.get(6)?,
                        key_relation: KeyRelation::parse(&relation),
                        explanation: row.get(8)?,
                    })
                },
            )
            .optional()?;
        Ok(result)
    }

    /// Register a library root. Returns false if it was already known.
    pub fn add_music_location(&self, path: &Path) -> Result<bool> {
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO music_locations (path) VALUES (?1)",
            params![path.to_string_lossy()],
        )?;
        Ok(changed > 0)
    }

    pub fn stats(&self) -> Result<LibraryStats> {
        let count = |sql: &str| -> Result<i64> { Ok(self.conn.query_row(sql, [], |row| row.get(0))?) };

        let total_tracks = count("SELECT COUNT(*) FROM tracks")?;
        let analyzed_tracks = count("SELECT COUNT(DISTINCT track_id) FROM track_analyses")?;
        let embedded_tracks = count("SELECT COUNT(DISTINCT track_id) FROM embeddings")?;
        let cached_pairs = count("SELECT COUNT(*) FROM similarities")?;

        let total_duration_hours: f64 = self.conn.query_row(
            &format!(
                "SELECT COALESCE(SUM(a.duration), 0.0) / 3600.0
                 FROM tracks t JOIN track_analyses a ON a.track_id = t.id
                 WHERE {LATEST_ANALYSIS}"
            ),
            [],
            |row| row.get(0),
        )?;

        let mut key_stmt = self.conn.prepare(&format!(
            "SELECT a.key_value, COUNT(*)
             FROM tracks t JOIN track_analyses a ON a.track_id = t.id
             WHERE {LATEST_ANALYSIS}
             GROUP BY a.key_value
             ORDER BY COUNT(*) DESC
             LIMIT 24"
        ))?;
        let keys: Vec<(String, i64)> = key_stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(LibraryStats {
            total_tracks,
            analyzed_tracks,
            embedded_tracks,
            cached_pairs,
            total_duration_hours,
            keys,
        })
    }
}

impl TrackStore for Database {
    fn fetch_track(&self, id: i64) -> Result<Option<Track>> {
        let sql = format!("SELECT {TRACK_COLUMNS} FROM tracks t WHERE t.id = ?1");
        let track = self.conn.query_row(&sql, params![id], track_from_row).optional()?;
        match track {
            Some(mut t) => {
                t.analysis = self.fetch_analysis(id)?;
                Ok(Some(t))
            }
            None => Ok(None),
        }
    }

    fn fetch_analysis(&self, track_id: i64) -> Result<Option<TrackAnalysis>> {
        let sql = format!(
            "SELECT {ANALYSIS_COLUMNS} FROM track_analyses a
             WHERE a.track_id = ?1 ORDER BY a.version DESC LIMIT 1"
        );
        let row = self
            .conn
            .query_row(&sql, params![track_id], |row| AnalysisRow::from_row(row, 0))
            .optional()?;
        row.map(AnalysisRow::decode).transpose()
    }

    fn fetch_embedding(&self, track_id: i64) -> Result<Option<Vec<f32>>> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT e.vector FROM embeddings e
                 WHERE e.track_id = ?1
                   AND e.analysis_version =
                       (SELECT MAX(version) FROM track_analyses WHERE track_id = ?1)",
                params![track_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(blob.map(|b| decode_vector(&b)))
    }

    fn insert_similarity(&self, result: &SimilarityResult) -> Result<()> {
        Self::insert_similarity_row(&self.conn, result)
    }

    fn fetch_music_locations(&self) -> Result<Vec<PathBuf>> {
        let mut stmt = self.conn.prepare("SELECT path FROM music_locations ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .map(|r| r.map(PathBuf::from))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }
}
