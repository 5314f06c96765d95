use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::Track;
use crate::db::Database;
use crate::keys::{self, KeyRelation};

/// Tempo difference (BPM) treated as identical.
const TEMPO_EXACT: f64 = 1.0;
/// Tempo difference (BPM) at which tempo similarity reaches zero.
const TEMPO_LIMIT: f64 = 10.0;

/// Track id → embedding vector, as loaded from the store.
pub type EmbeddingMap = HashMap<i64, Vec<f32>>;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("Similarity sweep cancelled after {completed} pairs")]
    Cancelled { completed: usize },
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Thread pool error: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),
}

/// Relative weight of each similarity axis in the combined score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityWeights {
    pub embedding: f64,
    pub tempo: f64,
    pub key: f64,
    pub energy: f64,
}

impl Default for SimilarityWeights {
    fn default() -> Self {
        Self {
            embedding: 0.50,
            tempo: 0.20,
            key: 0.20,
            energy: 0.10,
        }
    }
}

/// Explained similarity between two tracks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityResult {
    pub track_a: i64,
    pub track_b: i64,
    pub embedding_similarity: f64,
    pub tempo_similarity: f64,
    pub key_similarity: f64,
    pub energy_similarity: f64,
    pub combined_score: f64,
    pub key_relation: KeyRelation,
    pub explanation: String,
}

impl SimilarityResult {
    fn missing(track_a: i64, track_b: i64) -> Self {
        Self {
            track_a,
            track_b,
            embedding_similarity: 0.0,
            tempo_similarity: 0.0,
            key_similarity: 0.0,
            energy_similarity: 0.0,
            combined_score: 0.0,
            key_relation: KeyRelation::Unknown,
            explanation: "Missing analysis data".to_string(),
        }
    }

    /// The other track of the pair, seen from `id`.
    pub fn other(&self, id: i64) -> i64 {
        if self.track_a == id { self.track_b } else { self.track_a }
    }
}

/// Scores track pairs. Holds only configuration, so one instance can be
/// shared freely across threads.
#[derive(Debug, Clone, Default)]
pub struct SimilarityScorer {
    weights: SimilarityWeights,
}

impl SimilarityScorer {
    pub fn new(weights: SimilarityWeights) -> Self {
        Self { weights }
    }

    /// Score one pair. Never fails: missing analysis gives a zero result.
    pub fn score(
        &self,
        a: &Track,
        b: &Track,
        embedding_a: Option<&[f32]>,
        embedding_b: Option<&[f32]>,
    ) -> SimilarityResult {
        let (Some(aa), Some(ab)) = (a.analysis.as_ref(), b.analysis.as_ref()) else {
            return SimilarityResult::missing(a.id, b.id);
        };

        let embedding = match (embedding_a, embedding_b) {
            (Some(ea), Some(eb)) => embedding_similarity(ea, eb),
            _ => 0.0,
        };
        let tempo = tempo_similarity(aa.bpm, ab.bpm);
        let key_a = aa.camelot_key();
        let key_b = ab.camelot_key();
        let key = keys::compatibility(&key_a, &key_b);
        let energy = energy_similarity(aa.energy_level, ab.energy_level);

        let w = &self.weights;
        let combined = (w.embedding * embedding + w.tempo * tempo + w.key * key.similarity + w.energy * energy)
            .clamp(0.0, 1.0);

        let explanation = explain(&Explained {
            embedding,
            embeddings_present: embedding_a.is_some() && embedding_b.is_some(),
            bpm_a: aa.bpm,
            bpm_b: ab.bpm,
            tempo,
            key_a: &key_a,
            key_b: &key_b,
            relation: key.relation,
            energy_a: aa.energy_level,
            energy_b: ab.energy_level,
        });

        SimilarityResult {
            track_a: a.id,
            track_b: b.id,
            embedding_similarity: embedding,
            tempo_similarity: tempo,
            key_similarity: key.similarity,
            energy_similarity: energy,
            combined_score: combined,
            key_relation: key.relation,
            explanation,
        }
    }

    /// Top `limit` candidates for `target`, best first. The target itself is skipped.
    pub fn find_similar(
        &self,
        target: &Track,
        candidates: &[Track],
        embeddings: &EmbeddingMap,
        limit: usize,
    ) -> Vec<SimilarityResult> {
        let target_emb = embeddings.get(&target.id).map(Vec::as_slice);
        let mut results: Vec<SimilarityResult> = candidates
            .iter()
            .filter(|c| c.id != target.id)
            .map(|c| self.score(target, c, target_emb, embeddings.get(&c.id).map(Vec::as_slice)))
            .collect();
        sort_by_score(&mut results);
        results.truncate(limit);
        results
    }

    /// Score every unordered pair in `tracks`, in parallel on the current rayon
    /// pool. `cancel` is checked before each pair.
    pub fn all_pairs(
        &self,
        tracks: &[Track],
        embeddings: &EmbeddingMap,
        cancel: &AtomicBool,
        progress: Option<&ProgressBar>,
    ) -> Result<Vec<SimilarityResult>, SimilarityError> {
        let n = tracks.len();
        let per_row: Vec<Option<Vec<SimilarityResult>>> = (0..n)
            .into_par_iter()
            .map(|i| {
                let mut row = Vec::with_capacity(n - i - 1);
                for j in (i + 1)..n {
                    if cancel.load(Ordering::Relaxed) {
                        return None;
                    }
                    row.push(self.score(
                        &tracks[i],
                        &tracks[j],
                        embeddings.get(&tracks[i].id).map(Vec::as_slice),
                        embeddings.get(&tracks[j].id).map(Vec::as_slice),
                    ));
                }
                if let Some(pb) = progress {
                    pb.inc(1);
                }
                Some(row)
            })
            .collect();

        let completed: usize = per_row.iter().flatten().map(Vec::len).sum();
        if cancel.load(Ordering::Relaxed) || per_row.iter().any(Option::is_none) {
            return Err(SimilarityError::Cancelled { completed });
        }
        Ok(per_row.into_iter().flatten().flatten().collect())
    }
}

pub fn sort_by_score(results: &mut [SimilarityResult]) {
    results.sort_by(|a, b| {
        b.combined_score
            .partial_cmp(&a.combined_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Outcome of a stored all-pairs sweep.
pub struct SweepResult {
    pub tracks_processed: usize,
    pub pairs_stored: usize,
}

/// Score all analyzed tracks pairwise and store the results in the cache.
pub fn compute_similarity(
    db: &Database,
    scorer: &SimilarityScorer,
    jobs: usize,
    cancel: &AtomicBool,
) -> Result<SweepResult, SimilarityError> {
    let tracks = db.fetch_analyzed_tracks()?;
    let n = tracks.len();

    if n < 2 {
        return Ok(SweepResult {
            tracks_processed: n,
            pairs_stored: 0,
        });
    }

    let ids: Vec<i64> = tracks.iter().map(|t| t.id).collect();
    let embeddings = db.fetch_embeddings(&ids)?;
    log::info!(
        "Scoring {} tracks ({} with embeddings), {} pairs",
        n,
        embeddings.len(),
        n * (n - 1) / 2
    );

    let pb = ProgressBar::new(n as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} tracks ({eta} remaining)")
            .unwrap()
            .progress_chars("=>-"),
    );

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let results = pool.install(|| scorer.all_pairs(&tracks, &embeddings, cancel, Some(&pb)));
    pb.finish_and_clear();
    let results = results?;

    log::info!("Storing {} similarity pairs", results.len());
    db.store_similarities(&results)?;

    Ok(SweepResult {
        tracks_processed: n,
        pairs_stored: results.len(),
    })
}

/// Rank `candidates` against `target` like [`SimilarityScorer::find_similar`],
/// reading pairs from the similarity cache when a sweep has stored them.
pub fn find_similar_cached(
    db: &Database,
    scorer: &SimilarityScorer,
    target: &Track,
    candidates: &[Track],
    embeddings: &EmbeddingMap,
    limit: usize,
) -> Result<Vec<SimilarityResult>, SimilarityError> {
    let target_emb = embeddings.get(&target.id).map(Vec::as_slice);
    let mut results = Vec::with_capacity(candidates.len());
    let mut hits = 0;

    for c in candidates.iter().filter(|c| c.id != target.id) {
        match db.fetch_similarity(target.id, c.id)? {
            Some(cached) => {
                hits += 1;
                results.push(cached);
            }
            None => results.push(scorer.score(
                target,
                c,
                target_emb,
                embeddings.get(&c.id).map(Vec::as_slice),
            )),
        }
    }
    log::debug!("Track {}: {} of {} pairs from cache", target.id, hits, results.len());

    sort_by_score(&mut results);
    results.truncate(limit);
    Ok(results)
}

/// Cosine similarity in [-1, 1]. Zero norms give 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let mut dot = 0.0_f64;
    let mut norm_a = 0.0_f64;
    let mut norm_b = 0.0_f64;

    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (x as f64, y as f64);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 { 0.0 } else { (dot / denom).clamp(-1.0, 1.0) }
}

/// Cosine similarity remapped to [0, 1]; 0 for empty or mismatched vectors.
pub fn embedding_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    (cosine_similarity(a, b) + 1.0) / 2.0
}

/// Tempo closeness with half/double-time equivalence.
pub fn tempo_similarity(bpm_a: f64, bpm_b: f64) -> f64 {
    let d = (bpm_a - bpm_b)
        .abs()
        .min((bpm_a - 2.0 * bpm_b).abs())
        .min((2.0 * bpm_a - bpm_b).abs());
    if !d.is_finite() {
        0.0
    } else if d <= TEMPO_EXACT {
        1.0
    } else if d >= TEMPO_LIMIT {
        0.0
    } else {
        1.0 - d / TEMPO_LIMIT
    }
}

/// Closeness of two 0-10 energy levels.
pub fn energy_similarity(a: i32, b: i32) -> f64 {
    (1.0 - (a - b).abs() as f64 / 10.0).max(0.0)
}

struct Explained<'a> {
    embedding: f64,
    embeddings_present: bool,
    bpm_a: f64,
    bpm_b: f64,
    tempo: f64,
    key_a: &'a str,
    key_b: &'a str,
    relation: KeyRelation,
    energy_a: i32,
    energy_b: i32,
}

fn explain(e: &Explained<'_>) -> String {
    let mut clauses = Vec::with_capacity(5);

    let pct = (e.embedding * 100.0).round() as i64;
    clauses.push(if !e.embeddings_present || e.embedding <= 0.0 {
        "no vibe data".to_string()
    } else if e.embedding >= 0.85 {
        format!("similar vibe ({pct}%)")
    } else if e.embedding >= 0.7 {
        format!("moderate vibe match ({pct}%)")
    } else if e.embedding >= 0.5 {
        format!("weak vibe match ({pct}%)")
    } else {
        format!("no vibe match ({pct}%)")
    });

    let bpm_delta = e.bpm_b - e.bpm_a;
    clauses.push(if bpm_delta.abs() < 0.5 {
        "tempo match".to_string()
    } else {
        format!("{:+.1} BPM", bpm_delta)
    });

    clauses.push(match e.relation {
        KeyRelation::Same => "same key".to_string(),
        rel => format!("{}\u{2192}{} ({})", e.key_a, e.key_b, rel),
    });

    let energy_delta = e.energy_b - e.energy_a;
    clauses.push(match energy_delta {
        0 => "same energy".to_string(),
        d if d > 0 => format!("energy +{d}"),
        d => format!("energy \u{2212}{}", d.abs()),
    });

    if e.tempo >= 0.9 {
        clauses.push("beat-grid aligned".to_string());
    }

    clauses.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{NewTrack, TrackAnalysis};
    use chrono::Utc;

    fn track(id: i64, bpm: f64, key: &str, energy: i32) -> Track {
        Track {
            id,
            content_hash: format!("hash{id}"),
            file_path: format!("/music/{id}.flac"),
            title: format!("Track {id}"),
            artist: "Artist".to_string(),
            album: None,
            file_size: 1000,
            modified_at: Utc::now(),
            created_at: Utc::now(),
            analysis: Some(TrackAnalysis {
                version: 1,
                duration: 300.0,
                bpm,
                key: key.to_string(),
                energy_level: energy,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_cosine_identical() {
        let a = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-10);
    }

    #[test]
    fn test_cosine_opposite() {
        let a = vec![1.0, 2.0, 3.0];
        let b = vec![-1.0, -2.0, -3.0];
        assert!((cosine_similarity(&a, &b) + 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_symmetric() {
        let a = vec![0.3, -1.2, 4.0, 0.0];
        let b = vec![2.0, 0.5, -0.7, 1.1];
        assert_eq!(cosine_similarity(&a, &b), cosine_similarity(&b, &a));
    }

    #[test]
    fn test_embedding_similarity_degenerate() {
        assert_eq!(embedding_similarity(&[], &[]), 0.0);
        assert_eq!(embedding_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        // Zero vector: cosine 0 maps to the midpoint.
        assert!((embedding_similarity(&[0.0, 0.0], &[1.0, 0.0]) - 0.5).abs() < 1e-12);
        assert!((embedding_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_tempo_similarity() {
        assert_eq!(tempo_similarity(128.0, 128.0), 1.0);
        assert_eq!(tempo_similarity(64.0, 128.0), 1.0);
        assert_eq!(tempo_similarity(128.0, 64.0), 1.0);
        assert!(tempo_similarity(128.0, 140.0) < tempo_similarity(128.0, 130.0));
        assert!((tempo_similarity(128.0, 133.0) - 0.5).abs() < 1e-12);
        assert_eq!(tempo_similarity(100.0, 150.0), 0.0);
    }

    #[test]
    fn test_energy_similarity() {
        assert_eq!(energy_similarity(5, 5), 1.0);
        assert!((energy_similarity(2, 7) - 0.5).abs() < 1e-12);
        assert_eq!(energy_similarity(0, 10), 0.0);
    }

    #[test]
    fn test_missing_analysis_is_zero_result() {
        let a = track(1, 128.0, "8A", 5);
        let mut b = track(2, 128.0, "8A", 5);
        b.analysis = None;
        let r = SimilarityScorer::default().score(&a, &b, None, None);
        assert_eq!(r.combined_score, 0.0);
        assert_eq!(r.key_relation, KeyRelation::Unknown);
        assert_eq!(r.explanation, "Missing analysis data");
    }

    #[test]
    fn test_identical_tracks_without_embeddings() {
        let a = track(1, 128.0, "8A", 6);
        let b = track(2, 128.0, "8A", 6);
        let r = SimilarityScorer::default().score(&a, &b, None, None);
        // embedding axis is 0, the other three are 1.0
        assert!((r.combined_score - 0.5).abs() < 1e-12);
        assert_eq!(
            r.explanation,
            "no vibe data, tempo match, same key, same energy, beat-grid aligned"
        );
    }

    #[test]
    fn test_explanation_clauses() {
        let a = track(1, 124.0, "8A", 4);
        let b = track(2, 126.0, "9A", 7);
        let emb = vec![1.0_f32, 0.0];
        let r = SimilarityScorer::default().score(&a, &b, Some(&emb), Some(&emb));
        assert_eq!(
            r.explanation,
            "similar vibe (100%), +2.0 BPM, 8A\u{2192}9A (compatible), energy +3"
        );

        let r = SimilarityScorer::default().score(&b, &a, None, None);
        assert!(r.explanation.contains("-2.0 BPM"));
        assert!(r.explanation.contains("energy \u{2212}3"));
    }

    #[test]
    fn test_standard_key_format_is_converted() {
        let a = track(1, 128.0, "8A", 5);
        let mut b = track(2, 128.0, "Am", 5);
        if let Some(an) = b.analysis.as_mut() {
            an.key_format = "standard".to_string();
        }
        let r = SimilarityScorer::default().score(&a, &b, None, None);
        assert_eq!(r.key_relation, KeyRelation::Same);
    }

    #[test]
    fn test_combined_score_in_unit_range() {
        let heavy = SimilarityWeights {
            embedding: 2.0,
            tempo: 2.0,
            key: 2.0,
            energy: 2.0,
        };
        let scorer = SimilarityScorer::new(heavy);
        let emb = vec![0.5_f32; 8];
        for (bpm, key, energy) in [(128.0, "8A", 5), (90.0, "3B", 0), (174.0, "xx", 10)] {
            let a = track(1, 128.0, "8A", 5);
            let b = track(2, bpm, key, energy);
            let r = scorer.score(&a, &b, Some(&emb), Some(&emb));
            assert!((0.0..=1.0).contains(&r.combined_score));
            let r = SimilarityScorer::default().score(&a, &b, None, Some(&emb));
            assert!((0.0..=1.0).contains(&r.combined_score));
        }
    }

    #[test]
    fn test_find_similar_sorted_and_excludes_self() {
        let target = track(1, 128.0, "8A", 5);
        let candidates = vec![
            track(1, 128.0, "8A", 5),
            track(2, 100.0, "3B", 1),
            track(3, 128.0, "8A", 5),
            track(4, 126.0, "9A", 6),
        ];
        let results = SimilarityScorer::default().find_similar(&target, &candidates, &EmbeddingMap::new(), 10);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].track_b, 3);
        assert_eq!(results[2].track_b, 2);
        assert!(results.windows(2).all(|w| w[0].combined_score >= w[1].combined_score));
    }

    #[test]
    fn test_all_pairs_counts_and_cancel() {
        let tracks: Vec<Track> = (1..=5).map(|i| track(i, 120.0 + i as f64, "8A", 5)).collect();
        let scorer = SimilarityScorer::default();

        let cancel = AtomicBool::new(false);
        let pairs = scorer.all_pairs(&tracks, &EmbeddingMap::new(), &cancel, None).unwrap();
        assert_eq!(pairs.len(), 10);
        assert!(pairs.iter().all(|p| p.track_a < p.track_b));

        let cancel = AtomicBool::new(true);
        let err = scorer.all_pairs(&tracks, &EmbeddingMap::new(), &cancel, None);
        assert!(matches!(err, Err(SimilarityError::Cancelled { .. })));
    }

    fn stored_library(db: &Database, specs: &[(f64, &str, i32)]) -> Vec<Track> {
        for (i, &(bpm, key, energy)) in specs.iter().enumerate() {
            let id = db
                .upsert_track(&NewTrack {
                    content_hash: format!("hash{i}"),
                    file_path: format!("/music/{i}.flac"),
                    title: format!("Track {i}"),
                    artist: "Artist".to_string(),
                    album: None,
                    file_size: 1000,
                    modified_at: Utc::now(),
                })
                .unwrap();
            let analysis = TrackAnalysis {
                duration: 300.0,
                bpm,
                key: key.to_string(),
                energy_level: energy,
                ..Default::default()
            };
            db.store_analysis(id, &analysis).unwrap();
        }
        db.fetch_analyzed_tracks().unwrap()
    }

    #[test]
    fn test_find_similar_cached_prefers_stored_pairs() {
        let db = Database::open_in_memory().unwrap();
        let tracks = stored_library(&db, &[(128.0, "8A", 5), (100.0, "3B", 1), (128.0, "8A", 5)]);
        let (target, weak, strong) = (&tracks[0], &tracks[1], &tracks[2]);
        let scorer = SimilarityScorer::default();
        let embeddings = EmbeddingMap::new();

        // Nothing cached: same ranking as live scoring.
        let live = scorer.find_similar(target, &tracks, &embeddings, 10);
        let cold = find_similar_cached(&db, &scorer, target, &tracks, &embeddings, 10).unwrap();
        assert_eq!(cold, live);

        let mut stored = scorer.score(target, weak, None, None);
        stored.combined_score = 0.99;
        stored.explanation = "cached".to_string();
        db.store_similarities(&[stored]).unwrap();

        let warm = find_similar_cached(&db, &scorer, target, &tracks, &embeddings, 10).unwrap();
        assert_eq!(warm.len(), 2);
        assert_eq!(warm[0].other(target.id), weak.id);
        assert_eq!(warm[0].explanation, "cached");
        assert_eq!(warm[1].other(target.id), strong.id);

        let top = find_similar_cached(&db, &scorer, target, &tracks, &embeddings, 1).unwrap();
        assert_eq!(top.len(), 1);
    }

    #[test]
    fn test_sweep_fills_cache_read_by_similar() {
        let db = Database::open_in_memory().unwrap();
        let tracks = stored_library(&db, &[(124.0, "8A", 5), (126.0, "9A", 6), (90.0, "2B", 2)]);
        let scorer = SimilarityScorer::default();

        let sweep = compute_similarity(&db, &scorer, 1, &AtomicBool::new(false)).unwrap();
        assert_eq!((sweep.tracks_processed, sweep.pairs_stored), (3, 3));

        let target = &tracks[1];
        let cached =
            find_similar_cached(&db, &scorer, target, &tracks, &EmbeddingMap::new(), 10).unwrap();
        let live = scorer.find_similar(target, &tracks, &EmbeddingMap::new(), 10);
        let ids = |rs: &[SimilarityResult]| rs.iter().map(|r| r.other(target.id)).collect::<Vec<_>>();
        assert_eq!(ids(&cached), ids(&live));
        for (c, l) in cached.iter().zip(&live) {
            assert!((c.combined_score - l.combined_score).abs() < 1e-9);
        }
    }
}
