//! Greedy set ordering over pairwise similarity.

use serde::{Deserialize, Serialize};

use crate::db::models::Track;
use crate::keys::KeyRelation;
use crate::similarity::{EmbeddingMap, SimilarityScorer};

/// Target similarity for open-format sets: related, but not interchangeable.
const OPEN_FORMAT_TARGET: f64 = 0.65;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlanMode {
    /// Strongest match at every step.
    #[default]
    PeakTime,
    /// Start low and keep energy non-decreasing where possible.
    WarmUp,
    /// Prefer moderately similar neighbours over near-duplicates.
    OpenFormat,
}

impl PlanMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeakTime => "peakTime",
            Self::WarmUp => "warmUp",
            Self::OpenFormat => "openFormat",
        }
    }
}

/// One step of a set, from the previous track to the next.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_id: i64,
    pub to_id: i64,
    pub bpm_delta: f64,
    pub energy_delta: i32,
    pub key_relation: KeyRelation,
    pub score: f64,
    pub explanation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetPlan {
    pub tracks: Vec<Track>,
    pub transitions: Vec<Transition>,
    /// Mean combined score over transitions.
    pub score: f64,
}

impl SetPlan {
    fn empty() -> Self {
        Self {
            tracks: Vec::new(),
            transitions: Vec::new(),
            score: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SetPlanner {
    scorer: SimilarityScorer,
}

impl SetPlanner {
    pub fn new(scorer: SimilarityScorer) -> Self {
        Self { scorer }
    }

    /// Order `tracks` into a set. The output is always a permutation of the
    /// input with one transition per adjacent pair. `start` and `end` are
    /// track ids; unknown ids are ignored.
    pub fn optimize_set(
        &self,
        tracks: &[Track],
        embeddings: &EmbeddingMap,
        mode: PlanMode,
        start: Option<i64>,
        end: Option<i64>,
    ) -> SetPlan {
        match tracks.len() {
            0 => return SetPlan::empty(),
            1 => {
                return SetPlan {
                    tracks: tracks.to_vec(),
                    transitions: Vec::new(),
                    score: 0.0,
                };
            }
            _ => {}
        }

        let n = tracks.len();
        let matrix = self.score_matrix(tracks, embeddings);

        let start_idx = start.and_then(|id| index_of(tracks, id, "start"));
        let end_idx = end
            .and_then(|id| index_of(tracks, id, "end"))
            .filter(|&e| Some(e) != start_idx);

        let first = start_idx.unwrap_or_else(|| match mode {
            PlanMode::WarmUp => lowest_energy(tracks, end_idx),
            PlanMode::PeakTime | PlanMode::OpenFormat => best_connected(&matrix, end_idx),
        });

        let mut order = Vec::with_capacity(n);
        let mut used = vec![false; n];
        order.push(first);
        used[first] = true;
        if let Some(e) = end_idx {
            used[e] = true;
        }

        while let Some(&current) = order.last() {
            let mut best: Option<(usize, f64)> = None;
            for cand in (0..n).filter(|&c| !used[c]) {
                let value = step_value(mode, &tracks[current], &tracks[cand], matrix[current][cand]);
                if best.is_none_or(|(_, v)| value > v) {
                    best = Some((cand, value));
                }
            }
            let Some((next, _)) = best else {
                break;
            };
            used[next] = true;
            order.push(next);
        }
        if let Some(e) = end_idx {
            order.push(e);
        }

        let transitions: Vec<Transition> = order
            .windows(2)
            .map(|pair| self.transition(&tracks[pair[0]], &tracks[pair[1]], embeddings))
            .collect();
        let score = transitions.iter().map(|t| t.score).sum::<f64>() / transitions.len() as f64;

        log::debug!(
            "Planned {} tracks ({}), mean transition score {:.3}",
            order.len(),
            mode.as_str(),
            score
        );

        SetPlan {
            tracks: order.into_iter().map(|i| tracks[i].clone()).collect(),
            transitions,
            score,
        }
    }

    /// Symmetric combined-score matrix; the diagonal is unused.
    fn score_matrix(&self, tracks: &[Track], embeddings: &EmbeddingMap) -> Vec<Vec<f64>> {
        let n = tracks.len();
        let mut matrix = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in (i + 1)..n {
                let s = self
                    .scorer
                    .score(
                        &tracks[i],
                        &tracks[j],
                        embeddings.get(&tracks[i].id).map(Vec::as_slice),
                        embeddings.get(&tracks[j].id).map(Vec::as_slice),
                    )
                    .combined_score;
                matrix[i][j] = s;
                matrix[j][i] = s;
            }
        }
        matrix
    }

    fn transition(&self, from: &Track, to: &Track, embeddings: &EmbeddingMap) -> Transition {
        let result = self.scorer.score(
            from,
            to,
            embeddings.get(&from.id).map(Vec::as_slice),
            embeddings.get(&to.id).map(Vec::as_slice),
        );
        let (bpm_delta, energy_delta) = match (&from.analysis, &to.analysis) {
            (Some(a), Some(b)) => (b.bpm - a.bpm, b.energy_level - a.energy_level),
            _ => (0.0, 0),
        };
        Transition {
            from_id: from.id,
            to_id: to.id,
            bpm_delta,
            energy_delta,
            key_relation: result.key_relation,
            score: result.combined_score,
            explanation: result.explanation,
        }
    }
}

fn index_of(tracks: &[Track], id: i64, role: &str) -> Option<usize> {
    let idx = tracks.iter().position(|t| t.id == id);
    if idx.is_none() {
        log::warn!("{role} track {id} is not in the set, ignoring");
    }
    idx
}

fn energy(track: &Track) -> Option<i32> {
    track.analysis.as_ref().map(|a| a.energy_level)
}

/// Lowest-energy track other than the fixed end; earliest wins ties.
fn lowest_energy(tracks: &[Track], exclude: Option<usize>) -> usize {
    tracks
        .iter()
        .enumerate()
        .filter(|&(i, _)| Some(i) != exclude)
        .filter_map(|(i, t)| energy(t).map(|e| (i, e)))
        .min_by_key(|&(i, e)| (e, i))
        .map(|(i, _)| i)
        .unwrap_or(if exclude == Some(0) { 1 } else { 0 })
}

/// Track with the highest mean score against all others.
fn best_connected(matrix: &[Vec<f64>], exclude: Option<usize>) -> usize {
    let n = matrix.len();
    let mut best = (if exclude == Some(0) { 1 } else { 0 }, f64::MIN);
    for (i, row) in matrix.iter().enumerate() {
        if Some(i) == exclude {
            continue;
        }
        let mean = row.iter().enumerate().filter(|&(j, _)| j != i).map(|(_, s)| s).sum::<f64>()
            / (n - 1) as f64;
        if mean > best.1 {
            best = (i, mean);
        }
    }
    best.0
}

/// Greedy objective for moving from `current` to `cand`.
fn step_value(mode: PlanMode, current: &Track, cand: &Track, combined: f64) -> f64 {
    match mode {
        PlanMode::PeakTime => combined,
        PlanMode::OpenFormat => 1.0 - (combined - OPEN_FORMAT_TARGET).abs(),
        PlanMode::WarmUp => match (energy(current), energy(cand)) {
            (Some(from), Some(to)) => {
                let delta = (to - from) as f64;
                if delta < 0.0 {
                    combined - 1.0 - 0.1 * delta.abs()
                } else {
                    combined - 0.02 * delta
                }
            }
            _ => combined,
        },
    }
}
