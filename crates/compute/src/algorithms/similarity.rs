use std::collections::{BTreeSet, HashMap};

use neurapulse_core::{Pid, ResourceUsage};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// An edge of the similarity graph. `a < b` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityEdge {
    pub a: Pid,
    pub b: Pid,
    pub weight: f64,
}

/// Cosine similarity of two usage vectors, clamped to `[0, 1]`.
///
/// A vector with zero norm is similar to nothing: the result is 0.
pub fn cosine_similarity(a: &[f64], b: &[f64]) -> f64 {
    let norm_a = a.iter().map(|x| x * x).sum::<f64>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f64>().sqrt();
    if norm_a <= f64::EPSILON || norm_b <= f64::EPSILON {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    (dot / (norm_a * norm_b)).clamp(0.0, 1.0)
}

/// Pairwise usage similarity over the tracked processes of one tick.
///
/// The matrix is symmetric with a zero diagonal. Pairs whose weight exceeds
/// the threshold are "related" and answer [`SimilarityGraph::related`].
#[derive(Debug, Clone, Default)]
pub struct SimilarityGraph {
    threshold: f64,
    pids: Vec<Pid>,
    index: HashMap<Pid, usize>,
    usages: Vec<ResourceUsage>,
    matrix: Vec<Vec<f64>>,
    related: HashMap<Pid, BTreeSet<Pid>>,
}

impl SimilarityGraph {
    /// An empty graph with the given relation threshold.
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            ..Self::default()
        }
    }

    /// Build the graph for one set of `(pid, usage)` entries.
    ///
    /// Duplicate pids keep their first entry.
    pub fn build(entries: &[(Pid, ResourceUsage)], threshold: f64) -> Self {
        let mut pids = Vec::with_capacity(entries.len());
        let mut usages = Vec::with_capacity(entries.len());
        let mut index = HashMap::with_capacity(entries.len());
        for (pid, usage) in entries {
            if index.contains_key(pid) {
                continue;
            }
            index.insert(*pid, pids.len());
            pids.push(*pid);
            usages.push(*usage);
        }

        let n = pids.len();
        let vectors: Vec<[f64; 3]> = usages.iter().map(ResourceUsage::as_array).collect();
        let mut matrix = vec![vec![0.0; n]; n];
        let mut related: HashMap<Pid, BTreeSet<Pid>> = HashMap::new();

        for i in 0..n {
            for j in (i + 1)..n {
                let w = cosine_similarity(&vectors[i], &vectors[j]);
                matrix[i][j] = w;
                matrix[j][i] = w;
                if w > threshold {
                    related.entry(pids[i]).or_default().insert(pids[j]);
                    related.entry(pids[j]).or_default().insert(pids[i]);
                }
            }
        }

        debug!(
            processes = n,
            related = related.len(),
            "similarity graph rebuilt"
        );

        Self {
            threshold,
            pids,
            index,
            usages,
            matrix,
            related,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Pids in matrix order.
    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    pub fn len(&self) -> usize {
        self.pids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pids.is_empty()
    }

    pub fn matrix(&self) -> &[Vec<f64>] {
        &self.matrix
    }

    pub fn usage(&self, pid: Pid) -> Option<ResourceUsage> {
        self.index.get(&pid).map(|&i| self.usages[i])
    }

    /// Similarity of two tracked pids; `None` if either is unknown.
    pub fn weight(&self, a: Pid, b: Pid) -> Option<f64> {
        let i = *self.index.get(&a)?;
        let j = *self.index.get(&b)?;
        Some(self.matrix[i][j])
    }

    /// Pids whose similarity to `pid` exceeds the threshold.
    pub fn related(&self, pid: Pid) -> BTreeSet<Pid> {
        self.related.get(&pid).cloned().unwrap_or_default()
    }

    /// How strongly `pid`'s relations bear on it at the given cpu load:
    /// `tanh(|related| / 5) * sin^2(pi * cpu / 100)`, in `[0, 1]`.
    ///
    /// Zero for a pid with no relations. Peaks at 50% cpu and vanishes at
    /// idle and full load.
    pub fn coupling_effect(&self, pid: Pid, cpu_percent: f64) -> f64 {
        let related = self.related.get(&pid).map_or(0, BTreeSet::len);
        if related == 0 || !cpu_percent.is_finite() {
            return 0.0;
        }
        let base = (related as f64 / 5.0).tanh();
        let phase = (std::f64::consts::PI * cpu_percent / 100.0).sin();
        (base * phase * phase).clamp(0.0, 1.0)
    }

    /// All related pairs, each listed once.
    pub fn edges(&self) -> Vec<SimilarityEdge> {
        let mut edges = Vec::new();
        for i in 0..self.len() {
            for j in (i + 1)..self.len() {
                let w = self.matrix[i][j];
                if w > self.threshold {
                    let (a, b) = if self.pids[i] < self.pids[j] {
                        (self.pids[i], self.pids[j])
                    } else {
                        (self.pids[j], self.pids[i])
                    };
                    edges.push(SimilarityEdge { a, b, weight: w });
                }
            }
        }
        edges
    }

    /// Coupling used by the relaxation: dissimilarity off the diagonal.
    ///
    /// Stronger coupling between processes whose usage differs more.
    pub fn coupling_matrix(&self) -> Vec<Vec<f64>> {
        let n = self.len();
        let mut coupling = vec![vec![0.0; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    coupling[i][j] = 1.0 - self.matrix[i][j];
                }
            }
        }
        coupling
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, memory: f64, io: f64) -> ResourceUsage {
        ResourceUsage { cpu, memory, io }
    }

    #[test]
    fn identical_vectors_have_full_similarity() {
        let w = cosine_similarity(&[50.0, 50.0, 0.0], &[50.0, 50.0, 0.0]);
        assert!((w - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_vector_is_similar_to_nothing() {
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[50.0, 50.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0]), 0.0);
    }

    #[test]
    fn orthogonal_vectors_have_zero_similarity() {
        assert_eq!(cosine_similarity(&[100.0, 0.0, 0.0], &[0.0, 100.0, 0.0]), 0.0);
    }

    #[test]
    fn matrix_is_symmetric_with_zero_diagonal() {
        let graph = SimilarityGraph::build(
            &[
                (10, usage(90.0, 10.0, 0.0)),
                (11, usage(5.0, 70.0, 30.0)),
                (12, usage(0.0, 0.0, 0.0)),
                (13, usage(40.0, 40.0, 40.0)),
            ],
            0.7,
        );
        let m = graph.matrix();
        for i in 0..graph.len() {
            assert_eq!(m[i][i], 0.0);
            for j in 0..graph.len() {
                assert_eq!(m[i][j], m[j][i]);
                assert!((0.0..=1.0).contains(&m[i][j]));
            }
        }
        // The idle process relates to nothing.
        assert!(graph.related(12).is_empty());
        assert_eq!(graph.weight(12, 13), Some(0.0));
    }

    #[test]
    fn similar_processes_are_related_both_ways() {
        let graph = SimilarityGraph::build(
            &[(100, usage(90.0, 10.0, 0.0)), (200, usage(88.0, 12.0, 0.0))],
            0.7,
        );
        let w = graph.weight(100, 200).unwrap();
        assert!(w > 0.7, "weight was {}", w);
        assert!(graph.related(100).contains(&200));
        assert!(graph.related(200).contains(&100));
        assert_eq!(graph.edges().len(), 1);
    }

    #[test]
    fn dissimilar_processes_are_not_related() {
        let graph = SimilarityGraph::build(
            &[(1, usage(95.0, 1.0, 0.0)), (2, usage(1.0, 95.0, 0.0))],
            0.7,
        );
        assert!(graph.related(1).is_empty());
        assert!(graph.edges().is_empty());
    }

    #[test]
    fn coupling_is_dissimilarity() {
        let graph = SimilarityGraph::build(
            &[(1, usage(50.0, 50.0, 0.0)), (2, usage(50.0, 50.0, 0.0)), (3, usage(0.0, 0.0, 0.0))],
            0.7,
        );
        let c = graph.coupling_matrix();
        assert_eq!(c[0][0], 0.0);
        assert!(c[0][1].abs() < 1e-12);
        assert!((c[0][2] - 1.0).abs() < 1e-12);
        assert_eq!(c[2][0], c[0][2]);
    }

    #[test]
    fn coupling_effect_follows_relations_and_load() {
        let graph = SimilarityGraph::build(
            &[
                (1, usage(50.0, 10.0, 0.0)),
                (2, usage(52.0, 11.0, 0.0)),
                (3, usage(0.0, 90.0, 0.0)),
            ],
            0.7,
        );
        let one = (1.0f64 / 5.0).tanh();
        assert!((graph.coupling_effect(1, 50.0) - one).abs() < 1e-12);
        assert!((graph.coupling_effect(1, 25.0) - one * 0.5).abs() < 1e-12);
        assert!(graph.coupling_effect(1, 0.0).abs() < 1e-12);
        assert!(graph.coupling_effect(1, 100.0).abs() < 1e-12);
        assert_eq!(graph.coupling_effect(3, 50.0), 0.0);
        assert_eq!(graph.coupling_effect(99, 50.0), 0.0);
        assert_eq!(graph.coupling_effect(1, f64::NAN), 0.0);
    }

    #[test]
    fn coupling_effect_grows_with_relations() {
        let entries: Vec<(Pid, ResourceUsage)> =
            (0..6).map(|i| (i, usage(40.0 + i as f64, 10.0, 0.0))).collect();
        let graph = SimilarityGraph::build(&entries, 0.7);
        let five = graph.coupling_effect(0, 50.0);
        assert!((five - 1.0f64.tanh()).abs() < 1e-12);
        assert!(five < 1.0);
    }

    #[test]
    fn unknown_pid_has_no_relations() {
        let graph = SimilarityGraph::new(0.7);
        assert!(graph.is_empty());
        assert!(graph.related(42).is_empty());
        assert_eq!(graph.weight(1, 2), None);
    }

    #[test]
    fn duplicate_pids_keep_first_entry() {
        let graph = SimilarityGraph::build(
            &[(1, usage(10.0, 0.0, 0.0)), (1, usage(0.0, 10.0, 0.0))],
            0.7,
        );
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.usage(1), Some(usage(10.0, 0.0, 0.0)));
    }
}
