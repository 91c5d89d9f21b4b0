//! Streaming Half-Space Trees anomaly detector.
//!
//! Each tree partitions a randomly padded unit hypercube by halving a random
//! dimension at every level. Mass is counted per node over a fixed-size
//! window; the previous window's mass (the reference profile) is what a
//! point is scored against. Points landing in sparse regions score near 1.
//!
//! Inputs are expected to be roughly in `[0, 1]` per dimension.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone)]
struct HalfSpaceTree {
    /// Split dimension per internal node, heap order.
    features: Vec<usize>,
    /// Split value per internal node, heap order.
    splits: Vec<f64>,
    /// Mass of the window being filled, per node.
    l_mass: Vec<f64>,
    /// Mass of the last completed window, per node.
    r_mass: Vec<f64>,
}

impl HalfSpaceTree {
    fn build(height: u32, limits: &[(f64, f64)], rng: &mut StdRng) -> Self {
        let internal = (1usize << height) - 1;
        let nodes = (1usize << (height + 1)) - 1;
        let mut features = vec![0; internal];
        let mut splits = vec![0.0; internal];

        let mut stack = vec![(0usize, limits.to_vec())];
        while let Some((node, bounds)) = stack.pop() {
            if node >= internal {
                continue;
            }
            let f = rng.gen_range(0..bounds.len());
            let (lo, hi) = bounds[f];
            let mid = (lo + hi) / 2.0;
            features[node] = f;
            splits[node] = mid;

            let mut left = bounds.clone();
            left[f] = (lo, mid);
            let mut right = bounds;
            right[f] = (mid, hi);
            stack.push((2 * node + 1, left));
            stack.push((2 * node + 2, right));
        }

        Self {
            features,
            splits,
            l_mass: vec![0.0; nodes],
            r_mass: vec![0.0; nodes],
        }
    }

    /// Node indices from the root to the leaf `x` falls into.
    fn walk<'a>(&'a self, x: &'a [f64]) -> impl Iterator<Item = usize> + 'a {
        let internal = self.features.len();
        let mut next = Some(0usize);
        std::iter::from_fn(move || {
            let node = next?;
            next = if node < internal {
                let v = x.get(self.features[node]).copied().unwrap_or(0.0);
                Some(if v < self.splits[node] { 2 * node + 1 } else { 2 * node + 2 })
            } else {
                None
            };
            Some(node)
        })
    }
}

#[derive(Debug, Clone)]
pub struct HalfSpaceTrees {
    height: u32,
    window_size: usize,
    size_limit: f64,
    trees: Vec<HalfSpaceTree>,
    counter: usize,
    first_window: bool,
}

impl HalfSpaceTrees {
    pub fn new(dimensions: usize, n_trees: usize, height: u32, window_size: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let trees = (0..n_trees)
            .map(|_| {
                let limits: Vec<(f64, f64)> = (0..dimensions.max(1))
                    .map(|_| {
                        let sq: f64 = rng.gen();
                        let r = 2.0 * sq.max(1.0 - sq);
                        (sq - r, sq + r)
                    })
                    .collect();
                HalfSpaceTree::build(height, &limits, &mut rng)
            })
            .collect();

        Self {
            height,
            window_size: window_size.max(1),
            size_limit: 0.1 * window_size.max(1) as f64,
            trees,
            counter: 0,
            first_window: true,
        }
    }

    /// True until the first reference window has been completed.
    pub fn is_warming_up(&self) -> bool {
        self.first_window
    }

    /// Count `x` into the current window, rotating windows when full.
    pub fn learn(&mut self, x: &[f64]) {
        for tree in &mut self.trees {
            let path: Vec<usize> = tree.walk(x).collect();
            for node in path {
                tree.l_mass[node] += 1.0;
            }
        }

        self.counter += 1;
        if self.counter == self.window_size {
            for tree in &mut self.trees {
                std::mem::swap(&mut tree.l_mass, &mut tree.r_mass);
                tree.l_mass.iter_mut().for_each(|m| *m = 0.0);
            }
            self.first_window = false;
            self.counter = 0;
        }
    }

    /// Anomaly score in `[0, 1]`; always 0 during the first window.
    pub fn score(&self, x: &[f64]) -> f64 {
        if self.first_window || self.trees.is_empty() {
            return 0.0;
        }

        let mut mass = 0.0;
        for tree in &self.trees {
            for (depth, node) in tree.walk(x).enumerate() {
                mass += tree.r_mass[node] * 2f64.powi(depth as i32);
                if tree.r_mass[node] < self.size_limit {
                    break;
                }
            }
        }

        let max_mass = self.trees.len() as f64
            * self.window_size as f64
            * (2f64.powi(self.height as i32 + 1) - 1.0);
        (1.0 - mass / max_mass).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const INLIER: [f64; 4] = [0.2, 0.2, 0.2, 0.2];
    const OUTLIER: [f64; 4] = [0.95, 0.95, 0.95, 0.95];

    #[test]
    fn scores_zero_during_first_window() {
        let mut hst = HalfSpaceTrees::new(4, 10, 8, 20, 1);
        for _ in 0..19 {
            hst.learn(&INLIER);
            assert_eq!(hst.score(&OUTLIER), 0.0);
        }
        assert!(hst.is_warming_up());
        hst.learn(&INLIER);
        assert!(!hst.is_warming_up());
    }

    #[test]
    fn outlier_scores_above_inlier() {
        let mut hst = HalfSpaceTrees::new(4, 10, 8, 50, 7);
        for _ in 0..100 {
            hst.learn(&INLIER);
        }
        let inlier = hst.score(&INLIER);
        let outlier = hst.score(&OUTLIER);
        assert!(inlier < 0.1, "inlier scored {}", inlier);
        assert!(outlier > 0.5, "outlier scored {}", outlier);
    }

    #[test]
    fn same_seed_same_structure() {
        let mut a = HalfSpaceTrees::new(4, 5, 6, 10, 3);
        let mut b = HalfSpaceTrees::new(4, 5, 6, 10, 3);
        for i in 0..30 {
            let x = [i as f64 / 30.0, 0.5, 0.1, 0.9];
            a.learn(&x);
            b.learn(&x);
        }
        assert_eq!(a.score(&OUTLIER), b.score(&OUTLIER));
    }

    #[test]
    fn walk_reaches_a_leaf() {
        let mut rng = StdRng::seed_from_u64(0);
        let tree = HalfSpaceTree::build(3, &[(0.0, 1.0), (0.0, 1.0)], &mut rng);
        let path: Vec<usize> = tree.walk(&[0.3, 0.7]).collect();
        assert_eq!(path.len(), 4);
        assert_eq!(path[0], 0);
        assert!(*path.last().unwrap() >= 7);
    }
}
