//! ADWIN adaptive windowing for change detection on a scalar stream.
//!
//! The window grows while the stream is stationary. Every `clock` updates
//! each split of the window into an older and a newer part is tested; when
//! the means differ by more than the Hoeffding-style bound the older part
//! is dropped and a change is reported.

use std::collections::VecDeque;

const DEFAULT_CLOCK: u64 = 32;
const DEFAULT_MIN_SUB_WINDOW: usize = 5;
const DEFAULT_MAX_WINDOW: usize = 4096;

#[derive(Debug, Clone)]
pub struct Adwin {
    delta: f64,
    clock: u64,
    min_sub_window: usize,
    max_window: usize,
    window: VecDeque<f64>,
    updates: u64,
    detections: u64,
}

impl Adwin {
    pub fn new(delta: f64) -> Self {
        Self {
            delta,
            clock: DEFAULT_CLOCK,
            min_sub_window: DEFAULT_MIN_SUB_WINDOW,
            max_window: DEFAULT_MAX_WINDOW,
            window: VecDeque::new(),
            updates: 0,
            detections: 0,
        }
    }

    /// Check for a change on every update instead of every `clock` updates.
    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock.max(1);
        self
    }

    pub fn width(&self) -> usize {
        self.window.len()
    }

    pub fn mean(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window.iter().sum::<f64>() / self.window.len() as f64
    }

    /// Number of changes detected since construction.
    pub fn detections(&self) -> u64 {
        self.detections
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.updates = 0;
    }

    /// Add one value. Returns true if a change was detected.
    ///
    /// Non-finite values are ignored.
    pub fn update(&mut self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }

        self.window.push_back(value);
        while self.window.len() > self.max_window {
            self.window.pop_front();
        }
        self.updates += 1;

        if self.updates % self.clock != 0 || self.window.len() < 2 * self.min_sub_window {
            return false;
        }

        let mut detected = false;
        while let Some(cut) = self.find_cut() {
            self.window.drain(..cut);
            detected = true;
        }
        if detected {
            self.detections += 1;
        }
        detected
    }

    /// Size of the older sub-window at the first split whose means differ
    /// significantly, scanning from the oldest split.
    fn find_cut(&self) -> Option<usize> {
        let n = self.window.len();
        if n < 2 * self.min_sub_window {
            return None;
        }

        let mut prefix = Vec::with_capacity(n + 1);
        prefix.push(0.0);
        let mut acc = 0.0;
        for v in &self.window {
            acc += v;
            prefix.push(acc);
        }

        let total = prefix[n];
        let mean = total / n as f64;
        let variance = self
            .window
            .iter()
            .map(|v| (v - mean) * (v - mean))
            .sum::<f64>()
            / n as f64;

        let delta_prime = self.delta / n as f64;
        let ln_term = (2.0 / delta_prime).ln();

        for n0 in self.min_sub_window..=(n - self.min_sub_window) {
            let n1 = n - n0;
            let mu0 = prefix[n0] / n0 as f64;
            let mu1 = (total - prefix[n0]) / n1 as f64;
            let m = 1.0 / (1.0 / n0 as f64 + 1.0 / n1 as f64);
            let epsilon = (2.0 / m * variance * ln_term).sqrt() + 2.0 / (3.0 * m) * ln_term;
            if (mu0 - mu1).abs() > epsilon {
                return Some(n0);
            }
        }
        None
    }
}
