//! Windowed linear regressor trained online with Adam.
//!
//! The model sees the last `lags` scaled feature vectors of a process,
//! flattened, plus a bias term, and predicts the next (cpu, mem, io) triple
//! in the same scaled space. One optimizer step is taken per call to
//! [`WindowRegressor::train_step`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Features per time step: cpu, mem, io, threads, os priority.
pub const FEATURES: usize = 5;
/// Predicted values: cpu, mem, io.
pub const TARGETS: usize = 3;

/// Adam optimizer over a flat parameter vector.
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    m: Vec<f64>,
    v: Vec<f64>,
    t: u64,
}

impl Adam {
    pub fn new(params: usize, learning_rate: f64) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            m: vec![0.0; params],
            v: vec![0.0; params],
            t: 0,
        }
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    /// Apply one bias-corrected update to `params`.
    pub fn step(&mut self, params: &mut [f64], grads: &[f64]) {
        debug_assert_eq!(params.len(), self.m.len());
        debug_assert_eq!(grads.len(), self.m.len());

        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        for i in 0..params.len() {
            let g = grads[i];
            self.m[i] = self.beta1 * self.m[i] + (1.0 - self.beta1) * g;
            self.v[i] = self.beta2 * self.v[i] + (1.0 - self.beta2) * g * g;
            let m_hat = self.m[i] / bc1;
            let v_hat = self.v[i] / bc2;
            params[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
        }
    }
}

#[derive(Debug, Clone)]
pub struct WindowRegressor {
    lags: usize,
    /// `TARGETS` rows of `lags * FEATURES + 1` weights, bias last.
    weights: Vec<f64>,
    optimizer: Adam,
}

impl WindowRegressor {
    /// A fresh model with small seeded random weights and zero bias.
    pub fn new(lags: usize, learning_rate: f64, seed: u64) -> Self {
        let row = lags * FEATURES + 1;
        let bound = 1.0 / (row as f64).sqrt();
        let mut rng = StdRng::seed_from_u64(seed);
        let mut weights = Vec::with_capacity(TARGETS * row);
        for _ in 0..TARGETS {
            for _ in 0..row - 1 {
                weights.push(rng.gen_range(-bound..bound));
            }
            weights.push(0.0);
        }
        Self {
            lags,
            optimizer: Adam::new(weights.len(), learning_rate),
            weights,
        }
    }

    /// Number of past steps the model consumes.
    pub fn lags(&self) -> usize {
        self.lags
    }

    pub fn learning_rate(&self) -> f64 {
        self.optimizer.learning_rate()
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.optimizer.set_learning_rate(learning_rate);
    }

    fn row_len(&self) -> usize {
        self.lags * FEATURES + 1
    }

    fn input(&self, history: &[[f64; FEATURES]]) -> Vec<f64> {
        let mut x = Vec::with_capacity(self.row_len());
        for step in history.iter().take(self.lags) {
            x.extend_from_slice(step);
        }
        x.resize(self.row_len() - 1, 0.0);
        x.push(1.0);
        x
    }

    fn forward(&self, x: &[f64]) -> [f64; TARGETS] {
        let row = self.row_len();
        let mut out = [0.0; TARGETS];
        for (k, o) in out.iter_mut().enumerate() {
            let w = &self.weights[k * row..(k + 1) * row];
            *o = w.iter().zip(x.iter()).map(|(a, b)| a * b).sum();
        }
        out
    }

    /// Predict the next step from the last `lags` steps (scaled space).
    pub fn predict(&self, history: &[[f64; FEATURES]]) -> [f64; TARGETS] {
        self.forward(&self.input(history))
    }

    /// One Adam step on the mean squared error against `target`.
    ///
    /// Returns the pre-update loss, or `None` (leaving the model untouched)
    /// if the loss, the gradient or the updated weights are not finite.
    pub fn train_step(&mut self, history: &[[f64; FEATURES]], target: [f64; TARGETS]) -> Option<f64> {
        let x = self.input(history);
        let y = self.forward(&x);
        let row = self.row_len();

        let mut loss = 0.0;
        let mut grads = vec![0.0; self.weights.len()];
        for k in 0..TARGETS {
            let err = y[k] - target[k];
            loss += err * err;
            let scale = 2.0 * err / TARGETS as f64;
            for (g, xi) in grads[k * row..(k + 1) * row].iter_mut().zip(x.iter()) {
                *g = scale * xi;
            }
        }
        loss /= TARGETS as f64;

        if !loss.is_finite() || grads.iter().any(|g| !g.is_finite()) {
            return None;
        }

        let previous = self.clone();
        self.optimizer.step(&mut self.weights, &grads);
        if self.weights.iter().any(|w| !w.is_finite()) {
            *self = previous;
            return None;
        }
        Some(loss)
    }
}
