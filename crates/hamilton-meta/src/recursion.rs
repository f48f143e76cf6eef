// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Meta-Hamiltonian Recursion
// ─────────────────────────────────────────────────────────────────────
//! Self-referential energy recursion H_{k+1} = f(H_k).
//!
//! The same map can drive coupling strengths: every coupled Λ_ij is
//! iterated through f while the graph stays symmetric and valid.

use hamilton_physics::CouplingGraph;
use hamilton_types::{EngineError, EngineResult};

/// Logistic map r·h·(1 − h). Chaotic for r above ~3.57.
pub fn logistic(r: f64) -> impl Fn(f64) -> f64 + Copy + Send + Sync {
    move |h| r * h * (1.0 - h)
}

/// Scalar map applied to its own output, with the visited values kept.
pub struct MetaHamiltonian<F> {
    map: F,
    history: Vec<f64>,
}

impl<F> MetaHamiltonian<F>
where
    F: Fn(f64) -> f64,
{
    pub fn new(map: F) -> Self {
        Self {
            map,
            history: Vec::new(),
        }
    }

    /// Values of the last `evolve`, or mean coupled Λ per step after
    /// `evolve_coupling`.
    pub fn history(&self) -> &[f64] {
        &self.history
    }

    /// Iterate `n_steps` times from `initial`. The history holds
    /// `n_steps + 1` values.
    pub fn evolve(&mut self, initial: f64, n_steps: usize) -> EngineResult<&[f64]> {
        if !initial.is_finite() {
            return Err(EngineError::Validation(format!(
                "initial meta energy must be finite, got {initial}"
            )));
        }
        self.history.clear();
        self.history.reserve(n_steps + 1);
        self.history.push(initial);
        let mut h = initial;
        for step in 1..=n_steps {
            h = (self.map)(h);
            if !h.is_finite() {
                return Err(EngineError::evaluation(
                    format!("meta map diverged to {h} at step {step}"),
                    &[],
                    &[],
                ));
            }
            self.history.push(h);
        }
        Ok(&self.history)
    }

    /// |lag-1 autocorrelation| of the history. Zero for fewer than three
    /// values or a constant series.
    pub fn self_complexity(&self) -> f64 {
        let n = self.history.len();
        if n < 3 {
            return 0.0;
        }
        pearson(&self.history[..n - 1], &self.history[1..]).abs()
    }

    /// Drive every pair with a coupling potential through the map for
    /// `n_steps`, mirroring each update so Λ stays symmetric.
    pub fn evolve_coupling(&mut self, graph: &CouplingGraph, n_steps: usize) -> EngineResult<CouplingGraph> {
        let n = graph.len();
        let pairs: Vec<(usize, usize)> = (0..n)
            .flat_map(|i| ((i + 1)..n).map(move |j| (i, j)))
            .filter(|&(i, j)| graph.has_potential(i, j))
            .collect();
        if pairs.is_empty() {
            return Err(EngineError::Validation(
                "graph has no coupled pairs to evolve".to_string(),
            ));
        }

        let mean = |l: &[Vec<f64>]| pairs.iter().map(|&(i, j)| l[i][j]).sum::<f64>() / pairs.len() as f64;
        let mut lambda = graph.lambda().to_vec();
        self.history.clear();
        self.history.push(mean(&lambda));
        for step in 1..=n_steps {
            for &(i, j) in &pairs {
                let v = (self.map)(lambda[i][j]);
                if !v.is_finite() {
                    return Err(EngineError::MalformedCoupling(format!(
                        "Λ[{i}][{j}] diverged to {v} at step {step}"
                    )));
                }
                lambda[i][j] = v;
                lambda[j][i] = v;
            }
            self.history.push(mean(&lambda));
        }
        log::debug!(
            "coupling recursion over {} pairs, {n_steps} steps: mean Λ {:.6} -> {:.6}",
            pairs.len(),
            self.history[0],
            self.history[n_steps]
        );
        graph.with_lambda(lambda)
    }
}

fn pearson(a: &[f64], b: &[f64]) -> f64 {
    let n = a.len() as f64;
    let ma = a.iter().sum::<f64>() / n;
    let mb = b.iter().sum::<f64>() / n;
    let (mut cov, mut va, mut vb) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - ma, y - mb);
        cov += dx * dy;
        va += dx * dx;
        vb += dy * dy;
    }
    let denom = (va * vb).sqrt();
    if denom < f64::EPSILON {
        0.0
    } else {
        cov / denom
    }
}
