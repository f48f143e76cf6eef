// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Coupling Tuner
// ─────────────────────────────────────────────────────────────────────
//! Λ self-tuning as an [`EvolutionTarget`]: each candidate nudges one
//! symmetric pair by ±step, the energy is a caller-supplied measure over
//! the rebuilt [`CouplingGraph`].

use serde::{Deserialize, Serialize};

use hamilton_physics::CouplingGraph;
use hamilton_types::{EngineError, EngineResult};

use crate::evolution::EvolutionTarget;

/// Λ_ij and Λ_ji += delta.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LambdaNudge {
    pub i: usize,
    pub j: usize,
    pub delta: f64,
}

pub struct CouplingTuner<F> {
    graph: CouplingGraph,
    step: f64,
    bounds: (f64, f64),
    energy: F,
    /// Graph replaced by the most recent `apply`; only that change is revertible.
    undo: Option<CouplingGraph>,
}

impl<F> CouplingTuner<F>
where
    F: Fn(&CouplingGraph) -> EngineResult<f64> + Sync,
{
    /// Tune pairs with a defined potential, keeping every Λ_ij in `bounds`.
    pub fn new(graph: CouplingGraph, step: f64, bounds: (f64, f64), energy: F) -> EngineResult<Self> {
        if !(step.is_finite() && step > 0.0) {
            return Err(EngineError::Validation(format!(
                "tuner step must be finite and > 0, got {step}"
            )));
        }
        if !(bounds.0.is_finite() && bounds.1.is_finite() && bounds.0 <= bounds.1) {
            return Err(EngineError::Validation(format!(
                "tuner bounds invalid: {bounds:?}"
            )));
        }
        Ok(Self {
            graph,
            step,
            bounds,
            energy,
            undo: None,
        })
    }

    pub fn graph(&self) -> &CouplingGraph {
        &self.graph
    }

    pub fn into_graph(self) -> CouplingGraph {
        self.graph
    }

    fn nudged(lambda: &[Vec<f64>], n: &LambdaNudge) -> Vec<Vec<f64>> {
        let mut out = lambda.to_vec();
        let v = out[n.i][n.j] + n.delta;
        out[n.i][n.j] = v;
        out[n.j][n.i] = v;
        out
    }
}

impl<F> EvolutionTarget for CouplingTuner<F>
where
    F: Fn(&CouplingGraph) -> EngineResult<f64> + Sync,
{
    type Snapshot = Vec<Vec<f64>>;
    type Change = LambdaNudge;

    fn observe(&self) -> Vec<Vec<f64>> {
        self.graph.lambda().to_vec()
    }

    fn measure_energy(&self, lambda: &Vec<Vec<f64>>) -> EngineResult<f64> {
        let g = self.graph.with_lambda(lambda.clone())?;
        (self.energy)(&g)
    }

    fn candidates(&self, lambda: &Vec<Vec<f64>>) -> Vec<LambdaNudge> {
        let n = lambda.len();
        let (lo, hi) = self.bounds;
        let mut out = Vec::new();
        for i in 0..n {
            for j in (i + 1)..n {
                if !self.graph.has_potential(i, j) {
                    continue;
                }
                for delta in [-self.step, self.step] {
                    let v = lambda[i][j] + delta;
                    if v >= lo && v <= hi {
                        out.push(LambdaNudge { i, j, delta });
                    }
                }
            }
        }
        out
    }

    fn describe(&self, c: &LambdaNudge) -> String {
        format!("Λ[{}][{}] {:+}", c.i, c.j, c.delta)
    }

    fn simulate(&self, scratch: Vec<Vec<f64>>, c: &LambdaNudge) -> EngineResult<Vec<Vec<f64>>> {
        Ok(Self::nudged(&scratch, c))
    }

    fn apply(&mut self, c: &LambdaNudge) -> EngineResult<()> {
        let next = self.graph.with_lambda(Self::nudged(self.graph.lambda(), c))?;
        self.undo = Some(std::mem::replace(&mut self.graph, next));
        Ok(())
    }

    fn revert(&mut self, c: &LambdaNudge) -> EngineResult<()> {
        self.graph = self.undo.take().ok_or_else(|| {
            EngineError::Validation(format!("no applied change to revert for {}", self.describe(c)))
        })?;
        Ok(())
    }
}
