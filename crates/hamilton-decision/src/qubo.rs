// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — QUBO Optimizer
// ─────────────────────────────────────────────────────────────────────
//! Weighted binary objective + hard constraints folded into one symmetric
//! matrix Q, minimised by simulated annealing.
//!
//!   E(x) = Σ_i Q_ii x_i + Σ_{i≠j} Q_ij x_i x_j + offset
//!
//! Constraints become penalties P·(Σ w x − b)². Inequalities Σ w x ≤ b
//! gain binary slack bits so they can be written as equalities.
//!
//! Single flips are scored in O(1) from a maintained local field
//! f_i = Σ_{j≠i} Q_ij x_j:
//!
//!   ΔE_i = (1 − 2x_i)(Q_ii + 2 f_i)

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use hamilton_physics::HamiltonianModel;
use hamilton_types::{AnnealConfig, EngineError, EngineResult, PhaseSpaceState};

/// Feasibility tolerance when re-checking constraints.
const FEASIBILITY_TOL: f64 = 1e-9;

/// Bits used to discretise slack for non-integral inequalities.
const FRACTIONAL_SLACK_BITS: u32 = 8;

/// Hard constraint over the decision variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constraint {
    /// Σ w_k x_k = bound
    Equality {
        vars: Vec<usize>,
        weights: Vec<f64>,
        bound: f64,
    },
    /// Σ w_k x_k ≤ bound
    Inequality {
        vars: Vec<usize>,
        weights: Vec<f64>,
        bound: f64,
    },
}

impl Constraint {
    /// Exactly `k` of `vars` selected.
    pub fn exactly_k(vars: Vec<usize>, k: usize) -> Self {
        let weights = vec![1.0; vars.len()];
        Self::Equality {
            vars,
            weights,
            bound: k as f64,
        }
    }

    /// Weighted budget Σ w x ≤ budget.
    pub fn at_most(vars: Vec<usize>, weights: Vec<f64>, budget: f64) -> Self {
        Self::Inequality {
            vars,
            weights,
            bound: budget,
        }
    }

    fn parts(&self) -> (&[usize], &[f64], f64) {
        match self {
            Self::Equality {
                vars,
                weights,
                bound,
            }
            | Self::Inequality {
                vars,
                weights,
                bound,
            } => (vars, weights, *bound),
        }
    }

    fn lhs(&self, x: &[bool]) -> f64 {
        let (vars, weights, _) = self.parts();
        vars.iter()
            .zip(weights)
            .filter(|(&v, _)| x[v])
            .map(|(_, w)| w)
            .sum()
    }

    pub fn is_satisfied(&self, x: &[bool]) -> bool {
        let lhs = self.lhs(x);
        match self {
            Self::Equality { bound, .. } => (lhs - bound).abs() <= FEASIBILITY_TOL,
            Self::Inequality { bound, .. } => lhs <= bound + FEASIBILITY_TOL,
        }
    }

    fn validate(&self, n: usize) -> EngineResult<()> {
        let (vars, weights, bound) = self.parts();
        if vars.len() != weights.len() {
            return Err(EngineError::Validation(format!(
                "constraint has {} variables but {} weights",
                vars.len(),
                weights.len()
            )));
        }
        if let Some(v) = vars.iter().find(|&&v| v >= n) {
            return Err(EngineError::Validation(format!(
                "constraint references variable {v}, only {n} defined"
            )));
        }
        if !bound.is_finite() || weights.iter().any(|w| !w.is_finite()) {
            return Err(EngineError::Validation(
                "constraint weights and bound must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Duplicate variables merged, zero weights dropped.
    fn merged_terms(&self) -> Vec<(usize, f64)> {
        let (vars, weights, _) = self.parts();
        let mut merged: BTreeMap<usize, f64> = BTreeMap::new();
        for (&v, &w) in vars.iter().zip(weights) {
            *merged.entry(v).or_insert(0.0) += w;
        }
        merged.into_iter().filter(|(_, w)| *w != 0.0).collect()
    }
}

/// Builder for a [`QuboProblem`].
#[derive(Debug, Clone)]
pub struct QuboBuilder {
    labels: Vec<String>,
    linear: Vec<f64>,
    quadratic: BTreeMap<(usize, usize), f64>,
    constraints: Vec<Constraint>,
    penalty_weight: Option<f64>,
    penalty_multiplier: f64,
}

impl QuboBuilder {
    /// One binary variable per label ("select asset K", ...).
    pub fn new<S: Into<String>>(labels: impl IntoIterator<Item = S>) -> Self {
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        let n = labels.len();
        Self {
            labels,
            linear: vec![0.0; n],
            quadratic: BTreeMap::new(),
            constraints: Vec::new(),
            penalty_weight: None,
            penalty_multiplier: 10.0,
        }
    }

    /// Add `value` to the linear coefficient of variable `i`.
    pub fn linear(mut self, i: usize, value: f64) -> Self {
        if let Some(c) = self.linear.get_mut(i) {
            *c += value;
        } else {
            // Out-of-range index is reported by `build`.
            self.quadratic.insert((i, i), value);
        }
        self
    }

    /// Add `value · x_i · x_j`.
    pub fn quadratic(mut self, i: usize, j: usize, value: f64) -> Self {
        let key = (i.min(j), i.max(j));
        *self.quadratic.entry(key).or_insert(0.0) += value;
        self
    }

    /// Linear terms scale · H(state_i) from a model's energy per candidate.
    pub fn with_model_energies(
        mut self,
        model: &HamiltonianModel,
        states: &[PhaseSpaceState],
        scale: f64,
    ) -> EngineResult<Self> {
        if states.len() != self.labels.len() {
            return Err(EngineError::Validation(format!(
                "{} candidate states for {} variables",
                states.len(),
                self.labels.len()
            )));
        }
        for (c, s) in self.linear.iter_mut().zip(states) {
            *c += scale * model.energy_of(s)?;
        }
        Ok(self)
    }

    pub fn constraint(mut self, c: Constraint) -> Self {
        self.constraints.push(c);
        self
    }

    /// Explicit penalty weight, overriding the multiplier rule.
    pub fn penalty_weight(mut self, w: f64) -> Self {
        self.penalty_weight = Some(w);
        self
    }

    /// Penalty = multiplier × max |objective coefficient|. Default 10.
    pub fn penalty_multiplier(mut self, m: f64) -> Self {
        self.penalty_multiplier = m;
        self
    }

    pub fn build(self) -> EngineResult<QuboProblem> {
        let n = self.labels.len();
        if n == 0 {
            return Err(EngineError::Validation(
                "QUBO problem needs at least one variable".to_string(),
            ));
        }
        let mut quadratic = Vec::with_capacity(self.quadratic.len());
        let mut linear = self.linear;
        for (&(i, j), &v) in &self.quadratic {
            if j >= n {
                return Err(EngineError::Validation(format!(
                    "term ({i}, {j}) references a variable outside 0..{n}"
                )));
            }
            if i == j {
                // x_i² = x_i
                linear[i] += v;
            } else if v != 0.0 {
                quadratic.push((i, j, v));
            }
        }
        if linear.iter().chain(quadratic.iter().map(|t| &t.2)).any(|c| !c.is_finite()) {
            return Err(EngineError::Validation(
                "objective coefficients must be finite".to_string(),
            ));
        }
        for c in &self.constraints {
            c.validate(n)?;
        }

        let scale = linear
            .iter()
            .chain(quadratic.iter().map(|t| &t.2))
            .fold(0.0f64, |m, c| m.max(c.abs()));
        let penalty = match self.penalty_weight {
            Some(w) if w.is_finite() && w > 0.0 => w,
            Some(w) => {
                return Err(EngineError::Validation(format!(
                    "penalty weight must be finite and > 0, got {w}"
                )))
            }
            None if scale > 0.0 => self.penalty_multiplier * scale,
            None => 1.0,
        };

        // Slack bits are appended after the decision variables.
        let mut slack: Vec<(usize, Vec<f64>)> = Vec::new();
        let mut n_total = n;
        for (ci, c) in self.constraints.iter().enumerate() {
            if let Constraint::Inequality { .. } = c {
                let coeffs = slack_coefficients(c)?;
                n_total += coeffs.len();
                slack.push((ci, coeffs));
            }
        }

        let mut q = vec![vec![0.0; n_total]; n_total];
        for (i, &v) in linear.iter().enumerate() {
            q[i][i] += v;
        }
        for &(i, j, v) in &quadratic {
            q[i][j] += 0.5 * v;
            q[j][i] += 0.5 * v;
        }

        let mut offset = 0.0;
        let mut next_slack = n;
        for (ci, c) in self.constraints.iter().enumerate() {
            let mut terms = c.merged_terms();
            let (_, _, bound) = c.parts();
            if let Some((_, coeffs)) = slack.iter().find(|(k, _)| *k == ci) {
                for &cm in coeffs {
                    terms.push((next_slack, cm));
                    next_slack += 1;
                }
            }
            offset += fold_squared_penalty(&mut q, &terms, bound, penalty);
        }

        Ok(QuboProblem {
            labels: self.labels,
            n_vars: n,
            q,
            offset,
            linear,
            quadratic,
            constraints: self.constraints,
            penalty,
        })
    }
}

/// Binary slack coefficients whose subset sums cover [0, upper].
fn slack_coefficients(c: &Constraint) -> EngineResult<Vec<f64>> {
    let (_, _, bound) = c.parts();
    let terms = c.merged_terms();
    let min_lhs: f64 = terms.iter().map(|(_, w)| w.min(0.0)).sum();
    let upper = bound - min_lhs;
    if upper < -FEASIBILITY_TOL {
        return Err(EngineError::Validation(format!(
            "inequality infeasible: bound {bound} below minimum attainable {min_lhs}"
        )));
    }
    let integral = bound.fract() == 0.0 && terms.iter().all(|(_, w)| w.fract() == 0.0);
    let (resolution, levels) = if integral {
        (1.0, upper.max(0.0).floor())
    } else {
        let levels = f64::from(2u32.pow(FRACTIONAL_SLACK_BITS) - 1);
        (upper.max(0.0) / levels, levels)
    };
    if levels < 1.0 {
        return Ok(Vec::new());
    }
    let k = (levels.log2().floor() as u32) + 1;
    let mut coeffs: Vec<f64> = (0..k - 1).map(|m| resolution * 2f64.powi(m as i32)).collect();
    let covered = 2f64.powi(k as i32 - 1) - 1.0;
    coeffs.push(resolution * (levels - covered));
    Ok(coeffs)
}

/// Add P·(Σ w_k x_k − b)² to Q; returns the constant P·b².
fn fold_squared_penalty(q: &mut [Vec<f64>], terms: &[(usize, f64)], bound: f64, p: f64) -> f64 {
    for (a, &(k, wk)) in terms.iter().enumerate() {
        q[k][k] += p * (wk * wk - 2.0 * bound * wk);
        for &(l, wl) in &terms[a + 1..] {
            q[k][l] += p * wk * wl;
            q[l][k] += p * wk * wl;
        }
    }
    p * bound * bound
}

/// Symmetric QUBO with its unpenalised objective and constraints retained
/// for re-checking. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuboProblem {
    labels: Vec<String>,
    n_vars: usize,
    q: Vec<Vec<f64>>,
    offset: f64,
    linear: Vec<f64>,
    quadratic: Vec<(usize, usize, f64)>,
    constraints: Vec<Constraint>,
    penalty: f64,
}

impl QuboProblem {
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Decision variables, excluding slack bits.
    pub fn n_vars(&self) -> usize {
        self.n_vars
    }

    /// Decision variables plus slack bits.
    pub fn dim(&self) -> usize {
        self.q.len()
    }

    pub fn matrix(&self) -> &[Vec<f64>] {
        &self.q
    }

    pub fn offset(&self) -> f64 {
        self.offset
    }

    pub fn penalty(&self) -> f64 {
        self.penalty
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn to_json(&self) -> EngineResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load a persisted problem, re-checking the invariants `build` enforces.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        let problem: Self = serde_json::from_str(json)?;
        problem.validate()?;
        Ok(problem)
    }

    fn validate(&self) -> EngineResult<()> {
        let n = self.n_vars;
        if n == 0 {
            return Err(EngineError::Validation(
                "QUBO problem needs at least one variable".to_string(),
            ));
        }
        if self.labels.len() != n || self.linear.len() != n {
            return Err(EngineError::Validation(format!(
                "{} labels and {} linear terms for {n} variables",
                self.labels.len(),
                self.linear.len()
            )));
        }
        let dim = self.q.len();
        if dim < n || self.q.iter().any(|row| row.len() != dim) {
            return Err(EngineError::Validation(format!(
                "QUBO matrix must be square with at least {n} rows"
            )));
        }
        if let Some(&(i, j, _)) = self.quadratic.iter().find(|&&(i, j, _)| i >= n || j >= n || i == j) {
            return Err(EngineError::Validation(format!(
                "term ({i}, {j}) is not a pair of distinct variables in 0..{n}"
            )));
        }
        let finite = self.offset.is_finite()
            && self.q.iter().flatten().all(|v| v.is_finite())
            && self
                .linear
                .iter()
                .chain(self.quadratic.iter().map(|t| &t.2))
                .all(|c| c.is_finite());
        if !finite {
            return Err(EngineError::Validation(
                "QUBO coefficients must be finite".to_string(),
            ));
        }
        for c in &self.constraints {
            c.validate(n)?;
        }
        if !(self.penalty.is_finite() && self.penalty > 0.0) {
            return Err(EngineError::Validation(format!(
                "penalty weight must be finite and > 0, got {}",
                self.penalty
            )));
        }
        Ok(())
    }

    /// Full penalised energy over decision + slack bits.
    pub fn energy(&self, x: &[bool]) -> f64 {
        let mut e = self.offset;
        for (i, row) in self.q.iter().enumerate() {
            if !x[i] {
                continue;
            }
            e += row[i];
            for (j, &qij) in row.iter().enumerate() {
                if j != i && x[j] {
                    e += qij;
                }
            }
        }
        e
    }

    /// Unpenalised objective over the decision variables.
    pub fn objective(&self, x: &[bool]) -> f64 {
        let lin: f64 = self
            .linear
            .iter()
            .zip(x)
            .filter(|(_, &xi)| xi)
            .map(|(c, _)| c)
            .sum();
        let quad: f64 = self
            .quadratic
            .iter()
            .filter(|&&(i, j, _)| x[i] && x[j])
            .map(|t| t.2)
            .sum();
        lin + quad
    }

    pub fn constraints_satisfied(&self, x: &[bool]) -> bool {
        self.constraints.iter().all(|c| c.is_satisfied(x))
    }

    /// T0 ≈ half the largest single-flip |ΔE| bound.
    pub fn initial_temperature(&self) -> f64 {
        let max_row = self
            .q
            .iter()
            .enumerate()
            .map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(|(j, v)| if i == j { v.abs() } else { 2.0 * v.abs() })
                    .sum::<f64>()
            })
            .fold(0.0, f64::max);
        (0.5 * max_row).max(1e-6)
    }

    fn result(&self, x: Vec<bool>, iterations_used: usize, seed: u64) -> QuboResult {
        let qubo_energy = self.energy(&x);
        let solution: Vec<bool> = x[..self.n_vars].to_vec();
        QuboResult {
            objective_value: self.objective(&solution),
            constraints_satisfied: self.constraints_satisfied(&solution),
            selected: solution
                .iter()
                .zip(&self.labels)
                .filter(|(&s, _)| s)
                .map(|(_, l)| l.clone())
                .collect(),
            solution,
            qubo_energy,
            iterations_used,
            seed,
        }
    }
}

/// Solver output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuboResult {
    /// Decision bits, slack stripped.
    pub solution: Vec<bool>,
    /// Labels of the selected variables.
    pub selected: Vec<String>,
    pub objective_value: f64,
    pub qubo_energy: f64,
    pub constraints_satisfied: bool,
    pub iterations_used: usize,
    pub seed: u64,
}

/// Local fields f_i = Σ_{j≠i} Q_ij x_j kept in sync with x.
struct LocalField<'a> {
    q: &'a [Vec<f64>],
    x: Vec<bool>,
    field: Vec<f64>,
}

impl<'a> LocalField<'a> {
    fn new(q: &'a [Vec<f64>], x: Vec<bool>) -> Self {
        let field = (0..q.len())
            .map(|i| {
                q[i].iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i && x[j])
                    .map(|(_, v)| v)
                    .sum::<f64>()
            })
            .collect();
        Self { q, x, field }
    }

    #[inline]
    fn delta(&self, i: usize) -> f64 {
        let sign = if self.x[i] { -1.0 } else { 1.0 };
        sign * (self.q[i][i] + 2.0 * self.field[i])
    }

    fn flip(&mut self, i: usize) {
        let dx = if self.x[i] { -1.0 } else { 1.0 };
        self.x[i] = !self.x[i];
        for (j, f) in self.field.iter_mut().enumerate() {
            if j != i {
                *f += self.q[j][i] * dx;
            }
        }
    }
}

/// Simulated-annealing QUBO solver.
#[derive(Debug, Clone)]
pub struct QuboOptimizer {
    cfg: AnnealConfig,
}

impl QuboOptimizer {
    pub fn new(cfg: AnnealConfig) -> EngineResult<Self> {
        cfg.validate()?;
        Ok(Self { cfg })
    }

    pub fn config(&self) -> &AnnealConfig {
        &self.cfg
    }

    /// Builder using this optimizer's penalty multiplier.
    pub fn builder<S: Into<String>>(&self, labels: impl IntoIterator<Item = S>) -> QuboBuilder {
        QuboBuilder::new(labels).penalty_multiplier(self.cfg.penalty_multiplier)
    }

    /// Anneal `cfg.restarts` times (in parallel when > 1) and keep the best.
    pub fn solve(&self, problem: &QuboProblem) -> QuboResult {
        self.solve_best_of(problem, self.cfg.restarts)
    }

    /// Best of `k` independent restarts with seeds `seed + r`. Feasible
    /// results win over infeasible ones, then lower energy.
    pub fn solve_best_of(&self, problem: &QuboProblem, k: usize) -> QuboResult {
        let k = k.max(1);
        let runs: Vec<QuboResult> = (0..k)
            .into_par_iter()
            .map(|r| self.anneal(problem, self.cfg.seed.wrapping_add(r as u64)))
            .collect();
        let mut best: Option<QuboResult> = None;
        for run in runs {
            let better = match &best {
                None => true,
                Some(b) => {
                    (run.constraints_satisfied && !b.constraints_satisfied)
                        || (run.constraints_satisfied == b.constraints_satisfied
                            && run.qubo_energy < b.qubo_energy)
                }
            };
            if better {
                best = Some(run);
            }
        }
        let best = best.unwrap_or_else(|| self.anneal(problem, self.cfg.seed));
        if !best.constraints_satisfied {
            log::warn!(
                "QUBO best of {k}: no feasible solution found (energy {:.4}, penalty {:.4})",
                best.qubo_energy,
                problem.penalty()
            );
        }
        best
    }

    /// One annealing run from a random start.
    pub fn anneal(&self, problem: &QuboProblem, seed: u64) -> QuboResult {
        let cfg = &self.cfg;
        let n = problem.dim();
        let mut rng = StdRng::seed_from_u64(seed);
        let start: Vec<bool> = (0..n).map(|_| rng.gen::<bool>()).collect();
        let mut state = LocalField::new(&problem.q, start);

        let mut energy = problem.energy(&state.x);
        let mut best_x = state.x.clone();
        let mut best_e = energy;
        let mut t = cfg
            .initial_temperature
            .unwrap_or_else(|| problem.initial_temperature());
        let mut stall = 0usize;
        let mut iterations = 0usize;

        while iterations < cfg.max_iterations {
            iterations += 1;
            let i = rng.gen_range(0..n);
            let delta = state.delta(i);
            if delta <= 0.0 || rng.gen::<f64>() < (-delta / t).exp() {
                state.flip(i);
                energy += delta;
            }
            if energy < best_e - 1e-12 {
                best_e = energy;
                best_x.clone_from(&state.x);
                stall = 0;
            } else {
                stall += 1;
                if stall >= cfg.stall_limit {
                    break;
                }
            }
            t = (t * cfg.decay).max(cfg.min_temperature);
        }

        log::debug!("anneal seed={seed}: {iterations} iterations, best E={best_e:.6}");
        problem.result(best_x, iterations, seed)
    }

    /// Steepest single-flip descent from all-zeros. Deterministic baseline.
    pub fn greedy(problem: &QuboProblem) -> QuboResult {
        let mut state = LocalField::new(&problem.q, vec![false; problem.dim()]);
        let mut iterations = 0;
        loop {
            let best = (0..state.x.len())
                .map(|i| (i, state.delta(i)))
                .min_by(|a, b| a.1.total_cmp(&b.1));
            match best {
                Some((i, d)) if d < -1e-12 => {
                    state.flip(i);
                    iterations += 1;
                }
                _ => break,
            }
        }
        problem.result(state.x, iterations, 0)
    }
}

/// Capital assigned to one selected variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Allocation {
    pub label: String,
    pub weight: f64,
    pub amount: f64,
    pub units: f64,
}

/// Equal-weight split of `capital` across the selected variables;
/// `prices[i]` converts amount into whole units.
pub fn allocate(
    problem: &QuboProblem,
    result: &QuboResult,
    capital: f64,
    prices: &[f64],
) -> EngineResult<Vec<Allocation>> {
    if prices.len() != problem.n_vars() {
        return Err(EngineError::Validation(format!(
            "{} prices for {} variables",
            prices.len(),
            problem.n_vars()
        )));
    }
    let chosen: Vec<usize> = result
        .solution
        .iter()
        .enumerate()
        .filter(|(_, &s)| s)
        .map(|(i, _)| i)
        .collect();
    if chosen.is_empty() {
        return Ok(Vec::new());
    }
    let weight = 1.0 / chosen.len() as f64;
    chosen
        .into_iter()
        .map(|i| {
            let price = prices[i];
            if !(price.is_finite() && price > 0.0) {
                return Err(EngineError::Validation(format!(
                    "price for '{}' must be > 0, got {price}",
                    problem.labels()[i]
                )));
            }
            let amount = capital * weight;
            Ok(Allocation {
                label: problem.labels()[i].clone(),
                weight,
                amount,
                units: (amount / price).floor(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one_hot_problem(values: [f64; 3]) -> QuboProblem {
        QuboBuilder::new(["A", "B", "C"])
            .linear(0, -values[0])
            .linear(1, -values[1])
            .linear(2, -values[2])
            .constraint(Constraint::exactly_k(vec![0, 1, 2], 1))
            .build()
            .unwrap()
    }

    fn all_states(n: usize) -> impl Iterator<Item = Vec<bool>> {
        (0..1u32 << n).map(move |m| (0..n).map(|b| m & (1 << b) != 0).collect())
    }

    #[test]
    fn test_default_penalty_is_ten_times_max_coefficient() {
        let p = one_hot_problem([1.0, 3.0, 2.0]);
        assert_eq!(p.penalty(), 30.0);
    }

    #[test]
    fn test_optimizer_builder_uses_configured_multiplier() {
        let opt = QuboOptimizer::new(AnnealConfig {
            penalty_multiplier: 25.0,
            ..Default::default()
        })
        .unwrap();
        let p = opt.builder(["a", "b"]).linear(0, -2.0).build().unwrap();
        assert_eq!(p.penalty(), 50.0);
    }

    #[test]
    fn test_zero_objective_penalty_falls_back_to_one() {
        let p = QuboBuilder::new(["x", "y"])
            .constraint(Constraint::exactly_k(vec![0, 1], 1))
            .build()
            .unwrap();
        assert_eq!(p.penalty(), 1.0);
    }

    #[test]
    fn test_energy_equals_objective_plus_penalty() {
        let p = one_hot_problem([1.0, 3.0, 2.0]);
        for x in all_states(3) {
            let count = x.iter().filter(|&&b| b).count() as f64;
            let expected = p.objective(&x) + p.penalty() * (count - 1.0).powi(2);
            assert!((p.energy(&x) - expected).abs() < 1e-9, "{x:?}");
        }
    }

    #[test]
    fn test_local_field_delta_matches_full_evaluation() {
        let p = QuboBuilder::new(["a", "b", "c", "d"])
            .linear(0, 1.5)
            .linear(2, -2.0)
            .quadratic(0, 1, -0.7)
            .quadratic(1, 3, 2.2)
            .quadratic(2, 3, 0.4)
            .constraint(Constraint::at_most(vec![0, 1, 2, 3], vec![1.0, 2.0, 1.0, 3.0], 4.0))
            .build()
            .unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let x: Vec<bool> = (0..p.dim()).map(|_| rng.gen()).collect();
        let mut field = LocalField::new(p.matrix(), x);
        for _ in 0..200 {
            let i = rng.gen_range(0..p.dim());
            let before = p.energy(&field.x);
            let predicted = field.delta(i);
            field.flip(i);
            let actual = p.energy(&field.x) - before;
            assert!((predicted - actual).abs() < 1e-9, "ΔE {predicted} vs {actual}");
        }
    }

    #[test]
    fn test_one_hot_always_feasible() {
        let problem = one_hot_problem([2.0, 5.0, 3.0]);
        for seed in 0..50 {
            let opt = QuboOptimizer::new(AnnealConfig {
                seed,
                ..Default::default()
            })
            .unwrap();
            let r = opt.solve(&problem);
            assert!(r.constraints_satisfied, "seed {seed}: {:?}", r.solution);
            assert_eq!(r.solution.iter().filter(|&&b| b).count(), 1);
        }
    }

    #[test]
    fn test_one_hot_picks_best_value() {
        let problem = one_hot_problem([2.0, 5.0, 3.0]);
        let r = QuboOptimizer::new(AnnealConfig::default())
            .unwrap()
            .solve(&problem);
        assert_eq!(r.selected, vec!["B".to_string()]);
        assert!((r.objective_value + 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_slack_coefficients_cover_bound_exactly() {
        let c = Constraint::at_most(vec![0, 1], vec![3.0, 2.0], 4.0);
        let coeffs = slack_coefficients(&c).unwrap();
        assert_eq!(coeffs, vec![1.0, 2.0, 1.0]);
        let c = Constraint::at_most(vec![0], vec![1.0], 7.0);
        assert_eq!(slack_coefficients(&c).unwrap(), vec![1.0, 2.0, 4.0]);
        let c = Constraint::at_most(vec![0], vec![1.0], 0.0);
        assert!(slack_coefficients(&c).unwrap().is_empty());
    }

    #[test]
    fn test_knapsack_inequality() {
        // values 6, 5, 4; weights 3, 2, 2; budget 4 → pick {1, 2}
        let problem = QuboBuilder::new(["x", "y", "z"])
            .linear(0, -6.0)
            .linear(1, -5.0)
            .linear(2, -4.0)
            .constraint(Constraint::at_most(vec![0, 1, 2], vec![3.0, 2.0, 2.0], 4.0))
            .build()
            .unwrap();
        assert_eq!(problem.dim(), 6);
        let opt = QuboOptimizer::new(AnnealConfig {
            restarts: 4,
            ..Default::default()
        })
        .unwrap();
        let r = opt.solve(&problem);
        assert!(r.constraints_satisfied);
        assert_eq!(r.solution, vec![false, true, true]);
        assert!((r.objective_value + 9.0).abs() < 1e-12);
    }

    #[test]
    fn test_infeasible_inequality_rejected() {
        let res = QuboBuilder::new(["x"])
            .linear(0, 1.0)
            .constraint(Constraint::at_most(vec![0], vec![1.0], -1.0))
            .build();
        assert!(res.is_err());
    }

    #[test]
    fn test_out_of_range_variable_rejected() {
        assert!(QuboBuilder::new(["x"]).quadratic(0, 3, 1.0).build().is_err());
        assert!(QuboBuilder::new(["x"])
            .constraint(Constraint::exactly_k(vec![0, 1], 1))
            .build()
            .is_err());
    }

    #[test]
    fn test_stall_limit_stops_early() {
        let problem = one_hot_problem([1.0, 1.0, 4.0]);
        let opt = QuboOptimizer::new(AnnealConfig {
            max_iterations: 100_000,
            stall_limit: 500,
            ..Default::default()
        })
        .unwrap();
        let r = opt.anneal(&problem, 11);
        assert!(r.iterations_used < 100_000);
    }

    #[test]
    fn test_same_seed_is_reproducible() {
        let problem = one_hot_problem([2.0, 5.0, 3.0]);
        let opt = QuboOptimizer::new(AnnealConfig::default()).unwrap();
        assert_eq!(opt.anneal(&problem, 99), opt.anneal(&problem, 99));
    }

    #[test]
    fn test_problem_json_round_trip_keeps_energies() {
        let p = one_hot_problem([2.0, 5.0, 3.0]);
        let back = QuboProblem::from_json(&p.to_json().unwrap()).unwrap();
        for x in all_states(3) {
            assert_eq!(p.energy(&x), back.energy(&x));
        }
        assert!(QuboProblem::from_json("{").is_err());
    }

    #[test]
    fn test_from_json_rejects_malformed_problems() {
        let valid: serde_json::Value =
            serde_json::from_str(&one_hot_problem([2.0, 5.0, 3.0]).to_json().unwrap()).unwrap();
        let tampered = |edit: &dyn Fn(&mut serde_json::Value)| {
            let mut v = valid.clone();
            edit(&mut v);
            QuboProblem::from_json(&v.to_string())
        };

        let empty = tampered(&|v| {
            v["labels"] = serde_json::json!([]);
            v["n_vars"] = serde_json::json!(0);
            v["q"] = serde_json::json!([]);
            v["linear"] = serde_json::json!([]);
            v["constraints"] = serde_json::json!([]);
        });
        assert!(matches!(empty, Err(EngineError::Validation(_))));

        let out_of_range = tampered(&|v| v["quadratic"] = serde_json::json!([[0, 7, 1.0]]));
        assert!(matches!(out_of_range, Err(EngineError::Validation(_))));

        let short_labels = tampered(&|v| v["labels"] = serde_json::json!(["A"]));
        assert!(matches!(short_labels, Err(EngineError::Validation(_))));

        let bad_constraint = tampered(&|v| {
            v["constraints"] = serde_json::json!([
                {"Equality": {"vars": [0, 9], "weights": [1.0, 1.0], "bound": 1.0}}
            ])
        });
        assert!(matches!(bad_constraint, Err(EngineError::Validation(_))));

        let zero_penalty = tampered(&|v| v["penalty"] = serde_json::json!(0.0));
        assert!(matches!(zero_penalty, Err(EngineError::Validation(_))));

        assert!(tampered(&|_| {}).is_ok());
    }

    #[test]
    fn test_greedy_finds_one_hot_optimum() {
        let problem = one_hot_problem([2.0, 5.0, 3.0]);
        let r = QuboOptimizer::greedy(&problem);
        assert!(r.constraints_satisfied);
        assert_eq!(r.selected, vec!["B".to_string()]);
    }

    #[test]
    fn test_allocation_equal_weights() {
        let problem = QuboBuilder::new(["AAA", "BBB", "CCC"])
            .linear(0, -1.0)
            .linear(1, -1.0)
            .linear(2, 1.0)
            .build()
            .unwrap();
        let r = QuboOptimizer::greedy(&problem);
        let alloc = allocate(&problem, &r, 1_000.0, &[10.0, 30.0, 5.0]).unwrap();
        assert_eq!(alloc.len(), 2);
        assert_eq!(alloc[0].label, "AAA");
        assert_eq!(alloc[0].weight, 0.5);
        assert_eq!(alloc[0].units, 50.0);
        assert_eq!(alloc[1].units, 16.0);
    }

    #[test]
    fn test_model_energies_become_linear_terms() {
        let model = hamilton_physics::models::harmonic_oscillator(1.0, 1.0);
        let states = vec![
            PhaseSpaceState::at_rest(vec![2.0]),
            PhaseSpaceState::at_rest(vec![0.5]),
        ];
        let problem = QuboBuilder::new(["far", "near"])
            .with_model_energies(&model, &states, 1.0)
            .unwrap()
            .constraint(Constraint::exactly_k(vec![0, 1], 1))
            .build()
            .unwrap();
        let r = QuboOptimizer::greedy(&problem);
        assert_eq!(r.selected, vec!["near".to_string()]);
    }
}
