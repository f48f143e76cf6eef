// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Coupling Graph
// ─────────────────────────────────────────────────────────────────────
//! N Hamiltonian subsystems bound by a symmetric coupling matrix Λ and
//! pairwise potentials V_ij:
//!
//!   H_total = Σ_i H_i(q_i, p_i) + Σ_{i<j} Λ_ij · V_ij(state_i, state_j)
//!
//! Construction validates Λ (square, finite, symmetric, zero diagonal)
//! and requires a potential for every non-zero pair. Nothing is repaired
//! silently. The graph is immutable once built; re-coupling produces a
//! new graph via [`CouplingGraph::with_lambda`].

use std::fmt;
use std::sync::Arc;

use rayon::prelude::*;

use hamilton_types::{
    CouplingDescriptor, EngineError, EngineResult, JointState, PairTermDescriptor,
    PhaseSpaceState, SystemDescriptor,
};

use crate::hamiltonian::{HamiltonianModel, DEFAULT_FD_STEP};
use crate::integrator::SymplecticFlow;
use crate::models;

/// Symmetry tolerance on Λ.
pub const SYMMETRY_TOL: f64 = 1e-12;

/// V(state_a, state_b).
pub type PairPotential = Arc<dyn Fn(&PhaseSpaceState, &PhaseSpaceState) -> f64 + Send + Sync>;

/// (∂V/∂x_a, ∂V/∂x_b) for x = q or p.
pub type PairGradient =
    Arc<dyn Fn(&PhaseSpaceState, &PhaseSpaceState) -> (Vec<f64>, Vec<f64>) + Send + Sync>;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Axis {
    Q,
    P,
}

/// Pairwise coupling potential with optional closed-form gradients.
#[derive(Clone)]
pub struct CouplingTerm {
    name: String,
    potential: PairPotential,
    grad_q: Option<PairGradient>,
    grad_p: Option<PairGradient>,
    momentum_dependent: bool,
    fd_step: f64,
}

impl fmt::Debug for CouplingTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CouplingTerm")
            .field("name", &self.name)
            .field("momentum_dependent", &self.momentum_dependent)
            .finish()
    }
}

impl CouplingTerm {
    /// Position-only term with finite-difference gradients.
    pub fn new<V>(name: impl Into<String>, potential: V) -> Self
    where
        V: Fn(&PhaseSpaceState, &PhaseSpaceState) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            potential: Arc::new(potential),
            grad_q: None,
            grad_p: None,
            momentum_dependent: false,
            fd_step: DEFAULT_FD_STEP,
        }
    }

    /// Mark the term as depending on momenta, so it contributes to ∂H/∂p.
    pub fn momentum_dependent(mut self) -> Self {
        self.momentum_dependent = true;
        self
    }

    pub fn with_grad_q<G>(mut self, g: G) -> Self
    where
        G: Fn(&PhaseSpaceState, &PhaseSpaceState) -> (Vec<f64>, Vec<f64>) + Send + Sync + 'static,
    {
        self.grad_q = Some(Arc::new(g));
        self
    }

    pub fn with_grad_p<G>(mut self, g: G) -> Self
    where
        G: Fn(&PhaseSpaceState, &PhaseSpaceState) -> (Vec<f64>, Vec<f64>) + Send + Sync + 'static,
    {
        self.grad_p = Some(Arc::new(g));
        self
    }

    pub fn with_fd_step(mut self, h: f64) -> EngineResult<Self> {
        if !(h.is_finite() && h > 0.0) {
            return Err(EngineError::Validation(format!(
                "coupling '{}': finite-difference step must be finite and > 0, got {h}",
                self.name
            )));
        }
        self.fd_step = h;
        Ok(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_momentum_dependent(&self) -> bool {
        self.momentum_dependent
    }

    /// ½ Σ_k (q_a,k − q_b,k)².
    pub fn spring() -> Self {
        Self::new("spring", |a, b| {
            0.5 * a.q.iter().zip(&b.q).map(|(x, y)| (x - y).powi(2)).sum::<f64>()
        })
        .with_grad_q(|a, b| {
            let d: Vec<f64> = a.q.iter().zip(&b.q).map(|(x, y)| x - y).collect();
            let neg = d.iter().map(|v| -v).collect();
            (d, neg)
        })
    }

    /// Σ_k q_a,k · q_b,k.
    pub fn bilinear() -> Self {
        Self::new("bilinear", |a, b| {
            a.q.iter().zip(&b.q).map(|(x, y)| x * y).sum::<f64>()
        })
        .with_grad_q(|a, b| (b.q.clone(), a.q.clone()))
    }

    /// Σ_k [1 − cos(q_a,k − q_b,k)], the phase-locking potential.
    pub fn phase_alignment() -> Self {
        Self::new("phase_alignment", |a, b| {
            a.q.iter()
                .zip(&b.q)
                .map(|(x, y)| 1.0 - (x - y).cos())
                .sum::<f64>()
        })
        .with_grad_q(|a, b| {
            let s: Vec<f64> = a.q.iter().zip(&b.q).map(|(x, y)| (x - y).sin()).collect();
            let neg = s.iter().map(|v| -v).collect();
            (s, neg)
        })
    }

    /// Σ_k p_a,k · p_b,k, a gyroscopic-style momentum coupling.
    pub fn momentum_exchange() -> Self {
        Self::new("momentum_exchange", |a, b| {
            a.p.iter().zip(&b.p).map(|(x, y)| x * y).sum::<f64>()
        })
        .momentum_dependent()
        .with_grad_q(|a, b| (vec![0.0; a.q.len()], vec![0.0; b.q.len()]))
        .with_grad_p(|a, b| (b.p.clone(), a.p.clone()))
    }

    /// Names accepted by [`CouplingTerm::preset`].
    pub const PRESETS: [&'static str; 4] =
        ["spring", "bilinear", "phase_alignment", "momentum_exchange"];

    pub fn preset(name: &str) -> EngineResult<Self> {
        match name {
            "spring" => Ok(Self::spring()),
            "bilinear" => Ok(Self::bilinear()),
            "phase_alignment" => Ok(Self::phase_alignment()),
            "momentum_exchange" => Ok(Self::momentum_exchange()),
            other => Err(EngineError::Validation(format!(
                "unknown coupling term '{other}' (presets: {})",
                Self::PRESETS.join(", ")
            ))),
        }
    }

    pub fn value(&self, a: &PhaseSpaceState, b: &PhaseSpaceState) -> f64 {
        (self.potential)(a, b)
    }

    fn gradient(
        &self,
        a: &PhaseSpaceState,
        b: &PhaseSpaceState,
        axis: Axis,
    ) -> (Vec<f64>, Vec<f64>) {
        let analytic = match axis {
            Axis::Q => self.grad_q.as_ref(),
            Axis::P => self.grad_p.as_ref(),
        };
        match analytic {
            Some(g) => g(a, b),
            None => (self.fd_side(a, b, axis, true), self.fd_side(a, b, axis, false)),
        }
    }

    /// Central difference with respect to one side of the pair.
    fn fd_side(
        &self,
        a: &PhaseSpaceState,
        b: &PhaseSpaceState,
        axis: Axis,
        first: bool,
    ) -> Vec<f64> {
        let h = self.fd_step;
        let mut work = if first { a.clone() } else { b.clone() };
        let eval = |w: &PhaseSpaceState| {
            if first {
                self.value(w, b)
            } else {
                self.value(a, w)
            }
        };
        let n = work.q.len();
        let mut grad = Vec::with_capacity(n);
        for k in 0..n {
            let orig = *slot(&mut work, axis, k);
            *slot(&mut work, axis, k) = orig + h;
            let plus = eval(&work);
            *slot(&mut work, axis, k) = orig - h;
            let minus = eval(&work);
            *slot(&mut work, axis, k) = orig;
            grad.push((plus - minus) / (2.0 * h));
        }
        grad
    }
}

#[inline]
fn slot(s: &mut PhaseSpaceState, axis: Axis, k: usize) -> &mut f64 {
    match axis {
        Axis::Q => &mut s.q[k],
        Axis::P => &mut s.p[k],
    }
}

/// A non-zero pair i < j with its resolved term orientation.
#[derive(Clone, Debug)]
struct ActivePair {
    i: usize,
    j: usize,
    strength: f64,
    term: CouplingTerm,
    /// Term was supplied at [j][i]; evaluate as V(state_j, state_i).
    swapped: bool,
}

impl ActivePair {
    fn args<'a>(&self, s: &'a [PhaseSpaceState]) -> (&'a PhaseSpaceState, &'a PhaseSpaceState) {
        if self.swapped {
            (&s[self.j], &s[self.i])
        } else {
            (&s[self.i], &s[self.j])
        }
    }

    fn value(&self, s: &[PhaseSpaceState]) -> f64 {
        let (a, b) = self.args(s);
        self.term.value(a, b)
    }

    /// Gradient contributions for (subsystem i, subsystem j).
    fn gradient(&self, s: &[PhaseSpaceState], axis: Axis) -> (Vec<f64>, Vec<f64>) {
        let (a, b) = self.args(s);
        let (ga, gb) = self.term.gradient(a, b, axis);
        if self.swapped {
            (gb, ga)
        } else {
            (ga, gb)
        }
    }
}

/// Validated, immutable coupling of N subsystems.
#[derive(Clone, Debug)]
pub struct CouplingGraph {
    models: Vec<HamiltonianModel>,
    lambda: Vec<Vec<f64>>,
    terms: Vec<Vec<Option<CouplingTerm>>>,
    pairs: Vec<ActivePair>,
}

impl CouplingGraph {
    /// Validate and build. Fails with `MalformedCoupling` on any violation.
    pub fn new(
        models: Vec<HamiltonianModel>,
        lambda: Vec<Vec<f64>>,
        terms: Vec<Vec<Option<CouplingTerm>>>,
    ) -> EngineResult<Self> {
        let n = models.len();
        if n == 0 {
            return Err(EngineError::MalformedCoupling(
                "coupling graph needs at least one subsystem".to_string(),
            ));
        }
        if lambda.len() != n || lambda.iter().any(|row| row.len() != n) {
            return Err(EngineError::MalformedCoupling(format!(
                "Λ must be {n}×{n} to match {n} subsystems"
            )));
        }
        if terms.len() != n || terms.iter().any(|row| row.len() != n) {
            return Err(EngineError::MalformedCoupling(format!(
                "coupling-term matrix must be {n}×{n}"
            )));
        }

        let mut pairs = Vec::new();
        for i in 0..n {
            if lambda[i][i] != 0.0 {
                return Err(EngineError::MalformedCoupling(format!(
                    "Λ[{i}][{i}] = {} but the diagonal must be zero",
                    lambda[i][i]
                )));
            }
            for j in (i + 1)..n {
                let (lij, lji) = (lambda[i][j], lambda[j][i]);
                if !(lij.is_finite() && lji.is_finite()) {
                    return Err(EngineError::MalformedCoupling(format!(
                        "Λ[{i}][{j}] / Λ[{j}][{i}] not finite: {lij}, {lji}"
                    )));
                }
                if (lij - lji).abs() > SYMMETRY_TOL {
                    return Err(EngineError::MalformedCoupling(format!(
                        "Λ asymmetric at ({i}, {j}): {lij} != {lji}"
                    )));
                }
                if terms[i][j].is_some() && terms[j][i].is_some() {
                    return Err(EngineError::MalformedCoupling(format!(
                        "coupling potential for ({i}, {j}) given at both [{i}][{j}] and [{j}][{i}]"
                    )));
                }
                if lij == 0.0 {
                    continue;
                }
                let (term, swapped) = match (&terms[i][j], &terms[j][i]) {
                    (Some(t), _) => (t.clone(), false),
                    (None, Some(t)) => (t.clone(), true),
                    (None, None) => {
                        return Err(EngineError::MalformedCoupling(format!(
                            "Λ[{i}][{j}] = {lij} but no coupling potential is defined for the pair"
                        )))
                    }
                };
                pairs.push(ActivePair {
                    i,
                    j,
                    strength: lij,
                    term,
                    swapped,
                });
            }
        }

        Ok(Self {
            models,
            lambda,
            terms,
            pairs,
        })
    }

    /// Independent subsystems, Λ = 0.
    pub fn uncoupled(models: Vec<HamiltonianModel>) -> EngineResult<Self> {
        let n = models.len();
        Self::new(models, vec![vec![0.0; n]; n], vec![vec![None; n]; n])
    }

    pub fn builder(models: Vec<HamiltonianModel>) -> CouplingGraphBuilder {
        let n = models.len();
        CouplingGraphBuilder {
            models,
            lambda: vec![vec![0.0; n]; n],
            terms: vec![vec![None; n]; n],
            error: None,
        }
    }

    /// Same subsystems and potentials under a new Λ, validated afresh.
    pub fn with_lambda(&self, lambda: Vec<Vec<f64>>) -> EngineResult<Self> {
        Self::new(self.models.clone(), lambda, self.terms.clone())
    }

    /// Rebuild from a checkpoint descriptor using the model library and
    /// coupling presets.
    pub fn from_descriptor(desc: &CouplingDescriptor) -> EngineResult<Self> {
        let models = desc
            .models
            .iter()
            .map(models::build)
            .collect::<EngineResult<Vec<_>>>()?;
        let n = models.len();
        let mut terms: Vec<Vec<Option<CouplingTerm>>> = vec![vec![None; n]; n];
        for t in &desc.terms {
            if t.i >= n || t.j >= n {
                return Err(EngineError::MalformedCoupling(format!(
                    "term '{}' at ({}, {}) out of range for {n} subsystems",
                    t.name, t.i, t.j
                )));
            }
            terms[t.i][t.j] = Some(CouplingTerm::preset(&t.name)?);
        }
        Self::new(models, desc.lambda.clone(), terms)
    }

    pub fn descriptor(&self) -> CouplingDescriptor {
        let mut terms = Vec::new();
        for (i, row) in self.terms.iter().enumerate() {
            for (j, t) in row.iter().enumerate() {
                if let Some(t) = t {
                    terms.push(PairTermDescriptor {
                        i,
                        j,
                        name: t.name.clone(),
                    });
                }
            }
        }
        CouplingDescriptor {
            models: self.models.iter().map(HamiltonianModel::descriptor).collect(),
            lambda: self.lambda.clone(),
            terms,
        }
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn models(&self) -> &[HamiltonianModel] {
        &self.models
    }

    pub fn lambda(&self) -> &[Vec<f64>] {
        &self.lambda
    }

    /// True when a coupling potential is defined for (i, j) in either order.
    pub fn has_potential(&self, i: usize, j: usize) -> bool {
        let defined = |a: usize, b: usize| {
            self.terms
                .get(a)
                .and_then(|row| row.get(b))
                .is_some_and(Option::is_some)
        };
        i != j && (defined(i, j) || defined(j, i))
    }

    /// Number of pairs with non-zero coupling.
    pub fn active_pairs(&self) -> usize {
        self.pairs.len()
    }

    fn check_states(&self, states: &[PhaseSpaceState]) -> EngineResult<()> {
        if states.len() != self.models.len() {
            return Err(EngineError::Validation(format!(
                "expected {} subsystem states, got {}",
                self.models.len(),
                states.len()
            )));
        }
        for (i, s) in states.iter().enumerate() {
            s.validate()
                .map_err(|e| EngineError::Validation(format!("subsystem {i}: {e}")))?;
        }
        Ok(())
    }

    /// Σ_{i<j} Λ_ij · V_ij only.
    pub fn interaction_energy(&self, states: &[PhaseSpaceState]) -> EngineResult<f64> {
        self.check_states(states)?;
        let mut e = 0.0;
        for pair in &self.pairs {
            let v = pair.value(states);
            if !v.is_finite() {
                let (a, b) = pair.args(states);
                return Err(EngineError::evaluation(
                    format!("coupling '{}' ({}, {}) is {v}", pair.term.name, pair.i, pair.j),
                    &[a.q.as_slice(), b.q.as_slice()].concat(),
                    &[a.p.as_slice(), b.p.as_slice()].concat(),
                ));
            }
            e += pair.strength * v;
        }
        Ok(e)
    }

    /// Own energy of every subsystem.
    pub fn subsystem_energies(&self, states: &[PhaseSpaceState]) -> EngineResult<Vec<f64>> {
        self.check_states(states)?;
        self.models
            .iter()
            .zip(states)
            .map(|(m, s)| m.energy_of(s))
            .collect()
    }

    pub fn total_energy(&self, states: &[PhaseSpaceState]) -> EngineResult<f64> {
        let own: f64 = self.subsystem_energies(states)?.iter().sum();
        Ok(own + self.interaction_energy(states)?)
    }

    /// ∂H_total/∂x for every subsystem. Own gradients are evaluated in
    /// parallel and fully collected before coupling terms are added.
    fn joint_gradient(&self, states: &[PhaseSpaceState], axis: Axis) -> EngineResult<Vec<Vec<f64>>> {
        let mut grads = self
            .models
            .par_iter()
            .zip(states.par_iter())
            .map(|(m, s)| match axis {
                Axis::Q => m.grad_q(&s.q, &s.p),
                Axis::P => m.grad_p(&s.q, &s.p),
            })
            .collect::<EngineResult<Vec<Vec<f64>>>>()?;

        for pair in &self.pairs {
            if axis == Axis::P && !pair.term.momentum_dependent {
                continue;
            }
            let (gi, gj) = pair.gradient(states, axis);
            accumulate(&mut grads[pair.i], pair.strength, &gi, pair, &states[pair.i])?;
            accumulate(&mut grads[pair.j], pair.strength, &gj, pair, &states[pair.j])?;
        }
        Ok(grads)
    }
}

fn accumulate(
    target: &mut [f64],
    strength: f64,
    contribution: &[f64],
    pair: &ActivePair,
    state: &PhaseSpaceState,
) -> EngineResult<()> {
    if contribution.len() != target.len() {
        return Err(EngineError::MalformedCoupling(format!(
            "coupling '{}' ({}, {}) returned {} gradient components for a {}-dof subsystem",
            pair.term.name,
            pair.i,
            pair.j,
            contribution.len(),
            target.len()
        )));
    }
    for (t, c) in target.iter_mut().zip(contribution) {
        if !c.is_finite() {
            return Err(EngineError::evaluation(
                format!("coupling '{}' gradient is {c}", pair.term.name),
                &state.q,
                &state.p,
            ));
        }
        *t += strength * c;
    }
    Ok(())
}

impl SymplecticFlow for CouplingGraph {
    type State = JointState;

    fn energy(&self, state: &JointState) -> EngineResult<f64> {
        self.total_energy(&state.subsystems)
    }

    fn kick(&self, state: &mut JointState, h: f64) -> EngineResult<()> {
        let forces = self.joint_gradient(&state.subsystems, Axis::Q)?;
        for (sub, f) in state.subsystems.iter_mut().zip(&forces) {
            for (p, g) in sub.p.iter_mut().zip(f) {
                *p -= h * g;
            }
        }
        Ok(())
    }

    fn drift(&self, state: &mut JointState, h: f64) -> EngineResult<()> {
        let velocities = self.joint_gradient(&state.subsystems, Axis::P)?;
        for (sub, v) in state.subsystems.iter_mut().zip(&velocities) {
            for (q, g) in sub.q.iter_mut().zip(v) {
                *q += h * g;
            }
        }
        Ok(())
    }

    fn check(&self, state: &JointState) -> EngineResult<()> {
        self.check_states(&state.subsystems)
    }

    fn system(&self) -> SystemDescriptor {
        SystemDescriptor::Coupled(self.descriptor())
    }
}

/// Incremental construction with symmetric placement.
pub struct CouplingGraphBuilder {
    models: Vec<HamiltonianModel>,
    lambda: Vec<Vec<f64>>,
    terms: Vec<Vec<Option<CouplingTerm>>>,
    error: Option<EngineError>,
}

impl CouplingGraphBuilder {
    /// Set Λ_ij = Λ_ji = strength and attach `term` at [i][j], replacing any
    /// earlier term for the pair.
    pub fn couple(mut self, i: usize, j: usize, strength: f64, term: CouplingTerm) -> Self {
        let n = self.models.len();
        if i >= n || j >= n || i == j {
            self.error.get_or_insert(EngineError::MalformedCoupling(format!(
                "cannot couple ({i}, {j}) in a graph of {n} subsystems"
            )));
            return self;
        }
        self.lambda[i][j] = strength;
        self.lambda[j][i] = strength;
        self.terms[i][j] = Some(term);
        self.terms[j][i] = None;
        self
    }

    pub fn build(self) -> EngineResult<CouplingGraph> {
        if let Some(e) = self.error {
            return Err(e);
        }
        CouplingGraph::new(self.models, self.lambda, self.terms)
    }
}

/// Λ_ij = base · exp(−α|i − j|), symmetric with zero diagonal.
pub fn exponential_decay_lambda(n: usize, base: f64, alpha: f64) -> Vec<Vec<f64>> {
    let mut lambda = vec![vec![0.0; n]; n];
    for (i, row) in lambda.iter_mut().enumerate() {
        for (j, cell) in row.iter_mut().enumerate() {
            if i != j {
                *cell = base * (-alpha * i.abs_diff(j) as f64).exp();
            }
        }
    }
    lambda
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::SymplecticIntegrator;
    use hamilton_types::Checkpoint;

    fn two_oscillators(strength: f64) -> CouplingGraph {
        CouplingGraph::builder(vec![
            models::harmonic_oscillator(1.0, 1.0),
            models::harmonic_oscillator(1.0, 1.0),
        ])
        .couple(0, 1, strength, CouplingTerm::spring())
        .build()
        .unwrap()
    }

    fn displaced_pair() -> JointState {
        JointState::new(vec![
            PhaseSpaceState::new(vec![1.0], vec![0.0]).unwrap(),
            PhaseSpaceState::new(vec![0.0], vec![0.0]).unwrap(),
        ])
        .unwrap()
    }

    fn pair_terms(term: Option<CouplingTerm>) -> Vec<Vec<Option<CouplingTerm>>> {
        vec![vec![None, term], vec![None, None]]
    }

    #[test]
    fn test_asymmetric_lambda_rejected() {
        let err = CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.0, 0.1], vec![0.2, 0.0]],
            pair_terms(Some(CouplingTerm::spring())),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedCoupling(_)));
        assert!(err.to_string().contains("asymmetric"));
    }

    #[test]
    fn test_potential_on_both_sides_rejected() {
        let err = CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.0, 0.1], vec![0.1, 0.0]],
            vec![
                vec![None, Some(CouplingTerm::spring())],
                vec![Some(CouplingTerm::phase_alignment()), None],
            ],
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedCoupling(_)));
        assert!(err.to_string().contains("both"));
    }

    #[test]
    fn test_nonzero_diagonal_rejected() {
        let err = CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.5, 0.0], vec![0.0, 0.0]],
            pair_terms(None),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::MalformedCoupling(_)));
    }

    #[test]
    fn test_missing_potential_rejected() {
        let err = CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.0, 0.1], vec![0.1, 0.0]],
            pair_terms(None),
        )
        .unwrap_err();
        assert!(err.to_string().contains("no coupling potential"));
    }

    #[test]
    fn test_nan_lambda_rejected() {
        assert!(CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.0, f64::NAN], vec![f64::NAN, 0.0]],
            pair_terms(Some(CouplingTerm::spring())),
        )
        .is_err());
    }

    #[test]
    fn test_shape_mismatch_rejected() {
        assert!(CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 3],
            vec![vec![0.0, 0.0], vec![0.0, 0.0]],
            vec![vec![None; 3]; 3],
        )
        .is_err());
    }

    #[test]
    fn test_builder_rejects_self_coupling() {
        let res = CouplingGraph::builder(vec![models::harmonic_oscillator(1.0, 1.0); 2])
            .couple(1, 1, 0.3, CouplingTerm::spring())
            .build();
        assert!(matches!(res, Err(EngineError::MalformedCoupling(_))));
    }

    #[test]
    fn test_builder_produces_symmetric_lambda() {
        let g = two_oscillators(0.25);
        assert_eq!(g.lambda()[0][1], g.lambda()[1][0]);
        assert_eq!(g.active_pairs(), 1);
        assert!(g.has_potential(0, 1) && g.has_potential(1, 0));
        assert!(!g.has_potential(0, 0) && !g.has_potential(0, 5));
    }

    #[test]
    fn test_total_energy_formula() {
        let g = two_oscillators(0.1);
        let states = displaced_pair();
        // ½·1² + 0 + 0.1·½·(1 − 0)²
        let e = g.total_energy(&states.subsystems).unwrap();
        assert!((e - 0.55).abs() < 1e-12, "E={e}");
    }

    #[test]
    fn test_term_below_diagonal_evaluated_with_swapped_arguments() {
        // V(a, b) = a.q · b.q², deliberately asymmetric in its arguments.
        let term = CouplingTerm::new("skew", |a, b| a.q[0] * b.q[0] * b.q[0]);
        let g = CouplingGraph::new(
            vec![models::harmonic_oscillator(1.0, 1.0); 2],
            vec![vec![0.0, 1.0], vec![1.0, 0.0]],
            vec![vec![None, None], vec![Some(term), None]],
        )
        .unwrap();
        let s0 = PhaseSpaceState::at_rest(vec![2.0]);
        let s1 = PhaseSpaceState::at_rest(vec![3.0]);
        // Term at [1][0] ⇒ V(state_1, state_0) = 3 · 2² = 12
        let v = g.interaction_energy(&[s0, s1]).unwrap();
        assert!((v - 12.0).abs() < 1e-12, "V={v}");
    }

    #[test]
    fn test_fd_coupling_force_matches_analytic_spring() {
        let fd = CouplingTerm::new("spring_fd", |a, b| {
            0.5 * a.q.iter().zip(&b.q).map(|(x, y)| (x - y).powi(2)).sum::<f64>()
        });
        let a = PhaseSpaceState::at_rest(vec![0.4, -1.0]);
        let b = PhaseSpaceState::at_rest(vec![-0.3, 0.2]);
        let (fa, fb) = fd.gradient(&a, &b, Axis::Q);
        let (ea, eb) = CouplingTerm::spring().gradient(&a, &b, Axis::Q);
        for (x, y) in fa.iter().chain(&fb).zip(ea.iter().chain(&eb)) {
            assert!((x - y).abs() < 1e-6, "fd {x} vs analytic {y}");
        }
    }

    #[test]
    fn test_coupled_energy_drift_below_1e4() {
        let g = two_oscillators(0.1);
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let evo = integrator.run(&g, displaced_pair(), 1_000);
        assert!(evo.is_completed(), "fault: {:?}", evo.fault);
        let drift = evo.max_relative_drift();
        assert!(drift < 1e-4, "coupled drift {drift:e}");
        // energy actually flows between the subsystems
        let last = evo.final_state().unwrap();
        assert!(last.subsystems[1].q[0].abs() > 1e-3);
    }

    #[test]
    fn test_zero_coupling_matches_independent_runs() {
        let g = two_oscillators(0.1).with_lambda(vec![vec![0.0; 2]; 2]).unwrap();
        assert_eq!(g.active_pairs(), 0);
        let mut joint = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let evo = joint.run(&g, displaced_pair(), 300);
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut single = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let alone = single.run(&model, displaced_pair().subsystems[0].clone(), 300);
        let a = &evo.final_state().unwrap().subsystems[0];
        let b = alone.final_state().unwrap();
        assert!(a.max_abs_diff(b) < 1e-14);
    }

    #[test]
    fn test_with_lambda_validates_and_leaves_original() {
        let g = two_oscillators(0.1);
        assert!(g.with_lambda(vec![vec![0.0, 0.3], vec![0.1, 0.0]]).is_err());
        let stronger = g.with_lambda(vec![vec![0.0, 0.3], vec![0.3, 0.0]]).unwrap();
        assert_eq!(stronger.lambda()[0][1], 0.3);
        assert_eq!(g.lambda()[0][1], 0.1);
    }

    #[test]
    fn test_momentum_coupling_enters_drift() {
        let g = CouplingGraph::builder(vec![models::harmonic_oscillator(1.0, 0.0); 2])
            .couple(0, 1, 0.5, CouplingTerm::momentum_exchange())
            .build()
            .unwrap();
        let mut state = JointState::new(vec![
            PhaseSpaceState::new(vec![0.0], vec![1.0]).unwrap(),
            PhaseSpaceState::new(vec![0.0], vec![2.0]).unwrap(),
        ])
        .unwrap();
        g.drift(&mut state, 0.1).unwrap();
        // ∂H/∂p_0 = p_0 + 0.5·p_1 = 2
        assert!((state.subsystems[0].q[0] - 0.2).abs() < 1e-12);
        // ∂H/∂p_1 = p_1 + 0.5·p_0 = 2.5
        assert!((state.subsystems[1].q[0] - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_wrong_subsystem_count_rejected() {
        let g = two_oscillators(0.1);
        let one = JointState::new(vec![PhaseSpaceState::at_rest(vec![1.0])]).unwrap();
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        assert!(integrator.step(&g, &one).is_err());
    }

    #[test]
    fn test_coupled_checkpoint_resume_matches_uninterrupted() {
        let g = CouplingGraph::builder(vec![
            models::harmonic_oscillator(1.0, 1.0),
            models::pendulum(1.0, 1.0, 9.81),
            models::harmonic_oscillator(2.0, 0.5),
        ])
        .couple(0, 1, 0.2, CouplingTerm::spring())
        .couple(1, 2, 0.05, CouplingTerm::phase_alignment())
        .build()
        .unwrap();
        let start = JointState::new(vec![
            PhaseSpaceState::new(vec![1.0], vec![0.0]).unwrap(),
            PhaseSpaceState::new(vec![0.3], vec![0.1]).unwrap(),
            PhaseSpaceState::new(vec![-0.5], vec![0.2]).unwrap(),
        ])
        .unwrap();

        let mut straight = SymplecticIntegrator::leapfrog(0.005).unwrap();
        let expected = straight.run(&g, start.clone(), 200);

        let mut first = SymplecticIntegrator::leapfrog(0.005).unwrap();
        let half = first.run(&g, start, 100);
        let json = first
            .checkpoint(&g, half.final_state().unwrap())
            .to_json()
            .unwrap();
        let cp: Checkpoint<JointState> = Checkpoint::from_json(&json).unwrap();
        let rebuilt = match &cp.system {
            SystemDescriptor::Coupled(d) => CouplingGraph::from_descriptor(d).unwrap(),
            SystemDescriptor::Single(_) => panic!("expected coupled system"),
        };
        let mut second = SymplecticIntegrator::resume(&cp, None).unwrap();
        let rest = second.run(&rebuilt, cp.state.clone(), 100);

        let diff = rest
            .final_state()
            .unwrap()
            .max_abs_diff(expected.final_state().unwrap());
        assert!(diff < 1e-12, "resume diverged by {diff}");
    }

    #[test]
    fn test_exponential_decay_lambda_is_valid() {
        let lambda = exponential_decay_lambda(4, 0.45, 0.3);
        for i in 0..4 {
            assert_eq!(lambda[i][i], 0.0);
            for j in 0..4 {
                assert_eq!(lambda[i][j], lambda[j][i]);
            }
        }
        let models = vec![models::harmonic_oscillator(1.0, 1.0); 4];
        let terms = (0..4)
            .map(|i| {
                (0..4)
                    .map(|j| (j > i).then(CouplingTerm::spring))
                    .collect()
            })
            .collect();
        assert!(CouplingGraph::new(models, lambda, terms).is_ok());
    }
}
