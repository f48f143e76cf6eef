// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Hamiltonian Model
// ─────────────────────────────────────────────────────────────────────
//! Composable energy function H(q, p) = T(q, p) + V(q, p).
//!
//! Kinetic and potential terms are pluggable closures over the state and
//! a named parameter map. Gradients are analytic when supplied, otherwise
//! symmetric finite differences:
//!
//!   ∂H/∂x_i ≈ (H(x + h·e_i) − H(x − h·e_i)) / 2h

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use hamilton_types::{
    EngineError, EngineResult, ModelDescriptor, PhaseSpaceState, SystemDescriptor,
};

use crate::integrator::SymplecticFlow;

/// Named scalar parameters shared by a model's closures.
pub type Parameters = BTreeMap<String, f64>;

/// Scalar term T(q, p) or V(q, p).
pub type EnergyFn = Arc<dyn Fn(&[f64], &[f64], &Parameters) -> f64 + Send + Sync>;

/// Closed-form gradient of H with respect to q or p.
pub type GradientFn = Arc<dyn Fn(&[f64], &[f64], &Parameters) -> Vec<f64> + Send + Sync>;

/// Default finite-difference step.
pub const DEFAULT_FD_STEP: f64 = 1e-6;

/// Gradient computation method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GradientMethod {
    /// Symmetric central difference, two energy evaluations per component.
    FiniteDifference,
    /// Caller-supplied closed form.
    Analytic,
}

#[derive(Clone, Copy)]
enum Axis {
    Q,
    P,
}

/// Parameter lookup for model closures. Missing keys yield NaN, which the
/// model then reports as an `EvaluationFault` instead of panicking.
#[inline]
pub fn param(params: &Parameters, key: &str) -> f64 {
    params.get(key).copied().unwrap_or(f64::NAN)
}

/// Energy function with pluggable kinetic/potential terms.
#[derive(Clone)]
pub struct HamiltonianModel {
    name: String,
    kinetic: EnergyFn,
    potential: EnergyFn,
    grad_q: Option<GradientFn>,
    grad_p: Option<GradientFn>,
    params: Parameters,
    fd_step: f64,
    dim: Option<usize>,
}

impl fmt::Debug for HamiltonianModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HamiltonianModel")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("analytic_grad_q", &self.grad_q.is_some())
            .field("analytic_grad_p", &self.grad_p.is_some())
            .field("fd_step", &self.fd_step)
            .field("dim", &self.dim)
            .finish()
    }
}

impl HamiltonianModel {
    pub fn new<K, V>(name: impl Into<String>, kinetic: K, potential: V) -> Self
    where
        K: Fn(&[f64], &[f64], &Parameters) -> f64 + Send + Sync + 'static,
        V: Fn(&[f64], &[f64], &Parameters) -> f64 + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            kinetic: Arc::new(kinetic),
            potential: Arc::new(potential),
            grad_q: None,
            grad_p: None,
            params: Parameters::new(),
            fd_step: DEFAULT_FD_STEP,
            dim: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: f64) -> Self {
        self.params.insert(key.into(), value);
        self
    }

    /// Closed-form ∂H/∂q.
    pub fn with_grad_q<G>(mut self, g: G) -> Self
    where
        G: Fn(&[f64], &[f64], &Parameters) -> Vec<f64> + Send + Sync + 'static,
    {
        self.grad_q = Some(Arc::new(g));
        self
    }

    /// Closed-form ∂H/∂p.
    pub fn with_grad_p<G>(mut self, g: G) -> Self
    where
        G: Fn(&[f64], &[f64], &Parameters) -> Vec<f64> + Send + Sync + 'static,
    {
        self.grad_p = Some(Arc::new(g));
        self
    }

    pub fn with_fd_step(mut self, h: f64) -> EngineResult<Self> {
        if !(h.is_finite() && h > 0.0) {
            return Err(EngineError::Validation(format!(
                "finite-difference step must be finite and > 0, got {h}"
            )));
        }
        self.fd_step = h;
        Ok(self)
    }

    /// Fix the number of degrees of freedom. States of any other size are
    /// rejected before evaluation.
    pub fn with_dimension(mut self, n: usize) -> Self {
        self.dim = Some(n);
        self
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dim
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &Parameters {
        &self.params
    }

    pub fn param(&self, key: &str) -> Option<f64> {
        self.params.get(key).copied()
    }

    pub fn fd_step(&self) -> f64 {
        self.fd_step
    }

    pub fn has_analytic_gradients(&self) -> bool {
        self.grad_q.is_some() && self.grad_p.is_some()
    }

    pub fn descriptor(&self) -> ModelDescriptor {
        ModelDescriptor {
            name: self.name.clone(),
            parameters: self.params.clone(),
        }
    }

    pub fn kinetic(&self, q: &[f64], p: &[f64]) -> f64 {
        (self.kinetic)(q, p, &self.params)
    }

    pub fn potential(&self, q: &[f64], p: &[f64]) -> f64 {
        (self.potential)(q, p, &self.params)
    }

    #[inline]
    fn raw_energy(&self, q: &[f64], p: &[f64]) -> f64 {
        self.kinetic(q, p) + self.potential(q, p)
    }

    fn check_shape(&self, q: &[f64], p: &[f64]) -> EngineResult<()> {
        if q.len() != p.len() {
            return Err(EngineError::Validation(format!(
                "q/p length mismatch: {} != {}",
                q.len(),
                p.len()
            )));
        }
        if let Some(n) = self.dim.filter(|&n| n != q.len()) {
            return Err(EngineError::Validation(format!(
                "{} has {n} degrees of freedom, state has {}",
                self.name,
                q.len()
            )));
        }
        Ok(())
    }

    /// Total energy H(q, p). Non-finite results raise `EvaluationFault`.
    pub fn energy(&self, q: &[f64], p: &[f64]) -> EngineResult<f64> {
        self.check_shape(q, p)?;
        let e = self.raw_energy(q, p);
        if !e.is_finite() {
            return Err(EngineError::evaluation(
                format!("{}: energy is {e}", self.name),
                q,
                p,
            ));
        }
        Ok(e)
    }

    pub fn energy_of(&self, state: &PhaseSpaceState) -> EngineResult<f64> {
        self.energy(&state.q, &state.p)
    }

    /// ∂H/∂q, analytic when available.
    pub fn grad_q(&self, q: &[f64], p: &[f64]) -> EngineResult<Vec<f64>> {
        let method = if self.grad_q.is_some() {
            GradientMethod::Analytic
        } else {
            GradientMethod::FiniteDifference
        };
        self.grad_q_with(q, p, method)
    }

    /// ∂H/∂p, analytic when available.
    pub fn grad_p(&self, q: &[f64], p: &[f64]) -> EngineResult<Vec<f64>> {
        let method = if self.grad_p.is_some() {
            GradientMethod::Analytic
        } else {
            GradientMethod::FiniteDifference
        };
        self.grad_p_with(q, p, method)
    }

    pub fn grad_q_with(
        &self,
        q: &[f64],
        p: &[f64],
        method: GradientMethod,
    ) -> EngineResult<Vec<f64>> {
        self.gradient(q, p, Axis::Q, method)
    }

    pub fn grad_p_with(
        &self,
        q: &[f64],
        p: &[f64],
        method: GradientMethod,
    ) -> EngineResult<Vec<f64>> {
        self.gradient(q, p, Axis::P, method)
    }

    fn gradient(
        &self,
        q: &[f64],
        p: &[f64],
        axis: Axis,
        method: GradientMethod,
    ) -> EngineResult<Vec<f64>> {
        self.check_shape(q, p)?;
        let grad = match method {
            GradientMethod::Analytic => {
                let g = match axis {
                    Axis::Q => self.grad_q.as_ref(),
                    Axis::P => self.grad_p.as_ref(),
                };
                let g = g.ok_or_else(|| {
                    EngineError::Validation(format!(
                        "{}: analytic gradient requested but not supplied",
                        self.name
                    ))
                })?;
                g(q, p, &self.params)
            }
            GradientMethod::FiniteDifference => self.fd_gradient(q, p, axis),
        };
        if grad.len() != q.len() {
            return Err(EngineError::Validation(format!(
                "{}: gradient has {} components, expected {}",
                self.name,
                grad.len(),
                q.len()
            )));
        }
        if let Some(bad) = grad.iter().find(|g| !g.is_finite()) {
            return Err(EngineError::evaluation(
                format!("{}: gradient component is {bad}", self.name),
                q,
                p,
            ));
        }
        Ok(grad)
    }

    fn fd_gradient(&self, q: &[f64], p: &[f64], axis: Axis) -> Vec<f64> {
        let h = self.fd_step;
        let mut qw = q.to_vec();
        let mut pw = p.to_vec();
        let mut grad = Vec::with_capacity(q.len());
        for i in 0..q.len() {
            let (plus, minus) = match axis {
                Axis::Q => {
                    qw[i] = q[i] + h;
                    let plus = self.raw_energy(&qw, p);
                    qw[i] = q[i] - h;
                    let minus = self.raw_energy(&qw, p);
                    qw[i] = q[i];
                    (plus, minus)
                }
                Axis::P => {
                    pw[i] = p[i] + h;
                    let plus = self.raw_energy(q, &pw);
                    pw[i] = p[i] - h;
                    let minus = self.raw_energy(q, &pw);
                    pw[i] = p[i];
                    (plus, minus)
                }
            };
            grad.push((plus - minus) / (2.0 * h));
        }
        grad
    }
}

impl SymplecticFlow for HamiltonianModel {
    type State = PhaseSpaceState;

    fn energy(&self, state: &PhaseSpaceState) -> EngineResult<f64> {
        self.energy_of(state)
    }

    fn kick(&self, state: &mut PhaseSpaceState, h: f64) -> EngineResult<()> {
        let g = self.grad_q(&state.q, &state.p)?;
        for (p, g) in state.p.iter_mut().zip(&g) {
            *p -= h * g;
        }
        Ok(())
    }

    fn drift(&self, state: &mut PhaseSpaceState, h: f64) -> EngineResult<()> {
        let g = self.grad_p(&state.q, &state.p)?;
        for (q, g) in state.q.iter_mut().zip(&g) {
            *q += h * g;
        }
        Ok(())
    }

    fn check(&self, state: &PhaseSpaceState) -> EngineResult<()> {
        state.validate()?;
        self.check_shape(&state.q, &state.p)
    }

    fn system(&self) -> SystemDescriptor {
        SystemDescriptor::Single(self.descriptor())
    }
}
