// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — PyO3 FFI Bindings
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
// Note: #[deny(unsafe_code)] not applied — PyO3 proc macros generate
// unsafe blocks internally. All hand-written code in this crate is safe.
//! Python-callable wrappers around the Hamilton Kernel.
//!
//! Exposes `EngineConfig`, `HamiltonianIntegrator`, `QuboOptimizer` and
//! `DecisionLayer` to Python via PyO3.
//!
//! # FFI Safety
//!
//! - GIL acquired via `Python::with_gil` before every Python callback.
//! - Python exceptions inside energy/cost callbacks → NaN, which the
//!   engine reports as an evaluation or normalization fault.
//! - No borrowed references escape the GIL lock scope.
//! - All config validated before storage (`EngineConfig::validate()`).
//!
//! Install: `pip install -e crates/hamilton-ffi` (requires maturin).
//!
//! Usage from Python:
//! ```python
//! from hamilton_kernel import HamiltonianIntegrator
//!
//! hi = HamiltonianIntegrator("harmonic_oscillator", {"mass": 1.0, "omega": 1.0})
//! out = hi.run([1.0], [0.0], 1000)
//! ```

use std::collections::HashMap;

use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;
use pyo3::types::PyDict;

use hamilton_decision::{
    AmplitudeDecisionLayer, Constraint, MeasureMode, QuboOptimizer, QuboProblem, QuboResult,
    UpdateOutcome,
};
use hamilton_physics::{models, Evolution, HamiltonianModel, Parameters, RunStatus, SymplecticIntegrator};
use hamilton_types::{
    AdaptiveConfig, AnnealConfig, Checkpoint, DecisionConfig, EngineConfig, EngineError,
    IntegratorConfig, ModelDescriptor, PhaseSpaceState, Scheme, SystemDescriptor,
};

fn to_py_err(e: EngineError) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn parse_scheme(name: &str) -> PyResult<Scheme> {
    match name {
        "leapfrog" => Ok(Scheme::Leapfrog),
        "yoshida4" => Ok(Scheme::Yoshida4),
        other => Err(PyValueError::new_err(format!(
            "unknown scheme '{other}' (expected 'leapfrog' or 'yoshida4')"
        ))),
    }
}

fn status_name(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Stepping => "stepping",
        RunStatus::Completed => "completed",
        RunStatus::Failed => "failed",
        RunStatus::Cancelled => "cancelled",
    }
}

// ─── EngineConfig ───────────────────────────────────────────────────

/// Python-visible configuration for the Hamilton Kernel.
#[pyclass(name = "EngineConfig")]
#[derive(Clone)]
struct PyEngineConfig {
    inner: EngineConfig,
}

#[pymethods]
impl PyEngineConfig {
    #[new]
    #[pyo3(signature = (
        dt = 0.01,
        scheme = "leapfrog",
        adaptive = false,
        anneal_max_iterations = 20_000,
        anneal_decay = 0.995,
        anneal_restarts = 1,
        anneal_seed = 42,
        decision_seed = 7,
        meta_rel_tolerance = 0.01,
    ))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        dt: f64,
        scheme: &str,
        adaptive: bool,
        anneal_max_iterations: usize,
        anneal_decay: f64,
        anneal_restarts: usize,
        anneal_seed: u64,
        decision_seed: u64,
        meta_rel_tolerance: f64,
    ) -> PyResult<Self> {
        let mut config = EngineConfig::default();
        config.integrator.dt = dt;
        config.integrator.scheme = parse_scheme(scheme)?;
        config.integrator.adaptive = adaptive.then(AdaptiveConfig::default);
        config.anneal.max_iterations = anneal_max_iterations;
        config.anneal.decay = anneal_decay;
        config.anneal.restarts = anneal_restarts;
        config.anneal.seed = anneal_seed;
        config.decision.seed = decision_seed;
        config.meta.rel_tolerance = meta_rel_tolerance;
        config.validate().map_err(to_py_err)?;
        Ok(Self { inner: config })
    }

    /// Construct from JSON string.
    #[staticmethod]
    fn from_json(json: &str) -> PyResult<Self> {
        let config = EngineConfig::from_json(json).map_err(to_py_err)?;
        config.validate().map_err(to_py_err)?;
        Ok(Self { inner: config })
    }

    fn to_json(&self) -> PyResult<String> {
        self.inner.to_json().map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "EngineConfig(dt={}, scheme={:?}, adaptive={}, anneal_seed={})",
            self.inner.integrator.dt,
            self.inner.integrator.scheme,
            self.inner.integrator.adaptive.is_some(),
            self.inner.anneal.seed
        )
    }
}

// ─── HamiltonianIntegrator ──────────────────────────────────────────

/// Energy closure backed by a Python callable `f(q, p) -> float`.
fn python_energy(cb: PyObject) -> impl Fn(&[f64], &[f64], &Parameters) -> f64 + Send + Sync + 'static {
    move |q: &[f64], p: &[f64], _: &Parameters| {
        Python::with_gil(|py| match cb.call1(py, (q.to_vec(), p.to_vec())) {
            Ok(result) => result.extract::<f64>(py).unwrap_or(f64::NAN),
            Err(e) => {
                log::warn!("python energy callback raised: {e}");
                f64::NAN
            }
        })
    }
}

fn evolution_dict(evo: &Evolution<PhaseSpaceState>) -> PyResult<PyObject> {
    let last = evo.final_state();
    Python::with_gil(|py| {
        let dict = PyDict::new(py);
        dict.set_item("q", last.map(|s| s.q.clone()))?;
        dict.set_item("p", last.map(|s| s.p.clone()))?;
        dict.set_item("t", last.map(|s| s.t))?;
        dict.set_item("q_history", evo.trajectory.iter().map(|s| s.q.clone()).collect::<Vec<_>>())?;
        dict.set_item("p_history", evo.trajectory.iter().map(|s| s.p.clone()).collect::<Vec<_>>())?;
        dict.set_item("t_history", evo.trajectory.iter().map(|s| s.t).collect::<Vec<_>>())?;
        dict.set_item("energies", evo.energies.clone())?;
        dict.set_item("max_drift", evo.max_relative_drift())?;
        dict.set_item("status", status_name(evo.status))?;
        dict.set_item("steps_taken", evo.steps_taken)?;
        dict.set_item("fault", evo.fault.as_ref().map(|e| e.to_string()))?;
        Ok(dict.into())
    })
}

/// Symplectic integrator bound to one Hamiltonian.
#[pyclass(name = "HamiltonianIntegrator")]
struct PyHamiltonianIntegrator {
    model: HamiltonianModel,
    inner: SymplecticIntegrator,
}

fn integrator_config(
    dt: f64,
    scheme: &str,
    adaptive: bool,
    config: Option<PyEngineConfig>,
) -> PyResult<IntegratorConfig> {
    match config {
        Some(c) => Ok(c.inner.integrator),
        None => Ok(IntegratorConfig {
            dt,
            scheme: parse_scheme(scheme)?,
            adaptive: adaptive.then(AdaptiveConfig::default),
            ..Default::default()
        }),
    }
}

#[pymethods]
impl PyHamiltonianIntegrator {
    /// Library model by name, e.g. `("pendulum", {"mass": 1, "length": 1, "g": 9.81})`.
    #[new]
    #[pyo3(signature = (model, params = None, dt = 0.01, scheme = "leapfrog", adaptive = false, config = None))]
    fn new(
        model: &str,
        params: Option<HashMap<String, f64>>,
        dt: f64,
        scheme: &str,
        adaptive: bool,
        config: Option<PyEngineConfig>,
    ) -> PyResult<Self> {
        let mut desc = ModelDescriptor::new(model);
        desc.parameters.extend(params.unwrap_or_default());
        let model = models::build(&desc).map_err(to_py_err)?;
        let cfg = integrator_config(dt, scheme, adaptive, config)?;
        let inner = SymplecticIntegrator::new(cfg).map_err(to_py_err)?;
        Ok(Self { model, inner })
    }

    /// Model from Python callables `kinetic(q, p)` and `potential(q, p)`.
    /// Gradients are taken by central differences.
    #[staticmethod]
    #[pyo3(signature = (kinetic, potential, dt = 0.01, scheme = "leapfrog", adaptive = false, config = None))]
    fn from_callbacks(
        kinetic: PyObject,
        potential: PyObject,
        dt: f64,
        scheme: &str,
        adaptive: bool,
        config: Option<PyEngineConfig>,
    ) -> PyResult<Self> {
        let model = HamiltonianModel::new("python", python_energy(kinetic), python_energy(potential));
        let cfg = integrator_config(dt, scheme, adaptive, config)?;
        let inner = SymplecticIntegrator::new(cfg).map_err(to_py_err)?;
        Ok(Self { model, inner })
    }

    /// Rebuild from a checkpoint JSON produced by `checkpoint`. The stored
    /// integrator settings apply unless `config` is given.
    #[staticmethod]
    #[pyo3(signature = (json, config = None))]
    fn from_checkpoint(json: &str, config: Option<PyEngineConfig>) -> PyResult<(Self, PyObject)> {
        let cp: Checkpoint<PhaseSpaceState> = Checkpoint::from_json(json).map_err(to_py_err)?;
        let desc = match &cp.system {
            SystemDescriptor::Single(desc) => desc,
            SystemDescriptor::Coupled(_) => {
                return Err(PyValueError::new_err(
                    "coupled checkpoints are not supported by HamiltonianIntegrator",
                ))
            }
        };
        let model = models::build(desc).map_err(to_py_err)?;
        let overrides = config.map(|c| c.inner.integrator);
        let inner = SymplecticIntegrator::resume(&cp, overrides).map_err(to_py_err)?;
        let state = Python::with_gil(|py| -> PyResult<PyObject> {
            let dict = PyDict::new(py);
            dict.set_item("q", cp.state.q.clone())?;
            dict.set_item("p", cp.state.p.clone())?;
            dict.set_item("t", cp.state.t)?;
            Ok(dict.into())
        })?;
        Ok((Self { model, inner }, state))
    }

    /// Library model names.
    #[staticmethod]
    fn library() -> Vec<&'static str> {
        models::LIBRARY.to_vec()
    }

    #[getter]
    fn model_name(&self) -> String {
        self.model.name().to_string()
    }

    #[getter]
    fn dt(&self) -> f64 {
        self.inner.dt()
    }

    #[getter]
    fn step_count(&self) -> u64 {
        self.inner.step_count()
    }

    fn energy(&self, q: Vec<f64>, p: Vec<f64>) -> PyResult<f64> {
        self.model.energy(&q, &p).map_err(to_py_err)
    }

    /// Advance `n_steps`. Returns dict with q, p, t, histories, energies,
    /// max_drift, status, steps_taken, fault.
    #[pyo3(signature = (q, p, n_steps, t0 = 0.0))]
    fn run(&mut self, q: Vec<f64>, p: Vec<f64>, n_steps: u64, t0: f64) -> PyResult<PyObject> {
        let state = PhaseSpaceState::new(q, p).map_err(to_py_err)?.with_time(t0);
        let evo = self.inner.run(&self.model, state, n_steps);
        evolution_dict(&evo)
    }

    /// Advance until `t_end`, shortening the last step to land on it.
    #[pyo3(signature = (q, p, t_end, t0 = 0.0))]
    fn run_until(&mut self, q: Vec<f64>, p: Vec<f64>, t_end: f64, t0: f64) -> PyResult<PyObject> {
        let state = PhaseSpaceState::new(q, p).map_err(to_py_err)?.with_time(t0);
        let evo = self.inner.run_until(&self.model, state, t_end);
        evolution_dict(&evo)
    }

    /// Checkpoint JSON for the given state and this integrator's position.
    #[pyo3(signature = (q, p, t = 0.0))]
    fn checkpoint(&self, q: Vec<f64>, p: Vec<f64>, t: f64) -> PyResult<String> {
        let state = PhaseSpaceState::new(q, p).map_err(to_py_err)?.with_time(t);
        self.inner
            .checkpoint(&self.model, &state)
            .to_json()
            .map_err(to_py_err)
    }

    fn __repr__(&self) -> String {
        format!(
            "HamiltonianIntegrator(model={}, dt={}, steps={})",
            self.model.name(),
            self.inner.dt(),
            self.inner.step_count()
        )
    }
}

// ─── QuboOptimizer ──────────────────────────────────────────────────

fn build_problem(
    opt: &QuboOptimizer,
    labels: Vec<String>,
    linear: Vec<f64>,
    quadratic: Option<Vec<(usize, usize, f64)>>,
    exactly_k: Option<usize>,
    budget: Option<(Vec<f64>, f64)>,
) -> PyResult<QuboProblem> {
    let n = labels.len();
    if linear.len() != n {
        return Err(PyValueError::new_err(format!(
            "{} linear coefficients for {n} labels",
            linear.len()
        )));
    }
    let mut b = opt.builder(labels);
    for (i, v) in linear.into_iter().enumerate() {
        b = b.linear(i, v);
    }
    for (i, j, v) in quadratic.unwrap_or_default() {
        b = b.quadratic(i, j, v);
    }
    if let Some(k) = exactly_k {
        b = b.constraint(Constraint::exactly_k((0..n).collect(), k));
    }
    if let Some((weights, cap)) = budget {
        b = b.constraint(Constraint::at_most((0..n).collect(), weights, cap));
    }
    b.build().map_err(to_py_err)
}

fn qubo_dict(r: &QuboResult) -> PyResult<PyObject> {
    Python::with_gil(|py| {
        let dict = PyDict::new(py);
        dict.set_item("solution", r.solution.clone())?;
        dict.set_item("selected", r.selected.clone())?;
        dict.set_item("objective_value", r.objective_value)?;
        dict.set_item("qubo_energy", r.qubo_energy)?;
        dict.set_item("constraints_satisfied", r.constraints_satisfied)?;
        dict.set_item("iterations_used", r.iterations_used)?;
        dict.set_item("seed", r.seed)?;
        Ok(dict.into())
    })
}

/// Simulated-annealing solver for constrained binary selection.
#[pyclass(name = "QuboOptimizer")]
struct PyQuboOptimizer {
    inner: QuboOptimizer,
}

#[pymethods]
impl PyQuboOptimizer {
    #[new]
    #[pyo3(signature = (
        max_iterations = 20_000,
        decay = 0.995,
        stall_limit = 4_000,
        restarts = 1,
        seed = 42,
        penalty_multiplier = 10.0,
        config = None,
    ))]
    fn new(
        max_iterations: usize,
        decay: f64,
        stall_limit: usize,
        restarts: usize,
        seed: u64,
        penalty_multiplier: f64,
        config: Option<PyEngineConfig>,
    ) -> PyResult<Self> {
        let cfg = match config {
            Some(c) => c.inner.anneal,
            None => AnnealConfig {
                max_iterations,
                decay,
                stall_limit,
                restarts,
                seed,
                penalty_multiplier,
                ..Default::default()
            },
        };
        Ok(Self {
            inner: QuboOptimizer::new(cfg).map_err(to_py_err)?,
        })
    }

    /// Minimise Σ linear_i x_i + Σ q_ij x_i x_j subject to optional
    /// "exactly k selected" and "Σ w x ≤ cap" constraints.
    #[pyo3(signature = (labels, linear, quadratic = None, exactly_k = None, budget = None))]
    fn solve(
        &self,
        labels: Vec<String>,
        linear: Vec<f64>,
        quadratic: Option<Vec<(usize, usize, f64)>>,
        exactly_k: Option<usize>,
        budget: Option<(Vec<f64>, f64)>,
    ) -> PyResult<PyObject> {
        let problem = build_problem(&self.inner, labels, linear, quadratic, exactly_k, budget)?;
        qubo_dict(&self.inner.solve(&problem))
    }

    /// Deterministic steepest-descent baseline on the same problem.
    #[pyo3(signature = (labels, linear, quadratic = None, exactly_k = None, budget = None))]
    fn greedy(
        &self,
        labels: Vec<String>,
        linear: Vec<f64>,
        quadratic: Option<Vec<(usize, usize, f64)>>,
        exactly_k: Option<usize>,
        budget: Option<(Vec<f64>, f64)>,
    ) -> PyResult<PyObject> {
        let problem = build_problem(&self.inner, labels, linear, quadratic, exactly_k, budget)?;
        qubo_dict(&QuboOptimizer::greedy(&problem))
    }
}

// ─── DecisionLayer ──────────────────────────────────────────────────

fn python_cost(cb: &PyObject, p: &[f64]) -> f64 {
    Python::with_gil(|py| match cb.call1(py, (p.to_vec(),)) {
        Ok(result) => result.extract::<f64>(py).unwrap_or(f64::NAN),
        Err(e) => {
            log::warn!("python cost callback raised: {e}");
            f64::NAN
        }
    })
}

/// Variational amplitude layer over named actions.
#[pyclass(name = "DecisionLayer")]
struct PyDecisionLayer {
    inner: AmplitudeDecisionLayer,
}

#[pymethods]
impl PyDecisionLayer {
    #[new]
    #[pyo3(signature = (labels, seed = 7, fd_step = 1e-6, history_window = 256, config = None))]
    fn new(
        labels: Vec<String>,
        seed: u64,
        fd_step: f64,
        history_window: usize,
        config: Option<PyEngineConfig>,
    ) -> PyResult<Self> {
        let cfg = match config {
            Some(c) => c.inner.decision,
            None => DecisionConfig {
                fd_step,
                seed,
                history_window,
            },
        };
        Ok(Self {
            inner: AmplitudeDecisionLayer::new(labels, cfg).map_err(to_py_err)?,
        })
    }

    #[getter]
    fn labels(&self) -> Vec<String> {
        self.inner.labels().to_vec()
    }

    fn probabilities(&self) -> Vec<f64> {
        self.inner.probabilities()
    }

    fn expected_action(&self) -> String {
        self.inner.expected_action().to_string()
    }

    fn purity(&self) -> f64 {
        self.inner.purity()
    }

    fn entropy(&self) -> f64 {
        self.inner.entropy()
    }

    /// One descent step on Σ p_i E_i + cost(p). Returns dict with reset,
    /// objective, gradient_norm, fault.
    #[pyo3(signature = (energies, step = 0.1, cost = None))]
    fn update(&mut self, energies: Vec<f64>, step: f64, cost: Option<PyObject>) -> PyResult<PyObject> {
        let outcome = match cost {
            Some(cb) => self
                .inner
                .update_with_energies(&energies, |p: &[f64]| python_cost(&cb, p), step),
            None => self.inner.update_with_energies(&energies, |_: &[f64]| 0.0, step),
        }
        .map_err(to_py_err)?;
        Python::with_gil(|py| {
            let dict = PyDict::new(py);
            match outcome {
                UpdateOutcome::Updated {
                    objective,
                    gradient_norm,
                } => {
                    dict.set_item("reset", false)?;
                    dict.set_item("objective", objective)?;
                    dict.set_item("gradient_norm", gradient_norm)?;
                    dict.set_item("fault", None::<String>)?;
                }
                UpdateOutcome::Reset { fault } => {
                    dict.set_item("reset", true)?;
                    dict.set_item("objective", None::<f64>)?;
                    dict.set_item("gradient_norm", None::<f64>)?;
                    dict.set_item("fault", fault.to_string())?;
                }
            }
            Ok(dict.into())
        })
    }

    /// Sample an action. `hard=True` collapses the amplitudes onto it.
    #[pyo3(signature = (hard = false))]
    fn measure(&mut self, hard: bool) -> PyResult<PyObject> {
        let mode = if hard { MeasureMode::Hard } else { MeasureMode::Soft };
        let m = self.inner.measure(mode);
        Python::with_gil(|py| {
            let dict = PyDict::new(py);
            dict.set_item("index", m.index)?;
            dict.set_item("label", m.label)?;
            dict.set_item("probability", m.probability)?;
            Ok(dict.into())
        })
    }

    fn rotate(&mut self, i: usize, j: usize, theta: f64) -> PyResult<()> {
        self.inner.rotate(i, j, theta).map_err(to_py_err)
    }

    fn reset(&mut self) {
        self.inner.reset_uniform();
    }

    fn __repr__(&self) -> String {
        format!(
            "DecisionLayer(actions={}, expected={:?}, purity={:.4})",
            self.inner.labels().len(),
            self.inner.expected_action(),
            self.inner.purity()
        )
    }
}

/// Hamilton Kernel — Rust-accelerated symplectic dynamics and decisions.
///
/// Exposes:
/// - `EngineConfig`: configuration
/// - `HamiltonianIntegrator`: library or callback models, run/checkpoint
/// - `QuboOptimizer`: constrained binary selection
/// - `DecisionLayer`: variational amplitude decisions
#[pymodule]
fn hamilton_kernel(m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<PyEngineConfig>()?;
    m.add_class::<PyHamiltonianIntegrator>()?;
    m.add_class::<PyQuboOptimizer>()?;
    m.add_class::<PyDecisionLayer>()?;
    Ok(())
}
