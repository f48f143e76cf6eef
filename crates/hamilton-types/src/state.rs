// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Phase-Space State
// ─────────────────────────────────────────────────────────────────────
//! Canonical state records, the append-only evolution trajectory and
//! the checkpoint record used to resume a run.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::IntegratorConfig;
use crate::error::{EngineError, EngineResult};

/// Anything the integrator can advance: carries a clock and can be
/// checked for NaN/Inf before a step.
pub trait Clocked {
    fn time(&self) -> f64;
    fn set_time(&mut self, t: f64);
    fn is_finite(&self) -> bool;
}

/// Canonical coordinate/momentum pair plus simulation time.
///
/// Invariant: `q.len() == p.len()`. Enforced by [`PhaseSpaceState::new`]
/// and re-checked by [`PhaseSpaceState::validate`] before every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpaceState {
    /// Generalised coordinates.
    pub q: Vec<f64>,
    /// Conjugate momenta.
    pub p: Vec<f64>,
    /// Simulation time.
    pub t: f64,
    /// Optional domain label (e.g. "market", "oscillator-3").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl PhaseSpaceState {
    pub fn new(q: Vec<f64>, p: Vec<f64>) -> EngineResult<Self> {
        let state = Self {
            q,
            p,
            t: 0.0,
            tag: None,
        };
        state.validate()?;
        Ok(state)
    }

    /// State at rest: q given, p = 0.
    pub fn at_rest(q: Vec<f64>) -> Self {
        let p = vec![0.0; q.len()];
        Self {
            q,
            p,
            t: 0.0,
            tag: None,
        }
    }

    pub fn with_time(mut self, t: f64) -> Self {
        self.t = t;
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Degrees of freedom.
    pub fn ndof(&self) -> usize {
        self.q.len()
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.q.len() != self.p.len() {
            return Err(EngineError::Validation(format!(
                "q/p length mismatch: {} != {}",
                self.q.len(),
                self.p.len()
            )));
        }
        Ok(())
    }

    /// Largest absolute coordinate/momentum difference against `other`.
    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        self.q
            .iter()
            .zip(&other.q)
            .chain(self.p.iter().zip(&other.p))
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f64::max)
    }
}

impl Clocked for PhaseSpaceState {
    fn time(&self) -> f64 {
        self.t
    }

    fn set_time(&mut self, t: f64) {
        self.t = t;
    }

    fn is_finite(&self) -> bool {
        self.t.is_finite()
            && self.q.iter().all(|v| v.is_finite())
            && self.p.iter().all(|v| v.is_finite())
    }
}

/// Joint state of N coupled subsystems advanced with one shared clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointState {
    pub subsystems: Vec<PhaseSpaceState>,
    pub t: f64,
}

impl JointState {
    pub fn new(subsystems: Vec<PhaseSpaceState>) -> EngineResult<Self> {
        for (i, s) in subsystems.iter().enumerate() {
            s.validate()
                .map_err(|e| EngineError::Validation(format!("subsystem {i}: {e}")))?;
        }
        let t = subsystems.first().map_or(0.0, |s| s.t);
        let mut joint = Self { subsystems, t };
        joint.set_time(t);
        Ok(joint)
    }

    pub fn len(&self) -> usize {
        self.subsystems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsystems.is_empty()
    }

    pub fn max_abs_diff(&self, other: &Self) -> f64 {
        self.subsystems
            .iter()
            .zip(&other.subsystems)
            .map(|(a, b)| a.max_abs_diff(b))
            .fold(0.0, f64::max)
    }
}

impl Clocked for JointState {
    fn time(&self) -> f64 {
        self.t
    }

    fn set_time(&mut self, t: f64) {
        self.t = t;
        for s in &mut self.subsystems {
            s.t = t;
        }
    }

    fn is_finite(&self) -> bool {
        self.t.is_finite() && self.subsystems.iter().all(Clocked::is_finite)
    }
}

/// Append-only sequence of recorded snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvolutionTrajectory<S> {
    snapshots: Vec<S>,
}

impl<S> Default for EvolutionTrajectory<S> {
    fn default() -> Self {
        Self {
            snapshots: Vec::new(),
        }
    }
}

impl<S> EvolutionTrajectory<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            snapshots: Vec::with_capacity(n),
        }
    }

    pub fn push(&mut self, snapshot: S) {
        self.snapshots.push(snapshot);
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn first(&self) -> Option<&S> {
        self.snapshots.first()
    }

    pub fn last(&self) -> Option<&S> {
        self.snapshots.last()
    }

    pub fn get(&self, i: usize) -> Option<&S> {
        self.snapshots.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, S> {
        self.snapshots.iter()
    }

    pub fn as_slice(&self) -> &[S] {
        &self.snapshots
    }

    pub fn into_inner(self) -> Vec<S> {
        self.snapshots
    }
}

/// Name and parameter set sufficient to rebuild a library model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub name: String,
    pub parameters: BTreeMap<String, f64>,
}

impl ModelDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: f64) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    /// Parameter lookup that fails with a message naming the model.
    pub fn param(&self, key: &str) -> EngineResult<f64> {
        self.parameters.get(key).copied().ok_or_else(|| {
            EngineError::Validation(format!(
                "model '{}' descriptor missing parameter '{key}'",
                self.name
            ))
        })
    }
}

/// Named pairwise coupling term between subsystems `i < j`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairTermDescriptor {
    pub i: usize,
    pub j: usize,
    pub name: String,
}

/// Everything needed to rebuild a coupling graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CouplingDescriptor {
    pub models: Vec<ModelDescriptor>,
    pub lambda: Vec<Vec<f64>>,
    pub terms: Vec<PairTermDescriptor>,
}

/// The system a checkpoint was integrated under.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SystemDescriptor {
    Single(ModelDescriptor),
    Coupled(CouplingDescriptor),
}

/// Serialisable snapshot of a run: state plus the integrator and model
/// parameters in force when it was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub state: S,
    pub step_count: u64,
    /// dt to use for the next step (adaptive runs store the grown/shrunk value).
    pub dt: f64,
    /// Scheme, step control and recording cadence of the run.
    #[serde(default)]
    pub integrator: IntegratorConfig,
    pub system: SystemDescriptor,
}

impl<S: Serialize + DeserializeOwned + Clocked> Checkpoint<S> {
    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string(self).map_err(EngineError::from)
    }

    pub fn from_json(json: &str) -> EngineResult<Self> {
        let checkpoint: Self = serde_json::from_str(json)?;
        if !(checkpoint.dt.is_finite() && checkpoint.dt > 0.0) {
            return Err(EngineError::Serialization(format!(
                "checkpoint dt must be finite and > 0, got {}",
                checkpoint.dt
            )));
        }
        checkpoint.integrator.validate()?;
        if !checkpoint.state.is_finite() {
            return Err(EngineError::Serialization(
                "checkpoint state contains NaN or Inf".to_string(),
            ));
        }
        Ok(checkpoint)
    }
}
