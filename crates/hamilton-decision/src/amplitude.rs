// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Amplitude Decision Layer
// ─────────────────────────────────────────────────────────────────────
//! Complex amplitudes a_i over a discrete action set. p_i = |a_i|².
//!
//! A variational update descends
//!
//!   J(a) = Σ_i |a_i|² E_i + C(p)
//!
//! with ∂J/∂ā_i = 2 a_i (E_i + ∂C/∂p_i), then renormalises. The cost
//! gradient is taken by central differences. Every public mutation leaves
//! Σ p_i = 1; a state that cannot be normalised is reset to uniform.

use std::collections::VecDeque;

use num_complex::Complex64;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use hamilton_physics::HamiltonianModel;
use hamilton_types::{DecisionConfig, EngineError, EngineResult, PhaseSpaceState};

/// Below this Σ|a|² the state is treated as zero.
const MIN_NORM_SQ: f64 = 1e-300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeasureMode {
    /// Collapse onto the sampled action.
    Hard,
    /// Sample without touching the amplitudes.
    Soft,
}

/// Result of one `variational_update`.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    Updated { objective: f64, gradient_norm: f64 },
    /// Non-finite or zero state; amplitudes are back to uniform.
    Reset { fault: EngineError },
}

impl UpdateOutcome {
    pub fn is_reset(&self) -> bool {
        matches!(self, Self::Reset { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub index: usize,
    pub label: String,
    pub probability: f64,
}

/// Entry in the bounded update history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRecord {
    pub objective: f64,
    pub probabilities: Vec<f64>,
    pub reset: bool,
}

#[derive(Debug, Clone)]
pub struct AmplitudeDecisionLayer {
    labels: Vec<String>,
    amplitudes: Vec<Complex64>,
    rng: StdRng,
    cfg: DecisionConfig,
    history: VecDeque<UpdateRecord>,
}

impl AmplitudeDecisionLayer {
    /// Uniform superposition over `labels`.
    pub fn new<S: Into<String>>(
        labels: impl IntoIterator<Item = S>,
        cfg: DecisionConfig,
    ) -> EngineResult<Self> {
        cfg.validate()?;
        let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if labels.is_empty() {
            return Err(EngineError::Validation(
                "decision layer needs at least one action".to_string(),
            ));
        }
        for (i, l) in labels.iter().enumerate() {
            if labels[..i].contains(l) {
                return Err(EngineError::Validation(format!("duplicate action '{l}'")));
            }
        }
        let n = labels.len();
        Ok(Self {
            labels,
            amplitudes: uniform(n),
            rng: StdRng::seed_from_u64(cfg.seed),
            cfg,
            history: VecDeque::new(),
        })
    }

    /// Replace the amplitudes. Input is normalised; zero or non-finite
    /// input is rejected.
    pub fn set_amplitudes(&mut self, amplitudes: Vec<Complex64>) -> EngineResult<()> {
        if amplitudes.len() != self.labels.len() {
            return Err(EngineError::Validation(format!(
                "{} amplitudes for {} actions",
                amplitudes.len(),
                self.labels.len()
            )));
        }
        let norm_sq = norm_sq(&amplitudes);
        if !norm_sq.is_finite() || norm_sq < MIN_NORM_SQ {
            return Err(EngineError::NormalizationFault(format!(
                "cannot normalise amplitudes with Σ|a|² = {norm_sq}"
            )));
        }
        let scale = norm_sq.sqrt().recip();
        self.amplitudes = amplitudes.into_iter().map(|a| a * scale).collect();
        Ok(())
    }

    /// Put all amplitude on `label`.
    pub fn set_basis(&mut self, label: &str) -> EngineResult<()> {
        let index = self
            .labels
            .iter()
            .position(|l| l == label)
            .ok_or_else(|| EngineError::Validation(format!("unknown action '{label}'")))?;
        self.amplitudes = vec![Complex64::new(0.0, 0.0); self.labels.len()];
        self.amplitudes[index] = Complex64::new(1.0, 0.0);
        Ok(())
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn amplitudes(&self) -> &[Complex64] {
        &self.amplitudes
    }

    pub fn probabilities(&self) -> Vec<f64> {
        self.amplitudes.iter().map(|a| a.norm_sqr()).collect()
    }

    pub fn norm_sq(&self) -> f64 {
        norm_sq(&self.amplitudes)
    }

    /// Σ p_i²: 1 for a single action, 1/N for uniform.
    pub fn purity(&self) -> f64 {
        self.amplitudes.iter().map(|a| a.norm_sqr().powi(2)).sum()
    }

    /// Shannon entropy of p in nats.
    pub fn entropy(&self) -> f64 {
        self.amplitudes
            .iter()
            .map(|a| a.norm_sqr())
            .filter(|&p| p > 0.0)
            .map(|p| -p * p.ln())
            .sum()
    }

    /// Most probable action; ties go to the lowest index.
    pub fn expected_action(&self) -> &str {
        let mut best = 0;
        for (i, a) in self.amplitudes.iter().enumerate() {
            if a.norm_sqr() > self.amplitudes[best].norm_sqr() {
                best = i;
            }
        }
        &self.labels[best]
    }

    pub fn history(&self) -> impl Iterator<Item = &UpdateRecord> {
        self.history.iter()
    }

    pub fn reset_uniform(&mut self) {
        self.amplitudes = uniform(self.labels.len());
    }

    /// One descent step using `energy_fn(label)` as E_i and `cost_fn(p)`.
    pub fn variational_update<E, C>(
        &mut self,
        energy_fn: E,
        cost_fn: C,
        step: f64,
    ) -> EngineResult<UpdateOutcome>
    where
        E: Fn(&str) -> f64,
        C: Fn(&[f64]) -> f64,
    {
        let energies: Vec<f64> = self.labels.iter().map(|l| energy_fn(l)).collect();
        self.descend(&energies, cost_fn, step)
    }

    /// One descent step with E_i given directly, one per action.
    pub fn update_with_energies<C>(
        &mut self,
        energies: &[f64],
        cost_fn: C,
        step: f64,
    ) -> EngineResult<UpdateOutcome>
    where
        C: Fn(&[f64]) -> f64,
    {
        if energies.len() != self.labels.len() {
            return Err(EngineError::Validation(format!(
                "{} energies for {} actions",
                energies.len(),
                self.labels.len()
            )));
        }
        self.descend(energies, cost_fn, step)
    }

    fn descend<C>(&mut self, energies: &[f64], cost_fn: C, step: f64) -> EngineResult<UpdateOutcome>
    where
        C: Fn(&[f64]) -> f64,
    {
        if !(step.is_finite() && step >= 0.0) {
            return Err(EngineError::Validation(format!(
                "update step must be finite and >= 0, got {step}"
            )));
        }
        let probs = self.probabilities();
        let cost_grad = self.cost_gradient(&probs, &cost_fn);

        let mut grad_norm_sq = 0.0;
        for ((a, &e), &c) in self.amplitudes.iter_mut().zip(energies).zip(&cost_grad) {
            let g = *a * (2.0 * (e + c));
            grad_norm_sq += g.norm_sqr();
            *a -= g * step;
        }

        let norm_sq = norm_sq(&self.amplitudes);
        if !norm_sq.is_finite() || norm_sq < MIN_NORM_SQ || !grad_norm_sq.is_finite() {
            return Ok(self.fault(format!("Σ|a|² = {norm_sq} after update")));
        }
        let scale = norm_sq.sqrt().recip();
        for a in &mut self.amplitudes {
            *a *= scale;
        }

        let probs = self.probabilities();
        let objective = probs.iter().zip(energies).map(|(p, e)| p * e).sum::<f64>() + cost_fn(&probs);
        self.record(UpdateRecord {
            objective,
            probabilities: probs,
            reset: false,
        });
        Ok(UpdateOutcome::Updated {
            objective,
            gradient_norm: grad_norm_sq.sqrt(),
        })
    }

    /// Update with E_i = H(states_i) from a model.
    pub fn update_from_model<C>(
        &mut self,
        model: &HamiltonianModel,
        states: &[PhaseSpaceState],
        cost_fn: C,
        step: f64,
    ) -> EngineResult<UpdateOutcome>
    where
        C: Fn(&[f64]) -> f64,
    {
        let energies = states
            .iter()
            .map(|s| model.energy_of(s))
            .collect::<EngineResult<Vec<_>>>()?;
        self.update_with_energies(&energies, cost_fn, step)
    }

    /// Real rotation by `theta` in the (i, j) plane. Norm-preserving.
    pub fn rotate(&mut self, i: usize, j: usize, theta: f64) -> EngineResult<()> {
        let n = self.labels.len();
        if i >= n || j >= n || i == j {
            return Err(EngineError::Validation(format!(
                "rotation plane ({i}, {j}) invalid for {n} actions"
            )));
        }
        let (s, c) = theta.sin_cos();
        let (ai, aj) = (self.amplitudes[i], self.amplitudes[j]);
        self.amplitudes[i] = ai * c - aj * s;
        self.amplitudes[j] = ai * s + aj * c;
        Ok(())
    }

    /// Sample an action from p. `Hard` collapses onto it.
    pub fn measure(&mut self, mode: MeasureMode) -> Measurement {
        let norm_sq = self.norm_sq();
        if !norm_sq.is_finite() || norm_sq < MIN_NORM_SQ {
            log::warn!("measure on invalid state (Σ|a|² = {norm_sq}); resetting to uniform");
            self.reset_uniform();
        }
        let probs = self.probabilities();
        let r: f64 = self.rng.gen::<f64>() * probs.iter().sum::<f64>();
        let mut acc = 0.0;
        let mut index = None;
        for (i, &p) in probs.iter().enumerate() {
            acc += p;
            if r < acc {
                index = Some(i);
                break;
            }
        }
        // r can reach the rounded total; fall back to the last reachable action.
        let index = index
            .or_else(|| probs.iter().rposition(|&p| p > 0.0))
            .unwrap_or(0);
        let probability = probs[index];
        if mode == MeasureMode::Hard {
            self.amplitudes = vec![Complex64::new(0.0, 0.0); probs.len()];
            self.amplitudes[index] = Complex64::new(1.0, 0.0);
            log::debug!("collapsed onto '{}' (p={probability:.4})", self.labels[index]);
        }
        Measurement {
            index,
            label: self.labels[index].clone(),
            probability,
        }
    }

    fn cost_gradient<C>(&self, probs: &[f64], cost_fn: &C) -> Vec<f64>
    where
        C: Fn(&[f64]) -> f64,
    {
        let h = self.cfg.fd_step;
        let mut p = probs.to_vec();
        (0..p.len())
            .map(|i| {
                let p0 = p[i];
                p[i] = p0 + h;
                let plus = cost_fn(&p);
                p[i] = p0 - h;
                let minus = cost_fn(&p);
                p[i] = p0;
                (plus - minus) / (2.0 * h)
            })
            .collect()
    }

    fn fault(&mut self, detail: String) -> UpdateOutcome {
        log::warn!("amplitude update fault: {detail}; resetting to uniform");
        self.reset_uniform();
        self.record(UpdateRecord {
            objective: f64::NAN,
            probabilities: self.probabilities(),
            reset: true,
        });
        UpdateOutcome::Reset {
            fault: EngineError::NormalizationFault(detail),
        }
    }

    fn record(&mut self, rec: UpdateRecord) {
        if self.history.len() >= self.cfg.history_window {
            self.history.pop_front();
        }
        self.history.push_back(rec);
    }
}

fn uniform(n: usize) -> Vec<Complex64> {
    vec![Complex64::new((n as f64).sqrt().recip(), 0.0); n]
}

fn norm_sq(a: &[Complex64]) -> f64 {
    a.iter().map(|z| z.norm_sqr()).sum()
}
