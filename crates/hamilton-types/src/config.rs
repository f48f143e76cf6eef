// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Configuration
// ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Symplectic stepping scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Scheme {
    /// Second-order kick-drift-kick velocity Verlet.
    #[default]
    Leapfrog,
    /// Fourth-order triple-jump composition of three kick-drift-kick sub-steps.
    Yoshida4,
}

/// Energy-drift driven step-size control.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Maximum relative energy drift accepted per step.
    /// Default: 1e-6.
    pub tolerance: f64,

    /// Floor for dt. Shrinking below this fails the run with `NonConvergent`.
    /// Default: 1e-9.
    pub dt_min: f64,

    /// Ceiling for dt growth.
    /// Default: 0.1.
    pub dt_max: f64,

    /// Multiplier applied to dt when a step is rejected.
    /// Default: 0.5.
    pub shrink: f64,

    /// Multiplier applied to dt when drift is far below tolerance.
    /// Default: 1.5.
    pub grow: f64,

    /// Fraction of `tolerance` under which dt grows.
    /// Default: 0.1.
    pub grow_below: f64,

    /// Denominator guard in |ΔE| / (|E| + ε).
    /// Default: 1e-12.
    pub epsilon: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            dt_min: 1e-9,
            dt_max: 0.1,
            shrink: 0.5,
            grow: 1.5,
            grow_below: 0.1,
            epsilon: 1e-12,
        }
    }
}

impl AdaptiveConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.tolerance > 0.0) {
            return Err(EngineError::Config(format!(
                "adaptive.tolerance must be > 0, got {}",
                self.tolerance
            )));
        }
        if !(self.dt_min > 0.0 && self.dt_min <= self.dt_max) {
            return Err(EngineError::Config(format!(
                "adaptive requires 0 < dt_min <= dt_max, got dt_min={} dt_max={}",
                self.dt_min, self.dt_max
            )));
        }
        if !(self.shrink > 0.0 && self.shrink < 1.0) {
            return Err(EngineError::Config(format!(
                "adaptive.shrink must be in (0, 1), got {}",
                self.shrink
            )));
        }
        if self.grow < 1.0 {
            return Err(EngineError::Config(format!(
                "adaptive.grow must be >= 1, got {}",
                self.grow
            )));
        }
        if !(0.0..1.0).contains(&self.grow_below) {
            return Err(EngineError::Config(format!(
                "adaptive.grow_below must be in [0, 1), got {}",
                self.grow_below
            )));
        }
        Ok(())
    }
}

/// Integrator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegratorConfig {
    /// Initial (or fixed) timestep.
    /// Default: 0.01.
    pub dt: f64,

    /// Default: `Scheme::Leapfrog`.
    pub scheme: Scheme,

    /// Step-size control. `None` runs at fixed dt.
    pub adaptive: Option<AdaptiveConfig>,

    /// Record every n-th accepted step into the trajectory (initial state always kept).
    /// Default: 1.
    pub record_every: usize,
}

impl Default for IntegratorConfig {
    fn default() -> Self {
        Self {
            dt: 0.01,
            scheme: Scheme::Leapfrog,
            adaptive: None,
            record_every: 1,
        }
    }
}

impl IntegratorConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.dt.is_finite() && self.dt > 0.0) {
            return Err(EngineError::Config(format!(
                "integrator.dt must be finite and > 0, got {}",
                self.dt
            )));
        }
        if self.record_every == 0 {
            return Err(EngineError::Config(
                "integrator.record_every must be >= 1".to_string(),
            ));
        }
        if let Some(adaptive) = &self.adaptive {
            adaptive.validate()?;
            if self.dt < adaptive.dt_min || self.dt > adaptive.dt_max {
                return Err(EngineError::Config(format!(
                    "integrator.dt={} outside adaptive range [{}, {}]",
                    self.dt, adaptive.dt_min, adaptive.dt_max
                )));
            }
        }
        Ok(())
    }
}

/// Simulated-annealing parameters for the QUBO optimizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnealConfig {
    /// Iteration budget per restart.
    /// Default: 20_000.
    pub max_iterations: usize,

    /// Geometric cooling factor per iteration.
    /// Default: 0.995.
    pub decay: f64,

    /// Starting temperature. `None` estimates it from coefficient magnitudes.
    pub initial_temperature: Option<f64>,

    /// Temperature floor.
    /// Default: 1e-8.
    pub min_temperature: f64,

    /// Stop after this many consecutive iterations without a new best.
    /// Default: 4_000.
    pub stall_limit: usize,

    /// Penalty weight = multiplier × max |objective coefficient|.
    /// Default: 10.0.
    pub penalty_multiplier: f64,

    /// Independent restarts for best-of-K mode.
    /// Default: 1.
    pub restarts: usize,

    /// Base RNG seed; restart k uses `seed + k`.
    /// Default: 42.
    pub seed: u64,
}

impl Default for AnnealConfig {
    fn default() -> Self {
        Self {
            max_iterations: 20_000,
            decay: 0.995,
            initial_temperature: None,
            min_temperature: 1e-8,
            stall_limit: 4_000,
            penalty_multiplier: 10.0,
            restarts: 1,
            seed: 42,
        }
    }
}

impl AnnealConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.max_iterations == 0 {
            return Err(EngineError::Config(
                "anneal.max_iterations must be >= 1".to_string(),
            ));
        }
        if !(self.decay > 0.0 && self.decay < 1.0) {
            return Err(EngineError::Config(format!(
                "anneal.decay must be in (0, 1), got {}",
                self.decay
            )));
        }
        if let Some(t0) = self.initial_temperature {
            if !(t0.is_finite() && t0 > 0.0) {
                return Err(EngineError::Config(format!(
                    "anneal.initial_temperature must be finite and > 0, got {t0}"
                )));
            }
        }
        if !(self.min_temperature > 0.0) {
            return Err(EngineError::Config(format!(
                "anneal.min_temperature must be > 0, got {}",
                self.min_temperature
            )));
        }
        if self.stall_limit == 0 {
            return Err(EngineError::Config(
                "anneal.stall_limit must be >= 1".to_string(),
            ));
        }
        if self.penalty_multiplier < 1.0 {
            return Err(EngineError::Config(format!(
                "anneal.penalty_multiplier must be >= 1, got {}",
                self.penalty_multiplier
            )));
        }
        if self.restarts == 0 {
            return Err(EngineError::Config(
                "anneal.restarts must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Amplitude decision layer parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionConfig {
    /// Finite-difference step for the cost-functional gradient.
    /// Default: 1e-6.
    pub fd_step: f64,

    /// Seed for measurement sampling.
    /// Default: 7.
    pub seed: u64,

    /// Maximum retained update records.
    /// Default: 256.
    pub history_window: usize,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            fd_step: 1e-6,
            seed: 7,
            history_window: 256,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.fd_step > 0.0 && self.fd_step < 1.0) {
            return Err(EngineError::Config(format!(
                "decision.fd_step must be in (0, 1), got {}",
                self.fd_step
            )));
        }
        if self.history_window == 0 {
            return Err(EngineError::Config(
                "decision.history_window must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Meta evolution loop parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaConfig {
    /// Relative agreement required between predicted and realised ΔE.
    /// Default: 0.01.
    pub rel_tolerance: f64,

    /// Absolute floor on the agreement window.
    /// Default: 1e-12.
    pub abs_tolerance: f64,

    /// Simulate candidates on worker threads.
    /// Default: true.
    pub parallel: bool,

    /// Cycle budget for `run`.
    /// Default: 64.
    pub max_cycles: usize,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            rel_tolerance: 0.01,
            abs_tolerance: 1e-12,
            parallel: true,
            max_cycles: 64,
        }
    }
}

impl MetaConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if !(self.rel_tolerance >= 0.0 && self.rel_tolerance.is_finite()) {
            return Err(EngineError::Config(format!(
                "meta.rel_tolerance must be finite and >= 0, got {}",
                self.rel_tolerance
            )));
        }
        if self.abs_tolerance < 0.0 {
            return Err(EngineError::Config(format!(
                "meta.abs_tolerance must be >= 0, got {}",
                self.abs_tolerance
            )));
        }
        if self.max_cycles == 0 {
            return Err(EngineError::Config(
                "meta.max_cycles must be >= 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Top-level configuration bundling every engine component.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub integrator: IntegratorConfig,
    pub anneal: AnnealConfig,
    pub decision: DecisionConfig,
    pub meta: MetaConfig,
}

impl EngineConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> EngineResult<()> {
        self.integrator.validate()?;
        self.anneal.validate()?;
        self.decision.validate()?;
        self.meta.validate()
    }

    /// Load from JSON string. Missing sections fall back to defaults.
    pub fn from_json(json: &str) -> EngineResult<Self> {
        serde_json::from_str(json)
            .map_err(|e| EngineError::Config(format!("JSON parse error: {e}")))
    }

    pub fn to_json(&self) -> EngineResult<String> {
        serde_json::to_string_pretty(self).map_err(EngineError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_adaptive_dt_outside_range_rejected() {
        let cfg = IntegratorConfig {
            dt: 0.5,
            adaptive: Some(AdaptiveConfig::default()),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_bad_decay_rejected() {
        let cfg = AnnealConfig {
            decay: 1.0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = EngineConfig::from_json(r#"{"integrator": {"dt": 0.005, "scheme": "Yoshida4", "adaptive": null, "record_every": 10}}"#)
            .unwrap();
        assert_eq!(cfg.integrator.scheme, Scheme::Yoshida4);
        assert_eq!(cfg.integrator.record_every, 10);
        assert!((cfg.anneal.decay - 0.995).abs() < 1e-15);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_garbage_json_is_config_error() {
        assert!(matches!(
            EngineConfig::from_json("{not json"),
            Err(EngineError::Config(_))
        ));
    }
}
