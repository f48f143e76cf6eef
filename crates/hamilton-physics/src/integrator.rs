// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Symplectic Integrator
// ─────────────────────────────────────────────────────────────────────
//! Kick-drift-kick velocity Verlet:
//!
//!   p½    = p − ½dt·∂H/∂q(q, p)
//!   q_new = q + dt·∂H/∂p(q, p½)
//!   p_new = p½ − ½dt·∂H/∂q(q_new, p½)
//!
//! plus the fourth-order Yoshida triple jump built from three such
//! sub-steps, optional energy-drift step control, and cooperative
//! cancellation at step boundaries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use hamilton_types::{
    AdaptiveConfig, Checkpoint, Clocked, EngineError, EngineResult, EvolutionTrajectory,
    IntegratorConfig, Scheme, SystemDescriptor,
};

/// A Hamiltonian system split into its two symplectic half-maps.
///
/// `kick` advances momenta by −h·∂H/∂q, `drift` advances coordinates by
/// +h·∂H/∂p. Both read the state as it is at call time.
pub trait SymplecticFlow {
    type State: Clone + Clocked;

    fn energy(&self, state: &Self::State) -> EngineResult<f64>;
    fn kick(&self, state: &mut Self::State, h: f64) -> EngineResult<()>;
    fn drift(&self, state: &mut Self::State, h: f64) -> EngineResult<()>;
    /// Shape validation against the flow (dimensions, subsystem count).
    fn check(&self, state: &Self::State) -> EngineResult<()>;
    /// Descriptor recorded into checkpoints.
    fn system(&self) -> SystemDescriptor;
}

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Running,
    Stepping,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Shared flag checked once per step boundary.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Outcome of a run. The trajectory is always returned, including on
/// failure or cancellation, and ends at the last valid state.
#[derive(Debug, Clone)]
pub struct Evolution<S> {
    pub trajectory: EvolutionTrajectory<S>,
    /// Energy of each recorded snapshot.
    pub energies: Vec<f64>,
    pub status: RunStatus,
    pub fault: Option<EngineError>,
    pub steps_taken: u64,
}

impl<S> Evolution<S> {
    pub fn final_state(&self) -> Option<&S> {
        self.trajectory.last()
    }

    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Largest |E_k − E_0| / |E_0| over the recorded energies.
    pub fn max_relative_drift(&self) -> f64 {
        crate::analysis::max_relative_drift(&self.energies)
    }

    /// Trajectory on success, the fault otherwise.
    pub fn into_result(self) -> EngineResult<EvolutionTrajectory<S>> {
        match self.fault {
            Some(e) => Err(e),
            None => Ok(self.trajectory),
        }
    }
}

/// Yoshida fourth-order weights (w1, w0, w1), w0 = 1 − 2·w1.
fn yoshida_weights() -> (f64, f64) {
    let cbrt2 = 2f64.cbrt();
    let w1 = 1.0 / (2.0 - cbrt2);
    let w0 = -cbrt2 / (2.0 - cbrt2);
    (w1, w0)
}

/// One kick-drift-kick sub-step of length h. Does not touch the clock.
pub fn kick_drift_kick<F: SymplecticFlow>(flow: &F, state: &mut F::State, h: f64) -> EngineResult<()> {
    flow.kick(state, 0.5 * h)?;
    flow.drift(state, h)?;
    flow.kick(state, 0.5 * h)
}

/// Advance `state` by dt with the given scheme and move its clock.
pub fn advance<F: SymplecticFlow>(
    flow: &F,
    state: &mut F::State,
    dt: f64,
    scheme: Scheme,
) -> EngineResult<()> {
    let t0 = state.time();
    match scheme {
        Scheme::Leapfrog => kick_drift_kick(flow, state, dt)?,
        Scheme::Yoshida4 => {
            let (w1, w0) = yoshida_weights();
            kick_drift_kick(flow, state, w1 * dt)?;
            kick_drift_kick(flow, state, w0 * dt)?;
            kick_drift_kick(flow, state, w1 * dt)?;
        }
    }
    state.set_time(t0 + dt);
    Ok(())
}

/// Structure-preserving stepper with optional adaptive dt.
///
/// The integrator owns only its clock bookkeeping. Models and coupling
/// graphs are borrowed read-only for the duration of each call.
#[derive(Debug)]
pub struct SymplecticIntegrator {
    cfg: IntegratorConfig,
    dt: f64,
    step_count: u64,
    status: RunStatus,
    cancel: CancellationToken,
}

impl SymplecticIntegrator {
    pub fn new(cfg: IntegratorConfig) -> EngineResult<Self> {
        cfg.validate()?;
        Ok(Self {
            dt: cfg.dt,
            cfg,
            step_count: 0,
            status: RunStatus::Completed,
            cancel: CancellationToken::new(),
        })
    }

    /// Fixed-step leapfrog.
    pub fn leapfrog(dt: f64) -> EngineResult<Self> {
        Self::new(IntegratorConfig {
            dt,
            ..Default::default()
        })
    }

    /// Fixed-step fourth-order Yoshida.
    pub fn yoshida4(dt: f64) -> EngineResult<Self> {
        Self::new(IntegratorConfig {
            dt,
            scheme: Scheme::Yoshida4,
            ..Default::default()
        })
    }

    /// Leapfrog with drift-controlled dt.
    pub fn adaptive(dt: f64, adaptive: AdaptiveConfig) -> EngineResult<Self> {
        Self::new(IntegratorConfig {
            dt,
            adaptive: Some(adaptive),
            ..Default::default()
        })
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &IntegratorConfig {
        &self.cfg
    }

    /// dt for the next step.
    pub fn dt(&self) -> f64 {
        self.dt
    }

    pub fn step_count(&self) -> u64 {
        self.step_count
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Advance one accepted step. Returns the new state and its energy.
    pub fn step<F: SymplecticFlow>(
        &mut self,
        flow: &F,
        state: &F::State,
    ) -> EngineResult<(F::State, f64)> {
        flow.check(state)?;
        if !state.is_finite() {
            return Err(EngineError::Validation(
                "input state contains NaN or Inf".to_string(),
            ));
        }
        let e_old = flow.energy(state)?;
        let out = self.step_from(flow, state, e_old, None)?;
        self.step_count += 1;
        Ok(out)
    }

    fn step_from<F: SymplecticFlow>(
        &mut self,
        flow: &F,
        state: &F::State,
        e_old: f64,
        dt_cap: Option<f64>,
    ) -> EngineResult<(F::State, f64)> {
        let capped = |dt: f64| dt_cap.map_or(dt, |cap| dt.min(cap));
        let Some(acfg) = self.cfg.adaptive.clone() else {
            let mut next = state.clone();
            advance(flow, &mut next, capped(self.dt), self.cfg.scheme)?;
            let e_new = flow.energy(&next)?;
            return Ok((next, e_new));
        };

        let mut dt = capped(self.dt);
        let limited = dt < self.dt;
        let mut rejected = false;
        loop {
            let mut trial = state.clone();
            advance(flow, &mut trial, dt, self.cfg.scheme)?;
            let e_new = flow.energy(&trial)?;
            let drift = (e_new - e_old).abs() / (e_old.abs() + acfg.epsilon);

            if drift <= acfg.tolerance {
                let next_dt = if drift < acfg.grow_below * acfg.tolerance {
                    (dt * acfg.grow).min(acfg.dt_max)
                } else {
                    dt
                };
                // A step shortened only to land on t_end leaves dt alone.
                if !limited || rejected {
                    if next_dt > self.dt {
                        log::debug!("drift {drift:.3e} well within tolerance; dt -> {next_dt:.3e}");
                    }
                    self.dt = next_dt;
                }
                return Ok((trial, e_new));
            }

            let shrunk = dt * acfg.shrink;
            if shrunk < acfg.dt_min {
                self.dt = dt;
                return Err(EngineError::NonConvergent {
                    dt: shrunk,
                    dt_min: acfg.dt_min,
                    t: state.time(),
                    drift,
                });
            }
            log::debug!(
                "step rejected at t={:.6}: drift {drift:.3e}; dt {dt:.3e} -> {shrunk:.3e}",
                state.time()
            );
            dt = shrunk;
            rejected = true;
        }
    }

    /// Integrate `n_steps` accepted steps.
    pub fn run<F: SymplecticFlow>(
        &mut self,
        flow: &F,
        initial: F::State,
        n_steps: u64,
    ) -> Evolution<F::State> {
        self.drive(flow, initial, Horizon::Steps(n_steps))
    }

    /// Integrate until the clock reaches `t_end`; the last step is
    /// shortened to land on it exactly.
    pub fn run_until<F: SymplecticFlow>(
        &mut self,
        flow: &F,
        initial: F::State,
        t_end: f64,
    ) -> Evolution<F::State> {
        self.drive(flow, initial, Horizon::Time(t_end))
    }

    fn drive<F: SymplecticFlow>(
        &mut self,
        flow: &F,
        initial: F::State,
        horizon: Horizon,
    ) -> Evolution<F::State> {
        self.status = RunStatus::Running;
        let record_every = self.cfg.record_every as u64;
        let mut evo = Evolution {
            trajectory: EvolutionTrajectory::new(),
            energies: Vec::new(),
            status: RunStatus::Running,
            fault: None,
            steps_taken: 0,
        };

        let checked = flow.check(&initial).and_then(|()| {
            if initial.is_finite() {
                flow.energy(&initial)
            } else {
                Err(EngineError::Validation(
                    "initial state contains NaN or Inf".to_string(),
                ))
            }
        });
        let mut energy = match checked {
            Ok(e) => e,
            Err(e) => return self.fail(evo, e),
        };
        evo.trajectory.push(initial.clone());
        evo.energies.push(energy);

        let mut state = initial;
        let mut last_recorded = 0u64;
        loop {
            let dt_cap = match horizon {
                Horizon::Steps(n) if evo.steps_taken >= n => break,
                Horizon::Steps(_) => None,
                Horizon::Time(t_end) => {
                    let remaining = t_end - state.time();
                    if remaining <= 1e-12 * t_end.abs().max(1.0) {
                        break;
                    }
                    Some(remaining)
                }
            };
            if self.cancel.is_cancelled() {
                log::info!(
                    "run cancelled at t={:.6} after {} steps",
                    state.time(),
                    evo.steps_taken
                );
                if last_recorded != evo.steps_taken {
                    evo.trajectory.push(state);
                    evo.energies.push(energy);
                }
                self.status = RunStatus::Cancelled;
                evo.status = RunStatus::Cancelled;
                return evo;
            }

            self.status = RunStatus::Stepping;
            match self.step_from(flow, &state, energy, dt_cap) {
                Ok((next, e_next)) => {
                    state = next;
                    energy = e_next;
                    evo.steps_taken += 1;
                    self.step_count += 1;
                    if evo.steps_taken % record_every == 0 {
                        evo.trajectory.push(state.clone());
                        evo.energies.push(energy);
                        last_recorded = evo.steps_taken;
                    }
                }
                Err(e) => {
                    if last_recorded != evo.steps_taken {
                        evo.trajectory.push(state);
                        evo.energies.push(energy);
                    }
                    return self.fail(evo, e);
                }
            }
        }

        if last_recorded != evo.steps_taken {
            evo.trajectory.push(state);
            evo.energies.push(energy);
        }
        self.status = RunStatus::Completed;
        evo.status = RunStatus::Completed;
        evo
    }

    fn fail<S>(&mut self, mut evo: Evolution<S>, e: EngineError) -> Evolution<S> {
        log::error!("integration failed after {} steps: {e}", evo.steps_taken);
        self.status = RunStatus::Failed;
        evo.status = RunStatus::Failed;
        evo.fault = Some(e);
        evo
    }

    /// Snapshot of `state` plus everything needed to resume exactly.
    pub fn checkpoint<F>(&self, flow: &F, state: &F::State) -> Checkpoint<F::State>
    where
        F: SymplecticFlow,
    {
        Checkpoint {
            state: state.clone(),
            step_count: self.step_count,
            dt: self.dt,
            integrator: self.cfg.clone(),
            system: flow.system(),
        }
    }

    /// Rebuild an integrator positioned at a checkpoint, under the stored
    /// integrator config unless `overrides` is given. The caller rebuilds
    /// the flow from `checkpoint.system`.
    pub fn resume<S>(checkpoint: &Checkpoint<S>, overrides: Option<IntegratorConfig>) -> EngineResult<Self>
    where
        S: Serialize + DeserializeOwned + Clocked,
    {
        let cfg = overrides.unwrap_or_else(|| checkpoint.integrator.clone());
        let mut integrator = Self::new(cfg)?;
        integrator.dt = checkpoint.dt;
        integrator.step_count = checkpoint.step_count;
        Ok(integrator)
    }
}

#[derive(Clone, Copy)]
enum Horizon {
    Steps(u64),
    Time(f64),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models;
    use hamilton_types::PhaseSpaceState;

    fn oscillator_start() -> PhaseSpaceState {
        PhaseSpaceState::new(vec![1.0], vec![0.0]).unwrap()
    }

    #[test]
    fn test_yoshida_weights_sum_to_one() {
        let (w1, w0) = yoshida_weights();
        assert!((2.0 * w1 + w0 - 1.0).abs() < 1e-14);
    }

    #[test]
    fn test_single_step_advances_clock() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let (next, _) = integrator.step(&model, &oscillator_start()).unwrap();
        assert_eq!(integrator.step_count(), 1);
        assert!((next.t - 0.01).abs() < 1e-15);
        // p½ = −0.005, q = 1 − 0.01·0.005, p = p½ − 0.005·q
        assert!((next.q[0] - 0.99995).abs() < 1e-12, "q={}", next.q[0]);
        assert!((next.p[0] - (-0.005 - 0.005 * 0.99995)).abs() < 1e-12);
    }

    #[test]
    fn test_harmonic_oscillator_yoshida_drift_below_1e6() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::yoshida4(0.01).unwrap();
        let evo = integrator.run(&model, oscillator_start(), 10_000);
        assert!(evo.is_completed());
        assert_eq!(evo.steps_taken, 10_000);
        let drift = evo.max_relative_drift();
        assert!(drift < 1e-6, "relative drift {drift:e} over 10k steps");
    }

    #[test]
    fn test_harmonic_oscillator_leapfrog_drift_bounded() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let evo = integrator.run(&model, oscillator_start(), 10_000);
        let drift = evo.max_relative_drift();
        // Leapfrog energy error oscillates with amplitude ~dt²/4, no secular growth.
        assert!(drift < 1e-4, "relative drift {drift:e}");
        let e0 = evo.energies[0];
        let late = evo.energies[evo.energies.len() - 1];
        assert!(((late - e0) / e0).abs() < 1e-4);
    }

    #[test]
    fn test_record_every_decimates_but_keeps_final() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let cfg = IntegratorConfig {
            dt: 0.01,
            record_every: 30,
            ..Default::default()
        };
        let mut integrator = SymplecticIntegrator::new(cfg).unwrap();
        let evo = integrator.run(&model, oscillator_start(), 100);
        // initial + steps 30, 60, 90 + final 100
        assert_eq!(evo.trajectory.len(), 5);
        assert!((evo.final_state().unwrap().t - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_run_until_lands_on_end_time() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::leapfrog(0.03).unwrap();
        let evo = integrator.run_until(&model, oscillator_start(), 1.0);
        assert!(evo.is_completed());
        let t = evo.final_state().unwrap().t;
        assert!((t - 1.0).abs() < 1e-12, "t={t}");
        assert_eq!(evo.steps_taken, 34);
        assert!((integrator.dt() - 0.03).abs() < 1e-15);
    }

    #[test]
    fn test_adaptive_grows_dt_when_drift_small() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let acfg = AdaptiveConfig {
            tolerance: 1e-3,
            dt_max: 0.05,
            ..Default::default()
        };
        let mut integrator = SymplecticIntegrator::adaptive(1e-4, acfg).unwrap();
        let evo = integrator.run(&model, oscillator_start(), 50);
        assert!(evo.is_completed());
        assert!(integrator.dt() > 1e-4, "dt should have grown, got {}", integrator.dt());
        assert!(integrator.dt() <= 0.05);
    }

    #[test]
    fn test_adaptive_shrinks_to_meet_tolerance() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let acfg = AdaptiveConfig {
            tolerance: 1e-6,
            dt_max: 0.1,
            ..Default::default()
        };
        let mut integrator = SymplecticIntegrator::adaptive(0.1, acfg).unwrap();
        let start = PhaseSpaceState::new(vec![0.7], vec![0.7]).unwrap();
        let evo = integrator.run(&model, start, 20);
        assert!(evo.is_completed(), "fault: {:?}", evo.fault);
        assert!(integrator.dt() < 0.1);
        for pair in evo.energies.windows(2) {
            let d = (pair[1] - pair[0]).abs() / pair[0].abs();
            assert!(d <= 1e-6 + 1e-15, "step drift {d:e}");
        }
    }

    #[test]
    fn test_adaptive_non_convergent_returns_partial_trajectory() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let acfg = AdaptiveConfig {
            tolerance: 1e-30,
            dt_min: 1e-3,
            dt_max: 0.1,
            ..Default::default()
        };
        let mut integrator = SymplecticIntegrator::adaptive(0.01, acfg).unwrap();
        let start = PhaseSpaceState::new(vec![0.7], vec![0.7]).unwrap();
        let evo = integrator.run(&model, start.clone(), 10);
        assert_eq!(evo.status, RunStatus::Failed);
        assert_eq!(integrator.status(), RunStatus::Failed);
        assert!(matches!(evo.fault, Some(EngineError::NonConvergent { .. })));
        assert_eq!(evo.trajectory.len(), 1);
        assert_eq!(evo.final_state(), Some(&start));
    }

    #[test]
    fn test_evaluation_fault_aborts_run() {
        // V = sqrt(1 − q²) pushes outward and is undefined past |q| = 1.
        let model = crate::HamiltonianModel::new(
            "cap",
            |_q, p, _| 0.5 * p[0] * p[0],
            |q, _p, _| (1.0 - q[0] * q[0]).sqrt(),
        );
        let start = PhaseSpaceState::new(vec![0.5], vec![1.0]).unwrap();
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let evo = integrator.run(&model, start, 1_000);
        assert_eq!(evo.status, RunStatus::Failed);
        assert!(matches!(evo.fault, Some(EngineError::EvaluationFault { .. })));
        assert!(evo.steps_taken > 0 && evo.steps_taken < 1_000);
        let last = evo.final_state().unwrap();
        assert!(last.is_finite());
        assert!(last.q[0].abs() < 1.0);
    }

    #[test]
    fn test_cancelled_run_keeps_initial_state() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let token = CancellationToken::new();
        let mut integrator = SymplecticIntegrator::leapfrog(0.01)
            .unwrap()
            .with_cancellation(token.clone());
        token.cancel();
        let evo = integrator.run(&model, oscillator_start(), 100);
        assert_eq!(evo.status, RunStatus::Cancelled);
        assert_eq!(evo.trajectory.len(), 1);
        assert!(evo.fault.is_none());
    }

    #[test]
    fn test_nan_input_rejected() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let bad = PhaseSpaceState::new(vec![f64::NAN], vec![0.0]).unwrap();
        assert!(integrator.step(&model, &bad).is_err());
        let evo = integrator.run(&model, bad, 10);
        assert_eq!(evo.status, RunStatus::Failed);
        assert!(evo.trajectory.is_empty());
    }

    #[test]
    fn test_checkpoint_resume_matches_uninterrupted() {
        let model = models::harmonic_oscillator(1.3, 0.8);
        let start = PhaseSpaceState::new(vec![0.9], vec![-0.2]).unwrap();

        let mut straight = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let full = straight.run(&model, start.clone(), 200);
        let expected = full.final_state().unwrap().clone();

        let mut first = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let half = first.run(&model, start, 100);
        let mid = half.final_state().unwrap();
        let json = first.checkpoint(&model, mid).to_json().unwrap();

        let restored: Checkpoint<PhaseSpaceState> = Checkpoint::from_json(&json).unwrap();
        let rebuilt = match &restored.system {
            SystemDescriptor::Single(d) => models::build(d).unwrap(),
            SystemDescriptor::Coupled(_) => panic!("expected single model"),
        };
        let mut second = SymplecticIntegrator::resume(&restored, None).unwrap();
        let rest = second.run(&rebuilt, restored.state.clone(), 100);
        let got = rest.final_state().unwrap();

        assert_eq!(second.step_count(), 200);
        assert!(got.max_abs_diff(&expected) < 1e-12, "diff {}", got.max_abs_diff(&expected));
        assert!((got.t - expected.t).abs() < 1e-12);
    }

    #[test]
    fn test_checkpoint_carries_scheme_and_step_control() {
        let model = models::pendulum(1.0, 1.0, 9.81);
        let start = PhaseSpaceState::new(vec![2.5], vec![0.0]).unwrap();
        let cfg = IntegratorConfig {
            dt: 0.02,
            scheme: Scheme::Yoshida4,
            adaptive: Some(AdaptiveConfig {
                tolerance: 1e-9,
                ..Default::default()
            }),
            record_every: 3,
        };

        let mut straight = SymplecticIntegrator::new(cfg.clone()).unwrap();
        let expected = straight.run(&model, start.clone(), 120);

        let mut first = SymplecticIntegrator::new(cfg.clone()).unwrap();
        let half = first.run(&model, start, 60);
        let json = first
            .checkpoint(&model, half.final_state().unwrap())
            .to_json()
            .unwrap();

        let restored: Checkpoint<PhaseSpaceState> = Checkpoint::from_json(&json).unwrap();
        assert_eq!(restored.integrator, cfg);
        let rebuilt = match &restored.system {
            SystemDescriptor::Single(d) => models::build(d).unwrap(),
            SystemDescriptor::Coupled(_) => panic!("expected single model"),
        };
        let mut second = SymplecticIntegrator::resume(&restored, None).unwrap();
        assert_eq!(second.config(), &cfg);
        assert_eq!(second.dt(), first.dt());
        let rest = second.run(&rebuilt, restored.state.clone(), 60);

        let got = rest.final_state().unwrap();
        let want = expected.final_state().unwrap();
        assert_eq!(got, want);
        assert_eq!(second.dt(), straight.dt());

        let fixed = SymplecticIntegrator::resume(&restored, Some(IntegratorConfig::default())).unwrap();
        assert_eq!(fixed.config().scheme, Scheme::Leapfrog);
        assert!(fixed.config().adaptive.is_none());
        assert_eq!(fixed.dt(), restored.dt);
    }

    /// Oscillator whose potential trips `token` once |q| falls below `at`.
    fn tripwire_oscillator(token: CancellationToken, at: f64) -> crate::HamiltonianModel {
        crate::HamiltonianModel::new(
            "tripwire",
            |_q, p, _| 0.5 * p[0] * p[0],
            move |q, _p, _| {
                if q[0].abs() < at {
                    token.cancel();
                }
                0.5 * q[0] * q[0]
            },
        )
    }

    #[test]
    fn test_cancel_mid_run_stops_at_step_boundary() {
        let token = CancellationToken::new();
        let model = tripwire_oscillator(token.clone(), 0.5);
        let mut integrator = SymplecticIntegrator::leapfrog(0.01)
            .unwrap()
            .with_cancellation(token.clone());
        let evo = integrator.run(&model, oscillator_start(), 1_000);

        assert_eq!(evo.status, RunStatus::Cancelled);
        assert_eq!(integrator.status(), RunStatus::Cancelled);
        assert!(evo.fault.is_none());
        // q = cos t crosses 0.5 near t = π/3
        assert!(evo.steps_taken > 90 && evo.steps_taken < 120, "{}", evo.steps_taken);
        assert_eq!(integrator.step_count(), evo.steps_taken);
        assert_eq!(evo.trajectory.len() as u64, evo.steps_taken + 1);
        assert_eq!(evo.energies.len(), evo.trajectory.len());

        let last = evo.final_state().unwrap();
        assert!((last.t - evo.steps_taken as f64 * 0.01).abs() < 1e-9);

        // Same model, untripped token: the partial run is an exact prefix.
        let mut reference = SymplecticIntegrator::leapfrog(0.01).unwrap();
        let full = reference.run(
            &tripwire_oscillator(CancellationToken::new(), 0.5),
            oscillator_start(),
            evo.steps_taken,
        );
        assert_eq!(full.status, RunStatus::Completed);
        assert_eq!(full.final_state(), Some(last));
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let token = CancellationToken::new();
        let model = models::harmonic_oscillator(1.0, 1.0);
        let mut integrator = SymplecticIntegrator::leapfrog(1e-4)
            .unwrap()
            .with_cancellation(token.clone());
        let canceller = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            token.cancel();
        });
        let evo = integrator.run(&model, oscillator_start(), u64::MAX);
        canceller.join().unwrap();

        assert_eq!(evo.status, RunStatus::Cancelled);
        assert!(evo.steps_taken > 0);
        let last = evo.final_state().unwrap();
        assert!(last.is_finite());
        assert!((last.t - evo.steps_taken as f64 * 1e-4).abs() < 1e-6);
    }
}
