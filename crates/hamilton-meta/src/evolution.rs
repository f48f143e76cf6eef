// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Meta Evolution Loop
// ─────────────────────────────────────────────────────────────────────
//! Observe → simulate → apply → validate over an external system.
//!
//! One cycle:
//!   1. observe the target, measure E_before
//!   2. simulate every candidate on a private snapshot copy → predicted ΔE
//!   3. walk improving candidates (ΔE < 0) in ascending order:
//!      checksum, apply, re-measure, confirm |ΔE_real − ΔE_pred| within
//!      tolerance; commit on success, otherwise revert and re-checksum
//!   4. no improving candidate → `Converged`, all rejected → `Stalled`
//!
//! A checksum that differs after revert is fatal (`RollbackIntegrity`).

use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use hamilton_types::{EngineError, EngineResult, MetaConfig};

/// Capabilities the loop needs from the system it evolves.
///
/// `simulate` must not touch the live system: it receives an owned copy
/// of the snapshot and returns the predicted successor.
pub trait EvolutionTarget: Sync {
    type Snapshot: Clone + Serialize + Send + Sync;
    type Change: Clone + fmt::Debug + Send + Sync;

    fn observe(&self) -> Self::Snapshot;
    fn measure_energy(&self, snapshot: &Self::Snapshot) -> EngineResult<f64>;
    fn candidates(&self, snapshot: &Self::Snapshot) -> Vec<Self::Change>;
    fn describe(&self, change: &Self::Change) -> String;
    fn simulate(&self, scratch: Self::Snapshot, change: &Self::Change) -> EngineResult<Self::Snapshot>;
    fn apply(&mut self, change: &Self::Change) -> EngineResult<()>;
    fn revert(&mut self, change: &Self::Change) -> EngineResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    Pending,
    Applied,
    Rejected,
}

/// Candidate as seen by one cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetaCandidateChange {
    pub description: String,
    /// NaN when simulation failed.
    pub predicted_delta: f64,
    pub status: CandidateStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CycleOutcome {
    Improved {
        description: String,
        predicted_delta: f64,
        actual_delta: f64,
        energy: f64,
    },
    /// No candidate predicted an improvement. Target untouched.
    Converged { energy: f64 },
    /// Improving candidates existed but none was confirmed.
    Stalled { energy: f64, rejected: usize },
}

impl CycleOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Improved { .. })
    }

    pub fn energy(&self) -> f64 {
        match self {
            Self::Improved { energy, .. }
            | Self::Converged { energy }
            | Self::Stalled { energy, .. } => *energy,
        }
    }
}

/// Log entry for one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: usize,
    pub energy_before: f64,
    pub outcome: CycleOutcome,
    /// Sorted by predicted ΔE, failed simulations last.
    pub candidates: Vec<MetaCandidateChange>,
    /// Recoverable faults: simulation failures and mismatches.
    pub warnings: Vec<EngineError>,
}

/// Committed change with its realised effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedChange {
    pub cycle: usize,
    pub description: String,
    pub predicted_delta: f64,
    pub actual_delta: f64,
    pub energy_after: f64,
}

/// BLAKE3 over the snapshot's JSON encoding.
pub fn snapshot_checksum<S: Serialize>(snapshot: &S) -> EngineResult<String> {
    let bytes = serde_json::to_vec(snapshot)?;
    Ok(blake3::hash(&bytes).to_hex().to_string())
}

pub struct MetaEvolutionLoop<T: EvolutionTarget> {
    target: T,
    cfg: MetaConfig,
    cycle_count: usize,
    committed: Vec<CommittedChange>,
    pub log: Vec<CycleReport>,
}

impl<T: EvolutionTarget> MetaEvolutionLoop<T> {
    pub fn new(target: T, cfg: MetaConfig) -> EngineResult<Self> {
        cfg.validate()?;
        Ok(Self {
            target,
            cfg,
            cycle_count: 0,
            committed: Vec::new(),
            log: Vec::new(),
        })
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn into_target(self) -> T {
        self.target
    }

    pub fn config(&self) -> &MetaConfig {
        &self.cfg
    }

    pub fn cycle_count(&self) -> usize {
        self.cycle_count
    }

    pub fn committed(&self) -> &[CommittedChange] {
        &self.committed
    }

    /// Current energy of the live target.
    pub fn energy(&self) -> EngineResult<f64> {
        self.target.measure_energy(&self.target.observe())
    }

    /// Revert `change` and confirm the live snapshot hashes to `before`.
    /// A revert that errors but leaves the snapshot intact is only logged.
    fn rollback(&mut self, cycle: usize, change: &T::Change, description: &str, before: &str) -> EngineResult<()> {
        let reverted = self.target.revert(change);
        let after = snapshot_checksum(&self.target.observe())?;
        if after != before {
            log::error!("cycle {cycle}: revert of '{description}' did not restore the snapshot");
            return Err(EngineError::RollbackIntegrity {
                change: description.to_string(),
                before: before.to_string(),
                after,
            });
        }
        if let Err(e) = reverted {
            log::warn!("cycle {cycle}: revert of '{description}' reported {e}; snapshot intact");
        }
        Ok(())
    }

    fn predict(&self, snapshot: &T::Snapshot, e_before: f64, change: &T::Change) -> EngineResult<f64> {
        let next = self.target.simulate(snapshot.clone(), change)?;
        let delta = self.target.measure_energy(&next)? - e_before;
        if !delta.is_finite() {
            return Err(EngineError::Validation(format!(
                "simulated ΔE for '{}' is {delta}",
                self.target.describe(change)
            )));
        }
        Ok(delta)
    }

    fn within_tolerance(&self, predicted: f64, actual: f64) -> bool {
        let window = (self.cfg.rel_tolerance * predicted.abs()).max(self.cfg.abs_tolerance);
        (actual - predicted).abs() <= window
    }

    /// Execute one cycle.
    ///
    /// `Err` only for faults that leave the target in an unknown state:
    /// measurement of the live system, apply/revert failures and rollback
    /// integrity violations.
    pub fn cycle(&mut self) -> EngineResult<CycleReport> {
        let cycle = self.cycle_count;
        let snapshot = self.target.observe();
        let e_before = self.target.measure_energy(&snapshot)?;
        let changes = self.target.candidates(&snapshot);

        let predictions: Vec<EngineResult<f64>> = if self.cfg.parallel {
            changes
                .par_iter()
                .map(|c| self.predict(&snapshot, e_before, c))
                .collect()
        } else {
            changes
                .iter()
                .map(|c| self.predict(&snapshot, e_before, c))
                .collect()
        };

        let mut warnings = Vec::new();
        let mut ranked: Vec<(usize, f64)> = Vec::with_capacity(changes.len());
        for (k, p) in predictions.into_iter().enumerate() {
            match p {
                Ok(delta) => ranked.push((k, delta)),
                Err(e) => {
                    log::warn!(
                        "cycle {cycle}: simulation of '{}' failed: {e}",
                        self.target.describe(&changes[k])
                    );
                    warnings.push(e);
                }
            }
        }
        ranked.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut candidates: Vec<MetaCandidateChange> = ranked
            .iter()
            .map(|&(k, delta)| MetaCandidateChange {
                description: self.target.describe(&changes[k]),
                predicted_delta: delta,
                status: CandidateStatus::Pending,
            })
            .collect();
        candidates.extend(
            changes
                .iter()
                .enumerate()
                .filter(|(k, _)| !ranked.iter().any(|r| r.0 == *k))
                .map(|(_, c)| MetaCandidateChange {
                    description: self.target.describe(c),
                    predicted_delta: f64::NAN,
                    status: CandidateStatus::Rejected,
                }),
        );

        let mut rejected = 0;
        let mut outcome = None;
        for (slot, &(k, predicted)) in ranked.iter().enumerate() {
            if predicted >= 0.0 {
                break;
            }
            let change = &changes[k];
            let description = candidates[slot].description.clone();

            let before = snapshot_checksum(&self.target.observe())?;
            let applied = self.target.apply(change).and_then(|()| self.energy());
            let e_after = match applied {
                Ok(e) => e,
                Err(e) => {
                    self.rollback(cycle, change, &description, &before)?;
                    log::warn!("cycle {cycle}: '{description}' failed after apply: {e}; reverted");
                    warnings.push(e);
                    candidates[slot].status = CandidateStatus::Rejected;
                    rejected += 1;
                    continue;
                }
            };
            let actual = e_after - e_before;

            if self.within_tolerance(predicted, actual) {
                candidates[slot].status = CandidateStatus::Applied;
                log::info!(
                    "cycle {cycle}: committed '{description}' ΔE={actual:.6} (predicted {predicted:.6}), E={e_after:.6}"
                );
                self.committed.push(CommittedChange {
                    cycle,
                    description: description.clone(),
                    predicted_delta: predicted,
                    actual_delta: actual,
                    energy_after: e_after,
                });
                outcome = Some(CycleOutcome::Improved {
                    description,
                    predicted_delta: predicted,
                    actual_delta: actual,
                    energy: e_after,
                });
                break;
            }

            self.rollback(cycle, change, &description, &before)?;
            let mismatch = EngineError::SimulationMismatch {
                change: description,
                predicted,
                actual,
            };
            log::warn!("cycle {cycle}: {mismatch}; reverted");
            warnings.push(mismatch);
            candidates[slot].status = CandidateStatus::Rejected;
            rejected += 1;
        }

        let outcome = match outcome {
            Some(o) => o,
            None if rejected > 0 => CycleOutcome::Stalled {
                energy: e_before,
                rejected,
            },
            None => CycleOutcome::Converged { energy: e_before },
        };

        let report = CycleReport {
            cycle,
            energy_before: e_before,
            outcome,
            candidates,
            warnings,
        };
        self.log.push(report.clone());
        self.cycle_count += 1;
        Ok(report)
    }

    /// Cycle until `Converged`/`Stalled` or `max_cycles` cycles ran.
    pub fn run(&mut self, max_cycles: usize) -> EngineResult<Vec<CycleReport>> {
        let mut reports = Vec::with_capacity(max_cycles.min(64));
        for _ in 0..max_cycles {
            let report = self.cycle()?;
            let done = report.outcome.is_terminal();
            reports.push(report);
            if done {
                break;
            }
        }
        Ok(reports)
    }

    /// `run` with the configured cycle budget.
    pub fn run_to_convergence(&mut self) -> EngineResult<Vec<CycleReport>> {
        self.run(self.cfg.max_cycles)
    }
}
