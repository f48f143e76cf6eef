// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Decision Layers
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Turning energies into choices.
//!
//! - `qubo`: constrained binary selection by simulated annealing
//! - `amplitude`: variational complex amplitudes over an action set

pub mod amplitude;
pub mod qubo;

pub use amplitude::{AmplitudeDecisionLayer, MeasureMode, Measurement, UpdateOutcome, UpdateRecord};
pub use qubo::{allocate, Allocation, Constraint, QuboBuilder, QuboOptimizer, QuboProblem, QuboResult};
