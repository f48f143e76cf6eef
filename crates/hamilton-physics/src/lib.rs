// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Physics Engine
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Canonical-coordinate dynamics for the Hamilton Kernel.
//!
//! - `hamiltonian`: `HamiltonianModel` with pluggable energy closures
//! - `integrator`: kick-drift-kick / Yoshida stepping, adaptive dt, cancellation
//! - `coupling`: `CouplingGraph` binding N models through a symmetric Λ
//! - `models`: library Hamiltonians and the checkpoint rebuild registry
//! - `analysis`: Poisson brackets, Liouville ratio, equilibrium search

pub mod analysis;
pub mod coupling;
pub mod hamiltonian;
pub mod integrator;
pub mod models;

pub use analysis::{find_equilibrium, phase_volume_ratio, poisson_bracket, Equilibrium};
pub use coupling::{exponential_decay_lambda, CouplingGraph, CouplingGraphBuilder, CouplingTerm};
pub use hamiltonian::{GradientMethod, HamiltonianModel, Parameters};
pub use integrator::{
    CancellationToken, Evolution, RunStatus, SymplecticFlow, SymplecticIntegrator,
};
