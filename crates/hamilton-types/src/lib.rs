// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Types
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Type definitions, configuration, and error hierarchy for the
//! Hamilton Kernel: symplectic phase-space simulation and
//! energy-based decision making.

pub mod config;
pub mod error;
pub mod state;

pub use config::{
    AdaptiveConfig, AnnealConfig, DecisionConfig, EngineConfig, IntegratorConfig, MetaConfig,
    Scheme,
};
pub use error::{EngineError, EngineResult};
pub use state::{
    Checkpoint, Clocked, CouplingDescriptor, EvolutionTrajectory, JointState, ModelDescriptor,
    PairTermDescriptor, PhaseSpaceState, SystemDescriptor,
};
