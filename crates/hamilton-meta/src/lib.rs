// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Meta Evolution
// (C) 1998-2026 Miroslav Sotek. All rights reserved.
// License: GNU AGPL v3 | Commercial licensing available
// ─────────────────────────────────────────────────────────────────────
#![deny(unsafe_code)]
//! Energy-guided self-modification of external systems.
//!
//! The loop never mutates anything it was not handed: targets implement
//! [`EvolutionTarget`] and every applied change is either confirmed
//! against its simulated ΔE or reverted and checksum-verified.

pub mod evolution;
pub mod recursion;
pub mod tuner;

pub use evolution::{
    snapshot_checksum, CandidateStatus, CommittedChange, CycleOutcome, CycleReport,
    EvolutionTarget, MetaCandidateChange, MetaEvolutionLoop,
};
pub use recursion::{logistic, MetaHamiltonian};
pub use tuner::{CouplingTuner, LambdaNudge};
