// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Error Hierarchy
// ─────────────────────────────────────────────────────────────────────

use thiserror::Error;

/// Root error type for all Hamilton Kernel failures.
///
/// Integrator and coupling faults abort the current run. Meta-loop and
/// decision-layer faults are recoverable and usually surface as warnings
/// inside a report instead of an `Err`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Energy or gradient evaluated to NaN/Inf at the given point.
    #[error("evaluation fault: {detail} at q={q:?}, p={p:?}")]
    EvaluationFault {
        detail: String,
        q: Vec<f64>,
        p: Vec<f64>,
    },

    /// Adaptive step control shrank dt below its floor.
    #[error("non-convergent: dt={dt:e} below dt_min={dt_min:e} at t={t} (drift {drift:e})")]
    NonConvergent {
        dt: f64,
        dt_min: f64,
        t: f64,
        drift: f64,
    },

    /// Coupling matrix is asymmetric, non-finite or missing a potential.
    #[error("malformed coupling: {0}")]
    MalformedCoupling(String),

    /// Predicted and realised energy deltas disagree beyond tolerance.
    #[error("simulation mismatch for '{change}': predicted ΔE={predicted}, actual ΔE={actual}")]
    SimulationMismatch {
        change: String,
        predicted: f64,
        actual: f64,
    },

    /// Amplitude vector became NaN or zero-norm.
    #[error("normalization fault: {0}")]
    NormalizationFault(String),

    /// Snapshot checksum after revert differs from the one taken before apply.
    #[error("rollback integrity violated for '{change}': {before} != {after}")]
    RollbackIntegrity {
        change: String,
        before: String,
        after: String,
    },

    /// Invalid input (dimensions, labels, parameters).
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Checkpoint or snapshot (de)serialisation failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl EngineError {
    /// Build an `EvaluationFault` carrying copies of the offending point.
    pub fn evaluation(detail: impl Into<String>, q: &[f64], p: &[f64]) -> Self {
        Self::EvaluationFault {
            detail: detail.into(),
            q: q.to_vec(),
            p: p.to_vec(),
        }
    }

    /// True for faults the caller may recover from without aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::SimulationMismatch { .. } | Self::NormalizationFault(_)
        )
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evaluation_fault_carries_point() {
        let err = EngineError::evaluation("energy is NaN", &[1.0, 2.0], &[0.5, 0.0]);
        match &err {
            EngineError::EvaluationFault { q, p, .. } => {
                assert_eq!(q, &vec![1.0, 2.0]);
                assert_eq!(p, &vec![0.5, 0.0]);
            }
            other => panic!("unexpected variant {other:?}"),
        }
        assert!(err.to_string().contains("energy is NaN"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(EngineError::NormalizationFault("zero norm".into()).is_recoverable());
        assert!(EngineError::SimulationMismatch {
            change: "x".into(),
            predicted: -1.0,
            actual: 0.5
        }
        .is_recoverable());
        assert!(!EngineError::MalformedCoupling("asymmetric".into()).is_recoverable());
    }
}
