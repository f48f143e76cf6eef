// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Phase-Space Diagnostics
// ─────────────────────────────────────────────────────────────────────
//! Numerical checks on a model or a step map:
//!
//!   - Poisson bracket {f, g} = Σ_i ∂f/∂q_i ∂g/∂p_i − ∂f/∂p_i ∂g/∂q_i
//!   - Liouville ratio: det of the one-step Jacobian, ≈ 1 for symplectic maps
//!   - Equilibrium search: gradient descent on V with p = 0
//!   - Relative energy drift over a recorded series

use serde::{Deserialize, Serialize};

use hamilton_types::{EngineError, EngineResult, PhaseSpaceState, Scheme};

use crate::hamiltonian::HamiltonianModel;
use crate::integrator::advance;

/// Largest |E_k − E_0| / |E_0| in `energies` (absolute drift when E_0 = 0).
pub fn max_relative_drift(energies: &[f64]) -> f64 {
    let Some(&e0) = energies.first() else {
        return 0.0;
    };
    let scale = if e0 == 0.0 { 1.0 } else { e0.abs() };
    energies
        .iter()
        .map(|e| (e - e0).abs() / scale)
        .fold(0.0, f64::max)
}

/// {f, g} at `state` by central differences with step `h`.
pub fn poisson_bracket<F, G>(f: F, g: G, state: &PhaseSpaceState, h: f64) -> EngineResult<f64>
where
    F: Fn(&[f64], &[f64]) -> f64,
    G: Fn(&[f64], &[f64]) -> f64,
{
    state.validate()?;
    let mut q = state.q.clone();
    let mut p = state.p.clone();
    let mut bracket = 0.0;
    for i in 0..q.len() {
        let q0 = q[i];
        q[i] = q0 + h;
        let (fq_plus, gq_plus) = (f(&q, &p), g(&q, &p));
        q[i] = q0 - h;
        let (fq_minus, gq_minus) = (f(&q, &p), g(&q, &p));
        q[i] = q0;

        let p0 = p[i];
        p[i] = p0 + h;
        let (fp_plus, gp_plus) = (f(&q, &p), g(&q, &p));
        p[i] = p0 - h;
        let (fp_minus, gp_minus) = (f(&q, &p), g(&q, &p));
        p[i] = p0;

        let df_dq = (fq_plus - fq_minus) / (2.0 * h);
        let dg_dq = (gq_plus - gq_minus) / (2.0 * h);
        let df_dp = (fp_plus - fp_minus) / (2.0 * h);
        let dg_dp = (gp_plus - gp_minus) / (2.0 * h);
        bracket += df_dq * dg_dp - df_dp * dg_dq;
    }
    if !bracket.is_finite() {
        return Err(EngineError::evaluation(
            "Poisson bracket is not finite",
            &state.q,
            &state.p,
        ));
    }
    Ok(bracket)
}

/// Determinant of ∂(q', p')/∂(q, p) for one step of size `dt`.
///
/// Symplectic schemes give 1 up to finite-difference error; an explicit
/// Euler step on the oscillator gives 1 + dt².
pub fn phase_volume_ratio(
    model: &HamiltonianModel,
    state: &PhaseSpaceState,
    dt: f64,
    scheme: Scheme,
    h: f64,
) -> EngineResult<f64> {
    state.validate()?;
    let n = state.ndof();
    let dim = 2 * n;
    let step = |s: &PhaseSpaceState| -> EngineResult<Vec<f64>> {
        let mut next = s.clone();
        advance(model, &mut next, dt, scheme)?;
        Ok([next.q, next.p].concat())
    };

    // Column c of the Jacobian = ∂(image)/∂x_c.
    let mut jac = vec![vec![0.0; dim]; dim];
    for c in 0..dim {
        let mut plus = state.clone();
        let mut minus = state.clone();
        if c < n {
            plus.q[c] += h;
            minus.q[c] -= h;
        } else {
            plus.p[c - n] += h;
            minus.p[c - n] -= h;
        }
        let (fp, fm) = (step(&plus)?, step(&minus)?);
        for r in 0..dim {
            jac[r][c] = (fp[r] - fm[r]) / (2.0 * h);
        }
    }
    Ok(determinant(jac))
}

/// Gaussian elimination with partial pivoting.
fn determinant(mut a: Vec<Vec<f64>>) -> f64 {
    let n = a.len();
    let mut det = 1.0;
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| a[i][col].abs().total_cmp(&a[j][col].abs()))
            .unwrap_or(col);
        if a[pivot][col] == 0.0 {
            return 0.0;
        }
        if pivot != col {
            a.swap(pivot, col);
            det = -det;
        }
        det *= a[col][col];
        for row in (col + 1)..n {
            let factor = a[row][col] / a[col][col];
            for k in col..n {
                a[row][k] -= factor * a[col][k];
            }
        }
    }
    det
}

/// Result of an equilibrium search.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Equilibrium {
    pub q: Vec<f64>,
    pub energy: f64,
    pub gradient_norm: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Minimise H(q, 0) by gradient descent from `q0`.
pub fn find_equilibrium(
    model: &HamiltonianModel,
    q0: &[f64],
    learning_rate: f64,
    max_iter: usize,
    tol: f64,
) -> EngineResult<Equilibrium> {
    if !(learning_rate > 0.0 && learning_rate.is_finite()) {
        return Err(EngineError::Validation(format!(
            "learning_rate must be finite and > 0, got {learning_rate}"
        )));
    }
    let p = vec![0.0; q0.len()];
    let mut q = q0.to_vec();
    let mut grad_norm = f64::INFINITY;
    let mut iterations = 0;
    while iterations < max_iter {
        let g = model.grad_q(&q, &p)?;
        grad_norm = g.iter().map(|v| v * v).sum::<f64>().sqrt();
        if grad_norm < tol {
            break;
        }
        for (qi, gi) in q.iter_mut().zip(&g) {
            *qi -= learning_rate * gi;
        }
        iterations += 1;
    }
    let energy = model.energy(&q, &p)?;
    let converged = grad_norm < tol;
    if !converged {
        log::warn!(
            "{}: equilibrium search stopped after {iterations} iterations, |∇V|={grad_norm:.3e}",
            model.name()
        );
    }
    Ok(Equilibrium {
        q,
        energy,
        gradient_norm: grad_norm,
        iterations,
        converged,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models;

    #[test]
    fn test_canonical_bracket_is_one() {
        let s = PhaseSpaceState::new(vec![0.3], vec![-1.2]).unwrap();
        let b = poisson_bracket(|q, _p| q[0], |_q, p| p[0], &s, 1e-5).unwrap();
        assert!((b - 1.0).abs() < 1e-9, "{{q, p}} = {b}");
    }

    #[test]
    fn test_energy_is_conserved_by_its_own_flow() {
        let model = models::pendulum(1.0, 1.0, 9.81);
        let s = PhaseSpaceState::new(vec![0.4], vec![0.7]).unwrap();
        let h = |q: &[f64], p: &[f64]| model.energy(q, p).unwrap_or(f64::NAN);
        let b = poisson_bracket(h, h, &s, 1e-5).unwrap();
        assert!(b.abs() < 1e-6, "{{H, H}} = {b}");
    }

    #[test]
    fn test_leapfrog_preserves_phase_volume() {
        let model = models::pendulum(1.0, 1.0, 9.81);
        let s = PhaseSpaceState::new(vec![1.0], vec![0.5]).unwrap();
        for scheme in [Scheme::Leapfrog, Scheme::Yoshida4] {
            let ratio = phase_volume_ratio(&model, &s, 0.05, scheme, 1e-6).unwrap();
            assert!((ratio - 1.0).abs() < 1e-6, "{scheme:?}: det J = {ratio}");
        }
    }

    #[test]
    fn test_coupled_chain_preserves_phase_volume() {
        let model = models::oscillator_chain(3, 1.0, 1.0, 0.4);
        let s = PhaseSpaceState::new(vec![0.2, -0.1, 0.5], vec![0.0, 0.3, -0.2]).unwrap();
        let ratio = phase_volume_ratio(&model, &s, 0.01, Scheme::Leapfrog, 1e-6).unwrap();
        assert!((ratio - 1.0).abs() < 1e-6, "det J = {ratio}");
    }

    #[test]
    fn test_determinant_small_matrices() {
        assert_eq!(determinant(vec![vec![2.0, 0.0], vec![0.0, 3.0]]), 6.0);
        assert_eq!(determinant(vec![vec![0.0, 1.0], vec![1.0, 0.0]]), -1.0);
        assert_eq!(determinant(vec![vec![1.0, 2.0], vec![2.0, 4.0]]), 0.0);
    }

    #[test]
    fn test_find_equilibrium_mean_reversion() {
        let model = models::mean_reversion(1.0, 0.5, 100.0);
        let eq = find_equilibrium(&model, &[90.0], 0.5, 10_000, 1e-10).unwrap();
        assert!(eq.converged);
        assert!((eq.q[0] - 100.0).abs() < 1e-8, "q*={}", eq.q[0]);
        assert!(eq.energy.abs() < 1e-12);
    }

    #[test]
    fn test_find_equilibrium_reports_non_convergence() {
        let model = models::harmonic_oscillator(1.0, 1.0);
        let eq = find_equilibrium(&model, &[5.0], 1e-3, 3, 1e-12).unwrap();
        assert!(!eq.converged);
        assert_eq!(eq.iterations, 3);
    }

    #[test]
    fn test_drift_of_constant_series_is_zero() {
        assert_eq!(max_relative_drift(&[2.0, 2.0, 2.0]), 0.0);
        assert!((max_relative_drift(&[2.0, 2.1, 1.8]) - 0.1).abs() < 1e-12);
        assert_eq!(max_relative_drift(&[]), 0.0);
    }
}
