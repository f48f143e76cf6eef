// ─────────────────────────────────────────────────────────────────────
// Hamilton Kernel — Model Library
// ─────────────────────────────────────────────────────────────────────
//! Ready-made Hamiltonians with closed-form gradients, and the name
//! registry used to rebuild a model from a checkpoint descriptor.
//!
//! | name                  | H(q, p)                                        |
//! |-----------------------|------------------------------------------------|
//! | `harmonic_oscillator` | Σ p²/2m + ½mω²q²                                |
//! | `oscillator_chain`    | Σ p²/2m + ½k q² + ½k_c Σ (q_i − q_{i+1})²       |
//! | `pendulum`            | p²/(2ml²) + mgl(1 − cos q)                      |
//! | `kepler`              | |p|²/2 − μ/|q|  (planar)                        |
//! | `mean_reversion`      | p²/2λ + ½κ(q − q_eq)²                           |

use hamilton_types::{EngineError, EngineResult, ModelDescriptor};

use crate::hamiltonian::{param, HamiltonianModel};

/// Isotropic oscillator, any number of degrees of freedom.
pub fn harmonic_oscillator(mass: f64, omega: f64) -> HamiltonianModel {
    HamiltonianModel::new(
        "harmonic_oscillator",
        |_q, p, ps| p.iter().map(|v| v * v).sum::<f64>() / (2.0 * param(ps, "mass")),
        |q, _p, ps| {
            let k = param(ps, "mass") * param(ps, "omega").powi(2);
            0.5 * k * q.iter().map(|v| v * v).sum::<f64>()
        },
    )
    .with_param("mass", mass)
    .with_param("omega", omega)
    .with_grad_q(|q, _p, ps| {
        let k = param(ps, "mass") * param(ps, "omega").powi(2);
        q.iter().map(|v| k * v).collect()
    })
    .with_grad_p(|_q, p, ps| {
        let m = param(ps, "mass");
        p.iter().map(|v| v / m).collect()
    })
}

/// Fixed-end chain of `n` unit oscillators with nearest-neighbour springs.
pub fn oscillator_chain(n: usize, mass: f64, k: f64, k_c: f64) -> HamiltonianModel {
    HamiltonianModel::new(
        "oscillator_chain",
        |_q, p, ps| p.iter().map(|v| v * v).sum::<f64>() / (2.0 * param(ps, "mass")),
        |q, _p, ps| {
            let on_site: f64 = q.iter().map(|v| v * v).sum();
            let bonds: f64 = q.windows(2).map(|w| (w[0] - w[1]).powi(2)).sum();
            0.5 * param(ps, "k") * on_site + 0.5 * param(ps, "k_c") * bonds
        },
    )
    .with_dimension(n)
    .with_param("n", n as f64)
    .with_param("mass", mass)
    .with_param("k", k)
    .with_param("k_c", k_c)
    .with_grad_q(|q, _p, ps| {
        let (k, k_c) = (param(ps, "k"), param(ps, "k_c"));
        let last = q.len().saturating_sub(1);
        (0..q.len())
            .map(|i| {
                let mut g = k * q[i];
                if i > 0 {
                    g += k_c * (q[i] - q[i - 1]);
                }
                if i < last {
                    g += k_c * (q[i] - q[i + 1]);
                }
                g
            })
            .collect()
    })
    .with_grad_p(|_q, p, ps| {
        let m = param(ps, "mass");
        p.iter().map(|v| v / m).collect()
    })
}

/// Planar pendulum, q = angle from the downward vertical.
pub fn pendulum(mass: f64, length: f64, g: f64) -> HamiltonianModel {
    HamiltonianModel::new(
        "pendulum",
        |_q, p, ps| {
            let inertia = param(ps, "mass") * param(ps, "length").powi(2);
            p.iter().map(|v| v * v).sum::<f64>() / (2.0 * inertia)
        },
        |q, _p, ps| {
            let mgl = param(ps, "mass") * param(ps, "g") * param(ps, "length");
            q.iter().map(|th| mgl * (1.0 - th.cos())).sum()
        },
    )
    .with_param("mass", mass)
    .with_param("length", length)
    .with_param("g", g)
    .with_grad_q(|q, _p, ps| {
        let mgl = param(ps, "mass") * param(ps, "g") * param(ps, "length");
        q.iter().map(|th| mgl * th.sin()).collect()
    })
    .with_grad_p(|_q, p, ps| {
        let inertia = param(ps, "mass") * param(ps, "length").powi(2);
        p.iter().map(|v| v / inertia).collect()
    })
}

/// Reduced two-body problem in the plane. Singular at q = 0, where the
/// energy is non-finite and evaluation faults.
pub fn kepler(mu: f64) -> HamiltonianModel {
    HamiltonianModel::new(
        "kepler",
        |_q, p, _| 0.5 * p.iter().map(|v| v * v).sum::<f64>(),
        |q, _p, ps| -param(ps, "mu") / norm(q),
    )
    .with_param("mu", mu)
    .with_grad_q(|q, _p, ps| {
        let r = norm(q);
        let scale = param(ps, "mu") / (r * r * r);
        q.iter().map(|v| scale * v).collect()
    })
    .with_grad_p(|_q, p, _| p.to_vec())
}

/// Price as a coordinate with inertia λ (liquidity) pulled toward q_eq.
pub fn mean_reversion(liquidity: f64, kappa: f64, equilibrium: f64) -> HamiltonianModel {
    HamiltonianModel::new(
        "mean_reversion",
        |_q, p, ps| p.iter().map(|v| v * v).sum::<f64>() / (2.0 * param(ps, "liquidity")),
        |q, _p, ps| {
            let (kappa, eq) = (param(ps, "kappa"), param(ps, "equilibrium"));
            0.5 * kappa * q.iter().map(|v| (v - eq).powi(2)).sum::<f64>()
        },
    )
    .with_param("liquidity", liquidity)
    .with_param("kappa", kappa)
    .with_param("equilibrium", equilibrium)
    .with_grad_q(|q, _p, ps| {
        let (kappa, eq) = (param(ps, "kappa"), param(ps, "equilibrium"));
        q.iter().map(|v| kappa * (v - eq)).collect()
    })
    .with_grad_p(|_q, p, ps| {
        let lam = param(ps, "liquidity");
        p.iter().map(|v| v / lam).collect()
    })
}

#[inline]
fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

/// Names accepted by [`build`].
pub const LIBRARY: [&str; 5] = [
    "harmonic_oscillator",
    "oscillator_chain",
    "pendulum",
    "kepler",
    "mean_reversion",
];

/// Rebuild a library model from its descriptor.
pub fn build(desc: &ModelDescriptor) -> EngineResult<HamiltonianModel> {
    let model = match desc.name.as_str() {
        "harmonic_oscillator" => harmonic_oscillator(desc.param("mass")?, desc.param("omega")?),
        "oscillator_chain" => {
            let n = desc.param("n")?;
            if !(n >= 1.0 && n.fract() == 0.0) {
                return Err(EngineError::Validation(format!(
                    "oscillator_chain: n must be a positive integer, got {n}"
                )));
            }
            oscillator_chain(
                n as usize,
                desc.param("mass")?,
                desc.param("k")?,
                desc.param("k_c")?,
            )
        }
        "pendulum" => pendulum(desc.param("mass")?, desc.param("length")?, desc.param("g")?),
        "kepler" => kepler(desc.param("mu")?),
        "mean_reversion" => mean_reversion(
            desc.param("liquidity")?,
            desc.param("kappa")?,
            desc.param("equilibrium")?,
        ),
        other => {
            return Err(EngineError::Validation(format!(
                "unknown model '{other}' (library: {})",
                LIBRARY.join(", ")
            )))
        }
    };
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hamiltonian::GradientMethod;
    use hamilton_types::PhaseSpaceState;

    fn assert_gradients_consistent(model: &HamiltonianModel, q: &[f64], p: &[f64]) {
        for (a, f) in model
            .grad_q_with(q, p, GradientMethod::Analytic)
            .unwrap()
            .iter()
            .zip(&model.grad_q_with(q, p, GradientMethod::FiniteDifference).unwrap())
        {
            assert!((a - f).abs() < 1e-5, "{}: ∂H/∂q {a} vs {f}", model.name());
        }
        for (a, f) in model
            .grad_p_with(q, p, GradientMethod::Analytic)
            .unwrap()
            .iter()
            .zip(&model.grad_p_with(q, p, GradientMethod::FiniteDifference).unwrap())
        {
            assert!((a - f).abs() < 1e-5, "{}: ∂H/∂p {a} vs {f}", model.name());
        }
    }

    #[test]
    fn test_library_gradients_match_fd() {
        assert_gradients_consistent(&harmonic_oscillator(1.5, 0.7), &[0.3, -0.8], &[1.1, 0.2]);
        assert_gradients_consistent(
            &oscillator_chain(4, 1.0, 0.5, 0.2),
            &[0.1, -0.4, 0.9, 0.3],
            &[0.0, 0.5, -0.2, 0.1],
        );
        assert_gradients_consistent(&pendulum(2.0, 0.5, 9.81), &[0.6], &[0.3]);
        assert_gradients_consistent(&kepler(1.0), &[1.0, 0.5], &[0.0, 1.0]);
        assert_gradients_consistent(&mean_reversion(2.0, 0.8, 100.0), &[97.5], &[0.4]);
    }

    #[test]
    fn test_build_round_trips_every_library_model() {
        let models = [
            harmonic_oscillator(1.0, 2.0),
            oscillator_chain(3, 1.0, 1.0, 0.5),
            pendulum(1.0, 1.0, 9.81),
            kepler(2.0),
            mean_reversion(1.0, 0.5, 10.0),
        ];
        for m in &models {
            let rebuilt = build(&m.descriptor()).unwrap();
            assert_eq!(rebuilt.descriptor(), m.descriptor());
        }
    }

    #[test]
    fn test_chain_length_enforced_after_rebuild() {
        let chain = oscillator_chain(3, 1.0, 1.0, 0.5);
        let rebuilt = build(&chain.descriptor()).unwrap();
        assert_eq!(rebuilt.dimension(), Some(3));
        assert!(rebuilt.energy(&[0.1, 0.2, 0.3], &[0.0; 3]).is_ok());
        assert!(matches!(
            rebuilt.energy(&[0.1, 0.2], &[0.0; 2]),
            Err(EngineError::Validation(_))
        ));
        let wrong = PhaseSpaceState::at_rest(vec![0.5; 4]);
        assert!(rebuilt.energy_of(&wrong).is_err());
    }

    #[test]
    fn test_build_unknown_name_rejected() {
        let err = build(&ModelDescriptor::new("perpetual_motion")).unwrap_err();
        assert!(err.to_string().contains("perpetual_motion"));
    }

    #[test]
    fn test_build_missing_parameter_rejected() {
        let desc = ModelDescriptor::new("pendulum").with("mass", 1.0);
        assert!(build(&desc).is_err());
    }

    #[test]
    fn test_kepler_origin_faults() {
        assert!(matches!(
            kepler(1.0).energy(&[0.0, 0.0], &[1.0, 0.0]),
            Err(EngineError::EvaluationFault { .. })
        ));
    }

    #[test]
    fn test_mean_reversion_energy_zero_at_equilibrium() {
        let m = mean_reversion(1.0, 0.5, 42.0);
        assert_eq!(m.energy(&[42.0], &[0.0]).unwrap(), 0.0);
    }
}
