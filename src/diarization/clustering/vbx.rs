//! VBx speaker assignment refinement
//!
//! Variational Bayes EM over PLDA-projected rho vectors, warm-started from
//! the AHC hard labels. Follows the BUT Speech@FIT formulation: a diagonal
//! PLDA covariance psi, acoustic/speaker scaling factors Fa and Fb, and an
//! ELBO trace used for convergence.

use crate::error::DiarizationError;
use ndarray::{Array1, Array2, Axis};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Temperature applied when smoothing the one-hot warm-start labels.
const INIT_TEMPERATURE: f64 = 7.0;

/// Floor applied to psi entries.
const PSI_FLOOR: f64 = 1e-12;

/// EM loop parameters.
#[derive(Debug, Clone, Copy)]
pub struct VbxOptions {
    pub fa: f64,
    pub fb: f64,
    pub max_iterations: usize,
    pub convergence_tolerance: f64,
}

/// Soft assignments and mixture weights after refinement.
#[derive(Debug, Clone)]
pub struct VbxResult {
    /// `N x S` responsibilities; rows sum to 1
    pub gamma: Array2<f64>,

    /// Mixture weights; sums to 1
    pub pi: Vec<f64>,

    /// Per-row argmax of gamma
    pub labels: Vec<usize>,

    /// ELBO value per iteration
    pub elbo_trace: Vec<f64>,

    /// Whether a psi dimension mismatch forced the unit fallback
    pub psi_fallback: bool,
}

/// Refine AHC labels over the rho matrix.
///
/// `psi` is the PLDA diagonal; a length mismatch against the rho dimension
/// falls back to a unit diagonal with a warning rather than failing.
/// Cancellation is observed at every EM iteration boundary.
pub fn refine(
    rho: &Array2<f64>,
    init_labels: &[usize],
    psi: &[f64],
    options: &VbxOptions,
    cancel: &CancellationToken,
) -> Result<VbxResult, DiarizationError> {
    let n = rho.nrows();
    let dim = rho.ncols();
    if n == 0 || init_labels.len() != n {
        return Err(DiarizationError::processing(format!(
            "VBx input mismatch: {} rho rows, {} labels",
            n,
            init_labels.len()
        )));
    }
    if rho.iter().any(|v| !v.is_finite()) {
        return Err(DiarizationError::processing(
            "VBx input contains non-finite values",
        ));
    }

    let speakers = init_labels.iter().copied().max().unwrap_or(0) + 1;
    let (fa, fb) = (options.fa, options.fb);

    let mut psi_fallback = false;
    let psi_clamped: Array1<f64> = if psi.len() == dim {
        Array1::from_iter(psi.iter().map(|&v| v.max(PSI_FLOOR)))
    } else {
        warn!(
            "psi dimension {} does not match rho dimension {}; using unit diagonal",
            psi.len(),
            dim
        );
        psi_fallback = true;
        Array1::ones(dim)
    };
    let sqrt_psi = psi_clamped.mapv(f64::sqrt);

    // Precompute scaled features and the per-row Gaussian baseline.
    let mut rho_scaled = rho.clone();
    for mut row in rho_scaled.rows_mut() {
        for (v, s) in row.iter_mut().zip(sqrt_psi.iter()) {
            *v *= s;
        }
    }
    let ln_2pi = (2.0 * std::f64::consts::PI).ln();
    let baseline: Vec<f64> = rho
        .rows()
        .into_iter()
        .map(|row| -0.5 * (row.iter().map(|v| v * v).sum::<f64>() + dim as f64 * ln_2pi))
        .collect();

    // One-hot init smoothed by a tempered softmax; degenerate rows reset to
    // uniform.
    let mut gamma = Array2::zeros((n, speakers));
    for (t, &label) in init_labels.iter().enumerate() {
        let mut row: Vec<f64> = (0..speakers)
            .map(|s| if s == label { INIT_TEMPERATURE } else { 0.0 })
            .collect();
        let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let mut total = 0.0;
        for v in &mut row {
            *v = (*v - max).exp();
            total += *v;
        }
        if !total.is_finite() || total <= 0.0 {
            row.fill(1.0 / speakers as f64);
        } else {
            for v in &mut row {
                *v /= total;
            }
        }
        for (s, &v) in row.iter().enumerate() {
            gamma[[t, s]] = v;
        }
    }

    let mut pi = vec![1.0 / speakers as f64; speakers];
    let mut elbo_trace: Vec<f64> = Vec::with_capacity(options.max_iterations);

    for iteration in 1..=options.max_iterations {
        if cancel.is_cancelled() {
            return Err(DiarizationError::Cancelled);
        }

        // Speaker occupancies and posterior precision.
        let occupancy = gamma.sum_axis(Axis(0));
        let mut inv_l = Array2::zeros((speakers, dim));
        for s in 0..speakers {
            for d in 0..dim {
                inv_l[[s, d]] = 1.0 / (1.0 + (fa / fb) * occupancy[s] * psi_clamped[d]);
            }
        }

        // Posterior speaker means in the scaled space.
        let moment = gamma.t().dot(&rho_scaled);
        let mut alpha = Array2::zeros((speakers, dim));
        for s in 0..speakers {
            for d in 0..dim {
                alpha[[s, d]] = (fa / fb) * inv_l[[s, d]] * moment[[s, d]];
            }
        }

        let mut phi = vec![0.0f64; speakers];
        for s in 0..speakers {
            phi[s] = (0..dim)
                .map(|d| psi_clamped[d] * (alpha[[s, d]] * alpha[[s, d]] + inv_l[[s, d]]))
                .sum();
        }

        // Per-row log posterior and responsibility update.
        let projection = rho_scaled.dot(&alpha.t());
        let mut log_likelihood = 0.0f64;
        for t in 0..n {
            let mut row: Vec<f64> = (0..speakers)
                .map(|s| {
                    fa * (projection[[t, s]] - 0.5 * phi[s] + baseline[t]) + pi[s].max(f64::MIN_POSITIVE).ln()
                })
                .collect();
            let max = row.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            let mut total = 0.0;
            for v in &mut row {
                *v = (*v - max).exp();
                total += *v;
            }
            if !total.is_finite() || total <= 0.0 {
                for s in 0..speakers {
                    gamma[[t, s]] = 1.0 / speakers as f64;
                }
                continue;
            }
            log_likelihood += max + total.ln();
            for s in 0..speakers {
                gamma[[t, s]] = row[s] / total;
            }
        }

        // Mixture weight update with a uniform fallback on degeneracy.
        let weights = gamma.sum_axis(Axis(0));
        let total: f64 = weights.sum();
        if total.is_finite() && total > 0.0 {
            for s in 0..speakers {
                pi[s] = weights[s] / total;
            }
        } else {
            debug!("pi degenerated at iteration {}; reset to uniform", iteration);
            pi.fill(1.0 / speakers as f64);
        }

        let elbo = log_likelihood
            + 0.5
                * fb
                * (inv_l.iter().map(|v| v.ln()).sum::<f64>()
                    - inv_l.sum()
                    - alpha.iter().map(|v| v * v).sum::<f64>()
                    + (speakers * dim) as f64);
        debug!("VBx iteration {}: ELBO {:.6}", iteration, elbo);

        let converged = elbo_trace
            .last()
            .map(|prev| (elbo - prev).abs() < options.convergence_tolerance)
            .unwrap_or(false);
        elbo_trace.push(elbo);
        if converged {
            break;
        }
    }

    let labels = gamma
        .rows()
        .into_iter()
        .map(|row| {
            row.iter()
                .enumerate()
                .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
                .map(|(s, _)| s)
                .unwrap_or(0)
        })
        .collect();

    Ok(VbxResult {
        gamma,
        pi,
        labels,
        elbo_trace,
        psi_fallback,
    })
}
