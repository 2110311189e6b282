//! Levenberg–Marquardt pose refinement for PnP solutions.

use crate::ops::{rvec_to_rotation, Projector};
use crate::types::{check_correspondences, PnPError};
use glam::DVec3;
use nalgebra::{DMatrix, DVector, Matrix6, Vector6};

/// Parameters controlling the LM pose refinement.
#[derive(Debug, Clone)]
pub struct LMParams {
    /// Maximum number of LM iterations.
    pub max_iters: usize,
    /// Convergence threshold on the decrease of the summed squared error.
    pub eps: f64,
    /// Initial damping factor (lambda).
    pub lambda_init: f64,
    /// Multiplicative factor to increase/decrease lambda.
    pub lambda_mul: f64,
}

impl Default for LMParams {
    fn default() -> Self {
        Self {
            max_iters: 20,
            eps: 1e-10,
            lambda_init: 1e-3,
            lambda_mul: 10.0,
        }
    }
}

/// Outcome of [`refine_pose_lm`].
#[derive(Debug, Clone, Copy)]
pub struct LMReport {
    /// Root-mean-square pixel error after refinement.
    pub rmse: f64,
    /// Iterations run.
    pub iterations: usize,
    /// Whether the error decrease fell below [`LMParams::eps`].
    pub converged: bool,
}

/// Refine a pose `(rvec, t)` with Levenberg–Marquardt to minimize pixel reprojection error.
///
/// `rvec` and `t` are updated in place. A step that would put any point behind
/// the camera is rejected like any other step that increases the error.
pub fn refine_pose_lm(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    rvec: &mut [f64; 3],
    t: &mut [f64; 3],
    params: &LMParams,
) -> Result<LMReport, PnPError> {
    let n = check_correspondences(world, image, 3)?;
    let projector = Projector::new(k);

    // residuals written in place; returns the summed squared error
    let residuals_at = |x: &Vector6<f64>, out: &mut DVector<f64>| -> f64 {
        let r = rvec_to_rotation(&[x[0], x[1], x[2]]);
        let t = DVec3::new(x[3], x[4], x[5]);
        let mut sum_sq = 0.0;
        for (i, (pw, uv)) in world.iter().zip(image.iter()).enumerate() {
            let Some(p) = projector.project(r * DVec3::from(*pw) + t) else {
                return f64::INFINITY;
            };
            let du = p[0] - uv[0];
            let dv = p[1] - uv[1];
            out[2 * i] = du;
            out[2 * i + 1] = dv;
            sum_sq += du.mul_add(du, dv * dv);
        }
        sum_sq
    };

    let mut x = Vector6::new(rvec[0], rvec[1], rvec[2], t[0], t[1], t[2]);
    let mut residuals = DVector::<f64>::zeros(2 * n);
    let mut scratch_p = DVector::<f64>::zeros(2 * n);
    let mut scratch_m = DVector::<f64>::zeros(2 * n);
    let mut jac = DMatrix::<f64>::zeros(2 * n, 6);

    let mut err_sq = residuals_at(&x, &mut residuals);
    if !err_sq.is_finite() {
        return Err(PnPError::DegenerateConfiguration(
            "initial pose puts points behind the camera",
        ));
    }

    let mut lambda = params.lambda_init;
    let mut iterations = 0;
    let mut converged = false;

    while iterations < params.max_iters {
        iterations += 1;

        const H_ROT: f64 = 1e-6;
        let t_scale = x[3].abs().max(x[4].abs()).max(x[5].abs()).max(1.0);
        let h_trans = 1e-6 * t_scale;

        // central differences
        let mut jac_ok = true;
        for c in 0..6 {
            let h = if c < 3 { H_ROT } else { h_trans };
            let mut x_p = x;
            let mut x_m = x;
            x_p[c] += h;
            x_m[c] -= h;
            let ep = residuals_at(&x_p, &mut scratch_p);
            let em = residuals_at(&x_m, &mut scratch_m);
            if !ep.is_finite() || !em.is_finite() {
                jac_ok = false;
                break;
            }
            jac.set_column(c, &((&scratch_p - &scratch_m) / (2.0 * h)));
        }
        if !jac_ok {
            break;
        }

        let jt = jac.transpose();
        let mut a: Matrix6<f64> = (&jt * &jac).fixed_view::<6, 6>(0, 0).into_owned();
        let g: Vector6<f64> = (&jt * &residuals).fixed_rows::<6>(0).into_owned();
        for d in 0..6 {
            a[(d, d)] += lambda;
        }

        let Some(delta) = a.lu().solve(&(-g)) else {
            lambda *= params.lambda_mul;
            continue;
        };

        let x_new = x + delta;
        let err_new = residuals_at(&x_new, &mut scratch_p);
        if err_new < err_sq {
            x = x_new;
            residuals.copy_from(&scratch_p);
            let decrease = err_sq - err_new;
            err_sq = err_new;
            lambda = (lambda / params.lambda_mul).max(1e-12);
            if decrease < params.eps {
                converged = true;
                break;
            }
        } else {
            lambda *= params.lambda_mul;
            if lambda > 1e12 {
                // no step can improve the error any more
                converged = true;
                break;
            }
        }
    }

    rvec.copy_from_slice(&x.as_slice()[0..3]);
    t.copy_from_slice(&x.as_slice()[3..6]);

    Ok(LMReport {
        rmse: (err_sq / n as f64).sqrt(),
        iterations,
        converged,
    })
}
