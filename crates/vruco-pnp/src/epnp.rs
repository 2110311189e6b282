//! Efficient Perspective-n-Point (EPnP) solver
//! Paper: https://www.tugraz.at/fileadmin/user_upload/Institute/ICG/Images/team_lepetit/publications/lepetit_ijcv08.pdf
//! Reference: https://github.com/opencv/opencv/blob/4.x/modules/calib3d/src/epnp.cpp

use crate::ops::{compute_centroid, mat3_to_rows, reprojection_rmse, rotation_to_rvec};
use crate::rigid::umeyama;
use crate::types::{check_correspondences, NumericTol, PnPError, PnPResult, PnPSolver};
use glam::{DMat3, DVec3};
use nalgebra::{
    DMatrix, DVector, Matrix3, Matrix3x4, Matrix4, SMatrix, SVector, SymmetricEigen, Vector3,
    Vector4,
};

const CP_PAIRS: [(usize, usize); 6] = [(0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)];
const GN_ITERATIONS: usize = 6;
const GN_DAMPING: f64 = 1e-9;
const GN_STOP_EPS: f64 = 1e-12;
const CHOLESKY_EPS: f64 = 1e-14;

/// Marker type representing the Efficient PnP algorithm.
pub struct EPnP;

impl PnPSolver for EPnP {
    type Param = EPnPParams;

    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_epnp(world, image, k, params)
    }
}

/// Parameters controlling the EPnP solver.
#[derive(Debug, Clone, Default)]
pub struct EPnPParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
}

/// Solve Perspective-n-Point with EPnP.
///
/// # Arguments
/// * `world` – 3-D coordinates in the world frame, `N ≥ 4`.
/// * `image` – Corresponding undistorted pixel coordinates.
/// * `k` – Camera intrinsics matrix.
///
/// The candidate solutions (one per beta approximation, each refined with
/// Gauss-Newton) are scored by reprojection error and the best one is returned.
pub fn solve_epnp(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    params: &EPnPParams,
) -> Result<PnPResult, PnPError> {
    let n = check_correspondences(world, image, 4)?;

    let cw = select_control_points(world);
    let alphas = compute_barycentric(world, &cw, params.tol.eps);
    let m = build_m(&alphas, image, k);
    let null4 = null_space4(&m)?;

    let l = build_l6x10(&null4);
    let rho = DVector::from_column_slice(&rho_ctrlpts(&cw));

    let candidates = [
        estimate_beta_1(&l, &rho, params.tol.svd),
        estimate_beta_2(&l, &rho, params.tol.svd),
        estimate_beta_3(&l, &rho, params.tol.svd),
    ];

    let mut best: Option<(f64, DMat3, DVec3)> = None;
    for beta in candidates.into_iter().flatten() {
        let beta = gauss_newton(beta, &null4, &rho);
        let Some((r, t)) = pose_from_betas(&beta, &null4, &alphas, world) else {
            continue;
        };
        let err = reprojection_rmse(world, image, &r, t, k);
        if best.as_ref().map_or(true, |(e, _, _)| err < *e) {
            best = Some((err, r, t));
        }
    }

    let (err, r, t) = best.ok_or(PnPError::DegenerateConfiguration(
        "no beta approximation produced a pose",
    ))?;
    log::trace!("epnp pose from {n} points, rmse {err:.4} px");

    Ok(PnPResult {
        rotation: mat3_to_rows(&r),
        translation: t.to_array(),
        rvec: rotation_to_rvec(&r),
        reproj_rmse: Some(err),
        num_iterations: None,
        converged: Some(true),
    })
}

/// Centroid plus one control point along each principal axis, scaled by its spread.
fn select_control_points(world: &[[f64; 3]]) -> [DVec3; 4] {
    let c = compute_centroid(world);
    let mut cov = Matrix3::<f64>::zeros();
    for p in world {
        let d = DVec3::from(*p) - c;
        let d = Vector3::new(d.x, d.y, d.z);
        cov += d * d.transpose();
    }
    cov /= world.len() as f64;

    let eig = SymmetricEigen::new(cov);
    let mut axes: Vec<(f64, DVec3)> = (0..3)
        .map(|i| {
            let v = eig.eigenvectors.column(i);
            (eig.eigenvalues[i].max(0.0).sqrt(), DVec3::new(v[0], v[1], v[2]))
        })
        .collect();
    axes.sort_by(|a, b| b.0.total_cmp(&a.0));

    [
        c,
        c + axes[0].1 * axes[0].0,
        c + axes[1].1 * axes[1].0,
        c + axes[2].1 * axes[2].0,
    ]
}

/// Barycentric coordinates of each world point with respect to the control points.
///
/// Each row `[α0, α1, α2, α3]` sums to one and satisfies `pw = Σ αj cw_j`. When
/// the control tetrahedron is flat (planar input) a pseudo-inverse is used.
fn compute_barycentric(world: &[[f64; 3]], cw: &[DVec3; 4], eps: f64) -> Vec<[f64; 4]> {
    let b = DMat3::from_cols(cw[1] - cw[0], cw[2] - cw[0], cw[3] - cw[0]);

    let b_inv = if b.determinant().abs() > eps {
        b.inverse()
    } else {
        let nb = Matrix3::from_column_slice(&b.to_cols_array());
        let pinv = nb
            .pseudo_inverse(eps)
            .unwrap_or_else(|_| Matrix3::<f64>::zeros());
        DMat3::from_cols_slice(pinv.as_slice())
    };

    world
        .iter()
        .map(|p| {
            let l = b_inv * (DVec3::from(*p) - cw[0]);
            [1.0 - (l.x + l.y + l.z), l.x, l.y, l.z]
        })
        .collect()
}

/// The 2N×12 design matrix `M` whose null space holds the camera-frame control points.
fn build_m(alphas: &[[f64; 4]], image: &[[f64; 2]], k: &[[f64; 3]; 3]) -> DMatrix<f64> {
    let (fu, fv, uc, vc) = (k[0][0], k[1][1], k[0][2], k[1][2]);
    let mut m = DMatrix::<f64>::zeros(2 * alphas.len(), 12);
    for (i, (a, uv)) in alphas.iter().zip(image.iter()).enumerate() {
        for (j, &alpha) in a.iter().enumerate() {
            let base = 3 * j;
            m[(2 * i, base)] = alpha * fu;
            m[(2 * i, base + 2)] = alpha * (uc - uv[0]);
            m[(2 * i + 1, base + 1)] = alpha * fv;
            m[(2 * i + 1, base + 2)] = alpha * (vc - uv[1]);
        }
    }
    m
}

/// Eigenvectors of `MᵀM` for its four smallest eigenvalues, smallest first (12×4).
///
/// `MᵀM` is always 12×12, so this also works when `2N < 12`.
fn null_space4(m: &DMatrix<f64>) -> Result<DMatrix<f64>, PnPError> {
    let mtm = m.transpose() * m;
    let eig = SymmetricEigen::new(mtm);
    if eig.eigenvalues.iter().any(|v| !v.is_finite()) {
        return Err(PnPError::SvdFailed("eigen decomposition of MᵀM".to_string()));
    }
    let mut order: Vec<usize> = (0..12).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));

    let mut null4 = DMatrix::<f64>::zeros(12, 4);
    for (c, &idx) in order.iter().take(4).enumerate() {
        null4.set_column(c, &eig.eigenvectors.column(idx));
    }
    Ok(null4)
}

/// The 6×10 matrix `L` relating the quadratic beta terms to control point distances.
///
/// Columns follow `[b00, b01, b11, b02, b12, b22, b03, b13, b23, b33]`.
fn build_l6x10(null4: &DMatrix<f64>) -> SMatrix<f64, 6, 10> {
    let block = |v: usize, cp: usize| {
        Vector3::new(
            null4[(3 * cp, v)],
            null4[(3 * cp + 1, v)],
            null4[(3 * cp + 2, v)],
        )
    };

    let mut l = SMatrix::<f64, 6, 10>::zeros();
    for (row, &(a, b)) in CP_PAIRS.iter().enumerate() {
        let dv: [Vector3<f64>; 4] = std::array::from_fn(|v| block(v, a) - block(v, b));
        l[(row, 0)] = dv[0].dot(&dv[0]);
        l[(row, 1)] = 2.0 * dv[0].dot(&dv[1]);
        l[(row, 2)] = dv[1].dot(&dv[1]);
        l[(row, 3)] = 2.0 * dv[0].dot(&dv[2]);
        l[(row, 4)] = 2.0 * dv[1].dot(&dv[2]);
        l[(row, 5)] = dv[2].dot(&dv[2]);
        l[(row, 6)] = 2.0 * dv[0].dot(&dv[3]);
        l[(row, 7)] = 2.0 * dv[1].dot(&dv[3]);
        l[(row, 8)] = 2.0 * dv[2].dot(&dv[3]);
        l[(row, 9)] = dv[3].dot(&dv[3]);
    }
    l
}

/// Least-squares solve of `L[:, cols] x = rho`.
fn solve_subset(
    l: &SMatrix<f64, 6, 10>,
    cols: &[usize],
    rho: &DVector<f64>,
    tol_svd: f64,
) -> Option<DVector<f64>> {
    let mut sub = DMatrix::<f64>::zeros(6, cols.len());
    for (j, &c) in cols.iter().enumerate() {
        sub.set_column(j, &l.column(c));
    }
    let x = sub.svd(true, true).solve(rho, tol_svd).ok()?;
    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// All four betas from `[b00, b01, b02, b03]`.
fn estimate_beta_1(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_subset(l, &[0, 1, 3, 6], rho, tol)?;
    let b0 = x[0].abs().sqrt();
    if b0 <= 0.0 {
        return None;
    }
    let mut beta = [b0, x[1] / b0, x[2] / b0, x[3] / b0];
    if x[0] < 0.0 {
        beta.iter_mut().for_each(|v| *v = -*v);
    }
    Some(beta)
}

/// Two betas from `[b00, b01, b11]`.
fn estimate_beta_2(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_subset(l, &[0, 1, 2], rho, tol)?;
    let (b0, b1) = first_two_betas(x[0], x[1], x[2]);
    Some([b0, b1, 0.0, 0.0])
}

/// Three betas from `[b00, b01, b11, b02, b12]`.
fn estimate_beta_3(l: &SMatrix<f64, 6, 10>, rho: &DVector<f64>, tol: f64) -> Option<[f64; 4]> {
    let x = solve_subset(l, &[0, 1, 2, 3, 4], rho, tol)?;
    let (b0, b1) = first_two_betas(x[0], x[1], x[2]);
    if b0 == 0.0 {
        return None;
    }
    let b2 = x[3] / x[0].abs().sqrt();
    Some([b0, b1, b2, 0.0])
}

fn first_two_betas(b00: f64, b01: f64, b11: f64) -> (f64, f64) {
    let (mut b0, b1) = if b00 < 0.0 {
        ((-b00).sqrt(), if b11 < 0.0 { (-b11).sqrt() } else { 0.0 })
    } else {
        (b00.sqrt(), if b11 > 0.0 { b11.sqrt() } else { 0.0 })
    };
    if b01 < 0.0 {
        b0 = -b0;
    }
    (b0, b1)
}

/// Squared distances between every pair of control points.
fn rho_ctrlpts(cw: &[DVec3; 4]) -> [f64; 6] {
    CP_PAIRS.map(|(i, j)| cw[i].distance_squared(cw[j]))
}

/// Gauss-Newton refinement of the betas so the control point distances match `rho`.
fn gauss_newton(beta_init: [f64; 4], null4: &DMatrix<f64>, rho: &DVector<f64>) -> [f64; 4] {
    let mut bet = Vector4::from(beta_init);

    for _ in 0..GN_ITERATIONS {
        let blocks: [Matrix3x4<f64>; 4] =
            std::array::from_fn(|cp| null4.fixed_view::<3, 4>(3 * cp, 0).into_owned());
        let vs: [Vector3<f64>; 4] = std::array::from_fn(|cp| blocks[cp] * bet);

        let mut f = SVector::<f64, 6>::zeros();
        let mut j = SMatrix::<f64, 6, 4>::zeros();
        for (r, &(a, b)) in CP_PAIRS.iter().enumerate() {
            let diff = vs[a] - vs[b];
            f[r] = diff.norm_squared() - rho[r];
            let d_blocks = blocks[a] - blocks[b];
            for c in 0..4 {
                j[(r, c)] = 2.0 * diff.dot(&d_blocks.column(c));
            }
        }

        let mut a = j.transpose() * j;
        for i in 0..4 {
            a[(i, i)] += GN_DAMPING;
        }
        let b = j.transpose() * f;

        match solve_4x4_cholesky(&a, &b) {
            Some(delta) => {
                bet -= delta;
                if delta.norm() < GN_STOP_EPS {
                    break;
                }
            }
            None => break,
        }
    }

    bet.into()
}

/// Solve `A x = b` for a symmetric positive-definite 4×4 `A` with an unrolled Cholesky.
///
/// Returns `None` when `A` is not positive-definite.
#[inline(always)]
pub fn solve_4x4_cholesky(a: &Matrix4<f64>, b: &Vector4<f64>) -> Option<Vector4<f64>> {
    let l11 = a.m11.sqrt();
    if !l11.is_finite() || l11 < CHOLESKY_EPS {
        return None;
    }
    let l21 = a.m21 / l11;
    let l31 = a.m31 / l11;
    let l41 = a.m41 / l11;

    let l22_sq = a.m22 - l21 * l21;
    if l22_sq < CHOLESKY_EPS {
        return None;
    }
    let l22 = l22_sq.sqrt();
    let l32 = (a.m32 - l31 * l21) / l22;
    let l42 = (a.m42 - l41 * l21) / l22;

    let l33_sq = a.m33 - l31 * l31 - l32 * l32;
    if l33_sq < CHOLESKY_EPS {
        return None;
    }
    let l33 = l33_sq.sqrt();
    let l43 = (a.m43 - l41 * l31 - l42 * l32) / l33;

    let l44_sq = a.m44 - l41 * l41 - l42 * l42 - l43 * l43;
    if l44_sq < CHOLESKY_EPS {
        return None;
    }
    let l44 = l44_sq.sqrt();

    // forward: L y = b
    let y1 = b[0] / l11;
    let y2 = (b[1] - l21 * y1) / l22;
    let y3 = (b[2] - l31 * y1 - l32 * y2) / l33;
    let y4 = (b[3] - l41 * y1 - l42 * y2 - l43 * y3) / l44;

    // backward: Lᵀ x = y
    let x4 = y4 / l44;
    let x3 = (y3 - l43 * x4) / l33;
    let x2 = (y2 - l32 * x3 - l42 * x4) / l22;
    let x1 = (y1 - l21 * x2 - l31 * x3 - l41 * x4) / l11;
    Some(Vector4::new(x1, x2, x3, x4))
}

/// Camera-frame points from the betas, then the rigid transform aligning the world points to them.
fn pose_from_betas(
    beta: &[f64; 4],
    null4: &DMatrix<f64>,
    alphas: &[[f64; 4]],
    world: &[[f64; 3]],
) -> Option<(DMat3, DVec3)> {
    let cc_flat = null4 * Vector4::from(*beta);
    let mut cc: [DVec3; 4] =
        std::array::from_fn(|i| DVec3::new(cc_flat[3 * i], cc_flat[3 * i + 1], cc_flat[3 * i + 2]));

    let camera_point = |a: &[f64; 4], cc: &[DVec3; 4]| {
        a.iter()
            .zip(cc.iter())
            .fold(DVec3::ZERO, |acc, (&w, &c)| acc + c * w)
    };

    if camera_point(&alphas[0], &cc).z < 0.0 {
        cc.iter_mut().for_each(|c| *c = -*c);
    }

    let pc: Vec<DVec3> = alphas.iter().map(|a| camera_point(a, &cc)).collect();
    let pw: Vec<DVec3> = world.iter().map(|p| DVec3::from(*p)).collect();
    umeyama(&pw, &pc).ok()
}
