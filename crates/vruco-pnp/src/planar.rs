//! Plane-based pose estimation
//!
//! Estimates the pose of a planar point set (one or more coplanar markers) by
//! fitting a DLT homography between the plane and the normalized image, then
//! decomposing it into a rotation and translation. Marker squares go through
//! [`solve_square`], which uses the canonical corner layout.

use crate::ops::{compute_centroid, mat3_to_rows, reprojection_rmse, rotation_to_rvec};
use crate::types::{check_correspondences, NumericTol, PnPError, PnPResult, PnPSolver};
use glam::{DMat3, DVec3};
use nalgebra::{DMatrix, Matrix3, SymmetricEigen, Vector3};

/// Marker type for the homography-based planar solver.
pub struct Planar;

impl PnPSolver for Planar {
    type Param = PlanarParams;

    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError> {
        solve_planar(world, image, k, params)
    }
}

/// Parameters controlling the planar solver.
#[derive(Debug, Clone)]
pub struct PlanarParams {
    /// Shared numeric tolerances.
    pub tol: NumericTol,
    /// Largest ratio between the out-of-plane and the dominant in-plane spread
    /// for which a point set still counts as planar.
    pub planarity_ratio: f64,
}

impl Default for PlanarParams {
    fn default() -> Self {
        Self {
            tol: NumericTol::default(),
            planarity_ratio: 1e-3,
        }
    }
}

/// Principal-axis frame of a point set: centroid plus an orthonormal basis
/// sorted by decreasing spread.
#[derive(Debug, Clone)]
pub(crate) struct PlaneFrame {
    pub(crate) centroid: DVec3,
    /// Columns are the in-plane axes and the plane normal; `det = +1`.
    pub(crate) axes: DMat3,
    /// Standard deviations along `axes`, largest first.
    pub(crate) sigmas: [f64; 3],
}

impl PlaneFrame {
    pub(crate) fn fit(points: &[[f64; 3]]) -> Result<Self, PnPError> {
        let centroid = compute_centroid(points);
        let mut cov = Matrix3::<f64>::zeros();
        for p in points {
            let d = DVec3::from(*p) - centroid;
            let d = Vector3::new(d.x, d.y, d.z);
            cov += d * d.transpose();
        }
        cov /= points.len() as f64;

        let eig = SymmetricEigen::new(cov);
        let mut order = [0usize, 1, 2];
        order.sort_by(|&a, &b| eig.eigenvalues[b].total_cmp(&eig.eigenvalues[a]));

        let axis = |i: usize| {
            let c = eig.eigenvectors.column(order[i]);
            DVec3::new(c[0], c[1], c[2]).normalize()
        };
        let e1 = axis(0);
        let e2 = axis(1);
        let normal = e1.cross(e2);
        let sigmas = order.map(|i| eig.eigenvalues[i].max(0.0).sqrt());

        if !e1.is_finite() || !e2.is_finite() {
            return Err(PnPError::SvdFailed(
                "eigen decomposition of the point covariance".to_string(),
            ));
        }

        Ok(Self {
            centroid,
            axes: DMat3::from_cols(e1, e2, normal),
            sigmas,
        })
    }

    /// Ratio between the out-of-plane and the dominant in-plane spread.
    pub(crate) fn flatness(&self) -> f64 {
        if self.sigmas[0] <= 0.0 {
            return f64::INFINITY;
        }
        self.sigmas[2] / self.sigmas[0]
    }
}

/// Whether the points are coplanar within `ratio` (see [`PlanarParams::planarity_ratio`]).
pub fn is_planar(points: &[[f64; 3]], ratio: f64) -> bool {
    points.len() >= 3
        && PlaneFrame::fit(points)
            .map(|frame| frame.flatness() <= ratio)
            .unwrap_or(false)
}

/// The four corners of a square marker of side `side`, centred on the origin
/// of the `z = 0` plane, in marker winding order (top-left, top-right,
/// bottom-right, bottom-left with `+y` up).
pub fn square_object_points(side: f64) -> [[f64; 3]; 4] {
    let h = side / 2.0;
    [[-h, h, 0.0], [h, h, 0.0], [h, -h, 0.0], [-h, -h, 0.0]]
}

/// Estimate the pose of a square marker from its four undistorted pixel corners.
pub fn solve_square(
    image: &[[f64; 2]; 4],
    k: &[[f64; 3]; 3],
    side: f64,
) -> Result<PnPResult, PnPError> {
    solve_planar(&square_object_points(side), image, k, &PlanarParams::default())
}

/// Solve the pose of a coplanar point set from at least four correspondences.
pub fn solve_planar(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    params: &PlanarParams,
) -> Result<PnPResult, PnPError> {
    let n = check_correspondences(world, image, 4)?;

    let frame = PlaneFrame::fit(world)?;
    if frame.sigmas[1] <= 1e-6 * frame.sigmas[0] {
        return Err(PnPError::DegenerateConfiguration("world points are collinear"));
    }

    // plane coordinates of the world points
    let plane: Vec<[f64; 2]> = world
        .iter()
        .map(|p| {
            let d = DVec3::from(*p) - frame.centroid;
            [d.dot(frame.axes.x_axis), d.dot(frame.axes.y_axis)]
        })
        .collect();

    // normalized image coordinates (K^-1 * uv)
    let (fx, fy, cx, cy, skew) = (k[0][0], k[1][1], k[0][2], k[1][2], k[0][1]);
    let norm: Vec<[f64; 2]> = image
        .iter()
        .map(|uv| {
            let y = (uv[1] - cy) / fy;
            [(uv[0] - cx - skew * y) / fx, y]
        })
        .collect();

    let h = homography_dlt(&plane, &norm, params.tol.eps)?;

    // decompose H ~ [r1 r2 t] (K = I since points are normalized)
    let h1 = h.column(0).into_owned();
    let h2 = h.column(1).into_owned();
    let h3 = h.column(2).into_owned();
    let norm_prod = (h1.norm() * h2.norm()).sqrt();
    if norm_prod < params.tol.eps {
        return Err(PnPError::DegenerateConfiguration("homography has vanishing columns"));
    }
    let mut lambda = 1.0 / norm_prod;
    if h3[2] * lambda < 0.0 {
        // the plane must lie in front of the camera
        lambda = -lambda;
    }
    let r1 = h1 * lambda;
    let r2 = h2 * lambda;
    let r3 = r1.cross(&r2);
    let t_plane = h3 * lambda;

    let approx = Matrix3::from_columns(&[r1, r2, r3]);
    let svd = approx.svd(true, true);
    let (u, v_t) = match (svd.u, svd.v_t) {
        (Some(u), Some(v_t)) => (u, v_t),
        _ => return Err(PnPError::SvdFailed("rotation orthonormalization".to_string())),
    };
    let mut d = Matrix3::<f64>::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r_plane = u * d * v_t;
    let r_plane = DMat3::from_cols_slice(r_plane.as_slice());
    let t_plane = DVec3::new(t_plane[0], t_plane[1], t_plane[2]);

    // p_cam = R_plane * axes^T * (p - c) + t_plane
    let r = r_plane * frame.axes.transpose();
    let t = t_plane - r * frame.centroid;

    let rmse = reprojection_rmse(world, image, &r, t, k);
    log::trace!("planar pose from {n} points, rmse {rmse:.4} px");

    Ok(PnPResult {
        rotation: mat3_to_rows(&r),
        translation: t.to_array(),
        rvec: rotation_to_rvec(&r),
        reproj_rmse: Some(rmse),
        num_iterations: None,
        converged: Some(true),
    })
}

/// Normalized DLT homography mapping `src` plane points onto `dst` points.
fn homography_dlt(
    src: &[[f64; 2]],
    dst: &[[f64; 2]],
    eps: f64,
) -> Result<Matrix3<f64>, PnPError> {
    let (t_src, src_n) = normalize_points(src);
    let (t_dst, dst_n) = normalize_points(dst);

    // at least 9 rows so the null vector is part of the decomposition
    let rows = (2 * src.len()).max(9);
    let mut a = DMatrix::<f64>::zeros(rows, 9);
    for (i, (s, d)) in src_n.iter().zip(dst_n.iter()).enumerate() {
        let (x, y) = (s[0], s[1]);
        let (u, v) = (d[0], d[1]);
        let r0 = 2 * i;
        let r1 = r0 + 1;
        a[(r0, 0)] = x;
        a[(r0, 1)] = y;
        a[(r0, 2)] = 1.0;
        a[(r0, 6)] = -u * x;
        a[(r0, 7)] = -u * y;
        a[(r0, 8)] = -u;
        a[(r1, 3)] = x;
        a[(r1, 4)] = y;
        a[(r1, 5)] = 1.0;
        a[(r1, 6)] = -v * x;
        a[(r1, 7)] = -v * y;
        a[(r1, 8)] = -v;
    }

    let svd = a.svd(false, true);
    let v_t = svd
        .v_t
        .ok_or_else(|| PnPError::SvdFailed("homography DLT".to_string()))?;
    let smallest = svd
        .singular_values
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .ok_or_else(|| PnPError::SvdFailed("homography DLT".to_string()))?;
    let h = v_t.row(smallest);
    let h_n = Matrix3::new(h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], h[8]);

    let t_dst_inv = t_dst
        .try_inverse()
        .ok_or(PnPError::DegenerateConfiguration("image points coincide"))?;
    let h = t_dst_inv * h_n * t_src;
    if h.determinant().abs() < eps {
        return Err(PnPError::DegenerateConfiguration("homography is singular"));
    }
    Ok(h)
}

/// Hartley normalization: centroid to the origin, mean distance sqrt(2).
fn normalize_points(points: &[[f64; 2]]) -> (Matrix3<f64>, Vec<[f64; 2]>) {
    let n = points.len() as f64;
    let (sx, sy) = points
        .iter()
        .fold((0.0, 0.0), |acc, p| (acc.0 + p[0], acc.1 + p[1]));
    let (mx, my) = (sx / n, sy / n);
    let mean_dist = points
        .iter()
        .map(|p| ((p[0] - mx).powi(2) + (p[1] - my).powi(2)).sqrt())
        .sum::<f64>()
        / n;
    let s = if mean_dist > 0.0 {
        std::f64::consts::SQRT_2 / mean_dist
    } else {
        1.0
    };
    let t = Matrix3::new(s, 0.0, -s * mx, 0.0, s, -s * my, 0.0, 0.0, 1.0);
    let normalized = points
        .iter()
        .map(|p| [s * (p[0] - mx), s * (p[1] - my)])
        .collect();
    (t, normalized)
}
