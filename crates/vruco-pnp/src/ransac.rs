//! RANSAC-based robust wrapper for PnP solvers.

use crate::camera::CameraModel;
use crate::ops::{all_positive_depths, pose_to_rt, rvec_to_rotation, Projector};
use crate::planar::is_planar;
use crate::refine::{refine_pose_lm, LMParams};
use crate::types::{check_correspondences, PnPError, PnPResult, PoseSeed};
use crate::{solve_pnp, PnPMethod};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

/// Parameters for RANSAC over PnP.
#[derive(Debug, Clone)]
pub struct RansacParams {
    /// Maximum number of RANSAC iterations.
    pub max_iterations: usize,
    /// Pixel error threshold to classify an observation as an inlier.
    pub reproj_threshold_px: f64,
    /// Desired probability that at least one sample set is outlier-free.
    pub confidence: f64,
    /// Optional fixed seed for reproducible sampling.
    pub random_seed: Option<u64>,
    /// Whether to refit on all inliers and polish the result with LM.
    pub refine: bool,
}

impl Default for RansacParams {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            reproj_threshold_px: 8.0,
            confidence: 0.99,
            random_seed: None,
            refine: true,
        }
    }
}

/// RANSAC result for PnP.
#[derive(Debug, Clone)]
pub struct PnPRansacResult {
    /// Best pose found by RANSAC.
    pub pose: PnPResult,
    /// Indices of inlier correspondences.
    pub inliers: Vec<usize>,
}

/// Solve PnP robustly with a RANSAC loop around a base method.
///
/// - Minimal sample size is 4 for the planar solver and 5 for EPnP (4 when only 4 points exist).
/// - Scoring uses Euclidean pixel reprojection error.
/// - Iterations adapt from the current inlier ratio and the desired confidence.
/// - When `seed` is given (typically the previous frame's pose) it is also refined
///   on the consensus set and wins if it reprojects better.
pub fn solve_pnp_ransac(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    base: PnPMethod,
    params: &RansacParams,
    seed: Option<&PoseSeed>,
) -> Result<PnPRansacResult, PnPError> {
    let n = check_correspondences(world, image, 4)?;

    let base = match base {
        PnPMethod::Auto => {
            if is_planar(world, crate::PlanarParams::default().planarity_ratio) {
                PnPMethod::PlanarDefault
            } else {
                PnPMethod::EPnPDefault
            }
        }
        other => other,
    };
    let sample_size = match base {
        PnPMethod::Planar(_) | PnPMethod::PlanarDefault => 4,
        _ if n == 4 => 4,
        _ => 5,
    };

    let projector = Projector::new(k);

    let mut rng: StdRng = match params.random_seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_os_rng(),
    };

    let mut indices: Vec<usize> = (0..n).collect();
    let mut best_inliers: Vec<usize> = Vec::new();
    let mut best_pose: Option<PnPResult> = None;

    let mut iter = 0usize;
    let mut required_iters = params.max_iterations;
    let mut w_min: Vec<[f64; 3]> = Vec::with_capacity(sample_size);
    let mut i_min: Vec<[f64; 2]> = Vec::with_capacity(sample_size);

    while iter < required_iters {
        iter += 1;

        indices.shuffle(&mut rng);
        w_min.clear();
        i_min.clear();
        for &idx in &indices[..sample_size] {
            w_min.push(world[idx]);
            i_min.push(image[idx]);
        }

        let pose_min = match solve_pnp(&w_min, &i_min, k, base.clone()) {
            Ok(p) => p,
            Err(e) => {
                log::trace!("ransac iteration {iter}: minimal solve failed: {e}");
                continue;
            }
        };

        let (r, t) = pose_to_rt(&pose_min.rotation, &pose_min.translation);
        if !all_positive_depths(&r, t, &w_min) {
            continue;
        }

        let inliers =
            classify_inliers(&projector, world, image, &pose_min, params.reproj_threshold_px);
        if inliers.len() > best_inliers.len() {
            best_inliers = inliers;
            best_pose = Some(pose_min);
            required_iters = required_iters.min(adaptive_iterations(
                best_inliers.len(),
                n,
                sample_size,
                params.confidence,
                iter,
                params.max_iterations,
            ));
        }
    }

    let required = sample_size.min(4);
    let Some(mut pose) = best_pose.filter(|_| best_inliers.len() >= required) else {
        return Err(PnPError::InsufficientInliers {
            required,
            actual: best_inliers.len(),
        });
    };

    let w_in: Vec<[f64; 3]> = best_inliers.iter().map(|&i| world[i]).collect();
    let i_in: Vec<[f64; 2]> = best_inliers.iter().map(|&i| image[i]).collect();

    if params.refine {
        match solve_pnp(&w_in, &i_in, k, base.clone()) {
            Ok(refit) => pose = refit,
            Err(e) => log::debug!("refit on {} inliers failed: {e}", w_in.len()),
        }
        if let Some(polished) = polish(&w_in, &i_in, k, &PoseSeed::from(&pose)) {
            pose = polished;
        }
    }
    pose.reproj_rmse = Some(subset_rmse(&projector, &w_in, &i_in, &pose));

    if let Some(seed) = seed {
        if let Some(from_seed) = polish(&w_in, &i_in, k, seed) {
            let seeded_rmse = from_seed.reproj_rmse.unwrap_or(f64::INFINITY);
            if seeded_rmse < pose.reproj_rmse.unwrap_or(f64::INFINITY) {
                log::trace!("seeded pose wins ({seeded_rmse:.4} px)");
                pose = from_seed;
            }
        }
    }

    Ok(PnPRansacResult {
        pose,
        inliers: best_inliers,
    })
}

/// [`solve_pnp_ransac`] on distorted pixels: undistorts through `camera` first.
pub fn solve_pnp_ransac_with_camera(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    camera: &CameraModel,
    base: PnPMethod,
    params: &RansacParams,
    seed: Option<&PoseSeed>,
) -> Result<PnPRansacResult, PnPError> {
    let undistorted = if camera.has_distortion() {
        camera.undistort_points(image)?
    } else {
        image.to_vec()
    };
    let k = camera.intrinsics_matrix();
    solve_pnp_ransac(world, &undistorted, &k, base, params, seed)
}

/// LM refinement from `seed`; `None` when the seed cannot be refined on these points.
fn polish(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    seed: &PoseSeed,
) -> Option<PnPResult> {
    let mut rvec = seed.rvec;
    let mut t = seed.translation;
    let report = refine_pose_lm(world, image, k, &mut rvec, &mut t, &LMParams::default()).ok()?;
    let r = rvec_to_rotation(&rvec);
    Some(PnPResult {
        rotation: crate::ops::mat3_to_rows(&r),
        translation: t,
        rvec,
        reproj_rmse: Some(report.rmse),
        num_iterations: Some(report.iterations),
        converged: Some(report.converged),
    })
}

fn adaptive_iterations(
    inliers: usize,
    n: usize,
    sample_size: usize,
    confidence: f64,
    iter: usize,
    max_iterations: usize,
) -> usize {
    let w = inliers as f64 / n as f64;
    if w >= 1.0 {
        return iter;
    }
    let ws = w.powi(sample_size as i32);
    if ws <= 1e-12 {
        return max_iterations;
    }
    let log_conf = (1.0 - confidence).max(1e-12).ln();
    let log_denom = (1.0 - ws).ln();
    if !log_denom.is_finite() || log_denom == 0.0 {
        return max_iterations;
    }
    let est = (log_conf / log_denom).ceil();
    if est.is_finite() && est > 0.0 {
        (est as usize).clamp(iter, max_iterations)
    } else {
        max_iterations
    }
}

fn classify_inliers(
    projector: &Projector,
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    pose: &PnPResult,
    thresh_px: f64,
) -> Vec<usize> {
    let (r, t) = pose_to_rt(&pose.rotation, &pose.translation);
    let thresh_sq = thresh_px * thresh_px;
    world
        .iter()
        .zip(image.iter())
        .enumerate()
        .filter_map(|(idx, (pw, uv))| {
            projector
                .sq_error(&r, t, pw, uv)
                .filter(|&e| e < thresh_sq)
                .map(|_| idx)
        })
        .collect()
}

fn subset_rmse(
    projector: &Projector,
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    pose: &PnPResult,
) -> f64 {
    let (r, t) = pose_to_rt(&pose.rotation, &pose.translation);
    let sum_sq: f64 = world
        .iter()
        .zip(image.iter())
        .map(|(pw, uv)| projector.sq_error(&r, t, pw, uv).unwrap_or(f64::INFINITY))
        .sum();
    (sum_sq / world.len().max(1) as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::epnp::EPnPParams;
    use crate::planar::square_object_points;
    use glam::DVec3;

    const K: [[f64; 3]; 3] = [[600.0, 0.0, 320.0], [0.0, 600.0, 240.0], [0.0, 0.0, 1.0]];

    fn project(world: &[[f64; 3]], rvec: &[f64; 3], t: DVec3) -> Vec<[f64; 2]> {
        let r = rvec_to_rotation(rvec);
        let p = Projector::new(&K);
        world
            .iter()
            .map(|pw| p.project(r * DVec3::from(*pw) + t).unwrap_or([0.0, 0.0]))
            .collect()
    }

    /// Three markers on the floor plane `z = 0`.
    fn floor_markers() -> Vec<[f64; 3]> {
        let mut world = Vec::new();
        for offset in [[0.0, 0.0], [0.4, 0.1], [-0.3, 0.35]] {
            for c in square_object_points(0.15) {
                world.push([c[0] + offset[0], c[1] + offset[1], 0.0]);
            }
        }
        world
    }

    #[test]
    fn test_ransac_rejects_outliers_planar() -> Result<(), PnPError> {
        let world = floor_markers();
        let rvec = [2.9, 0.2, -0.1];
        let t = DVec3::new(0.0, 0.1, 2.0);
        let mut image = project(&world, &rvec, t);
        image[1] = [5.0, 470.0];
        image[9] = [630.0, 12.0];

        let params = RansacParams {
            random_seed: Some(7),
            reproj_threshold_px: 2.0,
            ..Default::default()
        };
        let res = solve_pnp_ransac(&world, &image, &K, PnPMethod::Auto, &params, None)?;
        assert_eq!(res.inliers.len(), world.len() - 2);
        assert!(!res.inliers.contains(&1) && !res.inliers.contains(&9));
        let tr = DVec3::from(res.pose.translation);
        assert!(tr.abs_diff_eq(t, 1e-6), "{tr:?}");
        assert!(res.pose.reproj_rmse.unwrap_or(f64::MAX) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_ransac_epnp_perfect_data() -> Result<(), PnPError> {
        let world = vec![
            [-0.2, -0.1, 0.0],
            [0.2, -0.1, 0.05],
            [0.15, 0.2, -0.05],
            [-0.1, 0.15, 0.1],
            [0.0, 0.0, 0.2],
            [0.05, -0.2, -0.1],
            [0.12, 0.02, 0.08],
        ];
        let t = DVec3::new(0.02, -0.05, 1.5);
        let image = project(&world, &[0.1, -0.3, 0.05], t);
        let params = RansacParams {
            random_seed: Some(42),
            ..Default::default()
        };
        let base = PnPMethod::EPnP(EPnPParams::default());
        let res = solve_pnp_ransac(&world, &image, &K, base, &params, None)?;
        assert_eq!(res.inliers.len(), world.len());
        assert!(DVec3::from(res.pose.translation).abs_diff_eq(t, 1e-6));
        Ok(())
    }

    #[test]
    fn test_ransac_single_square() -> Result<(), PnPError> {
        let world = square_object_points(0.1).to_vec();
        let t = DVec3::new(0.0, 0.0, 1.0);
        let image = project(&world, &[std::f64::consts::PI, 0.0, 0.0], t);
        let params = RansacParams {
            random_seed: Some(1),
            ..Default::default()
        };
        let res = solve_pnp_ransac(&world, &image, &K, PnPMethod::Auto, &params, None)?;
        assert_eq!(res.inliers, vec![0, 1, 2, 3]);
        assert!(DVec3::from(res.pose.translation).abs_diff_eq(t, 1e-6));
        Ok(())
    }

    #[test]
    fn test_ransac_keeps_better_seed() -> Result<(), PnPError> {
        let world = floor_markers();
        let rvec = [2.9, 0.2, -0.1];
        let t = DVec3::new(0.0, 0.1, 2.0);
        let image = project(&world, &rvec, t);
        let params = RansacParams {
            random_seed: Some(3),
            refine: false,
            ..Default::default()
        };
        let seed = PoseSeed {
            rvec,
            translation: t.to_array(),
        };
        let res = solve_pnp_ransac(&world, &image, &K, PnPMethod::Auto, &params, Some(&seed))?;
        assert!(res.pose.reproj_rmse.unwrap_or(f64::MAX) < 1e-6);
        Ok(())
    }

    #[test]
    fn test_ransac_with_camera_undistorts() -> Result<(), PnPError> {
        use crate::camera::{PinholeIntrinsics, PolynomialDistortion};

        let world = floor_markers();
        let rvec = [2.9, 0.2, -0.1];
        let t = DVec3::new(0.0, 0.1, 2.0);
        let ideal = project(&world, &rvec, t);

        let camera = CameraModel::with_distortion(
            PinholeIntrinsics::from_matrix(&K)?,
            PolynomialDistortion::radial_tangential(-0.1, 0.01, 0.001, -0.0005),
        );
        let distorted: Vec<[f64; 2]> = ideal
            .iter()
            .map(|uv| {
                let (u, v) = camera.distort_point(uv[0], uv[1]);
                [u, v]
            })
            .collect();

        let params = RansacParams {
            random_seed: Some(11),
            reproj_threshold_px: 1.0,
            ..Default::default()
        };
        let res = solve_pnp_ransac_with_camera(
            &world,
            &distorted,
            &camera,
            PnPMethod::Auto,
            &params,
            None,
        )?;
        assert_eq!(res.inliers.len(), world.len());
        assert!(DVec3::from(res.pose.translation).abs_diff_eq(t, 1e-5));
        Ok(())
    }

    #[test]
    fn test_ransac_error_cases() {
        let world = [[0.0, 0.0, 1.0], [1.0, 0.0, 1.0], [0.0, 1.0, 1.0]];
        let image = [[100.0, 100.0], [200.0, 100.0], [100.0, 200.0]];
        let res = solve_pnp_ransac(
            &world,
            &image,
            &K,
            PnPMethod::EPnPDefault,
            &RansacParams::default(),
            None,
        );
        assert!(matches!(
            res,
            Err(PnPError::InsufficientCorrespondences { .. })
        ));
    }
}
