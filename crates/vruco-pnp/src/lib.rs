#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # vruco PnP (Perspective-n-Point)
//!
//! Camera pose estimation from 2D-3D point correspondences, tuned for square
//! fiducial markers laid out on a room's walls and floor.
//!
//! ## Key Features
//!
//! - **Planar solver**: homography decomposition for coplanar point sets such as marker corners
//! - **EPnP**: Efficient Perspective-n-Point for general 3-D layouts
//! - **RANSAC**: robust estimation with outlier rejection and previous-pose seeding
//! - **Distortion handling**: Brown-Conrady undistortion before solving
//! - **LM refinement**: reprojection-error minimization from any initial pose
//!
//! ## Example: single marker
//!
//! ```rust
//! use vruco_pnp::{solve_square, pose_to_rt};
//!
//! let k = [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]];
//! // a 10 cm marker seen head-on from 1 m away
//! let corners = [[295.0, 215.0], [345.0, 215.0], [345.0, 265.0], [295.0, 265.0]];
//!
//! let pose = solve_square(&corners, &k, 0.1)?;
//! let (r, t) = pose_to_rt(&pose.rotation, &pose.translation);
//! let camera_position = -(r.transpose() * t);
//! assert!((camera_position.z - 1.0).abs() < 1e-9);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Example: robust PnP with RANSAC
//!
//! ```rust
//! use vruco_pnp::{solve_pnp_ransac, square_object_points, PnPMethod, RansacParams};
//!
//! let k = [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]];
//! let world = square_object_points(0.1).to_vec();
//! let image = vec![[295.0, 215.0], [345.0, 215.0], [345.0, 265.0], [295.0, 265.0]];
//!
//! let params = RansacParams { random_seed: Some(0), ..Default::default() };
//! let result = solve_pnp_ransac(&world, &image, &k, PnPMethod::Auto, &params, None)?;
//! println!("Inliers: {}/{}", result.inliers.len(), world.len());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Pinhole intrinsics and Brown-Conrady lens distortion.
pub mod camera;

/// Efficient Perspective-n-Point (EPnP) solver implementation.
///
/// Works for general (non-coplanar) point layouts.
pub mod epnp;

/// Homography-based solver for coplanar points and square markers.
pub mod planar;

/// RANSAC-based robust PnP pose estimation.
///
/// Handles outliers in point correspondences through random sampling consensus.
pub mod ransac;

/// Levenberg–Marquardt refinement of a pose.
pub mod refine;

/// Rigid point-set alignment.
pub mod rigid;

/// Common data types and traits for PnP solvers.
pub mod types;

mod ops;

pub use camera::{CameraError, CameraModel, PinholeIntrinsics, PolynomialDistortion};
pub use epnp::{EPnP, EPnPParams};
pub use ops::{mat3_to_rows, pose_to_rt, rotation_to_rvec, rvec_to_rotation};
pub use planar::{is_planar, solve_square, square_object_points, Planar, PlanarParams};
pub use ransac::{solve_pnp_ransac, solve_pnp_ransac_with_camera, PnPRansacResult, RansacParams};
pub use refine::{refine_pose_lm, LMParams, LMReport};
pub use types::{NumericTol, PnPError, PnPResult, PnPSolver, PoseSeed};

/// Enumeration of the Perspective-n-Point algorithms available in this crate.
#[derive(Debug, Clone, Default)]
pub enum PnPMethod {
    /// Efficient PnP solver with a user-supplied parameter object.
    EPnP(EPnPParams),
    /// Efficient PnP solver with the crate's default parameters.
    EPnPDefault,
    /// Planar homography solver with a user-supplied parameter object.
    Planar(PlanarParams),
    /// Planar homography solver with default parameters.
    PlanarDefault,
    /// Planar solver when the world points are coplanar, EPnP otherwise.
    #[default]
    Auto,
}

/// Dispatch function that routes to the chosen PnP solver.
///
/// `image` holds undistorted pixel coordinates; see [`solve_pnp_with_camera`]
/// for raw detections.
pub fn solve_pnp(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    k: &[[f64; 3]; 3],
    method: PnPMethod,
) -> Result<PnPResult, PnPError> {
    match method {
        PnPMethod::EPnP(params) => EPnP::solve(world, image, k, &params),
        PnPMethod::EPnPDefault => EPnP::solve(world, image, k, &EPnPParams::default()),
        PnPMethod::Planar(params) => Planar::solve(world, image, k, &params),
        PnPMethod::PlanarDefault => Planar::solve(world, image, k, &PlanarParams::default()),
        PnPMethod::Auto => {
            let params = PlanarParams::default();
            if is_planar(world, params.planarity_ratio) {
                Planar::solve(world, image, k, &params)
            } else {
                EPnP::solve(world, image, k, &EPnPParams::default())
            }
        }
    }
}

/// Undistort `image` through `camera`, then [`solve_pnp`].
pub fn solve_pnp_with_camera(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    camera: &CameraModel,
    method: PnPMethod,
) -> Result<PnPResult, PnPError> {
    let undistorted = if camera.has_distortion() {
        camera.undistort_points(image)?
    } else {
        image.to_vec()
    };
    solve_pnp(world, &undistorted, &camera.intrinsics_matrix(), method)
}
