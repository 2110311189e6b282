//! Result, seed and error types of the pose solvers.

use crate::camera::CameraError;
use thiserror::Error;

/// Error raised by the pose solvers.
#[derive(Debug, Error)]
pub enum PnPError {
    /// Fewer point pairs than the solver needs.
    #[error("Need at least {required} point correspondences, got {actual}")]
    InsufficientCorrespondences {
        /// Pairs the solver needs
        required: usize,
        /// Pairs supplied
        actual: usize,
    },

    /// Mismatched array lengths with descriptive labels.
    #[error("Mismatched array lengths: {left_name} ({left_len}) != {right_name} ({right_len})")]
    MismatchedArrayLengths {
        /// Label for the left-hand slice
        left_name: &'static str,
        /// Length of the left-hand slice
        left_len: usize,
        /// Label for the right-hand slice
        right_name: &'static str,
        /// Length of the right-hand slice
        right_len: usize,
    },

    /// A singular value or eigen decomposition did not converge.
    #[error("Decomposition failed: {0}")]
    SvdFailed(String),

    /// The point configuration does not constrain a pose (collinear points, zero depth, ...).
    #[error("Degenerate point configuration: {0}")]
    DegenerateConfiguration(&'static str),

    /// RANSAC could not find a consensus set large enough to trust.
    #[error("RANSAC found {actual} inliers, at least {required} are required")]
    InsufficientInliers {
        /// Minimum number of inliers required
        required: usize,
        /// Size of the best consensus set
        actual: usize,
    },

    /// Camera model error
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Thresholds below which a value counts as zero.
#[derive(Debug, Clone)]
pub struct NumericTol {
    /// Singular values and pivots in the beta estimates.
    pub svd: f64,
    /// Determinants and norms guarding divisions and inverses.
    pub eps: f64,
}

impl Default for NumericTol {
    fn default() -> Self {
        Self {
            svd: 1e-12,
            eps: 1e-12,
        }
    }
}

/// A solved pose, world frame to camera frame.
#[derive(Debug, Clone)]
pub struct PnPResult {
    /// Rotation, row-major.
    pub rotation: [[f64; 3]; 3],
    /// Translation.
    pub translation: [f64; 3],
    /// `rotation` as an axis-angle vector.
    pub rvec: [f64; 3],
    /// Pixel reprojection RMSE, when computed.
    pub reproj_rmse: Option<f64>,
    /// Iterations of the refinement stage, if any ran.
    pub num_iterations: Option<usize>,
    /// Whether that refinement converged.
    pub converged: Option<bool>,
}

/// A previous pose used to seed iterative refinement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoseSeed {
    /// Axis-angle rotation, world to camera.
    pub rvec: [f64; 3],
    /// Translation, world to camera.
    pub translation: [f64; 3],
}

impl From<&PnPResult> for PoseSeed {
    fn from(result: &PnPResult) -> Self {
        Self {
            rvec: result.rvec,
            translation: result.translation,
        }
    }
}

/// A closed-form pose solver.
pub trait PnPSolver {
    /// Solver parameters.
    type Param;

    /// Solve from world points and their undistorted pixel coordinates under `k`.
    fn solve(
        world: &[[f64; 3]],
        image: &[[f64; 2]],
        k: &[[f64; 3]; 3],
        params: &Self::Param,
    ) -> Result<PnPResult, PnPError>;
}

/// Validate that both correspondence slices have the same length and at least `required` entries.
pub(crate) fn check_correspondences(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    required: usize,
) -> Result<usize, PnPError> {
    if world.len() != image.len() {
        return Err(PnPError::MismatchedArrayLengths {
            left_name: "world points",
            left_len: world.len(),
            right_name: "image points",
            right_len: image.len(),
        });
    }
    if world.len() < required {
        return Err(PnPError::InsufficientCorrespondences {
            required,
            actual: world.len(),
        });
    }
    Ok(world.len())
}
