use glam::{DMat3, DVec3};
use vruco_pnp::{
    rvec_to_rotation, solve_pnp_ransac_with_camera, CameraModel, PnPError, PnPMethod, PoseSeed,
    RansacParams,
};

/// Room-to-camera transform estimated for one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extrinsics {
    /// Axis-angle rotation, room to camera.
    pub rvec: [f64; 3],
    /// Translation, room to camera.
    pub translation: [f64; 3],
    /// Reprojection RMSE on the inliers, pixels.
    pub rmse: f64,
    /// Correspondences that agreed with the pose.
    pub inliers: usize,
}

impl Extrinsics {
    /// Rotation matrix of [`Extrinsics::rvec`].
    pub fn rotation(&self) -> DMat3 {
        rvec_to_rotation(&self.rvec)
    }

    /// Camera centre in room space, `-(Rᵀ t)`.
    pub fn camera_position(&self) -> DVec3 {
        -(self.rotation().transpose() * DVec3::from(self.translation))
    }
}

/// Estimates the room-to-camera transform from point correspondences.
pub trait PoseSolver {
    /// Solve from room points and their distorted pixel observations.
    ///
    /// `seed` is the previous frame's solution when one exists; a solver may use
    /// it to start refinement but must not rely on it.
    fn solve(
        &mut self,
        room: &[[f64; 3]],
        image: &[[f64; 2]],
        camera: &CameraModel,
        seed: Option<&Extrinsics>,
    ) -> Result<Extrinsics, PnPError>;
}

/// RANSAC PnP from `vruco-pnp` with the previous solution as a refinement seed.
#[derive(Debug, Clone, Default)]
pub struct RansacPoseSolver {
    /// Minimal and refit solver.
    pub method: PnPMethod,
    /// Sampling and inlier parameters.
    pub params: RansacParams,
}

impl RansacPoseSolver {
    /// Solver with explicit parameters.
    pub fn new(method: PnPMethod, params: RansacParams) -> Self {
        Self { method, params }
    }
}

impl PoseSolver for RansacPoseSolver {
    fn solve(
        &mut self,
        room: &[[f64; 3]],
        image: &[[f64; 2]],
        camera: &CameraModel,
        seed: Option<&Extrinsics>,
    ) -> Result<Extrinsics, PnPError> {
        let seed = seed.map(|s| PoseSeed {
            rvec: s.rvec,
            translation: s.translation,
        });
        let res = solve_pnp_ransac_with_camera(
            room,
            image,
            camera,
            self.method.clone(),
            &self.params,
            seed.as_ref(),
        )?;
        Ok(Extrinsics {
            rvec: res.pose.rvec,
            translation: res.pose.translation,
            rmse: res.pose.reproj_rmse.unwrap_or(f64::NAN),
            inliers: res.inliers.len(),
        })
    }
}
