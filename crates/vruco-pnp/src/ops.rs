use glam::{DMat3, DQuat, DVec3};

/// Compute the centroid of a set of points.
pub(crate) fn compute_centroid(pts: &[[f64; 3]]) -> DVec3 {
    let n = pts.len() as f64;
    let sum = pts.iter().fold(DVec3::ZERO, |acc, &p| acc + DVec3::from(p));
    sum / n
}

/// Convert array-form (row-major) pose to glam matrices/vectors.
pub fn pose_to_rt(r: &[[f64; 3]; 3], t: &[f64; 3]) -> (DMat3, DVec3) {
    let r_mat = DMat3::from_cols(
        DVec3::new(r[0][0], r[1][0], r[2][0]),
        DVec3::new(r[0][1], r[1][1], r[2][1]),
        DVec3::new(r[0][2], r[1][2], r[2][2]),
    );
    (r_mat, DVec3::from(*t))
}

/// Convert a glam rotation into the row-major array form used by [`crate::PnPResult`].
pub fn mat3_to_rows(r: &DMat3) -> [[f64; 3]; 3] {
    let r = r.transpose();
    [r.x_axis.to_array(), r.y_axis.to_array(), r.z_axis.to_array()]
}

/// Rodrigues vector (log map) of a rotation matrix.
///
/// Unlike `DQuat::to_scaled_axis` this does not snap small angles to zero.
pub fn rotation_to_rvec(r: &DMat3) -> [f64; 3] {
    let mut q = DQuat::from_mat3(r).normalize();
    if q.w < 0.0 {
        q = -q;
    }
    let v = DVec3::new(q.x, q.y, q.z);
    let s = v.length();
    if s < 1e-15 {
        return (v * 2.0).to_array();
    }
    let angle = 2.0 * s.atan2(q.w);
    (v * (angle / s)).to_array()
}

/// Rotation matrix (exp map) of a Rodrigues vector.
pub fn rvec_to_rotation(rvec: &[f64; 3]) -> DMat3 {
    DMat3::from_quat(DQuat::from_scaled_axis(DVec3::from(*rvec)))
}

/// Pinhole projection helper built once from an intrinsics matrix.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Projector {
    fx: f64,
    fy: f64,
    cx: f64,
    cy: f64,
    skew: f64,
}

impl Projector {
    pub(crate) fn new(k: &[[f64; 3]; 3]) -> Self {
        Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
            skew: k[0][1],
        }
    }

    /// Project a camera-frame point. Returns `None` for points at or behind the camera.
    #[inline]
    pub(crate) fn project(&self, pc: DVec3) -> Option<[f64; 2]> {
        if pc.z <= f64::EPSILON {
            return None;
        }
        let inv_z = 1.0 / pc.z;
        let x = pc.x * inv_z;
        let y = pc.y * inv_z;
        Some([self.fx * x + self.skew * y + self.cx, self.fy * y + self.cy])
    }

    /// Squared pixel reprojection error of one correspondence, `None` when behind the camera.
    #[inline]
    pub(crate) fn sq_error(
        &self,
        r: &DMat3,
        t: DVec3,
        world: &[f64; 3],
        image: &[f64; 2],
    ) -> Option<f64> {
        let uv = self.project(*r * DVec3::from(*world) + t)?;
        let du = uv[0] - image[0];
        let dv = uv[1] - image[1];
        Some(du.mul_add(du, dv * dv))
    }
}

/// Root-mean-square pixel reprojection error; points behind the camera count as infinite error.
pub(crate) fn reprojection_rmse(
    world: &[[f64; 3]],
    image: &[[f64; 2]],
    r: &DMat3,
    t: DVec3,
    k: &[[f64; 3]; 3],
) -> f64 {
    if world.is_empty() {
        return 0.0;
    }
    let projector = Projector::new(k);
    let mut sum_sq = 0.0;
    for (pw, uv) in world.iter().zip(image.iter()) {
        match projector.sq_error(r, t, pw, uv) {
            Some(e) => sum_sq += e,
            None => return f64::INFINITY,
        }
    }
    (sum_sq / world.len() as f64).sqrt()
}

/// Whether all world points lie in front of the camera.
pub(crate) fn all_positive_depths(r: &DMat3, t: DVec3, world: &[[f64; 3]]) -> bool {
    world
        .iter()
        .all(|pw| (*r * DVec3::from(*pw) + t).z > 0.0)
}
