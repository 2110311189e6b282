use glam::{DQuat, DVec3};

/// Rotation vectors shorter than this have no usable axis.
pub const MIN_ROTATION_ANGLE: f64 = 1e-12;

/// Convert a solver rotation vector into the consumer's orientation `[x, y, z, w]`.
///
/// The solver's camera frame has +y down and +z forward, the consumer's world
/// has +y up. The rotation is composed after a fixed half turn about +X and
/// the scalar part is negated:
///
/// ```text
/// q = (w: 0, x: 1, y: 0, z: 0) * angle_axis(|rvec|, rvec / |rvec|)
/// out = [q.x, q.y, q.z, -q.w]
/// ```
///
/// Returns `None` when the rotation angle is not finite or is numerically zero.
pub fn to_consumer_orientation(rvec: &[f64; 3]) -> Option<[f64; 4]> {
    let v = DVec3::from(*rvec);
    let theta = v.length();
    if !theta.is_finite() || theta < MIN_ROTATION_ANGLE {
        return None;
    }
    let reference = DQuat::from_xyzw(1.0, 0.0, 0.0, 0.0);
    let q = reference * DQuat::from_axis_angle(v / theta, theta);
    Some([q.x, q.y, q.z, -q.w])
}
