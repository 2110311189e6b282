//! Rigid alignment utilities (Kabsch / Umeyama)

use glam::{DMat3, DVec3};
use nalgebra::Matrix3;
use thiserror::Error;

/// Error type for Umeyama rigid alignment operations.
#[derive(Debug, Error)]
pub enum UmeyamaError {
    /// Source and destination arrays must have the same length
    #[error("Source and destination arrays must have the same length")]
    MismatchedInputLengths,

    /// At least three points are needed to fix a rotation
    #[error("Rigid alignment needs at least 3 points, got {0}")]
    NotEnoughPoints(usize),

    /// The SVD of the cross-covariance did not produce singular vectors
    #[error("SVD of the cross-covariance failed")]
    SvdFailed,
}

/// Umeyama/Kabsch algorithm without scale.
///
/// Returns `(R, t)` minimizing `Σ |dst_i - (R * src_i + t)|²` with `det(R) = +1`.
pub fn umeyama(src: &[DVec3], dst: &[DVec3]) -> Result<(DMat3, DVec3), UmeyamaError> {
    if src.len() != dst.len() {
        return Err(UmeyamaError::MismatchedInputLengths);
    }
    if src.len() < 3 {
        return Err(UmeyamaError::NotEnoughPoints(src.len()));
    }
    let n = src.len() as f64;

    let mu_s = src.iter().fold(DVec3::ZERO, |acc, &p| acc + p) / n;
    let mu_d = dst.iter().fold(DVec3::ZERO, |acc, &p| acc + p) / n;

    // H = Σ (dst - mu_d) * (src - mu_s)^T
    let mut h = Matrix3::<f64>::zeros();
    for (s, d) in src.iter().zip(dst.iter()) {
        let sc = *s - mu_s;
        let dc = *d - mu_d;
        for (r, dc_r) in dc.to_array().into_iter().enumerate() {
            for (c, sc_c) in sc.to_array().into_iter().enumerate() {
                h[(r, c)] += dc_r * sc_c;
            }
        }
    }
    h /= n;

    let svd = h.svd(true, true);
    let u = svd.u.ok_or(UmeyamaError::SvdFailed)?;
    let v_t = svd.v_t.ok_or(UmeyamaError::SvdFailed)?;

    // Reflection guard: force det(R) = +1
    let mut d = Matrix3::<f64>::identity();
    if (u * v_t).determinant() < 0.0 {
        d[(2, 2)] = -1.0;
    }
    let r = u * d * v_t;

    let r_mat = DMat3::from_cols_slice(r.as_slice());
    let t = mu_d - r_mat * mu_s;
    Ok((r_mat, t))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::rvec_to_rotation;

    #[test]
    fn test_umeyama_recovers_transform() -> Result<(), UmeyamaError> {
        let r_gt = rvec_to_rotation(&[0.2, -0.4, 0.9]);
        let t_gt = DVec3::new(0.5, -1.0, 2.0);
        let src = vec![
            DVec3::new(0.0, 0.0, 0.0),
            DVec3::new(1.0, 0.0, 0.0),
            DVec3::new(0.0, 1.0, 0.0),
            DVec3::new(0.0, 0.0, 1.0),
            DVec3::new(0.3, 0.7, -0.2),
        ];
        let dst: Vec<DVec3> = src.iter().map(|&p| r_gt * p + t_gt).collect();

        let (r, t) = umeyama(&src, &dst)?;
        assert!(r.abs_diff_eq(r_gt, 1e-9));
        assert!(t.abs_diff_eq(t_gt, 1e-9));
        Ok(())
    }

    #[test]
    fn test_umeyama_planar_points() -> Result<(), UmeyamaError> {
        // four coplanar points still pin down a proper rotation
        let r_gt = rvec_to_rotation(&[0.0, std::f64::consts::FRAC_PI_2, 0.0]);
        let src = vec![
            DVec3::new(-0.5, 0.5, 0.0),
            DVec3::new(0.5, 0.5, 0.0),
            DVec3::new(0.5, -0.5, 0.0),
            DVec3::new(-0.5, -0.5, 0.0),
        ];
        let dst: Vec<DVec3> = src.iter().map(|&p| r_gt * p).collect();
        let (r, t) = umeyama(&src, &dst)?;
        assert!(r.abs_diff_eq(r_gt, 1e-9));
        assert!(t.abs_diff_eq(DVec3::ZERO, 1e-9));
        assert!((r.determinant() - 1.0).abs() < 1e-12);
        Ok(())
    }

    #[test]
    fn test_umeyama_errors() {
        let a = [DVec3::ZERO; 3];
        let b = [DVec3::ZERO; 2];
        assert!(matches!(
            umeyama(&a, &b),
            Err(UmeyamaError::MismatchedInputLengths)
        ));
        assert!(matches!(
            umeyama(&b, &b),
            Err(UmeyamaError::NotEnoughPoints(2))
        ));
    }
}
