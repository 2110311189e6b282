//! Pinhole projection and Brown-Conrady lens distortion.
use thiserror::Error;

/// Error raised by the camera model.
#[derive(Debug, Error)]
pub enum CameraError {
    /// `K` is not an upper-triangular intrinsics matrix
    #[error("Invalid camera intrinsics matrix: {0}")]
    InvalidIntrinsics(String),

    /// Coefficient list of unsupported length
    #[error("Invalid distortion parameters: {0}")]
    InvalidDistortion(String),

    /// Undistortion did not converge
    #[error("Failed to undistort point ({0}, {1})")]
    UndistortFailed(f64, f64),
}

/// Result of a camera model operation.
pub type CameraResult<T> = Result<T, CameraError>;

/// Intrinsic parameters of a pinhole camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinholeIntrinsics {
    /// Focal length in x direction
    pub fx: f64,
    /// Focal length in y direction
    pub fy: f64,
    /// Principal point x coordinate
    pub cx: f64,
    /// Principal point y coordinate
    pub cy: f64,
    /// Axis skew, zero for nearly every real camera
    pub skew: f64,
}

impl PinholeIntrinsics {
    /// Zero-skew intrinsics.
    pub fn new(fx: f64, fy: f64, cx: f64, cy: f64) -> Self {
        Self {
            fx,
            fy,
            cx,
            cy,
            skew: 0.0,
        }
    }

    /// Read `fx fy cx cy skew` from `K`, checking its last row and focal lengths.
    pub fn from_matrix(k: &[[f64; 3]; 3]) -> CameraResult<Self> {
        if k[1][0] != 0.0 || k[2][0] != 0.0 || k[2][1] != 0.0 || k[2][2] != 1.0 {
            return Err(CameraError::InvalidIntrinsics(
                "matrix must have form [[fx, s, cx], [0, fy, cy], [0, 0, 1]]".to_string(),
            ));
        }
        if !(k[0][0] > 0.0 && k[1][1] > 0.0) {
            return Err(CameraError::InvalidIntrinsics(format!(
                "focal lengths must be positive, got fx={} fy={}",
                k[0][0], k[1][1]
            )));
        }

        Ok(Self {
            fx: k[0][0],
            fy: k[1][1],
            cx: k[0][2],
            cy: k[1][2],
            skew: k[0][1],
        })
    }

    /// The 3×3 matrix `K`, row-major.
    pub fn to_matrix(&self) -> [[f64; 3]; 3] {
        [
            [self.fx, self.skew, self.cx],
            [0.0, self.fy, self.cy],
            [0.0, 0.0, 1.0],
        ]
    }

    /// Pixel coordinates to normalized image coordinates (K^-1 * [u, v, 1]).
    #[inline]
    pub fn normalize(&self, u: f64, v: f64) -> (f64, f64) {
        let y = (v - self.cy) / self.fy;
        let x = (u - self.cx - self.skew * y) / self.fx;
        (x, y)
    }

    /// Normalized image coordinates back to pixels.
    #[inline]
    pub fn denormalize(&self, x: f64, y: f64) -> (f64, f64) {
        (self.fx * x + self.skew * y + self.cx, self.fy * y + self.cy)
    }
}

/// Polynomial distortion parameters using the Brown-Conrady model.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PolynomialDistortion {
    /// First radial coefficient
    pub k1: f64,
    /// Second radial coefficient
    pub k2: f64,
    /// Third radial coefficient
    pub k3: f64,
    /// First rational (denominator) coefficient
    pub k4: f64,
    /// Second rational (denominator) coefficient
    pub k5: f64,
    /// Third rational (denominator) coefficient
    pub k6: f64,
    /// First tangential coefficient
    pub p1: f64,
    /// Second tangential coefficient
    pub p2: f64,
}

impl PolynomialDistortion {
    /// All coefficients zero.
    pub fn none() -> Self {
        Self::default()
    }

    /// Two radial and two tangential coefficients, the rest zero.
    pub fn radial_tangential(k1: f64, k2: f64, p1: f64, p2: f64) -> Self {
        Self {
            k1,
            k2,
            p1,
            p2,
            ..Self::default()
        }
    }

    /// Build from a coefficient vector in the usual calibration-tool order
    /// `k1 k2 p1 p2 [k3 [k4 k5 k6]]`. Missing trailing coefficients are zero.
    pub fn from_coefficients(coeffs: &[f64]) -> CameraResult<Self> {
        if coeffs.len() > 8 {
            return Err(CameraError::InvalidDistortion(format!(
                "expected at most 8 coefficients, got {}",
                coeffs.len()
            )));
        }
        let mut c = [0.0f64; 8];
        c[..coeffs.len()].copy_from_slice(coeffs);
        Ok(Self {
            k1: c[0],
            k2: c[1],
            p1: c[2],
            p2: c[3],
            k3: c[4],
            k4: c[5],
            k5: c[6],
            k6: c[7],
        })
    }

    /// Whether any coefficient is non-zero.
    pub fn has_distortion(&self) -> bool {
        [
            self.k1, self.k2, self.k3, self.k4, self.k5, self.k6, self.p1, self.p2,
        ]
        .iter()
        .any(|&c| c != 0.0)
    }

    /// Distort a normalized point.
    fn apply(&self, x: f64, y: f64) -> (f64, f64) {
        let r2 = x * x + y * y;
        let r4 = r2 * r2;
        let r6 = r4 * r2;
        let kr = (1.0 + self.k1 * r2 + self.k2 * r4 + self.k3 * r6)
            / (1.0 + self.k4 * r2 + self.k5 * r4 + self.k6 * r6);
        let (dx, dy) = self.tangential(x, y, r2);
        (x * kr + dx, y * kr + dy)
    }

    #[inline]
    fn tangential(&self, x: f64, y: f64, r2: f64) -> (f64, f64) {
        let xy2 = 2.0 * x * y;
        (
            self.p1 * xy2 + self.p2 * (r2 + 2.0 * x * x),
            self.p1 * (r2 + 2.0 * y * y) + self.p2 * xy2,
        )
    }
}

/// Intrinsics plus the lens distortion to remove before solving.
#[derive(Debug, Clone)]
pub struct CameraModel {
    /// Pinhole parameters
    pub intrinsics: PinholeIntrinsics,
    /// Lens distortion, if calibrated
    pub distortion: Option<PolynomialDistortion>,
}

impl CameraModel {
    /// Ideal pinhole model.
    pub fn pinhole(intrinsics: PinholeIntrinsics) -> Self {
        Self {
            intrinsics,
            distortion: None,
        }
    }

    /// Pinhole model with lens distortion.
    pub fn with_distortion(intrinsics: PinholeIntrinsics, distortion: PolynomialDistortion) -> Self {
        Self {
            intrinsics,
            distortion: Some(distortion),
        }
    }

    /// Whether undistortion changes any point.
    pub fn has_distortion(&self) -> bool {
        self.distortion.as_ref().is_some_and(|d| d.has_distortion())
    }

    /// Get the intrinsics matrix for use with the PnP solvers.
    pub fn intrinsics_matrix(&self) -> [[f64; 3]; 3] {
        self.intrinsics.to_matrix()
    }

    /// Remove lens distortion from a pixel coordinate.
    pub fn undistort_point(&self, u: f64, v: f64) -> CameraResult<(f64, f64)> {
        match &self.distortion {
            Some(d) if d.has_distortion() => self.undistort_point_iterative(u, v, d),
            _ => Ok((u, v)),
        }
    }

    /// [`CameraModel::undistort_point`] over a slice.
    pub fn undistort_points(&self, points: &[[f64; 2]]) -> CameraResult<Vec<[f64; 2]>> {
        points
            .iter()
            .map(|&[u, v]| self.undistort_point(u, v).map(|(x, y)| [x, y]))
            .collect()
    }

    /// Apply lens distortion to an ideal pixel coordinate.
    pub fn distort_point(&self, u: f64, v: f64) -> (f64, f64) {
        match &self.distortion {
            Some(d) => {
                let (x, y) = self.intrinsics.normalize(u, v);
                let (xd, yd) = d.apply(x, y);
                self.intrinsics.denormalize(xd, yd)
            }
            None => (u, v),
        }
    }

    /// Fixed-point inversion of the Brown-Conrady model.
    fn undistort_point_iterative(
        &self,
        u: f64,
        v: f64,
        distortion: &PolynomialDistortion,
    ) -> CameraResult<(f64, f64)> {
        const MAX_ITERATIONS: usize = 20;
        const EPSILON: f64 = 1e-12;

        let (x0, y0) = self.intrinsics.normalize(u, v);
        let (mut x, mut y) = (x0, y0);

        for _ in 0..MAX_ITERATIONS {
            let r2 = x * x + y * y;
            let r4 = r2 * r2;
            let r6 = r4 * r2;
            let icdist = (1.0 + distortion.k4 * r2 + distortion.k5 * r4 + distortion.k6 * r6)
                / (1.0 + distortion.k1 * r2 + distortion.k2 * r4 + distortion.k3 * r6);
            if !icdist.is_finite() || icdist <= 0.0 {
                return Err(CameraError::UndistortFailed(u, v));
            }
            let (dx, dy) = distortion.tangential(x, y, r2);
            let x_next = (x0 - dx) * icdist;
            let y_next = (y0 - dy) * icdist;
            let step = (x_next - x).abs().max((y_next - y).abs());
            x = x_next;
            y = y_next;
            if step < EPSILON {
                break;
            }
        }

        Ok(self.intrinsics.denormalize(x, y))
    }
}
