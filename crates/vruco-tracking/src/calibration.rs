use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use vruco_pnp::{CameraError, CameraModel, PinholeIntrinsics, PolynomialDistortion};

/// Error raised while loading camera calibration.
#[derive(Debug, thiserror::Error)]
pub enum CalibrationError {
    /// The calibration file could not be opened or read.
    #[error("Calibration file {path} could not be read. {source}")]
    Missing {
        /// Path that was tried
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The file content does not describe a valid camera.
    #[error("Calibration is malformed: {0}")]
    Malformed(String),
}

/// Camera intrinsics as stored in the calibration file.
///
/// The text layout is whitespace-delimited: `rows cols` followed by the
/// camera matrix values (row-major), then `rows cols` followed by the
/// distortion coefficients in `k1 k2 p1 p2 [k3 [k4 k5 k6]]` order.
#[derive(Debug, Clone, PartialEq)]
pub struct CameraIntrinsics {
    /// 3×3 camera matrix, row-major.
    pub matrix: [[f64; 3]; 3],
    /// Lens distortion coefficients.
    pub distortion: Vec<f64>,
    /// Declared `(rows, cols)` of the distortion block.
    pub distortion_shape: (usize, usize),
    /// Image size `(width, height)` the calibration applies to.
    pub resolution: (u32, u32),
}

impl CameraIntrinsics {
    /// Read and parse a calibration file.
    pub fn load(path: impl AsRef<Path>, resolution: (u32, u32)) -> Result<Self, CalibrationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| CalibrationError::Missing {
            path: path.to_path_buf(),
            source,
        })?;
        let intrinsics = Self::parse(&text, resolution)?;
        log::debug!(
            "loaded calibration from {}: fx={} fy={} with {} distortion coefficients",
            path.display(),
            intrinsics.matrix[0][0],
            intrinsics.matrix[1][1],
            intrinsics.distortion.len()
        );
        Ok(intrinsics)
    }

    /// Parse calibration text.
    pub fn parse(text: &str, resolution: (u32, u32)) -> Result<Self, CalibrationError> {
        let mut tokens = text.split_whitespace();

        let (rows, cols, values) = read_block(&mut tokens, "camera matrix")?;
        if (rows, cols) != (3, 3) {
            return Err(CalibrationError::Malformed(format!(
                "camera matrix must be 3x3, got {rows}x{cols}"
            )));
        }
        let matrix = [
            [values[0], values[1], values[2]],
            [values[3], values[4], values[5]],
            [values[6], values[7], values[8]],
        ];
        PinholeIntrinsics::from_matrix(&matrix)
            .map_err(|e| CalibrationError::Malformed(e.to_string()))?;

        let (d_rows, d_cols, distortion) = read_block(&mut tokens, "distortion coefficients")?;
        if distortion.len() > 8 {
            return Err(CalibrationError::Malformed(format!(
                "at most 8 distortion coefficients are supported, got {}",
                distortion.len()
            )));
        }

        Ok(Self {
            matrix,
            distortion,
            distortion_shape: (d_rows, d_cols),
            resolution,
        })
    }

    /// Serialize back into the calibration text layout.
    pub fn to_text(&self) -> String {
        let mut out = String::from("3 3\n");
        for row in &self.matrix {
            let _ = writeln!(out, "{} {} {}", row[0], row[1], row[2]);
        }
        let (rows, cols) = self.distortion_shape;
        let _ = writeln!(out, "{rows} {cols}");
        let line: Vec<String> = self.distortion.iter().map(|v| v.to_string()).collect();
        let _ = writeln!(out, "{}", line.join(" "));
        out
    }

    /// Pinhole + Brown-Conrady model for the pose solver.
    pub fn camera_model(&self) -> Result<CameraModel, CameraError> {
        let pinhole = PinholeIntrinsics::from_matrix(&self.matrix)?;
        let distortion = PolynomialDistortion::from_coefficients(&self.distortion)?;
        Ok(CameraModel::with_distortion(pinhole, distortion))
    }
}

fn read_block<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    what: &str,
) -> Result<(usize, usize, Vec<f64>), CalibrationError> {
    let mut dim = |name: &str| -> Result<usize, CalibrationError> {
        let tok = tokens.next().ok_or_else(|| {
            CalibrationError::Malformed(format!("missing {name} count of the {what}"))
        })?;
        tok.parse::<usize>().map_err(|_| {
            CalibrationError::Malformed(format!("invalid {name} count '{tok}' of the {what}"))
        })
    };
    let rows = dim("row")?;
    let cols = dim("column")?;

    let expected = rows.checked_mul(cols).ok_or_else(|| {
        CalibrationError::Malformed(format!("{what} dimensions {rows}x{cols} overflow"))
    })?;
    let mut values = Vec::with_capacity(expected.min(64));
    for i in 0..expected {
        let tok = tokens.next().ok_or_else(|| {
            CalibrationError::Malformed(format!(
                "{what} declares {rows}x{cols} values but only {i} are present"
            ))
        })?;
        let v = tok.parse::<f64>().map_err(|_| {
            CalibrationError::Malformed(format!("invalid value '{tok}' in the {what}"))
        })?;
        values.push(v);
    }
    Ok((rows, cols, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PS3_EYE: &str = "3 3
5.4313768281016560e+02 0. 3.1950000000000000e+02
0. 5.4313768281016560e+02 2.3950000000000000e+02
0. 0. 1.
1 5
-1.0544898831748695e-01 2.1557564734015815e-01 0. 0. -1.2376913339566787e-01
";

    #[test]
    fn test_parse_ps3_eye() -> Result<(), CalibrationError> {
        let c = CameraIntrinsics::parse(PS3_EYE, (640, 480))?;
        assert_eq!(c.matrix[0][0], 5.4313768281016560e+02);
        assert_eq!(c.matrix[1][2], 2.395e+02);
        assert_eq!(c.distortion_shape, (1, 5));
        assert_eq!(c.distortion.len(), 5);
        assert_eq!(c.resolution, (640, 480));
        Ok(())
    }

    #[test]
    fn test_roundtrip_exact() -> Result<(), CalibrationError> {
        let c = CameraIntrinsics::parse(PS3_EYE, (640, 480))?;
        let again = CameraIntrinsics::parse(&c.to_text(), (640, 480))?;
        assert_eq!(c, again);
        Ok(())
    }

    #[test]
    fn test_roundtrip_awkward_values() -> Result<(), CalibrationError> {
        let text = "3 3 612.3456789012345 0.1 320.00000000000006 0 611.9999999999999 240 0 0 1 \
                    2 4 1e-17 -0.3 2.5e-5 0 0.1 0 0 0.3333333333333333";
        let c = CameraIntrinsics::parse(text, (640, 480))?;
        let again = CameraIntrinsics::parse(&c.to_text(), (640, 480))?;
        assert_eq!(again.distortion_shape, (2, 4));
        for (a, b) in c.distortion.iter().zip(again.distortion.iter()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
        for (ra, rb) in c.matrix.iter().zip(again.matrix.iter()) {
            for (a, b) in ra.iter().zip(rb.iter()) {
                assert_eq!(a.to_bits(), b.to_bits());
            }
        }
        Ok(())
    }

    #[test]
    fn test_malformed_inputs() {
        let cases = [
            "",
            "3 3 1 0 0 0 1 0 0 0",
            "3 x 1 0 0 0 1 0 0 0 1 1 5 0 0 0 0 0",
            "2 2 1 0 0 1 1 5 0 0 0 0 0",
            "3 3 500 0 320 0 500 240 0 0 1 1 5 0 0 0",
            "3 3 500 0 320 0 500 240 0 0 1 1 9 0 0 0 0 0 0 0 0 0",
            "3 3 -500 0 320 0 500 240 0 0 1 1 4 0 0 0 0",
            "3 3 500 0 320 0 500 240 0 0 1 1 4 0 0 nan? 0",
        ];
        for text in cases {
            assert!(
                matches!(
                    CameraIntrinsics::parse(text, (640, 480)),
                    Err(CalibrationError::Malformed(_))
                ),
                "accepted {text:?}"
            );
        }
    }

    #[test]
    fn test_missing_file() {
        let res = CameraIntrinsics::load("/definitely/not/here/calib.txt", (640, 480));
        assert!(matches!(res, Err(CalibrationError::Missing { .. })));
    }

    #[test]
    fn test_load_from_disk() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("calib.txt");
        std::fs::write(&path, PS3_EYE)?;
        let c = CameraIntrinsics::load(&path, (640, 480))?;
        let model = c.camera_model()?;
        assert!(model.has_distortion());
        assert_eq!(model.intrinsics_matrix(), c.matrix);
        Ok(())
    }
}
