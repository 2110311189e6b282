use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::calibration::CameraIntrinsics;

/// Error raised by a frame source.
#[derive(Debug, thiserror::Error)]
pub enum CameraError {
    /// No device is connected.
    #[error("No camera device found")]
    NoDevice,

    /// The device refused to start streaming.
    #[error("Failed to start the camera stream: {0}")]
    StartFailed(String),

    /// A frame could not be read.
    #[error("Failed to read a frame: {0}")]
    ReadFailed(String),

    /// The frame buffer does not match the configured resolution.
    #[error("Frame buffer is {actual} bytes, expected {expected}")]
    BufferSize {
        /// Bytes required by the configured resolution
        expected: usize,
        /// Bytes in the supplied buffer
        actual: usize,
    },

    /// Underlying I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Fiducial dictionaries understood by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MarkerFamily {
    /// ArUco MIP 36h12, 250 ids.
    #[default]
    #[serde(rename = "ARUCO_MIP_36h12")]
    ArucoMip36h12,
    /// The classic 5x5 ArUco dictionary, 1024 ids.
    #[serde(rename = "ARUCO")]
    Aruco,
    /// ArUco MIP 25h7, 100 ids.
    #[serde(rename = "ARUCO_MIP_25h7")]
    ArucoMip25h7,
    /// ArUco MIP 16h3, 250 ids.
    #[serde(rename = "ARUCO_MIP_16h3")]
    ArucoMip16h3,
}

impl MarkerFamily {
    /// Canonical dictionary name.
    pub fn name(self) -> &'static str {
        match self {
            MarkerFamily::ArucoMip36h12 => "ARUCO_MIP_36h12",
            MarkerFamily::Aruco => "ARUCO",
            MarkerFamily::ArucoMip25h7 => "ARUCO_MIP_25h7",
            MarkerFamily::ArucoMip16h3 => "ARUCO_MIP_16h3",
        }
    }
}

impl fmt::Display for MarkerFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MarkerFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            MarkerFamily::ArucoMip36h12,
            MarkerFamily::Aruco,
            MarkerFamily::ArucoMip25h7,
            MarkerFamily::ArucoMip16h3,
        ]
        .into_iter()
        .find(|f| f.name().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unknown marker family '{s}'"))
    }
}

/// One marker found in a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarkerDetection {
    /// Decoded marker id.
    pub id: u32,
    /// Pixel corners: top-left, top-right, bottom-right, bottom-left of the upright marker.
    pub corners: [[f64; 2]; 4],
}

/// An RGB frame buffer of fixed size.
#[derive(Debug, Clone)]
pub struct Frame {
    width: u32,
    height: u32,
    /// Monotonic frame number assigned by the source.
    pub sequence: u64,
    data: Vec<u8>,
}

impl Frame {
    /// A black frame of `width × height` RGB pixels.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            sequence: 0,
            data: vec![0; width as usize * height as usize * 3],
        }
    }

    /// Frame width in pixels.
    pub fn width(&self) -> u32 {
        self.width
    }

    /// Frame height in pixels.
    pub fn height(&self) -> u32 {
        self.height
    }

    /// Raw interleaved RGB bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Mutable access for sources that fill the buffer in place.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// A blocking frame source.
pub trait Camera {
    /// Number of devices this source can open.
    fn device_count(&self) -> usize;

    /// Begin streaming from the first device.
    fn start(&mut self) -> Result<(), CameraError>;

    /// Block until the next frame is available and copy it into `frame`.
    fn get_frame(&mut self, frame: &mut Frame) -> Result<(), CameraError>;
}

/// Finds fiducial markers in a frame.
pub trait MarkerDetector {
    /// Dictionary this detector decodes.
    fn family(&self) -> MarkerFamily;

    /// Detect every marker in `frame`.
    fn detect(
        &mut self,
        frame: &Frame,
        intrinsics: &CameraIntrinsics,
        marker_size: f64,
    ) -> Vec<MarkerDetection>;
}
