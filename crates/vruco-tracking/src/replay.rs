//! Recorded marker detections played back as a camera and detector pair.
//!
//! A session file holds one JSON object per line, one line per frame:
//!
//! ```text
//! {"markers":[{"id":1,"corners":[[295,215],[345,215],[345,265],[295,265]]}]}
//! {"markers":[]}
//! ```
//!
//! [`ReplayCamera`] stamps each frame with a sequence number and
//! [`ReplayDetector`] returns the detections recorded for that number, looping
//! over the session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::calibration::CameraIntrinsics;
use crate::source::{Camera, CameraError, Frame, MarkerDetection, MarkerDetector, MarkerFamily};

/// Error raised while reading a session.
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    /// The session file could not be read.
    #[error("Failed to read replay session {path}. {source}")]
    Io {
        /// Session file
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// A line is not a valid frame record.
    #[error("Invalid frame record on line {line}. {source}")]
    Json {
        /// 1-based line number
        line: usize,
        /// Parse error
        source: serde_json::Error,
    },

    /// The session has no frames.
    #[error("Replay session has no frames")]
    Empty,
}

#[derive(Serialize, Deserialize)]
struct FrameRecord {
    markers: Vec<MarkerDetection>,
}

/// Detections of every recorded frame.
#[derive(Debug, Clone)]
pub struct ReplaySession {
    frames: Arc<Vec<Vec<MarkerDetection>>>,
}

impl ReplaySession {
    /// Wrap in-memory frames.
    pub fn from_frames(frames: Vec<Vec<MarkerDetection>>) -> Result<Self, ReplayError> {
        if frames.is_empty() {
            return Err(ReplayError::Empty);
        }
        Ok(Self {
            frames: Arc::new(frames),
        })
    }

    /// Parse JSON-lines text. Blank lines are skipped.
    pub fn parse(text: &str) -> Result<Self, ReplayError> {
        let frames = text
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(i, line)| {
                serde_json::from_str::<FrameRecord>(line)
                    .map(|record| record.markers)
                    .map_err(|source| ReplayError::Json { line: i + 1, source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_frames(frames)
    }

    /// Read a session file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ReplayError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ReplayError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let session = Self::parse(&text)?;
        log::info!(
            "loaded replay session {} with {} frames",
            path.display(),
            session.len()
        );
        Ok(session)
    }

    /// Serialize back into JSON lines.
    pub fn to_json_lines(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for markers in self.frames.iter() {
            let line = serde_json::to_string(&FrameRecord {
                markers: markers.clone(),
            })?;
            out.push_str(&line);
            out.push('\n');
        }
        Ok(out)
    }

    /// Number of recorded frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// Always `false`; an empty session cannot be built.
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Detections of frame `sequence`, wrapping at the end of the session.
    pub fn frame(&self, sequence: u64) -> &[MarkerDetection] {
        let index = (sequence % self.frames.len() as u64) as usize;
        &self.frames[index]
    }

    /// A camera that plays this session at `fps` frames per second.
    ///
    /// `fps == 0` delivers frames as fast as they are requested.
    pub fn camera(&self, resolution: (u32, u32), fps: u32) -> ReplayCamera {
        ReplayCamera {
            session: self.clone(),
            resolution,
            interval: (fps > 0).then(|| Duration::from_secs_f64(1.0 / fps as f64)),
            next_due: None,
            sequence: 0,
            started: false,
        }
    }

    /// A detector returning this session's detections for `family`.
    pub fn detector(&self, family: MarkerFamily) -> ReplayDetector {
        ReplayDetector {
            session: self.clone(),
            family,
        }
    }
}

/// Frame source backed by a [`ReplaySession`].
///
/// Frames are black; only their sequence numbers carry information.
#[derive(Debug)]
pub struct ReplayCamera {
    session: ReplaySession,
    resolution: (u32, u32),
    interval: Option<Duration>,
    next_due: Option<Instant>,
    sequence: u64,
    started: bool,
}

impl ReplayCamera {
    /// Frames delivered so far.
    pub fn frames_delivered(&self) -> u64 {
        self.sequence
    }

    fn wait_for_next_frame(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        let due = self.next_due.unwrap_or(now);
        if due > now {
            std::thread::sleep(due - now);
        }
        // fell more than one frame behind: restart the schedule
        let next = due + interval;
        self.next_due = Some(if next < now { now + interval } else { next });
    }
}

impl Camera for ReplayCamera {
    fn device_count(&self) -> usize {
        1
    }

    fn start(&mut self) -> Result<(), CameraError> {
        self.started = true;
        self.next_due = None;
        log::debug!(
            "replay camera started at {}x{}",
            self.resolution.0,
            self.resolution.1
        );
        Ok(())
    }

    fn get_frame(&mut self, frame: &mut Frame) -> Result<(), CameraError> {
        if !self.started {
            return Err(CameraError::ReadFailed("stream not started".to_string()));
        }
        let (width, height) = self.resolution;
        let expected = width as usize * height as usize * 3;
        let actual = frame.as_slice().len();
        if actual != expected {
            return Err(CameraError::BufferSize { expected, actual });
        }
        self.wait_for_next_frame();
        frame.sequence = self.sequence;
        self.sequence += 1;
        Ok(())
    }
}

/// Detector answering from a [`ReplaySession`] by frame sequence number.
#[derive(Debug, Clone)]
pub struct ReplayDetector {
    session: ReplaySession,
    family: MarkerFamily,
}

impl MarkerDetector for ReplayDetector {
    fn family(&self) -> MarkerFamily {
        self.family
    }

    fn detect(
        &mut self,
        frame: &Frame,
        _intrinsics: &CameraIntrinsics,
        _marker_size: f64,
    ) -> Vec<MarkerDetection> {
        self.session.frame(frame.sequence).to_vec()
    }
}
