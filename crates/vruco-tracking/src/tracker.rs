use std::path::PathBuf;
use std::sync::Arc;

use vruco_pnp::{PnPMethod, RansacParams};

use crate::calibration::{CalibrationError, CameraIntrinsics};
use crate::channel::PoseChannel;
use crate::control::ControlFlags;
use crate::fps_counter::FrameRateCounter;
use crate::marker_map::{MarkerMap, MarkerMapError};
use crate::pipeline::{FrameOutcome, PosePipeline, DEFAULT_ROOM_CENTRE};
use crate::room_setup::{RoomSetup, RoomSetupConfig};
use crate::solver::{PoseSolver, RansacPoseSolver};
use crate::source::{Camera, CameraError, Frame, MarkerDetector, MarkerFamily};

/// Marker side length of the printed markers, metres.
pub const DEFAULT_MARKER_SIZE: f64 = 0.0744;

/// Fatal tracker errors.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    /// The camera calibration could not be loaded.
    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    /// The calibration does not describe a usable camera.
    #[error("Invalid camera calibration. {0}")]
    Intrinsics(#[from] vruco_pnp::CameraError),

    /// No camera is connected.
    #[error("No camera device found")]
    NoCameraDevice,

    /// The camera failed to start or to deliver a frame.
    #[error(transparent)]
    Camera(#[from] CameraError),

    /// The stored marker map could not be read.
    #[error(transparent)]
    MarkerMap(#[from] MarkerMapError),

    /// The detector decodes a different dictionary than configured.
    #[error("Detector decodes {actual}, tracker is configured for {expected}")]
    FamilyMismatch {
        /// Configured family
        expected: MarkerFamily,
        /// Detector's family
        actual: MarkerFamily,
    },
}

/// Tracker settings.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Marker dictionary.
    pub family: MarkerFamily,
    /// Marker side length, metres.
    pub marker_size: f64,
    /// Room-space point published for the centred position.
    pub room_centre: [f64; 3],
    /// Where the marker map is loaded from at start and saved to after room setup.
    pub marker_map_path: Option<PathBuf>,
    /// Room setup parameters.
    pub room_setup: RoomSetupConfig,
    /// RANSAC parameters of the default pose solver.
    pub ransac: RansacParams,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            family: MarkerFamily::default(),
            marker_size: DEFAULT_MARKER_SIZE,
            room_centre: DEFAULT_ROOM_CENTRE,
            marker_map_path: None,
            room_setup: RoomSetupConfig::default(),
            ransac: RansacParams::default(),
        }
    }
}

/// Per-outcome frame counts of one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    /// Frames read from the camera.
    pub frames: u64,
    /// Poses written to the channel.
    pub published: u64,
    /// Frames without a mapped marker.
    pub no_correspondences: u64,
    /// Frames the solver rejected.
    pub solve_failed: u64,
    /// Frames with an unusable rotation.
    pub degenerate: u64,
    /// Room setups that replaced the map.
    pub room_setups: u64,
}

impl TrackerStats {
    fn record(&mut self, outcome: &FrameOutcome) {
        match outcome {
            FrameOutcome::Published(_) => self.published += 1,
            FrameOutcome::NoCorrespondences => self.no_correspondences += 1,
            FrameOutcome::SolveFailed => self.solve_failed += 1,
            FrameOutcome::DegenerateRotation => self.degenerate += 1,
            FrameOutcome::Backpressured => {}
        }
    }
}

/// The tracking loop: camera, detector, room setup and pose pipeline.
pub struct Tracker<C, D, S = RansacPoseSolver> {
    camera: C,
    detector: D,
    intrinsics: CameraIntrinsics,
    config: TrackerConfig,
    pipeline: PosePipeline<S>,
    room_setup: RoomSetup,
}

impl<C: Camera, D: MarkerDetector> Tracker<C, D> {
    /// Tracker with the default RANSAC pose solver.
    pub fn new(
        camera: C,
        detector: D,
        intrinsics: CameraIntrinsics,
        config: TrackerConfig,
    ) -> Result<Self, TrackerError> {
        let solver = RansacPoseSolver::new(PnPMethod::Auto, config.ransac.clone());
        Self::with_solver(camera, detector, intrinsics, solver, config)
    }
}

impl<C: Camera, D: MarkerDetector, S: PoseSolver> Tracker<C, D, S> {
    /// Tracker with a custom pose solver.
    ///
    /// The marker map is read from [`TrackerConfig::marker_map_path`] when that
    /// file exists; otherwise tracking starts with an empty map until a room
    /// setup is requested.
    pub fn with_solver(
        camera: C,
        detector: D,
        intrinsics: CameraIntrinsics,
        solver: S,
        config: TrackerConfig,
    ) -> Result<Self, TrackerError> {
        if detector.family() != config.family {
            return Err(TrackerError::FamilyMismatch {
                expected: config.family,
                actual: detector.family(),
            });
        }
        let map = initial_map(&config)?;
        let pipeline = PosePipeline::new(solver, &intrinsics, Arc::new(map))?
            .with_room_centre(config.room_centre);
        let room_setup = RoomSetup::new(config.room_setup.clone());
        Ok(Self {
            camera,
            detector,
            intrinsics,
            config,
            pipeline,
            room_setup,
        })
    }

    /// The map currently tracked against.
    pub fn marker_map(&self) -> &Arc<MarkerMap> {
        self.pipeline.marker_map()
    }

    /// Run until exit is requested.
    ///
    /// A room setup request is serviced before the next frame. While the
    /// channel holds an unread pose no frame is grabbed.
    pub fn run(
        &mut self,
        channel: &PoseChannel,
        flags: &ControlFlags,
    ) -> Result<TrackerStats, TrackerError> {
        if self.camera.device_count() == 0 {
            return Err(TrackerError::NoCameraDevice);
        }
        self.camera.start()?;
        let (width, height) = self.intrinsics.resolution;
        log::info!(
            "tracking {} markers of {} ({} m) at {width}x{height}",
            self.marker_map().len(),
            self.config.family,
            self.config.marker_size
        );

        let mut frame = Frame::new(width, height);
        let mut fps = FrameRateCounter::new();
        let mut stats = TrackerStats::default();
        while !flags.exit_requested() {
            if flags.take_calibration() {
                if self.recalibrate(flags) {
                    stats.room_setups += 1;
                }
                continue;
            }
            if channel.is_ready() {
                std::thread::yield_now();
                continue;
            }

            self.camera.get_frame(&mut frame)?;
            stats.frames += 1;
            let detections =
                self.detector
                    .detect(&frame, &self.intrinsics, self.config.marker_size);
            let outcome = self.pipeline.process(&detections, channel, flags);
            stats.record(&outcome);
            if let Some(fps) = fps.tick() {
                log::info!("FPS: {fps}");
            }
        }

        log::info!(
            "tracking stopped after {} frames, {} poses published",
            stats.frames,
            stats.published
        );
        Ok(stats)
    }

    /// Run room setup and swap in the new map. Returns whether the map changed.
    fn recalibrate(&mut self, flags: &ControlFlags) -> bool {
        log::info!("room setup requested");
        let map = match self.room_setup.build_map(
            &mut self.camera,
            &mut self.detector,
            &self.intrinsics,
            self.config.family,
            self.config.marker_size,
            flags,
        ) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("room setup failed, keeping the previous map. {e}");
                return false;
            }
        };

        if let Some(path) = &self.config.marker_map_path {
            match map.save(path) {
                Ok(()) => log::info!("saved marker map to {}", path.display()),
                Err(e) => log::warn!("could not save the marker map. {e}"),
            }
        }
        log::info!("marker map now has {} markers", map.len());
        self.pipeline.set_marker_map(Arc::new(map));
        true
    }
}

fn initial_map(config: &TrackerConfig) -> Result<MarkerMap, TrackerError> {
    let empty = || MarkerMap::new(config.family, config.marker_size);
    let Some(path) = &config.marker_map_path else {
        return Ok(empty());
    };
    if !path.exists() {
        log::info!(
            "no marker map at {}, send 'calibrate' to build one",
            path.display()
        );
        return Ok(empty());
    }

    let map = MarkerMap::load(path)?;
    if map.family() != config.family || map.marker_size() != config.marker_size {
        log::warn!(
            "marker map {} was built for {} ({} m), ignoring it",
            path.display(),
            map.family(),
            map.marker_size()
        );
        return Ok(empty());
    }
    log::info!("loaded {} markers from {}", map.len(), path.display());
    Ok(map)
}
