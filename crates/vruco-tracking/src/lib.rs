#![deny(missing_docs)]
#![doc = env!("CARGO_PKG_DESCRIPTION")]
//!
//! # vruco tracking
//!
//! Head tracking from fixed fiducial markers: a single camera watches markers
//! placed around a room, the pose pipeline turns each frame's detections into
//! a head pose, and the pose is handed to a consumer process through a
//! single-slot shared record.
//!
//! ## Pieces
//!
//! - [`calibration`]: camera intrinsics in the plain-text calibration layout
//! - [`marker_map`]: marker id to room-space corners, persisted as JSON
//! - [`room_setup`]: builds a marker map by observing the room
//! - [`pipeline`]: detections to published pose, one frame at a time
//! - [`channel`] and [`shm`]: the published record and its shared mapping
//! - [`control`]: `centre`, `calibrate` and `exit` requests
//! - [`tracker`]: the tracking-thread loop
//! - [`replay`]: recorded detections standing in for camera and detector
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use vruco_tracking::{
//!     CameraIntrinsics, ControlFlags, FrameOutcome, MarkerDetection, MarkerFamily, MarkerMap,
//!     MarkerMapEntry, PoseChannel, PosePipeline, RansacPoseSolver,
//! };
//!
//! let intrinsics = CameraIntrinsics::parse(
//!     "3 3\n500 0 320\n0 500 240\n0 0 1\n1 5\n0 0 0 0 0\n",
//!     (640, 480),
//! )?;
//! let marker = MarkerMapEntry {
//!     id: 7,
//!     points: vruco_pnp::square_object_points(0.1),
//! };
//! let map = MarkerMap::from_entries(MarkerFamily::ArucoMip36h12, 0.1, [marker])?;
//! let mut pipeline = PosePipeline::new(RansacPoseSolver::default(), &intrinsics, Arc::new(map))?;
//!
//! let channel = PoseChannel::new();
//! let flags = ControlFlags::new();
//! let detections = [MarkerDetection {
//!     id: 7,
//!     corners: [[295.0, 215.0], [345.0, 215.0], [345.0, 265.0], [295.0, 265.0]],
//! }];
//! if let FrameOutcome::Published(pose) = pipeline.process(&detections, &channel, &flags) {
//!     println!("head at {:?}", pose.position);
//! }
//! assert!(channel.try_consume().is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

/// Camera intrinsics loading and serialization.
pub mod calibration;

/// The single-slot pose record.
pub mod channel;

/// Operator requests shared between threads.
pub mod control;

/// Solver rotation to consumer orientation.
pub mod convention;

/// Per-frame image/room point pairing.
pub mod correspondence;

/// Frame-rate accounting.
pub mod fps_counter;

/// Marker id to room-space corners.
pub mod marker_map;

/// Detections to published pose.
pub mod pipeline;

/// Recorded detection playback.
pub mod replay;

/// Marker map construction from live observations.
pub mod room_setup;

/// File-backed shared mapping of the pose record.
pub mod shm;

/// Pose solver seam.
pub mod solver;

/// Camera and marker detector interfaces.
pub mod source;

/// The tracking loop.
pub mod tracker;

pub use calibration::{CalibrationError, CameraIntrinsics};
pub use channel::{ChannelState, Pose, PoseChannel};
pub use control::{run_control_loop, Command, ControlFlags};
pub use convention::to_consumer_orientation;
pub use correspondence::CorrespondenceSet;
pub use fps_counter::FrameRateCounter;
pub use marker_map::{MarkerMap, MarkerMapEntry, MarkerMapError};
pub use pipeline::{FrameOutcome, PosePipeline, DEFAULT_ROOM_CENTRE};
pub use replay::{ReplayCamera, ReplayDetector, ReplayError, ReplaySession};
pub use room_setup::{RoomSetup, RoomSetupConfig, RoomSetupError};
pub use shm::{SharedPoseRegion, ShmError, DEFAULT_SHM_PATH};
pub use solver::{Extrinsics, PoseSolver, RansacPoseSolver};
pub use source::{Camera, CameraError, Frame, MarkerDetection, MarkerDetector, MarkerFamily};
pub use tracker::{Tracker, TrackerConfig, TrackerError, TrackerStats, DEFAULT_MARKER_SIZE};
