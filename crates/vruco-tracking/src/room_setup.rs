//! Building a [`MarkerMap`] by watching the room.
//!
//! Every detection in a frame gives a marker-to-camera transform. Two markers
//! seen in the same frame are therefore related through the camera, and the
//! room frame is propagated outwards from one anchor marker along those links:
//! a marker is placed once at least [`RoomSetupConfig::min_observations`]
//! frames have linked it to already placed markers.

use std::collections::{BTreeMap, BTreeSet};

use glam::{DAffine3, DVec3};
use vruco_pnp::rigid::umeyama;
use vruco_pnp::{
    refine_pose_lm, rvec_to_rotation, solve_square, square_object_points, CameraModel, LMParams,
};

use crate::calibration::CameraIntrinsics;
use crate::control::ControlFlags;
use crate::marker_map::{MarkerMap, MarkerMapEntry};
use crate::source::{Camera, CameraError, Frame, MarkerDetection, MarkerDetector, MarkerFamily};

/// Error raised by [`RoomSetup::build_map`].
#[derive(Debug, thiserror::Error)]
pub enum RoomSetupError {
    /// The detector decodes a different dictionary than requested.
    #[error("Detector decodes {actual}, room setup needs {expected}")]
    FamilyMismatch {
        /// Requested family
        expected: MarkerFamily,
        /// Detector's family
        actual: MarkerFamily,
    },

    /// Marker size is not a positive finite length.
    #[error("Invalid marker size {0}")]
    InvalidMarkerSize(f64),

    /// No usable marker observation was collected.
    #[error("No markers observed during room setup")]
    NoMarkersObserved,

    /// The configured anchor marker was never seen.
    #[error("Reference marker {0} was not observed")]
    ReferenceNotObserved(u32),

    /// The calibration cannot be turned into a camera model.
    #[error(transparent)]
    Intrinsics(#[from] vruco_pnp::CameraError),

    /// Reading a frame failed.
    #[error(transparent)]
    Camera(#[from] CameraError),
}

/// Room setup parameters.
#[derive(Debug, Clone)]
pub struct RoomSetupConfig {
    /// Frames to collect.
    pub frames: usize,
    /// Independent estimates a marker needs before it is placed.
    pub min_observations: usize,
    /// Marker whose frame becomes the room frame. Defaults to the most seen marker.
    pub reference_id: Option<u32>,
    /// Observations reprojecting worse than this are discarded, pixels.
    pub max_reprojection_rmse_px: f64,
}

impl Default for RoomSetupConfig {
    fn default() -> Self {
        Self {
            frames: 120,
            min_observations: 3,
            reference_id: None,
            max_reprojection_rmse_px: 3.0,
        }
    }
}

/// One marker's pose in one frame.
#[derive(Debug, Clone, Copy)]
pub struct MarkerView {
    /// Marker id.
    pub id: u32,
    /// Marker frame to camera frame.
    pub marker_to_camera: DAffine3,
    /// Reprojection RMSE of the square fit, pixels.
    pub rmse: f64,
}

/// The room setup procedure.
#[derive(Debug, Clone, Default)]
pub struct RoomSetup {
    config: RoomSetupConfig,
}

impl RoomSetup {
    /// Room setup with explicit parameters.
    pub fn new(config: RoomSetupConfig) -> Self {
        Self { config }
    }

    /// The parameters in use.
    pub fn config(&self) -> &RoomSetupConfig {
        &self.config
    }

    /// Observe the room through `camera` and build a map of every marker that
    /// could be linked to the anchor.
    ///
    /// Collection stops early when exit is requested; the map is then built
    /// from the frames gathered so far.
    pub fn build_map(
        &self,
        camera: &mut impl Camera,
        detector: &mut impl MarkerDetector,
        intrinsics: &CameraIntrinsics,
        family: MarkerFamily,
        marker_size: f64,
        flags: &ControlFlags,
    ) -> Result<MarkerMap, RoomSetupError> {
        if detector.family() != family {
            return Err(RoomSetupError::FamilyMismatch {
                expected: family,
                actual: detector.family(),
            });
        }
        if !(marker_size.is_finite() && marker_size > 0.0) {
            return Err(RoomSetupError::InvalidMarkerSize(marker_size));
        }
        let model = intrinsics.camera_model()?;

        log::info!("room setup: collecting {} frames", self.config.frames);
        let (width, height) = intrinsics.resolution;
        let mut frame = Frame::new(width, height);
        let mut views = Vec::with_capacity(self.config.frames);
        for _ in 0..self.config.frames {
            if flags.exit_requested() {
                log::info!("room setup interrupted after {} frames", views.len());
                break;
            }
            camera.get_frame(&mut frame)?;
            let detections = detector.detect(&frame, intrinsics, marker_size);
            views.push(self.observe(&detections, &model, marker_size));
        }

        self.map_from_views(&views, family, marker_size)
    }

    /// Estimate every detected marker's pose relative to the camera.
    ///
    /// Detections that cannot be solved, or reproject worse than the
    /// configured limit, are left out. An id repeated within the frame is
    /// used once.
    pub fn observe(
        &self,
        detections: &[MarkerDetection],
        model: &CameraModel,
        marker_size: f64,
    ) -> Vec<MarkerView> {
        let k = model.intrinsics_matrix();
        let object = square_object_points(marker_size);
        let mut seen = BTreeSet::new();
        let mut views = Vec::with_capacity(detections.len());

        for detection in detections {
            if !seen.insert(detection.id) {
                continue;
            }
            let Ok(undistorted) = model.undistort_points(&detection.corners) else {
                continue;
            };
            let corners = [undistorted[0], undistorted[1], undistorted[2], undistorted[3]];
            let Ok(initial) = solve_square(&corners, &k, marker_size) else {
                continue;
            };
            let mut rvec = initial.rvec;
            let mut t = initial.translation;
            let Ok(report) =
                refine_pose_lm(&object, &corners, &k, &mut rvec, &mut t, &LMParams::default())
            else {
                continue;
            };
            if report.rmse > self.config.max_reprojection_rmse_px {
                log::trace!("marker {} dropped, rmse {:.2}px", detection.id, report.rmse);
                continue;
            }
            let r = rvec_to_rotation(&rvec);
            views.push(MarkerView {
                id: detection.id,
                marker_to_camera: DAffine3::from_mat3_translation(r, DVec3::from(t)),
                rmse: report.rmse,
            });
        }
        views
    }

    /// Place markers by propagating the anchor's frame through co-visible pairs.
    pub fn map_from_views(
        &self,
        views: &[Vec<MarkerView>],
        family: MarkerFamily,
        marker_size: f64,
    ) -> Result<MarkerMap, RoomSetupError> {
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for view in views.iter().flatten() {
            *counts.entry(view.id).or_default() += 1;
        }
        if counts.is_empty() {
            return Err(RoomSetupError::NoMarkersObserved);
        }

        let anchor = match self.config.reference_id {
            Some(id) if counts.contains_key(&id) => id,
            Some(id) => return Err(RoomSetupError::ReferenceNotObserved(id)),
            // most frames wins; BTreeMap order makes the smallest id win ties
            None => counts
                .iter()
                .fold((0, 0), |best, (&id, &n)| if n > best.1 { (id, n) } else { best })
                .0,
        };

        let canonical = square_object_points(marker_size).map(DVec3::from);
        let mut placed: BTreeMap<u32, DAffine3> = BTreeMap::new();
        placed.insert(anchor, DAffine3::IDENTITY);

        loop {
            let mut estimates: BTreeMap<u32, Vec<[DVec3; 4]>> = BTreeMap::new();
            for frame in views {
                let Some((best, marker_to_room)) = frame
                    .iter()
                    .filter_map(|v| placed.get(&v.id).map(|m| (v, m)))
                    .min_by(|a, b| a.0.rmse.total_cmp(&b.0.rmse))
                else {
                    continue;
                };
                let camera_to_room = *marker_to_room * best.marker_to_camera.inverse();
                for view in frame.iter().filter(|v| !placed.contains_key(&v.id)) {
                    let to_room = camera_to_room * view.marker_to_camera;
                    estimates
                        .entry(view.id)
                        .or_default()
                        .push(canonical.map(|p| to_room.transform_point3(p)));
                }
            }

            let mut progress = false;
            for (id, corners) in estimates {
                if corners.len() < self.config.min_observations {
                    continue;
                }
                let n = corners.len() as f64;
                let mean: Vec<DVec3> = (0..4)
                    .map(|c| corners.iter().fold(DVec3::ZERO, |acc, q| acc + q[c]) / n)
                    .collect();
                match umeyama(&canonical, &mean) {
                    Ok((r, t)) => {
                        placed.insert(id, DAffine3::from_mat3_translation(r, t));
                        progress = true;
                    }
                    Err(e) => log::debug!("marker {id} not placed: {e}"),
                }
            }
            if !progress {
                break;
            }
        }

        let unplaced: Vec<u32> = counts
            .keys()
            .filter(|id| !placed.contains_key(id))
            .copied()
            .collect();
        if !unplaced.is_empty() {
            log::info!("room setup: too few links to place markers {unplaced:?}");
        }
        log::info!(
            "room setup: placed {} markers around anchor {anchor} from {} frames",
            placed.len(),
            views.len()
        );

        let entries = placed.into_iter().map(|(id, marker_to_room)| MarkerMapEntry {
            id,
            points: canonical.map(|p| marker_to_room.transform_point3(p).to_array()),
        });
        MarkerMap::from_entries(family, marker_size, entries)
            .map_err(|_| RoomSetupError::InvalidMarkerSize(marker_size))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replay::ReplaySession;
    use approx::assert_relative_eq;
    use glam::{DMat3, DQuat};
    use vruco_pnp::PinholeIntrinsics;

    const SIZE: f64 = 0.1;

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::parse("3 3\n500 0 320\n0 500 240\n0 0 1\n1 5\n0 0 0 0 0\n", (640, 480))
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn model() -> CameraModel {
        CameraModel::pinhole(PinholeIntrinsics::new(500.0, 500.0, 320.0, 240.0))
    }

    // marker 1 defines the room; marker 2 sits 40 cm to its right, turned 30° about +y
    fn layout() -> Vec<(u32, DAffine3)> {
        vec![
            (1, DAffine3::IDENTITY),
            (
                2,
                DAffine3::from_rotation_translation(
                    DQuat::from_rotation_y(30f64.to_radians()),
                    DVec3::new(0.4, 0.05, 0.0),
                ),
            ),
        ]
    }

    /// Camera at `eye` looking down -z of the room, slightly rolled.
    fn room_to_camera(eye: DVec3, roll: f64) -> DAffine3 {
        let r = DMat3::from_rotation_z(roll) * DMat3::from_rotation_x(std::f64::consts::PI);
        DAffine3::from_mat3_translation(r, -(r * eye))
    }

    fn render(room_to_camera: DAffine3) -> Vec<MarkerDetection> {
        let model = model();
        layout()
            .into_iter()
            .map(|(id, marker_to_room)| {
                let corners = square_object_points(SIZE).map(|p| {
                    let pc = (room_to_camera * marker_to_room).transform_point3(DVec3::from(p));
                    let (u, v) = model.intrinsics.denormalize(pc.x / pc.z, pc.y / pc.z);
                    [u, v]
                });
                MarkerDetection { id, corners }
            })
            .collect()
    }

    fn session() -> ReplaySession {
        let eyes = [
            (DVec3::new(0.2, 0.0, 1.0), 0.0),
            (DVec3::new(0.1, 0.1, 1.2), 0.1),
            (DVec3::new(0.3, -0.05, 0.9), -0.05),
            (DVec3::new(0.25, 0.02, 1.1), 0.2),
        ];
        let frames = eyes
            .iter()
            .map(|&(eye, roll)| render(room_to_camera(eye, roll)))
            .collect();
        ReplaySession::from_frames(frames).unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_recovers_two_marker_layout() -> Result<(), Box<dyn std::error::Error>> {
        let session = session();
        let setup = RoomSetup::new(RoomSetupConfig {
            frames: session.len(),
            reference_id: Some(1),
            ..Default::default()
        });
        let mut camera = session.camera((640, 480), 0);
        camera.start()?;
        let mut detector = session.detector(MarkerFamily::ArucoMip36h12);

        let map = setup.build_map(
            &mut camera,
            &mut detector,
            &intrinsics(),
            MarkerFamily::ArucoMip36h12,
            SIZE,
            &ControlFlags::new(),
        )?;

        assert_eq!(map.len(), 2);
        assert_eq!(map.marker_size(), SIZE);
        for (id, marker_to_room) in layout() {
            let entry = map.get(id).ok_or("marker missing")?;
            for (got, p) in entry.points.iter().zip(square_object_points(SIZE)) {
                let want = marker_to_room.transform_point3(DVec3::from(p));
                assert_relative_eq!(got[0], want.x, epsilon = 1e-6);
                assert_relative_eq!(got[1], want.y, epsilon = 1e-6);
                assert_relative_eq!(got[2], want.z, epsilon = 1e-6);
            }
        }
        Ok(())
    }

    #[test]
    fn test_too_few_links_leaves_marker_out() {
        let setup = RoomSetup::default();
        let model = model();
        let views = vec![setup.observe(session().frame(0), &model, SIZE)];
        assert_eq!(views[0].len(), 2);
        let map = setup
            .map_from_views(&views, MarkerFamily::ArucoMip36h12, SIZE)
            .unwrap_or_else(|e| panic!("{e}"));
        // one shared frame is below min_observations
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_anchor_is_most_seen_marker() {
        let setup = RoomSetup::default();
        let view = |id| MarkerView {
            id,
            marker_to_camera: DAffine3::from_translation(DVec3::new(0.0, 0.0, 1.0)),
            rmse: 0.1,
        };
        let views = vec![vec![view(5)], vec![view(3)], vec![view(5)], vec![view(9)]];
        let map = setup
            .map_from_views(&views, MarkerFamily::ArucoMip36h12, SIZE)
            .unwrap_or_else(|e| panic!("{e}"));
        let entry = map.get(5).unwrap_or_else(|| panic!("anchor missing"));
        assert_eq!(entry.points, square_object_points(SIZE));

        // tie between 3 and 9 goes to the smaller id
        let views = vec![vec![view(9)], vec![view(3)]];
        let map = setup
            .map_from_views(&views, MarkerFamily::ArucoMip36h12, SIZE)
            .unwrap_or_else(|e| panic!("{e}"));
        assert!(map.contains(3));
        assert!(!map.contains(9));
    }

    #[test]
    fn test_errors() {
        let session = session();
        let setup = RoomSetup::default();
        let flags = ControlFlags::new();
        let mut camera = session.camera((640, 480), 0);
        let mut detector = session.detector(MarkerFamily::Aruco);

        let res = setup.build_map(
            &mut camera,
            &mut detector,
            &intrinsics(),
            MarkerFamily::ArucoMip36h12,
            SIZE,
            &flags,
        );
        assert!(matches!(res, Err(RoomSetupError::FamilyMismatch { .. })));

        let mut detector = session.detector(MarkerFamily::ArucoMip36h12);
        let res = setup.build_map(
            &mut camera,
            &mut detector,
            &intrinsics(),
            MarkerFamily::ArucoMip36h12,
            -1.0,
            &flags,
        );
        assert!(matches!(res, Err(RoomSetupError::InvalidMarkerSize(_))));

        assert!(matches!(
            setup.map_from_views(&[vec![], vec![]], MarkerFamily::ArucoMip36h12, SIZE),
            Err(RoomSetupError::NoMarkersObserved)
        ));

        let anchored = RoomSetup::new(RoomSetupConfig {
            reference_id: Some(77),
            ..Default::default()
        });
        let views = vec![setup.observe(session.frame(0), &model(), SIZE)];
        assert!(matches!(
            anchored.map_from_views(&views, MarkerFamily::ArucoMip36h12, SIZE),
            Err(RoomSetupError::ReferenceNotObserved(77))
        ));
    }

    #[test]
    fn test_exit_stops_collection() -> Result<(), Box<dyn std::error::Error>> {
        let session = session();
        let mut camera = session.camera((640, 480), 0);
        camera.start()?;
        let mut detector = session.detector(MarkerFamily::ArucoMip36h12);
        let flags = ControlFlags::new();
        flags.request_exit();
        let res = RoomSetup::default().build_map(
            &mut camera,
            &mut detector,
            &intrinsics(),
            MarkerFamily::ArucoMip36h12,
            SIZE,
            &flags,
        );
        assert!(matches!(res, Err(RoomSetupError::NoMarkersObserved)));
        assert_eq!(camera.frames_delivered(), 0);
        Ok(())
    }
}
