use std::sync::Arc;

use glam::DVec3;
use vruco_pnp::{CameraError, CameraModel};

use crate::calibration::CameraIntrinsics;
use crate::channel::{Pose, PoseChannel};
use crate::control::ControlFlags;
use crate::convention::to_consumer_orientation;
use crate::correspondence::CorrespondenceSet;
use crate::marker_map::MarkerMap;
use crate::solver::{Extrinsics, PoseSolver, RansacPoseSolver};
use crate::source::MarkerDetection;

/// Room-space point published when the tracked position is the origin.
pub const DEFAULT_ROOM_CENTRE: [f64; 3] = [0.0, 1.75, 0.0];

/// What happened to one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameOutcome {
    /// The consumer has not read the last pose; the frame was dropped.
    Backpressured,
    /// No detected marker is in the map.
    NoCorrespondences,
    /// The solver could not produce a pose.
    SolveFailed,
    /// The solved rotation has no usable axis.
    DegenerateRotation,
    /// A pose was written to the channel.
    Published(Pose),
}

/// Turns per-frame marker detections into published poses.
pub struct PosePipeline<S = RansacPoseSolver> {
    solver: S,
    camera: CameraModel,
    map: Arc<MarkerMap>,
    previous: Option<Extrinsics>,
    offset: [f64; 3],
    room_centre: [f64; 3],
}

impl<S: PoseSolver> PosePipeline<S> {
    /// Create a pipeline for a calibrated camera and an initial map.
    pub fn new(
        solver: S,
        intrinsics: &CameraIntrinsics,
        map: Arc<MarkerMap>,
    ) -> Result<Self, CameraError> {
        Ok(Self {
            solver,
            camera: intrinsics.camera_model()?,
            map,
            previous: None,
            offset: [0.0; 3],
            room_centre: DEFAULT_ROOM_CENTRE,
        })
    }

    /// Publish positions relative to `centre` instead of [`DEFAULT_ROOM_CENTRE`].
    pub fn with_room_centre(mut self, centre: [f64; 3]) -> Self {
        self.room_centre = centre;
        self
    }

    /// The map currently used for correspondences.
    pub fn marker_map(&self) -> &Arc<MarkerMap> {
        &self.map
    }

    /// Swap in a new map. The previous solution is dropped as a seed since it
    /// was expressed in the old room frame.
    pub fn set_marker_map(&mut self, map: Arc<MarkerMap>) {
        self.map = map;
        self.previous = None;
    }

    /// Current re-centring offset.
    pub fn offset(&self) -> [f64; 3] {
        self.offset
    }

    /// Last successful solution.
    pub fn last_extrinsics(&self) -> Option<&Extrinsics> {
        self.previous.as_ref()
    }

    /// Process one frame's detections and publish the resulting pose.
    ///
    /// Nothing is computed while the channel still holds an unread pose.
    pub fn process(
        &mut self,
        detections: &[MarkerDetection],
        channel: &PoseChannel,
        flags: &ControlFlags,
    ) -> FrameOutcome {
        if channel.is_ready() {
            return FrameOutcome::Backpressured;
        }

        let set = CorrespondenceSet::build(detections, &self.map);
        if set.is_empty() {
            log::trace!("{} detections, none mapped", detections.len());
            return FrameOutcome::NoCorrespondences;
        }

        let extrinsics =
            match self
                .solver
                .solve(&set.room, &set.image, &self.camera, self.previous.as_ref())
            {
                Ok(extrinsics) => extrinsics,
                Err(e) => {
                    log::trace!("pose solve failed for markers {:?}: {e}", set.ids);
                    return FrameOutcome::SolveFailed;
                }
            };
        self.previous = Some(extrinsics);

        let position = extrinsics.camera_position();
        let Some(orientation) = to_consumer_orientation(&extrinsics.rvec) else {
            log::trace!("degenerate rotation {:?}", extrinsics.rvec);
            return FrameOutcome::DegenerateRotation;
        };

        if flags.take_centre() {
            self.offset = (-position).to_array();
            log::info!(
                "centred on [{:.3}, {:.3}, {:.3}]",
                position.x,
                position.y,
                position.z
            );
        }

        let published = position + DVec3::from(self.room_centre) + DVec3::from(self.offset);
        let pose = Pose {
            position: published.as_vec3().to_array(),
            orientation: orientation.map(|v| v as f32),
        };
        if !channel.publish(&pose) {
            return FrameOutcome::Backpressured;
        }
        log::trace!(
            "published {:?} from {} markers, rmse {:.3}px",
            pose.position,
            set.ids.len(),
            extrinsics.rmse
        );
        FrameOutcome::Published(pose)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker_map::MarkerMapEntry;
    use crate::source::MarkerFamily;
    use approx::assert_relative_eq;
    use vruco_pnp::{square_object_points, PnPError, RansacParams};

    const HEAD_ON: [[f64; 2]; 4] = [[295.0, 215.0], [345.0, 215.0], [345.0, 265.0], [295.0, 265.0]];

    fn intrinsics() -> CameraIntrinsics {
        CameraIntrinsics::parse("3 3\n500 0 320\n0 500 240\n0 0 1\n1 5\n0 0 0 0 0\n", (640, 480))
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn single_marker_map() -> Arc<MarkerMap> {
        let entry = MarkerMapEntry {
            id: 7,
            points: square_object_points(0.1),
        };
        Arc::new(
            MarkerMap::from_entries(MarkerFamily::ArucoMip36h12, 0.1, [entry])
                .unwrap_or_else(|e| panic!("{e}")),
        )
    }

    fn pipeline() -> PosePipeline {
        let solver = RansacPoseSolver {
            params: RansacParams {
                random_seed: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        PosePipeline::new(solver, &intrinsics(), single_marker_map())
            .unwrap_or_else(|e| panic!("{e}"))
    }

    fn head_on() -> Vec<MarkerDetection> {
        vec![MarkerDetection {
            id: 7,
            corners: HEAD_ON,
        }]
    }

    /// Returns a fixed answer, or fails when none is set.
    struct FixedSolver(Option<Extrinsics>);

    impl PoseSolver for FixedSolver {
        fn solve(
            &mut self,
            _room: &[[f64; 3]],
            _image: &[[f64; 2]],
            _camera: &CameraModel,
            _seed: Option<&Extrinsics>,
        ) -> Result<Extrinsics, PnPError> {
            self.0
                .ok_or(PnPError::DegenerateConfiguration("no fixed answer"))
        }
    }

    fn fixed(answer: Option<Extrinsics>) -> PosePipeline<FixedSolver> {
        PosePipeline::new(FixedSolver(answer), &intrinsics(), single_marker_map())
            .unwrap_or_else(|e| panic!("{e}"))
    }

    #[test]
    fn test_head_on_at_one_metre() {
        let mut pipeline = pipeline();
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();

        let FrameOutcome::Published(pose) = pipeline.process(&head_on(), &channel, &flags) else {
            panic!("expected a published pose");
        };
        assert_relative_eq!(pose.position[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(pose.position[1], 1.75, epsilon = 1e-4);
        assert_relative_eq!(pose.position[2], 1.0, epsilon = 1e-4);
        assert_relative_eq!(pose.orientation[0], 0.0, epsilon = 1e-4);
        assert_relative_eq!(pose.orientation[1], 0.0, epsilon = 1e-4);
        assert_relative_eq!(pose.orientation[2], 0.0, epsilon = 1e-4);
        assert_relative_eq!(pose.orientation[3].abs(), 1.0, epsilon = 1e-4);
        assert_eq!(channel.try_consume(), Some(pose));
    }

    #[test]
    fn test_backpressure_leaves_record_untouched() {
        let mut pipeline = pipeline();
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();

        let unread = Pose {
            position: [9.0, 9.0, 9.0],
            orientation: [0.0, 0.0, 0.0, 1.0],
        };
        assert!(channel.publish(&unread));
        flags.request_centre();

        for _ in 0..5 {
            assert_eq!(
                pipeline.process(&head_on(), &channel, &flags),
                FrameOutcome::Backpressured
            );
        }
        assert!(pipeline.last_extrinsics().is_none());
        // the centre request waits for a frame that is actually processed
        assert!(flags.take_centre());
        assert_eq!(channel.try_consume(), Some(unread));
    }

    #[test]
    fn test_centring_is_idempotent() {
        let mut pipeline = pipeline();
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();

        flags.request_centre();
        let first = pipeline.process(&head_on(), &channel, &flags);
        let FrameOutcome::Published(first) = first else {
            panic!("expected a published pose, got {first:?}");
        };
        assert_relative_eq!(first.position[0], 0.0, epsilon = 1e-5);
        assert_relative_eq!(first.position[1], 1.75, epsilon = 1e-5);
        assert_relative_eq!(first.position[2], 0.0, epsilon = 1e-5);
        let offset = pipeline.offset();
        channel.try_consume();

        flags.request_centre();
        let second = pipeline.process(&head_on(), &channel, &flags);
        let FrameOutcome::Published(second) = second else {
            panic!("expected a published pose, got {second:?}");
        };
        for i in 0..3 {
            assert_relative_eq!(second.position[i], first.position[i], epsilon = 1e-5);
            assert_relative_eq!(pipeline.offset()[i], offset[i], epsilon = 1e-6);
        }
    }

    #[test]
    fn test_unmapped_ids_do_not_change_the_pose() {
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();

        let mut reference = pipeline();
        let FrameOutcome::Published(expected) = reference.process(&head_on(), &channel, &flags)
        else {
            panic!("expected a published pose");
        };
        channel.try_consume();

        let mut noisy = pipeline();
        let mut detections = head_on();
        detections.insert(
            0,
            MarkerDetection {
                id: 99,
                corners: [[10.0, 10.0], [60.0, 12.0], [58.0, 70.0], [8.0, 66.0]],
            },
        );
        let FrameOutcome::Published(actual) = noisy.process(&detections, &channel, &flags) else {
            panic!("expected a published pose");
        };
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_no_correspondences() {
        let mut pipeline = pipeline();
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();
        let detections = [MarkerDetection {
            id: 1,
            corners: HEAD_ON,
        }];
        assert_eq!(
            pipeline.process(&detections, &channel, &flags),
            FrameOutcome::NoCorrespondences
        );
        assert_eq!(
            pipeline.process(&[], &channel, &flags),
            FrameOutcome::NoCorrespondences
        );
        assert!(!channel.is_ready());
    }

    #[test]
    fn test_solve_failure_is_not_published() {
        let mut pipeline = fixed(None);
        let channel = PoseChannel::new();
        assert_eq!(
            pipeline.process(&head_on(), &channel, &ControlFlags::new()),
            FrameOutcome::SolveFailed
        );
        assert!(!channel.is_ready());
    }

    #[test]
    fn test_zero_rotation_is_degenerate() {
        let mut pipeline = fixed(Some(Extrinsics {
            rvec: [0.0; 3],
            translation: [0.0, 0.0, 1.0],
            rmse: 0.0,
            inliers: 4,
        }));
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();
        flags.request_centre();
        assert_eq!(
            pipeline.process(&head_on(), &channel, &flags),
            FrameOutcome::DegenerateRotation
        );
        assert!(!channel.is_ready());
        assert_eq!(pipeline.offset(), [0.0; 3]);
    }

    #[test]
    fn test_published_quaternions_are_unit() {
        let channel = PoseChannel::new();
        let flags = ControlFlags::new();
        let rvecs = [
            [0.3, -0.2, 0.1],
            [3.0, 0.1, -0.4],
            [-1.2, 2.2, 0.5],
            [0.0, 0.0, 1e-6],
        ];
        for rvec in rvecs {
            let mut pipeline = fixed(Some(Extrinsics {
                rvec,
                translation: [0.1, -0.2, 2.0],
                rmse: 0.0,
                inliers: 4,
            }));
            let FrameOutcome::Published(pose) = pipeline.process(&head_on(), &channel, &flags)
            else {
                panic!("expected a published pose for {rvec:?}");
            };
            let norm: f32 = pose.orientation.iter().map(|v| v * v).sum::<f32>().sqrt();
            assert_relative_eq!(norm, 1.0, epsilon = 1e-5);
            channel.try_consume();
        }
    }

    #[test]
    fn test_new_map_drops_seed() {
        let mut pipeline = pipeline();
        let channel = PoseChannel::new();
        pipeline.process(&head_on(), &channel, &ControlFlags::new());
        assert!(pipeline.last_extrinsics().is_some());
        pipeline.set_marker_map(single_marker_map());
        assert!(pipeline.last_extrinsics().is_none());
    }
}
