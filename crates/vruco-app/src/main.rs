use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use argh::FromArgs;
use vruco_pnp::RansacParams;
use vruco_tracking::{
    run_control_loop, CameraIntrinsics, ControlFlags, MarkerFamily, ReplaySession,
    RoomSetupConfig, SharedPoseRegion, Tracker, TrackerConfig, TrackerError, DEFAULT_MARKER_SIZE,
    DEFAULT_ROOM_CENTRE, DEFAULT_SHM_PATH,
};

#[derive(FromArgs, Debug)]
/// Track a head-mounted camera against fixed ArUco markers and publish its pose.
///
/// Type `centre`, `calibrate` or `exit` on standard input while tracking.
struct Args {
    /// camera calibration file
    #[argh(
        option,
        short = 'c',
        default = "PathBuf::from(\"ps3_eye_calibration.txt\")"
    )]
    calibration: PathBuf,

    /// frame width in pixels
    #[argh(option, default = "640")]
    width: u32,

    /// frame height in pixels
    #[argh(option, default = "480")]
    height: u32,

    /// camera frames per second
    #[argh(option, short = 'f', default = "60")]
    fps: u32,

    /// marker side length in metres
    #[argh(option, short = 's', default = "DEFAULT_MARKER_SIZE")]
    marker_size: f64,

    /// marker dictionary
    #[argh(option, default = "MarkerFamily::default()")]
    family: MarkerFamily,

    /// marker map JSON, loaded at start and written after room setup
    #[argh(option, short = 'm')]
    marker_map: Option<PathBuf>,

    /// file holding the shared pose record
    #[argh(option, default = "PathBuf::from(DEFAULT_SHM_PATH)")]
    shm: PathBuf,

    /// recorded detections (JSON lines) to play back instead of a camera
    #[argh(option, short = 'r')]
    replay: Option<PathBuf>,

    /// marker whose frame becomes the room frame during room setup
    #[argh(option)]
    reference_marker: Option<u32>,

    /// frames collected by room setup
    #[argh(option, default = "120")]
    setup_frames: usize,
}

fn main() -> ExitCode {
    env_logger::init();
    let args: Args = argh::from_env();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let resolution = (args.width, args.height);
    let intrinsics =
        CameraIntrinsics::load(&args.calibration, resolution).map_err(TrackerError::from)?;
    log::info!("loaded calibration {}", args.calibration.display());

    // without camera drivers the only frame source is a recorded session
    let Some(replay) = &args.replay else {
        return Err(TrackerError::NoCameraDevice.into());
    };
    let session = ReplaySession::load(replay)?;

    let config = TrackerConfig {
        family: args.family,
        marker_size: args.marker_size,
        room_centre: DEFAULT_ROOM_CENTRE,
        marker_map_path: args.marker_map.clone(),
        room_setup: RoomSetupConfig {
            frames: args.setup_frames,
            reference_id: args.reference_marker,
            ..Default::default()
        },
        ransac: RansacParams::default(),
    };
    let mut tracker = Tracker::new(
        session.camera(resolution, args.fps),
        session.detector(args.family),
        intrinsics,
        config,
    )?;
    let region = SharedPoseRegion::open(&args.shm)?;

    let flags = Arc::new(ControlFlags::new());
    ctrlc::set_handler({
        let flags = flags.clone();
        move || {
            log::info!("received Ctrl-C, stopping");
            flags.request_exit();
        }
    })?;

    // not scoped: a blocked stdin read must not keep the process alive
    // once tracking has stopped
    std::thread::Builder::new()
        .name("control".to_string())
        .spawn({
            let flags = flags.clone();
            move || run_control_loop(std::io::stdin().lock(), &flags)
        })?;
    log::info!("commands: centre, calibrate, exit");

    let stats = std::thread::scope(|s| -> Result<_, Box<dyn std::error::Error>> {
        let tracking = std::thread::Builder::new()
            .name("tracking".to_string())
            .spawn_scoped(s, || tracker.run(region.channel(), &flags))?;
        match tracking.join() {
            Ok(res) => Ok(res?),
            Err(_) => Err("tracking thread panicked".into()),
        }
    })?;

    log::info!(
        "published {} poses from {} frames, {} room setups",
        stats.published,
        stats.frames,
        stats.room_setups
    );
    Ok(())
}
