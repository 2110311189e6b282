use std::io::BufRead;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

/// Requests raised by the operator and serviced by the tracking thread.
#[derive(Debug, Default)]
pub struct ControlFlags {
    centre_requested: AtomicBool,
    calibration_requested: AtomicBool,
    exit_requested: AtomicBool,
}

impl ControlFlags {
    /// No request pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the pipeline to treat the current position as the origin.
    pub fn request_centre(&self) {
        self.centre_requested.store(true, Ordering::Release);
    }

    /// Ask the tracker to run room setup.
    pub fn request_calibration(&self) {
        self.calibration_requested.store(true, Ordering::Release);
    }

    /// Ask every loop to stop.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
    }

    /// Clear and return a pending centre request.
    pub fn take_centre(&self) -> bool {
        self.centre_requested.swap(false, Ordering::AcqRel)
    }

    /// Clear and return a pending calibration request.
    pub fn take_calibration(&self) -> bool {
        self.calibration_requested.swap(false, Ordering::AcqRel)
    }

    /// Whether exit was requested. Never cleared.
    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    /// Set the flag matching `command`.
    pub fn apply(&self, command: Command) {
        match command {
            Command::Exit => self.request_exit(),
            Command::Centre => self.request_centre(),
            Command::Calibrate => self.request_calibration(),
        }
    }
}

/// Operator command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Stop tracking and quit.
    Exit,
    /// Re-centre on the current position.
    Centre,
    /// Rebuild the marker map.
    Calibrate,
}

impl FromStr for Command {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exit" => Ok(Command::Exit),
            "centre" => Ok(Command::Centre),
            "calibrate" => Ok(Command::Calibrate),
            other => Err(other.to_string()),
        }
    }
}

/// Read whitespace-separated commands from `input` until `exit` or end of input.
///
/// End of input or a read error counts as `exit`. Unknown tokens are logged
/// and ignored.
pub fn run_control_loop(input: impl BufRead, flags: &ControlFlags) {
    for line in input.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                log::error!("control input failed: {e}");
                break;
            }
        };
        for token in line.split_whitespace() {
            match token.parse::<Command>() {
                Ok(command) => {
                    log::debug!("command {command:?}");
                    flags.apply(command);
                    if command == Command::Exit {
                        return;
                    }
                }
                Err(_) => log::warn!("Invalid Input"),
            }
        }
        if flags.exit_requested() {
            return;
        }
    }
    flags.request_exit();
}
