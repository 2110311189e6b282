use std::time::{Duration, Instant};

const WINDOW: Duration = Duration::from_secs(1);

/// Counts processed frames per one-second window.
///
/// # Examples
///
/// ```
/// use vruco_tracking::fps_counter::FrameRateCounter;
///
/// let mut counter = FrameRateCounter::new();
/// for _ in 0..100 {
///     if let Some(fps) = counter.tick() {
///         println!("FPS: {fps}");
///     }
/// }
/// ```
pub struct FrameRateCounter {
    window_start: Instant,
    frames: u32,
    last: Option<u32>,
}

impl FrameRateCounter {
    /// Start a window now.
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    fn starting_at(start: Instant) -> Self {
        Self {
            window_start: start,
            frames: 0,
            last: None,
        }
    }

    /// Frames counted in the last completed window.
    #[inline]
    pub fn fps(&self) -> Option<u32> {
        self.last
    }

    /// Count one frame. Returns the window's count when a window has just closed.
    pub fn tick(&mut self) -> Option<u32> {
        self.tick_at(Instant::now())
    }

    fn tick_at(&mut self, now: Instant) -> Option<u32> {
        self.frames += 1;
        if now.duration_since(self.window_start) <= WINDOW {
            return None;
        }
        let count = self.frames;
        self.frames = 0;
        self.window_start = now;
        self.last = Some(count);
        Some(count)
    }
}

impl Default for FrameRateCounter {
    fn default() -> Self {
        Self::new()
    }
}
