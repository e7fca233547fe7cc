//! High-resolution timer for frame timing and profiling.

use std::time::{Duration, Instant};

/// High-resolution timer for measuring elapsed time.
#[derive(Debug)]
pub struct Timer {
    start: Instant,
    last_tick: Instant,
}

impl Timer {
    /// Create a new timer, starting from now.
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start: now,
            last_tick: now,
        }
    }

    /// Get the total elapsed time since the timer was created.
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Get the elapsed time in seconds since the timer was created.
    pub fn elapsed_secs(&self) -> f32 {
        self.elapsed().as_secs_f32()
    }

    /// Get the time elapsed since the last call to `tick()`.
    /// This is useful for calculating delta time in a game loop.
    pub fn tick(&mut self) -> Duration {
        let now = Instant::now();
        let delta = now - self.last_tick;
        self.last_tick = now;
        delta
    }

    /// Reset the timer to the current time.
    pub fn reset(&mut self) {
        let now = Instant::now();
        self.start = now;
        self.last_tick = now;
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

/// Summary produced by [`FrameCounter`] once per reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    /// Frames recorded in the interval.
    pub frames: u32,
    /// Average frames per second over the interval.
    pub fps: f64,
    /// Longest single frame in the interval.
    pub worst_frame: Duration,
}

/// Accumulates frame durations and emits a [`FrameReport`] per interval.
#[derive(Debug)]
pub struct FrameCounter {
    interval: Duration,
    accumulated: Duration,
    frames: u32,
    worst_frame: Duration,
}

impl FrameCounter {
    /// Creates a counter reporting every `interval`.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            accumulated: Duration::ZERO,
            frames: 0,
            worst_frame: Duration::ZERO,
        }
    }

    /// Records one frame; returns a report when the interval has elapsed.
    pub fn record(&mut self, frame_time: Duration) -> Option<FrameReport> {
        self.accumulated += frame_time;
        self.frames += 1;
        self.worst_frame = self.worst_frame.max(frame_time);

        if self.accumulated < self.interval {
            return None;
        }

        let report = FrameReport {
            frames: self.frames,
            fps: f64::from(self.frames) / self.accumulated.as_secs_f64(),
            worst_frame: self.worst_frame,
        };
        self.accumulated = Duration::ZERO;
        self.frames = 0;
        self.worst_frame = Duration::ZERO;
        Some(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_tick_is_monotonic() {
        let mut timer = Timer::new();
        let first = timer.tick();
        let second = timer.tick();
        assert!(first >= Duration::ZERO);
        assert!(second >= Duration::ZERO);
        assert!(timer.elapsed() >= first);
    }

    #[test]
    fn test_frame_counter_reports_once_per_interval() {
        let mut counter = FrameCounter::new(Duration::from_secs(1));
        let frame = Duration::from_millis(250);

        assert!(counter.record(frame).is_none());
        assert!(counter.record(frame).is_none());
        assert!(counter.record(frame).is_none());
        let report = counter.record(frame).expect("interval elapsed");

        assert_eq!(report.frames, 4);
        assert!((report.fps - 4.0).abs() < 1e-9);
        assert_eq!(report.worst_frame, frame);
        assert!(counter.record(frame).is_none());
    }

    #[test]
    fn test_frame_counter_tracks_worst_frame() {
        let mut counter = FrameCounter::new(Duration::from_millis(100));
        counter.record(Duration::from_millis(10));
        let report = counter
            .record(Duration::from_millis(95))
            .expect("interval elapsed");
        assert_eq!(report.worst_frame, Duration::from_millis(95));
    }
}
