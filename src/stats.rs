// Frame statistics for the paint loop
use std::time::{Duration, Instant};

/// Summary of one reporting window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameReport {
    pub fps: f64,
    /// Mean time spent inside a frame cycle
    pub avg_frame_time: Duration,
    pub max_frame_time: Duration,
}

/// Frame rate and per-frame cost, reported once per interval
pub struct FrameStats {
    window_start: Instant,
    window_frames: u32,
    window_busy: Duration,
    window_max: Duration,
    total_frames: u64,
    last_report: Option<FrameReport>,
    report_interval: Duration,
}

impl FrameStats {
    pub fn new(report_interval: Duration) -> Self {
        Self {
            window_start: Instant::now(),
            window_frames: 0,
            window_busy: Duration::ZERO,
            window_max: Duration::ZERO,
            total_frames: 0,
            last_report: None,
            report_interval,
        }
    }

    /// Record a frame that took `frame_time`
    /// Returns a report when the interval has elapsed
    pub fn tick(&mut self, frame_time: Duration) -> Option<FrameReport> {
        self.window_frames += 1;
        self.total_frames += 1;
        self.window_busy += frame_time;
        self.window_max = self.window_max.max(frame_time);

        let elapsed = self.window_start.elapsed();
        if elapsed < self.report_interval {
            return None;
        }

        let report = FrameReport {
            fps: f64::from(self.window_frames) / elapsed.as_secs_f64(),
            avg_frame_time: self.window_busy / self.window_frames,
            max_frame_time: self.window_max,
        };
        self.window_start = Instant::now();
        self.window_frames = 0;
        self.window_busy = Duration::ZERO;
        self.window_max = Duration::ZERO;
        self.last_report = Some(report);
        Some(report)
    }

    pub fn last_report(&self) -> Option<FrameReport> {
        self.last_report
    }

    pub fn total_frames(&self) -> u64 {
        self.total_frames
    }
}
