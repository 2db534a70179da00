//! Vsync sources and frame timing
//!
//! The scheduler sleeps on a [`VsyncSource`] between frames. [`OutputClock`]
//! paces frames at an output's refresh interval; [`ChannelVsync`] lets a
//! caller trigger each vsync explicitly, which tests and external display
//! drivers use.
//!
//! [`FramePacer`] measures how long each presentation took and keeps the
//! running [`FrameStats`].
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//! use wally::renderer::frame_pacing::FramePacer;
//!
//! let mut pacer = FramePacer::new(Duration::from_millis(16));
//! pacer.begin_frame();
//! // submit the frame
//! pacer.end_frame(true);
//! assert_eq!(pacer.stats().total_frames, 1);
//! ```

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Maximum number of frame times to track for the averages
const FRAME_HISTORY_SIZE: usize = 120;

/// Threshold for considering a frame as "missed" (missed deadline)
const MISSED_FRAME_THRESHOLD: f32 = 1.5; // 50% over target

/// A vertical blank
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VsyncEvent {
    pub sequence: u64,
    pub timestamp: Instant,
}

/// Something the scheduler can wait on between frames
pub trait VsyncSource: Send {
    /// Blocks until the next vsync; `None` when the source has shut down
    fn wait_vsync(&mut self) -> Option<VsyncEvent>;
}

impl<V: VsyncSource + ?Sized> VsyncSource for Box<V> {
    fn wait_vsync(&mut self) -> Option<VsyncEvent> {
        (**self).wait_vsync()
    }
}

/// Fixed-rate clock derived from an output refresh rate
pub struct OutputClock {
    interval: Duration,
    next: Instant,
    sequence: u64,
}

impl OutputClock {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now() + interval,
            sequence: 0,
        }
    }

    /// Clock for a refresh rate given in mHz
    pub fn from_refresh_mhz(refresh_mhz: u32) -> Self {
        let mhz = refresh_mhz.max(1) as u64;
        let interval = Duration::from_nanos(1_000_000_000_000 / mhz);
        info!(
            "🎬 Output clock: {:.2} Hz ({:?} per frame)",
            mhz as f64 / 1000.0,
            interval
        );
        Self::new(interval)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl VsyncSource for OutputClock {
    fn wait_vsync(&mut self) -> Option<VsyncEvent> {
        let now = Instant::now();
        if self.next > now {
            std::thread::sleep(self.next - now);
        } else {
            // Running behind; skip the vblanks we already missed
            let behind = now.duration_since(self.next);
            let missed = behind.as_nanos() / self.interval.as_nanos().max(1);
            if missed > 0 {
                debug!("⏱️ Skipping {} missed vblanks", missed);
            }
            match u32::try_from(missed) {
                Ok(skipped) => self.next += self.interval * skipped,
                // Stalled too long to step forward; restart the cadence
                Err(_) => self.next = now,
            }
        }

        let timestamp = self.next;
        self.next += self.interval;
        self.sequence += 1;
        Some(VsyncEvent {
            sequence: self.sequence,
            timestamp,
        })
    }
}

/// Vsync driven by messages on a channel
pub struct ChannelVsync {
    ticks: mpsc::Receiver<()>,
    sequence: u64,
}

impl ChannelVsync {
    /// Returns the source and the sender that triggers each vsync; dropping
    /// the sender shuts the source down
    pub fn new() -> (Self, mpsc::Sender<()>) {
        let (tx, rx) = mpsc::channel();
        (
            Self {
                ticks: rx,
                sequence: 0,
            },
            tx,
        )
    }
}

impl VsyncSource for ChannelVsync {
    fn wait_vsync(&mut self) -> Option<VsyncEvent> {
        self.ticks.recv().ok()?;
        self.sequence += 1;
        Some(VsyncEvent {
            sequence: self.sequence,
            timestamp: Instant::now(),
        })
    }
}

/// Statistics about frame timing
#[derive(Debug, Clone, PartialEq)]
pub struct FrameStats {
    /// Frames successfully presented
    pub total_frames: u64,
    /// Failed presentation attempts
    pub failed_frames: u64,
    /// Average presentation time over recent frames
    pub avg_frame_time: Duration,
    /// Maximum presentation time over recent frames
    pub max_frame_time: Duration,
    /// Presentations that took longer than the deadline allows
    pub missed_frames: u64,
    /// Percentage of presented frames that missed the deadline
    pub miss_rate: f32,
}

impl Default for FrameStats {
    fn default() -> Self {
        Self {
            total_frames: 0,
            failed_frames: 0,
            avg_frame_time: Duration::ZERO,
            max_frame_time: Duration::ZERO,
            missed_frames: 0,
            miss_rate: 0.0,
        }
    }
}

/// Measures presentation timing against the refresh interval
pub struct FramePacer {
    target: Duration,
    frame_history: VecDeque<Duration>,
    frame_start: Option<Instant>,
    stats: FrameStats,
}

impl FramePacer {
    pub fn new(target: Duration) -> Self {
        Self {
            target,
            frame_history: VecDeque::with_capacity(FRAME_HISTORY_SIZE),
            frame_start: None,
            stats: FrameStats::default(),
        }
    }

    /// Begins a new frame (call before submitting)
    pub fn begin_frame(&mut self) {
        self.frame_start = Some(Instant::now());
    }

    /// Ends the current frame and records timing
    pub fn end_frame(&mut self, presented: bool) {
        let Some(start) = self.frame_start.take() else {
            warn!("end_frame called without begin_frame");
            return;
        };

        if !presented {
            self.stats.failed_frames += 1;
            return;
        }

        let duration = start.elapsed();
        let missed = duration.as_secs_f32() > self.target.as_secs_f32() * MISSED_FRAME_THRESHOLD;
        if missed {
            self.stats.missed_frames += 1;
            warn!(
                "⚠️ Frame missed deadline: {:?} (target: {:?})",
                duration, self.target
            );
        }

        self.frame_history.push_back(duration);
        if self.frame_history.len() > FRAME_HISTORY_SIZE {
            self.frame_history.pop_front();
        }
        self.stats.total_frames += 1;

        self.update_stats();
    }

    fn update_stats(&mut self) {
        if self.frame_history.is_empty() {
            return;
        }

        let total: Duration = self.frame_history.iter().sum();
        self.stats.avg_frame_time = total / self.frame_history.len() as u32;
        self.stats.max_frame_time = self
            .frame_history
            .iter()
            .copied()
            .max()
            .unwrap_or(Duration::ZERO);

        if self.stats.total_frames > 0 {
            self.stats.miss_rate =
                (self.stats.missed_frames as f32 / self.stats.total_frames as f32) * 100.0;
        }
    }

    pub fn target(&self) -> Duration {
        self.target
    }

    /// Gets frame statistics
    pub fn stats(&self) -> &FrameStats {
        &self.stats
    }
}
