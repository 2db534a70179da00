//! Renderer backend boundary
//!
//! The frame scheduler hands every composed [`Frame`] to a [`RenderBackend`]
//! and waits for confirmation that it reached the screen. Real GPU backends
//! live outside this crate; [`HeadlessRenderer`] presents into memory and is
//! used for headless runs and tests.

use std::time::Instant;

use thiserror::Error;

use crate::buffer::BufferLease;
use crate::region::{Rect, Region, Transform};

pub mod frame_pacing;
pub mod headless;

pub use frame_pacing::{ChannelVsync, FramePacer, FrameStats, OutputClock, VsyncEvent, VsyncSource};
pub use headless::{FrameLog, FrameRecord, HeadlessRenderer};

/// One textured rectangle of a frame
#[derive(Debug, Clone)]
pub struct Quad {
    pub surface_id: u32,
    pub client_id: u64,
    /// Position and size in output coordinates
    pub geometry: Rect,
    pub transform: Transform,
    pub scale: i32,
    /// Keeps the buffer alive for as long as the frame exists
    pub buffer: BufferLease,
}

impl Quad {
    pub fn buffer_id(&self) -> u32 {
        self.buffer.buffer().id()
    }
}

/// Everything needed to draw one output refresh
#[derive(Debug, Clone)]
pub struct Frame {
    /// Scheduler-assigned frame number
    pub seq: u64,
    /// Output size in pixels
    pub output_size: (u32, u32),
    /// Quads back to front
    pub quads: Vec<Quad>,
    /// Area that changed since the last presented frame, output coordinates
    pub damage: Region,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }
}

/// Confirmation that a frame reached the screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Presented {
    pub frame_seq: u64,
    pub presented_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RenderError {
    #[error("presentation of frame {frame_seq} failed: {reason}")]
    PresentFailed { frame_seq: u64, reason: String },

    #[error("render device lost")]
    DeviceLost,
}

/// A sink for composed frames
///
/// `submit` blocks until the frame is on screen or presentation failed.
#[cfg_attr(test, mockall::automock)]
pub trait RenderBackend: Send {
    fn submit(&mut self, frame: &Frame) -> Result<Presented, RenderError>;
}

impl<R: RenderBackend + ?Sized> RenderBackend for Box<R> {
    fn submit(&mut self, frame: &Frame) -> Result<Presented, RenderError> {
        (**self).submit(frame)
    }
}
