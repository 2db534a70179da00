//! In-memory renderer
//!
//! Records what each presented frame contained instead of drawing it. A
//! failure switch and a fail-after budget let tests and the binary simulate
//! presentation errors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};
use parking_lot::Mutex;

use super::{Frame, Presented, RenderBackend, RenderError};
use crate::region::{Rect, Region};

/// Summary of one presented frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub seq: u64,
    /// `(surface_id, buffer_id, geometry)` back to front
    pub quads: Vec<(u32, u32, Rect)>,
    pub damage: Region,
}

/// Shared view of the frames a [`HeadlessRenderer`] presented
#[derive(Debug, Clone, Default)]
pub struct FrameLog {
    frames: Arc<Mutex<Vec<FrameRecord>>>,
}

impl FrameLog {
    pub fn frames(&self) -> Vec<FrameRecord> {
        self.frames.lock().clone()
    }

    pub fn last(&self) -> Option<FrameRecord> {
        self.frames.lock().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    fn push(&self, record: FrameRecord) {
        self.frames.lock().push(record);
    }
}

pub struct HeadlessRenderer {
    presented: u64,
    fail_after: Option<u64>,
    failing: Arc<AtomicBool>,
    log: FrameLog,
}

impl Default for HeadlessRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessRenderer {
    pub fn new() -> Self {
        info!("🖼️ Headless renderer ready");
        Self {
            presented: 0,
            fail_after: None,
            failing: Arc::new(AtomicBool::new(false)),
            log: FrameLog::default(),
        }
    }

    /// Fails every submission after `count` successful presentations
    pub fn with_fail_after(mut self, count: Option<u64>) -> Self {
        self.fail_after = count;
        self
    }

    /// Handle to the presented-frame log
    pub fn log(&self) -> FrameLog {
        self.log.clone()
    }

    /// While set, every submission fails
    pub fn failure_switch(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.failing)
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }
}

impl RenderBackend for HeadlessRenderer {
    fn submit(&mut self, frame: &Frame) -> Result<Presented, RenderError> {
        let budget_spent = self.fail_after.is_some_and(|n| self.presented >= n);
        if budget_spent || self.failing.load(Ordering::Acquire) {
            return Err(RenderError::PresentFailed {
                frame_seq: frame.seq,
                reason: "headless output rejected the frame".to_string(),
            });
        }

        self.presented += 1;
        debug!(
            "presented frame {} with {} quads",
            frame.seq,
            frame.quads.len()
        );
        self.log.push(FrameRecord {
            seq: frame.seq,
            quads: frame
                .quads
                .iter()
                .map(|q| (q.surface_id, q.buffer_id(), q.geometry))
                .collect(),
            damage: frame.damage.clone(),
        });

        Ok(Presented {
            frame_seq: frame.seq,
            presented_at: Instant::now(),
        })
    }
}
