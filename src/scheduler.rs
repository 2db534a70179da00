//! Frame scheduler
//!
//! Runs on its own OS thread. Every vsync it snapshots the scene, submits the
//! frame to the renderer backend and, once the frame is confirmed on screen,
//! fires the frame callbacks it satisfied and consumes the damage it showed.
//! The presented frame is kept until the next one replaces it, which is when
//! buffers only it still referenced get released.
//!
//! A failed presentation is retried with the same snapshot on the next
//! vsync. After too many consecutive failures the scheduler gives up, tells
//! every client the compositor is dying and stops.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use thiserror::Error;

use crate::compositor::WallyCompositor;
use crate::region::{Rect, Region, MAX_DAMAGE_RECTS};
use crate::renderer::{
    Frame, FramePacer, FrameStats, Quad, RenderBackend, RenderError, VsyncSource,
};
use crate::surface::Surface;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("presentation failed {attempts} times in a row: {last}")]
    CompositorPresentationFailure { attempts: u32, last: RenderError },

    #[error("frame scheduler thread panicked")]
    Panicked,
}

/// Result of one scheduler iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Presented { frame_seq: u64, callbacks: usize },
    Retrying { attempt: u32 },
}

struct PreparedFrame {
    frame: Frame,
    /// Surfaces in the snapshot with the commit each one showed
    surfaces: Vec<(Arc<Surface>, u64)>,
}

pub struct FrameScheduler {
    compositor: Arc<WallyCompositor>,
    renderer: Box<dyn RenderBackend>,
    vsync: Box<dyn VsyncSource>,
    pacer: FramePacer,
    max_failures: u32,
    consecutive_failures: u32,
    next_frame_seq: u64,
    retry: Option<PreparedFrame>,
    last_presented: Option<Frame>,
}

impl FrameScheduler {
    pub fn new(
        compositor: Arc<WallyCompositor>,
        renderer: Box<dyn RenderBackend>,
        vsync: Box<dyn VsyncSource>,
        max_failures: u32,
    ) -> Self {
        let refresh_mhz = compositor
            .primary_output()
            .map(|o| o.config.refresh_mhz)
            .unwrap_or(60_000)
            .max(1);
        let target = Duration::from_nanos(1_000_000_000_000 / refresh_mhz as u64);
        Self {
            compositor,
            renderer,
            vsync,
            pacer: FramePacer::new(target),
            max_failures: max_failures.max(1),
            consecutive_failures: 0,
            next_frame_seq: 0,
            retry: None,
            last_presented: None,
        }
    }

    pub fn stats(&self) -> &FrameStats {
        self.pacer.stats()
    }

    /// The frame currently on screen
    pub fn last_presented(&self) -> Option<&Frame> {
        self.last_presented.as_ref()
    }

    fn prepare(&mut self) -> PreparedFrame {
        self.next_frame_seq += 1;

        let (offset_x, output_size) = self
            .compositor
            .primary_output()
            .map(|o| (o.x, (o.config.width, o.config.height)))
            .unwrap_or((0, (0, 0)));
        let output_rect = Rect::new(0, 0, output_size.0, output_size.1);

        let mut quads = Vec::new();
        let mut damage = Region::new();
        let mut surfaces = Vec::new();

        for surface in self.compositor.scene() {
            if surface.is_destroyed() {
                continue;
            }
            let snapshot = surface.snapshot();
            let state = &snapshot.state;
            let (ox, oy) = (state.origin.0.saturating_sub(offset_x), state.origin.1);

            if let Some(buffer) = &state.buffer {
                let geometry = state.geometry().translate(offset_x.saturating_neg(), 0);
                if !geometry.is_empty() {
                    quads.push(Quad {
                        surface_id: snapshot.surface_id,
                        client_id: snapshot.client_id,
                        geometry,
                        transform: state.transform,
                        scale: state.scale,
                        buffer: buffer.clone(),
                    });
                }
            }

            for rect in snapshot.damage.rects() {
                if let Some(visible) = rect.translate(ox, oy).intersection(&output_rect) {
                    damage.add(visible);
                }
            }
            surfaces.push((surface, snapshot.seq));
        }
        damage.coalesce(MAX_DAMAGE_RECTS);

        trace!(
            "prepared frame {}: {} quads, {} surfaces",
            self.next_frame_seq,
            quads.len(),
            surfaces.len()
        );
        PreparedFrame {
            frame: Frame {
                seq: self.next_frame_seq,
                output_size,
                quads,
                damage,
            },
            surfaces,
        }
    }

    /// Produces and submits one frame
    pub fn tick(&mut self) -> Result<TickOutcome, SchedulerError> {
        let prepared = match self.retry.take() {
            Some(prepared) => prepared,
            None => self.prepare(),
        };

        self.pacer.begin_frame();
        match self.renderer.submit(&prepared.frame) {
            Ok(presented) => {
                self.pacer.end_frame(true);
                if self.consecutive_failures > 0 {
                    info!(
                        "✅ Presentation recovered after {} failures",
                        self.consecutive_failures
                    );
                }
                self.consecutive_failures = 0;

                let mut due: HashMap<u64, Vec<u32>> = HashMap::new();
                for (surface, seq) in &prepared.surfaces {
                    let callbacks = surface.complete_frame(*seq);
                    if !callbacks.is_empty() {
                        due.entry(surface.client_id())
                            .or_default()
                            .extend(callbacks.iter().map(|cb| cb.id));
                    }
                }
                let fired = due.values().map(Vec::len).sum();
                for (client_id, ids) in due {
                    self.compositor.fire_callbacks(client_id, &ids);
                }

                // Dropping the previous frame releases buffers nothing else holds
                self.last_presented = Some(prepared.frame);
                Ok(TickOutcome::Presented {
                    frame_seq: presented.frame_seq,
                    callbacks: fired,
                })
            }
            Err(err) => {
                self.pacer.end_frame(false);
                self.consecutive_failures += 1;
                warn!(
                    "⚠️ Frame {} failed ({}/{}): {}",
                    prepared.frame.seq, self.consecutive_failures, self.max_failures, err
                );

                if self.consecutive_failures >= self.max_failures {
                    let failure = SchedulerError::CompositorPresentationFailure {
                        attempts: self.consecutive_failures,
                        last: err,
                    };
                    self.compositor.broadcast_dying(&failure.to_string());
                    return Err(failure);
                }

                self.retry = Some(prepared);
                Ok(TickOutcome::Retrying {
                    attempt: self.consecutive_failures,
                })
            }
        }
    }

    /// Produces frames on every vsync until shutdown or fatal failure
    pub fn run(mut self) -> Result<FrameStats, SchedulerError> {
        info!(
            "🎬 Frame scheduler running (target {:?}, {} failures tolerated)",
            self.pacer.target(),
            self.max_failures - 1
        );

        while !self.compositor.is_shutting_down() {
            let Some(vsync) = self.vsync.wait_vsync() else {
                debug!("vsync source closed");
                break;
            };
            if self.compositor.is_shutting_down() {
                break;
            }
            trace!("vsync {}", vsync.sequence);

            if let Err(err) = self.tick() {
                error!("❌ Frame scheduler giving up: {}", err);
                return Err(err);
            }
        }

        info!("🛑 Frame scheduler stopped");
        Ok(self.pacer.stats().clone())
    }

    /// Moves the scheduler onto its own thread
    ///
    /// A panic on that thread is treated like a fatal presentation failure:
    /// clients are told the compositor is dying and the handle reports
    /// [`SchedulerError::Panicked`].
    pub fn spawn(self) -> std::io::Result<SchedulerHandle> {
        let compositor = Arc::clone(&self.compositor);
        let thread = std::thread::Builder::new()
            .name("wally-scheduler".to_string())
            .spawn(move || {
                let result = match panic::catch_unwind(AssertUnwindSafe(move || self.run())) {
                    Ok(result) => result,
                    Err(_) => {
                        error!("❌ Frame scheduler panicked");
                        compositor.broadcast_dying(&SchedulerError::Panicked.to_string());
                        Err(SchedulerError::Panicked)
                    }
                };
                // Nothing presents frames any more
                compositor.shutdown();
                result
            })?;
        Ok(SchedulerHandle { thread })
    }
}

/// Handle to a scheduler running on its own thread
pub struct SchedulerHandle {
    thread: JoinHandle<Result<FrameStats, SchedulerError>>,
}

impl SchedulerHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the scheduler to stop
    pub fn join(self) -> Result<FrameStats, SchedulerError> {
        self.thread.join().unwrap_or(Err(SchedulerError::Panicked))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::client::{EventReceiver, Outbound};
    use crate::config::WallyConfig;
    use crate::protocol::{error_code, Argument, Message};
    use crate::renderer::{ChannelVsync, HeadlessRenderer, MockRenderBackend, Presented};
    use parking_lot::Mutex;
    use std::time::Instant;

    struct Fixture {
        compositor: Arc<WallyCompositor>,
        client_id: u64,
        rx: EventReceiver,
    }

    fn fixture() -> Fixture {
        let compositor = WallyCompositor::new(&WallyConfig::default());
        let (client, rx) = compositor.connect().unwrap();
        Fixture {
            compositor,
            client_id: client.id(),
            rx,
        }
    }

    fn scheduler(compositor: &Arc<WallyCompositor>, renderer: Box<dyn RenderBackend>) -> FrameScheduler {
        let (vsync, _tx) = ChannelVsync::new();
        FrameScheduler::new(Arc::clone(compositor), renderer, Box::new(vsync), 3)
    }

    fn drain(rx: &mut EventReceiver) -> Vec<Message> {
        let mut events = Vec::new();
        while let Ok(Outbound::Event(message)) = rx.try_recv() {
            events.push(message);
        }
        events
    }

    fn failing_mock(seen: Arc<Mutex<Vec<u64>>>) -> MockRenderBackend {
        let mut mock = MockRenderBackend::new();
        mock.expect_submit().returning(move |frame: &Frame| {
            seen.lock().push(frame.seq);
            Err(RenderError::PresentFailed {
                frame_seq: frame.seq,
                reason: "mock".to_string(),
            })
        });
        mock
    }

    #[test]
    fn test_committed_buffer_becomes_quad() {
        let mut fx = fixture();
        let surface = Arc::new(Surface::new(5, fx.client_id));
        fx.compositor.add_surface(Arc::clone(&surface));

        let (tx, mut buffer_rx) = tokio::sync::mpsc::unbounded_channel();
        let buffer = Buffer::new(9, 64, 64, 0, tx);
        surface.attach(Some(Arc::clone(&buffer)), 0, 0);
        surface.frame(10);
        surface.commit();

        let renderer = HeadlessRenderer::new();
        let log = renderer.log();
        let mut scheduler = scheduler(&fx.compositor, Box::new(renderer));

        assert_eq!(
            scheduler.tick(),
            Ok(TickOutcome::Presented {
                frame_seq: 1,
                callbacks: 1
            })
        );
        let frame = log.last().unwrap();
        assert_eq!(frame.quads, vec![(5, 9, Rect::new(0, 0, 64, 64))]);

        // done(serial) then delete_id
        let events = drain(&mut fx.rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].object_id, 10);
        assert_eq!(events[1].object_id, 1);
        assert_eq!(events[1].args, vec![Argument::Uint(10)]);

        // Detach, commit: the buffer is only released once a frame without it
        // replaces the one still showing it
        surface.attach(None, 0, 0);
        surface.commit();
        assert_eq!(buffer.leases(), 1);
        assert!(buffer_rx.try_recv().is_err());

        scheduler.tick().unwrap();
        assert_eq!(buffer.leases(), 0);
        assert!(matches!(buffer_rx.try_recv(), Ok(Outbound::Event(m)) if m.object_id == 9));
        assert!(log.last().unwrap().quads.is_empty());
    }

    #[test]
    fn test_retry_reuses_snapshot_then_escalates() {
        let mut fx = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(&fx.compositor, Box::new(failing_mock(Arc::clone(&seen))));

        assert_eq!(scheduler.tick(), Ok(TickOutcome::Retrying { attempt: 1 }));
        assert_eq!(scheduler.tick(), Ok(TickOutcome::Retrying { attempt: 2 }));
        assert!(matches!(
            scheduler.tick(),
            Err(SchedulerError::CompositorPresentationFailure { attempts: 3, .. })
        ));

        assert_eq!(*seen.lock(), vec![1, 1, 1]);
        assert!(fx.compositor.is_dying());

        let events = drain(&mut fx.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].object_id, 1);
        assert_eq!(events[0].args[1], Argument::Uint(error_code::IMPLEMENTATION));
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let fx = fixture();
        let surface = Arc::new(Surface::new(5, fx.client_id));
        fx.compositor.add_surface(Arc::clone(&surface));
        surface.frame(10);
        surface.commit();

        let mut mock = MockRenderBackend::new();
        let mut sequence = mockall::Sequence::new();
        mock.expect_submit()
            .times(2)
            .in_sequence(&mut sequence)
            .returning(|frame: &Frame| {
                Err(RenderError::PresentFailed {
                    frame_seq: frame.seq,
                    reason: "transient".to_string(),
                })
            });
        mock.expect_submit()
            .times(2)
            .in_sequence(&mut sequence)
            .returning(|frame: &Frame| {
                Ok(Presented {
                    frame_seq: frame.seq,
                    presented_at: Instant::now(),
                })
            });
        let mut scheduler = scheduler(&fx.compositor, Box::new(mock));

        assert!(matches!(scheduler.tick(), Ok(TickOutcome::Retrying { .. })));
        // Callbacks wait for a presented frame
        assert_eq!(surface.queued_callbacks(), 1);
        assert!(matches!(scheduler.tick(), Ok(TickOutcome::Retrying { attempt: 2 })));
        assert_eq!(
            scheduler.tick(),
            Ok(TickOutcome::Presented {
                frame_seq: 1,
                callbacks: 1
            })
        );
        assert_eq!(surface.queued_callbacks(), 0);

        // The failure counter starts over after a success
        assert!(matches!(
            scheduler.tick(),
            Ok(TickOutcome::Presented { frame_seq: 2, callbacks: 0 })
        ));
        assert_eq!(scheduler.stats().failed_frames, 2);
        assert!(!fx.compositor.is_dying());
    }

    #[test]
    fn test_damage_consumed_only_when_presented() {
        let fx = fixture();
        let surface = Arc::new(Surface::new(5, fx.client_id));
        fx.compositor.add_surface(Arc::clone(&surface));
        surface.offset(100, 0);
        surface.damage(Rect::new(0, 0, 10, 10));
        surface.commit();

        let renderer = HeadlessRenderer::new();
        let switch = renderer.failure_switch();
        let log = renderer.log();
        let mut scheduler = scheduler(&fx.compositor, Box::new(renderer));

        switch.store(true, std::sync::atomic::Ordering::Release);
        assert!(matches!(scheduler.tick(), Ok(TickOutcome::Retrying { .. })));
        assert_eq!(surface.snapshot().damage.area(), 100);

        switch.store(false, std::sync::atomic::Ordering::Release);
        scheduler.tick().unwrap();
        assert!(surface.snapshot().damage.is_empty());
        assert_eq!(
            log.last().unwrap().damage.bounding_box(),
            Some(Rect::new(100, 0, 10, 10))
        );
    }

    #[test]
    fn test_run_stops_when_vsync_source_closes() {
        let fx = fixture();
        let (vsync, tx) = ChannelVsync::new();
        let renderer = HeadlessRenderer::new();
        let log = renderer.log();
        let handle = FrameScheduler::new(
            Arc::clone(&fx.compositor),
            Box::new(renderer),
            Box::new(vsync),
            3,
        )
        .spawn()
        .unwrap();

        for _ in 0..3 {
            tx.send(()).unwrap();
        }
        drop(tx);

        let stats = handle.join().unwrap();
        assert_eq!(stats.total_frames, 3);
        assert_eq!(log.len(), 3);
        assert!(fx.compositor.is_shutting_down());
    }

    #[test]
    fn test_panicking_backend_marks_compositor_dying() {
        struct PanickingBackend;

        impl RenderBackend for PanickingBackend {
            fn submit(&mut self, _frame: &Frame) -> Result<Presented, RenderError> {
                panic!("backend bug")
            }
        }

        let mut fx = fixture();
        let (vsync, tx) = ChannelVsync::new();
        let handle = FrameScheduler::new(
            Arc::clone(&fx.compositor),
            Box::new(PanickingBackend),
            Box::new(vsync),
            3,
        )
            .spawn()
            .unwrap();

        tx.send(()).unwrap();
        assert_eq!(handle.join(), Err(SchedulerError::Panicked));
        assert!(fx.compositor.is_dying());
        assert!(fx.compositor.is_shutting_down());

        let events = drain(&mut fx.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].args[1], Argument::Uint(error_code::IMPLEMENTATION));
    }

    #[test]
    fn test_damage_at_coordinate_limits_is_clipped() {
        let fx = fixture();
        let surface = Arc::new(Surface::new(5, fx.client_id));
        fx.compositor.add_surface(Arc::clone(&surface));
        surface.offset(10, 0);
        surface.damage(Rect::new(i32::MAX - 5, 0, 10, 10));
        surface.damage(Rect::new(i32::MIN, i32::MIN, u32::MAX, u32::MAX));
        surface.commit();
        surface.offset(i32::MAX, i32::MAX);
        surface.commit();

        let renderer = HeadlessRenderer::new();
        let log = renderer.log();
        let mut scheduler = scheduler(&fx.compositor, Box::new(renderer));

        assert!(matches!(scheduler.tick(), Ok(TickOutcome::Presented { .. })));
        let frame = log.last().unwrap();
        let output = Rect::new(0, 0, 1920, 1080);
        assert!(frame.damage.rects().iter().all(|r| output.contains_rect(r)));
    }
}
