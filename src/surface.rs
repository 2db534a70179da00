//! Surface state machine
//!
//! Each surface keeps two states. *Pending* accumulates requests from the
//! client; *current* is what the compositor draws. `commit` builds a new
//! immutable [`CommittedState`] from current + pending and swaps it in under
//! the surface lock, so readers on other threads always see either the old
//! or the new state and never a mix.
//!
//! Damage is logged per commit and only leaves the log once a frame that
//! contains it has been presented. Frame callbacks are queued with the
//! commit that carried them and handed out exactly once, either to the
//! frame scheduler after presentation or to the destroy path for
//! cancellation.
//!
//! ```
//! use wally::region::{Rect, Region};
//! use wally::surface::{Surface, SurfaceStatus};
//!
//! let surface = Surface::new(5, 1);
//! assert_eq!(surface.status(), SurfaceStatus::Empty);
//!
//! surface.damage(Rect::new(0, 0, 10, 10));
//! assert_eq!(surface.status(), SurfaceStatus::Pending);
//!
//! let seq = surface.commit();
//! assert_eq!(surface.status(), SurfaceStatus::Committed);
//!
//! let snapshot = surface.snapshot();
//! assert_eq!(snapshot.seq, seq);
//! assert_eq!(snapshot.damage.area(), 100);
//! ```

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::Mutex;

use crate::buffer::{Buffer, BufferLease};
use crate::region::{Rect, Region, Transform, MAX_DAMAGE_RECTS};

/// Lifecycle position of a surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurfaceStatus {
    /// Nothing requested and nothing committed yet
    Empty,
    /// Requests accumulated since the last commit
    Pending,
    /// Current state is up to date with every request
    Committed,
}

/// A frame callback waiting for the frame that shows its commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCallback {
    pub id: u32,
    pub commit_seq: u64,
}

#[derive(Debug, Default)]
enum Attachment {
    #[default]
    Unchanged,
    Attached(Option<Arc<Buffer>>),
}

/// Double-buffered fields not yet committed
#[derive(Debug, Default)]
pub struct PendingState {
    attachment: Attachment,
    offset: (i32, i32),
    surface_damage: Region,
    buffer_damage: Region,
    opaque: Option<Option<Region>>,
    input: Option<Option<Region>>,
    transform: Option<Transform>,
    scale: Option<i32>,
    callbacks: Vec<u32>,
}

impl PendingState {
    fn move_by(&mut self, dx: i32, dy: i32) {
        self.offset.0 = self.offset.0.saturating_add(dx);
        self.offset.1 = self.offset.1.saturating_add(dy);
    }
}

/// Immutable state produced by a commit
#[derive(Debug, Clone)]
pub struct CommittedState {
    /// Commit sequence that produced this state, 0 before the first commit
    pub seq: u64,
    pub buffer: Option<BufferLease>,
    /// Surface origin, moved by attach and offset requests
    pub origin: (i32, i32),
    /// `None` means the whole surface is transparent
    pub opaque: Option<Region>,
    /// `None` means the whole surface accepts input
    pub input: Option<Region>,
    pub transform: Transform,
    pub scale: i32,
}

impl Default for CommittedState {
    fn default() -> Self {
        Self {
            seq: 0,
            buffer: None,
            origin: (0, 0),
            opaque: None,
            input: None,
            transform: Transform::Normal,
            scale: 1,
        }
    }
}

impl CommittedState {
    /// Surface size in surface coordinates, zero without a buffer
    pub fn size(&self) -> (u32, u32) {
        let Some(lease) = &self.buffer else {
            return (0, 0);
        };
        let (w, h) = lease.buffer().size();
        let (w, h) = if self.transform.swaps_axes() {
            (h, w)
        } else {
            (w, h)
        };
        let scale = self.scale.max(1) as u32;
        (w / scale, h / scale)
    }

    /// Rectangle the surface covers in the scene
    pub fn geometry(&self) -> Rect {
        let (w, h) = self.size();
        Rect::new(self.origin.0, self.origin.1, w, h)
    }

    pub fn buffer_id(&self) -> Option<u32> {
        self.buffer.as_ref().map(|l| l.buffer().id())
    }
}

/// What the scheduler reads from a surface for one frame
#[derive(Debug, Clone)]
pub struct SurfaceSnapshot {
    pub surface_id: u32,
    pub client_id: u64,
    pub seq: u64,
    pub state: Arc<CommittedState>,
    /// Union of all damage committed and not yet presented
    pub damage: Region,
}

#[derive(Debug)]
struct SurfaceData {
    status: SurfaceStatus,
    pending: PendingState,
    current: Arc<CommittedState>,
    commit_seq: u64,
    damage_log: Vec<(u64, Region)>,
    callbacks: Vec<FrameCallback>,
    destroyed: bool,
}

/// A client surface
#[derive(Debug)]
pub struct Surface {
    id: u32,
    client_id: u64,
    data: Mutex<SurfaceData>,
}

impl Surface {
    pub fn new(id: u32, client_id: u64) -> Self {
        Self {
            id,
            client_id,
            data: Mutex::new(SurfaceData {
                status: SurfaceStatus::Empty,
                pending: PendingState::default(),
                current: Arc::new(CommittedState::default()),
                commit_seq: 0,
                damage_log: Vec::new(),
                callbacks: Vec::new(),
                destroyed: false,
            }),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn status(&self) -> SurfaceStatus {
        self.data.lock().status
    }

    pub fn is_destroyed(&self) -> bool {
        self.data.lock().destroyed
    }

    /// The last committed state
    pub fn current(&self) -> Arc<CommittedState> {
        Arc::clone(&self.data.lock().current)
    }

    fn update(&self, f: impl FnOnce(&mut PendingState)) {
        let mut data = self.data.lock();
        if data.destroyed {
            return;
        }
        f(&mut data.pending);
        data.status = SurfaceStatus::Pending;
    }

    /// Attaches `buffer` (or detaches with `None`) and moves the origin
    pub fn attach(&self, buffer: Option<Arc<Buffer>>, dx: i32, dy: i32) {
        self.update(|p| {
            p.attachment = Attachment::Attached(buffer);
            p.move_by(dx, dy);
        });
    }

    pub fn offset(&self, dx: i32, dy: i32) {
        self.update(|p| p.move_by(dx, dy));
    }

    /// Adds damage in surface coordinates
    pub fn damage(&self, rect: Rect) {
        self.update(|p| {
            p.surface_damage.add(rect);
            p.surface_damage.coalesce(MAX_DAMAGE_RECTS);
        });
    }

    /// Adds damage in buffer coordinates
    pub fn damage_buffer(&self, rect: Rect) {
        self.update(|p| {
            p.buffer_damage.add(rect);
            p.buffer_damage.coalesce(MAX_DAMAGE_RECTS);
        });
    }

    pub fn set_opaque_region(&self, region: Option<Region>) {
        self.update(|p| p.opaque = Some(region));
    }

    pub fn set_input_region(&self, region: Option<Region>) {
        self.update(|p| p.input = Some(region));
    }

    pub fn set_buffer_transform(&self, transform: Transform) {
        self.update(|p| p.transform = Some(transform));
    }

    /// `scale` must already be validated as positive
    pub fn set_buffer_scale(&self, scale: i32) {
        self.update(|p| p.scale = Some(scale));
    }

    /// Queues a frame callback for the next commit
    pub fn frame(&self, callback: u32) {
        self.update(|p| p.callbacks.push(callback));
    }

    /// Applies pending state atomically and returns the commit sequence
    pub fn commit(&self) -> u64 {
        let mut data = self.data.lock();
        if data.destroyed {
            return data.commit_seq;
        }

        data.commit_seq += 1;
        let seq = data.commit_seq;
        let pending = std::mem::take(&mut data.pending);
        let previous = &data.current;

        let buffer = match pending.attachment {
            Attachment::Unchanged => previous.buffer.clone(),
            // A buffer destroyed between attach and commit counts as no buffer
            Attachment::Attached(buffer) => buffer
                .filter(|b| !b.is_destroyed())
                .map(|b| b.lease()),
        };

        let next = CommittedState {
            seq,
            buffer,
            origin: (
                previous.origin.0.saturating_add(pending.offset.0),
                previous.origin.1.saturating_add(pending.offset.1),
            ),
            opaque: pending.opaque.unwrap_or_else(|| previous.opaque.clone()),
            input: pending.input.unwrap_or_else(|| previous.input.clone()),
            transform: pending.transform.unwrap_or(previous.transform),
            scale: pending.scale.unwrap_or(previous.scale),
        };

        let mut damage = pending.surface_damage;
        if !pending.buffer_damage.is_empty() {
            if let Some(lease) = &next.buffer {
                let size = lease.buffer().size();
                for rect in pending.buffer_damage.rects() {
                    damage.add(rect.buffer_to_surface(size, next.transform, next.scale));
                }
            }
        }
        damage.coalesce(MAX_DAMAGE_RECTS);
        if !damage.is_empty() {
            data.damage_log.push((seq, damage));
        }

        data.callbacks.extend(
            pending
                .callbacks
                .into_iter()
                .map(|id| FrameCallback { id, commit_seq: seq }),
        );

        trace!(
            "wl_surface@{} commit {} buffer={:?}",
            self.id,
            seq,
            next.buffer_id()
        );
        // The superseded state drops here, releasing its lease if unused
        data.current = Arc::new(next);
        data.status = SurfaceStatus::Committed;
        seq
    }

    /// Reads the current state and all unpresented damage
    pub fn snapshot(&self) -> SurfaceSnapshot {
        let data = self.data.lock();
        let mut damage = Region::new();
        for (_, region) in &data.damage_log {
            damage.union_with(region);
        }
        damage.coalesce(MAX_DAMAGE_RECTS);
        SurfaceSnapshot {
            surface_id: self.id,
            client_id: self.client_id,
            seq: data.current.seq,
            state: Arc::clone(&data.current),
            damage,
        }
    }

    /// Marks every commit up to `presented_seq` as shown
    ///
    /// Consumes the matching damage and returns the frame callbacks that are
    /// now due. Each callback is returned at most once.
    pub fn complete_frame(&self, presented_seq: u64) -> Vec<FrameCallback> {
        let mut data = self.data.lock();
        data.damage_log.retain(|(seq, _)| *seq > presented_seq);

        let (due, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut data.callbacks)
            .into_iter()
            .partition(|cb| cb.commit_seq <= presented_seq);
        data.callbacks = waiting;
        due
    }

    /// Drops a destroyed buffer from pending and current state
    pub fn detach_buffer(&self, buffer_id: u32) {
        let mut data = self.data.lock();
        let pending_match = matches!(
            &data.pending.attachment,
            Attachment::Attached(Some(buffer)) if buffer.id() == buffer_id
        );
        if pending_match {
            data.pending.attachment = Attachment::Attached(None);
        }
        if data.current.buffer_id() == Some(buffer_id) {
            let mut state = (*data.current).clone();
            state.buffer = None;
            data.current = Arc::new(state);
            debug!("wl_surface@{} lost destroyed wl_buffer@{}", self.id, buffer_id);
        }
    }

    /// Tears the surface down and returns the ids of callbacks that will
    /// never fire, queued and pending alike
    pub fn destroy(&self) -> Vec<u32> {
        let mut data = self.data.lock();
        data.destroyed = true;
        let pending = std::mem::take(&mut data.pending);
        data.current = Arc::new(CommittedState::default());
        data.damage_log.clear();
        let mut cancelled: Vec<u32> = std::mem::take(&mut data.callbacks)
            .into_iter()
            .map(|cb| cb.id)
            .chain(pending.callbacks)
            .collect();
        cancelled.sort_unstable();
        cancelled
    }

    /// Callbacks queued by commits but not fired yet
    pub fn queued_callbacks(&self) -> usize {
        self.data.lock().callbacks.len()
    }
}
