//! Buffer records and leases
//!
//! A buffer stays in use while at least one [`BufferLease`] exists. Leases are
//! held by committed surface state and by frames that are in flight or still
//! on screen. When the last lease drops, `wl_buffer.release` goes to the
//! owning client, unless the client already destroyed the buffer.

use std::fmt;
use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;

use crate::client::{EventSender, Outbound};
use crate::protocol::event;
use crate::shm::ShmPool;

/// Where a buffer's pixels live
#[derive(Debug, Clone)]
pub enum BufferStorage {
    /// Created by the buffer allocator; no memory is shared with the client
    Allocated,
    /// A window into a client's shared-memory pool
    Shm {
        pool: Arc<ShmPool>,
        offset: usize,
        stride: usize,
    },
}

#[derive(Debug, Default)]
struct LeaseState {
    leases: usize,
    destroyed: bool,
    releases: u64,
}

/// Opaque pixel storage owned by one client
pub struct Buffer {
    id: u32,
    width: i32,
    height: i32,
    format: u32,
    storage: BufferStorage,
    state: Mutex<LeaseState>,
    events: EventSender,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("id", &self.id)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format)
            .field("storage", &self.storage)
            .finish()
    }
}

impl Buffer {
    pub fn new(id: u32, width: i32, height: i32, format: u32, events: EventSender) -> Arc<Self> {
        Self::with_storage(id, width, height, format, BufferStorage::Allocated, events)
    }

    pub fn with_storage(
        id: u32,
        width: i32,
        height: i32,
        format: u32,
        storage: BufferStorage,
        events: EventSender,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            width,
            height,
            format,
            storage,
            state: Mutex::new(LeaseState::default()),
            events,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn size(&self) -> (u32, u32) {
        (self.width.max(0) as u32, self.height.max(0) as u32)
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn storage(&self) -> &BufferStorage {
        &self.storage
    }

    /// Copies the buffer's rows out of its pool, stride padding included
    ///
    /// `None` for allocator buffers, which have no client-visible memory.
    pub fn read_pixels(&self) -> Option<Vec<u8>> {
        match &self.storage {
            BufferStorage::Allocated => None,
            BufferStorage::Shm {
                pool,
                offset,
                stride,
            } => pool.read(*offset, stride.checked_mul(self.size().1 as usize)?),
        }
    }

    /// Takes a new lease on the buffer
    pub fn lease(self: &Arc<Self>) -> BufferLease {
        self.state.lock().leases += 1;
        BufferLease {
            buffer: Arc::clone(self),
        }
    }

    /// Marks the buffer destroyed by its client; no release will follow
    pub fn destroy(&self) {
        self.state.lock().destroyed = true;
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }

    /// Number of outstanding leases
    pub fn leases(&self) -> usize {
        self.state.lock().leases
    }

    /// Number of release events sent so far
    pub fn releases_sent(&self) -> u64 {
        self.state.lock().releases
    }
}

/// Keeps a buffer in use until dropped
pub struct BufferLease {
    buffer: Arc<Buffer>,
}

impl BufferLease {
    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }
}

impl fmt::Debug for BufferLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("BufferLease").field(&self.buffer.id).finish()
    }
}

impl Clone for BufferLease {
    fn clone(&self) -> Self {
        self.buffer.lease()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        let mut state = self.buffer.state.lock();
        state.leases -= 1;
        if state.leases == 0 && !state.destroyed {
            state.releases += 1;
            trace!("releasing wl_buffer@{}", self.buffer.id);
            // The client may already be gone; nothing to release to then
            let _ = self
                .buffer
                .events
                .send(Outbound::Event(event::buffer_release(self.buffer.id)));
        }
    }
}
