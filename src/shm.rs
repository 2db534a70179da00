//! Shared-memory pools behind `wl_shm`
//!
//! A client creates a pool from a file it sends along with
//! `wl_shm.create_pool`, and the compositor maps that file read-only.
//! Buffers are fixed windows into a pool. They keep the pool alive after
//! `wl_shm_pool.destroy` and see the new mapping after a resize.

use std::fmt;
use std::fs::File;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use log::debug;
use memmap2::{Mmap, MmapOptions};
use parking_lot::RwLock;
use thiserror::Error;

use crate::buffer::BufferStorage;
use crate::protocol::{format, shm_error};

/// Every supported format is 32 bits per pixel
pub const BYTES_PER_PIXEL: i64 = 4;

/// Errors reported on `wl_shm` and `wl_shm_pool` objects
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShmError {
    #[error("unsupported buffer format {0}")]
    InvalidFormat(u32),

    #[error("{0}")]
    InvalidStride(String),

    #[error("{0}")]
    InvalidFd(String),
}

impl ShmError {
    /// The `wl_shm.error` code sent for this error
    pub fn code(&self) -> u32 {
        match self {
            ShmError::InvalidFormat(_) => shm_error::INVALID_FORMAT,
            ShmError::InvalidStride(_) => shm_error::INVALID_STRIDE,
            ShmError::InvalidFd(_) => shm_error::INVALID_FD,
        }
    }
}

struct Mapping {
    file: File,
    map: Mmap,
}

/// A client's shared-memory pool
pub struct ShmPool {
    mapping: RwLock<Mapping>,
}

impl fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmPool").field("size", &self.size()).finish()
    }
}

impl ShmPool {
    /// Maps `size` bytes of the file behind `fd`
    pub fn new(fd: OwnedFd, size: i32) -> Result<Arc<Self>, ShmError> {
        let size = pool_size(size)?;
        let file = File::from(fd);
        let map = map_file(&file, size)?;
        debug!("mapped shm pool of {} bytes", size);
        Ok(Arc::new(Self {
            mapping: RwLock::new(Mapping { file, map }),
        }))
    }

    pub fn size(&self) -> usize {
        self.mapping.read().map.len()
    }

    /// Grows the pool; pools never shrink
    pub fn resize(&self, size: i32) -> Result<(), ShmError> {
        let size = pool_size(size)?;
        let mut mapping = self.mapping.write();
        let current = mapping.map.len();
        if size < current {
            return Err(ShmError::InvalidStride(format!(
                "shrinking pool from {} to {} bytes",
                current, size
            )));
        }
        if size > current {
            mapping.map = map_file(&mapping.file, size)?;
            debug!("shm pool grown from {} to {} bytes", current, size);
        }
        Ok(())
    }

    /// Validates a `create_buffer` window and returns the storage for it
    pub fn buffer_storage(
        self: &Arc<Self>,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    ) -> Result<BufferStorage, ShmError> {
        if !format::is_supported(format) {
            return Err(ShmError::InvalidFormat(format));
        }

        let (offset, width, height, stride) = (
            i64::from(offset),
            i64::from(width),
            i64::from(height),
            i64::from(stride),
        );
        let pool_size = self.size() as i64;
        if offset < 0
            || width <= 0
            || height <= 0
            || stride < width * BYTES_PER_PIXEL
            || offset + stride * height > pool_size
        {
            return Err(ShmError::InvalidStride(format!(
                "invalid buffer window: offset {}, {}x{}, stride {} in a {} byte pool",
                offset, width, height, stride, pool_size
            )));
        }

        Ok(BufferStorage::Shm {
            pool: Arc::clone(self),
            offset: offset as usize,
            stride: stride as usize,
        })
    }

    /// Copies `len` bytes starting at `offset`; `None` when out of range
    pub fn read(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let mapping = self.mapping.read();
        mapping
            .map
            .get(offset..offset.checked_add(len)?)
            .map(<[u8]>::to_vec)
    }
}

fn pool_size(size: i32) -> Result<usize, ShmError> {
    match usize::try_from(size) {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ShmError::InvalidStride(format!("invalid pool size {}", size))),
    }
}

fn map_file(file: &File, size: usize) -> Result<Mmap, ShmError> {
    let len = file
        .metadata()
        .map_err(|e| ShmError::InvalidFd(format!("cannot stat pool file: {}", e)))?
        .len();
    if len < size as u64 {
        return Err(ShmError::InvalidFd(format!(
            "pool of {} bytes exceeds its {} byte file",
            size, len
        )));
    }

    // SAFETY: the mapping is read-only and only ever copied out of, and the
    // file was checked to cover it
    unsafe { MmapOptions::new().len(size).map(file) }
        .map_err(|e| ShmError::InvalidFd(format!("mmap failed: {}", e)))
}
