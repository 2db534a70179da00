//! Interface table, typed requests and event constructors
//!
//! The table lists every interface the compositor speaks together with the
//! argument signature of each request and event. The wire codec consults it
//! to decode a frame. [`Request::parse`] then turns the decoded arguments
//! into a typed request for dispatch.

use super::wire::{ArgKind, Argument, CodecError, Message};

use ArgKind::{Fd, Int, NewId, NullableObject, Object, String as Str, Uint};

/// `wl_display.error` codes
pub mod error_code {
    pub const INVALID_OBJECT: u32 = 0;
    pub const INVALID_METHOD: u32 = 1;
    pub const NO_MEMORY: u32 = 2;
    pub const IMPLEMENTATION: u32 = 3;
}

/// `wl_shm.error` codes
pub mod shm_error {
    pub const INVALID_FORMAT: u32 = 0;
    pub const INVALID_STRIDE: u32 = 1;
    pub const INVALID_FD: u32 = 2;
}

/// Pixel formats accepted for buffers, as `wl_shm.format` values
pub mod format {
    pub const ARGB8888: u32 = 0;
    pub const XRGB8888: u32 = 1;

    /// Advertised to every `wl_shm` binding, in this order
    pub const SUPPORTED: [u32; 2] = [ARGB8888, XRGB8888];

    pub fn is_supported(format: u32) -> bool {
        SUPPORTED.contains(&format)
    }
}

/// Every interface known to the compositor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interface {
    Display,
    Registry,
    Callback,
    Compositor,
    Region,
    Surface,
    Buffer,
    Output,
    Shm,
    ShmPool,
    BufferAllocator,
}

const RECT: &[ArgKind] = &[Int, Int, Int, Int];

impl Interface {
    pub fn name(self) -> &'static str {
        match self {
            Interface::Display => "wl_display",
            Interface::Registry => "wl_registry",
            Interface::Callback => "wl_callback",
            Interface::Compositor => "wl_compositor",
            Interface::Region => "wl_region",
            Interface::Surface => "wl_surface",
            Interface::Buffer => "wl_buffer",
            Interface::Output => "wl_output",
            Interface::Shm => "wl_shm",
            Interface::ShmPool => "wl_shm_pool",
            Interface::BufferAllocator => "wally_buffer_allocator",
        }
    }

    /// Highest version the compositor implements
    pub fn version(self) -> u32 {
        match self {
            Interface::Compositor | Interface::Surface => 5,
            Interface::Output => 3,
            _ => 1,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "wl_display" => Interface::Display,
            "wl_registry" => Interface::Registry,
            "wl_callback" => Interface::Callback,
            "wl_compositor" => Interface::Compositor,
            "wl_region" => Interface::Region,
            "wl_surface" => Interface::Surface,
            "wl_buffer" => Interface::Buffer,
            "wl_output" => Interface::Output,
            "wl_shm" => Interface::Shm,
            "wl_shm_pool" => Interface::ShmPool,
            "wally_buffer_allocator" => Interface::BufferAllocator,
            _ => return None,
        })
    }

    fn requests(self) -> &'static [&'static [ArgKind]] {
        match self {
            // sync, get_registry
            Interface::Display => &[&[NewId], &[NewId]],
            // bind: the untyped new_id is preceded by interface name and version
            Interface::Registry => &[&[Uint, Str, Uint, NewId]],
            Interface::Callback => &[],
            // create_surface, create_region
            Interface::Compositor => &[&[NewId], &[NewId]],
            // destroy, add, subtract
            Interface::Region => &[&[], RECT, RECT],
            Interface::Surface => &[
                &[],                         // destroy
                &[NullableObject, Int, Int], // attach
                RECT,                        // damage
                &[NewId],                    // frame
                &[NullableObject],           // set_opaque_region
                &[NullableObject],           // set_input_region
                &[],                         // commit
                &[Int],                      // set_buffer_transform
                &[Int],                      // set_buffer_scale
                RECT,                        // damage_buffer
                &[Int, Int],                 // offset
            ],
            Interface::Buffer => &[&[]],
            Interface::Output => &[&[]],
            // create_pool
            Interface::Shm => &[&[NewId, Fd, Int]],
            // create_buffer, destroy, resize
            Interface::ShmPool => &[&[NewId, Int, Int, Int, Int, Uint], &[], &[Int]],
            // create_buffer, destroy
            Interface::BufferAllocator => &[&[NewId, Int, Int, Uint], &[]],
        }
    }

    fn events(self) -> &'static [&'static [ArgKind]] {
        match self {
            // error, delete_id
            Interface::Display => &[&[Object, Uint, Str], &[Uint]],
            // global, global_remove
            Interface::Registry => &[&[Uint, Str, Uint], &[Uint]],
            Interface::Callback => &[&[Uint]],
            Interface::Buffer => &[&[]],
            Interface::Output => &[
                &[Int, Int, Int, Int, Int, Str, Str, Int], // geometry
                &[Uint, Int, Int, Int],                    // mode
                &[],                                       // done
                &[Int],                                    // scale
            ],
            // format
            Interface::Shm => &[&[Uint]],
            _ => &[],
        }
    }

    /// Interface version that introduced request `opcode`
    pub fn request_since(self, opcode: u16) -> u32 {
        match (self, opcode) {
            (Interface::Surface, 7) => 2,
            (Interface::Surface, 8) => 3,
            (Interface::Surface, 9) => 4,
            (Interface::Surface, 10) => 5,
            (Interface::Output, 0) => 3,
            _ => 1,
        }
    }

    /// Argument signature of request `opcode` sent to `object_id`
    pub fn request_signature(
        self,
        object_id: u32,
        opcode: u16,
    ) -> Result<&'static [ArgKind], CodecError> {
        self.requests()
            .get(opcode as usize)
            .copied()
            .ok_or(CodecError::UnknownOpcode {
                object_id,
                interface: self.name(),
                opcode,
            })
    }

    /// Argument signature of event `opcode` emitted by `object_id`
    pub fn event_signature(
        self,
        object_id: u32,
        opcode: u16,
    ) -> Result<&'static [ArgKind], CodecError> {
        self.events()
            .get(opcode as usize)
            .copied()
            .ok_or(CodecError::UnknownOpcode {
                object_id,
                interface: self.name(),
                opcode,
            })
    }
}

/// A decoded request with typed arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Sync { callback: u32 },
    GetRegistry { registry: u32 },
    Bind { name: u32, interface: String, version: u32, id: u32 },
    CreateSurface { id: u32 },
    CreateRegion { id: u32 },
    RegionDestroy,
    RegionAdd { x: i32, y: i32, width: i32, height: i32 },
    RegionSubtract { x: i32, y: i32, width: i32, height: i32 },
    SurfaceDestroy,
    Attach { buffer: Option<u32>, x: i32, y: i32 },
    Damage { x: i32, y: i32, width: i32, height: i32 },
    Frame { callback: u32 },
    SetOpaqueRegion { region: Option<u32> },
    SetInputRegion { region: Option<u32> },
    Commit,
    SetBufferTransform { transform: i32 },
    SetBufferScale { scale: i32 },
    DamageBuffer { x: i32, y: i32, width: i32, height: i32 },
    Offset { x: i32, y: i32 },
    BufferDestroy,
    OutputRelease,
    CreatePool { id: u32, size: i32 },
    CreateShmBuffer {
        id: u32,
        offset: i32,
        width: i32,
        height: i32,
        stride: i32,
        format: u32,
    },
    PoolDestroy,
    PoolResize { size: i32 },
    CreateBuffer { id: u32, width: i32, height: i32, format: u32 },
    AllocatorDestroy,
}

impl Request {
    /// Builds the typed request for a message already decoded against
    /// `interface`'s signature table
    pub fn parse(interface: Interface, msg: &Message) -> Result<Self, CodecError> {
        let rect = |m: &Message| -> Result<(i32, i32, i32, i32), CodecError> {
            Ok((m.int(0)?, m.int(1)?, m.int(2)?, m.int(3)?))
        };

        let request = match (interface, msg.opcode) {
            (Interface::Display, 0) => Request::Sync {
                callback: msg.new_id(0)?,
            },
            (Interface::Display, 1) => Request::GetRegistry {
                registry: msg.new_id(0)?,
            },
            (Interface::Registry, 0) => Request::Bind {
                name: msg.uint(0)?,
                interface: msg.string(1)?.unwrap_or_default().to_owned(),
                version: msg.uint(2)?,
                id: msg.new_id(3)?,
            },
            (Interface::Compositor, 0) => Request::CreateSurface { id: msg.new_id(0)? },
            (Interface::Compositor, 1) => Request::CreateRegion { id: msg.new_id(0)? },
            (Interface::Region, 0) => Request::RegionDestroy,
            (Interface::Region, 1) => {
                let (x, y, width, height) = rect(msg)?;
                Request::RegionAdd { x, y, width, height }
            }
            (Interface::Region, 2) => {
                let (x, y, width, height) = rect(msg)?;
                Request::RegionSubtract { x, y, width, height }
            }
            (Interface::Surface, 0) => Request::SurfaceDestroy,
            (Interface::Surface, 1) => Request::Attach {
                buffer: msg.object(0)?,
                x: msg.int(1)?,
                y: msg.int(2)?,
            },
            (Interface::Surface, 2) => {
                let (x, y, width, height) = rect(msg)?;
                Request::Damage { x, y, width, height }
            }
            (Interface::Surface, 3) => Request::Frame {
                callback: msg.new_id(0)?,
            },
            (Interface::Surface, 4) => Request::SetOpaqueRegion {
                region: msg.object(0)?,
            },
            (Interface::Surface, 5) => Request::SetInputRegion {
                region: msg.object(0)?,
            },
            (Interface::Surface, 6) => Request::Commit,
            (Interface::Surface, 7) => Request::SetBufferTransform {
                transform: msg.int(0)?,
            },
            (Interface::Surface, 8) => Request::SetBufferScale { scale: msg.int(0)? },
            (Interface::Surface, 9) => {
                let (x, y, width, height) = rect(msg)?;
                Request::DamageBuffer { x, y, width, height }
            }
            (Interface::Surface, 10) => Request::Offset {
                x: msg.int(0)?,
                y: msg.int(1)?,
            },
            (Interface::Buffer, 0) => Request::BufferDestroy,
            (Interface::Output, 0) => Request::OutputRelease,
            // The descriptor at index 1 travels out of band
            (Interface::Shm, 0) => Request::CreatePool {
                id: msg.new_id(0)?,
                size: msg.int(2)?,
            },
            (Interface::ShmPool, 0) => Request::CreateShmBuffer {
                id: msg.new_id(0)?,
                offset: msg.int(1)?,
                width: msg.int(2)?,
                height: msg.int(3)?,
                stride: msg.int(4)?,
                format: msg.uint(5)?,
            },
            (Interface::ShmPool, 1) => Request::PoolDestroy,
            (Interface::ShmPool, 2) => Request::PoolResize { size: msg.int(0)? },
            (Interface::BufferAllocator, 0) => Request::CreateBuffer {
                id: msg.new_id(0)?,
                width: msg.int(1)?,
                height: msg.int(2)?,
                format: msg.uint(3)?,
            },
            (Interface::BufferAllocator, 1) => Request::AllocatorDestroy,
            (interface, opcode) => {
                return Err(CodecError::UnknownOpcode {
                    object_id: msg.object_id,
                    interface: interface.name(),
                    opcode,
                })
            }
        };
        Ok(request)
    }
}

/// Event constructors
pub mod event {
    use super::{Argument, Interface, Message};

    pub const DISPLAY_ID: u32 = 1;

    pub fn display_error(object_id: u32, code: u32, message: &str) -> Message {
        Message::new(
            DISPLAY_ID,
            0,
            vec![
                Argument::Object(object_id),
                Argument::Uint(code),
                Argument::Str(Some(message.to_owned())),
            ],
        )
    }

    pub fn delete_id(id: u32) -> Message {
        Message::new(DISPLAY_ID, 1, vec![Argument::Uint(id)])
    }

    pub fn registry_global(registry: u32, name: u32, interface: Interface, version: u32) -> Message {
        Message::new(
            registry,
            0,
            vec![
                Argument::Uint(name),
                Argument::Str(Some(interface.name().to_owned())),
                Argument::Uint(version),
            ],
        )
    }

    pub fn callback_done(callback: u32, serial: u32) -> Message {
        Message::new(callback, 0, vec![Argument::Uint(serial)])
    }

    pub fn buffer_release(buffer: u32) -> Message {
        Message::new(buffer, 0, vec![])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn output_geometry(
        output: u32,
        x: i32,
        y: i32,
        physical_width: i32,
        physical_height: i32,
        make: &str,
        model: &str,
        transform: i32,
    ) -> Message {
        Message::new(
            output,
            0,
            vec![
                Argument::Int(x),
                Argument::Int(y),
                Argument::Int(physical_width),
                Argument::Int(physical_height),
                Argument::Int(0), // subpixel unknown
                Argument::Str(Some(make.to_owned())),
                Argument::Str(Some(model.to_owned())),
                Argument::Int(transform),
            ],
        )
    }

    /// Current + preferred mode
    pub fn output_mode(output: u32, width: i32, height: i32, refresh_mhz: i32) -> Message {
        Message::new(
            output,
            1,
            vec![
                Argument::Uint(0x3),
                Argument::Int(width),
                Argument::Int(height),
                Argument::Int(refresh_mhz),
            ],
        )
    }

    pub fn output_done(output: u32) -> Message {
        Message::new(output, 2, vec![])
    }

    pub fn output_scale(output: u32, factor: i32) -> Message {
        Message::new(output, 3, vec![Argument::Int(factor)])
    }

    pub fn shm_format(shm: u32, format: u32) -> Message {
        Message::new(shm, 0, vec![Argument::Uint(format)])
    }
}
