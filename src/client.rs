//! Client connections
//!
//! A [`Client`] owns the object table of one connection and turns decoded
//! requests into registry and surface operations. Events go out through an
//! unbounded queue drained by the connection's writer task, so anything
//! (the scheduler thread, a dropped buffer lease) can emit events without
//! touching the socket.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use crate::buffer::Buffer;
use crate::compositor::{Output, WallyCompositor};
use crate::protocol::{
    error_code, event, format, ArgKind, CodecError, Interface, Message, MessageReader, Request,
};
use crate::region::{Rect, Region, Transform};
use crate::registry::{ObjectMap, RegistryError, DISPLAY_ID};
use crate::shm::{ShmError, ShmPool};
use crate::surface::Surface;

/// Something for the connection's writer task
#[derive(Debug)]
pub enum Outbound {
    Event(Message),
    /// Flush what is queued and close the connection
    Close,
}

pub type EventSender = mpsc::UnboundedSender<Outbound>;
pub type EventReceiver = mpsc::UnboundedReceiver<Outbound>;

/// Errors that terminate a connection
///
/// Every variant is reported to the client with `wl_display.error` before
/// the connection closes. Other connections are never affected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    MalformedMessage(CodecError),

    #[error("unknown object {0}")]
    UnknownObject(u32),

    #[error("object id {0} is already in use")]
    DuplicateId(u32),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("shm: {0}")]
    Shm(#[from] ShmError),
}

impl ProtocolError {
    /// The `wl_display.error` code sent for this error
    pub fn code(&self) -> u32 {
        match self {
            ProtocolError::UnknownObject(_) | ProtocolError::DuplicateId(_) => {
                error_code::INVALID_OBJECT
            }
            ProtocolError::MalformedMessage(_) | ProtocolError::InvalidArgument(_) => {
                error_code::INVALID_METHOD
            }
            ProtocolError::Shm(err) => err.code(),
        }
    }
}

impl From<CodecError> for ProtocolError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::UnknownObject(id) => ProtocolError::UnknownObject(id),
            other => ProtocolError::MalformedMessage(other),
        }
    }
}

impl From<RegistryError> for ProtocolError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownObject(id) | RegistryError::WrongInterface { id, .. } => {
                ProtocolError::UnknownObject(id)
            }
            RegistryError::DuplicateId(id) => ProtocolError::DuplicateId(id),
            RegistryError::InvalidId(id) => {
                ProtocolError::InvalidArgument(format!("new id {} outside the client range", id))
            }
        }
    }
}

/// Per-object payload stored in a connection's [`ObjectMap`]
#[derive(Debug)]
pub enum Resource {
    Display,
    Registry,
    Callback,
    Compositor,
    Region(Region),
    Surface(Arc<Surface>),
    Buffer(Arc<Buffer>),
    /// Global name of the bound output
    Output(u32),
    Shm,
    ShmPool(Arc<ShmPool>),
    BufferAllocator,
}

/// One connected client
pub struct Client {
    id: u64,
    objects: Mutex<ObjectMap<Resource>>,
    events: EventSender,
    /// Descriptors received from the socket, consumed in request order
    fds: Mutex<VecDeque<OwnedFd>>,
    serial: AtomicU32,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

impl Client {
    pub fn new(id: u64, events: EventSender) -> Arc<Self> {
        let mut objects = ObjectMap::new();
        // A fresh map always has room for the display
        let _ = objects.allocate(DISPLAY_ID, Interface::Display, 1, Resource::Display);
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            id,
            objects: Mutex::new(objects),
            events,
            fds: Mutex::new(VecDeque::new()),
            serial: AtomicU32::new(0),
            closed,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next serial of this connection; strictly increasing
    pub fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn send(&self, message: Message) {
        // A closed queue means the writer is gone; the event has nowhere to go
        let _ = self.events.send(Outbound::Event(message));
    }

    /// Asks the writer to flush and close the connection
    pub fn close(&self) {
        if !self.closed.send_replace(true) {
            let _ = self.events.send(Outbound::Close);
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Resolves once [`Client::close`] has been called
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn kind_of(&self, id: u32) -> Option<Interface> {
        self.objects.lock().kind_of(id)
    }

    /// Version the object was created with
    fn version_of(&self, id: u32) -> u32 {
        self.objects.lock().get(id).map(|e| e.version).unwrap_or(1)
    }

    /// Queues descriptors that arrived with the request bytes
    pub fn queue_fds(&self, fds: impl IntoIterator<Item = OwnedFd>) {
        self.fds.lock().extend(fds);
    }

    pub fn queued_fds(&self) -> usize {
        self.fds.lock().len()
    }

    /// Signature lookup handed to the wire codec
    pub fn request_signature(
        &self,
        object_id: u32,
        opcode: u16,
    ) -> Result<&'static [ArgKind], CodecError> {
        self.objects
            .lock()
            .kind_of(object_id)
            .ok_or(CodecError::UnknownObject(object_id))?
            .request_signature(object_id, opcode)
    }

    /// Reports `err` to the client
    pub fn post_error(&self, object_id: u32, err: &ProtocolError) {
        warn!("client {}: protocol error on object {}: {}", self.id, object_id, err);
        self.send(event::display_error(object_id, err.code(), &err.to_string()));
    }

    /// Decodes and dispatches every message in `bytes`
    ///
    /// `bytes` must hold whole frames only. The first error is posted to the
    /// client and returned; the caller is expected to drop the connection.
    pub fn dispatch_all(&self, compositor: &WallyCompositor, bytes: &[u8]) -> Result<(), ProtocolError> {
        let reader = MessageReader::new(bytes, |id, op| self.request_signature(id, op));
        for next in reader {
            let (object_id, result) = match next {
                Ok(message) => (message.object_id, self.dispatch(compositor, message)),
                Err(err) => {
                    let object_id = match &err {
                        CodecError::UnknownOpcode { object_id, .. } => *object_id,
                        _ => DISPLAY_ID,
                    };
                    (object_id, Err(err.into()))
                }
            };
            if let Err(err) = result {
                self.post_error(object_id, &err);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Executes one decoded request
    pub fn dispatch(&self, compositor: &WallyCompositor, message: Message) -> Result<(), ProtocolError> {
        let id = message.object_id;
        let interface = self
            .kind_of(id)
            .ok_or(ProtocolError::UnknownObject(id))?;
        if self.version_of(id) < interface.request_since(message.opcode) {
            return Err(ProtocolError::MalformedMessage(CodecError::UnknownOpcode {
                object_id: id,
                interface: interface.name(),
                opcode: message.opcode,
            }));
        }
        let request = Request::parse(interface, &message)?;
        trace!("client {} -> {}@{} {:?}", self.id, interface.name(), id, request);

        match request {
            Request::Sync { callback } => {
                self.objects
                    .lock()
                    .allocate(callback, Interface::Callback, 1, Resource::Callback)?;
                self.fire_callbacks(&[callback]);
            }
            Request::GetRegistry { registry } => {
                self.objects
                    .lock()
                    .allocate(registry, Interface::Registry, 1, Resource::Registry)?;
                for global in compositor.globals().iter() {
                    self.send(event::registry_global(
                        registry,
                        global.name,
                        global.interface,
                        global.version,
                    ));
                }
            }
            Request::Bind {
                name,
                interface,
                version,
                id: new_id,
            } => self.bind(compositor, name, &interface, version, new_id)?,
            Request::CreateSurface { id: new_id } => {
                let surface = Arc::new(Surface::new(new_id, self.id));
                {
                    let mut objects = self.objects.lock();
                    let version = objects.get(id).map(|e| e.version).unwrap_or(1);
                    objects.allocate(
                        new_id,
                        Interface::Surface,
                        version,
                        Resource::Surface(Arc::clone(&surface)),
                    )?;
                }
                compositor.add_surface(surface);
            }
            Request::CreateRegion { id: new_id } => {
                self.objects.lock().allocate(
                    new_id,
                    Interface::Region,
                    1,
                    Resource::Region(Region::new()),
                )?;
            }
            Request::RegionAdd { x, y, width, height } => {
                self.with_region(id, |r| r.add(Rect::from_wire(x, y, width, height)))?;
            }
            Request::RegionSubtract { x, y, width, height } => {
                self.with_region(id, |r| r.subtract(Rect::from_wire(x, y, width, height)))?;
            }
            Request::SurfaceDestroy => self.destroy_surface(compositor, id)?,
            Request::Attach { buffer, x, y } => {
                let surface = self.surface(id)?;
                if self.version_of(id) >= 5 && (x != 0 || y != 0) {
                    return Err(ProtocolError::InvalidArgument(
                        "attach offset must be zero, use wl_surface.offset".to_string(),
                    ));
                }
                let buffer = buffer.map(|b| self.buffer(b)).transpose()?;
                surface.attach(buffer, x, y);
            }
            Request::Damage { x, y, width, height } => {
                self.surface(id)?.damage(Rect::from_wire(x, y, width, height));
            }
            Request::DamageBuffer { x, y, width, height } => {
                self.surface(id)?
                    .damage_buffer(Rect::from_wire(x, y, width, height));
            }
            Request::Frame { callback } => {
                let surface = self.surface(id)?;
                self.objects.lock().allocate_child(
                    callback,
                    Interface::Callback,
                    1,
                    id,
                    Resource::Callback,
                )?;
                surface.frame(callback);
            }
            Request::SetOpaqueRegion { region } => {
                let region = region.map(|r| self.region(r)).transpose()?;
                self.surface(id)?.set_opaque_region(region);
            }
            Request::SetInputRegion { region } => {
                let region = region.map(|r| self.region(r)).transpose()?;
                self.surface(id)?.set_input_region(region);
            }
            Request::Commit => {
                self.surface(id)?.commit();
            }
            Request::SetBufferTransform { transform } => {
                let transform = Transform::from_wire(transform).ok_or_else(|| {
                    ProtocolError::InvalidArgument(format!("invalid buffer transform {}", transform))
                })?;
                self.surface(id)?.set_buffer_transform(transform);
            }
            Request::SetBufferScale { scale } => {
                if scale <= 0 {
                    return Err(ProtocolError::InvalidArgument(format!(
                        "buffer scale must be positive, got {}",
                        scale
                    )));
                }
                self.surface(id)?.set_buffer_scale(scale);
            }
            Request::Offset { x, y } => self.surface(id)?.offset(x, y),
            Request::BufferDestroy => {
                let buffer = self.buffer(id)?;
                buffer.destroy();
                for surface in self.surfaces() {
                    surface.detach_buffer(id);
                }
                self.destroy_object(id)?;
            }
            Request::CreateBuffer {
                id: new_id,
                width,
                height,
                format,
            } => {
                if width <= 0 || height <= 0 {
                    return Err(ProtocolError::InvalidArgument(format!(
                        "invalid buffer size {}x{}",
                        width, height
                    )));
                }
                if !format::is_supported(format) {
                    return Err(ProtocolError::InvalidArgument(format!(
                        "unsupported buffer format {}",
                        format
                    )));
                }
                let buffer = Buffer::new(new_id, width, height, format, self.events.clone());
                self.objects.lock().allocate(
                    new_id,
                    Interface::Buffer,
                    1,
                    Resource::Buffer(buffer),
                )?;
            }
            Request::OutputRelease => {
                if let Resource::Output(global) = self.objects.lock().lookup(id, Interface::Output)? {
                    debug!("client {} released output global {}", self.id, global);
                }
                self.destroy_object(id)?;
            }
            Request::CreatePool { id: new_id, size } => {
                let fd = self.fds.lock().pop_front().ok_or_else(|| {
                    ProtocolError::InvalidArgument(
                        "create_pool arrived without a file descriptor".to_string(),
                    )
                })?;
                let pool = ShmPool::new(fd, size)?;
                self.objects.lock().allocate(
                    new_id,
                    Interface::ShmPool,
                    1,
                    Resource::ShmPool(pool),
                )?;
            }
            Request::CreateShmBuffer {
                id: new_id,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let storage = self
                    .shm_pool(id)?
                    .buffer_storage(offset, width, height, stride, format)?;
                let buffer =
                    Buffer::with_storage(new_id, width, height, format, storage, self.events.clone());
                self.objects.lock().allocate(
                    new_id,
                    Interface::Buffer,
                    1,
                    Resource::Buffer(buffer),
                )?;
            }
            Request::PoolResize { size } => self.shm_pool(id)?.resize(size)?,
            Request::RegionDestroy | Request::PoolDestroy | Request::AllocatorDestroy => {
                self.destroy_object(id)?
            }
        }
        Ok(())
    }

    fn bind(
        &self,
        compositor: &WallyCompositor,
        name: u32,
        interface: &str,
        version: u32,
        new_id: u32,
    ) -> Result<(), ProtocolError> {
        let global = compositor
            .globals()
            .get(name)
            .ok_or_else(|| ProtocolError::InvalidArgument(format!("unknown global {}", name)))?;
        if global.interface.name() != interface {
            return Err(ProtocolError::InvalidArgument(format!(
                "global {} is {}, not {}",
                name,
                global.interface.name(),
                interface
            )));
        }
        if version == 0 || version > global.version {
            return Err(ProtocolError::InvalidArgument(format!(
                "{} version {} is not supported (max {})",
                interface, version, global.version
            )));
        }

        let resource = match global.interface {
            Interface::Compositor => Resource::Compositor,
            Interface::Shm => Resource::Shm,
            Interface::BufferAllocator => Resource::BufferAllocator,
            Interface::Output => Resource::Output(name),
            other => {
                return Err(ProtocolError::InvalidArgument(format!(
                    "{} cannot be bound",
                    other.name()
                )))
            }
        };
        self.objects
            .lock()
            .allocate(new_id, global.interface, version, resource)?;
        debug!("client {} bound {} v{} as {}", self.id, interface, version, new_id);

        if global.interface == Interface::Shm {
            for format in format::SUPPORTED {
                self.send(event::shm_format(new_id, format));
            }
        }
        if let Some(output) = compositor.output_by_global(name) {
            self.send_output(new_id, version, output);
        }
        Ok(())
    }

    fn send_output(&self, id: u32, version: u32, output: &Output) {
        let cfg = &output.config;
        self.send(event::output_geometry(
            id,
            output.x,
            0,
            0,
            0,
            &cfg.make,
            &cfg.model,
            Transform::Normal.to_wire(),
        ));
        self.send(event::output_mode(
            id,
            cfg.width as i32,
            cfg.height as i32,
            cfg.refresh_mhz as i32,
        ));
        if version >= 2 {
            self.send(event::output_scale(id, cfg.scale as i32));
            self.send(event::output_done(id));
        }
    }

    fn surface(&self, id: u32) -> Result<Arc<Surface>, ProtocolError> {
        match self.objects.lock().lookup(id, Interface::Surface)? {
            Resource::Surface(surface) => Ok(Arc::clone(surface)),
            _ => Err(ProtocolError::UnknownObject(id)),
        }
    }

    fn buffer(&self, id: u32) -> Result<Arc<Buffer>, ProtocolError> {
        match self.objects.lock().lookup(id, Interface::Buffer)? {
            Resource::Buffer(buffer) => Ok(Arc::clone(buffer)),
            _ => Err(ProtocolError::UnknownObject(id)),
        }
    }

    fn shm_pool(&self, id: u32) -> Result<Arc<ShmPool>, ProtocolError> {
        match self.objects.lock().lookup(id, Interface::ShmPool)? {
            Resource::ShmPool(pool) => Ok(Arc::clone(pool)),
            _ => Err(ProtocolError::UnknownObject(id)),
        }
    }

    fn region(&self, id: u32) -> Result<Region, ProtocolError> {
        match self.objects.lock().lookup(id, Interface::Region)? {
            Resource::Region(region) => Ok(region.clone()),
            _ => Err(ProtocolError::UnknownObject(id)),
        }
    }

    fn with_region(&self, id: u32, f: impl FnOnce(&mut Region)) -> Result<(), ProtocolError> {
        match self.objects.lock().lookup_mut(id, Interface::Region)? {
            Resource::Region(region) => {
                f(region);
                Ok(())
            }
            _ => Err(ProtocolError::UnknownObject(id)),
        }
    }

    /// Live surfaces owned by this client
    fn surfaces(&self) -> Vec<Arc<Surface>> {
        self.objects
            .lock()
            .iter()
            .filter_map(|(_, entry)| match &entry.data {
                Resource::Surface(surface) => Some(Arc::clone(surface)),
                _ => None,
            })
            .collect()
    }

    /// Removes an object and notifies the client it is gone
    fn destroy_object(&self, id: u32) -> Result<(), ProtocolError> {
        let removed = self.objects.lock().destroy(id)?;
        for object in removed {
            self.send(event::delete_id(object.id));
        }
        Ok(())
    }

    fn destroy_surface(&self, compositor: &WallyCompositor, id: u32) -> Result<(), ProtocolError> {
        let surface = self.surface(id)?;
        let cancelled = surface.destroy();
        compositor.remove_surface(&surface);
        // Callbacks already handed to the scheduler leave the table silently;
        // the scheduler reports them itself
        self.objects.lock().destroy(id)?;
        for callback in &cancelled {
            self.send(event::delete_id(*callback));
        }
        self.send(event::delete_id(id));
        debug!(
            "client {} destroyed wl_surface@{} ({} callbacks cancelled)",
            self.id,
            id,
            cancelled.len()
        );
        Ok(())
    }

    /// Sends `done` followed by `delete_id` for each callback
    pub fn fire_callbacks(&self, ids: &[u32]) {
        for &id in ids {
            {
                let mut objects = self.objects.lock();
                if objects.contains(id) {
                    let _ = objects.destroy(id);
                }
            }
            let serial = self.next_serial();
            self.send(event::callback_done(id, serial));
            self.send(event::delete_id(id));
        }
    }

    /// Destroys everything the client owns
    pub fn teardown(&self, compositor: &WallyCompositor) {
        let removed = self.objects.lock().clear();
        self.fds.lock().clear();
        // Mark buffers first so dropping surface state sends no releases
        for object in &removed {
            if let Resource::Buffer(buffer) = &object.data {
                buffer.destroy();
            }
        }
        let mut surfaces = 0;
        for object in removed {
            if let Resource::Surface(surface) = object.data {
                surface.destroy();
                compositor.remove_surface(&surface);
                surfaces += 1;
            }
        }
        debug!("client {} torn down ({} surfaces)", self.id, surfaces);
        self.close();
    }
}
