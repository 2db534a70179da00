//! Unix socket transport
//!
//! [`WaylandServer`] listens on `$XDG_RUNTIME_DIR/<socket_name>` and runs two
//! tasks per connection. The reader buffers bytes until whole messages are
//! available and dispatches them in arrival order. File descriptors sent
//! with `SCM_RIGHTS` are queued on the client before the bytes that arrived
//! with them are dispatched. The writer drains the client's event queue and
//! batches everything queued into one write.

use std::io::{self, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use tokio::io::{AsyncWriteExt, Interest};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;

use crate::client::{Client, EventReceiver, Outbound, ProtocolError};
use crate::compositor::WallyCompositor;
use crate::config::WallyConfig;
use crate::protocol::{MessageHeader, MAX_MESSAGE_SIZE};
use crate::registry::DISPLAY_ID;

/// Most descriptors accepted with a single read
const MAX_FDS_PER_READ: usize = 28;

/// Listening socket of the compositor
pub struct WaylandServer {
    socket_path: PathBuf,
    listener: UnixListener,
    compositor: Arc<WallyCompositor>,
}

impl WaylandServer {
    /// Binds the listening socket; must be called inside a tokio runtime
    pub fn bind(config: &WallyConfig, compositor: Arc<WallyCompositor>) -> Result<Self> {
        let socket_path = config.socket_path()?;

        // Remove a socket left behind by a previous run
        if socket_path.exists() {
            std::fs::remove_file(&socket_path).with_context(|| {
                format!("Failed to remove existing socket: {:?}", socket_path)
            })?;
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("Failed to bind Unix socket: {:?}", socket_path))?;
        info!("🔗 Wayland server listening on: {:?}", socket_path);

        Ok(Self {
            socket_path,
            listener,
            compositor,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Accepts connections until the compositor shuts down
    pub async fn run(&self) -> Result<()> {
        let shutdown = wait_until_set(self.compositor.shutdown_signal());
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let compositor = Arc::clone(&self.compositor);
                        tokio::spawn(serve_connection(stream, compositor));
                    }
                    Err(e) => {
                        error!("❌ Error accepting connection: {}", e);
                    }
                },
                _ = &mut shutdown => {
                    info!("🛑 Wayland server stopped accepting connections");
                    return Ok(());
                }
            }
        }
    }
}

impl Drop for WaylandServer {
    fn drop(&mut self) {
        if self.socket_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                warn!("⚠️ Failed to remove socket file: {}", e);
            }
        }
    }
}

/// Resolves once the watched flag is `true` or its sender is gone
async fn wait_until_set(mut flag: watch::Receiver<bool>) {
    loop {
        let set = *flag.borrow_and_update();
        if set || flag.changed().await.is_err() {
            return;
        }
    }
}

/// Disconnects a client when dropped, including while a panic unwinds the
/// connection task
struct ConnectionGuard {
    compositor: Arc<WallyCompositor>,
    client_id: u64,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.compositor.disconnect(self.client_id);
    }
}

async fn serve_connection(stream: UnixStream, compositor: Arc<WallyCompositor>) {
    let (client, events) = match compositor.connect() {
        Ok(connected) => connected,
        Err(e) => {
            warn!("⚠️ Refusing connection: {}", e);
            return;
        }
    };
    let guard = ConnectionGuard {
        compositor: Arc::clone(&compositor),
        client_id: client.id(),
    };

    let (reader, writer) = stream.into_split();
    let writer_task = tokio::spawn(write_events(writer, events));

    match read_requests(reader, &client, &compositor).await {
        Ok(()) => debug!("client {} hung up", client.id()),
        Err(e) => debug!("client {} dropped: {:#}", client.id(), e),
    }

    // Tearing down queues the close that ends the writer
    drop(guard);
    match writer_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("client {} writer failed: {:#}", client.id(), e),
        Err(e) => error!("❌ Writer task for client {} panicked: {}", client.id(), e),
    }
}

/// Reads and dispatches requests until EOF, a protocol error or a close
async fn read_requests(
    reader: OwnedReadHalf,
    client: &Client,
    compositor: &WallyCompositor,
) -> Result<()> {
    let stream: &UnixStream = reader.as_ref();
    let closed = wait_until_set(client.closed_signal());
    tokio::pin!(closed);

    let mut pending: Vec<u8> = Vec::with_capacity(MAX_MESSAGE_SIZE);
    let mut chunk = [0u8; MAX_MESSAGE_SIZE];

    loop {
        let mut fds = Vec::new();
        let n = tokio::select! {
            read = recv_with_fds(stream, &mut chunk, &mut fds) => {
                read.context("Failed to read from client")?
            }
            _ = &mut closed => return Ok(()),
        };
        if !fds.is_empty() {
            debug!("client {} sent {} file descriptors", client.id(), fds.len());
            client.queue_fds(fds);
        }
        if n == 0 {
            if !pending.is_empty() {
                debug!("client {} left {} bytes of a partial message", client.id(), pending.len());
            }
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        // Only whole messages go to the dispatcher
        let mut complete = 0;
        loop {
            match MessageHeader::peek(&pending[complete..]) {
                Ok(Some(size)) => complete += size,
                Ok(None) => break,
                Err(e) => {
                    let err = ProtocolError::from(e);
                    if complete > 0 {
                        client.dispatch_all(compositor, &pending[..complete])?;
                    }
                    client.post_error(DISPLAY_ID, &err);
                    return Err(err.into());
                }
            }
        }
        if complete > 0 {
            client.dispatch_all(compositor, &pending[..complete])?;
            pending.drain(..complete);
        }
    }
}

/// Reads bytes plus any descriptors sent with them
async fn recv_with_fds(
    stream: &UnixStream,
    buf: &mut [u8],
    fds: &mut Vec<OwnedFd>,
) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_io(Interest::READABLE, || {
            recvmsg_fds(stream.as_raw_fd(), buf, fds)
        }) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            result => return result,
        }
    }
}

fn recvmsg_fds(socket: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = [IoSliceMut::new(buf)];
    let mut space = nix::cmsg_space!([RawFd; MAX_FDS_PER_READ]);
    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut space), MsgFlags::MSG_CMSG_CLOEXEC)?;

    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(received) = cmsg {
            // SAFETY: the kernel installed these descriptors for this
            // process and nothing else owns them
            fds.extend(received.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        warn!("⚠️ Client sent more than {} descriptors at once; extras dropped", MAX_FDS_PER_READ);
    }
    Ok(msg.bytes)
}

/// Writes queued events until the client is closed or the peer goes away
async fn write_events(mut writer: OwnedWriteHalf, mut events: EventReceiver) -> Result<()> {
    let mut out = Vec::with_capacity(MAX_MESSAGE_SIZE);

    while let Some(first) = events.recv().await {
        let mut close = false;
        let mut next = Some(first);
        while let Some(item) = next {
            match item {
                Outbound::Event(message) => {
                    if let Err(e) = message.encode(&mut out) {
                        warn!("⚠️ Dropping unencodable event on object {}: {}", message.object_id, e);
                    }
                }
                Outbound::Close => {
                    close = true;
                    break;
                }
            }
            next = events.try_recv().ok();
        }

        if !out.is_empty() {
            writer
                .write_all(&out)
                .await
                .context("Failed to write events")?;
            out.clear();
        }
        if close {
            writer.shutdown().await.ok();
            return Ok(());
        }
    }
    Ok(())
}
