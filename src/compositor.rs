//! Core compositor state
//!
//! [`WallyCompositor`] is shared by the transport tasks and the frame
//! scheduler thread. It owns the globals, the connected clients, the scene
//! (surfaces in stacking order) and the outputs, and it coordinates
//! shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::signal;
use tokio::sync::{mpsc, watch};

use crate::client::{Client, EventReceiver};
use crate::config::{OutputConfig, WallyConfig};
use crate::protocol::{error_code, event, Interface};
use crate::registry::{GlobalRegistry, DISPLAY_ID};
use crate::renderer::{HeadlessRenderer, OutputClock};
use crate::scheduler::FrameScheduler;
use crate::server::WaylandServer;
use crate::surface::Surface;

/// An output advertised as a `wl_output` global
#[derive(Debug, Clone)]
pub struct Output {
    /// Global name
    pub global: u32,
    /// Horizontal position in the scene; outputs sit side by side
    pub x: i32,
    pub config: OutputConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("client limit of {0} reached")]
    TooManyClients(usize),

    #[error("compositor is shutting down")]
    ShuttingDown,
}

/// Main compositor state shared by every subsystem
pub struct WallyCompositor {
    globals: GlobalRegistry,
    outputs: Vec<Output>,
    clients: RwLock<HashMap<u64, Arc<Client>>>,
    scene: RwLock<Vec<Arc<Surface>>>,
    next_client_id: AtomicU64,
    max_clients: usize,
    shutdown: watch::Sender<bool>,
    dying: AtomicBool,
}

impl WallyCompositor {
    pub fn new(config: &WallyConfig) -> Arc<Self> {
        let mut globals = GlobalRegistry::new();
        globals.add(Interface::Compositor);
        globals.add(Interface::Shm);
        globals.add(Interface::BufferAllocator);

        let mut x = 0;
        let outputs = config
            .outputs
            .iter()
            .map(|cfg| {
                let output = Output {
                    global: globals.add(Interface::Output),
                    x,
                    config: cfg.clone(),
                };
                x += (cfg.width / cfg.scale.max(1)) as i32;
                debug!("🖥️ Output {} at x={} ({}x{})", cfg.name, output.x, cfg.width, cfg.height);
                output
            })
            .collect();

        let (shutdown, _) = watch::channel(false);
        Arc::new(Self {
            globals,
            outputs,
            clients: RwLock::new(HashMap::new()),
            scene: RwLock::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            max_clients: config.server.max_clients,
            shutdown,
            dying: AtomicBool::new(false),
        })
    }

    pub fn globals(&self) -> &GlobalRegistry {
        &self.globals
    }

    pub fn outputs(&self) -> &[Output] {
        &self.outputs
    }

    pub fn output_by_global(&self, name: u32) -> Option<&Output> {
        self.outputs.iter().find(|o| o.global == name)
    }

    /// The output whose refresh drives frame scheduling
    pub fn primary_output(&self) -> Option<&Output> {
        self.outputs.first()
    }

    /// Registers a new connection
    pub fn connect(&self) -> Result<(Arc<Client>, EventReceiver), ConnectError> {
        if self.is_shutting_down() {
            return Err(ConnectError::ShuttingDown);
        }
        let mut clients = self.clients.write();
        if clients.len() >= self.max_clients {
            return Err(ConnectError::TooManyClients(self.max_clients));
        }

        let id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Client::new(id, tx);
        clients.insert(id, Arc::clone(&client));
        info!("🔌 Client {} connected ({} total)", id, clients.len());
        Ok((client, rx))
    }

    /// Removes a client and destroys everything it owns
    pub fn disconnect(&self, client_id: u64) {
        let client = self.clients.write().remove(&client_id);
        if let Some(client) = client {
            client.teardown(self);
            info!("👋 Client {} disconnected", client_id);
        }
    }

    pub fn client(&self, client_id: u64) -> Option<Arc<Client>> {
        self.clients.read().get(&client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Puts a new surface on top of the scene
    pub fn add_surface(&self, surface: Arc<Surface>) {
        self.scene.write().push(surface);
    }

    pub fn remove_surface(&self, surface: &Arc<Surface>) {
        self.scene.write().retain(|s| !Arc::ptr_eq(s, surface));
    }

    /// Surfaces back to front
    pub fn scene(&self) -> Vec<Arc<Surface>> {
        self.scene.read().clone()
    }

    /// Fires presented frame callbacks of one client
    pub fn fire_callbacks(&self, client_id: u64, callbacks: &[u32]) {
        if let Some(client) = self.client(client_id) {
            client.fire_callbacks(callbacks);
        }
    }

    /// Tells every client the compositor is going away, then disconnects them
    pub fn broadcast_dying(&self, reason: &str) {
        if self.dying.swap(true, Ordering::SeqCst) {
            return;
        }
        error!("💀 Compositor dying: {}", reason);

        let message = format!("compositor dying: {}", reason);
        let clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.send(event::display_error(
                DISPLAY_ID,
                error_code::IMPLEMENTATION,
                &message,
            ));
            client.teardown(self);
        }
        self.shutdown.send_replace(true);
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::SeqCst)
    }

    /// Disconnects every client and stops accepting new ones
    pub fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("🛑 Shutting down compositor");
        let clients: Vec<Arc<Client>> = self.clients.write().drain().map(|(_, c)| c).collect();
        for client in clients {
            client.teardown(self);
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Changes to `true` once shutdown begins
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Serves clients until a signal arrives or composition fails
    pub async fn run(self: Arc<Self>, config: &WallyConfig) -> Result<()> {
        info!("🏗️ Starting Wally compositor");

        let server = WaylandServer::bind(config, Arc::clone(&self))?;

        let primary = config
            .primary_output()
            .context("At least one output must be configured")?;
        let renderer =
            HeadlessRenderer::new().with_fail_after(config.scheduler.headless_fail_after);
        let clock = OutputClock::from_refresh_mhz(primary.refresh_mhz);
        let scheduler = FrameScheduler::new(
            Arc::clone(&self),
            Box::new(renderer),
            Box::new(clock),
            config.scheduler.max_consecutive_failures,
        )
        .spawn()
        .context("Failed to start frame scheduler")?;

        let mut scheduler = tokio::task::spawn_blocking(move || scheduler.join());
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

        let mut served = Ok(());
        let mut stopped_early = None;
        tokio::select! {
            result = server.run() => {
                served = result;
            }
            joined = &mut scheduler => {
                warn!("⚠️ Frame scheduler stopped before the server");
                stopped_early = Some(joined);
            }
            _ = sigterm.recv() => {
                info!("📨 Received SIGTERM, shutting down gracefully");
            }
            _ = sigint.recv() => {
                info!("📨 Received SIGINT (Ctrl+C), shutting down gracefully");
            }
        }

        self.shutdown();

        let joined = match stopped_early {
            Some(joined) => joined,
            None => scheduler.await,
        };
        let stats = joined.context("Frame scheduler task failed")??;
        served?;
        info!(
            "📊 {} frames presented, {} failed, avg {:?}",
            stats.total_frames, stats.failed_frames, stats.avg_frame_time
        );
        info!("🛑 Wally compositor finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use crate::protocol::Message;

    fn config_with_outputs(n: usize) -> WallyConfig {
        let mut config = WallyConfig::default();
        config.outputs = (0..n)
            .map(|i| OutputConfig {
                name: format!("HEADLESS-{}", i + 1),
                ..OutputConfig::default()
            })
            .collect();
        config
    }

    #[test]
    fn test_globals_advertised() {
        let compositor = WallyCompositor::new(&config_with_outputs(2));
        let interfaces: Vec<Interface> = compositor.globals().iter().map(|g| g.interface).collect();
        assert_eq!(
            interfaces,
            vec![
                Interface::Compositor,
                Interface::Shm,
                Interface::BufferAllocator,
                Interface::Output,
                Interface::Output
            ]
        );
        assert_eq!(compositor.outputs()[1].x, 1920);
        assert_eq!(compositor.primary_output().map(|o| o.global), Some(4));
    }

    #[test]
    fn test_client_limit() {
        let mut config = WallyConfig::default();
        config.server.max_clients = 1;
        let compositor = WallyCompositor::new(&config);

        let (first, _rx) = compositor.connect().unwrap();
        assert_eq!(
            compositor.connect().unwrap_err(),
            ConnectError::TooManyClients(1)
        );

        compositor.disconnect(first.id());
        assert!(compositor.connect().is_ok());
    }

    #[test]
    fn test_scene_keeps_stacking_order() {
        let compositor = WallyCompositor::new(&WallyConfig::default());
        let (client, _rx) = compositor.connect().unwrap();
        let bottom = Arc::new(Surface::new(5, client.id()));
        let top = Arc::new(Surface::new(6, client.id()));
        compositor.add_surface(Arc::clone(&bottom));
        compositor.add_surface(Arc::clone(&top));

        let ids: Vec<u32> = compositor.scene().iter().map(|s| s.id()).collect();
        assert_eq!(ids, vec![5, 6]);

        compositor.remove_surface(&bottom);
        assert_eq!(compositor.scene().len(), 1);
        assert_eq!(compositor.scene()[0].id(), 6);
    }

    #[test]
    fn test_broadcast_dying_reaches_every_client() {
        let compositor = WallyCompositor::new(&WallyConfig::default());
        let (_a, mut rx_a) = compositor.connect().unwrap();
        let (_b, mut rx_b) = compositor.connect().unwrap();

        compositor.broadcast_dying("test");

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.try_recv() {
                Ok(Outbound::Event(Message { object_id, opcode, args })) => {
                    assert_eq!(object_id, DISPLAY_ID);
                    assert_eq!(opcode, 0);
                    assert_eq!(args[1], crate::protocol::Argument::Uint(error_code::IMPLEMENTATION));
                }
                other => panic!("expected error event, got {:?}", other),
            }
            assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        }
        assert_eq!(compositor.client_count(), 0);
        assert!(compositor.is_dying());
        assert!(compositor.is_shutting_down());
        assert_eq!(compositor.connect().unwrap_err(), ConnectError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_run_returns_when_presentation_keeps_failing() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = WallyConfig::default();
        config.server.runtime_dir = Some(dir.path().to_string_lossy().into_owned());
        config.server.socket_name = "wayland-run".to_string();
        config.scheduler.headless_fail_after = Some(0);
        config.scheduler.max_consecutive_failures = 2;

        let compositor = WallyCompositor::new(&config);
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            Arc::clone(&compositor).run(&config),
        )
        .await
        .expect("run kept going after the scheduler gave up");

        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::scheduler::SchedulerError>(),
            Some(crate::scheduler::SchedulerError::CompositorPresentationFailure { attempts: 2, .. })
        ));
        assert!(compositor.is_dying());
        assert!(!dir.path().join("wayland-run").exists());
    }

    #[test]
    fn test_shutdown_closes_clients() {
        let compositor = WallyCompositor::new(&WallyConfig::default());
        let (client, mut rx) = compositor.connect().unwrap();
        compositor.shutdown();
        assert!(client.is_closed());
        assert!(matches!(rx.try_recv(), Ok(Outbound::Close)));
        assert!(!compositor.is_dying());
    }
}
