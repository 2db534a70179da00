//! # Wally Wayland Compositor Library
//!
//! A minimal Wayland compositor core: the wire codec, per-connection object
//! tables, double-buffered surface state and a vsync-driven frame scheduler
//! that hands composed frames to a pluggable renderer backend.
//!
//! ## Architecture
//!
//! - `protocol`: Wire format codec and the interfaces Wally implements
//! - `registry`: Per-connection object maps and the global registry
//! - `surface`: Pending/current surface state and commit semantics
//! - `buffer`: Client buffers and the leases that keep them on screen
//! - `shm`: Shared-memory pools mapped from client file descriptors
//! - `client`: Request dispatch for one connection
//! - `compositor`: Shared state, outputs, the scene and shutdown
//! - `scheduler`: Frame production, presentation retries and callbacks
//! - `renderer`: Backend boundary, headless backend and frame pacing
//! - `server`: Unix socket transport
//! - `config`: Configuration parsing and management
//!
//! ## Usage
//!
//! ```rust,no_run
//! use wally::{WallyCompositor, WallyConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WallyConfig::default();
//!     WallyCompositor::new(&config).run(&config).await
//! }
//! ```

pub mod buffer;
pub mod client;
pub mod compositor;
pub mod config;
pub mod protocol;
pub mod region;
pub mod registry;
pub mod renderer;
pub mod scheduler;
pub mod server;
pub mod shm;
pub mod surface;

// Re-export main types for easy access
pub use client::{Client, ProtocolError};
pub use compositor::WallyCompositor;
pub use config::WallyConfig;
pub use renderer::{HeadlessRenderer, RenderBackend};
pub use scheduler::{FrameScheduler, SchedulerError};
pub use server::WaylandServer;

// Re-export common error types
pub use anyhow::{Context, Error, Result};

/// Version information for Wally
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");
