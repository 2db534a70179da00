//! Configuration management for Wally
//!
//! This module handles loading, parsing, and validating configuration
//! from TOML files. It covers the listening socket, the outputs advertised
//! to clients, frame scheduling and general settings.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration struct containing all Wally settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WallyConfig {
    /// Listening socket settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Frame scheduling settings
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// General compositor settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Outputs advertised as `wl_output` globals; the first one drives vsync
    #[serde(default = "WallyConfig::default_outputs")]
    pub outputs: Vec<OutputConfig>,
}

/// Unix socket the compositor listens on
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Socket file name inside the runtime directory
    pub socket_name: String,

    /// Directory holding the socket; `$XDG_RUNTIME_DIR` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_dir: Option<String>,

    /// Maximum number of simultaneously connected clients
    pub max_clients: usize,
}

/// A display sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutputConfig {
    /// Connector-style name ("HEADLESS-1")
    pub name: String,

    /// Mode width (pixels)
    pub width: u32,

    /// Mode height (pixels)
    pub height: u32,

    /// Refresh rate in mHz (60000 = 60 Hz)
    pub refresh_mhz: u32,

    /// Integer output scale
    #[serde(default = "OutputConfig::default_scale")]
    pub scale: u32,

    #[serde(default = "OutputConfig::default_make")]
    pub make: String,

    #[serde(default = "OutputConfig::default_model")]
    pub model: String,
}

/// Frame scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Consecutive failed presentations tolerated before giving up
    pub max_consecutive_failures: u32,

    /// Make the headless renderer fail every frame after this many
    /// successful ones (fault injection, off by default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headless_fail_after: Option<u64>,
}

/// General compositor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GeneralConfig {
    /// Enable debug logging
    pub debug: bool,
}

impl Default for WallyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scheduler: SchedulerConfig::default(),
            general: GeneralConfig::default(),
            outputs: Self::default_outputs(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_name: "wayland-1".to_string(),
            runtime_dir: None,
            max_clients: 64,
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            name: "HEADLESS-1".to_string(),
            width: 1920,
            height: 1080,
            refresh_mhz: 60_000,
            scale: Self::default_scale(),
            make: Self::default_make(),
            model: Self::default_model(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 3,
            headless_fail_after: None,
        }
    }
}

impl OutputConfig {
    fn default_scale() -> u32 {
        1
    }
    fn default_make() -> String {
        "wally".to_string()
    }
    fn default_model() -> String {
        "headless".to_string()
    }
}

impl WallyConfig {
    fn default_outputs() -> Vec<OutputConfig> {
        vec![OutputConfig::default()]
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Expand ~ to home directory
        let expanded_path = if path.to_string_lossy().starts_with('~') {
            let home = std::env::var("HOME").context("Failed to get HOME environment variable")?;
            let rest = path.strip_prefix("~").unwrap_or(path);
            Path::new(&home).join(rest)
        } else {
            path.to_path_buf()
        };

        let contents = fs::read_to_string(&expanded_path)
            .with_context(|| format!("Failed to read config file: {}", expanded_path.display()))?;

        let config: WallyConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", expanded_path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let name = &self.server.socket_name;
        if name.is_empty() || name.contains('/') {
            anyhow::bail!("Invalid socket_name {:?}: must be a plain file name", name);
        }

        if self.server.max_clients == 0 {
            anyhow::bail!("Invalid max_clients: must be at least 1");
        }

        if self.outputs.is_empty() {
            anyhow::bail!("At least one output must be configured");
        }

        for output in &self.outputs {
            if output.width == 0 || output.height == 0 {
                anyhow::bail!("Output {}: mode must be non-zero", output.name);
            }
            // 1 Hz to 1000 Hz
            if !(1_000..=1_000_000).contains(&output.refresh_mhz) {
                anyhow::bail!(
                    "Output {}: refresh_mhz {} out of range",
                    output.name,
                    output.refresh_mhz
                );
            }
            if !(1..=4).contains(&output.scale) {
                anyhow::bail!("Output {}: scale must be between 1 and 4", output.name);
            }
        }

        if self.scheduler.max_consecutive_failures == 0 {
            anyhow::bail!("Invalid max_consecutive_failures: must be at least 1");
        }

        Ok(())
    }

    /// Save configuration to a TOML file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        fs::write(path, contents).context("Failed to write configuration file")?;

        Ok(())
    }

    /// Merge a partial configuration into this one
    /// Non-default values from the partial config will override this config
    pub fn merge_partial(mut self, partial: WallyConfig) -> Self {
        let default_config = WallyConfig::default();

        if partial.server != default_config.server {
            self.server = partial.server;
        }
        if partial.scheduler != default_config.scheduler {
            self.scheduler = partial.scheduler;
        }
        if partial.general != default_config.general {
            self.general = partial.general;
        }
        if partial.outputs != default_config.outputs {
            self.outputs = partial.outputs;
        }

        self
    }

    /// Full path of the listening socket
    pub fn socket_path(&self) -> Result<PathBuf> {
        let dir = match &self.server.runtime_dir {
            Some(dir) => PathBuf::from(dir),
            None => std::env::var_os("XDG_RUNTIME_DIR")
                .map(PathBuf::from)
                .context("XDG_RUNTIME_DIR is not set and no runtime_dir configured")?,
        };
        Ok(dir.join(&self.server.socket_name))
    }

    /// The output whose refresh drives frame scheduling
    pub fn primary_output(&self) -> Option<&OutputConfig> {
        self.outputs.first()
    }
}
