//! Runtime configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::geometry::{Color, Size};

/// Errors from configuration validation
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("output {name:?} has zero size ({width}x{height})")]
    ZeroSizedOutput { name: String, width: u32, height: u32 },

    #[error("output size {width}x{height} exceeds the {max} pixel limit")]
    OutputTooLarge { width: u32, height: u32, max: u32 },

    #[error("tick_interval_ms must be greater than zero")]
    ZeroTickInterval,

    #[error("liveness timings must be greater than zero")]
    ZeroLiveness,

    #[error("font_size must be a positive number, got {0}")]
    InvalidFontSize(f32),

    #[error("cursor_size must be between 1 and {max}, got {size}")]
    InvalidCursorSize { size: u32, max: u32 },
}

/// Largest accepted output dimension
pub const MAX_OUTPUT_DIMENSION: u32 = 16384;

/// Largest accepted cursor size
pub const MAX_CURSOR_SIZE: u32 = 256;

/// A virtual output to create at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

impl OutputConfig {
    pub fn size(&self) -> Size {
        Size::new(self.width as i32, self.height as i32)
    }
}

/// Client ping/pong timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Delay between a pong and the next ping (ms)
    pub ping_interval_ms: u64,

    /// How long a client has to answer a ping (ms)
    pub ping_timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: 5000,
            ping_timeout_ms: 3000,
        }
    }
}

impl LivenessConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Compositor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Background fill behind the wallpaper
    pub background: Color,

    /// PNG wallpaper, cropped and scaled to the primary output
    pub wallpaper: Option<PathBuf>,

    /// Cursor height in pixels
    pub cursor_size: u32,

    /// Font size in pixels (default: 14.0)
    pub font_size: f32,

    /// Virtual outputs, the first is primary
    pub outputs: Vec<OutputConfig>,

    /// Used when `outputs` is empty. `None` makes that fatal.
    pub fallback_output: Option<OutputConfig>,

    pub liveness: LivenessConfig,

    /// Event loop timer period for liveness checks (ms)
    pub tick_interval_ms: u64,

    /// IPC socket path (overridden by STONE_SOCKET)
    pub socket_path: Option<PathBuf>,

    /// Accept the debug `inject_input` request
    pub allow_input_injection: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            background: Color::BLACK,
            wallpaper: None,
            cursor_size: 24,
            font_size: 14.0,
            outputs: Vec::new(),
            fallback_output: Some(OutputConfig {
                name: "virtual-0".to_string(),
                width: 1280,
                height: 800,
            }),
            liveness: LivenessConfig::default(),
            tick_interval_ms: 100,
            socket_path: None,
            allow_input_injection: false,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("stone/config.toml")),
            Some(PathBuf::from("/etc/stone/config.toml")),
        ];

        for path in config_paths.into_iter().flatten() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match toml::from_str::<Config>(&content) {
                        Ok(config) => {
                            tracing::info!(?path, outputs = config.outputs.len(), "loaded configuration");
                            return config;
                        }
                        Err(e) => {
                            tracing::warn!(?path, error = %e, "failed to parse config");
                        }
                    },
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "failed to read config");
                    }
                }
            }
        }

        tracing::info!("using default configuration");
        Self::default()
    }

    /// Check values serde cannot rule out
    pub fn validate(&self) -> Result<(), ConfigError> {
        for output in self.outputs.iter().chain(self.fallback_output.as_ref()) {
            if output.width == 0 || output.height == 0 {
                return Err(ConfigError::ZeroSizedOutput {
                    name: output.name.clone(),
                    width: output.width,
                    height: output.height,
                });
            }
            if output.width > MAX_OUTPUT_DIMENSION || output.height > MAX_OUTPUT_DIMENSION {
                return Err(ConfigError::OutputTooLarge {
                    width: output.width,
                    height: output.height,
                    max: MAX_OUTPUT_DIMENSION,
                });
            }
        }
        if self.tick_interval_ms == 0 {
            return Err(ConfigError::ZeroTickInterval);
        }
        if self.liveness.ping_interval_ms == 0 || self.liveness.ping_timeout_ms == 0 {
            return Err(ConfigError::ZeroLiveness);
        }
        if !(self.font_size.is_finite() && self.font_size > 0.0) {
            return Err(ConfigError::InvalidFontSize(self.font_size));
        }
        if self.cursor_size == 0 || self.cursor_size > MAX_CURSOR_SIZE {
            return Err(ConfigError::InvalidCursorSize {
                size: self.cursor_size,
                max: MAX_CURSOR_SIZE,
            });
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// Helper for getting XDG directories
mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
    }
}
