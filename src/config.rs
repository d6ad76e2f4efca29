//! Runtime configuration for the camera manager.
//!
//! Retry budgets, timeouts and enumeration filters, loadable from TOML.

use crate::errors::CameraError;
use crate::types::{DeviceConfig, FourCc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BecamConfig {
    pub capture: CaptureConfig,
    pub enumeration: EnumerationConfig,
}

/// Session timing and retry budgets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Fallback target when a caller asks for the auto config
    pub default_config: DeviceConfig,
    /// Attempts to receive a first frame after opening
    pub open_attempts: u32,
    /// Per-attempt wait while proving the stream, in milliseconds
    pub open_attempt_timeout_ms: u64,
    /// Receive attempts per `get_frame` call
    pub frame_retries: u32,
    /// Per-attempt wait in `get_frame`, in milliseconds
    pub frame_attempt_timeout_ms: u64,
    /// Bound on one hardware "frame ready" wait inside the pump
    pub pump_wait_timeout_ms: u64,
    /// Bound on joining the pump thread at close
    pub pump_join_timeout_ms: u64,
    /// Pause after releasing a device so the kernel can reclaim it
    pub close_grace_ms: u64,
}

/// Filters applied to every enumerated device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnumerationConfig {
    /// Accepted pixel formats, in preference order
    pub formats: Vec<FourCc>,
    /// Modes narrower than this are dropped
    pub min_width: u32,
    /// Modes slower than this are dropped
    pub min_fps: u32,
    /// Prepend the auto sentinel to each device's config list
    pub include_auto: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            default_config: DeviceConfig::DEFAULT,
            open_attempts: 50,
            open_attempt_timeout_ms: 3000,
            frame_retries: 50,
            frame_attempt_timeout_ms: 50,
            pump_wait_timeout_ms: 5000,
            pump_join_timeout_ms: 10_000,
            close_grace_ms: 100,
        }
    }
}

impl Default for EnumerationConfig {
    fn default() -> Self {
        Self {
            formats: vec![FourCc::MJPG],
            min_width: 600,
            min_fps: 20,
            include_auto: true,
        }
    }
}

impl Default for BecamConfig {
    fn default() -> Self {
        Self {
            capture: CaptureConfig::default(),
            enumeration: EnumerationConfig::default(),
        }
    }
}

impl CaptureConfig {
    pub fn open_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.open_attempt_timeout_ms)
    }

    pub fn frame_attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_attempt_timeout_ms)
    }

    pub fn pump_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_wait_timeout_ms)
    }

    pub fn pump_join_timeout(&self) -> Duration {
        Duration::from_millis(self.pump_join_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

impl BecamConfig {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, CameraError> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| CameraError::Config(format!("Failed to read config file: {}", e)))?;

        let config: BecamConfig = toml::from_str(&contents)
            .map_err(|e| CameraError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate().map_err(CameraError::Config)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                CameraError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| CameraError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| CameraError::Config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        PathBuf::from("becam.toml")
    }

    /// Load from default location or fall back to defaults
    pub fn load_or_default() -> Self {
        Self::load_from_file(Self::default_path()).unwrap_or_else(|e| {
            log::warn!("Failed to load config, using defaults: {}", e);
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), String> {
        let capture = &self.capture;
        if !capture.default_config.is_valid() {
            return Err("Default config must have non-zero resolution and fps".to_string());
        }
        if capture.open_attempts == 0 || capture.frame_retries == 0 {
            return Err("Retry budgets must be at least 1".to_string());
        }
        if capture.open_attempt_timeout_ms == 0
            || capture.frame_attempt_timeout_ms == 0
            || capture.pump_wait_timeout_ms == 0
            || capture.pump_join_timeout_ms == 0
        {
            return Err("Timeouts must be greater than zero".to_string());
        }

        if self.enumeration.formats.is_empty() {
            return Err("At least one pixel format must be accepted".to_string());
        }
        if self.enumeration.formats.iter().any(FourCc::is_none) {
            return Err("Accepted pixel formats must not be empty codes".to_string());
        }

        Ok(())
    }
}
