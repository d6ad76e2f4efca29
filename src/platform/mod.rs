//! Capture backends.
//!
//! The session manager only talks to a [`Backend`] (enumerate and open) and
//! the [`DeviceHandle`] it returns (wait, copy, close). Real hardware lives
//! behind cargo features; [`crate::testing::SyntheticBackend`] implements the
//! same contract for hardware-free runs.

use crate::config::EnumerationConfig;
use crate::errors::CameraError;
use crate::types::{Device, DeviceConfig, DeviceConfigList, DeviceList};
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub mod linux;
#[cfg(feature = "native")]
pub mod native;

/// A device exactly as the OS reported it, before normalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDevice {
    pub name: String,
    pub symbolic_path: String,
    pub location_info: String,
    pub configs: Vec<DeviceConfig>,
}

/// OS capture API: device discovery and opening.
pub trait Backend: Send + Sync {
    /// Human readable backend name for logs.
    fn name(&self) -> &'static str;

    fn list_devices(&self) -> Result<Vec<RawDevice>, CameraError>;

    /// Open `symbolic_path` with `config` applied and the stream started.
    fn open_device(
        &self,
        symbolic_path: &str,
        config: &DeviceConfig,
    ) -> Result<Box<dyn DeviceHandle>, CameraError>;

    /// Release process-wide backend resources. Called once by
    /// [`crate::CameraManager::shutdown`].
    fn shutdown(&self) {}
}

/// An opened, streaming device. Owned by exactly one frame pump.
pub trait DeviceHandle: Send {
    /// Configuration the driver reports after negotiation.
    fn negotiated_config(&self) -> DeviceConfig;

    /// Block until a frame is ready or `timeout` elapses
    /// ([`CameraError::Timeout`]).
    fn wait_frame_ready(&mut self, timeout: Duration) -> Result<(), CameraError>;

    /// Copy the ready frame into memory owned by the caller.
    fn copy_frame(&mut self) -> Result<Bytes, CameraError>;

    /// Stop streaming and release the device. Called exactly once.
    fn close(&mut self) -> Result<(), CameraError>;
}

/// Filter, de-duplicate and order one device's raw modes.
///
/// Order is accepted-format order, then width, height and fps descending.
pub fn normalize_configs(raw: &[DeviceConfig], filter: &EnumerationConfig) -> DeviceConfigList {
    let rank = |cfg: &DeviceConfig| filter.formats.iter().position(|f| *f == cfg.format);

    let mut seen = HashSet::new();
    let mut configs: Vec<DeviceConfig> = raw
        .iter()
        .copied()
        .filter(|cfg| cfg.is_valid() && rank(cfg).is_some())
        .filter(|cfg| cfg.width >= filter.min_width && cfg.fps >= filter.min_fps)
        .filter(|cfg| seen.insert(*cfg))
        .collect();

    configs.sort_by(|a, b| {
        rank(a)
            .cmp(&rank(b))
            .then(b.width.cmp(&a.width))
            .then(b.height.cmp(&a.height))
            .then(b.fps.cmp(&a.fps))
    });

    if filter.include_auto && !configs.is_empty() {
        configs.insert(0, DeviceConfig::AUTO);
    }
    DeviceConfigList::new(configs)
}

/// Turn a backend listing into the cached device list, skipping devices
/// left with no usable configuration.
pub fn build_device_list(raw: Vec<RawDevice>, filter: &EnumerationConfig) -> DeviceList {
    raw.into_iter()
        .filter_map(|dev| {
            let configs = normalize_configs(&dev.configs, filter);
            if configs.candidates().next().is_none() {
                log::warn!(
                    "Skipping {} ({}): no supported configuration",
                    dev.name,
                    dev.symbolic_path
                );
                return None;
            }
            Some(Device::new(
                dev.name,
                dev.symbolic_path,
                dev.location_info,
                configs,
            ))
        })
        .collect()
}

/// The backend compiled into this build.
#[cfg(all(target_os = "linux", feature = "v4l2"))]
pub fn native_backend() -> Result<Arc<dyn Backend>, CameraError> {
    Ok(Arc::new(linux::V4l2Backend::new()))
}

/// The backend compiled into this build.
#[cfg(all(feature = "native", not(all(target_os = "linux", feature = "v4l2"))))]
pub fn native_backend() -> Result<Arc<dyn Backend>, CameraError> {
    Ok(Arc::new(native::NokhwaBackend::new()))
}

/// The backend compiled into this build.
#[cfg(not(any(all(target_os = "linux", feature = "v4l2"), feature = "native")))]
pub fn native_backend() -> Result<Arc<dyn Backend>, CameraError> {
    Err(CameraError::Unsupported(format!(
        "no capture backend compiled for {}; enable the `v4l2` or `native` feature",
        crate::types::Platform::current().as_str()
    )))
}
