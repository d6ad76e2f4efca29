//! Hardware-free backend for tests and demos.
//!
//! Behaves like a small USB webcam: devices with fixed mode lists, a stream
//! that needs a moment to warm up, and JPEG frames tagged with a global
//! sequence number so tests can check which frame they received.

use crate::errors::CameraError;
use crate::platform::{Backend, DeviceHandle, RawDevice};
use crate::types::{DeviceConfig, FourCc};
use bytes::{BufMut, Bytes, BytesMut};
use image::{ImageFormat, Rgb, RgbImage};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Bytes appended after the JPEG end-of-image marker.
pub const SEQUENCE_TAG_LEN: usize = 8;

/// What an opened synthetic device does when asked for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyntheticMode {
    /// Deliver a frame every `frame_period`.
    Frames,
    /// Honour the wait timeout and report `Timeout` every time.
    AlwaysTimeout,
    /// Block for the given duration regardless of the wait timeout, like a
    /// wedged driver.
    Stall(Duration),
    /// Report a backend failure on every wait.
    Fail,
}

#[derive(Debug, Clone)]
struct Behavior {
    mode: SyntheticMode,
    startup_delay: Duration,
    frame_period: Duration,
    actual_size: Option<(u32, u32)>,
    open_error: Option<String>,
    list_error: Option<String>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            mode: SyntheticMode::Frames,
            startup_delay: Duration::ZERO,
            frame_period: Duration::from_millis(5),
            actual_size: None,
            open_error: None,
            list_error: None,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    devices: Mutex<Vec<RawDevice>>,
    behavior: Mutex<Behavior>,
    jpeg_cache: Mutex<HashMap<(u32, u32), Bytes>>,
    last_open: Mutex<Option<(String, DeviceConfig)>>,
    sequence: AtomicU64,
    list_calls: AtomicUsize,
    opens: AtomicUsize,
    closes: AtomicUsize,
    shutdowns: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory [`Backend`]. Clones share state, so a test can keep one and
/// hand another to the manager.
#[derive(Debug, Clone, Default)]
pub struct SyntheticBackend {
    shared: Arc<Shared>,
}

impl SyntheticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// One MJPEG webcam with a typical mode list.
    pub fn with_default_device() -> Self {
        let backend = Self::new();
        backend.add_device(default_device());
        backend
    }

    pub fn add_device(&self, device: RawDevice) {
        lock(&self.shared.devices).push(device);
    }

    pub fn clear_devices(&self) {
        lock(&self.shared.devices).clear();
    }

    pub fn set_mode(&self, mode: SyntheticMode) {
        lock(&self.shared.behavior).mode = mode;
    }

    /// Frames before this much time after open are reported as timeouts.
    pub fn set_startup_delay(&self, delay: Duration) {
        lock(&self.shared.behavior).startup_delay = delay;
    }

    pub fn set_frame_period(&self, period: Duration) {
        lock(&self.shared.behavior).frame_period = period;
    }

    /// Encode frames at this size whatever was requested, like hardware
    /// silently substituting a resolution.
    pub fn set_actual_size(&self, size: Option<(u32, u32)>) {
        lock(&self.shared.behavior).actual_size = size;
    }

    pub fn fail_open(&self, message: Option<&str>) {
        lock(&self.shared.behavior).open_error = message.map(str::to_string);
    }

    pub fn fail_list(&self, message: Option<&str>) {
        lock(&self.shared.behavior).list_error = message.map(str::to_string);
    }

    pub fn list_calls(&self) -> usize {
        self.shared.list_calls.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn live_handles(&self) -> usize {
        self.opens().saturating_sub(self.closes())
    }

    pub fn shutdowns(&self) -> usize {
        self.shared.shutdowns.load(Ordering::SeqCst)
    }

    /// Number of frames copied so far; also the tag of the latest frame.
    pub fn frames_produced(&self) -> u64 {
        self.shared.sequence.load(Ordering::SeqCst)
    }

    pub fn last_open(&self) -> Option<(String, DeviceConfig)> {
        lock(&self.shared.last_open).clone()
    }

    fn jpeg(&self, width: u32, height: u32) -> Result<Bytes, CameraError> {
        let mut cache = lock(&self.shared.jpeg_cache);
        if let Some(jpeg) = cache.get(&(width, height)) {
            return Ok(jpeg.clone());
        }
        let jpeg = Bytes::from(synthetic_jpeg(width, height)?);
        cache.insert((width, height), jpeg.clone());
        Ok(jpeg)
    }
}

impl Backend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn list_devices(&self) -> Result<Vec<RawDevice>, CameraError> {
        self.shared.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.shared.behavior).list_error.clone() {
            return Err(CameraError::EnumFailed(message));
        }
        Ok(lock(&self.shared.devices).clone())
    }

    fn open_device(
        &self,
        symbolic_path: &str,
        config: &DeviceConfig,
    ) -> Result<Box<dyn DeviceHandle>, CameraError> {
        let behavior = lock(&self.shared.behavior).clone();
        if let Some(message) = behavior.open_error {
            return Err(CameraError::open_failed(symbolic_path, message));
        }
        let known = lock(&self.shared.devices)
            .iter()
            .any(|d| d.symbolic_path == symbolic_path);
        if !known {
            return Err(CameraError::open_failed(symbolic_path, "no such device"));
        }

        let (width, height) = behavior
            .actual_size
            .unwrap_or((config.width, config.height));
        let frame = self.jpeg(width, height)?;

        *lock(&self.shared.last_open) = Some((symbolic_path.to_string(), *config));
        self.shared.opens.fetch_add(1, Ordering::SeqCst);

        Ok(Box::new(SyntheticHandle {
            shared: self.shared.clone(),
            config: *config,
            frame,
            opened_at: Instant::now(),
            ready: false,
            closed: false,
        }))
    }

    fn shutdown(&self) {
        self.shared.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

struct SyntheticHandle {
    shared: Arc<Shared>,
    config: DeviceConfig,
    frame: Bytes,
    opened_at: Instant,
    ready: bool,
    closed: bool,
}

impl DeviceHandle for SyntheticHandle {
    fn negotiated_config(&self) -> DeviceConfig {
        self.config
    }

    fn wait_frame_ready(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let behavior = lock(&self.shared.behavior).clone();
        match behavior.mode {
            SyntheticMode::Frames => {
                let warm_at = self.opened_at + behavior.startup_delay;
                let now = Instant::now();
                if now < warm_at {
                    let remaining = warm_at - now;
                    if remaining > timeout {
                        std::thread::sleep(timeout);
                        return Err(CameraError::Timeout);
                    }
                    std::thread::sleep(remaining);
                }
                std::thread::sleep(behavior.frame_period.min(timeout));
                self.ready = true;
                Ok(())
            }
            SyntheticMode::AlwaysTimeout => {
                std::thread::sleep(timeout);
                Err(CameraError::Timeout)
            }
            SyntheticMode::Stall(duration) => {
                std::thread::sleep(duration);
                Err(CameraError::Timeout)
            }
            SyntheticMode::Fail => {
                std::thread::sleep(Duration::from_millis(1));
                Err(CameraError::backend_code(-19, "device disconnected"))
            }
        }
    }

    fn copy_frame(&mut self) -> Result<Bytes, CameraError> {
        if !std::mem::take(&mut self.ready) {
            return Err(CameraError::backend("copy_frame called without a ready frame"));
        }
        let sequence = self.shared.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        let mut buf = BytesMut::with_capacity(self.frame.len() + SEQUENCE_TAG_LEN);
        buf.extend_from_slice(&self.frame);
        buf.put_u64(sequence);
        Ok(buf.freeze())
    }

    fn close(&mut self) -> Result<(), CameraError> {
        if self.closed {
            return Err(CameraError::backend("device handle closed twice"));
        }
        self.closed = true;
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A webcam reporting a typical MJPEG and YUYV mode list.
pub fn default_device() -> RawDevice {
    let mut configs = Vec::new();
    for &(w, h) in &[(1920, 1080), (1280, 720), (640, 480)] {
        for &fps in &[30, 60] {
            configs.push(DeviceConfig::mjpeg(w, h, fps));
        }
        configs.push(DeviceConfig::new(w, h, 30, FourCc::YUYV));
    }
    RawDevice {
        name: "Synthetic Webcam".to_string(),
        symbolic_path: "/dev/synthetic0".to_string(),
        location_info: "usb-0000:00:14.0-1".to_string(),
        configs,
    }
}

/// Encode a flat-coloured JPEG of the given size.
pub fn synthetic_jpeg(width: u32, height: u32) -> Result<Vec<u8>, CameraError> {
    let image = RgbImage::from_pixel(width, height, Rgb([32, 96, 160]));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(|e| CameraError::backend(format!("failed to encode synthetic frame: {}", e)))?;
    Ok(out.into_inner())
}

/// Sequence number of a frame produced by [`SyntheticBackend`].
pub fn frame_sequence(frame: &[u8]) -> Option<u64> {
    let start = frame.len().checked_sub(SEQUENCE_TAG_LEN)?;
    let tag: [u8; SEQUENCE_TAG_LEN] = frame[start..].try_into().ok()?;
    Some(u64::from_be_bytes(tag))
}
