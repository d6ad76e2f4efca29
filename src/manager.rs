//! Session manager: the public face of the crate.
//!
//! All state sits behind one `RwLock`. Lookups take the read side,
//! `enumerate`/`open`/`close` take the write side. A second `open` while
//! one is in flight fails with [`CameraError::AlreadyOpen`] instead of
//! queueing behind it.

use crate::assert_invariant;
use crate::config::BecamConfig;
use crate::errors::CameraError;
use crate::invariant_ppt::Invariant;
use crate::platform::{self, Backend};
use crate::pump::{FramePump, PumpStats};
use crate::types::{Device, DeviceConfig, DeviceConfigList, DeviceList, FourCc};
use bytes::Bytes;
use crossbeam_channel::RecvTimeoutError;
use image::codecs::jpeg::JpegDecoder;
use image::ImageDecoder;
use serde::Serialize;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Lifecycle phase of the manager's single session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Closed,
    Opening,
    Open,
    Closing,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Opening,
            2 => SessionState::Open,
            3 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Closed => "closed",
            SessionState::Opening => "opening",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
        }
    }
}

struct Session {
    device: Device,
    negotiated: DeviceConfig,
    pump: FramePump,
}

#[derive(Default)]
struct Inner {
    devices: DeviceList,
    session: Option<Session>,
    /// A torn-down session whose pump thread still holds the device.
    stalled: Option<Session>,
    shut_down: bool,
}

/// Clears the in-flight `open` flag however `open` exits.
struct OpeningGuard<'a>(&'a AtomicBool);

impl<'a> OpeningGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, CameraError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| CameraError::AlreadyOpen)?;
        Ok(OpeningGuard(flag))
    }
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Manages device discovery and one capture session at a time.
///
/// ```rust,no_run
/// use becam::{CameraManager, DeviceConfig};
///
/// # fn main() -> Result<(), becam::CameraError> {
/// let manager = CameraManager::native()?;
/// let devices = manager.enumerate()?;
/// if let Some(device) = devices.iter().next() {
///     manager.open(&device.id, DeviceConfig::AUTO)?;
///     let jpeg = manager.get_frame()?;
///     println!("{} bytes", jpeg.len());
///     manager.close();
/// }
/// # Ok(())
/// # }
/// ```
pub struct CameraManager {
    backend: Arc<dyn Backend>,
    config: BecamConfig,
    inner: RwLock<Inner>,
    state: AtomicU8,
    opening: AtomicBool,
}

impl CameraManager {
    /// Manager over `backend` with default settings.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            config: BecamConfig::default(),
            inner: RwLock::new(Inner::default()),
            state: AtomicU8::new(SessionState::Closed as u8),
            opening: AtomicBool::new(false),
        }
    }

    pub fn with_config(backend: Arc<dyn Backend>, config: BecamConfig) -> Result<Self, CameraError> {
        config.validate().map_err(CameraError::Config)?;
        let mut manager = Self::new(backend);
        manager.config = config;
        Ok(manager)
    }

    /// Manager over the backend compiled into this build, configured from
    /// `becam.toml` when present.
    pub fn native() -> Result<Self, CameraError> {
        Self::with_config(platform::native_backend()?, BecamConfig::load_or_default())
    }

    pub fn config(&self) -> &BecamConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Query the backend and replace the device cache.
    pub fn enumerate(&self) -> Result<DeviceList, CameraError> {
        let mut inner = self.write()?;
        if inner.shut_down {
            return Err(CameraError::ShutDown);
        }
        self.refresh_devices(&mut inner)?;
        Ok(inner.devices.clone())
    }

    /// Cached devices from the last enumeration.
    pub fn devices(&self) -> Result<DeviceList, CameraError> {
        let inner = self.read()?;
        if inner.shut_down {
            return Err(CameraError::ShutDown);
        }
        Ok(inner.devices.clone())
    }

    pub fn get_device(&self, id: &str) -> Result<Device, CameraError> {
        let inner = self.read()?;
        if inner.shut_down {
            return Err(CameraError::ShutDown);
        }
        inner.devices.get(id)
    }

    pub fn device_configs(&self, id: &str) -> Result<DeviceConfigList, CameraError> {
        self.get_device(id).map(|device| device.configs)
    }

    /// Open `id` at the configuration closest to `requested`, replacing any
    /// open session.
    ///
    /// Returns once the first frame has arrived. Passing
    /// [`DeviceConfig::AUTO`] selects the mode closest to the configured
    /// default. Fails with [`CameraError::BackendOpenFailed`] without
    /// touching the backend when the previous session's device is still
    /// held after the join timeout.
    pub fn open(&self, id: &str, requested: DeviceConfig) -> Result<(), CameraError> {
        let _opening = OpeningGuard::acquire(&self.opening)?;
        let mut inner = self.write()?;
        if inner.shut_down {
            return Err(CameraError::ShutDown);
        }

        if inner.devices.is_empty() {
            self.refresh_devices(&mut inner)?;
        }
        let device = inner.devices.get(id)?;
        let chosen = self.resolve_config(&device.configs, requested)?;

        self.set_state(SessionState::Opening);
        let opened = self
            .release_device(&mut inner)
            .and_then(|()| {
                assert_invariant!(
                    inner.session.is_none() && inner.stalled.is_none(),
                    Invariant::SingleLiveHandle,
                    "manager::open"
                );
                self.start_session(&mut inner, device, chosen)
            });

        match opened {
            Ok(negotiated) => {
                log::info!("Opened {} at {} (requested {})", id, negotiated, requested);
                self.set_state(SessionState::Open);
                Ok(())
            }
            Err(e) => {
                self.set_state(SessionState::Closed);
                log::warn!("Failed to open {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Device and negotiated configuration of the open session.
    pub fn get_current_config(&self) -> Result<(Device, DeviceConfig), CameraError> {
        let inner = self.read()?;
        if inner.shut_down {
            return Err(CameraError::ShutDown);
        }
        let session = inner.session.as_ref().ok_or(CameraError::NotOpen)?;
        Ok((session.device.clone(), session.negotiated))
    }

    /// Next frame published after this call started waiting.
    pub fn get_frame(&self) -> Result<Bytes, CameraError> {
        let receiver = {
            let inner = self.read()?;
            if inner.shut_down {
                return Err(CameraError::ShutDown);
            }
            inner
                .session
                .as_ref()
                .ok_or(CameraError::NotOpen)?
                .pump
                .receiver()
        };

        let capture = &self.config.capture;
        let attempt_timeout = capture.frame_attempt_timeout();
        for attempt in 1..=capture.frame_retries {
            match receiver.recv_timeout(attempt_timeout) {
                Ok(Ok(frame)) => return Ok(frame),
                Ok(Err(e)) if e.is_timeout() => {
                    log::trace!("Frame attempt {}/{}: backend timeout", attempt, capture.frame_retries);
                }
                Ok(Err(e)) => return Err(e),
                Err(RecvTimeoutError::Timeout) => {
                    log::trace!("Frame attempt {}/{}: no frame", attempt, capture.frame_retries);
                }
                Err(RecvTimeoutError::Disconnected) => return Err(CameraError::NotOpen),
            }
        }
        Err(CameraError::Timeout)
    }

    /// Counters of the open session's frame pump.
    pub fn frame_stats(&self) -> Result<PumpStats, CameraError> {
        let inner = self.read()?;
        inner
            .session
            .as_ref()
            .map(|s| s.pump.stats())
            .ok_or(CameraError::NotOpen)
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Stop the session and release the device. Does nothing when closed.
    ///
    /// A pump that outlives the join timeout is kept aside; the next
    /// `open` waits for it again before touching the backend.
    pub fn close(&self) {
        let mut inner = self.write_recovering();
        if let Some(session) = inner.session.take() {
            self.set_state(SessionState::Closing);
            match self.teardown(session) {
                Ok(()) => log::info!("Camera closed"),
                Err(session) => inner.stalled = Some(session),
            }
            self.set_state(SessionState::Closed);
        }
    }

    /// Close and release the backend. Every later call fails with
    /// [`CameraError::ShutDown`]; `close` and `shutdown` become no-ops.
    pub fn shutdown(&self) {
        let mut inner = self.write_recovering();
        if inner.shut_down {
            return;
        }
        if let Some(session) = inner.session.take() {
            self.set_state(SessionState::Closing);
            if let Err(session) = self.teardown(session) {
                inner.stalled = Some(session);
            }
        }
        if let Some(stalled) = inner.stalled.take() {
            if let Err(session) = self.teardown(stalled) {
                // Dropping the pump leaves its cancelled thread to close
                // the handle once the hardware wait returns.
                log::warn!("Abandoning frame pump for {}", session.device.name);
            }
        }
        self.set_state(SessionState::Closed);
        self.backend.shutdown();
        inner.devices = DeviceList::default();
        inner.shut_down = true;
        log::info!("Camera manager shut down ({} backend)", self.backend.name());
    }

    pub fn is_shut_down(&self) -> bool {
        self.read().map(|inner| inner.shut_down).unwrap_or(true)
    }

    fn refresh_devices(&self, inner: &mut Inner) -> Result<(), CameraError> {
        let raw = match self.backend.list_devices() {
            Ok(raw) => raw,
            Err(e) => {
                inner.devices = DeviceList::default();
                return Err(match e {
                    CameraError::EnumFailed(_) => e,
                    other => CameraError::EnumFailed(other.to_string()),
                });
            }
        };
        let reported = raw.len();
        inner.devices = platform::build_device_list(raw, &self.config.enumeration);
        log::info!(
            "Enumerated {} device(s) via {} ({} reported)",
            inner.devices.len(),
            self.backend.name(),
            reported
        );
        Ok(())
    }

    fn resolve_config(
        &self,
        configs: &DeviceConfigList,
        requested: DeviceConfig,
    ) -> Result<DeviceConfig, CameraError> {
        let fallbacks: &[DeviceConfig] = if requested.is_auto() {
            std::slice::from_ref(&self.config.capture.default_config)
        } else {
            &[]
        };
        let chosen = configs.most_similar(&requested, fallbacks)?;
        if chosen != requested {
            log::debug!("Requested {}, selected {}", requested, chosen);
        }
        Ok(chosen)
    }

    /// Tear down the open session, or retry one left stalled by an
    /// earlier teardown. Fails while a pump thread still holds a device.
    fn release_device(&self, inner: &mut Inner) -> Result<(), CameraError> {
        if let Some(previous) = inner.session.take() {
            log::info!("Replacing open session on {}", previous.device.name);
            if let Err(session) = self.teardown(previous) {
                inner.stalled = Some(session);
            }
        } else if let Some(stalled) = inner.stalled.take() {
            log::info!("Waiting again for frame pump on {}", stalled.device.name);
            if let Err(session) = self.teardown(stalled) {
                inner.stalled = Some(session);
            }
        }

        match &inner.stalled {
            Some(stalled) => Err(CameraError::open_failed(
                &stalled.device.symbolic_path,
                "previous session has not released the device",
            )),
            None => Ok(()),
        }
    }

    /// Open the device, start the pump and wait for a usable first frame.
    /// On success the session is stored in `inner`. On failure nothing
    /// stays acquired, unless the pump outlives the join timeout, in which
    /// case it is parked as stalled.
    fn start_session(
        &self,
        inner: &mut Inner,
        device: Device,
        chosen: DeviceConfig,
    ) -> Result<DeviceConfig, CameraError> {
        let capture = &self.config.capture;
        let handle = self
            .backend
            .open_device(&device.symbolic_path, &chosen)
            .map_err(|e| match e {
                CameraError::BackendOpenFailed { .. } => e,
                other => CameraError::open_failed(&device.symbolic_path, other.to_string()),
            })?;
        let reported = fill_unreported(handle.negotiated_config(), chosen);

        let pump = FramePump::start(handle, capture.pump_wait_timeout())?;
        let receiver = pump.receiver();

        let mut reason = String::from("no frame received");
        for attempt in 1..=capture.open_attempts {
            match receiver.recv_timeout(capture.open_attempt_timeout()) {
                Ok(Ok(frame)) => match confirm_config(reported, &frame) {
                    Ok(negotiated) => {
                        assert_invariant!(
                            negotiated.is_valid(),
                            Invariant::NegotiatedConfigValid,
                            "manager::open"
                        );
                        inner.session = Some(Session {
                            device,
                            negotiated,
                            pump,
                        });
                        return Ok(negotiated);
                    }
                    Err(e) => reason = e.to_string(),
                },
                Ok(Err(e)) => reason = e.to_string(),
                Err(RecvTimeoutError::Timeout) => {
                    reason = String::from("timed out waiting for first frame");
                }
                Err(RecvTimeoutError::Disconnected) => {
                    reason = String::from("frame pump stopped");
                    break;
                }
            }
            log::debug!("First frame attempt {}/{}: {}", attempt, capture.open_attempts, reason);
        }

        let failed = Session {
            device,
            negotiated: reported,
            pump,
        };
        if let Err(session) = self.teardown(failed) {
            inner.stalled = Some(session);
        }
        Err(CameraError::FirstFrameTimeout {
            attempts: capture.open_attempts,
            reason,
        })
    }

    /// Stop the session's pump and give the kernel a moment to reclaim the
    /// device. Hands the session back if the pump thread is still running
    /// after the join timeout.
    fn teardown(&self, mut session: Session) -> Result<(), Session> {
        let capture = &self.config.capture;
        if let Err(e) = session.pump.stop(capture.pump_join_timeout()) {
            log::warn!(
                "Frame pump for {} still holds the device: {}",
                session.device.name,
                e
            );
            return Err(session);
        }
        std::thread::sleep(capture.close_grace());
        Ok(())
    }

    fn set_state(&self, state: SessionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>, CameraError> {
        Ok(self.inner.read()?)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>, CameraError> {
        Ok(self.inner.write()?)
    }

    /// Cleanup paths must run even after a panic poisoned the lock.
    fn write_recovering(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Drivers may leave fields they did not negotiate at zero.
fn fill_unreported(reported: DeviceConfig, chosen: DeviceConfig) -> DeviceConfig {
    let pick = |r: u32, c: u32| if r == 0 { c } else { r };
    DeviceConfig {
        width: pick(reported.width, chosen.width),
        height: pick(reported.height, chosen.height),
        fps: pick(reported.fps, chosen.fps),
        format: if reported.format.is_none() {
            chosen.format
        } else {
            reported.format
        },
    }
}

/// Replace the resolution with the one encoded in an MJPEG frame's header.
fn confirm_config(reported: DeviceConfig, frame: &[u8]) -> Result<DeviceConfig, CameraError> {
    if reported.format != FourCc::MJPG {
        return Ok(reported);
    }
    let decoder = JpegDecoder::new(Cursor::new(frame))
        .map_err(|e| CameraError::backend(format!("first frame is not a valid JPEG: {}", e)))?;
    let (width, height) = decoder.dimensions();
    Ok(DeviceConfig {
        width,
        height,
        ..reported
    })
}
