//! Cross-platform backend on top of nokhwa (Media Foundation, AVFoundation,
//! V4L2).
//!
//! A nokhwa `Camera` is created, used and dropped on one worker thread per
//! open device, and `frame()` has no timeout of its own, so the handle talks
//! to that thread through channels.

use crate::errors::CameraError;
use crate::platform::{Backend, DeviceHandle, RawDevice};
use crate::types::{DeviceConfig, FourCc};
use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::{query, Camera};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct NokhwaBackend;

impl NokhwaBackend {
    pub fn new() -> Self {
        Self
    }
}

fn to_fourcc(format: FrameFormat) -> Option<FourCc> {
    match format {
        FrameFormat::MJPEG => Some(FourCc::MJPG),
        FrameFormat::YUYV => Some(FourCc::YUYV),
        FrameFormat::NV12 => Some(FourCc::NV12),
        FrameFormat::GRAY => Some(FourCc::new(*b"GREY")),
        _ => None,
    }
}

fn to_frame_format(format: FourCc) -> Option<FrameFormat> {
    match format.as_bytes() {
        b"MJPG" => Some(FrameFormat::MJPEG),
        b"YUYV" => Some(FrameFormat::YUYV),
        b"NV12" => Some(FrameFormat::NV12),
        b"GREY" => Some(FrameFormat::GRAY),
        _ => None,
    }
}

fn camera_index(symbolic_path: &str) -> CameraIndex {
    match symbolic_path.parse::<u32>() {
        Ok(index) => CameraIndex::Index(index),
        Err(_) => CameraIndex::String(symbolic_path.to_string()),
    }
}

fn to_config(format: &CameraFormat) -> Option<DeviceConfig> {
    Some(DeviceConfig::new(
        format.width(),
        format.height(),
        format.frame_rate(),
        to_fourcc(format.format())?,
    ))
}

fn supported_modes(index: &CameraIndex) -> Result<Vec<DeviceConfig>, CameraError> {
    let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::None);
    let mut camera = Camera::new(index.clone(), requested)
        .map_err(|e| CameraError::EnumFailed(format!("Failed to open camera {}: {}", index, e)))?;
    let formats = camera
        .compatible_camera_formats()
        .map_err(|e| CameraError::EnumFailed(format!("Failed to query formats: {}", e)))?;
    Ok(formats.iter().filter_map(to_config).collect())
}

impl Backend for NokhwaBackend {
    fn name(&self) -> &'static str {
        "nokhwa"
    }

    fn list_devices(&self) -> Result<Vec<RawDevice>, CameraError> {
        let cameras = query(ApiBackend::Auto)
            .map_err(|e| CameraError::EnumFailed(format!("Failed to query cameras: {}", e)))?;

        let mut devices = Vec::new();
        for info in cameras {
            let configs = match supported_modes(info.index()) {
                Ok(configs) => configs,
                Err(e) => {
                    log::debug!("Skipping {}: {}", info.human_name(), e);
                    continue;
                }
            };
            devices.push(RawDevice {
                name: info.human_name(),
                symbolic_path: info.index().to_string(),
                location_info: info.misc(),
                configs,
            });
        }
        Ok(devices)
    }

    fn open_device(
        &self,
        symbolic_path: &str,
        config: &DeviceConfig,
    ) -> Result<Box<dyn DeviceHandle>, CameraError> {
        let frame_format = to_frame_format(config.format).ok_or_else(|| {
            CameraError::open_failed(symbolic_path, format!("unsupported pixel format {}", config.format))
        })?;
        let requested = CameraFormat::new(
            Resolution::new(config.width, config.height),
            frame_format,
            config.fps,
        );

        let index = camera_index(symbolic_path);
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let (frame_tx, frame_rx) = crossbeam_channel::bounded(1);

        let worker = {
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("becam-nokhwa".to_string())
                .spawn(move || capture_worker(index, requested, stop, ready_tx, frame_tx))
                .map_err(|e| CameraError::open_failed(symbolic_path, e.to_string()))?
        };

        let negotiated = match ready_rx.recv() {
            Ok(Ok(negotiated)) => negotiated,
            Ok(Err(message)) => {
                let _ = worker.join();
                return Err(CameraError::open_failed(symbolic_path, message));
            }
            Err(_) => {
                let _ = worker.join();
                return Err(CameraError::open_failed(symbolic_path, "capture worker exited"));
            }
        };

        Ok(Box::new(NokhwaHandle {
            negotiated,
            stop,
            frames: frame_rx,
            pending: None,
            worker: Some(worker),
        }))
    }
}

fn capture_worker(
    index: CameraIndex,
    requested: CameraFormat,
    stop: Arc<AtomicBool>,
    ready: Sender<Result<DeviceConfig, String>>,
    frames: Sender<Result<Bytes, String>>,
) {
    let format = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Exact(requested));
    let mut camera = match Camera::new(index, format) {
        Ok(camera) => camera,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    if let Err(e) = camera.open_stream() {
        let _ = ready.send(Err(e.to_string()));
        return;
    }

    let negotiated = to_config(&camera.camera_format()).unwrap_or(DeviceConfig::new(
        requested.width(),
        requested.height(),
        requested.frame_rate(),
        FourCc::NONE,
    ));
    if ready.send(Ok(negotiated)).is_err() {
        let _ = camera.stop_stream();
        return;
    }

    while !stop.load(Ordering::Acquire) {
        let result = camera
            .frame()
            .map(|buffer| buffer.buffer_bytes())
            .map_err(|e| e.to_string());
        match frames.try_send(result) {
            Ok(()) | Err(TrySendError::Full(_)) => {}
            Err(TrySendError::Disconnected(_)) => break,
        }
    }

    if let Err(e) = camera.stop_stream() {
        log::warn!("Failed to stop camera stream: {}", e);
    }
}

struct NokhwaHandle {
    negotiated: DeviceConfig,
    stop: Arc<AtomicBool>,
    frames: Receiver<Result<Bytes, String>>,
    pending: Option<Bytes>,
    worker: Option<JoinHandle<()>>,
}

impl DeviceHandle for NokhwaHandle {
    fn negotiated_config(&self) -> DeviceConfig {
        self.negotiated
    }

    fn wait_frame_ready(&mut self, timeout: Duration) -> Result<(), CameraError> {
        match self.frames.recv_timeout(timeout) {
            Ok(Ok(frame)) => {
                self.pending = Some(frame);
                Ok(())
            }
            Ok(Err(message)) => Err(CameraError::backend(message)),
            Err(RecvTimeoutError::Timeout) => Err(CameraError::Timeout),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CameraError::backend("capture worker exited"))
            }
        }
    }

    fn copy_frame(&mut self) -> Result<Bytes, CameraError> {
        self.pending
            .take()
            .ok_or_else(|| CameraError::backend("no frame ready"))
    }

    fn close(&mut self) -> Result<(), CameraError> {
        self.stop.store(true, Ordering::Release);
        self.pending = None;
        // The worker notices the flag after its current frame() returns.
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| CameraError::backend("capture worker panicked"))?;
        }
        Ok(())
    }
}
