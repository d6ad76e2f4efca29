//! V4L2 backend (memory-mapped streaming through the `v4l` crate).

use crate::errors::CameraError;
use crate::platform::{Backend, DeviceHandle, RawDevice};
use crate::types::{DeviceConfig, FourCc};
use bytes::Bytes;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use v4l::buffer::Type;
use v4l::frameinterval::FrameIntervalEnum;
use v4l::framesize::FrameSizeEnum;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

const BUFFER_COUNT: u32 = 4;
const DEVICE_DIRS: [&str; 2] = ["/dev/v4l/by-id", "/dev/v4l/by-path"];

#[derive(Debug, Default)]
pub struct V4l2Backend;

impl V4l2Backend {
    pub fn new() -> Self {
        Self
    }

    /// Candidate device nodes, stable symlinks first, one entry per node.
    fn device_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        for dir in DEVICE_DIRS {
            if let Ok(entries) = fs::read_dir(dir) {
                let mut found: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
                found.sort();
                paths.extend(found);
            }
        }
        if let Ok(entries) = fs::read_dir("/dev") {
            let mut found: Vec<PathBuf> = entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("video"))
                })
                .collect();
            found.sort();
            paths.extend(found);
        }

        let mut seen = HashSet::new();
        paths
            .into_iter()
            .filter(|p| seen.insert(fs::canonicalize(p).unwrap_or_else(|_| p.clone())))
            .collect()
    }

    fn describe(path: &Path) -> Result<Option<RawDevice>, CameraError> {
        let device = Device::with_path(path)?;
        let caps = device.query_caps()?;
        if !caps
            .capabilities
            .contains(v4l::capability::Flags::VIDEO_CAPTURE)
        {
            return Ok(None);
        }

        Ok(Some(RawDevice {
            name: caps.card,
            symbolic_path: path.to_string_lossy().into_owned(),
            location_info: caps.bus,
            configs: device_modes(&device)?,
        }))
    }
}

/// Every format x discrete size x discrete interval the driver reports.
fn device_modes(device: &Device) -> Result<Vec<DeviceConfig>, CameraError> {
    let mut configs = Vec::new();
    for description in device.enum_formats()? {
        let format = FourCc::new(description.fourcc.repr);
        for size in device.enum_framesizes(description.fourcc)? {
            let FrameSizeEnum::Discrete(discrete) = size.size else {
                continue;
            };
            let intervals =
                device.enum_frameintervals(description.fourcc, discrete.width, discrete.height)?;
            for interval in intervals {
                if let FrameIntervalEnum::Discrete(fraction) = interval.interval {
                    if fraction.numerator == 0 {
                        continue;
                    }
                    configs.push(DeviceConfig::new(
                        discrete.width,
                        discrete.height,
                        fraction.denominator / fraction.numerator,
                        format,
                    ));
                }
            }
        }
    }
    Ok(configs)
}

impl Backend for V4l2Backend {
    fn name(&self) -> &'static str {
        "v4l2"
    }

    fn list_devices(&self) -> Result<Vec<RawDevice>, CameraError> {
        let mut devices = Vec::new();
        for path in Self::device_paths() {
            match Self::describe(&path) {
                Ok(Some(device)) => devices.push(device),
                Ok(None) => {}
                Err(e) => log::debug!("Skipping {}: {}", path.display(), e),
            }
        }
        Ok(devices)
    }

    fn open_device(
        &self,
        symbolic_path: &str,
        config: &DeviceConfig,
    ) -> Result<Box<dyn DeviceHandle>, CameraError> {
        let fail = |e: std::io::Error| CameraError::open_failed(symbolic_path, e.to_string());

        let device = Device::with_path(symbolic_path).map_err(fail)?;
        let requested = Format::new(config.width, config.height, FourCC::new(config.format.as_bytes()));
        let format = device.set_format(&requested).map_err(fail)?;
        let params = device
            .set_params(&Parameters::with_fps(config.fps))
            .map_err(fail)?;

        let fps = match params.interval.numerator {
            0 => config.fps,
            n => params.interval.denominator / n,
        };
        let negotiated = DeviceConfig::new(
            format.width,
            format.height,
            fps,
            FourCc::new(format.fourcc.repr),
        );
        if negotiated != *config {
            log::info!("Driver adjusted {} to {}", config, negotiated);
        }

        let stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT).map_err(fail)?;

        Ok(Box::new(V4l2Handle {
            stream: Some(stream),
            _device: device,
            negotiated,
            pending: None,
            timeout: None,
        }))
    }
}

struct V4l2Handle {
    stream: Option<Stream<'static>>,
    // Keeps the file descriptor open for the lifetime of the stream.
    _device: Device,
    negotiated: DeviceConfig,
    pending: Option<Bytes>,
    timeout: Option<Duration>,
}

impl DeviceHandle for V4l2Handle {
    fn negotiated_config(&self) -> DeviceConfig {
        self.negotiated
    }

    fn wait_frame_ready(&mut self, timeout: Duration) -> Result<(), CameraError> {
        let stream = self.stream.as_mut().ok_or(CameraError::NotOpen)?;
        if self.timeout != Some(timeout) {
            stream.set_timeout(timeout);
            self.timeout = Some(timeout);
        }
        // The mmap buffer is requeued on the next dequeue, so copy it out now.
        let (data, meta) = stream.next()?;
        let used = (meta.bytesused as usize).min(data.len());
        self.pending = Some(Bytes::copy_from_slice(&data[..used]));
        Ok(())
    }

    fn copy_frame(&mut self) -> Result<Bytes, CameraError> {
        self.pending
            .take()
            .ok_or_else(|| CameraError::backend("no frame ready"))
    }

    fn close(&mut self) -> Result<(), CameraError> {
        // Dropping the stream issues STREAMOFF and unmaps the buffers.
        self.stream.take();
        self.pending = None;
        Ok(())
    }
}
