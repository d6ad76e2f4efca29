//! Capability model: devices and the capture configurations they support.
//!
//! Everything here has value semantics. Accessors on the manager hand out
//! clones, so nothing a caller holds can alias manager-owned state.

use crate::errors::CameraError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Four-character pixel format code (e.g. `MJPG`).
///
/// The all-zero code is the "no format" marker carried by the auto sentinel.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FourCc([u8; 4]);

impl FourCc {
    pub const NONE: FourCc = FourCc([0; 4]);
    pub const MJPG: FourCc = FourCc(*b"MJPG");
    pub const YUYV: FourCc = FourCc(*b"YUYV");
    pub const NV12: FourCc = FourCc(*b"NV12");

    pub const fn new(code: [u8; 4]) -> Self {
        FourCc(code)
    }

    /// Build from the little-endian integer form used by V4L2 and
    /// DirectShow (`MJPG` == `0x47504A4D`).
    pub const fn from_u32(value: u32) -> Self {
        FourCc(value.to_le_bytes())
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    pub fn is_none(&self) -> bool {
        self.0 == [0; 4]
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &b in self.0.iter().take_while(|&&b| b != 0) {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({:?})", self.to_string())
    }
}

impl FromStr for FourCc {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(FourCc::NONE);
        }
        let bytes = s.as_bytes();
        if bytes.len() != 4 || !bytes.iter().all(|b| b.is_ascii_graphic() || *b == b' ') {
            return Err(CameraError::Config(format!(
                "pixel format must be exactly 4 ASCII characters, got {:?}",
                s
            )));
        }
        Ok(FourCc([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }
}

impl TryFrom<String> for FourCc {
    type Error = CameraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FourCc> for String {
    fn from(value: FourCc) -> Self {
        value.to_string()
    }
}

/// A capture mode: resolution, frame rate and pixel format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    pub format: FourCc,
}

impl DeviceConfig {
    /// "Let the backend choose."
    pub const AUTO: DeviceConfig = DeviceConfig {
        width: 0,
        height: 0,
        fps: 0,
        format: FourCc::NONE,
    };

    /// Implicit fallback target when the caller asks for [`DeviceConfig::AUTO`].
    pub const DEFAULT: DeviceConfig = DeviceConfig {
        width: 1280,
        height: 720,
        fps: 60,
        format: FourCc::MJPG,
    };

    pub const fn new(width: u32, height: u32, fps: u32, format: FourCc) -> Self {
        Self {
            width,
            height,
            fps,
            format,
        }
    }

    pub const fn mjpeg(width: u32, height: u32, fps: u32) -> Self {
        Self::new(width, height, fps, FourCc::MJPG)
    }

    pub fn with_format(mut self, format: FourCc) -> Self {
        self.format = format;
        self
    }

    pub fn is_auto(&self) -> bool {
        *self == Self::AUTO
    }

    /// A real configuration has a non-zero resolution and frame rate.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0 && self.fps > 0
    }

    pub fn same_resolution(&self, other: &DeviceConfig) -> bool {
        self.width == other.width && self.height == other.height
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self::AUTO
    }
}

impl fmt::Display for DeviceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_auto() {
            return write!(f, "auto");
        }
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)?;
        if !self.format.is_none() {
            write!(f, " {}", self.format)?;
        }
        Ok(())
    }
}

impl FromStr for DeviceConfig {
    type Err = CameraError;

    /// Parses `auto`, `WxH@FPS`, `WxH@FPS FOURCC` or `WxH@FPS:FOURCC`.
    /// A missing format means MJPEG.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(DeviceConfig::AUTO);
        }
        let invalid = || CameraError::Config(format!("invalid device config {:?}", s));

        let (mode, format) = match s.split_once(|c: char| c == ' ' || c == ':') {
            Some((mode, format)) => (mode, format.trim().parse::<FourCc>()?),
            None => (s, FourCc::MJPG),
        };
        let (size, fps) = mode.split_once('@').ok_or_else(invalid)?;
        let (width, height) = size.split_once('x').ok_or_else(invalid)?;

        let config = DeviceConfig {
            width: width.parse().map_err(|_| invalid())?,
            height: height.parse().map_err(|_| invalid())?,
            fps: fps.parse().map_err(|_| invalid())?,
            format,
        };
        if !config.is_valid() {
            return Err(invalid());
        }
        Ok(config)
    }
}

/// Ordered configurations supported by one device, in the order the
/// backend reported them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceConfigList(Vec<DeviceConfig>);

impl DeviceConfigList {
    pub fn new(configs: Vec<DeviceConfig>) -> Self {
        Self(configs)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DeviceConfig> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[DeviceConfig] {
        &self.0
    }

    /// Entries that can actually be selected (the auto sentinel is only a
    /// placeholder).
    pub fn candidates(&self) -> impl Iterator<Item = &DeviceConfig> + '_ {
        self.0.iter().filter(|c| !c.is_auto())
    }

    /// Exact structural lookup.
    pub fn get(&self, target: &DeviceConfig) -> Result<DeviceConfig, CameraError> {
        self.candidates()
            .find(|c| *c == target)
            .copied()
            .ok_or(CameraError::ConfigNotFound(*target))
    }

    /// Closest supported configuration, see [`crate::matcher::select_best_match`].
    pub fn most_similar(
        &self,
        target: &DeviceConfig,
        fallbacks: &[DeviceConfig],
    ) -> Result<DeviceConfig, CameraError> {
        crate::matcher::select_best_match(self, target, fallbacks)
    }

    pub fn into_vec(self) -> Vec<DeviceConfig> {
        self.0
    }
}

impl From<Vec<DeviceConfig>> for DeviceConfigList {
    fn from(configs: Vec<DeviceConfig>) -> Self {
        Self(configs)
    }
}

impl FromIterator<DeviceConfig> for DeviceConfigList {
    fn from_iter<I: IntoIterator<Item = DeviceConfig>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a DeviceConfigList {
    type Item = &'a DeviceConfig;
    type IntoIter = std::slice::Iter<'a, DeviceConfig>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A physical camera as seen by the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable id derived from location and name.
    pub id: String,
    pub name: String,
    /// OS path used to open the device.
    pub symbolic_path: String,
    /// Bus / port location (fixed per physical socket).
    pub location_info: String,
    pub configs: DeviceConfigList,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        symbolic_path: impl Into<String>,
        location_info: impl Into<String>,
        configs: DeviceConfigList,
    ) -> Self {
        let name = name.into();
        let symbolic_path = symbolic_path.into();
        let location_info = location_info.into();
        let location = if location_info.is_empty() {
            symbolic_path.as_str()
        } else {
            location_info.as_str()
        };
        let id = Self::derive_id(location, &name);

        Self {
            id,
            name,
            symbolic_path,
            location_info,
            configs,
        }
    }

    /// Content hash of `location + name`, so the same camera on the same
    /// port keeps its id across enumerations and reboots.
    pub fn derive_id(location_info: &str, name: &str) -> String {
        let key = format!("{}{}", location_info, name);
        Uuid::new_v5(&Uuid::NAMESPACE_OID, key.as_bytes())
            .simple()
            .to_string()
    }
}

/// Devices from one enumeration pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceList(Vec<Device>);

impl DeviceList {
    pub fn new(devices: Vec<Device>) -> Self {
        Self(devices)
    }

    /// Linear scan; device counts are single digits.
    pub fn get(&self, id: &str) -> Result<Device, CameraError> {
        self.0
            .iter()
            .find(|d| d.id == id)
            .cloned()
            .ok_or_else(|| CameraError::DeviceNotFound(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Device> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<Device> {
        self.0
    }
}

impl FromIterator<Device> for DeviceList {
    fn from_iter<I: IntoIterator<Item = Device>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for DeviceList {
    type Item = Device;
    type IntoIter = std::vec::IntoIter<Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a DeviceList {
    type Item = &'a Device;
    type IntoIter = std::slice::Iter<'a, Device>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Platform {
    Windows,
    MacOS,
    Linux,
    Unknown,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOS
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else {
            Platform::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOS => "macos",
            Platform::Linux => "linux",
            Platform::Unknown => "unknown",
        }
    }
}
