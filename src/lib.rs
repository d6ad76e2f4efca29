//! becam: webcam session manager
//!
//! Enumerates capture devices, picks the supported capture mode closest to
//! what the caller asked for, and turns the device's frame stream into a
//! blocking "give me the next frame" call.
//!
//! # Features
//! - Deterministic best-match selection of resolution, frame rate and format
//! - One background frame pump per session, freshest frame wins
//! - Bounded retries and timeouts on open and on every frame read
//! - Open-or-replace sessions and idempotent close
//! - Stable device ids across enumerations
//!
//! # Usage
//! ```toml
//! [dependencies]
//! becam = { version = "0.1", features = ["v4l2"] }
//! ```
//!
//! ```rust,no_run
//! use becam::{CameraManager, DeviceConfig};
//!
//! # fn main() -> Result<(), becam::CameraError> {
//! becam::init_logging();
//! let manager = CameraManager::native()?;
//! for device in &manager.enumerate()? {
//!     println!("{} {}", device.id, device.name);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Frames are opaque MJPEG buffers; nothing here decodes pixel data.
pub mod config;
pub mod errors;
pub mod invariant_ppt;
pub mod manager;
pub mod matcher;
pub mod platform;
pub mod pump;
pub mod types;

// Testing utilities - synthetic backend for hardware-free runs
pub mod testing;

// Re-exports for convenience
pub use config::BecamConfig;
pub use errors::{CameraError, ErrorKind};
pub use manager::{CameraManager, SessionState};
pub use matcher::select_best_match;
pub use platform::{Backend, DeviceHandle, RawDevice};
pub use pump::PumpStats;
pub use types::{Device, DeviceConfig, DeviceConfigList, DeviceList, FourCc, Platform};

/// Initialize logging for the camera system
pub fn init_logging() {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "becam=info");
    }
    let _ = env_logger::try_init();
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Get crate information
pub fn get_info() -> CrateInfo {
    CrateInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        platform: Platform::current(),
        backend: compiled_backend().to_string(),
    }
}

/// Name of the capture backend selected at compile time.
pub fn compiled_backend() -> &'static str {
    if cfg!(all(target_os = "linux", feature = "v4l2")) {
        "v4l2"
    } else if cfg!(feature = "native") {
        "nokhwa"
    } else {
        "none"
    }
}

/// Crate information structure
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CrateInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    pub platform: Platform,
    pub backend: String,
}
