use crate::types::DeviceConfig;
use thiserror::Error;

/// Errors produced by the camera session manager and its backends.
#[derive(Debug, Error)]
pub enum CameraError {
    /// The backend could not list devices.
    #[error("Device enumeration failed: {0}")]
    EnumFailed(String),

    /// No cached device carries the requested id.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// No supported configuration matches the request or its fallbacks.
    #[error("No matching device config found for {0}")]
    ConfigNotFound(DeviceConfig),

    /// Another `open` is in flight.
    #[error("Camera open already in progress")]
    AlreadyOpen,

    #[error("Camera is not open")]
    NotOpen,

    /// The backend refused to open or configure the device.
    #[error("Failed to open device {path}: {message}")]
    BackendOpenFailed { path: String, message: String },

    /// The stream never produced a usable frame after opening.
    #[error("No frame received after {attempts} attempts: {reason}")]
    FirstFrameTimeout { attempts: u32, reason: String },

    /// A frame did not arrive in time.
    #[error("Timed out waiting for frame")]
    Timeout,

    /// Backend-specific failure, optionally carrying the native status code.
    #[error("Backend error: {message}")]
    Backend { code: Option<i32>, message: String },

    #[error("Camera manager has been shut down")]
    ShutDown,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Lock poisoned by previous panic")]
    PoisonedLock,
}

/// Coarse classification of [`CameraError`] used for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Timeout,
    BackendFailure,
    AlreadyOpen,
    NotOpen,
    ShutDown,
    InvalidConfig,
    Unsupported,
    Internal,
}

impl ErrorKind {
    /// Stable numeric code for presentation layers that localise messages
    /// themselves.
    pub fn code(self) -> u32 {
        match self {
            ErrorKind::NotFound => 1,
            ErrorKind::Timeout => 2,
            ErrorKind::BackendFailure => 3,
            ErrorKind::AlreadyOpen => 4,
            ErrorKind::NotOpen => 5,
            ErrorKind::ShutDown => 6,
            ErrorKind::InvalidConfig => 7,
            ErrorKind::Unsupported => 8,
            ErrorKind::Internal => 9,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BackendFailure => "backend_failure",
            ErrorKind::AlreadyOpen => "already_open",
            ErrorKind::NotOpen => "not_open",
            ErrorKind::ShutDown => "shut_down",
            ErrorKind::InvalidConfig => "invalid_config",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::Internal => "internal",
        }
    }
}

impl CameraError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CameraError::DeviceNotFound(_) | CameraError::ConfigNotFound(_) => ErrorKind::NotFound,
            CameraError::Timeout | CameraError::FirstFrameTimeout { .. } => ErrorKind::Timeout,
            CameraError::EnumFailed(_)
            | CameraError::BackendOpenFailed { .. }
            | CameraError::Backend { .. } => ErrorKind::BackendFailure,
            CameraError::AlreadyOpen => ErrorKind::AlreadyOpen,
            CameraError::NotOpen => ErrorKind::NotOpen,
            CameraError::ShutDown => ErrorKind::ShutDown,
            CameraError::Config(_) => ErrorKind::InvalidConfig,
            CameraError::Unsupported(_) => ErrorKind::Unsupported,
            CameraError::PoisonedLock => ErrorKind::Internal,
        }
    }

    /// True for the transient "frame not ready yet" signal that frame
    /// retrieval retries on.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CameraError::Timeout)
    }

    pub fn backend(message: impl Into<String>) -> Self {
        CameraError::Backend {
            code: None,
            message: message.into(),
        }
    }

    pub fn backend_code(code: i32, message: impl Into<String>) -> Self {
        CameraError::Backend {
            code: Some(code),
            message: message.into(),
        }
    }

    pub fn open_failed(path: &str, message: impl Into<String>) -> Self {
        CameraError::BackendOpenFailed {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for CameraError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => CameraError::Timeout,
            _ => CameraError::Backend {
                code: err.raw_os_error(),
                message: err.to_string(),
            },
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for CameraError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        CameraError::PoisonedLock
    }
}
