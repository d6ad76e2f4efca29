//! Testing utilities.
//!
//! [`SyntheticBackend`] stands in for camera hardware so the manager and
//! pump can be exercised anywhere.

pub mod synthetic;

pub use synthetic::{
    default_device, frame_sequence, synthetic_jpeg, SyntheticBackend, SyntheticMode,
    SEQUENCE_TAG_LEN,
};
