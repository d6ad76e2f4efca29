//! Frame pump: one background thread per open session.
//!
//! The thread waits on the device, copies each frame and offers it on a
//! zero-capacity channel. A frame is handed over only if a reader is
//! blocked in `recv` at that moment; otherwise it is dropped. Readers
//! therefore always get a frame captured after they started waiting.

use crate::errors::CameraError;
use crate::platform::DeviceHandle;
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::Serialize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// What a reader receives: frame bytes or the backend failure.
pub type FrameResult = Result<Bytes, CameraError>;

const ERROR_BACKOFF: Duration = Duration::from_millis(5);
const JOIN_POLL: Duration = Duration::from_millis(5);

/// One-shot cancellation flag shared with the pump thread.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Snapshot of a pump's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    /// Frames handed to a waiting reader.
    pub delivered: u64,
    /// Frames captured while nobody was waiting.
    pub dropped: u64,
    /// Backend errors, timeouts included.
    pub errors: u64,
}

#[derive(Debug, Default)]
struct Counters {
    delivered: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PumpStats {
        PumpStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

pub struct FramePump {
    cancel: CancelToken,
    receiver: Receiver<FrameResult>,
    counters: Arc<Counters>,
    thread: Option<JoinHandle<()>>,
}

impl FramePump {
    /// Spawn the pump thread. It takes ownership of `handle` and closes it
    /// when the loop ends.
    pub fn start(
        handle: Box<dyn DeviceHandle>,
        wait_timeout: Duration,
    ) -> Result<FramePump, CameraError> {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        let cancel = CancelToken::new();
        let counters = Arc::new(Counters::default());

        let thread = {
            let cancel = cancel.clone();
            let counters = counters.clone();
            std::thread::Builder::new()
                .name("becam-frame-pump".to_string())
                .spawn(move || run(handle, sender, cancel, counters, wait_timeout))
                .map_err(|e| CameraError::backend(format!("failed to spawn frame pump: {}", e)))?
        };

        Ok(FramePump {
            cancel,
            receiver,
            counters,
            thread: Some(thread),
        })
    }

    /// A receiving end of the frame channel. Clones share the channel.
    pub fn receiver(&self) -> Receiver<FrameResult> {
        self.receiver.clone()
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Cancel the loop and wait at most `join_timeout` for the thread.
    ///
    /// On timeout the pump keeps its thread handle and the device stays
    /// open until the current hardware wait returns. Calling `stop` again
    /// resumes the wait.
    pub fn stop(&mut self, join_timeout: Duration) -> Result<(), CameraError> {
        self.cancel.cancel();

        let Some(handle) = self.thread.take() else {
            return Ok(());
        };

        let start = Instant::now();
        while !handle.is_finished() {
            if start.elapsed() >= join_timeout {
                log::warn!("Frame pump did not stop within {:?}", join_timeout);
                self.thread = Some(handle);
                return Err(CameraError::Timeout);
            }
            std::thread::sleep(JOIN_POLL);
        }

        if handle.join().is_err() {
            log::warn!("Frame pump thread panicked");
        }
        Ok(())
    }
}

impl Drop for FramePump {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn run(
    mut handle: Box<dyn DeviceHandle>,
    sender: Sender<FrameResult>,
    cancel: CancelToken,
    counters: Arc<Counters>,
    wait_timeout: Duration,
) {
    log::debug!("Frame pump started ({})", handle.negotiated_config());

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        pump_loop(handle.as_mut(), &sender, &cancel, &counters, wait_timeout)
    }));
    if outcome.is_err() {
        log::warn!("Frame pump loop panicked; releasing device");
    }

    if let Err(e) = handle.close() {
        log::warn!("Failed to close device: {}", e);
    }
    log::debug!("Frame pump stopped ({:?})", counters.snapshot());
}

fn pump_loop(
    handle: &mut dyn DeviceHandle,
    sender: &Sender<FrameResult>,
    cancel: &CancelToken,
    counters: &Counters,
    wait_timeout: Duration,
) {
    while !cancel.is_cancelled() {
        let result = handle
            .wait_frame_ready(wait_timeout)
            .and_then(|()| handle.copy_frame());

        // Cancellation observed after the wait wins over any frame.
        if cancel.is_cancelled() {
            break;
        }

        let failed = result.as_ref().err().map(|e| !e.is_timeout());
        if let Err(e) = &result {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            log::trace!("Frame pump backend error: {}", e);
        }

        match sender.try_send(result) {
            Ok(()) => {
                counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(_)) => {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Disconnected(_)) => break,
        }

        if failed == Some(true) {
            std::thread::sleep(ERROR_BACKOFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DeviceConfig;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandle {
        closes: Arc<AtomicUsize>,
        fail: bool,
    }

    impl DeviceHandle for CountingHandle {
        fn negotiated_config(&self) -> DeviceConfig {
            DeviceConfig::mjpeg(640, 480, 30)
        }

        fn wait_frame_ready(&mut self, _timeout: Duration) -> Result<(), CameraError> {
            std::thread::sleep(Duration::from_millis(1));
            if self.fail {
                Err(CameraError::backend("unplugged"))
            } else {
                Ok(())
            }
        }

        fn copy_frame(&mut self) -> Result<Bytes, CameraError> {
            Ok(Bytes::from_static(b"frame"))
        }

        fn close(&mut self) -> Result<(), CameraError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_cancel_token() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_frames_without_reader_are_dropped() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = CountingHandle {
            closes: closes.clone(),
            fail: false,
        };
        let mut pump = FramePump::start(Box::new(handle), Duration::from_millis(50)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        let stats = pump.stats();
        assert_eq!(stats.delivered, 0);
        assert!(stats.dropped > 0);

        pump.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(!pump.is_running());
    }

    #[test]
    fn test_waiting_reader_receives_frame() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = CountingHandle {
            closes: closes.clone(),
            fail: false,
        };
        let mut pump = FramePump::start(Box::new(handle), Duration::from_millis(50)).unwrap();
        let frame = pump
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap();
        assert_eq!(&frame[..], b"frame");
        assert!(pump.stats().delivered >= 1);
        pump.stop(Duration::from_secs(1)).unwrap();
    }

    #[test]
    fn test_backend_errors_are_forwarded() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = CountingHandle {
            closes: closes.clone(),
            fail: true,
        };
        let mut pump = FramePump::start(Box::new(handle), Duration::from_millis(50)).unwrap();
        let err = pump
            .receiver()
            .recv_timeout(Duration::from_secs(1))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, CameraError::Backend { .. }));
        pump.stop(Duration::from_secs(1)).unwrap();
        assert!(pump.stats().errors >= 1);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let handle = CountingHandle {
            closes: closes.clone(),
            fail: false,
        };
        let mut pump = FramePump::start(Box::new(handle), Duration::from_millis(50)).unwrap();
        pump.stop(Duration::from_secs(1)).unwrap();
        pump.stop(Duration::from_secs(1)).unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
