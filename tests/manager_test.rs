//! Session manager lifecycle tests against the synthetic backend.

#[cfg(test)]
mod manager_tests {
    use becam::errors::{CameraError, ErrorKind};
    use becam::invariant_ppt::{check_count, clear_invariant_log, contract_test, Invariant};
    use becam::platform::RawDevice;
    use becam::testing::{default_device, frame_sequence, SyntheticBackend, SyntheticMode};
    use becam::types::{Device, DeviceConfig, FourCc};
    use becam::{BecamConfig, CameraManager, SessionState};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    fn fast_config() -> BecamConfig {
        let mut config = BecamConfig::default();
        config.capture.open_attempts = 20;
        config.capture.open_attempt_timeout_ms = 100;
        config.capture.frame_retries = 10;
        config.capture.frame_attempt_timeout_ms = 50;
        config.capture.pump_wait_timeout_ms = 20;
        config.capture.pump_join_timeout_ms = 1000;
        config.capture.close_grace_ms = 5;
        config
    }

    fn setup_with(config: BecamConfig) -> (SyntheticBackend, CameraManager) {
        let backend = SyntheticBackend::with_default_device();
        let manager = CameraManager::with_config(Arc::new(backend.clone()), config).unwrap();
        (backend, manager)
    }

    fn setup() -> (SyntheticBackend, CameraManager) {
        setup_with(fast_config())
    }

    fn first_id(manager: &CameraManager) -> String {
        manager.enumerate().unwrap().iter().next().unwrap().id.clone()
    }

    fn second_device() -> RawDevice {
        RawDevice {
            name: "Second Webcam".to_string(),
            symbolic_path: "/dev/synthetic1".to_string(),
            location_info: "usb-0000:00:14.0-2".to_string(),
            configs: vec![DeviceConfig::mjpeg(1280, 720, 30), DeviceConfig::mjpeg(640, 480, 30)],
        }
    }

    #[test]
    fn test_enumerate_filters_and_caches() {
        let (backend, manager) = setup();
        let devices = manager.enumerate().unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(backend.list_calls(), 1);

        let device = devices.iter().next().unwrap();
        assert_eq!(device.name, "Synthetic Webcam");
        assert_eq!(device.configs.as_slice()[0], DeviceConfig::AUTO);
        assert!(device.configs.iter().all(|c| c.is_auto() || c.format == FourCc::MJPG));
        assert_eq!(device.configs.as_slice()[1], DeviceConfig::mjpeg(1920, 1080, 60));

        assert_eq!(manager.get_device(&device.id).unwrap(), *device);
        assert_eq!(manager.device_configs(&device.id).unwrap(), device.configs);
        assert_eq!(manager.devices().unwrap(), devices);
    }

    #[test]
    fn test_ids_are_stable_across_enumerations() {
        let (_backend, manager) = setup();
        let first = manager.enumerate().unwrap();
        let second = manager.enumerate().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_get_device_unknown() {
        let (_backend, manager) = setup();
        manager.enumerate().unwrap();
        let err = manager.get_device("missing").unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(ref id) if id == "missing"));
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_enumerate_failure_clears_cache() {
        let (backend, manager) = setup();
        manager.enumerate().unwrap();
        backend.fail_list(Some("udev unavailable"));
        assert!(matches!(manager.enumerate(), Err(CameraError::EnumFailed(_))));
        assert!(manager.devices().unwrap().is_empty());
    }

    #[test]
    fn test_with_config_rejects_invalid() {
        let mut config = fast_config();
        config.capture.frame_retries = 0;
        let result = CameraManager::with_config(Arc::new(SyntheticBackend::new()), config);
        assert!(matches!(result, Err(CameraError::Config(_))));
    }

    #[test]
    fn test_open_auto_selects_default() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        assert_eq!(manager.state(), SessionState::Closed);

        manager.open(&id, DeviceConfig::AUTO).unwrap();
        assert_eq!(manager.state(), SessionState::Open);
        assert!(manager.is_open());

        let (device, negotiated) = manager.get_current_config().unwrap();
        assert_eq!(device.id, id);
        assert_eq!(negotiated, DeviceConfig::mjpeg(1280, 720, 60));
        assert_eq!(
            backend.last_open(),
            Some(("/dev/synthetic0".to_string(), DeviceConfig::mjpeg(1280, 720, 60)))
        );
        manager.close();
    }

    #[test]
    fn test_open_selects_closest_larger() {
        let (_backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::mjpeg(800, 600, 25)).unwrap();
        let (_, negotiated) = manager.get_current_config().unwrap();
        assert_eq!(negotiated, DeviceConfig::mjpeg(1280, 720, 60));
        manager.close();
    }

    #[test]
    fn test_open_enumerates_when_cache_empty() {
        let (backend, manager) = setup();
        let id = Device::derive_id("usb-0000:00:14.0-1", "Synthetic Webcam");
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();
        assert_eq!(backend.list_calls(), 1);
        manager.close();
    }

    #[test]
    fn test_open_unknown_device() {
        let (backend, manager) = setup();
        manager.enumerate().unwrap();
        let err = manager.open("missing", DeviceConfig::AUTO).unwrap_err();
        assert!(matches!(err, CameraError::DeviceNotFound(_)));
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.opens(), 0);
    }

    #[test]
    fn test_open_config_not_found() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        let err = manager
            .open(&id, DeviceConfig::new(1280, 720, 30, FourCc::NV12))
            .unwrap_err();
        assert!(matches!(err, CameraError::ConfigNotFound(_)));
        assert_eq!(backend.opens(), 0);
    }

    #[test]
    fn test_open_failure_unwinds() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        backend.fail_open(Some("device busy"));
        let err = manager.open(&id, DeviceConfig::AUTO).unwrap_err();
        assert!(matches!(err, CameraError::BackendOpenFailed { ref path, .. } if path == "/dev/synthetic0"));
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.live_handles(), 0);
        assert!(matches!(manager.get_current_config(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_first_frame_timeout_unwinds() {
        let mut config = fast_config();
        config.capture.open_attempts = 3;
        config.capture.open_attempt_timeout_ms = 40;
        let (backend, manager) = setup_with(config);
        let id = first_id(&manager);
        backend.set_mode(SyntheticMode::AlwaysTimeout);

        let err = manager.open(&id, DeviceConfig::AUTO).unwrap_err();
        assert!(matches!(err, CameraError::FirstFrameTimeout { attempts: 3, .. }));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.opens(), 1);
        assert_eq!(backend.live_handles(), 0);
        assert!(matches!(manager.get_frame(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_open_survives_slow_startup() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        backend.set_startup_delay(Duration::from_millis(250));
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        assert!(manager.is_open());
        manager.close();
    }

    #[test]
    fn test_negotiated_resolution_is_confirmed() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        backend.set_actual_size(Some((320, 240)));
        manager.open(&id, DeviceConfig::mjpeg(1280, 720, 30)).unwrap();

        let (_, negotiated) = manager.get_current_config().unwrap();
        assert_eq!(negotiated, DeviceConfig::mjpeg(320, 240, 30));
        manager.close();
    }

    #[test]
    fn test_get_frame_returns_tagged_jpeg() {
        let (_backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();

        let first = manager.get_frame().unwrap();
        let second = manager.get_frame().unwrap();
        assert_eq!(&first[..2], &[0xFF, 0xD8]);
        assert!(frame_sequence(&second).unwrap() > frame_sequence(&first).unwrap());
        manager.close();
    }

    #[test]
    fn test_frames_are_fresh() {
        let (backend, manager) = setup();
        backend.set_frame_period(Duration::from_millis(2));
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();

        let first = frame_sequence(&manager.get_frame().unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let produced_before = backend.frames_produced();
        let next = frame_sequence(&manager.get_frame().unwrap()).unwrap();
        assert!(produced_before > first + 5, "producer should have run ahead");
        assert!(
            next >= produced_before,
            "got frame {} but {} had already been produced",
            next,
            produced_before
        );
        assert!(manager.frame_stats().unwrap().dropped > 0);
        manager.close();
    }

    #[test]
    fn test_retry_budget_is_exact() {
        let mut config = fast_config();
        config.capture.frame_retries = 8;
        config.capture.frame_attempt_timeout_ms = 250;
        config.capture.pump_wait_timeout_ms = 10;
        let (backend, manager) = setup_with(config);
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();

        backend.set_mode(SyntheticMode::AlwaysTimeout);
        // Let any frame already in flight be dropped.
        std::thread::sleep(Duration::from_millis(50));

        let before = manager.frame_stats().unwrap();
        let err = manager.get_frame().unwrap_err();
        std::thread::sleep(Duration::from_millis(20));
        let after = manager.frame_stats().unwrap();

        assert!(err.is_timeout());
        assert_eq!(after.delivered - before.delivered, 8);
        assert!(after.errors > before.errors);
        manager.close();
    }

    #[test]
    fn test_backend_failure_surfaces() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();

        backend.set_mode(SyntheticMode::Fail);
        std::thread::sleep(Duration::from_millis(30));
        let err = manager.get_frame().unwrap_err();
        assert!(matches!(err, CameraError::Backend { code: Some(-19), .. }));
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        manager.close();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_open_replaces_open() {
        let (backend, manager) = setup();
        backend.add_device(second_device());
        let devices = manager.enumerate().unwrap();
        let ids: Vec<String> = devices.iter().map(|d| d.id.clone()).collect();
        assert_eq!(ids.len(), 2);

        manager.open(&ids[0], DeviceConfig::AUTO).unwrap();
        manager.open(&ids[1], DeviceConfig::AUTO).unwrap();
        assert_eq!(backend.opens(), 2);
        assert_eq!(backend.closes(), 1);
        assert_eq!(backend.live_handles(), 1);

        let (device, negotiated) = manager.get_current_config().unwrap();
        assert_eq!(device.name, "Second Webcam");
        assert_eq!(negotiated, DeviceConfig::mjpeg(1280, 720, 30));

        manager.close();
        assert_eq!(backend.closes(), 2);
        assert_eq!(backend.live_handles(), 0);
    }

    /// Manager whose pump join gives up long before a stalled wait returns.
    fn stalling_setup() -> (SyntheticBackend, CameraManager, String) {
        let mut config = fast_config();
        config.capture.pump_join_timeout_ms = 100;
        let (backend, manager) = setup_with(config);
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();

        // Park the pump inside one long hardware wait, then let later
        // handles stream normally again.
        backend.set_mode(SyntheticMode::Stall(Duration::from_millis(600)));
        std::thread::sleep(Duration::from_millis(60));
        backend.set_mode(SyntheticMode::Frames);
        (backend, manager, id)
    }

    fn wait_for_release(backend: &SyntheticBackend) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while backend.live_handles() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_stalled_replacement_never_doubles_handles() {
        let (backend, manager, id) = stalling_setup();

        let done = Arc::new(AtomicBool::new(false));
        let peak = Arc::new(AtomicUsize::new(0));
        let monitor = {
            let (backend, done, peak) = (backend.clone(), done.clone(), peak.clone());
            std::thread::spawn(move || {
                while !done.load(Ordering::SeqCst) {
                    peak.fetch_max(backend.live_handles(), Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        let err = manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap_err();
        assert!(matches!(err, CameraError::BackendOpenFailed { .. }));
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.opens(), 1);
        assert!(matches!(manager.get_frame(), Err(CameraError::NotOpen)));

        // Still held: the retry fails again without reaching the backend.
        assert!(manager.open(&id, DeviceConfig::AUTO).is_err());
        assert_eq!(backend.opens(), 1);

        wait_for_release(&backend);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        assert_eq!(backend.opens(), 2);
        assert_eq!(backend.closes(), 1);
        manager.get_frame().unwrap();

        done.store(true, Ordering::SeqCst);
        monitor.join().unwrap();
        assert!(peak.load(Ordering::SeqCst) <= 1);

        manager.close();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_close_with_stalled_pump_defers_next_open() {
        let (backend, manager, id) = stalling_setup();

        let start = Instant::now();
        manager.close();
        assert!(start.elapsed() < Duration::from_millis(400));
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.live_handles(), 1);

        let err = manager.open(&id, DeviceConfig::AUTO).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BackendFailure);
        assert_eq!(backend.opens(), 1);

        wait_for_release(&backend);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        assert_eq!(backend.live_handles(), 1);
        manager.shutdown();
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_state_is_opening_during_replacement() {
        let backend = SyntheticBackend::with_default_device();
        let manager = Arc::new(CameraManager::with_config(Arc::new(backend.clone()), fast_config()).unwrap());
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        assert_eq!(manager.state(), SessionState::Open);

        backend.set_startup_delay(Duration::from_millis(250));
        let opener = {
            let manager = manager.clone();
            let id = id.clone();
            std::thread::spawn(move || manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)))
        };
        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(manager.state(), SessionState::Opening);

        opener.join().unwrap().unwrap();
        assert_eq!(manager.state(), SessionState::Open);
        manager.close();
        assert_eq!(manager.state(), SessionState::Closed);
    }

    #[test]
    fn test_failed_replacement_leaves_nothing_open() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();

        backend.fail_open(Some("device busy"));
        assert!(manager.open(&id, DeviceConfig::AUTO).is_err());
        assert_eq!(manager.state(), SessionState::Closed);
        assert_eq!(backend.live_handles(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (backend, manager) = setup();
        let start = Instant::now();
        manager.close();
        manager.close();
        assert!(start.elapsed() < Duration::from_millis(50));

        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        manager.close();
        manager.close();
        assert_eq!(backend.closes(), 1);
        assert_eq!(manager.state(), SessionState::Closed);
        assert!(matches!(manager.get_frame(), Err(CameraError::NotOpen)));
        assert!(matches!(manager.frame_stats(), Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_close_unblocks_waiting_reader() {
        let mut config = fast_config();
        config.capture.frame_retries = 1000;
        let backend = SyntheticBackend::with_default_device();
        let manager = Arc::new(CameraManager::with_config(Arc::new(backend.clone()), config).unwrap());
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        backend.set_mode(SyntheticMode::AlwaysTimeout);

        let reader = {
            let manager = manager.clone();
            std::thread::spawn(move || manager.get_frame())
        };
        std::thread::sleep(Duration::from_millis(50));
        manager.close();

        let result = reader.join().unwrap();
        assert!(matches!(result, Err(CameraError::NotOpen)));
    }

    #[test]
    fn test_concurrent_open_fails_fast() {
        let backend = SyntheticBackend::with_default_device();
        let manager = Arc::new(CameraManager::with_config(Arc::new(backend.clone()), fast_config()).unwrap());
        let id = first_id(&manager);
        backend.set_startup_delay(Duration::from_millis(400));

        let opener = {
            let manager = manager.clone();
            let id = id.clone();
            std::thread::spawn(move || manager.open(&id, DeviceConfig::AUTO))
        };
        std::thread::sleep(Duration::from_millis(100));

        let start = Instant::now();
        let err = manager.open(&id, DeviceConfig::AUTO).unwrap_err();
        assert!(matches!(err, CameraError::AlreadyOpen));
        assert!(start.elapsed() < Duration::from_millis(100));

        opener.join().unwrap().unwrap();
        assert!(manager.is_open());
        assert_eq!(backend.opens(), 1);
        manager.close();
    }

    #[test]
    fn test_shutdown() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();

        manager.shutdown();
        assert_eq!(backend.shutdowns(), 1);
        assert_eq!(backend.live_handles(), 0);
        assert!(manager.is_shut_down());

        assert!(matches!(manager.enumerate(), Err(CameraError::ShutDown)));
        assert!(matches!(manager.open(&id, DeviceConfig::AUTO), Err(CameraError::ShutDown)));
        assert!(matches!(manager.get_frame(), Err(CameraError::ShutDown)));
        assert!(matches!(manager.get_device(&id), Err(CameraError::ShutDown)));
        manager.close();
        manager.shutdown();
        drop(manager);
        assert_eq!(backend.shutdowns(), 1);
    }

    #[test]
    fn test_drop_releases_device() {
        let (backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        drop(manager);
        assert_eq!(backend.live_handles(), 0);
        assert_eq!(backend.shutdowns(), 1);
    }

    #[test]
    fn test_frame_stats_count_deliveries() {
        let (_backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        manager.get_frame().unwrap();
        manager.get_frame().unwrap();
        std::thread::sleep(Duration::from_millis(10));
        // The first-frame check consumed one frame too.
        assert!(manager.frame_stats().unwrap().delivered >= 3);
        manager.close();
    }

    #[test]
    fn test_sessions_are_per_manager() {
        let backend = SyntheticBackend::new();
        backend.add_device(default_device());
        let a = CameraManager::with_config(Arc::new(backend.clone()), fast_config()).unwrap();
        let b = CameraManager::with_config(Arc::new(backend.clone()), fast_config()).unwrap();
        let id = first_id(&a);
        b.enumerate().unwrap();
        a.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();
        assert!(matches!(b.get_frame(), Err(CameraError::NotOpen)));
        a.close();
    }

    #[test]
    fn contract_open() {
        clear_invariant_log();
        let (_backend, manager) = setup();
        let id = first_id(&manager);
        manager.open(&id, DeviceConfig::AUTO).unwrap();
        manager.open(&id, DeviceConfig::mjpeg(640, 480, 30)).unwrap();
        contract_test(
            "open",
            &[
                Invariant::NegotiatedConfigValid,
                Invariant::SingleLiveHandle,
                Invariant::SelectionIsCandidate,
            ],
        );
        assert_eq!(check_count(Invariant::SingleLiveHandle), 2);
        manager.close();
    }
}
