use anyhow::{anyhow, bail, Context, Result};
use becam::{BecamConfig, CameraManager, DeviceConfig};
use std::env;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const USAGE: &str = "Usage: becam-cli <command> [args]

Commands:
  list-devices [--json]
  list-configs <device_id> [--json]
  capture <device_id> [WxH@FPS[:FOURCC]] [--frames N] [--out DIR]
  stream <device_id> [WxH@FPS[:FOURCC]]";

type Command = fn(&CameraManager, &[String]) -> Result<()>;

fn main() -> Result<()> {
    becam::init_logging();

    let args: Vec<String> = env::args().collect();
    if args.len() < 2 {
        eprintln!("{}", USAGE);
        std::process::exit(1);
    }

    // Resolve the command before any device is touched.
    let command: Command = match args[1].as_str() {
        "list-devices" => cmd_list_devices,
        "list-configs" => cmd_list_configs,
        "capture" => cmd_capture,
        "stream" => cmd_stream,
        other => {
            eprintln!("Unknown command: {}\n\n{}", other, USAGE);
            std::process::exit(1);
        }
    };

    let manager = open_manager()?;
    command(&manager, &args)
}

fn open_manager() -> Result<CameraManager> {
    let backend = becam::platform::native_backend().context(
        "no capture backend available; rebuild with `--features v4l2` (Linux) or `--features native`",
    )?;
    let config = BecamConfig::load_or_default();
    Ok(CameraManager::with_config(backend, config)?)
}

fn cmd_list_devices(manager: &CameraManager, args: &[String]) -> Result<()> {
    let devices = manager.enumerate()?;
    if args.iter().any(|a| a == "--json") {
        println!("{}", serde_json::to_string(&devices)?);
    } else if devices.is_empty() {
        println!("No cameras found");
    } else {
        for d in &devices {
            println!("{}: {} ({})", d.id, d.name, d.symbolic_path);
        }
    }
    Ok(())
}

fn cmd_list_configs(manager: &CameraManager, args: &[String]) -> Result<()> {
    let device_id = args
        .get(2)
        .ok_or_else(|| anyhow!("Usage: becam-cli list-configs <device_id> [--json]"))?;
    manager.enumerate()?;
    let configs = manager.device_configs(device_id)?;
    if args.iter().any(|a| a == "--json") {
        println!("{}", serde_json::to_string(&configs)?);
    } else {
        for c in &configs {
            println!("{}", c);
        }
    }
    Ok(())
}

struct SessionArgs {
    device_id: String,
    config: DeviceConfig,
    frames: usize,
    out: PathBuf,
}

fn parse_session_args(args: &[String]) -> Result<SessionArgs> {
    let mut device_id = None;
    let mut config = None;
    let mut frames = 1;
    let mut out = PathBuf::from(".");

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--frames" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| anyhow!("--frames needs a value"))?;
                frames = value.parse().context("--frames must be a number")?;
            }
            "--out" => {
                i += 1;
                let value = args.get(i).ok_or_else(|| anyhow!("--out needs a value"))?;
                out = PathBuf::from(value);
            }
            other => {
                if device_id.is_none() {
                    device_id = Some(other.to_string());
                } else if config.is_none() {
                    config = Some(other.parse::<DeviceConfig>()?);
                } else {
                    bail!("unexpected argument: {}", other);
                }
            }
        }
        i += 1;
    }

    Ok(SessionArgs {
        device_id: device_id.ok_or_else(|| anyhow!("device_id required"))?,
        config: config.unwrap_or(DeviceConfig::AUTO),
        frames,
        out,
    })
}

fn cmd_capture(manager: &CameraManager, args: &[String]) -> Result<()> {
    let session = parse_session_args(args)?;
    std::fs::create_dir_all(&session.out)
        .with_context(|| format!("failed to create {}", session.out.display()))?;

    manager.open(&session.device_id, session.config)?;
    let (device, negotiated) = manager.get_current_config()?;
    println!("Capturing from {} at {}", device.name, negotiated);

    for n in 0..session.frames {
        let frame = manager.get_frame()?;
        let path = session.out.join(format!("frame-{:04}.jpg", n));
        std::fs::write(&path, &frame)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("{} ({} bytes)", path.display(), frame.len());
    }

    manager.close();
    Ok(())
}

fn cmd_stream(manager: &CameraManager, args: &[String]) -> Result<()> {
    let session = parse_session_args(args)?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    manager.open(&session.device_id, session.config)?;
    let (device, negotiated) = manager.get_current_config()?;
    println!("Streaming from {} at {} (Ctrl-C to stop)", device.name, negotiated);

    let mut window_start = Instant::now();
    let mut window_frames = 0u32;
    let mut total = 0u64;
    while running.load(Ordering::SeqCst) {
        match manager.get_frame() {
            Ok(_) => {
                window_frames += 1;
                total += 1;
            }
            Err(e) if e.is_timeout() => log::warn!("Frame timeout"),
            Err(e) => {
                manager.close();
                return Err(e.into());
            }
        }

        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_secs(1) {
            let stats = manager.frame_stats()?;
            println!(
                "{:.1} fps (delivered {}, dropped {}, errors {})",
                window_frames as f64 / elapsed.as_secs_f64(),
                stats.delivered,
                stats.dropped,
                stats.errors
            );
            window_start = Instant::now();
            window_frames = 0;
        }
    }

    manager.close();
    println!("Received {} frames", total);
    Ok(())
}
