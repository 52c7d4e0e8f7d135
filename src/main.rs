// =============================================================================
// SHARED TEXTURE DEMO
// =============================================================================
//
// A producer device animates the blue channel of a shared texture; a
// consumer device imports it and shows (or samples) it every frame, both
// sides taking turns through the texture's keyed mutex.
//
// BACKENDS:
// - d3d11_vulkan: D3D11 producer, Vulkan consumer in a window (Windows only)
// - simulated:    software devices, headless, runs anywhere
// - auto:         d3d11_vulkan on Windows, simulated elsewhere
//
// =============================================================================

use anyhow::Result;
use shared_texture::config::{BackendKind, Config};
use shared_texture::sim::SimSession;
use shared_texture::InteropError;
use std::fs::File;
use std::io::Write;
use std::process::ExitCode;

/// Frame count for a headless run configured as "until closed"
const DEFAULT_SIM_FRAMES: u64 = 10_000;

fn main() -> ExitCode {
    let config = match std::env::args().nth(1) {
        Some(path) => match Config::load_from_path(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("{:#}", e);
                return ExitCode::FAILURE;
            }
        },
        None => Config::load(),
    };

    init_logging(&config);
    log::info!("Starting shared texture demo");
    log::info!(
        "Texture: {}x{} {:?}, protocol {:?}, mode {:?}, timeout {}ms",
        config.texture.width,
        config.texture.height,
        config.texture.format,
        config.sync.protocol,
        config.sync.mode,
        config.sync.timeout_ms
    );

    match run(&config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<InteropError>() {
                Some(interop) => log::error!("Fatal error during {}: {:#}", interop.stage(), err),
                None => log::error!("Fatal error: {:#}", err),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(config: &Config) -> Result<()> {
    match resolve_backend(config.run.backend)? {
        BackendKind::Simulated => run_simulated(config),
        _ => run_windowed(config),
    }
}

fn resolve_backend(requested: BackendKind) -> Result<BackendKind> {
    match requested {
        BackendKind::Auto if cfg!(windows) => Ok(BackendKind::D3d11Vulkan),
        BackendKind::Auto => Ok(BackendKind::Simulated),
        BackendKind::D3d11Vulkan if !cfg!(windows) => {
            anyhow::bail!("the d3d11_vulkan backend needs Windows; use backend = \"simulated\"")
        }
        other => Ok(other),
    }
}

fn run_simulated(config: &Config) -> Result<()> {
    let max_frames = match config.run.max_frames {
        0 => {
            log::info!(
                "Headless run without a frame limit, stopping after {} frames",
                DEFAULT_SIM_FRAMES
            );
            DEFAULT_SIM_FRAMES
        }
        n => n,
    };

    let mut session = SimSession::from_config(config, max_frames)?;
    let summary = session.run()?;
    log::info!("{}", summary);
    println!("{}", summary);
    Ok(())
}

#[cfg(windows)]
fn run_windowed(config: &Config) -> Result<()> {
    use shared_texture::app::App;
    use winit::event_loop::EventLoop;

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config.clone());
    event_loop.run_app(&mut app)?;

    if let Some(err) = app.take_fatal() {
        return Err(err);
    }
    log::info!("Presented {} frames", app.rendered());
    Ok(())
}

#[cfg(not(windows))]
fn run_windowed(_config: &Config) -> Result<()> {
    anyhow::bail!("windowed presentation is only available on Windows")
}

/// Initialize logging to stderr, or to the configured log file instead when enabled
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();

    if config.debug.log_to_file {
        match File::create(&config.debug.log_file) {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Shared Texture Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Could not open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}
