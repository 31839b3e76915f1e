//! Argus multi-camera recorder, driven from a line console on stdin

use std::path::PathBuf;
use std::sync::Arc;

use argus::capture::{CameraDriver, PixelFormat};
use argus::recording::{RecordingEvent, RecordingMethod};
use argus::{Config, Controller};
use color_eyre::{eyre::eyre, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const HELP: &str = "\
commands:
  record <camera> [raw|video]     start recording a camera
  stop <camera>                   stop recording a camera
  configure <format> <fps> <exposure_us>
  formats <camera>                list pixel formats
  dir [path]                      show or set the output directory
  status                          camera and recording state
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("argus=debug")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Argus launching...");

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref())?;
    info!("Configuration: {:?}", config);

    let driver = driver(&config);
    let controller = Arc::new(Controller::start(&config, driver.as_ref())?);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(RecordingEvent::Started { camera, target, .. }) => {
                    info!("[cam {}] REC on -> {}", camera, target.display())
                }
                Ok(RecordingEvent::Stopped(report)) => info!(
                    "[cam {}] REC off, {} frames in {:.1?}",
                    report.camera, report.frames, report.elapsed
                ),
                Ok(RecordingEvent::Failed { camera, error, .. }) => {
                    error!("[cam {}] REC failed: {}", camera, error)
                }
                Err(RecvError::Lagged(n)) => warn!("Missed {} recording events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let handled = tokio::task::block_in_place(|| execute(&controller, line.trim()));
                match handled {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => eprintln!("error: {e}"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    info!("Argus shutting down");
    tokio::task::block_in_place(|| controller.shutdown());
    Ok(())
}

#[cfg(feature = "v4l2")]
fn driver(config: &Config) -> Box<dyn CameraDriver> {
    Box::new(argus::capture::V4l2Driver::new(config.cameras.buffer_count))
}

#[cfg(not(feature = "v4l2"))]
fn driver(config: &Config) -> Box<dyn CameraDriver> {
    Box::new(argus::capture::EmulatedDriver::new(
        config.cameras.count,
        config.cameras.width,
        config.cameras.height,
    ))
}

/// Runs one console command; false ends the session.
fn execute(controller: &Controller, line: &str) -> Result<bool> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Ok(true);
    };
    let args: Vec<&str> = words.collect();
    let camera = |i: usize| -> Result<usize> {
        args.get(i)
            .ok_or_else(|| eyre!("missing camera index"))?
            .parse()
            .map_err(|e| eyre!("bad camera index: {e}"))
    };

    match command {
        "record" | "r" => {
            let method = match args.get(1) {
                Some(m) => m.parse::<RecordingMethod>()?,
                None => RecordingMethod::RawArchive,
            };
            let target = controller.start_recording(camera(0)?, method)?;
            println!("recording to {}", target.display());
        }
        "stop" | "s" => match controller.stop_recording(camera(0)?)? {
            Some(report) => println!(
                "{} frames written to {}",
                report.frames,
                report.target.display()
            ),
            None => println!("camera was not recording"),
        },
        "configure" | "c" => {
            let [format, fps, exposure] = args.as_slice() else {
                return Err(eyre!("usage: configure <format> <fps> <exposure_us>"));
            };
            let rate = controller.configure_cameras(
                format.parse::<PixelFormat>()?,
                fps.parse()?,
                exposure.parse()?,
            )?;
            println!("resulting frame rate {rate:.2} fps");
        }
        "formats" | "f" => {
            println!("{}", controller.list_available_pixel_formats(camera(0)?)?.join(" "));
        }
        "dir" | "d" => {
            if let Some(path) = args.first() {
                controller.set_output_directory(*path)?;
            }
            println!("{}", controller.output_directory().display());
        }
        "status" => {
            for i in 0..controller.camera_count() {
                let status = controller.camera_status(i)?;
                let latest = controller
                    .preview_frame(i)?
                    .map(|f| f.sequence().to_string())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "cam {} {:<12} {}x{} {} {:.2} fps {:?} frames {} dropped {} latest {} {}",
                    i,
                    status.device,
                    status.geometry.width,
                    status.geometry.height,
                    status.params.pixel_format,
                    status.resulting_frame_rate,
                    status.health,
                    status.frames_delivered,
                    status.frames_dropped,
                    latest,
                    if controller.is_recording(i)? { "REC" } else { "" },
                );
            }
        }
        "help" | "?" => println!("{HELP}"),
        "quit" | "q" | "exit" => return Ok(false),
        other => return Err(eyre!("unknown command {other:?}, try help")),
    }
    Ok(true)
}
