//! Control surface: the command interface the UI layer drives.

use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{info, instrument, warn};

use crate::capture::{AcquisitionParams, CameraDriver, CameraHandle, Frame, PixelFormat};
use crate::pipeline::{CameraStatus, DispatcherHandle, PreviewBoard};
use crate::recording::{RecordingEvent, RecordingMethod, SessionManager, SessionReport};
use crate::sink::{SinkFactory, StandardSinks};
use crate::{utils, Config, Error, Result};

const EVENT_CAPACITY: usize = 64;

/// Owns the cameras, the acquisition loop and the per-camera sessions.
///
/// Every method takes `&self` and may be called from any thread while the
/// dispatcher is mid-tick.
pub struct Controller {
    dispatcher: DispatcherHandle,
    sessions: Arc<[SessionManager]>,
    preview: Arc<PreviewBoard>,
    output_dir: ArcSwap<PathBuf>,
    events: broadcast::Sender<RecordingEvent>,
    /// Held exclusively while reconfiguring so no session starts meanwhile
    reconfigure: RwLock<()>,
}

impl Controller {
    /// Opens `cameras.count` devices from `driver` with the standard sinks.
    pub fn start(config: &Config, driver: &dyn CameraDriver) -> Result<Self> {
        let encoder = &config.recording.encoder;
        let program = match utils::resolve_encoder(&encoder.program, &encoder.prefix_args) {
            Err(e) if encoder.required => return Err(e),
            Err(e) => {
                warn!("{}; encoded video recording is unavailable", e);
                Err(e)
            }
            ok => ok,
        };

        let sinks = StandardSinks::new(program, encoder.options.clone(), encoder.playback_fps);
        Self::with_sinks(config, driver, Arc::new(sinks))
    }

    pub fn with_sinks(
        config: &Config,
        driver: &dyn CameraDriver,
        sinks: Arc<dyn SinkFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let count = config.cameras.count;
        let devices = driver.enumerate()?;
        if devices.len() < count {
            return Err(Error::DeviceUnavailable {
                device: format!("{count} cameras"),
                reason: format!("only {} found", devices.len()),
            });
        }

        let cameras = devices
            .into_iter()
            .take(count)
            .enumerate()
            .map(|(i, device)| CameraHandle::open(i, driver, device, config.cameras.acquisition))
            .collect::<Result<Vec<_>>>()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let sessions: Arc<[SessionManager]> = (0..count)
            .map(|i| SessionManager::spawn(i, sinks.clone(), events.clone()))
            .collect::<Result<Vec<_>>>()?
            .into();
        let preview = Arc::new(PreviewBoard::new(count));

        let dispatcher = DispatcherHandle::spawn(
            cameras,
            sessions.clone(),
            preview.clone(),
            config.pipeline.clone(),
        )?;

        info!(
            "Controller ready: {} cameras, output to {}",
            count,
            config.recording.output_dir.display()
        );
        Ok(Self {
            dispatcher,
            sessions,
            preview,
            output_dir: ArcSwap::from_pointee(config.recording.output_dir.clone()),
            events,
            reconfigure: RwLock::new(()),
        })
    }

    pub fn camera_count(&self) -> usize {
        self.sessions.len()
    }

    /// Applies the parameters to every camera and returns the lowest
    /// resulting frame rate. Refused while any camera records.
    #[instrument(skip(self))]
    pub fn configure_cameras(
        &self,
        pixel_format: PixelFormat,
        frame_rate: f64,
        exposure_us: f64,
    ) -> Result<f64> {
        let _exclusive = self.reconfigure.write();
        if let Some(busy) = self.sessions.iter().find(|s| s.is_recording()) {
            return Err(Error::SessionAlreadyActive {
                camera: busy.camera(),
            });
        }

        let rate = self.dispatcher.configure(AcquisitionParams {
            pixel_format,
            frame_rate,
            exposure_us,
        })?;
        info!("Cameras configured, resulting frame rate {:.2} fps", rate);
        Ok(rate)
    }

    /// Takes effect at the next session start.
    pub fn set_output_directory(&self, dir: impl Into<PathBuf>) -> Result<()> {
        let dir = dir.into();
        utils::check_output_dir(&dir)?;
        info!("Output directory set to {}", dir.display());
        self.output_dir.store(Arc::new(dir));
        Ok(())
    }

    pub fn output_directory(&self) -> PathBuf {
        self.output_dir.load().as_ref().clone()
    }

    /// Starts recording camera `camera`; returns the file being written.
    pub fn start_recording(&self, camera: usize, method: RecordingMethod) -> Result<PathBuf> {
        let _shared = self.reconfigure.read();
        let session = self.session(camera)?;
        let status = self.camera_status(camera)?;

        session.start(
            method,
            self.output_directory(),
            status.geometry,
            status.resulting_frame_rate,
        )
    }

    /// Stops recording camera `camera`; `None` if it was idle.
    pub fn stop_recording(&self, camera: usize) -> Result<Option<SessionReport>> {
        self.session(camera)?.stop()
    }

    pub fn is_recording(&self, camera: usize) -> Result<bool> {
        Ok(self.session(camera)?.is_recording())
    }

    pub fn list_available_pixel_formats(&self, camera: usize) -> Result<Vec<String>> {
        Ok(self
            .camera_status(camera)?
            .pixel_formats
            .iter()
            .map(|f| f.name().to_string())
            .collect())
    }

    /// Most recent frame retrieved from `camera`, if any yet.
    pub fn preview_frame(&self, camera: usize) -> Result<Option<Arc<Frame>>> {
        self.session(camera)?;
        Ok(self.preview.latest(camera))
    }

    pub fn camera_status(&self, camera: usize) -> Result<Arc<CameraStatus>> {
        self.dispatcher
            .status(camera)
            .ok_or(Error::UnknownCamera(camera))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordingEvent> {
        self.events.subscribe()
    }

    /// Stops acquisition, then finalizes every open session; idempotent.
    pub fn shutdown(&self) {
        self.dispatcher.shutdown();
        for session in self.sessions.iter() {
            session.shutdown();
        }
    }

    fn session(&self, camera: usize) -> Result<&SessionManager> {
        self.sessions.get(camera).ok_or(Error::UnknownCamera(camera))
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}
