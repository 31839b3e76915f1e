//! Camera source abstraction: drivers, sources and the per-camera handle.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::capture::frame::{Frame, FrameMetadata, Geometry, PixelFormat};
use crate::{Error, Result};

/// Acquisition parameters applied to a camera.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionParams {
    pub pixel_format: PixelFormat,
    /// Target frame rate in frames per second
    pub frame_rate: f64,
    /// Exposure time in microseconds
    pub exposure_us: f64,
}

impl Default for AcquisitionParams {
    fn default() -> Self {
        Self {
            pixel_format: PixelFormat::Mono8,
            frame_rate: 40.0,
            exposure_us: 1000.0,
        }
    }
}

/// Reference to an enumerable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRef {
    /// Driver specific locator (`emu:0`, `/dev/video2`, ...)
    pub path: String,
    /// Human readable name
    pub name: String,
}

/// One grabbed buffer as the device delivered it.
pub struct Grab {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub image_number: u64,
    pub device_timestamp: Option<Duration>,
}

#[derive(Debug, Error)]
pub enum GrabError {
    #[error("no frame before timeout")]
    Timeout,
    #[error("acquisition not started")]
    NotStarted,
    #[error("{0}")]
    Fault(String),
}

/// Enumerates and claims camera devices.
pub trait CameraDriver {
    fn enumerate(&self) -> Result<Vec<DeviceRef>>;

    /// Claims a device, failing with [`Error::DeviceUnavailable`].
    fn open(&self, device: &DeviceRef) -> Result<Box<dyn CameraSource>>;
}

/// A claimed camera device.
///
/// Implementations buffer with a "latest frame only" strategy once started:
/// a consumer that falls behind sees the newest frame, older ones are dropped.
pub trait CameraSource: Send {
    /// Pixel formats the device offers, in device order.
    fn pixel_formats(&self) -> Vec<PixelFormat>;

    /// Applies parameters while stopped and returns the resulting frame rate.
    fn configure(&mut self, params: &AcquisitionParams) -> Result<f64>;

    fn geometry(&self) -> Geometry;

    fn resulting_frame_rate(&self) -> f64;

    fn start(&mut self) -> Result<()>;

    /// Blocks up to `timeout` for the next frame.
    fn grab(&mut self, timeout: Duration) -> std::result::Result<Grab, GrabError>;

    /// Stops acquisition; idempotent.
    fn stop(&mut self);

    /// Frames the latest-only buffer discarded so far.
    fn dropped_frames(&self) -> u64 {
        0
    }
}

/// Per-camera handle owned by the dispatcher.
pub struct CameraHandle {
    index: usize,
    device: DeviceRef,
    source: Box<dyn CameraSource>,
    params: AcquisitionParams,
    resulting_frame_rate: f64,
    acquiring: bool,
    open: bool,
    sequence: u64,
}

impl CameraHandle {
    /// Opens `device` and applies the initial parameters.
    pub fn open(
        index: usize,
        driver: &dyn CameraDriver,
        device: DeviceRef,
        params: AcquisitionParams,
    ) -> Result<Self> {
        info!("Opening camera {}: {} ({})", index, device.name, device.path);
        let mut source = driver.open(&device)?;
        let resulting_frame_rate = source.configure(&params)?;

        Ok(Self {
            index,
            device,
            source,
            params,
            resulting_frame_rate,
            acquiring: false,
            open: true,
            sequence: 0,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn device(&self) -> &DeviceRef {
        &self.device
    }

    pub fn params(&self) -> AcquisitionParams {
        self.params
    }

    pub fn geometry(&self) -> Geometry {
        self.source.geometry()
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn is_acquiring(&self) -> bool {
        self.acquiring
    }

    pub fn resulting_frame_rate(&self) -> f64 {
        self.resulting_frame_rate
    }

    pub fn pixel_formats(&self) -> Vec<PixelFormat> {
        self.source.pixel_formats()
    }

    pub fn dropped_frames(&self) -> u64 {
        self.source.dropped_frames()
    }

    /// Applies new parameters, restarting acquisition if it was running.
    pub fn configure(&mut self, params: AcquisitionParams) -> Result<f64> {
        self.ensure_open()?;
        let was_acquiring = self.acquiring;
        if was_acquiring {
            self.source.stop();
            self.acquiring = false;
        }

        let applied = self.source.configure(&params);
        if let Ok(rate) = applied {
            self.params = params;
            self.resulting_frame_rate = rate;
            info!(
                "Camera {} configured: {} @ {} fps (resulting {:.2}), exposure {} us",
                self.index, params.pixel_format, params.frame_rate, rate, params.exposure_us
            );
        }

        if was_acquiring {
            self.start_acquisition()?;
        }
        applied
    }

    pub fn start_acquisition(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.acquiring {
            self.source.start()?;
            self.acquiring = true;
            debug!("Camera {} acquisition started", self.index);
        }
        Ok(())
    }

    /// Retrieves the next frame and stamps it with this camera's sequence number.
    #[instrument(skip(self), fields(camera = self.index))]
    pub fn retrieve_frame(&mut self, timeout: Duration) -> Result<Frame> {
        self.ensure_open()?;
        let grab = self.source.grab(timeout).map_err(|e| match e {
            GrabError::Timeout => Error::AcquisitionTimeout {
                camera: self.index,
                timeout,
            },
            other => Error::AcquisitionError {
                camera: self.index,
                reason: other.to_string(),
            },
        })?;

        let meta = Arc::new(FrameMetadata {
            camera: self.index,
            sequence: self.sequence,
            image_number: grab.image_number,
            width: grab.width,
            height: grab.height,
            format: grab.format,
            device_timestamp: grab.device_timestamp,
        });
        self.sequence += 1;

        Ok(Frame {
            data: grab.data,
            meta,
            timestamp: Instant::now(),
        })
    }

    /// Stops acquisition and releases the device; idempotent.
    pub fn close(&mut self) {
        if !self.open {
            return;
        }
        self.source.stop();
        self.acquiring = false;
        self.open = false;
        info!("Camera {} closed", self.index);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::DeviceUnavailable {
                device: self.device.path.clone(),
                reason: "camera is closed".into(),
            })
        }
    }
}

impl Drop for CameraHandle {
    fn drop(&mut self) {
        self.close();
    }
}
