//! V4L2 cameras with memory-mapped streaming

use std::path::Path;
use std::time::Duration;

use bytes::Bytes;
use tracing::{info, instrument, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapFlags;
use v4l::control::{Control, Value};
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{Device, FourCC};

use crate::capture::frame::{Geometry, PixelFormat};
use crate::capture::source::{AcquisitionParams, CameraDriver, CameraSource, DeviceRef, Grab, GrabError};
use crate::{Error, Result};

/// V4L2_CID_EXPOSURE_ABSOLUTE, in units of 100 us
const CID_EXPOSURE_ABSOLUTE: u32 = 0x009a_0902;

fn fourcc_of(format: PixelFormat) -> FourCC {
    match format {
        PixelFormat::Mono8 => FourCC::new(b"GREY"),
        PixelFormat::Mono12 => FourCC::new(b"Y12 "),
        PixelFormat::Mono16 => FourCC::new(b"Y16 "),
        PixelFormat::BayerRg8 => FourCC::new(b"RGGB"),
        PixelFormat::Rgb8 => FourCC::new(b"RGB3"),
    }
}

fn format_of(fourcc: FourCC) -> Option<PixelFormat> {
    PixelFormat::ALL.into_iter().find(|f| fourcc_of(*f) == fourcc)
}

fn unavailable(path: &str, reason: impl ToString) -> Error {
    Error::DeviceUnavailable {
        device: path.to_string(),
        reason: reason.to_string(),
    }
}

/// Enumerates `/dev/video*` capture nodes.
pub struct V4l2Driver {
    buffer_count: u32,
}

impl V4l2Driver {
    pub fn new(buffer_count: u32) -> Self {
        Self { buffer_count }
    }
}

impl CameraDriver for V4l2Driver {
    fn enumerate(&self) -> Result<Vec<DeviceRef>> {
        let mut found = Vec::new();
        for i in 0..64 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
                info!("Found capture device: {} - {}", path, caps.card);
                found.push(DeviceRef {
                    path,
                    name: caps.card,
                });
            }
        }
        Ok(found)
    }

    fn open(&self, device: &DeviceRef) -> Result<Box<dyn CameraSource>> {
        Ok(Box::new(V4l2Camera::open(&device.path, self.buffer_count)?))
    }
}

pub struct V4l2Camera {
    path: String,
    device: Box<Device>,
    stream: Option<MmapStream<'static>>,
    buffer_count: u32,
    geometry: Geometry,
    resulting_frame_rate: f64,
}

impl V4l2Camera {
    pub fn open(path: &str, buffer_count: u32) -> Result<Self> {
        let device = Device::with_path(path).map_err(|e| unavailable(path, e))?;

        let caps = device.query_caps().map_err(|e| unavailable(path, e))?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(unavailable(path, "device doesn't support video capture"));
        }

        let fmt = device.format().map_err(|e| unavailable(path, e))?;
        let geometry = Geometry {
            width: fmt.width,
            height: fmt.height,
            format: format_of(fmt.fourcc).unwrap_or(PixelFormat::Mono8),
        };

        Ok(Self {
            path: path.to_string(),
            device: Box::new(device),
            stream: None,
            // one buffer queued while one is being read keeps latency at a single frame
            buffer_count: buffer_count.max(2),
            geometry,
            resulting_frame_rate: 0.0,
        })
    }

    fn reject(&self, name: &'static str, err: std::io::Error) -> Error {
        Error::invalid(name, format!("{}: {err}", self.path))
    }
}

impl CameraSource for V4l2Camera {
    fn pixel_formats(&self) -> Vec<PixelFormat> {
        match self.device.enum_formats() {
            Ok(formats) => formats.into_iter().filter_map(|f| format_of(f.fourcc)).collect(),
            Err(e) => {
                warn!("{}: cannot enumerate formats: {}", self.path, e);
                Vec::new()
            }
        }
    }

    fn configure(&mut self, params: &AcquisitionParams) -> Result<f64> {
        if self.stream.is_some() {
            return Err(Error::invalid("camera state", "cannot configure while acquiring"));
        }

        let mut fmt = self.device.format().map_err(|e| self.reject("pixel format", e))?;
        fmt.fourcc = fourcc_of(params.pixel_format);
        let applied = self
            .device
            .set_format(&fmt)
            .map_err(|e| self.reject("pixel format", e))?;
        if applied.fourcc != fmt.fourcc {
            return Err(Error::invalid(
                "pixel format",
                format!("{} not supported by {}", params.pixel_format, self.path),
            ));
        }
        self.geometry = Geometry {
            width: applied.width,
            height: applied.height,
            format: params.pixel_format,
        };

        let fps = params.frame_rate.round().max(1.0) as u32;
        let applied = self
            .device
            .set_params(&Parameters::with_fps(fps))
            .map_err(|e| self.reject("frame rate", e))?;
        let interval = applied.interval;
        self.resulting_frame_rate = if interval.numerator == 0 {
            params.frame_rate
        } else {
            interval.denominator as f64 / interval.numerator as f64
        };

        let exposure = Control {
            id: CID_EXPOSURE_ABSOLUTE,
            value: Value::Integer((params.exposure_us / 100.0).round() as i64),
        };
        self.device
            .set_control(exposure)
            .map_err(|e| self.reject("exposure time", e))?;

        Ok(self.resulting_frame_rate)
    }

    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn resulting_frame_rate(&self) -> f64 {
        self.resulting_frame_rate
    }

    fn start(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        let stream = MmapStream::with_buffers(&self.device, Type::VideoCapture, self.buffer_count)
            .map_err(|e| unavailable(&self.path, e))?;
        self.stream = Some(stream);
        info!(
            "Capture stream started on {} with {} buffers",
            self.path, self.buffer_count
        );
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.path))]
    fn grab(&mut self, timeout: Duration) -> std::result::Result<Grab, GrabError> {
        let geometry = self.geometry;
        let stream = self.stream.as_mut().ok_or(GrabError::NotStarted)?;
        stream.set_timeout(timeout);

        let (buf, meta) = stream.next().map_err(|e| match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => GrabError::Timeout,
            _ => GrabError::Fault(e.to_string()),
        })?;

        let used = (meta.bytesused as usize).min(buf.len());
        Ok(Grab {
            data: Bytes::copy_from_slice(&buf[..used]),
            width: geometry.width,
            height: geometry.height,
            format: geometry.format,
            image_number: meta.sequence as u64,
            device_timestamp: Some(
                Duration::from_secs(meta.timestamp.sec as u64)
                    + Duration::from_micros(meta.timestamp.usec as u64),
            ),
        })
    }

    fn stop(&mut self) {
        if self.stream.take().is_some() {
            info!("Capture stream stopped on {}", self.path);
        }
    }
}
