//! Emulated cameras producing a moving test pattern.
//!
//! Each started camera runs a producer thread that renders frames at the
//! resulting frame rate into a one-slot [`LatestFrameBuffer`].

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::capture::frame::{Geometry, PixelFormat};
use crate::capture::source::{AcquisitionParams, CameraDriver, CameraSource, DeviceRef, Grab, GrabError};
use crate::pipeline::ringbuf::LatestFrameBuffer;
use crate::{Error, Result};

const FRAME_RATE_RANGE: std::ops::RangeInclusive<f64> = 0.01..=1000.0;
const EXPOSURE_RANGE_US: std::ops::RangeInclusive<f64> = 10.0..=1_000_000.0;

/// Driver for a fixed number of emulated devices.
pub struct EmulatedDriver {
    count: usize,
    width: u32,
    height: u32,
    claimed: Arc<Mutex<HashSet<String>>>,
}

impl EmulatedDriver {
    pub fn new(count: usize, width: u32, height: u32) -> Self {
        Self {
            count,
            width,
            height,
            claimed: Arc::new(Mutex::new(HashSet::new())),
        }
    }
}

impl CameraDriver for EmulatedDriver {
    fn enumerate(&self) -> Result<Vec<DeviceRef>> {
        Ok((0..self.count)
            .map(|i| DeviceRef {
                path: format!("emu:{i}"),
                name: format!("Emulated camera {i}"),
            })
            .collect())
    }

    fn open(&self, device: &DeviceRef) -> Result<Box<dyn CameraSource>> {
        let known = device
            .path
            .strip_prefix("emu:")
            .and_then(|i| i.parse::<usize>().ok())
            .is_some_and(|i| i < self.count);
        if !known {
            return Err(Error::DeviceUnavailable {
                device: device.path.clone(),
                reason: "no such emulated device".into(),
            });
        }
        if !self.claimed.lock().insert(device.path.clone()) {
            return Err(Error::DeviceUnavailable {
                device: device.path.clone(),
                reason: "already claimed".into(),
            });
        }

        let resulting_frame_rate = resulting_rate(&AcquisitionParams::default());
        Ok(Box::new(EmulatedCamera {
            path: device.path.clone(),
            claimed: Arc::clone(&self.claimed),
            width: self.width,
            height: self.height,
            params: AcquisitionParams::default(),
            resulting_frame_rate,
            period: frame_period(resulting_frame_rate)?,
            buffer: Arc::new(LatestFrameBuffer::new(1)),
            image_number: Arc::new(AtomicU64::new(0)),
            producer: None,
        }))
    }
}

struct Producer {
    /// Dropping it wakes the producer out of its frame wait
    stop: flume::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct EmulatedCamera {
    path: String,
    claimed: Arc<Mutex<HashSet<String>>>,
    width: u32,
    height: u32,
    params: AcquisitionParams,
    resulting_frame_rate: f64,
    period: Duration,
    buffer: Arc<LatestFrameBuffer<Grab>>,
    image_number: Arc<AtomicU64>,
    producer: Option<Producer>,
}

fn resulting_rate(params: &AcquisitionParams) -> f64 {
    params.frame_rate.min(1_000_000.0 / params.exposure_us)
}

fn frame_period(rate: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(1.0 / rate)
        .map_err(|e| Error::invalid("frame rate", format!("{rate} fps has no frame period: {e}")))
}

impl CameraSource for EmulatedCamera {
    fn pixel_formats(&self) -> Vec<PixelFormat> {
        PixelFormat::ALL.to_vec()
    }

    fn configure(&mut self, params: &AcquisitionParams) -> Result<f64> {
        if self.producer.is_some() {
            return Err(Error::invalid("camera state", "cannot configure while acquiring"));
        }
        if !FRAME_RATE_RANGE.contains(&params.frame_rate) {
            return Err(Error::invalid(
                "frame rate",
                format!(
                    "{} fps is outside [{}, {}]",
                    params.frame_rate,
                    FRAME_RATE_RANGE.start(),
                    FRAME_RATE_RANGE.end()
                ),
            ));
        }
        if !EXPOSURE_RANGE_US.contains(&params.exposure_us) {
            return Err(Error::invalid(
                "exposure time",
                format!(
                    "{} us is outside [{}, {}]",
                    params.exposure_us,
                    EXPOSURE_RANGE_US.start(),
                    EXPOSURE_RANGE_US.end()
                ),
            ));
        }
        let rate = resulting_rate(params);
        self.period = frame_period(rate)?;
        self.params = *params;
        self.resulting_frame_rate = rate;
        Ok(rate)
    }

    fn geometry(&self) -> Geometry {
        Geometry {
            width: self.width,
            height: self.height,
            format: self.params.pixel_format,
        }
    }

    fn resulting_frame_rate(&self) -> f64 {
        self.resulting_frame_rate
    }

    fn start(&mut self) -> Result<()> {
        if self.producer.is_some() {
            return Ok(());
        }
        self.buffer.clear();
        let (stop, stopped) = flume::bounded::<()>(1);
        let geometry = self.geometry();
        let period = self.period;
        let buffer = Arc::clone(&self.buffer);
        let counter = Arc::clone(&self.image_number);

        let handle = thread::Builder::new()
            .name(format!("{}-producer", self.path))
            .spawn(move || {
                let epoch = Instant::now();
                let mut next = epoch;
                loop {
                    let image_number = counter.fetch_add(1, Ordering::Relaxed);
                    buffer.push(Grab {
                        data: render_pattern(&geometry, image_number),
                        width: geometry.width,
                        height: geometry.height,
                        format: geometry.format,
                        image_number,
                        device_timestamp: Some(epoch.elapsed()),
                    });
                    next += period;
                    let now = Instant::now();
                    if next < now {
                        // fell behind; resync instead of bursting
                        next = now;
                    }
                    match stopped.recv_deadline(next) {
                        Err(flume::RecvTimeoutError::Timeout) => {}
                        _ => break,
                    }
                }
            })?;

        debug!("{} producing at {:.2} fps", self.path, self.resulting_frame_rate);
        self.producer = Some(Producer { stop, handle });
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> std::result::Result<Grab, GrabError> {
        if self.producer.is_none() {
            return Err(GrabError::NotStarted);
        }
        self.buffer.pop_timeout(timeout).ok_or(GrabError::Timeout)
    }

    fn stop(&mut self) {
        if let Some(producer) = self.producer.take() {
            drop(producer.stop);
            if producer.handle.join().is_err() {
                warn!("{} producer thread panicked", self.path);
            }
        }
    }

    fn dropped_frames(&self) -> u64 {
        self.buffer.dropped()
    }
}

impl Drop for EmulatedCamera {
    fn drop(&mut self) {
        self.stop();
        self.claimed.lock().remove(&self.path);
    }
}

/// Diagonal gradient shifted by the image number.
fn render_pattern(geometry: &Geometry, image_number: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(geometry.frame_len());
    let shift = image_number as usize;
    for y in 0..geometry.height as usize {
        for x in 0..geometry.width as usize {
            let v = x + y + shift;
            match geometry.format {
                PixelFormat::Mono8 | PixelFormat::BayerRg8 => buf.extend_from_slice(&[v as u8]),
                PixelFormat::Mono12 => buf.extend_from_slice(&((v & 0x0fff) as u16).to_le_bytes()),
                PixelFormat::Mono16 => buf.extend_from_slice(&((v * 16) as u16).to_le_bytes()),
                PixelFormat::Rgb8 => {
                    buf.extend_from_slice(&[v as u8, (v + 85) as u8, (v + 170) as u8])
                }
            }
        }
    }
    buf.freeze()
}
