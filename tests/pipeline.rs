//! Pipeline scenarios: scripted cameras feed the real dispatcher and session
//! managers, and recorded sinks record what reached them.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use argus::capture::{
    AcquisitionParams, CameraDriver, CameraSource, DeviceRef, EmulatedDriver, Geometry, Grab,
    GrabError, PixelFormat,
};
use argus::pipeline::Health;
use argus::recording::{RecordingEvent, RecordingMethod, SessionPlan};
use argus::sink::{EncoderOptions, EncoderProgram, FrameSink, SinkFactory, StandardSinks};
use argus::{Config, Controller, Error, Result};
use bytes::Bytes;
use parking_lot::Mutex;

const GEOMETRY: Geometry = Geometry {
    width: 4,
    height: 4,
    format: PixelFormat::Mono8,
};

enum Step {
    Frame,
    Fault(&'static str),
}

/// Cameras that deliver exactly what the test feeds them.
struct ScriptedDriver {
    sources: Mutex<Vec<Option<ScriptedCamera>>>,
}

struct ScriptedCamera {
    feed: flume::Receiver<Step>,
    max_rate: f64,
    rate: f64,
    image_number: u64,
    running: bool,
}

impl ScriptedDriver {
    /// One camera per entry of `max_rates`; returns the feed of each.
    fn new(max_rates: &[f64]) -> (Self, Vec<flume::Sender<Step>>) {
        let mut sources = Vec::new();
        let mut feeds = Vec::new();
        for &max_rate in max_rates {
            let (tx, feed) = flume::unbounded();
            sources.push(Some(ScriptedCamera {
                feed,
                max_rate,
                rate: 0.0,
                image_number: 0,
                running: false,
            }));
            feeds.push(tx);
        }
        let driver = Self {
            sources: Mutex::new(sources),
        };
        (driver, feeds)
    }
}

impl CameraDriver for ScriptedDriver {
    fn enumerate(&self) -> Result<Vec<DeviceRef>> {
        Ok((0..self.sources.lock().len())
            .map(|i| DeviceRef {
                path: format!("script:{i}"),
                name: format!("Scripted {i}"),
            })
            .collect())
    }

    fn open(&self, device: &DeviceRef) -> Result<Box<dyn CameraSource>> {
        let unavailable = || Error::DeviceUnavailable {
            device: device.path.clone(),
            reason: "no such scripted camera".into(),
        };
        let index: usize = device
            .path
            .trim_start_matches("script:")
            .parse()
            .map_err(|_| unavailable())?;
        let camera = self
            .sources
            .lock()
            .get_mut(index)
            .and_then(Option::take)
            .ok_or_else(unavailable)?;
        Ok(Box::new(camera))
    }
}

impl CameraSource for ScriptedCamera {
    fn pixel_formats(&self) -> Vec<PixelFormat> {
        vec![PixelFormat::Mono8, PixelFormat::Mono16]
    }

    fn configure(&mut self, params: &AcquisitionParams) -> Result<f64> {
        if params.frame_rate > self.max_rate {
            return Err(Error::InvalidParameter {
                name: "frame_rate",
                reason: format!("{} above {}", params.frame_rate, self.max_rate),
            });
        }
        self.rate = params.frame_rate;
        Ok(self.rate)
    }

    fn geometry(&self) -> Geometry {
        GEOMETRY
    }

    fn resulting_frame_rate(&self) -> f64 {
        self.rate
    }

    fn start(&mut self) -> Result<()> {
        self.running = true;
        Ok(())
    }

    fn grab(&mut self, timeout: Duration) -> std::result::Result<Grab, GrabError> {
        if !self.running {
            return Err(GrabError::NotStarted);
        }
        match self.feed.recv_timeout(timeout) {
            Ok(Step::Frame) => {
                let n = self.image_number;
                self.image_number += 1;
                Ok(Grab {
                    data: Bytes::from(vec![n as u8; GEOMETRY.frame_len()]),
                    width: GEOMETRY.width,
                    height: GEOMETRY.height,
                    format: GEOMETRY.format,
                    image_number: n,
                    device_timestamp: None,
                })
            }
            Ok(Step::Fault(reason)) => Err(GrabError::Fault(reason.into())),
            Err(flume::RecvTimeoutError::Timeout) => Err(GrabError::Timeout),
            Err(flume::RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                Err(GrabError::Timeout)
            }
        }
    }

    fn stop(&mut self) {
        self.running = false;
    }
}

/// Sequence numbers each camera's sinks received, per session.
#[derive(Default)]
struct Recorded {
    sessions: Mutex<Vec<(usize, u64, Arc<Mutex<Vec<u64>>>)>>,
}

struct RecordedSink {
    target: PathBuf,
    written: Arc<Mutex<Vec<u64>>>,
    closed: bool,
}

impl SinkFactory for Recorded {
    fn create(&self, plan: &SessionPlan) -> Result<Box<dyn FrameSink>> {
        let written = Arc::new(Mutex::new(Vec::new()));
        self.sessions
            .lock()
            .push((plan.camera, plan.session, written.clone()));
        Ok(Box::new(RecordedSink {
            target: plan.output_dir.join(&plan.base_name),
            written,
            closed: false,
        }))
    }
}

impl Recorded {
    fn written(&self, camera: usize) -> Vec<Vec<u64>> {
        self.sessions
            .lock()
            .iter()
            .filter(|(c, _, _)| *c == camera)
            .map(|(_, _, w)| w.lock().clone())
            .collect()
    }
}

impl FrameSink for RecordedSink {
    fn write_frame(&mut self, frame: &argus::capture::Frame) -> Result<()> {
        assert!(!self.closed, "write after close");
        self.written.lock().push(frame.sequence());
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written.lock().len() as u64
    }

    fn target(&self) -> &Path {
        &self.target
    }
}

fn config(cameras: usize, output_dir: &Path) -> Config {
    let mut config = Config::default();
    config.cameras.count = cameras;
    config.cameras.width = GEOMETRY.width;
    config.cameras.height = GEOMETRY.height;
    config.cameras.acquisition = AcquisitionParams {
        pixel_format: PixelFormat::Mono8,
        frame_rate: 30.0,
        exposure_us: 1000.0,
    };
    config.pipeline.retrieve_timeout_ms = 20;
    config.pipeline.degraded_timeout_ms = 5;
    config.recording.output_dir = output_dir.to_path_buf();
    config
}

fn no_encoder() -> StandardSinks {
    StandardSinks::new(
        Err(Error::DeviceUnavailable {
            device: "ffmpeg".into(),
            reason: "not installed".into(),
        }),
        EncoderOptions::default(),
        None,
    )
}

fn feed(tx: &flume::Sender<Step>, frames: usize) {
    for _ in 0..frames {
        tx.send(Step::Frame).unwrap();
    }
}

/// Waits until the dispatcher has handed `count` frames of `camera` onwards.
fn wait_delivered(controller: &Controller, camera: usize, count: u64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let delivered = controller.camera_status(camera).unwrap().frames_delivered;
        if delivered >= count {
            assert_eq!(delivered, count, "camera {camera} delivered too many frames");
            return;
        }
        assert!(Instant::now() < deadline, "camera {camera} stuck at {delivered}/{count}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// Pixel bytes of an `.npy` item, past its header.
fn npy_payload(bytes: &[u8]) -> &[u8] {
    assert_eq!(&bytes[..6], b"\x93NUMPY");
    let header_len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
    &bytes[10 + header_len..]
}

fn archive_items(path: &Path) -> Vec<(String, Vec<u8>)> {
    let mut archive = zip::ZipArchive::new(File::open(path).unwrap()).unwrap();
    (0..archive.len())
        .map(|i| {
            let mut item = archive.by_index(i).unwrap();
            let mut bytes = Vec::new();
            item.read_to_end(&mut bytes).unwrap();
            (item.name().to_string(), bytes)
        })
        .collect()
}

#[test]
fn two_cameras_one_records_five_frames() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0, 100.0]);
    let controller =
        Controller::with_sinks(&config(2, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    let target = controller
        .start_recording(0, RecordingMethod::RawArchive)
        .unwrap();
    assert!(controller.is_recording(0).unwrap());
    assert!(!controller.is_recording(1).unwrap());

    feed(&feeds[0], 5);
    feed(&feeds[1], 7);
    wait_delivered(&controller, 0, 5);
    wait_delivered(&controller, 1, 7);

    let report = controller.stop_recording(0).unwrap().unwrap();
    assert_eq!(report.frames, 5);
    assert_eq!(report.target, target);
    assert_eq!(target.extension().unwrap(), "npz");

    let items = archive_items(&target);
    assert_eq!(items.len(), 5);
    for (n, (name, bytes)) in items.iter().enumerate() {
        assert_eq!(name, &format!("frame_{n}.npy"));
        assert_eq!(npy_payload(bytes), &[n as u8; 16][..]);
    }

    let names: Vec<String> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names.len(), 1, "unexpected outputs {names:?}");
    assert!(names.iter().all(|n| n.starts_with("cam0_")));
}

#[test]
fn toggling_one_camera_leaves_the_other_intact() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0, 100.0]);
    let recorded = Arc::new(Recorded::default());
    let controller =
        Controller::with_sinks(&config(2, dir.path()), &driver, recorded.clone()).unwrap();

    controller.start_recording(1, RecordingMethod::RawArchive).unwrap();
    for round in 0..10u64 {
        controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
        feed(&feeds[0], 3);
        feed(&feeds[1], 5);
        wait_delivered(&controller, 1, (round + 1) * 5);
        controller.stop_recording(0).unwrap();
    }
    wait_delivered(&controller, 1, 50);
    controller.stop_recording(1).unwrap().unwrap();

    let camera1 = recorded.written(1);
    assert_eq!(camera1.len(), 1);
    assert_eq!(camera1[0], (0..50).collect::<Vec<_>>());

    // every session of camera 0 saw strictly increasing sequences
    let camera0 = recorded.written(0);
    assert_eq!(camera0.len(), 10);
    let mut last = None;
    for session in &camera0 {
        for &s in session {
            assert!(last.map_or(true, |l| s > l), "sequence {s} after {last:?}");
            last = Some(s);
        }
    }
}

#[test]
fn restart_produces_distinct_valid_archives() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0]);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    let first = controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    feed(&feeds[0], 2);
    wait_delivered(&controller, 0, 2);
    controller.stop_recording(0).unwrap();

    let second = controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    feed(&feeds[0], 3);
    wait_delivered(&controller, 0, 5);
    controller.stop_recording(0).unwrap();

    assert_ne!(first, second);
    assert_eq!(archive_items(&first).len(), 2);
    let items = archive_items(&second);
    assert_eq!(items.len(), 3);
    // image numbers continue across sessions, items restart at frame_0
    assert_eq!(items[0].0, "frame_0.npy");
    assert_eq!(npy_payload(&items[0].1), &[2u8; 16][..]);
}

#[test]
fn timeout_on_one_camera_does_not_block_the_others() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0, 100.0, 100.0]);
    let recorded = Arc::new(Recorded::default());
    let controller =
        Controller::with_sinks(&config(3, dir.path()), &driver, recorded.clone()).unwrap();
    controller.start_recording(2, RecordingMethod::RawArchive).unwrap();

    // camera 0 never delivers, camera 1 faults once
    feeds[1].send(Step::Fault("cable unplugged")).unwrap();
    feed(&feeds[1], 4);
    feed(&feeds[2], 4);
    wait_delivered(&controller, 1, 4);
    wait_delivered(&controller, 2, 4);

    let deadline = Instant::now() + Duration::from_secs(10);
    while controller.camera_status(0).unwrap().health != Health::Degraded {
        assert!(Instant::now() < deadline, "camera 0 never degraded");
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(controller.camera_status(1).unwrap().health, Health::Healthy);
    assert!(controller.preview_frame(0).unwrap().is_none());

    // later ticks still deliver
    feed(&feeds[2], 4);
    wait_delivered(&controller, 2, 8);
    controller.stop_recording(2).unwrap();
    assert_eq!(recorded.written(2), vec![(0..8).collect::<Vec<_>>()]);

    // a frame brings the degraded camera back
    feed(&feeds[0], 1);
    wait_delivered(&controller, 0, 1);
    let status = controller.camera_status(0).unwrap();
    assert_eq!(status.health, Health::Healthy);
    assert_eq!(status.consecutive_failures, 0);
}

#[test]
fn session_conflicts_and_unknown_cameras() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _feeds) = ScriptedDriver::new(&[100.0, 100.0]);
    let controller =
        Controller::with_sinks(&config(2, dir.path()), &driver, Arc::new(Recorded::default()))
            .unwrap();

    assert!(controller.stop_recording(0).unwrap().is_none());
    controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    assert!(matches!(
        controller.start_recording(0, RecordingMethod::EncodedVideo),
        Err(Error::SessionAlreadyActive { camera: 0 })
    ));
    assert!(matches!(
        controller.configure_cameras(PixelFormat::Mono8, 10.0, 1000.0),
        Err(Error::SessionAlreadyActive { camera: 0 })
    ));
    assert!(matches!(
        controller.start_recording(5, RecordingMethod::RawArchive),
        Err(Error::UnknownCamera(5))
    ));
    assert!(matches!(controller.preview_frame(2), Err(Error::UnknownCamera(2))));

    controller.stop_recording(0).unwrap().unwrap();
    assert!(controller.stop_recording(0).unwrap().is_none());
}

#[test]
fn configure_applies_to_all_or_none() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _feeds) = ScriptedDriver::new(&[100.0, 50.0]);
    let controller =
        Controller::with_sinks(&config(2, dir.path()), &driver, Arc::new(Recorded::default()))
            .unwrap();

    let rate = controller
        .configure_cameras(PixelFormat::Mono8, 45.0, 500.0)
        .unwrap();
    assert_eq!(rate, 45.0);

    let err = controller.configure_cameras(PixelFormat::Mono8, 80.0, 500.0);
    assert!(matches!(err, Err(Error::InvalidParameter { .. })));
    for camera in 0..2 {
        let status = controller.camera_status(camera).unwrap();
        assert_eq!(status.params.frame_rate, 45.0);
        assert_eq!(status.resulting_frame_rate, 45.0);
    }

    assert_eq!(
        controller.list_available_pixel_formats(1).unwrap(),
        vec!["Mono8".to_string(), "Mono16".to_string()]
    );
}

#[test]
fn rejected_frame_rate_keeps_emulated_cameras_streaming() {
    let dir = tempfile::tempdir().unwrap();
    let driver = EmulatedDriver::new(2, GEOMETRY.width, GEOMETRY.height);
    let controller =
        Controller::with_sinks(&config(2, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    let err = controller.configure_cameras(PixelFormat::Mono8, 1e-300, 1000.0);
    assert!(matches!(err, Err(Error::InvalidParameter { .. })), "{err:?}");

    for camera in 0..2 {
        let before = controller.camera_status(camera).unwrap().frames_delivered;
        let deadline = Instant::now() + Duration::from_secs(10);
        while controller.camera_status(camera).unwrap().frames_delivered < before + 3 {
            assert!(Instant::now() < deadline, "camera {camera} stopped delivering");
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(controller.camera_status(camera).unwrap().params.frame_rate, 30.0);
    }

    let rate = controller
        .configure_cameras(PixelFormat::Mono8, 30.0, 1000.0)
        .unwrap();
    assert_eq!(rate, 30.0);
}

#[test]
fn frames_racing_restarts_land_in_one_session_at_most() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[1000.0]);
    let recorded = Arc::new(Recorded::default());
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, recorded.clone()).unwrap();

    feed(&feeds[0], 400);
    for _ in 0..25 {
        controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
        thread::sleep(Duration::from_millis(1));
        controller.stop_recording(0).unwrap().unwrap();
    }
    wait_delivered(&controller, 0, 400);

    let sessions = recorded.written(0);
    assert_eq!(sessions.len(), 25);
    let mut last = None;
    for session in &sessions {
        for &s in session {
            assert!(last.map_or(true, |l| s > l), "sequence {s} after {last:?}");
            last = Some(s);
        }
    }
}

#[test]
fn missing_encoder_refuses_video_but_not_raw() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _feeds) = ScriptedDriver::new(&[100.0]);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    assert!(matches!(
        controller.start_recording(0, RecordingMethod::EncodedVideo),
        Err(Error::DeviceUnavailable { .. })
    ));
    assert!(!controller.is_recording(0).unwrap());
    controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
}

#[test]
fn output_directory_is_read_at_session_start() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _feeds) = ScriptedDriver::new(&[100.0]);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    let first = controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    controller.set_output_directory(dir.path().join("later")).unwrap();
    assert_eq!(first.parent().unwrap(), dir.path());
    controller.stop_recording(0).unwrap();

    let second = controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    assert_eq!(second.parent().unwrap(), dir.path().join("later"));
    controller.stop_recording(0).unwrap();
}

#[test]
fn events_follow_the_session_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0]);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(no_encoder())).unwrap();
    let mut events = controller.subscribe();

    controller.start_recording(0, RecordingMethod::RawArchive).unwrap();
    feed(&feeds[0], 1);
    wait_delivered(&controller, 0, 1);
    controller.stop_recording(0).unwrap();

    assert!(matches!(
        events.blocking_recv(),
        Ok(RecordingEvent::Started { camera: 0, method: RecordingMethod::RawArchive, .. })
    ));
    match events.blocking_recv() {
        Ok(RecordingEvent::Stopped(report)) => assert_eq!(report.frames, 1),
        other => panic!("expected stop, got {other:?}"),
    }
}

#[test]
fn preview_tracks_the_latest_frame() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0]);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(no_encoder())).unwrap();

    assert!(controller.preview_frame(0).unwrap().is_none());
    feed(&feeds[0], 3);
    wait_delivered(&controller, 0, 3);
    let frame = controller.preview_frame(0).unwrap().unwrap();
    assert_eq!(frame.sequence(), 2);
    assert_eq!(frame.meta.image_number, 2);
}

#[cfg(unix)]
#[test]
fn encoded_video_session_streams_through_the_encoder() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, feeds) = ScriptedDriver::new(&[100.0]);
    let program = EncoderProgram {
        path: "/bin/sh".into(),
        prefix_args: vec![
            "-c".into(),
            r#"eval "out=\${$#}"; cat > "$out""#.into(),
            "encoder".into(),
        ],
    };
    let options = EncoderOptions {
        extension: "raw".into(),
        ..Default::default()
    };
    let sinks = StandardSinks::new(Ok(program), options, None);
    let controller =
        Controller::with_sinks(&config(1, dir.path()), &driver, Arc::new(sinks)).unwrap();

    let target = controller
        .start_recording(0, RecordingMethod::EncodedVideo)
        .unwrap();
    assert_eq!(target.extension().unwrap(), "raw");
    assert!(!target.exists(), "encoder must wait for the first frame");

    feed(&feeds[0], 4);
    wait_delivered(&controller, 0, 4);
    let report = controller.stop_recording(0).unwrap().unwrap();
    assert_eq!(report.frames, 4);

    let bytes = fs::read(&target).unwrap();
    assert_eq!(bytes.len(), 4 * GEOMETRY.frame_len());
    assert!(bytes[3 * GEOMETRY.frame_len()..].iter().all(|b| *b == 3));
}

#[test]
fn too_few_devices_is_unavailable() {
    let dir = tempfile::tempdir().unwrap();
    let (driver, _feeds) = ScriptedDriver::new(&[100.0]);
    assert!(matches!(
        Controller::with_sinks(&config(2, dir.path()), &driver, Arc::new(no_encoder())),
        Err(Error::DeviceUnavailable { .. })
    ));
}
