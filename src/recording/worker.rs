use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::capture::Frame;
use crate::recording::session::SessionGate;
use crate::recording::{RecordingEvent, SessionReport};
use crate::sink::{FrameSink, SessionPlan, SinkFactory};
use crate::Result;

pub(crate) enum WorkerMessage {
    Start {
        plan: SessionPlan,
        reply: flume::Sender<Result<PathBuf>>,
    },
    Frame {
        session: u64,
        frame: Frame,
    },
    Stop {
        reply: flume::Sender<Result<Option<SessionReport>>>,
    },
    Shutdown,
}

struct ActiveSession {
    plan: SessionPlan,
    sink: Box<dyn FrameSink>,
    started: Instant,
    last_sequence: Option<u64>,
}

pub(crate) struct Worker {
    camera: usize,
    inbox: flume::Receiver<WorkerMessage>,
    gate: Arc<SessionGate>,
    sinks: Arc<dyn SinkFactory>,
    events: broadcast::Sender<RecordingEvent>,
    active: Option<ActiveSession>,
}

impl Worker {
    pub(crate) fn new(
        camera: usize,
        inbox: flume::Receiver<WorkerMessage>,
        gate: Arc<SessionGate>,
        sinks: Arc<dyn SinkFactory>,
        events: broadcast::Sender<RecordingEvent>,
    ) -> Self {
        Self {
            camera,
            inbox,
            gate,
            sinks,
            events,
            active: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!("Recording worker for camera {} running", self.camera);
        while let Ok(message) = self.inbox.recv() {
            match message {
                WorkerMessage::Start { plan, reply } => {
                    let _ = reply.send(self.start(plan));
                }
                WorkerMessage::Frame { session, frame } => self.write(session, frame),
                WorkerMessage::Stop { reply } => {
                    let _ = reply.send(self.finish());
                }
                WorkerMessage::Shutdown => break,
            }
        }

        if let Some(active) = &self.active {
            let session = active.plan.session;
            self.gate.deactivate(session);
            if let Err(e) = self.finish() {
                error!("Camera {}: closing session {} on shutdown failed: {}", self.camera, session, e);
            }
        }
        debug!("Recording worker for camera {} stopped", self.camera);
    }

    fn start(&mut self, plan: SessionPlan) -> Result<PathBuf> {
        if let Some(stale) = &self.active {
            // the gate was closed for it already; finish it before reusing the worker
            warn!(
                "Camera {}: session {} still open at start of {}",
                self.camera, stale.plan.session, plan.session
            );
            let stale = stale.plan.session;
            if let Err(e) = self.finish() {
                error!(
                    "Camera {}: closing stale session {} failed: {}",
                    self.camera, stale, e
                );
            }
        }

        let sink = match self.sinks.create(&plan) {
            Ok(sink) => sink,
            Err(e) => {
                error!(
                    "Camera {}: could not create {} sink: {}",
                    self.camera, plan.method, e
                );
                return Err(e);
            }
        };
        let target = sink.target().to_path_buf();

        info!(
            "Camera {}: session {} recording ({}) to {}",
            self.camera,
            plan.session,
            plan.method,
            target.display()
        );
        let _ = self.events.send(RecordingEvent::Started {
            camera: self.camera,
            session: plan.session,
            method: plan.method,
            target: target.clone(),
        });
        metrics::gauge!("argus_sessions_active").increment(1.0);

        let session = plan.session;
        self.active = Some(ActiveSession {
            plan,
            sink,
            started: Instant::now(),
            last_sequence: None,
        });
        self.gate.activate(session);
        Ok(target)
    }

    fn write(&mut self, session: u64, frame: Frame) {
        let Some(active) = self.active.as_mut().filter(|a| a.plan.session == session) else {
            debug!(
                "Camera {}: dropping frame {} for closed session {}",
                self.camera,
                frame.sequence(),
                session
            );
            return;
        };

        if active.last_sequence.is_some_and(|last| frame.sequence() <= last) {
            warn!(
                "Camera {}: out-of-order frame {} after {:?}, skipped",
                self.camera,
                frame.sequence(),
                active.last_sequence
            );
            return;
        }

        match active.sink.write_frame(&frame) {
            Ok(()) => {
                active.last_sequence = Some(frame.sequence());
                metrics::counter!("argus_frames_recorded_total", "camera" => self.camera.to_string())
                    .increment(1);
            }
            Err(e) => self.fail(session, e.to_string()),
        }
    }

    /// Ends a session whose sink broke: the camera goes back to idle.
    fn fail(&mut self, session: u64, reason: String) {
        error!(
            "Camera {}: recording session {} failed: {}",
            self.camera, session, reason
        );
        self.gate.deactivate(session);
        if let Some(mut active) = self.active.take() {
            if let Err(e) = active.sink.close() {
                warn!("Camera {}: closing failed sink: {}", self.camera, e);
            }
            metrics::gauge!("argus_sessions_active").decrement(1.0);
        }
        let _ = self.events.send(RecordingEvent::Failed {
            camera: self.camera,
            session,
            error: reason,
        });
    }

    fn finish(&mut self) -> Result<Option<SessionReport>> {
        let Some(mut active) = self.active.take() else {
            return Ok(None);
        };
        metrics::gauge!("argus_sessions_active").decrement(1.0);

        let session = active.plan.session;
        if let Err(e) = active.sink.close() {
            error!("Camera {}: session {} did not finalize: {}", self.camera, session, e);
            let _ = self.events.send(RecordingEvent::Failed {
                camera: self.camera,
                session,
                error: e.to_string(),
            });
            return Err(e);
        }

        let report = SessionReport {
            camera: self.camera,
            session,
            method: active.plan.method,
            target: active.sink.target().to_path_buf(),
            frames: active.sink.frames_written(),
            elapsed: active.started.elapsed(),
        };
        info!(
            "Camera {}: session {} stopped after {} frames ({:.1?})",
            self.camera, session, report.frames, report.elapsed
        );
        let _ = self.events.send(RecordingEvent::Stopped(report.clone()));
        Ok(Some(report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Geometry, PixelFormat};
    use crate::sink::RecordingMethod;
    use crate::Error;
    use std::path::Path;
    use std::thread;

    /// Sink whose close fails, leaving a session that cannot be finalized.
    struct Unclosable(PathBuf);

    impl FrameSink for Unclosable {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Err(Error::invalid("archive", "device went away"))
        }

        fn frames_written(&self) -> u64 {
            0
        }

        fn target(&self) -> &Path {
            &self.0
        }
    }

    struct Unclosables;

    impl SinkFactory for Unclosables {
        fn create(&self, plan: &SessionPlan) -> Result<Box<dyn FrameSink>> {
            Ok(Box::new(Unclosable(plan.output_dir.join(&plan.base_name))))
        }
    }

    fn plan(session: u64) -> SessionPlan {
        SessionPlan {
            camera: 0,
            session,
            method: RecordingMethod::RawArchive,
            output_dir: "out".into(),
            base_name: format!("s{session}"),
            geometry: Geometry {
                width: 2,
                height: 2,
                format: PixelFormat::Mono8,
            },
            frame_rate: 30.0,
        }
    }

    fn start(tx: &flume::Sender<WorkerMessage>, session: u64) -> Result<PathBuf> {
        let (reply, response) = flume::bounded(1);
        tx.send(WorkerMessage::Start {
            plan: plan(session),
            reply,
        })
        .unwrap();
        response.recv().unwrap()
    }

    #[test]
    fn stale_session_that_fails_to_close_does_not_block_the_next() {
        let (tx, inbox) = flume::unbounded();
        let gate = Arc::new(SessionGate::new(tx.clone()));
        let (events, mut rx) = broadcast::channel(16);
        let worker = Worker::new(0, inbox, gate.clone(), Arc::new(Unclosables), events);
        let handle = thread::spawn(move || worker.run());

        assert_eq!(start(&tx, 1).unwrap(), Path::new("out/s1"));
        assert_eq!(start(&tx, 2).unwrap(), Path::new("out/s2"));
        assert_eq!(gate.current(), Some(2));

        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::Started { session: 1, .. })));
        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::Failed { session: 1, .. })));
        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::Started { session: 2, .. })));

        tx.send(WorkerMessage::Shutdown).unwrap();
        handle.join().unwrap();
        assert_eq!(gate.current(), None);
        assert!(matches!(rx.try_recv(), Ok(RecordingEvent::Failed { session: 2, .. })));
    }
}
