//! Encoded video sink: raw frames piped into an external encoder (an
//! ffmpeg-compatible command line).
//!
//! The encoder is not launched until the first frame arrives, so a session
//! that never sees a frame leaves no process and no file behind.

use std::collections::VecDeque;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::capture::{Frame, Geometry};
use crate::error::EncoderFailure;
use crate::sink::FrameSink;
use crate::{Error, Result};

/// Stderr lines kept for diagnosing a failed encoder.
const DIAGNOSTIC_LINES: usize = 64;

/// Encoder tuning. Omitted fields take the defaults below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderOptions {
    /// Output codec (`-vcodec`); `png` stays lossless and compact in `.avi`
    pub codec: String,
    /// Compression preset (`-preset`), ultrafast .. placebo
    pub preset: String,
    /// Target bitrate (`-b`), e.g. `5000k`
    pub bitrate: Option<String>,
    /// Encoder worker threads (`-threads`)
    pub threads: Option<u32>,
    /// Extra output arguments inserted before the bitrate/thread flags
    pub extra_args: Vec<String>,
    /// Container extension of the output file
    pub extension: String,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            codec: "png".into(),
            preset: "medium".into(),
            bitrate: None,
            threads: None,
            extra_args: Vec::new(),
            extension: "avi".into(),
        }
    }
}

impl EncoderOptions {
    pub fn validate(&self) -> Result<()> {
        if self.codec.trim().is_empty() {
            return Err(Error::invalid("codec", "must not be empty"));
        }
        if self.extension.trim().is_empty() || self.extension.contains(['/', '\\', '.']) {
            return Err(Error::invalid(
                "extension",
                format!("{:?} is not a file extension", self.extension),
            ));
        }
        if self.threads == Some(0) {
            return Err(Error::invalid("threads", "must be at least 1"));
        }
        Ok(())
    }
}

/// Resolved encoder executable plus arguments placed before the generated ones.
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderProgram {
    pub path: PathBuf,
    pub prefix_args: Vec<String>,
}

struct EncoderProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    diagnostics: Arc<Mutex<VecDeque<String>>>,
    drain: Option<JoinHandle<()>>,
}

impl EncoderProcess {
    /// Waits for the drain thread so every stderr line is captured.
    fn collect_diagnostics(&mut self) -> String {
        if let Some(drain) = self.drain.take() {
            let _ = drain.join();
        }
        self.diagnostics
            .lock()
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Closes stdin, reaps the child and returns its status with diagnostics.
    fn finish(mut self) -> (std::io::Result<ExitStatus>, String) {
        drop(self.stdin.take());
        let status = self.child.wait();
        let diagnostics = self.collect_diagnostics();
        (status, diagnostics)
    }
}

fn drain_stderr(stderr: ChildStderr, sink: Arc<Mutex<VecDeque<String>>>) -> JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            debug!(target: "argus::encoder", "{}", line);
            let mut tail = sink.lock();
            if tail.len() == DIAGNOSTIC_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

pub struct EncodedVideoSink {
    program: EncoderProgram,
    output_dir: PathBuf,
    output: PathBuf,
    geometry: Geometry,
    frame_rate: f64,
    options: EncoderOptions,
    process: Option<EncoderProcess>,
    written: u64,
    closed: bool,
}

impl EncodedVideoSink {
    pub fn new(
        program: EncoderProgram,
        output_dir: &Path,
        file_name: &str,
        geometry: Geometry,
        frame_rate: f64,
        options: EncoderOptions,
    ) -> Result<Self> {
        options.validate()?;
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(Error::invalid(
                "playback frame rate",
                format!("{frame_rate} is not a positive rate"),
            ));
        }
        if geometry.width == 0 || geometry.height == 0 {
            return Err(Error::invalid(
                "frame size",
                format!("{}x{}", geometry.width, geometry.height),
            ));
        }

        Ok(Self {
            program,
            output_dir: output_dir.to_path_buf(),
            output: output_dir.join(file_name),
            geometry,
            frame_rate,
            options,
            process: None,
            written: 0,
            closed: false,
        })
    }

    /// Whether the encoder process has been started.
    pub fn is_launched(&self) -> bool {
        self.process.is_some()
    }

    /// Encoder arguments; order matters: input description before `-i -`.
    pub fn command_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-loglevel",
            "error",
            "-f",
            "rawvideo",
            "-vcodec",
            "rawvideo",
        ]
        .into_iter()
        .map(String::from)
        .collect();
        args.extend([
            "-s".into(),
            format!("{}x{}", self.geometry.width, self.geometry.height),
            "-pix_fmt".into(),
            self.geometry.format.encoder_tag().into(),
            "-r".into(),
            format!("{:.02}", self.frame_rate),
            "-i".into(),
            "-".into(),
            "-vcodec".into(),
            self.options.codec.clone(),
            "-preset".into(),
            self.options.preset.clone(),
        ]);
        args.extend(self.options.extra_args.iter().cloned());
        if let Some(bitrate) = &self.options.bitrate {
            args.extend(["-b".into(), bitrate.clone()]);
        }
        if let Some(threads) = self.options.threads {
            args.extend(["-threads".into(), threads.to_string()]);
        }
        args.push(self.output.to_string_lossy().into_owned());
        args
    }

    fn launch(&mut self) -> Result<()> {
        fs::create_dir_all(&self.output_dir)?;
        let args = self.command_args();
        info!(
            "Starting encoder {} for {}",
            self.program.path.display(),
            self.output.display()
        );
        debug!("Encoder arguments: {:?}", args);

        let mut child = Command::new(&self.program.path)
            .args(&self.program.prefix_args)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::EncoderIo {
                reason: EncoderFailure::Unclassified,
                diagnostics: format!("could not start {}", self.program.path.display()),
                source: e,
            })?;

        let stdin = child.stdin.take();
        let diagnostics = Arc::new(Mutex::new(VecDeque::new()));
        let drain = child
            .stderr
            .take()
            .map(|stderr| drain_stderr(stderr, Arc::clone(&diagnostics)));

        self.process = Some(EncoderProcess {
            child,
            stdin,
            diagnostics,
            drain,
        });
        Ok(())
    }

    /// Reaps a failed encoder so `close` has nothing left to do.
    fn abandon(&mut self) -> String {
        match self.process.take() {
            Some(process) => process.finish().1,
            None => String::new(),
        }
    }
}

impl FrameSink for EncodedVideoSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(Error::invalid("sink state", "encoder already closed"));
        }
        if frame.data.len() != self.geometry.frame_len() {
            return Err(Error::invalid(
                "frame",
                format!(
                    "{} bytes do not match {}x{} {}",
                    frame.data.len(),
                    self.geometry.width,
                    self.geometry.height,
                    self.geometry.format
                ),
            ));
        }

        if self.process.is_none() {
            self.launch()?;
        }
        let Some(process) = self.process.as_mut() else {
            return Err(Error::invalid("sink state", "encoder not running"));
        };

        if let Some(status) = process.child.try_wait()? {
            let diagnostics = self.abandon();
            return Err(Error::EncoderTerminated {
                status: status.to_string(),
                reason: EncoderFailure::classify(&diagnostics),
                diagnostics,
            });
        }

        let written = match process.stdin.as_mut() {
            Some(stdin) => stdin.write_all(&frame.data),
            None => Err(std::io::ErrorKind::BrokenPipe.into()),
        };
        if let Err(source) = written {
            let diagnostics = self.abandon();
            return Err(Error::EncoderIo {
                reason: EncoderFailure::classify(&diagnostics),
                diagnostics,
                source,
            });
        }

        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let Some(process) = self.process.take() else {
            return Ok(());
        };
        match process.finish() {
            (Ok(status), _) if status.success() => {
                info!(
                    "Encoder finished: {} frames written to {}",
                    self.written,
                    self.output.display()
                );
            }
            (Ok(status), diagnostics) => {
                warn!(
                    "Encoder for {} exited with {}: {}",
                    self.output.display(),
                    status,
                    diagnostics
                );
            }
            (Err(e), _) => warn!("Could not wait for encoder: {}", e),
        }
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }

    fn target(&self) -> &Path {
        &self.output
    }
}

impl Drop for EncodedVideoSink {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
