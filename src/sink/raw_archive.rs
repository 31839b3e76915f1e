//! Raw frame archive: per-frame `.npy` files staged on disk, zipped into a
//! single `.npz` on close.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::capture::{Frame, Geometry};
use crate::sink::{npy, FrameSink};
use crate::{Error, Result};

pub const ARCHIVE_EXTENSION: &str = "npz";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct RawArchiveSink {
    archive: PathBuf,
    staging: PathBuf,
    written: u64,
    closed: bool,
}

impl RawArchiveSink {
    /// Archive goes to `<base>.npz`, staged frames to `<base>/`.
    pub fn create(base: &Path) -> Result<Self> {
        let archive = base.with_extension(ARCHIVE_EXTENSION);
        let staging = base.to_path_buf();
        fs::create_dir_all(&staging)?;
        debug!("Staging raw frames in {}", staging.display());

        Ok(Self {
            archive,
            staging,
            written: 0,
            closed: false,
        })
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }

    fn item_name(n: u64) -> String {
        format!("frame_{n}.npy")
    }

    fn staged(&self, n: u64) -> PathBuf {
        self.staging.join(Self::item_name(n))
    }

    fn consolidate(&self) -> std::result::Result<(), BoxError> {
        let file = File::create(&self.archive)?;
        let mut zip = ZipWriter::new(BufWriter::new(file));
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .large_file(true);

        for n in 0..self.written {
            zip.start_file(Self::item_name(n), options)?;
            let mut staged = File::open(self.staged(n))?;
            io::copy(&mut staged, &mut zip)?;
        }

        let mut out = zip.finish()?;
        out.flush()?;
        Ok(())
    }

    fn clean_staging(&self) {
        for n in 0..self.written {
            if let Err(e) = fs::remove_file(self.staged(n)) {
                warn!("Could not remove staged frame {}: {}", n, e);
            }
        }
        if let Err(e) = fs::remove_dir(&self.staging) {
            warn!(
                "Staging directory {} left behind: {}",
                self.staging.display(),
                e
            );
        }
    }
}

impl FrameSink for RawArchiveSink {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.closed {
            return Err(Error::invalid("sink state", "archive already closed"));
        }

        let geometry = Geometry {
            width: frame.meta.width,
            height: frame.meta.height,
            format: frame.meta.format,
        };
        if frame.data.len() != geometry.frame_len() {
            return Err(Error::invalid(
                "frame",
                format!(
                    "{} bytes do not match {}x{} {}",
                    frame.data.len(),
                    geometry.width,
                    geometry.height,
                    geometry.format
                ),
            ));
        }

        let path = self.staged(self.written);
        let mut out = BufWriter::new(File::create(&path)?);
        out.write_all(&npy::header(
            geometry.format.npy_descr(),
            &npy::frame_shape(&geometry),
        ))?;
        out.write_all(&frame.data)?;
        out.flush()?;

        self.written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if let Err(e) = self.consolidate() {
            // keep the staged frames, drop the half-written archive
            let _ = fs::remove_file(&self.archive);
            return Err(Error::archive(&self.archive, e));
        }
        self.clean_staging();

        info!(
            "Wrote {} frames to {}",
            self.written,
            self.archive.display()
        );
        Ok(())
    }

    fn frames_written(&self) -> u64 {
        self.written
    }

    fn target(&self) -> &Path {
        &self.archive
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{FrameMetadata, PixelFormat};
    use bytes::Bytes;
    use std::io::Read;
    use std::sync::Arc;
    use std::time::Instant;

    fn frame(sequence: u64, format: PixelFormat) -> Frame {
        let (width, height) = (5u32, 3u32);
        let len = (width * height) as usize * format.bytes_per_pixel();
        let data: Vec<u8> = (0..len).map(|i| (i as u64 * 7 + sequence) as u8).collect();
        Frame {
            data: Bytes::from(data),
            meta: Arc::new(FrameMetadata {
                camera: 0,
                sequence,
                image_number: sequence,
                width,
                height,
                format,
                device_timestamp: None,
            }),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn round_trips_frames_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("cam_0");
        let mut sink = RawArchiveSink::create(&base).unwrap();
        assert!(base.is_dir());

        let frames: Vec<Frame> = (0..4).map(|s| frame(s, PixelFormat::Mono16)).collect();
        for f in &frames {
            sink.write_frame(f).unwrap();
        }
        sink.close().unwrap();
        assert_eq!(sink.frames_written(), 4);
        assert!(!base.exists(), "staging directory should be removed");

        let mut archive = zip::ZipArchive::new(File::open(dir.path().join("cam_0.npz")).unwrap()).unwrap();
        assert_eq!(archive.len(), 4);
        for (n, f) in frames.iter().enumerate() {
            let mut item = archive.by_index(n).unwrap();
            assert_eq!(item.name(), format!("frame_{n}.npy"));
            assert_eq!(item.compression(), CompressionMethod::Deflated);
            let mut bytes = Vec::new();
            item.read_to_end(&mut bytes).unwrap();
            let (dict, payload) = npy::tests::split(&bytes);
            assert!(dict.contains("'descr': '<u2'"));
            assert!(dict.contains("'shape': (3, 5)"));
            assert_eq!(payload, &f.data[..]);
        }
    }

    #[test]
    fn empty_session_still_produces_archive() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawArchiveSink::create(&dir.path().join("idle")).unwrap();
        sink.close().unwrap();
        let archive = zip::ZipArchive::new(File::open(dir.path().join("idle.npz")).unwrap()).unwrap();
        assert_eq!(archive.len(), 0);
    }

    #[test]
    fn rejects_writes_after_close_and_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawArchiveSink::create(&dir.path().join("c")).unwrap();
        sink.write_frame(&frame(0, PixelFormat::Mono8)).unwrap();
        sink.close().unwrap();
        sink.close().unwrap();
        assert!(matches!(
            sink.write_frame(&frame(1, PixelFormat::Mono8)),
            Err(Error::InvalidParameter { .. })
        ));
        assert_eq!(sink.frames_written(), 1);
    }

    #[test]
    fn rejects_truncated_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = RawArchiveSink::create(&dir.path().join("t")).unwrap();
        let mut f = frame(0, PixelFormat::Rgb8);
        f.data = f.data.slice(..4);
        assert!(sink.write_frame(&f).is_err());
        assert_eq!(sink.frames_written(), 0);
    }

    #[test]
    fn failed_consolidation_keeps_staged_frames() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("broken");
        let mut sink = RawArchiveSink::create(&base).unwrap();
        sink.write_frame(&frame(0, PixelFormat::Mono8)).unwrap();
        sink.write_frame(&frame(1, PixelFormat::Mono8)).unwrap();
        // a directory where the archive should go makes File::create fail
        fs::create_dir(dir.path().join("broken.npz")).unwrap();

        let err = sink.close().unwrap_err();
        assert!(matches!(err, Error::ArchiveWrite { .. }));
        assert!(base.join("frame_0.npy").is_file());
        assert!(base.join("frame_1.npy").is_file());
    }
}
