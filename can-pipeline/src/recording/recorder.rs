//! Session recorder
//!
//! Append-only sink that writes every observed frame to disk. Each row goes out
//! in a single unbuffered write and is synced before `record` returns, so a
//! crash loses at most the frame being written. A failed write closes the
//! recording rather than leaving a torn row for the next one to follow.

use super::csv::{format_row, HEADER};
use crate::types::{Frame, Result};
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

struct OpenRecording {
    path: PathBuf,
    file: File,
    records: u64,
}

/// Writes frames to a recording file
#[derive(Default)]
pub struct SessionRecorder {
    inner: Mutex<Option<OpenRecording>>,
}

impl SessionRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or truncate `path` and write the header
    ///
    /// A recording that is already open is closed first.
    pub fn open(&self, path: &Path) -> Result<()> {
        self.close();
        let file = File::create(path)?;
        self.start(path.to_path_buf(), file)
    }

    /// Open a new timestamped recording inside `dir`, creating the directory
    ///
    /// Never reuses an existing file: a name already taken gets a numeric suffix.
    pub fn open_in_dir(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let stem = format!("session-{}", Local::now().format("%Y%m%d-%H%M%S%.3f"));

        let mut attempt = 0u32;
        let (path, file) = loop {
            let name = match attempt {
                0 => format!("{}.csv", stem),
                n => format!("{}-{}.csv", stem, n),
            };
            let path = dir.join(name);
            match File::options().write(true).create_new(true).open(&path) {
                Ok(file) => break (path, file),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(e.into()),
            }
        };

        self.close();
        self.start(path.clone(), file)?;
        Ok(path)
    }

    fn start(&self, path: PathBuf, mut file: File) -> Result<()> {
        file.write_all(format!("{}\n", HEADER).as_bytes())?;

        log::info!("Recording to {:?}", path);
        let displaced = self.inner.lock().replace(OpenRecording {
            path,
            file,
            records: 0,
        });
        if let Some(previous) = displaced {
            Self::finish(previous);
        }
        Ok(())
    }

    /// Append one frame and sync it to disk
    ///
    /// Does nothing while no recording is open. On a write failure the
    /// recording is closed and the error returned; later calls are no-ops.
    pub fn record(&self, frame: &Frame) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(recording) = inner.as_mut() else {
            return Ok(());
        };

        let row = format!("{}\n", format_row(frame));
        let written = recording
            .file
            .write_all(row.as_bytes())
            .and_then(|()| recording.file.sync_data());
        if let Err(e) = written {
            if let Some(failed) = inner.take() {
                log::warn!(
                    "Recording {:?} failed after {} frames, closing it: {}",
                    failed.path,
                    failed.records,
                    e
                );
            }
            return Err(e.into());
        }

        recording.records += 1;
        Ok(())
    }

    /// Close the current recording; safe to call repeatedly
    pub fn close(&self) {
        let open = self.inner.lock().take();
        if let Some(recording) = open {
            Self::finish(recording);
        }
    }

    fn finish(recording: OpenRecording) {
        if let Err(e) = recording.file.sync_all() {
            log::warn!("Failed to sync recording {:?}: {}", recording.path, e);
        }
        log::info!(
            "Recording closed: {:?} ({} frames)",
            recording.path,
            recording.records
        );
    }

    pub fn is_open(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Path of the open recording
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().as_ref().map(|r| r.path.clone())
    }

    /// Frames written to the open recording
    pub fn records_written(&self) -> u64 {
        self.inner.lock().as_ref().map_or(0, |r| r.records)
    }
}

impl Drop for SessionRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
