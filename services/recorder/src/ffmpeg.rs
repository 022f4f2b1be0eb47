//! External ffmpeg processes: raw segment encoding and stream-copy merging.
//!
//! Every spawned process is owned by a [`ProcessHandle`] that must be
//! explicitly waited on or detached.

use crate::config::RecordingConfig;
use crate::frame::{Frame, StreamMeta};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors from external encoding and merging processes.
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{label} exited with {status}")]
    Exited { label: String, status: ExitStatus },

    #[error("I/O error on {label}: {source}")]
    Io {
        label: String,
        #[source]
        source: io::Error,
    },

    #[error("No segments to merge into {0}")]
    Empty(PathBuf),
}

/// An owned external process.
#[derive(Debug)]
pub struct ProcessHandle {
    label: String,
    child: Child,
}

impl ProcessHandle {
    /// Spawn `command`, labelling the process for logs and errors.
    pub fn spawn(mut command: Command, label: impl Into<String>) -> Result<Self, MuxError> {
        let child = command.spawn().map_err(|source| MuxError::Spawn {
            program: command.get_program().to_string_lossy().into_owned(),
            source,
        })?;
        Ok(Self::from_child(child, label))
    }

    pub fn from_child(child: Child, label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            child,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Block until the process exits.
    pub fn wait(mut self) -> Result<(), MuxError> {
        let status = self.child.wait().map_err(|source| MuxError::Io {
            label: self.label.clone(),
            source,
        })?;
        check_status(&self.label, status)
    }

    /// Poll the process. `Ok(true)` once it has exited successfully.
    pub fn try_wait(&mut self) -> Result<bool, MuxError> {
        match self.child.try_wait() {
            Ok(Some(status)) => check_status(&self.label, status).map(|()| true),
            Ok(None) => Ok(false),
            Err(source) => Err(MuxError::Io {
                label: self.label.clone(),
                source,
            }),
        }
    }

    /// Hand the process to a reaper thread that waits for it and logs the outcome.
    pub fn detach(self) {
        self.detach_then(|| {});
    }

    /// Like [`detach`](Self::detach), running `on_exit` once the process is gone.
    pub fn detach_then<F>(self, on_exit: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let label = self.label.clone();
        let spawned = std::thread::Builder::new()
            .name("process-reaper".to_string())
            .spawn(move || {
                if let Err(e) = self.wait() {
                    warn!(error = %e, "Detached process failed");
                }
                on_exit();
            });

        if let Err(e) = spawned {
            warn!(process = %label, error = %e, "Could not start reaper thread");
        }
    }
}

fn check_status(label: &str, status: ExitStatus) -> Result<(), MuxError> {
    if status.success() {
        Ok(())
    } else {
        Err(MuxError::Exited {
            label: label.to_string(),
            status,
        })
    }
}

/// Encoder settings shared by segment writers.
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub program: String,
    pub crf: u8,
}

impl From<&RecordingConfig> for FfmpegSettings {
    fn from(config: &RecordingConfig) -> Self {
        Self {
            program: config.ffmpeg_path.clone(),
            crf: config.crf,
        }
    }
}

impl FfmpegSettings {
    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(["-hide_banner", "-loglevel", "error", "-y"]);
        command
    }
}

/// Encodes raw frames into one MPEG-TS segment file.
#[derive(Debug)]
pub struct SegmentWriter {
    stdin: ChildStdin,
    process: ProcessHandle,
}

impl SegmentWriter {
    pub fn spawn(settings: &FfmpegSettings, path: &Path, meta: &StreamMeta) -> Result<Self, MuxError> {
        let mut command = settings.command();
        command
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24"])
            .args(["-s", &format!("{}x{}", meta.width, meta.height)])
            .args(["-r", &format!("{}", meta.fps)])
            .args(["-i", "pipe:0"])
            .args(["-f", "mpegts", "-c:v", "libx264"])
            .args(["-crf", &settings.crf.to_string()])
            .args(["-pix_fmt", "yuv420p"])
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null());

        let label = format!("segment writer {}", path.display());
        let mut process = ProcessHandle::spawn(command, label)?;
        let stdin = match process.child.stdin.take() {
            Some(stdin) => stdin,
            None => {
                let label = process.label.clone();
                process.detach();
                return Err(MuxError::Io {
                    label,
                    source: io::Error::new(io::ErrorKind::BrokenPipe, "stdin not captured"),
                });
            }
        };

        Ok(Self {
            stdin,
            process,
        })
    }

    pub fn write(&mut self, frame: &Frame) -> Result<(), MuxError> {
        self.stdin.write_all(&frame.data).map_err(|source| MuxError::Io {
            label: self.process.label.clone(),
            source,
        })
    }

    /// Close the encoder input. The returned handle completes once the
    /// segment file is fully written.
    pub fn finish(self) -> ProcessHandle {
        drop(self.stdin);
        self.process
    }
}

/// Merges segments into one recording without re-encoding.
///
/// Implementations must not block until the merge is complete.
#[cfg_attr(test, mockall::automock)]
pub trait Muxer: Send {
    fn concat(&self, segments: &[PathBuf], target: &Path) -> Result<(), MuxError>;
}

/// Concat manifest: one `file '<path>'` line per segment, in order.
pub fn manifest(segments: &[PathBuf]) -> String {
    segments
        .iter()
        .map(|segment| {
            let path = segment.to_string_lossy().replace('\'', r"'\''");
            format!("file '{}'\n", path)
        })
        .collect()
}

fn absolute(path: &Path) -> io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Runs `ffmpeg -f concat` with stream copy.
#[derive(Debug, Clone)]
pub struct FfmpegMuxer {
    settings: FfmpegSettings,
}

impl FfmpegMuxer {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self { settings }
    }

    fn spawn(&self, manifest_path: &Path, target: &Path) -> Result<ProcessHandle, MuxError> {
        let mut command = self.settings.command();
        command
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(manifest_path)
            .args(["-c", "copy"])
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null());

        ProcessHandle::spawn(command, format!("merge {}", target.display()))
    }
}

fn remove_manifest(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        debug!(manifest = %path.display(), error = %e, "Could not remove manifest");
    }
}

impl Muxer for FfmpegMuxer {
    /// Starts the merge and returns without waiting for it. A failing merge
    /// is logged by the reaper, which also removes the manifest.
    fn concat(&self, segments: &[PathBuf], target: &Path) -> Result<(), MuxError> {
        if segments.is_empty() {
            return Err(MuxError::Empty(target.to_path_buf()));
        }

        let io_error = |source| MuxError::Io {
            label: format!("manifest for {}", target.display()),
            source,
        };

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }

        // ffmpeg resolves manifest entries relative to the manifest itself.
        let absolute_segments = segments
            .iter()
            .map(|s| absolute(s))
            .collect::<io::Result<Vec<_>>>()
            .map_err(io_error)?;

        let manifest_path = target.with_extension("txt");
        fs::write(&manifest_path, manifest(&absolute_segments)).map_err(io_error)?;

        match self.spawn(&manifest_path, target) {
            Ok(process) => {
                debug!(target = %target.display(), "Merge started");
                process.detach_then(move || remove_manifest(&manifest_path));
                Ok(())
            }
            Err(e) => {
                remove_manifest(&manifest_path);
                Err(e)
            }
        }
    }
}

/// Logs merges instead of running them.
#[derive(Debug, Clone, Default)]
pub struct DryRunMuxer;

impl Muxer for DryRunMuxer {
    fn concat(&self, segments: &[PathBuf], target: &Path) -> Result<(), MuxError> {
        info!(
            target = %target.display(),
            segments = segments.len(),
            "Dry run, merge skipped"
        );
        Ok(())
    }
}
