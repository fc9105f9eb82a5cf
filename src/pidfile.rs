use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use nix::unistd::Pid;

/// Durable record of the worker's process id.
///
/// On-disk format is the pid in decimal followed by a newline, created 0644
/// so the launching process (and anything else) can read it back. The worker
/// is the only writer; readers may delete a record that turns out to be stale.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

/// Errors from pid file operations.
#[derive(Debug)]
pub enum PidFileError {
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Write { path, source } => {
                write!(f, "failed to write pid file {}: {}", path.display(), source)
            }
            PidFileError::Remove { path, source } => {
                write!(
                    f,
                    "failed to remove pid file {}: {}",
                    path.display(),
                    source
                )
            }
        }
    }
}

impl std::error::Error for PidFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PidFileError::Write { source, .. } => Some(source),
            PidFileError::Remove { source, .. } => Some(source),
        }
    }
}

impl PidFile {
    /// Create a handle for the given path. Nothing is touched on disk.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `pid` as `"<pid>\n"`, truncating any previous record.
    pub fn write(&self, pid: Pid) -> Result<(), PidFileError> {
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o644)
            .open(&self.path)
            .map_err(|e| PidFileError::Write {
                path: self.path.clone(),
                source: e,
            })?;
        writeln!(file, "{pid}").map_err(|e| PidFileError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Read the recorded pid.
    ///
    /// Returns `None` when the file is absent, unreadable, or does not start
    /// with a positive decimal integer on its first line.
    pub fn read(&self) -> Option<Pid> {
        let contents = std::fs::read_to_string(&self.path).ok()?;
        let raw: i32 = contents.lines().next()?.trim().parse().ok()?;
        if raw <= 0 {
            return None;
        }
        Some(Pid::from_raw(raw))
    }

    /// Delete the record.
    pub fn remove(&self) -> Result<(), PidFileError> {
        std::fs::remove_file(&self.path).map_err(|e| PidFileError::Remove {
            path: self.path.clone(),
            source: e,
        })
    }
}
