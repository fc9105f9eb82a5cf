use std::process::Command;

/// Errors from the command port.
#[derive(Debug)]
pub enum ShellError {
    /// The elevation binary itself could not be spawned.
    Spawn {
        command: String,
        source: std::io::Error,
    },
    /// The command ran and reported a non-zero exit status.
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

impl std::fmt::Display for ShellError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShellError::Spawn { command, source } => {
                write!(f, "failed to spawn `{command}`: {source}")
            }
            ShellError::Failed {
                command,
                code,
                stderr,
            } => match code {
                Some(code) => write!(f, "`{command}` exited with status {code}: {stderr}"),
                None => write!(f, "`{command}` was killed by a signal: {stderr}"),
            },
        }
    }
}

impl std::error::Error for ShellError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ShellError::Spawn { source, .. } => Some(source),
            ShellError::Failed { .. } => None,
        }
    }
}

/// Port for opaque command-string invocations.
///
/// Both the privilege-escalation fallbacks and the event sink go through this
/// boundary, so tests can substitute a recording fake for the real elevated
/// shell.
pub trait CommandRunner: Send + Sync {
    /// Run one command string to completion. `Ok` means exit status zero.
    fn run(&self, command: &str) -> Result<(), ShellError>;
}

/// Production runner: hands the command string to an elevation binary as
/// `<elevate> -c <command>` (`su` by default, configurable).
pub struct SuRunner {
    elevate: String,
}

impl SuRunner {
    pub fn new(elevate: impl Into<String>) -> Self {
        Self {
            elevate: elevate.into(),
        }
    }
}

impl CommandRunner for SuRunner {
    fn run(&self, command: &str) -> Result<(), ShellError> {
        tracing::debug!(elevate = %self.elevate, command, "running elevated command");
        let output = Command::new(&self.elevate)
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| ShellError::Spawn {
                command: command.to_string(),
                source: e,
            })?;

        if output.status.success() {
            Ok(())
        } else {
            Err(ShellError::Failed {
                command: command.to_string(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    // `sh` stands in for the elevation binary; both accept `-c <command>`.
    #[test]
    fn test_zero_exit_is_ok() {
        let runner = SuRunner::new("sh");
        assert!(runner.run("exit 0").is_ok());
    }

    #[test]
    fn test_nonzero_exit_reports_code_and_stderr() {
        let runner = SuRunner::new("sh");
        let err = runner.run("echo boom >&2; exit 3").unwrap_err();
        match err {
            ShellError::Failed { code, stderr, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "boom");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_elevation_binary_is_spawn_error() {
        let runner = SuRunner::new("nonexistent-elevation-binary-xyz");
        let err = runner.run("true").unwrap_err();
        assert!(matches!(err, ShellError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }
}
