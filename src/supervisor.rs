use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{chdir, fork, getpid, setsid, ForkResult, Pid};

use crate::config::Config;
use crate::escalate::Escalator;
use crate::events::SqliteCliSink;
use crate::monitor::{self, MonitorOptions};
use crate::pidfile::PidFile;
use crate::shell::SuRunner;
use crate::signals;

/// How long `start` gives the detached worker to write its pid file before
/// returning. Absence after the grace period is logged, not an error.
const PID_FILE_GRACE: Duration = Duration::from_secs(2);

/// Descriptors at or above this were never handed out by this process.
const INHERITED_FD_CEILING: i32 = 1024;

/// Result of a successful `start` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The detachment protocol ran; a worker is on its way up.
    Started,
    /// A live worker already owns the pid file; nothing was touched.
    AlreadyRunning,
}

impl StartOutcome {
    /// Integer code of the control surface: 0 started, 1 already running.
    pub fn code(&self) -> i32 {
        match self {
            StartOutcome::Started => 0,
            StartOutcome::AlreadyRunning => 1,
        }
    }
}

/// Errors surfaced to the calling process. Failures inside the detached
/// worker terminate only the worker and never appear here.
#[derive(Debug)]
pub enum SupervisorError {
    /// The initial fork failed; no process was left behind.
    Fork { source: Errno },
    /// The intermediate child reported a session-detach failure.
    Detach { code: i32 },
    /// `stop` found no usable pid record, so no signal was sent.
    NotRunning { path: std::path::PathBuf },
    /// Neither the graceful nor the forceful termination signal could be
    /// delivered.
    Signal { pid: Pid, source: Errno },
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Fork { source } => write!(f, "fork failed: {source}"),
            SupervisorError::Detach { code } => {
                write!(f, "session detach failed in intermediate child (exit {code})")
            }
            SupervisorError::NotRunning { path } => {
                write!(f, "no running worker recorded at {}", path.display())
            }
            SupervisorError::Signal { pid, source } => {
                write!(f, "failed to signal worker {pid}: {source}")
            }
        }
    }
}

impl std::error::Error for SupervisorError {}

/// Start the detached worker.
///
/// Returns `AlreadyRunning` without side effects when a live process owns
/// the pid file. Otherwise runs the detachment protocol: fork, new session,
/// fork again so the worker is not a session leader, then hand the inner
/// child to the worker entry point. The caller returns as soon as the
/// intermediate child has been reaped, after a bounded grace period for the
/// pid file to appear.
pub fn start(config: &Config) -> Result<StartOutcome, SupervisorError> {
    if is_running(&config.daemon.pid_file) {
        tracing::info!(
            pid_file = %config.daemon.pid_file.display(),
            "worker already running"
        );
        return Ok(StartOutcome::AlreadyRunning);
    }

    match unsafe { fork() } {
        Err(source) => Err(SupervisorError::Fork { source }),
        Ok(ForkResult::Parent { child }) => {
            // The intermediate child exits as soon as it has forked the
            // worker, so this wait is short. A nonzero exit means setsid or
            // the second fork failed before a worker existed.
            if let Ok(WaitStatus::Exited(_, code)) = waitpid(child, None) {
                if code != 0 {
                    return Err(SupervisorError::Detach { code });
                }
            }
            wait_for_pid_file(&config.daemon.pid_file, PID_FILE_GRACE);
            Ok(StartOutcome::Started)
        }
        Ok(ForkResult::Child) => detach_and_run(config),
    }
}

/// Stop the recorded worker.
///
/// SIGTERM first; SIGKILL only if SIGTERM delivery itself fails. The pid
/// file is deleted unconditionally on this path, even when the process had
/// already exited. Errors only when no usable record exists or neither
/// signal could be delivered.
pub fn stop(pid_path: &Path) -> Result<(), SupervisorError> {
    let pid_file = PidFile::new(pid_path);
    let Some(pid) = pid_file.read() else {
        return Err(SupervisorError::NotRunning {
            path: pid_path.to_path_buf(),
        });
    };

    let result = match kill(pid, Signal::SIGTERM) {
        Ok(()) => Ok(()),
        Err(term_err) => {
            tracing::warn!(
                %pid,
                error = %term_err,
                "SIGTERM delivery failed, attempting SIGKILL"
            );
            kill(pid, Signal::SIGKILL).map_err(|source| SupervisorError::Signal { pid, source })
        }
    };

    // Non-blocking reap in case the worker happens to be our child.
    let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));

    if let Err(err) = pid_file.remove() {
        // Benign race: the worker (or a stale-detect) may have deleted it.
        tracing::debug!(error = %err, "pid file already gone");
    }

    if result.is_ok() {
        tracing::info!(%pid, "worker stopped");
    }
    result
}

/// Whether a live worker owns the pid file.
///
/// A record whose process no longer exists is stale; it is deleted as a
/// corrective side effect of this read path.
pub fn is_running(pid_path: &Path) -> bool {
    let pid_file = PidFile::new(pid_path);
    let Some(pid) = pid_file.read() else {
        return false;
    };

    match kill(pid, None) {
        Ok(()) => true,
        // The process exists but is not ours to signal.
        Err(Errno::EPERM) => true,
        Err(_) => {
            tracing::info!(%pid, pid_file = %pid_path.display(), "removing stale pid file");
            if let Err(err) = pid_file.remove() {
                tracing::warn!(error = %err, "failed to remove stale pid file");
            }
            false
        }
    }
}

/// The recorded pid, if any. Callers wanting the C-style surface map `None`
/// to -1.
pub fn get_pid(pid_path: &Path) -> Option<Pid> {
    PidFile::new(pid_path).read()
}

fn wait_for_pid_file(path: &Path, grace: Duration) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::warn!(
        path = %path.display(),
        "worker did not write its pid file within the grace period"
    );
}

/// Detachment steps 2-4. Runs in the first child; never returns to the
/// caller's code. Errors past this point cannot reach the parent (it has
/// already been answered), so they become exit codes.
fn detach_and_run(config: &Config) -> ! {
    if setsid().is_err() {
        std::process::exit(1);
    }

    match unsafe { fork() } {
        Err(_) => std::process::exit(1),
        // The session leader exits immediately so the worker can never
        // reacquire a controlling terminal.
        Ok(ForkResult::Parent { .. }) => std::process::exit(0),
        Ok(ForkResult::Child) => {}
    }

    let _ = chdir("/");
    redirect_stdio(&config.daemon.log_file);

    let code = worker_main(config);
    std::process::exit(code);
}

/// Close every descriptor inherited from the launching process, park stdin
/// on /dev/null, and point stdout and stderr at the worker log file (falling
/// back to /dev/null when it cannot be opened). The tracing subscriber
/// installed before the fork keeps writing to the standard streams, so this
/// rewiring is what routes worker logs into the file.
fn redirect_stdio(log_file: &Path) {
    unsafe {
        for fd in 0..INHERITED_FD_CEILING {
            libc::close(fd);
        }

        // First open after the sweep: becomes fd 0.
        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);

        let log_fd = CString::new(log_file.as_os_str().as_bytes())
            .ok()
            .map(|p| {
                libc::open(
                    p.as_ptr(),
                    libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
                    0o644,
                )
            })
            .filter(|fd| *fd >= 0);

        let out = log_fd.unwrap_or(null);
        if out >= 0 {
            libc::dup2(out, libc::STDOUT_FILENO);
            libc::dup2(out, libc::STDERR_FILENO);
            if out > libc::STDERR_FILENO {
                libc::close(out);
            }
        }
    }
}

/// Worker entry point. Returns the worker's exit code.
fn worker_main(config: &Config) -> i32 {
    let pid_file = PidFile::new(&config.daemon.pid_file);
    if let Err(err) = pid_file.write(getpid()) {
        // Fatal to the worker only: never enter the loop without a record.
        tracing::error!(error = %err, "cannot write pid file, worker exiting");
        return 1;
    }

    if let Err(err) = signals::install() {
        tracing::warn!(error = %err, "failed to install signal handlers");
    }

    lower_niceness(config.daemon.niceness);
    set_process_name(&config.daemon.process_name);

    tracing::info!(
        pid = %getpid(),
        watched = %config.monitor.watched_file.display(),
        db = %config.storage.db_path.display(),
        "worker started"
    );

    let runner = SuRunner::new(config.daemon.elevate_command.clone());
    let escalator = Escalator::with_default_strategies(&runner);
    escalator.acquire(&config.monitor.watched_file);

    let mut sink = SqliteCliSink::new(&config.storage.db_path, &runner);
    let options = MonitorOptions {
        watched_file: config.monitor.watched_file.clone(),
        wait_timeout: Duration::from_secs(config.monitor.wait_timeout_secs),
        refresh_cycles: config.monitor.refresh_cycles,
    };

    if let Err(err) = monitor::run(&options, &escalator, &mut sink) {
        tracing::error!(error = %err, "monitor loop ended with error");
    }

    if let Err(err) = pid_file.remove() {
        tracing::warn!(error = %err, "failed to remove pid file on exit");
    }

    tracing::info!("worker exiting");
    0
}

/// Best effort; unprivileged workers typically cannot renice below zero.
fn lower_niceness(niceness: i32) {
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, niceness) };
    if rc != 0 {
        tracing::debug!(niceness, "setpriority not permitted");
    }
}

/// Rename the process image to reduce identifiability in process listings.
#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_process_name(name: &str) {
    if let Ok(name) = CString::new(name) {
        let _ = nix::sys::prctl::set_name(&name);
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_process_name(_name: &str) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
        dir.path().join("screenlogd.pid")
    }

    #[test]
    fn test_stop_without_record_errors_and_sends_no_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let err = stop(&pid_path(&tmp)).unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning { .. }));
    }

    #[test]
    fn test_stop_with_garbage_record_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = pid_path(&tmp);
        std::fs::write(&path, "-3\n").unwrap();

        let err = stop(&path).unwrap_err();
        assert!(matches!(err, SupervisorError::NotRunning { .. }));
        // Invalid records are not cleaned up by stop; only the probe path
        // deletes stale files.
        assert!(path.exists());
    }

    #[test]
    fn test_is_running_without_record_is_false() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!is_running(&pid_path(&tmp)));
    }

    #[test]
    fn test_is_running_with_live_process_keeps_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = pid_path(&tmp);
        let own_pid = Pid::from_raw(std::process::id() as i32);
        PidFile::new(&path).write(own_pid).unwrap();

        assert!(is_running(&path));
        assert!(path.exists());
        assert_eq!(get_pid(&path), Some(own_pid));
    }

    #[test]
    fn test_is_running_stale_record_is_cleaned_up() {
        let tmp = tempfile::tempdir().unwrap();
        let path = pid_path(&tmp);

        // A just-reaped child pid is as good as guaranteed not to be
        // recycled within this test.
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i32;
        child.wait().unwrap();

        PidFile::new(&path).write(Pid::from_raw(dead_pid)).unwrap();
        assert!(!is_running(&path));
        assert!(!path.exists(), "stale pid file should have been deleted");
    }

    #[test]
    fn test_start_returns_already_running_without_second_worker() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.daemon.pid_file = pid_path(&tmp);

        // Pose as the live worker: the liveness guard must short-circuit
        // before any fork happens.
        let own_pid = Pid::from_raw(std::process::id() as i32);
        PidFile::new(&config.daemon.pid_file).write(own_pid).unwrap();

        let outcome = start(&config).unwrap();
        assert_eq!(outcome, StartOutcome::AlreadyRunning);
        assert_eq!(outcome.code(), 1);
        // The record is untouched.
        assert_eq!(get_pid(&config.daemon.pid_file), Some(own_pid));
    }

    #[test]
    fn test_stop_terminates_live_child_and_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = pid_path(&tmp);

        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        PidFile::new(&path)
            .write(Pid::from_raw(child.id() as i32))
            .unwrap();

        stop(&path).unwrap();
        assert!(!path.exists());

        // stop's non-blocking reap may or may not have collected the child
        // already; both shapes mean it is gone.
        match child.wait() {
            Ok(status) => assert!(!status.success(), "child should have died to SIGTERM"),
            Err(_) => {}
        }
    }

    #[test]
    fn test_stop_on_exited_process_still_removes_record() {
        let tmp = tempfile::tempdir().unwrap();
        let path = pid_path(&tmp);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id() as i32;
        child.wait().unwrap();
        PidFile::new(&path).write(Pid::from_raw(dead_pid)).unwrap();

        // Neither signal is deliverable, so stop reports failure, but the
        // record is deleted regardless.
        let err = stop(&path).unwrap_err();
        assert!(matches!(err, SupervisorError::Signal { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn test_get_pid_missing_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(get_pid(&pid_path(&tmp)), None);
    }

    #[test]
    fn test_start_outcome_codes() {
        assert_eq!(StartOutcome::Started.code(), 0);
        assert_eq!(StartOutcome::AlreadyRunning.code(), 1);
    }
}
