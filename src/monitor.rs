use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::escalate::Escalator;
use crate::events::{self, Event, EventSink};
use crate::signals;

/// Bounded wait so the shutdown flag is observed even with no file activity.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Re-acquire read access every this many loop iterations, countering
/// external resets of the permission state.
pub const DEFAULT_REFRESH_CYCLES: u32 = 60;

/// Static inputs to one monitor run.
#[derive(Debug, Clone)]
pub struct MonitorOptions {
    pub watched_file: PathBuf,
    pub wait_timeout: Duration,
    pub refresh_cycles: u32,
}

/// Setup failures that prevent the loop from running at all, plus the one
/// unrecoverable wait failure. Everything else degrades and continues.
#[derive(Debug)]
pub enum MonitorError {
    CreateEpoll { source: Errno },
    OpenWatched { path: PathBuf, source: std::io::Error },
    Register { source: Errno },
    Wait { source: Errno },
}

impl std::fmt::Display for MonitorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorError::CreateEpoll { source } => {
                write!(f, "failed to create epoll instance: {source}")
            }
            MonitorError::OpenWatched { path, source } => {
                write!(
                    f,
                    "failed to open watched file {}: {}",
                    path.display(),
                    source
                )
            }
            MonitorError::Register { source } => {
                write!(f, "failed to register watched file with epoll: {source}")
            }
            MonitorError::Wait { source } => write!(f, "epoll wait failed: {source}"),
        }
    }
}

impl std::error::Error for MonitorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MonitorError::OpenWatched { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Debounce: an event exists only when the boolean derivation of the raw
/// value differs from the stored state. Raw fluctuations that stay on one
/// side of the on/off boundary emit nothing.
fn transition(previous_on: bool, value: i64) -> Option<events::EventKind> {
    let on = events::screen_on(value);
    if on == previous_on {
        None
    } else if on {
        Some(events::EventKind::ScreenOn)
    } else {
        Some(events::EventKind::ScreenOff)
    }
}

/// Consume whatever is pending on the descriptor so the next readiness
/// notification reflects a fresh edge. Failures here are non-fatal.
fn drain(mut file: &File) {
    if file.seek(SeekFrom::Start(0)).is_err() {
        return;
    }
    let mut buf = [0u8; 64];
    let _ = file.read(&mut buf);
}

/// Run the monitoring loop until the shutdown flag is set or the readiness
/// facility fails unrecoverably.
///
/// The epoll instance and the watched descriptor are owned by this frame, so
/// every exit path — normal shutdown or error return — closes both.
pub fn run(
    options: &MonitorOptions,
    escalator: &Escalator<'_>,
    sink: &mut dyn EventSink,
) -> Result<(), MonitorError> {
    let epoll =
        Epoll::new(EpollCreateFlags::empty()).map_err(|e| MonitorError::CreateEpoll { source: e })?;

    let watched = {
        use std::os::unix::fs::OpenOptionsExt;
        std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&options.watched_file)
            .map_err(|e| MonitorError::OpenWatched {
                path: options.watched_file.clone(),
                source: e,
            })?
    };

    let interest = EpollFlags::EPOLLIN
        | EpollFlags::EPOLLPRI
        | EpollFlags::EPOLLERR
        | EpollFlags::EPOLLHUP;
    epoll
        .add(&watched, EpollEvent::new(interest, 0))
        .map_err(|e| MonitorError::Register { source: e })?;

    let initial = events::read_raw_value(&options.watched_file);
    let mut screen_is_on = events::screen_on(initial);
    tracing::info!(
        path = %options.watched_file.display(),
        value = initial,
        screen_on = screen_is_on,
        "monitoring started"
    );

    let timeout = EpollTimeout::try_from(options.wait_timeout).unwrap_or(EpollTimeout::NONE);
    let mut ready_events = [EpollEvent::empty(); 1];
    let mut cycles_since_refresh: u32 = 0;

    while !signals::shutdown_requested() {
        let ready = match epoll.wait(&mut ready_events, timeout) {
            Ok(count) => count,
            // Interrupted by a signal: re-check the shutdown flag and wait again.
            Err(Errno::EINTR) => continue,
            Err(err) => {
                tracing::error!(error = %err, "epoll wait failed");
                return Err(MonitorError::Wait { source: err });
            }
        };

        if ready > 0 {
            let value = events::read_raw_value(&options.watched_file);
            if let Some(kind) = transition(screen_is_on, value) {
                let event = Event::now(kind);
                tracing::info!(
                    kind = kind.as_str(),
                    value,
                    timestamp = %event.timestamp,
                    "screen state changed"
                );
                if let Err(err) = sink.persist(&event) {
                    tracing::warn!(error = %err, "failed to persist event; continuing");
                }
                screen_is_on = events::screen_on(value);
            }
            drain(&watched);
        }

        cycles_since_refresh += 1;
        if cycles_since_refresh >= options.refresh_cycles {
            cycles_since_refresh = 0;
            escalator.acquire(&options.watched_file);
        }
    }

    tracing::info!("monitoring stopped");
    Ok(())
}
