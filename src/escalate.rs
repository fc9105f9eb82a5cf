use std::path::Path;

use crate::shell::{CommandRunner, ShellError};

/// Marker attribute written by the first strategy.
const ACCESS_ATTR_NAME: &str = "user.screenlogd.access";
const ACCESS_ATTR_VALUE: &[u8] = b"read-enabled";

/// Errors from a single access strategy attempt.
#[derive(Debug)]
pub enum AcquireError {
    Xattr(std::io::Error),
    Command(ShellError),
}

impl std::fmt::Display for AcquireError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcquireError::Xattr(e) => write!(f, "xattr operation failed: {e}"),
            AcquireError::Command(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for AcquireError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AcquireError::Xattr(e) => Some(e),
            AcquireError::Command(e) => Some(e),
        }
    }
}

/// One way of obtaining read access to the watched file.
///
/// Strategies are idempotent and carry no state between invocations; the
/// escalator evaluates them fresh each time it is asked.
pub trait AccessStrategy {
    fn name(&self) -> &'static str;
    fn try_acquire(&self, path: &Path) -> Result<(), AcquireError>;
}

/// Strategy 1: tag the file with a custom extended attribute. Cheapest and
/// least invasive, tried first by policy.
pub struct XattrTag;

impl AccessStrategy for XattrTag {
    fn name(&self) -> &'static str {
        "xattr-tag"
    }

    fn try_acquire(&self, path: &Path) -> Result<(), AcquireError> {
        xattr::set(path, ACCESS_ATTR_NAME, ACCESS_ATTR_VALUE).map_err(AcquireError::Xattr)
    }
}

/// Strategy 2: add a read entry for the other class via `setfacl`.
pub struct AclReadEntry<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> AclReadEntry<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl AccessStrategy for AclReadEntry<'_> {
    fn name(&self) -> &'static str {
        "acl-read-entry"
    }

    fn try_acquire(&self, path: &Path) -> Result<(), AcquireError> {
        let command = format!("setfacl -m o::r {}", path.display());
        self.runner.run(&command).map_err(AcquireError::Command)
    }
}

/// Strategy 3: last resort, elevated permission-bits change.
pub struct ChmodFallback<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> ChmodFallback<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self { runner }
    }
}

impl AccessStrategy for ChmodFallback<'_> {
    fn name(&self) -> &'static str {
        "chmod-fallback"
    }

    fn try_acquire(&self, path: &Path) -> Result<(), AcquireError> {
        let command = format!("chmod 644 {}", path.display());
        self.runner.run(&command).map_err(AcquireError::Command)
    }
}

/// Walks an ordered list of strategies, stopping at the first success.
///
/// Exhaustion is reported but non-fatal: the monitor loop keeps running in a
/// degraded state and retries on its next refresh cycle.
pub struct Escalator<'a> {
    strategies: Vec<Box<dyn AccessStrategy + 'a>>,
}

impl<'a> Escalator<'a> {
    pub fn new(strategies: Vec<Box<dyn AccessStrategy + 'a>>) -> Self {
        Self { strategies }
    }

    /// The production chain: xattr tag, then ACL entry, then elevated chmod.
    pub fn with_default_strategies(runner: &'a dyn CommandRunner) -> Self {
        Self::new(vec![
            Box::new(XattrTag),
            Box::new(AclReadEntry::new(runner)),
            Box::new(ChmodFallback::new(runner)),
        ])
    }

    /// Try each strategy in order. Returns whether any succeeded.
    pub fn acquire(&self, path: &Path) -> bool {
        for strategy in &self.strategies {
            match strategy.try_acquire(path) {
                Ok(()) => {
                    tracing::debug!(
                        strategy = strategy.name(),
                        path = %path.display(),
                        "read access acquired"
                    );
                    return true;
                }
                Err(err) => {
                    tracing::warn!(
                        strategy = strategy.name(),
                        path = %path.display(),
                        error = %err,
                        "access strategy failed"
                    );
                }
            }
        }
        tracing::warn!(
            path = %path.display(),
            "all access strategies failed; monitoring continues without refreshed access"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::testing::RecordingRunner;
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::rc::Rc;

    struct Scripted {
        name: &'static str,
        succeed: bool,
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl AccessStrategy for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn try_acquire(&self, _path: &Path) -> Result<(), AcquireError> {
            self.log.borrow_mut().push(self.name);
            if self.succeed {
                Ok(())
            } else {
                Err(AcquireError::Xattr(std::io::Error::other("scripted")))
            }
        }
    }

    fn scripted(
        log: &Rc<RefCell<Vec<&'static str>>>,
        name: &'static str,
        succeed: bool,
    ) -> Box<dyn AccessStrategy> {
        Box::new(Scripted {
            name,
            succeed,
            log: log.clone(),
        })
    }

    #[test]
    fn test_stops_at_first_success() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let escalator = Escalator::new(vec![
            scripted(&log, "attribute", false),
            scripted(&log, "access-list", true),
            scripted(&log, "permission-bits", true),
        ]);

        assert!(escalator.acquire(Path::new("/sys/fake")));
        assert_eq!(*log.borrow(), vec!["attribute", "access-list"]);
    }

    #[test]
    fn test_first_strategy_success_skips_the_rest() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let escalator = Escalator::new(vec![
            scripted(&log, "attribute", true),
            scripted(&log, "access-list", false),
            scripted(&log, "permission-bits", false),
        ]);

        assert!(escalator.acquire(Path::new("/sys/fake")));
        assert_eq!(*log.borrow(), vec!["attribute"]);
    }

    #[test]
    fn test_exhaustion_tries_all_three_then_fails() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let escalator = Escalator::new(vec![
            scripted(&log, "attribute", false),
            scripted(&log, "access-list", false),
            scripted(&log, "permission-bits", false),
        ]);

        assert!(!escalator.acquire(Path::new("/sys/fake")));
        assert_eq!(
            *log.borrow(),
            vec!["attribute", "access-list", "permission-bits"]
        );
    }

    #[test]
    fn test_acquire_is_retryable_after_exhaustion() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let escalator = Escalator::new(vec![scripted(&log, "attribute", false)]);

        assert!(!escalator.acquire(Path::new("/sys/fake")));
        assert!(!escalator.acquire(Path::new("/sys/fake")));
        assert_eq!(log.borrow().len(), 2);
    }

    #[test]
    fn test_acl_entry_command_string() {
        let runner = RecordingRunner::succeeding();
        let strategy = AclReadEntry::new(&runner);

        strategy
            .try_acquire(Path::new("/sys/class/backlight/panel0-backlight/brightness"))
            .unwrap();
        assert_eq!(
            runner.recorded(),
            vec!["setfacl -m o::r /sys/class/backlight/panel0-backlight/brightness".to_string()]
        );
    }

    #[test]
    fn test_chmod_fallback_command_string() {
        let runner = RecordingRunner::succeeding();
        let strategy = ChmodFallback::new(&runner);

        strategy
            .try_acquire(Path::new("/sys/class/backlight/panel0-backlight/brightness"))
            .unwrap();
        assert_eq!(
            runner.recorded(),
            vec!["chmod 644 /sys/class/backlight/panel0-backlight/brightness".to_string()]
        );
    }

    #[test]
    fn test_default_chain_order_via_recording_runner() {
        // The two command-backed strategies fail (scripted), so the chain
        // must consult them in order after the in-process xattr attempt.
        let runner = RecordingRunner::failing();
        let escalator = Escalator::with_default_strategies(&runner);

        // A path that rejects xattr writes on any sane test host.
        let path = PathBuf::from("/proc/version");
        escalator.acquire(&path);

        assert_eq!(
            runner.recorded(),
            vec![
                "setfacl -m o::r /proc/version".to_string(),
                "chmod 644 /proc/version".to_string(),
            ]
        );
    }
}
