use crate::errors::WardenError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, FileSystem};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatStatus {
    Missing,
    Fresh { elapsed: Duration },
    Stale { elapsed: Duration },
}

impl HeartbeatStatus {
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

/// Judges liveness from the heartbeat file's modification time alone; the file's
/// content is never read.
pub struct LivenessMonitor<'a> {
    clock: &'a dyn Clock,
    file_system: &'a dyn FileSystem,
}

impl<'a> LivenessMonitor<'a> {
    pub fn new(clock: &'a dyn Clock, file_system: &'a dyn FileSystem) -> Self {
        Self { clock, file_system }
    }

    pub fn check(&self, path: &Path, timeout: Duration) -> Result<HeartbeatStatus, WardenError> {
        let Some(elapsed) = self.age(path)? else {
            append_run_log(
                "warn",
                "heartbeat.missing",
                json!({
                    "path": path.display().to_string(),
                    "timeout_secs": timeout.as_secs_f64()
                }),
            );
            return Ok(HeartbeatStatus::Missing);
        };

        if elapsed > timeout {
            append_run_log(
                "warn",
                "heartbeat.stale",
                json!({
                    "path": path.display().to_string(),
                    "elapsed_secs": elapsed.as_secs_f64(),
                    "timeout_secs": timeout.as_secs_f64()
                }),
            );
            return Ok(HeartbeatStatus::Stale { elapsed });
        }

        append_run_log(
            "debug",
            "heartbeat.fresh",
            json!({
                "path": path.display().to_string(),
                "elapsed_secs": elapsed.as_secs_f64()
            }),
        );
        Ok(HeartbeatStatus::Fresh { elapsed })
    }

    pub fn is_alive(&self, path: &Path, timeout: Duration) -> Result<bool, WardenError> {
        Ok(self.check(path, timeout)?.is_alive())
    }

    /// Time since the last write, `None` when the file is absent. A modification
    /// time ahead of the clock counts as zero.
    pub fn age(&self, path: &Path) -> Result<Option<Duration>, WardenError> {
        let Some(modified) = self.file_system.modified(path)? else {
            return Ok(None);
        };
        Ok(Some(
            self.clock
                .now()
                .duration_since(modified)
                .unwrap_or(Duration::ZERO),
        ))
    }
}

/// Deletes the heartbeat file when the supervisor's run scope ends.
pub struct HeartbeatFileGuard<'a> {
    file_system: &'a dyn FileSystem,
    path: PathBuf,
}

impl<'a> HeartbeatFileGuard<'a> {
    pub fn new(file_system: &'a dyn FileSystem, path: impl Into<PathBuf>) -> Self {
        Self {
            file_system,
            path: path.into(),
        }
    }
}

impl Drop for HeartbeatFileGuard<'_> {
    fn drop(&mut self) {
        if !self.file_system.exists(&self.path) {
            return;
        }
        match self.file_system.remove_file(&self.path) {
            Ok(()) => append_run_log(
                "info",
                "heartbeat.removed",
                json!({ "path": self.path.display().to_string() }),
            ),
            Err(error) => append_run_log(
                "warn",
                "heartbeat.remove_failed",
                json!({
                    "path": self.path.display().to_string(),
                    "error": error.to_string()
                }),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{FakeClock, FakeFileSystem, ProductionClock, ProductionFileSystem};
    use std::time::{SystemTime, UNIX_EPOCH};

    fn at(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn stale_after_timeout_and_fresh_within_it() {
        let clock = FakeClock::new(at(1_000));
        let fs = FakeFileSystem::default();
        fs.touch("hb.txt", at(1_000));
        let monitor = LivenessMonitor::new(&clock, &fs);
        let timeout = Duration::from_secs(5);

        clock.advance(Duration::from_secs(3));
        assert!(monitor.is_alive(Path::new("hb.txt"), timeout).expect("check"));

        clock.advance(Duration::from_secs(3));
        assert_eq!(
            monitor.check(Path::new("hb.txt"), timeout).expect("check"),
            HeartbeatStatus::Stale {
                elapsed: Duration::from_secs(6)
            }
        );
    }

    #[test]
    fn elapsed_equal_to_timeout_is_still_alive() {
        let clock = FakeClock::new(at(105));
        let fs = FakeFileSystem::default();
        fs.touch("hb.txt", at(100));
        let monitor = LivenessMonitor::new(&clock, &fs);

        assert!(monitor
            .is_alive(Path::new("hb.txt"), Duration::from_secs(5))
            .expect("check"));
    }

    #[test]
    fn missing_file_is_not_alive_regardless_of_timeout() {
        let clock = FakeClock::new(at(10));
        let fs = FakeFileSystem::default();
        let monitor = LivenessMonitor::new(&clock, &fs);

        for timeout in [1, 20, 86_400] {
            assert_eq!(
                monitor
                    .check(Path::new("absent.txt"), Duration::from_secs(timeout))
                    .expect("check"),
                HeartbeatStatus::Missing
            );
        }
    }

    #[test]
    fn future_modification_time_counts_as_just_written() {
        let clock = FakeClock::new(at(50));
        let fs = FakeFileSystem::default();
        fs.touch("hb.txt", at(60));
        let monitor = LivenessMonitor::new(&clock, &fs);

        assert_eq!(
            monitor
                .check(Path::new("hb.txt"), Duration::from_secs(1))
                .expect("check"),
            HeartbeatStatus::Fresh {
                elapsed: Duration::ZERO
            }
        );
    }

    #[test]
    fn metadata_failures_propagate() {
        let clock = FakeClock::default();
        let fs = FakeFileSystem::default();
        fs.set_fail_next(WardenError::Io("permission denied".to_string()));
        let monitor = LivenessMonitor::new(&clock, &fs);

        let err = monitor
            .is_alive(Path::new("hb.txt"), Duration::from_secs(5))
            .expect_err("must fail");
        assert!(matches!(err, WardenError::Io(message) if message.contains("permission")));
    }

    #[test]
    fn freshly_written_real_file_is_alive() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("heartbeat.txt");
        std::fs::write(&path, "1700000000.0").expect("write");
        let monitor = LivenessMonitor::new(&ProductionClock, &ProductionFileSystem);

        assert!(monitor
            .is_alive(&path, Duration::from_secs(20))
            .expect("check"));
        assert!(!monitor
            .is_alive(&dir.path().join("other.txt"), Duration::from_secs(20))
            .expect("check"));
    }

    #[test]
    fn guard_removes_the_file_once_on_drop() {
        let fs = FakeFileSystem::default();
        fs.touch("hb.txt", at(1));
        {
            let _guard = HeartbeatFileGuard::new(&fs, "hb.txt");
            assert!(fs.exists(Path::new("hb.txt")));
        }
        assert!(!fs.exists(Path::new("hb.txt")));
        assert_eq!(fs.removed(), vec![PathBuf::from("hb.txt")]);
    }

    #[test]
    fn guard_ignores_a_file_that_never_appeared() {
        let fs = FakeFileSystem::default();
        drop(HeartbeatFileGuard::new(&fs, "hb.txt"));
        assert!(fs.removed().is_empty());
    }
}
