use crate::errors::WardenError;
use crate::launcher::SupervisedProcess;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessRunner, ProcessSignal};
use serde_json::json;
use std::time::{Duration, SystemTime};

/// How often the exit status is polled while waiting out the grace period.
pub const TERMINATION_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationState {
    Running,
    SignalSent,
    GracefullyExited,
    GracePeriodExpired,
    ForceKilled,
    /// Already exited before any signal was sent.
    Reaped,
}

impl TerminationState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::SignalSent => "signal_sent",
            Self::GracefullyExited => "gracefully_exited",
            Self::GracePeriodExpired => "grace_period_expired",
            Self::ForceKilled => "force_killed",
            Self::Reaped => "reaped",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminationReport {
    pub trail: Vec<TerminationState>,
    pub exit_code: i32,
}

impl TerminationReport {
    pub fn outcome(&self) -> TerminationState {
        self.trail
            .last()
            .copied()
            .unwrap_or(TerminationState::Running)
    }
}

pub struct TerminationController<'a> {
    runner: &'a dyn ProcessRunner,
    clock: &'a dyn Clock,
}

impl<'a> TerminationController<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, clock: &'a dyn Clock) -> Self {
        Self { runner, clock }
    }

    /// SIGTERM, wait up to `grace_period`, then SIGKILL and wait for the exit without
    /// a timeout. Consumes the process: on `Ok` it has been reaped.
    pub fn terminate(
        &self,
        process: SupervisedProcess,
        grace_period: Duration,
    ) -> Result<TerminationReport, WardenError> {
        let mut trail = vec![TerminationState::Running];

        if let Some(exit_code) = self.runner.try_wait(process.handle)? {
            trail.push(TerminationState::Reaped);
            append_run_log(
                "info",
                "termination.already_exited",
                json!({ "pid": process.pid, "exit_code": exit_code }),
            );
            return Ok(TerminationReport { trail, exit_code });
        }

        match self.runner.signal(process.handle, ProcessSignal::Terminate) {
            Ok(()) => {
                trail.push(TerminationState::SignalSent);
                append_run_log(
                    "info",
                    "termination.signal_sent",
                    json!({
                        "pid": process.pid,
                        "signal": ProcessSignal::Terminate.as_str(),
                        "grace_period_secs": grace_period.as_secs_f64()
                    }),
                );
                if let Some(exit_code) = self.wait_until(&process, grace_period)? {
                    trail.push(TerminationState::GracefullyExited);
                    append_run_log(
                        "info",
                        "termination.exited_gracefully",
                        json!({ "pid": process.pid, "exit_code": exit_code }),
                    );
                    return Ok(TerminationReport { trail, exit_code });
                }
                trail.push(TerminationState::GracePeriodExpired);
                append_run_log(
                    "warn",
                    "termination.grace_period_expired",
                    json!({
                        "pid": process.pid,
                        "grace_period_secs": grace_period.as_secs_f64()
                    }),
                );
            }
            Err(error) => append_run_log(
                "warn",
                "termination.signal_failed",
                json!({
                    "pid": process.pid,
                    "signal": ProcessSignal::Terminate.as_str(),
                    "error": error.to_string()
                }),
            ),
        }

        self.runner.signal(process.handle, ProcessSignal::Kill)?;
        append_run_log(
            "warn",
            "termination.signal_sent",
            json!({ "pid": process.pid, "signal": ProcessSignal::Kill.as_str() }),
        );
        let exit_code = self.runner.wait(process.handle)?;
        trail.push(TerminationState::ForceKilled);
        append_run_log(
            "info",
            "termination.force_killed",
            json!({ "pid": process.pid, "exit_code": exit_code }),
        );
        Ok(TerminationReport { trail, exit_code })
    }

    fn wait_until(
        &self,
        process: &SupervisedProcess,
        grace_period: Duration,
    ) -> Result<Option<i32>, WardenError> {
        let start = self.clock.now();
        let deadline = start.checked_add(grace_period);
        loop {
            if let Some(exit_code) = self.runner.try_wait(process.handle)? {
                return Ok(Some(exit_code));
            }
            let now = self.clock.now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Ok(None);
            }
            self.clock
                .sleep_until(next_wake(now, deadline, TERMINATION_POLL_INTERVAL))?;
        }
    }
}

pub(crate) fn next_wake(
    now: SystemTime,
    deadline: Option<SystemTime>,
    step: Duration,
) -> SystemTime {
    let stepped = now.checked_add(step).unwrap_or(now);
    match deadline {
        Some(deadline) if deadline < stepped => deadline,
        _ => stepped,
    }
}
