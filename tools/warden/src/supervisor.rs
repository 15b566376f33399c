//! The supervision loop.
//!
//! One child at a time moves through [`SupervisorState`]: gate, optional backoff,
//! launch, optional initial delay, then monitoring ticks. Within a tick the exit
//! status is checked before the heartbeat, so a child that already exited is never
//! reported as a heartbeat failure. Every sleep is sliced so an operator interrupt is
//! seen within [`INTERRUPT_CHECK_INTERVAL`]; an interrupt always goes through the
//! termination protocol before the loop exits with 0.

use crate::config::SupervisorConfig;
use crate::errors::WardenError;
use crate::fsm::{FailureReason, SupervisorSnapshot, SupervisorState};
use crate::launcher::{ProcessLauncher, SupervisedProcess};
use crate::liveness::LivenessMonitor;
use crate::logging::append_run_log;
use crate::runtime::ProductionRuntime;
use crate::termination::{next_wake, TerminationController};
use serde_json::json;
use std::time::Duration;

/// Pause after an unexpected error so a persistent fault cannot spin.
pub const UNEXPECTED_ERROR_DELAY: Duration = Duration::from_secs(1);
pub const INTERRUPT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pause {
    Elapsed,
    Interrupted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tick {
    Healthy,
    Exited(i32),
    HeartbeatLost,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub exit_code: i32,
    pub restart_count: u32,
    pub launches: u32,
}

pub struct Supervisor<'a> {
    config: &'a SupervisorConfig,
    runtime: &'a ProductionRuntime,
    snapshot: SupervisorSnapshot,
    child: Option<SupervisedProcess>,
}

impl<'a> Supervisor<'a> {
    pub fn new(config: &'a SupervisorConfig, runtime: &'a ProductionRuntime) -> Self {
        Self {
            config,
            runtime,
            snapshot: SupervisorSnapshot::default(),
            child: None,
        }
    }

    pub fn run(mut self) -> Result<RunSummary, WardenError> {
        loop {
            if let Some(exit_code) = self.snapshot.exit_code() {
                let summary = RunSummary {
                    exit_code,
                    restart_count: self.snapshot.restart_count,
                    launches: self.snapshot.launches,
                };
                append_run_log(
                    "info",
                    "supervisor.exited",
                    json!({
                        "exit_code": summary.exit_code,
                        "restart_count": summary.restart_count,
                        "launches": summary.launches
                    }),
                );
                return Ok(summary);
            }

            let from = self.snapshot.state;
            let next = self.step();
            if let Err(error) = self.snapshot.transition(next) {
                self.terminate_child();
                return Err(error);
            }
            if from != next {
                append_run_log(
                    "debug",
                    "supervisor.state.changed",
                    json!({
                        "from": from.as_str(),
                        "to": next.as_str(),
                        "restart_count": self.snapshot.restart_count
                    }),
                );
            }
        }
    }

    fn step(&mut self) -> SupervisorState {
        match self.snapshot.state {
            SupervisorState::Idle => self.on_idle(),
            SupervisorState::BackoffWait => self.on_backoff(),
            SupervisorState::Launching => self.on_launch(),
            SupervisorState::InitialDelay => self.on_initial_delay(),
            SupervisorState::Monitoring => self.on_monitor_tick(),
            SupervisorState::Terminating => self.on_terminating(),
            SupervisorState::Exited(code) => SupervisorState::Exited(code),
        }
    }

    fn on_idle(&mut self) -> SupervisorState {
        if self.runtime.interrupts.interrupted() {
            self.request_shutdown();
            return SupervisorState::Exited(0);
        }
        self.gate()
    }

    fn on_backoff(&mut self) -> SupervisorState {
        // A shutdown that arrived while the child was being terminated wins over the gate.
        if self.runtime.interrupts.interrupted() {
            self.request_shutdown();
            return SupervisorState::Exited(0);
        }
        if matches!(self.snapshot.last_failure, Some(FailureReason::Unexpected(_)))
            && self.pause(UNEXPECTED_ERROR_DELAY) == Pause::Interrupted
        {
            self.request_shutdown();
            return SupervisorState::Exited(0);
        }

        let gate = self.gate();
        if gate != SupervisorState::Launching {
            return gate;
        }

        let delay = self.config.restart.next_delay(self.snapshot.restart_count);
        append_run_log(
            "info",
            "supervisor.backoff",
            json!({
                "restart_count": self.snapshot.restart_count,
                "delay_secs": delay.as_secs_f64(),
                "backoff_factor": self.config.restart.backoff_factor
            }),
        );
        if self.pause(delay) == Pause::Interrupted {
            self.request_shutdown();
            return SupervisorState::Exited(0);
        }
        SupervisorState::Launching
    }

    fn gate(&self) -> SupervisorState {
        if self.config.restart.should_restart(self.snapshot.restart_count) {
            return SupervisorState::Launching;
        }
        append_run_log(
            "error",
            "supervisor.restart_budget_exhausted",
            json!({
                "restart_count": self.snapshot.restart_count,
                "max_restarts": self.config.restart.max_restarts.as_raw(),
                "last_failure": self.snapshot.last_failure.as_ref().map(FailureReason::as_str)
            }),
        );
        SupervisorState::Exited(1)
    }

    fn on_launch(&mut self) -> SupervisorState {
        let launcher = ProcessLauncher::new(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
        );
        match launcher.launch(&self.config.command) {
            Ok(process) => {
                self.snapshot.record_launch();
                self.child = Some(process);
                if self.config.heartbeat_enabled {
                    self.log_heartbeat_status();
                }
                if self.config.initial_check_delay > Duration::ZERO {
                    SupervisorState::InitialDelay
                } else {
                    SupervisorState::Monitoring
                }
            }
            Err(error) => {
                self.record_unexpected("launch", &error);
                SupervisorState::BackoffWait
            }
        }
    }

    fn on_initial_delay(&mut self) -> SupervisorState {
        append_run_log(
            "info",
            "supervisor.initial_delay",
            json!({ "delay_secs": self.config.initial_check_delay.as_secs_f64() }),
        );
        if self.pause(self.config.initial_check_delay) == Pause::Interrupted {
            self.request_shutdown();
            return SupervisorState::Terminating;
        }
        SupervisorState::Monitoring
    }

    fn on_monitor_tick(&mut self) -> SupervisorState {
        if self.pause(self.config.poll_interval) == Pause::Interrupted {
            self.request_shutdown();
            return SupervisorState::Terminating;
        }

        let tick = match self.child.as_ref() {
            Some(process) => self.poll(process),
            None => Err(WardenError::Process("no child to monitor".to_string())),
        };

        match tick {
            Ok(Tick::Healthy) => SupervisorState::Monitoring,
            Ok(Tick::Exited(exit_code)) => {
                let process = self.child.take();
                let pid = process.as_ref().map(|p| p.pid);
                let uptime_secs = process
                    .as_ref()
                    .and_then(|p| self.runtime.clock.now().duration_since(p.started_at).ok())
                    .map(|d| d.as_secs_f64());
                if exit_code == 0 {
                    append_run_log(
                        "info",
                        "supervisor.child.exited",
                        json!({ "pid": pid, "exit_code": 0, "uptime_secs": uptime_secs }),
                    );
                    return SupervisorState::Exited(0);
                }
                append_run_log(
                    "warn",
                    "supervisor.child.exited",
                    json!({
                        "pid": pid,
                        "exit_code": exit_code,
                        "uptime_secs": uptime_secs,
                        "restart_count": self.snapshot.restart_count.saturating_add(1)
                    }),
                );
                self.snapshot.record_failure(FailureReason::NonZeroExit(exit_code));
                SupervisorState::BackoffWait
            }
            Ok(Tick::HeartbeatLost) => {
                append_run_log(
                    "warn",
                    "supervisor.heartbeat_lost",
                    json!({
                        "pid": self.child.as_ref().map(|p| p.pid),
                        "path": self.config.heartbeat_file.display().to_string(),
                        "timeout_secs": self.config.heartbeat_timeout.as_secs_f64(),
                        "restart_count": self.snapshot.restart_count.saturating_add(1)
                    }),
                );
                self.snapshot.record_failure(FailureReason::HeartbeatLost);
                SupervisorState::Terminating
            }
            Err(error) => {
                self.record_unexpected("monitor", &error);
                SupervisorState::Terminating
            }
        }
    }

    fn poll(&self, process: &SupervisedProcess) -> Result<Tick, WardenError> {
        let launcher = ProcessLauncher::new(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
        );
        if let Some(exit_code) = launcher.exit_status(process)? {
            return Ok(Tick::Exited(exit_code));
        }
        if self.config.heartbeat_enabled {
            let monitor = LivenessMonitor::new(
                self.runtime.clock.as_ref(),
                self.runtime.file_system.as_ref(),
            );
            if !monitor.is_alive(&self.config.heartbeat_file, self.config.heartbeat_timeout)? {
                return Ok(Tick::HeartbeatLost);
            }
        }
        Ok(Tick::Healthy)
    }

    fn on_terminating(&mut self) -> SupervisorState {
        self.terminate_child();
        if self.snapshot.shutdown_requested {
            SupervisorState::Exited(0)
        } else {
            SupervisorState::BackoffWait
        }
    }

    fn terminate_child(&mut self) {
        let Some(process) = self.child.take() else {
            return;
        };
        let pid = process.pid;
        let controller = TerminationController::new(
            self.runtime.process_runner.as_ref(),
            self.runtime.clock.as_ref(),
        );
        match controller.terminate(process, self.config.grace_period) {
            Ok(report) => append_run_log(
                "info",
                "supervisor.child.terminated",
                json!({
                    "pid": pid,
                    "outcome": report.outcome().as_str(),
                    "exit_code": report.exit_code
                }),
            ),
            Err(error) => append_run_log(
                "error",
                "supervisor.child.termination_failed",
                json!({ "pid": pid, "error": error.to_string() }),
            ),
        }
    }

    fn record_unexpected(&mut self, stage: &str, error: &WardenError) {
        append_run_log(
            "error",
            "supervisor.unexpected_error",
            json!({
                "stage": stage,
                "pid": self.child.as_ref().map(|p| p.pid),
                "error": error.to_string(),
                "restart_count": self.snapshot.restart_count.saturating_add(1)
            }),
        );
        self.snapshot.record_failure(FailureReason::Unexpected(error.to_string()));
    }

    fn request_shutdown(&mut self) {
        if self.snapshot.shutdown_requested {
            return;
        }
        self.snapshot.shutdown_requested = true;
        append_run_log(
            "info",
            "supervisor.shutdown_requested",
            json!({
                "state": self.snapshot.state.as_str(),
                "pid": self.child.as_ref().map(|p| p.pid)
            }),
        );
    }

    fn log_heartbeat_status(&self) {
        let monitor = LivenessMonitor::new(
            self.runtime.clock.as_ref(),
            self.runtime.file_system.as_ref(),
        );
        match monitor.age(&self.config.heartbeat_file) {
            Ok(age) => append_run_log(
                "info",
                "heartbeat.status",
                json!({
                    "path": self.config.heartbeat_file.display().to_string(),
                    "exists": age.is_some(),
                    "age_secs": age.map(|d| d.as_secs_f64()),
                    "timeout_secs": self.config.heartbeat_timeout.as_secs_f64(),
                    "initial_check_delay_secs": self.config.initial_check_delay.as_secs_f64()
                }),
            ),
            Err(error) => append_run_log(
                "warn",
                "heartbeat.status_unavailable",
                json!({
                    "path": self.config.heartbeat_file.display().to_string(),
                    "error": error.to_string()
                }),
            ),
        }
    }

    fn pause(&self, duration: Duration) -> Pause {
        let clock = self.runtime.clock.as_ref();
        let deadline = clock.now().checked_add(duration);
        loop {
            if self.runtime.interrupts.interrupted() {
                return Pause::Interrupted;
            }
            let now = clock.now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Pause::Elapsed;
            }
            let wake = next_wake(now, deadline, INTERRUPT_CHECK_INTERVAL);
            if let Err(error) = clock.sleep_until(wake) {
                append_run_log(
                    "warn",
                    "supervisor.sleep_failed",
                    json!({ "error": error.to_string() }),
                );
                return Pause::Elapsed;
            }
        }
    }
}
