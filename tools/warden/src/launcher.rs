use crate::errors::WardenError;
use crate::logging::append_run_log;
use crate::runtime::{Clock, ProcessRequest, ProcessRunner};
use serde_json::json;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn from_argv(argv: &[String]) -> Result<Self, WardenError> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| WardenError::Cli("no command given to supervise".to_string()))?;
        if program.trim().is_empty() {
            return Err(WardenError::Cli("command must not be empty".to_string()));
        }
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A running child. Not `Clone`: exactly one owner holds it until it is reaped.
#[derive(Debug, PartialEq, Eq)]
pub struct SupervisedProcess {
    pub handle: u64,
    pub pid: u32,
    pub started_at: SystemTime,
}

pub struct ProcessLauncher<'a> {
    runner: &'a dyn ProcessRunner,
    clock: &'a dyn Clock,
}

impl<'a> ProcessLauncher<'a> {
    pub fn new(runner: &'a dyn ProcessRunner, clock: &'a dyn Clock) -> Self {
        Self { runner, clock }
    }

    pub fn launch(&self, command: &CommandSpec) -> Result<SupervisedProcess, WardenError> {
        let spawned = self.runner.spawn(ProcessRequest {
            program: command.program.clone(),
            args: command.args.clone(),
        })?;
        append_run_log(
            "info",
            "supervisor.child.launched",
            json!({
                "command": command.display(),
                "pid": spawned.pid
            }),
        );
        Ok(SupervisedProcess {
            handle: spawned.handle,
            pid: spawned.pid,
            started_at: self.clock.now(),
        })
    }

    /// Non-blocking; `Some(code)` once the child has exited and been reaped.
    pub fn exit_status(&self, process: &SupervisedProcess) -> Result<Option<i32>, WardenError> {
        self.runner.try_wait(process.handle)
    }
}
