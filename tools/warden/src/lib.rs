pub mod config;
pub mod errors;
pub mod fsm;
pub mod launcher;
pub mod liveness;
pub mod logging;
pub mod restart;
pub mod runtime;
pub mod supervisor;
pub mod termination;

use clap::{error::ErrorKind, CommandFactory, Parser};
use config::{load_config, CliOverrides};
use errors::WardenError;
use liveness::HeartbeatFileGuard;
use logging::{append_run_log, install_run_log};
use runtime::ProductionRuntime;
use serde_json::json;
use supervisor::Supervisor;

#[derive(Debug, Clone, Parser)]
#[command(name = "warden")]
#[command(version)]
#[command(about = "Keep one command running: restart it on crash or heartbeat loss")]
pub struct Cli {
    /// TOML file with [heartbeat], [restart], [termination], [monitor] and [log] tables
    #[arg(long)]
    pub config: Option<std::path::PathBuf>,
    /// Seconds without a heartbeat write before the child counts as hung
    #[arg(long, allow_hyphen_values = true)]
    pub timeout: Option<String>,
    /// Seconds to wait after launch before the first liveness check
    #[arg(long, allow_hyphen_values = true)]
    pub initial_check_delay: Option<String>,
    #[arg(long)]
    pub heartbeat_file: Option<std::path::PathBuf>,
    /// Seconds between SIGTERM and SIGKILL
    #[arg(long, allow_hyphen_values = true)]
    pub grace_period: Option<String>,
    /// Restarts allowed after the first launch; -1 for no limit
    #[arg(long, allow_hyphen_values = true)]
    pub max_restarts: Option<String>,
    /// Backoff before restart n is factor * 2^n seconds
    #[arg(long, allow_hyphen_values = true)]
    pub backoff_factor: Option<String>,
    #[arg(long, default_value_t = false)]
    pub enable_heartbeat: bool,
    /// Seconds between exit-status and heartbeat checks
    #[arg(long, allow_hyphen_values = true)]
    pub poll_interval: Option<String>,
    /// Append structured events to this JSONL file
    #[arg(long)]
    pub log_file: Option<std::path::PathBuf>,
    #[arg(long)]
    pub log_level: Option<String>,
    /// Command to supervise, followed by its arguments
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

impl From<Cli> for CliOverrides {
    fn from(cli: Cli) -> Self {
        Self {
            config_path: cli.config,
            timeout: cli.timeout,
            initial_check_delay: cli.initial_check_delay,
            heartbeat_file: cli.heartbeat_file,
            grace_period: cli.grace_period,
            max_restarts: cli.max_restarts,
            backoff_factor: cli.backoff_factor,
            enable_heartbeat: cli.enable_heartbeat,
            poll_interval: cli.poll_interval,
            log_file: cli.log_file,
            log_level: cli.log_level,
            command: cli.command,
        }
    }
}

pub fn run() -> Result<i32, WardenError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let runtime = ProductionRuntime::new()?;
    run_with_runtime(&args, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    runtime: &ProductionRuntime,
) -> Result<i32, WardenError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(WardenError::Cli(error.to_string())),
        },
    };

    let loaded = load_config(&CliOverrides::from(cli), runtime.file_system.as_ref())?;
    let cfg = loaded.config;
    install_run_log(cfg.log_level, cfg.log_file.as_deref());

    for warning in &loaded.warnings {
        append_run_log(
            "warn",
            "config.invalid_value",
            json!({
                "option": warning.option,
                "value": warning.value,
                "default": warning.default
            }),
        );
    }
    append_run_log(
        "info",
        "supervisor.started",
        json!({
            "command": cfg.command.display(),
            "heartbeat_enabled": cfg.heartbeat_enabled,
            "heartbeat_file": cfg.heartbeat_file.display().to_string(),
            "timeout_secs": cfg.heartbeat_timeout.as_secs(),
            "initial_check_delay_secs": cfg.initial_check_delay.as_secs(),
            "grace_period_secs": cfg.grace_period.as_secs(),
            "poll_interval_secs": cfg.poll_interval.as_secs(),
            "max_restarts": cfg.restart.max_restarts.as_raw(),
            "backoff_factor": cfg.restart.backoff_factor
        }),
    );

    // Removed on every exit path out of supervision, including errors.
    let _heartbeat = HeartbeatFileGuard::new(
        runtime.file_system.as_ref(),
        cfg.heartbeat_file.clone(),
    );
    let summary = Supervisor::new(&cfg, runtime).run()?;
    Ok(summary.exit_code)
}

pub fn render_help() -> String {
    Cli::command().render_long_help().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn trailing_command_keeps_its_own_flags() {
        let cli = Cli::try_parse_from([
            "warden",
            "--max-restarts",
            "-1",
            "python3",
            "client.py",
            "--timeout",
            "3",
        ])
        .expect("parse");
        assert_eq!(cli.max_restarts.as_deref(), Some("-1"));
        assert_eq!(cli.timeout, None);
        assert_eq!(cli.command, vec!["python3", "client.py", "--timeout", "3"]);
    }

    #[test]
    fn missing_command_is_rejected() {
        let err = Cli::try_parse_from(["warden", "--enable-heartbeat"]).expect_err("must fail");
        assert_eq!(err.kind(), ErrorKind::MissingRequiredArgument);
    }

    #[test]
    fn help_lists_every_option() {
        let help = render_help();
        for option in [
            "--timeout",
            "--initial-check-delay",
            "--heartbeat-file",
            "--grace-period",
            "--max-restarts",
            "--backoff-factor",
            "--enable-heartbeat",
            "--poll-interval",
            "--config",
            "--log-file",
            "--log-level",
        ] {
            assert!(help.contains(option), "help is missing {option}");
        }
    }
}
