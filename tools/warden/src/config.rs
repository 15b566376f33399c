use crate::errors::WardenError;
use crate::launcher::CommandSpec;
use crate::logging::LogLevel;
use crate::restart::{MaxRestarts, RestartPolicy};
use crate::runtime::FileSystem;
use serde::Deserialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 20;
pub const DEFAULT_INITIAL_CHECK_DELAY_SECS: u64 = 0;
pub const DEFAULT_HEARTBEAT_FILE: &str = "heartbeat.txt";
pub const DEFAULT_GRACE_PERIOD_SECS: u64 = 5;
pub const DEFAULT_MAX_RESTARTS: i64 = -1;
pub const DEFAULT_BACKOFF_FACTOR: f64 = 1.0;
/// Coarse detection latency: the exit status and heartbeat are looked at once per tick.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

/// Raw option values as typed on the command line. Numbers stay strings here so a
/// bad value can fall back to its default instead of aborting the parse.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub config_path: Option<PathBuf>,
    pub timeout: Option<String>,
    pub initial_check_delay: Option<String>,
    pub heartbeat_file: Option<PathBuf>,
    pub grace_period: Option<String>,
    pub max_restarts: Option<String>,
    pub backoff_factor: Option<String>,
    pub enable_heartbeat: bool,
    pub poll_interval: Option<String>,
    pub log_file: Option<PathBuf>,
    pub log_level: Option<String>,
    pub command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SupervisorConfig {
    pub command: CommandSpec,
    pub heartbeat_enabled: bool,
    pub heartbeat_file: PathBuf,
    pub heartbeat_timeout: Duration,
    pub initial_check_delay: Duration,
    pub grace_period: Duration,
    pub poll_interval: Duration,
    pub restart: RestartPolicy,
    pub log_level: LogLevel,
    pub log_file: Option<PathBuf>,
}

impl SupervisorConfig {
    pub fn new(command: CommandSpec) -> Self {
        Self {
            command,
            heartbeat_enabled: false,
            heartbeat_file: PathBuf::from(DEFAULT_HEARTBEAT_FILE),
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            initial_check_delay: Duration::from_secs(DEFAULT_INITIAL_CHECK_DELAY_SECS),
            grace_period: Duration::from_secs(DEFAULT_GRACE_PERIOD_SECS),
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            restart: RestartPolicy {
                max_restarts: MaxRestarts::Unlimited,
                backoff_factor: DEFAULT_BACKOFF_FACTOR,
            },
            log_level: LogLevel::Info,
            log_file: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigWarning {
    pub option: &'static str,
    pub value: String,
    pub default: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadedConfig {
    pub config: SupervisorConfig,
    pub warnings: Vec<ConfigWarning>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
enum RawSetting {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl RawSetting {
    fn render(&self) -> String {
        match self {
            Self::Boolean(value) => value.to_string(),
            Self::Integer(value) => value.to_string(),
            Self::Float(value) => value.to_string(),
            Self::Text(value) => value.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialConfig {
    heartbeat: Option<PartialHeartbeatConfig>,
    restart: Option<PartialRestartConfig>,
    termination: Option<PartialTerminationConfig>,
    monitor: Option<PartialMonitorConfig>,
    log: Option<PartialLogConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialHeartbeatConfig {
    enabled: Option<RawSetting>,
    file: Option<PathBuf>,
    timeout: Option<RawSetting>,
    initial_check_delay: Option<RawSetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialRestartConfig {
    max_restarts: Option<RawSetting>,
    backoff_factor: Option<RawSetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialTerminationConfig {
    grace_period: Option<RawSetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialMonitorConfig {
    poll_interval: Option<RawSetting>,
}

#[derive(Debug, Clone, Deserialize, Default)]
struct PartialLogConfig {
    file: Option<PathBuf>,
    level: Option<String>,
}

/// Defaults, then the optional TOML file, then command-line flags.
pub fn load_config(
    overrides: &CliOverrides,
    fs: &dyn FileSystem,
) -> Result<LoadedConfig, WardenError> {
    let command = CommandSpec::from_argv(&overrides.command)?;

    let file = match &overrides.config_path {
        Some(path) => read_partial_config(fs, path)?,
        None => PartialConfig::default(),
    };
    let heartbeat = file.heartbeat.unwrap_or_default();
    let restart = file.restart.unwrap_or_default();
    let termination = file.termination.unwrap_or_default();
    let monitor = file.monitor.unwrap_or_default();
    let log = file.log.unwrap_or_default();

    let mut warnings = Vec::new();
    let mut cfg = SupervisorConfig::new(command);

    let timeout = layered(&overrides.timeout, &heartbeat.timeout);
    cfg.heartbeat_timeout = Duration::from_secs(parse_setting(
        "timeout",
        timeout.as_deref(),
        DEFAULT_HEARTBEAT_TIMEOUT_SECS,
        |v| *v > 0,
        &mut warnings,
    ));

    let initial = layered(&overrides.initial_check_delay, &heartbeat.initial_check_delay);
    cfg.initial_check_delay = Duration::from_secs(parse_setting(
        "initial-check-delay",
        initial.as_deref(),
        DEFAULT_INITIAL_CHECK_DELAY_SECS,
        |_| true,
        &mut warnings,
    ));

    if let Some(path) = overrides.heartbeat_file.clone().or(heartbeat.file) {
        if path.as_os_str().is_empty() {
            warnings.push(ConfigWarning {
                option: "heartbeat-file",
                value: String::new(),
                default: DEFAULT_HEARTBEAT_FILE.to_string(),
            });
        } else {
            cfg.heartbeat_file = path;
        }
    }

    let grace = layered(&overrides.grace_period, &termination.grace_period);
    cfg.grace_period = Duration::from_secs(parse_setting(
        "grace-period",
        grace.as_deref(),
        DEFAULT_GRACE_PERIOD_SECS,
        |_| true,
        &mut warnings,
    ));

    let max_restarts = layered(&overrides.max_restarts, &restart.max_restarts);
    let max_restarts = parse_setting(
        "max-restarts",
        max_restarts.as_deref(),
        DEFAULT_MAX_RESTARTS,
        |v| MaxRestarts::from_raw(*v).is_some(),
        &mut warnings,
    );
    cfg.restart.max_restarts =
        MaxRestarts::from_raw(max_restarts).unwrap_or(MaxRestarts::Unlimited);

    let backoff = layered(&overrides.backoff_factor, &restart.backoff_factor);
    cfg.restart.backoff_factor = parse_setting(
        "backoff-factor",
        backoff.as_deref(),
        DEFAULT_BACKOFF_FACTOR,
        |v: &f64| v.is_finite() && *v >= 0.0,
        &mut warnings,
    );

    cfg.heartbeat_enabled = overrides.enable_heartbeat
        || heartbeat
            .enabled
            .map(|raw| parse_flag("enable-heartbeat", &raw.render(), &mut warnings))
            .unwrap_or(false);

    let poll = layered(&overrides.poll_interval, &monitor.poll_interval);
    cfg.poll_interval = Duration::from_secs(parse_setting(
        "poll-interval",
        poll.as_deref(),
        DEFAULT_POLL_INTERVAL_SECS,
        |v| *v > 0,
        &mut warnings,
    ));

    cfg.log_file = overrides.log_file.clone().or(log.file);
    if let Some(level) = overrides.log_level.clone().or(log.level) {
        match LogLevel::parse(&level) {
            Some(parsed) => cfg.log_level = parsed,
            None => warnings.push(ConfigWarning {
                option: "log-level",
                value: level,
                default: LogLevel::Info.as_str().to_string(),
            }),
        }
    }

    Ok(LoadedConfig {
        config: cfg,
        warnings,
    })
}

fn read_partial_config(fs: &dyn FileSystem, path: &Path) -> Result<PartialConfig, WardenError> {
    let contents = fs
        .read_to_string(path)
        .map_err(|e| WardenError::ConfigParse(format!("cannot read {}: {e}", path.display())))?;
    toml::from_str(&contents)
        .map_err(|e| WardenError::ConfigParse(format!("{}: {e}", path.display())))
}

fn layered(cli: &Option<String>, file: &Option<RawSetting>) -> Option<String> {
    cli.clone().or_else(|| file.as_ref().map(RawSetting::render))
}

/// Parses `raw` or falls back to `default`, recording a warning for any value that
/// does not parse or fails `valid`.
fn parse_setting<T>(
    option: &'static str,
    raw: Option<&str>,
    default: T,
    valid: impl Fn(&T) -> bool,
    warnings: &mut Vec<ConfigWarning>,
) -> T
where
    T: FromStr + Display,
{
    let Some(raw) = raw else {
        return default;
    };
    match raw.trim().parse::<T>() {
        Ok(value) if valid(&value) => value,
        _ => {
            warnings.push(ConfigWarning {
                option,
                value: raw.to_string(),
                default: default.to_string(),
            });
            default
        }
    }
}

fn parse_flag(option: &'static str, raw: &str, warnings: &mut Vec<ConfigWarning>) -> bool {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => true,
        "false" | "0" | "no" | "off" => false,
        _ => {
            warnings.push(ConfigWarning {
                option,
                value: raw.to_string(),
                default: "false".to_string(),
            });
            false
        }
    }
}
