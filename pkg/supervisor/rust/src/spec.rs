// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::env;
use crate::error::ConfigError;
use log::debug;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOG_DATE_FORMAT: &str =
    "[year]-[month]-[day] [hour]:[minute]:[second] [offset_hour sign:mandatory]:[offset_minute]";

const BYTES_PER_KB: u64 = 1024;
const BYTES_PER_MB: u64 = 1024 * BYTES_PER_KB;
const BYTES_PER_GB: u64 = 1024 * BYTES_PER_MB;
const BYTES_PER_TB: u64 = 1024 * BYTES_PER_GB;

fn default_true() -> bool {
    true
}

fn default_instances() -> u32 {
    1
}

fn default_date_format() -> String {
    DEFAULT_LOG_DATE_FORMAT.to_string()
}

fn default_restart_delay() -> f64 {
    1.0
}

fn default_restart_delay_max() -> f64 {
    30.0
}

fn default_stable_after() -> f64 {
    30.0
}

fn default_kill_timeout() -> f64 {
    5.0
}

fn default_memory_poll_interval() -> f64 {
    5.0
}

/// `max_memory` accepts plain bytes or a suffixed size such as `1G`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum MemorySize {
    Bytes(u64),
    Text(String),
}

/// The spec file as written. Turned into a [`ProcessSpec`] by validation.
#[derive(Debug, Deserialize)]
struct RawSpec {
    name: Option<String>,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    interpreter: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    environment_file: Option<String>,
    working_dir: Option<String>,
    #[serde(default = "default_true")]
    auto_restart: bool,
    max_memory: Option<MemorySize>,
    stdout_log: Option<String>,
    stderr_log: Option<String>,
    #[serde(default)]
    merge_logs: bool,
    #[serde(default = "default_date_format")]
    log_date_format: String,
    #[serde(default = "default_true")]
    timestamps: bool,
    #[serde(default = "default_instances")]
    instances: u32,
    #[serde(default = "default_restart_delay")]
    restart_delay_sec: f64,
    #[serde(default = "default_restart_delay_max")]
    restart_delay_max_sec: f64,
    #[serde(default = "default_stable_after")]
    stable_after_sec: f64,
    #[serde(default = "default_kill_timeout")]
    kill_timeout_sec: f64,
    #[serde(default = "default_memory_poll_interval")]
    memory_poll_interval_sec: f64,
}

/// Where the worker's output goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogPaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl LogPaths {
    /// Paths for one instance slot. A single instance uses the configured
    /// paths; otherwise `out.log` becomes `out-<instance>.log`.
    pub fn for_instance(&self, instance: u32, instances: u32) -> LogPaths {
        if instances <= 1 {
            return self.clone();
        }
        LogPaths {
            stdout: with_instance_suffix(&self.stdout, instance),
            stderr: with_instance_suffix(&self.stderr, instance),
        }
    }
}

fn with_instance_suffix(path: &Path, instance: u32) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let file_name = match path.extension() {
        Some(ext) => format!("{stem}-{instance}.{}", ext.to_string_lossy()),
        None => format!("{stem}-{instance}"),
    };
    path.with_file_name(file_name)
}

/// Backoff applied between an exit and the next launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartDelays {
    pub base: Duration,
    pub max: Duration,
    /// A run at least this long resets the backoff to `base`.
    pub stable_after: Duration,
}

/// Validated, immutable description of how to launch and supervise the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSpec {
    pub name: String,
    /// Resolved executable (the interpreter when one is configured).
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Applied over the supervisor's own environment at launch.
    pub environment: BTreeMap<String, String>,
    pub auto_restart: bool,
    pub max_memory_bytes: Option<u64>,
    pub log_paths: LogPaths,
    pub merge_logs: bool,
    pub log_date_format: String,
    pub timestamps: bool,
    pub instances: u32,
    pub restart: RestartDelays,
    pub kill_timeout: Duration,
    pub memory_poll_interval: Duration,
}

impl ProcessSpec {
    /// Read and validate a YAML spec file.
    ///
    /// Relative paths inside the file resolve against the file's directory
    /// (working directory, environment file) or against the working directory
    /// (command, script, log files). Only existence checks touch the
    /// filesystem, so loading the same file twice yields equal specs.
    pub fn load(path: &Path) -> Result<ProcessSpec, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let raw: RawSpec = serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        let spec_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        let spec_dir = std::path::absolute(spec_dir).map_err(|source| ConfigError::Read {
            path: spec_dir.to_path_buf(),
            source,
        })?;
        let fallback_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();

        raw.validate(fallback_name, &spec_dir)
    }

    /// Human-readable launch line, used by `validate` and in log messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl RawSpec {
    fn validate(self, fallback_name: &str, spec_dir: &Path) -> Result<ProcessSpec, ConfigError> {
        let name = match self.name {
            Some(name) => name.trim().to_string(),
            None => fallback_name.to_string(),
        };
        if name.is_empty() {
            return Err(ConfigError::EmptyName);
        }

        let working_dir = match self.working_dir {
            Some(ref dir) => spec_dir.join(dir),
            None => spec_dir.to_path_buf(),
        };
        if !working_dir.is_dir() {
            return Err(ConfigError::WorkingDirMissing(working_dir));
        }

        let file_env = match self.environment_file {
            Some(ref file) => {
                let file = spec_dir.join(file);
                env::read_environment_file(&file).map_err(|e| ConfigError::EnvironmentFile {
                    path: file.clone(),
                    reason: format!("{e:#}"),
                })?
            }
            None => BTreeMap::new(),
        };
        let environment = env::layer(file_env, &self.env);

        // The worker's PATH decides where bare command names are found.
        let search_path = environment
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"))
            .unwrap_or_default();

        let (program, args) = match self.interpreter {
            Some(ref interpreter) => {
                let program = resolve_executable(interpreter, &working_dir, &search_path)?;
                let script = working_dir.join(&self.command);
                if !script.is_file() {
                    return Err(ConfigError::ScriptNotFound(script));
                }
                let mut args = vec![script.to_string_lossy().into_owned()];
                args.extend(self.args);
                (program, args)
            }
            None => (
                resolve_executable(&self.command, &working_dir, &search_path)?,
                self.args,
            ),
        };

        if self.instances == 0 {
            return Err(ConfigError::InvalidInstances(self.instances));
        }

        let max_memory_bytes = match self.max_memory {
            Some(MemorySize::Bytes(0)) => {
                return Err(ConfigError::InvalidMemory {
                    value: "0".to_string(),
                    reason: "must be positive".to_string(),
                });
            }
            Some(MemorySize::Bytes(bytes)) => Some(bytes),
            Some(MemorySize::Text(text)) => Some(parse_memory(&text)?),
            None => None,
        };

        let base = positive_secs("restart_delay_sec", self.restart_delay_sec)?;
        let mut max = positive_secs("restart_delay_max_sec", self.restart_delay_max_sec)?;
        if max < base {
            debug!("[{name}] restart_delay_max_sec below restart_delay_sec, using the base delay");
            max = base;
        }
        let restart = RestartDelays {
            base,
            max,
            stable_after: positive_secs("stable_after_sec", self.stable_after_sec)?,
        };
        let kill_timeout = positive_secs("kill_timeout_sec", self.kill_timeout_sec)?;
        let memory_poll_interval =
            positive_secs("memory_poll_interval_sec", self.memory_poll_interval_sec)?;

        time::format_description::parse_owned::<2>(&self.log_date_format).map_err(|e| {
            ConfigError::InvalidDateFormat {
                format: self.log_date_format.clone(),
                reason: e.to_string(),
            }
        })?;

        let stdout_log = self
            .stdout_log
            .unwrap_or_else(|| format!("logs/{name}-out.log"));
        let stderr_log = self
            .stderr_log
            .unwrap_or_else(|| format!("logs/{name}-error.log"));
        let log_paths = LogPaths {
            stdout: working_dir.join(stdout_log),
            stderr: working_dir.join(stderr_log),
        };
        check_writable(&log_paths.stdout)?;
        if !self.merge_logs {
            check_writable(&log_paths.stderr)?;
        }

        Ok(ProcessSpec {
            name,
            program,
            args,
            working_dir,
            environment,
            auto_restart: self.auto_restart,
            max_memory_bytes,
            log_paths,
            merge_logs: self.merge_logs,
            log_date_format: self.log_date_format,
            timestamps: self.timestamps,
            instances: self.instances,
            restart,
            kill_timeout,
            memory_poll_interval,
        })
    }
}

/// Parse a memory size. Examples: "1G" -> 1073741824, "256M", "512k", "4096".
pub fn parse_memory(text: &str) -> Result<u64, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidMemory {
        value: text.to_string(),
        reason,
    };

    let trimmed = text.trim();
    let (digits, multiplier) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], BYTES_PER_KB),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], BYTES_PER_MB),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], BYTES_PER_GB),
        Some('t' | 'T') => (&trimmed[..trimmed.len() - 1], BYTES_PER_TB),
        Some(_) => (trimmed, 1),
        None => return Err(invalid("empty value".to_string())),
    };
    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|e| invalid(format!("{e}")))?;
    let bytes = value
        .checked_mul(multiplier)
        .ok_or_else(|| invalid("too large".to_string()))?;
    if bytes == 0 {
        return Err(invalid("must be positive".to_string()));
    }
    Ok(bytes)
}

fn positive_secs(field: &'static str, value: f64) -> Result<Duration, ConfigError> {
    if !value.is_finite() || value <= 0.0 {
        return Err(ConfigError::InvalidDuration { field, value });
    }
    Duration::try_from_secs_f64(value).map_err(|_| ConfigError::InvalidDuration { field, value })
}

fn resolve_executable(
    command: &str,
    working_dir: &Path,
    search_path: &OsString,
) -> Result<PathBuf, ConfigError> {
    if command.trim().is_empty() {
        return Err(ConfigError::EmptyCommand);
    }
    if command.contains('/') {
        let path = working_dir.join(command);
        if is_executable(&path) {
            return Ok(path);
        }
        if path.exists() {
            return Err(ConfigError::NotExecutable(path));
        }
        return Err(ConfigError::CommandNotFound(command.to_string()));
    }
    std::env::split_paths(search_path)
        .map(|dir| working_dir.join(dir).join(command))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| ConfigError::CommandNotFound(command.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// A log file is writable if it is a file this process may write, or if its
/// nearest existing ancestor is a directory this process may create it in.
fn check_writable(path: &Path) -> Result<(), ConfigError> {
    let not_writable = || ConfigError::LogPathNotWritable(path.to_path_buf());
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.is_file() && can_write(path, &meta) {
            return Ok(());
        }
        return Err(not_writable());
    }
    let ancestor = path
        .ancestors()
        .skip(1)
        .find(|p| p.exists())
        .ok_or_else(not_writable)?;
    match std::fs::metadata(ancestor) {
        Ok(meta) if meta.is_dir() && can_write(ancestor, &meta) => Ok(()),
        _ => Err(not_writable()),
    }
}

#[cfg(unix)]
fn can_write(path: &Path, _meta: &std::fs::Metadata) -> bool {
    use nix::unistd::{AccessFlags, access};
    access(path, AccessFlags::W_OK).is_ok()
}

#[cfg(not(unix))]
fn can_write(_path: &Path, meta: &std::fs::Metadata) -> bool {
    !meta.permissions().readonly()
}
