// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use thiserror::Error;

/// Reasons a spec file is rejected. Always fatal: nothing is launched.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("process name must not be empty")]
    EmptyName,
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("command not found: {0}")]
    CommandNotFound(String),
    #[error("not an executable file: {}", .0.display())]
    NotExecutable(PathBuf),
    #[error("script not found: {}", .0.display())]
    ScriptNotFound(PathBuf),
    #[error("working directory does not exist: {}", .0.display())]
    WorkingDirMissing(PathBuf),
    #[error("environment file {}: {reason}", path.display())]
    EnvironmentFile { path: PathBuf, reason: String },
    #[error("instances must be at least 1 (got {0})")]
    InvalidInstances(u32),
    #[error("invalid max_memory {value:?}: {reason}")]
    InvalidMemory { value: String, reason: String },
    #[error("{field} must be a positive number of seconds (got {value})")]
    InvalidDuration { field: &'static str, value: f64 },
    #[error("invalid log_date_format {format:?}: {reason}")]
    InvalidDateFormat { format: String, reason: String },
    #[error("log path is not writable: {}", .0.display())]
    LogPathNotWritable(PathBuf),
}

/// A log destination could not be opened. Fatal for one instance only.
#[derive(Debug, Error)]
#[error("opening log file {}: {source}", path.display())]
pub struct LogSinkError {
    pub path: PathBuf,
    pub source: std::io::Error,
}

/// The worker could not be spawned. Handled like an exit with no uptime.
#[derive(Debug, Error)]
#[error("failed to spawn {}: {source}", program.display())]
pub struct LaunchError {
    pub program: PathBuf,
    pub source: std::io::Error,
}
