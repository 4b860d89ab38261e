// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    /// Supervisor created, nothing launched yet.
    Idle,
    /// Spawn in progress.
    Starting,
    /// Child process is alive.
    Running,
    /// Termination requested, waiting for the child to be reaped.
    Stopping,
    /// Child reaped (or never started); a restart may follow.
    Exited,
    /// Terminal: no further launch will happen.
    Stopped,
}

impl WorkerState {
    pub fn is_alive(self) -> bool {
        matches!(self, WorkerState::Running | WorkerState::Stopping)
    }

    pub(crate) fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Idle, Starting)
                | (Idle, Stopped)
                | (Starting, Running)
                | (Starting, Exited)
                | (Running, Stopping)
                | (Running, Exited)
                | (Stopping, Exited)
                | (Exited, Starting)
                | (Exited, Stopped)
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerState::Idle => write!(f, "idle"),
            WorkerState::Starting => write!(f, "starting"),
            WorkerState::Running => write!(f, "running"),
            WorkerState::Stopping => write!(f, "stopping"),
            WorkerState::Exited => write!(f, "exited"),
            WorkerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Why the last run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ExitReason {
    Code { code: i32 },
    Signal { signal: i32 },
    LaunchFailed { error: String },
    MemoryCeiling { rss: u64, limit: u64 },
    StopRequested,
    LogDestination { error: String },
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::Code { code } => write!(f, "exit code {code}"),
            ExitReason::Signal { signal } => write!(f, "signal {signal}"),
            ExitReason::LaunchFailed { error } => write!(f, "launch failed: {error}"),
            ExitReason::MemoryCeiling { rss, limit } => {
                write!(f, "memory ceiling breached ({rss} > {limit} bytes)")
            }
            ExitReason::StopRequested => write!(f, "stop requested"),
            ExitReason::LogDestination { error } => write!(f, "log destination failed: {error}"),
        }
    }
}

/// Point-in-time view of one supervised instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub instance: u32,
    pub state: WorkerState,
    pub restart_count: u32,
    pub pid: Option<u32>,
    /// Time since the current run started; `None` when nothing is running.
    pub uptime: Option<Duration>,
    pub last_exit: Option<ExitReason>,
}
