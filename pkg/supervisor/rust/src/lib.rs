// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervision of one long-lived worker process: launch from a validated
//! [`ProcessSpec`], capture its output to append-only log files, watch its
//! memory, and restart it with backoff until told to stop.

pub mod backoff;
pub mod env;
pub mod error;
pub mod log_sink;
pub mod monitor;
pub mod spec;
pub mod state;
pub mod supervisor;
pub mod worker;

pub use error::{ConfigError, LaunchError, LogSinkError};
pub use spec::{LogPaths, ProcessSpec};
pub use state::{ExitReason, Status, WorkerState};
pub use supervisor::{StatusUpdates, Supervisor, SupervisorHandle};
