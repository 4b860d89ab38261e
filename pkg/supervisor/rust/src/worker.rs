// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::error::LaunchError;
use crate::spec::ProcessSpec;
use crate::state::ExitReason;
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::time::timeout;

const SIGKILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of one launched worker. Log capture and memory sampling carry
/// this for attribution; it grants no control over the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerTag {
    pub name: Arc<str>,
    pub instance: u32,
    pub pid: Option<u32>,
}

impl WorkerTag {
    pub fn new(name: &str, instance: u32) -> Self {
        Self {
            name: Arc::from(name),
            instance,
            pid: None,
        }
    }
}

impl fmt::Display for WorkerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.instance)
    }
}

/// One launched worker process, owned by the supervisor's driving loop.
///
/// The child leads its own process group so that signals reach everything
/// it forked (a headless browser, typically).
pub struct WorkerHandle {
    tag: WorkerTag,
    child: Child,
    started_at: Instant,
    restart_count: u32,
}

impl WorkerHandle {
    pub fn spawn(
        spec: &ProcessSpec,
        tag: WorkerTag,
        restart_count: u32,
    ) -> Result<WorkerHandle, LaunchError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(&spec.environment)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| LaunchError {
            program: spec.program.clone(),
            source,
        })?;
        let tag = WorkerTag {
            pid: child.id(),
            ..tag
        };
        info!(
            "[{tag}] spawned (pid={}, restarts={restart_count}, cmd={})",
            tag.pid.unwrap_or(0),
            spec.command_line()
        );
        Ok(WorkerHandle {
            tag,
            child,
            started_at: Instant::now(),
            restart_count,
        })
    }

    pub fn tag(&self) -> &WorkerTag {
        &self.tag
    }

    pub fn pid(&self) -> Option<u32> {
        self.tag.pid
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn restart_count(&self) -> u32 {
        self.restart_count
    }

    /// Hand the output pipes to the log sink. Returns `None`s on a second call.
    pub fn take_output(&mut self) -> (Option<ChildStdout>, Option<ChildStderr>) {
        (self.child.stdout.take(), self.child.stderr.take())
    }

    /// Signal the worker's whole process group.
    pub fn send_signal(&self, sig: Signal) {
        let Some(pid) = self.tag.pid else {
            return;
        };
        match signal::killpg(Pid::from_raw(pid as i32), sig) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!("[{}] failed to send {sig}: {e}", self.tag),
        }
    }

    /// Wait for the child to exit. Cancel safe.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<ExitStatus> {
        info!("[{}] sending SIGTERM", self.tag);
        self.send_signal(Signal::SIGTERM);
        if let Ok(status) = timeout(grace, self.child.wait()).await {
            return status;
        }
        warn!(
            "[{}] still running {}ms after SIGTERM, sending SIGKILL",
            self.tag,
            grace.as_millis()
        );
        self.send_signal(Signal::SIGKILL);
        match timeout(SIGKILL_TIMEOUT, self.child.wait()).await {
            Ok(status) => status,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "process survived SIGKILL",
            )),
        }
    }

    /// Kill whatever the worker left behind in its process group once the
    /// leader has been reaped, so stale children cannot hold the log pipes.
    pub fn kill_remaining_group(&self) {
        let Some(pid) = self.tag.pid else {
            return;
        };
        match signal::killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            Ok(()) => debug!("[{}] killed leftover process group members", self.tag),
            Err(Errno::ESRCH) => {}
            Err(e) => debug!("[{}] could not clean up process group: {e}", self.tag),
        }
    }
}

impl ExitReason {
    pub fn from_status(status: ExitStatus) -> ExitReason {
        match (status.code(), status.signal()) {
            (Some(code), _) => ExitReason::Code { code },
            (None, Some(signal)) => ExitReason::Signal { signal },
            (None, None) => ExitReason::Code { code: -1 },
        }
    }
}
