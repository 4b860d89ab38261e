// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::backoff::Backoff;
use crate::log_sink::LogSink;
use crate::monitor::{MemoryEvent, MemoryWatch, ResourceMonitor};
use crate::spec::ProcessSpec;
use crate::state::{ExitReason, Status, WorkerState};
use crate::worker::{WorkerHandle, WorkerTag};
use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// What the driving loop publishes after every transition.
#[derive(Debug, Clone)]
struct Published {
    state: WorkerState,
    restart_count: u32,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_exit: Option<ExitReason>,
}

impl Published {
    fn view(&self, tag: &WorkerTag) -> Status {
        Status {
            name: tag.name.to_string(),
            instance: tag.instance,
            state: self.state,
            restart_count: self.restart_count,
            pid: self.pid,
            uptime: self
                .started_at
                .filter(|_| self.state.is_alive())
                .map(|t| t.elapsed()),
            last_exit: self.last_exit.clone(),
        }
    }
}

/// Supervises one instance slot of a [`ProcessSpec`].
///
/// All lifecycle state lives here and is mutated only by the driving loop
/// started in [`Supervisor::start`]. Callers observe it through the
/// [`SupervisorHandle`].
pub struct Supervisor {
    spec: Arc<ProcessSpec>,
    tag: WorkerTag,
    stop: CancellationToken,
    status_tx: watch::Sender<Published>,
    state: WorkerState,
    restart_count: u32,
    pid: Option<u32>,
    started_at: Option<Instant>,
    last_exit: Option<ExitReason>,
}

impl Supervisor {
    /// Launch the driving loop for instance slot `instance`.
    pub fn start(spec: Arc<ProcessSpec>, instance: u32) -> SupervisorHandle {
        let tag = WorkerTag::new(&spec.name, instance);
        let initial = Published {
            state: WorkerState::Idle,
            restart_count: 0,
            pid: None,
            started_at: None,
            last_exit: None,
        };
        let (status_tx, status_rx) = watch::channel(initial);
        let stop = CancellationToken::new();
        let supervisor = Supervisor {
            spec,
            tag: tag.clone(),
            stop: stop.clone(),
            status_tx,
            state: WorkerState::Idle,
            restart_count: 0,
            pid: None,
            started_at: None,
            last_exit: None,
        };
        let task = tokio::spawn(supervisor.run());
        SupervisorHandle {
            tag,
            stop,
            status_rx,
            task,
        }
    }

    /// One supervisor per configured instance.
    pub fn start_all(spec: Arc<ProcessSpec>) -> Vec<SupervisorHandle> {
        (0..spec.instances)
            .map(|instance| Supervisor::start(Arc::clone(&spec), instance))
            .collect()
    }

    async fn run(mut self) {
        let paths = self
            .spec
            .log_paths
            .for_instance(self.tag.instance, self.spec.instances);
        let sink = match LogSink::open(
            &paths,
            self.spec.merge_logs,
            self.spec.timestamps,
            &self.spec.log_date_format,
        )
        .await
        {
            Ok(sink) => sink,
            Err(e) => {
                error!("[{}] {e}; instance will not be started", self.tag);
                self.last_exit = Some(ExitReason::LogDestination {
                    error: e.to_string(),
                });
                self.transition(WorkerState::Stopped);
                return;
            }
        };

        let mut backoff = Backoff::new(self.spec.restart);
        loop {
            if self.stop.is_cancelled() {
                break;
            }
            self.transition(WorkerState::Starting);
            let ran_for = self.run_once(&sink).await;

            if self.stop.is_cancelled() {
                break;
            }
            if !self.spec.auto_restart {
                info!("[{}] auto_restart=false, not restarting", self.tag);
                break;
            }
            let delay = backoff.next_delay(ran_for);
            info!(
                "[{}] restarting in {}ms (restarts so far: {})",
                self.tag,
                delay.as_millis(),
                self.restart_count
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.cancelled() => {}
            }
            // An explicit stop always beats a pending restart.
            if self.stop.is_cancelled() {
                info!("[{}] stop requested during restart delay", self.tag);
                break;
            }
            self.restart_count = self.restart_count.saturating_add(1);
        }
        self.transition(WorkerState::Stopped);
        info!("[{}] stopped", self.tag);
    }

    /// Launch the worker once and supervise it until it is reaped. Leaves the
    /// state at `Exited` and returns how long the run lasted.
    async fn run_once(&mut self, sink: &LogSink) -> Duration {
        let mut worker = match WorkerHandle::spawn(&self.spec, self.tag.clone(), self.restart_count)
        {
            Ok(worker) => worker,
            Err(e) => {
                error!("[{}] {e}", self.tag);
                self.last_exit = Some(ExitReason::LaunchFailed {
                    error: e.to_string(),
                });
                self.transition(WorkerState::Exited);
                return Duration::ZERO;
            }
        };
        self.pid = worker.pid();
        self.started_at = Some(worker.started_at());
        self.transition(WorkerState::Running);

        let (stdout, stderr) = worker.take_output();
        let capture = sink.attach(worker.tag().clone(), stdout, stderr);
        let mut memory = self.spec.max_memory_bytes.and_then(|limit| {
            ResourceMonitor::watch(worker.tag().clone(), limit, self.spec.memory_poll_interval)
        });

        let reason = loop {
            tokio::select! {
                status = worker.wait() => {
                    break match status {
                        Ok(status) => ExitReason::from_status(status),
                        Err(e) => {
                            error!("[{}] waiting on worker failed: {e}", self.tag);
                            ExitReason::Code { code: -1 }
                        }
                    };
                }
                _ = self.stop.cancelled() => {
                    self.transition(WorkerState::Stopping);
                    self.terminate(&mut worker).await;
                    break ExitReason::StopRequested;
                }
                event = next_memory_event(&mut memory) => match event {
                    Some(MemoryEvent::Ok { rss }) => {
                        debug!("[{}] rss={rss}", self.tag);
                    }
                    Some(MemoryEvent::Exceeded { rss, limit }) => {
                        warn!(
                            "[{}] memory ceiling breached (rss={rss} > max={limit}), restarting worker",
                            self.tag
                        );
                        self.transition(WorkerState::Stopping);
                        self.terminate(&mut worker).await;
                        break ExitReason::MemoryCeiling { rss, limit };
                    }
                    None => {
                        // Sampling lost the process; exit detection takes over.
                        memory = None;
                    }
                },
            }
        };

        drop(memory);
        let ran_for = worker.uptime();
        worker.kill_remaining_group();
        capture.finish(self.spec.kill_timeout).await;

        match reason {
            ExitReason::Code { code: 0 } => info!("[{}] exited with code 0", self.tag),
            ExitReason::StopRequested => info!("[{}] terminated on request", self.tag),
            ExitReason::MemoryCeiling { .. } => {
                info!("[{}] terminated after memory ceiling breach", self.tag)
            }
            ref other => warn!("[{}] exited with {other}", self.tag),
        }
        self.last_exit = Some(reason);
        self.pid = None;
        self.started_at = None;
        self.transition(WorkerState::Exited);
        ran_for
    }

    async fn terminate(&self, worker: &mut WorkerHandle) {
        if let Err(e) = worker.terminate(self.spec.kill_timeout).await {
            error!("[{}] failed to terminate worker: {e}", self.tag);
        }
    }

    fn transition(&mut self, next: WorkerState) {
        if !self.state.can_transition_to(next) {
            warn!(
                "[{}] ignoring invalid transition {} -> {next}",
                self.tag, self.state
            );
            return;
        }
        debug!("[{}] {} -> {next}", self.tag, self.state);
        self.state = next;
        self.status_tx.send_replace(Published {
            state: self.state,
            restart_count: self.restart_count,
            pid: self.pid,
            started_at: self.started_at,
            last_exit: self.last_exit.clone(),
        });
    }
}

async fn next_memory_event(memory: &mut Option<MemoryWatch>) -> Option<MemoryEvent> {
    match memory {
        Some(watch) => watch.next().await,
        None => std::future::pending().await,
    }
}

/// Control surface for one running [`Supervisor`].
pub struct SupervisorHandle {
    tag: WorkerTag,
    stop: CancellationToken,
    status_rx: watch::Receiver<Published>,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn status(&self) -> Status {
        self.status_rx.borrow().view(&self.tag)
    }

    /// Ask the supervisor to stop without waiting. Idempotent.
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Stop the worker gracefully and wait until the supervisor reports
    /// `Stopped`. No restart happens after this is called.
    pub async fn stop(&self) {
        self.request_stop();
        let mut rx = self.status_rx.clone();
        let _ = rx.wait_for(|p| p.state == WorkerState::Stopped).await;
    }

    pub fn subscribe(&self) -> StatusUpdates {
        StatusUpdates {
            tag: self.tag.clone(),
            rx: self.status_rx.clone(),
        }
    }

    /// Wait for the driving loop to finish.
    pub async fn wait(self) {
        if let Err(e) = self.task.await {
            error!("[{}] supervisor task failed: {e}", self.tag);
        }
    }
}

/// Change feed of one supervisor's [`Status`].
#[derive(Clone)]
pub struct StatusUpdates {
    tag: WorkerTag,
    rx: watch::Receiver<Published>,
}

impl StatusUpdates {
    pub fn current(&self) -> Status {
        self.rx.borrow().view(&self.tag)
    }

    /// Next status after a transition, or `None` once the supervisor is gone
    /// and every change has been seen.
    pub async fn changed(&mut self) -> Option<Status> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().view(&self.tag))
    }
}
