// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::worker::WorkerTag;
use log::{debug, trace};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryEvent {
    /// Sample at or under the ceiling.
    Ok { rss: u64 },
    /// First sample above the ceiling. Not repeated until usage drops back.
    Exceeded { rss: u64, limit: u64 },
}

/// Source of resident-memory samples. `None` means the process is gone.
pub trait MemorySampler: Send + 'static {
    fn sample(&mut self, pid: u32) -> Option<u64>;
}

/// Sums the resident memory of a process and all of its descendants.
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySampler for SysinfoSampler {
    fn sample(&mut self, pid: u32) -> Option<u64> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::All,
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        let root = Pid::from_u32(pid);
        self.system.process(root)?;

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (child, process) in self.system.processes() {
            // Threads share their parent's memory.
            if process.thread_kind().is_some() {
                continue;
            }
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*child);
            }
        }

        let mut total = 0u64;
        let mut seen = HashSet::new();
        let mut pending = vec![root];
        while let Some(current) = pending.pop() {
            if !seen.insert(current) {
                continue;
            }
            if let Some(process) = self.system.process(current) {
                total = total.saturating_add(process.memory());
            }
            if let Some(kids) = children.get(&current) {
                pending.extend(kids.iter().copied());
            }
        }
        Some(total)
    }
}

/// Stream of memory events for one running worker. Sampling stops when this
/// is dropped.
pub struct MemoryWatch {
    rx: mpsc::Receiver<MemoryEvent>,
    task: JoinHandle<()>,
}

impl MemoryWatch {
    /// Next event, or `None` once the process can no longer be sampled.
    pub async fn next(&mut self) -> Option<MemoryEvent> {
        self.rx.recv().await
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub struct ResourceMonitor;

impl ResourceMonitor {
    pub fn watch(tag: WorkerTag, limit: u64, interval: Duration) -> Option<MemoryWatch> {
        Self::watch_with(SysinfoSampler::new(), tag, limit, interval)
    }

    /// Poll `sampler` every `interval`. Returns `None` if the tag carries no pid.
    pub fn watch_with<S: MemorySampler>(
        sampler: S,
        tag: WorkerTag,
        limit: u64,
        interval: Duration,
    ) -> Option<MemoryWatch> {
        let pid = tag.pid?;
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(poll(sampler, tag, pid, limit, interval, tx));
        Some(MemoryWatch { rx, task })
    }
}

async fn poll<S: MemorySampler>(
    mut sampler: S,
    tag: WorkerTag,
    pid: u32,
    limit: u64,
    interval: Duration,
    tx: mpsc::Sender<MemoryEvent>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut breached = false;
    loop {
        ticker.tick().await;
        // Walking the process table is blocking filesystem work.
        let sampled = tokio::task::spawn_blocking(move || {
            let rss = sampler.sample(pid);
            (sampler, rss)
        })
        .await;
        let rss = match sampled {
            Ok((returned, Some(rss))) => {
                sampler = returned;
                rss
            }
            Ok((_, None)) => {
                debug!("[{tag}] pid {pid} no longer sampled, memory watch ends");
                return;
            }
            Err(e) => {
                debug!("[{tag}] memory sampler failed: {e}");
                return;
            }
        };
        trace!("[{tag}] rss={rss} limit={limit}");

        let event = if rss > limit {
            if breached {
                continue;
            }
            breached = true;
            MemoryEvent::Exceeded { rss, limit }
        } else {
            breached = false;
            MemoryEvent::Ok { rss }
        };
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
