// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

mod helpers;

use helpers::{
    DaemonHandle, pid_is_alive, read_log, restart_count, run_cli, wait_for_pid_gone, wait_until,
    write_spec,
};
use std::time::Duration;

// ===========================================================================
// Group 1: Basic Lifecycle
// ===========================================================================

#[test]
fn test_daemon_spawns_worker_and_stops_on_sigterm() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: sleeper\ncommand: /bin/sleep\nargs:\n  - '300'\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(
        daemon.wait_for_log_default("spawned"),
        "daemon should log spawned"
    );
    let pids = daemon.spawned_pids();
    assert_eq!(pids.len(), 1, "expected 1 spawned worker");
    assert!(pid_is_alive(pids[0]), "worker should be alive");

    let status = daemon.stop();
    assert!(status.success(), "daemon should exit cleanly");
    assert!(
        daemon.wait_for_log("sending SIGTERM", Duration::from_secs(0)),
        "daemon should log sending SIGTERM during shutdown"
    );
    assert!(
        wait_for_pid_gone(pids[0], Duration::from_secs(5)),
        "worker should be gone after shutdown"
    );
    assert_eq!(daemon.spawned_pids().len(), 1, "no restart after stop");
}

#[test]
fn test_sigint_also_stops() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), "command: /bin/sleep\nargs:\n  - '300'\n");

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_for_log_default("spawned"));
    daemon.send_signal(nix::sys::signal::Signal::SIGINT);
    let status = daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT);
    assert!(status.success());
    assert!(daemon.wait_for_log("received SIGINT", Duration::from_secs(0)));
}

#[test]
fn test_stop_reaches_forked_children() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sh\nargs:\n  - '-c'\n  - 'sleep 300 & echo child=$!; wait'\ntimestamps: false\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    let out = dir.path().join("logs/worker-out.log");
    let mut child_pid = None;
    assert!(
        wait_until(helpers::DEFAULT_TIMEOUT, || {
            child_pid = read_log(&out)
                .lines()
                .find_map(|l| l.strip_prefix("child=")?.parse::<u32>().ok());
            child_pid.is_some()
        }),
        "worker should report its child pid"
    );
    let child_pid = child_pid.unwrap();
    assert!(pid_is_alive(child_pid));

    assert!(daemon.stop().success());
    assert!(
        wait_for_pid_gone(child_pid, Duration::from_secs(5)),
        "forked child should be gone after shutdown"
    );
}

// ===========================================================================
// Group 2: Restart Policy
// ===========================================================================

#[test]
fn test_crashing_worker_is_relaunched_with_backoff() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: flaky\n\
         command: /bin/sh\n\
         args:\n  - '-c'\n  - 'echo ready; sleep 0.1; exit 1'\n\
         restart_delay_sec: 0.1\n\
         restart_delay_max_sec: 0.2\n",
    );

    let status_file = dir.path().join("status.json");

    let mut daemon = DaemonHandle::start(&spec, Some(&status_file));
    assert!(
        wait_until(Duration::from_secs(2), || {
            restart_count(&status_file).is_some_and(|count| count >= 2)
        }),
        "worker should be relaunched at least twice within 2s"
    );
    assert!(daemon.wait_for_log_count("spawned", 3, Duration::from_secs(1)));
    assert!(daemon.wait_for_log_default("exited with exit code 1"));
    assert!(daemon.wait_for_log_default("restarting in 100ms"));
    assert!(daemon.wait_for_log_default("restarting in 200ms"));
    assert_eq!(
        daemon.count_log_matches("restarting in 400ms"),
        0,
        "delay must stay capped"
    );
    assert!(daemon.stop().success());

    let out = read_log(&dir.path().join("logs/flaky-out.log"));
    let lines: Vec<&str> = out.lines().collect();
    assert!(lines.len() >= 2, "each launch should log ready: {out:?}");
    for line in lines {
        assert!(line.ends_with(": ready"), "expected timestamped line, got {line:?}");
    }
}

#[test]
fn test_clean_exit_is_also_restarted() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sh\nargs:\n  - '-c'\n  - 'exit 0'\nrestart_delay_sec: 0.05\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_for_log_count("spawned", 3, Duration::from_secs(5)));
    assert!(daemon.stop().success());
}

#[test]
fn test_auto_restart_disabled_exits_when_worker_ends() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sh\nargs:\n  - '-c'\n  - 'exit 3'\nauto_restart: false\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    let status = daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT);
    assert!(status.success(), "daemon should exit on its own");
    assert!(daemon.wait_for_log("all instances stopped", Duration::from_secs(0)));
    assert_eq!(daemon.spawned_pids().len(), 1);
}

#[test]
fn test_stop_during_restart_delay() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sh\nargs:\n  - '-c'\n  - 'exit 1'\nrestart_delay_sec: 30\nrestart_delay_max_sec: 30\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_for_log_default("restarting in"));
    let status = daemon.stop();
    assert!(status.success());
    assert!(daemon.wait_for_log("stop requested during restart delay", Duration::from_secs(0)));
    assert_eq!(daemon.spawned_pids().len(), 1, "no relaunch after stop");
}

// ===========================================================================
// Group 3: Memory Ceiling
// ===========================================================================

#[test]
fn test_memory_ceiling_breach_restarts_worker() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sleep\nargs:\n  - '300'\nmax_memory: 1\nmemory_poll_interval_sec: 0.1\nrestart_delay_sec: 0.1\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_for_log_default("memory ceiling breached"));
    assert!(
        daemon.wait_for_log_count("spawned", 2, helpers::DEFAULT_TIMEOUT),
        "worker should be relaunched after the breach"
    );
    let first = daemon.spawned_pids()[0];
    assert!(wait_for_pid_gone(first, Duration::from_secs(5)));
    assert!(daemon.stop().success());
}

#[test]
fn test_generous_ceiling_never_breaches() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sleep\nargs:\n  - '300'\nmax_memory: 1T\nmemory_poll_interval_sec: 0.1\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_for_log_default("spawned"));
    std::thread::sleep(Duration::from_millis(800));
    assert_eq!(daemon.count_log_matches("memory ceiling breached"), 0);
    assert_eq!(daemon.spawned_pids().len(), 1);
    assert!(daemon.stop().success());
}

// ===========================================================================
// Group 4: Log Capture
// ===========================================================================

#[test]
fn test_separate_logs_in_default_location() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: split\ncommand: /bin/sh\nargs:\n  - '-c'\n  - 'echo to-out; echo to-err >&2'\nauto_restart: false\ntimestamps: false\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT).success());

    let out = read_log(&dir.path().join("logs/split-out.log"));
    let err = read_log(&dir.path().join("logs/split-error.log"));
    assert_eq!(out, "to-out\n");
    assert_eq!(err, "to-err\n");
}

#[test]
fn test_merged_logs_share_stdout_file() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: merged\ncommand: /bin/sh\nargs:\n  - '-c'\n  - 'echo to-out; echo to-err >&2'\nauto_restart: false\nmerge_logs: true\ntimestamps: false\n",
    );

    let mut daemon = DaemonHandle::start(&spec, None);
    assert!(daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT).success());

    let out = read_log(&dir.path().join("logs/merged-out.log"));
    assert!(out.contains("to-out\n"));
    assert!(out.contains("to-err\n"));
    assert!(!dir.path().join("logs/merged-error.log").exists());
}

#[test]
fn test_logs_append_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: twice\ncommand: /bin/sh\nargs:\n  - '-c'\n  - 'echo run'\nauto_restart: false\ntimestamps: false\n",
    );

    for _ in 0..2 {
        let mut daemon = DaemonHandle::start(&spec, None);
        assert!(daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT).success());
    }
    let out = read_log(&dir.path().join("logs/twice-out.log"));
    assert_eq!(out, "run\nrun\n");
}

// ===========================================================================
// Group 5: Status and CLI
// ===========================================================================

#[test]
fn test_status_file_tracks_running_worker() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "name: watched\ncommand: /bin/sleep\nargs:\n  - '300'\n",
    );
    let status_file = dir.path().join("status.json");

    let mut daemon = DaemonHandle::start(&spec, Some(&status_file));
    assert!(
        wait_until(helpers::DEFAULT_TIMEOUT, || read_log(&status_file)
            .contains("\"running\"")),
        "status file should report running"
    );

    let output = run_cli(&["status", "--status-file", status_file.to_str().unwrap()]);
    assert!(output.status.success());
    let printed = String::from_utf8_lossy(&output.stdout);
    assert!(printed.contains("watched#0"), "got {printed:?}");
    assert!(printed.contains("running"), "got {printed:?}");

    assert!(daemon.stop().success());
    assert!(
        wait_until(helpers::DEFAULT_TIMEOUT, || read_log(&status_file)
            .contains("\"stopped\"")),
        "status file should report stopped after shutdown"
    );
}

#[test]
fn test_validate_prints_launch_line() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(
        dir.path(),
        "command: /bin/sleep\nargs:\n  - '300'\nmax_memory: 1G\n",
    );

    let output = run_cli(&["validate", "--config", spec.to_str().unwrap()]);
    assert!(output.status.success());
    let printed = String::from_utf8_lossy(&output.stdout);
    assert!(printed.contains("/bin/sleep 300"), "got {printed:?}");
    assert!(printed.contains("1073741824 bytes"), "got {printed:?}");
}

#[test]
fn test_validate_rejects_bad_spec() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), "command: /nonexistent/worker-binary\n");

    let output = run_cli(&["validate", "--config", spec.to_str().unwrap()]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("/nonexistent/worker-binary"), "got {stderr:?}");
}

#[test]
fn test_invalid_spec_never_launches() {
    let dir = tempfile::tempdir().unwrap();
    let spec = write_spec(dir.path(), "command: /bin/sleep\ninstances: 0\n");

    let mut daemon = DaemonHandle::start(&spec, None);
    let status = daemon.wait_with_timeout(helpers::DEFAULT_TIMEOUT);
    assert!(!status.success(), "daemon should refuse an invalid spec");
    assert!(daemon.spawned_pids().is_empty());
}
