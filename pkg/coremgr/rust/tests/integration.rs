// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

#![cfg(unix)]

mod helpers;

use helpers::{
    DEFAULT_TIMEOUT, DaemonHandle, cooperative_core, pid_is_alive, run_config, stubborn_core,
    wait_for_pid_gone, write_core, write_core_config, write_settings,
};
use nix::sys::signal::Signal;
use std::time::Duration;

// Each test installs a core with its own name: the supervisor finds cores
// by name in the process table, and tests run in parallel.

// ===========================================================================
// Group 1: Startup
// ===========================================================================

#[test]
fn test_daemon_starts_core_with_run_config() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-start", &cooperative_core());
    write_core_config(dir.path(), "mixed-port: 7890\nlog-level: info\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(
        daemon.wait_for_log_default("[core] spawned"),
        "daemon should spawn the core"
    );
    assert!(daemon.wait_for_log_default("core version v1.19.0"));

    let pids = daemon.spawned_pids();
    assert_eq!(pids.len(), 1, "expected exactly one core");
    assert!(pid_is_alive(pids[0]), "core should be alive");

    let rendered = run_config(dir.path());
    assert!(rendered.contains("mixed-port: 7890"), "{rendered}");
    assert!(rendered.contains("log-level: info"), "{rendered}");
    assert!(
        dir.path().join("coremgr.yaml").is_file(),
        "default settings should be written"
    );

    let status = daemon.stop();
    assert!(status.success(), "daemon should exit cleanly");
    assert!(
        wait_for_pid_gone(pids[0], Duration::from_secs(5)),
        "core should be gone after shutdown"
    );
}

#[test]
fn test_daemon_fails_without_core() {
    let dir = tempfile::tempdir().unwrap();
    write_core_config(dir.path(), "mixed-port: 7890\n");

    let mut daemon = DaemonHandle::start(dir.path());
    let status = daemon.wait_with_timeout(DEFAULT_TIMEOUT);
    assert!(!status.success(), "daemon should fail without a core");
    assert!(daemon.wait_for_log_default("cannot start without a core executable"));
    assert_eq!(daemon.count_log_matches("[core] spawned"), 0);
}

#[test]
fn test_daemon_fails_without_config() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-nocfg", &cooperative_core());

    let mut daemon = DaemonHandle::start(dir.path());
    let status = daemon.wait_with_timeout(DEFAULT_TIMEOUT);
    assert!(!status.success(), "daemon should fail without a configuration");
    assert!(daemon.wait_for_log_default("configuration file not found"));
    assert_eq!(daemon.count_log_matches("[core] spawned"), 0);
}

#[test]
fn test_daemon_fails_on_unresolved_port() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-noport", &cooperative_core());
    write_core_config(dir.path(), "mixed-port: 0\nport: 0\n");

    let mut daemon = DaemonHandle::start(dir.path());
    let status = daemon.wait_with_timeout(DEFAULT_TIMEOUT);
    assert!(!status.success());
    assert!(daemon.wait_for_log_default("cannot both be 0"));
    assert!(
        !dir.path().join("run").join("core-config.yaml").exists(),
        "no run configuration should be written"
    );
}

// ===========================================================================
// Group 2: Reconciliation triggers
// ===========================================================================

#[test]
fn test_config_edit_restarts_core() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-edit", &cooperative_core());
    let config = write_core_config(dir.path(), "mixed-port: 7890\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));
    let first = daemon.spawned_pids()[0];

    std::fs::write(&config, "mixed-port: 7899\n").unwrap();
    assert!(
        daemon.wait_for_log_count("[core] spawned", 2, DEFAULT_TIMEOUT),
        "a configuration edit should restart the core"
    );
    assert!(
        wait_for_pid_gone(first, Duration::from_secs(5)),
        "old core should be gone"
    );
    assert!(run_config(dir.path()).contains("mixed-port: 7899"));

    assert!(daemon.stop().success());
}

#[test]
fn test_bad_edit_keeps_core_running() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-bad", &cooperative_core());
    let config = write_core_config(dir.path(), "mixed-port: 7890\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));
    let pid = daemon.spawned_pids()[0];

    std::fs::write(&config, "mixed-port: [\n").unwrap();
    assert!(
        daemon.wait_for_log_default("ConfigChanged(Write) failed"),
        "the bad edit should be reported"
    );
    assert!(pid_is_alive(pid), "a bad edit must not stop the core");
    assert_eq!(daemon.count_log_matches("[core] spawned"), 1);
    assert!(run_config(dir.path()).contains("mixed-port: 7890"));

    assert!(daemon.stop().success());
}

#[test]
fn test_sighup_restarts_core() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-hup", &cooperative_core());
    write_core_config(dir.path(), "port: 7891\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));
    let first = daemon.spawned_pids()[0];

    daemon.send_signal(Signal::SIGHUP);
    assert!(daemon.wait_for_log_count("[core] spawned", 2, DEFAULT_TIMEOUT));
    assert!(wait_for_pid_gone(first, Duration::from_secs(5)));

    assert!(daemon.stop().success());
}

// ===========================================================================
// Group 3: Settings and core output
// ===========================================================================

#[test]
fn test_core_output_logged_when_enabled() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-log", &cooperative_core());
    write_core_config(dir.path(), "mixed-port: 7890\n");
    write_settings(dir.path(), "core-log-enabled: true\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(
        daemon.wait_for_log_default("core started with -d"),
        "core output should reach the daemon log"
    );
    assert!(daemon.stop().success());
}

#[test]
fn test_core_output_dropped_when_disabled() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-quiet", &cooperative_core());
    write_core_config(dir.path(), "mixed-port: 7890\n");
    write_settings(dir.path(), "core-log-enabled: false\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(daemon.count_log_matches("core started with"), 0);
    assert!(daemon.stop().success());
}

#[test]
fn test_settings_edit_enables_core_log() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-toggle", &cooperative_core());
    write_core_config(dir.path(), "mixed-port: 7890\n");
    write_settings(dir.path(), "core-log-enabled: false\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));

    write_settings(dir.path(), "core-log-enabled: true\n");
    assert!(daemon.wait_for_log_default("settings reloaded"));

    // The next core's output is logged.
    daemon.send_signal(Signal::SIGHUP);
    assert!(daemon.wait_for_log_default("core started with -d"));
    assert!(daemon.stop().success());
}

// ===========================================================================
// Group 4: Shutdown
// ===========================================================================

#[test]
fn test_stubborn_core_killed_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-stub", &stubborn_core());
    write_core_config(dir.path(), "mixed-port: 7890\n");
    write_settings(dir.path(), "stop-timeout: 1\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));
    let pid = daemon.spawned_pids()[0];

    let status = daemon.stop();
    assert!(status.success(), "daemon should exit cleanly");
    assert!(
        daemon.wait_for_log_default("killing"),
        "graceful stop should fall back to kill"
    );
    assert!(wait_for_pid_gone(pid, Duration::from_secs(5)));
}

#[test]
fn test_shutdown_lets_edit_restart_finish() {
    let dir = tempfile::tempdir().unwrap();
    write_core(dir.path(), "mihomo-drain", &stubborn_core());
    let config = write_core_config(dir.path(), "mixed-port: 7890\n");
    // The stubborn core keeps the restart in its stop phase for a second.
    write_settings(dir.path(), "stop-timeout: 1\n");

    let mut daemon = DaemonHandle::start(dir.path());
    assert!(daemon.wait_for_log_default("[core] spawned"));

    std::fs::write(&config, "mixed-port: 7899\n").unwrap();
    assert!(daemon.wait_for_log_count("configuration reconciled", 2, DEFAULT_TIMEOUT));
    daemon.send_signal(Signal::SIGTERM);

    let status = daemon.wait_with_timeout(Duration::from_secs(30));
    assert!(status.success(), "daemon should exit cleanly");
    assert!(
        daemon.wait_for_log_count("[core] spawned", 2, DEFAULT_TIMEOUT),
        "the restart in progress should complete before shutdown"
    );
    for pid in daemon.spawned_pids() {
        assert!(wait_for_pid_gone(pid, Duration::from_secs(5)), "pid {pid} left running");
    }
}
