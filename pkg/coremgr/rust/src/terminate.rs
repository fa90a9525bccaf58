// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::TerminateError;
use crate::process::{ProcessTarget, matches_image, refreshed_system, running_pids};
use log::{info, warn};
use sysinfo::Pid;
use tokio::time::{Duration, Instant, sleep};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ask every process named after the target to exit, then wait up to
/// `timeout` for all of them to disappear.
pub async fn graceful(target: &ProcessTarget, timeout: Duration) -> Result<(), TerminateError> {
    let pids = handle_first(running_pids(&target.image), target.pid);
    if pids.is_empty() {
        return Err(TerminateError::NotFound {
            image: target.image.clone(),
        });
    }

    #[cfg(windows)]
    let _consoles = {
        let mut guards = Vec::with_capacity(pids.len());
        for &pid in &pids {
            info!("[core] sending CTRL_BREAK to pid {pid}");
            guards.push(console::send_break(pid)?);
        }
        guards
    };

    #[cfg(unix)]
    for &pid in &pids {
        info!("[core] sending SIGTERM to pid {pid}");
        send_sigterm(pid)?;
    }

    wait_gone(&target.image, timeout).await
}

#[cfg(unix)]
fn send_sigterm(pid: u32) -> Result<(), TerminateError> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| TerminateError::Signal {
        pid,
        reason: "pid out of range".to_string(),
    })?;
    signal::kill(Pid::from_raw(raw), Signal::SIGTERM).map_err(|e| TerminateError::Signal {
        pid,
        reason: e.to_string(),
    })
}

/// Order the listed pids so the one the supervisor started comes first. A
/// handle pid that is no longer listed is only reported.
fn handle_first(mut pids: Vec<u32>, handle: Option<u32>) -> Vec<u32> {
    let Some(handle) = handle else {
        return pids;
    };
    match pids.iter().position(|&p| p == handle) {
        Some(i) => pids[..=i].rotate_right(1),
        None if !pids.is_empty() => {
            warn!("[core] started pid {handle} is gone, stopping other instances {pids:?}")
        }
        None => {}
    }
    pids
}

/// Kill every process named after the target, then wait up to `timeout` for
/// them to disappear. Succeeds immediately when none is running.
pub async fn forceful(target: &ProcessTarget, timeout: Duration) -> Result<(), TerminateError> {
    let own = std::process::id();
    let refused = {
        let system = refreshed_system();
        let listed = system
            .processes()
            .values()
            .filter(|p| p.pid().as_u32() != own && matches_image(p, &target.image))
            .map(|p| p.pid().as_u32())
            .collect();
        let mut refused = None;
        for pid in handle_first(listed, target.pid) {
            let Some(process) = system.process(Pid::from_u32(pid)) else {
                continue;
            };
            info!("[core] killing pid {pid}");
            if !process.kill() {
                warn!("[core] kill refused for pid {pid}");
                refused.get_or_insert(pid);
            }
        }
        refused
    };
    if let Some(pid) = refused {
        return Err(TerminateError::KillRefused { pid });
    }
    wait_gone(&target.image, timeout).await
}

/// Poll the process table until nothing named `image` is left.
pub async fn wait_gone(image: &str, timeout: Duration) -> Result<(), TerminateError> {
    let deadline = Instant::now() + timeout;
    loop {
        if running_pids(image).is_empty() {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(TerminateError::Timeout {
                image: image.to_string(),
                waited: timeout,
            });
        }
        sleep(POLL_INTERVAL).await;
    }
}

#[cfg(windows)]
mod console {
    use crate::errors::TerminateError;
    use windows_sys::Win32::Foundation::{ERROR_ACCESS_DENIED, GetLastError};
    use windows_sys::Win32::System::Console::{
        AttachConsole, CTRL_BREAK_EVENT, FreeConsole, GenerateConsoleCtrlEvent,
        SetConsoleCtrlHandler,
    };

    unsafe extern "system" fn ignore_ctrl(_ctrl_type: u32) -> i32 {
        1
    }

    fn last_error(step: &'static str) -> TerminateError {
        TerminateError::Console {
            step,
            source: std::io::Error::last_os_error(),
        }
    }

    /// Undoes the console attachment and handler when the wait is over.
    pub(super) struct ConsoleGuard {
        attached: bool,
    }

    impl Drop for ConsoleGuard {
        fn drop(&mut self) {
            // SAFETY: removes the handler registered in `send_break`; no
            // pointers beyond the function itself are involved.
            unsafe {
                SetConsoleCtrlHandler(Some(ignore_ctrl), 0);
                if self.attached {
                    FreeConsole();
                }
            }
        }
    }

    /// Windows cannot signal an unrelated process, so join its console and
    /// broadcast a break to its process group, ignoring it ourselves.
    pub(super) fn send_break(pid: u32) -> Result<ConsoleGuard, TerminateError> {
        // SAFETY: Win32 console calls taking plain integers and a static
        // handler function.
        unsafe {
            let mut attached = true;
            if AttachConsole(pid) == 0 {
                // Already attached to a console: the core shares ours.
                if GetLastError() != ERROR_ACCESS_DENIED {
                    return Err(last_error("AttachConsole"));
                }
                attached = false;
            }
            if SetConsoleCtrlHandler(Some(ignore_ctrl), 1) == 0 {
                let err = last_error("SetConsoleCtrlHandler");
                if attached {
                    FreeConsole();
                }
                return Err(err);
            }
            let guard = ConsoleGuard { attached };
            if GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid) == 0 {
                return Err(last_error("GenerateConsoleCtrlEvent"));
            }
            Ok(guard)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::process::{Child, Command, Stdio};

    fn spawn_script(dir: &Path, name: &str, body: &str) -> Child {
        let exe = dir.join(name);
        std::fs::write(&exe, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&exe, std::fs::Permissions::from_mode(0o755)).unwrap();
        Command::new(&exe)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    fn reap_in_background(mut child: Child) {
        std::thread::spawn(move || {
            let _ = child.wait();
        });
    }

    fn target(image: &str) -> ProcessTarget {
        ProcessTarget {
            image: image.to_string(),
            pid: None,
        }
    }

    async fn wait_listed(image: &str) {
        for _ in 0..50 {
            if !running_pids(image).is_empty() {
                return;
            }
            sleep(POLL_INTERVAL).await;
        }
        panic!("{image} never showed up in the process table");
    }

    #[tokio::test]
    async fn test_graceful_stops_cooperative_process() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_script(dir.path(), "mihomo-coop", "while :; do sleep 1; done");
        reap_in_background(child);
        wait_listed("mihomo-coop").await;

        graceful(&target("mihomo-coop"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(running_pids("mihomo-coop").is_empty());
    }

    #[tokio::test]
    async fn test_graceful_times_out_when_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let child = spawn_script(
            dir.path(),
            "mihomo-stub",
            "trap '' TERM; while :; do sleep 1; done",
        );
        reap_in_background(child);
        wait_listed("mihomo-stub").await;

        let err = graceful(&target("mihomo-stub"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TerminateError::Timeout { .. }));

        forceful(&target("mihomo-stub"), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(running_pids("mihomo-stub").is_empty());
    }

    #[test]
    fn test_handle_pid_ordered_first() {
        assert_eq!(handle_first(vec![7, 8, 9], Some(9)), vec![9, 7, 8]);
        assert_eq!(handle_first(vec![7, 8, 9], Some(7)), vec![7, 8, 9]);
        assert_eq!(handle_first(vec![7, 8], None), vec![7, 8]);
        assert_eq!(handle_first(vec![7, 8], Some(3)), vec![7, 8]);
        assert!(handle_first(Vec::new(), Some(3)).is_empty());
    }

    #[tokio::test]
    async fn test_graceful_nothing_running() {
        let err = graceful(&target("mihomo-absent"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, TerminateError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_forceful_nothing_running() {
        forceful(&target("mihomo-absent"), Duration::from_secs(1))
            .await
            .unwrap();
    }
}
