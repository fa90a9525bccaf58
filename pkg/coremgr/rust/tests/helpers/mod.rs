// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const POLL: Duration = Duration::from_millis(50);

const VERSION_PREAMBLE: &str =
    "[ \"$1\" = \"-v\" ] && { echo \"Mihomo Meta v1.19.0 linux amd64\"; exit 0; }";

/// A core that logs its arguments and idles until signalled.
pub fn cooperative_core() -> String {
    format!("{VERSION_PREAMBLE}\necho \"core started with $*\"\nwhile :; do sleep 1; done")
}

/// A core that ignores the graceful stop request.
pub fn stubborn_core() -> String {
    format!(
        "{VERSION_PREAMBLE}\ntrap '' TERM\necho \"core started with $*\"\nwhile :; do sleep 1; done"
    )
}

/// Poll `done` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !done() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL);
    }
    true
}

/// Every line the daemon printed, from both streams.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<String>>>);

impl LogCapture {
    fn follow(&self, stream: impl Read + Send + 'static, tag: &'static str) -> JoinHandle<()> {
        let lines = Arc::clone(&self.0);
        std::thread::spawn(move || {
            for line in BufReader::new(stream).lines().map_while(Result::ok) {
                eprintln!("[{tag}] {line}");
                lines.lock().unwrap().push(line);
            }
        })
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.contains(pattern))
            .count()
    }

    /// Pids from "[core] spawned (pid=NNN, ...)" lines, oldest first.
    pub fn spawned_pids(&self) -> Vec<u32> {
        const MARKER: &str = "spawned (pid=";
        self.0
            .lock()
            .unwrap()
            .iter()
            .filter_map(|l| {
                let rest = &l[l.find(MARKER)? + MARKER.len()..];
                let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
                digits.parse().ok()
            })
            .collect()
    }
}

/// A coremgrd process running against a temporary work directory. Killed
/// on drop.
pub struct DaemonHandle {
    child: Child,
    logs: LogCapture,
    _readers: [JoinHandle<()>; 2],
}

impl DaemonHandle {
    pub fn start(work_dir: &Path) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_coremgrd"))
            .env("COREMGR_WORK_DIR", work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .expect("failed to start coremgrd");

        // simple_logger writes INFO to stdout, WARN/ERROR to stderr.
        let logs = LogCapture::default();
        let stdout = child.stdout.take().expect("stdout is piped");
        let stderr = child.stderr.take().expect("stderr is piped");
        let readers = [
            logs.follow(stdout, "daemon"),
            logs.follow(stderr, "daemon:err"),
        ];

        Self {
            child,
            logs,
            _readers: readers,
        }
    }

    pub fn wait_for_log_default(&self, pattern: &str) -> bool {
        self.wait_for_log_count(pattern, 1, DEFAULT_TIMEOUT)
    }

    pub fn wait_for_log_count(&self, pattern: &str, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.logs.count(pattern) >= n)
    }

    pub fn count_log_matches(&self, pattern: &str) -> usize {
        self.logs.count(pattern)
    }

    pub fn spawned_pids(&self) -> Vec<u32> {
        self.logs.spawned_pids()
    }

    pub fn send_signal(&self, sig: Signal) {
        signal::kill(Pid::from_raw(self.child.id() as i32), sig)
            .expect("failed to signal coremgrd");
    }

    /// SIGTERM, then wait for the exit status.
    pub fn stop(&mut self) -> ExitStatus {
        self.send_signal(Signal::SIGTERM);
        self.wait_with_timeout(DEFAULT_TIMEOUT)
    }

    /// Exit status within `timeout`, killing the daemon if it is still up.
    pub fn wait_with_timeout(&mut self, timeout: Duration) -> ExitStatus {
        let mut status = None;
        wait_until(timeout, || {
            status = self.child.try_wait().expect("failed to poll coremgrd");
            status.is_some()
        });
        match status {
            Some(status) => status,
            None => {
                let _ = self.child.kill();
                self.child.wait().expect("failed to reap coremgrd")
            }
        }
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn core_dir(work_dir: &Path) -> PathBuf {
    let dir = work_dir.join("core");
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

/// Install a shell-script core named `name` under `<work_dir>/core`.
pub fn write_core(work_dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = core_dir(work_dir).join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Write `<work_dir>/core/config.yaml`.
pub fn write_core_config(work_dir: &Path, yaml: &str) -> PathBuf {
    let path = core_dir(work_dir).join("config.yaml");
    std::fs::write(&path, yaml).unwrap();
    path
}

pub fn write_settings(work_dir: &Path, yaml: &str) {
    std::fs::write(work_dir.join("coremgr.yaml"), yaml).unwrap();
}

/// Contents of the generated run configuration, empty when absent.
pub fn run_config(work_dir: &Path) -> String {
    std::fs::read_to_string(work_dir.join("run").join("core-config.yaml")).unwrap_or_default()
}

pub fn pid_is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn wait_for_pid_gone(pid: u32, timeout: Duration) -> bool {
    wait_until(timeout, || !pid_is_alive(pid))
}
