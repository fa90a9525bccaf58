// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::TerminateError;
use crate::logsink::CoreLogSink;
use crate::terminate;
use log::{info, warn};
use std::ffi::OsStr;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Process, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System, UpdateKind};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;

/// How the core is started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub executable: PathBuf,
    /// Passed with `-d`; the core resolves its data files against it.
    pub home_dir: PathBuf,
    /// Passed with `-f`.
    pub run_config: PathBuf,
}

impl LaunchSpec {
    /// File name the OS process table lists the core under.
    pub fn image(&self) -> String {
        self.executable
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn args(&self) -> Vec<&OsStr> {
        vec![
            OsStr::new("-d"),
            self.home_dir.as_os_str(),
            OsStr::new("-f"),
            self.run_config.as_os_str(),
        ]
    }
}

/// A core process this supervisor started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: u32,
    pub executable: PathBuf,
}

/// What to terminate: every process listed under `image`. `pid` is the
/// handle's pid when the supervisor still has one; it is signalled first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTarget {
    pub image: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Ask the core to exit and wait for it.
    Graceful,
    /// Kill every process with the core's name.
    Forceful,
}

/// OS operations the supervisor is built on.
pub trait ProcessOps: Send + Sync + 'static {
    /// Whether the process table lists a live process named `image`.
    fn is_running(&self, image: &str) -> bool;

    /// Create the process. Must be called inside a tokio runtime.
    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<ProcessHandle>;

    /// Resolves once every process named after the target is gone, or with
    /// the reason it could not be confirmed gone within `timeout`.
    fn terminate(
        &self,
        target: &ProcessTarget,
        mode: Termination,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TerminateError>> + Send;
}

/// [`ProcessOps`] backed by the real OS.
pub struct SystemProcessOps {
    sink: Arc<CoreLogSink>,
}

impl SystemProcessOps {
    pub fn new(sink: Arc<CoreLogSink>) -> Self {
        Self { sink }
    }
}

impl ProcessOps for SystemProcessOps {
    fn is_running(&self, image: &str) -> bool {
        !running_pids(image).is_empty()
    }

    fn launch(&self, spec: &LaunchSpec) -> std::io::Result<ProcessHandle> {
        let mut cmd = Command::new(&spec.executable);
        cmd.args(spec.args())
            .current_dir(&spec.home_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        // Own process group, so a console break reaches the core alone.
        #[cfg(windows)]
        cmd.creation_flags(windows_sys::Win32::System::Threading::CREATE_NEW_PROCESS_GROUP);

        let mut child = cmd.spawn()?;
        let pid = child.id().unwrap_or(0);
        info!(
            "[core] spawned (pid={pid}, cmd={})",
            spec.executable.display()
        );

        if let Some(stdout) = child.stdout.take() {
            pump_lines(stdout, Arc::clone(&self.sink));
        }
        if let Some(stderr) = child.stderr.take() {
            pump_lines(stderr, Arc::clone(&self.sink));
        }
        // The reaper owns the child so an exit is collected even when nobody
        // asked the supervisor to stop it.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("[core] pid {pid} exited with {status}"),
                Err(e) => warn!("[core] failed to wait on pid {pid}: {e}"),
            }
        });

        Ok(ProcessHandle {
            pid,
            executable: spec.executable.clone(),
        })
    }

    async fn terminate(
        &self,
        target: &ProcessTarget,
        mode: Termination,
        timeout: Duration,
    ) -> Result<(), TerminateError> {
        match mode {
            Termination::Graceful => terminate::graceful(target, timeout).await,
            Termination::Forceful => terminate::forceful(target, timeout).await,
        }
    }
}

fn pump_lines<R>(reader: R, sink: Arc<CoreLogSink>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.write_line(&line),
                Ok(None) => break,
                Err(e) => {
                    warn!("[core] error reading output: {e}");
                    break;
                }
            }
        }
    });
}

pub(crate) fn refreshed_system() -> System {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing()
            .with_exe(UpdateKind::OnlyIfNotSet)
            .with_cmd(UpdateKind::OnlyIfNotSet),
    );
    system
}

/// Shells a script core runs under; only their argv names a script.
const INTERPRETERS: &[&str] = &["sh", "bash", "dash", "ash", "zsh", "busybox"];

fn is_interpreter(process: &Process) -> bool {
    let exe_name = process.exe().and_then(Path::file_name);
    INTERPRETERS.iter().any(|name| {
        let name = OsStr::new(name);
        process.name() == name || exe_name == Some(name)
    })
}

/// Whether `process` is an instance of the executable `image`. The kernel may
/// truncate process names, so the executable path is compared as well. A
/// script core is matched by its script argument, and only when the process
/// is a shell: a viewer or debugger opened on the core binary is not the core.
pub(crate) fn matches_image(process: &Process, image: &str) -> bool {
    if image.is_empty() || process.status() == ProcessStatus::Zombie {
        return false;
    }
    let image = OsStr::new(image);
    if process.name() == image {
        return true;
    }
    if process.exe().and_then(Path::file_name) == Some(image) {
        return true;
    }
    is_interpreter(process)
        && process
            .cmd()
            .iter()
            .take(2)
            .any(|arg| Path::new(arg).file_name() == Some(image))
}

/// Pids of live processes named `image`, excluding this process.
pub fn running_pids(image: &str) -> Vec<u32> {
    let own = std::process::id();
    refreshed_system()
        .processes()
        .values()
        .filter(|p| p.pid().as_u32() != own && matches_image(p, image))
        .map(|p| p.pid().as_u32())
        .collect()
}
