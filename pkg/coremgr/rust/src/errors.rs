// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LocateError {
    #[error("no executable starting with {prefix:?} found in {}", dir.display())]
    NotFound { dir: PathBuf, prefix: String },
    #[error("could not read directory {}", dir.display())]
    Unreadable {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not run {} to query its version", path.display())]
    VersionQuery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unexpected version output: {output:?}")]
    UnexpectedVersion { output: String },
}

/// Failures of a single reconciliation. None of them replace the published
/// snapshot or touch the supervised process.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("configuration file not found: {}", path.display())]
    ConfigMissing { path: PathBuf },
    #[error("could not read configuration file {}", path.display())]
    ConfigUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed configuration file {}: {reason}", path.display())]
    ConfigMalformed { path: PathBuf, reason: String },
    #[error("mixed-port and port cannot both be 0 in {}", path.display())]
    PortUnresolved { path: PathBuf },
    #[error("could not write run configuration {}", path.display())]
    RunConfigWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum TerminateError {
    #[error("no running process named {image}")]
    NotFound { image: String },
    #[error("could not signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
    #[error("{image} still running after {}s", waited.as_secs())]
    Timeout {
        image: String,
        waited: std::time::Duration,
    },
    #[error("the OS refused to kill pid {pid}")]
    KillRefused { pid: u32 },
    #[error("console control sequence failed at {step}")]
    Console {
        step: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("core executable not found: {}", path.display())]
    NotFound { path: PathBuf },
    #[error("failed to launch {}", path.display())]
    LaunchFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to terminate {image}: {reason}")]
    TerminationFailed { image: String, reason: String },
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("could not run the command that sets {key}")]
    Command {
        key: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("setting {key} was rejected ({status})")]
    Rejected {
        key: &'static str,
        status: std::process::ExitStatus,
    },
    #[error("system proxy is not supported on this platform")]
    Unsupported,
    #[error("no proxy port known until the configuration has been reconciled")]
    NoPort,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
}
