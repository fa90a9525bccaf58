// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::{LocateError, SupervisorError};
use crate::locator;
use crate::process::{LaunchSpec, ProcessHandle, ProcessOps, ProcessTarget, Termination};
use crate::state::ProcessState;
use log::{info, warn};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Duration;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the lifecycle of the single core process. Every operation holds the
/// same lock for its whole duration, so callers on different tasks are
/// serialized.
pub struct Supervisor<P: ProcessOps> {
    ops: P,
    spec: LaunchSpec,
    image: String,
    stop_timeout: Duration,
    handle: Mutex<Option<ProcessHandle>>,
}

impl<P: ProcessOps> Supervisor<P> {
    pub fn new(ops: P, spec: LaunchSpec, stop_timeout: Duration) -> Self {
        let image = spec.image();
        Self {
            ops,
            spec,
            image,
            stop_timeout,
            handle: Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &LaunchSpec {
        &self.spec
    }

    pub fn ops(&self) -> &P {
        &self.ops
    }

    /// Asks the OS by executable name, not by remembered pid, so a core that
    /// crashed or was killed elsewhere is reported as stopped. The handle of
    /// an exited core is dropped.
    pub async fn is_running(&self) -> bool {
        let mut slot = self.handle.lock().await;
        self.running_locked(&mut slot)
    }

    pub async fn state(&self) -> ProcessState {
        ProcessState::from(self.is_running().await)
    }

    /// The pid of the core this supervisor started, if it still holds one.
    pub async fn pid(&self) -> Option<u32> {
        self.handle.lock().await.as_ref().map(|h| h.pid)
    }

    pub async fn start(&self) -> Result<(), SupervisorError> {
        let mut slot = self.handle.lock().await;
        self.start_locked(&mut slot)
    }

    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let mut slot = self.handle.lock().await;
        self.stop_locked(&mut slot).await
    }

    /// Stop then start under one lock acquisition. A failed stop leaves the
    /// core running and skips the start.
    pub async fn restart(&self) -> Result<(), SupervisorError> {
        let mut slot = self.handle.lock().await;
        self.stop_locked(&mut slot).await?;
        self.start_locked(&mut slot)
    }

    /// Restart only when the core is up, checked under the same lock so a
    /// concurrent stop is not undone. Returns whether a restart happened.
    pub async fn restart_if_running(&self) -> Result<bool, SupervisorError> {
        let mut slot = self.handle.lock().await;
        if !self.running_locked(&mut slot) {
            return Ok(false);
        }
        self.stop_locked(&mut slot).await?;
        self.start_locked(&mut slot)?;
        Ok(true)
    }

    pub async fn version(&self) -> Result<String, LocateError> {
        locator::query_version(&self.spec.executable, locator::CORE_PRODUCT).await
    }

    fn running_locked(&self, slot: &mut MutexGuard<'_, Option<ProcessHandle>>) -> bool {
        let running = self.ops.is_running(&self.image);
        if !running {
            if let Some(gone) = slot.take() {
                info!("[core] pid {} is gone", gone.pid);
            }
        }
        running
    }

    fn start_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<ProcessHandle>>,
    ) -> Result<(), SupervisorError> {
        if self.ops.is_running(&self.image) {
            info!("[core] already running");
            return Ok(());
        }
        if !self.spec.executable.is_file() {
            return Err(SupervisorError::NotFound {
                path: self.spec.executable.clone(),
            });
        }

        let handle = self
            .ops
            .launch(&self.spec)
            .map_err(|source| SupervisorError::LaunchFailed {
                path: self.spec.executable.clone(),
                source,
            })?;
        info!("[core] started (pid={})", handle.pid);
        **slot = Some(handle);
        Ok(())
    }

    async fn stop_locked(
        &self,
        slot: &mut MutexGuard<'_, Option<ProcessHandle>>,
    ) -> Result<(), SupervisorError> {
        if !self.ops.is_running(&self.image) {
            info!("[core] not running");
            **slot = None;
            return Ok(());
        }

        let target = ProcessTarget {
            image: self.image.clone(),
            pid: slot.as_ref().map(|h| h.pid),
        };
        match self
            .ops
            .terminate(&target, Termination::Graceful, self.stop_timeout)
            .await
        {
            Ok(()) if !self.ops.is_running(&self.image) => {
                info!("[core] stopped");
                **slot = None;
                return Ok(());
            }
            Ok(()) => warn!("[core] still running after graceful stop, killing"),
            Err(e) => warn!("[core] graceful stop failed ({e}), killing"),
        }

        self.ops
            .terminate(&target, Termination::Forceful, KILL_TIMEOUT)
            .await
            .map_err(|e| SupervisorError::TerminationFailed {
                image: self.image.clone(),
                reason: e.to_string(),
            })?;
        if self.ops.is_running(&self.image) {
            return Err(SupervisorError::TerminationFailed {
                image: self.image.clone(),
                reason: "still listed after kill".to_string(),
            });
        }
        info!("[core] killed");
        **slot = None;
        Ok(())
    }
}
