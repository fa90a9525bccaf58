// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::config::{Layout, Settings};
use crate::errors::{EngineError, ProxyError};
use crate::logsink::CoreLogSink;
use crate::process::{LaunchSpec, ProcessOps};
use crate::proxy::SystemProxy;
use crate::reconcile::Reconciler;
use crate::state::ProcessState;
use crate::supervisor::Supervisor;
use crate::trigger::{Debouncer, SETTLE_DELAY, Trigger, WatchEvent};
use anyhow::Context;
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc::UnboundedReceiver;

/// The core listens locally; the system proxy always points at loopback.
pub const PROXY_HOST: &str = "127.0.0.1";

/// Point-in-time view for whatever renders the daemon's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Status {
    pub state: ProcessState,
    pub pid: Option<u32>,
    pub config_path: PathBuf,
    pub proxy_port: Option<u16>,
    pub controller: Option<String>,
    pub dashboards: BTreeMap<String, String>,
    pub system_proxy_enabled: bool,
    pub system_proxy_server: String,
    pub core_log_enabled: bool,
}

/// Runs triggers through reconcile, supervise and proxy, in that order.
pub struct Engine<P: ProcessOps> {
    settings_path: PathBuf,
    settings: RwLock<Arc<Settings>>,
    reconciler: Reconciler,
    supervisor: Supervisor<P>,
    proxy: Arc<dyn SystemProxy>,
    sink: Arc<CoreLogSink>,
    config_debounce: Debouncer,
    settings_debounce: Debouncer,
}

impl<P: ProcessOps> Engine<P> {
    pub fn new(
        layout: &Layout,
        settings: Settings,
        raw_config: PathBuf,
        executable: PathBuf,
        ops: P,
        proxy: Arc<dyn SystemProxy>,
        sink: Arc<CoreLogSink>,
    ) -> Self {
        sink.switch(settings.core_log_enabled);
        let reconciler = Reconciler::new(
            raw_config,
            layout.run_config_path.clone(),
            settings.core_overrides.clone(),
        );
        let spec = LaunchSpec {
            executable,
            home_dir: layout.core_dir.clone(),
            run_config: layout.run_config_path.clone(),
        };
        let supervisor = Supervisor::new(ops, spec, settings.stop_timeout());
        Self {
            settings_path: layout.settings_path.clone(),
            settings: RwLock::new(Arc::new(settings)),
            reconciler,
            supervisor,
            proxy,
            sink,
            config_debounce: Debouncer::default(),
            settings_debounce: Debouncer::default(),
        }
    }

    pub fn settings(&self) -> Arc<Settings> {
        Arc::clone(&self.settings.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    pub fn supervisor(&self) -> &Supervisor<P> {
        &self.supervisor
    }

    pub fn sink(&self) -> &CoreLogSink {
        &self.sink
    }

    /// Handle one trigger. A reconciliation failure is returned before the
    /// supervisor is touched, so a bad edit never takes a healthy core down.
    pub async fn handle(&self, trigger: Trigger) -> Result<(), EngineError> {
        match trigger {
            Trigger::Startup => self.start_core().await,
            Trigger::UserRestart => self.restart_core().await,
            Trigger::ConfigChanged(kind) => {
                if !kind.is_write() {
                    debug!("ignoring {kind:?} on {}", self.reconciler.raw_path().display());
                    return Ok(());
                }
                self.reconciler.reconcile()?;
                match self.supervisor.restart_if_running().await {
                    Ok(true) => {
                        info!("[core] restarted after configuration change");
                        self.point_proxy_at_core();
                        Ok(())
                    }
                    Ok(false) => Ok(()),
                    Err(e) => {
                        if !self.supervisor.is_running().await {
                            self.clear_proxy();
                        }
                        Err(e.into())
                    }
                }
            }
            Trigger::SettingsChanged(kind) => {
                if kind.is_write() {
                    if let Err(e) = self.reload_settings() {
                        warn!("settings reload failed, keeping previous settings: {e:#}");
                    }
                }
                Ok(())
            }
        }
    }

    /// Debounce file notifications, then handle them. Returns whether the
    /// event was handled.
    pub async fn dispatch(&self, event: WatchEvent) -> Result<bool, EngineError> {
        let (kind, debouncer) = match event.trigger {
            Trigger::ConfigChanged(kind) => (kind, &self.config_debounce),
            Trigger::SettingsChanged(kind) => (kind, &self.settings_debounce),
            other => {
                self.handle(other).await?;
                return Ok(true);
            }
        };
        if !kind.is_write() {
            return Ok(false);
        }
        if !debouncer.admit(event.at) {
            debug!("debounced {:?}", event.trigger);
            return Ok(false);
        }
        tokio::time::sleep(SETTLE_DELAY).await;
        self.handle(event.trigger).await?;
        Ok(true)
    }

    /// Consume watch events until every sender is gone.
    pub async fn run(self: Arc<Self>, mut events: UnboundedReceiver<WatchEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.dispatch(event).await {
                error!("{:?} failed: {e}", event.trigger);
            }
        }
        debug!("watch event channel closed");
    }

    pub async fn start_core(&self) -> Result<(), EngineError> {
        self.reconciler.reconcile()?;
        self.supervisor.start().await?;
        self.point_proxy_at_core();
        Ok(())
    }

    pub async fn stop_core(&self) -> Result<(), EngineError> {
        self.supervisor.stop().await?;
        self.clear_proxy();
        Ok(())
    }

    /// A failed restart leaves the system proxy unset, since it would point
    /// at a port nothing may be listening on.
    pub async fn restart_core(&self) -> Result<(), EngineError> {
        self.reconciler.reconcile()?;
        if let Err(e) = self.supervisor.restart().await {
            self.clear_proxy();
            return Err(e.into());
        }
        self.point_proxy_at_core();
        Ok(())
    }

    /// Point the system proxy at the port of the last reconciled config.
    pub fn set_core_proxy(&self) -> Result<(), ProxyError> {
        let config = self.reconciler.current().ok_or(ProxyError::NoPort)?;
        let bypass = self.settings().bypass_list();
        self.proxy
            .set_proxy(true, PROXY_HOST, config.proxy_port, &bypass)?;
        info!("system proxy set to {PROXY_HOST}:{}", config.proxy_port);
        Ok(())
    }

    pub fn unset_proxy(&self) -> Result<(), ProxyError> {
        self.proxy.unset_proxy()?;
        info!("system proxy unset");
        Ok(())
    }

    fn point_proxy_at_core(&self) {
        if !self.settings().proxy_on_launch {
            return;
        }
        if let Err(e) = self.set_core_proxy() {
            warn!("failed to set system proxy: {e}");
        }
    }

    fn clear_proxy(&self) {
        if let Err(e) = self.unset_proxy() {
            warn!("failed to unset system proxy: {e}");
        }
    }

    /// Re-read the settings file. Log output and the proxy bypass list take
    /// effect immediately; everything else applies on the next daemon start.
    pub fn reload_settings(&self) -> anyhow::Result<()> {
        let next = Settings::load(&self.settings_path)?;
        let prev = self.settings();
        if next.stop_timeout != prev.stop_timeout
            || next.core_prefix != prev.core_prefix
            || next.config_path != prev.config_path
            || next.core_overrides != prev.core_overrides
        {
            warn!("stop-timeout, core-prefix, config-path and core-overrides apply after a daemon restart");
        }

        self.sink.switch(next.core_log_enabled);
        let bypass = next.bypass_list();
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(next);
        info!("settings reloaded from {}", self.settings_path.display());

        if self.proxy.get_enabled() {
            if let Some(config) = self.reconciler.current() {
                self.proxy
                    .set_proxy(true, PROXY_HOST, config.proxy_port, &bypass)
                    .context("re-applying system proxy")?;
            }
        }
        Ok(())
    }

    pub async fn status(&self) -> Status {
        let config = self.reconciler.current();
        Status {
            state: self.supervisor.state().await,
            pid: self.supervisor.pid().await,
            config_path: self.reconciler.raw_path().to_path_buf(),
            proxy_port: config.as_ref().map(|c| c.proxy_port),
            controller: config.as_ref().and_then(|c| c.controller_address.clone()),
            dashboards: config
                .as_ref()
                .map(|c| c.dashboard_urls.clone())
                .unwrap_or_default(),
            system_proxy_enabled: self.proxy.get_enabled(),
            system_proxy_server: self.proxy.get_server_address(),
            core_log_enabled: self.sink.is_enabled(),
        }
    }

    /// Unset the system proxy first so traffic never targets a dead port,
    /// then stop the core.
    pub async fn shutdown(&self) {
        self.clear_proxy();
        if let Err(e) = self.supervisor.stop().await {
            error!("[core] failed to stop during shutdown: {e}");
        }
    }
}
