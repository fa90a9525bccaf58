// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Events that make the engine reconcile, restart or reload.

use log::{debug, warn};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::{Duration, Instant};

/// Editors emit several events per save; one reconciliation per window.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// Pause between admitting a file event and acting on it, so a save that
/// truncates before writing is read once it is complete.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Write,
    Create,
    Remove,
    Rename,
    Other,
}

impl ChangeKind {
    /// Only content writes lead to a reconciliation.
    pub fn is_write(self) -> bool {
        self == ChangeKind::Write
    }
}

impl From<&EventKind> for ChangeKind {
    fn from(kind: &EventKind) -> Self {
        match kind {
            EventKind::Create(_) => ChangeKind::Create,
            EventKind::Remove(_) => ChangeKind::Remove,
            EventKind::Modify(ModifyKind::Name(_)) => ChangeKind::Rename,
            EventKind::Modify(ModifyKind::Metadata(_)) => ChangeKind::Other,
            EventKind::Modify(_) => ChangeKind::Write,
            _ => ChangeKind::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// The daemon came up.
    Startup,
    /// Someone asked for a restart.
    UserRestart,
    /// The raw core configuration changed on disk.
    ConfigChanged(ChangeKind),
    /// The daemon settings file changed on disk.
    SettingsChanged(ChangeKind),
}

/// Which file a watcher reports on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTarget {
    Config,
    Settings,
}

impl WatchTarget {
    fn trigger(self, kind: ChangeKind) -> Trigger {
        match self {
            WatchTarget::Config => Trigger::ConfigChanged(kind),
            WatchTarget::Settings => Trigger::SettingsChanged(kind),
        }
    }
}

/// A file notification stamped with the time it arrived, so the debounce
/// decision does not depend on how long the handler queue is.
#[derive(Debug, Clone, Copy)]
pub struct WatchEvent {
    pub trigger: Trigger,
    pub at: Instant,
}

/// Timestamp-gated guard: admits an event when the previous admitted one is
/// at least `window` old. Rejected events do not extend the window.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    last: Mutex<Option<Instant>>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Self::new(DEBOUNCE_WINDOW)
    }
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last: Mutex::new(None),
        }
    }

    pub fn admit(&self, now: Instant) -> bool {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        match *last {
            Some(prev) if now.saturating_duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

/// Watches one file and forwards its changes as [`WatchEvent`]s. Dropping
/// the watcher stops the notifications.
pub struct ConfigWatcher {
    path: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ConfigWatcher {
    /// The parent directory is watched rather than the file, so the watch
    /// survives editors that replace the file on save.
    pub fn new(
        path: &Path,
        target: WatchTarget,
        tx: UnboundedSender<WatchEvent>,
    ) -> notify::Result<Self> {
        let file_name: OsString = path
            .file_name()
            .map(ToOwned::to_owned)
            .ok_or_else(|| notify::Error::path_not_found().add_path(path.to_path_buf()))?;
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    warn!("file watch error: {e}");
                    return;
                }
            };
            if !event
                .paths
                .iter()
                .any(|p| p.file_name() == Some(file_name.as_os_str()))
            {
                return;
            }
            let kind = ChangeKind::from(&event.kind);
            debug!("{:?} changed: {kind:?}", event.paths);
            // The receiver is gone once the daemon is shutting down.
            let _ = tx.send(WatchEvent {
                trigger: target.trigger(kind),
                at: Instant::now(),
            });
        })?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        Ok(Self {
            path: path.to_path_buf(),
            _watcher: watcher,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
