// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::proxy::DEFAULT_BYPASS;

pub const SETTINGS_FILE: &str = "coremgr.yaml";
pub const RAW_CONFIG_FILE: &str = "config.yaml";
const CORE_DIR: &str = "core";
const RUN_DIR: &str = "run";
const RUN_CONFIG_FILE: &str = "core-config.yaml";
const WORK_DIR_ENV: &str = "COREMGR_WORK_DIR";

fn default_true() -> bool {
    true
}

fn default_stop_timeout() -> u64 {
    5
}

fn default_core_prefix() -> String {
    "mihomo".to_string()
}

fn default_bypass() -> Vec<String> {
    DEFAULT_BYPASS.split(';').map(String::from).collect()
}

/// Daemon settings, read from `coremgr.yaml` in the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default)]
    pub core_log_enabled: bool,
    #[serde(default = "default_bypass")]
    pub proxy_by_pass: Vec<String>,
    #[serde(default = "default_true")]
    pub proxy_on_launch: bool,
    /// Seconds to wait for the core to exit after the graceful request.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default = "default_core_prefix")]
    pub core_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "serde_yaml::Mapping::is_empty")]
    pub core_overrides: serde_yaml::Mapping,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            core_log_enabled: false,
            proxy_by_pass: default_bypass(),
            proxy_on_launch: true,
            stop_timeout: default_stop_timeout(),
            core_prefix: default_core_prefix(),
            config_path: None,
            core_overrides: serde_yaml::Mapping::new(),
        }
    }
}

impl Settings {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout)
    }

    /// The bypass list in the `;`-separated form the OS proxy settings use.
    pub fn bypass_list(&self) -> String {
        self.proxy_by_pass.join(";")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        // An empty file deserializes to null, which means "all defaults".
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        let settings: Settings = serde_yaml::from_str(&contents)
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let out = serde_yaml::to_string(self).context("serializing settings")?;
        std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))
    }

    /// Load the settings file, creating it with defaults when absent. Errors
    /// are logged and fall back to defaults so a bad settings file never
    /// keeps the core from starting.
    pub fn load_or_init(path: &Path) -> Self {
        if !path.exists() {
            let defaults = Self::default();
            match defaults.write(path) {
                Ok(()) => info!("wrote default settings to {}", path.display()),
                Err(e) => warn!("failed to create settings file: {e:#}"),
            }
            return defaults;
        }
        match Self::load(path) {
            Ok(settings) => {
                info!("settings loaded: {}", path.display());
                settings
            }
            Err(e) => {
                warn!("failed to load settings, using defaults: {e:#}");
                Self::default()
            }
        }
    }
}

/// Filesystem layout derived from the working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub work_dir: PathBuf,
    pub core_dir: PathBuf,
    pub run_config_path: PathBuf,
    pub settings_path: PathBuf,
}

impl Layout {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        let work_dir = work_dir.into();
        Self {
            core_dir: work_dir.join(CORE_DIR),
            run_config_path: work_dir.join(RUN_DIR).join(RUN_CONFIG_FILE),
            settings_path: work_dir.join(SETTINGS_FILE),
            work_dir,
        }
    }

    /// Candidate locations for the user-authored configuration, in order.
    pub fn raw_config_candidates(&self, settings: &Settings) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(ref path) = settings.config_path {
            candidates.push(self.work_dir.join(path));
        }
        candidates.push(self.core_dir.join(RAW_CONFIG_FILE));
        candidates.push(self.work_dir.join(RAW_CONFIG_FILE));
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("mihomo").join(RAW_CONFIG_FILE));
        }
        candidates
    }

    /// First existing candidate, or the first candidate when none exists so
    /// that reconciliation reports a missing file at a predictable path.
    pub fn resolve_raw_config(&self, settings: &Settings) -> PathBuf {
        let candidates = self.raw_config_candidates(settings);
        if let Some(found) = candidates.iter().find(|p| p.is_file()) {
            return found.clone();
        }
        debug!("no configuration found in {candidates:?}");
        candidates
            .into_iter()
            .next()
            .unwrap_or_else(|| self.core_dir.join(RAW_CONFIG_FILE))
    }
}

/// Working directory: `COREMGR_WORK_DIR`, else the directory holding the
/// running executable.
pub fn default_work_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(WORK_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    let exe = std::env::current_exe().context("failed to get executable path")?;
    exe.parent()
        .map(Path::to_path_buf)
        .context("executable path has no parent directory")
}
