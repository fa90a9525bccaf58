// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::dashboard::{self, Controller};
use crate::errors::ReconcileError;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// The user-authored core configuration, kept as an untyped document so
/// every field the core understands passes through unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct RawConfig {
    path: PathBuf,
    document: Mapping,
}

/// The subset of the core configuration needed to supervise it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct CoreFields {
    mixed_port: Option<u16>,
    port: Option<u16>,
    external_controller: Option<Value>,
    secret: Option<Value>,
    external_ui: Option<Value>,
    external_ui_name: Option<Value>,
}

/// Any YAML scalar as the text the core reads it as: `secret: 123456` is the
/// string `"123456"`. Null is absent.
fn scalar_text(
    source: &Path,
    key: &str,
    value: Option<Value>,
) -> Result<Option<String>, ReconcileError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(_) => Err(ReconcileError::ConfigMalformed {
            path: source.to_path_buf(),
            reason: format!("{key} must be a scalar"),
        }),
    }
}

impl RawConfig {
    pub fn load(path: &Path) -> Result<Self, ReconcileError> {
        if !path.exists() {
            return Err(ReconcileError::ConfigMissing {
                path: path.to_path_buf(),
            });
        }
        let contents =
            std::fs::read_to_string(path).map_err(|source| ReconcileError::ConfigUnreadable {
                path: path.to_path_buf(),
                source,
            })?;
        Self::parse(path, &contents)
    }

    pub fn parse(path: &Path, contents: &str) -> Result<Self, ReconcileError> {
        let malformed = |reason: String| ReconcileError::ConfigMalformed {
            path: path.to_path_buf(),
            reason,
        };
        let value: Value = serde_yaml::from_str(contents).map_err(|e| malformed(e.to_string()))?;
        let document = match value {
            Value::Mapping(m) => m,
            Value::Null => Mapping::new(),
            _ => return Err(malformed("top level is not a mapping".to_string())),
        };
        Ok(Self {
            path: path.to_path_buf(),
            document,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.document.get(key)
    }

    /// The document handed to the core: null top-level entries dropped, then
    /// `overrides` merged over it key by key.
    pub fn run_document(&self, overrides: &Mapping) -> Mapping {
        let mut document: Mapping = self
            .document
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (k, v) in overrides {
            document.insert(k.clone(), v.clone());
        }
        document
    }
}

/// Immutable snapshot derived from one successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveConfig {
    /// Never zero.
    pub proxy_port: u16,
    pub controller_address: Option<String>,
    pub controller_secret: Option<String>,
    pub dashboard_urls: BTreeMap<String, String>,
    pub run_config_path: PathBuf,
}

/// `mixed-port` wins over `port`; zero means unset.
pub fn resolve_port(mixed_port: Option<u16>, port: Option<u16>) -> Option<u16> {
    mixed_port
        .filter(|p| *p != 0)
        .or_else(|| port.filter(|p| *p != 0))
}

impl EffectiveConfig {
    fn derive(
        source: &Path,
        document: &Mapping,
        run_config_path: &Path,
    ) -> Result<Self, ReconcileError> {
        let fields: CoreFields = serde_yaml::from_value(Value::Mapping(document.clone()))
            .map_err(|e| ReconcileError::ConfigMalformed {
                path: source.to_path_buf(),
                reason: e.to_string(),
            })?;

        let proxy_port = resolve_port(fields.mixed_port, fields.port).ok_or_else(|| {
            ReconcileError::PortUnresolved {
                path: source.to_path_buf(),
            }
        })?;

        let controller_address =
            scalar_text(source, "external-controller", fields.external_controller)?
                .filter(|s| !s.is_empty());
        let controller_secret = scalar_text(source, "secret", fields.secret)?;
        let has_ui = scalar_text(source, "external-ui", fields.external_ui)?
            .is_some_and(|s| !s.is_empty());
        let ui_name = scalar_text(source, "external-ui-name", fields.external_ui_name)?;

        let dashboard_urls = match controller_address.as_deref().map(Controller::parse) {
            Some(Some(controller)) if has_ui => dashboard::dashboard_urls(
                &controller,
                controller_secret.as_deref().unwrap_or_default(),
                ui_name.as_deref(),
            ),
            Some(None) => {
                warn!("ignoring unparsable external-controller in {}", source.display());
                BTreeMap::new()
            }
            _ => BTreeMap::new(),
        };

        Ok(Self {
            proxy_port,
            controller_address,
            controller_secret,
            dashboard_urls,
            run_config_path: run_config_path.to_path_buf(),
        })
    }
}

/// Replace `path` with `contents` so that readers see either the old or the
/// new file, never a partial one.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    // The rename is only durable once the directory entry is.
    #[cfg(unix)]
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

/// Turns the raw configuration into an [`EffectiveConfig`] and the run
/// configuration file the core is started with.
pub struct Reconciler {
    raw_path: PathBuf,
    run_config_path: PathBuf,
    overrides: Mapping,
    current: RwLock<Option<Arc<EffectiveConfig>>>,
    writer: Mutex<()>,
}

impl Reconciler {
    pub fn new(raw_path: PathBuf, run_config_path: PathBuf, overrides: Mapping) -> Self {
        Self {
            raw_path,
            run_config_path,
            overrides,
            current: RwLock::new(None),
            writer: Mutex::new(()),
        }
    }

    pub fn raw_path(&self) -> &Path {
        &self.raw_path
    }

    pub fn run_config_path(&self) -> &Path {
        &self.run_config_path
    }

    /// The last published snapshot, if any reconciliation has succeeded.
    pub fn current(&self) -> Option<Arc<EffectiveConfig>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Re-read the raw configuration, rewrite the run configuration and
    /// publish the new snapshot. On error nothing is written or published.
    pub fn reconcile(&self) -> Result<Arc<EffectiveConfig>, ReconcileError> {
        // Held until publication so snapshots are published in write order.
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let raw = RawConfig::load(&self.raw_path)?;
        let document = raw.run_document(&self.overrides);
        let effective = EffectiveConfig::derive(&self.raw_path, &document, &self.run_config_path)?;

        let rendered = serde_yaml::to_string(&document).map_err(|e| {
            ReconcileError::RunConfigWriteFailed {
                path: self.run_config_path.clone(),
                source: std::io::Error::other(e),
            }
        })?;
        write_atomically(&self.run_config_path, rendered.as_bytes()).map_err(|source| {
            ReconcileError::RunConfigWriteFailed {
                path: self.run_config_path.clone(),
                source,
            }
        })?;
        debug!("wrote run configuration {}", self.run_config_path.display());

        let snapshot = Arc::new(effective);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&snapshot));
        info!(
            "configuration reconciled: {} (proxy port {})",
            self.raw_path.display(),
            snapshot.proxy_port
        );
        Ok(snapshot)
    }
}
