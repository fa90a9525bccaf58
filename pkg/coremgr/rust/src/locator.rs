// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::errors::LocateError;
use log::{debug, info, warn};
use std::fs::DirEntry;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Product name the core prints first in its `-v` output.
pub const CORE_PRODUCT: &str = "Mihomo";
const VERSION_FLAG: &str = "-v";
const VERSION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Scan `dir` (not its subdirectories) for a regular file whose name starts
/// with `prefix` and ends with `suffix`, both compared case-insensitively.
/// Entries are visited in name order so the result is stable for a static
/// directory.
pub fn find_executable(dir: &Path, prefix: &str, suffix: &str) -> Result<PathBuf, LocateError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LocateError::Unreadable {
        dir: dir.to_path_buf(),
        source,
    })?;

    let prefix = prefix.to_lowercase();
    let suffix = suffix.to_lowercase();
    let mut candidates: Vec<DirEntry> = entries
        .filter_map(|e| match e {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!("skipping unreadable entry in {}: {e}", dir.display());
                None
            }
        })
        .filter(|e| {
            let name = e.file_name().to_string_lossy().to_lowercase();
            name.starts_with(&prefix) && name.ends_with(&suffix)
        })
        .collect();
    candidates.sort_by_key(|e| e.file_name());

    for entry in candidates {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else {
            debug!("skipping {}: metadata unavailable", path.display());
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        if !is_executable(&path, &meta) {
            warn!("found core {} but it is not executable", path.display());
            continue;
        }
        info!("found core: {}", path.display());
        return Ok(path);
    }

    Err(LocateError::NotFound {
        dir: dir.to_path_buf(),
        prefix,
    })
}

#[cfg(unix)]
fn is_executable(_path: &Path, meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(path: &Path, _meta: &std::fs::Metadata) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("exe"))
}

/// Extract the version from `<product> <edition> <version> ...` output.
pub fn parse_version<'a>(output: &'a str, product: &str) -> Option<&'a str> {
    let mut tokens = output.split_whitespace();
    if tokens.next()? != product {
        return None;
    }
    tokens.nth(1)
}

/// Run the core with its version flag and return the reported version.
pub async fn query_version(executable: &Path, product: &str) -> Result<String, LocateError> {
    let query = Command::new(executable)
        .arg(VERSION_FLAG)
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(VERSION_TIMEOUT, query).await {
        Ok(result) => result,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "no version reported",
        )),
    }
    .map_err(|source| LocateError::VersionQuery {
        path: executable.to_path_buf(),
        source,
    })?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    parse_version(&stdout, product)
        .map(String::from)
        .ok_or_else(|| LocateError::UnexpectedVersion {
            output: stdout.trim().to_string(),
        })
}
