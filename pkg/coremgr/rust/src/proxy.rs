// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! OS-level HTTP proxy settings.

use crate::errors::ProxyError;
use regex::Regex;
use std::sync::{Arc, LazyLock};

pub const DEFAULT_BYPASS: &str = "localhost;127.*;192.168.*;10.*;172.16.*;172.17.*;172.18.*;\
172.19.*;172.20.*;172.21.*;172.22.*;172.23.*;172.24.*;172.25.*;172.26.*;172.27.*;172.28.*;\
172.29.*;172.30.*;172.31.*;<local>";

/// Narrow view of the OS proxy configuration.
pub trait SystemProxy: Send + Sync {
    fn set_proxy(&self, enabled: bool, host: &str, port: u16, bypass: &str)
    -> Result<(), ProxyError>;

    fn unset_proxy(&self) -> Result<(), ProxyError>;

    fn get_enabled(&self) -> bool;

    /// `host:port` currently configured, or empty.
    fn get_server_address(&self) -> String;
}

/// The adapter for the platform the daemon runs on.
pub fn platform_proxy() -> Arc<dyn SystemProxy> {
    #[cfg(windows)]
    {
        Arc::new(RegistryProxy)
    }
    #[cfg(not(windows))]
    {
        Arc::new(UnsupportedProxy)
    }
}

/// Used where the OS has no single proxy switch this daemon can flip.
#[derive(Debug, Default)]
pub struct UnsupportedProxy;

impl SystemProxy for UnsupportedProxy {
    fn set_proxy(&self, _: bool, _: &str, _: u16, _: &str) -> Result<(), ProxyError> {
        Err(ProxyError::Unsupported)
    }

    fn unset_proxy(&self) -> Result<(), ProxyError> {
        Ok(())
    }

    fn get_enabled(&self) -> bool {
        false
    }

    fn get_server_address(&self) -> String {
        String::new()
    }
}

static ENABLE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ProxyEnable\s+[A-Za-z_]+\s+0x(\d+)").expect("valid regex"));
static SERVER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)ProxyServer\s+[A-Za-z_]+\s+(\S+)").expect("valid regex"));

/// Parse `reg query ... /v ProxyEnable` output.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_enabled(output: &str) -> bool {
    ENABLE_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .is_some_and(|m| m.as_str() == "1")
}

/// Parse `reg query ... /v ProxyServer` output.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn parse_server(output: &str) -> String {
    SERVER_RE
        .captures(output)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

#[cfg(windows)]
pub use registry::RegistryProxy;

#[cfg(windows)]
mod registry {
    use super::*;
    use log::warn;
    use std::os::windows::process::CommandExt;
    use std::process::Command;
    use windows_sys::Win32::System::Threading::CREATE_NO_WINDOW;

    const KEY_PATH: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

    /// Per-user WinINet settings, edited through `reg.exe`.
    #[derive(Debug, Default)]
    pub struct RegistryProxy;

    fn reg(args: &[&str]) -> Command {
        let mut cmd = Command::new("reg");
        cmd.args(args).creation_flags(CREATE_NO_WINDOW);
        cmd
    }

    fn query(value: &str) -> Option<String> {
        let output = reg(&["query", KEY_PATH, "/v", value]).output().ok()?;
        if !output.status.success() {
            return None;
        }
        Some(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn add(key: &'static str, kind: &str, data: &str) -> Result<(), ProxyError> {
        let status = reg(&["add", KEY_PATH, "/v", key, "/t", kind, "/d", data, "/f"])
            .status()
            .map_err(|source| ProxyError::Command { key, source })?;
        if !status.success() {
            warn!("reg add {key} exited with {status}");
            return Err(ProxyError::Rejected { key, status });
        }
        Ok(())
    }

    impl SystemProxy for RegistryProxy {
        fn set_proxy(
            &self,
            enabled: bool,
            host: &str,
            port: u16,
            bypass: &str,
        ) -> Result<(), ProxyError> {
            add("ProxyEnable", "REG_DWORD", if enabled { "1" } else { "0" })?;
            if !host.is_empty() {
                add("ProxyServer", "REG_SZ", &format!("{host}:{port}"))?;
            }
            if !bypass.is_empty() {
                add("ProxyOverride", "REG_SZ", bypass)?;
            }
            Ok(())
        }

        fn unset_proxy(&self) -> Result<(), ProxyError> {
            self.set_proxy(false, "", 0, "")
        }

        fn get_enabled(&self) -> bool {
            query("ProxyEnable").is_some_and(|out| parse_enabled(&out))
        }

        fn get_server_address(&self) -> String {
            query("ProxyServer")
                .map(|out| parse_server(&out))
                .unwrap_or_default()
        }
    }
}
