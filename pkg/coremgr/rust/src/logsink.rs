// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use log::info;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

pub const CORE_LOG_TARGET: &str = "core";

/// Destination for the core's combined stdout/stderr. Disabling it drops
/// lines instead of blocking the reader, so the core never stalls on a full
/// pipe.
#[derive(Debug, Default)]
pub struct CoreLogSink {
    enabled: AtomicBool,
    dropped: AtomicU64,
}

impl CoreLogSink {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn switch(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Lines discarded while disabled.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn write_line(&self, line: &str) {
        if !self.is_enabled() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        info!(target: CORE_LOG_TARGET, "{line}");
    }
}
