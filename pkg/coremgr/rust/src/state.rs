// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    /// No core process is alive.
    Stopped,
    /// The OS process table lists the core.
    Running,
}

impl ProcessState {
    pub fn is_alive(self) -> bool {
        self == ProcessState::Running
    }
}

impl From<bool> for ProcessState {
    fn from(running: bool) -> Self {
        if running {
            ProcessState::Running
        } else {
            ProcessState::Stopped
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Stopped => write!(f, "stopped"),
            ProcessState::Running => write!(f, "running"),
        }
    }
}
