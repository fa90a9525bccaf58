// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Supervises a single proxy core process: finds its executable, derives the
//! run configuration it is started with, starts, stops and restarts it on
//! request or on configuration changes, and keeps the system proxy pointed
//! at its listening port.

pub mod config;
pub mod dashboard;
pub mod engine;
pub mod errors;
pub mod locator;
pub mod logsink;
pub mod process;
pub mod proxy;
pub mod reconcile;
pub mod state;
pub mod supervisor;
pub mod terminate;
pub mod trigger;

pub use engine::{Engine, Status};
pub use errors::{
    EngineError, LocateError, ProxyError, ReconcileError, SupervisorError, TerminateError,
};
pub use process::{ProcessOps, SystemProcessOps};
pub use reconcile::{EffectiveConfig, Reconciler};
pub use state::ProcessState;
pub use supervisor::Supervisor;
pub use trigger::Trigger;
