// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use coremgr::config::{self, Layout, Settings};
use coremgr::logsink::CoreLogSink;
use coremgr::trigger::{ConfigWatcher, WatchTarget};
use coremgr::{Engine, SystemProcessOps, Trigger, locator, proxy};
use log::{error, info, warn};
use tokio::sync::mpsc;

/// Bounds the wait for a trigger in progress at shutdown: a stop, a kill and
/// a start.
const DISPATCH_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Proxy core supervisor
#[derive(Parser, Debug)]
#[command(name = "coremgrd")]
#[command(about = "Runs the proxy core and keeps the system proxy pointed at it")]
struct Args {
    /// Directory holding coremgr.yaml and the core/ directory
    #[arg(short, long, env = "COREMGR_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Core configuration file, overriding the search locations
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// One of error, warn, info, debug, trace
    #[arg(long, default_value = "info", value_parser = parse_level)]
    log_level: log::Level,
}

fn parse_level(s: &str) -> Result<log::Level, String> {
    s.parse().map_err(|_| format!("unknown log level {s:?}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    simple_logger::init_with_level(args.log_level)?;
    info!("coremgrd starting (version {})", env!("CARGO_PKG_VERSION"));

    run(args).await.inspect_err(|e| error!("{e:#}"))?;

    info!("coremgrd shut down");
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let work_dir = match args.work_dir {
        Some(dir) => dir,
        None => config::default_work_dir()?,
    };
    let layout = Layout::new(work_dir);
    let settings = Settings::load_or_init(&layout.settings_path);

    let executable = locator::find_executable(
        &layout.core_dir,
        &settings.core_prefix,
        std::env::consts::EXE_SUFFIX,
    )
    .context("cannot start without a core executable")?;
    info!("core executable: {}", executable.display());

    let raw_config = args
        .config
        .unwrap_or_else(|| layout.resolve_raw_config(&settings));
    info!("core configuration: {}", raw_config.display());

    let sink = Arc::new(CoreLogSink::new(settings.core_log_enabled));
    let ops = SystemProcessOps::new(Arc::clone(&sink));
    let engine = Arc::new(Engine::new(
        &layout,
        settings,
        raw_config.clone(),
        executable,
        ops,
        proxy::platform_proxy(),
        sink,
    ));

    match engine.supervisor().version().await {
        Ok(version) => info!("core version {version}"),
        Err(e) => warn!("{e}"),
    }

    let (tx, rx) = mpsc::unbounded_channel();
    let watchers: Vec<ConfigWatcher> = [
        (raw_config, WatchTarget::Config),
        (layout.settings_path.clone(), WatchTarget::Settings),
    ]
    .into_iter()
    .filter_map(|(path, target)| match ConfigWatcher::new(&path, target, tx.clone()) {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            warn!("not watching {}: {e}", path.display());
            None
        }
    })
    .collect();
    drop(tx);
    let mut dispatcher = tokio::spawn(Arc::clone(&engine).run(rx));
    let mut signals = Signals::register()?;

    engine
        .handle(Trigger::Startup)
        .await
        .context("failed to start the core")?;
    let status = engine.status().await;
    info!(
        "core {} on port {}",
        status.state,
        status.proxy_port.unwrap_or_default()
    );
    for (name, url) in &status.dashboards {
        info!("dashboard {name}: {url}");
    }

    signals.wait(&engine).await;

    // Closing the channel lets an in-flight restart finish before shutdown.
    drop(watchers);
    match tokio::time::timeout(DISPATCH_DRAIN_TIMEOUT, &mut dispatcher).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("watch dispatcher ended abnormally: {e}"),
        Err(_) => {
            warn!("watch dispatcher still busy after {DISPATCH_DRAIN_TIMEOUT:?}, abandoning it");
            dispatcher.abort();
        }
    }
    engine.shutdown().await;
    Ok(())
}

/// Process signals the daemon reacts to, registered before the core starts
/// so an early signal is not lost to its default action.
#[cfg(unix)]
struct Signals {
    term: tokio::signal::unix::Signal,
    int: tokio::signal::unix::Signal,
    hup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn register() -> Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Block until asked to exit. SIGHUP restarts the core.
    async fn wait(&mut self, engine: &Engine<SystemProcessOps>) {
        loop {
            tokio::select! {
                _ = self.term.recv() => {
                    info!("received SIGTERM");
                    return;
                }
                _ = self.int.recv() => {
                    info!("received SIGINT");
                    return;
                }
                _ = self.hup.recv() => {
                    info!("received SIGHUP, restarting core");
                    if let Err(e) = engine.handle(Trigger::UserRestart).await {
                        error!("restart failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn register() -> Result<Self> {
        Ok(Self)
    }

    async fn wait(&mut self, _engine: &Engine<SystemProcessOps>) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C"),
            Err(e) => error!("failed to wait for Ctrl-C: {e}"),
        }
    }
}
