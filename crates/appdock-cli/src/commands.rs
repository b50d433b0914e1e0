use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use appdock_upgrade::{Orchestrator, ViewHost};
use futures::future::join_all;
use semver::Version;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::config::ResolvedConfig;
use crate::render::{
    format_handle, format_load_failure, format_outcome, format_status_lines, format_swap_report,
    TerminalRenderer,
};
use crate::Commands;

/// Headless host: there are no views to refresh, so staged upgrades are only
/// logged.
struct LoggingViewHost;

impl ViewHost for LoggingViewHost {
    fn notify_upgraded(&self, name: &str, version: &Version) {
        info!(app = name, %version, "upgrade staged, applies at shutdown");
    }
}

pub async fn run(command: Commands, resolved: ResolvedConfig) -> Result<()> {
    let renderer = TerminalRenderer::current();
    let orchestrator = Orchestrator::start_http(
        resolved.host,
        &resolved.root,
        Arc::new(LoggingViewHost),
    )
    .await
    .context("failed to initialize package transport")?;

    let result = match command {
        Commands::Load { name } => load(&orchestrator, renderer, &name).await,
        Commands::Sync => sync(&orchestrator, renderer).await,
        Commands::Run => run_until_interrupted(&orchestrator, renderer).await,
        Commands::Status => {
            renderer.print_lines(&format_status_lines(
                &orchestrator.status().await,
                renderer.style(),
            ));
            Ok(())
        }
        Commands::Unload { name } => orchestrator
            .unload(&name)
            .await
            .with_context(|| format!("failed to unload {name}"))
            .map(|()| renderer.print_status("ok", &format!("{name}: unloaded"))),
        Commands::Activate { name } => orchestrator
            .activate(&name)
            .await
            .with_context(|| format!("failed to activate {name}"))
            .map(|()| renderer.print_status("ok", &format!("{name}: active"))),
        Commands::Remove { name } => orchestrator
            .remove(&name)
            .await
            .with_context(|| format!("failed to remove {name}"))
            .map(|()| renderer.print_status("ok", &format!("{name}: removed"))),
        Commands::Completions { .. } => Ok(()),
    };

    shutdown(orchestrator, renderer).await;
    result
}

async fn load(orchestrator: &Orchestrator, renderer: TerminalRenderer, name: &str) -> Result<()> {
    let handle = orchestrator
        .load_or_upgrade(name)
        .await
        .with_context(|| format!("failed to load {name}"))?;
    if let Err(err) = orchestrator.activate(name).await {
        warn!(app = name, "failed to persist active app: {err}");
    }
    renderer.print_status("ok", &format_handle(&handle));
    Ok(())
}

async fn sync(orchestrator: &Orchestrator, renderer: TerminalRenderer) -> Result<()> {
    restore_session(orchestrator, renderer).await?;
    refresh(orchestrator, renderer).await;
    Ok(())
}

async fn run_until_interrupted(orchestrator: &Orchestrator, renderer: TerminalRenderer) -> Result<()> {
    sync(orchestrator, renderer).await?;

    let period = orchestrator.config().refresh_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(?period, "watching for upgrades, press ctrl-c to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted, shutting down");
                return Ok(());
            }
            _ = ticker.tick() => refresh(orchestrator, renderer).await,
        }
    }
}

async fn restore_session(orchestrator: &Orchestrator, renderer: TerminalRenderer) -> Result<()> {
    let names = orchestrator.session_apps().await;
    renderer.print_section("session");

    let progress = renderer.start_session();
    let loads = names.iter().map(|name| {
        let spinner = progress.spinner(name);
        async move {
            let result = orchestrator.load_or_upgrade(name).await;
            spinner.finish();
            (name, result)
        }
    });
    let results = join_all(loads).await;

    let mut failed = Vec::new();
    for (name, result) in results {
        match result {
            Ok(handle) => renderer.print_status("ok", &format_handle(&handle)),
            Err(err) => {
                renderer.print_status("error", &format_load_failure(name, &err));
                failed.push(name.as_str());
            }
        }
    }
    renderer.print_status(
        "step",
        &format!(
            "restored {} of {} apps{}",
            names.len() - failed.len(),
            names.len(),
            progress.elapsed_suffix()
        ),
    );

    if failed.len() == names.len() && !names.is_empty() {
        return Err(anyhow!("no app could be loaded: {}", failed.join(", ")));
    }
    Ok(())
}

async fn refresh(orchestrator: &Orchestrator, renderer: TerminalRenderer) {
    renderer.print_section("upgrades");
    for (name, result) in orchestrator.refresh_installed_apps().await {
        let (status, message) = format_outcome(&name, &result);
        renderer.print_status(status, &message);
    }
}

async fn shutdown(orchestrator: Orchestrator, renderer: TerminalRenderer) {
    let report = orchestrator.shutdown().await;
    for (status, message) in format_swap_report(&report) {
        renderer.print_status(status, &message);
    }
}
