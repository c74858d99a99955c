//! One playground instance from claim to release.

use std::{fs::OpenOptions, io::Write, path::PathBuf, time::Duration};

use anyhow::Context;
use playground_core::{Progress, ProgressOptions};
use playground_process::{ClaimGuard, ProcessGroup, ShutdownSignal, runtime_files};
use playground_proto::{Command, ServiceKind};

use crate::{
    controller::{Controller, ControllerConfig, ControllerEvent, ControllerHandle, ControllerState},
    installer::ComponentInstaller,
    server::{ServerConfig, listen_and_serve},
};

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub tag: String,
    pub data_dir: PathBuf,
    pub port: u16,
    pub version: String,
    /// Members started before the command server comes up, in order.
    pub boot: Vec<(ServiceKind, u32)>,
    pub stop_grace: Duration,
}

/// Claims the data dir of `config`. Nothing is written under the dir before
/// this succeeds, so a losing daemon leaves the owner's files alone.
pub async fn claim_instance(config: &InstanceConfig) -> anyhow::Result<ClaimGuard> {
    Ok(runtime_files::claim(&config.data_dir, &config.tag).await?)
}

/// Claims the data dir, boots services, serves commands until stopped, then
/// tears everything down and releases the claim.
pub async fn run<I: ComponentInstaller>(
    config: InstanceConfig,
    installer: I,
    progress_out: Box<dyn Write + Send>,
) -> anyhow::Result<()> {
    let claim = claim_instance(&config).await?;
    run_claimed(claim, config, installer, progress_out).await
}

/// [`run`] for a daemon that already holds the claim.
pub async fn run_claimed<I: ComponentInstaller>(
    mut claim: ClaimGuard,
    config: InstanceConfig,
    installer: I,
    progress_out: Box<dyn Write + Send>,
) -> anyhow::Result<()> {
    tracing::info!(
        tag = %config.tag,
        pid_record = %claim.pid_path().display(),
        pid = std::process::id(),
        "instance claimed"
    );

    let event_log_path = config.data_dir.join(runtime_files::EVENT_LOG_NAME);
    let event_log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&event_log_path)
        .with_context(|| format!("open {}", event_log_path.display()))?;
    let progress = Progress::new(ProgressOptions {
        out: progress_out,
        event_log: Some(Box::new(event_log)),
    })
    .context("start progress renderer")?;

    let group = ProcessGroup::new();
    let (controller, handle) = Controller::new(
        ControllerConfig {
            data_dir: config.data_dir.clone(),
            version: config.version.clone(),
            stop_grace: config.stop_grace,
        },
        installer,
        group.clone(),
        progress.clone(),
    );
    group.add("controller", move |shutdown: ShutdownSignal| async move {
        controller.run(shutdown).await;
        Ok::<(), String>(())
    })?;

    let signals = handle.clone();
    group.add("signals", move |shutdown: ShutdownSignal| async move {
        tokio::select! {
            res = termination_signal() => {
                let name = res.map_err(|e| format!("install signal handlers: {e}"))?;
                signals.notify(ControllerEvent::Stop { reason: name.to_string() });
            }
            _ = shutdown.wait() => {}
        }
        Ok::<(), String>(())
    })?;

    let boot_error = boot(&config, &handle).await;
    match &boot_error {
        Some(err) => handle.notify(ControllerEvent::Stop {
            reason: format!("boot failed: {err}"),
        }),
        None => {
            handle.notify(ControllerEvent::ServicesReady);
            let server_config = ServerConfig {
                data_dir: config.data_dir.clone(),
                port: config.port,
            };
            let server_handle = handle.clone();
            let server_progress = progress.clone();
            group.add("command-server", move |shutdown: ShutdownSignal| async move {
                let res = listen_and_serve(
                    &server_config,
                    server_handle.clone(),
                    &server_progress,
                    shutdown,
                )
                .await;
                if let Err(err) = &res {
                    server_handle.notify(ControllerEvent::Stop {
                        reason: format!("command server failed: {err:#}"),
                    });
                }
                res.map_err(|e| format!("{e:#}"))
            })?;
        }
    }

    handle.stopping().await;
    progress.print_lines(["Stopping playground..."]);
    group.close().await;
    let result = group.wait().await;
    progress.print_lines(["Playground stopped."]);
    progress.close().await;

    claim.release()?;
    tracing::info!(tag = %config.tag, "instance released");
    if let Some(err) = boot_error {
        anyhow::bail!(err);
    }
    result.context("playground worker failed")
}

async fn boot(config: &InstanceConfig, handle: &ControllerHandle) -> Option<String> {
    for &(kind, count) in config.boot.iter().filter(|(_, n)| *n > 0) {
        if handle.state() >= ControllerState::Stopping {
            return Some("interrupted".to_string());
        }
        let reply = handle
            .submit(Command::scale_out(kind, count, None))
            .await;
        if !reply.ok {
            return Some(reply.error.unwrap_or_else(|| format!("start {kind} failed")));
        }
    }
    None
}

#[cfg(unix)]
async fn termination_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.map(|()| "interrupt"),
        _ = term.recv() => Ok("terminate"),
    }
}

#[cfg(not(unix))]
async fn termination_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "interrupt")
}
