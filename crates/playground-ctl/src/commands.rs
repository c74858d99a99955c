//! Client-side operations against running instances.

use std::{collections::BTreeMap, future::Future, io::Write, path::PathBuf, time::Duration};

use anyhow::Context;
use futures_util::future::join_all;
use playground_core::{Progress, ProgressOptions, Task, config::format_error_chain};
use playground_process::runtime_files;
use playground_proto::{Command, DisplayItem, ServiceKind, ServiceStatus};
use tokio::time::Instant;

use crate::{
    client::{COMMAND_TIMEOUT, fetch_display, send_command},
    target::{Target, TargetError, list_live, resolve_target},
};

pub const NO_INSTANCES: &str = "No running playground instances found.";

/// Where to look for instances and which one the user named.
#[derive(Debug, Clone)]
pub struct ClientContext {
    pub base: PathBuf,
    pub tag: Option<String>,
    /// Instance directory override; wins over `base/<tag>`.
    pub data_dir: Option<PathBuf>,
}

impl ClientContext {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            tag: None,
            data_dir: None,
        }
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub async fn resolve(&self) -> Result<Target, TargetError> {
        resolve_target(self.tag.as_deref(), self.data_dir.as_deref(), &self.base).await
    }
}

fn write_message(out: &mut dyn Write, message: Option<String>) -> anyhow::Result<()> {
    if let Some(msg) = message.as_deref().map(str::trim_end).filter(|m| !m.is_empty()) {
        writeln!(out, "{msg}")?;
    }
    Ok(())
}

/// The whole stop budget: a zero timeout means the default wait.
fn stop_deadline(timeout: Duration) -> (Duration, Instant) {
    let timeout = if timeout.is_zero() {
        runtime_files::DEFAULT_WAIT_TIMEOUT
    } else {
        timeout
    };
    (timeout, Instant::now() + timeout)
}

/// Runs `fut` until `deadline`; its own timeouts may be longer.
async fn until<T>(
    deadline: Instant,
    timeout: Duration,
    fut: impl Future<Output = anyhow::Result<T>>,
) -> anyhow::Result<T> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => anyhow::bail!("timeout after {timeout:?}"),
    }
}

/// Asks the resolved instance to stop and waits for its pid record to go away.
/// An instance that is already gone is reported and counts as success.
/// `timeout` bounds the whole call.
pub async fn stop(
    ctx: &ClientContext,
    timeout: Duration,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let (timeout, deadline) = stop_deadline(timeout);
    let target = match ctx.resolve().await {
        Ok(target) => target,
        Err(TargetError::NotRunning(msg)) => {
            writeln!(out, "{msg}")?;
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };
    let msg = until(deadline, timeout, async {
        anyhow::Ok(send_command(target.port, &Command::stop(), COMMAND_TIMEOUT).await?)
    })
    .await
    .with_context(|| format!("stop playground {:?}", target.tag))?;
    write_message(out, msg)?;
    until(deadline, timeout, async {
        anyhow::Ok(runtime_files::wait_stopped(&target.dir, timeout).await?)
    })
    .await
    .with_context(|| format!("wait for playground {:?} to stop", target.tag))
}

/// Stops every live instance under the base directory concurrently. Each
/// instance is labelled from its own display reply and then stopped without
/// waiting for the others; `timeout` bounds the whole call.
pub async fn stop_all<W>(
    ctx: &ClientContext,
    timeout: Duration,
    mut out: W,
) -> anyhow::Result<()>
where
    W: Write + Send + 'static,
{
    if ctx.tag.is_some() {
        anyhow::bail!("stop-all does not accept --tag");
    }
    let (timeout, deadline) = stop_deadline(timeout);
    let targets = list_live(&ctx.base).await?;
    if targets.is_empty() {
        writeln!(out, "{NO_INSTANCES}")?;
        return Ok(());
    }

    let progress = Progress::new(ProgressOptions {
        out: Box::new(out),
        event_log: None,
    })
    .context("start progress renderer")?;
    let group = progress.group("Stop clusters");
    let stops = targets.iter().map(|target| {
        let group = group.clone();
        async move {
            let label = stop_label(target, deadline).await;
            let task = group.task(label);
            stop_one(target, timeout, deadline, task).await
        }
    });
    let results = join_all(stops).await;
    group.close();
    progress.sync().await;
    progress.close().await;

    let failed: Vec<&str> = targets
        .iter()
        .zip(&results)
        .filter(|(_, ok)| !**ok)
        .map(|(t, _)| t.tag.as_str())
        .collect();
    if !failed.is_empty() {
        anyhow::bail!("failed to stop {}", failed.join(", "));
    }
    Ok(())
}

/// `<tag> (<versions>)`, or `unknown` versions when display fails in time.
async fn stop_label(target: &Target, deadline: Instant) -> String {
    let display = fetch_display(target.port, COMMAND_TIMEOUT);
    let version = match tokio::time::timeout_at(deadline, display).await {
        Ok(Ok(items)) => summarize_versions(&items),
        Ok(Err(err)) => {
            tracing::debug!(tag = %target.tag, error = %err, "fetch display before stop");
            "unknown".to_string()
        }
        Err(_) => {
            tracing::debug!(tag = %target.tag, "display did not answer before the deadline");
            "unknown".to_string()
        }
    };
    format!("{} ({version})", target.tag)
}

async fn stop_one(target: &Target, timeout: Duration, deadline: Instant, task: Task) -> bool {
    if Instant::now() >= deadline {
        task.cancel(format!("timeout after {timeout:?} before stop was sent"));
        return false;
    }
    task.start();
    let res = until(deadline, timeout, async {
        send_command(target.port, &Command::stop(), COMMAND_TIMEOUT).await?;
        runtime_files::wait_stopped(&target.dir, timeout).await?;
        anyhow::Ok(())
    })
    .await;
    match res {
        Ok(()) => {
            task.done();
            true
        }
        Err(err) => {
            tracing::warn!(tag = %target.tag, error = %err, "stop failed");
            task.error(format_error_chain(&err));
            false
        }
    }
}

/// Lists every live instance with a one-line summary each.
pub async fn ps(ctx: &ClientContext, out: &mut dyn Write) -> anyhow::Result<()> {
    let targets = list_live(&ctx.base).await?;
    if targets.is_empty() {
        writeln!(out, "{NO_INSTANCES}")?;
        return Ok(());
    }

    let displays = join_all(targets.iter().map(|t| fetch_display(t.port, COMMAND_TIMEOUT))).await;
    let mut rows = Vec::with_capacity(targets.len());
    let mut failures = Vec::new();
    for (target, display) in targets.iter().zip(displays) {
        let (version, status, services) = match display {
            Ok(items) => (
                summarize_versions(&items),
                summarize_status(&items),
                summarize_services(&items),
            ),
            Err(err) => {
                let err = anyhow::Error::from(err);
                failures.push(err.context(format!("playground {:?}", target.tag)));
                ("unknown".to_string(), "unknown".to_string(), "-".to_string())
            }
        };
        rows.push(vec![
            target.tag.clone(),
            version,
            status,
            services,
            target.dir.display().to_string(),
        ]);
    }
    write_table(out, &["TAG", "VERSION", "STATUS", "SERVICES", "DIR"], &rows)?;
    for err in failures {
        print_display_failure_warning(out, &err)?;
    }
    Ok(())
}

/// Prints the per-service table of the resolved instance.
pub async fn display(ctx: &ClientContext, out: &mut dyn Write) -> anyhow::Result<()> {
    let target = ctx.resolve().await?;
    let items = fetch_display(target.port, COMMAND_TIMEOUT).await?;
    if items.is_empty() {
        writeln!(out, "Playground {:?} has no services.", target.tag)?;
        return Ok(());
    }
    let rows: Vec<Vec<String>> = items
        .iter()
        .map(|item| {
            vec![
                item.name.clone(),
                item.service_id.to_string(),
                item.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
                item.status.as_str().to_string(),
                item.version.clone(),
            ]
        })
        .collect();
    write_table(out, &["NAME", "SERVICE", "PID", "STATUS", "VERSION"], &rows)
}

pub async fn scale_out(
    ctx: &ClientContext,
    service: ServiceKind,
    count: u32,
    version: Option<String>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    if count == 0 {
        anyhow::bail!("scale-out count must be at least 1");
    }
    let target = ctx.resolve().await?;
    let cmd = Command::scale_out(service, count, version);
    let msg = send_command(target.port, &cmd, COMMAND_TIMEOUT).await?;
    write_message(out, msg)
}

pub async fn scale_in(
    ctx: &ClientContext,
    name: Option<String>,
    pid: Option<u32>,
    out: &mut dyn Write,
) -> anyhow::Result<()> {
    let command = match (name, pid) {
        (Some(name), _) => Command::scale_in_name(name),
        (None, Some(pid)) => Command::scale_in_pid(pid),
        (None, None) => anyhow::bail!("scale-in requires --name or --pid"),
    };
    let target = ctx.resolve().await?;
    let msg = send_command(target.port, &command, COMMAND_TIMEOUT).await?;
    write_message(out, msg)
}

/// Writes a display failure as a single warning line. The error text already
/// carries the instance's own message, so nothing is prefixed to it twice.
pub fn print_display_failure_warning(
    out: &mut dyn Write,
    err: &anyhow::Error,
) -> std::io::Result<()> {
    writeln!(out, "Warning: display failed: {}", format_error_chain(err))
}

fn summarize_versions(items: &[DisplayItem]) -> String {
    let mut versions: Vec<&str> = items
        .iter()
        .map(|i| i.version.as_str())
        .filter(|v| !v.is_empty())
        .collect();
    versions.sort_unstable();
    versions.dedup();
    if versions.is_empty() {
        "unknown".to_string()
    } else {
        versions.join(",")
    }
}

fn summarize_status(items: &[DisplayItem]) -> String {
    if items.is_empty() {
        return "empty".to_string();
    }
    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item.status.as_str()).or_default() += 1;
    }
    if counts.len() == 1 && counts.contains_key(ServiceStatus::Running.as_str()) {
        return ServiceStatus::Running.as_str().to_string();
    }
    counts
        .iter()
        .map(|(status, n)| format!("{status}:{n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn summarize_services(items: &[DisplayItem]) -> String {
    let mut counts: BTreeMap<ServiceKind, usize> = BTreeMap::new();
    for item in items {
        *counts.entry(item.service_id).or_default() += 1;
    }
    if counts.is_empty() {
        return "-".to_string();
    }
    counts
        .iter()
        .map(|(kind, n)| format!("{kind}:{n}"))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_table(out: &mut dyn Write, header: &[&str], rows: &[Vec<String>]) -> anyhow::Result<()> {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }
    let line = |cells: Vec<&str>| {
        let mut s = String::new();
        for (i, (cell, &w)) in cells.iter().zip(&widths).enumerate() {
            if i + 1 == cells.len() {
                s.push_str(cell);
            } else {
                s.push_str(&format!("{cell:<w$}  "));
            }
        }
        s
    };
    writeln!(out, "{}", line(header.to_vec()))?;
    for row in rows {
        writeln!(out, "{}", line(row.iter().map(String::as_str).collect()))?;
    }
    Ok(())
}
