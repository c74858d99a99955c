//! Finds the running instance a client invocation refers to.

use std::{
    io,
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::future::join_all;
use playground_process::{ProbeOutcome, RuntimeFileError, probe_liveness, runtime_files};

pub const RESOLVE_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub tag: String,
    pub dir: PathBuf,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    #[error("{0}")]
    NotRunning(String),
    #[error("playground {tag:?} on port {port} is unreachable: {reason}")]
    Unreachable { tag: String, port: u16, reason: String },
    #[error("multiple playgrounds found ({}); pass --tag to choose one", .tags.join(", "))]
    MultipleFound { tags: Vec<String> },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

/// True when the failure means "nothing is running", so a hint helps.
pub fn should_suggest_not_running(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<TargetError>(),
            Some(TargetError::NotRunning(_))
        )
    })
}

fn not_running(tag: &str) -> TargetError {
    TargetError::NotRunning(format!("playground {tag:?} is not running"))
}

fn dir_tag(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| dir.display().to_string())
}

/// Resolves a target from an explicit tag or data dir, or by scanning `base`.
pub async fn resolve_target(
    tag: Option<&str>,
    data_dir: Option<&Path>,
    base: &Path,
) -> Result<Target, TargetError> {
    match (tag, data_dir) {
        (Some(tag), dir) => {
            let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| base.join(tag));
            resolve_dir(tag, dir).await
        }
        (None, Some(dir)) => resolve_dir(&dir_tag(dir), dir.to_path_buf()).await,
        (None, None) => {
            let mut live = list_live(base).await?;
            match live.len() {
                0 => Err(TargetError::NotRunning(
                    "no running playground found".to_string(),
                )),
                1 => Ok(live.remove(0)),
                _ => Err(TargetError::MultipleFound {
                    tags: live.into_iter().map(|t| t.tag).collect(),
                }),
            }
        }
    }
}

async fn resolve_dir(tag: &str, dir: PathBuf) -> Result<Target, TargetError> {
    if !dir.is_dir() {
        return Err(not_running(tag));
    }
    let port = match runtime_files::read_port_record(&dir) {
        Ok(port) => port,
        Err(RuntimeFileError::InvalidRecord { .. }) => return Err(not_running(tag)),
        Err(e) if e.is_not_found() => return Err(not_running(tag)),
        Err(e) => {
            return Err(TargetError::Io {
                context: format!("read port record of {tag:?}"),
                source: io::Error::other(e.to_string()),
            });
        }
    };
    match probe_liveness(port, RESOLVE_PROBE_TIMEOUT).await {
        ProbeOutcome::Alive => Ok(Target {
            tag: tag.to_string(),
            dir,
            port,
        }),
        ProbeOutcome::Refused => Err(not_running(tag)),
        ProbeOutcome::TimedOut => Err(TargetError::Unreachable {
            tag: tag.to_string(),
            port,
            reason: format!(
                "probe playground timed out after {}s",
                RESOLVE_PROBE_TIMEOUT.as_secs()
            ),
        }),
        ProbeOutcome::Unexpected(reason) => Err(TargetError::Unreachable {
            tag: tag.to_string(),
            port,
            reason: format!("probe playground: {reason}"),
        }),
    }
}

/// Every instance under `base` whose command server answers, sorted by tag.
/// A missing `base` yields an empty list.
pub async fn list_live(base: &Path) -> Result<Vec<Target>, TargetError> {
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(TargetError::Io {
                context: format!("read {}", base.display()),
                source,
            });
        }
    };

    let mut candidates = Vec::new();
    for entry in entries.flatten() {
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }
        let Ok(port) = runtime_files::read_port_record(&dir) else {
            continue;
        };
        candidates.push(Target {
            tag: dir_tag(&dir),
            dir,
            port,
        });
    }

    let probes = candidates.into_iter().map(|target| async move {
        let outcome = probe_liveness(target.port, RESOLVE_PROBE_TIMEOUT).await;
        if !outcome.is_alive() {
            tracing::debug!(tag = %target.tag, port = target.port, %outcome, "skipping instance");
        }
        outcome.is_alive().then_some(target)
    });
    let mut live: Vec<Target> = join_all(probes).await.into_iter().flatten().collect();
    live.sort_by(|a, b| a.tag.cmp(&b.tag));
    Ok(live)
}
