//! Marker files that let independent processes agree on who owns a data dir.
//!
//! `pid` is created exclusively by the owner and removed on release. `port`
//! is written once the command server is ready. Neither record is ever
//! removed on ambiguity: a record is stale only when its pid is confirmed
//! gone or its port refuses connections.

use std::{
    fs::{self, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::{
    kill::is_pid_running,
    probe::{ProbeOutcome, probe_liveness},
};

pub const PID_FILE_NAME: &str = "pid";
pub const PORT_FILE_NAME: &str = "port";
pub const DAEMON_LOG_NAME: &str = "daemon.log";
pub const EVENT_LOG_NAME: &str = "progress.events.jsonl";
pub const DAEMON_OUT_NAME: &str = "daemon.out";

/// An unparsable pid record younger than this is assumed to be mid-write.
pub const PID_WRITE_GRACE: Duration = Duration::from_secs(2);
pub const CLEANUP_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
pub const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(200);
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum RuntimeFileError {
    #[error("data dir is empty")]
    EmptyDataDir,
    #[error("tag is empty")]
    EmptyTag,
    #[error("playground already running (pid={0})")]
    AlreadyRunningPid(u32),
    #[error("playground already running (port={0})")]
    AlreadyRunningPort(u16),
    #[error("playground is starting (pid file is being written)")]
    Starting,
    #[error("playground command server probe timed out (port={0})")]
    ProbeTimeout(u16),
    #[error("port {port} answered with an unrecognised response: {reason}")]
    PortInUse { port: u16, reason: String },
    #[error("tag {tag:?} is already in use: {source}")]
    AlreadyInUse {
        tag: String,
        #[source]
        source: Box<RuntimeFileError>,
    },
    #[error("timeout waiting for playground to stop")]
    Timeout,
    #[error("invalid {}: {reason}", .path.display())]
    InvalidRecord { path: PathBuf, reason: String },
    #[error("check pid {pid}")]
    PidCheck {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl RuntimeFileError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }

    fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let context = context.into();
        move |source| Self::Io { context, source }
    }
}

type Result<T> = std::result::Result<T, RuntimeFileError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PidRecord {
    pub pid: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub tag: String,
}

impl PidRecord {
    pub fn current(tag: &str) -> Self {
        Self {
            pid: std::process::id(),
            started_at: Some(Utc::now()),
            tag: tag.to_string(),
        }
    }

    pub fn parse(raw: &str) -> std::result::Result<Self, String> {
        let mut pid = None;
        let mut started_at = None;
        let mut tag = String::new();
        for line in raw.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(v) = line.strip_prefix("pid=") {
                let v = v.trim();
                if v.is_empty() {
                    return Err("pid is empty".to_string());
                }
                let parsed: u32 = v.parse().map_err(|e| format!("invalid pid {v:?}: {e}"))?;
                if parsed == 0 {
                    return Err("invalid pid 0".to_string());
                }
                pid = Some(parsed);
            } else if let Some(v) = line.strip_prefix("started_at=") {
                let v = v.trim();
                if v.is_empty() {
                    continue;
                }
                let parsed = DateTime::parse_from_rfc3339(v)
                    .map_err(|e| format!("invalid started_at {v:?}: {e}"))?;
                started_at = Some(parsed.with_timezone(&Utc));
            } else if let Some(v) = line.strip_prefix("tag=") {
                tag = v.trim().to_string();
            }
        }
        let pid = pid.ok_or_else(|| "missing pid field".to_string())?;
        Ok(Self {
            pid,
            started_at,
            tag,
        })
    }

    pub fn render(&self) -> String {
        let started_at = self
            .started_at
            .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();
        format!(
            "pid={}\nstarted_at={}\ntag={}\n",
            self.pid, started_at, self.tag
        )
    }
}

pub fn pid_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PID_FILE_NAME)
}

pub fn port_path(data_dir: &Path) -> PathBuf {
    data_dir.join(PORT_FILE_NAME)
}

pub fn read_pid_record(path: &Path) -> Result<PidRecord> {
    let raw = fs::read_to_string(path)
        .map_err(RuntimeFileError::io(format!("read {}", path.display())))?;
    PidRecord::parse(&raw).map_err(|reason| RuntimeFileError::InvalidRecord {
        path: path.to_path_buf(),
        reason,
    })
}

/// Exclusive create: fails with `AlreadyExists` when a record is present.
pub fn write_pid_record(path: &Path, record: &PidRecord) -> io::Result<()> {
    let mut f = OpenOptions::new().write(true).create_new(true).open(path)?;
    let written = f
        .write_all(record.render().as_bytes())
        .and_then(|()| f.sync_all());
    drop(f);
    if let Err(err) = written {
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

pub fn read_port_record(data_dir: &Path) -> Result<u16> {
    let path = port_path(data_dir);
    let raw = fs::read_to_string(&path)
        .map_err(RuntimeFileError::io(format!("read {}", path.display())))?;
    let raw = raw.trim();
    match raw.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        Ok(_) => Err(RuntimeFileError::InvalidRecord {
            path,
            reason: format!("invalid port {raw:?}"),
        }),
        Err(e) => Err(RuntimeFileError::InvalidRecord {
            path,
            reason: format!("invalid port {raw:?}: {e}"),
        }),
    }
}

/// Replaces the port record atomically so readers never see a partial value.
pub fn write_port_record(data_dir: &Path, port: u16) -> Result<()> {
    let path = port_path(data_dir);
    let tmp = data_dir.join(format!("{PORT_FILE_NAME}.tmp"));
    fs::write(&tmp, format!("{port}\n"))
        .map_err(RuntimeFileError::io(format!("write {}", tmp.display())))?;
    fs::rename(&tmp, &path).map_err(RuntimeFileError::io(format!("write {}", path.display())))
}

pub fn remove_port_record(data_dir: &Path) -> Result<()> {
    remove_if_exists(&port_path(data_dir))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RuntimeFileError::Io {
            context: format!("remove {}", path.display()),
            source: e,
        }),
    }
}

/// True while the file was modified less than the grace period ago.
/// A modification time in the future counts as old.
fn within_write_grace(path: &Path) -> io::Result<bool> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .is_ok_and(|age| age < PID_WRITE_GRACE))
}

enum PortCheck {
    Absent,
    Stale,
}

/// Probes the port record. Every outcome other than absent, unparsable or
/// refused means something may still own the dir.
async fn check_port(data_dir: &Path) -> Result<PortCheck> {
    let port = match read_port_record(data_dir) {
        Ok(port) => port,
        Err(e) if e.is_not_found() => return Ok(PortCheck::Absent),
        Err(RuntimeFileError::InvalidRecord { .. }) => return Ok(PortCheck::Stale),
        Err(e) => return Err(e),
    };
    match probe_liveness(port, CLEANUP_PROBE_TIMEOUT).await {
        ProbeOutcome::Alive => Err(RuntimeFileError::AlreadyRunningPort(port)),
        ProbeOutcome::Refused => Ok(PortCheck::Stale),
        ProbeOutcome::TimedOut => Err(RuntimeFileError::ProbeTimeout(port)),
        ProbeOutcome::Unexpected(reason) => Err(RuntimeFileError::PortInUse { port, reason }),
    }
}

/// Removes records left behind by an owner that is no longer alive.
pub async fn cleanup_stale(data_dir: &Path) -> Result<()> {
    if data_dir.as_os_str().is_empty() {
        return Err(RuntimeFileError::EmptyDataDir);
    }
    let pid_file = pid_path(data_dir);
    let port_file = port_path(data_dir);

    match read_pid_record(&pid_file) {
        Ok(record) => {
            let running = is_pid_running(record.pid).map_err(|source| RuntimeFileError::PidCheck {
                pid: record.pid,
                source,
            })?;
            if running {
                return Err(RuntimeFileError::AlreadyRunningPid(record.pid));
            }
            tracing::info!(
                pid = record.pid,
                dir = %data_dir.display(),
                "removing stale runtime files"
            );
            remove_if_exists(&pid_file)?;
            return remove_if_exists(&port_file);
        }
        Err(e) if e.is_not_found() => {}
        Err(RuntimeFileError::InvalidRecord { reason, .. }) => match within_write_grace(&pid_file) {
            Ok(true) => return Err(RuntimeFileError::Starting),
            Ok(false) => {
                check_port(data_dir).await?;
                let dir = data_dir.display();
                tracing::info!(%reason, %dir, "removing unparsable pid record");
                remove_if_exists(&pid_file)?;
                return remove_if_exists(&port_file);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(RuntimeFileError::Io {
                    context: format!("stat {}", pid_file.display()),
                    source: e,
                });
            }
        },
        Err(e) => return Err(e),
    }

    match check_port(data_dir).await? {
        PortCheck::Absent => Ok(()),
        PortCheck::Stale => {
            tracing::info!(dir = %data_dir.display(), "removing stale port record");
            remove_if_exists(&port_file)
        }
    }
}

/// Ownership of a data dir. Dropping the guard releases it.
#[must_use = "dropping the guard releases the claim"]
#[derive(Debug)]
pub struct ClaimGuard {
    path: PathBuf,
    released: bool,
}

impl ClaimGuard {
    pub fn pid_path(&self) -> &Path {
        &self.path
    }

    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        remove_if_exists(&self.path)
    }
}

impl Drop for ClaimGuard {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            tracing::warn!(error = %err, "release pid record");
        }
    }
}

/// Claims `data_dir` for `tag` by exclusively creating the pid record.
pub async fn claim(data_dir: &Path, tag: &str) -> Result<ClaimGuard> {
    if data_dir.as_os_str().is_empty() {
        return Err(RuntimeFileError::EmptyDataDir);
    }
    let tag = tag.trim();
    if tag.is_empty() {
        return Err(RuntimeFileError::EmptyTag);
    }
    fs::create_dir_all(data_dir)
        .map_err(RuntimeFileError::io(format!("create {}", data_dir.display())))?;

    let in_use = |source: RuntimeFileError| RuntimeFileError::AlreadyInUse {
        tag: tag.to_string(),
        source: Box::new(source),
    };

    cleanup_stale(data_dir).await.map_err(in_use)?;
    let path = pid_path(data_dir);
    loop {
        match write_pid_record(&path, &PidRecord::current(tag)) {
            Ok(()) => {
                tracing::debug!(tag, path = %path.display(), "claimed data dir");
                return Ok(ClaimGuard {
                    path,
                    released: false,
                });
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                cleanup_stale(data_dir).await.map_err(in_use)?;
            }
            Err(e) => {
                return Err(RuntimeFileError::Io {
                    context: format!("write {}", path.display()),
                    source: e,
                });
            }
        }
    }
}

/// Polls until the owner of `data_dir` is gone. A zero timeout means one minute.
pub async fn wait_stopped(data_dir: &Path, timeout: Duration) -> Result<()> {
    if data_dir.as_os_str().is_empty() {
        return Err(RuntimeFileError::EmptyDataDir);
    }
    let timeout = if timeout.is_zero() {
        DEFAULT_WAIT_TIMEOUT
    } else {
        timeout
    };
    let deadline = tokio::time::Instant::now() + timeout;
    let pid_file = pid_path(data_dir);

    loop {
        match read_pid_record(&pid_file) {
            Err(e) if e.is_not_found() => return Ok(()),
            Ok(record) => {
                if let Ok(false) = is_pid_running(record.pid) {
                    remove_if_exists(&pid_file)?;
                    return Ok(());
                }
            }
            Err(_) => match within_write_grace(&pid_file) {
                Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Ok(false) => {
                    if check_port(data_dir).await.is_ok() {
                        remove_if_exists(&pid_file)?;
                        remove_port_record(data_dir)?;
                        return Ok(());
                    }
                }
                _ => {}
            },
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(RuntimeFileError::Timeout);
        }
        tokio::time::sleep(WAIT_POLL_INTERVAL).await;
    }
}
