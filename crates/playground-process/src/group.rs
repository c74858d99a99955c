//! A set of named workers that start independently and stop together.

use std::{
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    process::ExitStatus,
    sync::{Arc, Mutex},
    time::Duration,
};

use futures_util::FutureExt;
use tokio::sync::watch;

use crate::kill::{Signal, kill_process_or_group};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GroupError {
    #[error("process group is closing")]
    Closing,
    #[error("{label}: {message}")]
    Worker { label: String, message: String },
}

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("process group is closing")]
    Closing,
    #[error("spawn {label}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },
    #[error("spawn {label}: child has no pid")]
    NoPid { label: String },
}

/// Handed to every worker; resolves once the group starts closing.
#[derive(Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_set(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|closing| *closing).await;
    }
}

struct Inner {
    closing: Mutex<bool>,
    shutdown: watch::Sender<bool>,
    running: watch::Sender<usize>,
    first_error: Mutex<Option<GroupError>>,
}

#[derive(Clone)]
pub struct ProcessGroup {
    inner: Arc<Inner>,
}

impl Default for ProcessGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessGroup {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                closing: Mutex::new(false),
                shutdown: watch::Sender::new(false),
                running: watch::Sender::new(0),
                first_error: Mutex::new(None),
            }),
        }
    }

    pub fn is_closing(&self) -> bool {
        *self.inner.closing.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.inner.shutdown.subscribe(),
        }
    }

    /// Starts `worker` as a member. A worker error or panic is recorded under
    /// `label` and surfaced by [`ProcessGroup::wait`].
    pub fn add<F, Fut, E>(&self, label: impl Into<String>, worker: F) -> Result<(), GroupError>
    where
        F: FnOnce(ShutdownSignal) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let label = label.into();
        let closing = self.inner.closing.lock().unwrap_or_else(|e| e.into_inner());
        if *closing {
            return Err(GroupError::Closing);
        }
        self.inner.running.send_modify(|n| *n += 1);
        let signal = self.shutdown_signal();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(async move { worker(signal).await })
                .catch_unwind()
                .await;
            let failure = match outcome {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(panic) => Some(panic_message(panic.as_ref())),
            };
            if let Some(message) = failure {
                tracing::warn!(worker = %label, error = %message, "process group worker failed");
                let mut first = inner.first_error.lock().unwrap_or_else(|e| e.into_inner());
                if first.is_none() {
                    *first = Some(GroupError::Worker { label, message });
                }
            }
            inner.running.send_modify(|n| *n = n.saturating_sub(1));
        });
        drop(closing);
        Ok(())
    }

    /// Signals every worker and waits for all of them. Safe to call repeatedly.
    pub async fn close(&self) {
        {
            let mut closing = self.inner.closing.lock().unwrap_or_else(|e| e.into_inner());
            *closing = true;
            self.inner.shutdown.send_replace(true);
        }
        self.wait_idle().await;
    }

    /// Waits for all workers to exit and returns the first recorded failure.
    pub async fn wait(&self) -> Result<(), GroupError> {
        self.wait_idle().await;
        match self
            .inner
            .first_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn wait_idle(&self) {
        let mut rx = self.inner.running.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

/// How a supervised process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceExit {
    pub code: Option<i32>,
    pub success: bool,
    pub error: Option<String>,
    /// The exit followed a stop request or group shutdown.
    pub requested: bool,
}

impl ServiceExit {
    fn from_wait(res: std::io::Result<ExitStatus>, requested: bool) -> Self {
        match res {
            Ok(status) => Self {
                code: status.code(),
                success: status.success(),
                error: None,
                requested,
            },
            Err(e) => Self {
                code: None,
                success: false,
                error: Some(e.to_string()),
                requested,
            },
        }
    }
}

pub struct SupervisedProcess {
    pub pid: u32,
    stop: watch::Sender<bool>,
}

impl SupervisedProcess {
    /// Asks the supervisor to terminate the process group.
    pub fn request_stop(&self) {
        self.stop.send_replace(true);
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

/// Spawns `command` as the leader of its own session and supervises it in `group`.
///
/// On group shutdown or [`SupervisedProcess::request_stop`] the whole process
/// group receives SIGTERM, then SIGKILL once `grace` elapses. The child is
/// always reaped before `on_exit` runs.
pub fn spawn_supervised<F>(
    group: &ProcessGroup,
    label: impl Into<String>,
    mut command: tokio::process::Command,
    grace: Duration,
    on_exit: F,
) -> Result<SupervisedProcess, SpawnError>
where
    F: FnOnce(ServiceExit) + Send + 'static,
{
    let label = label.into();
    if group.is_closing() {
        return Err(SpawnError::Closing);
    }

    #[cfg(unix)]
    unsafe {
        command.pre_exec(|| {
            set_parent_death_signal()?;
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }
    command.kill_on_drop(true);

    let mut child = command.spawn().map_err(|source| SpawnError::Spawn {
        label: label.clone(),
        source,
    })?;
    let Some(pid) = child.id() else {
        return Err(SpawnError::NoPid { label });
    };

    let (stop_tx, mut stop_rx) = watch::channel(false);
    let worker_label = label.clone();
    let added = group.add(label.clone(), move |shutdown: ShutdownSignal| async move {
        enum Wake {
            Exited(std::io::Result<ExitStatus>),
            Stop,
        }
        let wake = tokio::select! {
            res = child.wait() => Wake::Exited(res),
            _ = shutdown.wait() => Wake::Stop,
            _ = stop_requested(&mut stop_rx) => Wake::Stop,
        };
        let exit = match wake {
            Wake::Exited(res) => ServiceExit::from_wait(res, false),
            Wake::Stop => {
                tracing::info!(service = %worker_label, pid, "stopping service");
                ServiceExit::from_wait(terminate(&mut child, pid, grace).await, true)
            }
        };
        tracing::info!(
            service = %worker_label,
            pid,
            code = ?exit.code,
            requested = exit.requested,
            "service exited"
        );
        on_exit(exit);
        Ok::<(), String>(())
    });
    if added.is_err() {
        let _ = kill_process_or_group(pid, Signal::Kill);
        return Err(SpawnError::Closing);
    }
    tracing::debug!(service = %label, pid, "spawned supervised service");
    Ok(SupervisedProcess { pid, stop: stop_tx })
}

async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

async fn terminate(
    child: &mut tokio::process::Child,
    pid: u32,
    grace: Duration,
) -> std::io::Result<ExitStatus> {
    if let Err(err) = kill_process_or_group(pid, Signal::Terminate) {
        tracing::debug!(pid, error = %err, "SIGTERM failed");
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(res) => res,
        Err(_) => {
            let grace_ms = grace.as_millis() as u64;
            tracing::warn!(pid, grace_ms, "service ignored SIGTERM, sending SIGKILL");
            if let Err(err) = kill_process_or_group(pid, Signal::Kill) {
                tracing::debug!(pid, error = %err, "SIGKILL failed");
            }
            child.wait().await
        }
    }
}
