//! Starts a playground daemon in the background and waits until it serves.

use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use anyhow::Context;
use playground_core::config;
use playground_process::{probe_liveness, runtime_files};
use playground_proto::ServiceKind;

use crate::target::{RESOLVE_PROBE_TIMEOUT, Target};

pub const DAEMON_BIN_NAME: &str = "playground-daemon";

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub tag: String,
    /// Defaults to `<base>/<tag>`.
    pub data_dir: Option<PathBuf>,
    pub daemon_bin: PathBuf,
    pub port: u16,
    pub version: String,
    pub bin_dir: Option<PathBuf>,
    pub services: Vec<(ServiceKind, u32)>,
    pub ready_timeout: Duration,
}

/// `PLAYGROUND_DAEMON_BIN`, else the daemon installed next to this executable.
pub fn daemon_binary() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::env_path(config::ENV_DAEMON_BIN) {
        return Ok(path);
    }
    let exe = std::env::current_exe().context("locate current executable")?;
    let dir = exe
        .parent()
        .with_context(|| format!("{} has no parent directory", exe.display()))?;
    Ok(dir.join(DAEMON_BIN_NAME))
}

pub async fn start(
    base: &Path,
    opts: &StartOptions,
    out: &mut dyn Write,
) -> anyhow::Result<Target> {
    if opts.tag.trim().is_empty() {
        anyhow::bail!("start requires a non-empty --tag");
    }
    let dir = opts.data_dir.clone().unwrap_or_else(|| base.join(&opts.tag));
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    runtime_files::cleanup_stale(&dir)
        .await
        .with_context(|| format!("playground {:?}", opts.tag))?;

    if !opts.daemon_bin.is_file() {
        anyhow::bail!(
            "daemon binary not found at {} (set {})",
            opts.daemon_bin.display(),
            config::ENV_DAEMON_BIN
        );
    }

    let out_path = dir.join(runtime_files::DAEMON_OUT_NAME);
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&out_path)
        .with_context(|| format!("open {}", out_path.display()))?;
    let log_err = log
        .try_clone()
        .with_context(|| format!("clone {}", out_path.display()))?;

    let mut cmd = std::process::Command::new(&opts.daemon_bin);
    cmd.arg("--tag")
        .arg(&opts.tag)
        .arg("--data-dir")
        .arg(&dir)
        .arg("--port")
        .arg(opts.port.to_string())
        .arg("--version")
        .arg(&opts.version);
    if let Some(bin_dir) = &opts.bin_dir {
        cmd.arg("--bin-dir").arg(bin_dir);
    }
    for (kind, count) in &opts.services {
        cmd.arg(format!("--{kind}")).arg(count.to_string());
    }
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawn {}", opts.daemon_bin.display()))?;
    tracing::info!(tag = %opts.tag, pid = child.id(), dir = %dir.display(), "daemon spawned");

    let deadline = tokio::time::Instant::now() + opts.ready_timeout;
    loop {
        if let Some(status) = child.try_wait().context("poll daemon")? {
            anyhow::bail!(
                "playground daemon exited during startup ({status}); see {}",
                out_path.display()
            );
        }
        if let Ok(port) = runtime_files::read_port_record(&dir)
            && probe_liveness(port, RESOLVE_PROBE_TIMEOUT).await.is_alive()
        {
            writeln!(out, "Playground {:?} is running on 127.0.0.1:{port}", opts.tag)?;
            return Ok(Target {
                tag: opts.tag.clone(),
                dir,
                port,
            });
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!(
                "timed out after {}s waiting for playground {:?} to become ready; see {}",
                opts.ready_timeout.as_secs(),
                opts.tag,
                out_path.display()
            );
        }
        tokio::time::sleep(runtime_files::WAIT_POLL_INTERVAL).await;
    }
}
