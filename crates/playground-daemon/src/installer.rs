use std::{
    fs::OpenOptions,
    future::Future,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::Context;
use playground_core::Task;
use playground_proto::ServiceKind;

/// What the controller needs to start one service member.
#[derive(Debug, Clone)]
pub struct InstallRequest {
    pub kind: ServiceKind,
    pub name: String,
    pub version: String,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub work_dir: PathBuf,
    /// stdout and stderr are appended here.
    pub log_file: PathBuf,
}

impl LaunchSpec {
    pub fn command(&self) -> anyhow::Result<tokio::process::Command> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .with_context(|| format!("open {}", self.log_file.display()))?;
        let log_err = log
            .try_clone()
            .with_context(|| format!("open {}", self.log_file.display()))?;

        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        Ok(cmd)
    }
}

/// Resolves a runnable component for a service member.
///
/// Implementations may download or unpack binaries and should report on `task`.
pub trait ComponentInstaller: Send + Sync + 'static {
    fn prepare(
        &self,
        req: &InstallRequest,
        task: &Task,
    ) -> impl Future<Output = anyhow::Result<LaunchSpec>> + Send;
}

/// Uses component binaries that already exist under one directory.
#[derive(Debug, Clone)]
pub struct LocalInstaller {
    bin_dir: PathBuf,
}

impl LocalInstaller {
    pub fn new(bin_dir: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }
}

impl ComponentInstaller for LocalInstaller {
    async fn prepare(&self, req: &InstallRequest, task: &Task) -> anyhow::Result<LaunchSpec> {
        let program = self.bin_dir.join(req.kind.binary_name());
        if !program.is_file() {
            anyhow::bail!(
                "{} binary not found at {}",
                req.kind,
                program.display()
            );
        }
        task.set_message(program.display().to_string());

        let log_file = req.work_dir.join(format!("{}.log", req.kind));
        Ok(LaunchSpec {
            program,
            args: vec![
                "--data-dir".to_string(),
                req.work_dir.join("data").display().to_string(),
                "--log-file".to_string(),
                log_file.display().to_string(),
            ],
            env: Vec::new(),
            work_dir: req.work_dir.clone(),
            log_file: req.work_dir.join("stdout.log"),
        })
    }
}
