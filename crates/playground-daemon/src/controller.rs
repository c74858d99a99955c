//! Single owner of all mutable instance state.
//!
//! Commands from the command server and lifecycle events from workers are
//! serialized through one task. Nothing else touches the service table.

use std::{path::PathBuf, time::Duration};

use playground_core::Progress;
use playground_process::{ProcessGroup, ServiceExit, ShutdownSignal, spawn_supervised};
use playground_proto::{Command, CommandReply, CommandType, ServiceKind, ServiceStatus};
use tokio::sync::{mpsc, oneshot, watch};

use crate::{
    installer::{ComponentInstaller, InstallRequest},
    services::{ServiceRecord, ServiceTable},
};

pub const STOPPING_REPLY: &str = "Stopping playground...\n";

const COMMAND_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ControllerState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

#[derive(Debug)]
pub enum ControllerEvent {
    Stop { reason: String },
    ServicesReady,
    ServiceExited { name: String, exit: ServiceExit },
}

pub struct CommandRequest {
    pub command: Command,
    pub reply: oneshot::Sender<CommandReply>,
}

#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<CommandRequest>,
    events: mpsc::UnboundedSender<ControllerEvent>,
    state: watch::Receiver<ControllerState>,
}

impl ControllerHandle {
    /// Queues `command` and waits for the controller's reply.
    pub async fn submit(&self, command: Command) -> CommandReply {
        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(CommandRequest { command, reply })
            .await
            .is_err()
        {
            return CommandReply::error("playground is stopped");
        }
        rx.await
            .unwrap_or_else(|_| CommandReply::error("playground is stopped"))
    }

    pub fn notify(&self, event: ControllerEvent) {
        let _ = self.events.send(event);
    }

    pub fn state(&self) -> ControllerState {
        *self.state.borrow()
    }

    pub async fn stopping(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s >= ControllerState::Stopping).await;
    }

    pub async fn stopped(&self) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == ControllerState::Stopped).await;
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub data_dir: PathBuf,
    pub version: String,
    pub stop_grace: Duration,
}

pub struct Controller<I> {
    config: ControllerConfig,
    installer: I,
    group: ProcessGroup,
    progress: Progress,
    services: ServiceTable,
    commands: mpsc::Receiver<CommandRequest>,
    events: mpsc::UnboundedReceiver<ControllerEvent>,
    events_tx: mpsc::UnboundedSender<ControllerEvent>,
    state: watch::Sender<ControllerState>,
}

impl<I: ComponentInstaller> Controller<I> {
    pub fn new(
        config: ControllerConfig,
        installer: I,
        group: ProcessGroup,
        progress: Progress,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(ControllerState::Starting);
        let handle = ControllerHandle {
            commands: commands_tx,
            events: events_tx.clone(),
            state: state_rx,
        };
        let controller = Self {
            config,
            installer,
            group,
            progress,
            services: ServiceTable::default(),
            commands,
            events,
            events_tx,
            state,
        };
        (controller, handle)
    }

    fn current(&self) -> ControllerState {
        *self.state.borrow()
    }

    /// Runs until `shutdown` fires. Events already queued at that point are
    /// still handled, and queued commands get an error reply.
    pub async fn run(mut self, shutdown: ShutdownSignal) {
        loop {
            tokio::select! {
                biased;
                Some(event) = self.events.recv() => self.handle_event(event),
                Some(request) = self.commands.recv() => {
                    let reply = self.handle_command(request.command).await;
                    let _ = request.reply.send(reply);
                }
                _ = shutdown.wait() => break,
            }
        }

        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event);
        }
        self.enter_stopping("shutdown");

        self.commands.close();
        while let Ok(request) = self.commands.try_recv() {
            let _ = request
                .reply
                .send(CommandReply::error("playground is stopped"));
        }
        self.state.send_replace(ControllerState::Stopped);
        tracing::info!(services = self.services.len(), "controller stopped");
    }

    fn enter_stopping(&mut self, reason: &str) {
        if self.current() >= ControllerState::Stopping {
            return;
        }
        tracing::info!(reason, "playground stopping");
        self.state.send_replace(ControllerState::Stopping);
    }

    fn handle_event(&mut self, event: ControllerEvent) {
        match event {
            ControllerEvent::Stop { reason } => self.enter_stopping(&reason),
            ControllerEvent::ServicesReady => {
                if self.current() == ControllerState::Starting {
                    self.state.send_replace(ControllerState::Running);
                    tracing::info!(services = self.services.len(), "playground running");
                }
            }
            ControllerEvent::ServiceExited { name, exit } => self.service_exited(&name, exit),
        }
    }

    fn service_exited(&mut self, name: &str, exit: ServiceExit) {
        let Some(record) = self.services.get_mut(name) else {
            return;
        };
        if exit.requested || record.status == ServiceStatus::Stopping {
            self.services.remove(name);
            tracing::info!(service = name, "service removed");
            return;
        }
        record.status = if exit.success {
            ServiceStatus::Exited
        } else {
            ServiceStatus::Failed
        };
        tracing::warn!(
            service = name,
            code = ?exit.code,
            error = exit.error.as_deref().unwrap_or(""),
            "service exited unexpectedly"
        );
    }

    async fn handle_command(&mut self, command: Command) -> CommandReply {
        let state = self.current();
        match command.kind {
            CommandType::Display => self.display(),
            CommandType::Stop => {
                self.enter_stopping("stop command");
                CommandReply::ok(STOPPING_REPLY)
            }
            CommandType::ScaleOut | CommandType::ScaleIn
                if state >= ControllerState::Stopping =>
            {
                CommandReply::error("playground is stopping")
            }
            CommandType::ScaleOut => self.scale_out(&command).await,
            CommandType::ScaleIn => self.scale_in(&command),
        }
    }

    fn display(&self) -> CommandReply {
        match serde_json::to_string(&self.services.display_items()) {
            Ok(json) => CommandReply::ok(json),
            Err(e) => CommandReply::error(format!("encode display: {e}")),
        }
    }

    async fn scale_out(&mut self, command: &Command) -> CommandReply {
        let Some(service) = command.service.as_deref() else {
            return CommandReply::error("scale-out requires a service");
        };
        let kind: ServiceKind = match service.parse() {
            Ok(kind) => kind,
            Err(e) => return CommandReply::error(e),
        };
        let count = command.count.unwrap_or(1);
        if count == 0 {
            return CommandReply::error("scale-out count must be positive");
        }
        let version = command
            .version
            .clone()
            .unwrap_or_else(|| self.config.version.clone());

        let group = self.progress.group(format!("Start {kind} instances"));
        let mut started = Vec::new();
        let mut failure = None;
        for _ in 0..count {
            match self.start_one(kind, &version, &group).await {
                Ok(name) => started.push(name),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        group.close();

        match failure {
            None => CommandReply::ok(format!("Started {}\n", started.join(", "))),
            Some(e) if started.is_empty() => CommandReply::error(e),
            Some(e) => {
                let started = started.join(", ");
                CommandReply::error(format!("started {started} before failing: {e}"))
            }
        }
    }

    async fn start_one(
        &mut self,
        kind: ServiceKind,
        version: &str,
        progress: &playground_core::Group,
    ) -> Result<String, String> {
        let (name, ordinal) = self.services.allocate(kind);
        let task = progress.task(name.clone());
        task.set_meta(version);
        task.start();

        let work_dir = self.config.data_dir.join(&name);
        if let Err(e) = std::fs::create_dir_all(&work_dir) {
            let msg = format!("create {}: {e}", work_dir.display());
            task.error(msg.clone());
            return Err(msg);
        }
        let req = InstallRequest {
            kind,
            name: name.clone(),
            version: version.to_string(),
            work_dir,
        };
        let spec = match self.installer.prepare(&req, &task).await {
            Ok(spec) => spec,
            Err(e) => {
                let msg = format!("prepare {name}: {e:#}");
                task.error(msg.clone());
                return Err(msg);
            }
        };
        let cmd = match spec.command() {
            Ok(cmd) => cmd,
            Err(e) => {
                let msg = format!("{e:#}");
                task.error(msg.clone());
                return Err(msg);
            }
        };

        let events = self.events_tx.clone();
        let exited = name.clone();
        let grace = self.config.stop_grace;
        let process = spawn_supervised(&self.group, name.clone(), cmd, grace, move |exit| {
            let _ = events.send(ControllerEvent::ServiceExited { name: exited, exit });
        })
        .map_err(|e| {
            let msg = e.to_string();
            task.error(msg.clone());
            msg
        })?;

        tracing::info!(service = %name, pid = process.pid, version, "service started");
        self.services.insert(ServiceRecord {
            name: name.clone(),
            kind,
            ordinal,
            version: version.to_string(),
            status: ServiceStatus::Running,
            process,
        });
        task.done();
        Ok(name)
    }

    fn scale_in(&mut self, command: &Command) -> CommandReply {
        let name = match (command.name.as_deref(), command.pid) {
            (Some(name), _) => name.to_string(),
            (None, Some(pid)) => match self.services.name_for_pid(pid) {
                Some(name) => name,
                None => return CommandReply::error(format!("no service with pid {pid}")),
            },
            (None, None) => return CommandReply::error("scale-in requires a name or pid"),
        };
        let Some(record) = self.services.get_mut(&name) else {
            return CommandReply::error(format!("service {name} not found"));
        };
        if record.status == ServiceStatus::Stopping {
            return CommandReply::ok(format!("{name} is already stopping\n"));
        }
        if matches!(record.status, ServiceStatus::Exited | ServiceStatus::Failed) {
            self.services.remove(&name);
            return CommandReply::ok(format!("Removed {name}\n"));
        }
        record.status = ServiceStatus::Stopping;
        record.process.request_stop();
        tracing::info!(service = %name, pid = record.process.pid, "scaling in");
        CommandReply::ok(format!("Stopping {name} (pid {})\n", record.process.pid))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::installer::LaunchSpec;
    use playground_core::Task;
    use playground_proto::DisplayItem;

    /// Launches `sleep` for every member.
    #[derive(Clone)]
    pub(crate) struct SleepInstaller;

    impl ComponentInstaller for SleepInstaller {
        async fn prepare(&self, req: &InstallRequest, _task: &Task) -> anyhow::Result<LaunchSpec> {
            Ok(LaunchSpec {
                program: "sleep".into(),
                args: vec!["1000".to_string()],
                env: Vec::new(),
                work_dir: req.work_dir.clone(),
                log_file: req.work_dir.join("stdout.log"),
            })
        }
    }

    struct FailingInstaller;

    impl ComponentInstaller for FailingInstaller {
        async fn prepare(&self, _req: &InstallRequest, _task: &Task) -> anyhow::Result<LaunchSpec> {
            anyhow::bail!("no binary")
        }
    }

    fn spawn<I: ComponentInstaller>(
        installer: I,
        dir: &std::path::Path,
    ) -> (ControllerHandle, ProcessGroup, tokio::task::JoinHandle<()>, ProcessGroup) {
        let services = ProcessGroup::new();
        let (controller, handle) = Controller::new(
            ControllerConfig {
                data_dir: dir.to_path_buf(),
                version: "v8.5.4".to_string(),
                stop_grace: Duration::from_secs(2),
            },
            installer,
            services.clone(),
            Progress::disabled(),
        );
        let lifecycle = ProcessGroup::new();
        let shutdown = lifecycle.shutdown_signal();
        let task = tokio::spawn(controller.run(shutdown));
        (handle, services, task, lifecycle)
    }

    fn items(reply: &CommandReply) -> Vec<DisplayItem> {
        serde_json::from_str(reply.message.as_deref().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn drains_queued_stop_after_cancel() {
        let group = ProcessGroup::new();
        let (controller, handle) = Controller::new(
            ControllerConfig {
                data_dir: std::env::temp_dir(),
                version: "nightly".to_string(),
                stop_grace: Duration::from_secs(1),
            },
            SleepInstaller,
            group.clone(),
            Progress::disabled(),
        );
        group.close().await;
        let shutdown = group.shutdown_signal();
        assert!(shutdown.is_set());

        handle.notify(ControllerEvent::Stop {
            reason: "test".to_string(),
        });
        tokio::spawn(controller.run(shutdown));

        tokio::time::timeout(Duration::from_secs(1), handle.stopping())
            .await
            .expect("stop event not handled after cancel");
        tokio::time::timeout(Duration::from_secs(1), handle.stopped())
            .await
            .expect("controller did not exit after draining events");
    }

    #[tokio::test]
    async fn stop_command_moves_to_stopping() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, services, task, lifecycle) = spawn(SleepInstaller, dir.path());
        handle.notify(ControllerEvent::ServicesReady);

        let reply = handle.submit(Command::stop()).await;
        assert!(reply.ok);
        assert_eq!(reply.message.as_deref(), Some(STOPPING_REPLY));
        handle.stopping().await;

        let reply = handle.submit(Command::scale_out(ServiceKind::Tidb, 1, None)).await;
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("playground is stopping"));

        let reply = handle.submit(Command::display()).await;
        assert!(reply.ok);

        lifecycle.close().await;
        task.await.unwrap();
        assert_eq!(handle.state(), ControllerState::Stopped);
        services.close().await;
    }

    #[tokio::test]
    async fn scale_out_then_scale_in_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, services, task, lifecycle) = spawn(SleepInstaller, dir.path());

        let reply = handle.submit(Command::scale_out(ServiceKind::Tikv, 2, None)).await;
        assert!(reply.ok, "{reply:?}");
        let rows = items(&handle.submit(Command::display()).await);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "tikv-0");
        assert_eq!(rows[1].name, "tikv-1");
        assert_eq!(rows[0].version, "v8.5.4");
        assert_eq!(rows[0].status, ServiceStatus::Running);
        assert!(dir.path().join("tikv-1").is_dir());

        let reply = handle.submit(Command::scale_in_name("tikv-0")).await;
        assert!(reply.ok, "{reply:?}");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let rows = items(&handle.submit(Command::display()).await);
            if rows.len() == 1 {
                assert_eq!(rows[0].name, "tikv-1");
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "tikv-0 never removed");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        services.close().await;
        lifecycle.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn scale_in_by_pid_and_unknown_targets() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, services, task, lifecycle) = spawn(SleepInstaller, dir.path());

        let cmd = Command::scale_out(ServiceKind::Tidb, 1, Some("v7.5.0".into()));
        assert!(handle.submit(cmd).await.ok);
        let rows = items(&handle.submit(Command::display()).await);
        assert_eq!(rows[0].version, "v7.5.0");
        let pid = rows[0].pid.unwrap();

        let reply = handle.submit(Command::scale_in_pid(pid)).await;
        assert!(reply.ok, "{reply:?}");
        let reply = handle.submit(Command::scale_in_name("tidb-9")).await;
        assert_eq!(reply.error.as_deref(), Some("service tidb-9 not found"));
        let reply = handle.submit(Command::scale_in_pid(1)).await;
        assert!(!reply.ok);

        services.close().await;
        lifecycle.close().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn installer_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, services, task, lifecycle) = spawn(FailingInstaller, dir.path());

        let reply = handle.submit(Command::scale_out(ServiceKind::Pd, 1, None)).await;
        assert!(!reply.ok);
        assert!(reply.error.unwrap().contains("no binary"));
        assert!(items(&handle.submit(Command::display()).await).is_empty());

        let reply = handle.submit(Command {
            service: Some("mysql".to_string()),
            ..Command::scale_out(ServiceKind::Pd, 1, None)
        })
        .await;
        assert!(reply.error.unwrap().contains("unknown service"));

        lifecycle.close().await;
        task.await.unwrap();
        services.close().await;
    }

    #[tokio::test]
    async fn queued_commands_are_answered_on_exit() {
        let dir = tempfile::tempdir().unwrap();
        let (handle, services, task, lifecycle) = spawn(SleepInstaller, dir.path());
        lifecycle.close().await;
        task.await.unwrap();

        let reply = handle.submit(Command::display()).await;
        assert!(!reply.ok);
        assert_eq!(reply.error.as_deref(), Some("playground is stopped"));
        services.close().await;
    }
}
