use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    body::Bytes,
    http::{Method, StatusCode},
    routing::any,
};
use playground_ctl::{ClientContext, NO_INSTANCES, commands};
use playground_process::runtime_files;
use playground_proto::{
    COMMAND_PATH, CommandReply, CommandType, DisplayItem, METHOD_NOT_ALLOWED, ServiceKind,
    ServiceStatus, decode_command,
};

#[derive(Clone, Default)]
struct Capture(Arc<Mutex<Vec<u8>>>);

impl Capture {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// How a [`FakeInstance`] answers commands.
#[derive(Clone, Default)]
struct Behavior {
    display: Vec<DisplayItem>,
    display_error: Option<&'static str>,
    display_delay: Duration,
    /// Delay before the stop command is answered.
    stop_reply_delay: Duration,
    /// Delay between answering stop and removing the records.
    stop_delay: Duration,
}

impl Behavior {
    fn version(version: &str) -> Self {
        Self {
            display: items(version),
            ..Self::default()
        }
    }
}

/// A stand-in instance: owns `base/<tag>` with this process as the pid and
/// removes its records once a stop command has been handled.
struct FakeInstance {
    dir: PathBuf,
}

impl FakeInstance {
    async fn start(base: &Path, tag: &str, version: &str, stop_delay: Duration) -> Self {
        let behavior = Behavior {
            stop_delay,
            ..Behavior::version(version)
        };
        Self::start_with(base, tag, behavior).await
    }

    async fn start_with(base: &Path, tag: &str, behavior: Behavior) -> Self {
        let dir = base.join(tag);
        std::fs::create_dir_all(&dir).unwrap();
        runtime_files::write_pid_record(
            &runtime_files::pid_path(&dir),
            &runtime_files::PidRecord::current(tag),
        )
        .unwrap();

        let display_json = serde_json::to_string(&behavior.display).unwrap();
        let owned = dir.clone();
        let app = Router::new().route(
            COMMAND_PATH,
            any(move |method: Method, body: Bytes| {
                let display_json = display_json.clone();
                let behavior = behavior.clone();
                let dir = owned.clone();
                async move {
                    if method != Method::POST {
                        return (
                            StatusCode::METHOD_NOT_ALLOWED,
                            Json(CommandReply::error(METHOD_NOT_ALLOWED)),
                        );
                    }
                    let cmd = match decode_command(&body) {
                        Ok(cmd) => cmd,
                        Err(e) => return (StatusCode::BAD_REQUEST, Json(CommandReply::error(e))),
                    };
                    let reply = match cmd.kind {
                        CommandType::Display => {
                            tokio::time::sleep(behavior.display_delay).await;
                            match behavior.display_error {
                                Some(err) => CommandReply::error(err),
                                None => CommandReply::ok(display_json),
                            }
                        }
                        CommandType::Stop => {
                            tokio::time::sleep(behavior.stop_reply_delay).await;
                            let stop_delay = behavior.stop_delay;
                            tokio::spawn(async move {
                                tokio::time::sleep(stop_delay).await;
                                let _ = std::fs::remove_file(runtime_files::pid_path(&dir));
                                let _ = std::fs::remove_file(runtime_files::port_path(&dir));
                            });
                            CommandReply::ok("Stopping playground...\n")
                        }
                        _ => CommandReply::error("unsupported"),
                    };
                    (StatusCode::OK, Json(reply))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        runtime_files::write_port_record(&dir, port).unwrap();
        Self { dir }
    }

    fn stopped(&self) -> bool {
        !runtime_files::pid_path(&self.dir).exists()
    }
}

fn items(version: &str) -> Vec<DisplayItem> {
    [
        ("pd-0", ServiceKind::Pd),
        ("tikv-0", ServiceKind::Tikv),
        ("tidb-0", ServiceKind::Tidb),
    ]
    .into_iter()
    .map(|(name, kind)| DisplayItem {
        name: name.to_string(),
        service_id: kind,
        pid: None,
        status: ServiceStatus::Running,
        version: version.to_string(),
    })
    .collect()
}

#[tokio::test]
async fn ps_lists_running_instances() {
    let base = tempfile::tempdir().unwrap();
    let _a = FakeInstance::start(base.path(), "a", "v8.5.4", Duration::ZERO).await;
    let _b = FakeInstance::start(base.path(), "b", "v8.5.4", Duration::ZERO).await;

    let mut out = Vec::new();
    commands::ps(&ClientContext::new(base.path()), &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();

    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3, "{text}");
    assert!(lines[0].starts_with("TAG"), "{text}");
    assert!(lines[1].starts_with("a "), "{text}");
    assert!(lines[2].starts_with("b "), "{text}");
    assert!(text.contains("v8.5.4"), "{text}");
    assert!(text.contains("running"), "{text}");
    assert!(text.contains("pd:1 tikv:1 tidb:1"), "{text}");
}

#[tokio::test]
async fn ps_without_instances_warns() {
    let base = tempfile::tempdir().unwrap();
    let mut out = Vec::new();
    commands::ps(&ClientContext::new(base.path()), &mut out).await.unwrap();
    assert!(String::from_utf8_lossy(&out).contains(NO_INSTANCES));

    let mut out = Vec::new();
    commands::ps(&ClientContext::new(base.path().join("missing")), &mut out)
        .await
        .unwrap();
    assert!(String::from_utf8_lossy(&out).contains(NO_INSTANCES));
}

#[tokio::test]
async fn ps_prints_a_display_failure_once() {
    let base = tempfile::tempdir().unwrap();
    let failing = Behavior {
        display_error: Some("boom"),
        ..Behavior::default()
    };
    let _a = FakeInstance::start_with(base.path(), "a", failing).await;

    let mut out = Vec::new();
    commands::ps(&ClientContext::new(base.path()), &mut out).await.unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("boom").count(), 1, "{text}");
}

#[tokio::test]
async fn display_error_is_not_prefixed_twice() {
    let base = tempfile::tempdir().unwrap();
    let failing = Behavior {
        display_error: Some("boom"),
        ..Behavior::default()
    };
    let _a = FakeInstance::start_with(base.path(), "a", failing).await;

    let ctx = ClientContext::new(base.path()).with_tag("a");
    let err = commands::display(&ctx, &mut Vec::new()).await.unwrap_err();
    let mut out = Vec::new();
    commands::print_display_failure_warning(&mut out, &err).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(text.matches("boom").count(), 1, "{text}");
}

#[tokio::test]
async fn stop_waits_for_pid_record_removal() {
    let base = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(200);
    let only = FakeInstance::start(base.path(), "only", "v8.5.4", delay).await;

    let ctx = ClientContext::new(base.path())
        .with_tag("only")
        .with_data_dir(&only.dir);
    let mut out = Vec::new();
    commands::stop(&ctx, Duration::from_secs(2), &mut out).await.unwrap();
    assert!(only.stopped());
    assert!(String::from_utf8_lossy(&out).contains("Stopping playground..."));
}

#[tokio::test]
async fn stopping_a_stopped_instance_succeeds() {
    let base = tempfile::tempdir().unwrap();
    let gone = FakeInstance::start(base.path(), "gone", "v8.5.4", Duration::ZERO).await;
    let ctx = ClientContext::new(base.path()).with_tag("gone");
    commands::stop(&ctx, Duration::from_secs(2), &mut Vec::new()).await.unwrap();
    assert!(gone.stopped());

    let mut out = Vec::new();
    commands::stop(&ctx, Duration::from_secs(2), &mut out).await.unwrap();
    assert!(String::from_utf8_lossy(&out).contains("not running"));
}

#[tokio::test]
async fn stop_times_out_when_owner_stays() {
    let base = tempfile::tempdir().unwrap();
    let delay = Duration::from_secs(30);
    let stuck = FakeInstance::start(base.path(), "stuck", "v8.5.4", delay).await;

    let ctx = ClientContext::new(base.path()).with_tag("stuck");
    let err = commands::stop(&ctx, Duration::from_millis(500), &mut Vec::new())
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("timeout"), "{err:#}");
    assert!(!stuck.stopped());
}

#[tokio::test]
async fn stop_timeout_covers_an_unanswered_stop_command() {
    let base = tempfile::tempdir().unwrap();
    let hung = Behavior {
        stop_reply_delay: Duration::from_secs(8),
        stop_delay: Duration::from_secs(30),
        ..Behavior::version("v8.5.4")
    };
    let _hung = FakeInstance::start_with(base.path(), "hung", hung).await;

    let ctx = ClientContext::new(base.path()).with_tag("hung");
    let started = Instant::now();
    let err = commands::stop(&ctx, Duration::from_secs(1), &mut Vec::new())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();
    assert!(format!("{err:#}").contains("timeout"), "{err:#}");
    assert!(elapsed < Duration::from_secs(3), "stop took {elapsed:?}");
}

#[tokio::test]
async fn stop_all_stops_every_instance() {
    let base = tempfile::tempdir().unwrap();
    let a = FakeInstance::start(base.path(), "a", "v8.5.4", Duration::from_millis(50)).await;
    let b = FakeInstance::start(base.path(), "b", "v8.5.4", Duration::from_millis(50)).await;

    let out = Capture::default();
    let ctx = ClientContext::new(base.path());
    commands::stop_all(&ctx, Duration::from_secs(5), out.clone())
        .await
        .unwrap();

    let text = out.text();
    assert!(text.contains("Stop clusters | a (v8.5.4)"), "{text}");
    assert!(text.contains("Stop clusters | b (v8.5.4)"), "{text}");
    assert!(a.stopped());
    assert!(b.stopped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_runs_instances_in_parallel() {
    let base = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(1500);
    let a = FakeInstance::start(base.path(), "a", "v8.5.4", delay).await;
    let b = FakeInstance::start(base.path(), "b", "v8.5.4", delay).await;

    let started = Instant::now();
    let ctx = ClientContext::new(base.path());
    commands::stop_all(&ctx, Duration::from_secs(10), std::io::sink())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(a.stopped() && b.stopped());
    assert!(elapsed < delay * 2, "stop-all took {elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_does_not_wait_for_other_labels() {
    let base = tempfile::tempdir().unwrap();
    let delay = Duration::from_millis(1500);
    let slow_display = Behavior {
        display_delay: delay,
        ..Behavior::version("v8.5.4")
    };
    let slow_stop = Behavior {
        stop_delay: delay,
        ..Behavior::version("v8.5.4")
    };
    let a = FakeInstance::start_with(base.path(), "a", slow_display).await;
    let b = FakeInstance::start_with(base.path(), "b", slow_stop).await;

    let out = Capture::default();
    let started = Instant::now();
    let ctx = ClientContext::new(base.path());
    commands::stop_all(&ctx, Duration::from_secs(10), out.clone())
        .await
        .unwrap();
    let elapsed = started.elapsed();

    assert!(a.stopped() && b.stopped());
    assert!(elapsed < Duration::from_millis(2600), "stop-all took {elapsed:?}");
    let text = out.text();
    assert!(text.contains("Stop clusters | a (v8.5.4)"), "{text}");
    assert!(text.contains("Stop clusters | b (v8.5.4)"), "{text}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_all_timeout_bounds_a_hung_instance() {
    let base = tempfile::tempdir().unwrap();
    let hung = Behavior {
        display_delay: Duration::from_secs(8),
        stop_reply_delay: Duration::from_secs(8),
        stop_delay: Duration::from_secs(30),
        ..Behavior::version("v8.5.4")
    };
    let hung = FakeInstance::start_with(base.path(), "hung", hung).await;
    let ok = FakeInstance::start(base.path(), "ok", "v8.5.4", Duration::ZERO).await;

    let out = Capture::default();
    let started = Instant::now();
    let ctx = ClientContext::new(base.path());
    let err = commands::stop_all(&ctx, Duration::from_secs(1), out.clone())
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(elapsed < Duration::from_secs(3), "stop-all took {elapsed:?}");
    assert_eq!(err.to_string(), "failed to stop hung");
    assert!(!hung.stopped());
    assert!(ok.stopped());
    let text = out.text();
    assert!(text.contains("Stop clusters | CANCEL - hung (unknown)"), "{text}");
}

#[tokio::test]
async fn stop_all_without_instances_warns() {
    let base = tempfile::tempdir().unwrap();
    let out = Capture::default();
    commands::stop_all(
        &ClientContext::new(base.path().join("missing")),
        Duration::from_secs(1),
        out.clone(),
    )
    .await
    .unwrap();
    assert!(out.text().contains(NO_INSTANCES));
}

mod daemon {
    use super::*;
    use playground_core::Task;
    use playground_daemon::{ComponentInstaller, InstallRequest, InstanceConfig, LaunchSpec};

    struct SleepInstaller;

    impl ComponentInstaller for SleepInstaller {
        async fn prepare(&self, req: &InstallRequest, task: &Task) -> anyhow::Result<LaunchSpec> {
            task.set_message("using sleep");
            Ok(LaunchSpec {
                program: "sleep".into(),
                args: vec!["1000".to_string()],
                env: Vec::new(),
                work_dir: req.work_dir.clone(),
                log_file: req.work_dir.join("stdout.log"),
            })
        }
    }

    async fn wait_for_port(dir: &Path) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while runtime_files::read_port_record(dir).is_err() {
            assert!(Instant::now() < deadline, "instance never became ready");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_drives_an_in_process_instance() {
        let base = tempfile::tempdir().unwrap();
        let dir = base.path().join("e2e");
        let config = InstanceConfig {
            tag: "e2e".to_string(),
            data_dir: dir.clone(),
            port: 0,
            version: "v8.5.4".to_string(),
            boot: vec![(ServiceKind::Pd, 1), (ServiceKind::Tikv, 1)],
            stop_grace: Duration::from_secs(2),
        };
        let sink = Box::new(std::io::sink());
        let instance = tokio::spawn(playground_daemon::run(config, SleepInstaller, sink));
        wait_for_port(&dir).await;

        let ctx = ClientContext::new(base.path());

        let mut out = Vec::new();
        commands::scale_out(&ctx, ServiceKind::Tidb, 1, None, &mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("tidb-0"));

        let mut out = Vec::new();
        commands::display(&ctx, &mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        for name in ["pd-0", "tikv-0", "tidb-0"] {
            assert!(text.contains(name), "{text}");
        }

        let mut out = Vec::new();
        commands::scale_in(&ctx, Some("tidb-0".to_string()), None, &mut out)
            .await
            .unwrap();
        assert!(String::from_utf8_lossy(&out).contains("tidb-0"));

        let err = commands::scale_in(&ctx, Some("tidb-9".to_string()), None, &mut Vec::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "service tidb-9 not found");

        let mut out = Vec::new();
        commands::ps(&ctx, &mut out).await.unwrap();
        assert!(String::from_utf8_lossy(&out).contains("e2e"));

        commands::stop(&ctx, Duration::from_secs(10), &mut Vec::new())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), instance)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!runtime_files::pid_path(&dir).exists());
        assert!(!runtime_files::port_path(&dir).exists());
    }
}
