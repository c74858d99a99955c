//! Grouped task progress with a flush barrier.
//!
//! Every operation becomes a [`ProgressEvent`] queued to a single renderer
//! thread. The renderer prints plain lines (`<group> | <details>`) and, when
//! configured, appends each event as one JSON line to an event log.
//! [`Progress::sync`] resolves only after everything queued before it has been
//! written and flushed to both sinks.

use std::{
    collections::HashMap,
    io::Write,
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Error,
    Skipped,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventBody {
    PrintLines {
        lines: Vec<String>,
    },
    GroupAdd {
        gid: u64,
        title: String,
    },
    GroupClose {
        gid: u64,
    },
    TaskAdd {
        gid: u64,
        tid: u64,
        title: String,
    },
    TaskUpdate {
        tid: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    TaskState {
        tid: u64,
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

/// One line of `progress.events.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub body: EventBody,
}

pub struct ProgressOptions {
    pub out: Box<dyn Write + Send>,
    pub event_log: Option<Box<dyn Write + Send>>,
}

enum Msg {
    Event(ProgressEvent),
    Sync(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct Inner {
    tx: Option<mpsc::UnboundedSender<Msg>>,
    next_id: AtomicU64,
    renderer: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Progress {
    inner: Arc<Inner>,
}

impl Progress {
    pub fn new(opts: ProgressOptions) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let renderer = Renderer {
            out: opts.out,
            event_log: opts.event_log,
            groups: HashMap::new(),
            tasks: HashMap::new(),
        };
        let handle = std::thread::Builder::new()
            .name("progress-renderer".to_string())
            .spawn(move || renderer.run(rx))?;
        Ok(Self {
            inner: Arc::new(Inner {
                tx: Some(tx),
                next_id: AtomicU64::new(1),
                renderer: Mutex::new(Some(handle)),
            }),
        })
    }

    /// A sink that drops everything; `sync` returns immediately.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(Inner {
                tx: None,
                next_id: AtomicU64::new(1),
                renderer: Mutex::new(None),
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.tx.is_some()
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit(&self, body: EventBody) {
        let Some(tx) = self.inner.tx.as_ref() else {
            return;
        };
        let _ = tx.send(Msg::Event(ProgressEvent {
            at: Utc::now(),
            body,
        }));
    }

    pub fn group(&self, title: impl Into<String>) -> Group {
        let gid = self.next_id();
        self.emit(EventBody::GroupAdd {
            gid,
            title: title.into(),
        });
        Group {
            progress: self.clone(),
            gid,
        }
    }

    pub fn print_lines<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.emit(EventBody::PrintLines {
            lines: lines.into_iter().map(Into::into).collect(),
        });
    }

    /// Waits until every event emitted before this call is written and flushed.
    pub async fn sync(&self) {
        let Some(tx) = self.inner.tx.as_ref() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Msg::Sync(ack_tx)).is_err() {
            return;
        }
        let _ = ack_rx.await;
    }

    /// Flushes pending output and stops the renderer. Later events are dropped.
    pub async fn close(&self) {
        let Some(tx) = self.inner.tx.as_ref() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if tx.send(Msg::Close(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        let handle = self
            .inner
            .renderer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = tokio::task::spawn_blocking(move || handle.join()).await;
        }
    }
}

#[derive(Clone)]
pub struct Group {
    progress: Progress,
    gid: u64,
}

impl Group {
    pub fn task(&self, title: impl Into<String>) -> Task {
        let tid = self.progress.next_id();
        self.progress.emit(EventBody::TaskAdd {
            gid: self.gid,
            tid,
            title: title.into(),
        });
        Task {
            progress: self.progress.clone(),
            tid,
        }
    }

    pub fn close(&self) {
        self.progress.emit(EventBody::GroupClose { gid: self.gid });
    }
}

#[derive(Clone)]
pub struct Task {
    progress: Progress,
    tid: u64,
}

impl Task {
    /// A task bound to a disabled sink, for callers that need a handle but no output.
    pub fn detached() -> Self {
        Self {
            progress: Progress::disabled(),
            tid: 0,
        }
    }

    fn state(&self, status: TaskStatus, message: Option<String>) {
        self.progress.emit(EventBody::TaskState {
            tid: self.tid,
            status,
            message,
        });
    }

    pub fn start(&self) {
        self.state(TaskStatus::Running, None);
    }

    pub fn set_meta(&self, meta: impl Into<String>) {
        self.progress.emit(EventBody::TaskUpdate {
            tid: self.tid,
            meta: Some(meta.into()),
            message: None,
        });
    }

    pub fn set_message(&self, message: impl Into<String>) {
        self.progress.emit(EventBody::TaskUpdate {
            tid: self.tid,
            meta: None,
            message: Some(message.into()),
        });
    }

    pub fn done(&self) {
        self.state(TaskStatus::Done, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        self.state(TaskStatus::Error, Some(message.into()));
    }

    pub fn skip(&self, message: impl Into<String>) {
        self.state(TaskStatus::Skipped, Some(message.into()));
    }

    pub fn cancel(&self, message: impl Into<String>) {
        self.state(TaskStatus::Canceled, Some(message.into()));
    }
}

struct TaskLine {
    gid: u64,
    title: String,
    meta: String,
    message: String,
    started: Instant,
    start_printed: bool,
}

struct Renderer {
    out: Box<dyn Write + Send>,
    event_log: Option<Box<dyn Write + Send>>,
    groups: HashMap<u64, String>,
    tasks: HashMap<u64, TaskLine>,
}

impl Renderer {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Msg>) {
        while let Some(msg) = rx.blocking_recv() {
            match msg {
                Msg::Event(ev) => {
                    self.log_event(&ev);
                    self.render(ev.body);
                }
                Msg::Sync(ack) => {
                    self.flush();
                    let _ = ack.send(());
                }
                Msg::Close(ack) => {
                    self.flush();
                    let _ = ack.send(());
                    break;
                }
            }
        }
        self.flush();
    }

    fn flush(&mut self) {
        let _ = self.out.flush();
        if let Some(log) = self.event_log.as_mut() {
            if let Err(err) = log.flush() {
                tracing::debug!(error = %err, "flush progress event log");
            }
        }
    }

    fn log_event(&mut self, ev: &ProgressEvent) {
        let Some(log) = self.event_log.as_mut() else {
            return;
        };
        let res = serde_json::to_vec(ev)
            .map_err(std::io::Error::from)
            .and_then(|mut line| {
                line.push(b'\n');
                log.write_all(&line)
            });
        if let Err(err) = res {
            tracing::debug!(error = %err, "append progress event");
        }
    }

    fn println(&mut self, gid: u64, details: &str) {
        let _ = match self.groups.get(&gid).filter(|t| !t.is_empty()) {
            Some(title) => writeln!(self.out, "{title} | {details}"),
            None => writeln!(self.out, "{details}"),
        };
    }

    fn render(&mut self, body: EventBody) {
        match body {
            EventBody::PrintLines { lines } => {
                for line in lines {
                    let _ = writeln!(self.out, "{line}");
                }
            }
            EventBody::GroupAdd { gid, title } => {
                self.groups.insert(gid, title);
            }
            EventBody::GroupClose { .. } => {}
            EventBody::TaskAdd { gid, tid, title } => {
                self.tasks.insert(
                    tid,
                    TaskLine {
                        gid,
                        title,
                        meta: String::new(),
                        message: String::new(),
                        started: Instant::now(),
                        start_printed: false,
                    },
                );
            }
            EventBody::TaskUpdate { tid, meta, message } => {
                if let Some(t) = self.tasks.get_mut(&tid) {
                    if let Some(meta) = meta {
                        t.meta = meta;
                    }
                    if let Some(message) = message {
                        t.message = message;
                    }
                }
            }
            EventBody::TaskState {
                tid,
                status,
                message,
            } => self.render_state(tid, status, message),
        }
    }

    fn render_state(&mut self, tid: u64, status: TaskStatus, message: Option<String>) {
        let Some(t) = self.tasks.get_mut(&tid) else {
            return;
        };
        if let Some(message) = message {
            t.message = message;
        }
        let gid = t.gid;
        let line = match status {
            TaskStatus::Running => {
                if t.start_printed {
                    return;
                }
                t.start_printed = true;
                t.started = Instant::now();
                let mut details = t.title.clone();
                for extra in [&t.meta, &t.message] {
                    if !extra.is_empty() {
                        details.push(' ');
                        details.push_str(extra);
                    }
                }
                details
            }
            TaskStatus::Error => finished_line("ERR - ", t),
            TaskStatus::Skipped => finished_line("SKIP - ", t),
            TaskStatus::Canceled => finished_line("CANCEL - ", t),
            TaskStatus::Pending | TaskStatus::Done => return,
        };
        self.println(gid, &line);
    }
}

fn finished_line(label: &str, t: &TaskLine) -> String {
    let mut title = t.title.clone();
    if !t.meta.is_empty() {
        title.push(' ');
        title.push_str(&t.meta);
    }
    let elapsed = format_elapsed(t.started.elapsed());
    if t.message.is_empty() {
        format!("{label}{title} ({elapsed})")
    } else {
        format!("{label}{title}: {} ({elapsed})", t.message)
    }
}

fn format_elapsed(d: Duration) -> String {
    if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{:.1}s", d.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Condvar, Mutex};

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

    /// Blocks every write until `open` is called.
    #[derive(Clone, Default)]
    struct Gate(Arc<(Mutex<bool>, Condvar)>);

    impl Gate {
        fn open(&self) {
            let (lock, cv) = &*self.0;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }
    }

    impl Write for Gate {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let (lock, cv) = &*self.0;
            let mut open = lock.lock().unwrap();
            while !*open {
                open = cv.wait(open).unwrap();
            }
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn plain_output_prefixes_group_title() {
        let out = Capture::default();
        let progress = Progress::new(ProgressOptions {
            out: Box::new(out.clone()),
            event_log: None,
        })
        .unwrap();

        let group = progress.group("Stop clusters");
        let ok = group.task("a (v8.5.4)");
        ok.start();
        ok.done();
        let failed = group.task("b (nightly)");
        failed.start();
        failed.error("connection refused");
        progress.print_lines(["bye"]);
        progress.sync().await;

        let text = out.text();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Stop clusters | a (v8.5.4)");
        assert_eq!(lines[1], "Stop clusters | b (nightly)");
        assert!(
            lines[2].starts_with("Stop clusters | ERR - b (nightly): connection refused ("),
            "{text}"
        );
        assert_eq!(lines[3], "bye");
        progress.close().await;
    }

    #[tokio::test]
    async fn start_line_printed_once_with_meta() {
        let out = Capture::default();
        let progress = Progress::new(ProgressOptions {
            out: Box::new(out.clone()),
            event_log: None,
        })
        .unwrap();
        let task = progress.group("Start instances").task("tikv-0");
        task.set_meta("v8.5.4");
        task.start();
        task.start();
        task.skip("already running");
        progress.sync().await;

        let text = out.text();
        assert_eq!(text.matches("Start instances | tikv-0 v8.5.4\n").count(), 1);
        assert!(text.contains("SKIP - tikv-0 v8.5.4: already running ("));
        progress.close().await;
    }

    #[tokio::test]
    async fn event_log_lines_are_json() {
        let log = Capture::default();
        let progress = Progress::new(ProgressOptions {
            out: Box::new(std::io::sink()),
            event_log: Some(Box::new(log.clone())),
        })
        .unwrap();
        let task = progress.group("g").task("t");
        task.start();
        progress.sync().await;

        let text = log.text();
        let events: Vec<ProgressEvent> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0].body, EventBody::GroupAdd { .. }));
        assert!(matches!(
            events[2].body,
            EventBody::TaskState {
                status: TaskStatus::Running,
                ..
            }
        ));
        progress.close().await;
    }

    #[tokio::test]
    async fn sync_waits_for_blocked_event_log() {
        let gate = Gate::default();
        let progress = Progress::new(ProgressOptions {
            out: Box::new(std::io::sink()),
            event_log: Some(Box::new(gate.clone())),
        })
        .unwrap();
        progress.print_lines(["starting"]);

        let p = progress.clone();
        let mut sync = tokio::spawn(async move { p.sync().await });
        let early = tokio::time::timeout(Duration::from_millis(200), &mut sync).await;
        assert!(early.is_err(), "sync returned before the event log was written");

        gate.open();
        tokio::time::timeout(Duration::from_secs(5), sync)
            .await
            .unwrap()
            .unwrap();
        progress.close().await;
    }

    #[tokio::test]
    async fn disabled_progress_is_inert() {
        let progress = Progress::disabled();
        let task = progress.group("x").task("y");
        task.start();
        task.error("ignored");
        progress.sync().await;
        progress.close().await;
        assert!(!progress.is_enabled());
    }
}
