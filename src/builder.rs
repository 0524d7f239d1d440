//! The `Builder` collaborator and the single-worker `BuilderQueue` that
//! fronts it.
//!
//! `run_command` spawns with piped stdout/stderr, draining both on
//! dedicated reader threads so a chatty child can't deadlock on a full
//! pipe, and `setsid()`s the child so a SIGINT delivered to the server's
//! process group doesn't also hit an in-flight build. `BuilderQueue`
//! reuses that same thread+channel idiom for its own worker loop: the
//! queue needs an explicit "drain, then exit" sentinel (`None`), which a
//! plain `mpsc::Receiver::recv()` loop expresses directly.

use std::io::Read;
use std::os::unix::process::CommandExt;
use std::panic::{self, AssertUnwindSafe};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{error, info};

use crate::errors::{JobResult, SchedulerError};
use crate::models::BuildJob;
use crate::scheduler::ScheduledJob;

/// A collaborator capable of compiling one `BuildJob` for one
/// architecture. Sandboxing and the actual compilation are an external
/// concern; this trait only covers dispatch.
pub trait Builder: Send + Sync {
    fn name(&self) -> &str;
    fn arch(&self) -> &str;
    fn build(&self, job: &BuildJob) -> JobResult<()>;
}

/// Reference `Builder` that runs a configured command-line template
/// against the job's source tarball, substituting `{srctar}`, `{pkgdir}`,
/// and `{arch}` placeholders.
pub struct ProcessBuilder {
    name: String,
    arch: String,
    argv: Vec<String>,
}

impl ProcessBuilder {
    pub fn new(name: impl Into<String>, arch: impl Into<String>, argv: Vec<String>) -> Self {
        ProcessBuilder {
            name: name.into(),
            arch: arch.into(),
            argv,
        }
    }

    fn substitute(&self, template: &str, job: &BuildJob) -> String {
        template
            .replace("{srctar}", &job.srctar.to_string_lossy())
            .replace("{pkgdir}", &job.pkgdir().to_string_lossy())
            .replace("{arch}", &self.arch)
    }
}

impl Builder for ProcessBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn build(&self, job: &BuildJob) -> JobResult<()> {
        let [program, rest @ ..] = self.argv.as_slice() else {
            return Err(SchedulerError::config(format!("builder {:?} has an empty command", self.name)));
        };

        let mut cmd = Command::new(program);
        for arg in rest {
            cmd.arg(self.substitute(arg, job));
        }

        let (success, _log, stderr) = run_command(cmd)?;
        if !success {
            return Err(SchedulerError::Build(stderr.trim().to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum OutputSource {
    Stdout,
    Stderr,
}

enum OutputEvent {
    Data(OutputSource, Vec<u8>),
    Closed(OutputSource),
}

fn drain_reads<T: Read>(sender: Sender<OutputEvent>, source: OutputSource, mut reader: T) {
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                let _ = sender.send(OutputEvent::Closed(source));
                return;
            }
            Ok(n) => {
                let _ = sender.send(OutputEvent::Data(source, buf[..n].to_vec()));
            }
            Err(e) => {
                error!("error reading builder output {:?}: {}", source, e);
                let _ = sender.send(OutputEvent::Closed(source));
                return;
            }
        }
    }
}

/// Spawns `cmd`, streams its stdout/stderr to the log, and waits for it to
/// exit. Returns `(success, stdout, stderr)`.
pub(crate) fn run_command(mut cmd: Command) -> JobResult<(bool, String, String)> {
    info!("running: {:?}", cmd);

    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
    // Run in our own session so a SIGINT delivered to the server's
    // process group doesn't also reach the child.
    unsafe {
        cmd.pre_exec(|| {
            unsafe { libc::setsid() };
            Ok(())
        });
    }

    let mut child: Child = cmd
        .spawn()
        .map_err(|e| SchedulerError::new(format!("can't start command: {}", e)))?;

    let (tx1, rx) = channel();
    let tx2 = tx1.clone();

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr_reader = child.stderr.take().expect("piped stderr");
    let stdout_thread = thread::spawn(move || drain_reads(tx1, OutputSource::Stdout, stdout));
    let stderr_thread = thread::spawn(move || drain_reads(tx2, OutputSource::Stderr, stderr_reader));

    let mut remaining = 2;
    let mut stdout_bytes = Vec::new();
    let mut stderr_bytes = Vec::new();
    while remaining > 0 {
        match rx.recv() {
            Ok(OutputEvent::Data(source, data)) => {
                for line in String::from_utf8_lossy(&data).split_terminator('\n') {
                    info!("{} {}", if source == OutputSource::Stdout { "|" } else { ">" }, line);
                }
                match source {
                    OutputSource::Stdout => stdout_bytes.extend_from_slice(&data),
                    OutputSource::Stderr => stderr_bytes.extend_from_slice(&data),
                }
            }
            Ok(OutputEvent::Closed(_)) => remaining -= 1,
            Err(_) => break,
        }
    }
    let _ = stdout_thread.join();
    let _ = stderr_thread.join();

    let status = child
        .wait()
        .map_err(|e| SchedulerError::new(format!("can't wait for command: {}", e)))?;

    Ok((
        status.success(),
        String::from_utf8_lossy(&stdout_bytes).into_owned(),
        String::from_utf8_lossy(&stderr_bytes).into_owned(),
    ))
}

/// Extracts a human-readable message from a `catch_unwind` payload, which
/// is almost always a `&str` or `String` depending on how the panic was
/// raised (`panic!("literal")` vs. `panic!("{}", owned)`).
fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "builder panicked".to_string()
    }
}

/// Single-consumer FIFO queue fronting one `Builder`. `new` only builds
/// the channel (mirrors Python's `Thread.__init__` not itself starting
/// the thread); `start` spawns the one worker thread that drains it.
/// Enqueueing `None` via `stop` is the drain-and-exit sentinel: the
/// worker finishes whatever is already queued ahead of it, then returns.
pub struct BuilderQueue {
    builder: Arc<dyn Builder>,
    sender: Sender<Option<Arc<ScheduledJob>>>,
    receiver: Mutex<Option<std::sync::mpsc::Receiver<Option<Arc<ScheduledJob>>>>>,
    depth: Arc<AtomicUsize>,
    handle: Mutex<Option<JoinHandle<()>>>,
    pub name: String,
    pub arch: String,
}

impl BuilderQueue {
    pub fn new(builder: Arc<dyn Builder>) -> Self {
        let (sender, receiver) = channel();
        let name = builder.name().to_string();
        let arch = builder.arch().to_string();
        BuilderQueue {
            builder,
            sender,
            receiver: Mutex::new(Some(receiver)),
            depth: Arc::new(AtomicUsize::new(0)),
            handle: Mutex::new(None),
            name,
            arch,
        }
    }

    /// Spawns the worker thread. Idempotent only in the sense that a
    /// second call replaces the stored handle without stopping the first
    /// thread -- callers are expected to call this at most once per
    /// queue, each queue backing exactly one builder.
    pub fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .expect("builder queue receiver mutex poisoned")
            .take()
            .expect("BuilderQueue::start called more than once");

        let builder = Arc::clone(&self.builder);
        let depth = Arc::clone(&self.depth);
        let name = self.name.clone();

        let handle = thread::spawn(move || {
            while let Ok(Some(scheduled)) = receiver.recv() {
                // `catch_unwind` stands in for the broad `except` a
                // dynamic-language worker would use: an unexpected panic
                // inside a `Builder` impl must not take the worker thread
                // down with it, or this job's `ScheduledJob` never reaches
                // `num_active_build == 0` and `notify_result` never fires.
                let job = &scheduled.job;
                let result = panic::catch_unwind(AssertUnwindSafe(|| builder.build(job)));
                let (success, message) = match result {
                    Ok(Ok(())) => {
                        let msg = format!("build on {} succeed", builder.name());
                        info!("{}", msg);
                        (true, msg)
                    }
                    Ok(Err(e)) => {
                        let msg = format!("build on {} failed: {}", builder.name(), e);
                        error!("{}", msg);
                        (false, msg)
                    }
                    Err(panic) => {
                        let cause = panic_message(&panic);
                        let msg = format!("build on {} failed: {}", builder.name(), cause);
                        error!("{}", msg);
                        (false, msg)
                    }
                };
                scheduled.build_done(success, message);
                depth.fetch_sub(1, Ordering::SeqCst);
            }
            info!("builder queue {} stopped", name);
        });

        *self.handle.lock().expect("builder queue handle mutex poisoned") = Some(handle);
    }

    /// Enqueues `None` and joins the worker thread, blocking until every
    /// job already queued ahead of the sentinel has finished building.
    pub fn stop(&self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.handle.lock().expect("builder queue handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }

    /// Enqueues a job, incrementing `depth` first so a concurrent reader
    /// of `depth()` never observes a job as "submitted" before it counts
    /// towards this queue's load.
    pub fn add_scheduled_job(&self, scheduled: Arc<ScheduledJob>) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(Some(scheduled));
    }

    /// Number of jobs queued or in flight on this builder, used by
    /// `JobScheduler` to balance submissions across builders sharing an
    /// architecture (§4.3).
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    enum Mode {
        Succeed,
        Fail,
        Panic,
    }

    /// A `Builder` double that always succeeds, always fails, or always
    /// panics -- enough to drive queue and commit-worker tests without
    /// running real tools.
    pub struct MockBuilder {
        name: String,
        arch: String,
        mode: Mode,
        calls: StdAtomicUsize,
    }

    impl MockBuilder {
        pub fn succeeding(name: &str, arch: &str) -> Self {
            MockBuilder {
                name: name.to_string(),
                arch: arch.to_string(),
                mode: Mode::Succeed,
                calls: StdAtomicUsize::new(0),
            }
        }

        pub fn failing(name: &str, arch: &str) -> Self {
            MockBuilder {
                name: name.to_string(),
                arch: arch.to_string(),
                mode: Mode::Fail,
                calls: StdAtomicUsize::new(0),
            }
        }

        pub fn panicking(name: &str, arch: &str) -> Self {
            MockBuilder {
                name: name.to_string(),
                arch: arch.to_string(),
                mode: Mode::Panic,
                calls: StdAtomicUsize::new(0),
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(StdOrdering::SeqCst)
        }
    }

    impl Builder for MockBuilder {
        fn name(&self) -> &str {
            &self.name
        }

        fn arch(&self) -> &str {
            &self.arch
        }

        fn build(&self, _job: &BuildJob) -> JobResult<()> {
            self.calls.fetch_add(1, StdOrdering::SeqCst);
            match self.mode {
                Mode::Succeed => Ok(()),
                Mode::Fail => Err(SchedulerError::Build(format!("{} always fails", self.name))),
                Mode::Panic => panic!("{} always panics", self.name),
            }
        }
    }
}
