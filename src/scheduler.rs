//! The orchestrator: request expansion, rule application, per-architecture
//! fan-out, the join, and the commit transaction. This is where
//! `BuildRequest`s turn into `ADD`/`COMMIT`/`ROLLBACK` traffic against the
//! configured repositories.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use indexmap::IndexMap;
use log::{error, info};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::builder::{run_command, Builder, BuilderQueue};
use crate::config::Config;
use crate::errors::{JobResult, SchedulerError};
use crate::manifest::merge_manifests;
use crate::models::{BuildJob, BuildRequest, RawJob, WorkDir};
use crate::repository::RepositoryClient;
use crate::rules::FilterRule;

/// One entry yielded by a [`SourceTarballGenerator`]: a produced source
/// package not yet bound to a working directory.
pub struct TarballEntry {
    pub name: String,
    pub version: String,
    pub tarball: PathBuf,
}

/// External collaborator that turns one `BuildRequest` into zero or more
/// produced source packages. Kept as a trait since the actual generator
/// (a VCS checkout + `mmpack-build mksource`-style tool) is out of scope;
/// a subprocess-backed reference implementation is supplied below so the
/// crate is runnable end-to-end.
pub trait SourceTarballGenerator: Send + Sync {
    fn generate(&self, request: &BuildRequest) -> JobResult<Vec<TarballEntry>>;
}

#[derive(Debug, Deserialize)]
struct GeneratorLine {
    name: String,
    version: String,
    tarball: String,
}

/// Reference `SourceTarballGenerator` that runs a configured command-line
/// template, one JSON object per produced entry on its stdout, newline
/// delimited. Modeled on `ProcessBuilder` and `run_command`: spawn,
/// stream stdout/stderr to the log, parse stdout once the process exits.
pub struct ProcessSourceTarballGenerator {
    argv: Vec<String>,
}

impl ProcessSourceTarballGenerator {
    pub fn new(argv: Vec<String>) -> Self {
        ProcessSourceTarballGenerator { argv }
    }

    fn substitute(&self, template: &str, request: &BuildRequest) -> String {
        template
            .replace("{method}", "git")
            .replace("{url}", &request.url)
            .replace("{tag}", &request.refspec)
            .replace("{version_from_vcs}", &request.srctar_make_opts.version_from_vcs.to_string())
            .replace("{only_modified}", &request.srctar_make_opts.only_modified.to_string())
    }
}

impl SourceTarballGenerator for ProcessSourceTarballGenerator {
    fn generate(&self, request: &BuildRequest) -> JobResult<Vec<TarballEntry>> {
        let [program, rest @ ..] = self.argv.as_slice() else {
            return Err(SchedulerError::config("source tarball generator has an empty command"));
        };

        let mut cmd = Command::new(program);
        for arg in rest {
            cmd.arg(self.substitute(arg, request));
        }

        let (success, stdout, stderr) = run_command(cmd)?;
        if !success {
            return Err(SchedulerError::new(format!(
                "source tarball generator failed: {}",
                stderr.trim()
            )));
        }

        let mut entries = Vec::new();
        for line in stdout.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let parsed: GeneratorLine = serde_json::from_str(line).map_err(|e| {
                SchedulerError::new(format!("malformed source tarball generator output {:?}: {}", line, e))
            })?;
            entries.push(TarballEntry {
                name: parsed.name,
                version: parsed.version,
                tarball: parsed.tarball.into(),
            });
        }
        Ok(entries)
    }
}

struct ScheduledJobState {
    feedback_msgs: Vec<String>,
    success: bool,
    num_active_build: usize,
}

/// Per-logical-job join state. Collects one `build_done` report from each
/// of its `job.archs.len()` sub-builds and, once the last one reports,
/// hands itself to the commit worker exactly once.
pub struct ScheduledJob {
    pub job: BuildJob,
    state: Mutex<ScheduledJobState>,
    commit_tx: Sender<Option<Arc<ScheduledJob>>>,
}

impl ScheduledJob {
    fn new(job: BuildJob, num_active_build: usize, commit_tx: Sender<Option<Arc<ScheduledJob>>>) -> Arc<Self> {
        Arc::new(ScheduledJob {
            job,
            state: Mutex::new(ScheduledJobState {
                feedback_msgs: Vec::new(),
                success: true,
                num_active_build,
            }),
            commit_tx,
        })
    }

    /// Records one sub-build's outcome. `success` can only move from true
    /// to false; `num_active_build` can only decrease. Once it reaches
    /// zero this job is pushed onto the commit queue exactly once -- no
    /// caller may call this again afterwards, since `num_active_build`
    /// would underflow.
    pub fn build_done(self: Arc<Self>, success: bool, msg: String) {
        let done = {
            let mut state = self.state.lock().expect("scheduled job mutex poisoned");
            state.feedback_msgs.push(msg);
            if !success {
                state.success = false;
            }
            state.num_active_build -= 1;
            state.num_active_build == 0
        };
        if done {
            let _ = self.commit_tx.send(Some(self));
        }
    }

    fn take_result(&self) -> (bool, Vec<String>) {
        let state = self.state.lock().expect("scheduled job mutex poisoned");
        (state.success, state.feedback_msgs.clone())
    }
}

/// Single-threaded serialization point for every repository's subprocess.
/// Strictly one worker thread by construction, so no per-repository lock
/// is required once `start` has moved `repos` into it.
pub struct CommitWorker {
    sender: Sender<Option<Arc<ScheduledJob>>>,
    receiver: Mutex<Option<Receiver<Option<Arc<ScheduledJob>>>>>,
    repos: Mutex<Option<HashMap<(String, String), RepositoryClient>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl CommitWorker {
    pub fn new(repos: HashMap<(String, String), RepositoryClient>) -> Self {
        let (sender, receiver) = channel();
        CommitWorker {
            sender,
            receiver: Mutex::new(Some(receiver)),
            repos: Mutex::new(Some(repos)),
            handle: Mutex::new(None),
        }
    }

    pub fn sender(&self) -> Sender<Option<Arc<ScheduledJob>>> {
        self.sender.clone()
    }

    pub fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .expect("commit worker receiver mutex poisoned")
            .take()
            .expect("CommitWorker::start called more than once");
        let mut repos = self
            .repos
            .lock()
            .expect("commit worker repos mutex poisoned")
            .take()
            .expect("CommitWorker::start called more than once");

        let handle = thread::spawn(move || {
            while let Ok(Some(scheduled)) = receiver.recv() {
                commit_one(&mut repos, &scheduled);
            }
            info!("commit worker stopped");
        });

        *self.handle.lock().expect("commit worker handle mutex poisoned") = Some(handle);
    }

    pub fn stop(&self) {
        let _ = self.sender.send(None);
        if let Some(handle) = self.handle.lock().expect("commit worker handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

/// Implements the §4.5.3 commit transaction: merge manifests, `ADD` to
/// every target repository, `ROLLBACK` everything touched on the first
/// failure (in reverse order of staging), otherwise `COMMIT` everything.
fn commit_one(repos: &mut HashMap<(String, String), RepositoryClient>, scheduled: &Arc<ScheduledJob>) {
    let (success, feedback_msgs) = scheduled.take_result();
    let job = &scheduled.job;

    if !success {
        job.notify_result(false, Some(feedback_msgs.join("\n")));
        return;
    }
    if !job.do_upload {
        job.notify_result(true, Some("Packages upload skipped".to_string()));
        return;
    }

    let manifest = match merge_manifests(job.pkgdir()) {
        Ok(m) => m,
        Err(e) => {
            job.notify_result(false, Some(e.to_string()));
            return;
        }
    };

    let mut modified: Vec<(String, String)> = Vec::new();
    let mut add_err: Option<SchedulerError> = None;
    for arch in &job.archs {
        let key = (job.upload_repo.clone(), arch.clone());
        modified.push(key.clone());
        match repos.get_mut(&key) {
            Some(repo) => {
                if let Err(e) = repo.add(&manifest) {
                    add_err = Some(e);
                    break;
                }
            }
            None => {
                add_err = Some(SchedulerError::new(format!(
                    "no repository configured for {:?} / {:?}",
                    job.upload_repo, arch
                )));
                break;
            }
        }
    }

    if let Some(e) = add_err {
        for key in modified.iter().rev() {
            if let Some(repo) = repos.get_mut(key) {
                if let Err(rollback_err) = repo.rollback() {
                    error!("rollback of {}/{} failed: {}", key.0, key.1, rollback_err);
                }
            }
        }
        job.notify_result(false, Some(e.to_string()));
        return;
    }

    for key in &modified {
        if let Some(repo) = repos.get_mut(key) {
            if let Err(e) = repo.commit() {
                error!("commit of {}/{} failed: {}", key.0, key.1, e);
                job.notify_result(false, Some(e.to_string()));
                return;
            }
        }
    }
    job.notify_result(true, None);
}

/// Owns the rule set, the builder-queue pool, the commit worker, and the
/// source-tarball generator; the single object an `EventSource` talks to.
pub struct JobScheduler {
    rules: IndexMap<String, FilterRule>,
    builder_queues: Vec<Arc<BuilderQueue>>,
    commit_worker: Arc<CommitWorker>,
    generator: Arc<dyn SourceTarballGenerator>,
}

impl JobScheduler {
    /// Constructs repositories, builder queues, and rules from
    /// configuration. Repository subprocesses are spawned here, at
    /// construction, and live for the scheduler's whole lifetime.
    pub fn new(
        config: &Config,
        builders: Vec<Arc<dyn Builder>>,
        generator: Arc<dyn SourceTarballGenerator>,
    ) -> JobResult<Self> {
        let mut repos = HashMap::new();
        for (repo_name, archs) in &config.repositories {
            for (arch, entry) in archs {
                let client = RepositoryClient::spawn(repo_name, &entry.path, arch)?;
                repos.insert((repo_name.clone(), arch.clone()), client);
            }
        }
        Self::with_repositories(config, builders, generator, repos)
    }

    /// Like [`JobScheduler::new`], but takes already-constructed
    /// repository clients instead of spawning `mmpack-modifyrepo`
    /// subprocesses itself. Lets a caller substitute a stand-in process
    /// for the repository protocol (see [`RepositoryClient::from_command`]).
    pub fn with_repositories(
        config: &Config,
        builders: Vec<Arc<dyn Builder>>,
        generator: Arc<dyn SourceTarballGenerator>,
        repos: HashMap<(String, String), RepositoryClient>,
    ) -> JobResult<Self> {
        let rules = FilterRule::load_rules(config)?;
        let builder_queues = builders.into_iter().map(|b| Arc::new(BuilderQueue::new(b))).collect();
        let commit_worker = Arc::new(CommitWorker::new(repos));

        Ok(JobScheduler {
            rules,
            builder_queues,
            commit_worker,
            generator,
        })
    }

    /// Starts every BuilderQueue worker, then the commit-queue worker.
    pub fn start(&self) {
        for queue in &self.builder_queues {
            queue.start();
        }
        self.commit_worker.start();
    }

    /// Stops every BuilderQueue (drain + sentinel + join), then the
    /// commit queue. In-flight builds run to completion.
    pub fn stop(&self) {
        for queue in &self.builder_queues {
            queue.stop();
        }
        self.commit_worker.stop();
    }

    /// Expands `request` into 0..N BuildJobs, applies rules, and schedules
    /// each for build. Returns once all produced jobs are queued; a
    /// per-job scheduling failure (e.g. `NoBuilderForArch`) is logged and
    /// does not prevent sibling jobs of the same request from scheduling.
    pub fn submit(&self, request: Arc<BuildRequest>) -> JobResult<()> {
        let entries = self.generator.generate(&request)?;
        if entries.is_empty() {
            info!("no packages produced for {}", request.project);
            return Ok(());
        }

        for entry in entries {
            if let Err(e) = self.submit_one(&request, entry) {
                error!("failed to schedule a package from {}: {}", request.project, e);
            }
        }
        Ok(())
    }

    fn submit_one(&self, request: &Arc<BuildRequest>, entry: TarballEntry) -> JobResult<()> {
        let workdir = WorkDir::create("buildsched-job")?;
        let filename = entry
            .tarball
            .file_name()
            .ok_or_else(|| SchedulerError::new("source tarball path has no file name"))?;
        let dest = workdir.path().join(filename);
        move_file(&entry.tarball, &dest)?;
        let srchash = sha256_hex(&dest)?;

        let raw = RawJob {
            prj_name: entry.name,
            version: entry.version,
            srctar: dest,
            srchash,
            workdir,
            do_upload: request.do_upload,
            upload_repo: request.upload_repo.clone(),
            archs: request.archs.clone(),
            deps_repos: request.deps_repos.clone(),
            request: Arc::clone(request),
        };

        let job = match FilterRule::first_match(&self.rules, &raw) {
            Some(rule) => rule.apply(raw),
            None => return Err(SchedulerError::config("no rule matched and no default rule is configured")),
        };

        if job.archs.is_empty() {
            info!("{} matched no architecture, dropping silently", job.prj_name);
            return Ok(());
        }

        let archs = job.archs.clone();
        let scheduled = ScheduledJob::new(job, archs.len(), self.commit_worker.sender());

        for arch in &archs {
            let queue = self.pick_queue(arch)?;
            queue.add_scheduled_job(Arc::clone(&scheduled));
        }

        Ok(())
    }

    /// Among builder queues producing `arch`, picks the one with the
    /// smallest current depth; ties broken by iteration (registration)
    /// order.
    fn pick_queue(&self, arch: &str) -> JobResult<&Arc<BuilderQueue>> {
        self.builder_queues
            .iter()
            .filter(|q| q.arch == arch)
            .min_by_key(|q| q.depth())
            .ok_or_else(|| SchedulerError::NoBuilderForArch(arch.to_string()))
    }
}

/// Moves `src` into `dest`, falling back to copy-then-remove when a plain
/// rename fails (e.g. `src` and `dest` live on different filesystems,
/// which a `tempfile` work directory does not guarantee against).
fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    if fs::rename(src, dest).is_ok() {
        return Ok(());
    }
    fs::copy(src, dest)?;
    fs::remove_file(src)
}

fn sha256_hex(path: &Path) -> JobResult<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
