//! End-to-end scenarios driving a real `JobScheduler` with fake builders
//! and fake repository subprocesses (a small shell script speaking the
//! `ADD`/`COMMIT`/`ROLLBACK` protocol and logging every line it receives),
//! instead of mocking at the unit level.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use buildsched::builder::Builder;
use buildsched::config::Config;
use buildsched::errors::{JobResult, SchedulerError};
use buildsched::models::{BuildJob, BuildRequest, NotifyResult};
use buildsched::repository::RepositoryClient;
use buildsched::scheduler::{JobScheduler, SourceTarballGenerator, TarballEntry};

/// Spawns a stand-in for `mmpack-modifyrepo batch`: appends every line it
/// receives to `log_path` and replies `OK` to everything, unless
/// `reject_add` is set, in which case `ADD` lines get `ERR disk full`.
fn fake_repo_command(log_path: &Path, reject_add: bool) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(
        r#"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "$LOGFILE"
  case "$line" in
    ADD*)
      if [ "$REJECT" = "1" ]; then echo "ERR disk full"; else echo "OK"; fi
      ;;
    *) echo "OK" ;;
  esac
done
"#,
    );
    cmd.env("LOGFILE", log_path);
    cmd.env("REJECT", if reject_add { "1" } else { "0" });
    cmd
}

fn read_log(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|s| s.to_string())
        .collect()
}

/// The manifest path `merge_manifests` returns is the merged file's full
/// path inside the job's (unpredictable, tempdir-based) working
/// directory, so the `ADD` line is matched by suffix rather than exact
/// equality.
fn assert_add_line(line: &str) {
    assert!(line.starts_with("ADD "), "expected an ADD line, got {:?}", line);
    assert!(line.ends_with("foo_1.0.mmpack-manifest"), "unexpected manifest path in {:?}", line);
}

/// Notifies a channel instead of an upstream event source, so tests can
/// block on the terminal callback a submitted request receives exactly
/// once.
struct ChannelNotify(Mutex<Sender<(bool, Option<String>)>>);

impl NotifyResult for ChannelNotify {
    fn notify_result(&self, success: bool, message: Option<String>) {
        let _ = self.0.lock().unwrap().send((success, message));
    }
}

fn request(tx: Sender<(bool, Option<String>)>, do_upload: bool) -> Arc<BuildRequest> {
    let mut req = BuildRequest::new("proj", "git://example/proj", "main", Box::new(ChannelNotify(Mutex::new(tx))));
    req.do_upload = do_upload;
    Arc::new(req)
}

fn recv_result(rx: &Receiver<(bool, Option<String>)>) -> (bool, Option<String>) {
    rx.recv_timeout(Duration::from_secs(5)).expect("notify_result was not called in time")
}

/// Produces exactly one package, `name`-`version`, backed by a throwaway
/// tarball file it writes on demand.
struct FixedGenerator {
    name: String,
    version: String,
    dir: tempfile::TempDir,
}

impl FixedGenerator {
    fn new(name: &str, version: &str) -> Self {
        FixedGenerator {
            name: name.to_string(),
            version: version.to_string(),
            dir: tempfile::tempdir().unwrap(),
        }
    }
}

impl SourceTarballGenerator for FixedGenerator {
    fn generate(&self, _request: &BuildRequest) -> JobResult<Vec<TarballEntry>> {
        let tarball = self.dir.path().join(format!("{}-{}.tar", self.name, self.version));
        fs::write(&tarball, b"not a real tarball").unwrap();
        Ok(vec![TarballEntry {
            name: self.name.clone(),
            version: self.version.clone(),
            tarball,
        }])
    }
}

/// A `Builder` that, on success, writes its own `<arch>.mmpack-manifest`
/// into the job's working directory -- the way a real builder would drop
/// its output there for the commit phase to merge.
struct ScenarioBuilder {
    name: String,
    arch: String,
    fail: bool,
}

impl Builder for ScenarioBuilder {
    fn name(&self) -> &str {
        &self.name
    }

    fn arch(&self) -> &str {
        &self.arch
    }

    fn build(&self, job: &BuildJob) -> JobResult<()> {
        if self.fail {
            return Err(SchedulerError::Build(format!("{} exploded", self.name)));
        }
        let manifest = format!(
            "name: {}\nsource: {}\nversion: \"{}\"\nbinpkgs:\n  {}: {{file: {}.mpk}}\n",
            job.prj_name, job.prj_name, job.version, self.arch, self.arch
        );
        fs::write(job.pkgdir().join(format!("{}.mmpack-manifest", self.arch)), manifest).unwrap();
        Ok(())
    }
}

fn config(archs: &[&str]) -> Config {
    let mut doc = String::from("repositories:\n  main:\n");
    for arch in archs {
        doc.push_str(&format!("    {}:\n      path: /tmp/unused-{}\n", arch, arch));
    }
    doc.push_str("builders:\n");
    for arch in archs {
        doc.push_str(&format!("  b-{}:\n    arch: {}\n", arch, arch));
    }
    Config::from_str(&doc).unwrap()
}

#[test]
fn single_arch_success_adds_then_commits() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("x86.log");
    let cfg = config(&["x86"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log, false)).unwrap(),
    );

    let builders: Vec<Arc<dyn Builder>> = vec![Arc::new(ScenarioBuilder {
        name: "b-x86".to_string(),
        arch: "x86".to_string(),
        fail: false,
    })];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, true)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(success);
    assert_eq!(message, None);
    let lines = read_log(&log);
    assert_eq!(lines.len(), 2);
    assert_add_line(&lines[0]);
    assert_eq!(lines[1], "COMMIT");
}

#[test]
fn fan_out_two_arches_commits_both_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let log_x86 = dir.path().join("x86.log");
    let log_arm = dir.path().join("arm.log");
    let cfg = config(&["x86", "arm"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log_x86, false)).unwrap(),
    );
    repos.insert(
        ("main".to_string(), "arm".to_string()),
        RepositoryClient::from_command("main", "arm", fake_repo_command(&log_arm, false)).unwrap(),
    );

    let builders: Vec<Arc<dyn Builder>> = vec![
        Arc::new(ScenarioBuilder { name: "b-x86".to_string(), arch: "x86".to_string(), fail: false }),
        Arc::new(ScenarioBuilder { name: "b-arm".to_string(), arch: "arm".to_string(), fail: false }),
    ];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, true)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(success);
    assert_eq!(message, None);
    for log in [&log_x86, &log_arm] {
        let lines = read_log(log);
        assert_eq!(lines.len(), 2);
        assert_add_line(&lines[0]);
        assert_eq!(lines[1], "COMMIT");
    }
}

#[test]
fn partial_build_failure_skips_repository_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let log_x86 = dir.path().join("x86.log");
    let log_arm = dir.path().join("arm.log");
    let cfg = config(&["x86", "arm"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log_x86, false)).unwrap(),
    );
    repos.insert(
        ("main".to_string(), "arm".to_string()),
        RepositoryClient::from_command("main", "arm", fake_repo_command(&log_arm, false)).unwrap(),
    );

    let builders: Vec<Arc<dyn Builder>> = vec![
        Arc::new(ScenarioBuilder { name: "b-x86".to_string(), arch: "x86".to_string(), fail: false }),
        Arc::new(ScenarioBuilder { name: "b-arm".to_string(), arch: "arm".to_string(), fail: true }),
    ];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, true)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(!success);
    assert!(message.unwrap().contains("b-arm exploded"));
    assert!(read_log(&log_x86).is_empty());
    assert!(read_log(&log_arm).is_empty());
}

#[test]
fn manifest_inconsistency_blocks_all_repository_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("x86.log");
    let cfg = config(&["x86"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log, false)).unwrap(),
    );

    struct ConflictingManifestsBuilder;
    impl Builder for ConflictingManifestsBuilder {
        fn name(&self) -> &str {
            "b-x86"
        }
        fn arch(&self) -> &str {
            "x86"
        }
        fn build(&self, job: &BuildJob) -> JobResult<()> {
            fs::write(
                job.pkgdir().join("a.mmpack-manifest"),
                "name: foo\nsource: foo\nversion: \"1.0\"\nbinpkgs:\n  x86: {}\n",
            )
            .unwrap();
            fs::write(
                job.pkgdir().join("b.mmpack-manifest"),
                "name: foo\nsource: foo\nversion: \"2.0\"\nbinpkgs:\n  x86: {}\n",
            )
            .unwrap();
            Ok(())
        }
    }

    let builders: Vec<Arc<dyn Builder>> = vec![Arc::new(ConflictingManifestsBuilder)];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, true)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(!success);
    assert_eq!(message.unwrap(), "merging inconsistent manifest");
    assert!(read_log(&log).is_empty());
}

#[test]
fn add_phase_rejection_rolls_back_every_staged_repository() {
    let dir = tempfile::tempdir().unwrap();
    let log_x86 = dir.path().join("x86.log");
    let log_arm = dir.path().join("arm.log");
    let cfg = config(&["x86", "arm"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log_x86, false)).unwrap(),
    );
    repos.insert(
        ("main".to_string(), "arm".to_string()),
        RepositoryClient::from_command("main", "arm", fake_repo_command(&log_arm, true)).unwrap(),
    );

    let builders: Vec<Arc<dyn Builder>> = vec![
        Arc::new(ScenarioBuilder { name: "b-x86".to_string(), arch: "x86".to_string(), fail: false }),
        Arc::new(ScenarioBuilder { name: "b-arm".to_string(), arch: "arm".to_string(), fail: false }),
    ];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, true)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(!success);
    assert!(message.unwrap().contains("disk full"));
    let x86_lines = read_log(&log_x86);
    assert_eq!(x86_lines.len(), 2);
    assert_add_line(&x86_lines[0]);
    assert_eq!(x86_lines[1], "ROLLBACK");

    let arm_lines = read_log(&log_arm);
    assert_eq!(arm_lines.len(), 2);
    assert_add_line(&arm_lines[0]);
    assert_eq!(arm_lines[1], "ROLLBACK");
}

#[test]
fn upload_skipped_sends_no_repository_traffic() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("x86.log");
    let cfg = config(&["x86"]);

    let mut repos = HashMap::new();
    repos.insert(
        ("main".to_string(), "x86".to_string()),
        RepositoryClient::from_command("main", "x86", fake_repo_command(&log, false)).unwrap(),
    );

    let builders: Vec<Arc<dyn Builder>> = vec![Arc::new(ScenarioBuilder {
        name: "b-x86".to_string(),
        arch: "x86".to_string(),
        fail: false,
    })];
    let generator = Arc::new(FixedGenerator::new("foo", "1.0"));

    let scheduler = JobScheduler::with_repositories(&cfg, builders, generator, repos).unwrap();
    scheduler.start();

    let (tx, rx) = channel();
    scheduler.submit(request(tx, false)).unwrap();
    let (success, message) = recv_result(&rx);
    scheduler.stop();

    assert!(success);
    assert_eq!(message.as_deref(), Some("Packages upload skipped"));
    assert!(read_log(&log).is_empty());
}
