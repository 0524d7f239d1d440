//! Thin request/response conduit to the external repository-mutation
//! subprocess (`mmpack-modifyrepo --path=<p> --arch=<a> batch`), speaking
//! a newline-delimited `ADD`/`COMMIT`/`ROLLBACK` protocol. Modeled on the
//! subprocess plumbing in `run_command`, simplified to the single-line
//! request/response shape this protocol uses (no need for `run_command`'s
//! dual stdout/stderr reader threads, since this protocol replies with
//! exactly one line per command).

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use log::info;

use crate::errors::{JobResult, SchedulerError};

/// One `(upload-target, architecture)` repository, backed by a live
/// `mmpack-modifyrepo batch` subprocess. Not concurrency-safe: callers
/// must serialize access (the scheduler does this by routing all
/// repository traffic through a single commit worker, see
/// `scheduler::CommitWorker`).
pub struct RepositoryClient {
    pub name: String,
    pub arch: String,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl RepositoryClient {
    pub fn spawn(name: &str, path: &str, arch: &str) -> JobResult<Self> {
        let mut cmd = Command::new("mmpack-modifyrepo");
        cmd.arg(format!("--path={}", path))
            .arg(format!("--arch={}", arch))
            .arg("batch");

        info!("starting repository subprocess for {} ({})", name, arch);
        Self::from_command(name, arch, cmd)
    }

    /// Spawns `cmd` (with stdio wired up) as the repository subprocess.
    /// Split out from `spawn` so callers (or tests) can substitute a
    /// stand-in process speaking the same protocol instead of the real
    /// `mmpack-modifyrepo` binary.
    pub fn from_command(name: &str, arch: &str, mut cmd: Command) -> JobResult<Self> {
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| SchedulerError::new(format!("can't start repository subprocess for {}: {}", name, e)))?;

        let stdin = child.stdin.take().expect("piped stdin");
        let stdout = BufReader::new(child.stdout.take().expect("piped stdout"));

        Ok(RepositoryClient {
            name: name.to_string(),
            arch: arch.to_string(),
            child,
            stdin,
            stdout,
        })
    }

    fn send_cmd(&mut self, line: &str, command: &'static str) -> JobResult<()> {
        writeln!(self.stdin, "{}", line)
            .map_err(|e| SchedulerError::new(format!("can't write to {}: {}", self.name, e)))?;
        self.stdin
            .flush()
            .map_err(|e| SchedulerError::new(format!("can't flush to {}: {}", self.name, e)))?;

        let mut reply = String::new();
        self.stdout
            .read_line(&mut reply)
            .map_err(|e| SchedulerError::new(format!("can't read from {}: {}", self.name, e)))?;
        let reply = reply.trim_end_matches('\n');

        let mut parts = reply.splitn(2, ' ');
        let status = parts.next().unwrap_or("");
        let msg = parts.next().unwrap_or("").to_string();

        if status != "OK" {
            return Err(SchedulerError::Repository {
                name: self.name.clone(),
                command,
                message: if msg.is_empty() { reply.to_string() } else { msg },
            });
        }
        Ok(())
    }

    /// Stage adding a manifest to the repository.
    pub fn add(&mut self, manifest_path: &str) -> JobResult<()> {
        self.send_cmd(&format!("ADD {}", manifest_path), "ADD")
    }

    /// Commit staged changes.
    pub fn commit(&mut self) -> JobResult<()> {
        self.send_cmd("COMMIT", "COMMIT")
    }

    /// Roll back staged changes.
    pub fn rollback(&mut self) -> JobResult<()> {
        self.send_cmd("ROLLBACK", "ROLLBACK")
    }
}

impl Drop for RepositoryClient {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}
