//! Core value types: the incoming [`BuildRequest`], the two-phase
//! [`RawJob`]/[`BuildJob`] representation of one source package, and the
//! [`WorkDir`] guard that owns a job's working directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One-way capability a [`BuildRequest`] exposes back to its originating
/// event source. Holding only this (rather than the whole request) is how
/// `BuildJob` avoids a request -> job -> request reference cycle.
pub trait NotifyResult: Send + Sync {
    fn notify_result(&self, success: bool, message: Option<String>);
}

/// Recognized options of `srctar_make_opts`.
#[derive(Debug, Clone, Copy)]
pub struct SrctarMakeOpts {
    pub version_from_vcs: bool,
    pub only_modified: bool,
}

impl Default for SrctarMakeOpts {
    fn default() -> Self {
        SrctarMakeOpts {
            version_from_vcs: false,
            only_modified: true,
        }
    }
}

/// An incoming intent to build, derived from an upstream change event.
/// Immutable after construction.
///
/// `upload_repo`/`archs`/`deps_repos` aren't called out in the narrative
/// attribute list of a `BuildRequest` but are present (empty by default)
/// on the original `BuildRequest` this is grounded on -- an event source
/// that already knows a fixed repo/arch/deps set for every job it submits
/// can set them instead of relying on `FilterRule` matching. Most event
/// sources leave them empty and let rule application fill them in.
pub struct BuildRequest {
    pub project: String,
    pub url: String,
    pub refspec: String,
    pub do_upload: bool,
    pub srctar_make_opts: SrctarMakeOpts,
    pub upload_repo: String,
    pub archs: Vec<String>,
    pub deps_repos: Vec<String>,
    notify: Box<dyn NotifyResult>,
}

impl BuildRequest {
    pub fn new(
        project: impl Into<String>,
        url: impl Into<String>,
        refspec: impl Into<String>,
        notify: Box<dyn NotifyResult>,
    ) -> Self {
        BuildRequest {
            project: project.into(),
            url: url.into(),
            refspec: refspec.into(),
            do_upload: true,
            srctar_make_opts: SrctarMakeOpts::default(),
            upload_repo: String::new(),
            archs: Vec::new(),
            deps_repos: Vec::new(),
            notify,
        }
    }

    /// Invoked by a `BuildJob` exactly once per terminal outcome.
    pub fn notify_result(&self, success: bool, message: Option<String>) {
        self.notify.notify_result(success, message);
    }
}

impl std::fmt::Debug for BuildRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildRequest")
            .field("project", &self.project)
            .field("url", &self.url)
            .field("refspec", &self.refspec)
            .finish()
    }
}

/// RAII guard owning a `BuildJob`'s exclusively-owned working directory.
/// The directory is removed when the guard is dropped, on every exit path
/// (commit success, commit failure, or early drop for an empty-`archs`
/// job) -- no finalizer timing to reason about.
pub struct WorkDir(tempfile::TempDir);

impl WorkDir {
    pub fn create(prefix: &str) -> std::io::Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(WorkDir(dir))
    }

    pub fn path(&self) -> &Path {
        self.0.path()
    }

    /// Unique identifier of the owned work directory, used as `build_id`.
    pub fn build_id(&self) -> String {
        self.0
            .path()
            .file_name()
            .expect("tempdir always has a file name")
            .to_string_lossy()
            .into_owned()
    }
}

impl std::fmt::Debug for WorkDir {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "WorkDir({})", self.path().display())
    }
}

/// Pre-rule state of a produced source package: scalar defaults have been
/// copied from the `BuildRequest`, but `upload_repo`/`archs`/`deps_repos`
/// have not yet been assigned by a [`crate::rules::FilterRule`].
pub struct RawJob {
    pub prj_name: String,
    pub version: String,
    pub srctar: PathBuf,
    pub srchash: String,
    pub workdir: WorkDir,
    pub do_upload: bool,
    pub upload_repo: String,
    pub archs: Vec<String>,
    pub deps_repos: Vec<String>,
    pub request: Arc<BuildRequest>,
}

impl RawJob {
    /// Looks up a named attribute for rule matching. Non-existent
    /// attributes return `None`, which `FilterRule::matches` treats as a
    /// non-match rather than an error.
    pub fn attr(&self, name: &str) -> Option<&str> {
        match name {
            "prj_name" => Some(&self.prj_name),
            "version" => Some(&self.version),
            "srchash" => Some(&self.srchash),
            "upload_repo" => Some(&self.upload_repo),
            "project" => Some(&self.request.project),
            "url" => Some(&self.request.url),
            "refspec" => Some(&self.request.refspec),
            _ => None,
        }
    }
}

/// Post-rule state of a produced source package: all routing fields are
/// final and the value is immutable for the remainder of its life.
#[derive(Debug)]
pub struct BuildJob {
    pub prj_name: String,
    pub version: String,
    pub srctar: PathBuf,
    pub srchash: String,
    pub workdir: WorkDir,
    pub archs: Vec<String>,
    pub upload_repo: String,
    pub deps_repos: Vec<String>,
    pub do_upload: bool,
    pub request: Arc<BuildRequest>,
}

impl BuildJob {
    pub fn pkgdir(&self) -> &Path {
        self.workdir.path()
    }

    pub fn build_id(&self) -> String {
        self.workdir.build_id()
    }

    pub fn notify_result(&self, success: bool, message: Option<String>) {
        self.request.notify_result(success, message);
    }
}

impl std::fmt::Display for BuildJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{} {} (build {})",
            self.prj_name,
            self.version,
            self.srchash,
            self.build_id()
        )
    }
}
