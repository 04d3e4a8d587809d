//! Local project layout and remote path helpers.

use std::path::{Path, PathBuf};
use log::debug;

use crate::process::{Invocation, ProcessRunner};

/// Object directory used when not on a named git branch
pub const DEFAULT_OBJ_DIR: &str = "obj";

/// Where the project lives locally and how its build output is named
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    top_path: PathBuf,
    obj_dir: String,
}

impl ProjectLayout {
    /// Layout rooted at `top_path` with a fixed object directory name
    pub fn new(top_path: impl Into<PathBuf>, obj_dir: impl Into<String>) -> Self {
        ProjectLayout {
            top_path: top_path.into(),
            obj_dir: obj_dir.into(),
        }
    }

    /// Layout rooted at the absolute form of `top_path`, naming the object
    /// directory after the branch checked out there
    pub async fn discover(runner: &dyn ProcessRunner, top_path: impl Into<PathBuf>) -> Self {
        let top_path = top_path.into();
        let top_path = match tokio::fs::canonicalize(&top_path).await {
            Ok(path) => path,
            Err(e) => {
                debug!("cannot resolve {}: {}", top_path.display(), e);
                top_path
            }
        };
        let obj_dir = detect_obj_dir(runner, &top_path).await;
        Self::new(top_path, obj_dir)
    }

    /// Project root
    pub fn top_path(&self) -> &Path {
        &self.top_path
    }

    /// `<top>/scripts`
    pub fn scripts_path(&self) -> PathBuf {
        self.top_path.join("scripts")
    }

    /// `<top>/<obj dir>`
    pub fn obj_path(&self) -> PathBuf {
        self.top_path.join(&self.obj_dir)
    }

    /// Object directory name, `obj` or `obj.<branch>`
    pub fn obj_dir(&self) -> &str {
        &self.obj_dir
    }
}

/// `obj.<branch>` when HEAD of the repository at `root` is a branch, `obj`
/// otherwise
pub async fn detect_obj_dir(runner: &dyn ProcessRunner, root: &Path) -> String {
    let invocation = Invocation::new("git")
        .arg("-C")
        .arg(root.display().to_string())
        .args(["symbolic-ref", "-q", "HEAD"]);
    match runner.capture(&invocation).await {
        Ok(output) if output.succeeded() => obj_dir_for_ref(output.trimmed_stdout()),
        Ok(output) => {
            debug!("not on a git branch (status {})", output.status);
            DEFAULT_OBJ_DIR.to_string()
        }
        Err(e) => {
            debug!("git unavailable: {}", e);
            DEFAULT_OBJ_DIR.to_string()
        }
    }
}

/// Map a symbolic ref to an object directory name
pub fn obj_dir_for_ref(symbolic_ref: &str) -> String {
    match symbolic_ref.trim().strip_prefix("refs/heads/") {
        Some(branch) if !branch.is_empty() => format!("{}.{}", DEFAULT_OBJ_DIR, branch),
        _ => DEFAULT_OBJ_DIR.to_string(),
    }
}

/// Join remote POSIX path components
pub fn remote_join(base: &str, component: &str) -> String {
    if component.starts_with('/') {
        component.to_string()
    } else if base.ends_with('/') {
        format!("{}{}", base, component)
    } else {
        format!("{}/{}", base, component)
    }
}

/// Directory part of a relative log path, `.` when there is none
pub fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => ".".to_string(),
    }
}

/// Final component of a path
pub fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => trimmed[idx + 1..].to_string(),
        None => trimmed.to_string(),
    }
}
