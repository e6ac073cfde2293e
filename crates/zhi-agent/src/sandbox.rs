//! Output sandbox: the single directory tool-created files must land in.
//!
//! [`SandboxPath`] can only be obtained from [`OutputSandbox::resolve_new`],
//! so holding one means the path was checked for absolute paths, `..`
//! segments, symlink escapes and existing targets.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("Absolute paths are not allowed. Use a relative path.")]
    AbsolutePath,

    #[error("Path traversal ('..') is not allowed.")]
    PathTraversalRejected,

    #[error("Resolved path is outside the output directory. Possible symlink attack.")]
    OutsideRoot,

    #[error("File already exists: {0}. Cannot overwrite existing files.")]
    AlreadyExists(String),

    #[error("Invalid file path: {0}")]
    Invalid(String),
}

/// A validated, not-yet-existing file location under the sandbox root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPath {
    path: PathBuf,
    relative: String,
}

impl SandboxPath {
    pub fn as_path(&self) -> &Path {
        &self.path
    }

    /// The path as the caller wrote it, for messages.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// Create parent directories and write `contents` to a new file.
    ///
    /// Fails with `AlreadyExists` if something appeared at the path since
    /// it was resolved. Returns the number of bytes written.
    pub fn write_new(&self, contents: &[u8]) -> std::io::Result<u64> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)?;
        file.write_all(contents)?;
        Ok(contents.len() as u64)
    }
}

#[derive(Debug, Clone)]
pub struct OutputSandbox {
    root: PathBuf,
}

impl OutputSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A sandbox rooted at `<root>/<name>`, used to give each skill its
    /// own output folder.
    pub fn scoped(&self, name: &str) -> Self {
        Self {
            root: self.root.join(name),
        }
    }

    /// Validate `relative` and resolve it to a new file under the root.
    ///
    /// Creates the root directory if needed; nothing else is created.
    pub fn resolve_new(&self, relative: &str) -> Result<SandboxPath, SandboxError> {
        let rel = validate_relative(relative)?;

        std::fs::create_dir_all(&self.root).map_err(|e| {
            SandboxError::Invalid(format!("cannot create {}: {}", self.root.display(), e))
        })?;
        let root = self
            .root
            .canonicalize()
            .map_err(|e| SandboxError::Invalid(format!("{}: {}", self.root.display(), e)))?;

        let components: Vec<Component<'_>> = rel.components().collect();
        let last = components.len() - 1;
        let mut current = root.clone();

        for (i, comp) in components.iter().enumerate() {
            current.push(comp);
            match std::fs::symlink_metadata(&current) {
                Ok(meta) if meta.file_type().is_symlink() => {
                    let target = current.canonicalize().map_err(|_| {
                        warn!(path = %current.display(), "dangling symlink in output path");
                        SandboxError::OutsideRoot
                    })?;
                    if !target.starts_with(&root) {
                        warn!(path = %current.display(), target = %target.display(), "symlink escapes output directory");
                        return Err(SandboxError::OutsideRoot);
                    }
                    if i == last {
                        return Err(SandboxError::AlreadyExists(relative.to_string()));
                    }
                    current = target;
                }
                Ok(_) if i == last => {
                    return Err(SandboxError::AlreadyExists(relative.to_string()));
                }
                Ok(_) => {}
                Err(_) => {
                    // First missing component: nothing below it can exist.
                    for rest in &components[i + 1..] {
                        current.push(rest);
                    }
                    break;
                }
            }
        }

        debug!(path = %current.display(), "sandbox path resolved");
        Ok(SandboxPath {
            path: current,
            relative: relative.to_string(),
        })
    }
}

/// Lexical checks that need no filesystem access.
///
/// Returns the path with `.` segments removed.
pub fn validate_relative(relative: &str) -> Result<PathBuf, SandboxError> {
    let trimmed = relative.trim();
    if trimmed.is_empty() {
        return Err(SandboxError::Invalid("path is empty".to_string()));
    }
    if trimmed.contains('\0') {
        return Err(SandboxError::Invalid("path contains a NUL byte".to_string()));
    }
    if looks_absolute(trimmed) {
        return Err(SandboxError::AbsolutePath);
    }
    // Check both separators so `..\\x` is caught on unix too.
    if trimmed.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(SandboxError::PathTraversalRejected);
    }

    let mut clean = PathBuf::new();
    for comp in Path::new(trimmed).components() {
        match comp {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(SandboxError::PathTraversalRejected),
            Component::RootDir | Component::Prefix(_) => return Err(SandboxError::AbsolutePath),
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(SandboxError::Invalid(format!("'{relative}' does not name a file")));
    }
    Ok(clean)
}

fn looks_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    Path::new(path).is_absolute()
        || path.starts_with('/')
        || path.starts_with('\\')
        || path.starts_with('~')
        || (bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = OutputSandbox::new(dir.path());
        assert_eq!(
            sandbox.resolve_new("../etc/passwd"),
            Err(SandboxError::PathTraversalRejected)
        );
        assert_eq!(
            sandbox.resolve_new("notes/..\\..\\x.txt"),
            Err(SandboxError::PathTraversalRejected)
        );
    }

    #[test]
    fn test_rejects_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = OutputSandbox::new(dir.path());
        assert_eq!(sandbox.resolve_new("/etc/passwd"), Err(SandboxError::AbsolutePath));
        assert_eq!(sandbox.resolve_new("C:\\Windows\\x"), Err(SandboxError::AbsolutePath));
        assert_eq!(sandbox.resolve_new("~/.bashrc"), Err(SandboxError::AbsolutePath));
    }

    #[test]
    fn test_rejects_empty() {
        let sandbox = OutputSandbox::new("unused");
        assert!(matches!(sandbox.resolve_new("  "), Err(SandboxError::Invalid(_))));
        assert!(matches!(validate_relative("./."), Err(SandboxError::Invalid(_))));
    }

    #[test]
    fn test_resolves_nested_new_file() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("zhi-output");
        let sandbox = OutputSandbox::new(&root);

        let target = sandbox.resolve_new("./reports/q1/summary.md").unwrap();
        assert!(root.exists());
        assert!(target.as_path().ends_with("reports/q1/summary.md"));
        assert!(!target.as_path().exists());

        target.write_new(b"# Q1").unwrap();
        assert_eq!(std::fs::read_to_string(target.as_path()).unwrap(), "# Q1");
    }

    #[test]
    fn test_existing_file_is_never_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = OutputSandbox::new(dir.path());

        let first = sandbox.resolve_new("a.txt").unwrap();
        first.write_new(b"one").unwrap();

        assert_eq!(
            sandbox.resolve_new("a.txt"),
            Err(SandboxError::AlreadyExists("a.txt".to_string()))
        );
        // A stale handle cannot clobber the file either.
        let err = first.write_new(b"two").unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read_to_string(first.as_path()).unwrap(), "one");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_rejected() {
        let outside = tempfile::tempdir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("link")).unwrap();

        let sandbox = OutputSandbox::new(dir.path());
        assert_eq!(
            sandbox.resolve_new("link/evil.txt"),
            Err(SandboxError::OutsideRoot)
        );
        assert!(!outside.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_inside_root_allowed() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("real")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("alias")).unwrap();

        let sandbox = OutputSandbox::new(dir.path());
        let target = sandbox.resolve_new("alias/ok.txt").unwrap();
        assert!(target.as_path().ends_with("real/ok.txt"));
    }

    #[test]
    fn test_scoped_sandbox() {
        let dir = tempfile::tempdir().unwrap();
        let sandbox = OutputSandbox::new(dir.path()).scoped("summarize");
        let target = sandbox.resolve_new("out.md").unwrap();
        assert!(target.as_path().ends_with("summarize/out.md"));
    }
}
