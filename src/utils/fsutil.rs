//! Read-only file-tree materialization shared by instructions and skills.
//!
//! Materialized trees are per-run and replaced wholesale before reuse; every
//! written file ends with permission bits 0444 (write cleared for all
//! classes).

use miette::Diagnostic;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Filesystem failures during materialization.
#[derive(Debug, Error, Diagnostic)]
pub enum FsError {
    #[error("i/o error at {path}: {source}")]
    #[diagnostic(code(llmctl_engine::fsutil::io))]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("materialized path {path} escapes every permitted root")]
    #[diagnostic(
        code(llmctl_engine::fsutil::containment),
        help("Materialized files must resolve beneath the workspace or a runtime home.")
    )]
    Containment { path: PathBuf },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> FsError + '_ {
    move |source| FsError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Lexically normalize a path (resolve `.` and `..` without touching the fs).
#[must_use]
pub fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Returns `true` when `path` resolves beneath at least one of `roots`.
#[must_use]
pub fn resolves_under(path: &Path, roots: &[&Path]) -> bool {
    let normalized = normalize_lexically(path);
    roots
        .iter()
        .any(|root| normalized.starts_with(normalize_lexically(root)))
}

/// Write one file read-only, creating parent directories as needed.
pub fn write_read_only_file(path: &Path, content: &[u8]) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err(parent))?;
    }
    // An earlier materialization may have left a read-only file behind.
    if path.exists() {
        let mut perms = fs::metadata(path).map_err(io_err(path))?.permissions();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            perms.set_mode(0o644);
        }
        #[cfg(not(unix))]
        perms.set_readonly(false);
        fs::set_permissions(path, perms).map_err(io_err(path))?;
    }
    fs::write(path, content).map_err(io_err(path))?;
    let mut perms = fs::metadata(path).map_err(io_err(path))?.permissions();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(0o444);
    }
    #[cfg(not(unix))]
    perms.set_readonly(true);
    fs::set_permissions(path, perms).map_err(io_err(path))?;
    Ok(())
}

/// Replace a materialization root: remove any previous tree, recreate empty.
pub fn replace_tree(root: &Path) -> Result<(), FsError> {
    if root.exists() {
        remove_read_only_tree(root)?;
    }
    fs::create_dir_all(root).map_err(io_err(root))
}

/// Remove a tree that may contain read-only entries.
pub fn remove_read_only_tree(root: &Path) -> Result<(), FsError> {
    for entry in fs::read_dir(root).map_err(io_err(root))? {
        let entry = entry.map_err(io_err(root))?;
        let path = entry.path();
        if path.is_dir() {
            remove_read_only_tree(&path)?;
        } else {
            let mut perms = fs::metadata(&path).map_err(io_err(&path))?.permissions();
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                perms.set_mode(0o644);
            }
            #[cfg(not(unix))]
            perms.set_readonly(false);
            fs::set_permissions(&path, perms).map_err(io_err(&path))?;
            fs::remove_file(&path).map_err(io_err(&path))?;
        }
    }
    fs::remove_dir(root).map_err(io_err(root))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_resolves_dot_segments() {
        let normalized = normalize_lexically(Path::new("/a/b/../c/./d"));
        assert_eq!(normalized, PathBuf::from("/a/c/d"));
    }

    #[test]
    fn containment_rejects_escapes() {
        let workspace = Path::new("/work/run-1");
        assert!(resolves_under(Path::new("/work/run-1/x/y"), &[workspace]));
        assert!(!resolves_under(Path::new("/work/run-1/../other"), &[workspace]));
    }
}
