use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("path \"{path}\" resolves outside the permitted working directory")]
    Containment { path: String },
    #[error("sandbox root \"{path}\" is not a directory")]
    InvalidRoot { path: String },
}

/// Confines every filesystem-touching tool to one directory tree.
///
/// `resolve` is a pure path computation up to the containment decision: a
/// candidate that escapes the root lexically is rejected before any
/// filesystem call could observe it. Symlinks inside the root are resolved
/// afterwards and re-checked, so a link pointing outside is also rejected.
#[derive(Debug)]
pub struct PathSandbox {
    root: PathBuf,
}

impl PathSandbox {
    pub fn new(root: &Path) -> Result<Self, SandboxError> {
        let canonical = std::fs::canonicalize(root).map_err(|_| SandboxError::InvalidRoot {
            path: root.display().to_string(),
        })?;
        if !canonical.is_dir() {
            return Err(SandboxError::InvalidRoot {
                path: root.display().to_string(),
            });
        }
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a model-supplied path against the sandbox root.
    ///
    /// Returns the absolute target path, or `Containment` when the candidate
    /// lands outside the root. Comparison is on path-segment boundaries:
    /// with root `/work`, the candidate `../workshop/x` fails even though
    /// `/work` is a string prefix of `/workshop`.
    pub fn resolve(&self, candidate: &str) -> Result<PathBuf, SandboxError> {
        let raw = Path::new(candidate);
        let joined = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.root.join(raw)
        };

        let normalized = normalize_lexically(&joined);
        if !normalized.starts_with(&self.root) {
            return Err(SandboxError::Containment {
                path: candidate.to_string(),
            });
        }

        // The lexical check passed, so the existing ancestors we canonicalize
        // here all lie inside the root. A symlink may still point elsewhere.
        let resolved = resolve_existing_prefix(&normalized);
        if !resolved.starts_with(&self.root) {
            return Err(SandboxError::Containment {
                path: candidate.to_string(),
            });
        }
        Ok(resolved)
    }
}

/// Collapse `.` and `..` components without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
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

/// Canonicalize the longest existing ancestor and re-append the remainder,
/// so symlinked directories inside the root cannot smuggle a path outside.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut trailing = Vec::new();
    while !existing.exists() {
        let Some(name) = existing.file_name().map(ToOwned::to_owned) else {
            break;
        };
        trailing.push(name);
        if !existing.pop() {
            break;
        }
    }

    let mut resolved = std::fs::canonicalize(&existing).unwrap_or(existing);
    for name in trailing.iter().rev() {
        resolved.push(name);
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn sandbox_pair() -> (tempfile::TempDir, PathSandbox) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("work");
        fs::create_dir_all(&root).expect("root");
        let sandbox = PathSandbox::new(&root).expect("sandbox");
        (dir, sandbox)
    }

    #[test]
    fn resolves_paths_inside_root() {
        let (_dir, sandbox) = sandbox_pair();
        let resolved = sandbox.resolve("src/main.py").expect("inside");
        assert!(resolved.starts_with(sandbox.root()));
        assert!(resolved.ends_with("src/main.py"));
    }

    #[test]
    fn dot_resolves_to_root_itself() {
        let (_dir, sandbox) = sandbox_pair();
        let resolved = sandbox.resolve(".").expect("dot");
        assert_eq!(resolved, sandbox.root());
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let (_dir, sandbox) = sandbox_pair();
        for escape in ["..", "../secret.txt", "a/../../secret.txt", "a/b/../../../x"] {
            let err = sandbox.resolve(escape).expect_err(escape);
            assert!(matches!(err, SandboxError::Containment { .. }), "{escape}");
        }
    }

    #[test]
    fn interior_dotdot_that_stays_inside_is_allowed() {
        let (_dir, sandbox) = sandbox_pair();
        let resolved = sandbox.resolve("a/b/../c.txt").expect("stays inside");
        assert!(resolved.ends_with("a/c.txt"));
    }

    #[test]
    fn sibling_with_shared_string_prefix_is_rejected() {
        // root=<tmp>/work must not accept <tmp>/workshop even though "work"
        // is a string prefix of "workshop".
        let (dir, sandbox) = sandbox_pair();
        fs::create_dir_all(dir.path().join("workshop")).expect("sibling");
        let err = sandbox
            .resolve("../workshop/x.txt")
            .expect_err("sibling escape");
        assert!(matches!(err, SandboxError::Containment { .. }));
    }

    #[test]
    fn absolute_path_outside_root_is_rejected() {
        let (_dir, sandbox) = sandbox_pair();
        let err = sandbox.resolve("/etc/passwd").expect_err("absolute escape");
        assert!(matches!(err, SandboxError::Containment { .. }));
    }

    #[test]
    fn absolute_path_inside_root_is_accepted() {
        let (_dir, sandbox) = sandbox_pair();
        let inside = sandbox.root().join("notes.txt");
        let resolved = sandbox
            .resolve(inside.to_str().expect("utf-8 path"))
            .expect("absolute inside");
        assert_eq!(resolved, inside);
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_the_root_is_rejected() {
        let (dir, sandbox) = sandbox_pair();
        let outside = dir.path().join("outside");
        fs::create_dir_all(&outside).expect("outside dir");
        fs::write(outside.join("secret.txt"), "secret").expect("secret");
        std::os::unix::fs::symlink(&outside, sandbox.root().join("link")).expect("symlink");

        let err = sandbox
            .resolve("link/secret.txt")
            .expect_err("symlink escape");
        assert!(matches!(err, SandboxError::Containment { .. }));
    }

    #[test]
    fn missing_root_is_an_invalid_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = PathSandbox::new(&dir.path().join("nope")).expect_err("missing root");
        assert!(matches!(err, SandboxError::InvalidRoot { .. }));
    }
}
