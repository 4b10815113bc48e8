use std::path::{Component, Path, PathBuf};

use super::error::AgentMuxError;

/// Confines working directories and file operations to a configured root,
/// resolving `..` lexically before ever touching the filesystem and
/// re-checking symlinks against the canonicalized root when the path
/// exists.
#[derive(Debug, Clone)]
pub struct PathGuard {
    root: PathBuf,
}

impl PathGuard {
    /// `root` should already be canonicalized by the caller (the config
    /// layer does this once at startup) so every guard in the process
    /// agrees on what "inside" means.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn validate(&self, path: &str) -> Result<PathBuf, AgentMuxError> {
        let candidate = Path::new(path);
        let absolute = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            self.root.join(candidate)
        };

        let lexical = Self::normalize(&absolute);
        if !lexical.starts_with(&self.root) {
            return Err(AgentMuxError::Validation(format!(
                "path '{}' escapes root '{}'",
                lexical.display(),
                self.root.display()
            )));
        }

        if let Ok(canonical) = std::fs::canonicalize(&lexical) {
            if !canonical.starts_with(&self.root) {
                return Err(AgentMuxError::Validation(format!(
                    "resolved path '{}' escapes root '{}' via symlink",
                    canonical.display(),
                    self.root.display()
                )));
            }
            return Ok(canonical);
        }

        Ok(lexical)
    }

    /// Removes `.` and `..` components without touching the filesystem —
    /// the path may not exist yet (a session's working directory is
    /// validated before it is ever used).
    fn normalize(path: &Path) -> PathBuf {
        let mut out = PathBuf::new();
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    out.pop();
                }
                Component::CurDir => {}
                other => out.push(other.as_os_str()),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_parent_escape() {
        let guard = PathGuard::new(PathBuf::from("/root/project"));
        assert!(guard.validate("../etc/passwd").is_err());
        assert!(guard.validate("/root/project/../../etc").is_err());
    }

    #[test]
    fn accepts_root_itself() {
        let guard = PathGuard::new(PathBuf::from("/root/project"));
        assert!(guard.validate("/root/project").is_ok());
    }

    #[test]
    fn accepts_relative_path_inside_root() {
        let guard = PathGuard::new(PathBuf::from("/root/project"));
        let resolved = guard.validate("subdir/work").unwrap();
        assert_eq!(resolved, PathBuf::from("/root/project/subdir/work"));
    }

    #[test]
    fn dotdot_that_stays_inside_root_is_fine() {
        let guard = PathGuard::new(PathBuf::from("/root/project"));
        let resolved = guard.validate("subdir/../other").unwrap();
        assert_eq!(resolved, PathBuf::from("/root/project/other"));
    }
}
