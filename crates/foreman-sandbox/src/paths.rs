use std::path::{Component, Path, PathBuf};

use foreman_types::{ForemanError, Result};

use crate::policy::SandboxPolicy;

/// Resolve a requested path against the project root under the policy.
///
/// Order matters: a `..` that lexically escapes is rejected before any
/// filesystem access, then symlinks are resolved and the canonical path
/// must still sit inside the canonical root, then the glob rules apply.
pub fn resolve_path(requested: &Path, root: &Path, policy: &SandboxPolicy) -> Result<PathBuf> {
    let joined = if requested.is_absolute() {
        requested.to_path_buf()
    } else {
        root.join(requested)
    };

    let lexical = normalize_lexically(&joined)
        .ok_or_else(|| forbidden(requested, "parent traversal escapes the filesystem root"))?;

    let canonical_root = root
        .canonicalize()
        .map_err(|err| ForemanError::Storage(format!("project root {}: {err}", root.display())))?;

    // Lexical containment first: a `..` that escapes must fail even when
    // the target does not exist yet.
    let lexical_root = normalize_lexically(root).unwrap_or_else(|| root.to_path_buf());
    if !lexical.starts_with(&lexical_root) && !lexical.starts_with(&canonical_root) {
        return Err(forbidden(requested, "path is outside the project root"));
    }

    // Canonicalize the deepest existing ancestor so symlinked components
    // cannot smuggle the path outside, while still allowing paths that do
    // not exist yet.
    let canonical = canonicalize_existing_prefix(&lexical)?;
    if !canonical.starts_with(&canonical_root) {
        return Err(forbidden(requested, "resolved target is outside the project root"));
    }

    let relative = canonical
        .strip_prefix(&canonical_root)
        .unwrap_or(Path::new(""))
        .to_string_lossy()
        .replace('\\', "/");
    if !policy.path_allowed(&relative) {
        return Err(forbidden(requested, "path is not allowlisted"));
    }

    Ok(canonical)
}

fn forbidden(requested: &Path, reason: &str) -> ForemanError {
    ForemanError::Forbidden(format!("{}: {reason}", requested.display()))
}

/// Collapse `.` and `..` without touching the filesystem. Returns `None`
/// when `..` would pop past the first component.
fn normalize_lexically(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    let mut depth = 0usize;
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return None;
                }
                out.pop();
                depth -= 1;
            }
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
        }
    }
    Some(out)
}

/// Canonicalize the longest existing prefix, then re-append the remainder.
fn canonicalize_existing_prefix(path: &Path) -> Result<PathBuf> {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match existing.canonicalize() {
            Ok(canonical) => {
                let mut out = canonical;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return Ok(out);
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let Some(name) = existing.file_name() else {
                    return Err(ForemanError::Storage(format!(
                        "cannot canonicalize {}",
                        path.display()
                    )));
                };
                tail.push(name.to_os_string());
                if !existing.pop() {
                    return Err(ForemanError::Storage(format!(
                        "cannot canonicalize {}",
                        path.display()
                    )));
                }
            }
            Err(err) => {
                return Err(ForemanError::Storage(format!(
                    "canonicalize {}: {err}",
                    path.display()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_policy() -> SandboxPolicy {
        SandboxPolicy::default()
    }

    #[test]
    fn resolves_inside_root() {
        let root = TempDir::new().unwrap();
        std::fs::write(root.path().join("file.txt"), "x").unwrap();
        let resolved =
            resolve_path(Path::new("file.txt"), root.path(), &open_policy()).unwrap();
        assert!(resolved.ends_with("file.txt"));
        assert!(resolved.starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn parent_traversal_is_forbidden() {
        let root = TempDir::new().unwrap();
        let err = resolve_path(
            Path::new("../../etc/hostname"),
            root.path(),
            &open_policy(),
        )
        .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn absolute_path_outside_root_is_forbidden() {
        let root = TempDir::new().unwrap();
        let err = resolve_path(Path::new("/etc/hostname"), root.path(), &open_policy())
            .unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_escaping_root_is_forbidden() {
        let root = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("target.txt"), "x").unwrap();
        std::os::unix::fs::symlink(
            outside.path().join("target.txt"),
            root.path().join("link.txt"),
        )
        .unwrap();

        let err =
            resolve_path(Path::new("link.txt"), root.path(), &open_policy()).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }

    #[test]
    fn nonexistent_path_still_resolves_inside_root() {
        let root = TempDir::new().unwrap();
        let resolved = resolve_path(
            Path::new("sub/dir/new-file.rs"),
            root.path(),
            &open_policy(),
        )
        .unwrap();
        assert!(resolved.starts_with(root.path().canonicalize().unwrap()));
    }

    #[test]
    fn blocklist_overrides_allowlist() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir(root.path().join("secrets")).unwrap();
        std::fs::write(root.path().join("secrets/key"), "x").unwrap();
        let policy = SandboxPolicy {
            blocked_paths: vec!["secrets/**".into()],
            ..SandboxPolicy::default()
        };
        let err = resolve_path(Path::new("secrets/key"), root.path(), &policy).unwrap_err();
        assert_eq!(err.code(), "forbidden");
    }
}
