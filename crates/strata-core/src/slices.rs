//! Resolves slice glob patterns against the app directory.
//!
//! Slice content must stay app-scoped: relative patterns resolve against
//! the app directory and absolute patterns that escape it are rebased
//! underneath it. A slice whose patterns match nothing produces no layer.

use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

use strata_domain::Slice;

use crate::errors::ExportError;

/// One slice resolved to a concrete file set, ready to be tarred.
#[derive(Debug)]
pub struct SlicePlan {
    pub identifier: String,
    pub files: Vec<PathBuf>,
}

/// Identifier of the layer a slice produces. Derived from the unprocessed
/// pattern strings in input order, so identical slice definitions name the
/// same layer across builds.
pub fn slice_identifier(slice: &Slice) -> String {
    let mut hasher = Sha256::new();
    for pattern in &slice.paths {
        hasher.update(pattern.as_bytes());
    }
    format!("slice-{}", hex::encode(hasher.finalize()))
}

/// Expands a slice's patterns against the filesystem. Returns `None` when
/// nothing matched. A malformed pattern is fatal.
pub fn resolve_slice(slice: &Slice, app_dir: &Path) -> Result<Option<SlicePlan>> {
    let mut files = Vec::new();
    for pattern in &slice.paths {
        let resolved = rebase_pattern(app_dir, pattern);
        let resolved = resolved.to_string_lossy();
        let matches = glob::glob(&resolved).map_err(|err| ExportError::InputMalformed {
            subject: pattern.clone(),
            reason: err.to_string(),
        })?;
        for path in matches {
            let path = path.with_context(|| format!("expanding pattern `{pattern}`"))?;
            files.push(path);
        }
    }
    if files.is_empty() {
        return Ok(None);
    }
    Ok(Some(SlicePlan {
        identifier: slice_identifier(slice),
        files,
    }))
}

/// Anchors a pattern under `base_dir`: cleaned, resolved against the base
/// when relative, and forced back under the base when absolute but outside
/// it.
fn rebase_pattern(base_dir: &Path, pattern: &str) -> PathBuf {
    let cleaned = clean_path(Path::new(pattern));
    let absolute = if cleaned.is_absolute() {
        cleaned
    } else {
        base_dir.join(cleaned)
    };
    if absolute.starts_with(base_dir) {
        return absolute;
    }
    let rebased = base_dir.join(
        absolute
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect::<PathBuf>(),
    );
    tracing::warn!(
        path = %rebased.display(),
        base = %base_dir.display(),
        "found absolute path outside of app directory, rebasing"
    );
    rebased
}

/// Lexical path cleaning: drops `.` components and resolves `..` against
/// preceding components without touching the filesystem.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(Component::ParentDir);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn slice(patterns: &[&str]) -> Slice {
        Slice {
            paths: patterns.iter().map(ToString::to_string).collect(),
        }
    }

    #[test]
    fn identifier_is_deterministic_and_distinct() {
        let logs = slice(&["*.log"]);
        assert_eq!(slice_identifier(&logs), slice_identifier(&logs));
        assert_ne!(slice_identifier(&logs), slice_identifier(&slice(&["*.tmp"])));
        assert!(slice_identifier(&logs).starts_with("slice-"));
    }

    #[test]
    fn relative_patterns_match_under_app_dir() -> Result<()> {
        let temp = tempdir()?;
        fs::write(temp.path().join("app.log"), b"x")?;
        fs::write(temp.path().join("main.js"), b"y")?;

        let plan = resolve_slice(&slice(&["*.log"]), temp.path())?.expect("plan");
        assert_eq!(plan.files, vec![temp.path().join("app.log")]);
        Ok(())
    }

    #[test]
    fn multiple_patterns_accumulate() -> Result<()> {
        let temp = tempdir()?;
        fs::write(temp.path().join("app.log"), b"x")?;
        fs::write(temp.path().join("scratch.tmp"), b"y")?;

        let plan = resolve_slice(&slice(&["*.log", "*.tmp"]), temp.path())?.expect("plan");
        assert_eq!(plan.files.len(), 2);
        Ok(())
    }

    #[test]
    fn unmatched_slice_produces_nothing() -> Result<()> {
        let temp = tempdir()?;
        assert!(resolve_slice(&slice(&["*.missing"]), temp.path())?.is_none());
        Ok(())
    }

    #[test]
    fn malformed_pattern_is_fatal() {
        let temp = tempdir().expect("tempdir");
        let err = resolve_slice(&slice(&["a[/*"]), temp.path()).expect_err("bad pattern");
        assert!(matches!(
            err.downcast_ref::<ExportError>(),
            Some(ExportError::InputMalformed { .. })
        ));
    }

    #[test]
    fn escaping_absolute_patterns_are_rebased() -> Result<()> {
        let temp = tempdir()?;
        let nested = temp.path().join("var").join("log");
        fs::create_dir_all(&nested)?;
        fs::write(nested.join("app.log"), b"x")?;

        let plan = resolve_slice(&slice(&["/var/log/*.log"]), temp.path())?.expect("plan");
        assert_eq!(plan.files, vec![nested.join("app.log")]);
        Ok(())
    }

    #[test]
    fn clean_resolves_dot_segments() {
        assert_eq!(clean_path(Path::new("a/./b/../c")), PathBuf::from("a/c"));
        assert_eq!(clean_path(Path::new("./x")), PathBuf::from("x"));
    }
}
