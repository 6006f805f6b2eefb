use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use globset::{Glob, GlobSet, GlobSetBuilder};

use crate::error::{Error, Result};

/// Separator replacing `/` when a nested path becomes a partition id.
pub const NESTED_ID_SEPARATOR: &str = "__";

/// A source document found under the docs directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the docs directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    /// Identity of the partition built from this file.
    pub partition_id: String,
}

/// Compile include patterns such as `*.md` into a matcher.
pub fn build_matcher(patterns: &[String]) -> Result<GlobSet> {
    if patterns.is_empty() {
        return Err(Error::Config("build.include must not be empty".into()));
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern).map_err(|e| {
            Error::Config(format!("invalid include pattern {pattern:?}: {e}"))
        })?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| Error::Config(format!("invalid include patterns: {e}")))
}

/// Partition id for a file: its name for top-level files, its relative
/// path joined with `__` for nested ones.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use docrag::walker::partition_id_for;
///
/// assert_eq!(partition_id_for(Path::new("notes.md")), "notes.md");
/// assert_eq!(
///     partition_id_for(Path::new("guides/setup.md")),
///     "guides__setup.md"
/// );
/// ```
pub fn partition_id_for(relative_path: &Path) -> String {
    relative_path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join(NESTED_ID_SEPARATOR)
}

/// Recursively walk `root` and return files matching `include`.
///
/// Hidden files and directories (names starting with `.`) are skipped.
/// Results are sorted by relative path. Two files mapping to the same
/// partition id are an error.
pub fn discover_files(
    root: &Path,
    include: &GlobSet,
) -> Result<Vec<SourceFile>> {
    let canonical_root = root.canonicalize().map_err(|_| Error::NotFound {
        kind: "docs directory",
        name: root.display().to_string(),
    })?;

    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, include, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    let mut seen: HashMap<&str, &Path> = HashMap::new();
    for file in &results {
        if let Some(previous) =
            seen.insert(&file.partition_id, &file.relative_path)
        {
            return Err(Error::Config(format!(
                "{} and {} both map to partition id {:?}",
                previous.display(),
                file.relative_path.display(),
                file.partition_id
            )));
        }
    }

    Ok(results)
}

fn walk_dir(
    root: &Path,
    current: &Path,
    include: &GlobSet,
    results: &mut Vec<SourceFile>,
) -> Result<()> {
    let entries = std::fs::read_dir(current)?;

    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if name.starts_with('.') {
            continue;
        }

        let file_type = entry.file_type()?;
        let path = entry.path();

        if file_type.is_dir() {
            walk_dir(root, &path, include, results)?;
        } else if file_type.is_symlink() {
            let Ok(resolved) = path.canonicalize() else {
                continue;
            };
            // Links to directories are not followed.
            if resolved.is_file()
                && let Some(file) = make_source(root, &path, &resolved, include)
            {
                results.push(file);
            }
        } else if file_type.is_file() {
            let resolved = path.canonicalize()?;
            if let Some(file) = make_source(root, &path, &resolved, include) {
                results.push(file);
            }
        }
    }

    Ok(())
}

fn make_source(
    root: &Path,
    original_path: &Path,
    absolute_path: &Path,
    include: &GlobSet,
) -> Option<SourceFile> {
    let relative_path = original_path
        .strip_prefix(root)
        .unwrap_or(original_path)
        .to_path_buf();
    if !include.is_match(&relative_path) {
        return None;
    }

    Some(SourceFile {
        partition_id: partition_id_for(&relative_path),
        relative_path,
        absolute_path: absolute_path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_matcher() -> GlobSet {
        build_matcher(&["*.md".to_string(), "*.txt".to_string()]).unwrap()
    }

    fn names(files: &[SourceFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn discovers_md_and_txt() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("note.md"), "# Hello").unwrap();
        std::fs::write(tmp.path().join("readme.txt"), "Hello").unwrap();
        std::fs::write(tmp.path().join("image.png"), "binary").unwrap();

        let files = discover_files(tmp.path(), &default_matcher()).unwrap();
        assert_eq!(names(&files), vec!["note.md", "readme.txt"]);
        assert_eq!(files[0].partition_id, "note.md");
    }

    #[test]
    fn custom_patterns() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.rst"), "a").unwrap();
        std::fs::write(tmp.path().join("b.md"), "b").unwrap();

        let matcher = build_matcher(&["*.rst".to_string()]).unwrap();
        let files = discover_files(tmp.path(), &matcher).unwrap();
        assert_eq!(names(&files), vec!["a.rst"]);
    }

    #[test]
    fn invalid_or_empty_patterns_are_rejected() {
        assert!(build_matcher(&[]).is_err());
        assert!(build_matcher(&["a[".to_string()]).is_err());
    }

    #[test]
    fn skips_hidden_files_and_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let hidden = tmp.path().join(".git");
        std::fs::create_dir(&hidden).unwrap();
        std::fs::write(hidden.join("config.md"), "git config").unwrap();
        std::fs::write(tmp.path().join(".hidden.md"), "secret").unwrap();
        std::fs::write(tmp.path().join("notes.md"), "notes").unwrap();

        let files = discover_files(tmp.path(), &default_matcher()).unwrap();
        assert_eq!(names(&files), vec!["notes.md"]);
    }

    #[test]
    fn nested_files_get_path_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("guides");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("setup.md"), "deep").unwrap();
        std::fs::write(tmp.path().join("top.md"), "top").unwrap();

        let files = discover_files(tmp.path(), &default_matcher()).unwrap();
        let ids: Vec<&str> =
            files.iter().map(|f| f.partition_id.as_str()).collect();
        assert_eq!(ids, vec!["guides__setup.md", "top.md"]);
    }

    #[test]
    fn colliding_ids_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("a");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("b.md"), "nested").unwrap();
        std::fs::write(tmp.path().join("a__b.md"), "flat").unwrap();

        let err = discover_files(tmp.path(), &default_matcher()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn missing_root_is_not_found() {
        let tmp = tempfile::tempdir().unwrap();
        let err = discover_files(&tmp.path().join("nope"), &default_matcher())
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let files = discover_files(tmp.path(), &default_matcher()).unwrap();
        assert!(files.is_empty());
    }
}
