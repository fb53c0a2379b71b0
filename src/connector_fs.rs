//! Filesystem connector: turns files under a root into [`SourceDocument`]s.
//!
//! The canonical absolute path is the external id, so re-scanning an edited
//! file supersedes its previous version on ingest whether it was reached
//! through a directory scan or named directly.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

use ragline_core::models::{SourceDocument, SourceKind};

pub fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}

/// Walk `root` and load every included, non-excluded UTF-8 file.
///
/// A single file path is accepted as well. Globs match the path relative to
/// `root`. Results are sorted by external id.
pub fn scan_path(
    root: &Path,
    include_globs: &[String],
    exclude_globs: &[String],
    owner_scope: Option<&str>,
    kind: SourceKind,
) -> Result<Vec<SourceDocument>> {
    if !root.exists() {
        bail!("Path does not exist: {}", root.display());
    }

    let root = root
        .canonicalize()
        .with_context(|| format!("Failed to resolve {}", root.display()))?;

    if root.is_file() {
        return Ok(file_to_document(&root, &external_id(&root), owner_scope, kind)?
            .into_iter()
            .collect());
    }

    let include_set = build_globset(include_globs)?;

    let mut default_excludes = vec![
        "**/.git/**".to_string(),
        "**/target/**".to_string(),
        "**/node_modules/**".to_string(),
    ];
    default_excludes.extend(exclude_globs.iter().cloned());
    let exclude_set = build_globset(&default_excludes)?;

    let mut docs = Vec::new();

    for entry in WalkDir::new(&root) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(&root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().replace('\\', "/");

        if exclude_set.is_match(&rel_str) || !include_set.is_match(&rel_str) {
            continue;
        }

        if let Some(doc) = file_to_document(path, &external_id(path), owner_scope, kind)? {
            docs.push(doc);
        }
    }

    // Sort for deterministic ordering
    docs.sort_by(|a, b| a.external_id.cmp(&b.external_id));
    debug!(root = %root.display(), files = docs.len(), "scanned path");

    Ok(docs)
}

fn external_id(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn file_to_document(
    path: &Path,
    external_id: &str,
    owner_scope: Option<&str>,
    kind: SourceKind,
) -> Result<Option<SourceDocument>> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => {
            warn!(path = %path.display(), "skipping non-UTF-8 file");
            return Ok(None);
        }
    };
    Ok(Some(SourceDocument::new(
        external_id,
        owner_scope.map(str::to_string),
        kind,
        text,
    )))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_scan_filters_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::create_dir_all(root.join("node_modules")).unwrap();
        fs::write(root.join("b.md"), "beta").unwrap();
        fs::write(root.join("sub/a.txt"), "alpha").unwrap();
        fs::write(root.join("skip.rs"), "fn main() {}").unwrap();
        fs::write(root.join("node_modules/x.md"), "vendored").unwrap();
        fs::write(root.join("bin.md"), [0xff, 0xfe, 0x00]).unwrap();

        let docs = scan_path(
            root,
            &default_include_globs(),
            &[],
            Some("team"),
            SourceKind::Upload,
        )
        .unwrap();
        let base = root.canonicalize().unwrap();
        let ids: Vec<String> = docs.iter().map(|d| d.external_id.clone()).collect();
        assert_eq!(
            ids,
            vec![external_id(&base.join("b.md")), external_id(&base.join("sub/a.txt"))]
        );
        assert!(docs.iter().all(|d| d.owner_scope.as_deref() == Some("team")));
    }

    #[test]
    fn test_scan_single_file_and_excludes() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("note.md");
        fs::write(&file, "hello").unwrap();
        let docs = scan_path(&file, &default_include_globs(), &[], None, SourceKind::Other).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].external_id, external_id(&file.canonicalize().unwrap()));

        let docs = scan_path(
            tmp.path(),
            &default_include_globs(),
            &["note.md".to_string()],
            None,
            SourceKind::Other,
        )
        .unwrap();
        assert!(docs.is_empty());
    }

    #[test]
    fn test_file_and_directory_scans_share_identity() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("docs/sub")).unwrap();
        let file = tmp.path().join("docs/sub/a.txt");
        fs::write(&file, "alpha").unwrap();

        let from_dir = scan_path(
            &tmp.path().join("docs"),
            &default_include_globs(),
            &[],
            None,
            SourceKind::Upload,
        )
        .unwrap();
        let from_file = scan_path(&file, &default_include_globs(), &[], None, SourceKind::Upload).unwrap();
        let relative = scan_path(
            &tmp.path().join("docs/sub/../sub/a.txt"),
            &[],
            &[],
            None,
            SourceKind::Upload,
        )
        .unwrap();

        assert_eq!(from_dir.len(), 1);
        assert_eq!(from_dir[0].external_id, from_file[0].external_id);
        assert_eq!(relative[0].external_id, from_file[0].external_id);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_path(&tmp.path().join("nope"), &[], &[], None, SourceKind::Other).is_err());
    }
}
