//! Directory-backed repository.
//!
//! Layout, one directory per reference:
//!
//! ```text
//! <root>/
//!   <ref>/
//!     tree/            checked-out filesystem of the commit
//!     metadata.json    commit metadata as a flat JSON object (optional)
//! ```

use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{EntryKind, Metadata, RepoEntry, Repository};
use crate::error::{DtError, IoContext, Result};

const TREE_DIR: &str = "tree";
const METADATA_FILE: &str = "metadata.json";

#[derive(Debug, Clone)]
pub struct CheckoutRepo {
    root: PathBuf,
}

impl CheckoutRepo {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(DtError::Repository(format!(
                "checkout repository '{}' not found",
                root.display()
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    fn tree_path(&self, reference: &str, path: &str) -> Result<PathBuf> {
        let rel = Path::new(path.trim_start_matches('/'));
        if rel
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(DtError::invalid(format!(
                "repository path '{}' escapes the tree",
                path
            )));
        }
        Ok(self.root.join(reference).join(TREE_DIR).join(rel))
    }
}

impl Repository for CheckoutRepo {
    fn exists(&self, reference: &str, path: &str) -> Result<bool> {
        let full = self.tree_path(reference, path)?;
        Ok(full.symlink_metadata().is_ok())
    }

    fn list_dir(&self, reference: &str, path: &str) -> Result<Vec<RepoEntry>> {
        let full = self.tree_path(reference, path)?;
        let mut entries = Vec::new();
        for entry in
            fs::read_dir(&full).io_context(|| format!("listing '{}'", full.display()))?
        {
            let entry = entry.io_context(|| format!("listing '{}'", full.display()))?;
            let meta = entry
                .path()
                .symlink_metadata()
                .io_context(|| format!("reading metadata '{}'", entry.path().display()))?;
            let kind = if meta.file_type().is_symlink() {
                EntryKind::Symlink
            } else if meta.is_dir() {
                EntryKind::Directory
            } else {
                EntryKind::File
            };
            entries.push(RepoEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
                size: if kind == EntryKind::File { meta.len() } else { 0 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn copy_file(&self, reference: &str, src: &str, dest: &Path) -> Result<()> {
        let full = self.tree_path(reference, src)?;
        if !full.is_file() {
            return Err(DtError::missing(format!(
                "'{}' not found in ref '{}'",
                src, reference
            )));
        }
        fs::copy(&full, dest).io_context(|| {
            format!("copying '{}' to '{}'", full.display(), dest.display())
        })?;
        Ok(())
    }

    fn metadata(&self, reference: &str) -> Result<Metadata> {
        let path = self.root.join(reference).join(METADATA_FILE);
        if !path.is_file() {
            return Ok(Metadata::new());
        }
        let bytes = fs::read(&path).io_context(|| format!("reading '{}'", path.display()))?;
        let parsed: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)
            .map_err(|e| {
                DtError::Repository(format!("parsing metadata '{}': {}", path.display(), e))
            })?;
        Ok(parsed
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect())
    }
}

/// Build a checkout repository under `root` with a `base` ref that ships
/// `kernel`. Entries in `paths` are relative to the tree; a trailing `/`
/// creates a directory, anything else a small file.
#[cfg(test)]
pub(crate) fn fixture(root: &Path, kernel: &str, paths: &[&str]) -> CheckoutRepo {
    let tree = root.join(super::BASE_REF).join(TREE_DIR);
    fs::create_dir_all(tree.join(super::MODULES_ROOT).join(kernel)).unwrap();
    for path in paths {
        let full = tree.join(path.trim_start_matches('/'));
        if path.ends_with('/') {
            fs::create_dir_all(&full).unwrap();
        } else {
            fs::create_dir_all(full.parent().unwrap()).unwrap();
            fs::write(&full, path.as_bytes()).unwrap();
        }
    }
    CheckoutRepo::open(root).unwrap()
}

#[cfg(test)]
pub(crate) fn write_metadata(root: &Path, json: &str) {
    fs::write(root.join(super::BASE_REF).join(METADATA_FILE), json).unwrap();
}
