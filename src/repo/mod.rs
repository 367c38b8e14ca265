//! Read access to the versioned base tree.
//!
//! The device-tree pipeline only ever *reads* the base commit: it asks which
//! kernel the image ships, whether a path exists, what a directory contains,
//! and occasionally copies a file out. Those capabilities are captured by the
//! [`Repository`] trait so the pipeline does not care whether the tree lives
//! in an OSTree archive or in a plain checkout on disk.
//!
//! - [`OstreeRepo`] - drives the `ostree` CLI against an archive repository
//! - [`CheckoutRepo`] - a directory-per-ref layout, used for unpacked trees and tests
//!
//! [`BaseTree`] binds a repository to one reference and its resolved kernel
//! version, which is what every other module takes as input.

pub mod checkout;
pub mod ostree;

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{DtError, Result};

pub use checkout::CheckoutRepo;
pub use ostree::OstreeRepo;

/// Reference the image builder unpacks its input image under.
pub const BASE_REF: &str = "base";

/// Kernel modules root inside the image, relative to `/`.
pub const MODULES_ROOT: &str = "usr/lib/modules";

/// Commit metadata key recording the image architecture.
pub const ARCH_METADATA_KEY: &str = "oe.arch";

pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

/// One row of a repository directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
}

/// Capabilities consumed from the versioned tree.
///
/// Paths are absolute inside the tree (`/usr/lib/modules/...`).
pub trait Repository {
    fn exists(&self, reference: &str, path: &str) -> Result<bool>;

    /// Entries of `path`, ordered by name.
    fn list_dir(&self, reference: &str, path: &str) -> Result<Vec<RepoEntry>>;

    fn copy_file(&self, reference: &str, src: &str, dest: &Path) -> Result<()>;

    fn metadata(&self, reference: &str) -> Result<Metadata>;

    /// Kernel version the reference ships: the first directory under the
    /// modules root.
    fn kernel_version(&self, reference: &str) -> Result<String> {
        let modules_root = format!("/{}", MODULES_ROOT);
        self.list_dir(reference, &modules_root)?
            .into_iter()
            .find(|entry| entry.kind == EntryKind::Directory)
            .map(|entry| entry.name)
            .ok_or_else(|| {
                DtError::Repository(format!(
                    "no kernel found under '{}' in ref '{}'",
                    modules_root, reference
                ))
            })
    }
}

/// A repository reference with its kernel version resolved once.
pub struct BaseTree<'r> {
    repo: &'r dyn Repository,
    reference: String,
    kernel_version: String,
}

impl<'r> BaseTree<'r> {
    pub fn resolve(repo: &'r dyn Repository, reference: &str) -> Result<Self> {
        let kernel_version = repo.kernel_version(reference)?;
        log::debug!("ref '{}' ships kernel {}", reference, kernel_version);
        Ok(Self {
            repo,
            reference: reference.to_string(),
            kernel_version,
        })
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    /// `/usr/lib/modules/<kernel_version>`
    pub fn module_dir(&self) -> String {
        format!("/{}/{}", MODULES_ROOT, self.kernel_version)
    }

    /// `/usr/lib/modules/<kernel_version>/<rel>`
    pub fn module_path(&self, rel: &str) -> String {
        format!("{}/{}", self.module_dir(), rel)
    }

    pub fn exists(&self, path: &str) -> Result<bool> {
        self.repo.exists(&self.reference, path)
    }

    pub fn list_dir(&self, path: &str) -> Result<Vec<RepoEntry>> {
        self.repo.list_dir(&self.reference, path)
    }

    pub fn copy_file(&self, src: &str, dest: &Path) -> Result<()> {
        self.repo.copy_file(&self.reference, src, dest)
    }

    pub fn metadata(&self) -> Result<Metadata> {
        self.repo.metadata(&self.reference)
    }
}

#[cfg(test)]
mod tests {
    use super::checkout::fixture;
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_kernel_version() {
        let temp = TempDir::new().unwrap();
        let repo = fixture(temp.path(), "5.4.0", &[]);
        let base = BaseTree::resolve(&repo, BASE_REF).unwrap();
        assert_eq!(base.kernel_version(), "5.4.0");
        assert_eq!(base.module_dir(), "/usr/lib/modules/5.4.0");
        assert_eq!(
            base.module_path("overlays"),
            "/usr/lib/modules/5.4.0/overlays"
        );
    }

    #[test]
    fn test_resolve_without_kernel_fails() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("base/tree/usr/lib/modules")).unwrap();
        let repo = CheckoutRepo::open(temp.path()).unwrap();
        let err = BaseTree::resolve(&repo, BASE_REF).err().unwrap();
        assert!(matches!(err, DtError::Repository(_)));
    }
}
