//! Device-tree changes directory.
//!
//! Compiled device trees and overlays are not written into the base commit.
//! They are staged in a *changes directory* that mirrors the commit's layout
//! and is folded into a new commit later:
//!
//! ```text
//! <storage>/
//!   ostree-archive/                         base repository (read-only here)
//!   dt/                                     default changes root
//!     usr/lib/modules/<kernel_version>/
//!       devicetree                          merged base device tree
//!       overlays/*.dtbo                     overlays to deploy
//!       .wh.overlays                        drop the base image's overlays
//! ```
//!
//! [`create_dt_changes_dir`] prepares the scaffold and hands back a
//! [`ChangesDir`]; the operations that write into the scaffold take that
//! handle, so they cannot be called before it exists.

pub mod whiteout;

use fs2::FileExt;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::devicetree::DT_OUTPUT_NAME;
use crate::error::{DtError, IoContext, Result};
use crate::repo::{BaseTree, MODULES_ROOT};

pub use whiteout::{OverlayWhiteout, RemovalMarker, WHITEOUT_PREFIX};

const REPO_DIR: &str = "ostree-archive";
const DT_DIR: &str = "dt";
const OVERLAYS_DIR: &str = "overlays";
const LOCK_FILE: &str = ".dt-builder.lock";
const TMP_DEVICETREE: &str = "tmp_devicetree.dtb";

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).io_context(|| format!("resolving '{}'", path.display()))
}

/// The image builder's storage directory.
#[derive(Debug, Clone)]
pub struct StorageArea {
    root: PathBuf,
}

impl StorageArea {
    pub fn new(root: &Path) -> Result<Self> {
        Ok(Self {
            root: absolute(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Base repository unpacked by the image builder.
    pub fn repo_dir(&self) -> PathBuf {
        self.root.join(REPO_DIR)
    }

    /// Default changes root.
    pub fn dt_dir(&self) -> PathBuf {
        self.root.join(DT_DIR)
    }

    /// Take the advisory lock serializing writers of this storage area.
    ///
    /// Fails immediately if another process holds it.
    pub fn lock(&self) -> Result<StorageLock> {
        let path = self.root.join(LOCK_FILE);
        // Never unlinked: removing a held lock file would let a second
        // process lock a fresh inode at the same path.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .io_context(|| format!("opening lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(DtError::Locked(path));
        }
        Ok(StorageLock { _file: file })
    }
}

/// Held for as long as the storage area must not be touched by others.
#[derive(Debug)]
pub struct StorageLock {
    _file: File,
}

/// A prepared changes directory for one kernel version.
#[derive(Debug, Clone)]
pub struct ChangesDir {
    root: PathBuf,
    kernel_version: String,
}

impl ChangesDir {
    /// Re-open a scaffold created earlier. `root` must exist.
    pub fn open(root: &Path, kernel_version: &str) -> Result<Self> {
        if !root.exists() {
            return Err(DtError::missing(format!(
                "Directory {} not found.",
                root.display()
            )));
        }
        Ok(Self {
            root: absolute(root)?,
            kernel_version: kernel_version.to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn kernel_version(&self) -> &str {
        &self.kernel_version
    }

    /// `<root>/usr/lib/modules/<kernel_version>`
    pub fn kernel_dir(&self) -> PathBuf {
        self.root.join(MODULES_ROOT).join(&self.kernel_version)
    }

    /// Where the merged device tree goes.
    pub fn devicetree_path(&self) -> PathBuf {
        self.kernel_dir().join(DT_OUTPUT_NAME)
    }

    pub fn overlays_dir(&self) -> PathBuf {
        self.kernel_dir().join(OVERLAYS_DIR)
    }

    /// Every file staged under the root, relative to it, in walk order.
    pub fn staged_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in WalkDir::new(&self.root).sort_by_file_name() {
            let entry = entry.map_err(|e| DtError::Io {
                context: format!("walking '{}'", self.root.display()),
                source: e.into(),
            })?;
            if entry.file_type().is_dir() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(&self.root) {
                files.push(rel.to_path_buf());
            }
        }
        Ok(files)
    }

    fn require_root(&self) -> Result<()> {
        if self.root.is_dir() {
            Ok(())
        } else {
            Err(DtError::missing(
                "No device tree storage directory created inside Volume",
            ))
        }
    }
}

/// `<changes-root>/usr/lib/modules/<kernel_version>/devicetree`, absolute.
///
/// `<changes-root>` is `changes_root` when given, `<storage>/dt` otherwise.
pub fn get_dt_changes_dir(
    base: &BaseTree,
    storage: &StorageArea,
    changes_root: Option<&Path>,
) -> Result<PathBuf> {
    let root = match changes_root {
        Some(root) => absolute(root)?,
        None => storage.dt_dir(),
    };
    Ok(root
        .join(MODULES_ROOT)
        .join(base.kernel_version())
        .join(DT_OUTPUT_NAME))
}

/// Prepare a fresh changes directory.
///
/// The default root is wiped first; a caller-supplied root is left as is.
/// Directories are created up to the kernel-version directory.
pub fn create_dt_changes_dir(
    base: &BaseTree,
    storage: &StorageArea,
    changes_root: Option<&Path>,
) -> Result<ChangesDir> {
    let dt_out = get_dt_changes_dir(base, storage, changes_root)?;

    let root = match changes_root {
        Some(root) => absolute(root)?,
        None => {
            let dt_dir = storage.dt_dir();
            if dt_dir.exists() {
                fs::remove_dir_all(&dt_dir)
                    .io_context(|| format!("removing '{}'", dt_dir.display()))?;
            }
            dt_dir
        }
    };

    if let Some(parent) = dt_out.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating '{}'", parent.display()))?;
    }
    log::info!("Prepared device tree changes directory {}", root.display());

    Ok(ChangesDir {
        root,
        kernel_version: base.kernel_version().to_string(),
    })
}

/// Re-open the changes directory of an earlier session.
pub fn open_dt_changes_dir(
    base: &BaseTree,
    storage: &StorageArea,
    changes_root: Option<&Path>,
) -> Result<ChangesDir> {
    match changes_root {
        Some(root) => ChangesDir::open(root, base.kernel_version()),
        None => {
            let dt_dir = storage.dt_dir();
            if !dt_dir.exists() {
                return Err(DtError::missing(
                    "No device tree storage directory created inside Volume",
                ));
            }
            ChangesDir::open(&dt_dir, base.kernel_version())
        }
    }
}

/// Replace the staged `overlays/` directory with exactly `overlays`.
///
/// Returns the overlays directory.
pub fn store_overlay_files<P: AsRef<Path>>(
    changes: &ChangesDir,
    overlays: &[P],
) -> Result<PathBuf> {
    changes.require_root()?;

    let mut names = HashSet::new();
    for overlay in overlays {
        let overlay = overlay.as_ref();
        let name = overlay.file_name().ok_or_else(|| {
            DtError::invalid(format!("'{}' is not a file", overlay.display()))
        })?;
        if !names.insert(name) {
            return Err(DtError::invalid(format!(
                "more than one overlay named {}",
                name.to_string_lossy()
            )));
        }
    }

    let overlays_dir = changes.overlays_dir();
    if overlays_dir.exists() {
        fs::remove_dir_all(&overlays_dir)
            .io_context(|| format!("removing '{}'", overlays_dir.display()))?;
    }
    fs::create_dir_all(&overlays_dir)
        .io_context(|| format!("creating '{}'", overlays_dir.display()))?;

    for overlay in overlays {
        let overlay = overlay.as_ref();
        let Some(name) = overlay.file_name() else {
            continue;
        };
        let dest = overlays_dir.join(name);
        fs::copy(overlay, &dest).io_context(|| {
            format!("copying '{}' to '{}'", overlay.display(), dest.display())
        })?;
        log::info!("Stored overlay {}", dest.display());
    }

    Ok(overlays_dir)
}

/// Mark every overlay deployed in the base image for removal.
///
/// Does nothing when the base has no overlays directory. Returns whether a
/// marker was written.
pub fn clear_applied_overlays(
    changes: &ChangesDir,
    base: &BaseTree,
    marker: &dyn RemovalMarker,
) -> Result<bool> {
    if !base.exists(&base.module_path(OVERLAYS_DIR))? {
        log::debug!("base image has no overlays; nothing to clear");
        return Ok(false);
    }

    let kernel_dir = changes.kernel_dir();
    if !kernel_dir.is_dir() {
        return Err(DtError::missing(
            "No device tree storage directory created inside Volume",
        ));
    }

    marker.mark_for_removal(&kernel_dir.join(OVERLAYS_DIR))?;
    Ok(true)
}

/// Mark one overlay deployed in the base image for removal.
///
/// Returns `false` (and writes nothing) when the base does not ship `name`.
pub fn remove_applied_overlay(
    changes: &ChangesDir,
    base: &BaseTree,
    name: &str,
    marker: &dyn RemovalMarker,
) -> Result<bool> {
    if !base.exists(&base.module_path(&format!("{}/{}", OVERLAYS_DIR, name)))? {
        return Ok(false);
    }
    changes.require_root()?;

    let overlays_dir = changes.overlays_dir();
    fs::create_dir_all(&overlays_dir)
        .io_context(|| format!("creating '{}'", overlays_dir.display()))?;
    marker.mark_for_removal(&overlays_dir.join(name))?;
    Ok(true)
}

/// Copy a device tree out of the base image to `<storage>/tmp_devicetree.dtb`.
pub fn copy_devicetree_bin_from_repo(
    base: &BaseTree,
    storage: &StorageArea,
    repo_path: &str,
) -> Result<PathBuf> {
    let dest = fresh_tmp_devicetree(storage)?;
    base.copy_file(repo_path, &dest)?;
    Ok(dest)
}

/// Copy a host device tree to `<storage>/tmp_devicetree.dtb`.
pub fn copy_devicetree_bin_from_workdir(storage: &StorageArea, path: &Path) -> Result<PathBuf> {
    if !path.is_file() {
        return Err(DtError::missing(format!("{} does not exist", path.display())));
    }
    let dest = fresh_tmp_devicetree(storage)?;
    fs::copy(path, &dest)
        .io_context(|| format!("copying '{}' to '{}'", path.display(), dest.display()))?;
    Ok(dest)
}

fn fresh_tmp_devicetree(storage: &StorageArea) -> Result<PathBuf> {
    let dest = storage.root().join(TMP_DEVICETREE);
    if dest.exists() {
        fs::remove_file(&dest).io_context(|| format!("removing '{}'", dest.display()))?;
    }
    Ok(dest)
}
