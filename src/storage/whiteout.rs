//! Removal signalling for the layered merge.
//!
//! The changes directory is merged over the base commit like an overlayfs
//! upper layer, so deleting something from the base means leaving a marker
//! the merge step understands. The marker convention belongs to the merge
//! backend, hence the [`RemovalMarker`] trait.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{DtError, IoContext, Result};

/// Reserved name prefix of whiteout files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

pub trait RemovalMarker {
    /// Mark `path` (inside the changes directory) for deletion on merge.
    ///
    /// Returns the marker that was written.
    fn mark_for_removal(&self, path: &Path) -> Result<PathBuf>;
}

/// Zero-byte `.wh.<name>` sibling, as understood by OSTree/overlayfs-style merges.
#[derive(Debug, Clone, Copy, Default)]
pub struct OverlayWhiteout;

impl OverlayWhiteout {
    pub fn marker_path(path: &Path) -> Option<PathBuf> {
        let parent = path.parent()?;
        let name = path.file_name()?;
        let mut marker = std::ffi::OsString::from(WHITEOUT_PREFIX);
        marker.push(name);
        Some(parent.join(marker))
    }
}

impl RemovalMarker for OverlayWhiteout {
    fn mark_for_removal(&self, path: &Path) -> Result<PathBuf> {
        let marker = Self::marker_path(path).ok_or_else(|| {
            DtError::invalid(format!("cannot whiteout '{}'", path.display()))
        })?;
        let parent = marker.parent().unwrap_or(Path::new("/"));
        if !parent.is_dir() {
            return Err(DtError::missing(format!(
                "whiteout parent directory '{}' does not exist",
                parent.display()
            )));
        }
        File::create(&marker).io_context(|| format!("creating '{}'", marker.display()))?;
        log::info!("Marked {} for removal", path.display());
        Ok(marker)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_marker_path() {
        assert_eq!(
            OverlayWhiteout::marker_path(Path::new("/x/usr/lib/modules/5.4.0/overlays")),
            Some(PathBuf::from("/x/usr/lib/modules/5.4.0/.wh.overlays"))
        );
    }

    #[test]
    fn test_writes_empty_marker() {
        let temp = TempDir::new().unwrap();
        let marker = OverlayWhiteout
            .mark_for_removal(&temp.path().join("overlays"))
            .unwrap();
        assert_eq!(marker, temp.path().join(".wh.overlays"));
        assert_eq!(std::fs::metadata(&marker).unwrap().len(), 0);
    }

    #[test]
    fn test_missing_parent() {
        let temp = TempDir::new().unwrap();
        let err = OverlayWhiteout
            .mark_for_removal(&temp.path().join("absent/overlays"))
            .unwrap_err();
        assert!(matches!(err, DtError::MissingInput(_)));
    }
}
