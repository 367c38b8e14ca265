//! Layering compiled overlays onto a base device tree with `fdtoverlay`.

use std::fs;
use std::path::{Path, PathBuf};

use super::compile::resolve_output_path;
use super::{is_fdt_blob, IncludePaths, SourceKind, Toolchain};
use crate::error::{DtError, IoContext, Result};
use crate::process::Cmd;

impl Toolchain {
    /// Merge `overlays`, in order, onto the binary `base_dtb`.
    ///
    /// `fdtoverlay` is known to exit 0 on some failures, so the exit status
    /// is ignored: any output on stderr is treated as failure.
    pub fn apply_overlays<P: AsRef<Path>>(
        &self,
        base_dtb: &Path,
        overlays: &[P],
        output: &Path,
    ) -> Result<()> {
        if !base_dtb.exists() {
            return Err(DtError::missing(format!(
                "Invalid input devicetree {}",
                base_dtb.display()
            )));
        }

        let mut cmd = Cmd::new(&self.fdtoverlay)
            .arg("-i")
            .arg_path(base_dtb)
            .arg("-o")
            .arg_path(output);
        for overlay in overlays {
            cmd = cmd.arg_path(overlay.as_ref());
        }

        let result = cmd.allow_fail().run()?;
        if !result.stderr.is_empty() {
            return Err(DtError::tool(
                "fdtoverlay",
                "fdtoverlay failed with:",
                &result.stderr,
            ));
        }
        if !result.success() {
            log::warn!(
                "fdtoverlay exited with {} but reported no error; accepting output",
                result.status
            );
        }

        log::debug!("Successfully applied device tree overlay(s)");
        Ok(())
    }

    /// Compile `overlays` and apply them to `base`, writing one merged blob.
    ///
    /// `base` may be a source or an already compiled blob. Without overlays
    /// this is a plain [`Toolchain::build`] of `base` (or a copy, for a blob).
    /// Intermediate artifacts go to a private temporary directory that is
    /// removed before returning.
    pub fn build_and_apply<P: AsRef<Path>>(
        &self,
        base: &Path,
        overlays: &[P],
        output: &Path,
        includes: &IncludePaths,
    ) -> Result<PathBuf> {
        if !base.is_file() {
            return Err(DtError::missing(format!(
                "Missing input devicetree {}",
                base.display()
            )));
        }
        let base_is_blob = is_fdt_blob(base)?;

        if overlays.is_empty() {
            if base_is_blob {
                let output = resolve_output_path(base, SourceKind::Base, Some(output), &self.work_dir);
                fs::copy(base, &output).io_context(|| {
                    format!("copying '{}' to '{}'", base.display(), output.display())
                })?;
                return Ok(output);
            }
            return self.build(base, Some(output), includes);
        }

        let workdir = tempfile::Builder::new()
            .prefix("dt-overlays-")
            .tempdir()
            .io_context(|| "creating temporary overlay directory")?;

        let mut dtbos = Vec::with_capacity(overlays.len());
        for (index, overlay) in overlays.iter().enumerate() {
            let overlay = overlay.as_ref();
            if !overlay.exists() {
                return Err(DtError::missing(format!(
                    "{} does not exist",
                    overlay.display()
                )));
            }
            let name = overlay
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            // Indexed so overlays sharing a file name do not collide.
            let dtbo = workdir.path().join(format!("{:02}-{}.dtbo", index, name));
            dtbos.push(self.build(overlay, Some(dtbo.as_path()), includes)?);
        }

        let base_dtb = if base_is_blob {
            base.to_path_buf()
        } else {
            let name = base
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.build(base, Some(workdir.path().join(format!("{}.dtb", name)).as_path()), includes)?
        };

        let output = resolve_output_path(base, SourceKind::Base, Some(output), &self.work_dir);
        log::info!(
            "Applying {} overlay(s) onto {} -> {}",
            dtbos.len(),
            base.display(),
            output.display()
        );
        self.apply_overlays(&base_dtb, &dtbos, &output)?;

        Ok(output)
    }
}
