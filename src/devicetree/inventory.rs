//! Read-only queries about the device trees available in the base tree.

use serde::Serialize;
use std::path::Path;

use super::{IncludePaths, Toolchain, DT_OUTPUT_NAME};
use crate::error::{DtError, Result};
use crate::process::Cmd;
use crate::repo::{BaseTree, RepoEntry, ARCH_METADATA_KEY};

/// Include directory shared by every architecture.
pub const COMMON_INCLUDE_DIR: &str = "device-trees/include/";

/// A device tree shipped by the base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtbEntry {
    /// Directory inside the image, e.g. `/usr/lib/modules/5.4.0/dtb`.
    pub path: String,
    pub name: String,
}

/// Device trees shipped for the base kernel.
///
/// A deployed `devicetree` at the module root comes first, followed by every
/// `*.dtb` in the `dtb/` subdirectory.
pub fn get_ostree_dtb_list(base: &BaseTree) -> Result<Vec<DtbEntry>> {
    let module_dir = base.module_dir();
    let mut dt_list = Vec::new();

    if base.exists(&base.module_path(DT_OUTPUT_NAME))? {
        dt_list.push(DtbEntry {
            path: module_dir.clone(),
            name: DT_OUTPUT_NAME.to_string(),
        });
    }

    let dtb_dir = base.module_path("dtb");
    if base.exists(&dtb_dir)? {
        dt_list.extend(
            base.list_dir(&dtb_dir)?
                .into_iter()
                .filter(|entry| entry.name.ends_with(".dtb"))
                .map(|entry| DtbEntry {
                    path: dtb_dir.clone(),
                    name: entry.name,
                }),
        );
    }

    Ok(dt_list)
}

/// Overlays currently deployed in the base image, empty if there are none.
pub fn get_list_applied_dtbo_in_repo(base: &BaseTree) -> Result<Vec<RepoEntry>> {
    let overlays_dir = base.module_path("overlays");
    if !base.exists(&overlays_dir)? {
        return Ok(Vec::new());
    }
    base.list_dir(&overlays_dir)
}

/// Root `compatible` strings of a compiled device tree, most specific first.
pub fn get_compatibilities_binary(toolchain: &Toolchain, dtb: &Path) -> Result<Vec<String>> {
    let out = Cmd::new(&toolchain.fdtget)
        .arg_path(dtb)
        .args(["/", "compatible"])
        .error_msg(&format!("Failed to read compatible of {}", dtb.display()))
        .run()?;
    Ok(out.stdout.split_whitespace().map(str::to_string).collect())
}

/// Default include directories for the architecture the base was built for.
pub fn get_default_include_dir(base: &BaseTree) -> Result<IncludePaths> {
    let metadata = base.metadata()?;
    let mut include_dirs = IncludePaths::new();
    include_dirs.push(COMMON_INCLUDE_DIR);

    if let Some(arch) = metadata.get(ARCH_METADATA_KEY) {
        match arch.as_str() {
            "aarch64" => include_dirs.push("device-trees/dts-arm64/"),
            "arm" => include_dirs.push("device-trees/dts-arm32/"),
            other => {
                return Err(DtError::invalid(format!("Unknown architecture {}.", other)));
            }
        }
    }

    Ok(include_dirs)
}
