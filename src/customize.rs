//! Apply a [`DtCustomization`] to a storage area.

use serde::Serialize;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use crate::config::DtCustomization;
use crate::devicetree::{
    classify_file, get_default_include_dir, get_ostree_dtb_list, is_fdt_blob, IncludePaths,
    SourceKind, Toolchain, DT_OUTPUT_NAME,
};
use crate::error::{DtError, IoContext, Result};
use crate::repo::BaseTree;
use crate::storage::{
    clear_applied_overlays, copy_devicetree_bin_from_repo, create_dt_changes_dir,
    remove_applied_overlay, store_overlay_files, RemovalMarker, StorageArea,
};

/// What a customization run staged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CustomizationReport {
    pub changes_root: PathBuf,
    pub kernel_version: String,
    /// Merged device tree written into the changes directory, if any.
    pub devicetree: Option<PathBuf>,
    pub cleared_overlays: bool,
    pub removed_overlays: Vec<String>,
    /// Names from `remove` that the base does not ship.
    pub missing_overlays: Vec<String>,
    pub stored_overlays: Vec<PathBuf>,
    /// Device tree the added overlays were test-applied to.
    pub overlays_tested_against: Option<PathBuf>,
    /// Every file under the changes root afterwards, relative to it.
    pub staged_files: Vec<PathBuf>,
}

/// Include directories for a run: architecture defaults, then the config's own.
///
/// Relative defaults are taken from the toolchain's working directory.
pub fn customization_include_dirs(
    toolchain: &Toolchain,
    base: &BaseTree,
    config: &DtCustomization,
) -> Result<IncludePaths> {
    let mut includes: IncludePaths = get_default_include_dir(base)?
        .iter()
        .map(|p| toolchain.work_dir.join(p))
        .collect();
    includes.extend(config.include_dirs.iter().cloned());
    Ok(includes)
}

pub fn apply_customization(
    toolchain: &Toolchain,
    base: &BaseTree,
    storage: &StorageArea,
    config: &DtCustomization,
    changes_root: Option<&Path>,
    marker: &dyn RemovalMarker,
) -> Result<CustomizationReport> {
    check_added_overlays(&config.add_overlays)?;
    let includes = customization_include_dirs(toolchain, base, config)?;
    let changes = create_dt_changes_dir(base, storage, changes_root)?;

    let mut report = CustomizationReport {
        changes_root: changes.root().to_path_buf(),
        kernel_version: changes.kernel_version().to_string(),
        ..Default::default()
    };

    if let Some(custom) = &config.custom {
        let output = changes.devicetree_path();
        toolchain.build_and_apply::<PathBuf>(custom, &[], &output, &includes)?;
        report.devicetree = Some(output);
    }

    if config.clear_overlays {
        report.cleared_overlays = clear_applied_overlays(&changes, base, marker)?;
        if !config.remove_overlays.is_empty() {
            log::warn!(
                "overlays.clear is set; ignoring overlays.remove ({})",
                config.remove_overlays.join(", ")
            );
        }
    }

    if !config.add_overlays.is_empty() {
        let scratch = tempfile::Builder::new()
            .prefix("dt-customize-")
            .tempdir()
            .io_context(|| "creating temporary overlay directory")?;

        let mut compiled = Vec::with_capacity(config.add_overlays.len());
        for overlay in &config.add_overlays {
            compiled.push(compile_overlay(toolchain, overlay, scratch.path(), &includes)?);
        }

        match overlay_test_base(base, storage, report.devicetree.as_deref())? {
            Some(test_base) => {
                log::info!("Testing overlay(s) against {}", test_base.display());
                toolchain.apply_overlays(
                    &test_base,
                    &compiled,
                    &scratch.path().join("overlay-test.dtb"),
                )?;
                report.overlays_tested_against = Some(test_base);
            }
            None => {
                log::info!("Not testing overlay(s): base image has no device tree set");
            }
        }

        store_overlay_files(&changes, &compiled)?;
        report.stored_overlays = compiled
            .iter()
            .filter_map(|p| p.file_name().map(|n| changes.overlays_dir().join(n)))
            .collect();
    }

    // After the store, which would otherwise wipe the markers.
    if !config.clear_overlays {
        for name in &config.remove_overlays {
            if remove_applied_overlay(&changes, base, name, marker)? {
                report.removed_overlays.push(name.clone());
            } else {
                log::warn!("overlay {} is not deployed in the base image", name);
                report.missing_overlays.push(name.clone());
            }
        }
    }

    report.staged_files = changes.staged_files()?;
    Ok(report)
}

/// Device tree that added overlays must apply to.
///
/// The custom tree when one was built, else the `devicetree` the base image
/// deploys (copied out to the storage area). `None` when neither exists.
fn overlay_test_base(
    base: &BaseTree,
    storage: &StorageArea,
    custom: Option<&Path>,
) -> Result<Option<PathBuf>> {
    if let Some(custom) = custom {
        return Ok(Some(custom.to_path_buf()));
    }
    let deployed = get_ostree_dtb_list(base)?
        .into_iter()
        .find(|entry| entry.name == DT_OUTPUT_NAME);
    match deployed {
        Some(entry) => {
            let repo_path = format!("{}/{}", entry.path, entry.name);
            Ok(Some(copy_devicetree_bin_from_repo(base, storage, &repo_path)?))
        }
        None => Ok(None),
    }
}

/// File name an added overlay is stored under.
fn stored_overlay_name(overlay: &Path) -> Result<OsString> {
    if !overlay.is_file() {
        return Err(DtError::missing(format!("{} does not exist", overlay.display())));
    }
    let mut name = overlay
        .file_name()
        .map(|n| n.to_os_string())
        .ok_or_else(|| DtError::invalid(format!("'{}' is not a file", overlay.display())))?;
    if is_fdt_blob(overlay)? {
        return Ok(name);
    }
    if classify_file(overlay)? != SourceKind::Overlay {
        return Err(DtError::invalid(format!(
            "{} is not a device tree overlay",
            overlay.display()
        )));
    }
    name.push(SourceKind::Overlay.extension());
    Ok(name)
}

/// Every added overlay must exist, be an overlay, and land on its own file name.
fn check_added_overlays(overlays: &[PathBuf]) -> Result<()> {
    let mut seen = HashSet::new();
    for overlay in overlays {
        let name = stored_overlay_name(overlay)?;
        if !seen.insert(name.clone()) {
            return Err(DtError::invalid(format!(
                "overlay {} is added more than once ({})",
                name.to_string_lossy(),
                overlay.display()
            )));
        }
    }
    Ok(())
}

/// Compile an overlay source into `scratch`, or pass a prebuilt blob through.
fn compile_overlay(
    toolchain: &Toolchain,
    overlay: &Path,
    scratch: &Path,
    includes: &IncludePaths,
) -> Result<PathBuf> {
    if is_fdt_blob(overlay)? {
        return Ok(overlay.to_path_buf());
    }
    toolchain.build(overlay, Some(scratch), includes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicetree::testing::{failing, fake_toolchain, write_tool};
    use crate::repo::checkout::fixture;
    use crate::repo::{CheckoutRepo, BASE_REF};
    use crate::storage::OverlayWhiteout;
    use std::fs;
    use tempfile::TempDir;

    const BOARD: &str = "/dts-v1/;\n/ { model = \"Acme\"; };\n";
    const OVERLAY: &str = "/dts-v1/;\n/plugin/;\n/ { fragment@0 { target-path = \"/\"; }; };\n";

    struct Env {
        temp: TempDir,
        toolchain: Toolchain,
        storage: StorageArea,
        repo: CheckoutRepo,
    }

    fn env(paths: &[&str]) -> Env {
        let temp = TempDir::new().unwrap();
        let toolchain = fake_toolchain(temp.path());
        let storage = StorageArea::new(&temp.path().join("storage")).unwrap();
        let repo = fixture(&storage.repo_dir(), "5.4.0", paths);
        fs::write(temp.path().join("board.dts"), BOARD).unwrap();
        fs::write(temp.path().join("display.dts"), OVERLAY).unwrap();
        Env {
            temp,
            toolchain,
            storage,
            repo,
        }
    }

    fn run(env: &Env, config: &DtCustomization) -> Result<CustomizationReport> {
        let base = BaseTree::resolve(&env.repo, BASE_REF)?;
        apply_customization(
            &env.toolchain,
            &base,
            &env.storage,
            config,
            None,
            &OverlayWhiteout,
        )
    }

    #[test]
    fn test_custom_devicetree_and_overlays() {
        let env = env(&[]);
        let config = DtCustomization {
            custom: Some(env.temp.path().join("board.dts")),
            add_overlays: vec![env.temp.path().join("display.dts")],
            ..Default::default()
        };

        let report = run(&env, &config).unwrap();

        let kernel_dir = env.storage.dt_dir().join("usr/lib/modules/5.4.0");
        assert_eq!(report.devicetree, Some(kernel_dir.join("devicetree")));
        assert_eq!(fs::read_to_string(kernel_dir.join("devicetree")).unwrap(), BOARD);
        assert_eq!(
            report.overlays_tested_against,
            Some(kernel_dir.join("devicetree"))
        );
        assert_eq!(
            report.stored_overlays,
            vec![kernel_dir.join("overlays/display.dts.dtbo")]
        );
        assert_eq!(
            report.staged_files,
            vec![
                PathBuf::from("usr/lib/modules/5.4.0/devicetree"),
                PathBuf::from("usr/lib/modules/5.4.0/overlays/display.dts.dtbo"),
            ]
        );
    }

    #[test]
    fn test_removals_survive_store() {
        let env = env(&["usr/lib/modules/5.4.0/overlays/old.dtbo"]);
        let config = DtCustomization {
            remove_overlays: vec!["old.dtbo".to_string(), "gone.dtbo".to_string()],
            add_overlays: vec![env.temp.path().join("display.dts")],
            ..Default::default()
        };

        let report = run(&env, &config).unwrap();

        assert_eq!(report.removed_overlays, ["old.dtbo"]);
        assert_eq!(report.missing_overlays, ["gone.dtbo"]);
        let overlays = env.storage.dt_dir().join("usr/lib/modules/5.4.0/overlays");
        assert!(overlays.join(".wh.old.dtbo").is_file());
        assert!(overlays.join("display.dts.dtbo").is_file());
    }

    #[test]
    fn test_clear_wins_over_remove() {
        let env = env(&["usr/lib/modules/5.4.0/overlays/old.dtbo"]);
        let config = DtCustomization {
            clear_overlays: true,
            remove_overlays: vec!["old.dtbo".to_string()],
            ..Default::default()
        };

        let report = run(&env, &config).unwrap();

        assert!(report.cleared_overlays);
        assert!(report.removed_overlays.is_empty());
        assert_eq!(
            report.staged_files,
            vec![PathBuf::from("usr/lib/modules/5.4.0/.wh.overlays")]
        );
    }

    #[test]
    fn test_rejects_non_overlay_in_add() {
        let env = env(&[]);
        let config = DtCustomization {
            add_overlays: vec![env.temp.path().join("board.dts")],
            ..Default::default()
        };
        let err = run(&env, &config).unwrap_err();
        assert!(matches!(err, DtError::InvalidArgument(_)));
    }

    #[test]
    fn test_missing_custom_source() {
        let env = env(&[]);
        let config = DtCustomization {
            custom: Some(env.temp.path().join("absent.dts")),
            ..Default::default()
        };
        let err = run(&env, &config).unwrap_err();
        assert!(matches!(err, DtError::MissingInput(_)));
    }

    #[test]
    fn test_include_dirs_order() {
        let env = env(&[]);
        let base = BaseTree::resolve(&env.repo, BASE_REF).unwrap();
        let config = DtCustomization {
            include_dirs: vec![PathBuf::from("/extra")],
            ..Default::default()
        };
        let includes = customization_include_dirs(&env.toolchain, &base, &config).unwrap();
        let flat: Vec<_> = includes.iter().cloned().collect();
        assert_eq!(
            flat,
            vec![
                env.toolchain.work_dir.join("device-trees/include/"),
                PathBuf::from("/extra"),
            ]
        );
    }

    fn reject_all_overlays(env: &mut Env) {
        env.toolchain.fdtoverlay = write_tool(
            &env.temp.path().join("bin"),
            "fdtoverlay-reject",
            &failing("Failed to apply 'display.dts.dtbo': FDT_ERR_NOTFOUND", 0),
        );
    }

    #[test]
    fn test_same_overlay_name_twice_is_rejected() {
        let env = env(&[]);
        for dir in ["x", "y"] {
            fs::create_dir_all(env.temp.path().join(dir)).unwrap();
            fs::write(env.temp.path().join(dir).join("display.dts"), OVERLAY).unwrap();
        }
        let config = DtCustomization {
            add_overlays: vec![
                env.temp.path().join("x/display.dts"),
                env.temp.path().join("y/display.dts"),
            ],
            ..Default::default()
        };

        let err = run(&env, &config).unwrap_err();
        assert!(matches!(err, DtError::InvalidArgument(_)));
        assert!(err.to_string().contains("display.dts.dtbo"));
        assert!(!env.storage.dt_dir().exists());
    }

    #[test]
    fn test_overlay_must_apply_to_custom_devicetree() {
        let mut env = env(&[]);
        reject_all_overlays(&mut env);
        let config = DtCustomization {
            custom: Some(env.temp.path().join("board.dts")),
            add_overlays: vec![env.temp.path().join("display.dts")],
            ..Default::default()
        };

        match run(&env, &config).unwrap_err() {
            DtError::ToolFailure { tool, stderr, .. } => {
                assert_eq!(tool, "fdtoverlay");
                assert!(stderr.contains("FDT_ERR_NOTFOUND"));
            }
            other => panic!("unexpected error: {other}"),
        }
        let overlays = env.storage.dt_dir().join("usr/lib/modules/5.4.0/overlays");
        assert!(!overlays.exists());
    }

    #[test]
    fn test_overlay_tested_against_deployed_devicetree() {
        let env = env(&["usr/lib/modules/5.4.0/devicetree"]);
        let config = DtCustomization {
            add_overlays: vec![env.temp.path().join("display.dts")],
            ..Default::default()
        };

        let report = run(&env, &config).unwrap();
        let copied = env.storage.root().join("tmp_devicetree.dtb");
        assert_eq!(report.overlays_tested_against, Some(copied.clone()));
        assert_eq!(
            fs::read_to_string(&copied).unwrap(),
            "usr/lib/modules/5.4.0/devicetree"
        );

        let mut env = env;
        reject_all_overlays(&mut env);
        let err = run(&env, &config).unwrap_err();
        assert!(matches!(err, DtError::ToolFailure { .. }));
    }

    #[test]
    fn test_overlay_test_skipped_without_devicetree() {
        let mut env = env(&["usr/lib/modules/5.4.0/dtb/other.dtb"]);
        reject_all_overlays(&mut env);
        let config = DtCustomization {
            add_overlays: vec![env.temp.path().join("display.dts")],
            ..Default::default()
        };

        let report = run(&env, &config).unwrap();
        assert_eq!(report.overlays_tested_against, None);
        assert_eq!(
            report.staged_files,
            vec![PathBuf::from("usr/lib/modules/5.4.0/overlays/display.dts.dtbo")]
        );
    }
}
