//! Device-tree customization file.
//!
//! ```toml
//! [device_tree]
//! custom = "dts/board.dts"
//! include_dirs = ["dts/include"]
//!
//! [device_tree.overlays]
//! clear = false
//! remove = ["verdin-imx8mm_lt8912_overlay.dtbo"]
//! add = ["overlays/display.dts", "overlays/spi.dts"]
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DtError, IoContext, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DtCustomization {
    pub custom: Option<PathBuf>,
    pub include_dirs: Vec<PathBuf>,
    pub clear_overlays: bool,
    /// File names of overlays deployed in the base image.
    pub remove_overlays: Vec<String>,
    pub add_overlays: Vec<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CustomizationToml {
    device_tree: DeviceTreeToml,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeviceTreeToml {
    custom: Option<String>,
    include_dirs: Option<Vec<String>>,
    overlays: Option<OverlaysToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OverlaysToml {
    clear: Option<bool>,
    remove: Option<Vec<String>>,
    add: Option<Vec<String>>,
}

pub fn load_customization(config_path: &Path) -> Result<DtCustomization> {
    let text = fs::read_to_string(config_path)
        .io_context(|| format!("reading customization '{}'", config_path.display()))?;
    let base_dir = config_path.parent().unwrap_or(Path::new("."));
    parse_customization(&text, base_dir, config_path)
}

/// Parse customization TOML; `config_path` is only used in error messages.
pub fn parse_customization(
    text: &str,
    base_dir: &Path,
    config_path: &Path,
) -> Result<DtCustomization> {
    let config_err = |message: String| DtError::Config {
        path: config_path.to_path_buf(),
        message,
    };

    let parsed: CustomizationToml =
        toml::from_str(text).map_err(|e| config_err(e.to_string()))?;
    let dt = parsed.device_tree;
    let overlays = dt.overlays.unwrap_or(OverlaysToml {
        clear: None,
        remove: None,
        add: None,
    });

    let resolve = |raw: &str| -> PathBuf {
        let candidate = Path::new(raw);
        if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            base_dir.join(candidate)
        }
    };

    let mut remove_overlays = Vec::new();
    for name in overlays.remove.unwrap_or_default() {
        let name = name.trim().to_string();
        if name.is_empty() || name.contains('/') {
            return Err(config_err(format!(
                "overlays.remove entries must be plain file names, got '{}'",
                name
            )));
        }
        remove_overlays.push(name);
    }

    Ok(DtCustomization {
        custom: dt.custom.as_deref().map(resolve),
        include_dirs: dt
            .include_dirs
            .unwrap_or_default()
            .iter()
            .map(|p| resolve(p))
            .collect(),
        clear_overlays: overlays.clear.unwrap_or(false),
        remove_overlays,
        add_overlays: overlays
            .add
            .unwrap_or_default()
            .iter()
            .map(|p| resolve(p))
            .collect(),
    })
}
