//! Preflight checks for the device-tree toolchain.
//!
//! Validates that every tool a [`Toolchain`] points at can be found before
//! anything is compiled, so a missing package surfaces as one readable
//! error instead of a failed spawn halfway through a customization.
//!
//! # Example
//!
//! ```rust,ignore
//! use dt_builder::devicetree::Toolchain;
//! use dt_builder::preflight::check_toolchain;
//!
//! if let Err(e) = check_toolchain(&Toolchain::default()) {
//!     eprintln!("{}", e);
//! }
//! ```

use std::path::Path;

use crate::devicetree::Toolchain;
use crate::error::{DtError, Result};

/// Check if a command exists on the host system.
///
/// Bare names are looked up in `PATH`; paths must point at an existing file.
pub fn command_exists(cmd: &Path) -> bool {
    which::which(cmd).is_ok()
}

/// Host packages providing each tool.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("cpp", "cpp"),
    ("dtc", "device-tree-compiler"),
    ("fdtoverlay", "device-tree-compiler"),
    ("fdtget", "device-tree-compiler"),
];

fn package_for(tool: &str) -> &'static str {
    REQUIRED_TOOLS
        .iter()
        .find(|(name, _)| *name == tool)
        .map(|(_, package)| *package)
        .unwrap_or("unknown")
}

/// Check that every tool configured on `toolchain` is available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing each missing tool and the package that provides it
pub fn check_toolchain(toolchain: &Toolchain) -> Result<()> {
    let configured = [
        ("cpp", toolchain.cpp.as_path()),
        ("dtc", toolchain.dtc.as_path()),
        ("fdtoverlay", toolchain.fdtoverlay.as_path()),
        ("fdtget", toolchain.fdtget.as_path()),
    ];

    let missing: Vec<_> = configured
        .iter()
        .filter(|(_, program)| !command_exists(program))
        .map(|(tool, program)| {
            format!("  {} (install: {})", program.display(), package_for(tool))
        })
        .collect();

    if !missing.is_empty() {
        return Err(DtError::missing(format!(
            "Missing required host tools:\n{}",
            missing.join("\n")
        )));
    }

    log::debug!("device-tree toolchain found");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicetree::testing::fake_toolchain;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_command_exists() {
        // 'sh' should exist on any Unix system
        assert!(command_exists(Path::new("sh")));
        assert!(!command_exists(Path::new("definitely_not_a_real_command_12345")));
    }

    #[test]
    fn test_check_toolchain_success() {
        let temp = TempDir::new().unwrap();
        assert!(check_toolchain(&fake_toolchain(temp.path())).is_ok());
    }

    #[test]
    fn test_check_toolchain_lists_missing_tools() {
        let temp = TempDir::new().unwrap();
        let mut toolchain = fake_toolchain(temp.path());
        toolchain.dtc = PathBuf::from("nonexistent-dtc-xyz");
        toolchain.fdtget = temp.path().join("bin/absent-fdtget");

        let err = check_toolchain(&toolchain).unwrap_err().to_string();
        assert!(err.starts_with("Missing required host tools:\n"));
        assert!(err.contains("  nonexistent-dtc-xyz (install: device-tree-compiler)"));
        assert!(err.contains("absent-fdtget (install: device-tree-compiler)"));
        assert!(!err.contains("cpp"));
    }
}
