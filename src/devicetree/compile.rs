//! Two-stage compile of a device-tree source: `cpp`, then `dtc`.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use super::{classify_file, IncludePaths, SourceKind, Toolchain};
use crate::error::{DtError, IoContext, Result};
use crate::process::Cmd;

/// Where the compiled artifact for `source` goes.
///
/// - no output: `<work_dir>/<basename(source)><ext>`
/// - output is an existing directory: `<output>/<basename(source)><ext>`
/// - otherwise: `output` verbatim
pub fn resolve_output_path(
    source: &Path,
    kind: SourceKind,
    output: Option<&Path>,
    work_dir: &Path,
) -> PathBuf {
    let mut file_name = source
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    file_name.push(kind.extension());

    match output {
        None => work_dir.join(file_name),
        Some(dir) if dir.is_dir() => dir.join(file_name),
        Some(path) => path.to_path_buf(),
    }
}

/// `<source>.tmp`, next to the source.
fn preprocessed_path(source: &Path) -> PathBuf {
    let mut tmp = OsString::from(source.as_os_str());
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

impl Toolchain {
    /// Compile `source` into a `.dtb` or `.dtbo`, returning the output path.
    ///
    /// The extension follows the content of the source (see
    /// [`super::classify`]). If compilation fails, `<source>.tmp` is left in
    /// place so the preprocessed input can be inspected.
    pub fn build(
        &self,
        source: &Path,
        output: Option<&Path>,
        includes: &IncludePaths,
    ) -> Result<PathBuf> {
        if !source.is_file() {
            return Err(DtError::missing(format!(
                "Invalid device tree source file {}",
                source.display()
            )));
        }

        let kind = classify_file(source)?;
        let output = resolve_output_path(source, kind, output, &self.work_dir);
        let tmp = preprocessed_path(source);

        log::info!("Compiling {} -> {}", source.display(), output.display());

        let mut cpp = Cmd::new(&self.cpp).args(["-nostdinc", "-undef", "-x", "assembler-with-cpp"]);
        let mut dtc = Cmd::new(&self.dtc).args(["-@", "-I", "dts", "-O", "dtb"]);
        for path in includes.iter() {
            cpp = cpp.arg("-I").arg_path(path);
            dtc = dtc.arg("-i").arg_path(path);
        }

        cpp.arg("-o")
            .arg_path(&tmp)
            .arg_path(source)
            .error_msg("Failed to preprocess device tree.")
            .run()?;

        dtc.arg("-o")
            .arg_path(&output)
            .arg_path(&tmp)
            .error_msg("Failed to build device tree.")
            .run()?;

        fs::remove_file(&tmp).io_context(|| format!("removing '{}'", tmp.display()))?;

        Ok(output)
    }
}
