//! Device-tree compilation, overlay application, and inventory.
//!
//! All work is delegated to the host device-tree toolchain:
//!
//! - `cpp` - macro preprocessing of `.dts` sources
//! - `dtc` - compiling preprocessed sources to `.dtb` / `.dtbo` blobs
//! - `fdtoverlay` - merging compiled overlays onto a base blob
//! - `fdtget` - reading properties back out of a blob
//!
//! [`Toolchain`] records which binaries to run and the directory that
//! default outputs land in. Nothing here depends on the process working
//! directory once a `Toolchain` exists.
//!
//! # Example
//!
//! ```rust,ignore
//! use dt_builder::devicetree::{IncludePaths, Toolchain};
//!
//! let toolchain = Toolchain::new("build/");
//! let includes = IncludePaths::from(vec!["device-trees/include/".into()]);
//!
//! // Produces build/my-overlay.dts.dtbo
//! toolchain.build(Path::new("my-overlay.dts"), None, &includes)?;
//!
//! toolchain.build_and_apply(
//!     Path::new("board.dts"),
//!     &[PathBuf::from("display.dts"), PathBuf::from("spi.dts")],
//!     Path::new("build/devicetree"),
//!     &includes,
//! )?;
//! ```

pub mod apply;
pub mod compile;
pub mod inventory;

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use crate::error::{IoContext, Result};

pub use inventory::{
    get_compatibilities_binary, get_default_include_dir, get_list_applied_dtbo_in_repo,
    get_ostree_dtb_list, DtbEntry,
};

/// File name OSTree treats as the single device tree to deploy.
pub const DT_OUTPUT_NAME: &str = "devicetree";

/// Token whose presence marks a source as an overlay.
pub const FRAGMENT_MARKER: &[u8] = b"fragment@0";

/// Magic number at the start of every flattened device tree blob.
const FDT_MAGIC: [u8; 4] = [0xd0, 0x0d, 0xfe, 0xed];

/// What a device-tree source compiles to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Standalone tree, compiled to `.dtb`.
    Base,
    /// Overlay fragment, compiled to `.dtbo`.
    Overlay,
}

impl SourceKind {
    pub fn extension(self) -> &'static str {
        match self {
            SourceKind::Base => ".dtb",
            SourceKind::Overlay => ".dtbo",
        }
    }
}

/// Classify a source by scanning for [`FRAGMENT_MARKER`], line by line.
///
/// Stops at the first line containing the marker.
pub fn classify<R: BufRead>(reader: R) -> std::io::Result<SourceKind> {
    for line in reader.split(b'\n') {
        if contains(&line?, FRAGMENT_MARKER) {
            return Ok(SourceKind::Overlay);
        }
    }
    Ok(SourceKind::Base)
}

pub fn classify_file(source: &Path) -> Result<SourceKind> {
    let file = File::open(source).io_context(|| format!("opening '{}'", source.display()))?;
    classify(BufReader::new(file)).io_context(|| format!("reading '{}'", source.display()))
}

/// True when `path` starts with the FDT magic, i.e. is already compiled.
pub fn is_fdt_blob(path: &Path) -> Result<bool> {
    let mut file = File::open(path).io_context(|| format!("opening '{}'", path.display()))?;
    let mut magic = [0u8; 4];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(magic == FDT_MAGIC),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).io_context(|| format!("reading '{}'", path.display())),
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// Ordered include directories. First match wins, for both `cpp` and `dtc`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IncludePaths(Vec<PathBuf>);

impl IncludePaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Into<PathBuf>) {
        self.0.push(path.into());
    }

    pub fn iter(&self) -> impl Iterator<Item = &PathBuf> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl From<Vec<PathBuf>> for IncludePaths {
    fn from(paths: Vec<PathBuf>) -> Self {
        Self(paths)
    }
}

impl<P: Into<PathBuf>> FromIterator<P> for IncludePaths {
    fn from_iter<I: IntoIterator<Item = P>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl<P: Into<PathBuf>> Extend<P> for IncludePaths {
    fn extend<I: IntoIterator<Item = P>>(&mut self, iter: I) {
        self.0.extend(iter.into_iter().map(Into::into));
    }
}

/// Host tools used by the pipeline, plus the default output directory.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub cpp: PathBuf,
    pub dtc: PathBuf,
    pub fdtoverlay: PathBuf,
    pub fdtget: PathBuf,
    /// Where [`Toolchain::build`] writes when no output is given.
    pub work_dir: PathBuf,
}

impl Toolchain {
    /// Tools from `PATH`, default outputs in `work_dir`.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            cpp: PathBuf::from("cpp"),
            dtc: PathBuf::from("dtc"),
            fdtoverlay: PathBuf::from("fdtoverlay"),
            fdtget: PathBuf::from("fdtget"),
            work_dir: work_dir.into(),
        }
    }
}

impl Default for Toolchain {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shell stand-ins for the device-tree tools.
    //!
    //! They parse the same command lines as the real tools but only copy or
    //! concatenate their inputs, which is enough to observe ordering and
    //! error handling without a host toolchain.

    use super::Toolchain;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};

    /// `-o <out>` and a trailing input; copies input to output.
    pub const COPY_TOOL: &str = r#"#!/bin/sh
out=""
while [ $# -gt 1 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
cp "$1" "$out"
"#;

    /// `-i <base> -o <out> <overlay>...`; concatenates base and overlays.
    pub const CONCAT_OVERLAY: &str = r#"#!/bin/sh
base=""
out=""
ovls=""
while [ $# -gt 0 ]; do
  case "$1" in
    -i) base="$2"; shift 2 ;;
    -o) out="$2"; shift 2 ;;
    *) ovls="$ovls $1"; shift ;;
  esac
done
cat "$base" $ovls > "$out"
"#;

    pub const COMPATIBLE: &str = "#!/bin/sh\necho \"acme,board-v2 acme,board\"\n";

    pub fn failing(stderr: &str, code: i32) -> String {
        format!("#!/bin/sh\necho \"{}\" >&2\nexit {}\n", stderr, code)
    }

    pub fn write_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, script).unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    /// A toolchain of stand-ins living in `<dir>/bin`, outputs in `<dir>/work`.
    pub fn fake_toolchain(dir: &Path) -> Toolchain {
        let bin = dir.join("bin");
        let work = dir.join("work");
        fs::create_dir_all(&bin).unwrap();
        fs::create_dir_all(&work).unwrap();
        Toolchain {
            cpp: write_tool(&bin, "cpp", COPY_TOOL),
            dtc: write_tool(&bin, "dtc", COPY_TOOL),
            fdtoverlay: write_tool(&bin, "fdtoverlay", CONCAT_OVERLAY),
            fdtget: write_tool(&bin, "fdtget", COMPATIBLE),
            work_dir: work,
        }
    }
}
