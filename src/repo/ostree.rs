//! OSTree archive repository, accessed through the `ostree` CLI.

use std::path::{Path, PathBuf};

use super::{EntryKind, Metadata, RepoEntry, Repository, ARCH_METADATA_KEY};
use crate::error::{DtError, IoContext, Result};
use crate::process::Cmd;

/// Commit metadata keys queried by [`Repository::metadata`].
///
/// `ostree show` prints one key at a time, so the set is fixed.
pub const METADATA_KEYS: &[&str] = &[
    ARCH_METADATA_KEY,
    "oe.machine",
    "oe.kernel-version",
    "version",
];

#[derive(Debug, Clone)]
pub struct OstreeRepo {
    path: PathBuf,
    program: PathBuf,
}

impl OstreeRepo {
    /// Open an existing repository; `path` must contain the ostree `config`.
    pub fn open(path: &Path) -> Result<Self> {
        if !path.join("config").is_file() {
            return Err(DtError::Repository(format!(
                "'{}' is not an ostree repository",
                path.display()
            )));
        }
        Ok(Self {
            path: path.to_path_buf(),
            program: PathBuf::from("ostree"),
        })
    }

    /// Use a specific `ostree` binary instead of the one on `PATH`.
    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn cmd(&self) -> Cmd {
        Cmd::new(&self.program).arg(format!("--repo={}", self.path.display()))
    }
}

impl Repository for OstreeRepo {
    fn exists(&self, reference: &str, path: &str) -> Result<bool> {
        let out = self
            .cmd()
            .args(["ls", "-d", reference, path])
            .allow_fail()
            .run()?;
        Ok(out.success())
    }

    fn list_dir(&self, reference: &str, path: &str) -> Result<Vec<RepoEntry>> {
        let out = self
            .cmd()
            .args(["ls", reference, path])
            .error_msg(&format!("ostree ls {} failed", path))
            .run()?;
        let mut entries = parse_ls_output(&out.stdout, path);
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn copy_file(&self, reference: &str, src: &str, dest: &Path) -> Result<()> {
        let out = self
            .cmd()
            .args(["cat", reference, src])
            .error_msg(&format!("ostree cat {} failed", src))
            .run_bytes()?;
        std::fs::write(dest, out).io_context(|| format!("writing '{}'", dest.display()))
    }

    fn metadata(&self, reference: &str) -> Result<Metadata> {
        let mut metadata = Metadata::new();
        for key in METADATA_KEYS {
            let out = self
                .cmd()
                .args(["show", &format!("--print-metadata-key={}", key), reference])
                .allow_fail()
                .run()?;
            // Missing keys make `ostree show` exit non-zero.
            if out.success() {
                metadata.insert(key.to_string(), parse_gvariant_string(&out.stdout));
            }
        }
        Ok(metadata)
    }
}

/// Parse `ostree ls` lines such as
/// `d00755 0 0      0 /usr/lib/modules/5.4.0/dtb`.
///
/// Mode, uid, gid and size are whitespace separated; the rest of the line is
/// the path, which may itself contain spaces. The queried directory itself
/// is listed first and is skipped.
fn parse_ls_output(stdout: &str, queried: &str) -> Vec<RepoEntry> {
    let queried = queried.trim_end_matches('/');
    stdout
        .lines()
        .filter_map(|line| {
            let mut rest = line.trim_start();
            let mut fields = [""; 4];
            for field in fields.iter_mut() {
                let end = rest.find(char::is_whitespace)?;
                *field = &rest[..end];
                rest = rest[end..].trim_start();
            }
            let kind = match fields[0].chars().next()? {
                'd' => EntryKind::Directory,
                'l' => EntryKind::Symlink,
                _ => EntryKind::File,
            };
            let path = match kind {
                EntryKind::Symlink => rest.split(" -> ").next().unwrap_or(rest),
                _ => rest,
            };
            if path.is_empty() || path.trim_end_matches('/') == queried {
                return None;
            }
            let name = path.trim_end_matches('/').rsplit('/').next()?.to_string();
            Some(RepoEntry {
                name,
                kind,
                size: fields[3].parse().unwrap_or(0),
            })
        })
        .collect()
}

/// `ostree show --print-metadata-key` prints GVariant text, e.g. `'aarch64'`.
fn parse_gvariant_string(raw: &str) -> String {
    let raw = raw.trim();
    raw.strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw)
        .to_string()
}
