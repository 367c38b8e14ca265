//! `dt-builder` command-line tool.
//!
//! Thin wrapper over the library: argument parsing, logger setup, and
//! printing results.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use dt_builder::config::load_customization;
use dt_builder::customize::apply_customization;
use dt_builder::devicetree::{
    get_compatibilities_binary, get_default_include_dir, get_list_applied_dtbo_in_repo,
    get_ostree_dtb_list, IncludePaths, Toolchain,
};
use dt_builder::preflight::check_toolchain;
use dt_builder::repo::{BaseTree, CheckoutRepo, OstreeRepo, Repository, BASE_REF};
use dt_builder::storage::{
    copy_devicetree_bin_from_repo, copy_devicetree_bin_from_workdir, open_dt_changes_dir,
    OverlayWhiteout, StorageArea,
};

/// Build device trees and overlays for an OSTree-based image
#[derive(Parser, Debug)]
#[command(name = "dt-builder")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Image builder storage directory
    #[arg(long, global = true, env = "DT_BUILDER_STORAGE", default_value = ".")]
    storage_dir: PathBuf,

    /// Reference of the base commit
    #[arg(long = "ref", global = true, default_value = BASE_REF)]
    reference: String,

    /// How the base repository is stored
    #[arg(long, global = true, value_enum, default_value_t = RepoKind::Ostree)]
    repo_kind: RepoKind,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum RepoKind {
    /// OSTree repository, read through the `ostree` CLI
    Ostree,
    /// Plain `<ref>/tree` checkouts
    Checkout,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a device tree or overlay source
    Build {
        source: PathBuf,
        /// Output file or directory
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Include directory, searched in order
        #[arg(short = 'I', long = "include")]
        include: Vec<PathBuf>,
    },
    /// Compile overlays and apply them, in order, to a base device tree
    Apply {
        base: PathBuf,
        overlays: Vec<PathBuf>,
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short = 'I', long = "include")]
        include: Vec<PathBuf>,
    },
    /// List device trees shipped by the base image
    ListDtbs {
        #[arg(long)]
        json: bool,
    },
    /// List overlays deployed in the base image
    ListOverlays {
        #[arg(long)]
        json: bool,
    },
    /// Print the root compatible strings of a compiled device tree
    Compatible {
        dtb: PathBuf,
        /// Read DTB from the base image instead of the host
        #[arg(long)]
        in_repo: bool,
    },
    /// Print the default include directories for the base architecture
    IncludeDirs,
    /// Stage device-tree changes described by a TOML file
    Customize {
        config: PathBuf,
        /// Changes directory to use instead of <storage>/dt
        #[arg(long)]
        changes_dir: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// List files staged in an existing changes directory
    Status {
        /// Changes directory to use instead of <storage>/dt
        #[arg(long)]
        changes_dir: Option<PathBuf>,
    },
    /// Check that the device-tree toolchain is installed
    Preflight,
}

fn init_logging(verbose: bool) {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if verbose {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.format_timestamp(None).init();
}

fn open_repo(kind: RepoKind, path: &Path) -> Result<Box<dyn Repository>> {
    let repo: Box<dyn Repository> = match kind {
        RepoKind::Ostree => Box::new(OstreeRepo::open(path)?),
        RepoKind::Checkout => Box::new(CheckoutRepo::open(path)?),
    };
    Ok(repo)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let toolchain = Toolchain::default();
    let storage = StorageArea::new(&cli.storage_dir)?;

    match cli.command {
        Commands::Build {
            source,
            output,
            include,
        } => {
            let out = toolchain.build(&source, output.as_deref(), &IncludePaths::from(include))?;
            println!("{}", out.display());
        }
        Commands::Apply {
            base,
            overlays,
            output,
            include,
        } => {
            let out =
                toolchain.build_and_apply(&base, &overlays, &output, &IncludePaths::from(include))?;
            println!("{}", out.display());
        }
        Commands::ListDtbs { json } => {
            let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
            let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
            let dtbs = get_ostree_dtb_list(&base)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&dtbs)?);
            } else {
                for dtb in dtbs {
                    println!("{}/{}", dtb.path, dtb.name);
                }
            }
        }
        Commands::ListOverlays { json } => {
            let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
            let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
            let overlays = get_list_applied_dtbo_in_repo(&base)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&overlays)?);
            } else {
                for overlay in overlays {
                    println!("{}", overlay.name);
                }
            }
        }
        Commands::Compatible { dtb, in_repo } => {
            let _lock = storage.lock()?;
            let local = if in_repo {
                let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
                let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
                copy_devicetree_bin_from_repo(&base, &storage, &dtb.to_string_lossy())?
            } else {
                copy_devicetree_bin_from_workdir(&storage, &dtb)?
            };
            for compatible in get_compatibilities_binary(&toolchain, &local)? {
                println!("{}", compatible);
            }
        }
        Commands::IncludeDirs => {
            let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
            let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
            for dir in get_default_include_dir(&base)?.iter() {
                println!("{}", dir.display());
            }
        }
        Commands::Customize {
            config,
            changes_dir,
            json,
        } => {
            let customization = load_customization(&config)?;
            let _lock = storage.lock()?;
            let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
            let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
            let report = apply_customization(
                &toolchain,
                &base,
                &storage,
                &customization,
                changes_dir.as_deref(),
                &OverlayWhiteout,
            )
            .with_context(|| format!("applying {}", config.display()))?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Staged in {}:", report.changes_root.display());
                for file in &report.staged_files {
                    println!("  {}", file.display());
                }
            }
        }
        Commands::Status { changes_dir } => {
            let repo = open_repo(cli.repo_kind, &storage.repo_dir())?;
            let base = BaseTree::resolve(repo.as_ref(), &cli.reference)?;
            let changes = open_dt_changes_dir(&base, &storage, changes_dir.as_deref())?;
            println!("{} (kernel {}):", changes.root().display(), changes.kernel_version());
            for file in changes.staged_files()? {
                println!("  {}", file.display());
            }
        }
        Commands::Preflight => {
            check_toolchain(&toolchain)?;
            println!("device-tree toolchain OK");
        }
    }

    Ok(())
}
