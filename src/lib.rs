//! Device-tree overlay builder for OSTree-based images.
//!
//! Compiles device-tree sources and overlays with the host toolchain, layers
//! overlays onto base device trees, and stages the results in a changes
//! directory that mirrors the base image so it can be folded into a new
//! commit.
//!
//! - **devicetree** - compile (`cpp` + `dtc`), apply (`fdtoverlay`), and inventory queries
//! - **repo** - read-only access to the base tree (OSTree or plain checkout)
//! - **storage** - the changes directory, whiteouts, and the storage lock
//! - **config** / **customize** - TOML-driven customization runs
//! - **preflight** - host tool validation
//!
//! # Architecture
//!
//! ```text
//! dt-builder (binary)
//!     │
//!     ├── config::load_customization ──► customize::apply_customization
//!     │                                      │
//!     │              ┌───────────────────────┼──────────────────┐
//!     │              ▼                       ▼                  ▼
//!     │        devicetree::Toolchain   storage::ChangesDir   repo::BaseTree
//!     │         (cpp, dtc, fdtoverlay)  (usr/lib/modules/…)  (ostree / checkout)
//!     │
//!     └── preflight::check_toolchain
//! ```

pub mod config;
pub mod customize;
pub mod devicetree;
pub mod error;
pub mod preflight;
pub mod process;
pub mod repo;
pub mod storage;

pub use customize::{apply_customization, CustomizationReport};
pub use devicetree::{IncludePaths, SourceKind, Toolchain};
pub use error::{DtError, Result};
pub use repo::{BaseTree, Repository};
pub use storage::{ChangesDir, StorageArea};
