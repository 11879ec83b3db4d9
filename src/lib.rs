//! Machtree - a Mach-O dynamic-library dependency crawler and collector.
//!
//! Machtree computes the transitive dylib dependency closure of one or more
//! Mach-O or Universal (fat) binaries, and can relocate that closure into an
//! output directory with every install-name reference rewritten so the
//! resulting bundle is self-contained.
//!
//! # Modules
//!
//! - [`macho`] - Mach-O/Universal binary inspection (magic check, dylib load
//!   commands, install-name identity)
//! - [`paths`] - Path canonicalisation and `@executable_path`/`@loader_path`
//!   token expansion
//! - [`walk`] - Recursive discovery of candidate binaries under a folder
//! - [`graph`] - The dependency graph data model and its JSON projection
//! - [`crawler`] - Concurrent construction of the dependency graph
//! - [`collector`] - Collection of libraries into a folder and in-place
//!   fix-up of the input binaries
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type, which provides
//! specific variants for the different failure modes (inspection, path
//! resolution, rewriting, etc.). Per-node failures during a crawl never
//! abort the crawl; they are recorded on the affected node instead.

pub mod collector;
pub mod crawler;
pub mod graph;
pub mod macho;
pub mod paths;
pub mod walk;

use std::path::PathBuf;

/// Consolidated error type for all machtree operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}: not a Mach-O/Universal binary")]
    NotMachO(PathBuf),

    #[error("invalid load command: {0}")]
    InvalidLoadCommand(String),

    #[error("{path}: could not resolve: {source}")]
    ResolveFailed {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}: no executable path set")]
    NoExecutablePath(String),

    #[error("{0}: unsupported loader token")]
    UnsupportedToken(String),

    #[error("no input files specified")]
    NoInputs,

    #[error("install-name rewriter failed: {output}")]
    RewriterFailed { output: String },

    #[error("collection failed:\n{}", .0.join("\n"))]
    Aggregate(Vec<String>),

    #[error("could not build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub use collector::{CollectorOptions, collect_deps, fixup_toplevels};
pub use crawler::{DependencyOptions, deps_read};
pub use graph::{Dependency, DependencyGraph};
