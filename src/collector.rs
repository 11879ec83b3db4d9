//! Collection of crawled libraries into a self-contained folder, and
//! in-place fix-up of the input binaries.
//!
//! Collection picks one representative per library name out of the flat
//! index (conflicts resolved by the preferred-prefix order), copies each
//! winner into the output folder, and rewrites its identity and outbound
//! references to `@loader_path` anchored forms through the external
//! install-name rewriter. Fix-up applies the matching rewrites to the input
//! binaries themselves so they load out of the collected tree.

use std::collections::{HashMap, hash_map::Entry};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::{debug, error, warn};

use crate::graph::{Dependency, DependencyGraph};
use crate::{Error, Result, paths};

/// The external install-name rewriter. Must accept `-id <new> <file>` and
/// `-change <old> <new> <file>`.
const INSTALL_NAME_TOOL: &str = "install_name_tool";

/// Options for the collector and the top-level fix-up.
#[derive(Debug, Clone, Default)]
pub struct CollectorOptions {
    /// Destination directory; created if missing.
    pub folder: PathBuf,
    /// Path prefixes to prefer when resolving library-name conflicts, most
    /// preferred first.
    pub preferred_order: Vec<String>,
    /// When false, libraries whose destination already exists are skipped.
    pub overwrite: bool,
    /// When false, libraries declared through `@` paths are left alone.
    pub modify_special_paths: bool,
    /// When false, framework-style libraries are left alone.
    pub collect_frameworks: bool,
    /// Number of concurrent copy/rewrite workers.
    pub jobs: usize,
}

/// Framework dylibs carry no `.dylib`/`.so` extension.
pub(crate) fn is_framework_lib(name: &str) -> bool {
    !matches!(
        Path::new(name).extension().and_then(|ext| ext.to_str()),
        Some("dylib") | Some("so")
    )
}

/// Index of the first preferred prefix matching `path`, if any. Lower is
/// better.
fn niceness(path: &str, order: &[String]) -> Option<usize> {
    order.iter().position(|prefix| path.starts_with(prefix.as_str()))
}

/// Select the dependencies to collect: one representative per library name,
/// conflicts decided by the preferred-prefix order (first seen wins when no
/// prefix matches). Sorted by name so runs are reproducible.
pub(crate) fn plan_collection(
    graph: &DependencyGraph,
    opts: &CollectorOptions,
    folder: &Path,
) -> Vec<Arc<Dependency>> {
    let mut selected: HashMap<String, Arc<Dependency>> = HashMap::new();
    for dep in graph.flat_deps().into_values() {
        if dep.not_resolved() {
            warn!("not collecting unresolved dependency {} ({})", dep.name, dep.path);
            continue;
        }
        if !opts.modify_special_paths && paths::is_special_path(&dep.path) {
            warn!("not collecting/modifying @dependency {} ({})", dep.name, dep.path);
            continue;
        }
        if graph.toplevel_by_name(&dep.name).is_some() {
            // Libraries that shadow an input file are handled by fix-up.
            debug!("leaving top-level name {} to fix-up", dep.name);
            continue;
        }
        if !opts.collect_frameworks && is_framework_lib(&dep.name) {
            warn!("not collecting framework dependency {} ({})", dep.name, dep.path);
            continue;
        }
        if !opts.overwrite {
            match fs_err::metadata(folder.join(&dep.name)) {
                Ok(_) => continue,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    warn!("could not stat destination [skipping]: {err}");
                    continue;
                }
            }
        }

        match selected.entry(dep.name.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(dep);
            }
            Entry::Occupied(mut slot) => {
                warn!(
                    "library conflict: {} -- {}, attempting resolve",
                    slot.get().path,
                    dep.path
                );
                let holder = niceness(&slot.get().path, &opts.preferred_order);
                let challenger = niceness(&dep.path, &opts.preferred_order);
                if challenger.is_some() && (holder.is_none() || challenger < holder) {
                    debug!("preferred {} over {}", dep.path, slot.get().path);
                    slot.insert(dep);
                }
            }
        }
    }

    let mut plan: Vec<_> = selected.into_values().collect();
    plan.sort_by(|a, b| a.name.cmp(&b.name));
    plan
}

/// Copy the selected dependencies into the collection folder and rewrite
/// each copy's identity and outbound references.
///
/// Workers run concurrently, bounded by `jobs`; their error strings are
/// joined into a single [`Error::Aggregate`] when anything failed.
pub fn collect_deps(graph: &DependencyGraph, opts: &CollectorOptions) -> Result<()> {
    fs_err::create_dir_all(&opts.folder)?;
    let folder = paths::resolve_abs_path(&opts.folder)?;

    let selected = plan_collection(graph, opts, &folder);
    if selected.is_empty() {
        return Ok(());
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(opts.jobs.max(1))
        .build()?;
    let errors: Vec<String> = pool.install(|| {
        selected
            .par_iter()
            .flat_map_iter(|dep| collect_one(dep, graph, opts, &folder))
            .collect()
    });

    if errors.is_empty() {
        Ok(())
    } else {
        Err(Error::Aggregate(errors))
    }
}

fn collect_one(
    dep: &Dependency,
    graph: &DependencyGraph,
    opts: &CollectorOptions,
    folder: &Path,
) -> Vec<String> {
    let mut errors = Vec::new();
    let destination = folder.join(&dep.name);
    if let Err(err) = copy_writable(dep.real_path(), &destination) {
        errors.push(format!(
            "could not copy {} [{}]: {err}",
            dep.path,
            dep.real_path().display()
        ));
        return errors;
    }

    if let Err(err) = rewrite_identity(&destination, &dep.name) {
        errors.push(format!(
            "could not update identity of {} [{}]: {err}",
            dep.path,
            dep.real_path().display()
        ));
        return errors;
    }

    for edge in dep.children() {
        if skip_edge(&edge, opts) {
            continue;
        }
        let new_ref = if let Some(top) = graph.toplevel_by_name(&edge.name) {
            // The referenced library shadows an input file; point at the
            // fixed-up input rather than a collected copy.
            match paths::relative_to(top.real_path(), folder) {
                Some(rel) => format!("@loader_path/{}", rel.display()),
                None => {
                    errors.push(format!(
                        "could not determine relative path from {} to {}",
                        folder.display(),
                        top.real_path().display()
                    ));
                    continue;
                }
            }
        } else if !opts.collect_frameworks && is_framework_lib(&edge.name) {
            continue;
        } else {
            format!("@loader_path/{}", edge.name)
        };

        if let Err(err) = rewrite_reference(&destination, &edge.path, &new_ref) {
            errors.push(format!(
                "could not rewrite reference {} in {}: {err}",
                edge.path,
                destination.display()
            ));
        }
    }
    errors
}

/// Rewrite the input binaries in place so their references point into the
/// collected tree. Rewriter failures are logged, never fatal.
pub fn fixup_toplevels(graph: &DependencyGraph, opts: &CollectorOptions) -> Result<()> {
    fs_err::create_dir_all(&opts.folder)?;
    let folder = paths::resolve_abs_path(&opts.folder)?;

    for top in &graph.top_deps {
        if top.not_resolved() {
            warn!("not fixing unresolved top-level {}", top.path);
            continue;
        }
        match fs_err::symlink_metadata(Path::new(&top.path)) {
            Ok(meta) if meta.file_type().is_symlink() => {
                debug!("not rewriting {} through a symlink", top.path);
                continue;
            }
            Ok(_) => {}
            Err(err) => {
                warn!("cannot stat {}, skipping: {err}", top.path);
                continue;
            }
        }

        let real = top.real_path();
        if let Err(err) = make_writable(real) {
            warn!("cannot make {} writable, skipping: {err}", top.path);
            continue;
        }
        if let Err(err) = rewrite_identity(real, &top.name) {
            error!("could not update identity of {}: {err}", top.path);
        }

        let top_dir = real.parent().unwrap_or_else(|| Path::new("/"));
        for edge in top.children() {
            if skip_edge(&edge, opts) {
                continue;
            }
            let destination = match graph.toplevel_by_name(&edge.name) {
                Some(other) => other.real_path().to_path_buf(),
                None => {
                    if !opts.collect_frameworks && is_framework_lib(&edge.name) {
                        continue;
                    }
                    folder.join(&edge.name)
                }
            };
            let rel = match paths::relative_to(&destination, top_dir) {
                Some(rel) => rel,
                None => {
                    warn!(
                        "could not determine relative path to {}",
                        destination.display()
                    );
                    continue;
                }
            };
            if let Err(err) = rewrite_reference(
                real,
                &edge.path,
                &format!("@loader_path/{}", rel.display()),
            ) {
                error!("could not rewrite reference {} in {}: {err}", edge.path, top.path);
            }
        }
    }
    Ok(())
}

/// Edges that collection and fix-up both leave alone: unresolved ones,
/// pruned ones that are not flat-index duplicates, and special paths when
/// those are off limits.
fn skip_edge(edge: &Dependency, opts: &CollectorOptions) -> bool {
    edge.not_resolved()
        || (edge.pruned() && !edge.pruned_by_flat_deps())
        || (!opts.modify_special_paths && paths::is_special_path(&edge.path))
}

fn copy_writable(from: &Path, to: &Path) -> std::io::Result<()> {
    fs_err::copy(from, to)?;
    make_writable(to)
}

fn make_writable(path: &Path) -> std::io::Result<()> {
    let mut perms = fs_err::metadata(path)?.permissions();
    perms.set_mode(perms.mode() | 0o700);
    fs_err::set_permissions(path, perms)
}

fn rewrite_identity(file: &Path, name: &str) -> Result<()> {
    let id = format!("@loader_path/{name}");
    run_rewriter(&[OsStr::new("-id"), OsStr::new(&id), file.as_os_str()])
}

fn rewrite_reference(file: &Path, old: &str, new: &str) -> Result<()> {
    run_rewriter(&[
        OsStr::new("-change"),
        OsStr::new(old),
        OsStr::new(new),
        file.as_os_str(),
    ])
}

fn run_rewriter(args: &[&OsStr]) -> Result<()> {
    let output = Command::new(INSTALL_NAME_TOOL).args(args).output()?;
    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        return Err(Error::RewriterFailed {
            output: text.trim().to_string(),
        });
    }
    Ok(())
}
