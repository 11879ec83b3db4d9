//! Concurrent construction of the dependency graph.
//!
//! Crawling starts from one node per input file and expands outward: each
//! task inspects one binary, runs every discovered edge through the pruning
//! decision, and schedules tasks for the edges worth descending into. Tasks
//! run on a work-stealing pool sized by the `jobs` option, so task
//! submission is unbounded while at most `jobs` binaries are parsed at once,
//! and the pool scope doubles as the completion barrier. Per-node failures
//! are recorded on the node; only input normalisation can fail the crawl.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rayon::Scope;
use tracing::warn;

use crate::graph::{Dependency, DependencyGraph};
use crate::{Error, Result, macho, paths};

/// Options controlling dependency resolution.
#[derive(Debug, Clone)]
pub struct DependencyOptions {
    /// Substituted for `@executable_path` during expansion.
    pub executable_path: Option<PathBuf>,
    /// Resolved paths beginning with one of these prefixes are pruned.
    pub ignored_prefixes: Vec<String>,
    /// Exact basenames to prune.
    pub ignored_files: Vec<String>,
    /// When false, only immediate dependencies of each input are computed.
    pub recursive: bool,
    /// When true, weakly loaded libraries are represented but not descended.
    pub skip_weak_libs: bool,
    /// Upper bound on concurrent binary parses. Values <= 1 run sequentially.
    pub jobs: usize,
}

impl Default for DependencyOptions {
    fn default() -> Self {
        DependencyOptions {
            executable_path: None,
            ignored_prefixes: Vec::new(),
            ignored_files: Vec::new(),
            recursive: false,
            skip_weak_libs: false,
            jobs: 1,
        }
    }
}

/// Calculate the dependency graph for the given files.
///
/// Inputs are resolved to absolute symlink-expanded paths, verified to be
/// Mach-O/Universal, and deduplicated while preserving order; failures here
/// abort the whole operation. Everything after that is best-effort: nodes
/// that cannot be inspected or resolved are flagged, never fatal.
pub fn deps_read(opts: DependencyOptions, files: &[PathBuf]) -> Result<DependencyGraph> {
    let mut top_deps = Vec::new();
    let mut seen = HashSet::new();
    for file in files {
        let resolved = paths::resolve_abs_path(file)?;
        if !macho::is_fat_or_macho(&resolved)? {
            return Err(Error::NotMachO(resolved));
        }
        if !seen.insert(resolved.clone()) {
            continue;
        }

        let info = macho::read_identity(&resolved)?
            .first()
            .map(|record| record.info())
            .unwrap_or_default();
        top_deps.push(Arc::new(Dependency::new(
            paths::basename(&resolved.to_string_lossy()),
            file.display().to_string(),
            Some(resolved),
            info,
            false,
        )));
    }
    if top_deps.is_empty() {
        return Err(Error::NoInputs);
    }

    let graph = DependencyGraph::new(top_deps);
    if opts.recursive && opts.jobs > 1 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(opts.jobs)
            .build()?;
        let graph_ref = &graph;
        let opts_ref = &opts;
        pool.scope(|scope| {
            for top in &graph_ref.top_deps {
                let top = Arc::clone(top);
                scope.spawn(move |scope| crawl(top, graph_ref, opts_ref, Some(scope)));
            }
        });
    } else {
        for top in graph.top_deps.clone() {
            crawl(top, &graph, &opts, None);
        }
    }

    Ok(graph)
}

/// Expand one node: list its dylib records, prune, link children, schedule
/// descents. Runs once per canonical node.
fn crawl<'a>(
    node: Arc<Dependency>,
    graph: &'a DependencyGraph,
    opts: &'a DependencyOptions,
    scope: Option<&Scope<'a>>,
) {
    let real = node.real_path().to_path_buf();
    if paths::is_special_path(&real.to_string_lossy()) {
        // Without a real path there is nothing to inspect.
        return;
    }

    let records = match macho::read_dylibs(&real) {
        Ok(records) => records,
        Err(err) => {
            warn!("could not inspect {}: {err}", node.path);
            node.mark_not_resolved();
            return;
        }
    };

    // A fat binary repeats its load commands per architecture slice; each
    // declared path is processed once per parent.
    let mut observed = HashSet::new();
    let mut pending = Vec::new();
    for record in records {
        if !observed.insert(record.path.clone()) {
            continue;
        }

        let cand = Dependency::new(
            paths::basename(&record.path),
            record.path.clone(),
            None,
            record.info(),
            record.weak,
        );
        let (child, descend) = prune(cand, &node, graph, opts);
        node.push_child(Arc::clone(&child));
        if descend {
            pending.push(child);
        }
    }
    node.sort_children();

    if !opts.recursive {
        return;
    }
    for child in pending {
        match scope {
            Some(scope) => scope.spawn(move |scope| crawl(child, graph, opts, Some(scope))),
            None => crawl(child, graph, opts, None),
        }
    }
}

/// The pruning decision for a candidate discovered under `parent`.
///
/// Returns the canonical node to link under the parent and whether the
/// caller should descend into it.
fn prune(
    mut cand: Dependency,
    parent: &Dependency,
    graph: &DependencyGraph,
    opts: &DependencyOptions,
) -> (Arc<Dependency>, bool) {
    if cand.is_weak && opts.skip_weak_libs {
        cand.pruned = true;
        return (Arc::new(cand), false);
    }

    if opts.ignored_files.iter().any(|name| *name == cand.name) {
        cand.pruned = true;
        return (Arc::new(cand), false);
    }

    // The top-level files are never in the flat index; matching them here is
    // what breaks dependency cycles through the roots.
    if graph.is_toplevel_path(Path::new(&cand.path)) {
        cand.pruned = true;
        return (Arc::new(cand), false);
    }

    let resolved = match paths::expand_path(&cand.path, parent, opts) {
        Ok(resolved) => resolved,
        Err(err) => {
            warn!(
                "could not resolve dependency {} for {}: {err} (weak: {})",
                cand.path, parent.path, cand.is_weak
            );
            cand.mark_not_resolved();
            return (Arc::new(cand), false);
        }
    };
    cand.real_path = Some(resolved.clone());

    if graph.is_toplevel_path(&resolved) {
        cand.pruned = true;
        return (Arc::new(cand), false);
    }

    let resolved_str = resolved.to_string_lossy();
    if opts
        .ignored_prefixes
        .iter()
        .any(|prefix| resolved_str.starts_with(prefix.as_str()))
    {
        cand.pruned = true;
        return (Arc::new(cand), false);
    }

    graph.intern(cand)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::macho::fixtures::{ImageBuilder, fat};

    /// Write a dylib fixture named `name` under `dir`, declaring `deps`.
    fn lib(dir: &Path, name: &str, deps: &[&str]) -> PathBuf {
        let mut builder = ImageBuilder::new().identity(&format!("/opt/{name}"));
        for dep in deps {
            builder = builder.dylib(dep);
        }
        let path = dir.join(name);
        builder.write(&path);
        path
    }

    fn recursive_opts() -> DependencyOptions {
        DependencyOptions {
            recursive: true,
            jobs: 1,
            ..DependencyOptions::default()
        }
    }

    /// Canonicalised tempdir root, so declared paths match resolved ones.
    fn rooted_tempdir() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = std::fs::canonicalize(dir.path()).expect("canonicalize root");
        (dir, root)
    }

    #[test]
    fn basic_crawl_builds_sorted_children() {
        let (_dir, root) = rooted_tempdir();
        let libc = lib(&root, "libc.dylib", &[]);
        let libb = lib(&root, "libb.dylib", &[]);
        let liba = lib(
            &root,
            "liba.dylib",
            &[&libc.display().to_string(), &libb.display().to_string()],
        );

        let graph = deps_read(recursive_opts(), &[liba.clone()]).expect("crawl");
        assert_eq!(graph.top_deps.len(), 1);
        let top = &graph.top_deps[0];
        assert_eq!(top.name, "liba.dylib");
        assert!(top.info.contains("compatibility version"));

        let children = top.children();
        assert_eq!(children.len(), 2);
        // Sorted ascending by declared path.
        assert_eq!(children[0].path, libb.display().to_string());
        assert_eq!(children[1].path, libc.display().to_string());
        assert!(children.iter().all(|c| c.children().is_empty()));

        let flat = graph.flat_deps();
        assert_eq!(flat.len(), 2);
        assert!(flat.contains_key(&libb));
        assert!(flat.contains_key(&libc));
        for (path, node) in &flat {
            assert_eq!(node.real_path(), path);
        }
    }

    #[test]
    fn ignored_prefixes_prune_without_indexing() {
        let (_dir, root) = rooted_tempdir();
        let sys = root.join("sys");
        std::fs::create_dir(&sys).expect("mkdir");
        let system_lib = lib(&sys, "libSystem.B.dylib", &[]);
        let liba = lib(&root, "liba.dylib", &[&system_lib.display().to_string()]);

        let opts = DependencyOptions {
            ignored_prefixes: vec![sys.display().to_string()],
            ..recursive_opts()
        };
        let graph = deps_read(opts, &[liba]).expect("crawl");

        let children = graph.top_deps[0].children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "libSystem.B.dylib");
        assert!(children[0].pruned());
        assert!(!children[0].pruned_by_flat_deps());
        assert!(graph.flat_deps().is_empty());
    }

    #[test]
    fn ignored_files_prune_by_basename() {
        let (_dir, root) = rooted_tempdir();
        let libb = lib(&root, "libb.dylib", &[]);
        let liba = lib(&root, "liba.dylib", &[&libb.display().to_string()]);

        let opts = DependencyOptions {
            ignored_files: vec!["libb.dylib".to_string()],
            ..recursive_opts()
        };
        let graph = deps_read(opts, &[liba]).expect("crawl");

        let children = graph.top_deps[0].children();
        assert!(children[0].pruned());
        // Pruned before expansion, so the declared path stands in.
        assert!(children[0].resolved_path().is_none());
        assert!(graph.flat_deps().is_empty());
    }

    #[test]
    fn cycles_through_the_roots_are_broken() {
        let (_dir, root) = rooted_tempdir();
        // A and B reference each other.
        let libb_path = root.join("libb.dylib");
        let liba = lib(&root, "liba.dylib", &[&libb_path.display().to_string()]);
        lib(&root, "libb.dylib", &[&liba.display().to_string()]);

        let graph = deps_read(recursive_opts(), &[liba.clone()]).expect("crawl");
        let top = &graph.top_deps[0];
        let b = &top.children()[0];
        assert_eq!(b.name, "libb.dylib");
        assert!(!b.pruned());

        let back = &b.children()[0];
        assert_eq!(back.name, "liba.dylib");
        assert!(back.pruned());
        assert!(!back.pruned_by_flat_deps());
        assert_eq!(back.real_path(), liba.as_path());
        assert!(back.children().is_empty());

        let flat = graph.flat_deps();
        assert_eq!(flat.len(), 1);
        assert!(!flat.contains_key(&liba), "top-levels stay out of the index");
    }

    #[test]
    fn fat_slices_do_not_duplicate_children() {
        let (_dir, root) = rooted_tempdir();
        let libfoo = lib(&root, "libfoo.dylib", &[]);
        let slice = ImageBuilder::new()
            .dylib(&libfoo.display().to_string())
            .build();
        let universal = root.join("universal");
        std::fs::write(&universal, fat(&[slice.clone(), slice])).expect("write fat");

        let graph = deps_read(recursive_opts(), &[universal]).expect("crawl");
        assert_eq!(graph.top_deps[0].children().len(), 1);
    }

    #[test]
    fn weak_libraries_are_skipped_when_asked() {
        let (_dir, root) = rooted_tempdir();
        let libw = lib(&root, "libw.dylib", &[]);
        let liba_path = root.join("liba.dylib");
        ImageBuilder::new()
            .weak_dylib(&libw.display().to_string())
            .write(&liba_path);

        let opts = DependencyOptions {
            skip_weak_libs: true,
            ..recursive_opts()
        };
        let graph = deps_read(opts, &[liba_path.clone()]).expect("crawl");
        let child = &graph.top_deps[0].children()[0];
        assert!(child.is_weak);
        assert!(child.pruned());
        assert!(graph.flat_deps().is_empty());

        // Without the option the weak edge is descended normally.
        let graph = deps_read(recursive_opts(), &[liba_path]).expect("crawl");
        let child = &graph.top_deps[0].children()[0];
        assert!(child.is_weak);
        assert!(!child.pruned());
        assert_eq!(graph.flat_deps().len(), 1);
    }

    #[test]
    fn unresolvable_dependencies_are_flagged_not_fatal() {
        let (_dir, root) = rooted_tempdir();
        let missing = root.join("libmissing.dylib");
        let liba = lib(&root, "liba.dylib", &[&missing.display().to_string()]);

        let graph = deps_read(recursive_opts(), &[liba]).expect("crawl");
        let child = &graph.top_deps[0].children()[0];
        assert!(child.not_resolved());
        assert!(!child.pruned());
        assert!(child.resolved_path().is_none());
        assert!(graph.flat_deps().is_empty());
    }

    #[test]
    fn inputs_are_deduplicated_by_absolute_path() {
        let (_dir, root) = rooted_tempdir();
        let liba = lib(&root, "liba.dylib", &[]);

        let graph = deps_read(recursive_opts(), &[liba.clone(), liba]).expect("crawl");
        assert_eq!(graph.top_deps.len(), 1);
    }

    #[test]
    fn empty_input_list_is_rejected() {
        assert!(matches!(
            deps_read(recursive_opts(), &[]),
            Err(Error::NoInputs)
        ));
    }

    #[test]
    fn non_macho_inputs_are_rejected() {
        let (_dir, root) = rooted_tempdir();
        let text = root.join("notes.txt");
        std::fs::write(&text, b"plain text").expect("write");
        assert!(matches!(
            deps_read(recursive_opts(), &[text]),
            Err(Error::NotMachO(_))
        ));
    }

    #[test]
    fn missing_inputs_are_rejected() {
        let (_dir, root) = rooted_tempdir();
        assert!(matches!(
            deps_read(recursive_opts(), &[root.join("nope")]),
            Err(Error::ResolveFailed { .. })
        ));
    }

    #[test]
    fn shared_dependencies_share_one_node() {
        let (_dir, root) = rooted_tempdir();
        let libc = lib(&root, "libc.dylib", &[]);
        let liba = lib(&root, "liba.dylib", &[&libc.display().to_string()]);
        let libb = lib(&root, "libb.dylib", &[&libc.display().to_string()]);

        let graph = deps_read(recursive_opts(), &[liba, libb]).expect("crawl");
        let a_child = &graph.top_deps[0].children()[0];
        let b_child = &graph.top_deps[1].children()[0];
        assert!(Arc::ptr_eq(a_child, b_child));
        assert!(!b_child.pruned_by_flat_deps());
        assert_eq!(graph.flat_deps().len(), 1);
    }

    #[test]
    fn symlinked_references_are_rebound_onto_the_canonical_node() {
        let (_dir, root) = rooted_tempdir();
        let libc = lib(&root, "libc.dylib", &[]);
        let alias = root.join("alias.dylib");
        std::os::unix::fs::symlink(&libc, &alias).expect("symlink");
        let liba = lib(&root, "liba.dylib", &[&libc.display().to_string()]);
        let libb = lib(&root, "libb.dylib", &[&alias.display().to_string()]);

        let graph = deps_read(recursive_opts(), &[liba, libb]).expect("crawl");
        let canonical = &graph.top_deps[0].children()[0];
        let rebound = &graph.top_deps[1].children()[0];
        assert!(!Arc::ptr_eq(canonical, rebound));
        assert_eq!(rebound.path, alias.display().to_string());
        assert_eq!(rebound.real_path(), libc.as_path());
        assert!(rebound.pruned());
        assert!(rebound.pruned_by_flat_deps());

        let flat = graph.flat_deps();
        assert_eq!(flat.len(), 1);
        assert!(flat.contains_key(&libc));
    }

    #[test]
    fn non_recursive_crawls_stop_at_immediate_dependencies() {
        let (_dir, root) = rooted_tempdir();
        let libc = lib(&root, "libc.dylib", &[]);
        let libb = lib(&root, "libb.dylib", &[&libc.display().to_string()]);
        let liba = lib(&root, "liba.dylib", &[&libb.display().to_string()]);

        let opts = DependencyOptions {
            recursive: false,
            ..recursive_opts()
        };
        let graph = deps_read(opts, &[liba]).expect("crawl");
        let b = &graph.top_deps[0].children()[0];
        assert!(b.children().is_empty());

        let flat = graph.flat_deps();
        assert_eq!(flat.len(), 1);
        assert!(flat.contains_key(&libb));
        assert!(!flat.contains_key(&libc));
    }

    #[test]
    fn parallel_crawls_converge_on_one_canonical_node() {
        let (_dir, root) = rooted_tempdir();
        let libd = lib(&root, "libd.dylib", &[]);
        let libb = lib(&root, "libb.dylib", &[&libd.display().to_string()]);
        let libc = lib(&root, "libc.dylib", &[&libd.display().to_string()]);
        let liba = lib(
            &root,
            "liba.dylib",
            &[&libb.display().to_string(), &libc.display().to_string()],
        );

        let opts = DependencyOptions {
            jobs: 4,
            ..recursive_opts()
        };
        let graph = deps_read(opts, &[liba]).expect("crawl");

        let top = &graph.top_deps[0];
        let b = &top.children()[0];
        let c = &top.children()[1];
        assert!(Arc::ptr_eq(&b.children()[0], &c.children()[0]));
        assert_eq!(graph.flat_deps().len(), 3);
    }

    #[test]
    fn crawling_twice_yields_the_same_graph() {
        let (_dir, root) = rooted_tempdir();
        let libc = lib(&root, "libc.dylib", &[]);
        let libb = lib(&root, "libb.dylib", &[&libc.display().to_string()]);
        let liba = lib(
            &root,
            "liba.dylib",
            &[&libb.display().to_string(), &libc.display().to_string()],
        );

        let first = deps_read(recursive_opts(), &[liba.clone()]).expect("crawl");
        let second = deps_read(recursive_opts(), &[liba]).expect("crawl");

        let keys = |g: &DependencyGraph| {
            let mut keys: Vec<_> = g.flat_deps().keys().cloned().collect();
            keys.sort();
            keys
        };
        assert_eq!(keys(&first), keys(&second));

        let declared = |g: &DependencyGraph| {
            g.top_deps[0]
                .children()
                .iter()
                .map(|c| c.path.clone())
                .collect::<Vec<_>>()
        };
        assert_eq!(declared(&first), declared(&second));
    }
}
