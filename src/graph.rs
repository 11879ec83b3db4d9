//! The dependency graph data model.
//!
//! Nodes are reference counted and keyed by their canonical filesystem path:
//! when the same library is reached through several referencing sites, every
//! site points at the same node, and a site that used a different declared
//! path gets a thin re-bound node that shares the canonical child sequence.
//! Reverse edges are not stored; callers derive them from the flat index.

use std::collections::{HashMap, HashSet, hash_map::Entry};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;

/// Shared handle to a node's ordered child sequence.
type Children = Arc<Mutex<Vec<Arc<Dependency>>>>;

/// One library referenced somewhere in the graph.
pub struct Dependency {
    /// Basename of the declared install-name path.
    pub name: String,
    /// The path literally recorded in the referencing load command.
    pub path: String,
    /// Compatibility/current-version rendering from the load command.
    pub info: String,
    /// Whether this node was discovered through a weak-dylib command.
    pub is_weak: bool,
    pub(crate) real_path: Option<PathBuf>,
    pub(crate) pruned: bool,
    pub(crate) pruned_by_flat_deps: bool,
    pub(crate) not_resolved: AtomicBool,
    pub(crate) children: Children,
}

impl std::fmt::Debug for Dependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Children are omitted: nodes in a dependency cycle reference each
        // other, which would recurse forever.
        f.debug_struct("Dependency")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("real_path", &self.real_path)
            .field("is_weak", &self.is_weak)
            .field("pruned", &self.pruned)
            .field("pruned_by_flat_deps", &self.pruned_by_flat_deps)
            .field("not_resolved", &self.not_resolved)
            .finish_non_exhaustive()
    }
}

impl Dependency {
    pub(crate) fn new(
        name: String,
        path: String,
        real_path: Option<PathBuf>,
        info: String,
        is_weak: bool,
    ) -> Dependency {
        Dependency {
            name,
            path,
            info,
            is_weak,
            real_path,
            pruned: false,
            pruned_by_flat_deps: false,
            not_resolved: AtomicBool::new(false),
            children: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Re-bind this node onto an already canonicalised one: keep the declared
    /// path of this referencing site, share the canonical child sequence.
    pub(crate) fn rebind_to(mut self, canonical: &Dependency) -> Dependency {
        self.pruned = true;
        self.pruned_by_flat_deps = true;
        self.children = Arc::clone(&canonical.children);
        self
    }

    /// The resolved filesystem path, falling back to the declared path when
    /// no resolution happened.
    pub fn real_path(&self) -> &Path {
        self.real_path
            .as_deref()
            .unwrap_or_else(|| Path::new(&self.path))
    }

    /// The resolved filesystem path, if resolution succeeded.
    pub fn resolved_path(&self) -> Option<&Path> {
        self.real_path.as_deref()
    }

    /// Whether this node's outbound edges were deliberately not expanded.
    pub fn pruned(&self) -> bool {
        self.pruned
    }

    /// Whether pruning happened because another occurrence had already been
    /// canonicalised into the flat index.
    pub fn pruned_by_flat_deps(&self) -> bool {
        self.pruned_by_flat_deps
    }

    /// Whether the declared path could not be resolved, or the file could
    /// not be inspected.
    pub fn not_resolved(&self) -> bool {
        self.not_resolved.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_not_resolved(&self) {
        self.not_resolved.store(true, Ordering::Relaxed);
    }

    /// Snapshot of the ordered child sequence.
    pub fn children(&self) -> Vec<Arc<Dependency>> {
        self.children.lock().unwrap().clone()
    }

    pub(crate) fn push_child(&self, child: Arc<Dependency>) {
        self.children.lock().unwrap().push(child);
    }

    pub(crate) fn sort_children(&self) {
        self.children
            .lock()
            .unwrap()
            .sort_by(|a, b| a.path.cmp(&b.path));
    }
}

/// The dependency graph for a collection of input files.
#[derive(Debug)]
pub struct DependencyGraph {
    /// One node per distinct input file, in caller-supplied order.
    pub top_deps: Vec<Arc<Dependency>>,
    /// Canonical node per resolved path. Top-level nodes are not included.
    flat_deps: Mutex<HashMap<PathBuf, Arc<Dependency>>>,
}

impl DependencyGraph {
    pub(crate) fn new(top_deps: Vec<Arc<Dependency>>) -> DependencyGraph {
        DependencyGraph {
            top_deps,
            flat_deps: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot of the flat index.
    pub fn flat_deps(&self) -> HashMap<PathBuf, Arc<Dependency>> {
        self.flat_deps.lock().unwrap().clone()
    }

    /// Whether a path names one of the input files, by declared or resolved
    /// path. Used to break dependency cycles through the roots.
    pub(crate) fn is_toplevel_path(&self, path: &Path) -> bool {
        self.top_deps
            .iter()
            .any(|top| Path::new(&top.path) == path || top.real_path() == path)
    }

    /// The input file with the given basename, if any. Edges to such
    /// libraries are handled by the top-level fix-up rather than collection.
    pub(crate) fn toplevel_by_name(&self, name: &str) -> Option<Arc<Dependency>> {
        self.top_deps
            .iter()
            .find(|top| top.name == name)
            .map(Arc::clone)
    }

    /// Check-and-insert a resolved candidate into the flat index.
    ///
    /// Returns the canonical node for the candidate's resolved path along
    /// with whether the caller should descend into it. A first occurrence is
    /// inserted and descended. A later occurrence with the same declared
    /// path reuses the canonical node unchanged; one with a different
    /// declared path gets a re-bound node sharing the canonical children.
    pub(crate) fn intern(&self, cand: Dependency) -> (Arc<Dependency>, bool) {
        let real = match cand.resolved_path() {
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(&cand.path),
        };

        let mut flat = self.flat_deps.lock().unwrap();
        match flat.entry(real) {
            Entry::Vacant(slot) => {
                let node = Arc::new(cand);
                slot.insert(Arc::clone(&node));
                (node, true)
            }
            Entry::Occupied(slot) => {
                let existing = Arc::clone(slot.get());
                drop(flat);
                if existing.path == cand.path {
                    (existing, false)
                } else {
                    (Arc::new(cand.rebind_to(&existing)), false)
                }
            }
        }
    }

    /// Tree projection suitable for JSON emission. Any subtree whose
    /// resolved path was already emitted is replaced by a leaf flagged
    /// `pruned_by_flat_deps`, so shared subtrees cannot blow up the output.
    pub fn to_serializable(&self) -> Vec<SerializableDependency> {
        let mut seen = HashSet::new();
        self.top_deps
            .iter()
            .map(|top| project(top, &mut seen))
            .collect()
    }
}

/// JSON-amenable copy of a [`Dependency`] subtree.
#[derive(Debug, Serialize)]
pub struct SerializableDependency {
    pub name: String,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub real_path: Option<String>,
    pub info: String,
    pub is_weak: bool,
    pub pruned: bool,
    pub pruned_by_flat_deps: bool,
    pub not_resolved: bool,
    pub children: Vec<SerializableDependency>,
}

fn project(dep: &Dependency, seen: &mut HashSet<PathBuf>) -> SerializableDependency {
    let first = seen.insert(dep.real_path().to_path_buf());
    let children = if first {
        dep.children().iter().map(|c| project(c, seen)).collect()
    } else {
        Vec::new()
    };

    SerializableDependency {
        name: dep.name.clone(),
        path: dep.path.clone(),
        real_path: dep.resolved_path().map(|p| p.display().to_string()),
        info: dep.info.clone(),
        is_weak: dep.is_weak,
        pruned: dep.pruned(),
        pruned_by_flat_deps: dep.pruned_by_flat_deps() || !first,
        not_resolved: dep.not_resolved(),
        children,
    }
}
