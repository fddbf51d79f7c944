//! Package metadata and the package dependency graph.
//!
//! Metadata is produced by the type checker's loader for one View at one
//! epoch. The graph is a DAG by construction: edges that would close a cycle
//! are dropped (and logged) when the graph is built, so traversals never need
//! a depth limit.

use keel_files::uri;
use lsp_types::Url;
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// Opaque package identifier, unique within one metadata graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageId(Arc<str>);

impl PackageId {
    /// Create a package identifier.
    #[must_use]
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PackageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// What the loader knows about one package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageMetadata {
    /// Identifier.
    pub id: PackageId,
    /// Declared package name.
    pub name: String,
    /// Import path. A package and its test variant share an import path.
    pub pkg_path: String,
    /// Files compiled into the package.
    pub compiled_files: Vec<Url>,
    /// Files in the package directory excluded by build constraints.
    pub ignored_files: Vec<Url>,
    /// Direct dependencies.
    pub deps: Vec<PackageId>,
    /// Root directory of the module the package belongs to.
    pub module_root: Option<Url>,
    /// True for the test variant of a package.
    pub for_test: bool,
}

impl PackageMetadata {
    /// Whether `uri` is one of the package's files.
    #[must_use]
    pub fn contains(&self, uri: &Url) -> bool {
        self.compiled_files.contains(uri) || self.ignored_files.contains(uri)
    }
}

/// The package graph of one View at one epoch.
#[derive(Debug, Default)]
pub struct MetadataGraph {
    packages: HashMap<PackageId, Arc<PackageMetadata>>,
    graph: DiGraph<PackageId, ()>,
    node_map: HashMap<PackageId, NodeIndex>,
    by_file: HashMap<Url, Vec<PackageId>>,
    workspace: BTreeSet<PackageId>,
}

impl MetadataGraph {
    /// Build the graph for a View rooted at `root`.
    ///
    /// Workspace packages are those with a compiled file inside `root`.
    /// Dependency edges to unknown packages are ignored; an edge that would
    /// create a cycle is dropped with a warning.
    #[must_use]
    pub fn build(root: &Url, packages: Vec<PackageMetadata>) -> Self {
        let mut this = Self::default();

        for package in packages {
            let id = package.id.clone();
            if this.packages.contains_key(&id) {
                warn!(package = %id, "Duplicate package metadata; keeping the first");
                continue;
            }
            let node = this.graph.add_node(id.clone());
            this.node_map.insert(id.clone(), node);

            for file in package.compiled_files.iter().chain(&package.ignored_files) {
                let owners = this.by_file.entry(file.clone()).or_default();
                if !owners.contains(&id) {
                    owners.push(id.clone());
                }
            }
            if package.compiled_files.iter().any(|f| uri::is_within(root, f)) {
                this.workspace.insert(id.clone());
            }
            this.packages.insert(id, Arc::new(package));
        }

        let mut ids: Vec<&PackageId> = this.packages.keys().collect();
        ids.sort();
        for id in ids {
            let from = this.node_map[id];
            for dep in &this.packages[id].deps {
                let Some(&to) = this.node_map.get(dep) else {
                    continue;
                };
                // An existing path dep -> id means id -> dep closes a cycle.
                if from == to || algo::has_path_connecting(&this.graph, to, from, None) {
                    warn!(package = %id, dep = %dep, "Dropping import cycle edge");
                    continue;
                }
                this.graph.update_edge(from, to, ());
            }
        }

        this
    }

    /// Metadata for one package.
    #[must_use]
    pub fn metadata(&self, id: &PackageId) -> Option<&Arc<PackageMetadata>> {
        self.packages.get(id)
    }

    /// All packages, ordered by identifier.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<PackageMetadata>> {
        let mut all: Vec<_> = self.packages.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Workspace packages, ordered by identifier.
    #[must_use]
    pub fn workspace_packages(&self) -> Vec<Arc<PackageMetadata>> {
        self.workspace
            .iter()
            .filter_map(|id| self.packages.get(id).cloned())
            .collect()
    }

    /// Whether `id` is a workspace package.
    #[must_use]
    pub fn is_workspace_package(&self, id: &PackageId) -> bool {
        self.workspace.contains(id)
    }

    /// Packages that compile `uri`, narrowest (fewest compiled files) first.
    #[must_use]
    pub fn packages_for_file(&self, uri: &Url) -> Vec<Arc<PackageMetadata>> {
        let mut packages: Vec<_> = self
            .by_file
            .get(uri)
            .into_iter()
            .flatten()
            .filter_map(|id| self.packages.get(id))
            .filter(|p| p.compiled_files.contains(uri))
            .cloned()
            .collect();
        packages.sort_by(|a, b| {
            a.compiled_files
                .len()
                .cmp(&b.compiled_files.len())
                .then_with(|| a.id.cmp(&b.id))
        });
        packages
    }

    /// Whether any package lists `uri`, compiled or ignored.
    #[must_use]
    pub fn references(&self, uri: &Url) -> bool {
        self.by_file.contains_key(uri)
    }

    /// Every file any package lists.
    pub fn files(&self) -> impl Iterator<Item = &Url> {
        self.by_file.keys()
    }

    /// Roots of every module that contributes packages, sorted.
    #[must_use]
    pub fn module_roots(&self) -> Vec<Url> {
        let roots: BTreeSet<&Url> = self
            .packages
            .values()
            .filter_map(|p| p.module_root.as_ref())
            .collect();
        roots.into_iter().cloned().collect()
    }

    /// `ids` plus every package depending on them, directly or transitively.
    #[must_use]
    pub fn reverse_transitive(&self, ids: &[PackageId]) -> BTreeSet<PackageId> {
        self.walk(ids, Direction::Incoming)
    }

    /// `ids` plus every package they depend on, directly or transitively.
    #[must_use]
    pub fn transitive_deps(&self, ids: &[PackageId]) -> BTreeSet<PackageId> {
        self.walk(ids, Direction::Outgoing)
    }

    fn walk(&self, ids: &[PackageId], direction: Direction) -> BTreeSet<PackageId> {
        let mut seen = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = VecDeque::new();
        for id in ids {
            if let Some(&node) = self.node_map.get(id) {
                if seen.insert(node) {
                    queue.push_back(node);
                }
            }
        }
        while let Some(node) = queue.pop_front() {
            for edge in self.graph.edges_directed(node, direction) {
                let next = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen.into_iter().map(|n| self.graph[n].clone()).collect()
    }

    /// Number of packages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packages.len()
    }

    /// Whether the graph has no packages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn package(id: &str, files: &[&str], deps: &[&str]) -> PackageMetadata {
        PackageMetadata {
            id: PackageId::new(id),
            name: id.to_string(),
            pkg_path: id.trim_end_matches(".test").to_string(),
            compiled_files: files.iter().map(|f| url(f)).collect(),
            ignored_files: Vec::new(),
            deps: deps.iter().map(|d| PackageId::new(d)).collect(),
            module_root: None,
            for_test: id.ends_with(".test"),
        }
    }

    fn graph() -> MetadataGraph {
        MetadataGraph::build(
            &url("/work/"),
            vec![
                package("app", &["/work/app/main.src"], &["lib"]),
                package("app.test", &["/work/app/main.src", "/work/app/main_test.src"], &["lib"]),
                package("lib", &["/work/lib/lib.src"], &["std"]),
                package("std", &["/toolchain/std/std.src"], &[]),
            ],
        )
    }

    #[test]
    fn workspace_packages_are_inside_the_root() {
        let ids: Vec<_> = graph()
            .workspace_packages()
            .into_iter()
            .map(|p| p.id.to_string())
            .collect();
        assert_eq!(ids, vec!["app", "app.test", "lib"]);
    }

    #[test]
    fn narrowest_package_comes_first() {
        let packages = graph().packages_for_file(&url("/work/app/main.src"));
        assert_eq!(packages[0].id.as_str(), "app");
        assert_eq!(packages[1].id.as_str(), "app.test");
    }

    #[test]
    fn reverse_transitive_follows_importers() {
        let rdeps = graph().reverse_transitive(&[PackageId::new("std")]);
        let names: Vec<_> = rdeps.iter().map(PackageId::as_str).collect();
        assert_eq!(names, vec!["app", "app.test", "lib", "std"]);
    }

    #[test]
    fn transitive_deps_follow_imports() {
        let deps = graph().transitive_deps(&[PackageId::new("app")]);
        assert_eq!(deps.len(), 3);
        assert!(deps.contains(&PackageId::new("std")));
    }

    #[test]
    fn cycles_are_broken_at_build_time() {
        let graph = MetadataGraph::build(
            &url("/work/"),
            vec![
                package("a", &["/work/a.src"], &["b"]),
                package("b", &["/work/b.src"], &["a"]),
            ],
        );
        // Exactly one of the two edges survives.
        let from_a = graph.transitive_deps(&[PackageId::new("a")]);
        let from_b = graph.transitive_deps(&[PackageId::new("b")]);
        assert_eq!(from_a.len() + from_b.len(), 3);
    }

    #[test]
    fn unknown_files_are_not_referenced() {
        let graph = graph();
        assert!(graph.references(&url("/work/lib/lib.src")));
        assert!(!graph.references(&url("/work/other.src")));
        assert!(graph.packages_for_file(&url("/work/other.src")).is_empty());
    }
}
