//! Choosing the View(s) that own a file.
//!
//! When several Views see the same file, the one whose metadata most
//! faithfully owns it wins:
//!
//! 1. Views whose package graph references the file are candidates; if there
//!    are none, Views whose root contains the file are.
//! 2. A View whose root contains the file outranks one that only imports it.
//! 3. Among those, the View with the widest workspace package compiling the
//!    file wins.
//! 4. Remaining ties are ordered by View identifier.
//!
//! All Views tied at the top are "best"; the first of them is "the" best View.

use crate::metadata::MetadataGraph;
use crate::view::{View, ViewId};
use keel_files::uri;
use lsp_types::Url;
use std::sync::Arc;

/// One View as seen by the ranking.
pub(crate) struct Candidate<'a> {
    pub id: &'a ViewId,
    pub folder: &'a Url,
    pub graph: Option<&'a MetadataGraph>,
}

/// Indices of the best candidates for `file`, in identifier order.
pub(crate) fn rank(candidates: &[Candidate<'_>], file: &Url) -> Vec<usize> {
    let referencing: Vec<usize> = (0..candidates.len())
        .filter(|&i| candidates[i].graph.is_some_and(|g| g.references(file)))
        .collect();
    let pool = if referencing.is_empty() {
        (0..candidates.len())
            .filter(|&i| uri::is_within(candidates[i].folder, file))
            .collect()
    } else {
        referencing
    };

    let score = |i: usize| {
        let c = &candidates[i];
        let native = uri::is_within(c.folder, file);
        let width = c.graph.map_or(0, |g| {
            g.packages_for_file(file)
                .iter()
                .filter(|p| g.is_workspace_package(&p.id))
                .map(|p| p.compiled_files.len())
                .max()
                .unwrap_or(0)
        });
        (native, width)
    };

    let Some(top) = pool.iter().map(|&i| score(i)).max() else {
        return Vec::new();
    };
    let mut best: Vec<usize> = pool.into_iter().filter(|&i| score(i) == top).collect();
    best.sort_by_key(|&i| candidates[i].id);
    best
}

fn select(views: &[Arc<View>], graphs: &[Option<Arc<MetadataGraph>>], file: &Url) -> Vec<Arc<View>> {
    let candidates: Vec<Candidate<'_>> = views
        .iter()
        .zip(graphs)
        .map(|(view, graph)| Candidate {
            id: view.id(),
            folder: view.folder(),
            graph: graph.as_deref(),
        })
        .collect();
    rank(&candidates, file)
        .into_iter()
        .map(|i| views[i].clone())
        .collect()
}

/// Best Views for `file`, judged from the metadata each View has already
/// loaded. Never waits for a load.
#[must_use]
pub fn best_views(views: &[Arc<View>], file: &Url) -> Vec<Arc<View>> {
    let graphs: Vec<_> = views.iter().map(|v| v.current().loaded_graph()).collect();
    select(views, &graphs, file)
}

/// The single best View for `file`, loading metadata where it is missing.
///
/// A View whose load is cancelled is ranked without a graph.
pub async fn best_view_loading(views: &[Arc<View>], file: &Url) -> Option<Arc<View>> {
    let mut graphs = Vec::with_capacity(views.len());
    for view in views {
        graphs.push(view.current().metadata_graph().await.ok());
    }
    select(views, &graphs, file).into_iter().next()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{PackageId, PackageMetadata};

    fn url(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    fn graph(root: &str, packages: &[(&str, &[&str])]) -> MetadataGraph {
        MetadataGraph::build(
            &url(root),
            packages
                .iter()
                .map(|(id, files)| PackageMetadata {
                    id: PackageId::new(id),
                    name: (*id).to_string(),
                    pkg_path: (*id).to_string(),
                    compiled_files: files.iter().map(|f| url(f)).collect(),
                    ignored_files: Vec::new(),
                    deps: Vec::new(),
                    module_root: None,
                    for_test: false,
                })
                .collect(),
        )
    }

    #[test]
    fn native_view_beats_importer() {
        let (a, b) = (ViewId::new("a"), ViewId::new("b"));
        let (fa, fb) = (url("/lib/"), url("/app/"));
        let native = graph("/lib/", &[("lib", &["/lib/l.src"])]);
        let importer = graph("/app/", &[("app", &["/app/m.src"]), ("lib", &["/lib/l.src"])]);
        let candidates = [
            Candidate { id: &b, folder: &fb, graph: Some(&importer) },
            Candidate { id: &a, folder: &fa, graph: Some(&native) },
        ];
        assert_eq!(rank(&candidates, &url("/lib/l.src")), vec![1]);
    }

    #[test]
    fn widest_package_wins_then_ties_by_id() {
        let (a, b, c) = (ViewId::new("a"), ViewId::new("b"), ViewId::new("c"));
        let folder = url("/w/");
        let narrow = graph("/w/", &[("p", &["/w/x.src"])]);
        let wide = graph("/w/", &[("p.test", &["/w/x.src", "/w/x_test.src"])]);
        let candidates = [
            Candidate { id: &c, folder: &folder, graph: Some(&wide) },
            Candidate { id: &a, folder: &folder, graph: Some(&narrow) },
            Candidate { id: &b, folder: &folder, graph: Some(&wide) },
        ];
        assert_eq!(rank(&candidates, &url("/w/x.src")), vec![2, 0]);
    }

    #[test]
    fn unreferenced_files_fall_back_to_containing_roots() {
        let (a, b) = (ViewId::new("a"), ViewId::new("b"));
        let (fa, fb) = (url("/w/"), url("/other/"));
        let candidates = [
            Candidate { id: &a, folder: &fa, graph: None },
            Candidate { id: &b, folder: &fb, graph: None },
        ];
        assert_eq!(rank(&candidates, &url("/w/new.src")), vec![0]);
        assert!(rank(&candidates, &url("/elsewhere/x.src")).is_empty());
    }
}
