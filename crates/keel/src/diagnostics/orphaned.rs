//! Warnings for open files no build covers.

use super::{Diagnostic, DiagnosticMap};
use crate::best_view;
use crate::error::Result;
use crate::session::Session;
use keel_files::{uri, FileKind};
use lsp_types::{DiagnosticSeverity, Range, Url};
use std::collections::HashMap;

fn display_path(file: &Url) -> String {
    uri::to_path(file).map_or_else(|_| file.to_string(), |p| p.display().to_string())
}

fn warning(file: &Url, message: String) -> Diagnostic {
    Diagnostic::new(
        file.clone(),
        Range::default(),
        DiagnosticSeverity::WARNING,
        "keel",
        message,
    )
}

/// Diagnostics for open source files that no View builds, with the open
/// version of every open file.
///
/// A file outside every View is reported as such; a file inside a View that
/// no package compiles is reported unless the View ignores it or failed to
/// load (the load failure is reported instead).
///
/// # Errors
///
/// Returns `Error::Cancelled` if a View's metadata load is cancelled.
pub(crate) async fn orphaned_file_diagnostics(session: &Session) -> Result<(DiagnosticMap, HashMap<Url, i32>)> {
    let views = session.views();
    let mut diagnostics = DiagnosticMap::new();
    let mut versions = HashMap::new();

    for handle in session.store().overlays().await {
        let file = handle.uri();
        versions.insert(file.clone(), handle.version());
        if handle.kind() != FileKind::Source {
            continue;
        }

        let Some(view) = best_view::best_view_loading(&views, file).await else {
            let message = format!(
                "No active builds contain {}: consider opening a new workspace folder containing it",
                display_path(file)
            );
            diagnostics.insert(file.clone(), vec![warning(file, message)]);
            continue;
        };

        let Ok(snapshot) = view.snapshot() else {
            continue;
        };
        if snapshot.ignored_file(file) || snapshot.initialization_error().await?.is_some() {
            continue;
        }
        if snapshot.metadata_graph().await?.packages_for_file(file).is_empty() {
            let message = format!("No packages found for open file {}.", display_path(file));
            diagnostics.insert(file.clone(), vec![warning(file, message)]);
        }
    }
    Ok((diagnostics, versions))
}
