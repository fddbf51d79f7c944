//! What a diagnosis pass computes for one snapshot.

use super::{range_key, Diagnostic, DiagnosticMap};
use crate::checker::PackageDiagnostics;
use crate::error::Result;
use crate::metadata::{MetadataGraph, PackageId, PackageMetadata};
use crate::progress::WorkHandle;
use crate::snapshot::Snapshot;
use keel_files::{uri, FileKind};
use lsp_types::{DiagnosticSeverity, Range, Url};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Type-check results as a map covering every compiled file of the checked
/// packages, so files whose last error was fixed get an empty list.
fn package_map(graph: &MetadataGraph, results: Vec<PackageDiagnostics>) -> DiagnosticMap {
    let mut map = DiagnosticMap::new();
    for result in results {
        if let Some(package) = graph.metadata(&result.id) {
            for file in &package.compiled_files {
                map.entry(file.clone()).or_default();
            }
        }
        for d in result.diagnostics {
            map.entry(d.uri.clone()).or_default().push(d);
        }
    }
    map
}

fn analysis_map(results: Vec<PackageDiagnostics>) -> DiagnosticMap {
    let mut map = DiagnosticMap::new();
    for d in results.into_iter().flat_map(|r| r.diagnostics) {
        map.entry(d.uri.clone()).or_default().push(d);
    }
    map
}

/// Fast phase: type-check the narrowest workspace package of each changed
/// file that is open, of source kind, and neither builtin nor ignored.
pub(crate) async fn diagnose_changed_files(
    snapshot: &Snapshot,
    changed: &[Url],
    cancel: &CancellationToken,
) -> Result<DiagnosticMap> {
    let mut ids = BTreeSet::new();
    for file in changed {
        let Some(handle) = snapshot.find_file(file) else {
            continue;
        };
        if !handle.is_overlay()
            || snapshot.file_kind(&handle) != FileKind::Source
            || snapshot.is_builtin(file)
            || snapshot.ignored_file(file)
        {
            continue;
        }
        if let Some(package) = snapshot.narrowest_workspace_package(file).await? {
            ids.insert(package.id.clone());
        }
    }
    if ids.is_empty() {
        return Ok(DiagnosticMap::new());
    }

    let ids: Vec<PackageId> = ids.into_iter().collect();
    debug!(labels = %snapshot.labels(), packages = ids.len(), "Diagnosing changed packages");
    let graph = snapshot.metadata_graph().await?;
    let results = snapshot.type_check(&ids, cancel).await?;
    Ok(package_map(&graph, results))
}

/// Merge analyzer findings into type-check findings.
///
/// An analyzer diagnostic with the same range and message as a type-check
/// diagnostic is folded into it: its fixes and tags are added to the
/// type-check diagnostic and it is dropped. Everything else is kept.
fn combine(type_checked: DiagnosticMap, analyzed: DiagnosticMap) -> DiagnosticMap {
    let mut out = type_checked;
    for (file, findings) in analyzed {
        let merged = out.entry(file).or_default();
        let checked = merged.len();
        for finding in findings {
            let twin = merged[..checked].iter_mut().find(|d| {
                range_key(&d.range) == range_key(&finding.range) && d.message == finding.message
            });
            match twin {
                Some(d) => {
                    d.fixes.extend(finding.fixes);
                    for tag in finding.tags {
                        if !d.tags.contains(&tag) {
                            d.tags.push(tag);
                        }
                    }
                }
                None => merged.push(finding),
            }
        }
    }
    out
}

/// Workspace packages with at least one non-ignored compiled file.
fn packages_to_diagnose(snapshot: &Snapshot, graph: &MetadataGraph) -> Vec<PackageId> {
    graph
        .workspace_packages()
        .into_iter()
        .filter(|p| p.compiled_files.iter().any(|f| !snapshot.ignored_file(f)))
        .map(|p| p.id.clone())
        .collect()
}

/// For every open source file, the workspace packages compiling it; of
/// packages sharing an import path only the one with most files is kept.
fn packages_to_analyze(snapshot: &Snapshot, graph: &MetadataGraph) -> Vec<PackageId> {
    let mut widest: BTreeMap<String, Arc<PackageMetadata>> = BTreeMap::new();
    for handle in snapshot.overlays() {
        if snapshot.file_kind(&handle) != FileKind::Source || snapshot.ignored_file(handle.uri()) {
            continue;
        }
        for package in graph.packages_for_file(handle.uri()) {
            if !graph.is_workspace_package(&package.id) {
                continue;
            }
            let wider = widest.get(&package.pkg_path).is_none_or(|current| {
                (package.compiled_files.len(), Reverse(&package.id))
                    > (current.compiled_files.len(), Reverse(&current.id))
            });
            if wider {
                widest.insert(package.pkg_path.clone(), package);
            }
        }
    }
    widest.into_values().map(|p| p.id.clone()).collect()
}

/// Workspace packages in directories opted into optimization details.
fn packages_with_details(snapshot: &Snapshot, graph: &MetadataGraph) -> Vec<PackageId> {
    let dirs: BTreeSet<&str> = snapshot
        .options()
        .optimization_details
        .iter()
        .map(|d| d.trim_matches('/'))
        .collect();
    if dirs.is_empty() {
        return Vec::new();
    }
    graph
        .workspace_packages()
        .into_iter()
        .filter(|p| {
            p.compiled_files.iter().any(|f| {
                uri::relative_segments(snapshot.folder(), f).is_some_and(|segments| {
                    let dir = segments.split_last().map_or(String::new(), |(_, d)| d.join("/"));
                    dirs.contains(dir.as_str())
                })
            })
        })
        .map(|p| p.id.clone())
        .collect()
}

/// Run `producer` only if `enabled`.
async fn optional(enabled: bool, producer: impl Future<Output = Result<DiagnosticMap>>) -> Result<DiagnosticMap> {
    if enabled {
        producer.await
    } else {
        Ok(DiagnosticMap::new())
    }
}

/// Full phase: every producer for the whole View, run concurrently.
///
/// A failing producer is logged and contributes nothing; cancellation of any
/// producer aborts the pass.
pub(crate) async fn diagnose_snapshot_full(
    snapshot: &Snapshot,
    progress: Option<&WorkHandle>,
    cancel: &CancellationToken,
) -> Result<DiagnosticMap> {
    let outcome = snapshot.load().await?;
    let graph = outcome.graph.clone();
    let checker = snapshot.checker();
    let options = snapshot.options();

    let collected = Mutex::new(DiagnosticMap::new());
    let absorb = |bucket: &'static str, result: Result<DiagnosticMap>| -> Result<()> {
        match result {
            Ok(map) => {
                let mut collected = collected.lock().unwrap_or_else(PoisonError::into_inner);
                for (file, diagnostics) in map {
                    collected.entry(file).or_default().extend(diagnostics);
                }
                Ok(())
            }
            Err(e) if e.is_cancellation() => Err(e),
            Err(e) => {
                warn!(labels = %snapshot.labels(), bucket, error = %e, "Diagnostics producer failed");
                Ok(())
            }
        }
    };

    if let Some(error) = &outcome.error {
        if let Some(manifest) = &error.uri {
            let d = Diagnostic::new(
                manifest.clone(),
                Range::default(),
                DiagnosticSeverity::ERROR,
                "keel",
                format!("Error loading workspace: {}", error.message),
            );
            absorb("initialization", Ok(DiagnosticMap::from([(manifest.clone(), vec![d])])))?;
        }
    }

    let to_diagnose = packages_to_diagnose(snapshot, &graph);
    let to_analyze = packages_to_analyze(snapshot, &graph);
    let with_details = packages_with_details(snapshot, &graph);
    debug!(
        labels = %snapshot.labels(),
        diagnose = to_diagnose.len(),
        analyze = to_analyze.len(),
        "Diagnosing snapshot"
    );

    let (workspace, module, upgrades, vulns, templates, tidy, details, checked, analyzed) = futures::join!(
        checker.workspace_manifest_diagnostics(snapshot, cancel),
        checker.module_manifest_diagnostics(snapshot, cancel),
        optional(options.check_upgrades, checker.upgrade_diagnostics(snapshot, cancel)),
        optional(options.vulncheck, checker.vulnerability_diagnostics(snapshot, cancel)),
        checker.template_diagnostics(snapshot, cancel),
        checker.tidy_diagnostics(snapshot, cancel),
        optional(!with_details.is_empty(), checker.optimization_diagnostics(snapshot, &with_details, cancel)),
        snapshot.type_check(&to_diagnose, cancel),
        snapshot.analyze(&to_analyze, progress, cancel),
    );

    absorb("workspace manifest", workspace)?;
    absorb("module manifest", module)?;
    absorb("upgrades", upgrades)?;
    absorb("vulnerabilities", vulns)?;
    absorb("templates", templates)?;
    absorb("tidy", tidy)?;
    let details = details.map(|map| {
        map.into_iter()
            .filter(|(file, _)| snapshot.find_file(file).is_none_or(|h| !h.is_overlay() || h.is_saved()))
            .collect()
    });
    absorb("optimization details", details)?;

    let checked = match checked {
        Ok(results) => package_map(&graph, results),
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) => {
            warn!(labels = %snapshot.labels(), error = %e, "Type checking failed");
            DiagnosticMap::new()
        }
    };
    let analyzed = match analyzed {
        Ok(results) => analysis_map(results),
        Err(e) if e.is_cancellation() => return Err(e),
        Err(e) => {
            warn!(labels = %snapshot.labels(), error = %e, "Analysis failed");
            DiagnosticMap::new()
        }
    };
    absorb("packages", Ok(combine(checked, analyzed)))?;

    Ok(collected.into_inner().unwrap_or_else(PoisonError::into_inner))
}
