//! A structural checker for keel sources.
//!
//! [`SourceChecker`] is what the `keel-lsp` binary runs when no richer back
//! end is plugged in. It treats every directory holding source files as one
//! package, reads package clauses and imports to build the package graph,
//! and reports structural problems:
//!
//! - a file without a `package` clause
//! - a package clause that disagrees with the rest of its directory
//! - an `import` naming no package of the workspace
//! - unbalanced braces
//!
//! The `unusedimports` analyzer flags imports whose name is never referenced
//! and bundles a fix deleting the line.

use async_trait::async_trait;
use keel::checker::{PackageDiagnostics, TypeChecker};
use keel::diagnostics::BundledFix;
use keel::metadata::{PackageId, PackageMetadata};
use keel::progress::WorkHandle;
use keel::{Diagnostic, Error, Result, Snapshot};
use keel_files::{uri, FileHandle, FileKind};
use lsp_types::{DiagnosticSeverity, DiagnosticTag, Position, Range, TextEdit, Url};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Analyzer name of the unused-import check.
pub const UNUSED_IMPORTS: &str = "unusedimports";

/// Directory-per-package checker reading package clauses and imports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SourceChecker;

/// The declarations of one file that decide package structure.
#[derive(Debug, Default, PartialEq, Eq)]
struct Header {
    /// Package clause name and its line.
    package: Option<(String, u32)>,
    /// Imported paths with their lines.
    imports: Vec<(String, u32)>,
}

fn parse_header(text: &str) -> Header {
    let mut header = Header::default();
    for (line, content) in text.lines().enumerate() {
        let line = u32::try_from(line).unwrap_or(u32::MAX);
        let content = content.trim();
        if let Some(name) = content.strip_prefix("package ") {
            if header.package.is_none() {
                header.package = Some((name.trim().to_string(), line));
            }
        } else if let Some(path) = content.strip_prefix("import ") {
            let path = path.trim().trim_matches('"');
            if !path.is_empty() {
                header.imports.push((path.to_string(), line));
            }
        }
    }
    header
}

fn whole_line(text: &str, line: u32) -> Range {
    let width = text
        .lines()
        .nth(line as usize)
        .map_or(0, |l| u32::try_from(l.encode_utf16().count()).unwrap_or(u32::MAX));
    Range::new(Position::new(line, 0), Position::new(line, width))
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}

fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.')
        || name.starts_with('_')
        || matches!(name, "testdata" | "target" | "node_modules")
}

/// Recursively collect files under `dir`. Unreadable directories are logged
/// and skipped.
fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            warn!(directory = %dir.display(), error = %e, "Cannot read directory, skipping");
            return;
        }
    };
    for entry in entries {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(directory = %dir.display(), error = %e, "Failed to read directory entry, skipping");
                continue;
            }
        };
        let path = entry.path();
        if path.is_dir() {
            let skipped = path.file_name().and_then(|n| n.to_str()).is_some_and(is_skipped_dir);
            if !skipped {
                walk_dir(&path, files);
            }
        } else if path.is_file() {
            files.push(path);
        }
    }
}

/// Source files of the snapshot's View grouped by directory: files on disk
/// plus open files, which may not have been saved yet.
async fn source_files(snapshot: &Snapshot) -> Result<BTreeMap<Url, BTreeSet<Url>>> {
    let rules = snapshot.definition().kind_rules.clone();
    let root = uri::to_path(snapshot.folder())?;
    let on_disk = tokio::task::spawn_blocking(move || {
        let mut files = Vec::new();
        walk_dir(&root, &mut files);
        files
    })
    .await
    .map_err(|e| Error::Internal(format!("directory walk failed: {e}")))?;

    let mut by_dir: BTreeMap<Url, BTreeSet<Url>> = BTreeMap::new();
    let disk = on_disk.iter().filter_map(|p| uri::from_path(p).ok());
    let open = snapshot.overlays().into_iter().map(|h| h.uri().clone());
    for file in disk.chain(open) {
        if rules.classify(&file) != FileKind::Source
            || !uri::is_within(snapshot.folder(), &file)
            || snapshot.ignored_file(&file)
        {
            continue;
        }
        if let Some(dir) = uri::parent_dir(&file) {
            by_dir.entry(dir).or_default().insert(file);
        }
    }
    Ok(by_dir)
}

/// Workspace-relative import path of a directory; `.` for the root.
fn import_path(root: &Url, dir: &Url) -> String {
    let path = uri::relative_segments(root, dir)
        .map(|segments| {
            segments
                .into_iter()
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join("/")
        })
        .unwrap_or_default();
    if path.is_empty() { ".".to_string() } else { path }
}

impl SourceChecker {
    /// A checker with every analyzer at its default.
    #[must_use]
    pub fn new() -> Self {
        Self
    }

    async fn read(snapshot: &Snapshot, file: &Url) -> Option<String> {
        match snapshot.read_file(file).await {
            Ok(handle) => handle.text().ok().map(str::to_string),
            Err(e) => {
                debug!(uri = %file, error = %e, "Skipping unreadable file");
                None
            }
        }
    }

    fn check_file(file: &Url, text: &str, expected: &str, known: &BTreeSet<String>) -> Vec<Diagnostic> {
        let error = |range: Range, message: String| {
            Diagnostic::new(file.clone(), range, DiagnosticSeverity::ERROR, "compiler", message)
        };
        let mut out = Vec::new();
        let header = parse_header(text);

        match &header.package {
            None => out.push(error(whole_line(text, 0), "missing package clause".to_string())),
            Some((name, line)) if name != expected => {
                out.push(error(whole_line(text, *line), format!("package {name}; expected {expected}")));
            }
            Some(_) => {}
        }
        for (path, line) in &header.imports {
            if !known.contains(path) {
                out.push(error(
                    whole_line(text, *line),
                    format!("could not import \"{path}\" (no package in workspace)"),
                ));
            }
        }

        let mut depth = 0i64;
        for (line, content) in text.lines().enumerate() {
            for c in content.chars() {
                match c {
                    '{' => depth += 1,
                    '}' => depth -= 1,
                    _ => {}
                }
            }
            if depth < 0 {
                let line = u32::try_from(line).unwrap_or(u32::MAX);
                out.push(error(whole_line(text, line), "unexpected }".to_string()));
                depth = 0;
            }
        }
        if depth > 0 {
            let last = u32::try_from(text.lines().count().saturating_sub(1)).unwrap_or(u32::MAX);
            out.push(error(whole_line(text, last), "expected }".to_string()));
        }
        out
    }

    fn unused_imports(file: &Url, text: &str) -> Vec<Diagnostic> {
        let header = parse_header(text);
        let mut out = Vec::new();
        for (path, line) in &header.imports {
            let name = path.rsplit('/').next().unwrap_or(path);
            let qualifier = format!("{name}.");
            let used = text
                .lines()
                .enumerate()
                .any(|(i, l)| i != *line as usize && l.contains(&qualifier));
            if used {
                continue;
            }
            let range = whole_line(text, *line);
            let deletion = Range::new(Position::new(*line, 0), Position::new(line + 1, 0));
            let mut d = Diagnostic::new(
                file.clone(),
                range,
                DiagnosticSeverity::WARNING,
                UNUSED_IMPORTS,
                format!("\"{path}\" imported and not used"),
            );
            d.tags.push(DiagnosticTag::UNNECESSARY);
            d.fixes.push(BundledFix {
                title: format!("Remove import \"{path}\""),
                edits: BTreeMap::from([(file.clone(), vec![TextEdit::new(deletion, String::new())])]),
            });
            out.push(d);
        }
        out
    }
}

#[async_trait]
impl TypeChecker for SourceChecker {
    async fn load_metadata(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> Result<Vec<PackageMetadata>> {
        let root = snapshot.folder().clone();
        let by_dir = source_files(snapshot).await?;

        let mut packages = Vec::with_capacity(by_dir.len());
        let mut imports: Vec<BTreeSet<String>> = Vec::with_capacity(by_dir.len());
        for (dir, files) in by_dir {
            check_cancelled(cancel)?;
            let path = import_path(&root, &dir);
            let mut name = None;
            let mut imported = BTreeSet::new();
            for file in &files {
                let Some(text) = Self::read(snapshot, file).await else {
                    continue;
                };
                let header = parse_header(&text);
                if name.is_none() {
                    name = header.package.map(|(n, _)| n);
                }
                imported.extend(header.imports.into_iter().map(|(p, _)| p));
            }
            let fallback = path.rsplit('/').next().unwrap_or(&path).to_string();
            packages.push(PackageMetadata {
                id: PackageId::new(&path),
                name: name.unwrap_or(fallback),
                pkg_path: path,
                compiled_files: files.into_iter().collect(),
                ignored_files: Vec::new(),
                deps: Vec::new(),
                module_root: Some(root.clone()),
                for_test: false,
            });
            imports.push(imported);
        }

        let known: BTreeSet<String> = packages.iter().map(|p| p.pkg_path.clone()).collect();
        for (package, imported) in packages.iter_mut().zip(imports) {
            package.deps = imported
                .into_iter()
                .filter(|p| known.contains(p))
                .map(|p| PackageId::new(&p))
                .collect();
        }
        debug!(labels = %snapshot.labels(), packages = packages.len(), "Loaded packages");
        Ok(packages)
    }

    async fn type_check(
        &self,
        snapshot: &Snapshot,
        ids: &[PackageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>> {
        let graph = snapshot.metadata_graph().await?;
        let known: BTreeSet<String> = graph.all().iter().map(|p| p.pkg_path.clone()).collect();

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            check_cancelled(cancel)?;
            let Some(package) = graph.metadata(id) else {
                continue;
            };
            let mut diagnostics = Vec::new();
            for file in &package.compiled_files {
                if let Some(text) = Self::read(snapshot, file).await {
                    diagnostics.extend(Self::check_file(file, &text, &package.name, &known));
                }
            }
            out.push(PackageDiagnostics {
                id: id.clone(),
                diagnostics,
            });
        }
        Ok(out)
    }

    async fn analyze(
        &self,
        snapshot: &Snapshot,
        ids: &[PackageId],
        progress: Option<&WorkHandle>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>> {
        let enabled = snapshot.options().analyses.get(UNUSED_IMPORTS).copied().unwrap_or(true);
        if !enabled || ids.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(progress) = progress {
            progress.report(format!("analyzing {} packages", ids.len()), None).await;
        }

        let graph = snapshot.metadata_graph().await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            check_cancelled(cancel)?;
            let Some(package) = graph.metadata(id) else {
                continue;
            };
            let mut diagnostics = Vec::new();
            for file in &package.compiled_files {
                if let Some(text) = Self::read(snapshot, file).await {
                    diagnostics.extend(Self::unused_imports(file, &text));
                }
            }
            out.push(PackageDiagnostics {
                id: id.clone(),
                diagnostics,
            });
        }
        Ok(out)
    }

    fn affects_metadata(&self, before: Option<&FileHandle>, after: &FileHandle) -> bool {
        let Some(before) = before else {
            return true;
        };
        let header = |h: &FileHandle| {
            let parsed = parse_header(h.text().unwrap_or_default());
            (
                parsed.package.map(|(name, _)| name),
                parsed.imports.into_iter().map(|(path, _)| path).collect::<Vec<_>>(),
            )
        };
        header(before) != header(after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn url() -> Url {
        Url::parse("file:///w/a/x.src").unwrap()
    }

    fn known(paths: &[&str]) -> BTreeSet<String> {
        paths.iter().map(|p| (*p).to_string()).collect()
    }

    fn messages(diagnostics: &[Diagnostic]) -> Vec<&str> {
        diagnostics.iter().map(|d| d.message.as_str()).collect()
    }

    #[test]
    fn header_reads_package_and_imports() {
        let header = parse_header("// x\npackage a\nimport \"lib/b\"\nimport c\n");
        assert_eq!(header.package, Some(("a".to_string(), 1)));
        assert_eq!(header.imports, vec![("lib/b".to_string(), 2), ("c".to_string(), 3)]);
    }

    #[rstest]
    #[case("package a\n", &[])]
    #[case("fn f\n", &["missing package clause"])]
    #[case("package b\n", &["package b; expected a"])]
    #[case("package a\nimport \"nowhere\"\n", &["could not import \"nowhere\" (no package in workspace)"])]
    #[case("package a\nfn f {\n", &["expected }"])]
    #[case("package a\n}\n", &["unexpected }"])]
    fn structural_errors(#[case] text: &str, #[case] expected: &[&str]) {
        let found = SourceChecker::check_file(&url(), text, "a", &known(&["a", "lib/b"]));
        assert_eq!(messages(&found), expected);
    }

    #[test]
    fn unused_import_has_a_deleting_fix() {
        let text = "package a\nimport \"lib/b\"\nimport \"lib/c\"\nfn f { c.g() }\n";
        let found = SourceChecker::unused_imports(&url(), text);

        assert_eq!(messages(&found), vec!["\"lib/b\" imported and not used"]);
        let fix = &found[0].fixes[0];
        let edit = &fix.edits[&url()][0];
        assert_eq!(edit.range, Range::new(Position::new(1, 0), Position::new(2, 0)));
        assert!(edit.new_text.is_empty());
        assert_eq!(found[0].tags, vec![DiagnosticTag::UNNECESSARY]);
    }

    #[test]
    fn body_edits_do_not_affect_metadata() {
        let handle = |version, text: &str| FileHandle::overlay(url(), version, text.as_bytes().to_vec(), FileKind::Source, false);
        let before = handle(1, "package a\nfn f\n");
        let body = handle(2, "package a\nfn g\n");
        let import = handle(3, "package a\nimport \"b\"\nfn g\n");

        let checker = SourceChecker::new();
        assert!(!checker.affects_metadata(Some(&before), &body));
        assert!(checker.affects_metadata(Some(&body), &import));
        assert!(checker.affects_metadata(None, &body));
    }

    #[rstest]
    #[case(".git", true)]
    #[case("_build", true)]
    #[case("testdata", true)]
    #[case("src", false)]
    fn skipped_directories(#[case] name: &str, #[case] skipped: bool) {
        assert_eq!(is_skipped_dir(name), skipped);
    }
}
