//! A scriptable type checker for tests.
//!
//! Diagnostics are driven by file content so tests can steer them with plain
//! edits:
//!
//! - `error: <msg>` reports a compiler error on that line
//! - `error[<os>]: <msg>` does the same, but only when targeting `<os>`
//! - `lint: <msg>` is reported by analysis as a warning
//! - a message containing `(fixable)` is also reported by analysis, with a
//!   fix attached, so the two merge when combined
//!
//! Without configured packages, every directory holding an open source file
//! inside the View root is one package.

use super::{PackageDiagnostics, TypeChecker};
use crate::diagnostics::{BundledFix, Diagnostic, DiagnosticMap};
use crate::error::{Error, Result};
use crate::metadata::{PackageId, PackageMetadata};
use crate::progress::WorkHandle;
use crate::snapshot::Snapshot;
use crate::view::ViewId;
use async_trait::async_trait;
use keel_files::{uri, FileHandle, FileKind};
use lsp_types::{DiagnosticSeverity, Position, Range, TextEdit, Url};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A call made to the [`MockTypeChecker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckOp {
    /// `load_metadata`.
    Load,
    /// `type_check`.
    TypeCheck,
    /// `analyze`.
    Analyze,
}

/// A recorded call.
#[derive(Debug, Clone)]
pub struct CheckCall {
    /// Which operation.
    pub op: CheckOp,
    /// The View of the snapshot.
    pub view: ViewId,
    /// The snapshot's sequence number.
    pub snapshot: u64,
    /// Packages asked for; empty for loads.
    pub ids: Vec<PackageId>,
}

/// Secondary diagnostics producers that can be scripted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// Workspace manifest parse errors.
    WorkspaceManifest,
    /// Module manifest parse errors.
    ModuleManifest,
    /// Module upgrades.
    Upgrades,
    /// Vulnerabilities.
    Vulnerabilities,
    /// Template files.
    Templates,
    /// Requirement tidiness.
    Tidy,
    /// Optimization details.
    Optimization,
}

type Scripted = std::result::Result<DiagnosticMap, String>;

/// Content-driven [`TypeChecker`] with call recording.
#[derive(Debug, Default)]
pub struct MockTypeChecker {
    packages: Mutex<Option<Vec<PackageMetadata>>>,
    load_error: Mutex<Option<String>>,
    delays: Mutex<HashMap<CheckOp, Duration>>,
    buckets: Mutex<HashMap<Bucket, Scripted>>,
    calls: Mutex<Vec<CheckCall>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockTypeChecker {
    /// A checker deriving packages from open files.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Report exactly these packages from every load.
    pub fn set_packages(&self, packages: Vec<PackageMetadata>) {
        *lock(&self.packages) = Some(packages);
    }

    /// Make every load fail with `message` until
    /// [`clear_load_failure`](Self::clear_load_failure).
    pub fn fail_load(&self, message: impl Into<String>) {
        *lock(&self.load_error) = Some(message.into());
    }

    /// Let loads succeed again.
    pub fn clear_load_failure(&self) {
        *lock(&self.load_error) = None;
    }

    /// Make an operation take `delay` (cancellable).
    pub fn set_delay(&self, op: CheckOp, delay: Duration) {
        lock(&self.delays).insert(op, delay);
    }

    /// Have a secondary producer report `diagnostics`.
    pub fn script_bucket(&self, bucket: Bucket, diagnostics: DiagnosticMap) {
        lock(&self.buckets).insert(bucket, Ok(diagnostics));
    }

    /// Have a secondary producer fail.
    pub fn fail_bucket(&self, bucket: Bucket, message: impl Into<String>) {
        lock(&self.buckets).insert(bucket, Err(message.into()));
    }

    /// Every call so far.
    #[must_use]
    pub fn calls(&self) -> Vec<CheckCall> {
        lock(&self.calls).clone()
    }

    /// Calls of one operation.
    #[must_use]
    pub fn calls_for(&self, op: CheckOp) -> Vec<CheckCall> {
        self.calls().into_iter().filter(|c| c.op == op).collect()
    }

    /// Forget recorded calls.
    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, op: CheckOp, snapshot: &Snapshot, ids: &[PackageId]) {
        lock(&self.calls).push(CheckCall {
            op,
            view: snapshot.view_id().clone(),
            snapshot: snapshot.sequence_id(),
            ids: ids.to_vec(),
        });
    }

    async fn pause(&self, op: CheckOp, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let delay = lock(&self.delays).get(&op).copied().unwrap_or_default();
        if delay.is_zero() {
            return Ok(());
        }
        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => Ok(()),
        }
    }

    fn bucket(&self, bucket: Bucket) -> Option<Result<DiagnosticMap>> {
        lock(&self.buckets)
            .get(&bucket)
            .cloned()
            .map(|scripted| scripted.map_err(Error::Transient))
    }

    fn derived_packages(snapshot: &Snapshot) -> Vec<PackageMetadata> {
        let mut by_dir: BTreeMap<Url, Vec<Url>> = BTreeMap::new();
        for handle in snapshot.overlays() {
            let file = handle.uri();
            if snapshot.file_kind(&handle) != FileKind::Source
                || !uri::is_within(snapshot.folder(), file)
                || snapshot.ignored_file(file)
            {
                continue;
            }
            if let Some(dir) = uri::parent_dir(file) {
                by_dir.entry(dir).or_default().push(file.clone());
            }
        }
        by_dir
            .into_iter()
            .map(|(dir, files)| {
                let rel = uri::relative_segments(snapshot.folder(), &dir)
                    .map(|s| s.into_iter().filter(|p| !p.is_empty()).collect::<Vec<_>>().join("/"))
                    .unwrap_or_default();
                let path = if rel.is_empty() { ".".to_string() } else { rel };
                PackageMetadata {
                    id: PackageId::new(&path),
                    name: path.rsplit('/').next().unwrap_or(&path).to_string(),
                    pkg_path: path,
                    compiled_files: files,
                    ignored_files: Vec::new(),
                    deps: Vec::new(),
                    module_root: Some(snapshot.folder().clone()),
                    for_test: false,
                }
            })
            .collect()
    }

    async fn scan(
        snapshot: &Snapshot,
        ids: &[PackageId],
        mut visit: impl FnMut(&Url, &str, u32, u32),
    ) -> Result<()> {
        let graph = snapshot.metadata_graph().await?;
        for id in ids {
            let Some(package) = graph.metadata(id) else {
                continue;
            };
            for file in &package.compiled_files {
                let handle = snapshot.read_file(file).await?;
                let Ok(text) = handle.text() else {
                    continue;
                };
                for (line, content) in text.lines().enumerate() {
                    let line = u32::try_from(line).unwrap_or(u32::MAX);
                    let width = u32::try_from(content.encode_utf16().count()).unwrap_or(u32::MAX);
                    visit(file, content, line, width);
                }
            }
        }
        Ok(())
    }
}

fn line_range(line: u32, width: u32) -> Range {
    Range::new(Position::new(line, 0), Position::new(line, width))
}

fn marker<'a>(content: &'a str, tag: &str) -> Option<&'a str> {
    content.find(tag).map(|at| content[at + tag.len()..].trim())
}

/// `error[os]: msg` → `(os, msg)`.
fn targeted_error(content: &str) -> Option<(&str, &str)> {
    let at = content.find("error[")?;
    let rest = &content[at + "error[".len()..];
    let close = rest.find("]:")?;
    Some((&rest[..close], rest[close + 2..].trim()))
}

/// The declaration lines that decide package structure.
fn header(handle: &FileHandle) -> Vec<String> {
    handle
        .text()
        .unwrap_or_default()
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with("package ") || l.starts_with("import "))
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl TypeChecker for MockTypeChecker {
    async fn load_metadata(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> Result<Vec<PackageMetadata>> {
        self.record(CheckOp::Load, snapshot, &[]);
        self.pause(CheckOp::Load, cancel).await?;
        if let Some(message) = lock(&self.load_error).clone() {
            return Err(Error::Transient(message));
        }
        let configured = lock(&self.packages).clone();
        Ok(configured.unwrap_or_else(|| Self::derived_packages(snapshot)))
    }

    async fn type_check(
        &self,
        snapshot: &Snapshot,
        ids: &[PackageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>> {
        self.record(CheckOp::TypeCheck, snapshot, ids);
        self.pause(CheckOp::TypeCheck, cancel).await?;
        let target = snapshot.env().target_os.clone();
        let mut out = Vec::new();
        for id in ids {
            let mut diagnostics = Vec::new();
            Self::scan(snapshot, std::slice::from_ref(id), |file, content, line, width| {
                let message = match targeted_error(content) {
                    Some((os, message)) if os == target => Some(message),
                    Some(_) => None,
                    None => marker(content, "error:"),
                };
                if let Some(message) = message {
                    diagnostics.push(Diagnostic::new(
                        file.clone(),
                        line_range(line, width),
                        DiagnosticSeverity::ERROR,
                        "compiler",
                        message,
                    ));
                }
            })
            .await?;
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
        self.record(CheckOp::Analyze, snapshot, ids);
        if let Some(progress) = progress {
            progress.report(format!("analyzing {} packages", ids.len()), None).await;
        }
        self.pause(CheckOp::Analyze, cancel).await?;
        let mut out = Vec::new();
        for id in ids {
            let mut diagnostics = Vec::new();
            Self::scan(snapshot, std::slice::from_ref(id), |file, content, line, width| {
                let range = line_range(line, width);
                if let Some(message) = marker(content, "lint:") {
                    diagnostics.push(Diagnostic::new(
                        file.clone(),
                        range,
                        DiagnosticSeverity::WARNING,
                        "lint",
                        message,
                    ));
                }
                if let Some(message) = marker(content, "error:").filter(|m| m.contains("(fixable)")) {
                    let mut fixed = Diagnostic::new(file.clone(), range, DiagnosticSeverity::ERROR, "fixer", message);
                    fixed.fixes.push(BundledFix {
                        title: format!("Fix: {message}"),
                        edits: BTreeMap::from([(file.clone(), vec![TextEdit::new(range, String::new())])]),
                    });
                    diagnostics.push(fixed);
                }
            })
            .await?;
            out.push(PackageDiagnostics {
                id: id.clone(),
                diagnostics,
            });
        }
        Ok(out)
    }

    async fn workspace_manifest_diagnostics(&self, _snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        self.bucket(Bucket::WorkspaceManifest).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    async fn module_manifest_diagnostics(&self, _snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        self.bucket(Bucket::ModuleManifest).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    async fn upgrade_diagnostics(&self, _snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        self.bucket(Bucket::Upgrades).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    async fn vulnerability_diagnostics(&self, _snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        self.bucket(Bucket::Vulnerabilities).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    async fn template_diagnostics(&self, snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        if let Some(scripted) = self.bucket(Bucket::Templates) {
            return scripted;
        }
        let mut map = DiagnosticMap::new();
        for handle in snapshot.overlays() {
            if snapshot.file_kind(&handle) != FileKind::Template {
                continue;
            }
            let text = handle.text().unwrap_or_default();
            for (line, content) in text.lines().enumerate() {
                if let Some(message) = marker(content, "error:") {
                    let line = u32::try_from(line).unwrap_or(u32::MAX);
                    let width = u32::try_from(content.encode_utf16().count()).unwrap_or(u32::MAX);
                    map.entry(handle.uri().clone()).or_default().push(Diagnostic::new(
                        handle.uri().clone(),
                        line_range(line, width),
                        DiagnosticSeverity::ERROR,
                        "template",
                        message,
                    ));
                }
            }
        }
        Ok(map)
    }

    async fn tidy_diagnostics(&self, _snapshot: &Snapshot, _cancel: &CancellationToken) -> Result<DiagnosticMap> {
        self.bucket(Bucket::Tidy).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    async fn optimization_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _ids: &[PackageId],
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        self.bucket(Bucket::Optimization).unwrap_or_else(|| Ok(DiagnosticMap::new()))
    }

    fn affects_metadata(&self, before: Option<&FileHandle>, after: &FileHandle) -> bool {
        before.map_or(true, |before| header(before) != header(after))
    }
}
