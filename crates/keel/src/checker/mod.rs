//! The language back end consumed by the core.
//!
//! The core never parses or type-checks anything itself. It asks a
//! [`TypeChecker`] for package metadata and per-package diagnostics, always
//! through a [`Snapshot`] so the back end reads one coherent workspace state,
//! and always with a cancellation token that is tripped when the result is no
//! longer wanted.

#[cfg(any(test, feature = "test-util"))]
mod mock;

#[cfg(any(test, feature = "test-util"))]
pub use mock::{Bucket, CheckCall, CheckOp, MockTypeChecker};

use crate::diagnostics::{Diagnostic, DiagnosticMap};
use crate::error::Result;
use crate::metadata::{PackageId, PackageMetadata};
use crate::progress::WorkHandle;
use crate::snapshot::Snapshot;
use async_trait::async_trait;
use keel_files::FileHandle;
use tokio_util::sync::CancellationToken;

/// Diagnostics computed for one package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageDiagnostics {
    /// The package.
    pub id: PackageId,
    /// Findings, in any of the package's files.
    pub diagnostics: Vec<Diagnostic>,
}

/// Type checker, analyzer and manifest tooling for the language.
///
/// Implementations are stateless with respect to the core: everything they
/// need is reachable from the snapshot they are given. Every method must
/// return `Error::Cancelled` promptly once `cancel` is tripped.
///
/// Only metadata loading, type checking and analysis are required; the
/// remaining producers default to reporting nothing.
#[async_trait]
pub trait TypeChecker: Send + Sync {
    /// Load the packages of the snapshot's View.
    ///
    /// # Errors
    ///
    /// A failure other than cancellation is recorded as the snapshot's
    /// initialization error.
    async fn load_metadata(
        &self,
        snapshot: &Snapshot,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageMetadata>>;

    /// Type-check packages and report their diagnostics.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` on cancellation and `Error::Transient` if
    /// checking aborted.
    async fn type_check(
        &self,
        snapshot: &Snapshot,
        ids: &[PackageId],
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>>;

    /// Run the analyzers over packages.
    ///
    /// # Errors
    ///
    /// Returns `Error::Cancelled` on cancellation and `Error::Transient` if
    /// analysis aborted.
    async fn analyze(
        &self,
        snapshot: &Snapshot,
        ids: &[PackageId],
        progress: Option<&WorkHandle>,
        cancel: &CancellationToken,
    ) -> Result<Vec<PackageDiagnostics>>;

    /// Parse diagnostics for workspace manifests.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn workspace_manifest_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Parse diagnostics for module manifests.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn module_manifest_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Available upgrades of required modules.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn upgrade_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Known vulnerabilities of required modules.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn vulnerability_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Diagnostics for template files.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn template_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Missing or unused module requirements.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn tidy_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Compiler optimization decisions for the given packages.
    ///
    /// # Errors
    ///
    /// Failures drop this bucket only.
    async fn optimization_diagnostics(
        &self,
        _snapshot: &Snapshot,
        _ids: &[PackageId],
        _cancel: &CancellationToken,
    ) -> Result<DiagnosticMap> {
        Ok(DiagnosticMap::new())
    }

    /// Whether replacing `before` with `after` can change package structure
    /// (package clause, imports, build constraints). Manifest changes and
    /// file creation or deletion always reload metadata regardless.
    fn affects_metadata(&self, _before: Option<&FileHandle>, _after: &FileHandle) -> bool {
        false
    }
}
