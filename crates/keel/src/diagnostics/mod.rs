//! Diagnostics: the finding type, its computation, and its publication.
//!
//! - [`Diagnostic`]: a finding with a stable identity hash
//! - [`DiagnosticStore`]: per-URI merged state and delta publication
//! - `full` and `orphaned`: what a diagnosis pass computes
//! - `scheduler`: two-phase passes over pending Views

mod full;
mod orphaned;
mod scheduler;
mod store;

pub(crate) use full::{diagnose_changed_files, diagnose_snapshot_full};
pub(crate) use orphaned::orphaned_file_diagnostics;
pub use scheduler::{Cause, DiagnosticScheduler};
pub use store::DiagnosticStore;

use keel_files::ContentHash;
use lsp_types::{
    CodeDescription, DiagnosticRelatedInformation, DiagnosticSeverity, DiagnosticTag,
    NumberOrString, Range, TextEdit, Url,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

/// Diagnostics grouped by file.
pub type DiagnosticMap = HashMap<Url, Vec<Diagnostic>>;

/// A code action computed together with a diagnostic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundledFix {
    /// Title shown in the editor.
    pub title: String,
    /// Edits per file.
    pub edits: BTreeMap<Url, Vec<TextEdit>>,
}

/// A structured finding at a range of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The file the finding is in.
    pub uri: Url,
    /// Where in the file.
    pub range: Range,
    /// Severity; editors treat a missing severity as an error.
    pub severity: Option<DiagnosticSeverity>,
    /// Producer, e.g. `compiler` or the analyzer name.
    pub source: String,
    /// Human-readable message.
    pub message: String,
    /// Optional code.
    pub code: Option<String>,
    /// Documentation link for the code.
    pub code_href: Option<Url>,
    /// Tags such as `Unnecessary` or `Deprecated`.
    pub tags: Vec<DiagnosticTag>,
    /// Related locations.
    pub related: Vec<DiagnosticRelatedInformation>,
    /// Fixes computed at diagnosis time.
    pub fixes: Vec<BundledFix>,
}

impl Diagnostic {
    /// A diagnostic with the given position, source and message and nothing
    /// else.
    #[must_use]
    pub fn new(
        uri: Url,
        range: Range,
        severity: DiagnosticSeverity,
        source: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            uri,
            range,
            severity: Some(severity),
            source: source.into(),
            message: message.into(),
            code: None,
            code_href: None,
            tags: Vec::new(),
            related: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Identity digest over range, message, source, code, tags, related
    /// locations and bundled fixes.
    ///
    /// Severity and the file URI are deliberately excluded: the URI is the
    /// key the digest is used under.
    #[must_use]
    pub fn stable_hash(&self) -> ContentHash {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_le_bytes());
            hasher.update(bytes);
        };
        let r = self.range;
        for n in [r.start.line, r.start.character, r.end.line, r.end.character] {
            field(&n.to_le_bytes());
        }
        field(self.message.as_bytes());
        field(self.source.as_bytes());
        field(self.code.as_deref().unwrap_or_default().as_bytes());
        field(self.code_href.as_ref().map_or("", Url::as_str).as_bytes());
        field(&serde_json::to_vec(&self.tags).unwrap_or_default());
        field(&serde_json::to_vec(&self.related).unwrap_or_default());
        field(&serde_json::to_vec(&self.fixes).unwrap_or_default());
        ContentHash::from_bytes(hasher.finalize().into())
    }

    /// Ordering used for publication: range, then source, then message.
    #[must_use]
    pub fn publication_order(&self, other: &Self) -> Ordering {
        range_key(&self.range)
            .cmp(&range_key(&other.range))
            .then_with(|| self.source.cmp(&other.source))
            .then_with(|| self.message.cmp(&other.message))
    }

    /// Convert to the protocol type.
    ///
    /// Bundled fixes travel in the `data` field so code actions can be served
    /// without recomputation.
    #[must_use]
    pub fn to_lsp(&self) -> lsp_types::Diagnostic {
        lsp_types::Diagnostic {
            range: self.range,
            severity: self.severity,
            code: self.code.clone().map(NumberOrString::String),
            code_description: self
                .code_href
                .clone()
                .map(|href| CodeDescription { href }),
            source: (!self.source.is_empty()).then(|| self.source.clone()),
            message: self.message.clone(),
            related_information: (!self.related.is_empty()).then(|| self.related.clone()),
            tags: (!self.tags.is_empty()).then(|| self.tags.clone()),
            data: (!self.fixes.is_empty())
                .then(|| serde_json::json!({ "fixes": self.fixes })),
        }
    }
}

/// Sortable form of a range.
pub(crate) fn range_key(range: &Range) -> (u32, u32, u32, u32) {
    (
        range.start.line,
        range.start.character,
        range.end.line,
        range.end.character,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::Position;

    fn diag(message: &str) -> Diagnostic {
        Diagnostic::new(
            Url::parse("file:///w/a.src").unwrap(),
            Range::new(Position::new(1, 2), Position::new(1, 5)),
            DiagnosticSeverity::ERROR,
            "compiler",
            message,
        )
    }

    #[test]
    fn hash_depends_on_identity_fields() {
        let a = diag("undefined: x");
        assert_eq!(a.stable_hash(), diag("undefined: x").stable_hash());
        assert_ne!(a.stable_hash(), diag("undefined: y").stable_hash());

        let mut tagged = a.clone();
        tagged.tags.push(DiagnosticTag::UNNECESSARY);
        assert_ne!(a.stable_hash(), tagged.stable_hash());
    }

    #[test]
    fn severity_is_not_part_of_identity() {
        let a = diag("m");
        let mut b = a.clone();
        b.severity = Some(DiagnosticSeverity::WARNING);
        assert_eq!(a.stable_hash(), b.stable_hash());
    }

    #[test]
    fn to_lsp_carries_fixes_in_data() {
        let mut d = diag("m");
        assert!(d.to_lsp().data.is_none());
        d.fixes.push(BundledFix {
            title: "fix it".to_string(),
            edits: BTreeMap::new(),
        });
        let lsp = d.to_lsp();
        assert_eq!(lsp.source.as_deref(), Some("compiler"));
        assert_eq!(lsp.data.unwrap()["fixes"][0]["title"], "fix it");
    }

    #[test]
    fn publication_order_is_range_source_message() {
        let mut early = diag("z");
        early.range = Range::new(Position::new(0, 0), Position::new(0, 1));
        let late = diag("a");
        assert_eq!(early.publication_order(&late), Ordering::Less);

        let mut lint = diag("a");
        lint.source = "lint".to_string();
        assert_eq!(late.publication_order(&lint), Ordering::Less);
    }
}
