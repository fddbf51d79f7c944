//! File kinds.
//!
//! The server distinguishes a small, closed set of file categories. Behavior
//! that differs per category lives in a static [`KindTable`] selected once per
//! kind, rather than in per-file trait objects.

use lsp_types::Url;
use std::fmt;

/// Category of a file, as far as the server is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FileKind {
    /// A compilation unit of the language.
    Source,
    /// A module manifest (declares a module and its requirements).
    ModuleManifest,
    /// A workspace manifest (groups several modules).
    WorkspaceManifest,
    /// A text template checked by the template engine.
    Template,
    /// Anything else.
    Unknown,
}

/// Per-kind behavior table.
#[derive(Debug)]
pub struct KindTable {
    /// Stable lowercase name, used in logs and diagnostics sources.
    pub name: &'static str,
    /// Whether a content change to this kind forces a metadata reload.
    pub invalidates_metadata: bool,
    /// Whether the diagnostics pipeline produces findings for this kind.
    pub diagnosable: bool,
}

static SOURCE: KindTable = KindTable {
    name: "source",
    invalidates_metadata: false,
    diagnosable: true,
};

static MODULE_MANIFEST: KindTable = KindTable {
    name: "module-manifest",
    invalidates_metadata: true,
    diagnosable: true,
};

static WORKSPACE_MANIFEST: KindTable = KindTable {
    name: "workspace-manifest",
    invalidates_metadata: true,
    diagnosable: true,
};

static TEMPLATE: KindTable = KindTable {
    name: "template",
    invalidates_metadata: false,
    diagnosable: true,
};

static UNKNOWN: KindTable = KindTable {
    name: "unknown",
    invalidates_metadata: false,
    diagnosable: false,
};

impl FileKind {
    /// The behavior table for this kind.
    #[must_use]
    pub fn table(self) -> &'static KindTable {
        match self {
            Self::Source => &SOURCE,
            Self::ModuleManifest => &MODULE_MANIFEST,
            Self::WorkspaceManifest => &WORKSPACE_MANIFEST,
            Self::Template => &TEMPLATE,
            Self::Unknown => &UNKNOWN,
        }
    }

    /// Whether this kind is one of the two manifest kinds.
    #[must_use]
    pub fn is_manifest(self) -> bool {
        matches!(self, Self::ModuleManifest | Self::WorkspaceManifest)
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table().name)
    }
}

/// Rules mapping file names and LSP language identifiers to [`FileKind`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindRules {
    /// Extensions (without the dot) of source files.
    pub source_extensions: Vec<String>,
    /// Exact file name of module manifests.
    pub module_manifest: String,
    /// Exact file name of workspace manifests.
    pub workspace_manifest: String,
    /// Extensions (without the dot) of template files.
    pub template_extensions: Vec<String>,
    /// LSP language identifier sent by editors for source files.
    pub language_id: String,
}

impl Default for KindRules {
    fn default() -> Self {
        Self {
            source_extensions: vec!["src".to_string()],
            module_manifest: "module.toml".to_string(),
            workspace_manifest: "workspace.toml".to_string(),
            template_extensions: vec!["tmpl".to_string()],
            language_id: "keel".to_string(),
        }
    }
}

impl KindRules {
    /// Classify a file by its name.
    #[must_use]
    pub fn classify(&self, uri: &Url) -> FileKind {
        let name = uri
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .unwrap_or("");

        if name == self.module_manifest {
            return FileKind::ModuleManifest;
        }
        if name == self.workspace_manifest {
            return FileKind::WorkspaceManifest;
        }

        let Some((_, ext)) = name.rsplit_once('.') else {
            return FileKind::Unknown;
        };
        if self.source_extensions.iter().any(|e| e == ext) {
            FileKind::Source
        } else if self.template_extensions.iter().any(|e| e == ext) {
            FileKind::Template
        } else {
            FileKind::Unknown
        }
    }

    /// Classify a file opened by the editor.
    ///
    /// The language identifier wins when it is recognized; otherwise the
    /// file name decides.
    #[must_use]
    pub fn classify_open(&self, uri: &Url, language_id: Option<&str>) -> FileKind {
        match language_id {
            Some(id) if id == self.language_id => FileKind::Source,
            Some("tmpl" | "gotmpl" | "template") => FileKind::Template,
            _ => self.classify(uri),
        }
    }

    /// Glob alternation of every extension worth watching, e.g. `src,toml,tmpl`.
    #[must_use]
    pub fn watched_extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.source_extensions.clone();
        for manifest in [&self.module_manifest, &self.workspace_manifest] {
            if let Some((_, ext)) = manifest.rsplit_once('.') {
                exts.push(ext.to_string());
            }
        }
        exts.extend(self.template_extensions.iter().cloned());
        exts.sort();
        exts.dedup();
        exts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn uri(path: &str) -> Url {
        Url::parse(&format!("file://{path}")).unwrap()
    }

    #[rstest]
    #[case("/w/a.src", FileKind::Source)]
    #[case("/w/module.toml", FileKind::ModuleManifest)]
    #[case("/w/workspace.toml", FileKind::WorkspaceManifest)]
    #[case("/w/page.tmpl", FileKind::Template)]
    #[case("/w/README.md", FileKind::Unknown)]
    #[case("/w/Makefile", FileKind::Unknown)]
    #[case("/w/other.toml", FileKind::Unknown)]
    fn classify_by_name(#[case] path: &str, #[case] expected: FileKind) {
        assert_eq!(KindRules::default().classify(&uri(path)), expected);
    }

    #[test]
    fn language_id_overrides_extension() {
        let rules = KindRules::default();
        assert_eq!(
            rules.classify_open(&uri("/w/scratch.txt"), Some("keel")),
            FileKind::Source
        );
        assert_eq!(
            rules.classify_open(&uri("/w/a.src"), Some("plaintext")),
            FileKind::Source
        );
    }

    #[test]
    fn manifests_invalidate_metadata() {
        assert!(FileKind::ModuleManifest.table().invalidates_metadata);
        assert!(FileKind::WorkspaceManifest.table().invalidates_metadata);
        assert!(!FileKind::Source.table().invalidates_metadata);
        assert!(!FileKind::Unknown.table().diagnosable);
    }

    #[test]
    fn watched_extensions_are_deduplicated() {
        assert_eq!(
            KindRules::default().watched_extensions(),
            vec!["src".to_string(), "tmpl".to_string(), "toml".to_string()]
        );
    }
}
