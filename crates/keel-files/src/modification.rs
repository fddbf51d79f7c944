//! File modification records.

use lsp_types::{TextDocumentContentChangeEvent, Url};
use std::fmt;

/// What happened to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModificationAction {
    /// The editor opened the file.
    Open,
    /// The file's content changed, in the editor or (with `on_disk`) on disk.
    Change,
    /// The editor saved the file.
    Save,
    /// The editor closed the file.
    Close,
    /// The file (or directory) appeared on disk.
    Create,
    /// The file (or directory) was removed from disk.
    Delete,
}

impl ModificationAction {
    /// Whether the action can change the set of files in a directory.
    #[must_use]
    pub fn changes_file_set(self) -> bool {
        matches!(self, Self::Create | Self::Delete)
    }
}

impl fmt::Display for ModificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Change => "change",
            Self::Save => "save",
            Self::Close => "close",
            Self::Create => "create",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// New content carried by a modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// The complete text of the file.
    Full(String),
    /// Edits to apply, in order, to the current overlay.
    Edits(Vec<TextDocumentContentChangeEvent>),
}

impl Payload {
    /// Build a payload from the change list of a `didChange` notification.
    ///
    /// A single change without a range is a full replacement; anything else
    /// is applied as a sequence of edits.
    #[must_use]
    pub fn from_changes(mut changes: Vec<TextDocumentContentChangeEvent>) -> Self {
        if changes.len() == 1 && changes[0].range.is_none() && changes[0].range_length.is_none() {
            if let Some(change) = changes.pop() {
                return Self::Full(change.text);
            }
        }
        Self::Edits(changes)
    }
}

/// A single file event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Modification {
    /// The file (or, for file system events, possibly a directory).
    pub uri: Url,
    /// What happened.
    pub action: ModificationAction,
    /// Editor version after the event.
    pub version: Option<i32>,
    /// New content, if any.
    pub payload: Option<Payload>,
    /// LSP language identifier sent with `didOpen`.
    pub language_id: Option<String>,
    /// True when the event was observed on disk rather than reported by the
    /// editor.
    pub on_disk: bool,
}

impl Modification {
    fn new(uri: Url, action: ModificationAction) -> Self {
        Self {
            uri,
            action,
            version: None,
            payload: None,
            language_id: None,
            on_disk: false,
        }
    }

    /// An editor open.
    #[must_use]
    pub fn open(uri: Url, version: i32, language_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            version: Some(version),
            payload: Some(Payload::Full(text.into())),
            language_id: Some(language_id.into()),
            ..Self::new(uri, ModificationAction::Open)
        }
    }

    /// An editor change.
    #[must_use]
    pub fn change(uri: Url, version: i32, payload: Payload) -> Self {
        Self {
            version: Some(version),
            payload: Some(payload),
            ..Self::new(uri, ModificationAction::Change)
        }
    }

    /// An editor save, optionally carrying the saved text.
    #[must_use]
    pub fn save(uri: Url, text: Option<String>) -> Self {
        Self {
            payload: text.map(Payload::Full),
            ..Self::new(uri, ModificationAction::Save)
        }
    }

    /// An editor close.
    #[must_use]
    pub fn close(uri: Url) -> Self {
        Self::new(uri, ModificationAction::Close)
    }

    /// A file system event.
    #[must_use]
    pub fn on_disk(uri: Url, action: ModificationAction) -> Self {
        Self {
            on_disk: true,
            ..Self::new(uri, action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lsp_types::{Position, Range};

    fn uri() -> Url {
        Url::parse("file:///w/a.src").unwrap()
    }

    #[test]
    fn single_unranged_change_is_full_content() {
        let payload = Payload::from_changes(vec![TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: "all".to_string(),
        }]);
        assert_eq!(payload, Payload::Full("all".to_string()));
    }

    #[test]
    fn ranged_changes_stay_edits() {
        let change = TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(0, 0), Position::new(0, 1))),
            range_length: None,
            text: "a".to_string(),
        };
        assert!(matches!(
            Payload::from_changes(vec![change]),
            Payload::Edits(edits) if edits.len() == 1
        ));
    }

    #[test]
    fn unranged_change_with_length_is_left_for_validation() {
        let change = TextDocumentContentChangeEvent {
            range: None,
            range_length: Some(2),
            text: "a".to_string(),
        };
        assert!(matches!(Payload::from_changes(vec![change]), Payload::Edits(_)));
    }

    #[test]
    fn editor_events_are_not_on_disk() {
        assert!(!Modification::open(uri(), 1, "keel", "x").on_disk);
        assert!(!Modification::close(uri()).on_disk);
        assert!(Modification::on_disk(uri(), ModificationAction::Create).on_disk);
    }
}
