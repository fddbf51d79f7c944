//! Application of editor content changes.
//!
//! Editors describe a change to an open document as a list of
//! [`TextDocumentContentChangeEvent`]s. Each event either replaces the whole
//! document (no range) or replaces a range, with positions expressed in
//! UTF-16 code units as mandated by LSP. Ranged events are applied in order,
//! each one against the text produced by the previous one.

use crate::error::{Error, Result};
use lsp_types::{Position, Range, TextDocumentContentChangeEvent};

/// Apply a sequence of content changes to `content`.
///
/// # Errors
///
/// - `Error::MalformedPayload` if the list is empty, if an event has no range
///   but a non-zero `range_length`, or if the document is not UTF-8
/// - `Error::InvalidRange` if a range is inverted or points outside the text
pub fn apply_changes(content: &[u8], changes: &[TextDocumentContentChangeEvent]) -> Result<Vec<u8>> {
    if changes.is_empty() {
        return Err(Error::MalformedPayload(
            "no content changes provided".to_string(),
        ));
    }

    let mut text = std::str::from_utf8(content)
        .map_err(|e| Error::MalformedPayload(format!("document is not valid UTF-8: {e}")))?
        .to_string();

    for change in changes {
        match change.range {
            None => {
                if change.range_length.is_some_and(|len| len != 0) {
                    return Err(Error::MalformedPayload(format!(
                        "change without range has rangeLength {}",
                        change.range_length.unwrap_or_default()
                    )));
                }
                text.clone_from(&change.text);
            }
            Some(range) => {
                let (start, end) = range_offsets(&text, range)?;
                text.replace_range(start..end, &change.text);
            }
        }
    }

    Ok(text.into_bytes())
}

/// Byte offsets of an LSP range within `text`.
///
/// # Errors
///
/// Returns `Error::InvalidRange` if either end is out of bounds or the range
/// is inverted.
pub fn range_offsets(text: &str, range: Range) -> Result<(usize, usize)> {
    let start = position_offset(text, range.start)?;
    let end = position_offset(text, range.end)?;
    if end < start {
        return Err(Error::InvalidRange(format!(
            "end {}:{} precedes start {}:{}",
            range.end.line, range.end.character, range.start.line, range.start.character
        )));
    }
    Ok((start, end))
}

/// Byte offset of an LSP position within `text`.
///
/// Lines are terminated by `\n`; a preceding `\r` is treated as part of the
/// terminator and cannot be addressed by a column.
///
/// # Errors
///
/// Returns `Error::InvalidRange` if the line does not exist, the column lies
/// beyond the end of the line, or the column splits a surrogate pair.
pub fn position_offset(text: &str, position: Position) -> Result<usize> {
    let line_start = line_start(text, position.line).ok_or_else(|| {
        Error::InvalidRange(format!(
            "line {} is beyond the end of the document",
            position.line
        ))
    })?;

    let rest = &text[line_start..];
    let line_end = rest.find('\n').unwrap_or(rest.len());
    let line = rest[..line_end].strip_suffix('\r').unwrap_or(&rest[..line_end]);

    let target = position.character as usize;
    let mut units = 0usize;
    for (byte_idx, ch) in line.char_indices() {
        if units == target {
            return Ok(line_start + byte_idx);
        }
        units += ch.len_utf16();
        if units > target {
            return Err(Error::InvalidRange(format!(
                "column {} splits a character on line {}",
                position.character, position.line
            )));
        }
    }
    if units == target {
        return Ok(line_start + line.len());
    }

    Err(Error::InvalidRange(format!(
        "column {} is beyond the end of line {} ({} UTF-16 units)",
        position.character, position.line, units
    )))
}

/// Byte offset at which line `line` (0-based) starts.
fn line_start(text: &str, line: u32) -> Option<usize> {
    if line == 0 {
        return Some(0);
    }
    text.match_indices('\n')
        .nth(line as usize - 1)
        .map(|(idx, _)| idx + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn ranged(sl: u32, sc: u32, el: u32, ec: u32, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: Some(Range::new(Position::new(sl, sc), Position::new(el, ec))),
            range_length: None,
            text: text.to_string(),
        }
    }

    fn full(text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range: None,
            range_length: None,
            text: text.to_string(),
        }
    }

    fn apply(content: &str, changes: &[TextDocumentContentChangeEvent]) -> Result<String> {
        apply_changes(content.as_bytes(), changes).map(|b| String::from_utf8(b).unwrap())
    }

    #[test]
    fn replaces_a_range_on_one_line() {
        assert_eq!(apply("abcdef", &[ranged(0, 1, 0, 3, "ZZ")]).unwrap(), "aZZdef");
    }

    #[test]
    fn full_content_replaces_everything() {
        assert_eq!(apply("old", &[full("new text")]).unwrap(), "new text");
    }

    #[test]
    fn changes_apply_in_order_against_the_previous_result() {
        // The second edit addresses the text produced by the first.
        let result = apply(
            "hello",
            &[ranged(0, 5, 0, 5, " world"), ranged(0, 0, 0, 1, "J")],
        )
        .unwrap();
        assert_eq!(result, "Jello world");
    }

    #[test]
    fn edits_across_lines() {
        let result = apply("one\ntwo\nthree", &[ranged(0, 2, 2, 1, "X")]).unwrap();
        assert_eq!(result, "onXhree");
    }

    #[test]
    fn insert_at_start_of_trailing_empty_line() {
        let result = apply("a\n", &[ranged(1, 0, 1, 0, "b")]).unwrap();
        assert_eq!(result, "a\nb");
    }

    #[test]
    fn columns_count_utf16_units() {
        // '😀' is two UTF-16 units and four UTF-8 bytes.
        let result = apply("x😀y", &[ranged(0, 3, 0, 4, "Z")]).unwrap();
        assert_eq!(result, "x😀Z");
    }

    #[test]
    fn crlf_terminator_is_not_addressable() {
        assert!(position_offset("ab\r\ncd", Position::new(0, 3)).is_err());
        assert_eq!(position_offset("ab\r\ncd", Position::new(0, 2)).unwrap(), 2);
        assert_eq!(position_offset("ab\r\ncd", Position::new(1, 1)).unwrap(), 5);
    }

    #[rstest]
    #[case::inverted(ranged(0, 3, 0, 1, ""))]
    #[case::line_out_of_bounds(ranged(5, 0, 5, 0, ""))]
    #[case::column_out_of_bounds(ranged(0, 0, 0, 99, ""))]
    #[case::splits_surrogate_pair(ranged(0, 2, 0, 2, ""))]
    fn invalid_ranges_are_rejected(#[case] change: TextDocumentContentChangeEvent) {
        let err = apply("x😀y", &[change]).unwrap_err();
        assert!(matches!(err, Error::InvalidRange(_)), "got {err:?}");
    }

    #[test]
    fn missing_range_with_length_is_malformed() {
        let change = TextDocumentContentChangeEvent {
            range: None,
            range_length: Some(3),
            text: "abc".to_string(),
        };
        assert!(matches!(
            apply("xyz", &[change]),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn empty_change_list_is_malformed() {
        assert!(matches!(apply("xyz", &[]), Err(Error::MalformedPayload(_))));
    }

    proptest! {
        #[test]
        fn ascii_single_line_edit_matches_string_splice(
            text in "[a-z]{0,40}",
            a in 0usize..41,
            b in 0usize..41,
            insert in "[A-Z]{0,5}",
        ) {
            let (start, end) = (a.min(b).min(text.len()), a.max(b).min(text.len()));
            let change = ranged(0, start as u32, 0, end as u32, &insert);
            let result = apply(&text, &[change]).unwrap();

            let mut expected = text.clone();
            expected.replace_range(start..end, &insert);
            prop_assert_eq!(result, expected);
        }

        #[test]
        fn full_replacement_ignores_previous_content(old in ".{0,40}", new in ".{0,40}") {
            prop_assert_eq!(apply(&old, &[full(&new)]).unwrap(), new);
        }
    }
}
