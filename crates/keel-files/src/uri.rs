//! Helpers for `file://` URIs.

use crate::error::{Error, Result};
use lsp_types::Url;
use std::path::{Path, PathBuf};

/// Convert a `file://` URI to a local path.
///
/// # Errors
///
/// Returns `Error::InvalidUri` for non-file schemes or URIs that do not map to
/// an absolute path.
pub fn to_path(uri: &Url) -> Result<PathBuf> {
    if uri.scheme() != "file" {
        return Err(Error::InvalidUri(uri.to_string()));
    }
    uri.to_file_path()
        .map_err(|()| Error::InvalidUri(uri.to_string()))
}

/// Convert an absolute local path to a `file://` URI.
///
/// # Errors
///
/// Returns `Error::InvalidUri` if the path is relative.
pub fn from_path(path: &Path) -> Result<Url> {
    Url::from_file_path(path).map_err(|()| Error::InvalidUri(path.display().to_string()))
}

/// Convert a directory path to a URI.
///
/// # Errors
///
/// Returns `Error::InvalidUri` if the path is relative.
pub fn from_dir(path: &Path) -> Result<Url> {
    Url::from_directory_path(path).map_err(|()| Error::InvalidUri(path.display().to_string()))
}

/// `uri` with a trailing slash, so it names a directory.
#[must_use]
pub fn as_dir(mut uri: Url) -> Url {
    if !uri.path().ends_with('/') {
        let path = format!("{}/", uri.path());
        uri.set_path(&path);
    }
    uri
}

/// Whether `uri` names `dir` itself or a file beneath it.
///
/// Comparison is by path segments, so `/work/app` does not contain
/// `/work/apple/main.src`.
#[must_use]
pub fn is_within(dir: &Url, uri: &Url) -> bool {
    if dir.scheme() != uri.scheme() || dir.host() != uri.host() {
        return false;
    }
    let dir_segments = segments(dir);
    let uri_segments = segments(uri);
    uri_segments.len() >= dir_segments.len()
        && dir_segments.iter().zip(&uri_segments).all(|(a, b)| a == b)
}

/// Path segments below `dir` leading to `uri`, if `uri` lies within `dir`.
#[must_use]
pub fn relative_segments<'a>(dir: &Url, uri: &'a Url) -> Option<Vec<&'a str>> {
    if !is_within(dir, uri) {
        return None;
    }
    let depth = segments(dir).len();
    Some(segments(uri).into_iter().skip(depth).collect())
}

/// Non-empty path segments of a URI.
fn segments(uri: &Url) -> Vec<&str> {
    uri.path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default()
}

/// The URI of the directory containing `uri`.
#[must_use]
pub fn parent_dir(uri: &Url) -> Option<Url> {
    let mut parent = uri.clone();
    {
        let mut segments = parent.path_segments_mut().ok()?;
        segments.pop_if_empty().pop().push("");
    }
    Some(parent)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn within_matches_segments_not_prefixes() {
        let dir = uri("file:///work/app");
        assert!(is_within(&dir, &uri("file:///work/app/main.src")));
        assert!(is_within(&dir, &uri("file:///work/app/sub/x.src")));
        assert!(is_within(&dir, &uri("file:///work/app")));
        assert!(is_within(&uri("file:///work/app/"), &uri("file:///work/app/a.src")));
        assert!(!is_within(&dir, &uri("file:///work/apple/main.src")));
        assert!(!is_within(&dir, &uri("file:///work")));
    }

    #[test]
    fn relative_segments_strip_the_directory() {
        let dir = uri("file:///work/app/");
        let file = uri("file:///work/app/_gen/x.src");
        assert_eq!(relative_segments(&dir, &file), Some(vec!["_gen", "x.src"]));
        assert_eq!(relative_segments(&dir, &uri("file:///other/x.src")), None);
    }

    #[test]
    fn parent_of_file_is_its_directory() {
        assert_eq!(
            parent_dir(&uri("file:///work/app/main.src")),
            Some(uri("file:///work/app/"))
        );
    }

    #[test]
    fn as_dir_adds_one_trailing_slash() {
        assert_eq!(as_dir(uri("file:///work/app")), uri("file:///work/app/"));
        assert_eq!(as_dir(uri("file:///work/app/")), uri("file:///work/app/"));
    }

    #[test]
    fn non_file_scheme_is_rejected() {
        assert!(matches!(
            to_path(&uri("untitled:Untitled-1")),
            Err(Error::InvalidUri(_))
        ));
    }
}
