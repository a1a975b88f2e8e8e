//! Filename derivation and path resolution for staging and publishing.
//!
//! Staging and intermediate names derive from the job id, so two concurrent
//! jobs never share a path. Only the public name may derive from the title.

use std::path::{Component, Path, PathBuf};

use crate::queue::BookMetadata;

/// Longest title-derived stem, in characters.
const MAX_TITLE_CHARS: usize = 120;

/// Suffix of the file a worker streams into.
pub const STAGING_SUFFIX: &str = "part";

/// Extension of the not-yet-visible file inside the ingest directory.
pub const INTERMEDIATE_EXTENSION: &str = "crdownload";

/// Encodes an id as a single path segment, injectively.
///
/// ASCII letters, digits and `-` pass through; every other byte becomes
/// `_` followed by two hex digits. `_` only ever starts an escape, so
/// distinct ids always yield distinct segments.
pub(crate) fn encode_id_component(id: &str) -> String {
    if id.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(char::from(byte));
        } else {
            out.push_str(&format!("_{byte:02x}"));
        }
    }
    out
}

/// Reduces an id to characters that are safe in a single path segment.
pub(crate) fn sanitize_filename_component(value: &str) -> String {
    let mut out = String::new();
    let mut prev_sep = false;
    for ch in value.chars() {
        let mapped = match ch {
            c if c.is_alphanumeric() || matches!(c, '-' | '.') => c,
            _ => '_',
        };
        if mapped == '_' {
            if !prev_sep {
                out.push('_');
                prev_sep = true;
            }
        } else {
            out.push(mapped);
            prev_sep = false;
        }
    }
    let trimmed = out.trim_matches('_');
    if trimmed.is_empty() || !is_safe_filename_segment(trimmed) {
        trimmed.replace('.', "_")
    } else {
        trimmed.to_string()
    }
}

/// Sanitizes a book title for use as a public filename stem.
///
/// Keeps letters, digits, spaces, `.` and `_`; everything else is dropped.
/// Returns `None` when nothing usable is left.
#[must_use]
pub fn sanitize_title(title: &str) -> Option<String> {
    let kept: String = title
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, ' ' | '.' | '_'))
        .take(MAX_TITLE_CHARS)
        .collect();
    let trimmed = kept.trim().trim_matches('.').trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Normalizes a format string to a bare lowercase extension.
fn sanitize_format(format: &str) -> String {
    let ext: String = format
        .trim()
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase();
    if ext.is_empty() { "bin".to_string() } else { ext }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Staging path for a job: `<staging>/<encoded id>.<format>.part`.
#[must_use]
pub fn staging_path(staging_dir: &Path, book: &BookMetadata) -> PathBuf {
    let id = encode_id_component(&book.id);
    let ext = sanitize_format(&book.format);
    staging_dir.join(format!("{id}.{ext}.{STAGING_SUFFIX}"))
}

/// Hidden name inside the ingest directory: `<ingest>/<encoded id>.crdownload`.
#[must_use]
pub fn intermediate_path(ingest_dir: &Path, id: &str) -> PathBuf {
    let id = encode_id_component(id);
    ingest_dir.join(format!("{id}.{INTERMEDIATE_EXTENSION}"))
}

/// Public filename: sanitized title when `use_title` is set (and usable),
/// otherwise the id, plus `.<format>`.
#[must_use]
pub fn public_filename(book: &BookMetadata, use_title: bool) -> String {
    let stem = use_title
        .then(|| sanitize_title(&book.title))
        .flatten()
        .unwrap_or_else(|| sanitize_filename_component(&book.id));
    let stem = if stem.is_empty() { "book".to_string() } else { stem };
    format!("{stem}.{}", sanitize_format(&book.format))
}

/// Resolves a path in `dir` that does not exist yet.
///
/// Example: `Dune.epub`, then `Dune_2.epub`, `Dune_3.epub`, ...
#[must_use]
pub fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let base_path = dir.join(filename);
    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = match filename.rfind('.') {
        Some(pos) if pos > 0 => (&filename[..pos], &filename[pos..]),
        _ => (filename, ""),
    };

    for i in 2..1000 {
        let new_path = dir.join(format!("{stem}_{i}{ext}"));
        if !new_path.exists() {
            return new_path;
        }
    }

    // Fallback (extremely unlikely)
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    dir.join(format!("{stem}_{timestamp}{ext}"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn book(id: &str, title: &str, format: &str) -> BookMetadata {
        BookMetadata {
            id: id.to_string(),
            title: title.to_string(),
            author: None,
            format: format.to_string(),
            size: None,
            source_urls: Vec::new(),
        }
    }

    #[test]
    fn test_sanitize_title_drops_punctuation() {
        assert_eq!(
            sanitize_title("Dune: Messiah / Part 2?").as_deref(),
            Some("Dune Messiah  Part 2")
        );
        assert_eq!(sanitize_title("???"), None);
        assert_eq!(sanitize_title(" .. "), None);
    }

    #[test]
    fn test_sanitize_title_truncates_long_titles() {
        let long = "a".repeat(500);
        assert_eq!(sanitize_title(&long).unwrap().chars().count(), MAX_TITLE_CHARS);
    }

    #[test]
    fn test_sanitize_component_blocks_traversal() {
        assert_eq!(sanitize_filename_component("../../etc"), ".._.._etc");
        assert_eq!(sanitize_filename_component(".."), "__");
        assert!(!sanitize_filename_component("a/b").contains('/'));
    }

    #[test]
    fn test_staging_path_derives_from_id() {
        let path = staging_path(Path::new("/tmp/stage"), &book("abc123", "Same Title", "EPUB"));
        assert_eq!(path, Path::new("/tmp/stage/abc123.epub.part"));
    }

    #[test]
    fn test_encoded_ids_never_collide() {
        let ids = ["x y", "x_y", "x/y", "x.y", "x_20y", "xy", "", "..", "Ünï"];
        let staged: std::collections::HashSet<PathBuf> = ids
            .iter()
            .map(|id| staging_path(Path::new("/s"), &book(id, "T", "epub")))
            .collect();
        assert_eq!(staged.len(), ids.len());

        assert_eq!(encode_id_component("x y"), "x_20y");
        assert_eq!(encode_id_component("x_y"), "x_5fy");
        assert_eq!(encode_id_component(".."), "_2e_2e");
        assert!(!encode_id_component("a/b").contains('/'));
    }

    #[test]
    fn test_intermediate_path_uses_crdownload() {
        let path = intermediate_path(Path::new("/ingest"), "abc123");
        assert_eq!(path, Path::new("/ingest/abc123.crdownload"));
    }

    #[test]
    fn test_public_filename_title_or_id() {
        let b = book("abc123", "Dune", "epub");
        assert_eq!(public_filename(&b, true), "Dune.epub");
        assert_eq!(public_filename(&b, false), "abc123.epub");

        let untitled = book("abc123", "!!!", ".PDF");
        assert_eq!(public_filename(&untitled, true), "abc123.pdf");
    }

    #[test]
    fn test_resolve_unique_path_adds_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let first = resolve_unique_path(dir.path(), "Dune.epub");
        assert_eq!(first, dir.path().join("Dune.epub"));

        std::fs::write(&first, b"x").unwrap();
        let second = resolve_unique_path(dir.path(), "Dune.epub");
        assert_eq!(second, dir.path().join("Dune_2.epub"));
    }
}
