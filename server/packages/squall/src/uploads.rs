//! Upload validation.
//!
//! Caller-supplied `(path, content)` pairs are normalized and checked
//! against the sandbox input root and the batch limits before any
//! sandbox exists. The batch is all-or-nothing: one bad entry rejects
//! everything, and nothing is written anywhere on rejection.

use std::collections::BTreeMap;

use squall_error::{SquallError, UploadRejectReason};

/// Directory inside the sandbox that uploads must resolve under.
pub const INPUT_ROOT: &str = "/home/user";

/// Maximum number of files per request.
pub const MAX_UPLOAD_FILES: usize = 20;

/// Maximum size of a single uploaded file.
pub const MAX_FILE_BYTES: usize = 5_000_000;

/// Maximum aggregate size of an upload batch.
pub const MAX_TOTAL_BYTES: usize = 10_000_000;

/// An upload entry that passed validation. `path` is relative to
/// [`INPUT_ROOT`] and free of `.`/`..` segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
    pub path: String,
    pub content: String,
}

/// Validate a batch of uploads.
///
/// Paths are normalized before the containment check: a path that looks
/// harmless but resolves above the input root after normalization is
/// still rejected. Entries that normalize to the same path collapse,
/// last one wins.
pub fn validate_uploads(
    files: &BTreeMap<String, String>,
) -> Result<Vec<ValidatedUpload>, SquallError> {
    if files.len() > MAX_UPLOAD_FILES {
        return Err(SquallError::UploadRejected {
            reason: UploadRejectReason::TooManyFiles,
            message: format!("too many files: {} (max {MAX_UPLOAD_FILES})", files.len()),
        });
    }

    let mut total = 0usize;
    for (path, content) in files {
        let size = content.len();
        if size > MAX_FILE_BYTES {
            return Err(SquallError::UploadRejected {
                reason: UploadRejectReason::PayloadTooLarge,
                message: format!(
                    "file {path:?} is {size} bytes (per-file max {MAX_FILE_BYTES})"
                ),
            });
        }
        total += size;
    }
    if total > MAX_TOTAL_BYTES {
        return Err(SquallError::UploadRejected {
            reason: UploadRejectReason::PayloadTooLarge,
            message: format!("total file size {total} bytes exceeds {MAX_TOTAL_BYTES} byte limit"),
        });
    }

    let mut validated = BTreeMap::new();
    for (path, content) in files {
        let normalized = normalize_path(path).ok_or_else(|| SquallError::UploadRejected {
            reason: UploadRejectReason::PathTraversal,
            message: format!("path escapes the sandbox input root: {path:?}"),
        })?;
        validated.insert(normalized, content.clone());
    }

    Ok(validated
        .into_iter()
        .map(|(path, content)| ValidatedUpload { path, content })
        .collect())
}

/// Normalize a caller path to a safe path relative to [`INPUT_ROOT`].
///
/// Absolute paths are accepted only when they already point under the
/// input root; everything else must stay inside it after resolving
/// `.`/`..` segments. Returns `None` for any path that escapes.
fn normalize_path(path: &str) -> Option<String> {
    let relative = if let Some(stripped) = path.strip_prefix('/') {
        // Absolute: only allowed when it targets the input root.
        let root = INPUT_ROOT.trim_start_matches('/');
        let stripped = stripped.trim_start_matches('/');
        let rest = stripped.strip_prefix(root)?;
        // Guard against prefix matches on a segment boundary only,
        // e.g. /home/username must not pass as /home/user.
        if !rest.is_empty() && !rest.starts_with('/') {
            return None;
        }
        rest.trim_start_matches('/')
    } else {
        path
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in relative.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                // Popping past the root means the path escapes.
                segments.pop()?;
            }
            other => segments.push(other),
        }
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn accepts_and_normalizes_safe_paths() {
        let files = batch(&[
            ("src/main.py", "print('hi')"),
            ("./docs/../README.md", "readme"),
            ("/home/user/notes.txt", "notes"),
        ]);
        let validated = validate_uploads(&files).expect("valid batch");
        let paths: Vec<&str> = validated.iter().map(|v| v.path.as_str()).collect();
        assert_eq!(paths, vec!["README.md", "notes.txt", "src/main.py"]);
    }

    #[test]
    fn rejects_traversal_and_writes_nothing_from_the_batch() {
        let files = batch(&[("ok.txt", "fine"), ("../../etc/passwd", "root::0:0")]);
        let err = validate_uploads(&files).unwrap_err();
        assert!(matches!(
            err,
            SquallError::UploadRejected {
                reason: UploadRejectReason::PathTraversal,
                ..
            }
        ));
    }

    #[test]
    fn rejects_paths_that_escape_only_after_normalization() {
        // Syntactically nested, semantically above the root.
        let files = batch(&[("src/../../outside.txt", "x")]);
        let err = validate_uploads(&files).unwrap_err();
        assert!(matches!(
            err,
            SquallError::UploadRejected {
                reason: UploadRejectReason::PathTraversal,
                ..
            }
        ));
    }

    #[test]
    fn rejects_absolute_paths_outside_the_input_root() {
        for path in ["/etc/passwd", "/home/username/x.txt"] {
            let files = batch(&[(path, "root::0:0")]);
            let err = validate_uploads(&files).unwrap_err();
            assert!(
                matches!(
                    err,
                    SquallError::UploadRejected {
                        reason: UploadRejectReason::PathTraversal,
                        ..
                    }
                ),
                "path {path:?}"
            );
        }
    }

    #[test]
    fn rejects_too_many_files() {
        let files: BTreeMap<String, String> = (0..=MAX_UPLOAD_FILES)
            .map(|i| (format!("file{i}.txt"), "x".to_string()))
            .collect();
        let err = validate_uploads(&files).unwrap_err();
        assert!(matches!(
            err,
            SquallError::UploadRejected {
                reason: UploadRejectReason::TooManyFiles,
                ..
            }
        ));
    }

    #[test]
    fn rejects_oversized_single_file() {
        let content = "x".repeat(MAX_FILE_BYTES + 1);
        let files = batch(&[("big.bin", content.as_str())]);
        let err = validate_uploads(&files).unwrap_err();
        assert!(matches!(
            err,
            SquallError::UploadRejected {
                reason: UploadRejectReason::PayloadTooLarge,
                ..
            }
        ));
    }

    #[test]
    fn rejects_aggregate_over_limit_even_when_each_file_is_within_per_file_limit() {
        // Three files at 4 MB each: individually fine, 12 MB combined.
        let content = "x".repeat(4_000_000);
        let files = batch(&[
            ("a.bin", content.as_str()),
            ("b.bin", content.as_str()),
            ("c.bin", content.as_str()),
        ]);
        let err = validate_uploads(&files).unwrap_err();
        assert!(matches!(
            err,
            SquallError::UploadRejected {
                reason: UploadRejectReason::PayloadTooLarge,
                ..
            }
        ));
    }

    #[test]
    fn rejects_paths_that_normalize_to_nothing() {
        for path in [".", "a/..", "/home/user", ""] {
            let files = batch(&[(path, "x")]);
            assert!(validate_uploads(&files).is_err(), "path {path:?}");
        }
    }
}
