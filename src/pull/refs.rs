//! Ref and filename validation, plus parsers for the remote ref resources.
//!
//! The remote publishes branch heads as single-checksum text bodies and a
//! `refs/summary` listing with one `"{checksum} {refname}"` line per ref.
//! Everything here operates on untrusted text: checksums, ref names, and
//! filenames embedded in tree records are all validated before use.

use super::errors::ValidationError;
use super::object_id::Checksum;

/// Validates a single filename as it may appear in a tree record.
///
/// Names must be non-empty, contain no `/` or NUL, and not be `.` or `..`.
/// A violation fails the pull: a hostile remote must not be able to smuggle
/// path traversal through a tree entry.
pub fn validate_filename(name: &str) -> Result<(), ValidationError> {
    let detail = if name.is_empty() {
        Some("empty name")
    } else if name == "." || name == ".." {
        Some("self or parent reference")
    } else if name.contains('/') {
        Some("contains '/'")
    } else if name.contains('\0') {
        Some("contains NUL")
    } else {
        None
    };
    match detail {
        Some(detail) => Err(ValidationError::InvalidFilename {
            name: name.to_string(),
            detail,
        }),
        None => Ok(()),
    }
}

/// Validates a ref name: non-empty `/`-separated components, each of which
/// must satisfy the filename rules.
pub fn validate_ref_name(name: &str) -> Result<(), ValidationError> {
    let invalid = |detail| {
        Err(ValidationError::InvalidRefName {
            name: name.to_string(),
            detail,
        })
    };
    if name.is_empty() {
        return invalid("empty name");
    }
    if name.starts_with('/') || name.ends_with('/') {
        return invalid("leading or trailing '/'");
    }
    for component in name.split('/') {
        if validate_filename(component).is_err() {
            return invalid("invalid path component");
        }
    }
    Ok(())
}

/// Parses and validates a checksum string (64 lowercase hex chars).
pub fn parse_checksum(text: &str) -> Result<Checksum, ValidationError> {
    Checksum::from_hex(text)
}

/// Returns true if `text` would parse as a checksum string.
///
/// Used by root resolution to distinguish raw commit ids from branch names
/// on the command line.
#[must_use]
pub fn is_checksum_string(text: &str) -> bool {
    Checksum::from_hex(text).is_ok()
}

/// Parses the body of `refs/heads/{branch}`: one checksum, trailing
/// whitespace tolerated.
pub fn parse_branch_head(body: &str) -> Result<Checksum, ValidationError> {
    parse_checksum(body.trim_end())
}

/// Parses the `refs/summary` body.
///
/// Grammar: lines split on `\n`, empty lines skipped; each non-empty line
/// must contain exactly one space, with a valid checksum before it and a
/// valid ref name after it. Entries are returned in file order; a duplicate
/// ref name later in the file supersedes an earlier one (callers insert
/// into a map in order).
pub fn parse_ref_summary(body: &str) -> Result<Vec<(String, Checksum)>, ValidationError> {
    let mut refs = Vec::new();
    for line in body.split('\n') {
        if line.is_empty() {
            continue;
        }
        let Some((csum_text, ref_name)) = line.split_once(' ') else {
            return Err(ValidationError::MalformedSummaryLine {
                line: line.to_string(),
                detail: "missing ' '",
            });
        };
        if ref_name.contains(' ') {
            return Err(ValidationError::MalformedSummaryLine {
                line: line.to_string(),
                detail: "more than one ' '",
            });
        }
        validate_ref_name(ref_name)?;
        let csum = parse_checksum(csum_text)?;
        refs.push((ref_name.to_string(), csum));
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_accepts_ordinary_names() {
        for name in ["a", "a.txt", "..a", "a..", "with space", "ünïcode"] {
            assert!(validate_filename(name).is_ok(), "{name} rejected");
        }
    }

    #[test]
    fn filename_rejects_hostile_names() {
        for name in ["", ".", "..", "a/b", "a\0b"] {
            assert!(validate_filename(name).is_err(), "{name:?} accepted");
        }
    }

    #[test]
    fn ref_name_components() {
        assert!(validate_ref_name("main").is_ok());
        assert!(validate_ref_name("release/v2").is_ok());
        assert!(validate_ref_name("").is_err());
        assert!(validate_ref_name("/main").is_err());
        assert!(validate_ref_name("main/").is_err());
        assert!(validate_ref_name("a//b").is_err());
        assert!(validate_ref_name("a/../b").is_err());
    }

    #[test]
    fn branch_head_trims_trailing_whitespace() {
        let hex = "ab".repeat(32);
        let body = format!("{hex}\n");
        assert_eq!(parse_branch_head(&body).unwrap().to_hex(), hex);
        assert!(parse_branch_head("junk\n").is_err());
    }

    #[test]
    fn is_checksum_string_distinguishes_branches() {
        assert!(is_checksum_string(&"ab".repeat(32)));
        assert!(!is_checksum_string("main"));
        assert!(!is_checksum_string(&"AB".repeat(32)));
    }

    #[test]
    fn summary_parses_multiple_lines() {
        let a = "aa".repeat(32);
        let b = "bb".repeat(32);
        let body = format!("{a} main\n\n{b} stable\n");
        let refs = parse_ref_summary(&body).unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].0, "main");
        assert_eq!(refs[1].0, "stable");
        assert_eq!(refs[1].1.to_hex(), b);
    }

    #[test]
    fn summary_rejects_line_without_space() {
        let err = parse_ref_summary("deadbeef\n").unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MalformedSummaryLine { .. }
        ));
    }

    #[test]
    fn summary_rejects_invalid_checksum() {
        let err = parse_ref_summary("deadbeef main\n").unwrap_err();
        assert!(matches!(err, ValidationError::InvalidChecksum { .. }));
    }

    #[test]
    fn summary_rejects_extra_space() {
        let a = "aa".repeat(32);
        let err = parse_ref_summary(&format!("{a} main extra\n")).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::MalformedSummaryLine { .. }
        ));
    }

    #[test]
    fn summary_rejects_bad_ref_name() {
        let a = "aa".repeat(32);
        let err = parse_ref_summary(&format!("{a} bad/../ref\n")).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidRefName { .. }));
    }
}
