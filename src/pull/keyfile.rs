//! Key-file (config text) parsing.
//!
//! Both the local repository config and the remote's `/config` resource use
//! the same sections/keys/values text format:
//!
//! ```text
//! [core]
//! mode=archive
//!
//! [remote "origin"]
//! url=http://example.com/repo
//! branches=main;stable
//! ```
//!
//! Group names are taken verbatim between the brackets (they may contain
//! spaces and quotes, as in `remote "origin"`). Keys are trimmed; values
//! keep everything after the first `=` with surrounding whitespace trimmed.
//! `#` and `;` start comment lines. A later duplicate key overrides an
//! earlier one.

use super::errors::KeyFileError;

/// List separator for multi-valued keys such as `branches`.
const LIST_SEPARATOR: char = ';';

/// A parsed key file: ordered groups of ordered key/value pairs.
#[derive(Debug, Clone, Default)]
pub struct KeyFile {
    groups: Vec<Group>,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

impl KeyFile {
    /// Parses key-file text.
    ///
    /// # Errors
    /// Returns `KeyFileError::MalformedLine` for an unterminated group
    /// header, a key/value line outside any group, or a line with no `=`.
    pub fn parse(text: &str) -> Result<Self, KeyFileError> {
        let mut groups: Vec<Group> = Vec::new();

        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let Some(name) = rest.strip_suffix(']') else {
                    return Err(KeyFileError::MalformedLine {
                        line_no,
                        detail: "unterminated group header",
                    });
                };
                groups.push(Group {
                    name: name.to_string(),
                    entries: Vec::new(),
                });
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(KeyFileError::MalformedLine {
                    line_no,
                    detail: "expected 'key=value'",
                });
            };
            let Some(group) = groups.last_mut() else {
                return Err(KeyFileError::MalformedLine {
                    line_no,
                    detail: "key/value pair outside any group",
                });
            };
            group
                .entries
                .push((key.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self { groups })
    }

    /// Looks up a key, returning `None` if the group or key is absent.
    ///
    /// The last occurrence wins for duplicate groups and duplicate keys.
    #[must_use]
    pub fn string(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .rev()
            .filter(|g| g.name == group)
            .find_map(|g| {
                g.entries
                    .iter()
                    .rev()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| v.as_str())
            })
    }

    /// Looks up a key, falling back to `default` when absent.
    #[must_use]
    pub fn string_with_default<'a>(&'a self, group: &str, key: &str, default: &'a str) -> &'a str {
        self.string(group, key).unwrap_or(default)
    }

    /// Looks up a key that must be present.
    ///
    /// # Errors
    /// Returns `MissingGroup` or `MissingKey` naming what was absent.
    pub fn require_string(&self, group: &str, key: &str) -> Result<&str, KeyFileError> {
        if !self.groups.iter().any(|g| g.name == group) {
            return Err(KeyFileError::MissingGroup {
                group: group.to_string(),
            });
        }
        self.string(group, key).ok_or_else(|| KeyFileError::MissingKey {
            group: group.to_string(),
            key: key.to_string(),
        })
    }

    /// Looks up a `;`-separated list key.
    ///
    /// Returns `None` when the key is absent; empty elements (including a
    /// trailing separator) are dropped.
    #[must_use]
    pub fn string_list(&self, group: &str, key: &str) -> Option<Vec<String>> {
        self.string(group, key).map(|value| {
            value
                .split(LIST_SEPARATOR)
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# repository config
[core]
mode=archive

[remote "origin"]
url = http://example.com/repo
branches=main;stable;
"#;

    #[test]
    fn parses_groups_and_keys() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(kf.string("core", "mode"), Some("archive"));
        assert_eq!(
            kf.string(r#"remote "origin""#, "url"),
            Some("http://example.com/repo")
        );
        assert_eq!(kf.string("core", "missing"), None);
        assert_eq!(kf.string("nope", "mode"), None);
    }

    #[test]
    fn string_list_drops_empty_elements() {
        let kf = KeyFile::parse(SAMPLE).unwrap();
        assert_eq!(
            kf.string_list(r#"remote "origin""#, "branches"),
            Some(vec!["main".to_string(), "stable".to_string()])
        );
        assert_eq!(kf.string_list("core", "branches"), None);
    }

    #[test]
    fn last_duplicate_wins() {
        let kf = KeyFile::parse("[core]\nmode=bare\nmode=archive\n").unwrap();
        assert_eq!(kf.string("core", "mode"), Some("archive"));
    }

    #[test]
    fn default_fallback() {
        let kf = KeyFile::parse("[core]\n").unwrap();
        assert_eq!(kf.string_with_default("core", "mode", "bare"), "bare");
    }

    #[test]
    fn require_string_errors() {
        let kf = KeyFile::parse("[core]\nmode=archive\n").unwrap();
        assert!(kf.require_string("core", "mode").is_ok());
        assert!(matches!(
            kf.require_string("core", "url"),
            Err(KeyFileError::MissingKey { .. })
        ));
        assert!(matches!(
            kf.require_string("remote \"x\"", "url"),
            Err(KeyFileError::MissingGroup { .. })
        ));
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(KeyFile::parse("[core\nmode=archive\n").is_err());
        assert!(KeyFile::parse("mode=archive\n").is_err());
        assert!(KeyFile::parse("[core]\njust a line\n").is_err());
    }

    #[test]
    fn comments_and_blanks_are_skipped() {
        let kf = KeyFile::parse("# top\n\n[core]\n; mid\nmode=archive\n").unwrap();
        assert_eq!(kf.string("core", "mode"), Some("archive"));
    }
}
