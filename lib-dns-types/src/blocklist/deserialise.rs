//! Parsing of blocklist files: one domain per line, `#` comments,
//! blank lines ignored.

use crate::blocklist::types::{Blocklist, Error};

impl Blocklist {
    /// Parse a string of blocklist data.
    ///
    /// Lines whose first non-whitespace character is `#` are
    /// comments.  A line that fails normalisation does not abort the
    /// parse: it is skipped and reported, and the caller decides what
    /// to do about it.
    pub fn deserialise(data: &str) -> (Self, Vec<SkippedLine>) {
        let mut blocklist = Self::new();
        let mut skipped = Vec::new();

        for (index, line) in split_lines(data).enumerate() {
            let trimmed = line.trim_matches(|c: char| c.is_ascii_whitespace());
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            if let Err(error) = blocklist.insert(trimmed) {
                skipped.push(SkippedLine {
                    number: index + 1,
                    text: trimmed.to_owned(),
                    error,
                });
            }
        }

        (blocklist, skipped)
    }
}

/// A line that failed normalisation and was left out of the
/// blocklist.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct SkippedLine {
    /// 1-based line number.
    pub number: usize,
    /// The line with surrounding whitespace stripped.
    pub text: String,
    pub error: Error,
}

/// Split on LF, CRLF, or bare CR line endings.
fn split_lines(data: &str) -> impl Iterator<Item = &str> {
    data.split('\n')
        .flat_map(|chunk| chunk.strip_suffix('\r').unwrap_or(chunk).split('\r'))
}
