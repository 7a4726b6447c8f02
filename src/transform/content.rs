//! Content normalization helpers
//!
//! Timestamp parsing, HTML stripping, quote normalization and
//! filesystem-safe display names. These are pure functions shared by the
//! transformer and the message handlers.

use chrono::{DateTime, NaiveDateTime, Utc};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref TAG: Regex = Regex::new(r"<[^>]*>").unwrap();
    static ref EDIT_MARKER: Regex = Regex::new(r"<e_m.*>").unwrap();
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
}

/// Maximum codepoints kept in a sanitized display name
const MAX_NAME_LEN: usize = 255;

/// Parse an exported timestamp string.
///
/// Returns `(date, time, instant)` on success. Skype writes RFC 3339 with a
/// trailing `Z`; a naive `YYYY-MM-DDTHH:MM:SS[.fff]` fallback is accepted
/// and taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<(String, String, DateTime<Utc>)> {
    let instant = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f").map(|naive| naive.and_utc())
        })
        .ok()?;

    let date = instant.format("%Y-%m-%d").to_string();
    let time = instant.format("%H:%M:%S").to_string();
    Some((date, time, instant))
}

/// Strip markup and decode entities, then normalize quotes.
pub fn clean_content(raw: &str) -> String {
    let stripped = TAG.replace_all(raw, "");
    let decoded = html_escape::decode_html_entities(stripped.as_ref());
    normalize_quotes(decoded.as_ref()).trim().to_string()
}

/// Replace curly quotes with their ASCII equivalents.
pub fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' => '\'',
            '\u{201C}' | '\u{201D}' => '"',
            other => other,
        })
        .collect()
}

/// Whether content carries Skype's edit marker.
pub fn has_edit_marker(content: &str) -> bool {
    EDIT_MARKER.is_match(content)
}

/// Make a display name safe for filesystem paths: drop `/\:*?"<>|` and
/// control characters, collapse whitespace, cap the length.
pub fn safe_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .filter(|c| !matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') && !c.is_control())
        .collect();
    let collapsed = WHITESPACE_RUN.replace_all(cleaned.trim(), " ");
    collapsed.chars().take(MAX_NAME_LEN).collect()
}

/// Derive a display name for a conversation that has none: the part of the
/// id after the first `:`, sanitized.
pub fn display_name_from_id(conversation_id: &str) -> String {
    let tail = conversation_id
        .split_once(':')
        .map(|(_, rest)| rest)
        .unwrap_or(conversation_id);
    safe_filename(tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_rfc3339() {
        let (date, time, instant) = parse_timestamp("2023-01-15T14:30:05Z").unwrap();
        assert_eq!(date, "2023-01-15");
        assert_eq!(time, "14:30:05");
        assert_eq!(instant.timestamp(), 1673793005);
    }

    #[test]
    fn test_parse_timestamp_with_offset() {
        let (_, time, _) = parse_timestamp("2023-01-15T14:30:05+02:00").unwrap();
        // Normalized to UTC
        assert_eq!(time, "12:30:05");
    }

    #[test]
    fn test_parse_timestamp_naive_fallback() {
        let (date, _, _) = parse_timestamp("2023-01-15T14:30:05.123").unwrap();
        assert_eq!(date, "2023-01-15");
    }

    #[test]
    fn test_parse_timestamp_garbage() {
        assert!(parse_timestamp("not a timestamp").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn test_clean_content_strips_tags() {
        assert_eq!(clean_content("<b>hello</b> world"), "hello world");
        assert_eq!(clean_content("hi"), "hi");
        assert_eq!(clean_content("<div></div>"), "");
    }

    #[test]
    fn test_clean_content_decodes_entities() {
        assert_eq!(clean_content("a &amp; b &lt;3"), "a & b <3");
    }

    #[test]
    fn test_clean_content_normalizes_quotes() {
        assert_eq!(clean_content("\u{201C}hi\u{201D} it\u{2019}s"), "\"hi\" it's");
    }

    #[test]
    fn test_edit_marker() {
        assert!(has_edit_marker("edited <e_m ts=\"123\"></e_m>"));
        assert!(has_edit_marker("<e_m>"));
        assert!(!has_edit_marker("plain text"));
        assert!(!has_edit_marker("<em>emphasis</em>"));
    }

    #[test]
    fn test_safe_filename_strips_unsafe_characters() {
        assert_eq!(safe_filename("a/b\\c:d*e?f\"g<h>i|j"), "abcdefghij");
        assert_eq!(safe_filename("normal name"), "normal name");
    }

    #[test]
    fn test_safe_filename_collapses_whitespace() {
        assert_eq!(safe_filename("  a \t b\n c  "), "a b c");
    }

    #[test]
    fn test_safe_filename_truncates() {
        let long = "x".repeat(300);
        assert_eq!(safe_filename(&long).chars().count(), 255);
    }

    #[test]
    fn test_display_name_from_id() {
        assert_eq!(display_name_from_id("8:alice.smith"), "alice.smith");
        assert_eq!(display_name_from_id("19:groupchat@thread.skype"), "groupchat@thread.skype");
        assert_eq!(display_name_from_id("nocolon"), "nocolon");
    }
}
