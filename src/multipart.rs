//! Hand-rolled `multipart/form-data` parsing.
//!
//! Upload bodies arrive as raw bytes and are parsed without an
//! intermediate string conversion so photo payloads survive byte-exact.
//! Scalar fields (uploader, address, coordinates) are small and texty;
//! the single file part can be arbitrary binary.

use std::collections::HashMap;

/// Fallback name for a file part whose `filename` attribute is empty.
pub const DEFAULT_FILE_NAME: &str = "upload.bin";

/// Result of parsing one multipart body.
///
/// `fields` holds every scalar part keyed by its form name, values
/// trimmed. At most one file part is retained; when a body carries
/// several, the last one wins.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ParsedForm {
    pub fields: HashMap<String, String>,
    pub file_name: Option<String>,
    pub file_content: Option<Vec<u8>>,
}

impl ParsedForm {
    /// Fetch a scalar field by name.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Extract the boundary token from a `Content-Type` header value.
///
/// Returns the bare token without the leading double hyphen; surrounding
/// quotes are stripped. `None` when the header carries no boundary.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let idx = content_type.find("boundary=")?;
    let raw = content_type[idx + "boundary=".len()..].trim();
    let raw = raw.strip_prefix('"').unwrap_or(raw);
    let raw = raw.strip_suffix('"').unwrap_or(raw);
    if raw.is_empty() {
        None
    } else {
        Some(raw.to_string())
    }
}

/// Parse a raw multipart body.
///
/// `boundary` is the delimiter including its leading double hyphen
/// (`--<token>`). Parts that lack a blank-line separator, carry no
/// `Content-Disposition` header, or declare no form name are skipped.
/// A part with a `filename` attribute is the file part even when the
/// declared name is empty; its body bytes are kept verbatim apart from
/// the single trailing CRLF the framing requires.
pub fn parse_form(body: &[u8], boundary: &str) -> ParsedForm {
    let mut form = ParsedForm::default();

    for part in split_on(body, boundary.as_bytes()) {
        let trimmed = part.trim_ascii();
        // Preamble before the first boundary and the final "--" sentinel.
        if trimmed.is_empty() || trimmed == b"--" {
            continue;
        }

        let Some(header_end) = find_subslice(part, b"\r\n\r\n") else {
            continue;
        };
        let raw_headers = &part[..header_end];
        let raw_body = &part[header_end + 4..];
        let content = raw_body.strip_suffix(b"\r\n").unwrap_or(raw_body);

        let header_text = String::from_utf8_lossy(raw_headers);
        let Some(disposition) = header_text
            .lines()
            .find(|line| line.to_ascii_lowercase().starts_with("content-disposition"))
        else {
            continue;
        };

        let Some(name) = quoted_attr(disposition, "name").filter(|n| !n.is_empty()) else {
            continue;
        };

        match quoted_attr(disposition, "filename") {
            Some(file_name) => {
                form.file_name = Some(if file_name.is_empty() {
                    DEFAULT_FILE_NAME.to_string()
                } else {
                    file_name
                });
                form.file_content = Some(content.to_vec());
            }
            None => {
                let value = String::from_utf8_lossy(content).trim().to_string();
                form.fields.insert(name, value);
            }
        }
    }

    form
}

/// Find a quoted attribute (`key="value"`) in a header line.
///
/// Matches whole attribute names only, so searching for `name` never
/// lands inside `filename`. The value may be empty.
fn quoted_attr(line: &str, key: &str) -> Option<String> {
    let pattern = format!("{key}=\"");
    let bytes = line.as_bytes();
    let mut search_from = 0;

    while let Some(rel) = line[search_from..].find(&pattern) {
        let start = search_from + rel;
        let preceded_by_word = start > 0 && bytes[start - 1].is_ascii_alphanumeric();
        if !preceded_by_word {
            let value_start = start + pattern.len();
            let value_end = line[value_start..].find('"')? + value_start;
            return Some(line[value_start..value_end].to_string());
        }
        search_from = start + pattern.len();
    }

    None
}

/// Locate the first occurrence of `needle` in `haystack`.
fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Split a byte slice on every occurrence of `delimiter`.
///
/// The delimiter itself never appears in the returned segments. Like the
/// equivalent string split, N delimiters yield N + 1 segments, some of
/// which may be empty.
fn split_on<'a>(buf: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    if delimiter.is_empty() {
        return vec![buf];
    }

    let mut segments = Vec::new();
    let mut rest = buf;
    while let Some(pos) = find_subslice(rest, delimiter) {
        segments.push(&rest[..pos]);
        rest = &rest[pos + delimiter.len()..];
    }
    segments.push(rest);
    segments
}
