// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic conversion between dot/bracket paths and RFC 6901 pointers.
//!
//! Validation issues carry both forms: `entities[0].fields[2].id` and
//! `/entities/0/fields/2/id`. The conversion must be deterministic so
//! callers can correlate issues across surfaces.

/// Escape a single RFC 6901 reference token.
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

/// Unescape a single RFC 6901 reference token.
fn unescape_token(token: &str) -> String {
    token.replace("~1", "/").replace("~0", "~")
}

/// Convert a dot/bracket path (`entities[0].fields[2].id`) to an RFC 6901
/// JSON Pointer (`/entities/0/fields/2/id`).
///
/// A leading `$.` or `$` root marker is stripped. The empty path maps to the
/// whole-document pointer `""`.
#[must_use]
pub fn dot_path_to_pointer(path: &str) -> String {
    let path = path.strip_prefix("$.").unwrap_or(path);
    let path = if path == "$" { "" } else { path };
    if path.is_empty() {
        return String::new();
    }

    let mut out = String::new();
    for segment in path.split('.') {
        let mut rest = segment;
        // Peel bracketed indices off the tail: "fields[2][0]" -> fields, 2, 0.
        let name_end = rest.find('[').unwrap_or(rest.len());
        let name = &rest[..name_end];
        if !name.is_empty() {
            out.push('/');
            out.push_str(&escape_token(name));
        }
        rest = &rest[name_end..];
        while let Some(close) = rest.find(']') {
            let idx = &rest[1..close];
            out.push('/');
            out.push_str(&escape_token(idx));
            rest = &rest[close + 1..];
            if !rest.starts_with('[') {
                break;
            }
        }
    }
    out
}

/// Convert an RFC 6901 JSON Pointer to dot/bracket form.
///
/// Numeric tokens render as bracketed indices; everything else joins with
/// dots. The whole-document pointer maps to the empty path.
#[must_use]
pub fn pointer_to_dot_path(pointer: &str) -> String {
    if pointer.is_empty() {
        return String::new();
    }
    let mut out = String::new();
    for token in pointer.split('/').skip(1) {
        let token = unescape_token(token);
        if !token.is_empty() && token.bytes().all(|b| b.is_ascii_digit()) {
            out.push('[');
            out.push_str(&token);
            out.push(']');
        } else {
            if !out.is_empty() {
                out.push('.');
            }
            out.push_str(&token);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_indices() {
        let dot = "entities[0].fields[2].id";
        let pointer = dot_path_to_pointer(dot);
        assert_eq!(pointer, "/entities/0/fields/2/id");
        assert_eq!(pointer_to_dot_path(&pointer), dot);
    }

    #[test]
    fn strips_root_marker() {
        assert_eq!(dot_path_to_pointer("$.views[1].kind"), "/views/1/kind");
        assert_eq!(dot_path_to_pointer("$"), "");
    }

    #[test]
    fn escapes_special_tokens() {
        assert_eq!(dot_path_to_pointer("a/b"), "/a~1b");
        assert_eq!(pointer_to_dot_path("/a~1b/~0key"), "a/b.~key");
    }

    #[test]
    fn empty_path_is_document_root() {
        assert_eq!(dot_path_to_pointer(""), "");
        assert_eq!(pointer_to_dot_path(""), "");
    }
}
