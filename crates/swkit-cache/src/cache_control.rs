//! `Cache-Control` inspection for cached responses.

use hashbrown::HashMap;

use crate::request::Response;

/// Whether `response` declares a positive `max-age`.
///
/// Absent, empty, negative or malformed directives all count as "not long
/// term cacheable".
pub fn response_uses_long_term_caching(response: &Response) -> bool {
    response
        .header_str("cache-control")
        .and_then(parse_max_age)
        .is_some_and(|max_age| max_age > 0)
}

/// Extract `max-age` (seconds) from a `Cache-Control` header value.
pub fn parse_max_age(header: &str) -> Option<u64> {
    let directives = parse_directives(header);
    parse_duration(directives.get("max-age")?.as_deref()?)
}

/// Split a header into lowercased directive names and raw values.
///
/// Quoted values keep their quotes. A later directive with the same name
/// replaces an earlier one.
fn parse_directives(header: &str) -> HashMap<String, Option<String>> {
    let bytes = header.as_bytes();
    let mut directives = HashMap::new();
    let mut i = 0;

    while i < bytes.len() {
        if !bytes[i].is_ascii_alphabetic() {
            i += 1;
            continue;
        }

        let start = i;
        i += 1;
        while i < bytes.len()
            && (bytes[i].is_ascii_alphabetic() || bytes[i] == b'_' || bytes[i] == b'-')
        {
            i += 1;
        }
        let name_end = i;

        let mut lookahead = i;
        while lookahead < bytes.len() && bytes[lookahead].is_ascii_whitespace() {
            lookahead += 1;
        }

        if lookahead >= bytes.len() || bytes[lookahead] != b'=' {
            directives.insert(header[start..name_end].to_ascii_lowercase(), None);
            continue;
        }

        // Whitespace before `=` stays part of the name, so `max-age = 5`
        // does not register as `max-age`.
        let name = header[start..lookahead].to_ascii_lowercase();
        i = lookahead + 1;

        let value_start = i;
        if i < bytes.len() && bytes[i] == b'"' {
            if let Some(close) = header[i + 1..].find('"') {
                i = i + 1 + close + 1;
                directives.insert(name, Some(header[value_start..i].trim().to_string()));
                continue;
            }
        }

        while i < bytes.len() && !matches!(bytes[i], b' ' | b'\t' | b'"' | b',' | b';') {
            i += 1;
        }
        let value = header[value_start..i].trim();
        directives.insert(name, Some(value.to_string()));
    }

    directives
}

/// Leading decimal integer, as `parseInt(value, 10)` reads it. Negative or
/// missing numbers yield `None`.
fn parse_duration(value: &str) -> Option<u64> {
    let value = value.trim_start();
    if value.is_empty() {
        return None;
    }

    let (negative, digits) = match value.as_bytes()[0] {
        b'-' => (true, &value[1..]),
        b'+' => (false, &value[1..]),
        _ => (false, value),
    };

    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    if end == 0 {
        return None;
    }

    let number = digits[..end].parse::<u64>().unwrap_or(u64::MAX);
    if negative && number > 0 {
        return None;
    }
    Some(number)
}
