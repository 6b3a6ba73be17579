//! Cross-server cursor codec.
//!
//! A cursor is `base64("<server-name>:<inner-cursor>")` where the inner
//! cursor may be empty ("start at this server's first page"). Anything that
//! fails validation decodes to `None`, which callers treat as "start from the
//! first server of the filtered set".

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

/// Upper bound on the decoded payload.
const MAX_DECODED_LEN: usize = 1000;

/// Upper bound on the server-name half. Catalog validation is stricter
/// (50 chars), so every cursor the proxy can emit also decodes.
const MAX_NAME_LEN: usize = 100;

pub fn encode_cursor(server: &str, inner: &str) -> String {
    BASE64.encode(format!("{server}:{inner}"))
}

/// Decode and validate a cursor. Returns `(server, inner)` or `None` when
/// the cursor is malformed in any way.
pub fn decode_cursor(cursor: &str) -> Option<(String, String)> {
    let decoded = BASE64.decode(cursor).ok()?;
    if decoded.len() > MAX_DECODED_LEN {
        return None;
    }
    let decoded = String::from_utf8(decoded).ok()?;
    let (name, inner) = match decoded.split_once(':') {
        Some((name, inner)) => (name, inner),
        None => (decoded.as_str(), ""),
    };
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return None;
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((name.to_string(), inner.to_string()))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn round_trips_name_and_inner() {
        let cases = [
            ("alpha", ""),
            ("alpha", "page-2"),
            ("with_underscore-and-dash", "x:y:z"),
            ("a", &"i".repeat(900)),
            (&"n".repeat(100), "tail"),
        ];
        for (name, inner) in cases {
            let cursor = encode_cursor(name, inner);
            assert_eq!(
                decode_cursor(&cursor),
                Some((name.to_string(), inner.to_string())),
                "cursor for ({name}, {inner:?}) must round-trip"
            );
        }
    }

    #[test]
    fn inner_may_contain_colons() {
        let cursor = encode_cursor("srv", "a:b:c");
        assert_eq!(
            decode_cursor(&cursor),
            Some(("srv".to_string(), "a:b:c".to_string()))
        );
    }

    #[test]
    fn rejects_invalid_base64() {
        assert_eq!(decode_cursor("!!not-base64!!"), None);
    }

    #[test]
    fn rejects_empty_and_oversized_names() {
        assert_eq!(decode_cursor(&BASE64.encode(":inner")), None);
        let long_name = "n".repeat(101);
        assert_eq!(decode_cursor(&encode_cursor(&long_name, "")), None);
    }

    #[test]
    fn rejects_names_outside_the_charset() {
        assert_eq!(decode_cursor(&BASE64.encode("bad name:x")), None);
        assert_eq!(decode_cursor(&BASE64.encode("bad/name:x")), None);
    }

    #[test]
    fn rejects_oversized_payloads() {
        let cursor = BASE64.encode(format!("srv:{}", "i".repeat(1100)));
        assert_eq!(decode_cursor(&cursor), None);
    }

    #[test]
    fn missing_colon_means_empty_inner() {
        assert_eq!(
            decode_cursor(&BASE64.encode("solo")),
            Some(("solo".to_string(), String::new()))
        );
    }
}
