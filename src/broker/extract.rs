//! Token extraction from upstream responses without full
//! deserialization. Endpoint responses are mixed text-or-JSON payloads;
//! the value is located positionally so partial or oddly shaped bodies
//! still yield the token.

/// Extract a token value from a response body. The query-string form
/// (`[?&/]token=VALUE`, terminated by `&` or end of string) is preferred;
/// the JSON form (`"token":"VALUE"`, optional whitespace) is the
/// fallback.
pub fn extract_token(body: &str) -> Option<String> {
    extract_query_form(body).or_else(|| extract_json_form(body))
}

/// Extract a numeric `"expires"` field (epoch milliseconds) when the
/// endpoint reports one.
pub fn extract_expires_ms(body: &str) -> Option<u64> {
    let idx = body.find("\"expires\"")?;
    let rest = body[idx + "\"expires\"".len()..].trim_start();
    let rest = rest.strip_prefix(':')?.trim_start();
    let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        None
    } else {
        digits.parse().ok()
    }
}

fn extract_query_form(body: &str) -> Option<String> {
    let bytes = body.as_bytes();
    let mut search = 0;
    while let Some(rel) = body[search..].find("token=") {
        let idx = search + rel;
        let preceded = idx == 0 || matches!(bytes[idx - 1], b'?' | b'&' | b'/');
        if preceded {
            let value_start = idx + "token=".len();
            let rest = &body[value_start..];
            let end = rest.find('&').unwrap_or(rest.len());
            let value = &rest[..end];
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
        search = idx + "token=".len();
    }
    None
}

fn extract_json_form(body: &str) -> Option<String> {
    let mut search = 0;
    while let Some(rel) = body[search..].find("\"token\"") {
        let idx = search + rel;
        let rest = body[idx + "\"token\"".len()..].trim_start();
        if let Some(rest) = rest.strip_prefix(':') {
            let rest = rest.trim_start();
            if let Some(rest) = rest.strip_prefix('"') {
                if let Some(end) = rest.find('"') {
                    return Some(rest[..end].to_string());
                }
            }
        }
        search = idx + "\"token\"".len();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_form() {
        assert_eq!(
            extract_token(r#"{"token":"abc123","expires":1700000000000}"#).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_json_form_with_whitespace() {
        assert_eq!(
            extract_token(r#"{ "token" : "abc123" }"#).as_deref(),
            Some("abc123")
        );
    }

    #[test]
    fn test_query_form_terminated_by_ampersand() {
        assert_eq!(
            extract_token("f=json&token=XYZ&expires=60").as_deref(),
            Some("XYZ")
        );
    }

    #[test]
    fn test_query_form_at_end_of_string() {
        assert_eq!(extract_token("?token=XYZ").as_deref(), Some("XYZ"));
        assert_eq!(extract_token("token=XYZ").as_deref(), Some("XYZ"));
        assert_eq!(extract_token("base/token=XYZ").as_deref(), Some("XYZ"));
    }

    #[test]
    fn test_query_form_preferred_over_json() {
        // Mixed payload: positional query form wins
        assert_eq!(
            extract_token(r#"url?token=FIRST {"token":"SECOND"}"#).as_deref(),
            Some("FIRST")
        );
    }

    #[test]
    fn test_embedded_key_names_do_not_match() {
        // access_token=... is not the token parameter
        assert_eq!(extract_token("access_token=NOPE"), None);
        // "tokenServicesUrl" is not the token field
        assert_eq!(
            extract_token(r#"{"tokenServicesUrl":"https://x.example/gen"}"#),
            None
        );
    }

    #[test]
    fn test_round_trip_with_surrounding_bytes() {
        for body in [
            r#"{"ok":true,"token":"X"}"#.to_string(),
            "junk&token=X&more=1".to_string(),
            format!("prefix {} suffix", r#""token": "X""#),
        ] {
            assert_eq!(extract_token(&body).as_deref(), Some("X"), "body: {body}");
        }
    }

    #[test]
    fn test_missing_token_yields_none() {
        assert_eq!(extract_token(r#"{"error":"denied"}"#), None);
        assert_eq!(extract_token(""), None);
    }

    #[test]
    fn test_expires_extraction() {
        assert_eq!(
            extract_expires_ms(r#"{"token":"t","expires":1699999999999}"#),
            Some(1699999999999)
        );
        assert_eq!(extract_expires_ms(r#"{"expires" : 5000}"#), Some(5000));
        assert_eq!(extract_expires_ms(r#"{"token":"t"}"#), None);
    }
}
