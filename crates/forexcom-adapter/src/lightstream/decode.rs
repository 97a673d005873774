//! Field value decoding for the Lightstreamer text protocol
//!
//! Each pushed field token is interpreted against the last known value of
//! the same field for the same item:
//! - `$`        -> empty string
//! - `#`        -> null
//! - empty      -> unchanged since the previous update
//! - `$x`, `#x` -> literal `x` (escaped leading marker)
//! - otherwise  -> the token itself

/// Decoded field value. `None` is the protocol's null.
pub type FieldValue = Option<String>;

/// Decode one wire token using the field's previous value
pub fn decode(token: &str, previous: Option<&FieldValue>) -> FieldValue {
    match token {
        "$" => Some(String::new()),
        "#" => None,
        "" => previous.cloned().flatten(),
        t if t.starts_with('$') || t.starts_with('#') => Some(t[1..].to_string()),
        t => Some(t.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dollar_is_empty_string() {
        let prev = Some("1.2".to_string());
        assert_eq!(decode("$", Some(&prev)), Some(String::new()));
        assert_eq!(decode("$", None), Some(String::new()));
    }

    #[test]
    fn test_hash_is_null() {
        let prev = Some("1.2".to_string());
        assert_eq!(decode("#", Some(&prev)), None);
        assert_eq!(decode("#", None), None);
    }

    #[test]
    fn test_empty_keeps_previous() {
        let prev = Some("1.2".to_string());
        assert_eq!(decode("", Some(&prev)), prev);
        assert_eq!(decode("", Some(&Some(String::new()))), Some(String::new()));
        assert_eq!(decode("", Some(&None)), None);
        assert_eq!(decode("", None), None);
    }

    #[test]
    fn test_escaped_markers() {
        assert_eq!(decode("#abc", None), Some("abc".to_string()));
        assert_eq!(decode("$abc", Some(&Some("x".to_string()))), Some("abc".to_string()));
        assert_eq!(decode("$$", None), Some("$".to_string()));
    }

    #[test]
    fn test_plain_token() {
        assert_eq!(decode("100.5", Some(&Some("99".to_string()))), Some("100.5".to_string()));
    }
}
