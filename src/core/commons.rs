// src/core/commons.rs

//! Small string helpers shared by the line parser, the resolver and the executor.

/// Collapses every run of whitespace into a single space and trims the ends.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// If `text` starts with a single- or double-quoted string, returns its unescaped
/// contents and the remainder after the closing quote.
pub fn take_quoted(text: &str) -> Option<(String, &str)> {
    let mut chars = text.char_indices();
    let (_, quote) = chars.next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let mut value = String::new();
    let mut escaped = false;
    for (i, c) in chars {
        if escaped {
            value.push(c);
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == quote {
            return Some((value, text.get(i + c.len_utf8()..).unwrap_or("")));
        } else {
            value.push(c);
        }
    }
    None
}

/// Strips the quotes from a complete quoted string and unescapes it.
pub fn unquote(token: &str) -> Option<String> {
    match take_quoted(token) {
        Some((value, rest)) if rest.is_empty() => Some(value),
        _ => None,
    }
}

/// Returns the byte offset of the first occurrence of `needle` that is not inside
/// a single- or double-quoted string.
pub fn find_outside_quotes(text: &str, needle: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
        } else if text.get(i..).is_some_and(|rest| rest.starts_with(needle)) {
            return Some(i);
        }
    }
    None
}

/// Whether `text` contains a quote character that opens a string.
pub fn contains_string_literal(text: &str) -> bool {
    text.contains('\'') || text.contains('"')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_quoted_handles_escapes() {
        let (value, rest) = take_quoted(r#"'it\'s' and more"#).unwrap();
        assert_eq!(value, "it's");
        assert_eq!(rest, " and more");
        assert!(take_quoted("'unterminated").is_none());
        assert!(take_quoted("plain").is_none());
    }

    #[test]
    fn test_find_outside_quotes_skips_quoted_text() {
        let line = r#"Go to 'http://example.com' // comment"#;
        let idx = find_outside_quotes(line, "//").unwrap();
        assert_eq!(line.get(idx..).unwrap(), "// comment");
        assert_eq!(find_outside_quotes("'//'", "//"), None);
    }

    #[test]
    fn test_normalize_whitespace() {
        assert_eq!(normalize_whitespace("  a   b\tc "), "a b c");
    }
}
