// src/core/element_finder.rs

//! Parser for the `[...]` element-finder shorthand.
//!
//! Grammar, inside the brackets:
//! `ordinal? (quoted-text and/or variable)? ("next to" quoted-text)?`
//! At least one part must be present, and `next to` needs something before it.

use crate::{
    core::{commons, errors::TreeError},
    models::ElementFinder,
};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref ELEMENT_FINDER_RE: Regex = Regex::new(
        r#"^\s*(?:(?P<ordinal>\d+)(?:st|nd|rd|th)\s*)?(?P<text>'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*")?\s*(?P<variable>[A-Za-z_][\w\- ]*?)?\s*(?:next\s+to\s+(?P<next_to>'(?:[^'\\]|\\.)*'|"(?:[^"\\]|\\.)*"))?\s*$"#
    )
    .expect("element finder regex is valid");
}

/// Parses the contents of one `[...]` (without the brackets).
pub fn parse_element_finder(
    content: &str,
    filename: Option<&str>,
    line_number: usize,
) -> Result<ElementFinder, TreeError> {
    let invalid = || {
        TreeError::syntax(
            format!("Invalid element finder [{}]", content),
            filename,
            line_number,
        )
    };

    let caps = ELEMENT_FINDER_RE.captures(content).ok_or_else(invalid)?;

    let ordinal = match caps.name("ordinal") {
        Some(m) => Some(m.as_str().parse::<u32>().map_err(|_| invalid())?),
        None => None,
    };
    let text = caps
        .name("text")
        .and_then(|m| commons::unquote(m.as_str()));
    let variable = caps
        .name("variable")
        .map(|m| m.as_str().trim().to_string())
        .filter(|v| !v.is_empty());
    let next_to = caps
        .name("next_to")
        .and_then(|m| commons::unquote(m.as_str()));

    if ordinal.is_none() && text.is_none() && variable.is_none() && next_to.is_none() {
        return Err(invalid());
    }
    if next_to.is_some() && ordinal.is_none() && text.is_none() && variable.is_none() {
        return Err(TreeError::syntax(
            format!(
                "Invalid element finder [{}]: 'next to' must follow an ordinal, text or variable",
                content
            ),
            filename,
            line_number,
        ));
    }

    Ok(ElementFinder {
        ordinal,
        text,
        variable,
        next_to,
    })
}

/// Finds every `[...]` segment outside quotes and returns their byte spans
/// (including the brackets).
pub fn find_bracket_spans(text: &str) -> Vec<(usize, usize)> {
    let mut spans = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut open: Option<usize> = None;
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
        match c {
            '\'' | '"' if open.is_none() => quote = Some(c),
            '[' if open.is_none() => open = Some(i),
            ']' => {
                if let Some(start) = open.take() {
                    spans.push((start, i + 1));
                }
            }
            _ => {}
        }
    }
    spans
}

/// Parses every element finder in a line of step text.
pub fn parse_all(
    text: &str,
    filename: Option<&str>,
    line_number: usize,
) -> Result<Vec<ElementFinder>, TreeError> {
    find_bracket_spans(text)
        .into_iter()
        .filter_map(|(start, end)| text.get(start + 1..end - 1))
        .map(|content| parse_element_finder(content, filename, line_number))
        .collect()
}
