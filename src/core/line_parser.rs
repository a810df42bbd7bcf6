// src/core/line_parser.rs

//! Turns one raw source line into a `Step`.
//!
//! A line is read right to left: the `//` comment is removed first, then a trailing
//! `{` code-block opener, then the trailing identifier tokens (`-T`, `-M`, `-`, `~`,
//! `$`, `+`, `..`, `#`). What remains is the step text, which may start with `*`
//! (a function declaration) or with `{var} = ...` assignments.

use crate::{
    constants::{FREQUENCY_VAR, GROUP_VAR},
    core::{commons, element_finder, errors::TreeError},
    models::{Frequency, HookKind, Identifiers, NodeKind, Step, VarAssignment, VarValue},
};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // `{var} =` or `{{var}} =` at the start of the remaining text.
    static ref VAR_HEAD_RE: Regex =
        Regex::new(r"^\{(\{)?([^{}]+)\}(\})?\s*=\s*").expect("var head regex is valid");
    // Any assignment head anywhere, used to reject `{a} = F, {b} = 'x'`.
    static ref VAR_ANYWHERE_RE: Regex =
        Regex::new(r"\{\{?[^{}]+\}\}?\s*=").expect("var anywhere regex is valid");
    // Variable references, local or not.
    static ref VAR_REF_RE: Regex =
        Regex::new(r"\{\{[^{}]*\}\}|\{[^{}]*\}").expect("var ref regex is valid");
    // Content of a one-line `{...}` that reads like a variable name instead of code.
    static ref BARE_NAME_RE: Regex =
        Regex::new(r"^\s*[A-Za-z_][\w ]*\s*$").expect("bare name regex is valid");
}

/// The result of parsing one line.
#[derive(Debug, Clone)]
pub struct ParsedLine {
    /// The parsed step. `code_block` is `Some("")` while a multi-line block is still open.
    pub step: Step,
    /// The line ends in `{` and the body follows on the next lines.
    pub opens_code_block: bool,
}

/// Parses a single line of source. Blank and comment-only lines are the caller's concern.
pub fn parse_line(
    line: &str,
    filename: Option<&str>,
    line_number: usize,
) -> Result<ParsedLine, TreeError> {
    let syntax = |message: String| TreeError::syntax(message, filename, line_number);

    let mut step = Step::new(NodeKind::Step);
    step.filename = filename.map(str::to_string);
    step.line_number = line_number;
    step.line = line.to_string();

    // --- 1. Comment ---
    let mut body = line.trim();
    if let Some(idx) = commons::find_outside_quotes(body, "//") {
        let comment = body.get(idx + 2..).unwrap_or("").trim();
        step.comment = Some(comment.to_string());
        body = body.get(..idx).unwrap_or("").trim_end();
    }

    // --- 2. Code block ---
    let mut opens_code_block = false;
    if let Some(head) = body.strip_suffix('{') {
        opens_code_block = true;
        step.code_block = Some(String::new());
        body = head.trim_end();
    } else if body.starts_with('*') {
        if let Some((head, code)) = split_one_line_code_block(body) {
            step.code_block = Some(code.trim().to_string());
            body = head;
        }
    }

    // --- 3. Lone sequential marker ---
    if body == ".." {
        if step.code_block.is_some() {
            return Err(syntax("A '..' line cannot have a code block".to_string()));
        }
        step.identifiers.is_sequential = true;
        return Ok(ParsedLine {
            step,
            opens_code_block,
        });
    }

    // --- 4. Function declaration prefix ---
    let mut text = body;
    if let Some(rest) = text.strip_prefix('*') {
        step.identifiers.is_function_declaration = true;
        text = rest.trim_start();
    }

    // --- 5. Trailing identifiers ---
    text = strip_identifiers(text, &mut step.identifiers);
    step.text = text.trim().to_string();

    if step.text.is_empty() {
        return Err(syntax("A step must have text".to_string()));
    }
    if step
        .text
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == ',' || c.is_whitespace())
    {
        return Err(syntax(format!(
            "Invalid step name '{}'. A step cannot consist only of digits, periods and commas",
            step.text
        )));
    }

    // --- 6. Hooks and declarations ---
    let ids = &step.identifiers;
    if ids.is_function_declaration {
        if ids.is_textual_step {
            return Err(syntax(
                "A function declaration cannot be a textual step (-)".to_string(),
            ));
        }
        if commons::contains_string_literal(&step.text) {
            return Err(syntax(
                "A function declaration cannot contain string literals".to_string(),
            ));
        }
        if VAR_REF_RE
            .find_iter(&step.text)
            .any(|m| !m.as_str().starts_with("{{"))
        {
            return Err(syntax(
                "A function declaration can only use {{local}} variables in its name".to_string(),
            ));
        }
        step.hook = HookKind::from_text(&step.text);
        if step.hook.is_some() {
            if step.code_block.is_none() {
                return Err(syntax(format!(
                    "The hook '{}' must have a code block",
                    step.text
                )));
            }
            if ids.is_only || ids.is_debug {
                return Err(syntax(
                    "A hook cannot be marked with $ or ~".to_string(),
                ));
            }
        }
    } else if let Some(kind) = HookKind::from_text(&step.text) {
        return Err(syntax(format!(
            "The hook '{}' must be declared with a leading '*'",
            kind.name()
        )));
    }

    // --- 7. Variable assignments ---
    if !step.identifiers.is_function_declaration && step.text.starts_with('{') {
        step.var_assignments = parse_var_assignments(&step.text, filename, line_number)?;
        if !step.var_assignments.is_empty() && step.identifiers.is_textual_step {
            return Err(syntax(
                "A step setting variables cannot be a textual step (-)".to_string(),
            ));
        }
        validate_special_vars(&step.var_assignments, filename, line_number)?;
    }

    // --- 8. Function call ---
    let only_literals = !step.var_assignments.is_empty()
        && step
            .var_assignments
            .iter()
            .all(|a| matches!(a.value, VarValue::Literal(_)));
    step.identifiers.is_function_call = !step.identifiers.is_function_declaration
        && !step.identifiers.is_textual_step
        && step.code_block.is_none()
        && !only_literals;

    // --- 9. Element finders ---
    if !only_literals {
        step.element_finders = element_finder::parse_all(step.call_text(), filename, line_number)?;
    }

    Ok(ParsedLine {
        step,
        opens_code_block,
    })
}

/// Removes identifier tokens from the end of `text`, setting the matching flags.
fn strip_identifiers<'a>(mut text: &'a str, ids: &mut Identifiers) -> &'a str {
    loop {
        let trimmed = text.trim_end();
        let (head, token) = match trimmed.rfind(char::is_whitespace) {
            Some(i) => (
                trimmed.get(..i).unwrap_or(""),
                trimmed.get(i..).unwrap_or("").trim_start(),
            ),
            None => ("", trimmed),
        };
        if head.trim().is_empty() || !apply_identifier(token, ids) {
            return trimmed;
        }
        text = head;
    }
}

fn apply_identifier(token: &str, ids: &mut Identifiers) -> bool {
    match token {
        "-T" => {
            ids.is_to_do = true;
            ids.is_textual_step = true;
        }
        "-M" => {
            ids.is_manual = true;
            ids.is_textual_step = true;
        }
        "-" => ids.is_textual_step = true,
        "~" => ids.is_debug = true,
        "$" => ids.is_only = true,
        "+" => ids.is_non_parallel = true,
        ".." => ids.is_sequential = true,
        "#" => ids.is_expected_fail = true,
        note if note.len() > 1 && note.starts_with('#') => {
            ids.is_expected_fail = true;
            ids.expected_fail_note = note.get(1..).map(str::to_string);
        }
        _ => return false,
    }
    true
}

/// Finds a `{...}` body that ends a declaration line, e.g. `* After Every Step {cleanup}`.
/// Local variables (`{{x}}`) are never mistaken for a body.
fn split_one_line_code_block(body: &str) -> Option<(&str, &str)> {
    let chars: Vec<(usize, char)> = body.char_indices().collect();
    let mut quote: Option<char> = None;
    for (pos, &(i, c)) in chars.iter().enumerate() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        if c == '\'' || c == '"' {
            quote = Some(c);
            continue;
        }
        if c != '{' {
            continue;
        }
        let prev = pos.checked_sub(1).and_then(|p| chars.get(p)).map(|&(_, c)| c);
        let next = chars.get(pos + 1).map(|&(_, c)| c);
        if prev == Some('{') || next == Some('{') {
            continue;
        }
        // Match the brace and require it to close at the very end of the line.
        let mut depth = 0usize;
        for &(j, d) in chars.iter().skip(pos) {
            match d {
                '{' => depth += 1,
                '}' => {
                    depth = depth.saturating_sub(1);
                    if depth == 0 {
                        if j + 1 != body.len() {
                            break;
                        }
                        let head = body.get(..i)?.trim_end();
                        let code = body.get(i + 1..j)?;
                        let name = head.trim_start_matches('*');
                        let name = strip_identifiers(name, &mut Identifiers::default());
                        if HookKind::from_text(name).is_some() || !BARE_NAME_RE.is_match(code) {
                            return Some((head, code));
                        }
                        return None;
                    }
                }
                _ => {}
            }
        }
    }
    None
}

/// Parses `{a}='x', {{b}}="y"` or `{a} = Some Function` at the start of `text`.
/// Returns an empty list when the text does not start with an assignment.
pub fn parse_var_assignments(
    text: &str,
    filename: Option<&str>,
    line_number: usize,
) -> Result<Vec<VarAssignment>, TreeError> {
    let syntax = |message: &str| TreeError::syntax(message, filename, line_number);
    let mut assignments = Vec::new();
    let mut rest = text.trim();

    while let Some(caps) = VAR_HEAD_RE.captures(rest) {
        let open_local = caps.get(1).is_some();
        let close_local = caps.get(3).is_some();
        if open_local != close_local {
            return Err(syntax("Mismatched braces in variable name"));
        }
        let name = caps.get(2).map_or("", |m| m.as_str()).trim().to_string();
        let head_len = caps.get(0).map_or(0, |m| m.end());
        rest = rest.get(head_len..).unwrap_or("");

        if let Some((literal, after)) = commons::take_quoted(rest) {
            assignments.push(VarAssignment {
                name,
                value: VarValue::Literal(literal),
                is_local: open_local,
            });
            rest = after.trim_start();
            if rest.is_empty() {
                break;
            }
            match rest.strip_prefix(',') {
                Some(after_comma) => rest = after_comma.trim_start(),
                None => {
                    return Err(syntax(
                        "Unexpected text after a string literal in a variable assignment",
                    ));
                }
            }
            continue;
        }

        let call = rest.trim();
        if !assignments.is_empty() || VAR_ANYWHERE_RE.is_match(call) {
            return Err(syntax(
                "When multiple variables are set on one line, they must all be set to string literals",
            ));
        }
        if call.is_empty() {
            return Err(syntax("A variable must be set to a string literal or a function call"));
        }
        assignments.push(VarAssignment {
            name,
            value: VarValue::Call(call.to_string()),
            is_local: open_local,
        });
        rest = "";
        break;
    }

    if !assignments.is_empty() && !rest.is_empty() {
        return Err(syntax("Invalid variable assignment"));
    }
    Ok(assignments)
}

fn validate_special_vars(
    assignments: &[VarAssignment],
    filename: Option<&str>,
    line_number: usize,
) -> Result<(), TreeError> {
    for assignment in assignments {
        let lower = assignment.name.to_lowercase();
        if lower != FREQUENCY_VAR && lower != GROUP_VAR {
            continue;
        }
        let syntax = |message: String| TreeError::syntax(message, filename, line_number);
        if assignment.name != lower {
            return Err(syntax(format!("The {{{}}} variable must be lowercase", lower)));
        }
        if assignment.is_local {
            return Err(syntax(format!(
                "The {{{}}} variable cannot be local. Use {{{}}} instead of {{{{{}}}}}",
                lower, lower, lower
            )));
        }
        match &assignment.value {
            VarValue::Call(_) => {
                return Err(syntax(format!(
                    "The {{{}}} variable must be set to a string literal",
                    lower
                )));
            }
            VarValue::Literal(value) if lower == FREQUENCY_VAR => {
                value.parse::<Frequency>().map_err(syntax)?;
            }
            VarValue::Literal(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<Step, TreeError> {
        parse_line(line, Some("test.smash"), 1).map(|p| p.step)
    }

    #[test]
    fn test_plain_function_call() {
        let step = parse("Click the 'OK' button").unwrap();
        assert_eq!(step.text, "Click the 'OK' button");
        assert!(step.identifiers.is_function_call);
        assert!(!step.identifiers.is_textual_step);
    }

    #[test]
    fn test_textual_step_with_identifiers_in_any_order() {
        let step = parse("Verify layout $ - ~ +").unwrap();
        assert_eq!(step.text, "Verify layout");
        let ids = &step.identifiers;
        assert!(ids.is_textual_step && ids.is_only && ids.is_debug && ids.is_non_parallel);
        assert!(!ids.is_function_call);
    }

    #[test]
    fn test_to_do_and_manual_are_textual() {
        let todo = parse("Check the invoice -T").unwrap();
        assert!(todo.identifiers.is_to_do && todo.identifiers.is_textual_step);
        let manual = parse("Look at the logo -M").unwrap();
        assert!(manual.identifiers.is_manual && !manual.identifiers.is_function_call);
    }

    #[test]
    fn test_expected_fail_with_note() {
        let step = parse("Submit form #BUG-12").unwrap();
        assert!(step.identifiers.is_expected_fail);
        assert_eq!(step.identifiers.expected_fail_note.as_deref(), Some("BUG-12"));
    }

    #[test]
    fn test_comment_is_removed_outside_quotes() {
        let step = parse("Go to 'http://site.com' // the home page").unwrap();
        assert_eq!(step.text, "Go to 'http://site.com'");
        assert_eq!(step.comment.as_deref(), Some("the home page"));
    }

    #[test]
    fn test_code_block_opener() {
        let parsed = parse_line("Open browser {", None, 4).unwrap();
        assert!(parsed.opens_code_block);
        assert_eq!(parsed.step.text, "Open browser");
        assert_eq!(parsed.step.code_block.as_deref(), Some(""));
        assert!(!parsed.step.identifiers.is_function_call);
    }

    #[test]
    fn test_function_declaration_with_local_params() {
        let step = parse("* Log in as {{user}} {").unwrap();
        assert!(step.identifiers.is_function_declaration);
        assert_eq!(step.text, "Log in as {{user}}");
        assert!(!step.identifiers.is_function_call);
    }

    #[test]
    fn test_declaration_rejects_non_local_var() {
        assert!(matches!(parse("* Log in as {user}"), Err(TreeError::Syntax { .. })));
    }

    #[test]
    fn test_declaration_rejects_string_literals_and_textual() {
        assert!(parse("* Log in as 'bob'").is_err());
        assert!(parse("* Log in -").is_err());
    }

    #[test]
    fn test_hook_requires_star_and_code_block() {
        assert!(parse("Before Every Branch {").is_err());
        assert!(parse("* After Every Step").is_err());
        assert!(parse("* Before Every Step $ {").is_err());
        let hook = parse("* before every step {").unwrap();
        assert_eq!(hook.hook, Some(HookKind::BeforeEveryStep));
    }

    #[test]
    fn test_one_line_hook_body() {
        let hook = parse("* Before Everything{X}").unwrap();
        assert_eq!(hook.hook, Some(HookKind::BeforeEverything));
        assert_eq!(hook.code_block.as_deref(), Some("X"));
    }

    #[test]
    fn test_digits_only_is_rejected() {
        assert!(parse("1.2,3").is_err());
    }

    #[test]
    fn test_lone_sequential_marker() {
        let step = parse("..").unwrap();
        assert!(step.is_sequential_marker());
    }

    #[test]
    fn test_literal_assignments() {
        let step = parse(r#"{a}='1', {{b}}="two""#).unwrap();
        assert_eq!(step.var_assignments.len(), 2);
        assert_eq!(step.var_assignments[0].value, VarValue::Literal("1".to_string()));
        assert!(step.var_assignments[1].is_local);
        assert!(!step.identifiers.is_function_call);
    }

    #[test]
    fn test_call_assignment() {
        let step = parse("{total} = Sum of 'a' and 'b'").unwrap();
        assert!(step.identifiers.is_function_call);
        assert_eq!(step.call_text(), "Sum of 'a' and 'b'");
    }

    #[test]
    fn test_multiple_assignments_must_be_literals() {
        assert!(parse("{a}='x', {b}=Get B").is_err());
        assert!(parse("{a}=Get A, {b}='x'").is_err());
    }

    #[test]
    fn test_assignment_cannot_be_textual() {
        assert!(parse("{a}='x' -").is_err());
    }

    #[test]
    fn test_special_vars() {
        assert!(parse("{frequency}='high'").is_ok());
        assert!(parse("{frequency}='often'").is_err());
        assert!(parse("{Frequency}='high'").is_err());
        assert!(parse("{{group}}='smoke'").is_err());
        assert!(parse("{group}=Pick Group").is_err());
        assert!(parse("{group}='smoke', {group}='nightly'").is_ok());
    }

    #[test]
    fn test_bad_element_finder_is_a_syntax_error() {
        assert!(parse("Click [next to 'Name']").is_err());
        let step = parse("Click [1st 'Save' button]").unwrap();
        assert_eq!(step.element_finders.len(), 1);
    }
}
