// src/core/function_resolver.rs

//! Matches function calls to the declarations visible from the call site.

use crate::{
    core::{commons, errors::TreeError, tree::Tree},
    models::{ParamBinding, StepId},
};

/// One level of the path that led to a call during expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    /// The tree node expanded at this level.
    pub step: StepId,
    /// For a function call, the declaration it resolved to.
    pub declaration: Option<StepId>,
}

/// Placeholder used for every input or parameter when comparing names.
const INPUT_PLACEHOLDER: &str = "{}";

/// Splits a call or declaration name into a comparable canonical form plus the raw
/// input tokens it contains (quoted strings, `{var}`, `{{var}}` and `[...]`).
pub fn canonicalize(text: &str) -> (String, Vec<String>) {
    let mut canonical = String::with_capacity(text.len());
    let mut inputs = Vec::new();
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        let token_len = match c {
            '\'' | '"' => commons::take_quoted(rest).map(|(_, after)| rest.len() - after.len()),
            '{' if rest.starts_with("{{") => rest.find("}}").map(|end| end + 2),
            '{' => rest.find('}').map(|end| end + 1),
            '[' => rest.find(']').map(|end| end + 1),
            _ => None,
        };
        match token_len.and_then(|len| rest.get(..len).map(|token| (len, token))) {
            Some((len, token)) => {
                inputs.push(token.to_string());
                canonical.push(' ');
                canonical.push_str(INPUT_PLACEHOLDER);
                canonical.push(' ');
                rest = rest.get(len..).unwrap_or("");
            }
            None => {
                canonical.extend(c.to_lowercase());
                rest = rest.get(c.len_utf8()..).unwrap_or("");
            }
        }
    }

    (commons::normalize_whitespace(&canonical), inputs)
}

/// Pairs each call input with the declaration's `{{param}}` at the same position.
pub fn bind_params(call_text: &str, declaration_text: &str) -> Vec<ParamBinding> {
    let (_, inputs) = canonicalize(call_text);
    let (_, params) = canonicalize(declaration_text);
    params
        .into_iter()
        .zip(inputs)
        .map(|(param, input)| ParamBinding {
            name: param
                .trim_start_matches('{')
                .trim_end_matches('}')
                .trim()
                .to_string(),
            input,
        })
        .collect()
}

impl Tree {
    /// Finds the declaration `call` refers to.
    ///
    /// The call's own siblings are scanned first, then every frame of `path` from the
    /// nearest outward. A frame contributes the children of its resolved declaration,
    /// the declaration's siblings, and the siblings of its own step.
    pub fn find_function_declaration(
        &self,
        call: StepId,
        path: &[Frame],
    ) -> Result<StepId, TreeError> {
        let call_step = self.step(call);
        self.resolve_call(
            call_step.call_text(),
            self.siblings(call),
            path,
            call_step.filename.as_deref(),
            call_step.line_number,
        )
    }

    /// Resolves a call that is not part of the tree, such as an injected step, from the
    /// scope reached at the end of `path`.
    pub fn find_function_declaration_for(
        &self,
        call_text: &str,
        path: &[Frame],
    ) -> Result<StepId, TreeError> {
        self.resolve_call(call_text, &[], path, None, 0)
    }

    fn resolve_call(
        &self,
        call_text: &str,
        own_scope: &[StepId],
        path: &[Frame],
        filename: Option<&str>,
        line_number: usize,
    ) -> Result<StepId, TreeError> {
        let (wanted, _) = canonicalize(call_text);

        let mut scopes: Vec<&[StepId]> = vec![own_scope];
        for frame in path.iter().rev() {
            if let Some(declaration) = frame.declaration {
                scopes.push(&self.step(declaration).children);
                scopes.push(self.siblings(declaration));
            }
            scopes.push(self.siblings(frame.step));
        }

        scopes
            .into_iter()
            .flat_map(|scope| scope.iter().copied())
            .find(|&candidate| {
                let step = self.step(candidate);
                step.identifiers.is_function_declaration
                    && step.hook.is_none()
                    && canonicalize(&step.text).0 == wanted
            })
            .ok_or_else(|| {
                TreeError::resolution(
                    format!(
                        "The function '{}' cannot be found. Is there a typo, or did you mean to make this a textual step (with a - at the end)?",
                        call_text
                    ),
                    filename,
                    line_number,
                )
            })
    }

    /// Children of the node's parent. Empty for the root.
    fn siblings(&self, id: StepId) -> &[StepId] {
        match self.step(id).parent {
            Some(parent) => &self.step(parent).children,
            None => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree(text: &str) -> Tree {
        let mut tree = Tree::new();
        tree.parse_in(text, Some("fns.smash"), false).unwrap();
        tree
    }

    fn find(tree: &Tree, text: &str) -> StepId {
        tree.steps
            .iter()
            .find(|s| s.text == text && !s.identifiers.is_function_declaration)
            .map(|s| s.id)
            .unwrap()
    }

    #[test]
    fn test_canonicalize_replaces_inputs() {
        let (call, inputs) = canonicalize("Log  in as 'bob' with {pass} on [1st 'tab']");
        assert_eq!(call, "log in as {} with {} on {}");
        assert_eq!(inputs, vec!["'bob'", "{pass}", "[1st 'tab']"]);
        let (decl, params) = canonicalize("Log in as {{user}} with {{password}} on {{el}}");
        assert_eq!(decl, call);
        assert_eq!(params.len(), 3);
    }

    #[test]
    fn test_bind_params() {
        let bindings = bind_params("Open 'home' page", "Open {{ name }} page");
        assert_eq!(
            bindings,
            vec![ParamBinding {
                name: "name".to_string(),
                input: "'home'".to_string()
            }]
        );
    }

    #[test]
    fn test_resolves_sibling_declaration_case_insensitively() {
        let tree = tree("LOG   IN\n\n* Log in {\n    echo\n}");
        let call = find(&tree, "LOG   IN");
        let decl = tree.find_function_declaration(call, &[]).unwrap();
        assert_eq!(tree.step(decl).text, "Log in");
    }

    #[test]
    fn test_resolves_through_ancestor_frames() {
        let tree = tree("A -\n    B\n\n* B {\n}");
        let a = find(&tree, "A");
        let b = find(&tree, "B");
        let path = [Frame {
            step: a,
            declaration: None,
        }];
        let decl = tree.find_function_declaration(b, &path).unwrap();
        assert!(tree.step(decl).identifiers.is_function_declaration);
    }

    #[test]
    fn test_nearest_declaration_wins() {
        let tree = tree("A -\n    F\n\n    * F {\n        inner\n    }\n\n* F {\n    outer\n}");
        let a = find(&tree, "A");
        let f = find(&tree, "F");
        let path = [Frame {
            step: a,
            declaration: None,
        }];
        let decl = tree.find_function_declaration(f, &path).unwrap();
        assert_eq!(tree.step(decl).code_block.as_deref(), Some("        inner"));
    }

    #[test]
    fn test_nested_declarations_are_not_visible_outside() {
        let tree = tree("A -\n\n    * F {\n    }\nF");
        let f = find(&tree, "F");
        let err = tree.find_function_declaration(f, &[]).unwrap_err();
        assert!(matches!(err, TreeError::Resolution { .. }));
    }

    #[test]
    fn test_resolves_text_outside_the_tree() {
        let tree = tree("A -
    B -

    * Say {{what}} {
        say {{what}}
    }");
        let b = find(&tree, "B");
        let path = [Frame {
            step: b,
            declaration: None,
        }];
        let decl = tree.find_function_declaration_for("say 'hi'", &path).unwrap();
        assert_eq!(tree.step(decl).text, "Say {{what}}");
        assert!(tree.find_function_declaration_for("say 'hi'", &[]).is_err());
    }
}
