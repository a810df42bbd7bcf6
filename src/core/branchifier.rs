// src/core/branchifier.rs

//! Expands a tree into the flat list of branches that will be run.
//!
//! Expansion never mutates the tree. Each call builds fresh `Branch` values whose
//! steps point back into the arena only through `StepId`s.

use crate::{
    constants::{FREQUENCY_VAR, GROUP_VAR, MAX_CALL_DEPTH},
    core::{
        errors::{Location, TreeError},
        function_resolver::{self, Frame},
        tree::Tree,
    },
    models::{Branch, BranchStep, Frequency, Hook, HookKind, NodeKind, StepId, VarValue},
};
use log::{debug, info};
use std::collections::HashMap;
use uuid::Uuid;

/// Restrictions applied to the generated branch set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BranchifyOptions {
    /// Keep only branches tagged with at least one of these groups.
    pub groups: Option<Vec<String>>,
    /// Keep only branches at least this frequent. Untagged branches are always kept.
    pub min_frequency: Option<Frequency>,
    /// Fail on any `$` or `~`.
    pub no_debug: bool,
}

struct Expander<'a> {
    tree: &'a Tree,
    options: &'a BranchifyOptions,
    path: Vec<Frame>,
    active_declarations: Vec<StepId>,
    // Every `~` step met during expansion, in source order of discovery.
    debug_steps: Vec<(Option<StepId>, Location)>,
}

impl Tree {
    /// Expands `node` and everything under it into branches, then applies the
    /// frequency, group and `~` restrictions and assigns non-parallel ids.
    pub fn branchify(
        &self,
        node: StepId,
        options: &BranchifyOptions,
    ) -> Result<Vec<Branch>, TreeError> {
        let mut expander = Expander {
            tree: self,
            options,
            path: Vec::new(),
            active_declarations: Vec::new(),
            debug_steps: Vec::new(),
        };
        let branches = expander.expand(node, 0)?;
        expander.finish(branches)
    }

    /// Branchifies the whole tree, sorts the result into run order and collects the
    /// tree-wide hooks.
    pub fn generate_branches(&mut self, options: &BranchifyOptions) -> Result<(), TreeError> {
        let root = self.root();
        let mut branches = self.branchify(root, options)?;
        branches.sort_by_key(|branch| Frequency::sort_key(branch.frequency));

        let mut before_everything = Vec::new();
        let mut after_everything = Vec::new();
        for &id in &self.step(root).children {
            let step = self.step(id);
            match step.hook {
                Some(kind @ HookKind::BeforeEverything) => {
                    before_everything.push(Hook::from_step(step, kind))
                }
                Some(kind @ HookKind::AfterEverything) => {
                    after_everything.push(Hook::from_step(step, kind))
                }
                _ => {}
            }
        }
        before_everything.reverse();

        self.is_debug = branches.first().is_some_and(|branch| branch.is_debug);
        info!(
            "Generated {} branches ({} before-everything, {} after-everything hooks)",
            branches.len(),
            before_everything.len(),
            after_everything.len()
        );
        self.branches = branches;
        self.before_everything = before_everything;
        self.after_everything = after_everything;
        Ok(())
    }
}

impl Expander<'_> {
    fn expand(&mut self, id: StepId, indents: usize) -> Result<Vec<Branch>, TreeError> {
        let tree = self.tree;
        let step = tree.step(id);
        let mut branches = match &step.kind {
            NodeKind::Root => self.expand_children(id, indents, false)?.unwrap_or_default(),
            NodeKind::StepBlock { members } => {
                let sequential = step.identifiers.is_sequential;
                let mut alternatives = if sequential {
                    vec![Branch::default()]
                } else {
                    Vec::new()
                };
                for &member in members {
                    let (own, _) = self.expand_single(member, indents)?;
                    if sequential {
                        alternatives = cross(&alternatives, &own);
                    } else {
                        alternatives.extend(own);
                    }
                }
                if !sequential {
                    keep_only(&mut alternatives);
                }
                self.path.push(Frame {
                    step: id,
                    declaration: None,
                });
                let kids = self.expand_children(id, indents, false);
                self.path.pop();
                combine(alternatives, kids?)
            }
            NodeKind::Step => {
                if step.identifiers.is_function_declaration || step.hook.is_some() {
                    return Ok(Vec::new());
                }
                let (own, declaration) = self.expand_single(id, indents)?;
                self.path.push(Frame {
                    step: id,
                    declaration,
                });
                let kids = self.expand_children(id, indents, step.identifiers.is_sequential);
                self.path.pop();
                combine(own, kids?)
            }
        };
        self.attach_hooks(id, &mut branches);
        Ok(branches)
    }

    /// Expands the children of `id` as alternatives, or as one sequence when `sequential`.
    /// Returns `None` when no child produces a branch.
    fn expand_children(
        &mut self,
        id: StepId,
        indents: usize,
        sequential: bool,
    ) -> Result<Option<Vec<Branch>>, TreeError> {
        let tree = self.tree;
        let mut combined = if sequential {
            vec![Branch::default()]
        } else {
            Vec::new()
        };
        let mut any = false;

        for &kid in &tree.step(id).children {
            let kid_step = tree.step(kid);
            if kid_step.hook.is_some() {
                if !kid_step.children.is_empty() {
                    return Err(TreeError::structure(
                        format!("The hook '{}' cannot have children", kid_step.text),
                        kid_step.filename.as_deref(),
                        kid_step.line_number,
                    ));
                }
                continue;
            }
            if kid_step.identifiers.is_function_declaration {
                continue;
            }
            let branches = self.expand(kid, indents)?;
            if branches.is_empty() {
                continue;
            }
            any = true;
            if sequential {
                combined = cross(&combined, &branches);
            } else {
                combined.extend(branches);
            }
        }

        if !any {
            return Ok(None);
        }
        if !sequential {
            keep_only(&mut combined);
        }
        Ok(Some(combined))
    }

    /// Expands one step on its own: a single-step branch, or for a function call the
    /// call followed by every branch of its declaration.
    fn expand_single(
        &mut self,
        id: StepId,
        indents: usize,
    ) -> Result<(Vec<Branch>, Option<StepId>), TreeError> {
        let tree = self.tree;
        let step = tree.step(id);
        let mut clone = BranchStep::from_tree_step(step, indents);

        if !step.identifiers.is_function_call {
            self.check_flags(&clone)?;
            return Ok((vec![Branch::from_steps(vec![clone])], None));
        }

        let declaration_id = tree.find_function_declaration(id, &self.path)?;
        if self.active_declarations.contains(&declaration_id)
            || self.active_declarations.len() >= MAX_CALL_DEPTH
        {
            return Err(TreeError::infinite_loop(
                format!(
                    "The function '{}' calls itself, directly or through other functions",
                    step.call_text()
                ),
                step.filename.as_deref(),
                step.line_number,
            ));
        }

        let declaration = tree.step(declaration_id);
        clone.code_block = declaration.code_block.clone();
        clone.function_declaration_in_tree = Some(declaration_id);
        clone.param_bindings = function_resolver::bind_params(step.call_text(), &declaration.text);
        clone.identifiers.is_debug |= declaration.identifiers.is_debug;
        clone.identifiers.is_only |= declaration.identifiers.is_only;
        clone.identifiers.is_non_parallel |= declaration.identifiers.is_non_parallel;
        self.check_flags(&clone)?;

        self.active_declarations.push(declaration_id);
        self.path.push(Frame {
            step: id,
            declaration: Some(declaration_id),
        });
        let kids = self.expand_children(
            declaration_id,
            indents + 1,
            declaration.identifiers.is_sequential,
        );
        self.path.pop();
        self.active_declarations.pop();

        let mut branches = combine(vec![Branch::from_steps(vec![clone])], kids?);
        self.attach_hooks(declaration_id, &mut branches);
        Ok((branches, Some(declaration_id)))
    }

    fn check_flags(&mut self, clone: &BranchStep) -> Result<(), TreeError> {
        let ids = &clone.identifiers;
        let location = || Location::at(clone.filename.as_deref(), clone.line_number);
        if self.options.no_debug && (ids.is_only || ids.is_debug) {
            return Err(TreeError::configuration(
                "A $ or ~ was found, but debugging is disabled",
                location(),
            ));
        }
        if ids.is_debug
            && !self
                .debug_steps
                .iter()
                .any(|(id, _)| *id == clone.original_step_in_tree)
        {
            self.debug_steps.push((clone.original_step_in_tree, location()));
        }
        Ok(())
    }

    /// Appends the hooks declared as children of `id` to every branch. Deeper hooks are
    /// already present, so the lists end up leaf-first.
    fn attach_hooks(&self, id: StepId, branches: &mut [Branch]) {
        let mut before_branch = Vec::new();
        let mut after_branch = Vec::new();
        let mut before_step = Vec::new();
        let mut after_step = Vec::new();

        for &kid in &self.tree.step(id).children {
            let step = self.tree.step(kid);
            match step.hook {
                Some(kind @ HookKind::BeforeEveryBranch) => {
                    before_branch.push(Hook::from_step(step, kind))
                }
                Some(kind @ HookKind::AfterEveryBranch) => {
                    after_branch.push(Hook::from_step(step, kind))
                }
                Some(kind @ HookKind::BeforeEveryStep) => {
                    before_step.push(Hook::from_step(step, kind))
                }
                Some(kind @ HookKind::AfterEveryStep) => {
                    after_step.push(Hook::from_step(step, kind))
                }
                _ => {}
            }
        }
        if before_branch.is_empty()
            && after_branch.is_empty()
            && before_step.is_empty()
            && after_step.is_empty()
        {
            return;
        }
        before_branch.reverse();
        before_step.reverse();

        for branch in branches {
            branch.before_every_branch.extend(before_branch.iter().cloned());
            branch.after_every_branch.extend(after_branch.iter().cloned());
            branch.before_every_step.extend(before_step.iter().cloned());
            branch.after_every_step.extend(after_step.iter().cloned());
        }
    }

    /// Tags, filters and finalizes the expanded set.
    fn finish(self, mut branches: Vec<Branch>) -> Result<Vec<Branch>, TreeError> {
        for branch in &mut branches {
            tag_frequency_and_groups(branch);
        }

        if let Some(min) = self.options.min_frequency {
            branches.retain(|b| b.frequency.is_none_or(|f| f.rank() >= min.rank()));
        }
        if let Some(groups) = &self.options.groups {
            branches.retain(|b| b.groups.iter().any(|g| groups.contains(g)));
        }

        for (id, location) in &self.debug_steps {
            let survives = branches.iter().any(|branch| {
                branch
                    .steps
                    .iter()
                    .any(|step| step.identifiers.is_debug && step.original_step_in_tree == *id)
            });
            if !survives {
                return Err(TreeError::configuration(
                    "A ~ step was excluded by $, frequency or group filtering. Remove the ~ or change the filters",
                    location.clone(),
                ));
            }
        }
        if let Some(pos) = branches.iter().position(Branch::has_debug_step) {
            let mut debug_branch = branches.swap_remove(pos);
            debug_branch.is_debug = true;
            debug!("Isolated the debug branch with {} steps", debug_branch.steps.len());
            branches = vec![debug_branch];
        }

        let mut non_parallel_ids: HashMap<StepId, String> = HashMap::new();
        for branch in &mut branches {
            let marker = branch
                .steps
                .iter()
                .filter(|step| step.identifiers.is_non_parallel)
                .find_map(|step| step.original_step_in_tree);
            if let Some(marker) = marker {
                let id = non_parallel_ids
                    .entry(marker)
                    .or_insert_with(|| Uuid::new_v4().to_string());
                branch.non_parallel_id = Some(id.clone());
            }
        }

        Ok(branches)
    }
}

/// Frequency is the last one seen along the path; groups accumulate.
fn tag_frequency_and_groups(branch: &mut Branch) {
    let mut frequency = None;
    let mut groups = Vec::new();
    for step in &branch.steps {
        for assignment in &step.var_assignments {
            let VarValue::Literal(value) = &assignment.value else {
                continue;
            };
            if assignment.is_local {
                continue;
            }
            if assignment.name == FREQUENCY_VAR {
                frequency = value.parse::<Frequency>().ok().or(frequency);
            } else if assignment.name == GROUP_VAR && !groups.contains(value) {
                groups.push(value.clone());
            }
        }
    }
    branch.frequency = frequency;
    branch.groups = groups;
}

/// When any alternative passes through a `$`, only those alternatives survive.
fn keep_only(branches: &mut Vec<Branch>) {
    if branches.iter().any(Branch::has_only_step) {
        branches.retain(Branch::has_only_step);
    }
}

/// Every branch of `prefixes` followed by every branch of `suffixes`.
fn cross(prefixes: &[Branch], suffixes: &[Branch]) -> Vec<Branch> {
    let mut out = Vec::with_capacity(prefixes.len() * suffixes.len());
    for prefix in prefixes {
        for suffix in suffixes {
            let mut branch = prefix.clone();
            branch.extend_with(suffix);
            out.push(branch);
        }
    }
    out
}

fn combine(own: Vec<Branch>, kids: Option<Vec<Branch>>) -> Vec<Branch> {
    match kids {
        Some(kids) => cross(&own, &kids),
        None => own,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generate(text: &str, options: BranchifyOptions) -> Result<Tree, TreeError> {
        let mut tree = Tree::new();
        tree.parse_in(text, Some("branches.smash"), false)?;
        tree.generate_branches(&options)?;
        Ok(tree)
    }

    fn texts(tree: &Tree) -> Vec<Vec<&str>> {
        tree.branches.iter().map(Branch::step_texts).collect()
    }

    #[test]
    fn test_simple_tree() {
        let tree = generate("A -\n    B -\n        C -\n    D -", Default::default()).unwrap();
        assert_eq!(texts(&tree), vec![vec!["A", "B", "C"], vec!["A", "D"]]);
        assert!(tree
            .branches
            .iter()
            .flat_map(|b| &b.steps)
            .all(|s| s.branch_indents == 0));
    }

    #[test]
    fn test_step_block_multiplies_children() {
        let tree = generate("A -\nB -\nC -\n\n    D -\n    E -", Default::default()).unwrap();
        assert_eq!(tree.branches.len(), 6);
        assert_eq!(texts(&tree)[0], vec!["A", "D"]);
        assert_eq!(texts(&tree)[5], vec!["C", "E"]);
    }

    #[test]
    fn test_sequential_block_yields_one_branch() {
        let tree = generate("..\nA -\nB -\nC -", Default::default()).unwrap();
        assert_eq!(texts(&tree), vec![vec!["A", "B", "C"]]);
    }

    #[test]
    fn test_sequential_block_multiplies_only_by_inner_divergence() {
        let text = "..\nF\nA -\n\n* F\n    X -\n    Y -";
        let tree = generate(text, Default::default()).unwrap();
        assert_eq!(
            texts(&tree),
            vec![vec!["F", "X", "A"], vec!["F", "Y", "A"]]
        );
    }

    #[test]
    fn test_sequential_step_flattens_children() {
        let tree = generate("A - ..\n    B -\n        C -\n    D -", Default::default()).unwrap();
        assert_eq!(texts(&tree), vec![vec!["A", "B", "C", "D"]]);
    }

    #[test]
    fn test_function_call_inlines_declaration_branches() {
        let text = "Open 'home'\n    Check -\n\n* Open {{page}} {\n    visit\n}\n    G -\n    H -";
        let tree = generate(text, Default::default()).unwrap();
        assert_eq!(
            texts(&tree),
            vec![vec!["Open 'home'", "G", "Check"], vec!["Open 'home'", "H", "Check"]]
        );
        let call = &tree.branches[0].steps[0];
        assert_eq!(call.code_block.as_deref(), Some("    visit"));
        assert_eq!(call.param_bindings[0].name, "page");
        assert_eq!(call.param_bindings[0].input, "'home'");
        assert_eq!(tree.branches[0].steps[1].branch_indents, 1);
        assert_eq!(tree.branches[0].steps[2].branch_indents, 0);
    }

    #[test]
    fn test_unresolved_call_fails() {
        let err = generate("Missing function", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::Resolution { .. }));
    }

    #[test]
    fn test_recursive_call_fails() {
        let err = generate("F\n\n* F\n    F", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::InfiniteLoop { .. }));
    }

    #[test]
    fn test_mutual_recursion_fails() {
        let err = generate("F\n\n* F\n    G\n\n* G\n    F", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::InfiniteLoop { .. }));
    }

    #[test]
    fn test_only_keeps_the_intersection() {
        let tree = generate("A - $\n    B - $\n    C -\nD -", Default::default()).unwrap();
        assert_eq!(texts(&tree), vec![vec!["A", "B"]]);
    }

    #[test]
    fn test_debug_picks_a_single_branch() {
        let tree = generate("A -\nB - ~\nC -", Default::default()).unwrap();
        assert_eq!(texts(&tree), vec![vec!["B"]]);
        assert!(tree.is_debug);
        assert!(tree.branches[0].is_debug);
    }

    #[test]
    fn test_debug_removed_by_only_is_an_error() {
        let err = generate("A - ~\nB - $", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::Configuration { .. }));
    }

    #[test]
    fn test_every_filtered_out_debug_step_is_an_error() {
        // B's ~ survives, but A's is dropped by the $ on B.
        let err = generate("A - ~\nB - ~ $", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::Configuration { .. }));
        assert_eq!(err.location().line_number, Some(1));

        let options = BranchifyOptions {
            min_frequency: Some(Frequency::High),
            ..Default::default()
        };
        let text = "A - ~\n    {frequency}='high'\n\nB - ~\n    {frequency}='low'";
        let err = generate(text, options).unwrap_err();
        assert_eq!(err.location().line_number, Some(4));
    }

    #[test]
    fn test_no_debug_rejects_markers() {
        let options = BranchifyOptions {
            no_debug: true,
            ..Default::default()
        };
        assert!(generate("A - $", options.clone()).is_err());
        assert!(generate("A -", options).is_ok());
    }

    #[test]
    fn test_hook_order() {
        let text = "* Before Every Branch {\n    outer\n}\n* After Every Branch {\n    outer\n}\n\nA -\n\n    * Before Every Branch {\n        inner\n    }\n    * After Every Branch {\n        inner\n    }\n\n    B -";
        let tree = generate(text, Default::default()).unwrap();
        let branch = &tree.branches[0];
        let before: Vec<&str> = branch
            .before_every_branch
            .iter()
            .map(|h| h.code_block.trim())
            .collect();
        let after: Vec<&str> = branch
            .after_every_branch
            .iter()
            .map(|h| h.code_block.trim())
            .collect();
        assert_eq!(before, vec!["inner", "outer"]);
        assert_eq!(after, vec!["inner", "outer"]);
    }

    #[test]
    fn test_step_hook_sibling_order() {
        let text = "* Before Every Step {\n    b1\n}\n* Before Every Step {\n    b2\n}\n* After Every Step {\n    a1\n}\n* After Every Step {\n    a2\n}\n\nA -";
        let tree = generate(text, Default::default()).unwrap();
        let branch = &tree.branches[0];
        fn codes(hooks: &[Hook]) -> Vec<&str> {
            hooks.iter().map(|h| h.code_block.trim()).collect()
        }
        assert_eq!(codes(&branch.before_every_step), vec!["b2", "b1"]);
        assert_eq!(codes(&branch.after_every_step), vec!["a1", "a2"]);
    }

    #[test]
    fn test_before_everything_order() {
        let tree = generate(
            "* Before Everything{X}\n* Before Everything{Y}\nA -",
            Default::default(),
        )
        .unwrap();
        let codes: Vec<&str> = tree
            .before_everything
            .iter()
            .map(|h| h.code_block.as_str())
            .collect();
        assert_eq!(codes, vec!["Y", "X"]);
        assert_eq!(texts(&tree), vec![vec!["A"]]);
    }

    #[test]
    fn test_hook_with_children_fails() {
        let err = generate("* After Every Step {\n}\n    A -", Default::default()).unwrap_err();
        assert!(matches!(err, TreeError::Structure { .. }));
    }

    #[test]
    fn test_frequency_sort_and_filter() {
        let text = "A -\n    {frequency}='low'\n    {frequency}='high'\n    B -";
        let tree = generate(text, Default::default()).unwrap();
        let freqs: Vec<Option<Frequency>> = tree.branches.iter().map(|b| b.frequency).collect();
        assert_eq!(freqs, vec![Some(Frequency::High), None, Some(Frequency::Low)]);

        let options = BranchifyOptions {
            min_frequency: Some(Frequency::Med),
            ..Default::default()
        };
        let tree = generate(text, options).unwrap();
        assert_eq!(tree.branches.len(), 2);
    }

    #[test]
    fn test_group_filter() {
        let options = BranchifyOptions {
            groups: Some(vec!["smoke".to_string()]),
            ..Default::default()
        };
        let tree = generate("{group}='smoke'\n{group}='nightly'\nA -", options).unwrap();
        assert_eq!(tree.branches.len(), 1);
        assert_eq!(tree.branches[0].groups, vec!["smoke"]);
    }

    #[test]
    fn test_non_parallel_ids() {
        let tree = generate("A - +\n    B -\n    C -\nD -", Default::default()).unwrap();
        let ids: Vec<Option<&String>> =
            tree.branches.iter().map(|b| b.non_parallel_id.as_ref()).collect();
        assert!(ids[0].is_some());
        assert_eq!(ids[0], ids[1]);
        assert_eq!(ids[2], None);
    }

    #[test]
    fn test_branchify_is_repeatable() {
        let mut tree = Tree::new();
        tree.parse_in("A -\nB -", None, false).unwrap();
        let first = tree.branchify(tree.root(), &Default::default()).unwrap();
        let second = tree.branchify(tree.root(), &Default::default()).unwrap();
        assert_eq!(first, second);
    }
}
