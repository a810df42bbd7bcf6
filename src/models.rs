// src/models.rs

//! Data types shared by the parser, the branch expander and the runner.
//!
//! Tree nodes live in an arena inside `Tree`; branches are flat clones that only
//! point back into it through `StepId`s.

use crate::constants::{
    HOOK_AFTER_EVERY_BRANCH, HOOK_AFTER_EVERY_STEP, HOOK_AFTER_EVERYTHING,
    HOOK_BEFORE_EVERY_BRANCH, HOOK_BEFORE_EVERY_STEP, HOOK_BEFORE_EVERYTHING,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// --- TREE MODELS ---
// These live in the tree arena. They are created once by the line parser and the
// tree builder and are never mutated by branch expansion.

/// Index of a node inside a `Tree` arena.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepId(pub usize);

/// What a node of the tree represents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// The synthetic root at indent -1.
    Root,
    /// A single source line.
    Step,
    /// Consecutive same-indent siblings, treated as alternatives sharing one set of children.
    StepBlock {
        /// Member steps, in source order.
        members: Vec<StepId>,
    },
}

/// The trailing identifier flags a line can carry.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Identifiers {
    /// `* Name`
    pub is_function_declaration: bool,
    /// Resolved against a function declaration when branchified.
    pub is_function_call: bool,
    /// `-`
    pub is_textual_step: bool,
    /// `-T`
    pub is_to_do: bool,
    /// `-M`
    pub is_manual: bool,
    /// `~`
    pub is_debug: bool,
    /// `$`
    pub is_only: bool,
    /// `+`
    pub is_non_parallel: bool,
    /// `..`
    pub is_sequential: bool,
    /// `#`
    pub is_expected_fail: bool,
    /// Text following `#` in a `#note` token.
    pub expected_fail_note: Option<String>,
}

/// The right-hand side of a `{var} = ...` assignment.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum VarValue {
    /// A quoted string, already unescaped.
    Literal(String),
    /// A function call whose return value is stored.
    Call(String),
}

/// One `{var}` or `{{var}}` being set on a line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VarAssignment {
    /// Variable name, trimmed.
    pub name: String,
    /// The value being assigned.
    pub value: VarValue,
    /// `{{var}}` rather than `{var}`.
    pub is_local: bool,
}

/// A parsed `[...]` element-finder shorthand.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ElementFinder {
    /// `1st`, `2nd`, ... as a number.
    pub ordinal: Option<u32>,
    /// The quoted text, unescaped.
    pub text: Option<String>,
    /// The bare-word variable.
    pub variable: Option<String>,
    /// The quoted text following `next to`.
    pub next_to: Option<String>,
}

/// The six reserved hook names.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum HookKind {
    /// `* Before Every Branch`
    BeforeEveryBranch,
    /// `* After Every Branch`
    AfterEveryBranch,
    /// `* Before Every Step`
    BeforeEveryStep,
    /// `* After Every Step`
    AfterEveryStep,
    /// `* Before Everything`
    BeforeEverything,
    /// `* After Everything`
    AfterEverything,
}

impl HookKind {
    const ALL: [Self; 6] = [
        Self::BeforeEveryBranch,
        Self::AfterEveryBranch,
        Self::BeforeEveryStep,
        Self::AfterEveryStep,
        Self::BeforeEverything,
        Self::AfterEverything,
    ];

    /// The canonical source spelling of the hook.
    pub fn name(self) -> &'static str {
        match self {
            Self::BeforeEveryBranch => HOOK_BEFORE_EVERY_BRANCH,
            Self::AfterEveryBranch => HOOK_AFTER_EVERY_BRANCH,
            Self::BeforeEveryStep => HOOK_BEFORE_EVERY_STEP,
            Self::AfterEveryStep => HOOK_AFTER_EVERY_STEP,
            Self::BeforeEverything => HOOK_BEFORE_EVERYTHING,
            Self::AfterEverything => HOOK_AFTER_EVERYTHING,
        }
    }

    /// Matches step text against the reserved names, ignoring case and runs of whitespace.
    pub fn from_text(text: &str) -> Option<Self> {
        let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
        Self::ALL
            .into_iter()
            .find(|kind| kind.name().eq_ignore_ascii_case(&normalized))
    }

    /// Before/After Everything hooks live on the tree, not on branches.
    pub fn is_tree_level(self) -> bool {
        matches!(self, Self::BeforeEverything | Self::AfterEverything)
    }
}

/// One node of the tree: a source line, a step block, or the root.
#[derive(Debug, Clone)]
pub struct Step {
    /// This node's own index.
    pub id: StepId,
    /// What kind of node this is.
    pub kind: NodeKind,
    /// File the line came from.
    pub filename: Option<String>,
    /// 1-based line number within `filename`.
    pub line_number: usize,
    /// The raw line, as written.
    pub line: String,
    /// Step text with identifiers, comment and code block removed.
    pub text: String,
    /// Body between `{` and the matching `}`.
    pub code_block: Option<String>,
    /// Text after `//`.
    pub comment: Option<String>,
    /// Trailing identifier flags.
    pub identifiers: Identifiers,
    /// Set when the step declares one of the reserved hooks.
    pub hook: Option<HookKind>,
    /// Variables set on this line.
    pub var_assignments: Vec<VarAssignment>,
    /// `[...]` shorthands found in the text.
    pub element_finders: Vec<ElementFinder>,
    /// Indentation depth; -1 for the root.
    pub indents: i32,
    /// Parent node. For block members this is the block's parent.
    pub parent: Option<StepId>,
    /// Child nodes, in source order.
    pub children: Vec<StepId>,
    /// The block this step is a member of, if any.
    pub containing_step_block: Option<StepId>,
    /// Came from a framework-provided file.
    pub is_built_in: bool,
}

impl Step {
    /// A blank step of the given kind, used by the parser and the tree builder.
    pub fn new(kind: NodeKind) -> Self {
        Self {
            id: StepId(0),
            kind,
            filename: None,
            line_number: 0,
            line: String::new(),
            text: String::new(),
            code_block: None,
            comment: None,
            identifiers: Identifiers::default(),
            hook: None,
            var_assignments: Vec::new(),
            element_finders: Vec::new(),
            indents: 0,
            parent: None,
            children: Vec::new(),
            containing_step_block: None,
            is_built_in: false,
        }
    }

    /// Members of a step block; empty for every other kind.
    pub fn members(&self) -> &[StepId] {
        match &self.kind {
            NodeKind::StepBlock { members } => members,
            _ => &[],
        }
    }

    /// Whether this node is a step block.
    pub fn is_step_block(&self) -> bool {
        matches!(self.kind, NodeKind::StepBlock { .. })
    }

    /// A lone `..` line.
    pub fn is_sequential_marker(&self) -> bool {
        self.kind == NodeKind::Step && self.text.is_empty() && self.identifiers.is_sequential
    }

    /// The text that names the function being called.
    /// For `{var} = Some Function` this is the right-hand side.
    pub fn call_text(&self) -> &str {
        self.var_assignments
            .iter()
            .find_map(|assignment| match &assignment.value {
                VarValue::Call(call) => Some(call.as_str()),
                VarValue::Literal(_) => None,
            })
            .unwrap_or(&self.text)
    }
}

// --- BRANCH MODELS ---
// Branches are flat, freshly built values. They refer back to the tree only through
// `StepId`s, which are dropped when a branch set is serialized.

/// How often a branch should be run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    /// Runs under every threshold.
    High,
    /// Runs under `med` and `low` thresholds.
    Med,
    /// Runs only under a `low` threshold.
    Low,
}

impl Frequency {
    /// Higher is more frequent.
    pub fn rank(self) -> u8 {
        match self {
            Self::High => 3,
            Self::Med => 2,
            Self::Low => 1,
        }
    }

    /// Position in the run order: high, then unset, then med, then low.
    pub fn sort_key(frequency: Option<Self>) -> u8 {
        match frequency {
            Some(Self::High) => 0,
            None => 1,
            Some(Self::Med) => 2,
            Some(Self::Low) => 3,
        }
    }

    /// The source spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Med => "med",
            Self::Low => "low",
        }
    }
}

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "high" => Ok(Self::High),
            "med" => Ok(Self::Med),
            "low" => Ok(Self::Low),
            other => Err(format!(
                "Invalid frequency '{}'. Must be 'high', 'med', or 'low'.",
                other
            )),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error recorded on a step or hook.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StepError {
    /// Human-readable message.
    pub message: String,
    /// File of the step that failed.
    pub filename: Option<String>,
    /// Line of the step that failed.
    pub line_number: Option<usize>,
}

impl StepError {
    /// Creates an error located at the given step position.
    pub fn new(message: impl Into<String>, filename: Option<&str>, line_number: usize) -> Self {
        Self {
            message: message.into(),
            filename: filename.map(str::to_string),
            line_number: Some(line_number),
        }
    }
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.filename, self.line_number) {
            (Some(file), Some(line)) => write!(f, "{} [{}:{}]", self.message, file, line),
            (None, Some(line)) => write!(f, "{} [line {}]", self.message, line),
            _ => f.write_str(&self.message),
        }
    }
}

/// A function-call input bound to a declaration's `{{param}}`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ParamBinding {
    /// The `{{param}}` name in the declaration.
    pub name: String,
    /// The raw input token at the call site: a quoted string, a variable or an element finder.
    pub input: String,
}

/// A hook attached to a branch or to the tree.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Hook {
    /// Which hook this is.
    pub kind: HookKind,
    /// The hook name as written.
    pub text: String,
    /// Body to execute.
    pub code_block: String,
    /// File the declaration came from.
    pub filename: Option<String>,
    /// Line of the declaration.
    pub line_number: usize,
    /// Declared in a framework-provided file.
    #[serde(default)]
    pub is_built_in: bool,
    /// Set when the hook failed during a run.
    #[serde(default)]
    pub error: Option<StepError>,
}

impl Hook {
    /// Builds a hook from its declaration in the tree.
    pub fn from_step(step: &Step, kind: HookKind) -> Self {
        Self {
            kind,
            text: step.text.clone(),
            code_block: step.code_block.clone().unwrap_or_default(),
            filename: step.filename.clone(),
            line_number: step.line_number,
            is_built_in: step.is_built_in,
            error: None,
        }
    }
}

/// A lightweight clone of a tree step, placed inside a branch.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BranchStep {
    /// Step text.
    pub text: String,
    /// File of the originating line.
    pub filename: Option<String>,
    /// Line of the originating line.
    pub line_number: usize,
    /// Identifier flags, merged with the resolved declaration's for calls.
    #[serde(default)]
    pub identifiers: Identifiers,
    /// The code to run. For calls this is the declaration's body.
    pub code_block: Option<String>,
    /// Variables set by this step.
    #[serde(default)]
    pub var_assignments: Vec<VarAssignment>,
    /// Parameters bound by a function call.
    #[serde(default)]
    pub param_bindings: Vec<ParamBinding>,
    /// Depth of function-call nesting this step sits at.
    #[serde(default)]
    pub branch_indents: usize,
    /// The tree node this clone came from.
    #[serde(skip)]
    pub original_step_in_tree: Option<StepId>,
    /// The declaration a call resolved to.
    #[serde(skip)]
    pub function_declaration_in_tree: Option<StepId>,
    /// Currently executing (or about to).
    #[serde(default)]
    pub is_running: bool,
    /// Executed without error.
    #[serde(default)]
    pub is_passed: bool,
    /// Executed with an error.
    #[serde(default)]
    pub is_failed: bool,
    /// Not executed on purpose.
    #[serde(default)]
    pub is_skipped: bool,
    /// Whether the outcome matched the `#` expectation.
    #[serde(default)]
    pub as_expected: Option<bool>,
    /// The error, if the step failed.
    #[serde(default)]
    pub error: Option<StepError>,
}

impl BranchStep {
    /// Clones the branch-relevant fields of a tree step.
    pub fn from_tree_step(step: &Step, branch_indents: usize) -> Self {
        Self {
            text: step.text.clone(),
            filename: step.filename.clone(),
            line_number: step.line_number,
            identifiers: step.identifiers.clone(),
            code_block: step.code_block.clone(),
            var_assignments: step.var_assignments.clone(),
            param_bindings: Vec::new(),
            branch_indents,
            original_step_in_tree: Some(step.id),
            function_declaration_in_tree: None,
            is_running: false,
            is_passed: false,
            is_failed: false,
            is_skipped: false,
            as_expected: None,
            error: None,
        }
    }

    /// A step parsed on the fly, such as one injected while paused. It has no node
    /// in the tree.
    pub fn ad_hoc(step: &Step, branch_indents: usize) -> Self {
        Self {
            original_step_in_tree: None,
            ..Self::from_tree_step(step, branch_indents)
        }
    }

    /// Reached a terminal outcome.
    pub fn is_completed(&self) -> bool {
        self.is_passed || self.is_failed || self.is_skipped
    }

    /// Clears outcome fields, keeping the step's definition.
    pub fn reset(&mut self) {
        self.is_running = false;
        self.is_passed = false;
        self.is_failed = false;
        self.is_skipped = false;
        self.as_expected = None;
        self.error = None;
    }
}

/// One fully resolved execution path.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Branch {
    /// Steps, in execution order.
    pub steps: Vec<BranchStep>,
    /// Run before the first step, innermost first.
    pub before_every_branch: Vec<Hook>,
    /// Run after the last step, innermost first.
    pub after_every_branch: Vec<Hook>,
    /// Run before each step, innermost first.
    pub before_every_step: Vec<Hook>,
    /// Run after each step, innermost first.
    pub after_every_step: Vec<Hook>,
    /// Deepest `{frequency}` seen along the path.
    pub frequency: Option<Frequency>,
    /// Every `{group}` seen along the path.
    pub groups: Vec<String>,
    /// Branches sharing an id run strictly one at a time.
    pub non_parallel_id: Option<String>,
    /// The single branch kept because it contains a `~` step.
    pub is_debug: bool,
    /// Claimed by a run instance.
    pub is_running: bool,
    /// Finished without a failing step.
    pub is_passed: bool,
    /// Finished with a failing step.
    pub is_failed: bool,
    /// Not run on purpose.
    pub is_skipped: bool,
    /// A branch with the same steps passed in the previous run.
    pub passed_last_time: bool,
    /// Human-readable notes about how the branch was handled.
    pub log: Vec<String>,
}

impl Branch {
    /// A branch made of the given steps and nothing else.
    pub fn from_steps(steps: Vec<BranchStep>) -> Self {
        Self {
            steps,
            ..Self::default()
        }
    }

    /// Reached a terminal outcome.
    pub fn is_completed(&self) -> bool {
        self.is_passed || self.is_failed || self.is_skipped
    }

    /// Whether any step carries `~`.
    pub fn has_debug_step(&self) -> bool {
        self.steps.iter().any(|step| step.identifiers.is_debug)
    }

    /// Whether any step carries `$`.
    pub fn has_only_step(&self) -> bool {
        self.steps.iter().any(|step| step.identifiers.is_only)
    }

    /// Appends `other`'s steps and hooks after this branch's.
    pub fn extend_with(&mut self, other: &Self) {
        self.steps.extend(other.steps.iter().cloned());
        self.before_every_branch
            .extend(other.before_every_branch.iter().cloned());
        self.after_every_branch
            .extend(other.after_every_branch.iter().cloned());
        self.before_every_step
            .extend(other.before_every_step.iter().cloned());
        self.after_every_step
            .extend(other.after_every_step.iter().cloned());
    }

    /// The text of every step, used to match branches across runs.
    pub fn step_texts(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.text.as_str()).collect()
    }

    /// Clears every outcome field on the branch and its steps.
    pub fn reset(&mut self) {
        self.is_running = false;
        self.is_passed = false;
        self.is_failed = false;
        self.is_skipped = false;
        self.log.clear();
        for step in &mut self.steps {
            step.reset();
        }
    }
}

/// The interchange format produced after branch generation and consumed when merging
/// results from a previous run.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct SerializedBranches {
    /// Branches in run order.
    pub branches: Vec<Branch>,
    /// Tree-level hooks run once before all branches.
    pub before_everything: Vec<Hook>,
    /// Tree-level hooks run once after all branches.
    pub after_everything: Vec<Hook>,
    /// Wall-clock duration of the last run in ms, or -1.
    pub elapsed: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_kind_matching_ignores_case_and_spacing() {
        assert_eq!(
            HookKind::from_text("before   every branch"),
            Some(HookKind::BeforeEveryBranch)
        );
        assert_eq!(
            HookKind::from_text("AFTER EVERYTHING"),
            Some(HookKind::AfterEverything)
        );
        assert_eq!(HookKind::from_text("Before Every"), None);
    }

    #[test]
    fn test_frequency_sort_key_puts_unset_between_high_and_med() {
        let mut order = vec![
            Some(Frequency::Low),
            Some(Frequency::Med),
            None,
            Some(Frequency::High),
        ];
        order.sort_by_key(|f| Frequency::sort_key(*f));
        assert_eq!(
            order,
            vec![
                Some(Frequency::High),
                None,
                Some(Frequency::Med),
                Some(Frequency::Low)
            ]
        );
    }

    #[test]
    fn test_frequency_parse_rejects_wrong_case() {
        assert_eq!("med".parse::<Frequency>(), Ok(Frequency::Med));
        assert!("High".parse::<Frequency>().is_err());
    }

    #[test]
    fn test_call_text_prefers_assignment_call() {
        let mut step = Step::new(NodeKind::Step);
        step.text = "{x} = Get Value".to_string();
        step.var_assignments.push(VarAssignment {
            name: "x".to_string(),
            value: VarValue::Call("Get Value".to_string()),
            is_local: false,
        });
        assert_eq!(step.call_text(), "Get Value");
    }

    #[test]
    fn test_branch_step_serialization_drops_tree_references() {
        let mut step = Step::new(NodeKind::Step);
        step.id = StepId(7);
        step.text = "A".to_string();
        let clone = BranchStep::from_tree_step(&step, 2);
        let json = serde_json::to_string(&clone).unwrap();
        assert!(!json.contains("originalStepInTree"));
        let back: BranchStep = serde_json::from_str(&json).unwrap();
        assert_eq!(back.original_step_in_tree, None);
        assert_eq!(back.branch_indents, 2);
    }
}
