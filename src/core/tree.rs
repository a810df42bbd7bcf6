// src/core/tree.rs

//! The step tree: an index-based arena of `Step` nodes rooted at a synthetic node
//! at indent -1, built by one or more calls to [`Tree::parse_in`].

use crate::{
    constants::SPACES_PER_INDENT,
    core::{errors::TreeError, line_parser},
    models::{Branch, Hook, NodeKind, Step, StepId},
};
use log::debug;

/// Bookkeeping carried from one `parse_in` call to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserState {
    /// Every file fed to the tree, in order. Unnamed sources are recorded as `None`.
    pub files_parsed: Vec<Option<String>>,
    /// Total number of source lines read so far.
    pub lines_parsed: usize,
}

/// A parsed tree plus the branches generated from it.
#[derive(Debug, Clone)]
pub struct Tree {
    /// The arena. `steps[0]` is the root.
    pub steps: Vec<Step>,
    /// State threaded through successive `parse_in` calls.
    pub parser_state: ParserState,
    /// Branches from the last `generate_branches`, in run order.
    pub branches: Vec<Branch>,
    /// Tree-wide hooks run once before everything, in run order.
    pub before_everything: Vec<Hook>,
    /// Tree-wide hooks run once after everything, in run order.
    pub after_everything: Vec<Hook>,
    /// The branch set was reduced to a single `~` branch.
    pub is_debug: bool,
    /// Duration of the last uninterrupted run in ms, or -1 after a pause.
    pub elapsed: i64,
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

/// A line after the first pass: either a blank separator or a parsed step.
enum Entry {
    Blank,
    Line {
        step: Box<Step>,
        // A multi-line code block ended on a `}` line; nothing may join this line's group.
        closes_block: bool,
    },
}

/// Consecutive same-indent lines, not yet attached to the tree.
struct Unit {
    steps: Vec<Step>,
    indents: i32,
    blank_after: bool,
    closed: bool,
    sequential: bool,
}

impl Unit {
    fn is_marker(&self) -> bool {
        self.steps.len() == 1 && self.steps.first().is_some_and(Step::is_sequential_marker)
    }

    fn first(&self) -> Option<&Step> {
        self.steps.first()
    }
}

impl Tree {
    /// An empty tree holding only the root.
    pub fn new() -> Self {
        let mut root = Step::new(NodeKind::Root);
        root.indents = -1;
        Self {
            steps: vec![root],
            parser_state: ParserState::default(),
            branches: Vec::new(),
            before_everything: Vec::new(),
            after_everything: Vec::new(),
            is_debug: false,
            elapsed: 0,
        }
    }

    /// The root node's id.
    pub fn root(&self) -> StepId {
        StepId(0)
    }

    /// Looks up a node.
    pub fn step(&self, id: StepId) -> &Step {
        self.steps
            .get(id.0)
            .expect("step ids are only minted by this tree")
    }

    fn step_mut(&mut self, id: StepId) -> &mut Step {
        self.steps
            .get_mut(id.0)
            .expect("step ids are only minted by this tree")
    }

    fn push(&mut self, mut step: Step) -> StepId {
        let id = StepId(self.steps.len());
        step.id = id;
        self.steps.push(step);
        id
    }

    /// Number of four-space indents at the start of `line`.
    /// Blank and comment-only lines count as 0.
    pub fn num_indents(
        line: &str,
        filename: Option<&str>,
        line_number: usize,
    ) -> Result<i32, TreeError> {
        let trimmed = line.trim_start();
        if trimmed.is_empty() || trimmed.starts_with("//") {
            return Ok(0);
        }
        let leading = line.get(..line.len() - trimmed.len()).unwrap_or("");
        if leading.contains('\t') {
            return Err(TreeError::indentation(
                "Tabs are not allowed in indentation. Use spaces",
                filename,
                line_number,
            ));
        }
        let spaces = leading.chars().count();
        if spaces % SPACES_PER_INDENT != 0 {
            return Err(TreeError::indentation(
                format!(
                    "The number of spaces at the beginning of a line must be a multiple of {}. You have {}",
                    SPACES_PER_INDENT, spaces
                ),
                filename,
                line_number,
            ));
        }
        i32::try_from(spaces / SPACES_PER_INDENT).map_err(|_| {
            TreeError::indentation("The line is indented too deeply", filename, line_number)
        })
    }

    /// Parses `text` and attaches its steps under the root. Can be called once per file.
    pub fn parse_in(
        &mut self,
        text: &str,
        filename: Option<&str>,
        is_built_in: bool,
    ) -> Result<(), TreeError> {
        let entries = Self::scan_lines(text, filename, is_built_in)?;
        let units = Self::group_entries(entries);
        Self::validate_units(&units, filename)?;
        self.attach_units(units, filename)?;

        let lines: Vec<&str> = text.lines().collect();
        self.parser_state.files_parsed.push(filename.map(str::to_string));
        self.parser_state.lines_parsed += lines.len();
        debug!(
            "Parsed {} lines from {}",
            lines.len(),
            filename.unwrap_or("<unnamed>")
        );
        Ok(())
    }

    /// First pass: parse every line and collect multi-line code blocks.
    fn scan_lines(
        text: &str,
        filename: Option<&str>,
        is_built_in: bool,
    ) -> Result<Vec<Entry>, TreeError> {
        let lines: Vec<&str> = text.lines().collect();
        let mut entries = Vec::new();
        let mut i = 0;
        while let Some(line) = lines.get(i) {
            let line_number = i + 1;
            i += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                entries.push(Entry::Blank);
                continue;
            }
            if trimmed.starts_with("//") {
                continue;
            }

            let indents = Self::num_indents(line, filename, line_number)?;
            let parsed = line_parser::parse_line(line, filename, line_number)?;
            let mut step = parsed.step;
            step.indents = indents;
            step.is_built_in = is_built_in;

            let mut closes_block = false;
            if parsed.opens_code_block {
                let mut body = Vec::new();
                loop {
                    let Some(code_line) = lines.get(i) else {
                        return Err(TreeError::structure(
                            "An opened code block was never closed",
                            filename,
                            line_number,
                        ));
                    };
                    i += 1;
                    if code_line.trim() == "}" {
                        let spaces = code_line.len() - code_line.trim_start().len();
                        let closer_indents = i32::try_from(spaces / SPACES_PER_INDENT).unwrap_or(i32::MAX);
                        if spaces % SPACES_PER_INDENT == 0 && closer_indents == indents {
                            break;
                        }
                        if closer_indents < indents {
                            return Err(TreeError::structure(
                                "The closing brace of a code block is at the wrong indent",
                                filename,
                                i,
                            ));
                        }
                    }
                    body.push(*code_line);
                }
                step.code_block = Some(body.join("\n"));
                closes_block = true;
            }

            entries.push(Entry::Line {
                step: Box::new(step),
                closes_block,
            });
        }
        Ok(entries)
    }

    /// Second pass: merge consecutive same-indent lines into units.
    fn group_entries(entries: Vec<Entry>) -> Vec<Unit> {
        let mut units: Vec<Unit> = Vec::new();
        let mut current: Option<Unit> = None;

        for entry in entries {
            match entry {
                Entry::Blank => {
                    if let Some(mut unit) = current.take() {
                        unit.blank_after = true;
                        units.push(unit);
                    } else if let Some(last) = units.last_mut() {
                        last.blank_after = true;
                    }
                }
                Entry::Line { step, closes_block } => {
                    let step = *step;
                    let joins = current.as_ref().is_some_and(|unit| {
                        unit.indents == step.indents
                            && !unit.closed
                            && !unit.is_marker()
                            && unit.first().is_some_and(|s| s.hook.is_none())
                            && step.hook.is_none()
                            && !step.is_sequential_marker()
                    });
                    if joins {
                        if let Some(unit) = current.as_mut() {
                            unit.steps.push(step);
                            unit.closed = closes_block;
                        }
                    } else {
                        if let Some(unit) = current.take() {
                            units.push(unit);
                        }
                        current = Some(Unit {
                            indents: step.indents,
                            steps: vec![step],
                            blank_after: false,
                            closed: closes_block,
                            sequential: false,
                        });
                    }
                }
            }
        }
        if let Some(unit) = current {
            units.push(unit);
        }
        units
    }

    /// Checks step blocks and `..` markers against their neighbours.
    fn validate_units(units: &[Unit], filename: Option<&str>) -> Result<(), TreeError> {
        for (idx, unit) in units.iter().enumerate() {
            let line_number = unit.first().map_or(0, |s| s.line_number);
            let next = units.get(idx + 1);
            let structure = |message: &str| TreeError::structure(message, filename, line_number);

            if unit.steps.len() > 1 {
                if let Some(bad) = unit
                    .steps
                    .iter()
                    .find(|s| s.identifiers.is_function_declaration || s.code_block.is_some())
                {
                    return Err(TreeError::structure(
                        "A step block cannot contain a function declaration or a code block",
                        filename,
                        bad.line_number,
                    ));
                }
                if next.is_some_and(|n| n.indents > unit.indents) && !unit.blank_after {
                    return Err(structure(
                        "A step block with children must be followed by a blank line",
                    ));
                }
            }

            if unit.is_marker() {
                let Some(next) = next else {
                    return Err(structure("A '..' line must be followed by a step block"));
                };
                if next.indents > unit.indents {
                    return Err(structure("A '..' line cannot have children"));
                }
                if next.is_marker() {
                    return Err(structure("Two '..' lines cannot appear in a row"));
                }
                if unit.blank_after || next.indents != unit.indents || next.steps.len() < 2 {
                    return Err(structure(
                        "A '..' line must be immediately followed by a step block",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Third pass: attach units to the arena using a stack of open ancestors.
    fn attach_units(&mut self, units: Vec<Unit>, filename: Option<&str>) -> Result<(), TreeError> {
        let mut ancestors: Vec<(i32, StepId)> = vec![(-1, self.root())];
        let mut next_is_sequential = false;
        let mut first = true;

        for mut unit in units {
            let line_number = unit.first().map_or(0, |s| s.line_number);
            if first && unit.indents != 0 {
                return Err(TreeError::structure(
                    "The first step must have 0 indents",
                    filename,
                    line_number,
                ));
            }
            first = false;

            if unit.is_marker() {
                next_is_sequential = true;
                continue;
            }
            unit.sequential = std::mem::take(&mut next_is_sequential);

            let top = ancestors.last().map_or(-1, |(indents, _)| *indents);
            if unit.indents > top + 1 {
                return Err(TreeError::structure(
                    "This step is indented too far relative to the one above it",
                    filename,
                    line_number,
                ));
            }
            while ancestors.last().is_some_and(|(indents, _)| *indents >= unit.indents) {
                ancestors.pop();
            }
            let parent = ancestors.last().map_or(self.root(), |(_, id)| *id);

            for step in &unit.steps {
                if step.hook.is_some_and(|h| h.is_tree_level()) && step.indents != 0 {
                    return Err(TreeError::structure(
                        format!("The '{}' hook must be at 0 indents", step.text),
                        filename,
                        step.line_number,
                    ));
                }
            }

            let node = if unit.steps.len() == 1 && !unit.sequential {
                let mut steps = unit.steps;
                let Some(mut step) = steps.pop() else { continue };
                step.parent = Some(parent);
                self.push(step)
            } else {
                let mut block = Step::new(NodeKind::StepBlock {
                    members: Vec::new(),
                });
                block.filename = filename.map(str::to_string);
                block.line_number = line_number;
                block.indents = unit.indents;
                block.parent = Some(parent);
                block.identifiers.is_sequential = unit.sequential;
                let block_id = self.push(block);

                let mut members = Vec::with_capacity(unit.steps.len());
                for mut step in unit.steps {
                    step.parent = Some(parent);
                    step.containing_step_block = Some(block_id);
                    members.push(self.push(step));
                }
                self.step_mut(block_id).kind = NodeKind::StepBlock { members };
                block_id
            };

            self.step_mut(parent).children.push(node);
            ancestors.push((unit.indents, node));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Tree, TreeError> {
        let mut tree = Tree::new();
        tree.parse_in(text, Some("tree.smash"), false)?;
        Ok(tree)
    }

    fn child(tree: &Tree, id: StepId, n: usize) -> &Step {
        tree.step(tree.step(id).children[n])
    }

    #[test]
    fn test_num_indents() {
        assert_eq!(Tree::num_indents("        A", None, 1).unwrap(), 2);
        assert_eq!(Tree::num_indents("", None, 1).unwrap(), 0);
        assert_eq!(Tree::num_indents("      // note", None, 1).unwrap(), 0);
        assert!(matches!(
            Tree::num_indents("   A", None, 1),
            Err(TreeError::Indentation { .. })
        ));
        assert!(Tree::num_indents("\tA", None, 1).is_err());
    }

    #[test]
    fn test_parents_and_children() {
        let tree = parse("A -\n    B -\n        C -\n    D -").unwrap();
        let root = tree.root();
        assert_eq!(tree.step(root).children.len(), 1);
        let a = child(&tree, root, 0);
        assert_eq!(a.text, "A");
        assert_eq!(a.children.len(), 2);
        let b = child(&tree, a.id, 0);
        assert_eq!(b.parent, Some(a.id));
        assert_eq!(child(&tree, b.id, 0).text, "C");
        assert_eq!(child(&tree, a.id, 1).text, "D");
    }

    #[test]
    fn test_step_block_and_children() {
        let tree = parse("A -\nB -\n\n    C -").unwrap();
        let block = child(&tree, tree.root(), 0);
        assert!(block.is_step_block());
        assert_eq!(block.members().len(), 2);
        let member = tree.step(block.members()[1]);
        assert_eq!(member.containing_step_block, Some(block.id));
        assert_eq!(member.parent, Some(tree.root()));
        assert_eq!(child(&tree, block.id, 0).text, "C");
    }

    #[test]
    fn test_step_block_needs_blank_line_before_children() {
        let err = parse("A -\nB -\n    C -").unwrap_err();
        assert!(matches!(err, TreeError::Structure { .. }));
    }

    #[test]
    fn test_step_block_rejects_declarations() {
        assert!(parse("A -\n* F {\n}").is_err());
        assert!(parse("A -\n* F\n").is_err());
        assert!(parse("A -\n\n* F {\n}").is_ok());
    }

    #[test]
    fn test_multiline_code_block() {
        let tree = parse("* Open {\n    echo one\n    echo two\n}\nOpen").unwrap();
        let decl = child(&tree, tree.root(), 0);
        assert_eq!(decl.code_block.as_deref(), Some("    echo one\n    echo two"));
        assert_eq!(child(&tree, tree.root(), 1).text, "Open");
    }

    #[test]
    fn test_unclosed_code_block() {
        let err = parse("A {\n    echo").unwrap_err();
        assert!(matches!(err, TreeError::Structure { .. }));
    }

    #[test]
    fn test_closing_brace_at_wrong_indent() {
        assert!(parse("A -\n    B {\n}").is_err());
    }

    #[test]
    fn test_first_step_and_indent_jumps() {
        assert!(parse("    A -").is_err());
        assert!(parse("A -\n        B -").is_err());
    }

    #[test]
    fn test_sequential_marker() {
        let tree = parse("..\nA -\nB -").unwrap();
        let block = child(&tree, tree.root(), 0);
        assert!(block.is_step_block());
        assert!(block.identifiers.is_sequential);

        assert!(parse("..\n    A -").is_err());
        assert!(parse("A -\n..").is_err());
        assert!(parse("..\nA -").is_err());
        assert!(parse("..\n..\nA -\nB -").is_err());
    }

    #[test]
    fn test_tree_level_hooks_must_be_at_root() {
        assert!(parse("A -\n\n    * Before Everything {\n    }").is_err());
        assert!(parse("* After Everything {\n}\nA -").is_ok());
    }

    #[test]
    fn test_multiple_files_share_the_root() {
        let mut tree = Tree::new();
        tree.parse_in("A -", Some("a.smash"), false).unwrap();
        tree.parse_in("B -\n\n", Some("b.smash"), true).unwrap();
        assert_eq!(tree.step(tree.root()).children.len(), 2);
        let b = child(&tree, tree.root(), 1);
        assert_eq!(b.filename.as_deref(), Some("b.smash"));
        assert_eq!(b.line_number, 1);
        assert!(b.is_built_in);
        assert_eq!(tree.parser_state.files_parsed.len(), 2);
    }
}
