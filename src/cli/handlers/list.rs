//! `--list`: print the branches instead of running them.

use crate::{core::tree::Tree, models::Branch};
use colored::Colorize;

/// Prints every generated branch without running anything.
pub fn handle(tree: &Tree) {
    if tree.branches.is_empty() {
        println!("{}", "No branches to run.".yellow());
        return;
    }
    for (idx, branch) in tree.branches.iter().enumerate() {
        println!("{}", render_branch(idx, branch));
    }
    println!(
        "{} branches, {} steps{}",
        tree.get_branch_count(false, false),
        tree.get_step_count(false, false, false),
        if tree.is_debug { " (debug mode)" } else { "" }
    );
}

fn render_branch(idx: usize, branch: &Branch) -> String {
    let mut tags = Vec::new();
    if let Some(frequency) = branch.frequency {
        tags.push(format!("frequency={}", frequency.as_str()));
    }
    if !branch.groups.is_empty() {
        tags.push(format!("groups={}", branch.groups.join(",")));
    }
    if branch.non_parallel_id.is_some() {
        tags.push("non-parallel".to_string());
    }

    let mut out = format!("{}", format!("Branch {}", idx + 1).bold());
    if !tags.is_empty() {
        out.push_str(&format!(" {}", format!("[{}]", tags.join(" ")).dimmed()));
    }
    for step in &branch.steps {
        let indent = "    ".repeat(step.branch_indents + 1);
        let text = if step.identifiers.is_debug {
            format!("{} ~", step.text).magenta().to_string()
        } else {
            step.text.clone()
        };
        out.push_str(&format!("\n{}{}", indent, text));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::branchifier::BranchifyOptions;

    #[test]
    fn test_render_branch_shows_tags_and_nesting() {
        colored::control::set_override(false);
        let mut tree = Tree::new();
        tree.parse_in(
            "A -\n    {frequency}='low'\n        Open\n\n* Open\n    B -",
            Some("list.smash"),
            false,
        )
        .unwrap();
        tree.generate_branches(&BranchifyOptions::default()).unwrap();
        let rendered = render_branch(0, &tree.branches[0]);
        assert!(rendered.starts_with("Branch 1 [frequency=low]"));
        // Tree depth is flattened; only function calls indent.
        assert!(rendered.contains("\n    A\n    {frequency}='low'\n    Open\n        B"));
    }
}
