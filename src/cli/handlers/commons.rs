// src/cli/handlers/commons.rs

// Shared by the list and run handlers.

use crate::{
    core::{config_loader::RunConfig, tree::Tree},
    models::Branch,
};
use anyhow::{Context, Result};
use colored::{ColoredString, Colorize};
use std::fs;
use std::path::Path;

/// Parses the built-in files, then the user's files, and generates the branches.
pub fn build_tree(files: &[impl AsRef<Path>], config: &RunConfig) -> Result<Tree> {
    let mut tree = Tree::new();
    for path in &config.built_in {
        parse_file(&mut tree, path, true)?;
    }
    for path in files {
        parse_file(&mut tree, path.as_ref(), false)?;
    }
    tree.generate_branches(&config.branchify_options())
        .context("Failed to generate branches")?;
    log::debug!(
        "Parsed {} lines into {} branches",
        tree.parser_state.lines_parsed,
        tree.branches.len()
    );
    Ok(tree)
}

fn parse_file(tree: &mut Tree, path: &Path, is_built_in: bool) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read test file '{}'", path.display()))?;
    let filename = path.display().to_string();
    tree.parse_in(&text, Some(&filename), is_built_in)
        .with_context(|| format!("Failed to parse '{}'", filename))?;
    Ok(())
}

/// A short colored label for the branch outcome.
pub fn status_label(branch: &Branch) -> ColoredString {
    if branch.passed_last_time {
        "passed last time".dimmed()
    } else if branch.is_failed {
        "failed".red().bold()
    } else if branch.is_skipped {
        "skipped".yellow()
    } else if branch.is_passed {
        "passed".green()
    } else {
        "not run".dimmed()
    }
}

/// Prints the per-branch failures and the totals of a finished run.
pub fn print_summary(tree: &Tree) {
    println!();
    for (idx, branch) in tree.branches.iter().enumerate() {
        if !branch.is_failed {
            continue;
        }
        println!("{} {}", format!("Branch {}", idx + 1).bold(), status_label(branch));
        for step in &branch.steps {
            if let Some(error) = &step.error {
                println!("  {} {}", step.text.cyan(), error.to_string().red());
            }
        }
        for line in &branch.log {
            println!("  {}", line.dimmed());
        }
    }

    let count = |f: fn(&Branch) -> bool| tree.branches.iter().filter(|b| f(b)).count();
    let passed = count(|b| b.is_passed);
    let failed = count(|b| b.is_failed);
    let skipped = count(|b| b.is_skipped);
    let previous = count(|b| b.passed_last_time);

    println!(
        "{} {}, {}, {}",
        "Summary:".bold(),
        format!("{} passed", passed).green(),
        format!("{} failed", failed).red(),
        format!("{} skipped", skipped).yellow()
    );
    if previous > 0 {
        println!("{}", format!("{} passed last time", previous).dimmed());
    }
    let unexpected = tree.get_step_count(true, true, true);
    if unexpected > 0 {
        println!(
            "{}",
            format!("{} steps did not behave as expected", unexpected).yellow()
        );
    }
    match tree.elapsed {
        -1 => println!("{}", "Elapsed time not measured (the run was paused)".dimmed()),
        ms => println!("{}", format!("Elapsed: {} ms", ms).dimmed()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_build_tree_parses_built_ins_first() {
        let dir = tempdir().unwrap();
        let built_in = dir.path().join("common.smash");
        fs::write(&built_in, "* Open Page {\n    echo open\n}\n").unwrap();
        let test_file = dir.path().join("login.smash");
        fs::write(&test_file, "Open Page\n    Log In -\n").unwrap();

        let config = RunConfig {
            built_in: vec![built_in],
            ..RunConfig::default()
        };
        let tree = build_tree(&[test_file], &config).unwrap();
        assert_eq!(tree.branches.len(), 1);
        assert_eq!(tree.branches[0].step_texts(), vec!["Open Page", "Log In"]);
        assert_eq!(
            tree.branches[0].steps[0].code_block.as_deref().map(str::trim),
            Some("echo open")
        );
    }

    #[test]
    fn test_build_tree_reports_the_failing_file() {
        let dir = tempdir().unwrap();
        let bad = dir.path().join("bad.smash");
        fs::write(&bad, "    Indented first -\n").unwrap();
        let err = build_tree(&[bad], &RunConfig::default()).unwrap_err();
        assert!(format!("{:#}", err).contains("bad.smash"));

        let missing = dir.path().join("missing.smash");
        assert!(build_tree(&[missing], &RunConfig::default()).is_err());
    }
}
