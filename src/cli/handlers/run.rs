//! The default action: run every branch, with an interactive prompt while paused.

use crate::{
    cli::{Cli, handlers::commons},
    core::{
        config_loader::RunConfig,
        errors::RunnerError,
        runner::{Runner, RunnerState},
        tree::Tree,
    },
    system::executor::ShellExecutor,
};
use anyhow::{Context, Result};
use colored::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::io::{AsyncBufReadExt, BufReader};

/// What the user typed at the debug prompt.
#[derive(Debug, PartialEq, Eq)]
enum DebugCommand<'a> {
    Resume,
    Step,
    Skip,
    Inject(&'a str),
    Exit,
    Unknown,
}

fn parse_debug_command(line: &str) -> DebugCommand<'_> {
    let line = line.trim();
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match (command, rest.trim()) {
        ("r", _) => DebugCommand::Resume,
        ("s", _) => DebugCommand::Step,
        ("k", _) => DebugCommand::Skip,
        ("i", text) if !text.is_empty() => DebugCommand::Inject(text),
        ("x", _) => DebugCommand::Exit,
        _ => DebugCommand::Unknown,
    }
}

/// Runs every branch of `tree` and prints the outcome.
/// Returns `true` when no branch failed.
pub async fn handle(cli: &Cli, config: &RunConfig, mut tree: Tree, cwd: PathBuf) -> Result<bool> {
    let previous = cli.skip_passed.clone().or_else(|| {
        if config.skip_passed {
            config.output.clone()
        } else {
            None
        }
    });
    if let Some(path) = &previous {
        merge_previous_results(&mut tree, path)?;
    }

    let mut options = config.runner_options();
    options.skip_passed = previous.is_some();
    let runner = Runner::new(tree, Arc::new(ShellExecutor::new(cwd)), options);
    runner.init(true).await;

    let stop_token = runner.stop_token();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupted. Stopping after the current steps.");
            stop_token.store(true, Ordering::SeqCst);
        }
    });

    runner.run().await?;
    debug_session(&runner).await?;
    ctrl_c.abort();

    let tree = runner.tree().await;
    commons::print_summary(&tree);
    if let Some(output) = &config.output {
        write_results(&tree, output)?;
    }
    Ok(!tree.branches.iter().any(|branch| branch.is_failed))
}

fn merge_previous_results(tree: &mut Tree, path: &Path) -> Result<()> {
    if !path.is_file() {
        log::warn!(
            "No previous results at '{}'. Running every branch.",
            path.display()
        );
        return Ok(());
    }
    let json = fs::read_to_string(path)
        .with_context(|| format!("Failed to read previous results '{}'", path.display()))?;
    let merged = tree
        .merge_branches_from_prev_run(&json)
        .with_context(|| format!("Failed to load previous results '{}'", path.display()))?;
    println!(
        "{}",
        format!("{} branches passed last time and will be skipped", merged).dimmed()
    );
    Ok(())
}

fn write_results(tree: &Tree, output: &Path) -> Result<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory '{}'", parent.display()))?;
    }
    let json = tree
        .serialize_branches()
        .context("Failed to serialize branch results")?;
    fs::write(output, json)
        .with_context(|| format!("Failed to write results to '{}'", output.display()))?;
    println!("{} {}", "Results written to".dimmed(), output.display());
    Ok(())
}

/// Interactive prompt shown while the runner is paused on a `~` step.
async fn debug_session(runner: &Runner) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        match runner.state().await {
            RunnerState::Paused => {}
            // A stepped branch finished and other branches are still waiting.
            RunnerState::Running => {
                runner.run().await?;
                continue;
            }
            _ => break,
        }
        print_paused_position(runner).await;
        print!(
            "{} ",
            "(r)esume, (s)tep, s(k)ip, (i)nject <step>, e(x)it >".cyan()
        );
        std::io::stdout().flush().context("Failed to flush stdout")?;

        let Some(line) = lines
            .next_line()
            .await
            .context("Failed to read from stdin")?
        else {
            runner.stop().await;
            break;
        };

        let result = match parse_debug_command(&line) {
            DebugCommand::Resume => runner.run().await.map(|_| ()),
            DebugCommand::Step => runner.run_one_step().await.map(|_| ()),
            DebugCommand::Skip => runner.skip_one_step().await.map(|_| ()),
            DebugCommand::Inject(text) => runner.inject(text).await.map(|step| {
                match &step.error {
                    Some(error) => println!("{} {}", "Injected step failed:".red(), error),
                    None => println!("{}", "Injected step passed".green()),
                }
            }),
            DebugCommand::Exit => {
                runner.stop().await;
                Ok(())
            }
            DebugCommand::Unknown => {
                println!("{}", "Unknown command".yellow());
                Ok(())
            }
        };
        match result {
            // Only a paused runner accepts these; say so and keep prompting.
            Err(RunnerError::State(message)) => println!("{}", message.yellow()),
            Err(RunnerError::Tree(err)) => println!("{} {}", "Cannot inject:".red(), err),
            other => other?,
        }
    }
    Ok(())
}

async fn print_paused_position(runner: &Runner) {
    let snapshot = runner.serialize().await;
    let tree = runner.tree().await;
    for (branch_idx, step_idx) in snapshot.paused_at {
        let step = step_idx.and_then(|step_idx| {
            tree.branches
                .get(branch_idx)
                .and_then(|branch| branch.steps.get(step_idx))
        });
        match step {
            Some(step) => println!(
                "{} {} {}",
                "Paused before".magenta().bold(),
                step.text.cyan(),
                format!(
                    "[{}:{}]",
                    step.filename.as_deref().unwrap_or("<unnamed>"),
                    step.line_number
                )
                .dimmed()
            ),
            None => println!(
                "{}",
                format!("Paused at the end of branch {}", branch_idx + 1).magenta()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::branchifier::BranchifyOptions;
    use tempfile::tempdir;

    #[test]
    fn test_parse_debug_command() {
        assert_eq!(parse_debug_command("r"), DebugCommand::Resume);
        assert_eq!(parse_debug_command(" s \n"), DebugCommand::Step);
        assert_eq!(parse_debug_command("k"), DebugCommand::Skip);
        assert_eq!(
            parse_debug_command("i {x}='5'"),
            DebugCommand::Inject("{x}='5'")
        );
        assert_eq!(parse_debug_command("i"), DebugCommand::Unknown);
        assert_eq!(parse_debug_command("x"), DebugCommand::Exit);
        assert_eq!(parse_debug_command("quit"), DebugCommand::Unknown);
    }

    #[test]
    fn test_results_round_trip_through_skip_passed() {
        let dir = tempdir().unwrap();
        let output = dir.path().join("out").join("results.json");

        let mut tree = Tree::new();
        tree.parse_in("A -\nB -", Some("r.smash"), false).unwrap();
        tree.generate_branches(&BranchifyOptions::default()).unwrap();
        tree.branches[0].is_passed = true;
        tree.branches[1].is_failed = true;
        write_results(&tree, &output).unwrap();

        let mut next = Tree::new();
        next.parse_in("A -\nB -", Some("r.smash"), false).unwrap();
        next.generate_branches(&BranchifyOptions::default()).unwrap();
        merge_previous_results(&mut next, &output).unwrap();
        assert!(next.branches[0].passed_last_time);
        assert!(!next.branches[1].passed_last_time);

        // A missing file only warns.
        merge_previous_results(&mut next, &dir.path().join("none.json")).unwrap();
    }
}
