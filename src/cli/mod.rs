//! Command-line arguments.

use crate::{core::config_loader::ConfigLayer, models::Frequency};
use clap::Parser;
use std::path::PathBuf;

pub mod handlers;

/// ramify: parses branching test trees and runs every branch.
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about,
    styles = clap::builder::Styles::styled()
        .header(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .usage(clap::builder::styling::AnsiColor::Yellow.on_default().bold())
        .literal(clap::builder::styling::AnsiColor::Cyan.on_default().bold())
        .placeholder(clap::builder::styling::AnsiColor::Green.on_default()),
)]
pub struct Cli {
    /// Test files to parse, in order.
    #[arg(required = true, value_name = "FILES")]
    pub files: Vec<PathBuf>,

    /// Maximum number of branches running at the same time.
    #[arg(long, value_name = "N")]
    pub max_parallel: Option<usize>,

    /// Only run branches in one of these groups (comma separated).
    #[arg(long, value_delimiter = ',', value_name = "GROUPS")]
    pub groups: Option<Vec<String>>,

    /// Only run branches at least this frequent (high, med or low).
    #[arg(long, value_name = "FREQUENCY")]
    pub min_frequency: Option<Frequency>,

    /// Fail if any step is marked with `$` or `~`.
    #[arg(long)]
    pub no_debug: bool,

    /// Skip branches that passed in this previous result file.
    #[arg(long, value_name = "PREV_JSON")]
    pub skip_passed: Option<PathBuf>,

    /// Write the branch results to this file after the run.
    #[arg(long, value_name = "PATH")]
    pub output: Option<PathBuf>,

    /// Use this config file instead of ./ramify.toml.
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Print the generated branches and exit without running them.
    #[arg(long)]
    pub list: bool,
}

impl Cli {
    /// The flags that override config files. Flags left out keep the file values.
    pub fn config_overrides(&self) -> ConfigLayer {
        ConfigLayer {
            max_parallel: self.max_parallel,
            groups: self.groups.clone(),
            min_frequency: self.min_frequency,
            no_debug: self.no_debug.then_some(true),
            skip_passed: self.skip_passed.is_some().then_some(true),
            built_in: None,
            output: self.output.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let cli = Cli::try_parse_from([
            "ramify",
            "--max-parallel",
            "3",
            "--groups",
            "smoke,nightly",
            "--min-frequency",
            "med",
            "--no-debug",
            "a.smash",
            "b.smash",
        ])
        .unwrap();
        assert_eq!(cli.files, vec![PathBuf::from("a.smash"), PathBuf::from("b.smash")]);
        let overrides = cli.config_overrides();
        assert_eq!(overrides.max_parallel, Some(3));
        assert_eq!(
            overrides.groups,
            Some(vec!["smoke".to_string(), "nightly".to_string()])
        );
        assert_eq!(overrides.min_frequency, Some(Frequency::Med));
        assert_eq!(overrides.no_debug, Some(true));
        assert_eq!(overrides.skip_passed, None);
    }

    #[test]
    fn test_files_are_required_and_frequency_is_checked() {
        assert!(Cli::try_parse_from(["ramify"]).is_err());
        assert!(Cli::try_parse_from(["ramify", "--min-frequency", "often", "a.smash"]).is_err());
    }
}
