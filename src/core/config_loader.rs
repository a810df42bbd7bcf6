//! # Config Loader
//!
//! Resolves the `RunConfig` for one invocation by stacking configuration layers,
//! from lowest to highest precedence:
//!
//! 1. Built-in defaults.
//! 2. The per-user file, `<config_dir>/ramify/ramify.toml`.
//! 3. The project file, `ramify.toml` in the working directory, or the file given
//!    with `--config`.
//! 4. Command-line flags.
//!
//! Each file is a partial `ConfigLayer`: keys it leaves out keep the value of the
//! layer below. Relative paths are resolved against the directory of the file that
//! set them.
use crate::{
    constants::{DEFAULT_MAX_PARALLEL, PROJECT_CONFIG_FILENAME, USER_CONFIG_DIR},
    core::{branchifier::BranchifyOptions, runner::RunnerOptions},
    models::Frequency,
};
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One layer of configuration, as written in a `ramify.toml` file.
#[derive(Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
/// Every field is optional; a missing field keeps the value of the layer below.
pub struct ConfigLayer {
    /// See [`RunConfig::max_parallel`].
    pub max_parallel: Option<usize>,
    /// See [`RunConfig::groups`].
    pub groups: Option<Vec<String>>,
    /// See [`RunConfig::min_frequency`].
    pub min_frequency: Option<Frequency>,
    /// See [`RunConfig::no_debug`].
    pub no_debug: Option<bool>,
    /// See [`RunConfig::skip_passed`].
    pub skip_passed: Option<bool>,
    /// See [`RunConfig::built_in`]. Relative paths are taken from the file's directory.
    pub built_in: Option<Vec<PathBuf>>,
    /// See [`RunConfig::output`]. Relative paths are taken from the file's directory.
    pub output: Option<PathBuf>,
}

/// The fully merged configuration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Upper bound on concurrently running branches.
    pub max_parallel: usize,
    /// Only run branches tagged with one of these groups. Empty means all.
    pub groups: Vec<String>,
    /// Only run branches at least this frequent.
    pub min_frequency: Option<Frequency>,
    /// Refuse `$` and `~` anywhere in the tree.
    pub no_debug: bool,
    /// Do not rerun branches that passed in the previous run stored at `output`.
    pub skip_passed: bool,
    /// Files parsed as built-in before the user's files.
    pub built_in: Vec<PathBuf>,
    /// Where the serialized branch set is written after a run.
    pub output: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            groups: Vec::new(),
            min_frequency: None,
            no_debug: false,
            skip_passed: false,
            built_in: Vec::new(),
            output: None,
        }
    }
}

impl RunConfig {
    /// Overlays `layer` on top of this config. `base_dir` anchors relative paths.
    pub fn apply(&mut self, layer: ConfigLayer, base_dir: Option<&Path>) {
        let anchor = |path: PathBuf| match base_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path,
        };
        if let Some(max_parallel) = layer.max_parallel {
            self.max_parallel = max_parallel;
        }
        if let Some(groups) = layer.groups {
            self.groups = groups;
        }
        if layer.min_frequency.is_some() {
            self.min_frequency = layer.min_frequency;
        }
        if let Some(no_debug) = layer.no_debug {
            self.no_debug = no_debug;
        }
        if let Some(skip_passed) = layer.skip_passed {
            self.skip_passed = skip_passed;
        }
        if let Some(built_in) = layer.built_in {
            self.built_in = built_in.into_iter().map(anchor).collect();
        }
        if let Some(output) = layer.output {
            self.output = Some(anchor(output));
        }
    }

    /// The filters handed to branch generation.
    pub fn branchify_options(&self) -> BranchifyOptions {
        BranchifyOptions {
            groups: (!self.groups.is_empty()).then(|| self.groups.clone()),
            min_frequency: self.min_frequency,
            no_debug: self.no_debug,
        }
    }

    /// How the runner should schedule branches.
    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            max_parallel: self.max_parallel,
            skip_passed: self.skip_passed,
            ..RunnerOptions::default()
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(anyhow!("'max_parallel' must be at least 1"));
        }
        if self.groups.iter().any(|group| group.trim().is_empty()) {
            return Err(anyhow!("'groups' cannot contain an empty name"));
        }
        Ok(())
    }
}

/// Finds and stacks the configuration files of one invocation.
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    user_config: Option<PathBuf>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    /// A loader reading the per-user file from the system config directory.
    pub fn new() -> Self {
        let user_config = dirs::config_dir()
            .map(|dir| dir.join(USER_CONFIG_DIR).join(PROJECT_CONFIG_FILENAME));
        Self { user_config }
    }

    /// A loader reading the per-user layer from `path` instead.
    pub fn with_user_config(path: Option<PathBuf>) -> Self {
        Self { user_config: path }
    }

    /// Resolves the final config for a run started in `cwd`.
    ///
    /// `explicit` replaces the project file and must exist. `overrides` holds the
    /// command-line flags.
    pub fn resolve(
        &self,
        cwd: &Path,
        explicit: Option<&Path>,
        overrides: ConfigLayer,
    ) -> Result<RunConfig> {
        let mut config = RunConfig::default();

        if let Some(user_path) = self.user_config.as_deref().filter(|p| p.is_file()) {
            log::debug!("Loading user config from '{}'", user_path.display());
            config.apply(load_layer(user_path)?, user_path.parent());
        }

        let project_path = match explicit {
            Some(path) if !path.is_file() => {
                return Err(anyhow!("Config file '{}' does not exist", path.display()));
            }
            Some(path) => Some(path.to_path_buf()),
            None => Some(cwd.join(PROJECT_CONFIG_FILENAME)).filter(|p| p.is_file()),
        };
        if let Some(project_path) = project_path {
            log::debug!("Loading project config from '{}'", project_path.display());
            config.apply(load_layer(&project_path)?, project_path.parent());
        }

        config.apply(overrides, Some(cwd));
        config
            .validate()
            .context("Invalid configuration after merging all layers")?;
        log::debug!("Resolved run config: {:?}", config);
        Ok(config)
    }
}

/// Reads and parses one `ramify.toml` layer.
pub fn load_layer(path: &Path) -> Result<ConfigLayer> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_defaults_when_no_files_exist() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_user_config(None);
        let config = loader
            .resolve(dir.path(), None, ConfigLayer::default())
            .unwrap();
        assert_eq!(config, RunConfig::default());
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
    }

    #[test]
    fn test_layers_stack_in_precedence_order() {
        let dir = tempdir().unwrap();
        let user = dir.path().join("user").join("ramify.toml");
        write(
            &user,
            "max_parallel = 2\nmin_frequency = \"low\"\ngroups = [\"smoke\"]\n",
        );
        write(
            &dir.path().join(PROJECT_CONFIG_FILENAME),
            "max_parallel = 8\nbuilt_in = [\"lib/common.smash\"]\n",
        );

        let loader = ConfigLoader::with_user_config(Some(user));
        let overrides = ConfigLayer {
            groups: Some(vec!["nightly".to_string()]),
            ..ConfigLayer::default()
        };
        let config = loader.resolve(dir.path(), None, overrides).unwrap();

        assert_eq!(config.max_parallel, 8);
        assert_eq!(config.min_frequency, Some(Frequency::Low));
        assert_eq!(config.groups, vec!["nightly".to_string()]);
        assert_eq!(
            config.built_in,
            vec![dir.path().join("lib").join("common.smash")]
        );
    }

    #[test]
    fn test_explicit_config_replaces_project_file() {
        let dir = tempdir().unwrap();
        write(&dir.path().join(PROJECT_CONFIG_FILENAME), "max_parallel = 8\n");
        let explicit = dir.path().join("ci").join("ci.toml");
        write(&explicit, "no_debug = true\noutput = \"out/branches.json\"\n");

        let loader = ConfigLoader::with_user_config(None);
        let config = loader
            .resolve(dir.path(), Some(&explicit), ConfigLayer::default())
            .unwrap();
        assert_eq!(config.max_parallel, DEFAULT_MAX_PARALLEL);
        assert!(config.no_debug);
        assert_eq!(
            config.output,
            Some(dir.path().join("ci").join("out").join("branches.json"))
        );
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let dir = tempdir().unwrap();
        let loader = ConfigLoader::with_user_config(None);
        let missing = dir.path().join("nope.toml");
        assert!(
            loader
                .resolve(dir.path(), Some(&missing), ConfigLayer::default())
                .is_err()
        );
    }

    #[test]
    fn test_unknown_keys_and_bad_values_are_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        write(&path, "max_paralel = 3\n");
        let err = load_layer(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("max_paralel"));

        write(&path, "min_frequency = \"sometimes\"\n");
        assert!(load_layer(&path).is_err());

        write(&path, "max_parallel = 0\n");
        let loader = ConfigLoader::with_user_config(None);
        assert!(
            loader
                .resolve(dir.path(), Some(&path), ConfigLayer::default())
                .is_err()
        );
    }

    #[test]
    fn test_conversion_to_branchify_and_runner_options() {
        let config = RunConfig {
            groups: vec!["a".to_string()],
            min_frequency: Some(Frequency::Med),
            max_parallel: 3,
            skip_passed: true,
            ..RunConfig::default()
        };
        let branchify = config.branchify_options();
        assert_eq!(branchify.groups, Some(vec!["a".to_string()]));
        assert_eq!(branchify.min_frequency, Some(Frequency::Med));
        let runner = config.runner_options();
        assert_eq!(runner.max_parallel, 3);
        assert!(runner.skip_passed);
        assert!(runner.skip_repeat);
        assert_eq!(RunConfig::default().branchify_options().groups, None);
    }
}
