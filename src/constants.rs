// src/constants.rs

//! Fixed names and defaults of the language and the runner.

/// Number of spaces making up one level of indentation.
pub const SPACES_PER_INDENT: usize = 4;

/// Reserved hook names, in their canonical spelling.
pub const HOOK_BEFORE_EVERY_BRANCH: &str = "Before Every Branch";
/// Runs after the last step of every branch below it.
pub const HOOK_AFTER_EVERY_BRANCH: &str = "After Every Branch";
/// Runs before every step of every branch below it.
pub const HOOK_BEFORE_EVERY_STEP: &str = "Before Every Step";
/// Runs after every step of every branch below it.
pub const HOOK_AFTER_EVERY_STEP: &str = "After Every Step";
/// Runs once before any branch starts. Indent 0 only.
pub const HOOK_BEFORE_EVERYTHING: &str = "Before Everything";
/// Runs once after all branches end. Indent 0 only.
pub const HOOK_AFTER_EVERYTHING: &str = "After Everything";

/// Special variable that tags a branch with a frequency.
pub const FREQUENCY_VAR: &str = "frequency";

/// Special variable that tags a branch with a group.
pub const GROUP_VAR: &str = "group";

/// Limit on nested function calls while expanding branches.
pub const MAX_CALL_DEPTH: usize = 256;

/// Concurrent branches when nothing else is configured.
pub const DEFAULT_MAX_PARALLEL: usize = 5;

/// The name of the project configuration file.
pub const PROJECT_CONFIG_FILENAME: &str = "ramify.toml";

/// The name of the per-user configuration directory (inside the system config dir).
pub const USER_CONFIG_DIR: &str = "ramify";

/// Prefix of the environment variables a shell step sees for each variable.
pub const ENV_VAR_PREFIX: &str = "RAMIFY_";
