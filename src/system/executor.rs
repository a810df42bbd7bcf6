// src/system/executor.rs

//! Running step bodies.

use crate::{
    CancellationToken,
    constants::ENV_VAR_PREFIX,
    core::vars::{VarError, VarScope},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Mutex;

/// Why a step body failed. Recorded on the step, never returned from the runner.
#[derive(Error, Debug)]
pub enum ExecutionError {
    /// A line of the body has unbalanced quotes.
    #[error("Command could not be parsed: {0}")]
    CommandParse(String),
    /// The process could not be started.
    #[error("Command '{0}' could not be executed: {1}")]
    CommandFailed(String, std::io::Error),
    /// The process exited with a failure status.
    #[error("Command '{0}' exited with a non-zero error code.")]
    NonZeroExitStatus(String),
    /// Stdout was captured but is not text.
    #[error("Command '{command}' produced output that was not valid UTF-8")]
    InvalidUtf8Output {
        /// The command line that ran.
        command: String,
        /// The decoding failure.
        #[source]
        source: std::string::FromUtf8Error,
    },
    /// The body referenced a variable that is not set.
    #[error(transparent)]
    Variable(#[from] VarError),
    /// Any other failure reported by an executor.
    #[error("{0}")]
    Failed(String),
}

/// Cross-step state shared by every run instance. Survives pauses and is never serialized.
pub type Persistent = Arc<Mutex<HashMap<String, String>>>;

/// Everything a step body can see and change while it runs.
#[derive(Debug)]
pub struct StepContext {
    /// Text of the step being executed.
    pub step_text: String,
    /// Where the step was declared.
    pub filename: Option<String>,
    /// Line of the step.
    pub line_number: usize,
    /// The run instance's variables. Changes are kept after the step.
    pub vars: VarScope,
    /// State shared across run instances.
    pub persistent: Persistent,
    stop_token: CancellationToken,
}

impl StepContext {
    /// Builds the context for one step. The runner lends `vars` and takes them back.
    pub fn new(
        step_text: &str,
        filename: Option<&str>,
        line_number: usize,
        vars: VarScope,
        persistent: Persistent,
        stop_token: CancellationToken,
    ) -> Self {
        Self {
            step_text: step_text.to_string(),
            filename: filename.map(str::to_string),
            line_number,
            vars,
            persistent,
            stop_token,
        }
    }

    /// Asks the runner to stop. Takes effect at the next step boundary.
    pub fn stop(&self) {
        self.stop_token.store(true, Ordering::SeqCst);
    }

    /// Whether a stop was requested, by this step or any other.
    pub fn is_stopped(&self) -> bool {
        self.stop_token.load(Ordering::SeqCst)
    }
}

/// Runs the body of a step. Implementations may suspend and may fail; a failure
/// fails the step, never the runner.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Executes `code` and returns the step's value, if it produced one.
    async fn execute(
        &self,
        code: &str,
        context: &mut StepContext,
    ) -> Result<Option<String>, ExecutionError>;
}

/// Runs code blocks as shell command lines, one command per line.
///
/// Known `{var}`/`{{var}}` references are substituted first, and every visible
/// variable is also exported as `RAMIFY_<NAME>`. The trimmed standard output of the
/// last command is the step's value.
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    cwd: PathBuf,
}

impl ShellExecutor {
    /// Commands run in `cwd`.
    pub fn new(cwd: PathBuf) -> Self {
        Self { cwd }
    }

    fn env_vars(vars: &VarScope) -> HashMap<String, String> {
        vars.visible()
            .into_iter()
            .map(|(name, value)| {
                let key: String = name
                    .chars()
                    .map(|c| {
                        if c.is_ascii_alphanumeric() {
                            c.to_ascii_uppercase()
                        } else {
                            '_'
                        }
                    })
                    .collect();
                (format!("{}{}", ENV_VAR_PREFIX, key), value)
            })
            .collect()
    }

    async fn run_line(
        &self,
        command_line: &str,
        env_vars: &HashMap<String, String>,
    ) -> Result<String, ExecutionError> {
        let parts = shlex::split(command_line)
            .ok_or_else(|| ExecutionError::CommandParse(command_line.to_string()))?;
        let Some((program, args)) = parts.split_first() else {
            return Ok(String::new());
        };
        let clean_cwd = dunce::simplified(&self.cwd);

        let output = match Command::new(program)
            .args(args)
            .current_dir(clean_cwd)
            .envs(env_vars)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .await
        {
            Ok(output) => output,
            // Built-ins like `echo` are not programs on Windows.
            Err(e) if e.kind() == ErrorKind::NotFound && cfg!(target_os = "windows") => {
                log::debug!("Command '{}' not found. Retrying with cmd /C.", program);
                Command::new("cmd")
                    .arg("/C")
                    .arg(command_line)
                    .current_dir(clean_cwd)
                    .envs(env_vars)
                    .stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::inherit())
                    .output()
                    .await
                    .map_err(|e| ExecutionError::CommandFailed(command_line.to_string(), e))?
            }
            Err(e) => return Err(ExecutionError::CommandFailed(command_line.to_string(), e)),
        };

        if !output.status.success() {
            return Err(ExecutionError::NonZeroExitStatus(command_line.to_string()));
        }
        String::from_utf8(output.stdout).map_err(|e| ExecutionError::InvalidUtf8Output {
            command: command_line.to_string(),
            source: e,
        })
    }
}

#[async_trait]
impl StepExecutor for ShellExecutor {
    async fn execute(
        &self,
        code: &str,
        context: &mut StepContext,
    ) -> Result<Option<String>, ExecutionError> {
        let code = context.vars.substitute_known(code);
        let env_vars = Self::env_vars(&context.vars);

        let mut last = None;
        for line in code.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            log::debug!("[{}] $ {}", context.step_text, line);
            let stdout = self.run_line(line, &env_vars).await?;
            last = Some(stdout.trim().to_string());
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    fn context(vars: VarScope) -> StepContext {
        StepContext::new(
            "Test step",
            Some("exec.smash"),
            1,
            vars,
            Arc::new(Mutex::new(HashMap::new())),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_env_vars_are_prefixed_and_uppercased() {
        let mut vars = VarScope::new();
        vars.set("user name", "bob".to_string(), false);
        let env = ShellExecutor::env_vars(&vars);
        assert_eq!(env.get("RAMIFY_USER_NAME").map(String::as_str), Some("bob"));
    }

    #[test]
    fn test_stop_sets_the_token() {
        let ctx = context(VarScope::new());
        assert!(!ctx.is_stopped());
        ctx.stop();
        assert!(ctx.is_stopped());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_returns_last_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path().to_path_buf());
        let mut vars = VarScope::new();
        vars.set("greeting", "hello".to_string(), false);
        let mut ctx = context(vars);
        let value = executor
            .execute("# comment\necho first\necho {greeting}", &mut ctx)
            .await
            .unwrap();
        assert_eq!(value.as_deref(), Some("hello"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_executor_fails_on_non_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let executor = ShellExecutor::new(dir.path().to_path_buf());
        let mut ctx = context(VarScope::new());
        let err = executor.execute("false", &mut ctx).await.unwrap_err();
        assert!(matches!(err, ExecutionError::NonZeroExitStatus(_)));
    }

    #[tokio::test]
    async fn test_empty_body_has_no_value() {
        let executor = ShellExecutor::new(std::env::temp_dir());
        let mut ctx = context(VarScope::new());
        assert_eq!(executor.execute("\n  \n", &mut ctx).await.unwrap(), None);
    }
}
