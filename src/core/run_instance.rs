// src/core/run_instance.rs

//! One worker of the runner. A run instance owns a single branch at a time and
//! advances it step by step, keeping its own variables and a resume cursor so it can
//! be paused and picked up again.

use crate::{
    CancellationToken,
    core::{
        errors::TreeError,
        function_resolver::{self, Frame},
        line_parser,
        tree::Tree,
        vars::VarScope,
    },
    models::{BranchStep, Hook, StepError, VarValue},
    system::executor::{Persistent, StepContext, StepExecutor},
};
use log::{debug, info, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

/// State shared by the runner and every run instance.
pub(crate) struct Shared {
    pub(crate) tree: Mutex<Tree>,
    pub(crate) executor: Arc<dyn StepExecutor>,
    pub(crate) persistent: Persistent,
    pub(crate) stop_token: CancellationToken,
    pub(crate) pause_requested: AtomicBool,
    pub(crate) skip_repeat: bool,
}

impl Shared {
    pub(crate) fn is_stopped(&self) -> bool {
        self.stop_token.load(Ordering::SeqCst)
    }

    /// Hands one code body to the executor. The variables are lent to the step and
    /// taken back afterwards, with whatever changes it made.
    pub(crate) async fn execute(
        &self,
        code: &str,
        text: &str,
        filename: Option<&str>,
        line_number: usize,
        vars: &mut VarScope,
    ) -> Result<Option<String>, StepError> {
        let mut context = StepContext::new(
            text,
            filename,
            line_number,
            std::mem::take(vars),
            self.persistent.clone(),
            self.stop_token.clone(),
        );
        let result = self.executor.execute(code, &mut context).await;
        *vars = context.vars;
        result.map_err(|err| StepError::new(err.to_string(), filename, line_number))
    }

    pub(crate) async fn run_hook(&self, hook: &Hook, vars: &mut VarScope) -> Result<(), StepError> {
        debug!("Running hook '{}'", hook.text);
        self.execute(
            &hook.code_block,
            &hook.text,
            hook.filename.as_deref(),
            hook.line_number,
            vars,
        )
        .await
        .map(|_| ())
    }
}

/// How a call to [`RunInstance::run`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BranchOutcome {
    Done,
    Paused,
    Stopped,
}

#[derive(Debug)]
pub(crate) struct RunInstance {
    pub(crate) branch_idx: usize,
    vars: VarScope,
    // The step the instance is paused in front of.
    pending_step: Option<usize>,
    // A `~` step that already paused once and must not pause again.
    debug_paused_on: Option<usize>,
    pause_before_next: bool,
    started: bool,
}

impl RunInstance {
    pub(crate) fn new(branch_idx: usize) -> Self {
        Self {
            branch_idx,
            vars: VarScope::new(),
            pending_step: None,
            debug_paused_on: None,
            pause_before_next: false,
            started: false,
        }
    }

    pub(crate) fn pending_step(&self) -> Option<usize> {
        self.pending_step
    }

    /// Runs the branch until it ends, pauses, or the runner is stopped.
    pub(crate) async fn run(&mut self, shared: &Shared) -> BranchOutcome {
        if !self.started {
            self.started = true;
            debug!("Starting branch {}", self.branch_idx);
            if !self.run_before_every_branch(shared).await {
                self.finish(shared).await;
                return BranchOutcome::Done;
            }
        }

        loop {
            if shared.is_stopped() {
                return BranchOutcome::Stopped;
            }
            if shared.pause_requested.load(Ordering::SeqCst) {
                return BranchOutcome::Paused;
            }
            let Some((step_idx, step)) = self.take_next_step(shared).await else {
                self.finish(shared).await;
                return BranchOutcome::Done;
            };

            let hits_debug = step.identifiers.is_debug && self.debug_paused_on != Some(step_idx);
            if self.pause_before_next || hits_debug {
                self.pause_before_next = false;
                self.debug_paused_on = Some(step_idx);
                self.pending_step = Some(step_idx);
                shared.pause_requested.store(true, Ordering::SeqCst);
                info!("Paused before '{}' in branch {}", step.text, self.branch_idx);
                return BranchOutcome::Paused;
            }

            self.execute_step(shared, step_idx, &step).await;
        }
    }

    /// Runs exactly the pending step, then stops in front of the following one.
    /// Returns `true` when the branch is complete.
    pub(crate) async fn step_once(&mut self, shared: &Shared) -> bool {
        let Some((step_idx, step)) = self.take_next_step(shared).await else {
            self.finish(shared).await;
            return true;
        };
        self.execute_step(shared, step_idx, &step).await;
        self.look_ahead(shared).await
    }

    /// Marks the pending step as skipped without running it, then stops in front of
    /// the following one. Returns `true` when the branch is complete.
    pub(crate) async fn skip_once(&mut self, shared: &Shared) -> bool {
        let Some((step_idx, step)) = self.take_next_step(shared).await else {
            self.finish(shared).await;
            return true;
        };
        {
            let mut tree = shared.tree.lock().await;
            if let Some(target) = tree
                .branches
                .get_mut(self.branch_idx)
                .and_then(|branch| branch.steps.get_mut(step_idx))
            {
                target.is_skipped = true;
            }
        }
        info!("Skipped '{}'", step.text);
        self.look_ahead(shared).await
    }

    /// Parses `text` as a step and runs it with this instance's variables, as if it
    /// came next. The cursor does not move.
    pub(crate) async fn inject(
        &mut self,
        shared: &Shared,
        text: &str,
    ) -> Result<BranchStep, TreeError> {
        let mut step = self.injected_step(shared, text).await?;
        match self.run_step_body(shared, &step).await {
            Ok(()) => {
                step.is_passed = true;
                step.as_expected = Some(!step.identifiers.is_expected_fail);
            }
            Err(err) => {
                warn!("Injected step failed: {}", err);
                step.is_failed = true;
                step.as_expected = Some(step.identifiers.is_expected_fail);
                step.error = Some(err);
            }
        }
        Ok(step)
    }

    /// Builds the injected step at the paused position. Calls resolve against the
    /// scope of the step the instance waits in front of.
    async fn injected_step(&self, shared: &Shared, text: &str) -> Result<BranchStep, TreeError> {
        let parsed = line_parser::parse_line(text, None, 0)?;
        let ids = &parsed.step.identifiers;
        if parsed.opens_code_block || ids.is_function_declaration || parsed.step.hook.is_some() {
            return Err(TreeError::syntax(
                "Only a step can be injected, not a declaration or a code block",
                None,
                0,
            ));
        }

        let tree = shared.tree.lock().await;
        let steps = tree
            .branches
            .get(self.branch_idx)
            .map(|branch| branch.steps.as_slice())
            .unwrap_or_default();
        let cursor = self
            .pending_step
            .map_or(steps.len(), |idx| idx + 1)
            .min(steps.len());
        let lead = steps.get(..cursor).unwrap_or_default();
        let depth = lead.last().map_or(0, |step| step.branch_indents);

        let mut step = BranchStep::ad_hoc(&parsed.step, depth);
        if parsed.step.identifiers.is_function_call {
            let mut path = call_path(lead);
            // The pending step has not run, so its own declaration is out of reach.
            if let (Some(_), Some(last)) = (self.pending_step, path.last_mut()) {
                last.declaration = None;
            }
            let call_text = parsed.step.call_text();
            let declaration_id = tree.find_function_declaration_for(call_text, &path)?;
            let declaration = tree.step(declaration_id);
            step.code_block = declaration.code_block.clone();
            step.param_bindings = function_resolver::bind_params(call_text, &declaration.text);
            step.function_declaration_in_tree = Some(declaration_id);
        }
        Ok(step)
    }

    async fn take_next_step(&mut self, shared: &Shared) -> Option<(usize, BranchStep)> {
        let mut tree = shared.tree.lock().await;
        let step_idx = match self.pending_step.take() {
            Some(step_idx) => step_idx,
            None => tree.next_step(self.branch_idx, true, shared.skip_repeat)?,
        };
        let step = tree
            .branches
            .get(self.branch_idx)
            .and_then(|branch| branch.steps.get(step_idx))
            .cloned()?;
        Some((step_idx, step))
    }

    async fn look_ahead(&mut self, shared: &Shared) -> bool {
        let next = shared
            .tree
            .lock()
            .await
            .next_step(self.branch_idx, true, shared.skip_repeat);
        match next {
            Some(step_idx) => {
                self.pending_step = Some(step_idx);
                self.debug_paused_on = Some(step_idx);
                self.pause_before_next = false;
                false
            }
            None => {
                self.finish(shared).await;
                true
            }
        }
    }

    /// Runs the step between its before/after-every-step hooks and records the outcome.
    async fn execute_step(&mut self, shared: &Shared, step_idx: usize, step: &BranchStep) {
        let (before, after, has_debug) = {
            let tree = shared.tree.lock().await;
            match tree.branches.get(self.branch_idx) {
                Some(branch) => (
                    branch.before_every_step.clone(),
                    branch.after_every_step.clone(),
                    branch.has_debug_step(),
                ),
                None => return,
            }
        };

        let mut error = None;
        for hook in &before {
            if let Err(err) = shared.run_hook(hook, &mut self.vars).await {
                error = Some(err);
                break;
            }
        }
        if error.is_none() {
            error = self.run_step_body(shared, step).await.err();
        }
        for hook in &after {
            if let Err(err) = shared.run_hook(hook, &mut self.vars).await {
                error.get_or_insert(err);
            }
        }

        let is_passed = error.is_none();
        let as_expected = is_passed != step.identifiers.is_expected_fail;
        match &error {
            Some(err) => warn!("Step '{}' failed: {}", step.text, err),
            None => debug!("Step '{}' passed", step.text),
        }
        if !as_expected {
            warn!("Step '{}' did not behave as expected", step.text);
        }

        // In a debug branch a failure pauses instead of ending the branch.
        let stop_branch_now = !is_passed && !has_debug;
        shared.tree.lock().await.mark_step(
            self.branch_idx,
            Some(step_idx),
            is_passed,
            as_expected,
            error,
            stop_branch_now,
            shared.skip_repeat,
        );
        if !is_passed && has_debug {
            self.pause_before_next = true;
        }
    }

    async fn run_step_body(&mut self, shared: &Shared, step: &BranchStep) -> Result<(), StepError> {
        let fail = |message: String| {
            StepError::new(message, step.filename.as_deref(), step.line_number)
        };
        let depth = step.branch_indents;
        self.vars.enter(depth);
        if !step.param_bindings.is_empty() {
            self.vars
                .bind_params(depth, &step.param_bindings)
                .map_err(|err| fail(err.to_string()))?;
        }

        let mut value = None;
        if let Some(code) = &step.code_block {
            value = shared
                .execute(
                    code,
                    &step.text,
                    step.filename.as_deref(),
                    step.line_number,
                    &mut self.vars,
                )
                .await?;
        }

        for assignment in &step.var_assignments {
            let resolved = match &assignment.value {
                VarValue::Literal(literal) => self
                    .vars
                    .substitute(literal)
                    .map_err(|err| fail(err.to_string()))?,
                VarValue::Call(_) => value.clone().unwrap_or_default(),
            };
            if assignment.is_local {
                self.vars.set_local_at(depth, &assignment.name, resolved);
            } else {
                self.vars.set(&assignment.name, resolved, false);
            }
        }
        Ok(())
    }

    async fn run_before_every_branch(&mut self, shared: &Shared) -> bool {
        let hooks = {
            let tree = shared.tree.lock().await;
            tree.branches
                .get(self.branch_idx)
                .map(|branch| branch.before_every_branch.clone())
                .unwrap_or_default()
        };
        for (i, hook) in hooks.iter().enumerate() {
            if let Err(err) = shared.run_hook(hook, &mut self.vars).await {
                warn!("Before Every Branch hook failed: {}", err);
                let mut tree = shared.tree.lock().await;
                if let Some(branch) = tree.branches.get_mut(self.branch_idx) {
                    branch.log.push(format!("Before Every Branch hook failed: {}", err));
                    if let Some(failed) = branch.before_every_branch.get_mut(i) {
                        failed.error = Some(err);
                    }
                    branch.is_failed = true;
                    branch.is_passed = false;
                    branch.is_running = false;
                }
                return false;
            }
        }
        true
    }

    /// Runs the after-every-branch hooks. A failing hook fails the branch.
    async fn finish(&mut self, shared: &Shared) {
        self.pending_step = None;
        let hooks = {
            let tree = shared.tree.lock().await;
            tree.branches
                .get(self.branch_idx)
                .map(|branch| branch.after_every_branch.clone())
                .unwrap_or_default()
        };
        for (i, hook) in hooks.iter().enumerate() {
            if let Err(err) = shared.run_hook(hook, &mut self.vars).await {
                warn!("After Every Branch hook failed: {}", err);
                let mut tree = shared.tree.lock().await;
                if let Some(branch) = tree.branches.get_mut(self.branch_idx) {
                    branch.log.push(format!("After Every Branch hook failed: {}", err));
                    if let Some(failed) = branch.after_every_branch.get_mut(i) {
                        failed.error = Some(err);
                    }
                    if branch.is_passed {
                        branch.is_passed = false;
                        branch.is_failed = true;
                    }
                }
            }
        }

        let tree = shared.tree.lock().await;
        if let Some(branch) = tree.branches.get(self.branch_idx) {
            let outcome = if branch.is_failed {
                "failed"
            } else if branch.is_skipped {
                "skipped"
            } else {
                "passed"
            };
            info!("Branch {} {}", self.branch_idx, outcome);
        }
    }
}

/// The frames leading to the last of `steps`. A step returns to the depth of its
/// caller, so frames deeper than the current step are dropped along the way.
fn call_path(steps: &[BranchStep]) -> Vec<Frame> {
    let mut path: Vec<(usize, Frame)> = Vec::new();
    for step in steps {
        let Some(original) = step.original_step_in_tree else {
            continue;
        };
        path.retain(|(depth, _)| *depth <= step.branch_indents);
        path.push((
            step.branch_indents,
            Frame {
                step: original,
                declaration: step.function_declaration_in_tree,
            },
        ));
    }
    path.into_iter().map(|(_, frame)| frame).collect()
}
