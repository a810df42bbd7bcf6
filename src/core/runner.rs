// src/core/runner.rs

//! Runs the branches of a tree with bounded concurrency.
//!
//! The runner is a small state machine:
//! `NotStarted -> Running -> (Paused <-> Running) -> Stopped | Complete`.
//! Paused run instances are kept in `Control` together with their resume cursor, so
//! `run_one_step`, `skip_one_step` and `inject` always act on a well-defined step.

use crate::{
    CancellationToken,
    constants::DEFAULT_MAX_PARALLEL,
    core::{
        errors::RunnerError,
        run_instance::{BranchOutcome, RunInstance, Shared},
        tree::Tree,
        vars::VarScope,
    },
    models::BranchStep,
    system::executor::{Persistent, StepExecutor},
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinSet;

const NON_PARALLEL_POLL: Duration = Duration::from_millis(10);

/// Where the runner is in its lifecycle.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum RunnerState {
    /// `run` was never called.
    NotStarted,
    /// A `run` call is in progress.
    Running,
    /// At least one run instance is waiting in front of a step.
    Paused,
    /// `stop` completed. The runner cannot run again.
    Stopped,
    /// Everything ran to the end without pausing.
    Complete,
}

/// How the runner schedules branches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerOptions {
    /// Upper bound on concurrently running branches.
    pub max_parallel: usize,
    /// After a failure or a -T/-M stop, skip waiting branches with the same steps.
    pub skip_repeat: bool,
    /// Leave branches that passed in the previous run alone.
    pub skip_passed: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_parallel: DEFAULT_MAX_PARALLEL,
            skip_repeat: true,
            skip_passed: false,
        }
    }
}

/// A serializable view of the runner. The persistent context is never included.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSnapshot {
    /// Current lifecycle state.
    pub state: RunnerState,
    /// The run finished without pausing or being stopped.
    pub is_complete: bool,
    /// A pause happened at some point during the run.
    pub has_paused: bool,
    /// Upper bound on concurrently running branches.
    pub max_parallel: usize,
    /// For each paused instance, its branch and the step it waits in front of.
    pub paused_at: Vec<(usize, Option<usize>)>,
    /// Same as `Tree::elapsed`.
    pub elapsed: i64,
}

struct Control {
    state: RunnerState,
    ran_before_everything: bool,
    ran_after_everything: bool,
    has_paused: bool,
    run_started: Option<Instant>,
    stopped_at: Option<Instant>,
    paused_instances: Vec<RunInstance>,
    max_parallel: usize,
}

impl Control {
    fn new(max_parallel: usize) -> Self {
        Self {
            state: RunnerState::NotStarted,
            ran_before_everything: false,
            ran_after_everything: false,
            has_paused: false,
            run_started: None,
            stopped_at: None,
            paused_instances: Vec::new(),
            max_parallel: max_parallel.max(1),
        }
    }
}

/// Runs a tree's branches through a [`StepExecutor`].
///
/// Every operation takes `&self`, so a runner can be shared with the task that
/// handles interrupts.
pub struct Runner {
    shared: Arc<Shared>,
    options: RunnerOptions,
    // Serializes run/stop/step calls.
    run_lock: Mutex<()>,
    control: Mutex<Control>,
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The locks may be held by a running step; report what can be read now.
        f.debug_struct("Runner")
            .field("options", &self.options)
            .field(
                "state",
                &self.control.try_lock().ok().map(|control| control.state),
            )
            .field("stopped", &self.shared.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Wraps a tree whose branches were already generated.
    pub fn new(tree: Tree, executor: Arc<dyn StepExecutor>, options: RunnerOptions) -> Self {
        let shared = Shared {
            tree: Mutex::new(tree),
            executor,
            persistent: Arc::new(Mutex::new(HashMap::new())),
            stop_token: Arc::new(AtomicBool::new(false)),
            pause_requested: AtomicBool::new(false),
            skip_repeat: options.skip_repeat,
        };
        Self {
            shared: Arc::new(shared),
            control: Mutex::new(Control::new(options.max_parallel)),
            run_lock: Mutex::new(()),
            options,
        }
    }

    /// The context shared with every step body.
    pub fn persistent(&self) -> Persistent {
        self.shared.persistent.clone()
    }

    /// The token `stop` sets. A step body can set it through its context.
    pub fn stop_token(&self) -> CancellationToken {
        self.shared.stop_token.clone()
    }

    /// Locks the tree for reading results or counts.
    pub async fn tree(&self) -> MutexGuard<'_, Tree> {
        self.shared.tree.lock().await
    }

    /// Where the runner is in its lifecycle.
    pub async fn state(&self) -> RunnerState {
        self.control.lock().await.state
    }

    /// Prepares the bookkeeping for a run. A first run starts every branch from a
    /// clean outcome.
    pub async fn init(&self, is_first_run: bool) {
        let _guard = self.run_lock.lock().await;
        if is_first_run {
            *self.control.lock().await = Control::new(self.options.max_parallel);
            self.shared.stop_token.store(false, Ordering::SeqCst);
            self.shared.pause_requested.store(false, Ordering::SeqCst);
        }
        let mut tree = self.shared.tree.lock().await;
        if is_first_run {
            for branch in &mut tree.branches {
                branch.reset();
            }
            tree.elapsed = 0;
        }
        if !self.options.skip_passed {
            for branch in &mut tree.branches {
                branch.passed_last_time = false;
            }
        }
        debug!(
            "Runner initialized with {} runnable branches",
            tree.get_branch_count(true, false)
        );
    }

    /// Runs (or resumes) everything. Returns `true` when the run finished without
    /// pausing and without being stopped.
    pub async fn run(&self) -> Result<bool, RunnerError> {
        let _guard = self.run_lock.lock().await;
        let first_phase = {
            let mut control = self.control.lock().await;
            if control.state == RunnerState::Stopped {
                return Err(RunnerError::State("Cannot run a stopped runner".to_string()));
            }
            control.state = RunnerState::Running;
            control.run_started.get_or_insert_with(Instant::now);
            !std::mem::replace(&mut control.ran_before_everything, true)
        };

        if first_phase && !self.run_before_everything().await {
            self.run_after_everything().await;
            return Ok(self.conclude().await);
        }
        if self.shared.is_stopped() {
            self.run_after_everything().await;
            return Ok(self.conclude().await);
        }

        if self.run_branches().await {
            let mut control = self.control.lock().await;
            control.state = RunnerState::Paused;
            control.has_paused = true;
            self.shared.tree.lock().await.elapsed = -1;
            info!("Run paused");
            return Ok(false);
        }

        self.run_after_everything().await;
        Ok(self.conclude().await)
    }

    /// Runs the step the paused instance waits in front of, then pauses again.
    /// Returns `true` when that completed the branch.
    pub async fn run_one_step(&self) -> Result<bool, RunnerError> {
        let _guard = self.run_lock.lock().await;
        let mut instance = self.take_paused("Must be paused to run a step").await?;
        let complete = instance.step_once(&self.shared).await;
        self.after_single_step(instance, complete).await;
        Ok(complete)
    }

    /// Skips the step the paused instance waits in front of, then pauses again.
    /// Returns `true` when that completed the branch.
    pub async fn skip_one_step(&self) -> Result<bool, RunnerError> {
        let _guard = self.run_lock.lock().await;
        let mut instance = self.take_paused("Must be paused to skip a step").await?;
        let complete = instance.skip_once(&self.shared).await;
        self.after_single_step(instance, complete).await;
        Ok(complete)
    }

    /// Parses `text` as a step and runs it in the paused instance's context, as if it
    /// were the next step. The paused position does not move.
    pub async fn inject(&self, text: &str) -> Result<BranchStep, RunnerError> {
        let _guard = self.run_lock.lock().await;
        let mut instance = self.take_paused("Must be paused to inject a step").await?;
        let step = instance.inject(&self.shared, text).await;
        self.control.lock().await.paused_instances.insert(0, instance);
        Ok(step?)
    }

    /// Stops the run at the next step boundary, then runs the after-everything hooks.
    pub async fn stop(&self) {
        self.shared.stop_token.store(true, Ordering::SeqCst);
        self.control.lock().await.stopped_at = Some(Instant::now());
        info!("Stopping the runner");

        let _guard = self.run_lock.lock().await;
        self.run_after_everything().await;
        {
            let mut tree = self.shared.tree.lock().await;
            for branch in &mut tree.branches {
                if !branch.is_completed() {
                    branch.is_running = false;
                }
            }
        }
        self.conclude().await;
        let mut control = self.control.lock().await;
        control.paused_instances.clear();
        control.state = RunnerState::Stopped;
    }

    /// A snapshot of the runner without the persistent context.
    pub async fn serialize(&self) -> RunnerSnapshot {
        let control = self.control.lock().await;
        let elapsed = self.shared.tree.lock().await.elapsed;
        RunnerSnapshot {
            state: control.state,
            is_complete: control.state == RunnerState::Complete,
            has_paused: control.has_paused,
            max_parallel: control.max_parallel,
            paused_at: control
                .paused_instances
                .iter()
                .map(|instance| (instance.branch_idx, instance.pending_step()))
                .collect(),
            elapsed,
        }
    }

    async fn take_paused(&self, message: &str) -> Result<RunInstance, RunnerError> {
        let mut control = self.control.lock().await;
        if control.state != RunnerState::Paused || control.paused_instances.is_empty() {
            return Err(RunnerError::State(message.to_string()));
        }
        Ok(control.paused_instances.remove(0))
    }

    /// Puts a stepped instance back. When its branch is done and no other instance is
    /// paused, either finishes the whole run or hands the remaining branches back to
    /// `run`.
    async fn after_single_step(&self, instance: RunInstance, branch_complete: bool) {
        {
            let mut control = self.control.lock().await;
            if !branch_complete {
                control.paused_instances.insert(0, instance);
                return;
            }
            if !control.paused_instances.is_empty() {
                return;
            }
            if self.shared.tree.lock().await.next_branch().is_some() {
                info!("Branch done, the remaining branches wait for run");
                control.state = RunnerState::Running;
                return;
            }
        }
        self.run_after_everything().await;
        self.conclude().await;
    }

    /// Spawns the run instances and waits for all of them.
    /// Returns `true` if any of them paused.
    async fn run_branches(&self) -> bool {
        let (resumed, max_parallel) = {
            let mut control = self.control.lock().await;
            (
                std::mem::take(&mut control.paused_instances),
                control.max_parallel,
            )
        };
        self.shared.pause_requested.store(false, Ordering::SeqCst);

        let mut set = JoinSet::new();
        let spawn_count = max_parallel.max(resumed.len());
        let mut resumed = resumed.into_iter();
        for _ in 0..spawn_count {
            set.spawn(instance_loop(self.shared.clone(), resumed.next()));
        }
        debug!("Spawned {} run instances", spawn_count);

        let mut paused = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(Some(instance)) => paused.push(instance),
                Ok(None) => {}
                Err(e) => error!("A run instance ended abnormally: {}", e),
            }
        }

        let any_paused = !paused.is_empty();
        if any_paused && self.shared.is_stopped() {
            return false;
        }
        self.control.lock().await.paused_instances = paused;
        any_paused
    }

    /// Runs the before-everything hooks in order. Stops at the first failure or stop.
    async fn run_before_everything(&self) -> bool {
        let hooks = self.shared.tree.lock().await.before_everything.clone();
        let mut vars = VarScope::new();
        for (i, hook) in hooks.iter().enumerate() {
            if self.shared.is_stopped() {
                return false;
            }
            if let Err(err) = self.shared.run_hook(hook, &mut vars).await {
                error!("Before Everything hook failed: {}", err);
                if let Some(failed) = self.shared.tree.lock().await.before_everything.get_mut(i) {
                    failed.error = Some(err);
                }
                return false;
            }
        }
        !self.shared.is_stopped()
    }

    /// Runs every after-everything hook once, whatever happens to the others.
    async fn run_after_everything(&self) {
        {
            let mut control = self.control.lock().await;
            if std::mem::replace(&mut control.ran_after_everything, true) {
                return;
            }
        }
        let hooks = self.shared.tree.lock().await.after_everything.clone();
        let mut vars = VarScope::new();
        for (i, hook) in hooks.iter().enumerate() {
            if let Err(err) = self.shared.run_hook(hook, &mut vars).await {
                warn!("After Everything hook failed: {}", err);
                if let Some(failed) = self.shared.tree.lock().await.after_everything.get_mut(i) {
                    failed.error = Some(err);
                }
            }
        }
    }

    /// Records the elapsed time and the final state. Returns `true` for a complete run.
    async fn conclude(&self) -> bool {
        let stopped = self.shared.is_stopped();
        let mut control = self.control.lock().await;
        let end = match (stopped, control.stopped_at) {
            (true, Some(at)) => at,
            _ => Instant::now(),
        };
        let elapsed = match control.run_started {
            Some(start) if !control.has_paused => {
                i64::try_from(end.saturating_duration_since(start).as_millis()).unwrap_or(i64::MAX)
            }
            Some(_) => -1,
            None => 0,
        };
        self.shared.tree.lock().await.elapsed = elapsed;
        control.state = if stopped {
            RunnerState::Stopped
        } else {
            RunnerState::Complete
        };
        info!("Run {} after {} ms", if stopped { "stopped" } else { "complete" }, elapsed);
        !stopped
    }
}

/// One worker: finishes a resumed instance if given one, then keeps claiming branches
/// until none are left. Returns the instance if it paused.
async fn instance_loop(shared: Arc<Shared>, resumed: Option<RunInstance>) -> Option<RunInstance> {
    let mut next = resumed;
    loop {
        let mut instance = match next.take() {
            Some(instance) => instance,
            None => {
                if shared.is_stopped() || shared.pause_requested.load(Ordering::SeqCst) {
                    return None;
                }
                let (claimed, blocked) = {
                    let mut tree = shared.tree.lock().await;
                    let claimed = tree.claim_next_branch();
                    (claimed, claimed.is_none() && has_waiting_branch(&tree))
                };
                match claimed {
                    Some(branch_idx) => RunInstance::new(branch_idx),
                    // Only non-parallel branches are left and their id is busy.
                    None if blocked => {
                        tokio::time::sleep(NON_PARALLEL_POLL).await;
                        continue;
                    }
                    None => return None,
                }
            }
        };
        match instance.run(&shared).await {
            BranchOutcome::Done => continue,
            BranchOutcome::Paused => return Some(instance),
            BranchOutcome::Stopped => return None,
        }
    }
}

fn has_waiting_branch(tree: &Tree) -> bool {
    tree.branches
        .iter()
        .any(|branch| !branch.is_running && !branch.is_completed() && !branch.passed_last_time)
}
