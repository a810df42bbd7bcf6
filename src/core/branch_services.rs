// src/core/branch_services.rs

//! Runtime bookkeeping over the generated branches: serialization, merging with a
//! previous run, counting, scheduling and outcome marking.

use crate::{
    core::tree::Tree,
    models::{Branch, SerializedBranches, StepError},
};
use log::{debug, info};
use std::collections::HashSet;

impl Tree {
    /// The branch set, its tree-wide hooks and the elapsed time as JSON.
    pub fn serialize_branches(&self) -> Result<String, serde_json::Error> {
        let snapshot = SerializedBranches {
            branches: self.branches.clone(),
            before_everything: self.before_everything.clone(),
            after_everything: self.after_everything.clone(),
            elapsed: self.elapsed,
        };
        serde_json::to_string_pretty(&snapshot)
    }

    /// Parses JSON produced by [`Tree::serialize_branches`].
    pub fn deserialize_branches(json: &str) -> Result<SerializedBranches, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Marks every current branch whose step texts match a branch that passed in the
    /// previous run. Returns how many were marked.
    pub fn merge_branches_from_prev_run(&mut self, prev_json: &str) -> Result<usize, serde_json::Error> {
        let prev = Self::deserialize_branches(prev_json)?;
        let passed: HashSet<Vec<&str>> = prev
            .branches
            .iter()
            .filter(|branch| branch.is_passed)
            .map(Branch::step_texts)
            .collect();

        let mut marked = 0;
        for branch in &mut self.branches {
            let passed_last_time = passed.contains(&branch.step_texts());
            branch.passed_last_time = passed_last_time;
            if passed_last_time {
                marked += 1;
            }
        }
        info!(
            "Merged previous run: {} of {} branches passed last time",
            marked,
            self.branches.len()
        );
        Ok(marked)
    }

    /// Counts branches. `runnable_only` drops branches that passed last time,
    /// `complete_only` keeps only finished ones.
    pub fn get_branch_count(&self, runnable_only: bool, complete_only: bool) -> usize {
        self.counted_branches(runnable_only, complete_only).count()
    }

    /// Counts steps across branches, with the same filters as
    /// [`Tree::get_branch_count`] applied per step. `unexpected_only` keeps steps whose
    /// outcome contradicted their expectation.
    pub fn get_step_count(
        &self,
        runnable_only: bool,
        complete_only: bool,
        unexpected_only: bool,
    ) -> usize {
        self.counted_branches(runnable_only, false)
            .flat_map(|branch| &branch.steps)
            .filter(|step| !complete_only || step.is_completed())
            .filter(|step| !unexpected_only || step.as_expected == Some(false))
            .count()
    }

    fn counted_branches(
        &self,
        runnable_only: bool,
        complete_only: bool,
    ) -> impl Iterator<Item = &Branch> {
        self.branches
            .iter()
            .filter(move |branch| !runnable_only || !branch.passed_last_time)
            .filter(move |branch| !complete_only || branch.is_completed())
    }

    /// The first branch that can start now: not running, not finished, not already
    /// passed last time, and not sharing a non-parallel id with a running branch.
    pub fn next_branch(&self) -> Option<usize> {
        let busy: HashSet<&str> = self
            .branches
            .iter()
            .filter(|branch| branch.is_running && !branch.is_completed())
            .filter_map(|branch| branch.non_parallel_id.as_deref())
            .collect();

        self.branches.iter().position(|branch| {
            !branch.is_running
                && !branch.is_completed()
                && !branch.passed_last_time
                && branch
                    .non_parallel_id
                    .as_deref()
                    .is_none_or(|id| !busy.contains(id))
        })
    }

    /// Like [`Tree::next_branch`], and marks the branch as running.
    pub fn claim_next_branch(&mut self) -> Option<usize> {
        let idx = self.next_branch()?;
        if let Some(branch) = self.branches.get_mut(idx) {
            branch.is_running = true;
        }
        Some(idx)
    }

    /// Indexes of `candidates` whose first `common_count` steps come from the same
    /// tree steps as those of `branch_idx`.
    pub fn find_similar_branches(
        &self,
        branch_idx: usize,
        common_count: usize,
        candidates: &[usize],
    ) -> Vec<usize> {
        let Some(branch) = self.branches.get(branch_idx) else {
            return Vec::new();
        };
        let Some(prefix) = branch.steps.get(..common_count) else {
            return Vec::new();
        };

        candidates
            .iter()
            .copied()
            .filter(|&idx| idx != branch_idx)
            .filter(|&idx| {
                self.branches
                    .get(idx)
                    .and_then(|other| other.steps.get(..common_count))
                    .is_some_and(|other_prefix| {
                        prefix.iter().zip(other_prefix).all(|(a, b)| {
                            a.original_step_in_tree.is_some()
                                && a.original_step_in_tree == b.original_step_in_tree
                        })
                    })
            })
            .collect()
    }

    /// Records the outcome of a step. `step_idx` of `None` only finalizes the branch.
    ///
    /// The branch is finalized when this was its last step or `stop_branch_now` is set.
    /// A failed branch with `skip_repeat` skips every waiting branch that shares its
    /// steps up to the failure.
    #[allow(clippy::too_many_arguments)]
    pub fn mark_step(
        &mut self,
        branch_idx: usize,
        step_idx: Option<usize>,
        is_passed: bool,
        as_expected: bool,
        error: Option<StepError>,
        stop_branch_now: bool,
        skip_repeat: bool,
    ) {
        let Some(branch) = self.branches.get_mut(branch_idx) else {
            return;
        };
        let step_count = branch.steps.len();
        if let Some(step) = step_idx.and_then(|idx| branch.steps.get_mut(idx)) {
            step.is_passed = is_passed;
            step.is_failed = !is_passed;
            step.as_expected = Some(as_expected);
            step.error = error;
        }

        let is_last = step_idx.is_some_and(|idx| idx + 1 >= step_count);
        if !(is_last || stop_branch_now || step_idx.is_none()) {
            return;
        }

        let failed_at = Self::finish_branch(branch);
        if let (Some(failed_at), true) = (failed_at, skip_repeat) {
            self.skip_repeat_branches(
                branch_idx,
                failed_at + 1,
                "Skipped because it's identical to a branch that already failed, up to and including this step",
            );
        }
    }

    /// The index of the step to run next in `branch_idx`, or `None` when there is none.
    ///
    /// With `advance`, the running marker moves onto the returned step, and a branch
    /// with no steps left is finalized. A to-do (`-T`) or manual (`-M`) step ends the
    /// branch as passed instead of being returned.
    pub fn next_step(&mut self, branch_idx: usize, advance: bool, skip_repeat: bool) -> Option<usize> {
        let branch = self.branches.get_mut(branch_idx)?;
        if branch.is_completed() {
            return None;
        }

        let next = branch
            .steps
            .iter()
            .position(|step| step.is_running)
            .map_or(0, |running| running + 1);

        let Some(step) = branch.steps.get(next) else {
            if advance {
                Self::finish_branch(branch);
            }
            return None;
        };

        if step.identifiers.is_to_do || step.identifiers.is_manual {
            debug!("Branch {} stops at the -T/-M step '{}'", branch_idx, step.text);
            Self::finish_branch(branch);
            if !branch.is_failed {
                branch.is_passed = true;
            }
            if skip_repeat {
                self.skip_repeat_branches(
                    branch_idx,
                    next + 1,
                    "Skipped because it's identical to a branch that already ran, up to the -T/-M step",
                );
            }
            return None;
        }

        if advance {
            for step in &mut branch.steps {
                step.is_running = false;
            }
            if let Some(step) = branch.steps.get_mut(next) {
                step.is_running = true;
            }
            branch.is_running = true;
        }
        Some(next)
    }

    /// Sets the branch's final outcome and clears its running markers.
    /// Returns the index of the first failed step, if any.
    fn finish_branch(branch: &mut Branch) -> Option<usize> {
        let failed_at = branch.steps.iter().position(|step| step.is_failed);
        branch.is_failed = failed_at.is_some();
        branch.is_passed = failed_at.is_none();
        branch.is_running = false;
        for step in &mut branch.steps {
            step.is_running = false;
        }
        failed_at
    }

    fn skip_repeat_branches(&mut self, branch_idx: usize, common_count: usize, reason: &str) {
        let waiting: Vec<usize> = self
            .branches
            .iter()
            .enumerate()
            .filter(|(_, branch)| !branch.is_running && !branch.is_completed())
            .map(|(idx, _)| idx)
            .collect();
        let similar = self.find_similar_branches(branch_idx, common_count, &waiting);
        let last_text = self
            .branches
            .get(branch_idx)
            .and_then(|branch| branch.steps.get(common_count.saturating_sub(1)))
            .map(|step| step.text.clone())
            .unwrap_or_default();

        for idx in similar {
            if let Some(other) = self.branches.get_mut(idx) {
                other.is_skipped = true;
                other.log.push(format!("{}: '{}'", reason, last_text));
                debug!("Skipping branch {}: {}", idx, reason);
            }
        }
    }
}
