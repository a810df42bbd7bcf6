//! ramify: a language for branching test trees.
//!
//! Text is parsed into a [`core::tree::Tree`], expanded into flat branches by
//! [`core::tree::Tree::generate_branches`], and run by a [`core::runner::Runner`].

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

/// Cooperative stop signal shared by the runner and every step.
pub type CancellationToken = Arc<AtomicBool>;

pub mod cli;
pub mod constants;
pub mod core;
pub mod models;
pub mod system;
