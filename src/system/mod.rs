//! # System Interaction Layer
//!
//! The boundary between the runner and the operating system.
//!
//! ## Modules
//!
//! - **`executor`**: The `StepExecutor` capability the runner calls for every step body,
//!   the `StepContext` handed to it, and `ShellExecutor`, which runs code blocks as
//!   command lines through `tokio::process`.

pub mod executor;
