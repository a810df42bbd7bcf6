// src/cli/handlers/mod.rs

//! One module per front-end action.

pub mod commons;
pub mod list;
pub mod run;
