// src/core/mod.rs

//! The language and its runtime: parsing a tree, expanding it into branches, and
//! running them.

pub mod branch_services;
pub mod branchifier;
pub mod commons;
pub mod config_loader;
pub mod element_finder;
pub mod errors;
pub mod function_resolver;
pub mod line_parser;
pub(crate) mod run_instance;
pub mod runner;
pub mod tree;
pub mod vars;
