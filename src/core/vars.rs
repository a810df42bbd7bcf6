// src/core/vars.rs

//! Variables seen by a running branch: `{global}` values plus one frame of
//! `{{local}}` values per function-call depth.

use crate::{
    core::commons,
    models::ParamBinding,
};
use lazy_static::lazy_static;
use regex::{Captures, Regex};
use std::collections::HashMap;
use thiserror::Error;

lazy_static! {
    static ref VAR_RE: Regex =
        Regex::new(r"\{\{([^{}]+)\}\}|\{([^{}]+)\}").expect("variable regex is valid");
}

/// A step referenced a variable that was never set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VarError {
    /// `{name}`
    #[error("The variable {{{0}}} is never set, but is needed for this step")]
    UnknownGlobal(String),
    /// `{{name}}`
    #[error("The variable {{{{{0}}}}} is never set, but is needed for this step")]
    UnknownLocal(String),
}

/// The variables of one run instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarScope {
    globals: HashMap<String, String>,
    frames: Vec<HashMap<String, String>>,
}

impl VarScope {
    /// An empty scope.
    pub fn new() -> Self {
        Self::default()
    }

    /// Called before a step at `depth` runs. Frames of deeper calls that already
    /// returned are dropped.
    pub fn enter(&mut self, depth: usize) {
        self.frames.truncate(depth + 1);
        while self.frames.len() < depth + 1 {
            self.frames.push(HashMap::new());
        }
    }

    /// Evaluates the call inputs in the caller's scope and opens a fresh frame at
    /// `depth + 1` holding them.
    pub fn bind_params(&mut self, depth: usize, bindings: &[ParamBinding]) -> Result<(), VarError> {
        let mut frame = HashMap::new();
        for binding in bindings {
            frame.insert(binding.name.clone(), self.resolve_input(&binding.input)?);
        }
        self.enter(depth);
        self.frames.push(frame);
        Ok(())
    }

    /// Sets a global, or a local in the innermost frame.
    pub fn set(&mut self, name: &str, value: String, is_local: bool) {
        let name = name.trim().to_string();
        if is_local {
            if self.frames.is_empty() {
                self.frames.push(HashMap::new());
            }
            if let Some(frame) = self.frames.last_mut() {
                frame.insert(name, value);
            }
        } else {
            self.globals.insert(name, value);
        }
    }

    /// Sets a local in the frame at `depth`, creating frames as needed.
    pub fn set_local_at(&mut self, depth: usize, name: &str, value: String) {
        while self.frames.len() < depth + 1 {
            self.frames.push(HashMap::new());
        }
        if let Some(frame) = self.frames.get_mut(depth) {
            frame.insert(name.trim().to_string(), value);
        }
    }

    /// Reads a global, or the nearest local of that name.
    pub fn get(&self, name: &str, is_local: bool) -> Option<&str> {
        let name = name.trim();
        if is_local {
            self.frames
                .iter()
                .rev()
                .find_map(|frame| frame.get(name))
                .map(String::as_str)
        } else {
            self.globals.get(name).map(String::as_str)
        }
    }

    fn lookup(&self, name: &str, is_local: bool) -> Result<&str, VarError> {
        self.get(name, is_local).ok_or_else(|| {
            let name = name.trim().to_string();
            if is_local {
                VarError::UnknownLocal(name)
            } else {
                VarError::UnknownGlobal(name)
            }
        })
    }

    /// Replaces every `{var}` and `{{var}}` in `text`. Unknown variables are an error.
    pub fn substitute(&self, text: &str) -> Result<String, VarError> {
        let mut failure = None;
        let replaced = VAR_RE.replace_all(text, |caps: &Captures<'_>| {
            let (name, is_local) = Self::capture_name(caps);
            match self.lookup(name, is_local) {
                Ok(value) => value.to_string(),
                Err(err) => {
                    failure.get_or_insert(err);
                    String::new()
                }
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(replaced.into_owned()),
        }
    }

    /// Like [`VarScope::substitute`], but unknown references are left untouched.
    /// Used for code bodies, where braces are often part of the code itself.
    pub fn substitute_known(&self, text: &str) -> String {
        VAR_RE
            .replace_all(text, |caps: &Captures<'_>| {
                let (name, is_local) = Self::capture_name(caps);
                match self.get(name, is_local) {
                    Some(value) => value.to_string(),
                    None => caps.get(0).map_or("", |m| m.as_str()).to_string(),
                }
            })
            .into_owned()
    }

    /// The value of one call input: a quoted string (itself substituted), a variable,
    /// or an element finder passed through as written.
    pub fn resolve_input(&self, token: &str) -> Result<String, VarError> {
        if let Some(literal) = commons::unquote(token) {
            return self.substitute(&literal);
        }
        if let Some(caps) = VAR_RE.captures(token) {
            if caps.get(0).is_some_and(|m| m.as_str() == token) {
                let (name, is_local) = Self::capture_name(&caps);
                return self.lookup(name, is_local).map(str::to_string);
            }
        }
        Ok(token.to_string())
    }

    /// Every visible variable, locals shadowing globals of the same name.
    pub fn visible(&self) -> Vec<(String, String)> {
        let mut merged: HashMap<&str, &str> = self
            .globals
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        for frame in &self.frames {
            merged.extend(frame.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        let mut pairs: Vec<(String, String)> = merged
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.sort();
        pairs
    }

    fn capture_name<'t>(caps: &Captures<'t>) -> (&'t str, bool) {
        match (caps.get(1), caps.get(2)) {
            (Some(local), _) => (local.as_str(), true),
            (None, Some(global)) => (global.as_str(), false),
            (None, None) => ("", false),
        }
    }
}
