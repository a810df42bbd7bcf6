// src/core/errors.rs

//! Error types of the library.

use std::fmt;
use thiserror::Error;

/// Where in the source an error was detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Location {
    /// The file being parsed, if known.
    pub filename: Option<String>,
    /// 1-based line number, if known.
    pub line_number: Option<usize>,
}

impl Location {
    /// A location at a specific line. Line 0 stands for a step typed in at runtime.
    pub fn at(filename: Option<&str>, line_number: usize) -> Self {
        Self {
            filename: filename.map(str::to_string),
            line_number: (line_number > 0).then_some(line_number),
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.filename, self.line_number) {
            (Some(file), Some(line)) => write!(f, " [{}:{}]", file, line),
            (None, Some(line)) => write!(f, " [line {}]", line),
            (Some(file), None) => write!(f, " [{}]", file),
            (None, None) => Ok(()),
        }
    }
}

/// Errors raised while parsing a tree or expanding it into branches.
/// All of them are fatal to the call that detected them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TreeError {
    /// A single line breaks the step grammar.
    #[error("{message}{location}")]
    Syntax {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
    /// Leading whitespace is not a multiple of four spaces.
    #[error("{message}{location}")]
    Indentation {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
    /// The shape of the tree is invalid.
    #[error("{message}{location}")]
    Structure {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
    /// A function call matches no visible declaration.
    #[error("{message}{location}")]
    Resolution {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
    /// `~`, `$`, frequency, group or no-debug settings conflict.
    #[error("{message}{location}")]
    Configuration {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
    /// Function calls recurse into themselves.
    #[error("{message}{location}")]
    InfiniteLoop {
        /// What went wrong.
        message: String,
        /// Where it went wrong.
        location: Location,
    },
}

impl TreeError {
    /// A line-level grammar violation.
    pub fn syntax(message: impl Into<String>, filename: Option<&str>, line: usize) -> Self {
        Self::Syntax {
            message: message.into(),
            location: Location::at(filename, line),
        }
    }

    /// A whitespace violation.
    pub fn indentation(message: impl Into<String>, filename: Option<&str>, line: usize) -> Self {
        Self::Indentation {
            message: message.into(),
            location: Location::at(filename, line),
        }
    }

    /// A tree-shape violation.
    pub fn structure(message: impl Into<String>, filename: Option<&str>, line: usize) -> Self {
        Self::Structure {
            message: message.into(),
            location: Location::at(filename, line),
        }
    }

    /// An unresolved function call.
    pub fn resolution(message: impl Into<String>, filename: Option<&str>, line: usize) -> Self {
        Self::Resolution {
            message: message.into(),
            location: Location::at(filename, line),
        }
    }

    /// Conflicting restrictions.
    pub fn configuration(message: impl Into<String>, location: Location) -> Self {
        Self::Configuration {
            message: message.into(),
            location,
        }
    }

    /// A recursive function call.
    pub fn infinite_loop(message: impl Into<String>, filename: Option<&str>, line: usize) -> Self {
        Self::InfiniteLoop {
            message: message.into(),
            location: Location::at(filename, line),
        }
    }

    /// The location carried by every variant.
    pub fn location(&self) -> &Location {
        match self {
            Self::Syntax { location, .. }
            | Self::Indentation { location, .. }
            | Self::Structure { location, .. }
            | Self::Resolution { location, .. }
            | Self::Configuration { location, .. }
            | Self::InfiniteLoop { location, .. } => location,
        }
    }
}

/// Errors raised by the runner's public operations.
#[derive(Error, Debug)]
pub enum RunnerError {
    /// The call is not valid in the runner's current state.
    #[error("{0}")]
    State(String),
    /// The tree could not be parsed or expanded.
    #[error(transparent)]
    Tree(#[from] TreeError),
    /// A branch set could not be read or written.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_file_and_line() {
        let err = TreeError::syntax("Invalid step name", Some("login.smash"), 12);
        assert_eq!(err.to_string(), "Invalid step name [login.smash:12]");
        assert_eq!(err.location().line_number, Some(12));
    }

    #[test]
    fn test_display_without_location() {
        let err = TreeError::configuration("No branches left", Location::default());
        assert_eq!(err.to_string(), "No branches left");
        let err = TreeError::syntax("Bad injected step", None, 0);
        assert_eq!(err.to_string(), "Bad injected step");
    }

    #[test]
    fn test_runner_error_wraps_tree_error() {
        let err: RunnerError = TreeError::resolution("Missing", None, 3).into();
        assert_eq!(err.to_string(), "Missing [line 3]");
    }
}
