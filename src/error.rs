use std::fmt;

use thiserror::Error;

/** A position in an input file, as carried by every token. */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: u32,
    pub col_start: u32,
    pub col_end: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.file, self.line, self.col_start)
    }
}

/**
 * Every way a compilation can fail. All of these are fatal: the driver prints
 * one diagnostic and exits non-zero. The first two carry the location of the
 * offending input; the latter kinds arise after locations have been consumed.
 */
#[derive(Debug, Error)]
pub enum Error {
    #[error("lexer error {loc}: {msg}")]
    Lexer { loc: Location, msg: String },

    #[error("parse error {loc}: {msg}")]
    Parse { loc: Location, msg: String },

    #[error("compile error: {0}")]
    Semantic(String),

    #[error("link error: {0}")]
    Link(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /** Construct a [`Error::Parse`] at the location of `token`. */
    pub fn parse(loc: &Location, msg: impl Into<String>) -> Self {
        Error::Parse { loc: loc.clone(), msg: msg.into() }
    }

    pub fn lexer(loc: &Location, msg: impl Into<String>) -> Self {
        Error::Lexer { loc: loc.clone(), msg: msg.into() }
    }

    pub fn semantic(msg: impl Into<String>) -> Self {
        Error::Semantic(msg.into())
    }

    pub fn link(msg: impl Into<String>) -> Self {
        Error::Link(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
