//! The IJ frontend: a recursive-descent parser producing the AST, and the
//! prune-and-lower pass that turns it into assembler calls.

mod parse;
pub use parse::{parse_program};

mod lower;
pub use lower::{compile};
