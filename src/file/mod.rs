//! Byte-level access to binaries: primitive IO, the cursor parser and memory-mapped files.

pub mod io;
pub mod parser;
pub mod physical;

pub use parser::Parser;
pub use physical::Physical;
