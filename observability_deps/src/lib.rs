//! This crate exists to add a level of indirection between the observability
//! crates the workspace uses and the code that uses them, so versions can be
//! managed and updated centrally.

#![warn(missing_docs)]

// Export these crates publicly so we can have a single reference
pub use tracing;
