//! Stable process exit codes for the `agent` CLI.
//!
//! Scripts and the bench harness branch on these values, so they must not
//! change between releases.

/// Task ran to completion and verification passed.
pub const COMPLETED: i32 = 0;

/// Internal error (I/O, configuration, subprocess failure).
pub const ERROR: i32 = 1;

/// Task failed terminally (retry budget exhausted or unrecoverable step).
pub const FAILED: i32 = 2;

/// The request was too ambiguous to act on; a clarifying question was printed.
pub const CLARIFY: i32 = 3;

/// Another task holds the repository lock.
pub const BUSY: i32 = 4;
