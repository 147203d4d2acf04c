//! Exit codes for the CLI.
//!
//! Scripts can branch on these instead of parsing stderr.

/// Successful execution
pub const SUCCESS: u8 = 0;

/// General/unspecified error
pub const GENERAL_ERROR: u8 = 1;

// 2 is clap's usage error.

/// File or directory not found
pub const NOT_FOUND: u8 = 3;

/// Destination already exists
pub const ALREADY_EXISTS: u8 = 4;

/// Directory not empty
pub const NOT_EMPTY: u8 = 5;

/// Expected a file and found a directory, or the reverse
pub const WRONG_TYPE: u8 = 6;

/// Malformed path or unsupported request
pub const INVALID_ARGUMENT: u8 = 7;

/// Backend failure after retries
pub const BACKEND_FAILED: u8 = 8;

/// Configuration file or flags rejected
pub const CONFIG_INVALID: u8 = 9;
