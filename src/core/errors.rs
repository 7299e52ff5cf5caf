/*!
 * Error Types
 * Centralized error handling with thiserror, miette, and serde support
 */

use crate::core::types::Handle;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Handle table errors with serialization support
///
/// Only recoverable conditions are represented here. Contract violations
/// (double set, release CAS failure) are fatal assertions, not errors.
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum HandleError {
    #[error("Handle table exhausted ({capacity} slots)")]
    #[diagnostic(
        code(handle::exhausted),
        help("All slots are reserved. Free unused handles or allocate a larger table.")
    )]
    Exhausted { capacity: u32 },

    #[error("Stale or invalid handle {0}")]
    #[diagnostic(
        code(handle::stale),
        help("The handle was freed, reissued for another object, or never valid.")
    )]
    Stale(Handle),
}
