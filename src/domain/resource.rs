//! Resources created by a run and the outcome of deleting them.

use serde::Serialize;

/// Something a step created that teardown must delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceHandle {
    /// Resource kind (e.g. `resource-group`)
    pub kind: String,

    /// Name or id of the resource, as written in the command
    pub identifier: String,

    /// Step whose command created it
    pub created_by_step_id: String,

    /// Command that deletes it
    pub delete_command: String,
}

/// Outcome of one deletion attempt
#[derive(Debug, Clone, Serialize)]
pub struct TeardownResult {
    /// The handle that was torn down
    pub handle: ResourceHandle,

    /// Whether a deletion command was issued at all
    pub issued: bool,

    /// Whether the deletion succeeded
    pub success: bool,

    /// Exit code of the deletion command, if it ran
    pub exit_code: Option<i32>,

    /// Failure description, if any
    pub error: Option<String>,
}
