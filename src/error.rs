//! Error taxonomy for user-facing failures.

use thiserror::Error;

/// Failures that end an invocation with a message and exit code 1.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BeakerUtilError {
    #[error("No sessions found for author {0}.")]
    NoSessions(String),

    #[error("Invalid session index {0}!")]
    InvalidIndex(i64),

    #[error("No session found with name {0}!")]
    NoSessionWithName(String),

    #[error("No session found with id {0}!")]
    NoSessionWithId(String),

    #[error("No session specified and no unique session found!")]
    Ambiguous,

    #[error("No clusters found for pattern {0}!")]
    NoClusters(String),

    #[error("No node with enough GPUs available (requested {requested}, best node {hostname} has {free} free)")]
    InsufficientCapacity {
        requested: u32,
        hostname: String,
        free: u32,
    },

    #[error("No nodes reported for clusters matching {0}!")]
    NoNodes(String),

    #[error("No launch configuration found at {0}! Create one to use this command.")]
    LaunchConfigMissing(String),

    #[error("No launch configuration found for {name} in {path}! Available: {available}")]
    NoSuchLaunchConfig {
        name: String,
        path: String,
        available: String,
    },

    #[error("Invalid value '{value}' for {arg}; allowed: {allowed}")]
    InvalidChoice {
        arg: String,
        value: String,
        allowed: String,
    },

    #[error("No {field} given; pass --{field} or set it in the launch configuration")]
    MissingLaunchField { field: &'static str },

    #[error("No stored defaults for command {0}")]
    NoStoredDefaults(String),

    #[error("Command {command:?} failed with code {code}: {stderr}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },
}

impl BeakerUtilError {
    /// Build a choice error, rendering an empty set as "none".
    pub fn invalid_choice(arg: &str, value: &str, allowed: &[String]) -> Self {
        BeakerUtilError::InvalidChoice {
            arg: arg.to_string(),
            value: value.to_string(),
            allowed: join_or_none(allowed),
        }
    }
}

/// Join a list for display, or "none" when empty.
pub fn join_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "none".to_string()
    } else {
        items.join(", ")
    }
}
