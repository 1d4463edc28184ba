//! Domain primitive types used across the berth workspace.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BerthError, Result};

/// Unique identifier for a container instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContainerId(String);

impl ContainerId {
    /// Creates a new container ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random (version 4) container ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Returns whether `name` matches `^[a-z0-9]+(-[a-z0-9]+)*$`.
///
/// This is the grammar for container names and named volumes.
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .split('-')
            .all(|part| {
                !part.is_empty()
                    && part
                        .bytes()
                        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            })
}

/// Converts an image identifier such as `example.com/reduce-worker` into a
/// valid container name (`example-com-reduce-worker`).
///
/// # Errors
///
/// Returns [`BerthError::InvalidName`] if nothing usable remains.
pub fn name_from_identifier(identifier: &str) -> Result<String> {
    let mut name = String::with_capacity(identifier.len());
    for c in identifier.chars().map(|c| c.to_ascii_lowercase()) {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            name.push(c);
        } else if !name.is_empty() && !name.ends_with('-') {
            name.push('-');
        }
    }
    while name.ends_with('-') {
        let _ = name.pop();
    }
    if name.is_empty() {
        return Err(BerthError::InvalidName {
            name: identifier.to_string(),
        });
    }
    Ok(name)
}

/// Lifecycle state of a container.
///
/// Progression is forward only: `New → Starting → Running → Stopping →
/// Stopped | Exited`. A failure while `Starting` jumps straight to `Failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    /// Registered, bootstrap not yet begun.
    #[default]
    New,
    /// Resources are being provisioned and the stager is bootstrapping.
    Starting,
    /// Every bootstrap step completed.
    Running,
    /// A stop was requested and is in progress.
    Stopping,
    /// Stopped on request.
    Stopped,
    /// The process tree exited on its own.
    Exited,
    /// Bootstrap failed and resources were rolled back.
    Failed,
}

impl ContainerState {
    /// Returns whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Exited | Self::Failed)
    }

    /// Returns whether moving from `self` to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        match (self, next) {
            (Self::New, Self::Starting)
            | (Self::Starting, Self::Running | Self::Failed)
            | (Self::Running, Self::Stopping | Self::Exited)
            | (Self::Stopping, Self::Stopped | Self::Exited) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Exited => write!(f, "exited"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(ContainerId::generate(), ContainerId::generate());
    }

    #[test]
    fn valid_names() {
        assert!(is_valid_name("data"));
        assert!(is_valid_name("data-2"));
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("Data"));
        assert!(!is_valid_name("a--b"));
        assert!(!is_valid_name("-a"));
        assert!(!is_valid_name("../etc"));
    }

    #[test]
    fn name_from_identifier_sanitizes() {
        assert_eq!(
            name_from_identifier("example.com/reduce-worker").unwrap(),
            "example-com-reduce-worker"
        );
        assert_eq!(name_from_identifier("Busybox").unwrap(), "busybox");
        assert_eq!(name_from_identifier("/a//b/").unwrap(), "a-b");
        assert!(name_from_identifier("///").is_err());
    }

    #[test]
    fn transitions_only_move_forward() {
        use ContainerState::*;
        assert!(New.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Failed));
        assert!(Running.can_transition_to(Stopping));
        assert!(Stopping.can_transition_to(Stopped));
        assert!(!New.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Exited.can_transition_to(Running));
    }
}
