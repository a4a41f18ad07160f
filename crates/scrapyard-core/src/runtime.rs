//! Container runtime boundary: listing run containers and deleting
//! containers and images.

use async_trait::async_trait;

/// Label carried by every container started for a run. Its value is the run id.
pub const RUN_LABEL: &str = "scrapyard.run_id";

/// Failure kinds reported by the container runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// Resource in use, or removal already in progress.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The runtime could not be reached at all (binary missing, daemon down).
    #[error("container runtime unavailable: {0}")]
    Unavailable(String),
    #[error("container runtime error: {0}")]
    Other(String),
}

impl RuntimeError {
    /// Conflict and not-found are expected during cleanup and safe to ignore.
    pub fn is_ignorable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::NotFound(_))
    }

    /// Map a runtime CLI error message onto an error kind.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_ascii_lowercase();
        let message = message.trim().to_string();
        if lower.contains("no such container")
            || lower.contains("no such image")
            || lower.contains("not found")
        {
            Self::NotFound(message)
        } else if lower.contains("conflict")
            || lower.contains("is in use")
            || lower.contains("is being used")
            || lower.contains("already in progress")
        {
            Self::Conflict(message)
        } else if lower.contains("cannot connect to the docker daemon") {
            Self::Unavailable(message)
        } else {
            Self::Other(message)
        }
    }
}

/// A container that was started for a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContainer {
    pub id: String,
    pub run_id: i64,
    pub running: bool,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers carrying the run label, running or stopped.
    async fn list_run_containers(&self) -> Result<Vec<RunContainer>, RuntimeError>;

    async fn delete_container(&self, id: &str) -> Result<(), RuntimeError>;

    async fn remove_image(&self, id: &str) -> Result<(), RuntimeError>;

    /// Untagged images no longer referenced by any tag.
    async fn dangling_images(&self) -> Result<Vec<String>, RuntimeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_docker_messages() {
        assert!(matches!(
            RuntimeError::classify("Error: No such container: abc123"),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            RuntimeError::classify("Error response from daemon: No such image: deadbeef"),
            RuntimeError::NotFound(_)
        ));
        assert!(matches!(
            RuntimeError::classify(
                "Error response from daemon: conflict: unable to delete 1a2b (cannot be forced) - image is being used by running container 3c4d"
            ),
            RuntimeError::Conflict(_)
        ));
        assert!(matches!(
            RuntimeError::classify("Error response from daemon: removal of container abc is already in progress"),
            RuntimeError::Conflict(_)
        ));
        assert!(matches!(
            RuntimeError::classify("Cannot connect to the Docker daemon at unix:///var/run/docker.sock"),
            RuntimeError::Unavailable(_)
        ));
        assert!(matches!(
            RuntimeError::classify("Error response from daemon: driver failed"),
            RuntimeError::Other(_)
        ));
    }

    #[test]
    fn only_conflict_and_not_found_are_ignorable() {
        assert!(RuntimeError::Conflict("x".into()).is_ignorable());
        assert!(RuntimeError::NotFound("x".into()).is_ignorable());
        assert!(!RuntimeError::Unavailable("x".into()).is_ignorable());
        assert!(!RuntimeError::Other("x".into()).is_ignorable());
    }
}
