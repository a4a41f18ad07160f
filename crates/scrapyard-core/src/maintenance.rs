//! Best-effort cleanup of containers and images.
//!
//! Nothing here propagates an error. Conflict and not-found are expected
//! (another actor already removed the resource, or it is still in use) and
//! are logged at warn level; anything else is logged at error level.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::runtime::{ContainerRuntime, RuntimeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupOutcome {
    Removed,
    /// Conflict or not-found; nothing left to do.
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcReport {
    pub removed: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct ContainerMaintenance {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerMaintenance {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    pub async fn delete_container(&self, id: &str) -> CleanupOutcome {
        match self.runtime.delete_container(id).await {
            Ok(()) => {
                info!(container = id, "maintenance: deleted container");
                CleanupOutcome::Removed
            }
            Err(e) => classify_failure("container", id, &e),
        }
    }

    pub async fn remove_image(&self, id: &str) -> CleanupOutcome {
        match self.runtime.remove_image(id).await {
            Ok(()) => {
                info!(image = id, "maintenance: removed image");
                CleanupOutcome::Removed
            }
            Err(e) => classify_failure("image", id, &e),
        }
    }

    /// Remove every dangling image. Images still in use are skipped.
    pub async fn collect_garbage(&self) -> GcReport {
        let images = match self.runtime.dangling_images().await {
            Ok(images) => images,
            Err(e) => {
                error!("maintenance: failed to list dangling images: {e}");
                return GcReport::default();
            }
        };

        let mut report = GcReport::default();
        for image in &images {
            match self.remove_image(image).await {
                CleanupOutcome::Removed => report.removed += 1,
                CleanupOutcome::Skipped => report.skipped += 1,
                CleanupOutcome::Failed => report.failed += 1,
            }
        }
        if !images.is_empty() {
            info!(
                removed = report.removed,
                skipped = report.skipped,
                failed = report.failed,
                "maintenance: image garbage collection finished"
            );
        }
        report
    }
}

fn classify_failure(kind: &str, id: &str, e: &RuntimeError) -> CleanupOutcome {
    if e.is_ignorable() {
        warn!(kind, id, "maintenance: could not remove {kind} {id}: {e}");
        CleanupOutcome::Skipped
    } else {
        error!(kind, id, "maintenance: failed to remove {kind} {id}: {e}");
        CleanupOutcome::Failed
    }
}
