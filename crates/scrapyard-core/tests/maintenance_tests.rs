mod common;

use common::{Failure, FakeDocker};
use scrapyard_core::maintenance::{CleanupOutcome, ContainerMaintenance, GcReport};
use tracing_test::traced_test;

fn maintenance(docker: &std::sync::Arc<FakeDocker>) -> ContainerMaintenance {
    ContainerMaintenance::new(docker.clone())
}

// ── containers ───────────────────────────────────────────────────────────────

#[tokio::test]
#[traced_test]
async fn delete_container_removes_it() {
    let docker = FakeDocker::new();
    docker.add_container("abc", 1);

    assert_eq!(maintenance(&docker).delete_container("abc").await, CleanupOutcome::Removed);
    assert!(docker.container_ids().is_empty());
    assert!(logs_contain("deleted container"));
}

#[tokio::test]
#[traced_test]
async fn delete_missing_container_is_skipped_with_warning() {
    let docker = FakeDocker::new();

    assert_eq!(maintenance(&docker).delete_container("gone").await, CleanupOutcome::Skipped);
    assert!(logs_contain("WARN"));
    assert!(logs_contain("could not remove container gone"));
}

#[tokio::test]
#[traced_test]
async fn delete_conflicting_container_is_skipped_with_warning() {
    let docker = FakeDocker::new();
    docker.add_container("busy", 1);
    docker.removal_failures.lock().unwrap().insert("busy".into(), Failure::Conflict);

    assert_eq!(maintenance(&docker).delete_container("busy").await, CleanupOutcome::Skipped);
    assert!(logs_contain("could not remove container busy"));
    assert!(!logs_contain("failed to remove"));
}

#[tokio::test]
#[traced_test]
async fn unexpected_container_error_is_reported() {
    let docker = FakeDocker::new();
    docker.add_container("bad", 1);
    docker.removal_failures.lock().unwrap().insert("bad".into(), Failure::Other);

    assert_eq!(maintenance(&docker).delete_container("bad").await, CleanupOutcome::Failed);
    assert!(logs_contain("ERROR"));
    assert!(logs_contain("failed to remove container bad"));
}

// ── images ───────────────────────────────────────────────────────────────────

#[tokio::test]
#[traced_test]
async fn remove_image_in_use_is_skipped() {
    let docker = FakeDocker::new();
    docker.removal_failures.lock().unwrap().insert("sha256:1".into(), Failure::Conflict);

    assert_eq!(maintenance(&docker).remove_image("sha256:1").await, CleanupOutcome::Skipped);
    assert!(logs_contain("could not remove image sha256:1"));
}

#[tokio::test]
#[traced_test]
async fn remove_missing_image_is_skipped() {
    let docker = FakeDocker::new();
    docker.removal_failures.lock().unwrap().insert("sha256:2".into(), Failure::NotFound);

    assert_eq!(maintenance(&docker).remove_image("sha256:2").await, CleanupOutcome::Skipped);
}

#[tokio::test]
async fn garbage_collection_counts_each_outcome() {
    let docker = FakeDocker::new();
    *docker.dangling.lock().unwrap() = vec!["a".into(), "b".into(), "c".into(), "d".into()];
    {
        let mut failures = docker.removal_failures.lock().unwrap();
        failures.insert("b".into(), Failure::Conflict);
        failures.insert("d".into(), Failure::Other);
    }

    let report = maintenance(&docker).collect_garbage().await;

    assert_eq!(report, GcReport { removed: 2, skipped: 1, failed: 1 });
    assert_eq!(*docker.removed_images.lock().unwrap(), vec!["a".to_string(), "c".to_string()]);
}
