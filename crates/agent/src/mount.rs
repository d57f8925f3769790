use crate::constants::{DEPS_DEVICE, DEPS_MOUNT_POINT};
use tokio::process::Command;

/// Mounts the dependency image read-only if the host attached one.
/// Returns the mount point when it attached and mounted successfully.
pub async fn mount_dependencies() -> Option<String> {
    if !std::path::Path::new(DEPS_DEVICE).exists() {
        return None;
    }

    tracing::info!(device = DEPS_DEVICE, "found dependency drive, mounting");
    if let Err(e) = tokio::fs::create_dir_all(DEPS_MOUNT_POINT).await {
        tracing::warn!(error = %e, "failed to create mount point");
        return None;
    }

    let status = Command::new("mount")
        .args(["-t", "ext4", DEPS_DEVICE, DEPS_MOUNT_POINT, "-o", "ro"])
        .status()
        .await;

    match status {
        Ok(status) if status.success() => {
            tracing::info!(mount_point = DEPS_MOUNT_POINT, "dependencies mounted");
            Some(DEPS_MOUNT_POINT.to_string())
        }
        Ok(status) => {
            tracing::warn!(?status, "mount exited non-zero");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to spawn mount");
            None
        }
    }
}
