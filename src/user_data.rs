use std::path::Path;
use tracing::{debug, info};

use crate::sandbox::{SandboxDriver, SandboxError};

/// Upload the per-user data bundle into the sandbox `data/` directory.
///
/// The bundle is a local directory `user_data/<user_id>`; a missing bundle
/// is normal and skips silently.
pub async fn sync_user_data_to_sandbox(
    driver: &SandboxDriver,
    user_id: &str,
) -> Result<(), SandboxError> {
    let local_root = Path::new("user_data").join(user_id);
    if !local_root.is_dir() {
        debug!(%user_id, "no user data bundle present, skipping sync");
        return Ok(());
    }

    let work_dir = driver.work_dir();
    let mut uploaded = 0usize;

    let mut stack = vec![local_root.clone()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let rel = path
                .strip_prefix(&local_root)
                .expect("entry is under bundle root")
                .to_string_lossy()
                .replace('\\', "/");
            let Ok(content) = tokio::fs::read(&path).await else {
                continue;
            };
            driver
                .upload_file_bytes(&format!("{work_dir}/data/{rel}"), &content)
                .await?;
            uploaded += 1;
        }
    }

    info!(%user_id, files = uploaded, "user data synced to sandbox");
    Ok(())
}
