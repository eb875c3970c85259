use std::path::{Path, PathBuf};
use tokio::fs;

/// Per-run scratch layout under the temp root.
///
/// ```text
/// ModMerger_<millis>_<id>/
///   base_cache/   extracted and cached base content
///   mod_<n>/      one extraction directory per mod, in mod order
///   merged/       staging directory packed into the output
/// ```
#[derive(Debug, Clone)]
pub struct RunWorkspace {
    pub root: PathBuf,
    pub base_cache: PathBuf,
    pub merged: PathBuf,
}

impl RunWorkspace {
    pub async fn new(temp_root: impl AsRef<Path>) -> anyhow::Result<Self> {
        let root = temp_root
            .as_ref()
            .join(format!("ModMerger_{}", generate_run_id()));
        let base_cache = root.join("base_cache");
        let merged = root.join("merged");

        fs::create_dir_all(&base_cache).await?;
        fs::create_dir_all(&merged).await?;

        Ok(Self {
            root,
            base_cache,
            merged,
        })
    }

    /// Extraction directory for the mod at `index` (1-based, matching mod order).
    pub fn mod_dir(&self, index: usize) -> PathBuf {
        self.root.join(format!("mod_{}", index))
    }

    /// Remove the whole run directory. Missing directories are not an error.
    pub async fn cleanup(&self) -> anyhow::Result<()> {
        match fs::remove_dir_all(&self.root).await {
            Ok(()) => {
                tracing::debug!(root = %self.root.display(), "Removed run workspace");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `<millis>_<7 hex chars>`, unique enough for concurrent runs on one host.
pub fn generate_run_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}", now_millis(), &uuid[..7])
}
