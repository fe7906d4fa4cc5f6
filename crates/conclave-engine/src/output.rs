use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tracing::debug;

use conclave_core::error::Result;
use conclave_core::traits::OutputSource;

/// Final output built from the shared collaboration directory.
///
/// Every non-hidden file under `<workspace>/<collab_dir>` is concatenated as
/// `=== relative/path ===` followed by its content, in path order.
pub struct CollabSnapshot {
    collab_dir: String,
    max_file_bytes: usize,
}

impl CollabSnapshot {
    pub fn new(collab_dir: impl Into<String>) -> Self {
        Self {
            collab_dir: collab_dir.into(),
            max_file_bytes: 256 * 1024,
        }
    }

    /// Files larger than this are listed but not inlined.
    pub fn with_max_file_bytes(mut self, max: usize) -> Self {
        self.max_file_bytes = max;
        self
    }

    async fn collect(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let kind = entry.file_type().await?;
                if kind.is_dir() {
                    pending.push(entry.path());
                } else if kind.is_file() {
                    files.push(entry.path());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    async fn render(&self, root: &Path) -> Result<String> {
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            debug!(dir = %root.display(), "No collaboration directory");
            return Ok(String::new());
        }

        let mut blocks = Vec::new();
        for path in self.collect(root).await? {
            let rel = path.strip_prefix(root).unwrap_or(&path).display().to_string();
            let bytes = tokio::fs::read(&path).await?;
            let body = if bytes.len() > self.max_file_bytes {
                format!("[{} bytes omitted]", bytes.len())
            } else {
                String::from_utf8_lossy(&bytes).into_owned()
            };
            blocks.push(format!("=== {} ===\n{}", rel, body.trim_end()));
        }
        Ok(blocks.join("\n\n"))
    }
}

impl OutputSource for CollabSnapshot {
    fn snapshot(&self, _workflow: &str, workspace: &Path) -> BoxFuture<'_, Result<String>> {
        let root = workspace.join(&self.collab_dir);
        Box::pin(async move { self.render(&root).await })
    }
}
