//! Per-agent isolated working area on disk.

use std::path::{Path, PathBuf};

use atrium_protocol::RuntimeResult;
use tokio::fs;
use tracing::{debug, instrument};

/// An agent's working directory under
/// `<root>/containers/<container>/agents/<agent>`.
///
/// Initialized when the agent is registered and removed when it is
/// destroyed. The runtime itself never writes here after initialization;
/// the directory exists for tools and artifacts produced during exchanges.
#[derive(Debug, Clone)]
pub struct RuntimeSandbox {
    root: PathBuf,
}

impl RuntimeSandbox {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn initialize(&self) -> RuntimeResult<()> {
        fs::create_dir_all(self.root.join("workspace")).await?;
        fs::create_dir_all(self.root.join("artifacts")).await?;
        debug!("sandbox initialized");
        Ok(())
    }

    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn dispose(&self) -> RuntimeResult<()> {
        if fs::try_exists(&self.root).await.unwrap_or(false) {
            fs::remove_dir_all(&self.root).await?;
            debug!("sandbox removed");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("atrium-{name}-{nanos}"))
    }

    #[tokio::test]
    async fn initialize_then_dispose_round_trip() -> anyhow::Result<()> {
        let root = unique_test_root("sandbox");
        let sandbox = RuntimeSandbox::new(&root);

        sandbox.initialize().await?;
        assert!(root.join("workspace").is_dir());
        assert!(root.join("artifacts").is_dir());

        sandbox.dispose().await?;
        assert!(!root.exists());
        Ok(())
    }

    #[tokio::test]
    async fn dispose_of_missing_directory_is_a_no_op() -> anyhow::Result<()> {
        let sandbox = RuntimeSandbox::new(unique_test_root("missing"));
        sandbox.dispose().await?;
        Ok(())
    }
}
