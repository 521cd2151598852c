//! Registry of live source supervisors.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::Config;
use crate::transcode::SourceManager;

/// Stable identity of a source file, derived from its path.
pub fn source_id(path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Maps source ids to their supervisors. A supervisor is created on the
/// first request for a source and forgotten when it announces its own death
/// on the close channel.
pub struct ManagerRegistry {
    cfg: Arc<Config>,
    managers: Mutex<HashMap<String, Arc<SourceManager>>>,
    close_tx: mpsc::Sender<String>,
}

impl ManagerRegistry {
    pub fn new(cfg: Arc<Config>) -> Arc<Self> {
        let (close_tx, close_rx) = mpsc::channel(16);
        let registry = Arc::new(Self {
            cfg,
            managers: Mutex::new(HashMap::new()),
            close_tx,
        });

        tokio::spawn(registry.clone().reap(close_rx));
        registry
    }

    /// Drop supervisors that destroyed themselves through inactivity.
    async fn reap(self: Arc<Self>, mut close_rx: mpsc::Receiver<String>) {
        while let Some(id) = close_rx.recv().await {
            if self.managers.lock().await.remove(&id).is_some() {
                tracing::debug!("{}: forgot idle supervisor", id);
            }
        }
    }

    /// Fetch the supervisor for a source, creating it (probe, ladder, temp
    /// directory) on first sight.
    pub async fn get_or_create(&self, path: &Path) -> anyhow::Result<Arc<SourceManager>> {
        let id = source_id(path);

        let mut managers = self.managers.lock().await;
        if let Some(manager) = managers.get(&id) {
            return Ok(manager.clone());
        }

        let manager = SourceManager::new(
            self.cfg.clone(),
            path.to_path_buf(),
            id.clone(),
            self.close_tx.clone(),
        )
        .await?;

        managers.insert(id, manager.clone());
        Ok(manager)
    }

    /// Destroy every live supervisor. Used at server shutdown.
    pub async fn shutdown(&self) {
        let mut managers = self.managers.lock().await;
        for (_, manager) in managers.drain() {
            manager.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_id_is_stable() {
        let a = source_id(Path::new("/videos/a.mp4"));
        let b = source_id(Path::new("/videos/a.mp4"));
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn test_source_id_distinguishes_paths() {
        let a = source_id(Path::new("/videos/a.mp4"));
        let b = source_id(Path::new("/videos/b.mp4"));
        assert_ne!(a, b);
    }
}
