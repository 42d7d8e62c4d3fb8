//! Registry persistence: a single JSON document rewritten after every mutation.

use hostagent_common::{AgentError, Instance, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const STATE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StateFile {
    version: u32,
    instances: Vec<Instance>,
}

pub struct StateStore {
    path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl StateStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// A store that never touches disk.
    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load persisted instances. A missing file is an empty registry; a
    /// corrupt one is logged and treated as empty.
    pub async fn load(&self) -> Result<Vec<Instance>> {
        let Some(path) = &self.path else {
            return Ok(Vec::new());
        };
        let raw = match fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(AgentError::Persistence(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        match serde_json::from_slice::<StateFile>(&raw) {
            Ok(state) => {
                debug!(path = %path.display(), count = state.instances.len(), "Loaded state");
                Ok(state.instances)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "State file is corrupt, starting empty");
                Ok(Vec::new())
            }
        }
    }

    /// Atomically replace the state file with `instances`.
    pub async fn save(&self, instances: &[Instance]) -> Result<()> {
        self.save_with(|| instances.to_vec()).await
    }

    /// Like [`save`](Self::save), with the snapshot taken under the write
    /// lock. The last write always carries the newest registry state.
    pub async fn save_with<F>(&self, snapshot: F) -> Result<()>
    where
        F: FnOnce() -> Vec<Instance>,
    {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.write_lock.lock().await;

        let body = serde_json::to_vec_pretty(&StateFile {
            version: STATE_VERSION,
            instances: snapshot(),
        })
        .map_err(|e| AgentError::Persistence(e.to_string()))?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| AgentError::Persistence(format!("create {}: {e}", parent.display())))?;
        }

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .await
            .map_err(|e| AgentError::Persistence(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, path)
            .await
            .map_err(|e| AgentError::Persistence(format!("rename to {}: {e}", path.display())))?;
        Ok(())
    }
}
