//! Durable agent identity

use crate::error::{AgentError, AgentResult};
use sacmes_core::Identity;
use std::path::{Path, PathBuf};

/// Identity stored in a local file, created on first use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityFile {
    path: PathBuf,
    identity: Identity,
}

impl IdentityFile {
    /// Read the identity at `path`, generating and writing a UUID v4 if the
    /// file does not exist yet
    pub fn load_or_create(path: impl AsRef<Path>) -> AgentResult<Self> {
        let path = path.as_ref().to_path_buf();
        match std::fs::read_to_string(&path) {
            Ok(raw) => {
                let identity =
                    Identity::parse(raw.trim()).ok_or_else(|| AgentError::BadIdentityFile(path.clone()))?;
                tracing::debug!(identity = %identity, path = %path.display(), "identity loaded");
                Ok(Self { path, identity })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let identity = Identity::new(uuid::Uuid::new_v4().to_string());
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| AgentError::io(parent, e))?;
                }
                std::fs::write(&path, identity.as_str()).map_err(|e| AgentError::io(&path, e))?;
                tracing::info!(identity = %identity, path = %path.display(), "new agent identity created");
                Ok(Self { path, identity })
            }
            Err(e) => Err(AgentError::io(path, e)),
        }
    }

    /// The identity
    #[must_use]
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
