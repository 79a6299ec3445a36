//! Device identity.
//!
//! A device id is a random UUID generated once and persisted locally. It is
//! the only thing that ties a caller to a membership and carries no proof of
//! possession: anyone who learns it can act as that device.

use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::{CircleError, Result};

pub trait IdentityResolver: Send + Sync {
    /// Stable device id for this installation
    fn resolve_device_id(&self) -> Result<String>;
}

/// Device id stored in a plain file, created on first use
#[derive(Debug, Clone)]
pub struct FileIdentity {
    path: PathBuf,
}

impl FileIdentity {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.khatm/device_id`, or `./.khatm_device_id` without a home directory
    pub fn default_path() -> PathBuf {
        match std::env::var_os("HOME").filter(|home| !home.is_empty()) {
            Some(home) => Path::new(&home).join(".khatm").join("device_id"),
            None => PathBuf::from(".khatm_device_id"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileIdentity {
    fn default() -> Self {
        Self::new(Self::default_path())
    }
}

impl IdentityResolver for FileIdentity {
    fn resolve_device_id(&self) -> Result<String> {
        if self.path.exists() {
            let stored = std::fs::read_to_string(&self.path)?;
            let stored = stored.trim();
            if !stored.is_empty() {
                return Ok(stored.to_string());
            }
            tracing::warn!(path = %self.path.display(), "Device id file is empty, regenerating");
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let device_id = Uuid::new_v4().to_string();
        std::fs::write(&self.path, &device_id)?;
        tracing::info!(path = %self.path.display(), "Generated new device id");
        Ok(device_id)
    }
}

/// Fixed device id, for embedding and tests
#[derive(Debug, Clone)]
pub struct StaticIdentity(pub String);

impl IdentityResolver for StaticIdentity {
    fn resolve_device_id(&self) -> Result<String> {
        if self.0.trim().is_empty() {
            return Err(CircleError::validation("Device id must not be empty"));
        }
        Ok(self.0.clone())
    }
}
