//! The user manifest, `~/.azmanagers/manifest.json`.
//!
//! Holds account defaults (resource group, subscription, SSH identity) that
//! operations fall back to when a caller omits them. The file is read once
//! per process and cached; it is written with owner-only permissions because
//! it names key material on disk.

use crate::{azmanagers_dir, ConfigError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

static MANIFEST: OnceCell<Manifest> = OnceCell::new();

/// Account defaults recognized by every provisioning operation.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resourcegroup: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscriptionid: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_private_key_file: Option<String>,
}

impl Manifest {
    /// Path of the manifest file.
    pub fn path() -> Result<PathBuf, ConfigError> {
        Ok(azmanagers_dir()?.join("manifest.json"))
    }

    /// Read the manifest from disk. A missing file yields an empty manifest.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::path()?;
        if !path.exists() {
            debug!(path = %path.display(), "No manifest on disk, using empty defaults");
            return Ok(Self::default());
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Persist the manifest, creating `~/.azmanagers` (0700) and writing the
    /// file with mode 0600.
    pub fn save(&self) -> Result<(), ConfigError> {
        let dir = azmanagers_dir()?;
        fs::create_dir_all(&dir)?;
        restrict_permissions(&dir, 0o700)?;

        let path = Self::path()?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        restrict_permissions(&path, 0o600)?;
        debug!(path = %path.display(), "Wrote manifest");
        Ok(())
    }

    /// Resolve a value: the explicit argument wins, then the manifest key.
    pub fn resolve<'a>(&'a self, explicit: Option<&'a str>, key: ManifestKey) -> Option<&'a str> {
        explicit.or_else(|| self.get(key))
    }

    fn get(&self, key: ManifestKey) -> Option<&str> {
        match key {
            ManifestKey::ResourceGroup => self.resourcegroup.as_deref(),
            ManifestKey::SubscriptionId => self.subscriptionid.as_deref(),
            ManifestKey::SshUser => self.ssh_user.as_deref(),
            ManifestKey::SshPublicKeyFile => self.ssh_public_key_file.as_deref(),
            ManifestKey::SshPrivateKeyFile => self.ssh_private_key_file.as_deref(),
        }
    }
}

/// Keys recognized in the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ManifestKey {
    ResourceGroup,
    SubscriptionId,
    SshUser,
    SshPublicKeyFile,
    SshPrivateKeyFile,
}

/// The process-wide manifest, loaded on first access.
pub fn manifest() -> &'static Manifest {
    MANIFEST.get_or_init(|| {
        Manifest::load().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to read manifest, using empty defaults");
            Manifest::default()
        })
    })
}

#[cfg(unix)]
fn restrict_permissions(path: &std::path::Path, mode: u32) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &std::path::Path, _mode: u32) -> Result<(), ConfigError> {
    Ok(())
}
