use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use super::KeyUsage;
use crate::error::{Error, Result};

/// On-disk description of a software identity store.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreManifest {
    /// Locked stores refuse to sign until unlocked interactively.
    #[serde(default)]
    pub locked: bool,
    pub identities: Vec<IdentityEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IdentityEntry {
    pub label: String,
    /// DER or PEM certificate, relative to the manifest.
    pub certificate: PathBuf,
    /// PKCS#8 PEM private key, relative to the manifest.
    pub private_key: PathBuf,
    #[serde(default = "default_usage")]
    pub usage: Vec<String>,
    /// Provider whose allocator backs buffers produced with this key.
    #[serde(default)]
    pub provider: u32,
}

fn default_usage() -> Vec<String> {
    vec!["sign".to_string()]
}

impl StoreManifest {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Manifest(e.to_string()))
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("reading store manifest {}", path.display()))?;
        Ok(Self::from_json(&json)?)
    }
}

impl IdentityEntry {
    pub fn key_usage(&self) -> Result<KeyUsage> {
        self.usage.iter().try_fold(KeyUsage::empty(), |usage, name| {
            KeyUsage::from_name(name)
                .map(|bit| usage | bit)
                .ok_or_else(|| Error::Manifest(format!("unknown key usage `{name}` for {}", self.label)))
        })
    }
}
