//! Signature verification against a trust store of approved digests.
//!
//! A module's signature is the SHA-256 of its signed region (see
//! [`crate::package`]). The verifier recomputes it, compares it with the
//! declared value, and only approves digests an operator has trusted.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use crate::contract::PluginMetadata;
use crate::error::PluginError;
use crate::package::{signed_digest, PluginImage};

/// One `[[trusted]]` entry of a trust store file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TrustedDigest {
    digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    label: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct TrustStoreFile {
    #[serde(default)]
    trusted: Vec<TrustedDigest>,
}

/// Normalize a digest and check it is 64 hex characters.
fn normalize_digest(digest: &str) -> Result<String, PluginError> {
    let digest = digest.trim().to_ascii_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(PluginError::MalformedMetadata(format!(
            "not a SHA-256 hex digest: '{digest}'"
        )));
    }
    Ok(digest)
}

/// Set of approved digests, each with an optional label.
#[derive(Debug, Clone, Default)]
pub struct TrustStore {
    trusted: BTreeMap<String, Option<String>>,
}

impl TrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a trust store from TOML:
    ///
    /// ```toml
    /// [[trusted]]
    /// digest = "9f86d0…"
    /// label = "sample 1.0.0"
    /// ```
    pub fn from_toml_str(toml_str: &str) -> Result<Self, PluginError> {
        let file: TrustStoreFile = toml::from_str(toml_str)?;
        let mut store = Self::new();
        for entry in file.trusted {
            store.trust(&entry.digest, entry.label)?;
        }
        Ok(store)
    }

    /// Load a trust store file.
    pub fn load(path: &Path) -> Result<Self, PluginError> {
        let content = std::fs::read_to_string(path)?;
        let store = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), digests = store.len(), "trust store loaded");
        Ok(store)
    }

    /// Render the store in the same TOML format `from_toml_str` reads.
    pub fn to_toml_string(&self) -> String {
        let file = TrustStoreFile {
            trusted: self
                .trusted
                .iter()
                .map(|(digest, label)| TrustedDigest {
                    digest: digest.clone(),
                    label: label.clone(),
                })
                .collect(),
        };
        toml::to_string(&file).unwrap_or_default()
    }

    /// Approve a digest. Re-trusting replaces the label.
    pub fn trust(&mut self, digest: &str, label: Option<String>) -> Result<(), PluginError> {
        let digest = normalize_digest(digest)?;
        self.trusted.insert(digest, label);
        Ok(())
    }

    /// Withdraw approval. Returns `true` if the digest was trusted.
    pub fn revoke(&mut self, digest: &str) -> bool {
        self.trusted
            .remove(&digest.trim().to_ascii_lowercase())
            .is_some()
    }

    pub fn is_trusted(&self, digest: &str) -> bool {
        self.trusted
            .contains_key(&digest.trim().to_ascii_lowercase())
    }

    pub fn label(&self, digest: &str) -> Option<&str> {
        self.trusted
            .get(&digest.trim().to_ascii_lowercase())
            .and_then(|label| label.as_deref())
    }

    pub fn len(&self) -> usize {
        self.trusted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trusted.is_empty()
    }
}

/// Approves plugin binaries before anything is allocated for them.
#[derive(Debug, Default)]
pub struct SignatureVerifier {
    store: RwLock<TrustStore>,
}

impl SignatureVerifier {
    pub fn new(store: TrustStore) -> Self {
        Self {
            store: RwLock::new(store),
        }
    }

    /// Verify an image against the signature its metadata declares.
    ///
    /// Checks, in order: a signature is declared, it equals the digest of
    /// the signed region, and that digest is trusted. On success the
    /// metadata comes back marked verified.
    pub fn verify(
        &self,
        image: &PluginImage,
        metadata: PluginMetadata,
    ) -> Result<PluginMetadata, PluginError> {
        let declared = metadata.signature.trim();
        if declared.is_empty() {
            return Err(PluginError::MissingSignature(format!(
                "{} ({})",
                metadata.name,
                image.path().display()
            )));
        }

        let computed = signed_digest(image.bytes())?;
        if !declared.eq_ignore_ascii_case(&computed) {
            return Err(PluginError::SignatureMismatch {
                declared: declared.to_string(),
                computed,
            });
        }

        if !self.is_trusted(&computed) {
            return Err(PluginError::UntrustedSigner(computed));
        }

        tracing::debug!(
            plugin = %metadata.name,
            digest = %computed,
            "signature verified"
        );

        Ok(metadata.into_verified())
    }

    pub fn trust(&self, digest: &str, label: Option<String>) -> Result<(), PluginError> {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .trust(digest, label)
    }

    pub fn revoke(&self, digest: &str) -> bool {
        self.store
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .revoke(digest)
    }

    pub fn is_trusted(&self, digest: &str) -> bool {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_trusted(digest)
    }

    /// Copy of the current trust store.
    pub fn snapshot(&self) -> TrustStore {
        self.store
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
