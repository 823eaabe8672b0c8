//! Per-owner folder manifests.
//!
//! One JSON object per owner and kind under `.secure/`, mapping normalized
//! directory paths to wrapped-key records. Loaded through a short-lived KV
//! cache; saved by rewriting the object and dropping the cache entry.
//! Writers are last-write-wins per owner, which is accepted for the rare
//! concurrent-manifest-write case.

use std::collections::BTreeMap;
use std::time::Duration;

use futures::TryStreamExt;
use kv_store::GenericKvStore;
use object_gateway::{GatewayError, GenericObjectStore, PutOptions};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::cache_keys;
use crate::context::OwnerId;
use crate::directory::crypto::WrappedKey;
use crate::error::ApiError;
use crate::SECURE_DIR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    Encrypted,
    Hidden,
}

impl ManifestKind {
    fn object_name(&self) -> &'static str {
        match self {
            Self::Encrypted => "encrypted-folders.json",
            Self::Hidden => "hidden-folders.json",
        }
    }

    fn cache_key(&self, owner: &OwnerId) -> String {
        match self {
            Self::Encrypted => cache_keys::encrypted_manifest(owner),
            Self::Hidden => cache_keys::hidden_manifest(owner),
        }
    }

    pub fn object_key(&self, owner: &OwnerId) -> String {
        format!("{}/{SECURE_DIR}/{}", owner, self.object_name())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderRecord {
    pub ciphertext: String,
    pub iv: String,
    pub auth_tag: String,
    pub salt: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl FolderRecord {
    pub fn from_wrapped(wrapped: &WrappedKey) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            ciphertext: base64::encode(&wrapped.ciphertext),
            iv: base64::encode(&wrapped.iv),
            auth_tag: base64::encode(&wrapped.auth_tag),
            salt: base64::encode(&wrapped.salt),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn to_wrapped(&self) -> Option<WrappedKey> {
        Some(WrappedKey {
            ciphertext: base64::decode(&self.ciphertext).ok()?,
            iv: base64::decode(&self.iv).ok()?,
            auth_tag: base64::decode(&self.auth_tag).ok()?,
            salt: base64::decode(&self.salt).ok()?,
        })
    }

    fn is_complete(&self) -> bool {
        !self.ciphertext.is_empty()
            && !self.iv.is_empty()
            && !self.auth_tag.is_empty()
            && !self.salt.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FolderManifest {
    pub folders: BTreeMap<String, FolderRecord>,
}

impl FolderManifest {
    /// The folder covering `path`: the path itself, else the nearest
    /// enclosing folder (longest match first).
    pub fn covering_folder(&self, path: &str) -> Option<&str> {
        let normalized = utils::path::normalize_dir(path);
        if self.folders.contains_key(&normalized) {
            return self
                .folders
                .get_key_value(&normalized)
                .map(|(k, _)| k.as_str());
        }
        let result = utils::path::ancestors(&normalized)
            .find(|ancestor| self.folders.contains_key(*ancestor))
            .and_then(|ancestor| {
                self.folders
                    .get_key_value(ancestor)
                    .map(|(k, _)| k.as_str())
            });
        result
    }

    pub fn contains(&self, path: &str) -> bool {
        self.folders.contains_key(&utils::path::normalize_dir(path))
    }

    /// Folders equal to or under `path`, for descendant reveal.
    pub fn folders_under<'a>(&'a self, path: &str) -> Vec<(&'a str, &'a FolderRecord)> {
        let normalized = utils::path::normalize_dir(path);
        let child_prefix = format!("{normalized}/");
        self.folders
            .iter()
            .filter(|(folder, _)| {
                normalized.is_empty() || **folder == normalized || folder.starts_with(&child_prefix)
            })
            .map(|(k, v)| (k.as_str(), v))
            .collect()
    }

    /// Rewrite folder paths after a directory rename. Returns whether any
    /// entry moved.
    pub fn rewrite_prefix(&mut self, source: &str, target: &str) -> bool {
        let child_prefix = format!("{source}/");
        let moved: Vec<String> = self
            .folders
            .keys()
            .filter(|k| *k == source || k.starts_with(&child_prefix))
            .cloned()
            .collect();
        for old_path in &moved {
            if let Some(mut record) = self.folders.remove(old_path) {
                let new_path = if old_path == source {
                    target.to_string()
                } else {
                    format!("{target}{}", &old_path[source.len()..])
                };
                record.updated_at = chrono::Utc::now().timestamp();
                self.folders.insert(new_path, record);
            }
        }
        !moved.is_empty()
    }

    pub fn remove(&mut self, path: &str) -> Option<FolderRecord> {
        self.folders.remove(&utils::path::normalize_dir(path))
    }
}

#[derive(Clone)]
pub struct ManifestStore {
    store: GenericObjectStore,
    kv: GenericKvStore,
    cache_ttl: Duration,
}

impl ManifestStore {
    pub fn new(store: GenericObjectStore, kv: GenericKvStore, cache_ttl: Duration) -> Self {
        Self {
            store,
            kv,
            cache_ttl,
        }
    }

    pub async fn load(
        &self,
        owner: &OwnerId,
        kind: ManifestKind,
        cancel: &CancellationToken,
    ) -> Result<FolderManifest, ApiError> {
        let cache_key = kind.cache_key(owner);
        if let Some(cached) = self.kv.get_json::<FolderManifest>(&cache_key).await? {
            return Ok(cached);
        }

        let manifest = match self.store.get(&kind.object_key(owner), None, cancel).await {
            Ok(body) => {
                let raw: Vec<u8> = body
                    .stream
                    .try_fold(Vec::new(), |mut acc, chunk| {
                        acc.extend_from_slice(&chunk);
                        async move { Ok(acc) }
                    })
                    .await
                    .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
                parse_manifest(&raw, owner, kind)
            }
            Err(GatewayError::NotFound) => FolderManifest::default(),
            Err(other) => return Err(other.into()),
        };

        self.kv
            .set_json(&cache_key, &manifest, Some(self.cache_ttl))
            .await?;
        Ok(manifest)
    }

    pub async fn save(
        &self,
        owner: &OwnerId,
        kind: ManifestKind,
        manifest: &FolderManifest,
        cancel: &CancellationToken,
    ) -> Result<(), ApiError> {
        let raw = serde_json::to_vec(manifest)
            .map_err(|e| ApiError::Internal(anyhow::Error::new(e)))?;
        let size = raw.len() as u64;
        let body = futures::stream::once({
            let data = bytes::Bytes::from(raw);
            async move { Ok(data) }
        });
        self.store
            .put(
                &kind.object_key(owner),
                body,
                size,
                &PutOptions {
                    content_type: Some("application/json".to_string()),
                    metadata: None,
                },
                cancel,
            )
            .await?;
        self.kv.delete(&kind.cache_key(owner)).await?;
        Ok(())
    }
}

/// A malformed manifest is treated as empty rather than erroring: the worst
/// outcome is that folders temporarily appear unprotected in listings, and
/// any write will produce a fresh valid document.
fn parse_manifest(raw: &[u8], owner: &OwnerId, kind: ManifestKind) -> FolderManifest {
    match serde_json::from_slice::<FolderManifest>(raw) {
        Ok(parsed) => {
            let folders = parsed
                .folders
                .into_iter()
                .filter(|(_, record)| record.is_complete())
                .map(|(path, record)| (utils::path::normalize_dir(&path), record))
                .collect();
            FolderManifest { folders }
        }
        Err(err) => {
            tracing::warn!("malformed {kind:?} manifest for {owner}: {err}");
            FolderManifest::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::crypto;

    fn record() -> FolderRecord {
        FolderRecord::from_wrapped(&crypto::wrap_folder_key(
            "pass1234",
            &crypto::generate_folder_key(),
        ))
    }

    #[test]
    fn covering_folder_prefers_exact_then_longest_ancestor() {
        let mut manifest = FolderManifest::default();
        manifest.folders.insert("a".to_string(), record());
        manifest.folders.insert("a/b".to_string(), record());

        assert_eq!(manifest.covering_folder("a/b"), Some("a/b"));
        assert_eq!(manifest.covering_folder("a/b/c/d"), Some("a/b"));
        assert_eq!(manifest.covering_folder("a/x"), Some("a"));
        assert_eq!(manifest.covering_folder("elsewhere"), None);
    }

    #[test]
    fn rewrite_prefix_moves_folder_and_children() {
        let mut manifest = FolderManifest::default();
        manifest.folders.insert("docs".to_string(), record());
        manifest.folders.insert("docs/inner".to_string(), record());
        manifest.folders.insert("docsx".to_string(), record());

        assert!(manifest.rewrite_prefix("docs", "archive"));
        let paths: Vec<_> = manifest.folders.keys().cloned().collect();
        assert_eq!(paths, vec!["archive", "archive/inner", "docsx"]);
    }

    #[test]
    fn malformed_manifest_is_empty() {
        let owner = OwnerId::user("u1");
        let manifest = parse_manifest(b"{not json", &owner, ManifestKind::Encrypted);
        assert!(manifest.folders.is_empty());
    }

    #[test]
    fn incomplete_records_are_dropped() {
        let owner = OwnerId::user("u1");
        let raw = serde_json::json!({
            "folders": {
                "good": {
                    "ciphertext": "YQ==", "iv": "YQ==", "authTag": "YQ==",
                    "salt": "YQ==", "createdAt": 1, "updatedAt": 1
                },
                "bad": {
                    "ciphertext": "", "iv": "YQ==", "authTag": "YQ==",
                    "salt": "YQ==", "createdAt": 1, "updatedAt": 1
                }
            }
        });
        let manifest = parse_manifest(
            raw.to_string().as_bytes(),
            &owner,
            ManifestKind::Encrypted,
        );
        assert!(manifest.folders.contains_key("good"));
        assert!(!manifest.folders.contains_key("bad"));
    }

    #[test]
    fn folders_under_includes_self_and_descendants() {
        let mut manifest = FolderManifest::default();
        manifest.folders.insert("a/h1".to_string(), record());
        manifest.folders.insert("a/h1/deep".to_string(), record());
        manifest.folders.insert("b/h2".to_string(), record());

        let under_a: Vec<_> = manifest
            .folders_under("a")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(under_a, vec!["a/h1", "a/h1/deep"]);
    }
}
