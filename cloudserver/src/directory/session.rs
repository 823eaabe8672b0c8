//! Short-lived unlock/reveal sessions, held in the KV store only.
//!
//! A session is written under the matched folder path and under the path the
//! caller originally named, so children of an unlocked folder resolve to the
//! same grant. Validation walks ancestors for the same reason: a descendant
//! folder inherits the session of whichever enclosing path was unlocked.

use std::time::Duration;

use kv_store::GenericKvStore;
use serde::{Deserialize, Serialize};

use crate::cache_keys;
use crate::context::OwnerId;
use crate::directory::crypto;
use crate::error::ApiError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Encrypted,
    Hidden,
}

impl SessionKind {
    fn key(&self, owner: &OwnerId, path: &str) -> String {
        match self {
            Self::Encrypted => cache_keys::encrypted_session(owner, path),
            Self::Hidden => cache_keys::hidden_session(owner, path),
        }
    }

    fn descendants_pattern(&self, owner: &OwnerId, path: &str) -> String {
        match self {
            Self::Encrypted => cache_keys::encrypted_session_descendants_pattern(owner, path),
            Self::Hidden => cache_keys::hidden_session_descendants_pattern(owner, path),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSession {
    pub token: String,
    /// The manifest folder this session unlocks.
    pub folder_path: String,
    /// Unwrapped folder key, base64.
    pub folder_key: String,
    /// Unix seconds.
    pub expires_at: i64,
}

/// What the caller gets back from unlock/reveal.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionGrant {
    pub session_token: String,
    pub expires_at: i64,
    pub ttl_seconds: u64,
}

#[derive(Clone)]
pub struct SessionStore {
    kv: GenericKvStore,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(kv: GenericKvStore, ttl: Duration) -> Self {
        Self { kv, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Mint a fresh session for `folder_path` and store it under that path
    /// and, when different, under the path the caller asked about.
    pub async fn create(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        folder_path: &str,
        requested_path: &str,
        folder_key: &[u8],
    ) -> Result<SessionGrant, ApiError> {
        let session = FolderSession {
            token: crypto::generate_session_token(),
            folder_path: folder_path.to_string(),
            folder_key: base64::encode(folder_key),
            expires_at: chrono::Utc::now().timestamp() + self.ttl.as_secs() as i64,
        };

        self.kv
            .set_json(&kind.key(owner, folder_path), &session, Some(self.ttl))
            .await?;
        if requested_path != folder_path {
            self.kv
                .set_json(&kind.key(owner, requested_path), &session, Some(self.ttl))
                .await?;
        }

        Ok(SessionGrant {
            session_token: session.token,
            expires_at: session.expires_at,
            ttl_seconds: self.ttl.as_secs(),
        })
    }

    /// Look up a session for exactly `path`. Missing, token-mismatched or
    /// expired sessions all come back `None`; expired entries are deleted
    /// on sight.
    pub async fn validate_exact(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        path: &str,
        token: &str,
    ) -> Result<Option<FolderSession>, ApiError> {
        let key = kind.key(owner, path);
        let Some(session) = self.kv.get_json::<FolderSession>(&key).await? else {
            return Ok(None);
        };
        if session.expires_at < chrono::Utc::now().timestamp() {
            self.kv.delete(&key).await?;
            return Ok(None);
        }
        if session.token != token {
            return Ok(None);
        }
        Ok(Some(session))
    }

    /// Like [`Self::validate_exact`] but also tries every ancestor of
    /// `path`, nearest first, so grants made higher up cover descendants.
    pub async fn validate(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        path: &str,
        token: &str,
    ) -> Result<Option<FolderSession>, ApiError> {
        if let Some(session) = self.validate_exact(owner, kind, path, token).await? {
            return Ok(Some(session));
        }
        let normalized = utils::path::normalize_dir(path);
        for ancestor in utils::path::ancestors(&normalized) {
            if let Some(session) = self.validate_exact(owner, kind, ancestor, token).await? {
                return Ok(Some(session));
            }
        }
        Ok(None)
    }

    /// Drop the session at `path` and every descendant session.
    pub async fn revoke_tree(
        &self,
        owner: &OwnerId,
        kind: SessionKind,
        path: &str,
    ) -> Result<(), ApiError> {
        self.kv.delete(&kind.key(owner, path)).await?;
        self.kv
            .delete_by_pattern(&kind.descendants_pattern(owner, path))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SessionStore {
        SessionStore::new(GenericKvStore::memory(), Duration::from_secs(900))
    }

    #[tokio::test]
    async fn create_then_validate() {
        let sessions = store();
        let owner = OwnerId::user("u1");
        let grant = sessions
            .create(&owner, SessionKind::Encrypted, "secret", "secret/sub", b"key")
            .await
            .unwrap();

        // both the matched folder and the requested sub-path resolve
        for path in ["secret", "secret/sub"] {
            let session = sessions
                .validate_exact(&owner, SessionKind::Encrypted, path, &grant.session_token)
                .await
                .unwrap()
                .expect("session should resolve");
            assert_eq!(session.folder_path, "secret");
        }
    }

    #[tokio::test]
    async fn wrong_token_is_rejected() {
        let sessions = store();
        let owner = OwnerId::user("u1");
        sessions
            .create(&owner, SessionKind::Encrypted, "secret", "secret", b"key")
            .await
            .unwrap();
        let resolved = sessions
            .validate_exact(&owner, SessionKind::Encrypted, "secret", "bogus")
            .await
            .unwrap();
        assert!(resolved.is_none());
    }

    #[tokio::test]
    async fn ancestor_walk_covers_descendants() {
        let sessions = store();
        let owner = OwnerId::user("u1");
        let grant = sessions
            .create(&owner, SessionKind::Hidden, "a", "a", b"key")
            .await
            .unwrap();
        let session = sessions
            .validate(&owner, SessionKind::Hidden, "a/h1/deep", &grant.session_token)
            .await
            .unwrap();
        assert!(session.is_some());
    }

    #[tokio::test]
    async fn revoke_tree_clears_descendants_not_siblings() {
        let sessions = store();
        let owner = OwnerId::user("u1");
        let grant = sessions
            .create(&owner, SessionKind::Encrypted, "secret", "secret/sub", b"key")
            .await
            .unwrap();
        let sibling = sessions
            .create(&owner, SessionKind::Encrypted, "secretx", "secretx", b"key")
            .await
            .unwrap();

        sessions
            .revoke_tree(&owner, SessionKind::Encrypted, "secret")
            .await
            .unwrap();

        assert!(sessions
            .validate_exact(&owner, SessionKind::Encrypted, "secret", &grant.session_token)
            .await
            .unwrap()
            .is_none());
        assert!(sessions
            .validate_exact(&owner, SessionKind::Encrypted, "secret/sub", &grant.session_token)
            .await
            .unwrap()
            .is_none());
        assert!(sessions
            .validate_exact(&owner, SessionKind::Encrypted, "secretx", &sibling.session_token)
            .await
            .unwrap()
            .is_some());
    }
}
