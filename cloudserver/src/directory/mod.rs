//! Directory overlay over the flat object store, including encrypted and
//! hidden folders.
//!
//! Directories are synthetic: one exists iff some object lives under its
//! prefix, with a zero-byte placeholder standing in for empty ones. Rename
//! and delete are therefore prefix walks (copy+delete per object); the
//! encrypted/hidden machinery is metadata-only and never touches object
//! bodies.

pub mod crypto;
pub mod manifest;
pub mod session;

use bytes::Bytes;
use kv_store::GenericKvStore;
use object_gateway::{
    CopyOptions, GenericObjectStore, ListRequest, PutOptions,
};
use tokio_util::sync::CancellationToken;

use crate::context::{OwnerId, RequestContext};
use crate::error::ApiError;
use crate::EMPTY_FOLDER_PLACEHOLDER;

pub use manifest::{FolderManifest, FolderRecord, ManifestKind, ManifestStore};
pub use session::{FolderSession, SessionGrant, SessionKind, SessionStore};

const MIN_PASSPHRASE_LEN: usize = 8;

/// Indistinguishable response for "no such folder" and "wrong passphrase";
/// a caller probing paths learns nothing from the error shape.
fn generic_unlock_error() -> ApiError {
    ApiError::BadRequest("invalid passphrase".into())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeleteOutcome {
    pub objects_deleted: u64,
    pub bytes_freed: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectoryFlags {
    pub is_encrypted: bool,
    pub is_locked: bool,
    pub is_hidden: bool,
    pub is_concealed: bool,
}

#[derive(Clone)]
pub struct DirectoryService {
    store: GenericObjectStore,
    manifests: ManifestStore,
    sessions: SessionStore,
}

impl DirectoryService {
    pub fn new(
        store: GenericObjectStore,
        kv: GenericKvStore,
        manifest_cache_ttl: std::time::Duration,
        session_ttl: std::time::Duration,
    ) -> Self {
        Self {
            manifests: ManifestStore::new(store.clone(), kv.clone(), manifest_cache_ttl),
            sessions: SessionStore::new(kv, session_ttl),
            store,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub async fn encrypted_manifest(
        &self,
        owner: &OwnerId,
        cancel: &CancellationToken,
    ) -> Result<FolderManifest, ApiError> {
        self.manifests.load(owner, ManifestKind::Encrypted, cancel).await
    }

    pub async fn hidden_manifest(
        &self,
        owner: &OwnerId,
        cancel: &CancellationToken,
    ) -> Result<FolderManifest, ApiError> {
        self.manifests.load(owner, ManifestKind::Hidden, cancel).await
    }

    fn placeholder_key(owner: &OwnerId, path: &str) -> String {
        utils::path::owner_key(owner.as_str(), [path, EMPTY_FOLDER_PLACEHOLDER])
    }

    fn dir_prefix(owner: &OwnerId, path: &str) -> String {
        format!("{}{}/", owner.key_prefix(), path)
    }

    async fn prefix_has_objects(
        &self,
        prefix: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ApiError> {
        let page = self
            .store
            .list_page(
                &ListRequest {
                    prefix: prefix.to_string(),
                    max_keys: Some(1),
                    ..Default::default()
                },
                cancel,
            )
            .await?;
        Ok(!page.objects.is_empty())
    }

    fn require_passphrase(passphrase: &str) -> Result<(), ApiError> {
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(ApiError::BadRequest(
                "passphrase must be at least 8 characters".into(),
            ));
        }
        Ok(())
    }

    /// Create a directory by writing its placeholder object. With a
    /// passphrase the directory is also registered as encrypted.
    pub async fn create(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        if path.is_empty() {
            return Err(ApiError::BadRequest("invalid directory path".into()));
        }
        let leaf = utils::path::file_name(&path);
        if !utils::path::is_valid_leaf_name(leaf) {
            return Err(ApiError::BadRequest("invalid directory name".into()));
        }

        let mut manifest = None;
        if let Some(passphrase) = passphrase {
            Self::require_passphrase(passphrase)?;
            let loaded = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
            if loaded.contains(&path) {
                return Err(ApiError::Conflict("encrypted folder already exists".into()));
            }
            manifest = Some(loaded);
        }

        self.store
            .put_bytes(
                &Self::placeholder_key(&ctx.owner, &path),
                Bytes::new(),
                &PutOptions::default(),
                &ctx.cancel,
            )
            .await?;

        if let (Some(mut manifest), Some(passphrase)) = (manifest, passphrase) {
            let folder_key = crypto::generate_folder_key();
            let wrapped = crypto::wrap_folder_key(passphrase, &folder_key);
            manifest
                .folders
                .insert(path.clone(), FolderRecord::from_wrapped(&wrapped));
            self.manifests
                .save(&ctx.owner, ManifestKind::Encrypted, &manifest, &ctx.cancel)
                .await?;
        }

        tracing::info!("created directory {path} for {}", ctx.owner);
        Ok(())
    }

    /// Recursive rename: copy every object under the source prefix to the
    /// target prefix, delete the source, then rewrite manifest paths.
    pub async fn rename(
        &self,
        ctx: &RequestContext,
        source: &str,
        new_name: &str,
        allow_encrypted: bool,
    ) -> Result<String, ApiError> {
        let source = utils::path::normalize_dir(source);
        if source.is_empty() {
            return Err(ApiError::BadRequest("invalid directory path".into()));
        }
        if !utils::path::is_valid_leaf_name(new_name) {
            return Err(ApiError::BadRequest("invalid directory name".into()));
        }

        let encrypted = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        if encrypted.covering_folder(&source).is_some() && !allow_encrypted {
            return Err(ApiError::Forbidden(
                "encrypted directories cannot be renamed here".into(),
            ));
        }

        let target = match utils::path::parent_dir(&source) {
            Some(parent) => format!("{parent}/{new_name}"),
            None => new_name.to_string(),
        };
        if target == source {
            return Ok(target);
        }

        let target_prefix = Self::dir_prefix(&ctx.owner, &target);
        if self.prefix_has_objects(&target_prefix, &ctx.cancel).await? {
            return Err(ApiError::Conflict("target directory already exists".into()));
        }

        let source_prefix = Self::dir_prefix(&ctx.owner, &source);
        let mut moved = 0u64;
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: source_prefix.clone(),
                        continuation_token,
                        ..Default::default()
                    },
                    &ctx.cancel,
                )
                .await?;
            for object in &page.objects {
                let suffix = &object.key[source_prefix.len()..];
                let dest = format!("{target_prefix}{suffix}");
                self.store
                    .copy(&object.key, &dest, &CopyOptions::default(), &ctx.cancel)
                    .await?;
                self.store.delete_object(&object.key, &ctx.cancel).await?;
                moved += 1;
            }
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        if moved == 0 {
            return Err(ApiError::directory_not_found());
        }

        for kind in [ManifestKind::Encrypted, ManifestKind::Hidden] {
            let mut manifest = self.manifests.load(&ctx.owner, kind, &ctx.cancel).await?;
            if manifest.rewrite_prefix(&source, &target) {
                self.manifests
                    .save(&ctx.owner, kind, &manifest, &ctx.cancel)
                    .await?;
            }
        }

        tracing::info!(
            "renamed directory {source} -> {target} for {} ({moved} objects)",
            ctx.owner
        );
        Ok(target)
    }

    /// Recursive delete. For an encrypted directory the passphrase is
    /// verified before anything is removed.
    pub async fn delete(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: Option<&str>,
    ) -> Result<DeleteOutcome, ApiError> {
        let path = utils::path::normalize_dir(path);
        if path.is_empty() {
            return Err(ApiError::BadRequest("invalid directory path".into()));
        }

        let encrypted = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        if let Some(record) = encrypted.folders.get(&path) {
            let passphrase = passphrase.ok_or_else(generic_unlock_error)?;
            let wrapped = record.to_wrapped().ok_or_else(generic_unlock_error)?;
            crypto::unwrap_folder_key(passphrase, &wrapped)
                .map_err(|_| generic_unlock_error())?;
        }

        let prefix = Self::dir_prefix(&ctx.owner, &path);
        let mut outcome = DeleteOutcome::default();
        let mut continuation_token = None;
        loop {
            let page = self
                .store
                .list_page(
                    &ListRequest {
                        prefix: prefix.clone(),
                        continuation_token,
                        ..Default::default()
                    },
                    &ctx.cancel,
                )
                .await?;
            for object in &page.objects {
                outcome.bytes_freed += object.size;
                self.store.delete_object(&object.key, &ctx.cancel).await?;
                outcome.objects_deleted += 1;
            }
            match page.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        if outcome.objects_deleted == 0 {
            return Err(ApiError::directory_not_found());
        }

        // Drop manifest entries for the directory and anything under it.
        let child_prefix = format!("{path}/");
        for kind in [ManifestKind::Encrypted, ManifestKind::Hidden] {
            let mut manifest = self.manifests.load(&ctx.owner, kind, &ctx.cancel).await?;
            let before = manifest.folders.len();
            manifest
                .folders
                .retain(|folder, _| folder != &path && !folder.starts_with(&child_prefix));
            if manifest.folders.len() != before {
                self.manifests
                    .save(&ctx.owner, kind, &manifest, &ctx.cancel)
                    .await?;
            }
        }
        for kind in [SessionKind::Encrypted, SessionKind::Hidden] {
            self.sessions.revoke_tree(&ctx.owner, kind, &path).await?;
        }

        tracing::info!(
            "deleted directory {path} for {} ({} objects, {} bytes)",
            ctx.owner,
            outcome.objects_deleted,
            outcome.bytes_freed
        );
        Ok(outcome)
    }

    /// Convert an existing, non-empty directory into an encrypted one.
    pub async fn encrypt(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        Self::require_passphrase(passphrase)?;

        let mut manifest = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        if manifest.contains(&path) {
            return Err(ApiError::Conflict("folder is already encrypted".into()));
        }
        let prefix = Self::dir_prefix(&ctx.owner, &path);
        if !self.prefix_has_objects(&prefix, &ctx.cancel).await? {
            return Err(ApiError::directory_not_found());
        }

        let folder_key = crypto::generate_folder_key();
        let wrapped = crypto::wrap_folder_key(passphrase, &folder_key);
        manifest
            .folders
            .insert(path, FolderRecord::from_wrapped(&wrapped));
        self.manifests
            .save(&ctx.owner, ManifestKind::Encrypted, &manifest, &ctx.cancel)
            .await
    }

    /// Remove encryption from a folder after verifying the passphrase.
    /// Objects are untouched; this is a metadata operation only.
    pub async fn decrypt(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        let mut manifest = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        let record = manifest
            .folders
            .get(&path)
            .ok_or_else(generic_unlock_error)?;
        let wrapped = record.to_wrapped().ok_or_else(generic_unlock_error)?;
        crypto::unwrap_folder_key(passphrase, &wrapped).map_err(|_| generic_unlock_error())?;

        manifest.remove(&path);
        self.manifests
            .save(&ctx.owner, ManifestKind::Encrypted, &manifest, &ctx.cancel)
            .await?;
        self.sessions
            .revoke_tree(&ctx.owner, SessionKind::Encrypted, &path)
            .await
    }

    /// Unlock an encrypted folder (exact match or nearest encrypting
    /// ancestor) and mint a session.
    pub async fn unlock(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<SessionGrant, ApiError> {
        let path = utils::path::normalize_dir(path);
        let manifest = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        let folder = manifest
            .covering_folder(&path)
            .ok_or_else(generic_unlock_error)?
            .to_string();
        let record = manifest
            .folders
            .get(&folder)
            .ok_or_else(generic_unlock_error)?;
        let wrapped = record.to_wrapped().ok_or_else(generic_unlock_error)?;
        let folder_key =
            crypto::unwrap_folder_key(passphrase, &wrapped).map_err(|_| generic_unlock_error())?;

        self.sessions
            .create(&ctx.owner, SessionKind::Encrypted, &folder, &path, &folder_key)
            .await
    }

    pub async fn lock(&self, ctx: &RequestContext, path: &str) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        self.sessions
            .revoke_tree(&ctx.owner, SessionKind::Encrypted, &path)
            .await
    }

    /// Register a folder as hidden.
    pub async fn hide(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        Self::require_passphrase(passphrase)?;

        let mut manifest = self.hidden_manifest(&ctx.owner, &ctx.cancel).await?;
        if manifest.contains(&path) {
            return Err(ApiError::Conflict("folder is already hidden".into()));
        }
        let prefix = Self::dir_prefix(&ctx.owner, &path);
        if !self.prefix_has_objects(&prefix, &ctx.cancel).await? {
            return Err(ApiError::directory_not_found());
        }

        let folder_key = crypto::generate_folder_key();
        let wrapped = crypto::wrap_folder_key(passphrase, &folder_key);
        manifest
            .folders
            .insert(path, FolderRecord::from_wrapped(&wrapped));
        self.manifests
            .save(&ctx.owner, ManifestKind::Hidden, &manifest, &ctx.cancel)
            .await
    }

    pub async fn unhide(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        let mut manifest = self.hidden_manifest(&ctx.owner, &ctx.cancel).await?;
        let record = manifest
            .folders
            .get(&path)
            .ok_or_else(generic_unlock_error)?;
        let wrapped = record.to_wrapped().ok_or_else(generic_unlock_error)?;
        crypto::unwrap_folder_key(passphrase, &wrapped).map_err(|_| generic_unlock_error())?;

        manifest.remove(&path);
        self.manifests
            .save(&ctx.owner, ManifestKind::Hidden, &manifest, &ctx.cancel)
            .await?;
        self.sessions
            .revoke_tree(&ctx.owner, SessionKind::Hidden, &path)
            .await
    }

    /// Reveal hidden folders. Resolution order: the path itself or a hiding
    /// ancestor; failing that, any hidden descendant of the path that the
    /// passphrase unlocks. One session covers everything it unlocked.
    pub async fn reveal(
        &self,
        ctx: &RequestContext,
        path: &str,
        passphrase: &str,
    ) -> Result<SessionGrant, ApiError> {
        let path = utils::path::normalize_dir(path);
        let manifest = self.hidden_manifest(&ctx.owner, &ctx.cancel).await?;

        if let Some(folder) = manifest.covering_folder(&path) {
            let folder = folder.to_string();
            let record = manifest
                .folders
                .get(&folder)
                .ok_or_else(generic_unlock_error)?;
            let wrapped = record.to_wrapped().ok_or_else(generic_unlock_error)?;
            let folder_key = crypto::unwrap_folder_key(passphrase, &wrapped)
                .map_err(|_| generic_unlock_error())?;
            return self
                .sessions
                .create(&ctx.owner, SessionKind::Hidden, &folder, &path, &folder_key)
                .await;
        }

        // No match at or above the path: look below it. The session is
        // anchored at the requested path, so the ancestor walk during
        // validation covers every unlocked descendant.
        for (_, record) in manifest.folders_under(&path) {
            let Some(wrapped) = record.to_wrapped() else {
                continue;
            };
            if let Ok(folder_key) = crypto::unwrap_folder_key(passphrase, &wrapped) {
                return self
                    .sessions
                    .create(&ctx.owner, SessionKind::Hidden, &path, &path, &folder_key)
                    .await;
            }
        }
        Err(generic_unlock_error())
    }

    pub async fn conceal(&self, ctx: &RequestContext, path: &str) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        self.sessions
            .revoke_tree(&ctx.owner, SessionKind::Hidden, &path)
            .await
    }

    /// Deny any operation that names a path inside a locked encrypted
    /// folder. A missing or invalid token on a covered path is forbidden;
    /// uncovered paths always pass.
    pub async fn access_check(&self, ctx: &RequestContext, path: &str) -> Result<(), ApiError> {
        let path = utils::path::normalize_dir(path);
        let manifest = self.encrypted_manifest(&ctx.owner, &ctx.cancel).await?;
        let Some(folder) = manifest.covering_folder(&path) else {
            return Ok(());
        };
        let Some(token) = ctx.folder_session.as_deref() else {
            return Err(ApiError::Forbidden("folder is locked".into()));
        };
        match self
            .sessions
            .validate(&ctx.owner, SessionKind::Encrypted, folder, token)
            .await?
        {
            Some(_) => Ok(()),
            None => Err(ApiError::Forbidden("folder is locked".into())),
        }
    }

    /// Flags for one directory in a listing. `is_locked`/`is_concealed`
    /// reflect whether the caller's tokens currently validate.
    pub async fn classify(
        &self,
        ctx: &RequestContext,
        dir_path: &str,
        encrypted: &FolderManifest,
        hidden: &FolderManifest,
    ) -> Result<DirectoryFlags, ApiError> {
        let mut flags = DirectoryFlags {
            is_encrypted: encrypted.contains(dir_path),
            is_hidden: hidden.contains(dir_path),
            ..Default::default()
        };
        if flags.is_encrypted {
            flags.is_locked = match ctx.folder_session.as_deref() {
                Some(token) => self
                    .sessions
                    .validate(&ctx.owner, SessionKind::Encrypted, dir_path, token)
                    .await?
                    .is_none(),
                None => true,
            };
        }
        if flags.is_hidden {
            flags.is_concealed = match ctx.hidden_session.as_deref() {
                Some(token) => self
                    .sessions
                    .validate(&ctx.owner, SessionKind::Hidden, dir_path, token)
                    .await?
                    .is_none(),
                None => true,
            };
        }
        Ok(flags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_gateway::{GatewayConfig, MemGateway};
    use std::sync::Arc;
    use std::time::Duration;

    fn fixtures() -> (GenericObjectStore, Arc<MemGateway>, DirectoryService) {
        let mem = Arc::new(MemGateway::new(GatewayConfig::default()));
        let store = GenericObjectStore::InMemory(mem.clone());
        let service = DirectoryService::new(
            store.clone(),
            GenericKvStore::memory(),
            Duration::from_secs(600),
            Duration::from_secs(900),
        );
        (store, mem, service)
    }

    fn ctx() -> RequestContext {
        RequestContext::new(OwnerId::user("u1"))
    }

    async fn put(store: &GenericObjectStore, key: &str, len: usize) {
        store
            .put_bytes(
                key,
                Bytes::from(vec![7u8; len]),
                &PutOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_writes_placeholder() {
        let (_store, mem, service) = fixtures();
        service.create(&ctx(), "docs", None).await.unwrap();
        assert_eq!(mem.all_keys(), vec!["u1/docs/.emptyFolderPlaceholder"]);
    }

    #[tokio::test]
    async fn rename_moves_every_object_and_clears_source() {
        let (store, mem, service) = fixtures();
        put(&store, "u1/a/b/x", 1).await;
        put(&store, "u1/a/b/y", 2).await;
        put(&store, "u1/a/c/z", 4).await;

        let target = service.rename(&ctx(), "a", "a2", false).await.unwrap();
        assert_eq!(target, "a2");

        let keys = mem.all_keys();
        assert_eq!(keys, vec!["u1/a2/b/x", "u1/a2/b/y", "u1/a2/c/z"]);
    }

    #[tokio::test]
    async fn rename_into_existing_target_conflicts() {
        let (store, _mem, service) = fixtures();
        put(&store, "u1/a/x", 1).await;
        put(&store, "u1/a2/y", 1).await;
        let err = service.rename(&ctx(), "a", "a2", false).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }

    #[tokio::test]
    async fn rename_missing_directory_is_not_found() {
        let (_store, _mem, service) = fixtures();
        let err = service.rename(&ctx(), "ghost", "g2", false).await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn delete_counts_bytes() {
        let (store, mem, service) = fixtures();
        put(&store, "u1/d/x", 10).await;
        put(&store, "u1/d/sub/y", 20).await;
        let outcome = service.delete(&ctx(), "d", None).await.unwrap();
        assert_eq!(outcome.objects_deleted, 2);
        assert_eq!(outcome.bytes_freed, 30);
        assert!(mem.all_keys().is_empty());
    }

    #[tokio::test]
    async fn encrypted_create_unlock_lock_cycle() {
        let (_store, _mem, service) = fixtures();
        let ctx = ctx();
        service.create(&ctx, "secret", Some("pass1234")).await.unwrap();

        // duplicate encrypted path conflicts
        let err = service
            .create(&ctx, "secret", Some("pass1234"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);

        // wrong passphrase is a generic bad request
        let err = service.unlock(&ctx, "secret", "wrong999").await.unwrap_err();
        assert_eq!(err.status_code(), 400);

        let grant = service.unlock(&ctx, "secret", "pass1234").await.unwrap();
        assert_eq!(grant.ttl_seconds, 900);

        // with the token, access passes; after lock it is denied again
        let authed = RequestContext::new(OwnerId::user("u1"))
            .with_folder_session(grant.session_token.clone());
        service.access_check(&authed, "secret/inner").await.unwrap();

        service.lock(&authed, "secret").await.unwrap();
        let err = service
            .access_check(&authed, "secret/inner")
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }

    #[tokio::test]
    async fn unlock_resolves_ancestors() {
        let (_store, _mem, service) = fixtures();
        let ctx = ctx();
        service.create(&ctx, "vault", Some("pass1234")).await.unwrap();
        let grant = service
            .unlock(&ctx, "vault/deep/child", "pass1234")
            .await
            .unwrap();
        // the session resolves for the child path it was requested under
        let session = service
            .sessions()
            .validate(
                &ctx.owner,
                SessionKind::Encrypted,
                "vault/deep/child",
                &grant.session_token,
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.folder_path, "vault");
    }

    #[tokio::test]
    async fn delete_encrypted_requires_passphrase() {
        let (store, _mem, service) = fixtures();
        let ctx = ctx();
        service.create(&ctx, "secret", Some("pass1234")).await.unwrap();
        put(&store, "u1/secret/file", 5).await;

        let err = service.delete(&ctx, "secret", None).await.unwrap_err();
        assert_eq!(err.status_code(), 400);
        let err = service
            .delete(&ctx, "secret", Some("nope_nope"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 400);

        let outcome = service
            .delete(&ctx, "secret", Some("pass1234"))
            .await
            .unwrap();
        assert_eq!(outcome.objects_deleted, 2);

        // manifest entry is gone: recreating does not conflict
        service.create(&ctx, "secret", Some("pass1234")).await.unwrap();
    }

    #[tokio::test]
    async fn rename_rewrites_manifest_paths() {
        let (store, _mem, service) = fixtures();
        let ctx = ctx();
        put(&store, "u1/top/enc/file", 1).await;
        service.encrypt(&ctx, "top/enc", "pass1234").await.unwrap();

        service.rename(&ctx, "top", "moved", false).await.unwrap();
        let manifest = service
            .encrypted_manifest(&ctx.owner, &ctx.cancel)
            .await
            .unwrap();
        assert!(manifest.contains("moved/enc"));
        assert!(!manifest.contains("top/enc"));
    }

    #[tokio::test]
    async fn hidden_reveal_finds_descendants() {
        let (store, _mem, service) = fixtures();
        let ctx = ctx();
        put(&store, "u1/photos/private/x", 1).await;
        service.hide(&ctx, "photos/private", "hush12345").await.unwrap();

        // revealing the parent path with the right passphrase works via
        // descendant search
        let grant = service.reveal(&ctx, "photos", "hush12345").await.unwrap();
        let authed = RequestContext::new(OwnerId::user("u1"))
            .with_hidden_session(grant.session_token.clone());
        let hidden = service.hidden_manifest(&ctx.owner, &ctx.cancel).await.unwrap();
        let encrypted = service
            .encrypted_manifest(&ctx.owner, &ctx.cancel)
            .await
            .unwrap();
        let flags = service
            .classify(&authed, "photos/private", &encrypted, &hidden)
            .await
            .unwrap();
        assert!(flags.is_hidden);
        assert!(!flags.is_concealed);

        // wrong passphrase reveals nothing
        let err = service.reveal(&ctx, "photos", "wrongpass").await.unwrap_err();
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn hide_twice_conflicts() {
        let (store, _mem, service) = fixtures();
        let ctx = ctx();
        put(&store, "u1/p/x", 1).await;
        service.hide(&ctx, "p", "hush12345").await.unwrap();
        let err = service.hide(&ctx, "p", "hush12345").await.unwrap_err();
        assert_eq!(err.status_code(), 409);
    }
}
