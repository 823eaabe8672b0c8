//! End-to-end scenarios against the in-memory object store and KV backends:
//! the full service wired exactly as in production, minus the network.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cloudserver::archive::queue::JobState;
use cloudserver::archive::ArchiveFormat;
use cloudserver::config::{
    ArchiveConfig, AvConfig, Config, ExtractLimits, ListingConfig, PresignConfig,
};
use cloudserver::context::{OwnerId, RequestContext};
use cloudserver::listing::search::SearchRequest;
use cloudserver::service::CloudService;
use cloudserver::usage::{StaticSubscriptions, Subscription};
use kv_store::GenericKvStore;
use object_gateway::{GatewayConfig, GenericObjectStore, MemGateway, PartSpec, PutOptions};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use zip::write::SimpleFileOptions;

struct TestEnv {
    service: Arc<CloudService>,
    store: GenericObjectStore,
    mem: Arc<MemGateway>,
    kv: GenericKvStore,
    shutdown: CancellationToken,
}

impl Drop for TestEnv {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn test_config() -> Config {
    Config {
        gateway: GatewayConfig::default(),
        redis_url: None,
        presign: PresignConfig {
            enabled: true,
            expiry: Duration::from_secs(3600),
            max_expiry: Duration::from_secs(86400),
        },
        listing: ListingConfig {
            metadata_max: 1000,
            metadata_concurrency: 5,
            cache_ttl: Duration::from_secs(3600),
            thumbnail_cache_ttl: Duration::from_secs(3600),
            search_scan_max: 10_000,
        },
        archive: ArchiveConfig {
            extract_job_concurrency: 1,
            create_job_concurrency: 1,
            entry_concurrency: 3,
            progress_entries_step: 5,
            progress_bytes_step: 5 * 1024 * 1024,
            extract_limits: ExtractLimits {
                max_entries: 10_000,
                max_entry_bytes: 64 * 1024 * 1024,
                max_total_bytes: 256 * 1024 * 1024,
                max_compression_ratio: 100.0,
            },
            create_max_files: 10_000,
            create_max_total_bytes: 256 * 1024 * 1024,
            preview_max_bytes: 64 * 1024 * 1024,
            rar_max_buffer_bytes: 16 * 1024 * 1024,
            cancel_flag_ttl: Duration::from_secs(6 * 3600),
            result_ttl: Duration::from_secs(3600),
        },
        av: AvConfig {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 3310,
            max_scan_bytes: 1024 * 1024,
            socket_timeout: Duration::from_secs(1),
            concurrency: 1,
        },
        session_ttl: Duration::from_secs(900),
        manifest_cache_ttl: Duration::from_secs(600),
        idempotency_ttl: Duration::from_secs(300),
    }
}

fn env_with(config: Config) -> TestEnv {
    let mem = Arc::new(MemGateway::new(GatewayConfig {
        concurrency_limit: NonZeroUsize::new(100).unwrap(),
        ..GatewayConfig::default()
    }));
    let store = GenericObjectStore::InMemory(mem.clone());
    let kv = GenericKvStore::memory();
    let shutdown = CancellationToken::new();
    let subscriptions = Arc::new(StaticSubscriptions(Subscription::default()));
    let service = CloudService::new(
        config,
        store.clone(),
        kv.clone(),
        subscriptions,
        &shutdown,
    );
    service.spawn_workers(&shutdown);
    TestEnv {
        service,
        store,
        mem,
        kv,
        shutdown,
    }
}

fn env() -> TestEnv {
    env_with(test_config())
}

fn ctx(user: &str) -> RequestContext {
    RequestContext::new(OwnerId::user(user))
}

async fn put(store: &GenericObjectStore, key: &str, body: &[u8]) {
    store
        .put_bytes(
            key,
            Bytes::copy_from_slice(body),
            &PutOptions::default(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
}

fn zip_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (path, data) in entries {
        writer.start_file(*path, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

async fn wait_for_extract_terminal(
    env: &TestEnv,
    ctx: &RequestContext,
    job_id: &str,
) -> cloudserver::archive::orchestrator::JobStatus {
    for _ in 0..200 {
        let status = env
            .service
            .archive_extract_status(ctx, job_id)
            .await
            .unwrap();
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("extract job {job_id} did not reach a terminal state");
}

async fn wait_for_create_terminal(
    env: &TestEnv,
    ctx: &RequestContext,
    job_id: &str,
) -> cloudserver::archive::orchestrator::JobStatus {
    for _ in 0..200 {
        let status = env
            .service
            .archive_create_status(ctx, job_id)
            .await
            .unwrap();
        if status.state.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("create job {job_id} did not reach a terminal state");
}

// ---- scenario 1: nested directory rename --------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn nested_rename_moves_everything_and_drops_listing_cache() {
    let env = env();
    let ctx = ctx("u1");
    put(&env.store, "u1/a/b/x", &[1]).await;
    put(&env.store, "u1/a/b/y", &[1, 2]).await;
    put(&env.store, "u1/a/c/z", &[1, 2, 3, 4]).await;

    // warm the listing cache so invalidation is observable
    env.service.list(&ctx, "", true, false).await.unwrap();
    assert!(!env.kv.find_keys("cloud:list:u1:*").await.unwrap().is_empty());

    env.service
        .rename_directory(&ctx, "a", "a2", false)
        .await
        .unwrap();

    assert_eq!(
        env.mem.all_keys(),
        vec!["u1/a2/b/x", "u1/a2/b/y", "u1/a2/c/z"]
    );
    assert!(env.kv.find_keys("cloud:list:u1:*").await.unwrap().is_empty());

    // sizes preserved
    let cancel = CancellationToken::new();
    assert_eq!(env.store.head("u1/a2/c/z", &cancel).await.unwrap().size, 4);
}

// ---- scenario 2: encrypted folder unlock & list --------------------------

#[tokio::test(flavor = "multi_thread")]
async fn encrypted_folder_lifecycle() {
    let env = env();
    let ctx = ctx("u1");
    env.service
        .create_directory(&ctx, "secret", Some("pass1234"))
        .await
        .unwrap();

    // without a session the folder lists as locked, with no thumbnails
    let listing = env.service.list(&ctx, "", true, false).await.unwrap();
    let dir = listing
        .directories
        .iter()
        .find(|d| d.prefix == "secret")
        .expect("secret directory should be listed");
    assert!(dir.is_encrypted);
    assert!(dir.is_locked);
    assert!(dir.thumbnails.is_empty());

    // wrong passphrase is a generic bad request
    let err = env
        .service
        .unlock_directory(&ctx, "secret", "wrong999")
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);

    let grant = env
        .service
        .unlock_directory(&ctx, "secret", "pass1234")
        .await
        .unwrap();
    assert_eq!(grant.ttl_seconds, 900);
    let now = chrono::Utc::now().timestamp();
    assert!((grant.expires_at - now - 900).abs() <= 2);

    let authed =
        RequestContext::new(OwnerId::user("u1")).with_folder_session(grant.session_token);
    let listing = env.service.list(&authed, "", true, false).await.unwrap();
    let dir = listing
        .directories
        .iter()
        .find(|d| d.prefix == "secret")
        .unwrap();
    assert!(!dir.is_locked);

    // naming a path inside the locked folder without a token is denied
    let err = env.service.list(&ctx, "secret", true, false).await.unwrap_err();
    assert_eq!(err.status_code(), 403);
    env.service.list(&authed, "secret", true, false).await.unwrap();
}

// ---- scenario 3: zip bomb rejection --------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn zip_bomb_extract_is_rejected_without_writes() {
    let env = env();
    let ctx = ctx("u1");

    // 16 MiB of zeros deflates to a few KiB: ratio far beyond 100
    let bomb = zip_fixture(&[("bomb.bin", &vec![0u8; 16 << 20])]);
    put(&env.store, "u1/bomb.zip", &bomb).await;

    // seed the usage counter so a drift would be visible
    let usage_before = env.service.storage_usage(&ctx).await.unwrap().used_bytes;

    let job_id = env
        .service
        .archive_extract_start(&ctx, "bomb.zip", None, None)
        .await
        .unwrap();
    let status = wait_for_extract_terminal(&env, &ctx, &job_id).await;
    assert_eq!(status.state, JobState::Failed);
    assert!(status
        .failed_reason
        .as_deref()
        .unwrap()
        .contains("compression ratio"));

    // nothing landed under the extract prefix
    assert!(env
        .mem
        .all_keys()
        .iter()
        .all(|k| !k.starts_with("u1/bomb/")));

    let usage_after = env.service.storage_usage(&ctx).await.unwrap().used_bytes;
    assert_eq!(usage_before, usage_after);
}

// ---- scenario 4: archive entry path escape -------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn path_escape_entries_are_skipped() {
    let env = env();
    let ctx = ctx("u1");

    let archive = zip_fixture(&[
        ("../evil.txt", b"gotcha"),
        ("ok.txt", b"fine"),
        ("/abs.txt", b"nope"),
    ]);
    put(&env.store, "u1/esc.zip", &archive).await;

    let job_id = env
        .service
        .archive_extract_start(&ctx, "esc.zip", None, None)
        .await
        .unwrap();
    let status = wait_for_extract_terminal(&env, &ctx, &job_id).await;
    assert_eq!(status.state, JobState::Completed);

    let keys = env.mem.all_keys();
    assert!(keys.iter().all(|k| !k.contains("..")));
    assert!(keys.iter().all(|k| !k.contains("evil")));
    assert!(keys.iter().all(|k| !k.contains("abs")));
    assert!(keys.contains(&"u1/esc/ok.txt".to_string()));

    let cancel = CancellationToken::new();
    assert_eq!(env.store.head("u1/esc/ok.txt", &cancel).await.unwrap().size, 4);
}

// ---- scenario 5: idempotent upload completion ----------------------------

#[tokio::test(flavor = "multi_thread")]
async fn upload_complete_is_idempotent() {
    let env = env();
    let base = ctx("u1");
    let created = env
        .service
        .upload_create(&base, "docs/report.bin", None, None)
        .await
        .unwrap();
    let etag = env
        .service
        .upload_part(
            &base,
            &created.key,
            &created.upload_id,
            1,
            Bytes::from_static(b"payload"),
            None,
        )
        .await
        .unwrap();

    let idem = RequestContext::new(OwnerId::user("u1")).with_idempotency_key("K1");
    let parts = vec![PartSpec {
        part_number: 1,
        etag,
    }];
    let first = env
        .service
        .upload_complete(&idem, &created.key, &created.upload_id, &parts)
        .await
        .unwrap();
    assert_eq!(first.key, "docs/report.bin");
    assert!(!first.etag.is_empty());

    // the multipart session is gone, so only a cached replay can answer
    let second = env
        .service
        .upload_complete(&idem, &created.key, &created.upload_id, &parts)
        .await
        .unwrap();
    assert_eq!(second.etag, first.etag);
    assert_eq!(second.location, first.location);
    assert_eq!(second.size, first.size);

    // a different idempotency key is not a replay and fails on the dead
    // upload session
    let other = RequestContext::new(OwnerId::user("u1")).with_idempotency_key("K2");
    assert!(env
        .service
        .upload_complete(&other, &created.key, &created.upload_id, &parts)
        .await
        .is_err());
}

// ---- scenario 6: search pagination ---------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn search_pagination_and_directory_counting() {
    let env = env();
    let ctx = ctx("u1");
    for i in 0..20 {
        put(
            &env.store,
            &format!("u1/stuff/item-{i:02}.txt", i = i),
            b"x",
        )
        .await;
    }
    // several children inside one directory whose name matches
    put(&env.store, "u1/itembox/a.txt", b"x").await;
    put(&env.store, "u1/itembox/b.txt", b"x").await;

    let results = env
        .service
        .search(
            &ctx,
            &SearchRequest {
                query: "item".to_string(),
                path: None,
                extension: None,
                skip: 5,
                take: 3,
            },
        )
        .await
        .unwrap();

    assert_eq!(results.total_count, 20);
    assert_eq!(results.objects.len(), 3);
    // insertion order: the 6th, 7th and 8th match
    assert_eq!(results.objects[0].name, "item-05.txt");
    assert_eq!(results.objects[1].name, "item-06.txt");
    assert_eq!(results.objects[2].name, "item-07.txt");

    // the itembox directory matched once, despite two children
    assert_eq!(results.total_directory_count, 1);
    assert_eq!(results.directories[0].prefix, "itembox");

    // extension filter
    let none = env
        .service
        .search(
            &ctx,
            &SearchRequest {
                query: "item".to_string(),
                path: None,
                extension: Some("pdf".to_string()),
                skip: 0,
                take: 10,
            },
        )
        .await
        .unwrap();
    assert_eq!(none.total_count, 0);

    // too-short queries are rejected
    let err = env
        .service
        .search(
            &ctx,
            &SearchRequest {
                query: "i".to_string(),
                path: None,
                extension: None,
                skip: 0,
                take: 10,
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 400);
}

// ---- owner isolation -----------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn owners_never_mix() {
    let env = env();
    let u1 = ctx("u1");
    let u2 = ctx("u2");
    put(&env.store, "u1/private.txt", b"mine").await;
    put(&env.store, "u2/other.txt", b"theirs").await;

    let listing = env.service.list(&u1, "", true, false).await.unwrap();
    assert_eq!(listing.objects.len(), 1);
    assert_eq!(listing.objects[0].name, "private.txt");

    // u2's invalidation leaves u1's cache entries alone
    env.service.list(&u2, "", true, false).await.unwrap();
    env.service
        .delete_objects(&u2, &["other.txt".to_string()])
        .await
        .unwrap();
    assert!(!env.kv.find_keys("cloud:list:u1:*").await.unwrap().is_empty());
    assert!(env.kv.find_keys("cloud:list:u2:*").await.unwrap().is_empty());

    // usage is per owner
    assert_eq!(env.service.storage_usage(&u1).await.unwrap().used_bytes, 4);
    assert_eq!(env.service.storage_usage(&u2).await.unwrap().used_bytes, 0);
}

// ---- archive create end to end -------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn archive_create_builds_and_publishes_result() {
    let env = env();
    let req_ctx = ctx("u1");
    put(&env.store, "u1/docs/a.txt", b"alpha").await;
    put(&env.store, "u1/docs/sub/b.txt", b"beta").await;
    put(&env.store, "u1/single.txt", b"solo").await;

    let job_id = env
        .service
        .archive_create_start(
            &req_ctx,
            vec!["docs".to_string(), "single.txt".to_string()],
            ArchiveFormat::Zip,
            Some("bundle"),
        )
        .await
        .unwrap();

    let status = wait_for_create_terminal(&env, &req_ctx, &job_id).await;
    assert_eq!(status.state, JobState::Completed);
    let result = status.result.expect("create result should be cached");
    assert!(result.archive_key.starts_with(".archives/"));
    assert!(result.archive_key.ends_with("bundle.zip"));
    assert!(result.archive_size > 0);

    // the archive exists and previews back to the original entries
    let entries = env
        .service
        .archive_preview(&req_ctx, &result.archive_key, None)
        .await
        .unwrap();
    let mut paths: Vec<_> = entries.iter().map(|e| e.path.clone()).collect();
    paths.sort();
    assert_eq!(paths, vec!["docs/a.txt", "docs/sub/b.txt", "single.txt"]);

    // another owner cannot see the job
    let other = ctx("u2");
    let err = env
        .service
        .archive_create_status(&other, &job_id)
        .await
        .unwrap_err();
    assert_eq!(err.status_code(), 403);
}

// ---- extract end to end with usage accounting ----------------------------

#[tokio::test(flavor = "multi_thread")]
async fn extract_writes_entries_and_accounts_usage() {
    let env = env();
    let ctx = ctx("u1");

    let archive = zip_fixture(&[
        ("photos/one.txt", b"11111"),
        ("photos/two.txt", b"222"),
    ]);
    put(&env.store, "u1/photos.zip", &archive).await;
    let baseline = env.service.storage_usage(&ctx).await.unwrap().used_bytes;

    let job_id = env
        .service
        .archive_extract_start(&ctx, "photos.zip", Some(ArchiveFormat::Zip), None)
        .await
        .unwrap();
    let status = wait_for_extract_terminal(&env, &ctx, &job_id).await;
    assert_eq!(status.state, JobState::Completed);

    // the archive's own top-level folder matches the base name, so it is
    // stripped rather than nested twice
    let keys = env.mem.all_keys();
    assert!(keys.contains(&"u1/photos/one.txt".to_string()));
    assert!(keys.contains(&"u1/photos/two.txt".to_string()));

    let after = env.service.storage_usage(&ctx).await.unwrap().used_bytes;
    assert_eq!(after, baseline + 8);

    // cancel of a finished job is a no-op flag write, not an error
    env.service
        .archive_extract_cancel(&ctx, &job_id)
        .await
        .unwrap();
}

// ---- directory placeholder behavior --------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn empty_directories_are_listable_but_placeholder_is_hidden() {
    let env = env();
    let ctx = ctx("u1");
    env.service.create_directory(&ctx, "empty", None).await.unwrap();

    let listing = env.service.list(&ctx, "", true, false).await.unwrap();
    assert!(listing.directories.iter().any(|d| d.prefix == "empty"));

    let inner = env.service.list(&ctx, "empty", true, false).await.unwrap();
    assert!(inner.objects.is_empty());
    assert!(inner.directories.is_empty());
}

// ---- hidden folders ------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn hidden_folders_vanish_until_revealed() {
    let env = env();
    let ctx = ctx("u1");
    put(&env.store, "u1/priv/secret.txt", b"shh").await;
    env.service
        .hide_directory(&ctx, "priv", "hush12345")
        .await
        .unwrap();

    let listing = env.service.list(&ctx, "", true, false).await.unwrap();
    assert!(listing.directories.iter().all(|d| d.prefix != "priv"));

    let grant = env
        .service
        .reveal_directory(&ctx, "priv", "hush12345")
        .await
        .unwrap();
    let authed =
        RequestContext::new(OwnerId::user("u1")).with_hidden_session(grant.session_token);
    let listing = env.service.list(&authed, "", true, false).await.unwrap();
    let dir = listing
        .directories
        .iter()
        .find(|d| d.prefix == "priv")
        .expect("revealed directory should be listed");
    assert!(dir.is_hidden);
    assert!(!dir.is_concealed);

    env.service.conceal_directory(&ctx, "priv").await.unwrap();
    let listing = env.service.list(&authed, "", true, false).await.unwrap();
    assert!(listing.directories.iter().all(|d| d.prefix != "priv"));
}
