use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use cloudserver::config::Config;
use cloudserver::service::CloudService;
use cloudserver::usage::{StaticSubscriptions, Subscription};
use kv_store::GenericKvStore;
use object_gateway::{GatewayConfig, GenericObjectStore, MemGateway, S3Gateway};
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Run against in-memory storage and KV backends instead of S3/Redis.
    /// Only useful for local development; nothing survives a restart.
    #[arg(long, default_value = "false")]
    in_memory: bool,
}

fn main() -> anyhow::Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async_main())
}

async fn async_main() -> anyhow::Result<()> {
    utils::logging::init();

    let args = Cli::parse();
    let config = Config::from_env();

    let store = if args.in_memory {
        tracing::warn!("running with in-memory object storage");
        GenericObjectStore::InMemory(Arc::new(MemGateway::new(GatewayConfig::default())))
    } else {
        tracing::info!(
            "using s3 bucket '{}' in region '{}', endpoint: {:?}",
            config.gateway.bucket_name,
            config.gateway.region,
            config.gateway.endpoint
        );
        GenericObjectStore::AwsS3(Arc::new(
            S3Gateway::new(config.gateway.clone())
                .await
                .context("initialize object store gateway")?,
        ))
    };

    let kv = match (&config.redis_url, args.in_memory) {
        (Some(url), false) => GenericKvStore::from_redis_url(url)
            .await
            .context("connect to redis")?,
        _ => {
            tracing::warn!("no redis configured, using the in-memory kv store");
            GenericKvStore::memory()
        }
    };

    // The subscription backend is an external collaborator; without one,
    // every owner gets the default plan.
    let subscriptions = Arc::new(StaticSubscriptions(Subscription::default()));

    let shutdown = CancellationToken::new();
    let service = CloudService::new(config, store, kv, subscriptions, &shutdown);
    let workers = service.spawn_workers(&shutdown);
    tracing::info!("cloudserver started with {} background workers", workers.len());

    let mut sigint = tokio::signal::unix::signal(SignalKind::interrupt())?;
    let mut sigquit = tokio::signal::unix::signal(SignalKind::quit())?;
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
        _ = sigquit.recv() => {},
    }
    tracing::info!("terminating on signal");

    shutdown.cancel();
    for worker in workers {
        match tokio::time::timeout(Duration::from_secs(10), worker).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!("worker task failed during shutdown: {e}"),
            Err(_) => tracing::warn!("timed out joining a worker task"),
        }
    }
    tracing::info!("shutdown complete");

    Ok(())
}
