//! xgrowth daemon: wires configuration, storage, and capabilities into the
//! job worker pools, and ticks the per-user schedule.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use xgrowth::ai::{OfflineTextGenerator, OpenAiTextGenerator, TextGenerator};
use xgrowth::config::Config;
use xgrowth::coordination::{CoordinationCache, MemoryCoordination, RedisCoordination};
use xgrowth::jobs::{JobKind, JobPayload, JobQueues, PacingPolicy, Services, WorkerPool};
use xgrowth::limits::system_clock;
use xgrowth::queue_adapter::{MpscQueueAdapter, QueueAdapter, RedisQueueAdapter};
use xgrowth::secrets::AesGcmCodec;
use xgrowth::storage::{
    AccountStorage, PostgresAccountStorage, PostgresAuditStorage, PostgresCandidateStorage,
    PostgresConfigStorage, PostgresGeneratedPostStorage, PostgresTopicStorage, PostgresUsageStorage,
    cache::create_cache_pool,
};
use xgrowth::x::HttpXApi;

fn build_queue(
    redis_pool: Option<&deadpool_redis::Pool>,
    kind: JobKind,
) -> Arc<dyn QueueAdapter<JobPayload>> {
    match redis_pool {
        Some(pool) => Arc::new(RedisQueueAdapter::new(pool.clone(), kind.as_str(), None)),
        None => Arc::new(MpscQueueAdapter::new(1024)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::new().context("loading configuration")?;

    let pg_pool = Arc::new(
        sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connecting to PostgreSQL")?,
    );

    let accounts = Arc::new(PostgresAccountStorage::new(pg_pool.clone()));
    let topics = Arc::new(PostgresTopicStorage::new(pg_pool.clone()));
    let candidates = Arc::new(PostgresCandidateStorage::new(pg_pool.clone()));
    let configs = Arc::new(PostgresConfigStorage::new(pg_pool.clone()));
    let posts = Arc::new(PostgresGeneratedPostStorage::new(pg_pool.clone()));
    let usage = Arc::new(PostgresUsageStorage::new(pg_pool.clone()));
    let audit = Arc::new(PostgresAuditStorage::new(pg_pool.clone()));

    accounts.initialize_schema().await?;
    topics.initialize_schema().await?;
    candidates.initialize_schema().await?;
    configs.initialize_schema().await?;
    posts.initialize_schema().await?;
    usage.initialize_schema().await?;
    audit.initialize_schema().await?;

    let redis_pool = match &config.redis_url {
        Some(url) => match create_cache_pool(url) {
            Ok(pool) => Some(pool),
            Err(err) => {
                warn!(error = %err, "Redis unavailable, falling back to in-memory coordination");
                None
            }
        },
        None => None,
    };

    let coordination: Arc<dyn CoordinationCache> = match &redis_pool {
        Some(pool) => Arc::new(RedisCoordination::new(pool.clone())),
        None => Arc::new(MemoryCoordination::new()),
    };

    let http_client = Arc::new(reqwest::Client::new());
    let generator: Arc<dyn TextGenerator> = match &config.ai.api_key {
        Some(api_key) => Arc::new(OpenAiTextGenerator::new(
            http_client.clone(),
            config.ai.base_url.clone(),
            api_key.clone(),
            config.ai.model.clone(),
        )),
        None => {
            info!("No AI provider configured, using deterministic offline generation");
            Arc::new(OfflineTextGenerator::new())
        }
    };

    let services = Services {
        accounts: accounts.clone(),
        topics,
        candidates,
        configs,
        posts,
        usage,
        audit,
        coordination: coordination.clone(),
        secrets: Arc::new(AesGcmCodec::new(config.token_encryption_key.as_ref())),
        generator,
        x_api: Arc::new(HttpXApi::new(
            http_client,
            config.x.api_base_url.clone(),
            config.x.oauth_token_url.clone(),
        )),
        default_credentials: config.x.default_credentials(),
        pacing: PacingPolicy::enabled(),
        clock: system_clock(),
    };

    let discovery_queue = build_queue(redis_pool.as_ref(), JobKind::Discovery);
    let engagement_queue = build_queue(redis_pool.as_ref(), JobKind::Engagement);
    let autopost_queue = build_queue(redis_pool.as_ref(), JobKind::AutoPost);
    let queues = Arc::new(JobQueues::new(
        discovery_queue.clone(),
        engagement_queue.clone(),
        autopost_queue.clone(),
        coordination,
    ));

    let cancel = CancellationToken::new();
    let pools = vec![
        WorkerPool::spawn(
            JobKind::Discovery,
            discovery_queue,
            services.clone(),
            WorkerPool::default_concurrency(JobKind::Discovery),
            cancel.clone(),
        ),
        WorkerPool::spawn(
            JobKind::Engagement,
            engagement_queue,
            services.clone(),
            WorkerPool::default_concurrency(JobKind::Engagement),
            cancel.clone(),
        ),
        WorkerPool::spawn(
            JobKind::AutoPost,
            autopost_queue,
            services.clone(),
            WorkerPool::default_concurrency(JobKind::AutoPost),
            cancel.clone(),
        ),
    ];

    // Scheduler tick: enqueue all three job kinds for every connected user.
    // Triggers are idempotent within a minute bucket, so overlapping ticks
    // collapse instead of stacking.
    let scheduler = {
        let cancel = cancel.clone();
        let queues = queues.clone();
        let tick = Duration::from_secs(config.scheduler_tick.as_secs());
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let user_ids = match accounts.connected_user_ids().await {
                            Ok(ids) => ids,
                            Err(err) => {
                                error!(error = %err, "Failed to list connected users");
                                continue;
                            }
                        };
                        for user_id in user_ids {
                            for result in [
                                queues.enqueue_discovery(&user_id).await,
                                queues.enqueue_engagement(&user_id).await,
                                queues.enqueue_autopost(&user_id).await,
                            ] {
                                if let Err(err) = result {
                                    warn!(user_id = %user_id, error = %err, "Failed to enqueue job");
                                }
                            }
                        }
                    }
                }
            }
        })
    };

    info!("Workers online: discovery, engage, autopost");
    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutting down");

    cancel.cancel();
    let _ = scheduler.await;
    for pool in pools {
        pool.join().await;
    }

    Ok(())
}
