mod config;
mod creative;
mod db;
mod errors;
mod image_client;
mod models;
mod notify;
mod pipeline;
mod routes;
mod state;
#[cfg(test)]
mod test_utils;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;

use crate::config::Config;
use crate::creative::ImageRenderer;
use crate::db::{create_pool, run_migrations};
use crate::image_client::ImageClient;
use crate::notify::ProgressReporter;
use crate::pipeline::catalog::{ContentDispatchCatalog, PgPairStore};
use crate::pipeline::counters::PgActivityCounterStore;
use crate::pipeline::driver::FlowDriver;
use crate::pipeline::lease::RedisLease;
use crate::pipeline::orchestrator::BatchOrchestrator;
use crate::pipeline::profiles::PgProfileStore;
use crate::pipeline::queue::PgPendingQueue;
use crate::pipeline::results::PgSegmentationRepository;
use crate::pipeline::segmentation::RuleBasedSegmenter;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AdGen API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url).await?;
    run_migrations(&db).await?;

    // Initialize Redis round lease
    let redis = redis::Client::open(config.redis_url.clone())?;
    let lease = Arc::new(RedisLease::connect(redis).await?);
    info!("Redis round lease initialized");

    // Initialize S3 / MinIO
    let s3 = build_s3_client(&config).await;
    info!("S3 client initialized");

    // Initialize image generation
    let image_client = ImageClient::new(config.image_api_url.clone(), config.image_api_key.clone())?;
    let renderer = Arc::new(ImageRenderer::new(
        image_client,
        s3,
        config.s3_bucket.clone(),
        config.s3_public_base_url.clone(),
    ));
    info!("Image renderer initialized (bucket: {})", config.s3_bucket);

    let reporter = match config.webhook_url.clone() {
        Some(url) => {
            let reporter = ProgressReporter::new(Some(url), config.webhook_secret.clone());
            if reporter.is_enabled() {
                info!("Progress notifications enabled");
            }
            reporter
        }
        None => {
            info!("WEBHOOK_URL not set, progress notifications disabled");
            ProgressReporter::disabled()
        }
    };

    let settings = config.pipeline.clone();
    info!(
        "Pipeline settings: page size {}, {} pairs per creative round, {} follow-ups max",
        settings.page_size, settings.max_pairs_per_round, settings.max_followups
    );

    // Storage seams
    let counters = Arc::new(PgActivityCounterStore::new(db.clone()));
    let queue = Arc::new(PgPendingQueue::new(db.clone(), settings.history));
    let segmentations = Arc::new(PgSegmentationRepository::new(db.clone()));
    let profiles = Arc::new(PgProfileStore::new(db.clone()));
    let pairs = Arc::new(PgPairStore::new(db));

    let orchestrator = BatchOrchestrator::new(
        counters,
        queue.clone(),
        Arc::new(RuleBasedSegmenter),
        settings.page_size,
    );
    let catalog = Arc::new(ContentDispatchCatalog::new(segmentations, profiles, pairs));
    let driver = FlowDriver::new(
        orchestrator,
        catalog.clone(),
        renderer,
        lease,
        reporter,
        settings,
    );

    // Build app state
    let state = AppState {
        driver: Arc::new(driver),
        catalog,
        queue,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "adgen-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    aws_sdk_s3::Client::new(&s3_config)
}
