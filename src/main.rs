use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use imgserv::auth::Permissions;
use imgserv::cache::CacheManager;
use imgserv::config::Config;
use imgserv::metadata::{MetaStore, RedisStore};
use imgserv::server::{self, App, UPLOAD_WORKERS};
use imgserv::storage;
use imgserv::text::DisabledTextRenderer;
use imgserv::transform::Engine;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("imgserv=info")),
        )
        .init();

    let config = Config::from_env();
    config.validate()?;

    let meta: Arc<dyn MetaStore> = Arc::new(RedisStore::connect_from_env().await?);
    let permissions = Permissions::load(meta.as_ref(), &config).await?;
    let storage = storage::from_env(&config).await;

    let engine = Engine::new(storage.clone(), Arc::new(DisabledTextRenderer));
    let cache = CacheManager::new(
        storage.clone(),
        meta.clone(),
        config.cache_policy,
        config.cache_limit,
        config.jpeg_quality,
    );

    let port = config.port;
    let app = Arc::new(App {
        config,
        storage,
        meta,
        cache,
        engine,
        permissions,
        upload_pool: Arc::new(Semaphore::new(UPLOAD_WORKERS)),
    });

    let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], port))).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        server::router(app).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}
