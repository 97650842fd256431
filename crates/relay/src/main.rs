use std::sync::Arc;

use anyhow::Context;
use onezone_relay::auth::jwt::JwtAccessTokenService;
use onezone_relay::auth::policy::PageAccessPolicy;
use onezone_relay::config::{LogFormat, RelayConfig};
use onezone_relay::db::{migrations::run_migrations, pool};
use onezone_relay::metrics::{set_global_metrics, RelayMetrics};
use onezone_relay::ownership::PageOwnership;
use onezone_relay::rate_limit::RateLimiter;
use onezone_relay::server::{build_router, shutdown_signal, RelayState};
use onezone_relay::session::SessionRegistry;
use onezone_relay::store::PageStore;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set ONEZONE_RELAY_JWT_SECRET in production");
    }
    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );

    let (store, policy, ownership) = match config.database_url.as_deref() {
        Some(database_url) => {
            let pg = pool::create_pg_pool(database_url, pool::PoolConfig::from_env()).await?;
            pool::check_pool_health(&pg).await?;
            run_migrations(&pg).await?;
            let ownership =
                PageOwnership::postgres(pg.clone(), config.node_id, config.ownership_ttl);
            spawn_lease_eviction(ownership.clone(), config.ownership_ttl);
            (PageStore::Postgres(pg.clone()), PageAccessPolicy::Postgres(pg), ownership)
        }
        None => {
            warn!("ONEZONE_RELAY_DATABASE_URL is unset; pages live in memory only");
            (PageStore::memory(), PageAccessPolicy::memory(), PageOwnership::local(config.node_id))
        }
    };

    let metrics = Arc::new(RelayMetrics::default());
    set_global_metrics(Arc::clone(&metrics));

    let registry = SessionRegistry::new(config.session_config(), store, policy, ownership);
    let limiter = Arc::new(RateLimiter::per_minute(
        config.mutate_rate_per_minute,
        config.search_rate_per_minute,
    ));
    let app = build_router(
        RelayState::new(registry.clone(), limiter),
        jwt_service,
        metrics,
        config.cors_origins.as_deref(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;
    info!(listen_addr = %config.listen_addr, node_id = %config.node_id, "starting relay server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")?;

    registry.shutdown().await;
    info!("relay server stopped");
    Ok(())
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Sweep lease rows left behind by crashed nodes.
fn spawn_lease_eviction(ownership: PageOwnership, ttl: std::time::Duration) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(ttl);
        loop {
            interval.tick().await;
            match ownership.evict_expired().await {
                Ok(0) => {}
                Ok(evicted) => info!(evicted, "expired page session leases evicted"),
                Err(error) => warn!(error = %error, "page session lease eviction failed"),
            }
        }
    });
}
