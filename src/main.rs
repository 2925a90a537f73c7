//! Marketplace Checkout - cart, checkout and order service

use anyhow::{Context, Result};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use marketplace_checkout::config::Config;
use marketplace_checkout::domain::events::{EventPublisher, NoopPublisher};
use marketplace_checkout::http::{router, AppState};
use marketplace_checkout::store::{memory::MemoryStore, postgres::PgStore, Repositories};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    let repos = match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url, config.db_max_connections, config.db_acquire_timeout, config.checkout_tx_timeout)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            Repositories::from_store(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store");
            Repositories::from_store(MemoryStore::new())
        }
    };

    let events: Arc<dyn EventPublisher> = match &config.nats_url {
        Some(url) => match async_nats::connect(url.as_str()).await {
            Ok(client) => Arc::new(client),
            Err(e) => {
                tracing::warn!(error = %e, "NATS unavailable, order events disabled");
                Arc::new(NoopPublisher)
            }
        },
        None => Arc::new(NoopPublisher),
    };

    let state = AppState::new(repos, config.shipping.clone(), config.payments.clone(), events);
    let app = router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()));

    let addr = format!("0.0.0.0:{}", config.port);
    tracing::info!("marketplace checkout listening on {}", addr);
    axum::serve(tokio::net::TcpListener::bind(&addr).await?, app).await?;
    Ok(())
}
