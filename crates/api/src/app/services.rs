use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use library_infra::catalog::{InMemoryCatalogRepository, PostgresCatalogRepository};
use library_infra::config::AppConfig;
use library_infra::db::{InMemoryDatabase, PgTransactor, connect, run_migrations};
use library_infra::library::{CatalogService, Library};
use library_infra::outbox::{
    DeliveryStats, DispatcherHandle, DispatcherSwitch, Fanout, InMemoryOutboxStore, KindRegistry,
    LogSink, OutboxDispatcher, PostgresOutboxStore,
};

use crate::delivery;

type InMemoryDispatcher = OutboxDispatcher<InMemoryDatabase, InMemoryOutboxStore>;
type PostgresDispatcher = OutboxDispatcher<PgTransactor, PostgresOutboxStore>;

/// The dispatcher for whichever backend was selected.
#[derive(Clone)]
pub enum DispatcherBackend {
    InMemory(InMemoryDispatcher),
    Postgres(PostgresDispatcher),
}

/// Everything the HTTP handlers need.
#[derive(Clone)]
pub struct AppServices {
    pub catalog: Arc<dyn CatalogService>,
    pub switch: DispatcherSwitch,
    pub stats: Arc<DeliveryStats>,
    dispatcher: DispatcherBackend,
}

impl AppServices {
    pub fn backend_name(&self) -> &'static str {
        match self.dispatcher {
            DispatcherBackend::InMemory(_) => "in_memory",
            DispatcherBackend::Postgres(_) => "postgres",
        }
    }

    /// Spawn the outbox workers; they stop when `parent` is cancelled.
    pub fn start_dispatcher(&self, parent: &CancellationToken) -> DispatcherHandle {
        match &self.dispatcher {
            DispatcherBackend::InMemory(d) => d.start_with_token(parent),
            DispatcherBackend::Postgres(d) => d.start_with_token(parent),
        }
    }
}

/// Wire services from configuration: Postgres when `DATABASE_URL` is set,
/// in-memory otherwise.
pub async fn build_services(config: &AppConfig) -> anyhow::Result<AppServices> {
    let client = delivery::http_client().context("failed to build delivery http client")?;
    let registry = Arc::new(delivery::registry_from_config(&config.outbox, &client));
    let stats = Arc::new(DeliveryStats::new());
    let switch = DispatcherSwitch::new(config.outbox.enabled);

    match &config.database_url {
        Some(url) => build_postgres_services(config, url, registry, stats, switch).await,
        None => {
            tracing::warn!("DATABASE_URL not set; using the in-memory backend");
            Ok(build_in_memory_services(config, registry, stats, switch))
        }
    }
}

fn outcome_sink(stats: &Arc<DeliveryStats>) -> Arc<Fanout> {
    Arc::new(Fanout::new().with(Arc::new(LogSink)).with(stats.clone()))
}

fn build_in_memory_services(
    config: &AppConfig,
    registry: Arc<KindRegistry>,
    stats: Arc<DeliveryStats>,
    switch: DispatcherSwitch,
) -> AppServices {
    let db = Arc::new(InMemoryDatabase::new());
    let outbox = Arc::new(InMemoryOutboxStore::new());

    let catalog = Library::new(db.clone(), Arc::new(InMemoryCatalogRepository::new()), outbox.clone());
    let dispatcher = OutboxDispatcher::new(db, outbox, registry, config.outbox.dispatcher_config())
        .with_sink(outcome_sink(&stats))
        .with_switch(switch.clone());

    AppServices {
        catalog: Arc::new(catalog),
        switch,
        stats,
        dispatcher: DispatcherBackend::InMemory(dispatcher),
    }
}

async fn build_postgres_services(
    config: &AppConfig,
    url: &str,
    registry: Arc<KindRegistry>,
    stats: Arc<DeliveryStats>,
    switch: DispatcherSwitch,
) -> anyhow::Result<AppServices> {
    let pool = connect(url, config.database_max_connections)
        .await
        .context("failed to connect to postgres")?;
    run_migrations(&pool).await.context("failed to apply migrations")?;

    let transactor = Arc::new(PgTransactor::new(pool));
    let outbox = Arc::new(PostgresOutboxStore::new());

    let catalog = Library::new(
        transactor.clone(),
        Arc::new(PostgresCatalogRepository::new()),
        outbox.clone(),
    );
    let dispatcher =
        OutboxDispatcher::new(transactor, outbox, registry, config.outbox.dispatcher_config())
            .with_sink(outcome_sink(&stats))
            .with_switch(switch.clone());

    Ok(AppServices {
        catalog: Arc::new(catalog),
        switch,
        stats,
        dispatcher: DispatcherBackend::Postgres(dispatcher),
    })
}
