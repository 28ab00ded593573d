//! Process wiring: stores, dispatcher, publisher and the command processor.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use cairn_events::{Application, EventPublisher, InMemoryEventPublisher};
use cairn_infra::dispatcher::InMemoryDispatcher;
use cairn_infra::event_store::InMemoryDomainEventStore;
use cairn_infra::lock_store::{InMemoryLockStore, LockStore};
use cairn_infra::{CommandProcessor, Repository, ServerConfig};

use crate::demo::Message;

pub struct Services {
    pub dispatcher: Arc<InMemoryDispatcher>,
    pub processor: Arc<CommandProcessor>,
}

pub async fn build(config: &ServerConfig) -> anyhow::Result<Services> {
    let application = Arc::new(
        Application::builder()
            .register::<Message>()
            .context("registering business logic")?
            .build(),
    );
    info!(entities = application.len(), "business logic registered");

    let repository = Arc::new(Repository::new(
        application,
        Arc::new(InMemoryDomainEventStore::new()),
        lock_store(config).await?,
        config.snapshot_strategy,
    ));

    let dispatcher = Arc::new(InMemoryDispatcher::new(config.lease_duration).without_history());
    let processor = Arc::new(CommandProcessor::new(
        dispatcher.clone(),
        repository,
        publisher(config).await?,
        config.processor_config(),
    ));

    Ok(Services { dispatcher, processor })
}

#[cfg(feature = "redis")]
async fn lock_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn LockStore>> {
    match &config.redis_url {
        Some(url) => {
            let store = cairn_infra::lock_store::RedisLockStore::connect(url)
                .await
                .context("connecting redis lock store")?;
            info!("using redis lock store");
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(InMemoryLockStore::new())),
    }
}

#[cfg(not(feature = "redis"))]
async fn lock_store(config: &ServerConfig) -> anyhow::Result<Arc<dyn LockStore>> {
    if config.redis_url.is_some() {
        tracing::warn!("CAIRN_REDIS_URL is set but redis support is not compiled in; using in-memory locks");
    }
    Ok(Arc::new(InMemoryLockStore::new()))
}

#[cfg(feature = "redis")]
async fn publisher(config: &ServerConfig) -> anyhow::Result<Arc<dyn EventPublisher>> {
    match &config.redis_url {
        Some(url) => {
            let publisher = cairn_infra::event_bus::RedisEventPublisher::connect(url)
                .await
                .context("connecting redis publisher")?;
            info!("publishing events to redis");
            Ok(Arc::new(publisher))
        }
        None => Ok(logging_publisher()),
    }
}

#[cfg(not(feature = "redis"))]
async fn publisher(_config: &ServerConfig) -> anyhow::Result<Arc<dyn EventPublisher>> {
    Ok(logging_publisher())
}

/// In-memory publisher with one subscriber that logs every event.
fn logging_publisher() -> Arc<dyn EventPublisher> {
    let publisher = Arc::new(InMemoryEventPublisher::new().without_history());
    let subscription = publisher.subscribe();

    tokio::task::spawn_blocking(move || {
        while let Ok(published) = subscription.recv() {
            let event = &published.event;
            info!(
                entity = %event.entity_identifier,
                event = %event.name,
                revision = event.revision,
                rejection = event.is_rejection(),
                data = %event.data,
                state = %published.state.next,
                "event published"
            );
        }
    });

    publisher
}

/// How long to wait for in-flight commands after shutdown was requested.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);
