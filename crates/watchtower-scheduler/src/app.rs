//! Service wiring for one process

use crate::config::WatchtowerConfig;
use anyhow::Context;
use std::sync::Arc;
use tracing::info;
use watchtower_engine::{
    Evaluator, HttpMailer, Notifier, NullNotifier, Reconciler, Runtime, Scheduler,
    WatcherManager,
};
use watchtower_query::{typed_objects, Registry};
use watchtower_runner::{
    CloudRunner, CommandGateway, Dispatcher, InternalRunner, PgCredentialProvider,
    PgQueryExecutor, ProfileDirectory,
};
use watchtower_store::{PgStore, Store};

/// Typed object specs from the configured file, or the built-in ones
pub fn registry(config: &WatchtowerConfig) -> anyhow::Result<Registry> {
    match &config.typed_objects {
        Some(path) => {
            let specs = typed_objects::load_specs(path)
                .with_context(|| format!("loading typed objects from {}", path.display()))?;
            info!(path = %path.display(), tables = specs.len(), "Typed object specs loaded");
            Ok(Registry::with_typed_objects(specs))
        }
        None => Ok(Registry::builtin()?),
    }
}

pub async fn store(config: &WatchtowerConfig) -> anyhow::Result<PgStore> {
    PgStore::connect(&config.database.url, &config.pool())
        .await
        .context("connecting to the application database")
}

pub struct App {
    pub scheduler: Scheduler,
    pub runtime: Arc<Runtime>,
}

impl App {
    pub async fn build(config: &WatchtowerConfig) -> anyhow::Result<Self> {
        let registry = Arc::new(registry(config)?);
        let pg = Arc::new(store(config).await?);
        let store: Arc<dyn Store> = pg.clone();

        let internal_executor = Arc::new(PgQueryExecutor::connect_lazy(
            &config.database.url,
            &config.database.executor(),
        )?);
        let gateway_executor = Arc::new(PgQueryExecutor::connect_lazy(
            &config.gateway.dsn,
            &config.gateway.executor(),
        )?);
        let cloud = Arc::new(
            CloudRunner::new(
                Arc::new(PgCredentialProvider::new(pg.pool().clone())),
                gateway_executor,
                Arc::new(CommandGateway::new(config.gateway.commands())),
                ProfileDirectory::new(
                    config.gateway.config_dir(),
                    config.gateway.profile_max_age(),
                ),
            )
            .with_retry(config.gateway.retry.clone()),
        );
        let internal = Arc::new(InternalRunner::new(registry.clone(), internal_executor));
        let dispatcher = Arc::new(
            Dispatcher::new(internal, cloud.clone())
                .with_max_result_bytes(config.engine.max_result_bytes),
        );

        let notifier: Arc<dyn Notifier> = match HttpMailer::from_config(&config.notifications)? {
            Some(mailer) => Arc::new(mailer),
            None => {
                info!("No notification endpoint configured, urgent emails are dropped");
                Arc::new(NullNotifier)
            }
        };

        let reconciler = Arc::new(Reconciler::new(
            store.clone(),
            notifier,
            config.engine.reconciler(),
        ));
        let evaluator = Arc::new(Evaluator::new(
            store.clone(),
            registry.clone(),
            dispatcher,
            reconciler.clone(),
            config.engine.evaluator(),
        ));
        let watchers = Arc::new(WatcherManager::new(
            store.clone(),
            reconciler,
            config.engine.default_watcher_roles.iter().cloned(),
        ));
        let runtime = Arc::new(Runtime::new(config.engine.worker_pool_size, pg, cloud));
        runtime.init().await?;

        Ok(Self {
            scheduler: Scheduler::new(store, registry, runtime.clone(), evaluator, watchers),
            runtime,
        })
    }
}
