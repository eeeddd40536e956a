//! Wires the registry, broker, routing and background loops together.

use std::sync::Arc;

use tokio::sync::watch;

use botmesh_broker::{LogBroker, MemoryBroker};
use botmesh_protocol::IdentityResolver;
use botmesh_state::{DisconnectReason, LivenessMonitor, MemoryStore, Registry, Store, StoreIdentityDirectory};

use crate::config::GatewayConfig;
use crate::consumer::{ConsumerConfig, QueueConsumer};
use crate::dispatch::{DispatchConfig, Dispatcher};
use crate::routing::RoutingTable;
use crate::server::{self, AppState};
use crate::skills::SkillRegistry;

pub struct Gateway {
    config: GatewayConfig,
    registry: Arc<Registry>,
    broker: Arc<dyn LogBroker>,
    store: Arc<dyn Store>,
    skills: Arc<SkillRegistry>,
    dispatcher: Dispatcher,
}

impl Gateway {
    /// Build a gateway over the in-process broker (journaled if configured)
    /// and an in-memory store.
    pub fn new(config: GatewayConfig) -> Result<Self, anyhow::Error> {
        let mut broker = match &config.broker.journal_path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                MemoryBroker::open(path)?
            }
            None => MemoryBroker::new(),
        };
        if let Some(max_len) = config.broker.max_len {
            broker = broker.with_max_len(max_len);
        }
        Ok(Self::with_parts(config, Arc::new(broker), Arc::new(MemoryStore::new())))
    }

    pub fn with_parts(config: GatewayConfig, broker: Arc<dyn LogBroker>, store: Arc<dyn Store>) -> Self {
        let registry = Arc::new(Registry::new());
        let routing = Arc::new(RoutingTable::new(Some(store.clone())));
        let identity = Arc::new(IdentityResolver::with_base(
            Arc::new(StoreIdentityDirectory::new(store.clone())),
            config.identity.virtual_id_base,
        ));
        let dispatcher = Dispatcher::new(
            registry.clone(),
            broker.clone(),
            routing,
            DispatchConfig {
                action_timeout: config.action_timeout(),
                remote_hub_partition: config.queue.remote_hub_partition.clone(),
            },
        )
        .with_identity(identity);

        Self {
            config,
            registry,
            broker,
            store,
            skills: Arc::new(SkillRegistry::new()),
            dispatcher,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn broker(&self) -> &Arc<dyn LogBroker> {
        &self.broker
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Register skills here before calling [`Gateway::run`].
    pub fn skills(&self) -> &Arc<SkillRegistry> {
        &self.skills
    }

    pub fn consumer(&self) -> QueueConsumer {
        QueueConsumer::new(
            self.broker.clone(),
            self.dispatcher.clone(),
            self.skills.clone(),
            ConsumerConfig::from_queue(&self.config.queue),
        )
    }

    /// Serve until `shutdown` flips to true, then close every connection.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), anyhow::Error> {
        if let Err(e) = self.dispatcher.routing().load().await {
            tracing::warn!(error = %e, "Failed to load routing rules, starting with none");
        }

        let listener = tokio::net::TcpListener::bind(&self.config.server.bind_addr).await?;

        let monitor = LivenessMonitor::new(self.registry.clone(), self.config.liveness_config());
        let mut tasks = vec![tokio::spawn(monitor.run(shutdown.clone()))];
        tasks.push(tokio::spawn(
            self.dispatcher.clone().run_announcement_listener(shutdown.clone()),
        ));
        if self.config.queue.enabled {
            tasks.push(tokio::spawn(self.consumer().run(shutdown.clone())));
        } else {
            tracing::info!("Queue consumer disabled");
        }

        // Open sockets keep graceful shutdown waiting, so peers are closed as
        // soon as the signal arrives rather than after the server returns.
        let closer = {
            let registry = self.registry.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                registry.clear(DisconnectReason::Shutdown).await
            })
        };

        let state = AppState::new(self.dispatcher.clone(), self.config.server.clone());
        let served = server::serve(listener, state, shutdown).await;

        if served.is_err() {
            // the loops only stop on the shutdown signal, which never came
            closer.abort();
            for task in &tasks {
                task.abort();
            }
            self.registry.clear(DisconnectReason::Shutdown).await;
            return served;
        }

        let closed = match closer.await {
            Ok(closed) => closed,
            Err(e) => {
                tracing::warn!(error = %e, "Connection closer ended abnormally");
                self.registry.clear(DisconnectReason::Shutdown).await
            }
        };
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task ended abnormally");
            }
        }
        tracing::info!(closed, "Gateway stopped");
        served
    }
}
