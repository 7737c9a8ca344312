// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Manager
//!
//! `RabbitMQManager` is the facade over a single connection and channel. On
//! construction it validates the configuration, connects with retry, and
//! declares the configured topology. It then exposes publish, consume,
//! introspection, health-check and cleanup helpers.
//!
//! Operations are sequential: each call awaits its broker round trip before
//! returning. The manager is not meant to be shared between tasks.
//!
//! ```no_run
//! use rabbitmq_manager::{config::RabbitMQConfig, manager::RabbitMQManager};
//!
//! # async fn run() -> Result<(), rabbitmq_manager::errors::AmqpError> {
//! let cfg = RabbitMQConfig::new("orders").queues(
//!     ["new_orders", "pending_orders"],
//!     ["orders.new", "orders.pending"],
//! );
//!
//! RabbitMQManager::scoped(cfg, |manager| {
//!     Box::pin(async move { manager.publish("orders", "orders.new", b"{}").await })
//! })
//! .await
//! # }
//! ```

use crate::{
    broker::Broker,
    channel,
    config::RabbitMQConfig,
    consumer::{self, MessageHandler},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    logging,
    publisher::{self, OutgoingMessage},
    queue::{DeadLetterOptions, QueueBinding, QueueDefinition, QueueInfo},
    topology::{AmqpTopology, TopologyPlan},
};
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::{future::Future, sync::Arc};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Coarse health of the manager's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of [`RabbitMQManager::health_check`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub host: String,
    pub port: u16,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Facade over one broker connection and the topology it declared.
pub struct RabbitMQManager {
    config: RabbitMQConfig,
    broker: Arc<dyn Broker>,
    topology: TopologyPlan,
    closed: bool,
}

impl RabbitMQManager {
    /// Validates `config`, connects with retry and declares the topology.
    ///
    /// Configuration errors are returned before any connection attempt.
    pub async fn connect(config: RabbitMQConfig) -> Result<RabbitMQManager, AmqpError> {
        config.validate()?;
        logging::init(&config);

        let channel = channel::connect_with_retry(&config).await?;
        Self::with_broker(config, Arc::new(channel)).await
    }

    /// Builds a manager over an already-open broker and declares the topology.
    pub async fn with_broker(
        config: RabbitMQConfig,
        broker: Arc<dyn Broker>,
    ) -> Result<RabbitMQManager, AmqpError> {
        config.validate()?;

        let topology = TopologyPlan::from_config(&config);
        let mut manager = RabbitMQManager {
            config,
            broker,
            topology: TopologyPlan::default(),
            closed: false,
        };

        AmqpTopology::new(manager.broker.as_ref())
            .install(&topology)
            .await?;
        manager.topology = topology;

        info!(
            exchange = manager.config.exchange.as_str(),
            queues = manager.config.queues.len(),
            "rabbitmq manager ready"
        );

        Ok(manager)
    }

    /// Connects, runs `f` with the manager, and always closes the connection.
    ///
    /// The error of `f` wins over a failure to close.
    pub async fn scoped<T, F>(config: RabbitMQConfig, f: F) -> Result<T, AmqpError>
    where
        F: for<'m> FnOnce(&'m mut RabbitMQManager) -> BoxFuture<'m, Result<T, AmqpError>>,
    {
        Self::connect(config).await?.run(f).await
    }

    /// Runs `f` with this manager, then closes it on every exit path.
    pub async fn run<T, F>(mut self, f: F) -> Result<T, AmqpError>
    where
        F: for<'m> FnOnce(&'m mut RabbitMQManager) -> BoxFuture<'m, Result<T, AmqpError>>,
    {
        let result = f(&mut self).await;
        let closed = self.close().await;

        match (result, closed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(err),
        }
    }

    pub fn config(&self) -> &RabbitMQConfig {
        &self.config
    }

    /// Resources this instance declared and still owns.
    pub fn topology(&self) -> &TopologyPlan {
        &self.topology
    }

    /// Publishes `body` to `exchange` with `routing_key`.
    ///
    /// Messages are persistent when the configuration asks for durable
    /// resources.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
    ) -> Result<(), AmqpError> {
        let mut msg = OutgoingMessage::new(exchange, routing_key, body);
        if self.config.durable {
            msg = msg.persistent();
        }
        publisher::publish(self.broker.as_ref(), &msg).await
    }

    /// Publishes a message with custom properties and headers.
    pub async fn publish_message(&self, msg: &OutgoingMessage) -> Result<(), AmqpError> {
        publisher::publish(self.broker.as_ref(), msg).await
    }

    /// Consumes `queue` until the broker ends the consumer.
    ///
    /// Settlement belongs to `handler`. A delivery whose handler returns an
    /// error without settling stays unacknowledged and occupies one slot of
    /// `prefetch_count`; once every slot is taken the broker stops delivering
    /// on this channel. Handlers should `nack` or `reject` before failing.
    ///
    /// # Returns
    /// The number of deliveries handed to `handler`
    pub async fn start_consuming<H>(&self, queue: &str, handler: H) -> Result<u64, AmqpError>
    where
        H: MessageHandler,
    {
        self.start_consuming_until(queue, handler, std::future::pending())
            .await
    }

    /// Consumes `queue` until `shutdown` resolves or the broker ends the
    /// consumer. On shutdown the consumer is cancelled at the broker.
    pub async fn start_consuming_until<H, S>(
        &self,
        queue: &str,
        handler: H,
        shutdown: S,
    ) -> Result<u64, AmqpError>
    where
        H: MessageHandler,
        S: Future<Output = ()> + Send,
    {
        let consumer_tag = format!("{}-{}", self.config.connection_name, Uuid::new_v4());
        consumer::consume(
            self.broker.as_ref(),
            queue,
            &consumer_tag,
            &handler,
            shutdown,
        )
        .await
    }

    /// Declares a queue bound to `exchange` by `routing_key`.
    ///
    /// With dead-letter options, their exchange is declared too and the queue
    /// gets dead-letter arguments pointing at it. Binding is skipped for the
    /// default exchange (`""`), which routes by queue name on its own.
    pub async fn setup_queue(
        &mut self,
        name: &str,
        exchange: &str,
        routing_key: &str,
        dead_letter: Option<DeadLetterOptions>,
    ) -> Result<QueueInfo, AmqpError> {
        let mut def = QueueDefinition::new(name).with_durability(self.config.durable);
        if let Some(dl) = dead_letter {
            def = def.with_dead_letter(dl);
        }

        self.setup_queue_with(def, exchange, routing_key).await
    }

    /// Like [`setup_queue`](Self::setup_queue) for a caller-built definition,
    /// carrying TTL, max-length, exclusive or auto-delete settings.
    pub async fn setup_queue_with(
        &mut self,
        def: QueueDefinition,
        exchange: &str,
        routing_key: &str,
    ) -> Result<QueueInfo, AmqpError> {
        let name = def.name().to_owned();
        if name.trim().is_empty() {
            return Err(AmqpError::configuration("queue name must not be empty"));
        }

        if let Some(dl) = def.dead_letter() {
            if dl.exchange.trim().is_empty() {
                return Err(AmqpError::configuration(
                    "dead-letter exchange name must not be empty",
                ));
            }
            if dl.exchange == exchange {
                return Err(AmqpError::configuration(format!(
                    "queue `{}` would dead-letter into its own exchange `{}`",
                    name, exchange
                )));
            }

            let dlx = ExchangeDefinition::new(&dl.exchange)
                .kind(ExchangeKind::Direct)
                .with_durability(def.is_durable());
            self.broker.declare_exchange(&dlx).await?;
            if self.topology.add_exchange(dlx) {
                self.topology.dead_letter_exchanges.push(dl.exchange.clone());
            }
        }

        let info = self.broker.declare_queue(&def).await?;
        self.topology.add_queue(def);

        if !exchange.is_empty() {
            let binding = QueueBinding::new(&name)
                .exchange(exchange)
                .routing_key(routing_key);
            self.broker.bind_queue(&binding).await?;
            self.topology.add_binding(binding);
        }

        info!(queue = name.as_str(), exchange, routing_key, "queue set up");
        Ok(info)
    }

    /// Declares an additional exchange and records it for cleanup.
    pub async fn setup_exchange(&mut self, def: ExchangeDefinition) -> Result<(), AmqpError> {
        if def.name().trim().is_empty() {
            return Err(AmqpError::configuration("exchange name must not be empty"));
        }

        self.broker.declare_exchange(&def).await?;
        info!(
            exchange = def.name(),
            kind = def.exchange_kind().to_string(),
            "exchange set up"
        );
        self.topology.add_exchange(def);

        Ok(())
    }

    /// Removes the binding of `queue` to `exchange` by `routing_key`.
    pub async fn unbind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), AmqpError> {
        let binding = QueueBinding::new(queue)
            .exchange(exchange)
            .routing_key(routing_key);
        self.broker.unbind_queue(&binding).await?;
        self.topology.remove_binding(&binding);

        info!(queue, exchange, routing_key, "queue unbound");
        Ok(())
    }

    /// Reports message and consumer counts of `name`.
    pub async fn get_queue_info(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        self.broker.inspect_queue(name).await
    }

    /// Reports whether the connection is usable.
    pub fn health_check(&self) -> HealthReport {
        let open = !self.closed && self.broker.is_open();

        let (status, error) = if open {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some(format!(
                    "connection to {}:{} is closed",
                    self.config.host, self.config.port
                )),
            )
        };

        HealthReport {
            status,
            error,
            host: self.config.host.clone(),
            port: self.config.port,
        }
    }

    /// Deletes a queue.
    ///
    /// With `if_unused` the broker refuses while consumers exist; with
    /// `if_empty` it refuses while messages remain.
    ///
    /// # Returns
    /// The number of messages deleted with the queue
    pub async fn delete_queue(
        &mut self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        let deleted = self.broker.delete_queue(name, if_unused, if_empty).await?;
        self.topology.remove_queue(name);

        info!(queue = name, messages = deleted, "queue deleted");
        Ok(deleted)
    }

    /// Deletes an exchange; with `if_unused` the broker refuses while bound.
    pub async fn delete_exchange(&mut self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.broker.delete_exchange(name, if_unused).await?;
        self.topology.remove_exchange(name);

        info!(exchange = name, "exchange deleted");
        Ok(())
    }

    /// Removes every message from `name`.
    ///
    /// # Returns
    /// The number of messages purged
    pub async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let purged = self.broker.purge_queue(name).await?;

        info!(queue = name, purged, "queue purged");
        Ok(purged)
    }

    /// Deletes the dead-letter queues and exchanges this instance declared.
    ///
    /// Queues already declared with dead-letter arguments keep them; their
    /// rejected messages are dropped by the broker once the DLX is gone.
    pub async fn cleanup_dead_letter_setup(&mut self) -> Result<(), AmqpError> {
        for queue in self.topology.dead_letter_queues.clone() {
            self.delete_queue(&queue, false, false).await?;
        }

        for exchange in self.topology.dead_letter_exchanges.clone() {
            self.delete_exchange(&exchange, false).await?;
        }

        info!("dead-letter setup removed");
        Ok(())
    }

    /// Deletes every queue and exchange this instance declared.
    ///
    /// Refuses unless `confirm` is true. On failure the topology keeps only
    /// the resources that were not deleted yet.
    pub async fn delete_all_setup_resources(&mut self, confirm: bool) -> Result<(), AmqpError> {
        if !confirm {
            warn!("refusing to delete resources without confirmation");
            return Err(AmqpError::configuration(
                "deleting all resources requires confirm = true",
            ));
        }

        AmqpTopology::new(self.broker.as_ref())
            .teardown(&mut self.topology)
            .await?;
        self.topology = TopologyPlan::default();

        Ok(())
    }

    /// Deletes every resource and declares the configured topology again.
    ///
    /// Refuses unless `confirm` is true.
    pub async fn reset_manager(&mut self, confirm: bool) -> Result<(), AmqpError> {
        self.delete_all_setup_resources(confirm).await?;

        let topology = TopologyPlan::from_config(&self.config);
        AmqpTopology::new(self.broker.as_ref())
            .install(&topology)
            .await?;
        self.topology = topology;

        info!("rabbitmq manager reset");
        Ok(())
    }

    /// Closes the channel and the connection.
    pub async fn close(mut self) -> Result<(), AmqpError> {
        self.closed = true;
        self.broker.close().await
    }
}

impl Drop for RabbitMQManager {
    fn drop(&mut self) {
        if self.closed || !self.broker.is_open() {
            return;
        }

        let broker = self.broker.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!("manager dropped without close, closing connection");
                handle.spawn(async move {
                    if let Err(err) = broker.close().await {
                        error!(error = err.to_string(), "failure to close dropped connection");
                    }
                });
            }
            Err(_) => warn!("manager dropped outside a tokio runtime, connection not closed"),
        }
    }
}
