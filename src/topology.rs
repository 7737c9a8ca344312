// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Management
//!
//! This module describes and installs the exchanges, queues and bindings a
//! manager owns. The topology derived from a configuration contains:
//! - the main exchange
//! - the dead-letter exchange (DLX) and one dead-letter queue (DLQ) bound to it
//! - every configured queue, declared with dead-letter arguments pointing at
//!   the DLX, and bound to the main exchange by its routing key
//!
//! A plan never holds the same resource twice, and installing a plan issues
//! only broker declare calls, so installing it again is a no-op.

use crate::{
    broker::Broker,
    config::RabbitMQConfig,
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{DeadLetterOptions, QueueBinding, QueueDefinition},
};
use tracing::{debug, info};

/// Builder interface for topology plans.
pub trait Topology {
    /// Adds an exchange definition to the topology.
    fn exchange(self, def: ExchangeDefinition) -> Self;

    /// Adds a queue definition to the topology.
    fn queue(self, def: QueueDefinition) -> Self;

    /// Adds a queue-to-exchange binding to the topology.
    fn queue_binding(self, binding: QueueBinding) -> Self;
}

/// The exchanges, queues and bindings declared by a manager instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyPlan {
    pub(crate) exchanges: Vec<ExchangeDefinition>,
    pub(crate) queues: Vec<QueueDefinition>,
    pub(crate) bindings: Vec<QueueBinding>,
    pub(crate) dead_letter_exchanges: Vec<String>,
    pub(crate) dead_letter_queues: Vec<String>,
}

impl Topology for TopologyPlan {
    fn exchange(mut self, def: ExchangeDefinition) -> Self {
        self.add_exchange(def);
        self
    }

    fn queue(mut self, def: QueueDefinition) -> Self {
        self.add_queue(def);
        self
    }

    fn queue_binding(mut self, binding: QueueBinding) -> Self {
        self.add_binding(binding);
        self
    }
}

impl TopologyPlan {
    pub fn new() -> Self {
        TopologyPlan::default()
    }

    /// Derives the full topology for a configuration.
    ///
    /// The configuration is expected to be validated already.
    pub fn from_config(cfg: &RabbitMQConfig) -> Self {
        let dlx = cfg.dlx_exchange_name();
        let dlq = cfg.dlq_name();
        let dead_letter = DeadLetterOptions::new(&dlx, &cfg.dlx_routing_key);

        let mut plan = TopologyPlan::new()
            .exchange(
                ExchangeDefinition::new(&cfg.exchange)
                    .kind(cfg.exchange_type)
                    .with_durability(cfg.durable),
            )
            .dead_letter_exchange(
                ExchangeDefinition::new(&dlx)
                    .kind(ExchangeKind::Direct)
                    .with_durability(cfg.durable),
            )
            .dead_letter_queue(QueueDefinition::new(&dlq).with_durability(cfg.durable))
            .queue_binding(
                QueueBinding::new(&dlq)
                    .exchange(&dlx)
                    .routing_key(&cfg.dlx_routing_key),
            );

        for (queue, routing_key) in cfg.bindings() {
            plan = plan
                .queue(
                    QueueDefinition::new(queue)
                        .with_durability(cfg.durable)
                        .with_dead_letter(dead_letter.clone()),
                )
                .queue_binding(
                    QueueBinding::new(queue)
                        .exchange(&cfg.exchange)
                        .routing_key(routing_key),
                );
        }

        plan
    }

    /// Adds an exchange that receives dead-lettered messages.
    pub fn dead_letter_exchange(mut self, def: ExchangeDefinition) -> Self {
        if !self.dead_letter_exchanges.contains(&def.name) {
            self.dead_letter_exchanges.push(def.name.clone());
        }
        self.add_exchange(def);
        self
    }

    /// Adds a queue that collects dead-lettered messages.
    pub fn dead_letter_queue(mut self, def: QueueDefinition) -> Self {
        if !self.dead_letter_queues.contains(&def.name) {
            self.dead_letter_queues.push(def.name.clone());
        }
        self.add_queue(def);
        self
    }

    /// Adds an exchange unless one with the same name is already present.
    ///
    /// # Returns
    /// true when the exchange was added
    pub fn add_exchange(&mut self, def: ExchangeDefinition) -> bool {
        if self.has_exchange(&def.name) {
            return false;
        }
        self.exchanges.push(def);
        true
    }

    /// Adds a queue unless one with the same name is already present.
    pub fn add_queue(&mut self, def: QueueDefinition) -> bool {
        if self.has_queue(&def.name) {
            return false;
        }
        self.queues.push(def);
        true
    }

    /// Adds a binding unless the same queue/exchange/key triple exists.
    pub fn add_binding(&mut self, binding: QueueBinding) -> bool {
        if self.bindings.contains(&binding) {
            return false;
        }
        self.bindings.push(binding);
        true
    }

    /// Forgets a queue together with its bindings.
    pub fn remove_queue(&mut self, name: &str) {
        self.queues.retain(|q| q.name != name);
        self.bindings.retain(|b| b.queue_name != name);
        self.dead_letter_queues.retain(|q| q != name);
    }

    pub fn remove_binding(&mut self, binding: &QueueBinding) {
        self.bindings.retain(|b| b != binding);
    }

    /// Forgets an exchange together with the bindings that target it.
    pub fn remove_exchange(&mut self, name: &str) {
        self.exchanges.retain(|e| e.name != name);
        self.bindings.retain(|b| b.exchange_name != name);
        self.dead_letter_exchanges.retain(|e| e != name);
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        self.exchanges.iter().any(|e| e.name == name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        self.queues.iter().any(|q| q.name == name)
    }

    pub fn exchanges(&self) -> &[ExchangeDefinition] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueDefinition] {
        &self.queues
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn dead_letter_exchanges(&self) -> &[String] {
        &self.dead_letter_exchanges
    }

    pub fn dead_letter_queues(&self) -> &[String] {
        &self.dead_letter_queues
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty()
    }
}

/// Installs and removes topology plans through a broker.
pub struct AmqpTopology<'tp> {
    broker: &'tp dyn Broker,
}

impl<'tp> AmqpTopology<'tp> {
    pub fn new(broker: &'tp dyn Broker) -> AmqpTopology<'tp> {
        AmqpTopology { broker }
    }

    /// Installs the plan on the broker.
    ///
    /// This method performs the following operations in order:
    /// 1. Declares all exchanges
    /// 2. Declares all queues
    /// 3. Binds queues to exchanges
    ///
    /// # Returns
    /// Ok(()) on success or AmqpError on the first failing declaration
    pub async fn install(&self, plan: &TopologyPlan) -> Result<(), AmqpError> {
        for exch in &plan.exchanges {
            self.broker.declare_exchange(exch).await?;
        }

        for queue in &plan.queues {
            self.broker.declare_queue(queue).await?;
        }

        for binding in &plan.bindings {
            self.broker.bind_queue(binding).await?;
        }

        info!(
            exchanges = plan.exchanges.len(),
            queues = plan.queues.len(),
            bindings = plan.bindings.len(),
            "topology installed"
        );

        Ok(())
    }

    /// Deletes every queue, then every exchange, of the plan.
    ///
    /// Queues go first so no exchange is left with dangling bindings. Each
    /// resource leaves the plan as soon as the broker deleted it, so after a
    /// failure the plan lists exactly what is left.
    pub async fn teardown(&self, plan: &mut TopologyPlan) -> Result<(), AmqpError> {
        let queues: Vec<String> = plan.queues.iter().map(|q| q.name.clone()).collect();
        let exchanges: Vec<String> = plan.exchanges.iter().map(|e| e.name.clone()).collect();

        for queue in &queues {
            let purged = self.broker.delete_queue(queue, false, false).await?;
            plan.remove_queue(queue);
            debug!(queue = queue.as_str(), purged, "queue deleted");
        }

        for exch in &exchanges {
            self.broker.delete_exchange(exch, false).await?;
            plan.remove_exchange(exch);
            debug!(exchange = exch.as_str(), "exchange deleted");
        }

        info!(
            exchanges = exchanges.len(),
            queues = queues.len(),
            "topology removed"
        );

        Ok(())
    }
}
