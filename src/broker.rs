// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Operations
//!
//! The `Broker` trait is the seam between the manager and the AMQP transport.
//! It lists every declarative call the manager issues. [`AmqpChannel`]
//! implements it on top of `lapin`.
//!
//! [`AmqpChannel`]: crate::channel::AmqpChannel

use crate::{
    consumer::DeliveryStream,
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use lapin::BasicProperties;

/// Declarative operations against a single broker channel.
///
/// Every method maps one-to-one onto an AMQP 0-9-1 method. Declarations are
/// idempotent at the broker: re-declaring an identical resource succeeds and
/// creates nothing new.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Broker: Send + Sync {
    /// Declares an exchange (`exchange.declare`).
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    /// Declares a queue (`queue.declare`) and reports its current counts.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError>;

    /// Passively declares a queue to read its counts without creating it.
    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, AmqpError>;

    /// Binds a queue to an exchange (`queue.bind`).
    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Removes a binding (`queue.unbind`).
    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Publishes a message body (`basic.publish`).
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError>;

    /// Starts a consumer (`basic.consume`) with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError>;

    /// Cancels a consumer (`basic.cancel`).
    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError>;

    /// Deletes a queue and returns the number of messages it held.
    async fn delete_queue(&self, name: &str, if_unused: bool, if_empty: bool)
        -> Result<u32, AmqpError>;

    /// Deletes an exchange.
    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError>;

    /// Purges a queue and returns the number of messages removed.
    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError>;

    /// Reports whether the connection and channel are open.
    fn is_open(&self) -> bool;

    /// Closes the channel and the connection.
    async fn close(&self) -> Result<(), AmqpError>;
}
