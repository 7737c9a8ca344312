// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel
//!
//! This module establishes the connection to RabbitMQ, retrying transient
//! failures a bounded number of times with a constant delay, and opens the
//! single channel every manager operation goes through. [`AmqpChannel`]
//! implements [`Broker`] on top of `lapin`.

use crate::{
    broker::Broker,
    config::RabbitMQConfig,
    consumer::{Delivery, DeliveryStream},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    queue::{QueueBinding, QueueDefinition, QueueInfo},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions,
        QueueDeleteOptions, QueuePurgeOptions,
    },
    publisher_confirm::Confirmation,
    types::{FieldTable, LongString},
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error, info, warn};

/// AMQP reply code for a normal shutdown
const REPLY_SUCCESS: u16 = 200;

/// Runs `attempt` up to `max_attempts` times, sleeping `delay` between tries.
///
/// The delay is constant: no backoff growth and no jitter.
///
/// # Returns
/// The first successful result, or the last error once attempts run out
pub async fn retry_fixed<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut current = 1;

    loop {
        match attempt(current).await {
            Ok(value) => return Ok(value),
            Err(err) if current >= max_attempts => return Err(err),
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    attempt = current,
                    max_attempts,
                    "attempt failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                current += 1;
            }
        }
    }
}

/// Builds the connection URI from the configuration.
///
/// Credentials and vhost are set field by field, so none of them need
/// percent-encoding.
pub fn amqp_uri(cfg: &RabbitMQConfig) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: cfg.username.clone(),
                password: cfg.password.clone(),
            },
            host: cfg.host.clone(),
            port: cfg.port,
        },
        vhost: cfg.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(cfg.heartbeat),
            ..AMQPQueryString::default()
        },
    }
}

/// An open connection with the single channel used for every operation.
pub struct AmqpChannel {
    connection: Arc<Connection>,
    channel: Arc<Channel>,
}

impl AmqpChannel {
    /// Opens a connection and a channel, without retrying.
    ///
    /// Applies the configured prefetch (QoS) and enables publisher confirms
    /// when requested.
    pub async fn open(cfg: &RabbitMQConfig) -> Result<AmqpChannel, AmqpError> {
        debug!(host = cfg.host.as_str(), port = cfg.port, "creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(cfg.connection_name.clone()));

        let conn = match Connection::connect_uri(amqp_uri(cfg), options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::connection(
                    &format!("connect to {}:{}", cfg.host, cfg.port),
                    err,
                ))
            }
        }?;
        debug!("amqp connected");

        let setup = async {
            debug!("creating amqp channel...");
            let channel = conn.create_channel().await.map_err(|err| {
                error!(error = err.to_string(), "error to create the channel");
                AmqpError::connection("create a channel", err)
            })?;

            if cfg.prefetch_count > 0 {
                channel
                    .basic_qos(cfg.prefetch_count, BasicQosOptions { global: false })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to configure qos");
                        AmqpError::connection("configure qos", err)
                    })?;
            }

            if cfg.publisher_confirms {
                channel
                    .confirm_select(ConfirmSelectOptions { nowait: false })
                    .await
                    .map_err(|err| {
                        error!(error = err.to_string(), "failure to enable publisher confirms");
                        AmqpError::connection("enable publisher confirms", err)
                    })?;
            }

            Ok::<_, AmqpError>(channel)
        };

        let channel = close_on_error(setup.await, || async {
            conn.close(REPLY_SUCCESS, "channel setup failed")
                .await
                .map_err(|err| AmqpError::connection("close the connection", err))
        })
        .await?;

        debug!("channel created");
        Ok(AmqpChannel {
            connection: Arc::new(conn),
            channel: Arc::new(channel),
        })
    }

    pub fn channel(&self) -> Arc<Channel> {
        self.channel.clone()
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.connection.clone()
    }
}

/// Runs `cleanup` when `result` is an error, then returns `result` unchanged.
///
/// A failing cleanup is logged; the original error is the one reported.
pub(crate) async fn close_on_error<T, C, Fut>(
    result: Result<T, AmqpError>,
    cleanup: C,
) -> Result<T, AmqpError>
where
    C: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), AmqpError>>,
{
    if result.is_err() {
        if let Err(err) = cleanup().await {
            warn!(error = err.to_string(), "failure to release connection after error");
        }
    }
    result
}

/// Connects to RabbitMQ, retrying up to `max_retries` times.
///
/// Attempts are strictly sequential with `retry_delay` between them.
///
/// # Returns
/// The open channel, or AmqpError::ConnectionError once retries are exhausted
pub async fn connect_with_retry(cfg: &RabbitMQConfig) -> Result<AmqpChannel, AmqpError> {
    let result = retry_fixed(cfg.max_retries, cfg.retry_delay, |attempt| {
        info!(
            attempt,
            max_retries = cfg.max_retries,
            host = cfg.host.as_str(),
            port = cfg.port,
            "connecting to rabbitmq"
        );
        AmqpChannel::open(cfg)
    })
    .await;

    match result {
        Ok(channel) => {
            info!(host = cfg.host.as_str(), port = cfg.port, "connected to rabbitmq");
            Ok(channel)
        }
        Err(err) => {
            error!(
                error = err.to_string(),
                attempts = cfg.max_retries,
                "max connection attempts reached, giving up"
            );
            Err(AmqpError::ConnectionError(format!(
                "unable to connect to {}:{} after {} attempts: {}",
                cfg.host, cfg.port, cfg.max_retries, err
            )))
        }
    }
}

#[async_trait]
impl Broker for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                def.declare_options(),
                def.arguments(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the exchange"
                );
                Err(AmqpError::connection(
                    &format!("declare exchange `{}`", def.name),
                    err,
                ))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(&def.name, def.declare_options(), def.arguments())
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name.as_str(),
                    "error to declare the queue"
                );
                Err(AmqpError::connection(
                    &format!("declare queue `{}`", def.name),
                    err,
                ))
            }
            Ok(queue) => {
                debug!("queue: {} was created", def.name);
                Ok(QueueInfo {
                    queue: queue.name().to_string(),
                    message_count: queue.message_count(),
                    consumer_count: queue.consumer_count(),
                })
            }
        }
    }

    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to inspect the queue");
                AmqpError::connection(&format!("inspect queue `{}`", name), err)
            })?;

        Ok(QueueInfo {
            queue: name.to_owned(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        debug!(
            "binding queue: {} to the exchange: {} with the key: {}",
            binding.queue_name, binding.exchange_name, binding.routing_key
        );

        self.channel
            .queue_bind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                QueueBindOptions { nowait: false },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                AmqpError::connection(
                    &format!(
                        "bind queue `{}` to exchange `{}`",
                        binding.queue_name, binding.exchange_name
                    ),
                    err,
                )
            })
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.channel
            .queue_unbind(
                &binding.queue_name,
                &binding.exchange_name,
                &binding.routing_key,
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to unbind queue from exchange");
                AmqpError::connection(
                    &format!(
                        "unbind queue `{}` from exchange `{}`",
                        binding.queue_name, binding.exchange_name
                    ),
                    err,
                )
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                body,
                properties,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::connection("publish", err)
            })?;

        match confirm.await {
            Ok(Confirmation::Nack(_)) => {
                error!(exchange, routing_key, "broker refused the message");
                Err(AmqpError::ConnectionError(format!(
                    "broker nacked message for exchange `{}`",
                    exchange
                )))
            }
            Ok(_) => Ok(()),
            Err(err) => {
                error!(error = err.to_string(), "error waiting for publisher confirm");
                Err(AmqpError::connection("confirm publish", err))
            }
        }
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                AmqpError::connection(&format!("consume queue `{}`", queue), err)
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(Delivery::from_lapin(delivery)),
                Err(err) => Err(AmqpError::connection("receive delivery", err)),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), consumer_tag, "error to cancel consumer");
                AmqpError::connection(&format!("cancel consumer `{}`", consumer_tag), err)
            })
    }

    async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        self.channel
            .queue_delete(
                name,
                QueueDeleteOptions {
                    if_unused,
                    if_empty,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the queue");
                AmqpError::connection(&format!("delete queue `{}`", name), err)
            })
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        self.channel
            .exchange_delete(
                name,
                ExchangeDeleteOptions {
                    if_unused,
                    nowait: false,
                },
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to delete the exchange");
                AmqpError::connection(&format!("delete exchange `{}`", name), err)
            })
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        self.channel
            .queue_purge(name, QueuePurgeOptions { nowait: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name, "error to purge the queue");
                AmqpError::connection(&format!("purge queue `{}`", name), err)
            })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), AmqpError> {
        if self.channel.status().connected() {
            debug!("closing amqp channel...");
            self.channel
                .close(REPLY_SUCCESS, "closing channel")
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to close the channel");
                    AmqpError::connection("close the channel", err)
                })?;
        }

        if self.connection.status().connected() {
            debug!("closing amqp connection...");
            self.connection
                .close(REPLY_SUCCESS, "closing connection")
                .await
                .map_err(|err| {
                    error!(error = err.to_string(), "error to close the connection");
                    AmqpError::connection("close the connection", err)
                })?;
        }

        info!("amqp connection closed");
        Ok(())
    }
}
