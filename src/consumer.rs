// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Consumption
//!
//! This module turns broker deliveries into [`Delivery`] values and runs the
//! consume loop that hands them to a caller-supplied [`MessageHandler`].
//!
//! Settlement is explicit: the handler decides whether to `ack`, `nack` or
//! `reject` each delivery. Rejecting without requeue routes the message to the
//! dead-letter exchange only when its queue was declared with dead-letter
//! arguments. The library never retries processing on its own.

use crate::{broker::Broker, errors::AmqpError, otel};
use async_trait::async_trait;
use futures_util::{stream::BoxStream, StreamExt};
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicNackOptions, BasicRejectOptions},
    types::{AMQPValue, FieldTable},
    BasicProperties,
};
use opentelemetry::{
    global,
    trace::{Span, Status},
};
use std::{borrow::Cow, future::Future, sync::Arc};
use tracing::{debug, error, info, warn};

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";

/// Stream of deliveries produced by a consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Settles a delivery at the broker.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Settles deliveries received through `lapin`.
pub(crate) struct LapinAcker(pub(crate) Acker);

#[async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.0
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to ack msg");
                AmqpError::connection("ack message", err)
            })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to nack msg");
                AmqpError::connection("nack message", err)
            })
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.0
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), delivery_tag, "error to reject msg");
                AmqpError::connection("reject message", err)
            })
    }
}

/// A message delivered to a consumer, together with its settlement handle.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub properties: BasicProperties,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("body_len", &self.body.len())
            .finish()
    }
}

impl Delivery {
    /// Builds a delivery settled through `acker`.
    ///
    /// Used by broker implementations; handlers only ever receive deliveries.
    pub fn new(
        delivery_tag: u64,
        exchange: &str,
        routing_key: &str,
        redelivered: bool,
        properties: BasicProperties,
        body: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Delivery {
            delivery_tag,
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub(crate) fn from_lapin(delivery: lapin::message::Delivery) -> Self {
        Delivery {
            delivery_tag: delivery.delivery_tag,
            exchange: delivery.exchange.to_string(),
            routing_key: delivery.routing_key.to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            body: delivery.data,
            acker: Arc::new(LapinAcker(delivery.acker)),
        }
    }

    /// Acknowledges the delivery, removing it from the queue.
    pub async fn ack(&self) -> Result<(), AmqpError> {
        self.acker.ack(self.delivery_tag).await
    }

    /// Negatively acknowledges the delivery.
    ///
    /// With `requeue == false` the broker dead-letters the message when the
    /// queue has dead-letter arguments, and drops it otherwise.
    pub async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.nack(self.delivery_tag, requeue).await
    }

    /// Rejects the delivery; same routing rules as [`Delivery::nack`].
    pub async fn reject(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker.reject(self.delivery_tag, requeue).await
    }

    /// The `type` property set by the publisher, empty when absent.
    pub fn message_type(&self) -> String {
        match self.properties.kind() {
            Some(value) => value.to_string(),
            None => String::new(),
        }
    }

    /// How many times the message was dead-lettered, read from `x-death`.
    pub fn death_count(&self) -> i64 {
        let headers = match self.properties.headers() {
            Some(val) => val.to_owned(),
            None => FieldTable::default(),
        };

        let Some(AMQPValue::FieldArray(deaths)) = headers.inner().get(AMQP_HEADERS_X_DEATH)
        else {
            return 0;
        };

        match deaths.as_slice().first() {
            Some(AMQPValue::FieldTable(table)) => match table.inner().get(AMQP_HEADERS_COUNT) {
                Some(AMQPValue::LongLongInt(count)) => *count,
                Some(AMQPValue::LongInt(count)) => i64::from(*count),
                _ => 0,
            },
            _ => 0,
        }
    }
}

/// Processes deliveries for a consumer.
///
/// Implemented for any `Fn(Delivery) -> impl Future<Output = Result<(), AmqpError>>`,
/// so plain async closures can be passed to the manager.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> Result<(), AmqpError>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(Delivery) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), AmqpError>> + Send,
{
    async fn handle(&self, delivery: Delivery) -> Result<(), AmqpError> {
        (self)(delivery).await
    }
}

/// Consumes `queue` until the stream ends or `shutdown` resolves.
///
/// Each delivery is handed to `handler` inside a consumer span whose parent
/// context is extracted from the delivery headers. Handler failures are logged
/// and consumption continues; the delivery stays unsettled unless the handler
/// settled it. Unsettled deliveries count against the channel prefetch, so a
/// run of failures as long as `prefetch_count` stalls the consumer until the
/// channel closes.
///
/// # Returns
/// The number of deliveries handed to the handler, or AmqpError when the
/// consumer could not be started or cancelled, or the delivery stream failed
pub(crate) async fn consume<H, S>(
    broker: &dyn Broker,
    queue: &str,
    consumer_tag: &str,
    handler: &H,
    shutdown: S,
) -> Result<u64, AmqpError>
where
    H: MessageHandler + ?Sized,
    S: Future<Output = ()> + Send,
{
    let mut stream = broker.consume(queue, consumer_tag).await?;
    info!(queue, consumer_tag, "consumer started");

    let tracer = global::tracer("amqp consumer");
    let mut handled = 0u64;
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            _ = &mut shutdown => {
                info!(queue, consumer_tag, "shutdown requested, cancelling consumer");
                broker.cancel(consumer_tag).await?;
                break;
            }
            next = stream.next() => next,
        };

        let delivery = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(err)) => {
                error!(error = err.to_string(), queue, "error receiving msg");
                return Err(err);
            }
            None => {
                warn!(queue, consumer_tag, "consumer stream ended");
                break;
            }
        };

        let msg_type = delivery.message_type();
        let (_ctx, mut span) = otel::new_span(&delivery.properties, &tracer, queue);

        debug!(
            queue,
            exchange = delivery.exchange.as_str(),
            routing_key = delivery.routing_key.as_str(),
            msg_type = msg_type.as_str(),
            "received msg"
        );

        handled += 1;
        match handler.handle(delivery).await {
            Ok(()) => span.set_status(Status::Ok),
            Err(err) => {
                error!(error = err.to_string(), queue, "handler failed to process msg");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }
        span.end();
    }

    Ok(handled)
}
