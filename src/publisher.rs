// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Publishing
//!
//! Builds AMQP properties for outgoing messages and hands them to the broker.
//! Bodies are opaque bytes; serialization is left to the caller. Every message
//! gets a fresh message id and the current OpenTelemetry context in its
//! headers.

use crate::{broker::Broker, errors::AmqpError, otel};
use lapin::{
    types::{
        AMQPValue, FieldTable, LongInt, LongLongInt, LongString, LongUInt, ShortInt, ShortString,
    },
    BasicProperties,
};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;
use uuid::Uuid;

/// Default content type for opaque bodies
pub const OCTET_STREAM_CONTENT_TYPE: &str = "application/octet-stream";
/// Delivery mode marking a message persistent
pub const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Typed header values attached to an outgoing message.
#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    ShortString(String),
    LongString(String),
    Int(i16),
    LongInt(i32),
    LongLongInt(i64),
    LongUint(u32),
    Bool(bool),
}

impl From<HeaderValue> for AMQPValue {
    fn from(value: HeaderValue) -> Self {
        match value {
            HeaderValue::ShortString(v) => AMQPValue::ShortString(ShortString::from(v)),
            HeaderValue::LongString(v) => AMQPValue::LongString(LongString::from(v)),
            HeaderValue::Int(v) => AMQPValue::ShortInt(ShortInt::from(v)),
            HeaderValue::LongInt(v) => AMQPValue::LongInt(LongInt::from(v)),
            HeaderValue::LongLongInt(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            HeaderValue::LongUint(v) => AMQPValue::LongUInt(LongUInt::from(v)),
            HeaderValue::Bool(v) => AMQPValue::Boolean(v),
        }
    }
}

/// A message to publish, with optional metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub content_type: Option<String>,
    pub msg_type: Option<String>,
    pub headers: HashMap<String, HeaderValue>,
    pub persistent: bool,
}

impl OutgoingMessage {
    pub fn new(exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Self {
        OutgoingMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.into(),
            content_type: None,
            msg_type: None,
            headers: HashMap::default(),
            persistent: false,
        }
    }

    pub fn content_type(mut self, content_type: &str) -> Self {
        self.content_type = Some(content_type.to_owned());
        self
    }

    pub fn msg_type(mut self, msg_type: &str) -> Self {
        self.msg_type = Some(msg_type.to_owned());
        self
    }

    pub fn header(mut self, key: &str, value: HeaderValue) -> Self {
        self.headers.insert(key.to_owned(), value);
        self
    }

    /// Asks the broker to persist the message (delivery mode 2).
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    /// Builds the AMQP properties for this message.
    ///
    /// Caller headers are applied after the trace context, so a caller header
    /// with a propagation key wins.
    pub(crate) fn properties(&self) -> BasicProperties {
        let mut headers = BTreeMap::<ShortString, AMQPValue>::default();
        otel::inject_current(&mut headers);

        for (key, value) in &self.headers {
            headers.insert(ShortString::from(key.clone()), value.clone().into());
        }

        let content_type = self
            .content_type
            .as_deref()
            .unwrap_or(OCTET_STREAM_CONTENT_TYPE);

        let mut props = BasicProperties::default()
            .with_content_type(ShortString::from(content_type))
            .with_message_id(ShortString::from(Uuid::new_v4().to_string()))
            .with_headers(FieldTable::from(headers));

        if let Some(msg_type) = &self.msg_type {
            props = props.with_type(ShortString::from(msg_type.clone()));
        }

        if self.persistent {
            props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
        }

        props
    }
}

/// Publishes `msg` through `broker`.
pub(crate) async fn publish(broker: &dyn Broker, msg: &OutgoingMessage) -> Result<(), AmqpError> {
    broker
        .publish(&msg.exchange, &msg.routing_key, &msg.body, msg.properties())
        .await?;

    debug!(
        exchange = msg.exchange.as_str(),
        routing_key = msg.routing_key.as_str(),
        bytes = msg.body.len(),
        "message published"
    );

    Ok(())
}
