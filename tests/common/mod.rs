// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! An in-memory broker with enough AMQP routing semantics to exercise the
//! manager end to end: direct, fanout and topic exchanges, the default
//! exchange, manual settlement and dead-lettering on reject.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use lapin::{
    types::{AMQPValue, FieldArray, FieldTable, LongLongInt, ShortString},
    BasicProperties,
};
use rabbitmq_manager::{
    broker::Broker,
    consumer::{Acknowledger, Delivery, DeliveryStream, AMQP_HEADERS_COUNT, AMQP_HEADERS_X_DEATH},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::{DeadLetterOptions, QueueBinding, QueueDefinition, QueueInfo},
    RabbitMQConfig,
};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: BasicProperties,
    pub redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    messages: VecDeque<StoredMessage>,
    dead_letter: Option<DeadLetterOptions>,
    consumers: u32,
}

#[derive(Debug)]
struct State {
    open: bool,
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<(String, String, String)>,
    unacked: HashMap<u64, (String, StoredMessage)>,
    consumers: HashMap<String, String>,
    next_tag: u64,
    declarations: usize,
    cancelled: Vec<String>,
}

impl Default for State {
    fn default() -> Self {
        State {
            open: true,
            exchanges: HashMap::default(),
            queues: HashMap::default(),
            bindings: Vec::default(),
            unacked: HashMap::default(),
            consumers: HashMap::default(),
            next_tag: 1,
            declarations: 0,
            cancelled: Vec::default(),
        }
    }
}

fn not_found(kind: &str, name: &str) -> AmqpError {
    AmqpError::connection(
        "run broker operation",
        format!("NOT_FOUND - no {} '{}'", kind, name),
    )
}

pub fn topic_matches(pattern: &str, key: &str) -> bool {
    fn go(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => go(&pattern[1..], key) || (!key.is_empty() && go(pattern, &key[1..])),
            (Some(&"*"), Some(_)) => go(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => go(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = key.split('.').collect();
    go(&pattern, &key)
}

impl State {
    fn ensure_open(&self) -> Result<(), AmqpError> {
        if self.open {
            Ok(())
        } else {
            Err(AmqpError::connection("run broker operation", "channel is closed"))
        }
    }

    fn route(&mut self, msg: StoredMessage) -> Result<usize, AmqpError> {
        if msg.exchange.is_empty() {
            return match self.queues.get_mut(&msg.routing_key) {
                Some(queue) => {
                    queue.messages.push_back(msg);
                    Ok(1)
                }
                None => Ok(0),
            };
        }

        let kind = *self
            .exchanges
            .get(&msg.exchange)
            .ok_or_else(|| not_found("exchange", &msg.exchange))?;

        let targets: Vec<String> = self
            .bindings
            .iter()
            .filter(|(_, exchange, _)| *exchange == msg.exchange)
            .filter(|(_, _, key)| match kind {
                ExchangeKind::Direct => *key == msg.routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(key, &msg.routing_key),
                ExchangeKind::Headers => false,
            })
            .map(|(queue, _, _)| queue.clone())
            .collect();

        let mut routed = 0;
        for name in targets {
            if let Some(queue) = self.queues.get_mut(&name) {
                queue.messages.push_back(msg.clone());
                routed += 1;
            }
        }
        Ok(routed)
    }

    fn dead_letter(&mut self, queue: &str, mut msg: StoredMessage) {
        let Some(dl) = self.queues.get(queue).and_then(|q| q.dead_letter.clone()) else {
            return;
        };

        let deaths = msg
            .properties
            .headers()
            .as_ref()
            .and_then(|h| match h.inner().get(AMQP_HEADERS_X_DEATH) {
                Some(AMQPValue::FieldArray(arr)) => arr.as_slice().first().cloned(),
                _ => None,
            })
            .and_then(|v| match v {
                AMQPValue::FieldTable(t) => match t.inner().get(AMQP_HEADERS_COUNT) {
                    Some(AMQPValue::LongLongInt(c)) => Some(*c),
                    _ => None,
                },
                _ => None,
            })
            .unwrap_or(0);

        let mut death = BTreeMap::new();
        death.insert(
            ShortString::from(AMQP_HEADERS_COUNT),
            AMQPValue::LongLongInt(LongLongInt::from(deaths + 1)),
        );
        let mut headers = msg
            .properties
            .headers()
            .as_ref()
            .map(|h| h.inner().clone())
            .unwrap_or_default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(
                FieldTable::from(death),
            )])),
        );

        msg.properties = msg.properties.with_headers(FieldTable::from(headers));
        msg.exchange = dl.exchange;
        msg.routing_key = dl.routing_key;
        msg.redelivered = false;
        let _ = self.route(msg);
    }

    fn settle(&mut self, tag: u64, requeue: bool) {
        let Some((queue, mut msg)) = self.unacked.remove(&tag) else {
            return;
        };

        if requeue {
            msg.redelivered = true;
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_front(msg);
            }
        } else {
            self.dead_letter(&queue, msg);
        }
    }
}

struct InMemoryAcker {
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.state.lock().unwrap().unacked.remove(&delivery_tag);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state.lock().unwrap().settle(delivery_tag, requeue);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.state.lock().unwrap().settle(delivery_tag, requeue);
        Ok(())
    }
}

/// Broker double keeping all state in memory.
#[derive(Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
    end_streams: bool,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        InMemoryBroker::default()
    }

    /// Consumer streams end once the queue is drained instead of idling.
    pub fn ending_streams() -> Self {
        InMemoryBroker {
            end_streams: true,
            ..InMemoryBroker::default()
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn exchange_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().exchanges.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, key: &str) -> bool {
        self.state()
            .bindings
            .iter()
            .any(|(q, e, k)| q == queue && e == exchange && k == key)
    }

    pub fn binding_count(&self) -> usize {
        self.state().bindings.len()
    }

    pub fn messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.state()
            .queues
            .get(queue)
            .map(|q| q.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.messages(queue).into_iter().map(|m| m.body).collect()
    }

    pub fn unacked(&self) -> usize {
        self.state().unacked.len()
    }

    pub fn declarations(&self) -> usize {
        self.state().declarations
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.state().cancelled.clone()
    }

    /// Simulates the broker dropping the connection.
    pub fn drop_connection(&self) {
        self.state().open = false;
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.declarations += 1;
        state
            .exchanges
            .entry(def.name().to_owned())
            .or_insert(def.exchange_kind());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<QueueInfo, AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.declarations += 1;
        let queue = state
            .queues
            .entry(def.name().to_owned())
            .or_insert_with(|| QueueState {
                dead_letter: def.dead_letter().cloned(),
                ..QueueState::default()
            });

        Ok(QueueInfo {
            queue: def.name().to_owned(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers,
        })
    }

    async fn inspect_queue(&self, name: &str) -> Result<QueueInfo, AmqpError> {
        let state = self.state();
        state.ensure_open()?;
        let queue = state.queues.get(name).ok_or_else(|| not_found("queue", name))?;

        Ok(QueueInfo {
            queue: name.to_owned(),
            message_count: queue.messages.len() as u32,
            consumer_count: queue.consumers,
        })
    }

    async fn bind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        if !state.queues.contains_key(binding.queue_name()) {
            return Err(not_found("queue", binding.queue_name()));
        }
        if !state.exchanges.contains_key(binding.exchange_name()) {
            return Err(not_found("exchange", binding.exchange_name()));
        }

        let triple = (
            binding.queue_name().to_owned(),
            binding.exchange_name().to_owned(),
            binding.key().to_owned(),
        );
        if !state.bindings.contains(&triple) {
            state.bindings.push(triple);
        }
        Ok(())
    }

    async fn unbind_queue(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.bindings.retain(|(q, e, k)| {
            !(q == binding.queue_name() && e == binding.exchange_name() && k == binding.key())
        });
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        state.route(StoredMessage {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            properties,
            redelivered: false,
        })?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;

        let drained: Vec<StoredMessage> = {
            let q = state
                .queues
                .get_mut(queue)
                .ok_or_else(|| not_found("queue", queue))?;
            q.consumers += 1;
            q.messages.drain(..).collect()
        };
        state
            .consumers
            .insert(consumer_tag.to_owned(), queue.to_owned());

        let acker: Arc<dyn Acknowledger> = Arc::new(InMemoryAcker {
            state: self.state.clone(),
        });

        let mut deliveries = Vec::with_capacity(drained.len());
        for msg in drained {
            let tag = state.next_tag;
            state.next_tag += 1;
            state.unacked.insert(tag, (queue.to_owned(), msg.clone()));

            deliveries.push(Ok(Delivery::new(
                tag,
                &msg.exchange,
                &msg.routing_key,
                msg.redelivered,
                msg.properties,
                msg.body,
                acker.clone(),
            )));
        }

        let ready = stream::iter(deliveries);
        if self.end_streams {
            Ok(ready.boxed())
        } else {
            Ok(ready.chain(stream::pending()).boxed())
        }
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        if let Some(queue) = state.consumers.remove(consumer_tag) {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.consumers = q.consumers.saturating_sub(1);
            }
        }
        state.cancelled.push(consumer_tag.to_owned());
        Ok(())
    }

    async fn delete_queue(
        &self,
        name: &str,
        if_unused: bool,
        if_empty: bool,
    ) -> Result<u32, AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;

        let Some(queue) = state.queues.get(name) else {
            return Ok(0);
        };
        if if_unused && queue.consumers > 0 {
            return Err(AmqpError::connection(
                "delete queue",
                format!("PRECONDITION_FAILED - queue '{}' in use", name),
            ));
        }
        if if_empty && !queue.messages.is_empty() {
            return Err(AmqpError::connection(
                "delete queue",
                format!("PRECONDITION_FAILED - queue '{}' not empty", name),
            ));
        }

        let removed = state
            .queues
            .remove(name)
            .map(|q| q.messages.len() as u32)
            .unwrap_or(0);
        state.bindings.retain(|(q, _, _)| q != name);
        Ok(removed)
    }

    async fn delete_exchange(&self, name: &str, if_unused: bool) -> Result<(), AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;

        if if_unused && state.bindings.iter().any(|(_, e, _)| e == name) {
            return Err(AmqpError::connection(
                "delete exchange",
                format!("PRECONDITION_FAILED - exchange '{}' in use", name),
            ));
        }

        state.exchanges.remove(name);
        state.bindings.retain(|(_, e, _)| e != name);
        Ok(())
    }

    async fn purge_queue(&self, name: &str) -> Result<u32, AmqpError> {
        let mut state = self.state();
        state.ensure_open()?;
        let queue = state
            .queues
            .get_mut(name)
            .ok_or_else(|| not_found("queue", name))?;

        let purged = queue.messages.len() as u32;
        queue.messages.clear();
        Ok(purged)
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.state().open = false;
        Ok(())
    }
}

/// The `orders` setup used across the integration tests.
pub fn orders_config() -> RabbitMQConfig {
    RabbitMQConfig::new("orders")
        .queues(["new_orders", "pending_orders"], ["orders.new", "orders.pending"])
        .logging(false, "info")
}

