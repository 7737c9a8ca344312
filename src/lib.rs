// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Manager
//!
//! A convenience layer over an AMQP 0-9-1 broker. A [`RabbitMQManager`] is
//! built from a [`RabbitMQConfig`], connects with bounded retry, declares a
//! main exchange with its queues and a dead-letter setup, and then offers
//! publishing, consuming, introspection and cleanup on a single channel.
//!
//! [`RabbitMQManager`]: manager::RabbitMQManager
//! [`RabbitMQConfig`]: config::RabbitMQConfig

mod otel;

pub mod broker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod logging;
pub mod manager;
pub mod publisher;
pub mod queue;
pub mod topology;

pub use config::RabbitMQConfig;
pub use consumer::{Delivery, MessageHandler};
pub use errors::AmqpError;
pub use manager::{HealthReport, HealthStatus, RabbitMQManager};
pub use publisher::{HeaderValue, OutgoingMessage};
