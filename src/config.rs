// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Manager Configuration
//!
//! `RabbitMQConfig` is the explicit configuration handed to the manager. It can
//! be built in code or loaded from `RABBITMQ_*` environment variables (an
//! optional `.env` file is read first). Every invariant is checked by
//! [`RabbitMQConfig::validate`] before any network call is made.

use crate::{errors::AmqpError, exchange::ExchangeKind};
use std::{collections::HashSet, env, str::FromStr, time::Duration};
use tracing::debug;

pub const ENV_HOST: &str = "RABBITMQ_HOST";
pub const ENV_PORT: &str = "RABBITMQ_PORT";
pub const ENV_USERNAME: &str = "RABBITMQ_USERNAME";
pub const ENV_PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const ENV_VHOST: &str = "RABBITMQ_VHOST";
pub const ENV_EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const ENV_EXCHANGE_TYPE: &str = "RABBITMQ_EXCHANGE_TYPE";
pub const ENV_QUEUES: &str = "RABBITMQ_QUEUES";
pub const ENV_ROUTING_KEYS: &str = "RABBITMQ_ROUTING_KEYS";
pub const ENV_DLX_EXCHANGE: &str = "RABBITMQ_DLX_EXCHANGE";
pub const ENV_DLX_ROUTING_KEY: &str = "RABBITMQ_DLX_ROUTING_KEY";
pub const ENV_DLQ: &str = "RABBITMQ_DLQ";
pub const ENV_MAX_RETRIES: &str = "RABBITMQ_MAX_RETRIES";
pub const ENV_RETRY_DELAY: &str = "RABBITMQ_RETRY_DELAY";
pub const ENV_HEARTBEAT: &str = "RABBITMQ_HEARTBEAT";
pub const ENV_PREFETCH_COUNT: &str = "RABBITMQ_PREFETCH_COUNT";
pub const ENV_PUBLISHER_CONFIRMS: &str = "RABBITMQ_PUBLISHER_CONFIRMS";
pub const ENV_DURABLE: &str = "RABBITMQ_DURABLE";
pub const ENV_CONNECTION_NAME: &str = "RABBITMQ_CONNECTION_NAME";
pub const ENV_ENABLE_LOGGING: &str = "RABBITMQ_ENABLE_LOGGING";
pub const ENV_LOG_LEVEL: &str = "RABBITMQ_LOG_LEVEL";

pub const DEFAULT_DLX_ROUTING_KEY: &str = "dead_letter";

/// Connection, topology and logging settings for a manager instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RabbitMQConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub exchange: String,
    pub exchange_type: ExchangeKind,
    /// Queue names, paired one to one with `routing_keys`.
    pub queues: Vec<String>,
    pub routing_keys: Vec<String>,
    /// Defaults to `{exchange}_dlx` when unset.
    pub dlx_exchange: Option<String>,
    pub dlx_routing_key: String,
    /// Defaults to `{exchange}_dlq` when unset.
    pub dlq: Option<String>,
    /// Number of connection attempts before giving up.
    pub max_retries: u32,
    /// Constant pause between connection attempts.
    pub retry_delay: Duration,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
    /// Unacknowledged deliveries allowed per consumer, 0 for unlimited.
    pub prefetch_count: u16,
    pub publisher_confirms: bool,
    pub durable: bool,
    pub connection_name: String,
    pub enable_logging: bool,
    pub log_level: String,
}

impl Default for RabbitMQConfig {
    fn default() -> Self {
        RabbitMQConfig {
            host: "localhost".to_owned(),
            port: 5672,
            username: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: "/".to_owned(),
            exchange: "default_exchange".to_owned(),
            exchange_type: ExchangeKind::Direct,
            queues: vec![],
            routing_keys: vec![],
            dlx_exchange: None,
            dlx_routing_key: DEFAULT_DLX_ROUTING_KEY.to_owned(),
            dlq: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            heartbeat: 600,
            prefetch_count: 10,
            publisher_confirms: false,
            durable: true,
            connection_name: "rabbitmq-manager".to_owned(),
            enable_logging: true,
            log_level: "info".to_owned(),
        }
    }
}

impl RabbitMQConfig {
    /// Creates a default configuration for the given main exchange.
    pub fn new(exchange: &str) -> Self {
        RabbitMQConfig {
            exchange: exchange.to_owned(),
            ..RabbitMQConfig::default()
        }
    }

    pub fn host(mut self, host: &str, port: u16) -> Self {
        self.host = host.to_owned();
        self.port = port;
        self
    }

    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = username.to_owned();
        self.password = password.to_owned();
        self
    }

    pub fn vhost(mut self, vhost: &str) -> Self {
        self.vhost = vhost.to_owned();
        self
    }

    pub fn exchange_type(mut self, kind: ExchangeKind) -> Self {
        self.exchange_type = kind;
        self
    }

    /// Adds a queue bound to the main exchange with `routing_key`.
    pub fn queue(mut self, name: &str, routing_key: &str) -> Self {
        self.queues.push(name.to_owned());
        self.routing_keys.push(routing_key.to_owned());
        self
    }

    /// Replaces queues and routing keys; the lists are paired by position.
    pub fn queues<Q, K>(mut self, queues: Q, routing_keys: K) -> Self
    where
        Q: IntoIterator,
        Q::Item: Into<String>,
        K: IntoIterator,
        K::Item: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self.routing_keys = routing_keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn dead_letter(mut self, exchange: &str, routing_key: &str) -> Self {
        self.dlx_exchange = Some(exchange.to_owned());
        self.dlx_routing_key = routing_key.to_owned();
        self
    }

    pub fn dead_letter_queue(mut self, name: &str) -> Self {
        self.dlq = Some(name.to_owned());
        self
    }

    pub fn retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn heartbeat(mut self, seconds: u16) -> Self {
        self.heartbeat = seconds;
        self
    }

    pub fn prefetch_count(mut self, count: u16) -> Self {
        self.prefetch_count = count;
        self
    }

    pub fn publisher_confirms(mut self, enabled: bool) -> Self {
        self.publisher_confirms = enabled;
        self
    }

    pub fn logging(mut self, enabled: bool, level: &str) -> Self {
        self.enable_logging = enabled;
        self.log_level = level.to_owned();
        self
    }

    /// Name of the dead-letter exchange, `{exchange}_dlx` unless overridden.
    pub fn dlx_exchange_name(&self) -> String {
        match &self.dlx_exchange {
            Some(name) => name.clone(),
            None => format!("{}_dlx", self.exchange),
        }
    }

    /// Name of the dead-letter queue, `{exchange}_dlq` unless overridden.
    pub fn dlq_name(&self) -> String {
        match &self.dlq {
            Some(name) => name.clone(),
            None => format!("{}_dlq", self.exchange),
        }
    }

    /// Queue names zipped with their routing keys.
    pub fn bindings(&self) -> impl Iterator<Item = (&str, &str)> {
        self.queues
            .iter()
            .map(String::as_str)
            .zip(self.routing_keys.iter().map(String::as_str))
    }

    /// Checks every invariant that can be verified without the broker.
    ///
    /// # Returns
    /// Ok(()) when the configuration is usable or AmqpError::ConfigurationError
    pub fn validate(&self) -> Result<(), AmqpError> {
        if self.queues.len() != self.routing_keys.len() {
            return Err(AmqpError::configuration(format!(
                "{} queues but {} routing keys, each queue needs exactly one routing key",
                self.queues.len(),
                self.routing_keys.len()
            )));
        }

        if self.exchange.trim().is_empty() {
            return Err(AmqpError::configuration("exchange name must not be empty"));
        }

        let dlx = self.dlx_exchange_name();
        if dlx.trim().is_empty() {
            return Err(AmqpError::configuration(
                "dead-letter exchange name must not be empty",
            ));
        }
        if dlx == self.exchange {
            return Err(AmqpError::configuration(format!(
                "dead-letter exchange `{}` is the main exchange, dead-lettered messages would loop",
                dlx
            )));
        }

        let dlq = self.dlq_name();
        if dlq.trim().is_empty() {
            return Err(AmqpError::configuration(
                "dead-letter queue name must not be empty",
            ));
        }

        let mut seen = HashSet::new();
        for queue in &self.queues {
            if queue.trim().is_empty() {
                return Err(AmqpError::configuration("queue names must not be empty"));
            }
            if !seen.insert(queue.as_str()) {
                return Err(AmqpError::configuration(format!(
                    "queue `{}` is configured more than once",
                    queue
                )));
            }
            if *queue == dlq {
                return Err(AmqpError::configuration(format!(
                    "queue `{}` is also the dead-letter queue, dead-lettered messages would loop",
                    queue
                )));
            }
        }

        if self.max_retries == 0 {
            return Err(AmqpError::configuration(
                "max_retries must allow at least one connection attempt",
            ));
        }

        if self.port == 0 {
            return Err(AmqpError::configuration("port must not be 0"));
        }

        Ok(())
    }

    /// Loads the configuration from `RABBITMQ_*` environment variables.
    ///
    /// A `.env` file in the working directory is read first when present.
    /// Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, AmqpError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Loads the configuration through an arbitrary key lookup.
    ///
    /// # Parameters
    /// * `lookup` - Returns the raw value of an environment key, if set
    pub fn from_lookup<F>(lookup: F) -> Result<Self, AmqpError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = RabbitMQConfig::default();
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_owned())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get(ENV_HOST) {
            cfg.host = v;
        }
        if let Some(v) = get(ENV_PORT) {
            cfg.port = parse(ENV_PORT, &v)?;
        }
        if let Some(v) = get(ENV_USERNAME) {
            cfg.username = v;
        }
        if let Some(v) = get(ENV_PASSWORD) {
            cfg.password = v;
        }
        if let Some(v) = get(ENV_VHOST) {
            cfg.vhost = v;
        }
        if let Some(v) = get(ENV_EXCHANGE) {
            cfg.exchange = v;
        }
        if let Some(v) = get(ENV_EXCHANGE_TYPE) {
            cfg.exchange_type = v.parse()?;
        }
        if let Some(v) = get(ENV_QUEUES) {
            cfg.queues = split_list(&v);
        }
        if let Some(v) = get(ENV_ROUTING_KEYS) {
            cfg.routing_keys = split_list(&v);
        }
        cfg.dlx_exchange = get(ENV_DLX_EXCHANGE);
        if let Some(v) = get(ENV_DLX_ROUTING_KEY) {
            cfg.dlx_routing_key = v;
        }
        cfg.dlq = get(ENV_DLQ);
        if let Some(v) = get(ENV_MAX_RETRIES) {
            cfg.max_retries = parse(ENV_MAX_RETRIES, &v)?;
        }
        if let Some(v) = get(ENV_RETRY_DELAY) {
            let secs: f64 = parse(ENV_RETRY_DELAY, &v)?;
            cfg.retry_delay = Duration::try_from_secs_f64(secs).map_err(|_| {
                AmqpError::configuration(format!(
                    "{} must be a non-negative number of seconds",
                    ENV_RETRY_DELAY
                ))
            })?;
        }
        if let Some(v) = get(ENV_HEARTBEAT) {
            cfg.heartbeat = parse(ENV_HEARTBEAT, &v)?;
        }
        if let Some(v) = get(ENV_PREFETCH_COUNT) {
            cfg.prefetch_count = parse(ENV_PREFETCH_COUNT, &v)?;
        }
        if let Some(v) = get(ENV_PUBLISHER_CONFIRMS) {
            cfg.publisher_confirms = parse_bool(ENV_PUBLISHER_CONFIRMS, &v)?;
        }
        if let Some(v) = get(ENV_DURABLE) {
            cfg.durable = parse_bool(ENV_DURABLE, &v)?;
        }
        if let Some(v) = get(ENV_CONNECTION_NAME) {
            cfg.connection_name = v;
        }
        if let Some(v) = get(ENV_ENABLE_LOGGING) {
            cfg.enable_logging = parse_bool(ENV_ENABLE_LOGGING, &v)?;
        }
        if let Some(v) = get(ENV_LOG_LEVEL) {
            cfg.log_level = v;
        }

        debug!(
            host = cfg.host.as_str(),
            port = cfg.port,
            exchange = cfg.exchange.as_str(),
            queues = cfg.queues.len(),
            "configuration loaded from environment"
        );

        Ok(cfg)
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, AmqpError> {
    value
        .parse()
        .map_err(|_| AmqpError::configuration(format!("invalid value `{}` for {}", value, key)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool, AmqpError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AmqpError::configuration(format!(
            "invalid value `{}` for {}, expected true or false",
            value, key
        ))),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}
