// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Manager
//!
//! Two kinds of failure exist. A configuration error is raised while
//! validating parameters, before any network call is made. A connection error
//! covers everything that happens against the broker: exhausted connection
//! retries as well as declare, bind, publish, consume, acknowledge, delete and
//! purge failures.

use thiserror::Error;

/// Represents errors that can occur while managing RabbitMQ resources.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Invalid parameter combination, detected before touching the broker
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Transport or broker-side failure
    #[error("connection error: {0}")]
    ConnectionError(String),
}

impl AmqpError {
    /// Builds a configuration error from anything printable.
    pub fn configuration(msg: impl Into<String>) -> Self {
        AmqpError::ConfigurationError(msg.into())
    }

    /// Builds a connection error describing the failed `operation`.
    ///
    /// # Parameters
    /// * `operation` - What was being attempted, e.g. "declare queue `jobs`"
    /// * `err` - The underlying failure
    pub fn connection(operation: &str, err: impl std::fmt::Display) -> Self {
        AmqpError::ConnectionError(format!("failure to {}: {}", operation, err))
    }

    /// Returns true for errors raised by parameter validation.
    pub fn is_configuration(&self) -> bool {
        matches!(self, AmqpError::ConfigurationError(_))
    }

    /// Returns true for transport and broker-side errors.
    pub fn is_connection(&self) -> bool {
        matches!(self, AmqpError::ConnectionError(_))
    }
}
