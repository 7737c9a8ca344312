// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Installs a `tracing` subscriber driven by the manager configuration.

use crate::config::RabbitMQConfig;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs a global fmt subscriber filtered at `cfg.log_level`.
///
/// Does nothing when logging is disabled or a subscriber is already set, so
/// applications keep control of their own logging setup.
///
/// # Returns
/// true when this call installed the subscriber
pub fn init(cfg: &RabbitMQConfig) -> bool {
    if !cfg.enable_logging {
        return false;
    }

    let filter = EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    fmt().with_env_filter(filter).with_target(true).try_init().is_ok()
}
