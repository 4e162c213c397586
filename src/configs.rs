// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Configuration
//!
//! Every setting the messaging core needs is supplied from outside: an optional
//! `config/default` file, then environment variables prefixed with `AMQP_`
//! using `__` between section and key (for example `AMQP_RABBITMQ__HOST` or
//! `AMQP_CONSUMER__CONCURRENCY`). A `.env` file is read first when present.
//! Missing values fall back to the defaults below.

use crate::errors::AmqpError;
use config::{Config, Environment, File};
use serde::Deserialize;
use std::time::Duration;

pub const ENV_PREFIX: &str = "AMQP";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Configs {
    pub app: AppConfigs,
    pub rabbitmq: RabbitMQConfigs,
    pub backoff: BackoffConfigs,
    pub topology: TopologyConfigs,
    pub consumer: ConsumerConfigs,
    pub publisher: PublisherConfigs,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfigs {
    /// Used as the AMQP connection name.
    pub name: String,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "rabbitmq-tutorial".to_owned(),
        }
    }
}

/// Broker address and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vhost: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: String::new(),
        }
    }
}

/// Reconnect backoff: `initial_ms`, multiplied by `multiplier` after every
/// failed attempt, never above `max_ms`, at most `max_attempts` attempts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BackoffConfigs {
    pub initial_ms: u64,
    pub max_ms: u64,
    pub multiplier: u32,
    pub max_attempts: u32,
}

impl Default for BackoffConfigs {
    fn default() -> Self {
        Self {
            initial_ms: 1_000,
            max_ms: 30_000,
            multiplier: 2,
            max_attempts: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopologyConfigs {
    pub exchange: String,
    pub queue: String,
    pub routing_key: String,
    /// Defaults to `<exchange>.dlx`
    pub dead_letter_exchange: Option<String>,
    /// Defaults to `<queue>.dlq`
    pub dead_letter_queue: Option<String>,
    pub dead_letter_routing_key: String,
    pub durable: bool,
    pub quorum: bool,
}

impl Default for TopologyConfigs {
    fn default() -> Self {
        Self {
            exchange: "tutorialQueue".to_owned(),
            queue: "tutorialQueue".to_owned(),
            routing_key: "tutorial".to_owned(),
            dead_letter_exchange: None,
            dead_letter_queue: None,
            dead_letter_routing_key: "deadLetter".to_owned(),
            durable: true,
            quorum: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfigs {
    /// Number of workers, also used as the channel prefetch.
    pub concurrency: usize,
    /// Requeues allowed for a retryable failure before the message is dead-lettered.
    pub max_requeue: u32,
}

impl Default for ConsumerConfigs {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_requeue: 3,
        }
    }
}

impl ConsumerConfigs {
    pub(crate) fn prefetch(&self) -> u16 {
        u16::try_from(self.concurrency.max(1)).unwrap_or(u16::MAX)
    }
}

/// What a publish does while the connection is down.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutagePolicy {
    #[default]
    FailFast,
    /// Hold the caller until the connection is back, up to `outage_wait_ms`.
    Wait,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfigs {
    pub confirms: bool,
    pub confirm_timeout_ms: u64,
    pub outage: OutagePolicy,
    pub outage_wait_ms: u64,
}

impl Default for PublisherConfigs {
    fn default() -> Self {
        Self {
            confirms: true,
            confirm_timeout_ms: 5_000,
            outage: OutagePolicy::FailFast,
            outage_wait_ms: 30_000,
        }
    }
}

impl PublisherConfigs {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn outage_wait(&self) -> Duration {
        Duration::from_millis(self.outage_wait_ms)
    }
}

impl Configs {
    /// Loads `.env`, the optional `config/default` file and `AMQP_*` variables.
    pub fn load() -> Result<Configs, AmqpError> {
        dotenvy::dotenv().ok();

        let cfg = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let configs: Configs = cfg.try_deserialize()?;
        configs.validate()?;

        Ok(configs)
    }

    fn validate(&self) -> Result<(), AmqpError> {
        if self.consumer.concurrency == 0 {
            return Err(AmqpError::ConfigError(
                "consumer.concurrency must be at least 1".to_owned(),
            ));
        }

        if self.backoff.multiplier == 0 || self.backoff.initial_ms == 0 {
            return Err(AmqpError::ConfigError(
                "backoff.initial_ms and backoff.multiplier must be positive".to_owned(),
            ));
        }

        Ok(())
    }
}
