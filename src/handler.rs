// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Consumer Handler
//!
//! Application code receives messages through `ConsumerHandler`. The returned
//! `HandlerError` tells the consumer whether the message should be retried or
//! given up on and dead-lettered.

use crate::{consumer::DeliveryHandle, message::Message};
use async_trait::async_trait;
use opentelemetry::Context;
use thiserror::Error;

/// Application-level failure returned by a handler.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The message may succeed later, requeue it.
    #[error("retryable failure: {0}")]
    Retryable(String),

    /// The message will never succeed, dead-letter it.
    #[error("fatal failure: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

/// Processes one message at a time.
///
/// A handler may settle `handle` itself; when it does not, the consumer acks on
/// `Ok`, requeues on `Retryable` while the requeue budget lasts, and
/// dead-letters otherwise.
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(
        &self,
        ctx: &Context,
        msg: &Message,
        handle: &DeliveryHandle,
    ) -> Result<(), HandlerError>;
}
