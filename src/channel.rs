// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Channel Management
//!
//! This module implements the broker traits on top of lapin. `AmqpConnector`
//! builds the connection URI from the configuration and opens connections,
//! `AmqpConnection` watches for unexpected closure and hands out channels,
//! and `AmqpChannel` maps declarations, publishing and consuming onto AMQP
//! methods.

use crate::{
    broker::{
        Acknowledger, BrokerChannel, BrokerConnection, Confirmation, Connector, DeliveryStream,
        Incoming, PendingConfirm,
    },
    configs::{AppConfigs, RabbitMQConfigs},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::{Message, AMQP_HEADERS_COUNT, AMQP_HEADERS_DELIVERY_COUNT, AMQP_HEADERS_X_DEATH},
    queue::{
        QueueBinding, QueueDefinition, AMQP_HEADERS_DEAD_LETTER_EXCHANGE,
        AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY, AMQP_HEADERS_MAX_LENGTH, AMQP_HEADERS_MESSAGE_TTL,
        AMQP_HEADERS_QUEUE_TYPE, AMQP_QUORUM_QUEUE_TYPE,
    },
};
use async_trait::async_trait;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation as AmqpConfirmation,
    types::{AMQPValue, FieldTable, LongInt, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Persistent delivery mode, messages survive a broker restart on durable queues
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Opens lapin connections to the configured broker.
pub struct AmqpConnector {
    uri: String,
    connection_name: String,
}

impl AmqpConnector {
    pub fn new(rabbitmq: &RabbitMQConfigs, app: &AppConfigs) -> AmqpConnector {
        let uri = format!(
            "amqp://{}:{}@{}:{}/{}",
            rabbitmq.user, rabbitmq.password, rabbitmq.host, rabbitmq.port, rabbitmq.vhost
        );

        AmqpConnector {
            uri,
            connection_name: app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerConnection>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let (closed_tx, closed) = watch::channel(false);
        conn.on_error(move |err| {
            warn!(error = err.to_string(), "amqp connection closed");
            closed_tx.send_replace(true);
        });

        Ok(Arc::new(AmqpConnection { conn, closed }))
    }
}

pub struct AmqpConnection {
    conn: Connection,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp channel...");
        match self.conn.create_channel().await {
            Ok(channel) => {
                debug!("channel created");
                Ok(Arc::new(AmqpChannel { channel }))
            }
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }
    }

    fn is_open(&self) -> bool {
        !*self.closed.borrow() && self.conn.status().connected()
    }

    async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.conn.close(200, "closing").await.map_err(|err| {
            error!(error = err.to_string(), "failure to close the connection");
            AmqpError::ConnectionError(err.to_string())
        })
    }
}

pub struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!("creating exchange: {}", def.name);

        match self
            .channel
            .exchange_declare(
                &def.name,
                def.kind.into(),
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
        {
            Err(err) => {
                error!(
                    error = err.to_string(),
                    name = def.name,
                    "error to declare the exchange"
                );
                Err(declare_error(&err, &def.name, AmqpError::DeclareExchangeError))
            }
            _ => {
                debug!("exchange: {} was created", def.name);
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!("creating queue: {}", def.name);

        match self
            .channel
            .queue_declare(
                &def.name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), name = def.name, "error to declare the queue");
                Err(declare_error(&err, &def.name, AmqpError::DeclareQueueError))
            }
            _ => {
                debug!("queue: {} was created", def.name);
                Ok(())
            }
        }
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
                AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                )
            })
    }

    async fn enable_confirms(&self) -> Result<(), AmqpError> {
        self.channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to enable publisher confirms");
                AmqpError::ChannelError(err.to_string())
            })
    }

    async fn publish(
        &self,
        exchange: &str,
        message: &Message,
    ) -> Result<PendingConfirm, AmqpError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                message.routing_key(),
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                message.payload(),
                message_properties(message),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error publishing message");
                AmqpError::PublishingError(err.to_string())
            })?;

        Ok(async move {
            match confirm.await {
                Ok(AmqpConfirmation::Ack(_)) => Ok(Confirmation::Ack),
                Ok(AmqpConfirmation::Nack(_)) => Ok(Confirmation::Nack),
                Ok(AmqpConfirmation::NotRequested) => Ok(Confirmation::NotRequested),
                Err(err) => Err(AmqpError::PublishingError(err.to_string())),
            }
        }
        .boxed())
    }

    async fn qos(&self, prefetch: u16) -> Result<(), AmqpError> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to configure qos");
                AmqpError::QoSDeclarationError(err.to_string())
            })
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, AmqpError> {
        let consumer = match self
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
        {
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Err(AmqpError::ConsumerDeclarationError(queue.to_owned()))
            }
            Ok(c) => Ok(c),
        }?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(incoming(delivery)),
                Err(err) => Err(AmqpError::ConsumerError(err.to_string())),
            })
            .boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), AmqpError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|err| AmqpError::ConsumerError(err.to_string()))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.channel
            .close(200, "closing")
            .await
            .map_err(|err| AmqpError::ChannelError(err.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error whiling ack msg");
                AmqpError::AckMessageError
            })
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), requeue, "error whiling nack msg");
                if requeue {
                    AmqpError::RequeuingMessageError
                } else {
                    AmqpError::NackMessageError
                }
            })
    }
}

/// A redeclaration with different parameters is refused with PRECONDITION_FAILED.
fn declare_error(err: &lapin::Error, name: &str, fallback: fn(String) -> AmqpError) -> AmqpError {
    match err {
        lapin::Error::ProtocolError(amqp_err)
            if matches!(
                amqp_err.kind(),
                AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED)
            ) =>
        {
            AmqpError::TopologyConflictError(name.to_owned())
        }
        _ => fallback(name.to_owned()),
    }
}

fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if def.quorum {
        args.insert(
            ShortString::from(AMQP_HEADERS_QUEUE_TYPE),
            AMQPValue::LongString(LongString::from(AMQP_QUORUM_QUEUE_TYPE)),
        );
    }

    if let Some(exchange) = &def.dead_letter_exchange {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_EXCHANGE),
            AMQPValue::LongString(LongString::from(exchange.clone())),
        );
    }

    if let Some(key) = &def.dead_letter_routing_key {
        args.insert(
            ShortString::from(AMQP_HEADERS_DEAD_LETTER_ROUTING_KEY),
            AMQPValue::LongString(LongString::from(key.clone())),
        );
    }

    if let Some(ttl) = def.ttl {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongInt(LongInt::from(ttl)),
        );
    }

    if let Some(max) = def.max_length {
        args.insert(
            ShortString::from(AMQP_HEADERS_MAX_LENGTH),
            AMQPValue::LongInt(LongInt::from(max)),
        );
    }

    FieldTable::from(args)
}

fn message_properties(message: &Message) -> BasicProperties {
    let mut headers = BTreeMap::new();
    for (key, value) in message.attributes() {
        headers.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    let props = BasicProperties::default()
        .with_message_id(ShortString::from(message.id().to_owned()))
        .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
        .with_headers(FieldTable::from(headers));

    match message.content_type() {
        Some(content_type) => props.with_content_type(ShortString::from(content_type.to_owned())),
        None => props,
    }
}

fn incoming(delivery: Delivery) -> Incoming {
    let headers = delivery.properties.headers().clone().unwrap_or_default();

    let id = match delivery.properties.message_id() {
        Some(id) => id.to_string(),
        None => {
            debug!("delivery without message id, generating one");
            Uuid::new_v4().to_string()
        }
    };

    let mut attributes = BTreeMap::new();
    for (key, value) in headers.inner() {
        if let Some(value) = header_as_string(value) {
            attributes.insert(key.to_string(), value);
        }
    }

    let mut message = Message::new(delivery.routing_key.as_str(), delivery.data)
        .with_id(&id)
        .with_attributes(attributes);
    if let Some(content_type) = delivery.properties.content_type() {
        message = message.with_content_type(content_type.as_str());
    }

    Incoming {
        message,
        redelivered: delivery.redelivered,
        delivery_count: delivery_count(&headers),
        acker: Arc::new(AmqpAcker {
            acker: delivery.acker,
        }),
    }
}

/// Earlier delivery attempts: `x-delivery-count` from quorum queues, otherwise
/// the count of the first `x-death` entry.
fn delivery_count(headers: &FieldTable) -> u32 {
    if let Some(count) = headers
        .inner()
        .get(AMQP_HEADERS_DELIVERY_COUNT)
        .and_then(header_as_u32)
    {
        return count;
    }

    headers
        .inner()
        .get(AMQP_HEADERS_X_DEATH)
        .and_then(|value| value.as_array())
        .and_then(|arr| arr.as_slice().first())
        .and_then(|value| value.as_field_table())
        .and_then(|table| table.inner().get(AMQP_HEADERS_COUNT))
        .and_then(header_as_u32)
        .unwrap_or_default()
}

fn header_as_u32(value: &AMQPValue) -> Option<u32> {
    match value {
        AMQPValue::ShortShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::ShortInt(v) => u32::try_from(*v).ok(),
        AMQPValue::ShortUInt(v) => Some(u32::from(*v)),
        AMQPValue::LongInt(v) => u32::try_from(*v).ok(),
        AMQPValue::LongUInt(v) => Some(*v),
        AMQPValue::LongLongInt(v) => u32::try_from(*v).ok(),
        _ => None,
    }
}

fn header_as_string(value: &AMQPValue) -> Option<String> {
    match value {
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .map(str::to_owned)
            .map_err(|e| error!("Error decoding header value {:?}", e))
            .ok(),
        AMQPValue::ShortString(v) => Some(v.to_string()),
        AMQPValue::Boolean(v) => Some(v.to_string()),
        AMQPValue::Timestamp(v) => Some(v.to_string()),
        other => header_as_u32(other).map(|v| v.to_string()),
    }
}
