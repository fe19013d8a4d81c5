//! Delivery and message types, and the materializer seam that turns raw
//! broker deliveries into application messages.

use crate::error::MaterializeError;
use bytes::Bytes;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;

// ============================================================================
// Raw broker-side types
// ============================================================================

/// Routing and delivery metadata attached to one broker push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Broker-assigned sequence identifier, monotonically increasing per
    /// channel and unique while the channel is open.
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
}

impl Envelope {
    pub fn new(delivery_tag: u64, redelivered: bool, exchange: &str, routing_key: &str) -> Self {
        Self {
            delivery_tag,
            redelivered,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        }
    }
}

/// Opaque header bag carried with a raw delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryProperties {
    pub headers: HashMap<String, Value>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
}

impl DeliveryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, key: impl Into<String>, value: Value) -> Self {
        self.headers.insert(key.into(), value);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// One unit of broker-pushed message data prior to application-level
/// translation. Created by the broker callback and consumed exactly once.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub consumer_tag: String,
    pub envelope: Envelope,
    pub properties: DeliveryProperties,
    pub body: Bytes,
}

impl Delivery {
    pub fn new(
        consumer_tag: impl Into<String>,
        envelope: Envelope,
        properties: DeliveryProperties,
        body: Bytes,
    ) -> Self {
        Self {
            consumer_tag: consumer_tag.into(),
            envelope,
            properties,
            body,
        }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.envelope.delivery_tag
    }
}

// ============================================================================
// Application-side types
// ============================================================================

/// Properties of a materialized application message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub consumer_tag: Option<String>,
    /// Name of the queue the subscription was issued for, resolved from the
    /// consumer-tag map at retrieval time.
    pub consumer_queue: Option<String>,
    pub headers: HashMap<String, Value>,
    pub content_type: Option<String>,
    pub correlation_id: Option<String>,
    pub message_count: u32,
}

/// A message as handed to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub body: Bytes,
    pub properties: MessageProperties,
}

impl Message {
    pub fn new(body: Bytes, properties: MessageProperties) -> Self {
        Self { body, properties }
    }

    pub fn delivery_tag(&self) -> u64 {
        self.properties.delivery_tag
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message[tag={}, queue={}, {} bytes]",
            self.properties.delivery_tag,
            self.properties.consumer_queue.as_deref().unwrap_or("?"),
            self.body.len()
        )
    }
}

// ============================================================================
// Materializer seam
// ============================================================================

/// Translates a raw delivery into an application [`Message`].
///
/// The runtime treats the translation as an external capability; wire-level
/// property conversion lives behind this trait.
pub trait MessageMaterializer: Send + Sync {
    fn to_application_message(
        &self,
        body: Bytes,
        properties: &DeliveryProperties,
        envelope: &Envelope,
    ) -> Result<Message, MaterializeError>;
}

/// Straightforward materializer that copies the delivery header bag and
/// envelope fields verbatim.
#[derive(Debug, Default)]
pub struct DefaultMaterializer;

impl MessageMaterializer for DefaultMaterializer {
    fn to_application_message(
        &self,
        body: Bytes,
        properties: &DeliveryProperties,
        envelope: &Envelope,
    ) -> Result<Message, MaterializeError> {
        let message_properties = MessageProperties {
            delivery_tag: envelope.delivery_tag,
            redelivered: envelope.redelivered,
            exchange: envelope.exchange.clone(),
            routing_key: envelope.routing_key.clone(),
            consumer_tag: None,
            consumer_queue: None,
            headers: properties.headers.clone(),
            content_type: properties.content_type.clone(),
            correlation_id: properties.correlation_id.clone(),
            message_count: 0,
        };
        Ok(Message::new(body, message_properties))
    }
}
