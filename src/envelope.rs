//! Envelope: the wire shape of every message on the bus.
//!
//! Outbound, the publisher flattens the application message into a JSON
//! object and adds a `_metadata` member it fills in itself:
//!
//! ```json
//! { "type": "user.registered", "userId": "u-1", "_metadata": { "service": "auth", "timestamp": 1718000000000 } }
//! ```
//!
//! Inbound, [`Envelope`] splits the body back into the application fields
//! and the parsed [`Metadata`].

use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::bus::Delivery;

/// Key under which envelope metadata travels.
pub const METADATA_KEY: &str = "_metadata";

/// Key used to wrap payloads that are not JSON objects.
pub const DATA_KEY: &str = "data";

/// Service name reported when a message carries no metadata.
pub const UNKNOWN_SERVICE: &str = "unknown";

/// Delivery metadata stamped by the publisher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Name of the producing service.
    pub service: String,
    /// Unix timestamp in milliseconds, taken when `publish` was called.
    pub timestamp: u64,
    /// Request / trace identifier of the originating request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Acting user, if the publisher knows one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl Metadata {
    /// Metadata for `service`, timestamped now.
    pub fn now(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            timestamp: now_ms(),
            request_id: None,
            user_id: None,
        }
    }
}

/// Optional per-publish envelope fields.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub request_id: Option<String>,
    pub user_id: Option<String>,
}

impl PublishOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the request / trace identifier.
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the acting user.
    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// Current time in millis since Unix epoch.
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Serialize `message` and stamp it with `metadata`.
///
/// Any `_metadata` member supplied by the caller is overwritten.
pub fn stamp<T: Serialize + ?Sized>(
    message: &T,
    metadata: &Metadata,
) -> Result<Vec<u8>, serde_json::Error> {
    let mut body = match serde_json::to_value(message)? {
        Value::Object(fields) => fields,
        other => {
            let mut fields = Map::new();
            fields.insert(DATA_KEY.to_string(), other);
            fields
        }
    };
    body.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
    serde_json::to_vec(&Value::Object(body))
}

/// A decoded inbound message.
#[derive(Debug, Clone)]
pub struct Envelope {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    body: Value,
    metadata: Option<Metadata>,
}

impl Envelope {
    /// Decode a raw UTF-8 JSON body.
    ///
    /// A `_metadata` member that does not have the expected shape is
    /// dropped rather than failing the whole message.
    pub fn from_slice(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        bytes: &[u8],
    ) -> Result<Self, serde_json::Error> {
        let mut body: Value = serde_json::from_slice(bytes)?;
        let metadata = match &mut body {
            Value::Object(fields) => fields
                .remove(METADATA_KEY)
                .and_then(|raw| serde_json::from_value::<Metadata>(raw).ok()),
            _ => None,
        };
        Ok(Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            redelivered: false,
            body,
            metadata,
        })
    }

    pub(crate) fn from_delivery(delivery: &Delivery) -> Result<Self, serde_json::Error> {
        let mut envelope = Self::from_slice(
            delivery.exchange.as_str(),
            delivery.routing_key.as_str(),
            &delivery.body,
        )?;
        envelope.redelivered = delivery.redelivered;
        Ok(envelope)
    }

    /// Deserialize the application fields into a typed struct.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.body)
    }

    /// The application fields, without `_metadata`.
    pub fn body(&self) -> &Value {
        &self.body
    }

    pub fn into_body(self) -> Value {
        self.body
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }

    /// The application `type` field, if present.
    pub fn event_type(&self) -> Option<&str> {
        self.body.get("type").and_then(Value::as_str)
    }

    /// The producing service, or `"unknown"`.
    pub fn source_service(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.service.as_str())
            .unwrap_or(UNKNOWN_SERVICE)
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// Whether the broker delivered this message before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }
}
