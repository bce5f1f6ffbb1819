//! JSON message envelope
//!
//! Every message crossing the broker is a JSON object carrying a set of
//! default headers (application name and version, event category and name,
//! origin server-id) plus schema-specific fields. [`Envelope`] wraps the
//! raw object; [`RequestKind`] fingerprints the known request schemas and
//! drives validation and default-header injection.

mod schema;

pub use schema::RequestKind;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Header naming the reply queue of the requester
pub const SERVER_ID: &str = "Server-ID";
/// Header carrying the message correlation id
pub const MSG_ID: &str = "Msg-ID";
/// Header naming the requested media
pub const MEDIA_NAME: &str = "Media-Name";
/// Header selecting new-versus-extant stream semantics
pub const STREAM_TYPE: &str = "Stream-Type";
/// Header carrying the streaming location in a media response
pub const STREAM_URL: &str = "Stream-URL";
/// Header carrying the failure class in a media error reply
pub const ERROR_CODE: &str = "Error-Code";
/// Header carrying optional failure detail in a media error reply
pub const ERROR_MSG: &str = "Error-Msg";

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// A JSON object travelling over the broker
///
/// Cheap wrapper over `serde_json::Map` with typed field access. Shaping an
/// envelope validates it against a [`RequestKind`] schema and injects the
/// default headers; an envelope that fails validation is never published.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope(Map<String, Value>);

impl Envelope {
    /// Create an empty envelope
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Wrap an existing JSON value, which must be an object
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::Json(<serde_json::Error as serde::de::Error>::custom(
                "envelope payload must be a JSON object",
            ))),
        }
    }

    /// Decode an envelope from raw bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Field as a string, if present and a string
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    /// Set a field, replacing any previous value
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(name.into(), value.into());
    }

    /// Remove a field
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.0.remove(name)
    }

    /// Whether a field exists
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Validate required fields for `kind` without modifying the envelope
    pub fn validate(&self, kind: RequestKind) -> Result<()> {
        for field in kind.required_fields() {
            if !self.0.contains_key(*field) {
                return Err(Error::EnvelopeInvalid(kind));
            }
        }
        Ok(())
    }

    /// Validate against `kind` and inject the default headers
    ///
    /// The origin `Server-ID` is preserved when already present; the event
    /// category and name always reflect `kind`.
    pub fn shape(mut self, kind: RequestKind) -> Result<Self> {
        self.validate(kind)?;
        let (category, name) = kind.event();
        self.set("App-Name", APP_NAME);
        self.set("App-Version", APP_VERSION);
        self.set("Event-Category", category);
        self.set("Event-Name", name);
        Ok(self)
    }

    /// Serialize to the wire representation
    pub fn to_bytes(&self) -> Vec<u8> {
        // serializing a Map<String, Value> cannot fail
        serde_json::to_vec(&Value::Object(self.0.clone())).unwrap_or_default()
    }

    /// Unwrap into the underlying JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Envelope {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
