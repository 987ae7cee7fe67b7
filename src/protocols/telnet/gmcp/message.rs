use std::{any::Any, fmt};

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{error::TelOptError, protocols::telnet::telopt::TerminalSide};

/// A decoded GMCP message, typed or not.
pub trait Message: Any + fmt::Debug + fmt::Display + Send + Sync {
    /// The identifier as declared (typed messages) or as received (unknown ones).
    fn id(&self) -> &str;

    /// The JSON payload exactly as it arrived. Empty for locally built messages.
    fn raw_message(&self) -> &[u8];

    /// The body to put on the wire, or `None` to send the identifier alone.
    fn to_json(&self) -> Result<Option<Vec<u8>>, serde_json::Error>;

    fn as_any(&self) -> &dyn Any;
}

impl dyn Message {
    pub fn body<T: MessageBody>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<GmcpMessage<T>>().map(|msg| &msg.body)
    }

    pub fn is<T: MessageBody>(&self) -> bool {
        self.as_any().is::<GmcpMessage<T>>()
    }

    pub fn as_unknown(&self) -> Option<&UnknownMessage> {
        self.as_any().downcast_ref::<UnknownMessage>()
    }
}

/// A message schema: a JSON shape plus the identifier it travels under.
pub trait MessageBody: Serialize + DeserializeOwned + Default + fmt::Debug + Send + Sync + 'static {
    const ID: &'static str;
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GmcpMessage<T> {
    pub body: T,
    raw: Bytes,
}

impl<T: MessageBody> GmcpMessage<T> {
    pub fn new(body: T) -> Self {
        Self { body, raw: Bytes::new() }
    }

    /// An absent payload yields the zero value, as the registry relies on when it
    /// reads identifiers.
    pub fn from_raw(raw: Option<&[u8]>) -> Result<Self, serde_json::Error> {
        match raw {
            Some(raw) if !raw.is_empty() => Ok(Self {
                body: serde_json::from_slice(raw)?,
                raw: Bytes::copy_from_slice(raw),
            }),
            _ => Ok(Self::new(T::default())),
        }
    }
}

impl<T: MessageBody> From<T> for GmcpMessage<T> {
    fn from(body: T) -> Self {
        Self::new(body)
    }
}

impl<T: MessageBody> Message for GmcpMessage<T> {
    fn id(&self) -> &str {
        T::ID
    }

    fn raw_message(&self) -> &[u8] {
        &self.raw
    }

    fn to_json(&self) -> Result<Option<Vec<u8>>, serde_json::Error> {
        let json = serde_json::to_vec(&self.body)?;
        if json == b"null" {
            Ok(None)
        } else {
            Ok(Some(json))
        }
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl<T: MessageBody> fmt::Display for GmcpMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.raw.is_empty() {
            write!(f, "GMCP: {}", T::ID)
        } else {
            write!(f, "GMCP: {} - {}", T::ID, String::from_utf8_lossy(&self.raw))
        }
    }
}

/// Whatever arrived under an identifier nobody registered. Top-level object keys
/// are kept as generic JSON values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnknownMessage {
    id: String,
    raw: Bytes,
    values: Map<String, JsonValue>,
}

impl UnknownMessage {
    pub fn from_raw(id: &str, raw: Option<&[u8]>) -> Result<Self, serde_json::Error> {
        let mut msg = Self {
            id: id.to_string(),
            ..Default::default()
        };

        if let Some(raw) = raw.filter(|raw| !raw.is_empty()) {
            msg.values = serde_json::from_slice(raw)?;
            msg.raw = Bytes::copy_from_slice(raw);
        }

        Ok(msg)
    }

    pub fn value(&self, key: &str) -> Option<&JsonValue> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn values(&self) -> &Map<String, JsonValue> {
        &self.values
    }
}

impl Message for UnknownMessage {
    fn id(&self) -> &str {
        &self.id
    }

    fn raw_message(&self) -> &[u8] {
        &self.raw
    }

    fn to_json(&self) -> Result<Option<Vec<u8>>, serde_json::Error> {
        serde_json::to_vec(&self.values).map(Some)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl fmt::Display for UnknownMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unknown GMCP Message: {} - {}", self.id, String::from_utf8_lossy(&self.raw))
    }
}

/// Builds a message from an optional raw payload.
pub type MessageFactory = fn(Option<&[u8]>) -> Result<Box<dyn Message>, TelOptError>;

pub fn create_message<T: MessageBody>(raw: Option<&[u8]>) -> Result<Box<dyn Message>, TelOptError> {
    Ok(Box::new(GmcpMessage::<T>::from_raw(raw)?))
}

#[derive(Clone, Copy)]
pub struct MessageData {
    pub sender: TerminalSide,
    pub create: MessageFactory,
}

impl MessageData {
    pub fn of<T: MessageBody>(sender: TerminalSide) -> Self {
        Self {
            sender,
            create: create_message::<T>,
        }
    }
}

impl fmt::Debug for MessageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageData").field("sender", &self.sender).finish_non_exhaustive()
    }
}

/// A versioned group of messages, announced to servers as `"<id> <version>"`.
#[derive(Debug, Clone)]
pub struct Package {
    pub id: String,
    pub version: u32,
    pub messages: Vec<MessageData>,
}

impl Package {
    pub fn new(id: impl Into<String>, version: u32, messages: Vec<MessageData>) -> Self {
        Self {
            id: id.into(),
            version,
            messages,
        }
    }

    pub fn key(&self) -> String {
        format!("{} {}", self.id, self.version)
    }
}
