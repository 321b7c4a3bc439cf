//! Tagged values carried by frames and delivered to callbacks.

use serde_json::Value as Document;

use crate::error::{NetworkError, Result};

/// Wire tag identifying the kind of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Tag {
    Int = 1,
    Float = 2,
    Text = 3,
    Document = 4,
    /// Local notification, never on the wire
    Connected = 5,
    /// Local notification, never on the wire
    Disconnected = 6,
}

impl Tag {
    /// Parse a tag byte read from the wire.
    ///
    /// Notification tags are rejected because no peer may send them.
    pub fn from_wire(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Tag::Int),
            2 => Ok(Tag::Float),
            3 => Ok(Tag::Text),
            4 => Ok(Tag::Document),
            5 | 6 => Err(NetworkError::NotTransmittable(byte)),
            other => Err(NetworkError::UnknownTag(other)),
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Fixed payload length for numeric kinds.
    pub fn fixed_len(self) -> Option<usize> {
        match self {
            Tag::Int | Tag::Float => Some(4),
            _ => None,
        }
    }

    pub fn is_transmittable(self) -> bool {
        !matches!(self, Tag::Connected | Tag::Disconnected)
    }
}

/// A decoded frame, or one of the two synthetic connection notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    Int(i32),
    Float(f32),
    Text(String),
    Document(Document),
    Connected,
    Disconnected,
}

impl Data {
    pub fn tag(&self) -> Tag {
        match self {
            Data::Int(_) => Tag::Int,
            Data::Float(_) => Tag::Float,
            Data::Text(_) => Tag::Text,
            Data::Document(_) => Tag::Document,
            Data::Connected => Tag::Connected,
            Data::Disconnected => Tag::Disconnected,
        }
    }

    pub fn is_notification(&self) -> bool {
        !self.tag().is_transmittable()
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Data::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Data::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Data::Document(doc) => Some(doc),
            _ => None,
        }
    }
}

impl From<i32> for Data {
    fn from(v: i32) -> Self {
        Data::Int(v)
    }
}

impl From<f32> for Data {
    fn from(v: f32) -> Self {
        Data::Float(v)
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_owned())
    }
}

impl From<Document> for Data {
    fn from(doc: Document) -> Self {
        Data::Document(doc)
    }
}
