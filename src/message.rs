//! Transport-level message envelope.
//!
//! A [`Message`] is an opaque body plus string-keyed headers. Brokers carry
//! richer attribute tables (AMQP tables, typed SNS/SQS attributes); those are
//! converted explicitly through [`AttributeValue`] so a value that has no
//! textual form fails loudly instead of being stringified on a best-effort basis.

use std::collections::{hash_map, HashMap};
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

/// Errors raised while reading or converting header values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    #[error("Header '{key}' could not be parsed: {message}")]
    Parse { key: String, message: String },

    #[error("Header '{key}' has no textual representation ({kind})")]
    Unsupported { key: String, kind: &'static str },
}

/// String-keyed, string-valued message headers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a header, returning the previous value if any.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, String> {
        self.0.iter()
    }

    /// Parse a header into a typed value.
    ///
    /// Returns `Ok(None)` if the header is absent and an error if it is
    /// present but does not parse as `T`.
    pub fn parse<T>(&self, key: &str) -> Result<Option<T>, HeaderError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.0.get(key) {
            None => Ok(None),
            Some(raw) => raw.parse::<T>().map(Some).map_err(|e| HeaderError::Parse {
                key: key.to_string(),
                message: e.to_string(),
            }),
        }
    }

    /// Build headers from a broker attribute table.
    ///
    /// Fails on the first attribute that cannot be represented as text.
    pub fn try_from_attributes<I, K>(attributes: I) -> Result<Self, HeaderError>
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let mut headers = Headers::new();
        for (key, value) in attributes {
            let key = key.into();
            let text = value.into_text(&key)?;
            headers.0.insert(key, text);
        }
        Ok(headers)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

impl IntoIterator for Headers {
    type Item = (String, String);
    type IntoIter = hash_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a String, &'a String);
    type IntoIter = hash_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// A typed attribute value as carried by a broker.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Int(i64),
    Bool(bool),
    Bytes(Bytes),
    List(Vec<AttributeValue>),
}

impl AttributeValue {
    fn kind(&self) -> &'static str {
        match self {
            AttributeValue::Text(_) => "text",
            AttributeValue::Int(_) => "int",
            AttributeValue::Bool(_) => "bool",
            AttributeValue::Bytes(_) => "bytes",
            AttributeValue::List(_) => "list",
        }
    }

    fn into_text(self, key: &str) -> Result<String, HeaderError> {
        let kind = self.kind();
        match self {
            AttributeValue::Text(s) => Ok(s),
            AttributeValue::Int(i) => Ok(i.to_string()),
            AttributeValue::Bool(b) => Ok(b.to_string()),
            AttributeValue::Bytes(b) => {
                String::from_utf8(b.to_vec()).map_err(|_| HeaderError::Unsupported {
                    key: key.to_string(),
                    kind,
                })
            }
            AttributeValue::List(_) => Err(HeaderError::Unsupported {
                key: key.to_string(),
                kind,
            }),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

/// A unit of data exchanged over a virtual connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub header: Headers,
    pub body: Bytes,
}

impl Message {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            header: Headers::new(),
            body: body.into(),
        }
    }

    /// Builder-style header insertion.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.header.insert(key, value);
        self
    }
}
