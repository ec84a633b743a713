//! Ordered, multi-valued STOMP native headers.
//!
//! Header order is part of the line-based wire format, so headers are kept
//! as a flat list in insertion order. Names are case-sensitive.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ============================================================================
// Header Names
// ============================================================================

pub const ACCEPT_VERSION: &str = "accept-version";
pub const CONTENT_LENGTH: &str = "content-length";
pub const CONTENT_TYPE: &str = "content-type";
pub const DESTINATION: &str = "destination";
pub const HEART_BEAT: &str = "heart-beat";
pub const HOST: &str = "host";
pub const LOGIN: &str = "login";
pub const MESSAGE: &str = "message";
pub const MESSAGE_ID: &str = "message-id";
pub const ORIGINAL_DESTINATION: &str = "original-destination";
pub const PASSCODE: &str = "passcode";
pub const RECEIPT: &str = "receipt";
pub const RECEIPT_ID: &str = "receipt-id";
pub const SUBSCRIPTION: &str = "subscription";
pub const ID: &str = "id";
pub const USER_NAME: &str = "user-name";
pub const VERSION: &str = "version";

/// Content type that selects binary WebSocket framing.
pub const APPLICATION_OCTET_STREAM: &str = "application/octet-stream";

// ============================================================================
// HeartBeat
// ============================================================================

/// STOMP heartbeat pair in milliseconds.
///
/// `outgoing` is how often the sender of the frame can send heartbeats,
/// `incoming` how often it wants to receive them. `0` disables a direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct HeartBeat {
    /// Outgoing interval in milliseconds.
    pub outgoing: u64,
    /// Incoming interval in milliseconds.
    pub incoming: u64,
}

impl HeartBeat {
    /// No heartbeats in either direction.
    pub const NONE: Self = Self::new(0, 0);

    /// Creates a heartbeat pair.
    #[inline]
    #[must_use]
    pub const fn new(outgoing: u64, incoming: u64) -> Self {
        Self { outgoing, incoming }
    }

    /// Returns `true` if either direction is enabled.
    #[inline]
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.outgoing > 0 || self.incoming > 0
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.outgoing, self.incoming)
    }
}

impl FromStr for HeartBeat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::framing(format!("Invalid heart-beat header value '{s}'"));
        let (outgoing, incoming) = s.split_once(',').ok_or_else(invalid)?;
        let outgoing = outgoing.trim().parse().map_err(|_| invalid())?;
        let incoming = incoming.trim().parse().map_err(|_| invalid())?;
        Ok(Self { outgoing, incoming })
    }
}

// ============================================================================
// StompHeaders
// ============================================================================

/// Native STOMP headers in wire order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StompHeaders {
    entries: Vec<(String, String)>,
}

impl StompHeaders {
    /// Creates empty headers.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a header value, keeping any existing values.
    pub fn add(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push((name.into(), value.into()));
    }

    /// Sets a single value for `name`.
    ///
    /// The first existing entry keeps its position; later duplicates are
    /// removed. If absent, the header is appended.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(index) => {
                self.entries[index].1 = value;
                let mut seen = 0usize;
                self.entries.retain(|(n, _)| {
                    if *n != name {
                        return true;
                    }
                    seen += 1;
                    seen == 1
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    /// Returns the first value for `name`.
    #[must_use]
    pub fn first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Returns all values for `name` in order.
    #[must_use]
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
            .collect()
    }

    /// Removes every value for `name`, returning them.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|(n, v)| {
            if n == name {
                removed.push(v.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Returns `true` if `name` is present.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    /// Iterates over `(name, value)` pairs in wire order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Returns the number of header lines.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all headers.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ============================================================================
// StompHeaders - Typed Accessors
// ============================================================================

impl StompHeaders {
    /// Returns the `destination` header.
    #[must_use]
    pub fn destination(&self) -> Option<&str> {
        self.first(DESTINATION)
    }

    /// Sets the `destination` header.
    pub fn set_destination(&mut self, destination: impl Into<String>) {
        self.set(DESTINATION, destination);
    }

    /// Returns the `content-type` header.
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.first(CONTENT_TYPE)
    }

    /// Returns the parsed `content-length` header.
    ///
    /// Invalid values are treated as absent.
    #[must_use]
    pub fn content_length(&self) -> Option<usize> {
        self.first(CONTENT_LENGTH)
            .and_then(|v| v.trim().parse::<usize>().ok())
    }

    /// Returns the `receipt` header.
    #[must_use]
    pub fn receipt(&self) -> Option<&str> {
        self.first(RECEIPT)
    }

    /// Sets the `receipt-id` header.
    pub fn set_receipt_id(&mut self, receipt_id: impl Into<String>) {
        self.set(RECEIPT_ID, receipt_id);
    }

    /// Returns the `subscription` header.
    #[must_use]
    pub fn subscription(&self) -> Option<&str> {
        self.first(SUBSCRIPTION)
    }

    /// Sets the error `message` header.
    pub fn set_message(&mut self, message: impl Into<String>) {
        self.set(MESSAGE, message);
    }

    /// Returns the `version` header.
    #[must_use]
    pub fn version(&self) -> Option<&str> {
        self.first(VERSION)
    }

    /// Returns the comma separated `accept-version` values.
    #[must_use]
    pub fn accept_version(&self) -> Vec<&str> {
        self.get_all(ACCEPT_VERSION)
            .into_iter()
            .flat_map(|v| v.split(','))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// Returns the `heart-beat` header, if present and valid.
    #[must_use]
    pub fn heartbeat(&self) -> Option<HeartBeat> {
        self.first(HEART_BEAT).and_then(|v| v.parse().ok())
    }

    /// Sets the `heart-beat` header.
    pub fn set_heartbeat(&mut self, heartbeat: HeartBeat) {
        self.set(HEART_BEAT, heartbeat.to_string());
    }
}

impl<'a> IntoIterator for &'a StompHeaders {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StompHeaders {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

// ============================================================================
// Tests
// ============================================================================
